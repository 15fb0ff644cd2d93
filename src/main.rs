// =============================================================================
// CREDENTIAL DELIVERY SERVICE - Main Entry Point
// =============================================================================
// This is the main entry point for the credential delivery service.
//
// WHAT THIS SERVICE DOES:
// - Keeps an inventory of digital credentials, encrypted at rest
// - Reserves units at checkout so two buyers never get the same one
// - Issues a delivery link per unit once an order is paid
// - Reveals each credential exactly once, then the link is dead
// - Returns units to the pool when reservations lapse or orders are refunded
// - Exposes Prometheus metrics and records security events
//
// LEARNING GOALS:
// - Understand Rust async programming with Tokio
// - Learn Axum web framework patterns (state, extractors, middleware)
// - See how trait objects give the engine a swappable storage backend
// - Understand explicit transactions and row locking with SQLx
// =============================================================================

// -----------------------------------------------------------------------------
// MODULE DECLARATIONS
// -----------------------------------------------------------------------------
mod allocator;   // Inventory reservation (allocator.rs)
mod audit;       // Security event sink (audit.rs)
mod checkout;    // Order placement and lookup (checkout.rs)
mod config;      // Configuration loading (config.rs)
mod db;          // PostgreSQL store (db.rs)
mod delivery;    // Delivery tokens and reveal (delivery.rs)
mod engine;      // Shared engine handle (engine.rs)
mod error;       // Error types (error.rs)
mod fulfillment; // Paid order → delivery links (fulfillment.rs)
mod handlers;    // HTTP request handlers (handlers.rs)
mod inventory;   // Credential import and revocation (inventory.rs)
mod metrics;     // Prometheus metrics setup (metrics.rs)
mod models;      // Data structures (models.rs)
mod payments;    // Payment adapters and confirmation (payments.rs)
mod rate_limit;  // Sliding-window rate limiting (rate_limit.rs)
mod refund;      // Refund and cancel (refund.rs)
mod rotation;    // Encryption key rotation (rotation.rs)
mod store;       // Storage traits (store.rs)
mod sweeper;     // Reservation expiry sweeper (sweeper.rs)
mod vault;       // Credential encryption (vault.rs)

#[cfg(test)]
mod memory;      // In-memory store for tests (memory.rs)

// -----------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::audit::PgSecuritySink;
use crate::config::Config;
use crate::db::Database;
use crate::engine::{DeliveryPolicy, Engine};
use crate::metrics::setup_metrics;
use crate::payments::PaymentAdapters;
use crate::rate_limit::{DisabledRateLimiter, MemoryRateLimiter, RateLimiter, RedisRateLimiter};
use crate::vault::Vault;

/// How often the in-memory limiter drops idle keys.
const LIMITER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// -----------------------------------------------------------------------------
// APPLICATION STATE
// -----------------------------------------------------------------------------
// Shared by every request handler through State<Arc<AppState>>.
pub struct AppState {
    // Storage, vault, security sink and delivery policy
    pub engine: Engine,

    // One adapter per payment method
    pub adapters: PaymentAdapters,

    // Rate limiter selected at startup (redis, in-memory or disabled)
    pub limiter: Arc<dyn RateLimiter>,

    // Prometheus metrics handle, renders /metrics
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,

    // Bearer token for admin routes
    pub admin_token: Option<String>,
}

// -----------------------------------------------------------------------------
// MAIN FUNCTION
// -----------------------------------------------------------------------------
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -------------------------------------------------------------------------
    // STEP 1: Load environment variables
    // -------------------------------------------------------------------------
    dotenvy::dotenv().ok(); // .ok() ignores errors (file might not exist)

    // -------------------------------------------------------------------------
    // STEP 2: Initialize logging/tracing
    // -------------------------------------------------------------------------
    // RUST_LOG controls log levels
    // Example: RUST_LOG=info,credential_delivery_service=debug
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,credential_delivery_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Credential Delivery Service...");

    // -------------------------------------------------------------------------
    // STEP 3: Load configuration and keys
    // -------------------------------------------------------------------------
    let config = Config::from_env()?;
    info!(
        port = config.port,
        active_key_id = %config.active_key_id,
        key_ids = ?config.keys.key_ids(),
        "Configuration loaded"
    );

    let vault = Vault::new(config.keys.clone(), &config.active_key_id)?;

    // -------------------------------------------------------------------------
    // STEP 4: Set up Prometheus metrics
    // -------------------------------------------------------------------------
    let metrics_handle = setup_metrics()?;
    info!("Prometheus metrics initialized");

    // -------------------------------------------------------------------------
    // STEP 5: Connect to PostgreSQL database
    // -------------------------------------------------------------------------
    let db = Database::connect(&config.database_url).await?;
    info!("Connected to PostgreSQL");

    db.run_migrations().await?;
    info!("Database migrations completed");

    let engine = Engine::new(
        Arc::new(db.clone()),
        Arc::new(vault),
        Arc::new(PgSecuritySink::new(db)),
        DeliveryPolicy::from_config(&config),
    );

    // -------------------------------------------------------------------------
    // STEP 6: Background tasks and rate limiter
    // -------------------------------------------------------------------------
    // Every handle is aborted on shutdown
    let mut background = vec![sweeper::spawn(engine.clone(), config.sweep_interval)];
    info!(interval_secs = config.sweep_interval.as_secs(), "Reservation sweeper started");

    let limiter: Arc<dyn RateLimiter> = if !config.rate_limit_enabled {
        info!("Rate limiting disabled");
        Arc::new(DisabledRateLimiter)
    } else if let Some(redis_url) = &config.redis_url {
        let limiter = RedisRateLimiter::connect(redis_url).await?;
        info!("Rate limiting through Redis");
        Arc::new(limiter)
    } else {
        let limiter = Arc::new(MemoryRateLimiter::new(config.rate_limit_max_keys));
        background.push(limiter.clone().spawn_sweeper(LIMITER_SWEEP_INTERVAL));
        info!(max_keys = config.rate_limit_max_keys, "Rate limiting in memory");
        limiter
    };

    // -------------------------------------------------------------------------
    // STEP 7: Create application state
    // -------------------------------------------------------------------------
    if config.admin_api_token.is_none() {
        tracing::warn!("ADMIN_API_TOKEN is not set, admin routes will refuse every request");
    }

    let state = Arc::new(AppState {
        engine,
        adapters: PaymentAdapters::from_config(&config),
        limiter,
        metrics_handle,
        admin_token: config.admin_api_token.clone(),
    });

    // -------------------------------------------------------------------------
    // STEP 8: Define routes
    // -------------------------------------------------------------------------
    let admin = Router::new()
        .route("/orders/:id/mark-paid", post(handlers::mark_order_paid))
        .route("/orders/:id/fulfill", post(handlers::fulfill_order))
        .route("/orders/:id/refund", post(handlers::refund_order))
        .route("/orders/:id/cancel", post(handlers::cancel_order))
        .route("/orders/:id/deliveries", get(handlers::order_deliveries))
        .route("/deliveries/:token/revoke", post(handlers::revoke_delivery))
        .route("/inventory/import", post(handlers::import_inventory))
        .route("/inventory/:id/revoke", post(handlers::revoke_inventory_item))
        .route("/inventory/stats/:product_id", get(handlers::inventory_stats))
        .route("/keys/rotate", post(handlers::rotate_keys))
        .route("/maintenance/sweep", post(handlers::run_maintenance))
        // route_layer: only matched admin routes hit the guard
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::require_admin,
        ));

    let app = Router::new()
        // ----- Health & Readiness Endpoints -----
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        // ----- Metrics Endpoint -----
        .route("/metrics", get(handlers::metrics_handler))
        // ----- Storefront -----
        .route("/api/v1/checkout", post(handlers::create_checkout))
        .route("/api/v1/orders/lookup", post(handlers::lookup_order))
        .route(
            "/api/v1/delivery/:token",
            get(handlers::check_delivery).post(handlers::reveal_delivery),
        )
        .route("/api/v1/webhooks/payment/:method", post(handlers::payment_webhook))
        // ----- Admin -----
        .nest("/api/v1/admin", admin)
        // ----- Middleware Layers -----
        .layer(middleware::from_fn(handlers::track_http))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // -------------------------------------------------------------------------
    // STEP 9: Start the HTTP server
    // -------------------------------------------------------------------------
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(address = %addr, "Credential Delivery Service is listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for handle in background {
        handle.abort();
    }
    info!("Credential Delivery Service stopped");

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
