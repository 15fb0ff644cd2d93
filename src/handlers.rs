// =============================================================================
// HANDLERS MODULE
// =============================================================================
// HTTP request handlers (controller layer). Each handler extracts its input,
// applies the rate limit for its scope and calls one engine operation.
//
// LEARNING NOTES:
// - Handlers are async functions that receive requests and return responses
// - Axum uses "extractors" to parse request data (path params, JSON body, etc.)
// - State is shared via the State<T> extractor
// - Admin routes sit behind `require_admin`, a middleware that checks the
//   bearer token before the handler runs
//
// AXUM EXTRACTORS EXPLAINED:
// - State<T>: Access shared application state
// - Path<T>: Extract path parameters (/delivery/:token → token)
// - HeaderMap: All request headers (client IP, webhook signature)
// - Json<T>: Parse JSON request body
// - Bytes: Raw body, needed to verify a webhook signature
// =============================================================================

use axum::{
    body::Bytes,
    extract::{MatchedPath, Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::audit::{SecurityEvent, Severity};
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::*;
use crate::payments::{self, PaymentMethod};
use crate::rate_limit::RateLimitPolicy;
use crate::{checkout, delivery, fulfillment, inventory, refund, rotation, sweeper};
use crate::AppState;

// =============================================================================
// REQUEST HELPERS
// =============================================================================

/// Client address as reported by the reverse proxy: first entry of
/// `X-Forwarded-For`, then `X-Real-IP`.
pub fn client_ip(headers: &HeaderMap) -> Option<String> {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    header_value("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| header_value("x-real-ip"))
        .map(str::to_string)
}

/// Counts the request against `policy` and turns a denial into 429.
async fn enforce_rate_limit(
    state: &AppState,
    policy: &RateLimitPolicy,
    ip: Option<&str>,
) -> AppResult<()> {
    let decision = state.limiter.allow(ip.unwrap_or("unknown"), policy).await;
    if decision.allowed {
        return Ok(());
    }

    metrics::record_rate_limited(policy.scope);
    tracing::warn!(scope = policy.scope, ip = ?ip, "Rate limit exceeded");
    state.engine.record(
        SecurityEvent::new("rate_limit.exceeded", Severity::Warn)
            .ip(ip)
            .details(json!({ "scope": policy.scope })),
    );
    Err(AppError::RateLimited {
        retry_after_secs: decision.retry_after_secs(Utc::now()),
    })
}

/// Constant-time check of `Authorization: Bearer <token>`. With no token
/// configured nothing is authorized.
pub fn is_authorized(headers: &HeaderMap, expected: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return false;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|presented| bool::from(presented.as_bytes().ct_eq(expected.as_bytes())))
        .unwrap_or(false)
}

// =============================================================================
// MIDDLEWARE
// =============================================================================

/// Guards every admin route.
pub async fn require_admin(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !is_authorized(request.headers(), state.admin_token.as_deref()) {
        let ip = client_ip(request.headers());
        state.engine.record(
            SecurityEvent::new("admin.unauthorized", Severity::Warn)
                .ip(ip.as_deref())
                .details(json!({ "path": request.uri().path() })),
        );
        return Err(AppError::Unauthorized);
    }
    Ok(next.run(request).await)
}

/// Records `http_requests_total` and latency under the route template, so
/// tokens and ids never become label values.
pub async fn track_http(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;

    metrics::record_http_request(
        &method,
        &endpoint,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

// =============================================================================
// HEALTH CHECK ENDPOINTS
// =============================================================================
// These endpoints are used by orchestrators (Kubernetes, Docker) to determine
// if the service is running and ready to receive traffic.

/// Liveness probe - Is the service running?
///
/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "credential-delivery-service".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness probe - Are the database and rate limiter reachable?
///
/// GET /ready
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReadinessResponse>, StatusCode> {
    let db_healthy = state.engine.store.health_check().await;
    let limiter_healthy = state.limiter.ping().await;

    let all_healthy = db_healthy && limiter_healthy;
    let status = if all_healthy { "ready" } else { "not_ready" };

    let response = ReadinessResponse {
        status: status.to_string(),
        checks: ReadinessChecks {
            database: db_healthy,
            rate_limiter: limiter_healthy,
        },
    };

    if all_healthy {
        Ok(Json(response))
    } else {
        // Return 503 Service Unavailable if not ready
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

/// Prometheus metrics endpoint
///
/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

// =============================================================================
// STOREFRONT ENDPOINTS
// =============================================================================

/// Place an order
///
/// POST /api/v1/checkout
///
/// # Response
/// - 201 Created: order placed, units reserved
/// - 400 Bad Request: validation failed
/// - 404 Not Found: product unknown or not on sale
/// - 409 Conflict: not enough stock
pub async fn create_checkout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CheckoutRequest>,
) -> AppResult<(StatusCode, Json<CheckoutResponse>)> {
    let ip = client_ip(&headers);
    enforce_rate_limit(&state, &RateLimitPolicy::CHECKOUT, ip.as_deref()).await?;

    let placed = checkout::checkout(&state.engine, &state.adapters, request, ip.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(placed.to_response())))
}

/// Look up an order by code and buyer email
///
/// POST /api/v1/orders/lookup
pub async fn lookup_order(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<OrderLookupRequest>,
) -> AppResult<Json<OrderLookupResponse>> {
    let ip = client_ip(&headers);
    enforce_rate_limit(&state, &RateLimitPolicy::GENERAL, ip.as_deref()).await?;

    let summary = checkout::lookup(&state.engine, &request.order_code, &request.email).await?;
    Ok(Json(summary))
}

/// Status of a delivery link, without consuming it
///
/// GET /api/v1/delivery/:token
pub async fn check_delivery(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> AppResult<Json<DeliveryCheck>> {
    let ip = client_ip(&headers);
    enforce_rate_limit(&state, &RateLimitPolicy::DELIVERY, ip.as_deref()).await?;

    Ok(Json(delivery::check(&state.engine, &token).await?))
}

/// Reveal the credential behind a delivery link
///
/// POST /api/v1/delivery/:token
///
/// # Response
/// - 200 OK: `{ "credential": "..." }`, never cached
/// - 404 Not Found: unknown token
/// - 410 Gone: expired or already revealed
pub async fn reveal_delivery(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> AppResult<Response> {
    let ip = client_ip(&headers);
    enforce_rate_limit(&state, &RateLimitPolicy::DELIVERY, ip.as_deref()).await?;

    let credential = delivery::reveal(&state.engine, &token, ip.as_deref()).await?;
    let body = Json(RevealResponse {
        credential: credential.expose().to_string(),
    });
    Ok((
        [
            (header::CACHE_CONTROL, "no-store"),
            (header::PRAGMA, "no-cache"),
        ],
        body,
    )
        .into_response())
}

/// Payment provider callback
///
/// POST /api/v1/webhooks/payment/:method
///
/// The body is taken raw: the signature covers the exact bytes sent.
pub async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    Path(method): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<serde_json::Value>> {
    let ip = client_ip(&headers);
    enforce_rate_limit(&state, &RateLimitPolicy::WEBHOOK, ip.as_deref()).await?;

    let method: PaymentMethod = method.parse()?;
    let outcome = payments::handle_webhook(
        &state.engine,
        &state.adapters,
        method,
        &headers,
        &body,
        ip.as_deref(),
    )
    .await?;

    Ok(Json(json!({ "received": true, "outcome": outcome })))
}

// =============================================================================
// ADMIN: ORDERS
// =============================================================================

/// POST /api/v1/admin/orders/:id/mark-paid
pub async fn mark_order_paid(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    let outcome = payments::mark_paid(&state.engine, order_id).await?;
    Ok(Json(json!({ "order_id": order_id, "outcome": outcome })))
}

/// Issue delivery links for a paid order
///
/// POST /api/v1/admin/orders/:id/fulfill
pub async fn fulfill_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> AppResult<Json<FulfillResponse>> {
    let delivery_tokens = fulfillment::fulfill(&state.engine, order_id).await?;
    Ok(Json(FulfillResponse {
        order_id,
        delivery_tokens,
    }))
}

/// POST /api/v1/admin/orders/:id/refund
pub async fn refund_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> AppResult<Json<refund::RefundReport>> {
    Ok(Json(refund::refund(&state.engine, order_id).await?))
}

/// POST /api/v1/admin/orders/:id/cancel
pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    let released = refund::cancel(&state.engine, order_id).await?;
    Ok(Json(json!({ "order_id": order_id, "released_units": released })))
}

/// GET /api/v1/admin/orders/:id/deliveries
pub async fn order_deliveries(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> AppResult<Json<Vec<AdminDeliveryView>>> {
    let events = delivery::deliveries_for_order(&state.engine, order_id).await?;
    Ok(Json(events.into_iter().map(AdminDeliveryView::from).collect()))
}

/// POST /api/v1/admin/deliveries/:token/revoke
pub async fn revoke_delivery(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> AppResult<StatusCode> {
    delivery::revoke(&state.engine, &token).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// ADMIN: INVENTORY, KEYS, MAINTENANCE
// =============================================================================

/// Bulk import of credentials for one product
///
/// POST /api/v1/admin/inventory/import
///
/// # Request Body
/// ```json
/// {
///   "product_id": "6f1c...",
///   "credentials": ["user1:pass1", "user2:pass2"]
/// }
/// ```
pub async fn import_inventory(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ImportInventoryRequest>,
) -> AppResult<(StatusCode, Json<ImportInventoryResponse>)> {
    let ImportInventoryRequest {
        product_id,
        credentials,
    } = request;
    let imported = inventory::import(&state.engine, product_id, credentials).await?;
    Ok((
        StatusCode::CREATED,
        Json(ImportInventoryResponse {
            product_id,
            imported,
        }),
    ))
}

/// POST /api/v1/admin/inventory/:id/revoke
pub async fn revoke_inventory_item(
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    inventory::revoke_item(&state.engine, item_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/admin/inventory/stats/:product_id
pub async fn inventory_stats(
    State(state): State<Arc<AppState>>,
    Path(product_id): Path<Uuid>,
) -> AppResult<Json<InventoryStats>> {
    Ok(Json(inventory::stats(&state.engine, product_id).await?))
}

/// Re-encrypt every credential from one key to another
///
/// POST /api/v1/admin/keys/rotate
pub async fn rotate_keys(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RotateKeysRequest>,
) -> AppResult<Json<RotationReport>> {
    let report = rotation::rotate(&state.engine, &request.from_key_id, &request.to_key_id).await?;
    Ok(Json(report))
}

/// Run a sweeper pass now instead of waiting for the next tick
///
/// POST /api/v1/admin/maintenance/sweep
pub async fn run_maintenance(State(state): State<Arc<AppState>>) -> AppResult<Json<SweepReport>> {
    Ok(Json(sweeper::run_once(&state.engine).await?))
}
