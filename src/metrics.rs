// =============================================================================
// METRICS MODULE
// =============================================================================
// This module sets up Prometheus metrics for observability.
//
// LEARNING NOTES:
// - Prometheus uses a "pull" model - it scrapes /metrics endpoint
// - Counters only go up, histograms bucket observations
// - The helpers below are safe to call without an installed recorder
//   (the macros become no-ops), which is what happens in unit tests
//
// Deliberately absent: per-product stock gauges. Exposing live availability
// counts would hand out exactly the inventory numbers buyers never see.
// =============================================================================

use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// METRIC NAMES (Constants)
// =============================================================================

/// Labels: method, endpoint, status
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

/// Labels: method, endpoint
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

/// Labels: status (success/insufficient_stock)
pub const INVENTORY_RESERVATIONS_TOTAL: &str = "inventory_reservations_total";

/// Labels: outcome (revealed/not_found/expired/already_revealed/race_lost/decrypt_error)
pub const DELIVERY_REVEALS_TOTAL: &str = "delivery_reveals_total";

pub const ORDERS_FULFILLED_TOTAL: &str = "orders_fulfilled_total";

pub const ORDERS_REFUNDED_TOTAL: &str = "orders_refunded_total";

pub const RESERVATIONS_SWEPT_TOTAL: &str = "reservations_swept_total";

/// Labels: scope (checkout/delivery/webhook/general)
pub const RATE_LIMITED_TOTAL: &str = "rate_limited_total";

/// Labels: operation
pub const DB_QUERY_DURATION_SECONDS: &str = "db_query_duration_seconds";

// =============================================================================
// SETUP FUNCTION
// =============================================================================
/// Initialize Prometheus metrics recorder and return the render handle.
pub fn setup_metrics() -> Result<PrometheusHandle> {
    // 1ms .. 10s, suitable for both HTTP and database latencies
    let latency_buckets = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(DB_QUERY_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .install_recorder()?;

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(HTTP_REQUEST_DURATION_SECONDS, "HTTP request latency in seconds");
    describe_counter!(
        INVENTORY_RESERVATIONS_TOTAL,
        "Inventory reservation attempts by outcome"
    );
    describe_counter!(DELIVERY_REVEALS_TOTAL, "Credential reveal attempts by outcome");
    describe_counter!(ORDERS_FULFILLED_TOTAL, "Orders fulfilled");
    describe_counter!(ORDERS_REFUNDED_TOTAL, "Orders refunded");
    describe_counter!(
        RESERVATIONS_SWEPT_TOTAL,
        "Expired reservations returned to the available pool"
    );
    describe_counter!(RATE_LIMITED_TOTAL, "Requests rejected by the rate limiter");
    describe_histogram!(DB_QUERY_DURATION_SECONDS, "Database transaction latency in seconds");

    Ok(handle)
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

pub fn record_http_request(method: &str, endpoint: &str, status: u16, duration_secs: f64) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .record(duration_secs);
}

pub fn record_reservation(success: bool) {
    let status = if success { "success" } else { "insufficient_stock" };
    counter!(INVENTORY_RESERVATIONS_TOTAL, "status" => status).increment(1);
}

pub fn record_reveal(outcome: &'static str) {
    counter!(DELIVERY_REVEALS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_fulfillment() {
    counter!(ORDERS_FULFILLED_TOTAL).increment(1);
}

pub fn record_refund() {
    counter!(ORDERS_REFUNDED_TOTAL).increment(1);
}

pub fn record_swept(count: u64) {
    counter!(RESERVATIONS_SWEPT_TOTAL).increment(count);
}

pub fn record_rate_limited(scope: &'static str) {
    counter!(RATE_LIMITED_TOTAL, "scope" => scope).increment(1);
}

pub fn record_db_query(operation: &'static str, duration_secs: f64) {
    histogram!(DB_QUERY_DURATION_SECONDS, "operation" => operation).record(duration_secs);
}
