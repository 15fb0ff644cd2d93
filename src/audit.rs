// =============================================================================
// SECURITY EVENTS
// =============================================================================
// Fire-and-forget sink for security-relevant events (reveal attempts,
// decryption faults, rate-limit hits, webhook anomalies).
//
// LEARNING NOTES:
// - `record` returns nothing and never fails: a broken audit pipeline must
//   not abort a checkout or a reveal
// - The PostgreSQL sink writes on a spawned task, so the caller doesn't
//   even wait for the insert
// =============================================================================

use serde::Serialize;
use serde_json::Value;

use crate::db::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warn,
    /// Payload corruption, tampering, forged webhooks. Needs an operator.
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecurityEvent {
    pub event_type: &'static str,
    pub severity: Severity,
    pub ip_address: Option<String>,
    /// Context only: ids, token prefixes, counts. Never credentials.
    pub details: Value,
}

impl SecurityEvent {
    pub fn new(event_type: &'static str, severity: Severity) -> Self {
        Self {
            event_type,
            severity,
            ip_address: None,
            details: Value::Null,
        }
    }

    pub fn ip(mut self, ip: Option<&str>) -> Self {
        self.ip_address = ip.map(str::to_string);
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// The `record(eventType, severity, context)` collaborator.
pub trait SecuritySink: Send + Sync {
    fn record(&self, event: SecurityEvent);
}

/// Mirrors every event into the structured log at a matching level.
fn log_event(event: &SecurityEvent) {
    match event.severity {
        Severity::Critical => tracing::error!(
            event_type = event.event_type,
            details = %event.details,
            "Security event"
        ),
        Severity::Warn => tracing::warn!(
            event_type = event.event_type,
            details = %event.details,
            "Security event"
        ),
        Severity::Info => tracing::info!(
            event_type = event.event_type,
            details = %event.details,
            "Security event"
        ),
    }
}

// -----------------------------------------------------------------------------
// POSTGRES SINK
// -----------------------------------------------------------------------------
/// Persists events to the `security_events` table.
pub struct PgSecuritySink {
    db: Database,
}

impl PgSecuritySink {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl SecuritySink for PgSecuritySink {
    fn record(&self, event: SecurityEvent) {
        log_event(&event);

        let db = self.db.clone();
        tokio::spawn(async move {
            if let Err(e) = db.insert_security_event(&event).await {
                tracing::warn!(
                    event_type = event.event_type,
                    error = %e,
                    "Failed to persist security event"
                );
            }
        });
    }
}
