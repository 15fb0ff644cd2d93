// =============================================================================
// CONFIGURATION MODULE
// =============================================================================
// This module handles loading configuration from environment variables.
//
// LEARNING NOTES:
// - Environment variables are the standard way to configure containers
// - We parse them into a strongly-typed Config struct
// - This makes configuration errors obvious at startup, not runtime
// - Encryption keys are collected here ONCE into a KeyRing and injected
//   into the vault; no other module reads the environment
// =============================================================================

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};

use crate::vault::KeyRing;

/// Every `ENCRYPTION_KEY_<ID>` variable contributes key `<id>` (lower-cased).
const KEY_PREFIX: &str = "ENCRYPTION_KEY_";

// Upper bounds on the time limits: one day for a reservation, one year for a
// delivery link.
const MAX_RESERVATION_TTL_MINUTES: i64 = 24 * 60;
const MAX_TOKEN_EXPIRY_HOURS: i64 = 365 * 24;

// -----------------------------------------------------------------------------
// CONFIG STRUCT
// -----------------------------------------------------------------------------
#[derive(Clone)]
pub struct Config {
    /// HTTP server port (default: 8003)
    pub port: u16,

    /// PostgreSQL connection URL
    pub database_url: String,

    /// Optional redis URL; when set, rate limiting is shared through redis
    pub redis_url: Option<String>,

    /// Encryption keys by key id
    pub keys: KeyRing,

    /// Key id new credentials are encrypted under (default: v1)
    pub active_key_id: String,

    /// How long a checkout reservation holds units (default: 15 minutes)
    pub reservation_ttl: chrono::Duration,

    /// How long a delivery link stays usable (default: 48 hours)
    pub delivery_token_ttl: chrono::Duration,

    /// Reveals allowed per delivery link (default: 1)
    pub delivery_max_reveals: i32,

    /// Interval of the reservation sweeper (default: 60 seconds)
    pub sweep_interval: std::time::Duration,

    pub rate_limit_enabled: bool,

    /// Upper bound on tracked keys in the in-memory limiter
    pub rate_limit_max_keys: usize,

    /// Bearer token for admin routes; admin routes refuse everything when unset
    pub admin_api_token: Option<String>,

    /// HMAC secret for provider payment webhooks
    pub payment_webhook_secret: Option<String>,

    /// Instructions shown for manual bank transfers
    pub bank_transfer_instructions: Option<String>,
}

impl Config {
    // -------------------------------------------------------------------------
    // LOAD CONFIGURATION FROM ENVIRONMENT
    // -------------------------------------------------------------------------
    /// Creates a Config by reading environment variables.
    ///
    /// # Returns
    /// - `Ok(Config)` if all required variables are set and valid
    /// - `Err` naming the first variable that is missing or malformed
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Builds a Config from explicit name/value pairs. Tests use this instead
    /// of mutating the process environment.
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();

        let mut keys = KeyRing::new();
        for (name, value) in &vars {
            if let Some(key_id) = name.strip_prefix(KEY_PREFIX) {
                if key_id.is_empty() {
                    continue;
                }
                keys.insert_hex(key_id, value)
                    .with_context(|| format!("{name} must be hex encoded"))?;
            }
        }
        if keys.is_empty() {
            bail!("At least one {KEY_PREFIX}<ID> environment variable is required");
        }

        let active_key_id = optional(&vars, "ENCRYPTION_ACTIVE_KEY_ID")
            .unwrap_or_else(|| "v1".to_string())
            .to_lowercase();
        if !keys.contains(&active_key_id) {
            bail!("ENCRYPTION_ACTIVE_KEY_ID={active_key_id} has no matching {KEY_PREFIX} variable");
        }

        let reservation_minutes: i64 = parse_or(&vars, "RESERVATION_TTL_MINUTES", 15)?;
        let token_hours: i64 = parse_or(&vars, "DELIVERY_TOKEN_EXPIRY_HOURS", 48)?;
        let max_reveals: i32 = parse_or(&vars, "DELIVERY_MAX_REVEALS", 1)?;
        let sweep_secs: u64 = parse_or(&vars, "SWEEP_INTERVAL_SECS", 60)?;

        if !(1..=MAX_RESERVATION_TTL_MINUTES).contains(&reservation_minutes) {
            bail!("RESERVATION_TTL_MINUTES must be between 1 and {MAX_RESERVATION_TTL_MINUTES}");
        }
        if !(1..=MAX_TOKEN_EXPIRY_HOURS).contains(&token_hours) {
            bail!("DELIVERY_TOKEN_EXPIRY_HOURS must be between 1 and {MAX_TOKEN_EXPIRY_HOURS}");
        }
        if max_reveals < 1 {
            bail!("DELIVERY_MAX_REVEALS must be at least 1");
        }
        if sweep_secs == 0 {
            bail!("SWEEP_INTERVAL_SECS must be positive");
        }

        Ok(Self {
            port: parse_or(&vars, "PORT", 8003)?,
            database_url: optional(&vars, "DATABASE_URL")
                .context("DATABASE_URL environment variable is required")?,
            redis_url: optional(&vars, "REDIS_URL"),
            keys,
            active_key_id,
            reservation_ttl: chrono::Duration::minutes(reservation_minutes),
            delivery_token_ttl: chrono::Duration::hours(token_hours),
            delivery_max_reveals: max_reveals,
            sweep_interval: std::time::Duration::from_secs(sweep_secs),
            rate_limit_enabled: optional(&vars, "RATE_LIMIT_ENABLED")
                .map(|v| v != "false")
                .unwrap_or(true),
            rate_limit_max_keys: parse_or(&vars, "RATE_LIMIT_MAX_KEYS", 10_000)?,
            admin_api_token: optional(&vars, "ADMIN_API_TOKEN"),
            payment_webhook_secret: optional(&vars, "PAYMENT_WEBHOOK_SECRET"),
            bank_transfer_instructions: optional(&vars, "BANK_TRANSFER_INSTRUCTIONS"),
        })
    }
}

/// Non-empty value of a variable.
fn optional(vars: &HashMap<String, String>, name: &str) -> Option<String> {
    vars.get(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<T>(vars: &HashMap<String, String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(vars, name) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("Failed to parse {name}={raw}")),
        None => Ok(default),
    }
}

// Secrets stay out of startup logs.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("redis", &self.redis_url.is_some())
            .field("key_ids", &self.keys.key_ids())
            .field("active_key_id", &self.active_key_id)
            .field("reservation_ttl", &self.reservation_ttl)
            .field("delivery_token_ttl", &self.delivery_token_ttl)
            .field("delivery_max_reveals", &self.delivery_max_reveals)
            .field("sweep_interval", &self.sweep_interval)
            .field("rate_limit_enabled", &self.rate_limit_enabled)
            .field("admin_api", &self.admin_api_token.is_some())
            .field("payment_webhooks", &self.payment_webhook_secret.is_some())
            .finish()
    }
}
