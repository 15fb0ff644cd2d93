// =============================================================================
// RATE LIMITING
// =============================================================================
// Sliding-window limits keyed by client IP, one window per scope.
//
// LEARNING NOTES:
// - A sliding window keeps the timestamp of every accepted hit and counts
//   the ones younger than the window; denied hits are not recorded
// - The in-memory limiter is bounded: at `max_keys` the least recently seen
//   key is evicted, and a background sweeper drops idle keys
// - The redis limiter shares the window between instances using a sorted
//   set per key. Redis trouble fails open: a missing limiter must not take
//   checkout down
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use redis::aio::ConnectionManager;
use tokio::task::JoinHandle;

// -----------------------------------------------------------------------------
// POLICIES
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Label for metrics and security events; also namespaces the key
    pub scope: &'static str,
    pub limit: u32,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub const CHECKOUT: Self = Self {
        scope: "checkout",
        limit: 10,
        window: Duration::from_secs(15 * 60),
    };

    pub const DELIVERY: Self = Self {
        scope: "delivery",
        limit: 10,
        window: Duration::from_secs(15 * 60),
    };

    pub const WEBHOOK: Self = Self {
        scope: "webhook",
        limit: 100,
        window: Duration::from_secs(60),
    };

    pub const GENERAL: Self = Self {
        scope: "general",
        limit: 60,
        window: Duration::from_secs(60),
    };

    fn key(&self, client: &str) -> String {
        format!("{}:{}", self.scope, client)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    fn allow_all(policy: &RateLimitPolicy) -> Self {
        Self {
            allowed: true,
            remaining: policy.limit,
            reset_at: Utc::now(),
        }
    }

    /// Whole seconds until the window frees a slot, at least 1.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let secs = (self.reset_at - now).num_seconds();
        u64::try_from(secs).unwrap_or(0).max(1)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Counts a hit for `client` against `policy` and says whether it may
    /// proceed.
    async fn allow(&self, client: &str, policy: &RateLimitPolicy) -> RateLimitDecision;

    /// Readiness of the backing store.
    async fn ping(&self) -> bool;
}

// =============================================================================
// DISABLED
// =============================================================================
/// Used when `RATE_LIMIT_ENABLED=false`.
pub struct DisabledRateLimiter;

#[async_trait]
impl RateLimiter for DisabledRateLimiter {
    async fn allow(&self, _client: &str, policy: &RateLimitPolicy) -> RateLimitDecision {
        RateLimitDecision::allow_all(policy)
    }

    async fn ping(&self) -> bool {
        true
    }
}

// =============================================================================
// IN-MEMORY
// =============================================================================
struct Window {
    hits: VecDeque<Instant>,
    span: Duration,
    last_seen: Instant,
}

impl Window {
    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.hits.front() {
            if now.duration_since(*oldest) >= self.span {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }
}

pub struct MemoryRateLimiter {
    windows: Mutex<HashMap<String, Window>>,
    max_keys: usize,
}

impl MemoryRateLimiter {
    pub fn new(max_keys: usize) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_keys: max_keys.max(1),
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().len()
    }

    fn check_at(&self, client: &str, policy: &RateLimitPolicy, now: Instant) -> RateLimitDecision {
        let key = policy.key(client);
        let wall_now = Utc::now();
        let mut windows = self.windows.lock();

        if !windows.contains_key(&key) && windows.len() >= self.max_keys {
            Self::evict_one(&mut windows, now);
        }

        let window = windows.entry(key).or_insert_with(|| Window {
            hits: VecDeque::new(),
            span: policy.window,
            last_seen: now,
        });
        window.span = policy.window;
        window.last_seen = now;
        window.prune(now);

        let used = u32::try_from(window.hits.len()).unwrap_or(u32::MAX);
        if used >= policy.limit {
            let reset_in = window
                .hits
                .front()
                .map(|oldest| policy.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(policy.window);
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at: wall_now + to_chrono(reset_in),
            };
        }

        window.hits.push_back(now);
        RateLimitDecision {
            allowed: true,
            remaining: policy.limit - used - 1,
            reset_at: wall_now + to_chrono(policy.window),
        }
    }

    /// Drops an idle key if there is one, otherwise the least recently seen.
    fn evict_one(windows: &mut HashMap<String, Window>, now: Instant) {
        let idle = windows.iter_mut().find_map(|(key, window)| {
            window.prune(now);
            window.hits.is_empty().then(|| key.clone())
        });
        let victim = idle.or_else(|| {
            windows
                .iter()
                .min_by_key(|(_, window)| window.last_seen)
                .map(|(key, _)| key.clone())
        });

        if let Some(key) = victim {
            windows.remove(&key);
        }
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, window| {
            window.prune(now);
            !window.hits.is_empty()
        });
        before - windows.len()
    }

    /// Removes keys with no hits left in their window. Returns how many.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Sweeps every `interval` until the handle is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = self.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "Idle rate limit keys dropped");
                }
            }
        })
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn allow(&self, client: &str, policy: &RateLimitPolicy) -> RateLimitDecision {
        self.check_at(client, policy, Instant::now())
    }

    async fn ping(&self) -> bool {
        true
    }
}

// =============================================================================
// REDIS
// =============================================================================
pub struct RedisRateLimiter {
    conn: ConnectionManager,
}

impl RedisRateLimiter {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Invalid REDIS_URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to redis")?;
        Ok(Self { conn })
    }

    async fn try_allow(
        &self,
        client: &str,
        policy: &RateLimitPolicy,
    ) -> redis::RedisResult<RateLimitDecision> {
        let mut conn = self.conn.clone();
        let key = format!("ratelimit:{}", policy.key(client));
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let window_ms = i64::try_from(policy.window.as_millis()).unwrap_or(i64::MAX);
        let member = format!("{now_ms}-{:016x}", rand::thread_rng().gen::<u64>());

        let (count,): (u64,) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg(0)
            .arg(now_ms - window_ms)
            .ignore()
            .cmd("ZADD")
            .arg(&key)
            .arg(now_ms)
            .arg(&member)
            .ignore()
            .cmd("ZCARD")
            .arg(&key)
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(window_ms)
            .ignore()
            .query_async(&mut conn)
            .await?;

        if count <= u64::from(policy.limit) {
            let used = u32::try_from(count).unwrap_or(policy.limit);
            return Ok(RateLimitDecision {
                allowed: true,
                remaining: policy.limit - used,
                reset_at: now + to_chrono(policy.window),
            });
        }

        // Denied hits do not occupy the window
        redis::cmd("ZREM")
            .arg(&key)
            .arg(&member)
            .query_async::<_, ()>(&mut conn)
            .await?;
        let oldest: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(&key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        let reset_ms = oldest
            .first()
            .map(|(_, score)| *score as i64 + window_ms)
            .unwrap_or(now_ms + window_ms);

        Ok(RateLimitDecision {
            allowed: false,
            remaining: 0,
            reset_at: DateTime::from_timestamp_millis(reset_ms).unwrap_or(now),
        })
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn allow(&self, client: &str, policy: &RateLimitPolicy) -> RateLimitDecision {
        match self.try_allow(client, policy).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(error = %e, scope = policy.scope, "Rate limiter unavailable, allowing request");
                RateLimitDecision::allow_all(policy)
            }
        }
    }

    async fn ping(&self) -> bool {
        redis::cmd("PING")
            .query_async::<_, String>(&mut self.conn.clone())
            .await
            .is_ok()
    }
}
