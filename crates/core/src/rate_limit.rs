use crate::kv::KvStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Requests allowed per UTC minute window.
pub const DEFAULT_MINUTE_LIMIT: u32 = 5;
/// Requests allowed per UTC day.
pub const DEFAULT_DAY_LIMIT: u32 = 50;

/// Minute counters expire well after their window closes.
const MINUTE_TTL: Duration = Duration::from_secs(120);
/// Day counters expire after 24 hours.
const DAY_TTL: Duration = Duration::from_secs(86_400);

const MINUTE_KEY_PREFIX: &str = "mcp:min:";
const DAY_KEY_PREFIX: &str = "mcp:budget:";

/// Per-window request limits.
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub per_minute: u32,
    pub per_day: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            per_minute: DEFAULT_MINUTE_LIMIT,
            per_day: DEFAULT_DAY_LIMIT,
        }
    }
}

/// Fixed-window limiter over two counters: one per UTC minute, one per UTC day.
///
/// Counters live in the kv store and expire on their own. The read-then-write
/// pairs in `increment` are not atomic; concurrent callers can race and
/// under-count. That is a known, accepted limitation of this counter scheme.
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    limits: RateLimits,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>, limits: RateLimits) -> Self {
        Self { store, limits }
    }

    /// Check whether a call is allowed right now. Returns the rejection
    /// message when a window is exhausted.
    pub async fn check(&self) -> Result<Option<String>> {
        self.check_at(Utc::now()).await
    }

    /// Record one successful call against both windows.
    pub async fn increment(&self) -> Result<()> {
        self.increment_at(Utc::now()).await
    }

    async fn check_at(&self, now: DateTime<Utc>) -> Result<Option<String>> {
        let minute_key = minute_key(now);
        let day_key = day_key(now);

        let (minute, day) = tokio::try_join!(
            self.store.get(&minute_key),
            self.store.get(&day_key)
        )?;

        let minute_count = parse_count(minute);
        let day_count = parse_count(day);

        if minute_count >= self.limits.per_minute {
            return Ok(Some(format!(
                "Rate limit: max {} requests per minute. Please wait and try again.",
                self.limits.per_minute
            )));
        }

        if day_count >= self.limits.per_day {
            return Ok(Some(format!(
                "Daily limit reached ({} calls/day). Get your own API key at https://rapidapi.com/vericorp/api/vericorp-api",
                self.limits.per_day
            )));
        }

        Ok(None)
    }

    async fn increment_at(&self, now: DateTime<Utc>) -> Result<()> {
        let minute_key = minute_key(now);
        let day_key = day_key(now);

        let (minute, day) = tokio::try_join!(
            self.store.get(&minute_key),
            self.store.get(&day_key)
        )?;

        let minute_count = parse_count(minute) + 1;
        let day_count = parse_count(day) + 1;

        // The formatted counters must outlive the join over the two puts
        let minute_value = minute_count.to_string();
        let day_value = day_count.to_string();

        tokio::try_join!(
            self.store.put(&minute_key, &minute_value, MINUTE_TTL),
            self.store.put(&day_key, &day_value, DAY_TTL)
        )?;

        tracing::debug!(minute = minute_count, day = day_count, "rate counters incremented");

        Ok(())
    }
}

fn minute_key(now: DateTime<Utc>) -> String {
    format!("{}{}", MINUTE_KEY_PREFIX, now.format("%Y-%m-%dT%H:%M"))
}

fn day_key(now: DateTime<Utc>) -> String {
    format!("{}{}", DAY_KEY_PREFIX, now.format("%Y-%m-%d"))
}

/// Counter values are plain decimal strings; anything else counts as zero.
fn parse_count(value: Option<String>) -> u32 {
    value.and_then(|v| v.parse().ok()).unwrap_or(0)
}
