// mongoquery-core/src/lazy.rs
// Lazy increment/decrement: deltas are buffered in the cache and flushed as
// one `$inc` once the window has passed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::cache::{digest_key, Cache};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(d) = chrono::Duration::from_std(by) {
            *self.now.lock() += d;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LazyOutcome {
    /// Delta recorded, nothing to write yet.
    Buffered,
    /// Window elapsed: write this accumulated delta.
    Flush(i64),
}

/// Counter key for one (table, field, filter) target.
pub fn lazy_key(table: &str, field: &str, filter: &Value) -> String {
    digest_key("lazy", &json!([table, field, filter]))
}

pub struct LazyWriter {
    cache: Arc<dyn Cache>,
    clock: Arc<dyn Clock>,
}

impl LazyWriter {
    pub fn new(cache: Arc<dyn Cache>, clock: Arc<dyn Clock>) -> Self {
        Self { cache, clock }
    }

    /// Add `step` to the pending delta under `key`. The first call opens the
    /// window; the first call after it closes flushes and resets the counter.
    pub fn accumulate(&self, key: &str, step: i64, window: Duration) -> LazyOutcome {
        let time_key = format!("{}_time", key);
        let now = self.clock.now().timestamp_millis();

        let opened = match self.cache.get(&time_key).and_then(|v| v.as_i64()) {
            Some(t) => t,
            None => {
                self.cache.set(&time_key, Value::from(now), None, None);
                self.cache.inc(key, step);
                return LazyOutcome::Buffered;
            }
        };

        let total = self.cache.inc(key, step);
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        if now > opened.saturating_add(window_ms) {
            self.cache.delete(key);
            self.cache.delete(&time_key);
            if total == 0 {
                return LazyOutcome::Buffered;
            }
            return LazyOutcome::Flush(total);
        }
        LazyOutcome::Buffered
    }
}

impl std::fmt::Debug for LazyWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyWriter").finish_non_exhaustive()
    }
}
