use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::config::{DEFAULT_LOCK_BACKOFF_MAX_MS, DEFAULT_LOCK_BACKOFF_MIN_MS, DEFAULT_LOCK_RETRIES};
use crate::error::Result;
use crate::store::Store;

/// Inclusive range a retry pause is drawn from, uniformly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffRange {
    min: Duration,
    max: Duration,
}

impl BackoffRange {
    /// `max` below `min` is raised to `min`.
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max: max.max(min) }
    }

    pub fn fixed(pause: Duration) -> Self {
        Self::new(pause, pause)
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn sample(&self) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        let lo = u64::try_from(self.min.as_micros()).unwrap_or(u64::MAX);
        let hi = u64::try_from(self.max.as_micros()).unwrap_or(u64::MAX);
        Duration::from_micros(rand::rng().random_range(lo..=hi))
    }
}

impl Default for BackoffRange {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(DEFAULT_LOCK_BACKOFF_MIN_MS),
            Duration::from_millis(DEFAULT_LOCK_BACKOFF_MAX_MS),
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockOptions {
    /// Total attempts; zero still makes one.
    pub retries: u32,
    pub backoff: BackoffRange,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            retries: DEFAULT_LOCK_RETRIES,
            backoff: BackoffRange::default(),
        }
    }
}

/// Proof of one successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    key: String,
    token: String,
    ttl: Duration,
}

impl LockRecord {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn release<S: Store + ?Sized>(self, store: &S) -> Result<bool> {
        release(store, &self.key, &self.token).await
    }
}

/// Try to take the lock at `key` for `ttl` by setting a fresh random token
/// only if the key is absent. `Ok(None)` means every attempt found the lock
/// held.
pub async fn acquire<S: Store + ?Sized>(
    store: &S,
    key: &str,
    ttl: Duration,
    options: &LockOptions,
) -> Result<Option<LockRecord>> {
    acquire_inner(store, key, ttl, options, None).await
}

/// Like [`acquire`], but gives up as soon as the next pause would run past
/// `deadline`.
pub async fn acquire_until<S: Store + ?Sized>(
    store: &S,
    key: &str,
    ttl: Duration,
    options: &LockOptions,
    deadline: Instant,
) -> Result<Option<LockRecord>> {
    acquire_inner(store, key, ttl, options, Some(deadline)).await
}

async fn acquire_inner<S: Store + ?Sized>(
    store: &S,
    key: &str,
    ttl: Duration,
    options: &LockOptions,
    deadline: Option<Instant>,
) -> Result<Option<LockRecord>> {
    let start = Instant::now();
    let token = Uuid::new_v4().to_string();
    let attempts = options.retries.max(1);
    let mut outcome = None;

    for attempt in 1..=attempts {
        if store.set_if_absent_with_expiry(key, token.as_bytes(), ttl).await? {
            metrics::counter!("kvsync_lock_acquired_total").increment(1);
            debug!(key = %key, attempt, "lock acquired");
            outcome = Some(LockRecord {
                key: key.to_owned(),
                token,
                ttl,
            });
            break;
        }
        metrics::counter!("kvsync_lock_contended_total").increment(1);
        if attempt == attempts {
            debug!(key = %key, attempts, "lock still held, giving up");
            break;
        }
        let pause = options.backoff.sample();
        if deadline.is_some_and(|d| Instant::now() + pause > d) {
            debug!(key = %key, attempt, "lock deadline reached");
            break;
        }
        tokio::time::sleep(pause).await;
    }

    metrics::histogram!("kvsync_operation_duration_seconds", "operation" => "acquire_lock")
        .record(start.elapsed().as_secs_f64());
    Ok(outcome)
}

/// Delete `key` only if it still holds `token`. True when this call removed it.
pub async fn release<S: Store + ?Sized>(store: &S, key: &str, token: &str) -> Result<bool> {
    let start = Instant::now();
    let matched = store.compare_and_delete(key, token.as_bytes()).await?;
    metrics::counter!("kvsync_lock_released_total", "matched" => if matched { "true" } else { "false" })
        .increment(1);
    metrics::histogram!("kvsync_operation_duration_seconds", "operation" => "release_lock")
        .record(start.elapsed().as_secs_f64());
    debug!(key = %key, matched, "lock release");
    Ok(matched)
}
