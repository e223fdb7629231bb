//! Advisory lock records for paths managed by the state store.
//!
//! A lock is a small JSON record at `<path>.lock` holding the holder id,
//! acquisition and expiry timestamps, and a generation counter. Locks are
//! created with a no-clobber atomic create, so a record is never observed
//! half-written.
//!
//! An expired lock is stolen in three steps:
//!
//! 1. create a claim file `<path>.lock.steal-<generation>` (no-clobber, so only
//!    one stealer per observed generation gets past this point),
//! 2. re-read the lock and check it is still the record that was observed,
//! 3. rename a new record with `generation + 1` over the lock.
//!
//! The claim is removed afterwards. Claims left behind by a crashed stealer
//! are discarded once they are older than the lock TTL.
//!
//! Generations never go backwards on a path. A release records the released
//! generation in `<path>.lock.gen` before deleting the lock, and the next
//! fresh lock starts one above it.
//!
//! A holder whose lock has already expired does not delete it on release:
//! a stealer may be between its re-read and its rename, and a fresh lock
//! created in that gap would be overwritten. The expired record is left for
//! the next acquirer to steal. Steps 2 and 3 above are still a compare then a
//! rename, so a holder refreshing its own lock at the instant it expires can
//! race a stealer; keep the TTL well above the time a locked write takes.

use super::atomic::{atomic_create, atomic_write, read_optional, remove_optional};
use crate::errors::StoreError;
use crate::utils::{add_duration, generate_holder_id, now_utc, Timestamp};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Delay growth between lock acquisition attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockBackoff {
    /// Same delay between every attempt.
    #[default]
    Fixed,
    /// Delay doubles each attempt, capped at `max_retry_delay_ms`.
    Exponential,
}

/// Configuration for the locking protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// When false, `acquire` always succeeds and `release` is a no-op.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Attempts before failing with a contention error.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay between attempts in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Cap for exponential back-off in milliseconds.
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    /// Back-off strategy.
    #[serde(default)]
    pub backoff: LockBackoff,
    /// Lifetime of an acquired lock in milliseconds.
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    /// How long past expiry a lock must be before it may be stolen.
    #[serde(default)]
    pub steal_threshold_ms: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    10
}

fn default_retry_delay_ms() -> u64 {
    25
}

fn default_max_retry_delay_ms() -> u64 {
    1000
}

fn default_ttl_ms() -> u64 {
    30_000
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            backoff: LockBackoff::default(),
            ttl_ms: default_ttl_ms(),
            steal_threshold_ms: 0,
        }
    }
}

impl LockConfig {
    /// Creates a new lock configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration with locking turned off.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Sets the attempt budget.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the delay between attempts.
    #[must_use]
    pub fn with_retry_delay_ms(mut self, delay: u64) -> Self {
        self.retry_delay_ms = delay;
        self
    }

    /// Sets the back-off strategy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: LockBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the lock lifetime.
    #[must_use]
    pub fn with_ttl_ms(mut self, ttl: u64) -> Self {
        self.ttl_ms = ttl;
        self
    }

    /// Sets the steal threshold.
    #[must_use]
    pub fn with_steal_threshold_ms(mut self, threshold: u64) -> Self {
        self.steal_threshold_ms = threshold;
        self
    }

    /// Delay before the attempt following `attempt` (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let ms = match self.backoff {
            LockBackoff::Fixed => self.retry_delay_ms,
            LockBackoff::Exponential => self
                .retry_delay_ms
                .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
                .min(self.max_retry_delay_ms),
        };
        Duration::from_millis(ms)
    }

    fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

fn generation_path_for(lock_path: &Path) -> PathBuf {
    let mut raw = lock_path.as_os_str().to_owned();
    raw.push(".gen");
    PathBuf::from(raw)
}

/// The on-disk lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    /// Who holds the lock.
    pub holder_id: String,
    /// When the lock was acquired.
    pub acquired_at: Timestamp,
    /// When the lock stops protecting the path.
    pub expires_at: Timestamp,
    /// Incremented every time the lock is stolen.
    pub generation: u64,
}

impl LockRecord {
    fn new(holder_id: &str, generation: u64, ttl: Duration) -> Self {
        let now = now_utc();
        Self {
            holder_id: holder_id.to_string(),
            acquired_at: now,
            expires_at: add_duration(now, ttl),
            generation,
        }
    }

    /// Returns true if the lock has expired.
    #[must_use]
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now > self.expires_at
    }
}

/// Counters describing lock activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStats {
    /// Successful acquisitions.
    pub acquired: u64,
    /// Attempts that found the lock held by someone else.
    pub contended: u64,
    /// Acquisitions that stole an expired lock.
    pub stolen: u64,
    /// Releases.
    pub released: u64,
    /// Acquisitions abandoned after the attempt budget.
    pub timeouts: u64,
}

#[derive(Debug, Default)]
struct LockCounters {
    acquired: AtomicU64,
    contended: AtomicU64,
    stolen: AtomicU64,
    released: AtomicU64,
    timeouts: AtomicU64,
}

enum Attempt {
    Acquired(LockRecord),
    Held,
}

/// Manages lock records for one store instance.
#[derive(Debug)]
pub struct LockManager {
    config: LockConfig,
    holder_id: String,
    local: DashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>,
    counters: LockCounters,
}

/// Returns the lock record path for a protected path.
#[must_use]
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(".lock");
    PathBuf::from(raw)
}

fn claim_path_for(lock_path: &Path, generation: u64) -> PathBuf {
    let mut raw = lock_path.as_os_str().to_owned();
    raw.push(format!(".steal-{generation}"));
    PathBuf::from(raw)
}

impl LockManager {
    /// Creates a lock manager with a freshly generated holder id.
    #[must_use]
    pub fn new(config: LockConfig) -> Self {
        Self::with_holder(config, generate_holder_id())
    }

    /// Creates a lock manager with an explicit holder id.
    #[must_use]
    pub fn with_holder(config: LockConfig, holder_id: impl Into<String>) -> Self {
        Self {
            config,
            holder_id: holder_id.into(),
            local: DashMap::new(),
            counters: LockCounters::default(),
        }
    }

    /// Returns this manager's holder id.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Returns true if locking is active.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Acquires the lock on `path`, retrying on contention.
    pub async fn acquire(&self, path: &Path) -> Result<LockRecord, StoreError> {
        if !self.config.enabled {
            return Ok(LockRecord::new(&self.holder_id, 0, self.config.ttl()));
        }

        let lock_path = lock_path_for(path);
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self.try_acquire(&lock_path)? {
                Attempt::Acquired(record) => {
                    self.counters.acquired.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        path = %path.display(),
                        generation = record.generation,
                        attempt,
                        "Lock acquired"
                    );
                    return Ok(record);
                }
                Attempt::Held => {
                    self.counters.contended.fetch_add(1, Ordering::Relaxed);
                    if attempt < max_attempts {
                        let delay = self.config.delay_after(attempt);
                        debug!(
                            path = %path.display(),
                            attempt,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "Lock contended, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
        warn!(path = %path.display(), attempts = max_attempts, "Lock acquisition gave up");
        Err(StoreError::LockContention {
            path: path.to_path_buf(),
            attempts: max_attempts,
        })
    }

    /// Releases the lock on `path`.
    ///
    /// Releasing a lock held by someone else is an error; releasing a lock
    /// that does not exist is a no-op.
    pub fn release(&self, path: &Path) -> Result<(), StoreError> {
        if !self.config.enabled {
            return Ok(());
        }

        let lock_path = lock_path_for(path);
        let Some(bytes) = read_optional(&lock_path)? else {
            return Ok(());
        };

        let record = match serde_json::from_slice::<LockRecord>(&bytes) {
            Ok(record) if record.holder_id == self.holder_id => record,
            Ok(record) => {
                return Err(StoreError::LockHolderMismatch {
                    path: path.to_path_buf(),
                    holder: record.holder_id,
                    requester: self.holder_id.clone(),
                })
            }
            Err(_) => {
                return Err(StoreError::LockHolderMismatch {
                    path: path.to_path_buf(),
                    holder: "<unreadable>".to_string(),
                    requester: self.holder_id.clone(),
                })
            }
        };

        self.counters.released.fetch_add(1, Ordering::Relaxed);
        if record.is_expired(now_utc()) {
            debug!(
                path = %path.display(),
                generation = record.generation,
                "Lock expired before release, leaving it to be stolen"
            );
            return Ok(());
        }

        let generation = serde_json::to_vec(&record.generation)
            .map_err(|e| StoreError::Encode {
                path: generation_path_for(&lock_path),
                format: "json",
                reason: e.to_string(),
            })?;
        atomic_write(&generation_path_for(&lock_path), &generation)?;
        remove_optional(&lock_path)?;
        debug!(path = %path.display(), generation = record.generation, "Lock released");
        Ok(())
    }

    /// Runs `f` while holding the lock on `path`.
    ///
    /// The lock is released on every exit path; an error from `f` is returned
    /// after the release.
    pub async fn with_lock<T, E, F, Fut>(&self, path: &Path, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<StoreError>,
    {
        let local = self
            .local
            .entry(path.to_path_buf())
            .or_default()
            .value()
            .clone();
        let outcome = {
            let _local_guard = local.lock().await;
            self.run_locked(path, f).await
        };
        drop(local);
        self.local
            .remove_if(path, |_, mutex| Arc::strong_count(mutex) == 1);
        outcome
    }

    async fn run_locked<T, E, F, Fut>(&self, path: &Path, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<StoreError>,
    {
        self.acquire(path).await?;
        let outcome = f().await;
        let released = self.release(path);

        match (outcome, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(release_err)) => Err(release_err.into()),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                warn!(path = %path.display(), error = %release_err, "Lock release failed after error");
                Err(err)
            }
        }
    }

    /// Reads the current lock record for `path`, if any.
    pub fn inspect(&self, path: &Path) -> Result<Option<LockRecord>, StoreError> {
        let lock_path = lock_path_for(path);
        match read_optional(&lock_path)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Decode {
                    path: lock_path,
                    format: "json",
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Returns a snapshot of the lock counters.
    #[must_use]
    pub fn stats(&self) -> LockStats {
        LockStats {
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            contended: self.counters.contended.load(Ordering::Relaxed),
            stolen: self.counters.stolen.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
        }
    }

    fn try_acquire(&self, lock_path: &Path) -> Result<Attempt, StoreError> {
        let Some(observed) = read_optional(lock_path)? else {
            let generation = self.last_generation(lock_path)? + 1;
            return self.create(lock_path, generation);
        };

        let now = now_utc();
        match serde_json::from_slice::<LockRecord>(&observed) {
            Ok(existing) if self.is_stealable(&existing, now) => {
                self.steal(lock_path, &observed, existing.generation)
            }
            Ok(existing) if existing.holder_id == self.holder_id => {
                let refreshed = LockRecord {
                    expires_at: add_duration(now, self.config.ttl()),
                    ..existing
                };
                atomic_write(lock_path, &encode(lock_path, &refreshed)?)?;
                Ok(Attempt::Acquired(refreshed))
            }
            Ok(_) => Ok(Attempt::Held),
            Err(e) => {
                warn!(path = %lock_path.display(), error = %e, "Unreadable lock record, stealing");
                self.steal(lock_path, &observed, 0)
            }
        }
    }

    /// The generation of the last lock released on this path, or 0.
    fn last_generation(&self, lock_path: &Path) -> Result<u64, StoreError> {
        let gen_path = generation_path_for(lock_path);
        let Some(bytes) = read_optional(&gen_path)? else {
            return Ok(0);
        };
        match serde_json::from_slice::<u64>(&bytes) {
            Ok(generation) => Ok(generation),
            Err(e) => {
                warn!(path = %gen_path.display(), error = %e, "Unreadable generation record, starting over");
                Ok(0)
            }
        }
    }

    fn is_stealable(&self, record: &LockRecord, now: Timestamp) -> bool {
        let threshold = Duration::from_millis(self.config.steal_threshold_ms);
        now > add_duration(record.expires_at, threshold)
    }

    fn create(&self, lock_path: &Path, generation: u64) -> Result<Attempt, StoreError> {
        let record = LockRecord::new(&self.holder_id, generation, self.config.ttl());
        if atomic_create(lock_path, &encode(lock_path, &record)?)? {
            Ok(Attempt::Acquired(record))
        } else {
            Ok(Attempt::Held)
        }
    }

    fn steal(
        &self,
        lock_path: &Path,
        observed: &[u8],
        prior_generation: u64,
    ) -> Result<Attempt, StoreError> {
        let claim = claim_path_for(lock_path, prior_generation);
        if !atomic_create(&claim, self.holder_id.as_bytes())? {
            if self.claim_is_abandoned(&claim) {
                debug!(claim = %claim.display(), "Removing abandoned steal claim");
                remove_optional(&claim)?;
            }
            return Ok(Attempt::Held);
        }

        let generation = self
            .last_generation(lock_path)
            .map(|last| last.max(prior_generation) + 1);
        let outcome =
            generation.and_then(|generation| self.replace_observed(lock_path, observed, generation));
        let cleanup = remove_optional(&claim);
        let attempt = outcome?;
        cleanup?;

        if let Attempt::Acquired(record) = &attempt {
            self.counters.stolen.fetch_add(1, Ordering::Relaxed);
            warn!(
                path = %lock_path.display(),
                generation = record.generation,
                "Stole expired lock"
            );
        }
        Ok(attempt)
    }

    fn replace_observed(
        &self,
        lock_path: &Path,
        observed: &[u8],
        generation: u64,
    ) -> Result<Attempt, StoreError> {
        let current = read_optional(lock_path)?;
        if current.as_deref() != Some(observed) {
            return Ok(Attempt::Held);
        }
        let record = LockRecord::new(&self.holder_id, generation, self.config.ttl());
        atomic_write(lock_path, &encode(lock_path, &record)?)?;
        Ok(Attempt::Acquired(record))
    }

    fn claim_is_abandoned(&self, claim: &Path) -> bool {
        std::fs::metadata(claim)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age > self.config.ttl())
    }
}

fn encode(lock_path: &Path, record: &LockRecord) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(record).map_err(|e| StoreError::Encode {
        path: lock_path.to_path_buf(),
        format: "json",
        reason: e.to_string(),
    })
}
