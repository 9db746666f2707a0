//! Process-wide advisory lock for smart-resume runs.
//!
//! At most one holder at a time. A holder older than the staleness
//! threshold may be reclaimed by the next caller; its cancellation token
//! is tripped so a still-running dispatcher stops at the next client.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;

#[derive(Debug, Clone)]
pub struct LockHolder {
    pub job_id: String,
    /// Base run id of the holder's run.
    pub run_id: String,
    pub stream: u8,
    pub acquired_at: OffsetDateTime,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    pub locked: bool,
    pub current_job_id: Option<String>,
    pub age_minutes: Option<u64>,
    pub is_stale: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetOutcome {
    pub reset: bool,
    pub previous_job_id: Option<String>,
    pub terminated: bool,
}

/// The lock is held by someone else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contention {
    pub job_id: String,
    pub age_minutes: u64,
}

pub struct Acquisition {
    pub guard: LockGuard,
    /// A stale holder that was evicted to make room.
    pub reclaimed: Option<LockHolder>,
}

#[derive(Clone)]
pub struct AdvisoryLock {
    holder: Arc<Mutex<Option<LockHolder>>>,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
}

impl AdvisoryLock {
    pub fn new(clock: Arc<dyn Clock>, stale_after_minutes: u64) -> Self {
        AdvisoryLock {
            holder: Arc::new(Mutex::new(None)),
            clock,
            stale_after: Duration::minutes(i64::try_from(stale_after_minutes).unwrap_or(i64::MAX / 60)),
        }
    }

    /// Take the lock, reclaiming it from a stale holder if necessary.
    pub fn try_acquire(&self, job_id: &str, run_id: &str, stream: u8) -> Result<Acquisition, Contention> {
        let now = self.clock.now();
        let mut slot = self.holder.lock();

        let reclaimed = match slot.take() {
            Some(current) if now - current.acquired_at > self.stale_after => {
                tracing::warn!(
                    job_id = %current.job_id,
                    age_minutes = age_minutes(now, current.acquired_at),
                    "reclaiming stale smart-resume lock"
                );
                current.cancel.cancel();
                Some(current)
            }
            Some(current) => {
                let contention = Contention {
                    job_id: current.job_id.clone(),
                    age_minutes: age_minutes(now, current.acquired_at),
                };
                *slot = Some(current);
                return Err(contention);
            }
            None => None,
        };

        let cancel = CancellationToken::new();
        *slot = Some(LockHolder {
            job_id: job_id.to_string(),
            run_id: run_id.to_string(),
            stream,
            acquired_at: now,
            cancel: cancel.clone(),
        });
        tracing::debug!(job_id, "smart-resume lock acquired");

        Ok(Acquisition {
            guard: LockGuard {
                lock: self.clone(),
                job_id: job_id.to_string(),
                cancel,
            },
            reclaimed,
        })
    }

    pub fn status(&self) -> LockStatus {
        let now = self.clock.now();
        match self.holder.lock().as_ref() {
            Some(h) => LockStatus {
                locked: true,
                current_job_id: Some(h.job_id.clone()),
                age_minutes: Some(age_minutes(now, h.acquired_at)),
                is_stale: now - h.acquired_at > self.stale_after,
            },
            None => LockStatus {
                locked: false,
                current_job_id: None,
                age_minutes: None,
                is_stale: false,
            },
        }
    }

    /// The current holder, if any.
    pub fn holder(&self) -> Option<LockHolder> {
        self.holder.lock().clone()
    }

    /// Clear the lock. With `force_terminate` the holder's run is also
    /// told to stop at its next client boundary.
    pub fn reset(&self, force_terminate: bool) -> ResetOutcome {
        let previous = self.holder.lock().take();
        let terminated = match previous {
            Some(ref h) if force_terminate => {
                h.cancel.cancel();
                true
            }
            _ => false,
        };
        if let Some(ref h) = previous {
            tracing::warn!(job_id = %h.job_id, terminated, "smart-resume lock reset");
        }
        ResetOutcome {
            reset: previous.is_some(),
            previous_job_id: previous.map(|h| h.job_id),
            terminated,
        }
    }

    fn release(&self, job_id: &str) {
        let mut slot = self.holder.lock();
        if slot.as_ref().is_some_and(|h| h.job_id == job_id) {
            *slot = None;
            tracing::debug!(job_id, "smart-resume lock released");
        }
    }
}

/// Releases the lock on drop, unless it has since changed hands.
pub struct LockGuard {
    lock: AdvisoryLock,
    job_id: String,
    cancel: CancellationToken,
}

impl LockGuard {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.lock.release(&self.job_id);
    }
}

fn age_minutes(now: OffsetDateTime, since: OffsetDateTime) -> u64 {
    u64::try_from((now - since).whole_minutes()).unwrap_or(0)
}
