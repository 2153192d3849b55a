//! Job plumbing: advisory locks and the periodic scheduler.

use anyhow::Result;
use chrono::Duration as ChronoDuration;
use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::db::Repository;

/// Whether a job did its work or stood down because another run held the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    Skipped,
}

/// Held advisory lock. Released when dropped.
pub struct JobLock {
    repo: Arc<dyn Repository>,
    name: String,
    owner: String,
}

impl JobLock {
    /// Take the named lock without waiting. `Ok(None)` means another owner
    /// holds an unexpired lock.
    pub fn try_acquire(
        repo: Arc<dyn Repository>,
        name: &str,
        ttl: ChronoDuration,
    ) -> Result<Option<JobLock>> {
        let owner = format!("{}-{:08x}", std::process::id(), rand::random::<u32>());
        if repo.try_acquire_lock(name, &owner, ttl)? {
            debug!("Lock '{}' acquired by {}", name, owner);
            Ok(Some(JobLock {
                repo,
                name: name.to_string(),
                owner,
            }))
        } else {
            Ok(None)
        }
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        if let Err(e) = self.repo.release_lock(&self.name, &self.owner) {
            warn!("Failed to release lock '{}': {}", self.name, e);
        }
    }
}

/// Run `job` every `period` forever, each tick delayed by up to `max_jitter`.
/// Errors are logged; the loop never exits.
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    max_jitter: Duration,
    mut job: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let delay = jitter(max_jitter);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Err(e) = job().await {
            error!("Job '{}' failed: {:#}", name, e);
        }
    }
}

fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
