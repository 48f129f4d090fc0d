//! Reclamation sweeper
//!
//! Periodically removes status records nobody will poll anymore:
//! - finished jobs idle for longer than the TTL
//! - queued jobs waiting for longer than twice the TTL (stalled)
//!
//! Running jobs are never touched, whatever their age.

use crate::status::{JobState, JobStatus};
use crate::store::SharedStatusStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Terminal records past the TTL
    pub expired: usize,
    /// Queued records past twice the TTL
    pub stalled: usize,
}

impl SweepReport {
    pub fn removed(&self) -> usize {
        self.expired + self.stalled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Expired,
    Stalled,
}

fn verdict(status: &JobStatus, now: DateTime<Utc>, ttl: ChronoDuration) -> Option<Verdict> {
    if status.running {
        return None;
    }
    if status.state.is_terminal() && now - status.last_update_at > ttl {
        return Some(Verdict::Expired);
    }
    if status.state == JobState::Queued && now - status.created_at > ttl * 2 {
        return Some(Verdict::Stalled);
    }
    None
}

/// Removes stale records from a [`StatusStore`](crate::store::StatusStore).
#[derive(Clone)]
pub struct Sweeper {
    store: SharedStatusStore,
    ttl: Duration,
    interval: Duration,
}

impl Sweeper {
    pub fn new(store: SharedStatusStore, ttl: Duration, interval: Duration) -> Self {
        Self {
            store,
            ttl,
            interval,
        }
    }

    /// Sweep once as of `now`.
    ///
    /// Each record is judged and removed under its own lock, so a job that
    /// is revived between the id snapshot and the check is kept.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let ttl = match ChronoDuration::from_std(self.ttl) {
            Ok(ttl) => ttl,
            Err(e) => {
                warn!("TTL out of range, skipping sweep: {}", e);
                return SweepReport::default();
            }
        };

        let mut report = SweepReport::default();
        for id in self.store.list_ids() {
            let mut found = None;
            let removed = self.store.remove_if(&id, |status| {
                found = verdict(status, now, ttl);
                found.is_some()
            });
            match (removed, found) {
                (Some(_), Some(Verdict::Expired)) => {
                    debug!(job_id = %id, "Removed expired status record");
                    report.expired += 1;
                }
                (Some(status), Some(Verdict::Stalled)) => {
                    warn!(
                        job_id = %id,
                        created_at = %status.created_at,
                        "Removed stalled queued job"
                    );
                    report.stalled += 1;
                }
                _ => {}
            }
        }

        if report.removed() > 0 {
            info!(
                expired = report.expired,
                stalled = report.stalled,
                remaining = self.store.len(),
                "Status sweep finished"
            );
        }
        report
    }

    /// Sweep every interval until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            "Starting status sweeper (ttl: {:?}, interval: {:?})",
            self.ttl, self.interval
        );
        let mut ticker = interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep(Utc::now());
                }
            }
        }
        info!("Status sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusUpdate;
    use crate::store::StatusStore;

    const TTL: Duration = Duration::from_secs(300);

    fn sweeper(store: &SharedStatusStore) -> Sweeper {
        Sweeper::new(store.clone(), TTL, Duration::from_secs(60))
    }

    fn add(store: &SharedStatusStore, id: &str, update: Option<StatusUpdate>) {
        store.create(id, JobStatus::queued(store.next_seq())).unwrap();
        if let Some(update) = update {
            store.mutate(id, update).unwrap();
        }
    }

    fn running() -> StatusUpdate {
        StatusUpdate::new().running(true).state(JobState::Running)
    }

    #[test]
    fn test_stale_completed_job_is_removed() {
        let store = StatusStore::shared();
        add(&store, "done", Some(StatusUpdate::new().state(JobState::Completed)));
        add(&store, "failed", Some(StatusUpdate::new().error("boom")));

        let sweeper = sweeper(&store);
        assert_eq!(sweeper.sweep(Utc::now()), SweepReport::default());
        assert_eq!(store.len(), 2);

        let later = Utc::now() + ChronoDuration::seconds(301);
        assert_eq!(
            sweeper.sweep(later),
            SweepReport {
                expired: 2,
                stalled: 0
            }
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_running_job_is_kept_at_any_age() {
        let store = StatusStore::shared();
        add(&store, "busy", Some(running()));

        let much_later = Utc::now() + ChronoDuration::days(30);
        assert_eq!(sweeper(&store).sweep(much_later).removed(), 0);
        assert!(store.contains("busy"));
    }

    #[test]
    fn test_queued_job_kept_until_stall_threshold() {
        let store = StatusStore::shared();
        add(&store, "waiting", None);
        let sweeper = sweeper(&store);

        // Past the TTL but not twice the TTL.
        let soon = Utc::now() + ChronoDuration::seconds(400);
        assert_eq!(sweeper.sweep(soon).removed(), 0);

        let stalled = Utc::now() + ChronoDuration::seconds(601);
        assert_eq!(
            sweeper.sweep(stalled),
            SweepReport {
                expired: 0,
                stalled: 1
            }
        );
        assert!(!store.contains("waiting"));
    }

    #[test]
    fn test_recent_update_extends_lifetime() {
        let store = StatusStore::shared();
        add(&store, "done", Some(StatusUpdate::new().state(JobState::Completed)));
        let sweeper = sweeper(&store);

        let mut status = store.read("done").unwrap();
        status.last_update_at = Utc::now() + ChronoDuration::seconds(200);
        let now = Utc::now() + ChronoDuration::seconds(301);
        assert_eq!(verdict(&status, now, ChronoDuration::seconds(300)), None);
        assert_eq!(sweeper.sweep(now).expired, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = StatusStore::shared();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            Sweeper::new(store, TTL, Duration::from_millis(5)).run(shutdown.clone()),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        handle.await.unwrap();
    }
}
