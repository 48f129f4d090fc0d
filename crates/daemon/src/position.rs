//! Queue position estimation for polling clients.
//!
//! Positions are derived from a fresh snapshot on every read instead of
//! being tracked incrementally, so concurrent inserts and reclamation never
//! leave a stale index behind.

use crate::status::{JobState, JobStatus};
use serde::{Deserialize, Serialize};

/// Where a queued job stands relative to the rest of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePosition {
    /// 1-based position
    pub position: usize,
    pub total_queued: usize,
}

/// Compute the position of `job_id` within `snapshot`.
///
/// Returns `None` when the job is absent or no longer queued. Ordering is by
/// `created_at`, with the submission sequence breaking ties.
pub fn estimate_position(snapshot: &[(String, JobStatus)], job_id: &str) -> Option<QueuePosition> {
    let (_, target) = snapshot.iter().find(|(id, _)| id == job_id)?;
    if target.state != JobState::Queued {
        return None;
    }
    let target_key = (target.created_at, target.seq);

    let mut position = 1;
    let mut total_queued = 0;
    for (id, status) in snapshot {
        if status.state != JobState::Queued {
            continue;
        }
        total_queued += 1;
        if id != job_id && (status.created_at, status.seq) < target_key {
            position += 1;
        }
    }

    Some(QueuePosition {
        position,
        total_queued,
    })
}
