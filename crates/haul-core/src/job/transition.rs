//! Which lifecycle triggers are legal from which status.

use super::types::Status;

pub fn can_pause(status: Status) -> bool {
    matches!(status, Status::Queued | Status::Downloading)
}

/// Resume never applies to a job that is still running; callers check that separately.
pub fn can_resume(status: Status) -> bool {
    matches!(
        status,
        Status::Paused | Status::Queued | Status::Failed | Status::Cancelled
    )
}

pub fn can_retry(status: Status) -> bool {
    matches!(status, Status::Failed | Status::Cancelled)
}

pub fn can_cancel(status: Status) -> bool {
    !matches!(
        status,
        Status::Completed | Status::Cancelled | Status::Removed | Status::Deleted
    )
}

/// Only a claimed job takes a worker's `Completed`/`Failed`; anything else is a stale report.
pub fn accepts_worker_outcome(status: Status) -> bool {
    status == Status::Downloading
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_only_from_active_states() {
        assert!(can_pause(Status::Queued));
        assert!(can_pause(Status::Downloading));
        assert!(!can_pause(Status::Completed));
        assert!(!can_pause(Status::Failed));
    }

    #[test]
    fn retry_only_from_failed_or_cancelled() {
        assert!(can_retry(Status::Failed));
        assert!(can_retry(Status::Cancelled));
        assert!(!can_retry(Status::Paused));
        assert!(!can_retry(Status::Completed));
    }

    #[test]
    fn cancel_rejects_terminal_states() {
        for s in [Status::Completed, Status::Cancelled, Status::Removed, Status::Deleted] {
            assert!(!can_cancel(s), "{s}");
        }
        for s in [Status::Queued, Status::Downloading, Status::Paused, Status::Failed] {
            assert!(can_cancel(s), "{s}");
        }
    }

    #[test]
    fn worker_outcome_only_for_downloading() {
        assert!(accepts_worker_outcome(Status::Downloading));
        for s in [Status::Queued, Status::Paused, Status::Cancelled, Status::Failed, Status::Completed] {
            assert!(!accepts_worker_outcome(s), "{s}");
        }
    }

    #[test]
    fn resume_accepts_stopped_states() {
        assert!(can_resume(Status::Paused));
        assert!(can_resume(Status::Failed));
        assert!(!can_resume(Status::Completed));
        assert!(!can_resume(Status::Downloading));
    }
}
