//! Dispatch order for queued jobs.

use std::cmp::Ordering;

use crate::job::Job;

/// Higher priority first, then older jobs, then lower ids.
pub(crate) fn dispatch_order(a: &Job, b: &Job) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}
