//! Job records, identity, and lifecycle transition rules.

mod id;
mod transition;
mod types;

pub use id::derive_job_id;
pub use transition::{accepts_worker_outcome, can_cancel, can_pause, can_resume, can_retry};
pub use types::*;
pub(crate) use types::unix_millis;
