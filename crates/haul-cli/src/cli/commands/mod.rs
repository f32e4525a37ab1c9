//! CLI command handlers, one file per command.

mod add;
mod catalog;
mod checksum;
mod remove;
mod run;
mod serve;
mod status;
mod transition;

pub use add::run_add;
pub use catalog::run_catalog;
pub use checksum::run_checksum;
pub use remove::run_remove;
pub use run::run_scheduler;
pub use serve::run_serve;
pub use status::run_status;
pub use transition::{run_transition, Transition};
