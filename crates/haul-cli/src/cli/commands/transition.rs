//! `haul pause|resume|retry|cancel <id>...`

use anyhow::Result;
use haul_core::config::HaulConfig;
use haul_core::JobId;

use crate::cli::open_manager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Pause,
    Resume,
    Retry,
    Cancel,
}

impl Transition {
    fn past_tense(self) -> &'static str {
        match self {
            Transition::Pause => "Paused",
            Transition::Resume => "Resumed",
            Transition::Retry => "Retrying",
            Transition::Cancel => "Cancelled",
        }
    }
}

pub async fn run_transition(cfg: &HaulConfig, transition: Transition, ids: &[JobId]) -> Result<()> {
    let manager = open_manager(cfg, false).await?;
    let changed = match transition {
        Transition::Pause => manager.pause_ids(ids).await?,
        Transition::Resume => manager.resume_ids(ids).await?,
        Transition::Retry => manager.retry_ids(ids).await?,
        Transition::Cancel => manager.cancel_ids(ids).await?,
    };
    manager.close();

    for id in ids {
        if changed.iter().any(|j| j.id == *id) {
            println!("{} job {id}", transition.past_tense());
        } else {
            println!("Job {id} unchanged (missing or not eligible)");
        }
    }
    Ok(())
}
