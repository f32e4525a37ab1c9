//! CLI for the haul download queue.

mod commands;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use haul_core::config::{self, HaulConfig};
use haul_core::store::SqliteStore;
use haul_core::{DownloadManager, JobId, NamespaceRegistry, Priority, Status, Strategies};

use commands::{
    run_add, run_catalog, run_checksum, run_remove, run_scheduler, run_serve, run_status,
    run_transition, Transition,
};

/// Top-level CLI for the haul download queue.
#[derive(Debug, Parser)]
#[command(name = "haul")]
#[command(about = "haul: persistent download queue with a content-file server", long_about = None)]
pub struct Cli {
    /// Namespace to operate on (overrides the config file).
    #[arg(long, global = true, value_name = "NAME")]
    pub namespace: Option<String>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Queue a new download.
    Add {
        /// HTTP(S) or haulfs:// URL.
        url: String,
        /// Destination file.
        #[arg(short, long, value_name = "PATH")]
        output: PathBuf,
        /// Explicit job id (derived from url and output when omitted).
        #[arg(long, allow_negative_numbers = true)]
        id: Option<JobId>,
        #[arg(long, default_value_t = 0)]
        group: i64,
        #[arg(long, value_enum, default_value_t = PriorityArg::Normal)]
        priority: PriorityArg,
        /// Extra request header as `Name: value`. Repeatable.
        #[arg(short = 'H', long = "header", value_name = "NAME:VALUE", value_parser = parse_header)]
        headers: Vec<(String, String)>,
    },

    /// Process the queue until nothing is queued or downloading.
    Run {
        /// Run up to N jobs concurrently (default from config).
        #[arg(long, value_name = "N")]
        jobs: Option<usize>,
    },

    /// Show jobs, optionally filtered.
    Status {
        #[arg(long)]
        group: Option<i64>,
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
    },

    /// Pause queued or downloading jobs.
    Pause {
        #[arg(required = true, allow_negative_numbers = true)]
        ids: Vec<JobId>,
    },

    /// Re-queue paused jobs.
    Resume {
        #[arg(required = true, allow_negative_numbers = true)]
        ids: Vec<JobId>,
    },

    /// Re-queue failed or cancelled jobs.
    Retry {
        #[arg(required = true, allow_negative_numbers = true)]
        ids: Vec<JobId>,
    },

    /// Cancel jobs that have not finished.
    Cancel {
        #[arg(required = true, allow_negative_numbers = true)]
        ids: Vec<JobId>,
    },

    /// Remove jobs from the queue.
    Remove {
        #[arg(required = true, allow_negative_numbers = true)]
        ids: Vec<JobId>,
        /// Also delete each job's destination file.
        #[arg(long)]
        delete_files: bool,
    },

    /// Serve local files over the content-file protocol until interrupted.
    Serve {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long, default_value = "0.0.0.0:0", value_name = "ADDR")]
        bind: String,
    },

    /// List the files offered by a content-file server.
    Catalog {
        /// Server address as `host:port`.
        addr: SocketAddr,
    },

    /// Compute SHA-256 of a file (e.g. after download).
    Checksum {
        /// Path to the file.
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PriorityArg {
    Low,
    Normal,
    High,
}

impl From<PriorityArg> for Priority {
    fn from(p: PriorityArg) -> Self {
        match p {
            PriorityArg::Low => Priority::Low,
            PriorityArg::Normal => Priority::Normal,
            PriorityArg::High => Priority::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusArg {
    Queued,
    Downloading,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl From<StatusArg> for Status {
    fn from(s: StatusArg) -> Self {
        match s {
            StatusArg::Queued => Status::Queued,
            StatusArg::Downloading => Status::Downloading,
            StatusArg::Paused => Status::Paused,
            StatusArg::Completed => Status::Completed,
            StatusArg::Cancelled => Status::Cancelled,
            StatusArg::Failed => Status::Failed,
        }
    }
}

fn parse_header(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once(':')
        .ok_or_else(|| format!("expected NAME:VALUE, got {s:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in {s:?}"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Opens the manager for `cfg.namespace` on the default SQLite store.
pub(crate) async fn open_manager(
    cfg: &HaulConfig,
    auto_start: bool,
) -> Result<DownloadManager<SqliteStore>> {
    let store = SqliteStore::open_default(&cfg.namespace).await?;
    let cfg = HaulConfig {
        auto_start,
        ..cfg.clone()
    };
    let manager = DownloadManager::open(
        store,
        &cfg,
        &NamespaceRegistry::new(),
        Strategies::from_config(&cfg),
    )
    .await?;
    Ok(manager)
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let mut cfg = config::load_or_init()?;
        if let Some(namespace) = cli.namespace {
            cfg.namespace = namespace;
        }
        tracing::debug!("loaded config: {:?}", cfg);

        match cli.command {
            CliCommand::Add {
                url,
                output,
                id,
                group,
                priority,
                headers,
            } => run_add(&cfg, url, output, id, group, priority.into(), headers).await?,
            CliCommand::Run { jobs } => {
                if let Some(jobs) = jobs {
                    cfg.concurrency_limit = jobs;
                }
                run_scheduler(&cfg).await?;
            }
            CliCommand::Status { group, status } => {
                run_status(&cfg, group, status.map(Status::from)).await?
            }
            CliCommand::Pause { ids } => run_transition(&cfg, Transition::Pause, &ids).await?,
            CliCommand::Resume { ids } => run_transition(&cfg, Transition::Resume, &ids).await?,
            CliCommand::Retry { ids } => run_transition(&cfg, Transition::Retry, &ids).await?,
            CliCommand::Cancel { ids } => run_transition(&cfg, Transition::Cancel, &ids).await?,
            CliCommand::Remove { ids, delete_files } => run_remove(&cfg, &ids, delete_files).await?,
            CliCommand::Serve { files, bind } => run_serve(&cfg, &files, &bind).await?,
            CliCommand::Catalog { addr } => run_catalog(&cfg, addr).await?,
            CliCommand::Checksum { path } => run_checksum(&path).await?,
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests;
