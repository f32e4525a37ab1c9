//! Duplicate handling on enqueue.
//!
//! A new record passes through four stages in fixed order: id collision,
//! file collision, carry-forward, auto-increment. The stages are pure; the
//! manager performs the lookups they need and applies the side effects they
//! return (records to discard, a file to reserve).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::job::{derive_job_id, Job, JobId, JobRequest, Status};

/// One duplicate-handling flag. Flags combine; the set is configured once per manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOption {
    /// Replace a record with the same id, keeping its progress.
    ReplaceOnEnqueueId,
    /// Replace a record with the same id, starting over.
    ReplaceOnEnqueueFreshId,
    /// Replace a record with the same destination file, keeping its progress.
    ReplaceOnEnqueueFile,
    ReplaceOnEnqueueFreshFile,
    /// Replace by id or by file, keeping progress; auto-increment when neither matched.
    ReplaceAllWhereUnique,
    ReplaceAllWhereUniqueFresh,
    /// Append ` (N)` to the file name until it names no existing file.
    AutoIncrementFileName,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueuePolicy {
    options: HashSet<EnqueueOption>,
}

/// A record on its way through the stages.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub job: Job,
    /// The id was derived from (url, file) rather than given by the caller.
    pub id_derived: bool,
    pub id_match: Option<Job>,
    pub file_match: Option<Job>,
    /// Existing records to cancel and remove before the candidate is stored.
    pub discard: Vec<Job>,
    /// Set when auto-increment picked a new path that should be created up front.
    pub reserve: Option<PathBuf>,
}

impl Candidate {
    pub fn new(request: JobRequest, namespace: &str) -> Self {
        let id_derived = request.id == derive_job_id(&request.url, &request.file);
        Self {
            job: Job::from_request(request, namespace),
            id_derived,
            id_match: None,
            file_match: None,
            discard: Vec::new(),
            reserve: None,
        }
    }
}

impl EnqueuePolicy {
    pub fn new(options: impl IntoIterator<Item = EnqueueOption>) -> Self {
        Self {
            options: options.into_iter().collect(),
        }
    }

    fn has(&self, option: EnqueueOption) -> bool {
        self.options.contains(&option)
    }

    fn any(&self, options: &[EnqueueOption]) -> bool {
        options.iter().any(|o| self.has(*o))
    }

    /// Whether an existing record with the same id gets replaced.
    pub fn matches_by_id(&self) -> bool {
        use EnqueueOption::*;
        self.any(&[
            ReplaceOnEnqueueId,
            ReplaceOnEnqueueFreshId,
            ReplaceAllWhereUnique,
            ReplaceAllWhereUniqueFresh,
        ])
    }

    /// Whether an existing record with the same destination file gets replaced.
    pub fn matches_by_file(&self) -> bool {
        use EnqueueOption::*;
        self.any(&[
            ReplaceOnEnqueueFile,
            ReplaceOnEnqueueFreshFile,
            ReplaceAllWhereUnique,
            ReplaceAllWhereUniqueFresh,
        ])
    }

    pub fn keeps_progress(&self) -> bool {
        use EnqueueOption::*;
        self.any(&[ReplaceOnEnqueueId, ReplaceOnEnqueueFile, ReplaceAllWhereUnique])
    }

    pub fn auto_increments(&self) -> bool {
        use EnqueueOption::*;
        self.any(&[AutoIncrementFileName, ReplaceAllWhereUnique])
    }

    /// Stage 1. `existing` is the stored record with the candidate's id, if looked up.
    pub fn resolve_id_collision(&self, mut candidate: Candidate, existing: Option<Job>) -> Candidate {
        if !self.matches_by_id() {
            return candidate;
        }
        if let Some(existing) = existing {
            candidate.discard.push(existing.clone());
            candidate.id_match = Some(existing);
        }
        candidate
    }

    /// Stage 2. `existing` is the stored record with the candidate's file, if looked up.
    pub fn resolve_file_collision(&self, mut candidate: Candidate, existing: Option<Job>) -> Candidate {
        if !self.matches_by_file() {
            return candidate;
        }
        if let Some(existing) = existing {
            if !candidate.discard.iter().any(|d| d.id == existing.id) {
                candidate.discard.push(existing.clone());
            }
            candidate.file_match = Some(existing);
        }
        candidate
    }

    /// Stage 3. The file match wins when both lookups found a record.
    pub fn carry_forward(&self, mut candidate: Candidate) -> Candidate {
        if !self.keeps_progress() {
            return candidate;
        }
        let prior = candidate.file_match.as_ref().or(candidate.id_match.as_ref());
        if let Some(prior) = prior {
            candidate.job.record_progress(prior.downloaded, prior.total);
            if prior.status == Status::Completed {
                candidate.job.status = Status::Completed;
            }
        }
        candidate
    }

    /// Stage 4. Skipped when stage 3 carried a prior record's progress forward.
    pub fn auto_increment(
        &self,
        mut candidate: Candidate,
        exists: impl Fn(&Path) -> bool,
    ) -> Candidate {
        let carried = self.keeps_progress()
            && (candidate.id_match.is_some() || candidate.file_match.is_some());
        if !self.auto_increments() || carried {
            return candidate;
        }
        if !exists(&candidate.job.file) {
            return candidate;
        }
        let original = candidate.job.file.clone();
        let mut n = 1u32;
        let mut path = incremented_path(&original, n);
        while exists(&path) {
            n += 1;
            path = incremented_path(&original, n);
        }
        if candidate.id_derived {
            candidate.job.id = derive_job_id(&candidate.job.url, &path);
        }
        candidate.job.file = path.clone();
        candidate.reserve = Some(path);
        candidate
    }

    /// Drops later requests that repeat an earlier one's id when ids are matched,
    /// or its file when files are matched. Without either, every request is kept
    /// and the store reports repeats as not inserted.
    pub fn dedupe(&self, requests: Vec<JobRequest>) -> Vec<JobRequest> {
        let (by_id, by_file) = (self.matches_by_id(), self.matches_by_file());
        let mut ids: HashSet<JobId> = HashSet::new();
        let mut files: HashSet<PathBuf> = HashSet::new();
        requests
            .into_iter()
            .filter(|r| {
                if by_id && !ids.insert(r.id) {
                    return false;
                }
                !by_file || files.insert(r.file.clone())
            })
            .collect()
    }
}

/// `dir/name.ext` becomes `dir/name (n).ext`.
pub fn incremented_path(path: &Path, n: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem} ({n}).{}", ext.to_string_lossy()),
        None => format!("{stem} ({n})"),
    };
    path.with_file_name(name)
}
