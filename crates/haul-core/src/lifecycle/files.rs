//! Disk side effects of remove, delete and auto-increment. Failures are logged, not returned.

use std::io::ErrorKind;
use std::path::Path;

/// Removes a job's partial segment directory.
pub(crate) async fn discard_partials(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => tracing::debug!(dir = %dir.display(), "removed partial segments"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "could not remove partial segments"),
    }
}

pub(crate) async fn delete_destination(file: &Path) {
    match tokio::fs::remove_file(file).await {
        Ok(()) => tracing::info!(file = %file.display(), "deleted destination file"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(file = %file.display(), error = %e, "could not delete destination file"),
    }
}

/// Creates an empty file so a concurrent enqueue does not pick the same name.
pub(crate) async fn reserve(file: &Path) {
    if let Some(parent) = file.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            tracing::warn!(dir = %parent.display(), error = %e, "could not create destination directory");
            return;
        }
    }
    let created = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(file)
        .await;
    if let Err(e) = created {
        tracing::warn!(file = %file.display(), error = %e, "could not reserve destination file");
    }
}
