//! Media downloads triggered after a crawl. Each download is independent and
//! best-effort: one failure never stops the rest.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::process::Command;

use crate::error::DownloadError;

#[async_trait]
pub trait MediaDownloader: Send + Sync {
    /// Fetch the media behind `id` into `save_dir`, returning where it landed.
    async fn download(&self, id: &str, save_dir: &Path) -> Result<PathBuf, DownloadError>;
}

#[derive(Debug, Default)]
pub struct DownloadSummary {
    pub succeeded: Vec<(String, PathBuf)>,
    pub failed: Vec<(String, String)>,
}

pub async fn download_all<I>(
    downloader: &dyn MediaDownloader,
    ids: I,
    save_dir: &Path,
    concurrency: usize,
) -> DownloadSummary
where
    I: IntoIterator<Item = String>,
{
    let results: Vec<(String, Result<PathBuf, DownloadError>)> = stream::iter(ids)
        .map(|id| async move {
            let result = downloader.download(&id, save_dir).await;
            (id, result)
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut summary = DownloadSummary::default();
    for (id, result) in results {
        match result {
            Ok(path) => {
                tracing::info!(id = %id, "downloaded to '{}'", path.display());
                summary.succeeded.push((id, path));
            }
            Err(err) => {
                tracing::error!(id = %id, "download failed: {}", err);
                summary.failed.push((id, err.to_string()));
            }
        }
    }
    tracing::info!(
        succeeded = summary.succeeded.len(),
        failed = summary.failed.len(),
        "downloads finished"
    );
    summary
}

/// Delegates to an external media tool. `{id}` and `{dir}` in the arguments
/// are replaced per download; the item's directory is `<save_dir>/<id>`.
#[derive(Debug, Clone)]
pub struct CommandDownloader {
    program: String,
    args: Vec<String>,
}

impl CommandDownloader {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

#[async_trait]
impl MediaDownloader for CommandDownloader {
    async fn download(&self, id: &str, save_dir: &Path) -> Result<PathBuf, DownloadError> {
        let dir = save_dir.join(id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| DownloadError::Io {
                path: dir.clone(),
                source,
            })?;
        let dir_str = dir.to_string_lossy();
        let args = self
            .args
            .iter()
            .map(|arg| arg.replace("{id}", id).replace("{dir}", &dir_str));
        let output = Command::new(&self.program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| DownloadError::Command {
                program: self.program.clone(),
                reason: err.to_string(),
            })?;
        if !output.status.success() {
            return Err(DownloadError::Command {
                program: self.program.clone(),
                reason: format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(dir)
    }
}
