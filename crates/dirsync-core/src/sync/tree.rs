//! The local synchronized root and how received changes are applied to it

use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, info, warn};

use super::debounce::Debouncer;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::types::{ChangeEvent, IgnoreList};

/// Result of applying one received change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The change was applied (or its failure was logged and swallowed)
    Applied,
    /// Dropped by the debounce filter as an echo
    Suppressed,
    /// The path matches the ignore list
    Ignored,
}

/// A synchronized directory plus the debounce slot guarding it
///
/// Shared between the watcher path and every receive loop touching this
/// root, so an applied change is recognized when the watcher reports it.
#[derive(Debug)]
pub struct LocalTree {
    root: PathBuf,
    ignore: IgnoreList,
    debouncer: Debouncer,
}

impl LocalTree {
    pub fn new(root: impl Into<PathBuf>, ignore: IgnoreList, debouncer: Debouncer) -> Self {
        Self {
            root: root.into(),
            ignore,
            debouncer,
        }
    }

    /// Create the configured root if missing and anchor the tree at its
    /// canonical path, so watcher paths strip cleanly against it
    pub async fn open(config: &SyncConfig) -> SyncResult<Self> {
        tokio::fs::create_dir_all(&config.root).await?;
        let root = tokio::fs::canonicalize(&config.root).await?;
        Ok(Self::new(
            root,
            config.ignore_list(),
            Debouncer::new(config.debounce_window()),
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ignore(&self) -> &IgnoreList {
        &self.ignore
    }

    pub fn debouncer(&self) -> &Debouncer {
        &self.debouncer
    }

    /// Apply a change received from a peer.
    ///
    /// The debounce slot is updated before the filesystem is touched so the
    /// watcher event caused by this mutation is suppressed. Rename and
    /// delete failures are logged and swallowed; a failed write is returned
    /// as [`SyncError::Apply`].
    pub async fn apply(&self, event: &ChangeEvent) -> SyncResult<ApplyOutcome> {
        if self.is_ignored(event) {
            debug!(%event, "Ignoring change for ignored path");
            return Ok(ApplyOutcome::Ignored);
        }

        if self
            .debouncer
            .check_and_record(event.debounce_path(), Instant::now())
        {
            debug!(%event, "Suppressed echo of recent change");
            return Ok(ApplyOutcome::Suppressed);
        }

        match event {
            ChangeEvent::Moved { from, to } => {
                let src = from.resolve(&self.root);
                let dst = to.resolve(&self.root);
                if let Err(e) = self.ensure_parent(&dst).await {
                    warn!(%from, %to, error = %e, "Failed to create destination directory");
                }
                match tokio::fs::rename(&src, &dst).await {
                    Ok(()) => info!(%from, %to, "Recv: file moved"),
                    Err(e) => warn!(%from, %to, error = %e, "Error while moving a file"),
                }
            }
            ChangeEvent::Deleted { path } => {
                match tokio::fs::remove_file(path.resolve(&self.root)).await {
                    Ok(()) => info!(%path, "Recv: file deleted"),
                    Err(e) => warn!(%path, error = %e, "Error while deleting a file"),
                }
            }
            ChangeEvent::Modified { path, content } => {
                let local = path.resolve(&self.root);
                let apply_err = |source: std::io::Error| SyncError::Apply {
                    action: event.action(),
                    path: local.clone(),
                    source,
                };
                self.ensure_parent(&local).await.map_err(apply_err)?;
                tokio::fs::write(&local, content).await.map_err(apply_err)?;
                info!(%path, len = content.len(), "Recv: file modified");
            }
        }

        Ok(ApplyOutcome::Applied)
    }

    fn is_ignored(&self, event: &ChangeEvent) -> bool {
        match event {
            ChangeEvent::Moved { from, to } => {
                self.ignore.matches(from.as_str()) || self.ignore.matches(to.as_str())
            }
            other => self.ignore.matches(other.debounce_path().as_str()),
        }
    }

    async fn ensure_parent(&self, path: &Path) -> std::io::Result<()> {
        match path.parent() {
            Some(parent) => tokio::fs::create_dir_all(parent).await,
            None => Ok(()),
        }
    }
}
