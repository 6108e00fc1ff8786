//! Local filesystem watching
//!
//! [`LocalWatcher`] wraps a recursive `notify` watcher on the sync root and
//! forwards simplified [`WatchEvent`]s over a channel. [`ChangeDetector`]
//! turns those raw events into outbound [`ChangeEvent`]s: it drops ignored
//! paths and directory events, rechecks deletes, applies the debounce filter
//! and reads modified content with retries.
//!
//! OS events are not coalesced here; duplicates are left to the debounce
//! filter. The one exception is renames: backends that report a rename as
//! tracked halves followed by a combined event are paired by
//! [`RenamePairer`] so a rename inside the root reaches peers as one move.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::retry::read_with_retry;
use super::tree::LocalTree;
use crate::error::SyncResult;
use crate::types::{ChangeEvent, RelativePath};

/// Simplified kind of a raw filesystem event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

/// A raw filesystem event on an absolute local path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchKind,
    pub path: PathBuf,
    /// Destination, for moves only
    pub dest_path: Option<PathBuf>,
    pub is_directory: bool,
}

impl WatchEvent {
    pub fn new(kind: WatchKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            dest_path: None,
            is_directory: false,
        }
    }

    pub fn moved(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            kind: WatchKind::Moved,
            path: from.into(),
            dest_path: Some(to.into()),
            is_directory: false,
        }
    }

    pub fn directory(mut self) -> Self {
        self.is_directory = true;
        self
    }
}

/// How long a tracked rename source waits for its destination before it is
/// reported as a delete
pub const RENAME_PAIR_WINDOW: Duration = Duration::from_millis(100);

/// Translate a `notify` event into zero or more [`WatchEvent`]s.
///
/// A rename half seen on its own becomes a delete of the source or a
/// creation of the destination. Tracked halves are paired up front by
/// [`RenamePairer`].
pub fn map_notify_event(event: &notify::Event) -> Vec<WatchEvent> {
    let each = |kind: WatchKind, is_dir: &dyn Fn(&Path) -> bool| -> Vec<WatchEvent> {
        event
            .paths
            .iter()
            .map(|p| WatchEvent {
                kind,
                path: p.clone(),
                dest_path: None,
                is_directory: is_dir(p.as_path()),
            })
            .collect()
    };

    match &event.kind {
        EventKind::Create(kind) => {
            let folder = matches!(kind, CreateKind::Folder);
            each(WatchKind::Created, &|p: &Path| folder || p.is_dir())
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            vec![WatchEvent {
                kind: WatchKind::Moved,
                path: event.paths[0].clone(),
                dest_path: Some(event.paths[1].clone()),
                is_directory: event.paths[1].is_dir(),
            }]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            each(WatchKind::Deleted, &|_: &Path| false)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            each(WatchKind::Created, &|p: &Path| p.is_dir())
        }
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .map(|p| {
                let kind = if p.exists() {
                    WatchKind::Created
                } else {
                    WatchKind::Deleted
                };
                WatchEvent {
                    kind,
                    path: p.clone(),
                    dest_path: None,
                    is_directory: p.is_dir(),
                }
            })
            .collect(),
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => each(WatchKind::Modified, &|p: &Path| p.is_dir()),
        EventKind::Remove(kind) => {
            let folder = matches!(kind, RemoveKind::Folder);
            each(WatchKind::Deleted, &|_: &Path| folder)
        }
        _ => Vec::new(),
    }
}

/// Pairs tracked rename halves into a single move.
///
/// inotify reports a rename as a tracked source half, a tracked destination
/// half and then a combined event carrying both paths. The halves are held
/// back until the combined event arrives. A source half that is never
/// completed (moved out of the root) is released as a delete after
/// [`RENAME_PAIR_WINDOW`]; a destination half with no known source (moved
/// into the root) is reported as a creation right away.
#[derive(Debug, Default)]
pub struct RenamePairer {
    pending: HashMap<usize, (Vec<PathBuf>, Instant)>,
}

impl RenamePairer {
    pub fn push(&mut self, event: &notify::Event, now: Instant) -> Vec<WatchEvent> {
        let tracker = match (&event.kind, event.tracker()) {
            (EventKind::Modify(ModifyKind::Name(_)), Some(tracker)) => tracker,
            _ => return map_notify_event(event),
        };

        match &event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                self.pending.insert(tracker, (event.paths.clone(), now));
                Vec::new()
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To))
                if self.pending.contains_key(&tracker) =>
            {
                Vec::new()
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                self.pending.remove(&tracker);
                map_notify_event(event)
            }
            _ => map_notify_event(event),
        }
    }

    /// Release sources whose destination never showed up
    pub fn expire(&mut self, now: Instant) -> Vec<WatchEvent> {
        let mut released = Vec::new();
        self.pending.retain(|_, (paths, since)| {
            if now.saturating_duration_since(*since) < RENAME_PAIR_WINDOW {
                return true;
            }
            released.extend(paths.drain(..).map(|p| WatchEvent::new(WatchKind::Deleted, p)));
            false
        });
        released
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|(_, since)| *since + RENAME_PAIR_WINDOW)
            .min()
    }
}

async fn pair_renames(
    mut raw: mpsc::UnboundedReceiver<notify::Event>,
    out: mpsc::UnboundedSender<WatchEvent>,
) {
    let mut pairer = RenamePairer::default();
    loop {
        for released in pairer.expire(Instant::now()) {
            if out.send(released).is_err() {
                return;
            }
        }

        let event = match pairer.next_deadline() {
            Some(deadline) => tokio::select! {
                event = raw.recv() => event,
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => continue,
            },
            None => raw.recv().await,
        };
        let Some(event) = event else {
            return;
        };

        for mapped in pairer.push(&event, Instant::now()) {
            // receiver gone means the session is shutting down
            if out.send(mapped).is_err() {
                return;
            }
        }
    }
}

/// Recursive watcher on the sync root; dropping it stops the events
pub struct LocalWatcher {
    _watcher: RecommendedWatcher,
}

impl LocalWatcher {
    /// Start watching `root`, returning the event stream.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(root: &Path) -> SyncResult<(Self, mpsc::UnboundedReceiver<WatchEvent>)> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    let _ = raw_tx.send(event);
                }
                Err(e) => warn!(error = %e, "Watch error"),
            }
        })?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        tokio::spawn(pair_renames(raw_rx, tx));
        info!(root = %root.display(), "Watching sync root");

        Ok((Self { _watcher: watcher }, rx))
    }
}

/// Converts raw watcher events into outbound change events
#[derive(Clone)]
pub struct ChangeDetector {
    tree: Arc<LocalTree>,
}

impl ChangeDetector {
    pub fn new(tree: Arc<LocalTree>) -> Self {
        Self { tree }
    }

    fn relative(&self, local: &Path) -> Option<RelativePath> {
        match RelativePath::from_local(self.tree.root(), local) {
            Ok(rel) if !self.tree.ignore().matches(rel.as_str()) => Some(rel),
            Ok(_) => None,
            Err(e) => {
                debug!(path = %local.display(), error = %e, "Skipping event outside sync root");
                None
            }
        }
    }

    /// Decide whether `event` must be sent to peers, and build it.
    ///
    /// Deletes pause for one debounce window and are dropped if the path
    /// reappeared (delete-then-recreate saves). Modifications read the full
    /// content; an unreadable file drops the event.
    pub async fn detect(&self, event: WatchEvent) -> Option<ChangeEvent> {
        let debouncer = self.tree.debouncer();

        match event.kind {
            WatchKind::Moved => {
                let from = self.relative(&event.path)?;
                let to = self.relative(event.dest_path.as_deref()?)?;
                if debouncer.check_and_record(&to, Instant::now()) {
                    return None;
                }
                info!(%from, %to, "File moved");
                Some(ChangeEvent::Moved { from, to })
            }
            WatchKind::Deleted => {
                if event.is_directory {
                    return None;
                }
                let path = self.relative(&event.path)?;
                // the echo check must use the time the delete was observed
                let seen = Instant::now();

                tokio::time::sleep(debouncer.window()).await;
                if tokio::fs::try_exists(&event.path).await.unwrap_or(false) {
                    debug!(%path, "Path reappeared, dropping delete");
                    return None;
                }
                if debouncer.check_and_record(&path, seen) {
                    return None;
                }
                info!(%path, "File deleted");
                Some(ChangeEvent::Deleted { path })
            }
            WatchKind::Created | WatchKind::Modified => {
                if event.is_directory || event.path.is_dir() {
                    return None;
                }
                let path = self.relative(&event.path)?;
                if debouncer.check_and_record(&path, Instant::now()) {
                    return None;
                }

                match read_with_retry(&event.path, &path, debouncer).await {
                    Ok(content) => {
                        info!(%path, len = content.len(), "File modified");
                        Some(ChangeEvent::Modified { path, content })
                    }
                    Err(e) => {
                        warn!(%path, error = %e, "Can't read file, giving up");
                        None
                    }
                }
            }
        }
    }
}
