//! One live connection between the hub and a peer
//!
//! The session owns the writing half of the framed channel behind an async
//! lock. Every outbound message goes through [`PeerSession::send`], which
//! holds the lock for all frames of the message, so the watcher path and
//! the rebroadcast path can share one channel without interleaving a
//! `FILE_MODIFIED` header and its content frame.
//!
//! The reading half is owned by the single task running the receive loop.
//! That loop watches [`PeerSession::closed`] so a session removed by a
//! failed send or a shutdown stops being read from as well.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::frame::FrameWriter;
use super::protocol::write_change;
use crate::error::{SyncError, SyncResult};
use crate::types::{ChangeEvent, SessionId, SessionRole};

/// Type-erased writing half so hub sessions of any transport share a set
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct PeerSession {
    id: SessionId,
    role: SessionRole,
    /// Remote address, for logs
    peer: String,
    writer: Mutex<FrameWriter<BoxedWriter>>,
    alive: AtomicBool,
    closed: CancellationToken,
}

impl PeerSession {
    /// Wrap a raw writing half
    pub fn new<W>(role: SessionRole, peer: impl Into<String>, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::from_writer(role, peer, FrameWriter::new(Box::new(writer)))
    }

    /// Take over a framed writer already used for the bootstrap
    pub fn from_writer(
        role: SessionRole,
        peer: impl Into<String>,
        writer: FrameWriter<BoxedWriter>,
    ) -> Self {
        Self {
            id: SessionId::new(),
            role,
            peer: peer.into(),
            writer: Mutex::new(writer),
            alive: AtomicBool::new(true),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Resolves once the session is dead
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
        self.closed.cancel();
    }

    /// Send one change message atomically.
    ///
    /// Any failure marks the session dead; a dead session refuses further
    /// sends with `ChannelBroken`.
    pub async fn send(&self, event: &ChangeEvent) -> SyncResult<()> {
        let mut writer = self.writer.lock().await;
        if !self.is_alive() {
            return Err(SyncError::ChannelBroken(format!("{} is closed", self.id)));
        }

        match write_change(&mut writer, event).await {
            Ok(()) => {
                debug!(session = %self.id, %event, "Sent change");
                Ok(())
            }
            Err(e) => {
                self.mark_dead();
                Err(e)
            }
        }
    }

    /// Mark the session dead and shut down the write direction
    pub async fn close(&self) {
        self.mark_dead();
        self.writer.lock().await.close().await;
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("peer", &self.peer)
            .field("alive", &self.is_alive())
            .finish()
    }
}
