//! Hub: accepts peers, bootstraps them and relays every change
//!
//! Each accepted connection gets its own task. A connection joins the
//! broadcast set only after its snapshot has been sent. Changes received
//! from one session are applied to the hub's own tree and forwarded to
//! every other session; changes detected locally go to all sessions.
//!
//! Fan-out sends to all targets concurrently. A session whose send fails is
//! removed from the set right away and the remaining deliveries continue.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::join_all;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bootstrap::accept_peer;
use super::frame::{FrameReader, FrameWriter};
use super::protocol::read_change;
use super::session::{BoxedWriter, PeerSession};
use super::tree::{ApplyOutcome, LocalTree};
use super::watcher::{ChangeDetector, WatchEvent};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::types::{ChangeEvent, SessionId, SessionRole};

/// The central relay process
///
/// Cheap to clone; clones share the listener, the tree and the session set.
#[derive(Clone)]
pub struct Hub {
    listener: Arc<TcpListener>,
    tree: Arc<LocalTree>,
    secret: Arc<[u8]>,
    sessions: Arc<Mutex<HashMap<SessionId, Arc<PeerSession>>>>,
    cancel: CancellationToken,
}

impl Hub {
    /// Open the sync root and bind the listening socket
    pub async fn bind(config: &SyncConfig) -> SyncResult<Self> {
        config.validate()?;
        let tree = LocalTree::open(config).await?;
        let listener = TcpListener::bind(config.address()).await?;

        info!(
            addr = %listener.local_addr()?,
            root = %tree.root().display(),
            "Hub listening"
        );

        Ok(Self {
            listener: Arc::new(listener),
            tree: Arc::new(tree),
            secret: Arc::from(config.password.as_bytes()),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SyncResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn tree(&self) -> &Arc<LocalTree> {
        &self.tree
    }

    /// Token cancelled by [`Hub::shutdown`]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Number of sessions currently in the broadcast set
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Accept connections until shutdown.
    ///
    /// A failed accept is logged and the loop keeps going.
    pub async fn run(&self) -> SyncResult<()> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Hub stopped accepting connections");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        info!(%addr, "Peer connected");
                        let hub = self.clone();
                        tokio::spawn(async move { hub.handle_connection(stream, addr).await });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
            }
        }
    }

    async fn handle_connection(self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%addr, error = %e, "Failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer: FrameWriter<BoxedWriter> = FrameWriter::new(Box::new(write_half));

        if let Err(e) = accept_peer(&mut reader, &mut writer, &self.secret, &self.tree).await {
            warn!(%addr, error = %e, "Bootstrap failed, dropping connection");
            return;
        }

        let session = Arc::new(PeerSession::from_writer(
            SessionRole::HubSide,
            addr.to_string(),
            writer,
        ));
        self.register(session.clone()).await;
        self.serve_session(session, reader).await;
    }

    /// Add a bootstrapped session to the broadcast set
    pub(crate) async fn register(&self, session: Arc<PeerSession>) {
        let id = session.id();
        let count = {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(id, session.clone());
            sessions.len()
        };
        info!(session = %id, peer = session.peer(), sessions = count, "Session joined");
    }

    /// Receive loop for one session; evicts it on the first fatal error.
    ///
    /// The loop also ends as soon as the session is evicted elsewhere, so
    /// nothing it reads after removal is applied or relayed.
    pub(crate) async fn serve_session<R>(&self, session: Arc<PeerSession>, mut reader: FrameReader<R>)
    where
        R: AsyncRead + Unpin,
    {
        let id = session.id();
        loop {
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = session.closed() => {
                    debug!(session = %id, "Session closed, stopping receive loop");
                    break;
                }
                received = read_change(&mut reader) => received,
            };
            if !session.is_alive() {
                break;
            }

            let handled = match received {
                Ok(event) => self.handle_inbound(id, event).await,
                Err(e) => Err(e),
            };

            match handled {
                Ok(()) => {}
                Err(e) if !e.is_fatal_to_session() => {
                    warn!(session = %id, error = %e, "Failed to apply change");
                }
                Err(SyncError::ChannelBroken(reason)) => {
                    info!(session = %id, %reason, "Peer disconnected");
                    break;
                }
                Err(e) => {
                    error!(session = %id, error = %e, "Error while handling a message, removing client");
                    break;
                }
            }
        }
        self.evict(id).await;
    }

    /// Apply locally, then forward. A failed apply is still forwarded and
    /// reported to the caller afterwards.
    async fn handle_inbound(&self, origin: SessionId, event: ChangeEvent) -> SyncResult<()> {
        debug!(session = %origin, %event, "Received change");
        let applied = self.tree.apply(&event).await;
        if let Ok(ApplyOutcome::Suppressed | ApplyOutcome::Ignored) = applied {
            return Ok(());
        }
        self.broadcast(&event, Some(origin)).await;
        applied.map(|_| ())
    }

    /// Send `event` to every session except `exclude`.
    ///
    /// Returns the number of successful deliveries. Failed sessions are
    /// evicted as soon as their send fails.
    pub async fn broadcast(&self, event: &ChangeEvent, exclude: Option<SessionId>) -> usize {
        let targets: Vec<Arc<PeerSession>> = self
            .sessions
            .lock()
            .await
            .values()
            .filter(|s| Some(s.id()) != exclude)
            .cloned()
            .collect();

        let deliveries = targets.iter().map(|session| async move {
            match session.send(event).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(session = %session.id(), error = %e, "Send failed, evicting session");
                    self.evict(session.id()).await;
                    false
                }
            }
        });

        join_all(deliveries)
            .await
            .into_iter()
            .filter(|delivered| *delivered)
            .count()
    }

    async fn evict(&self, id: SessionId) {
        let removed = self.sessions.lock().await.remove(&id);
        if let Some(session) = removed {
            session.close().await;
            info!(session = %id, peer = session.peer(), "Session removed");
        }
    }

    /// Forward local filesystem changes to all sessions until shutdown or
    /// until the watcher stream ends
    pub async fn watch_local(&self, mut events: mpsc::UnboundedReceiver<WatchEvent>) {
        let detector = ChangeDetector::new(self.tree.clone());
        loop {
            let raw = tokio::select! {
                _ = self.cancel.cancelled() => break,
                raw = events.recv() => match raw {
                    Some(raw) => raw,
                    None => break,
                },
            };

            if let Some(change) = detector.detect(raw).await {
                let delivered = self.broadcast(&change, None).await;
                debug!(%change, delivered, "Broadcast local change");
            }
        }
    }

    /// Stop accepting, end every receive loop and close all sessions
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let sessions: Vec<Arc<PeerSession>> =
            self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
        info!("Hub shut down");
    }
}
