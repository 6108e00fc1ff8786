//! Peer side: one connection to the hub
//!
//! After the bootstrap two flows share the channel. Local changes detected
//! by the watcher are sent to the hub from a background task. The receive
//! loop applies changes pushed by the hub and keeps a budget of consecutive
//! failures: any error counts, any success resets the count, and the loop
//! gives up once the count exceeds [`MAX_CONSECUTIVE_ERRORS`].

use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::bootstrap::join_hub;
use super::frame::{FrameReader, FrameWriter};
use super::protocol::read_change;
use super::session::{BoxedWriter, PeerSession};
use super::tree::LocalTree;
use super::watcher::{ChangeDetector, WatchEvent};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::types::SessionRole;

/// Consecutive receive errors tolerated before the client stops
pub const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// A bootstrapped connection to the hub
pub struct ClientSession<R = OwnedReadHalf> {
    tree: Arc<LocalTree>,
    session: Arc<PeerSession>,
    reader: FrameReader<R>,
    cancel: CancellationToken,
}

impl ClientSession<OwnedReadHalf> {
    /// Connect to the configured hub and run the bootstrap.
    ///
    /// The local root is reset before the secret is sent. On success the
    /// root mirrors the hub's snapshot.
    pub async fn connect(config: &SyncConfig) -> SyncResult<Self> {
        config.validate()?;
        let tree = Arc::new(LocalTree::open(config).await?);

        let addr = config.address();
        info!(%addr, "Connecting to hub");
        let stream = TcpStream::connect(&addr).await.map_err(|e| {
            SyncError::ChannelBroken(format!("failed to connect to {}: {}", addr, e))
        })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer: FrameWriter<BoxedWriter> = FrameWriter::new(Box::new(write_half));
        join_hub(&mut reader, &mut writer, config.password.as_bytes(), &tree).await?;

        let session = Arc::new(PeerSession::from_writer(SessionRole::ClientSide, addr, writer));
        info!(session = %session.id(), role = %session.role(), "Connected to hub");
        Ok(Self::from_parts(tree, session, reader))
    }
}

impl<R: AsyncRead + Unpin> ClientSession<R> {
    /// Assemble a session from an already bootstrapped channel
    pub fn from_parts(tree: Arc<LocalTree>, session: Arc<PeerSession>, reader: FrameReader<R>) -> Self {
        Self {
            tree,
            session,
            reader,
            cancel: CancellationToken::new(),
        }
    }

    pub fn tree(&self) -> &Arc<LocalTree> {
        &self.tree
    }

    /// Token that stops [`ClientSession::run`] cleanly when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until cancelled or until the error budget is exhausted.
    ///
    /// With `watch` set, local changes are forwarded to the hub from a
    /// background task that stops together with the receive loop.
    pub async fn run(mut self, watch: Option<mpsc::UnboundedReceiver<WatchEvent>>) -> SyncResult<()> {
        let outbound = watch.map(|events| {
            tokio::spawn(forward_local(
                ChangeDetector::new(self.tree.clone()),
                self.session.clone(),
                events,
                self.cancel.clone(),
            ))
        });

        let result = self.receive_loop().await;

        self.cancel.cancel();
        if let Some(task) = outbound {
            task.abort();
        }
        self.session.close().await;
        result
    }

    async fn receive_loop(&mut self) -> SyncResult<()> {
        let mut errors: u32 = 0;
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Client stopped");
                    return Ok(());
                }
                received = read_change(&mut self.reader) => received,
            };

            let handled = match received {
                Ok(event) => self.tree.apply(&event).await.map(|_| ()),
                Err(e) => Err(e),
            };

            match handled {
                Ok(()) => errors = 0,
                Err(e) => {
                    errors += 1;
                    error!(error = %e, errors, "Error while handling a message");
                    if errors > MAX_CONSECUTIVE_ERRORS {
                        error!("Too many errors, exiting");
                        return Err(SyncError::ErrorBudgetExhausted { errors });
                    }
                }
            }
        }
    }
}

async fn forward_local(
    detector: ChangeDetector,
    session: Arc<PeerSession>,
    mut events: mpsc::UnboundedReceiver<WatchEvent>,
    cancel: CancellationToken,
) {
    loop {
        let raw = tokio::select! {
            _ = cancel.cancelled() => break,
            raw = events.recv() => match raw {
                Some(raw) => raw,
                None => break,
            },
        };

        if let Some(change) = detector.detect(raw).await {
            if let Err(e) = session.send(&change).await {
                error!(%change, error = %e, "Failed to send change to hub");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::debounce::Debouncer;
    use crate::sync::protocol::write_change;
    use crate::sync::watcher::WatchKind;
    use crate::types::{ChangeEvent, IgnoreList, RelativePath};
    use bytes::Bytes;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    struct FakeHub {
        outbox: FrameWriter<WriteHalf<DuplexStream>>,
        inbox: FrameReader<ReadHalf<DuplexStream>>,
    }

    fn client(dir: &TempDir) -> (ClientSession<ReadHalf<DuplexStream>>, FakeHub) {
        let (client_end, hub_end) = duplex(64 * 1024);
        let (client_r, client_w) = split(client_end);
        let (hub_r, hub_w) = split(hub_end);

        let tree = Arc::new(LocalTree::new(
            dir.path(),
            IgnoreList::new([".git"]),
            Debouncer::new(Duration::from_millis(100)),
        ));
        let session = Arc::new(PeerSession::new(SessionRole::ClientSide, "hub", client_w));
        (
            ClientSession::from_parts(tree, session, FrameReader::new(client_r)),
            FakeHub {
                outbox: FrameWriter::new(hub_w),
                inbox: FrameReader::new(hub_r),
            },
        )
    }

    async fn send_garbage(hub: &mut FakeHub, count: usize) {
        for _ in 0..count {
            hub.outbox.send(b"BOGUS|x").await.unwrap();
        }
    }

    async fn wait_for_file(path: &std::path::Path) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !path.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("file never appeared");
    }

    #[tokio::test]
    async fn test_eleven_consecutive_errors_stop_the_client() {
        let dir = TempDir::new().unwrap();
        let (session, mut hub) = client(&dir);

        send_garbage(&mut hub, 11).await;

        let result = tokio::time::timeout(Duration::from_secs(5), session.run(None))
            .await
            .unwrap();
        assert!(matches!(
            result,
            Err(SyncError::ErrorBudgetExhausted { errors: 11 })
        ));
    }

    #[tokio::test]
    async fn test_success_resets_error_budget() {
        let dir = TempDir::new().unwrap();
        let (session, mut hub) = client(&dir);
        let running = tokio::spawn(session.run(None));

        send_garbage(&mut hub, 9).await;
        write_change(
            &mut hub.outbox,
            &ChangeEvent::Modified {
                path: RelativePath::parse("one.txt").unwrap(),
                content: Bytes::from_static(b"1"),
            },
        )
        .await
        .unwrap();
        send_garbage(&mut hub, 10).await;
        write_change(
            &mut hub.outbox,
            &ChangeEvent::Modified {
                path: RelativePath::parse("two.txt").unwrap(),
                content: Bytes::from_static(b"2"),
            },
        )
        .await
        .unwrap();

        wait_for_file(&dir.path().join("two.txt")).await;
        assert!(!running.is_finished());
        assert_eq!(std::fs::read(dir.path().join("one.txt")).unwrap(), b"1");

        send_garbage(&mut hub, 11).await;
        let result = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            result,
            Err(SyncError::ErrorBudgetExhausted { errors: 11 })
        ));
    }

    #[tokio::test]
    async fn test_closed_channel_exhausts_budget() {
        let dir = TempDir::new().unwrap();
        let (session, hub) = client(&dir);
        drop(hub);

        let result = tokio::time::timeout(Duration::from_secs(5), session.run(None))
            .await
            .unwrap();
        assert!(matches!(result, Err(SyncError::ErrorBudgetExhausted { .. })));
    }

    #[tokio::test]
    async fn test_cancellation_stops_cleanly() {
        let dir = TempDir::new().unwrap();
        let (session, _hub) = client(&dir);
        let token = session.cancellation_token();

        let running = tokio::spawn(session.run(None));
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_local_change_is_sent_to_hub() {
        let dir = TempDir::new().unwrap();
        let (session, mut hub) = client(&dir);
        std::fs::write(dir.path().join("draft.md"), b"# title").unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let _running = tokio::spawn(session.run(Some(rx)));
        tx.send(WatchEvent::new(WatchKind::Modified, dir.path().join("draft.md")))
            .unwrap();

        let change = tokio::time::timeout(Duration::from_secs(5), read_change(&mut hub.inbox))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            change,
            ChangeEvent::Modified {
                path: RelativePath::parse("draft.md").unwrap(),
                content: Bytes::from_static(b"# title"),
            }
        );
    }
}
