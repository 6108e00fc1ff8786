//! Connection bootstrap: shared-secret check and full snapshot transfer
//!
//! ## Message Flow
//!
//! ```text
//! Peer                                   Hub
//!   |  (wipe local root, keep ignored)    |
//!   |--- frame: secret ------------------>|
//!   |                                     |  mismatch: raw "KO", close
//!   |<-- frame: gzip tar snapshot --------|  match: no explicit OK
//!   |  (extract into root)                |  (session joins broadcast set)
//! ```

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::spawn_blocking;
use tracing::{info, warn};

use super::archive::{build_snapshot, extract_snapshot, reset_root};
use super::frame::{FrameReader, FrameWriter};
use super::tree::LocalTree;
use crate::error::{SyncError, SyncResult};

/// Unframed reply sent by the hub before closing a rejected connection
pub const REJECT_MARKER: &[u8; 2] = b"KO";

fn join_err(e: tokio::task::JoinError) -> SyncError {
    SyncError::Archive(format!("snapshot task failed: {}", e))
}

/// Hub side: verify the peer's secret, then send the snapshot.
///
/// On mismatch the reject marker is written, the write direction is shut
/// down and `AuthenticationRejected` is returned.
pub async fn accept_peer<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    secret: &[u8],
    tree: &LocalTree,
) -> SyncResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let offered = reader.receive().await?;
    if offered != secret {
        warn!("Peer offered a wrong secret, rejecting");
        writer.send_unframed(REJECT_MARKER).await?;
        writer.close().await;
        return Err(SyncError::AuthenticationRejected);
    }

    let root = tree.root().to_path_buf();
    let ignore = tree.ignore().clone();
    let snapshot = spawn_blocking(move || build_snapshot(&root, &ignore))
        .await
        .map_err(join_err)??;

    info!(len = snapshot.len(), "Sending snapshot to peer");
    writer.send(&snapshot).await
}

/// Peer side: reset the local root, present the secret and install the
/// hub's snapshot.
///
/// The reset happens before the secret is sent, so a rejected attempt still
/// leaves the local root emptied.
pub async fn join_hub<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    secret: &[u8],
    tree: &LocalTree,
) -> SyncResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let root = tree.root().to_path_buf();
    let ignore = tree.ignore().clone();
    info!(root = %root.display(), "Deleting local files before bootstrap");
    spawn_blocking(move || reset_root(&root, &ignore))
        .await
        .map_err(join_err)??;

    writer.send(secret).await?;

    info!("Waiting for snapshot");
    let snapshot = reader
        .receive_unless_marker(REJECT_MARKER)
        .await?
        .ok_or(SyncError::AuthenticationRejected)?;

    info!(len = snapshot.len(), "Extracting snapshot");
    let root = tree.root().to_path_buf();
    spawn_blocking(move || extract_snapshot(&snapshot, &root))
        .await
        .map_err(join_err)??;
    info!("Snapshot extracted");
    Ok(())
}
