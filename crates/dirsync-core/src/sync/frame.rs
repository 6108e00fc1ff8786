//! Length-prefixed framing over a byte stream
//!
//! ## Wire Format
//!
//! ```text
//! +-------------------+---------------------------+
//! | length (u32, BE)  | payload (length bytes)    |
//! +-------------------+---------------------------+
//! ```
//!
//! A zero-length payload is legal. The channel is frame-oriented: a logical
//! message made of two frames (header + file content) must be written by a
//! single owner of the [`FrameWriter`], which [`crate::sync::PeerSession`]
//! guarantees with a per-session lock.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{SyncError, SyncResult};

/// Size of the big-endian length prefix
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Maximum bytes handed to a single underlying write or read
pub const CHUNK_SIZE: usize = 32768;

fn broken(context: &str, e: std::io::Error) -> SyncError {
    SyncError::ChannelBroken(format!("{}: {}", context, e))
}

/// Reading half of a framed channel
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read one frame.
    ///
    /// Fails with `ChannelBroken` if the stream ends before the prefix or
    /// the payload is complete.
    pub async fn receive(&mut self) -> SyncResult<Vec<u8>> {
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        let read = self.fill(&mut prefix).await?;
        if read < LENGTH_PREFIX_LEN {
            return Err(SyncError::ChannelBroken(format!(
                "stream closed after {} of {} prefix bytes",
                read, LENGTH_PREFIX_LEN
            )));
        }
        self.receive_payload(u32::from_be_bytes(prefix) as usize)
            .await
    }

    /// Read one frame, unless the peer sent exactly `marker` unframed and
    /// closed the stream, in which case `None` is returned.
    ///
    /// Used for the bootstrap reply where a rejection is a bare marker
    /// instead of a frame.
    pub async fn receive_unless_marker(&mut self, marker: &[u8]) -> SyncResult<Option<Vec<u8>>> {
        debug_assert!(marker.len() < LENGTH_PREFIX_LEN);

        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        let read = self.fill(&mut prefix).await?;
        if read == LENGTH_PREFIX_LEN {
            let payload = self
                .receive_payload(u32::from_be_bytes(prefix) as usize)
                .await?;
            return Ok(Some(payload));
        }

        if &prefix[..read] == marker {
            Ok(None)
        } else {
            Err(SyncError::ChannelBroken(format!(
                "stream closed after {} of {} prefix bytes",
                read, LENGTH_PREFIX_LEN
            )))
        }
    }

    async fn receive_payload(&mut self, len: usize) -> SyncResult<Vec<u8>> {
        let mut payload = Vec::with_capacity(len.min(CHUNK_SIZE));
        while payload.len() < len {
            let start = payload.len();
            let want = (len - start).min(CHUNK_SIZE);
            payload.resize(start + want, 0);
            let n = self
                .inner
                .read(&mut payload[start..])
                .await
                .map_err(|e| broken("read failed", e))?;
            if n == 0 {
                return Err(SyncError::ChannelBroken(format!(
                    "stream closed after {} of {} payload bytes",
                    start, len
                )));
            }
            payload.truncate(start + n);
        }
        Ok(payload)
    }

    /// Read until `buf` is full or the stream ends; returns bytes read.
    async fn fill(&mut self, buf: &mut [u8]) -> SyncResult<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .inner
                .read(&mut buf[filled..])
                .await
                .map_err(|e| broken("read failed", e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

/// Writing half of a framed channel
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one frame: length prefix then payload in bounded chunks
    pub async fn send(&mut self, payload: &[u8]) -> SyncResult<()> {
        let len = u32::try_from(payload.len()).map_err(|_| {
            SyncError::ProtocolViolation(format!(
                "payload of {} bytes exceeds frame limit",
                payload.len()
            ))
        })?;

        self.write_checked(&len.to_be_bytes()).await?;
        for chunk in payload.chunks(CHUNK_SIZE) {
            self.write_checked(chunk).await?;
        }
        self.inner
            .flush()
            .await
            .map_err(|e| broken("flush failed", e))
    }

    /// Write bytes without a length prefix (bootstrap reject marker)
    pub async fn send_unframed(&mut self, bytes: &[u8]) -> SyncResult<()> {
        self.write_checked(bytes).await?;
        self.inner
            .flush()
            .await
            .map_err(|e| broken("flush failed", e))
    }

    /// Shut down the write direction; later sends fail
    pub async fn close(&mut self) {
        let _ = self.inner.shutdown().await;
    }

    async fn write_checked(&mut self, mut buf: &[u8]) -> SyncResult<()> {
        while !buf.is_empty() {
            let n = self
                .inner
                .write(buf)
                .await
                .map_err(|e| broken("write failed", e))?;
            if n == 0 {
                return Err(SyncError::ChannelBroken(
                    "write transferred zero bytes".into(),
                ));
            }
            buf = &buf[n..];
        }
        Ok(())
    }
}
