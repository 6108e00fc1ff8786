//! Change message grammar
//!
//! Every change is a UTF-8 header frame of `|`-separated fields, followed
//! by a raw content frame for modifications only:
//!
//! ```text
//! MOVED|<from>|<to>
//! DELETED|<path>
//! FILE_MODIFIED|<path>     + one binary frame with the full file content
//! ```
//!
//! Headers are parsed into a strict [`Header`] right after framing; an
//! unknown action, a wrong field count or an invalid path is a
//! [`SyncError::ProtocolViolation`].

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use super::frame::{FrameReader, FrameWriter};
use crate::error::{SyncError, SyncResult};
use crate::types::{ChangeEvent, RelativePath, FIELD_SEPARATOR};

pub const ACTION_MOVED: &str = "MOVED";
pub const ACTION_DELETED: &str = "DELETED";
pub const ACTION_FILE_MODIFIED: &str = "FILE_MODIFIED";

/// A parsed header frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Moved { from: RelativePath, to: RelativePath },
    Deleted { path: RelativePath },
    /// Content follows in the next frame
    FileModified { path: RelativePath },
}

impl Header {
    /// Parse a header frame payload
    pub fn parse(frame: &[u8]) -> SyncResult<Self> {
        let text = std::str::from_utf8(frame)
            .map_err(|_| SyncError::ProtocolViolation("header is not valid UTF-8".into()))?;

        let fields: Vec<&str> = text.split(FIELD_SEPARATOR).collect();
        let (action, args) = fields
            .split_first()
            .ok_or_else(|| SyncError::ProtocolViolation("empty header".into()))?;

        let expected = match *action {
            ACTION_MOVED => 2,
            ACTION_DELETED | ACTION_FILE_MODIFIED => 1,
            other => {
                return Err(SyncError::ProtocolViolation(format!(
                    "unknown action '{}'",
                    truncate(other)
                )))
            }
        };
        if args.len() != expected {
            return Err(SyncError::ProtocolViolation(format!(
                "{} expects {} field(s), got {}",
                action,
                expected,
                args.len()
            )));
        }

        let path = |raw: &str| {
            RelativePath::parse(raw).map_err(|e| SyncError::ProtocolViolation(e.to_string()))
        };

        Ok(match *action {
            ACTION_MOVED => Header::Moved {
                from: path(args[0])?,
                to: path(args[1])?,
            },
            ACTION_DELETED => Header::Deleted {
                path: path(args[0])?,
            },
            _ => Header::FileModified {
                path: path(args[0])?,
            },
        })
    }

    /// Serialize to the wire text
    pub fn encode(&self) -> String {
        match self {
            Header::Moved { from, to } => format!("{}|{}|{}", ACTION_MOVED, from, to),
            Header::Deleted { path } => format!("{}|{}", ACTION_DELETED, path),
            Header::FileModified { path } => format!("{}|{}", ACTION_FILE_MODIFIED, path),
        }
    }
}

impl From<&ChangeEvent> for Header {
    fn from(event: &ChangeEvent) -> Self {
        match event {
            ChangeEvent::Moved { from, to } => Header::Moved {
                from: from.clone(),
                to: to.clone(),
            },
            ChangeEvent::Deleted { path } => Header::Deleted { path: path.clone() },
            ChangeEvent::Modified { path, .. } => Header::FileModified { path: path.clone() },
        }
    }
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(32) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Write every frame of one change message.
///
/// The caller must hold exclusive access to the writer for the whole call.
pub async fn write_change<W: AsyncWrite + Unpin>(
    writer: &mut FrameWriter<W>,
    event: &ChangeEvent,
) -> SyncResult<()> {
    writer.send(Header::from(event).encode().as_bytes()).await?;
    if let ChangeEvent::Modified { content, .. } = event {
        writer.send(content).await?;
    }
    Ok(())
}

/// Read one complete change message (one or two frames).
///
/// A rejected `FILE_MODIFIED` header still consumes its content frame so
/// the channel stays aligned on frame boundaries.
pub async fn read_change<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
) -> SyncResult<ChangeEvent> {
    let frame = reader.receive().await?;
    match Header::parse(&frame) {
        Ok(Header::Moved { from, to }) => Ok(ChangeEvent::Moved { from, to }),
        Ok(Header::Deleted { path }) => Ok(ChangeEvent::Deleted { path }),
        Ok(Header::FileModified { path }) => {
            let content = reader.receive().await?;
            Ok(ChangeEvent::Modified {
                path,
                content: Bytes::from(content),
            })
        }
        Err(e) => {
            let prefix = format!("{}{}", ACTION_FILE_MODIFIED, FIELD_SEPARATOR);
            if frame.starts_with(prefix.as_bytes()) {
                reader.receive().await?;
            }
            Err(e)
        }
    }
}
