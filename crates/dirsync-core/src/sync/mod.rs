//! Replication layer
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Hub (one per deployment)                                    │
//! │  ├── TcpListener, one task per accepted peer                 │
//! │  ├── bootstrap: secret check, gzip tar snapshot              │
//! │  ├── session set (tokio Mutex), concurrent fan-out           │
//! │  └── LocalTree: apply inbound, watch local                   │
//! │                                                              │
//! │  ClientSession (one per peer process)                        │
//! │  ├── bootstrap: reset root, send secret, extract snapshot    │
//! │  ├── receive loop with consecutive error budget              │
//! │  └── forward local watcher changes to the hub                │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Protocol
//!
//! Every message is one or two length-prefixed frames. The first frame is a
//! UTF-8 header whose fields are separated by `|`:
//!
//! - **`MOVED|from|to`**: rename within the root
//! - **`DELETED|path`**: remove a file
//! - **`FILE_MODIFIED|path`**: followed by a frame with the full content
//!
//! Paths are relative to the sync root and use `/` as separator.
//!
//! ## Echo suppression
//!
//! Applying a received change triggers the local watcher. A single-slot
//! [`Debouncer`] shared by the watcher path and the receive path drops the
//! echo when it names the same path within the debounce window.

pub mod archive;
pub mod bootstrap;
pub mod client;
pub mod debounce;
pub mod frame;
pub mod hub;
pub mod protocol;
pub mod retry;
pub mod session;
pub mod tree;
pub mod watcher;

pub use archive::{build_snapshot, extract_snapshot, reset_root};
pub use bootstrap::{accept_peer, join_hub, REJECT_MARKER};
pub use client::{ClientSession, MAX_CONSECUTIVE_ERRORS};
pub use debounce::{Debouncer, DEFAULT_WINDOW};
pub use frame::{FrameReader, FrameWriter, CHUNK_SIZE, LENGTH_PREFIX_LEN};
pub use hub::Hub;
pub use protocol::{read_change, write_change, Header};
pub use retry::{read_with_retry, MAX_READ_ATTEMPTS};
pub use session::{BoxedWriter, PeerSession};
pub use tree::{ApplyOutcome, LocalTree};
pub use watcher::{
    map_notify_event, ChangeDetector, LocalWatcher, RenamePairer, WatchEvent, WatchKind,
    RENAME_PAIR_WINDOW,
};
