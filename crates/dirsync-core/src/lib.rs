//! dirsync core library
//!
//! Keeps a directory tree identical across machines. One hub holds the
//! authoritative copy; peers connect over TCP, receive a compressed snapshot
//! of the hub's tree and then exchange incremental changes (moves, deletes,
//! full-content modifications) through the hub.
//!
//! ## Quick Start
//!
//! ```ignore
//! use dirsync_core::{Hub, LocalWatcher, SyncConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig {
//!         root: "/srv/project".into(),
//!         password: "shared secret".into(),
//!         ..SyncConfig::default()
//!     };
//!
//!     let hub = Hub::bind(&config).await?;
//!     let (_watcher, events) = LocalWatcher::start(hub.tree().root())?;
//!
//!     let local = hub.clone();
//!     tokio::spawn(async move { local.watch_local(events).await });
//!     hub.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod sync;
pub mod types;

// Re-exports
pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use sync::{ClientSession, Hub, LocalTree, LocalWatcher};
pub use types::{ChangeEvent, IgnoreList, RelativePath, SessionId, SessionRole};
