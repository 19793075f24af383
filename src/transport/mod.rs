//! Instrument link abstraction.
//!
//! A [`Transport`] is the byte channel to the profiler (serial or network).
//! Besides request/response commands it owns an observer list, exposed as a
//! `tokio::sync::broadcast` channel, over which file transfers report their
//! size, progress and completion. Subscribers receive every event published
//! after they subscribe; nothing needs to be unsubscribed.
//!
//! # Implementations
//! - [`mock::MockTransport`]: in-process instrument with scripted outcomes.
//! - `serial::SerialTransport` (feature `instrument_serial`): RS-232/USB link.

pub mod listing;
pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial;
pub mod xmodem;

use crate::error::AppResult;
use async_trait::async_trait;
use std::path::Path;
use tokio::sync::broadcast;

pub use listing::{parse_directory_listing, DirectoryEntry, DirectoryListing};

/// Command that halts any transfer in progress on the instrument.
pub const CANCEL_TRANSFER_CMD: &str = "DSCANCEL";

/// Command that requests the directory listing.
pub const DIRECTORY_CMD: &str = "DSDIR";

/// Command prefix that starts a file download.
pub const DOWNLOAD_CMD: &str = "DSXD";

/// Capacity of the per-transport event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Notification from an in-flight file transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Total size in bytes, once the instrument announces it.
    FileSize {
        /// File name on the instrument.
        name: String,
        /// Size in bytes.
        size: i64,
    },
    /// Bytes of `name` written to the destination so far.
    Progress {
        /// File name on the instrument.
        name: String,
        /// Running byte count.
        bytes_written: u64,
    },
    /// Transfer finished, successfully or not.
    Complete {
        /// File name on the instrument.
        name: String,
        /// Whether the whole file arrived.
        success: bool,
    },
}

impl TransportEvent {
    /// File the event refers to.
    pub fn name(&self) -> &str {
        match self {
            TransportEvent::FileSize { name, .. }
            | TransportEvent::Progress { name, .. }
            | TransportEvent::Complete { name, .. } => name,
        }
    }
}

/// Bidirectional link to the instrument.
///
/// # Contract
/// - `download_file` *starts* a transfer and reports whether the instrument
///   accepted it. The outcome arrives later as [`TransportEvent::Complete`];
///   an implementation may also finish the whole transfer before returning,
///   as long as the events are published.
/// - All methods take `&self`; implementations use interior mutability.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the link.
    async fn open(&self) -> AppResult<()>;

    /// Close the link. Closing a closed link is a no-op.
    async fn close(&self) -> AppResult<()>;

    /// Whether the link is currently open.
    fn is_open(&self) -> bool;

    /// Send a text command and return the instrument's reply.
    async fn send_command(&self, command: &str) -> AppResult<String>;

    /// Fetch the instrument's file directory.
    async fn request_directory_listing(&self) -> AppResult<DirectoryListing>;

    /// Start downloading `name` into `dest_dir/name`.
    ///
    /// Returns `Ok(false)` if the instrument refused the request.
    async fn download_file(&self, dest_dir: &Path, name: &str) -> AppResult<bool>;

    /// Subscribe to transfer events.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}
