use std::future::Future;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{BlobError, BlobResult, LogResult};

/// Append-only, block-addressed, replicable log that blobs are layered on.
///
/// Durability, replication and the presence bitfield all live behind this
/// trait; the blob layer only ever appends whole blocks and reads them back.
#[async_trait]
pub trait BlockLog: Send + Sync {
    /// Suspend until the log is usable
    async fn ready(&self) -> LogResult<()>;

    /// Committed block count
    fn length(&self) -> u64;

    /// Committed byte count
    fn byte_length(&self) -> u64;

    /// Durably add blocks at the current end
    async fn append(&self, blocks: Vec<Bytes>) -> LogResult<AppendRange>;

    /// Fetch one block; `None` when it is not present and `wait` is false
    async fn get(&self, index: u64, wait: bool) -> LogResult<Option<Bytes>>;

    /// Map an absolute byte offset to a block position inside `bounds`
    async fn seek(
        &self,
        byte_offset: u64,
        bounds: Range<u64>,
        wait: bool,
    ) -> LogResult<Option<SeekPosition>>;

    /// Request background replication of a block range
    fn download(&self, range: DownloadRange) -> DownloadHandle;

    /// Cancel a download requested earlier; unknown handles are ignored
    fn undownload(&self, handle: DownloadHandle);

    /// Drop local copies of `[start, end)`
    async fn clear(&self, start: u64, end: u64) -> LogResult<()>;

    /// Whether block `index` is present locally
    fn has(&self, index: u64) -> bool;

    /// First block at or after `from` that is not present locally
    fn first_unset(&self, from: u64) -> u64;

    /// Connected peer count
    fn peers(&self) -> usize;

    /// Register a listener for transfer and topology events
    fn listen(&self, listener: Arc<dyn LogListener>) -> ListenerId;

    /// Remove a listener; unknown ids are ignored
    fn unlisten(&self, id: ListenerId);
}

/// Receives log events synchronously from the emitting call
pub trait LogListener: Send + Sync {
    fn on_event(&self, event: &LogEvent);
}

/// Identifier of a registered [`LogListener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Handle of an active range download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DownloadHandle(pub u64);

/// Blocks committed by one append call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendRange {
    pub start: u64,
    pub end: u64,
}

/// Result of a seek: the block holding the byte and the offset inside it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekPosition {
    pub index: u64,
    pub relative_offset: u64,
}

/// Block range requested for background download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadRange {
    pub start: u64,
    pub end: u64,
    pub linear: bool,
}

/// Identity of a remote peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    /// Generate a new random peer ID
    pub fn new() -> Self {
        Self(format!("peer_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transfer and topology notifications emitted by a log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    PeerAdd {
        peer: PeerId,
    },
    PeerRemove {
        peer: PeerId,
    },
    /// A block was served to `peer`
    Upload {
        index: u64,
        bytes: u64,
        peer: PeerId,
    },
    /// A block was received from `peer`
    Download {
        index: u64,
        bytes: u64,
        peer: PeerId,
    },
}

impl LogEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::PeerAdd { .. } => "peer-add",
            Self::PeerRemove { .. } => "peer-remove",
            Self::Upload { .. } => "upload",
            Self::Download { .. } => "download",
        }
    }
}

/// View of a log scoped to one reader's `wait`/`timeout` options
pub struct LogSession {
    log: Arc<dyn BlockLog>,
    wait: bool,
    timeout: Option<Duration>,
    closed: bool,
}

impl LogSession {
    pub fn open(log: Arc<dyn BlockLog>, wait: bool, timeout: Option<Duration>) -> Self {
        Self {
            log,
            wait,
            timeout,
            closed: false,
        }
    }

    pub fn log(&self) -> &Arc<dyn BlockLog> {
        &self.log
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub async fn get(&self, index: u64) -> BlobResult<Option<Bytes>> {
        self.ensure_open()?;
        self.bounded(self.log.get(index, self.wait)).await
    }

    pub async fn seek(&self, byte_offset: u64, bounds: Range<u64>) -> BlobResult<Option<SeekPosition>> {
        self.ensure_open()?;
        self.bounded(self.log.seek(byte_offset, bounds, self.wait)).await
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    fn ensure_open(&self) -> BlobResult<()> {
        if self.closed {
            return Err(BlobError::invalid("log session is closed"));
        }
        Ok(())
    }

    async fn bounded<T, F>(&self, fut: F) -> BlobResult<T>
    where
        F: Future<Output = LogResult<T>>,
    {
        let result = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, fut)
                .await
                .map_err(|_| BlobError::timeout(timeout))?,
            None => fut.await,
        };
        result.map_err(BlobError::from)
    }
}
