use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_core::Stream;
use serde::{Deserialize, Serialize};

use crate::{BlobError, BlobResult, BlockLog, PrefetchConfig};

/// Stream of bytes fed into a write pipeline
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Stream of blob chunks produced by a read pipeline
pub type BlobStream = Pin<Box<dyn Stream<Item = BlobResult<Bytes>> + Send>>;

/// Placement of a blob inside the log.
///
/// The identifier is plain data: it never changes after a write commits and it
/// is the only thing needed to address the blob's bytes again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobId {
    pub byte_offset: u64,
    pub byte_length: u64,
    pub block_offset: u64,
    pub block_length: u64,
}

impl BlobId {
    pub fn new(byte_offset: u64, byte_length: u64, block_offset: u64, block_length: u64) -> Self {
        Self {
            byte_offset,
            byte_length,
            block_offset,
            block_length,
        }
    }

    /// One past the last block of the blob
    pub fn block_end(&self) -> u64 {
        self.block_offset + self.block_length
    }

    /// One past the last byte of the blob, in log byte space
    pub fn byte_end(&self) -> u64 {
        self.byte_offset + self.byte_length
    }

    /// Whether `index` is one of this blob's blocks
    pub fn contains_block(&self, index: u64) -> bool {
        index >= self.block_offset && index < self.block_end()
    }

    pub fn is_empty(&self) -> bool {
        self.byte_length == 0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "blocks {}+{} bytes {}+{}",
            self.block_offset, self.block_length, self.byte_offset, self.byte_length
        )
    }
}

/// Lifecycle of a read or write pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Opening,
    Streaming,
    Finalizing,
    Closed,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Byte window requested from a blob, relative to the blob's first byte
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteRange {
    pub start: Option<u64>,
    pub length: Option<u64>,
    /// Inclusive
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn is_whole(&self) -> bool {
        self.start.is_none() && self.length.is_none() && self.end.is_none()
    }

    /// Resolve to an absolute `[pos, end)` window in log byte space
    pub fn resolve(&self, id: &BlobId) -> BlobResult<(u64, u64)> {
        let start = self.start.unwrap_or(0);
        if start > 0 && start >= id.byte_length {
            return Err(BlobError::invalid_range(format!(
                "start {} is outside blob of {} bytes",
                start, id.byte_length
            )));
        }

        let end = match (self.length, self.end) {
            (Some(length), _) => {
                let end = start.checked_add(length).unwrap_or(u64::MAX);
                if end > id.byte_length {
                    return Err(BlobError::invalid_range(format!(
                        "{} bytes from {} overrun blob of {} bytes",
                        length, start, id.byte_length
                    )));
                }
                end
            }
            (None, Some(end)) => {
                if end < start || end >= id.byte_length {
                    return Err(BlobError::invalid_range(format!(
                        "end {} is outside {}..{}",
                        end, start, id.byte_length
                    )));
                }
                end + 1
            }
            (None, None) => id.byte_length,
        };

        Ok((id.byte_offset + start, id.byte_offset + end))
    }
}

/// Options for `get` and read streams
#[derive(Clone)]
pub struct ReadOptions {
    pub range: ByteRange,
    /// Suspend on blocks that are not yet local
    pub wait: bool,
    /// Upper bound for any single suspended fetch or seek
    pub timeout: Option<Duration>,
    /// Overrides the adapter's prefetch rules for this read
    pub prefetch: Option<PrefetchConfig>,
    /// Read from this log instead of the adapter's own
    pub log: Option<Arc<dyn BlockLog>>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            range: ByteRange::default(),
            wait: true,
            timeout: None,
            prefetch: None,
            log: None,
        }
    }
}

impl fmt::Debug for ReadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadOptions")
            .field("range", &self.range)
            .field("wait", &self.wait)
            .field("timeout", &self.timeout)
            .field("prefetch", &self.prefetch)
            .field("custom_log", &self.log.is_some())
            .finish()
    }
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_start(mut self, start: u64) -> Self {
        self.range.start = Some(start);
        self
    }

    pub fn with_length(mut self, length: u64) -> Self {
        self.range.length = Some(length);
        self
    }

    /// Inclusive end byte, relative to the blob
    pub fn with_end(mut self, end: u64) -> Self {
        self.range.end = Some(end);
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.wait = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_prefetch(mut self, prefetch: PrefetchConfig) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    /// Read without a read-ahead window
    pub fn no_prefetch(self) -> Self {
        self.with_prefetch(PrefetchConfig::disabled())
    }

    pub fn with_log(mut self, log: Arc<dyn BlockLog>) -> Self {
        self.log = Some(log);
        self
    }
}

/// Options for `put` and write streams
#[derive(Clone, Default)]
pub struct WriteOptions {
    /// Overrides the adapter's block size for this blob
    pub block_size: Option<usize>,
    /// Append to this log instead of the adapter's own
    pub log: Option<Arc<dyn BlockLog>>,
}

impl fmt::Debug for WriteOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteOptions")
            .field("block_size", &self.block_size)
            .field("custom_log", &self.log.is_some())
            .finish()
    }
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = Some(block_size);
        self
    }

    pub fn with_log(mut self, log: Arc<dyn BlockLog>) -> Self {
        self.log = Some(log);
        self
    }
}

/// Options for `clear`
#[derive(Clone, Default)]
pub struct ClearOptions {
    pub log: Option<Arc<dyn BlockLog>>,
}

impl ClearOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(mut self, log: Arc<dyn BlockLog>) -> Self {
        self.log = Some(log);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob() -> BlobId {
        BlobId::new(100, 20, 7, 2)
    }

    #[test]
    fn whole_range_covers_blob() {
        assert_eq!(ByteRange::default().resolve(&blob()).unwrap(), (100, 120));
    }

    #[test]
    fn start_and_length() {
        let range = ByteRange {
            start: Some(8),
            length: Some(4),
            end: None,
        };
        assert_eq!(range.resolve(&blob()).unwrap(), (108, 112));
    }

    #[test]
    fn inclusive_end() {
        let range = ByteRange {
            start: Some(2),
            length: None,
            end: Some(4),
        };
        assert_eq!(range.resolve(&blob()).unwrap(), (102, 105));
    }

    #[test]
    fn out_of_bounds_is_invalid() {
        let past_start = ByteRange {
            start: Some(20),
            ..Default::default()
        };
        let past_end = ByteRange {
            end: Some(20),
            ..Default::default()
        };
        let overrun = ByteRange {
            start: Some(10),
            length: Some(11),
            end: None,
        };
        for range in [past_start, past_end, overrun] {
            let err = range.resolve(&blob()).unwrap_err();
            assert_eq!(err.code(), "INVALID_RANGE");
        }
    }

    #[test]
    fn empty_blob_resolves_to_empty_window() {
        let id = BlobId::new(5, 0, 1, 0);
        assert_eq!(ByteRange::default().resolve(&id).unwrap(), (5, 5));
    }

    #[test]
    fn id_serializes_camel_case() {
        let json = serde_json::to_value(blob()).unwrap();
        assert_eq!(json["byteOffset"], 100);
        assert_eq!(json["blockLength"], 2);
    }
}
