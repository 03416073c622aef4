use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::chunker;
use crate::log::BlockLog;
use crate::{BlobAdapter, BlobError, BlobId, BlobResult, ReadOptions};

/// Staged writes that become readable before they are appended.
///
/// Ids handed out by [`put`](Self::put) already point at the position the
/// blocks will occupy once [`flush`](Self::flush) commits them, so they stay
/// valid across the flush.
pub struct BlobBatch {
    adapter: BlobAdapter,
    log: Arc<dyn BlockLog>,
    lock: Arc<Mutex<()>>,
    block_size: usize,
    blocks: Vec<Bytes>,
    pending_bytes: u64,
    /// Log length when the first pending block was staged
    base: Option<(u64, u64)>,
    closed: bool,
}

impl BlobBatch {
    pub(crate) fn new(adapter: BlobAdapter, log: Arc<dyn BlockLog>, lock: Arc<Mutex<()>>) -> Self {
        let block_size = adapter.config().block_size;
        Self {
            adapter,
            log,
            lock,
            block_size,
            blocks: Vec::new(),
            pending_bytes: 0,
            base: None,
            closed: false,
        }
    }

    pub fn pending_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stage a blob and return the id it will have once flushed
    pub fn put(&mut self, data: &[u8]) -> BlobResult<BlobId> {
        self.ensure_open()?;

        let (length, byte_length) = (self.log.length(), self.log.byte_length());
        let base = *self.base.get_or_insert((length, byte_length));
        let blocks = chunker::chunk(data, self.block_size);

        let id = BlobId::new(
            base.1 + self.pending_bytes,
            data.len() as u64,
            base.0 + self.blocks.len() as u64,
            blocks.len() as u64,
        );
        self.pending_bytes += data.len() as u64;
        self.blocks.extend(blocks);
        Ok(id)
    }

    /// Read a blob, committed or still pending
    pub async fn get(&self, id: &BlobId, options: ReadOptions) -> BlobResult<Option<Bytes>> {
        self.ensure_open()?;

        let length = self.log.length();
        let base = match self.base {
            Some((base, _)) if base != length => {
                return Err(BlobError::invalid(format!(
                    "log grew from {} to {} blocks while the batch was pending",
                    base, length
                )));
            }
            Some((base, _)) => base,
            None => length,
        };
        if id.block_offset < base {
            return self.adapter.get(id, options.with_log(self.log.clone())).await;
        }

        let first = (id.block_offset - base) as usize;
        let last = (id.block_end() - base) as usize;
        let Some(blocks) = self.blocks.get(first..last) else {
            return Ok(None);
        };

        let mut buf = BytesMut::with_capacity(blocks.iter().map(Bytes::len).sum());
        for block in blocks {
            buf.extend_from_slice(block);
        }
        let data = buf.freeze();

        let (start, end) = options.range.resolve(id)?;
        let start = (start - id.byte_offset) as usize;
        let end = ((end - id.byte_offset) as usize).min(data.len());
        Ok(Some(data.slice(start.min(end)..end)))
    }

    /// Append every pending block in one call under the log's append lock
    pub async fn flush(&mut self) -> BlobResult<()> {
        self.ensure_open()?;
        if self.blocks.is_empty() {
            return Ok(());
        }

        self.log.ready().await?;
        let _guard = self.lock.lock().await;

        if let Some((length, _)) = self.base {
            if self.log.length() != length {
                return Err(BlobError::invalid(format!(
                    "log grew from {} to {} blocks while the batch was pending",
                    length,
                    self.log.length()
                )));
            }
        }

        let count = self.blocks.len();
        match self.log.append(self.blocks.clone()).await {
            Ok(range) => {
                debug!("Batch flushed blocks {}..{}", range.start, range.end);
                self.blocks.clear();
                self.pending_bytes = 0;
                self.base = None;
                Ok(())
            }
            Err(err) => {
                warn!("Batch flush of {} blocks failed: {}", count, err);
                Err(BlobError::append_failed(err))
            }
        }
    }

    /// Discard pending blocks; the batch is unusable afterwards
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        if !self.blocks.is_empty() {
            debug!("Batch closed with {} unflushed blocks", self.blocks.len());
        }
        self.blocks.clear();
        self.pending_bytes = 0;
        self.base = None;
        self.closed = true;
    }

    fn ensure_open(&self) -> BlobResult<()> {
        if self.closed {
            return Err(BlobError::invalid("batch is closed"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlobConfig, MemoryLog};

    fn adapter(block_size: usize) -> (Arc<MemoryLog>, BlobAdapter) {
        let log = Arc::new(MemoryLog::new());
        let adapter =
            BlobAdapter::new(log.clone(), BlobConfig::new().with_block_size(block_size)).unwrap();
        (log, adapter)
    }

    #[tokio::test]
    async fn ids_continue_after_committed_blocks() {
        let (log, adapter) = adapter(4);
        log.append(vec![Bytes::from_static(b"head")]).await.unwrap();

        let mut batch = adapter.batch();
        let a = batch.put(b"abcdef").unwrap();
        let b = batch.put(b"xyz").unwrap();

        assert_eq!(a, BlobId::new(4, 6, 1, 2));
        assert_eq!(b, BlobId::new(10, 3, 3, 1));
        assert_eq!(batch.pending_blocks(), 3);
        assert_eq!(batch.pending_bytes(), 9);
        assert_eq!(log.length(), 1);
    }

    #[tokio::test]
    async fn pending_reads_match_committed_reads() {
        let (log, adapter) = adapter(4);
        let mut batch = adapter.batch();
        let id = batch.put(b"hello world").unwrap();

        let before = batch.get(&id, ReadOptions::new()).await.unwrap();
        let partial = batch
            .get(&id, ReadOptions::new().with_start(6).with_length(5))
            .await
            .unwrap();
        assert_eq!(partial, Some(Bytes::from_static(b"world")));

        batch.flush().await.unwrap();
        assert_eq!(log.length(), 3);
        assert_eq!(batch.pending_blocks(), 0);

        let after = batch.get(&id, ReadOptions::new()).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(after, Some(Bytes::from_static(b"hello world")));
    }

    #[tokio::test]
    async fn unknown_pending_id_is_none() {
        let (_log, adapter) = adapter(4);
        let batch = adapter.batch();
        let missing = BlobId::new(0, 4, 0, 1);
        assert_eq!(batch.get(&missing, ReadOptions::new()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn flush_failure_keeps_pending_blocks() {
        let (log, adapter) = adapter(4);
        let mut batch = adapter.batch();
        batch.put(b"abcd").unwrap();

        log.close();
        assert!(batch.flush().await.is_err());
        assert_eq!(batch.pending_blocks(), 1);
        assert!(!adapter.is_locked());
    }

    #[tokio::test]
    async fn concurrent_append_is_detected_on_flush() {
        let (log, adapter) = adapter(4);
        let mut batch = adapter.batch();
        batch.put(b"abcd").unwrap();

        adapter.put(b"other", Default::default()).await.unwrap();
        let err = batch.flush().await.unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
        assert_eq!(log.length(), 2);
    }

    #[tokio::test]
    async fn concurrent_append_fails_pending_reads() {
        let (log, adapter) = adapter(4);
        let mut batch = adapter.batch();
        let id = batch.put(b"mine").unwrap();

        adapter.put(b"other", Default::default()).await.unwrap();
        assert_eq!(log.length(), 2);
        let err = batch.get(&id, ReadOptions::new()).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn oversized_id_does_not_trust_byte_length() {
        let (_log, adapter) = adapter(4);
        let mut batch = adapter.batch();
        let id = batch.put(b"abcd").unwrap();

        let forged = BlobId::new(id.byte_offset, u64::MAX, id.block_offset, id.block_length);
        let read = batch.get(&forged, ReadOptions::new()).await.unwrap();
        assert_eq!(read, Some(Bytes::from_static(b"abcd")));
    }

    #[tokio::test]
    async fn close_discards_and_rejects() {
        let (log, adapter) = adapter(4);
        let mut batch = adapter.batch();
        batch.put(b"abcd").unwrap();
        batch.close();
        batch.close();

        assert!(batch.is_closed());
        assert!(batch.put(b"more").is_err());
        assert!(batch.flush().await.is_err());
        assert_eq!(log.length(), 0);
    }
}
