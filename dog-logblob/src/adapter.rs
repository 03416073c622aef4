use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Mutex as AppendLock;
use tracing::debug;

use crate::log::BlockLog;
use crate::monitor::MonitorRegistry;
use crate::{
    BlobBatch, BlobConfig, BlobError, BlobId, BlobReader, BlobResult, BlobStream, BlobWriter,
    ClearOptions, Monitor, ReadOptions, WriteOptions,
};

/// The main blob adapter: stores byte blobs as runs of blocks in a log.
///
/// Cheap to clone; clones share the append locks and the monitor registry.
#[derive(Clone)]
pub struct BlobAdapter {
    inner: Arc<Inner>,
}

struct Inner {
    log: Arc<dyn BlockLog>,
    config: BlobConfig,
    locks: Mutex<Vec<(Weak<dyn BlockLog>, Arc<AppendLock<()>>)>>,
    monitors: Arc<MonitorRegistry>,
}

impl BlobAdapter {
    /// Create a new blob adapter over `log`
    pub fn new(log: Arc<dyn BlockLog>, config: BlobConfig) -> BlobResult<Self> {
        config.validate()?;
        let monitors = MonitorRegistry::new(log.clone(), config.speed_window);
        let lock = Arc::new(AppendLock::new(()));
        Ok(Self {
            inner: Arc::new(Inner {
                locks: Mutex::new(vec![(Arc::downgrade(&log), lock)]),
                log,
                config,
                monitors,
            }),
        })
    }

    /// The log blobs are stored in unless an operation names another one
    pub fn log(&self) -> &Arc<dyn BlockLog> {
        &self.inner.log
    }

    pub fn config(&self) -> &BlobConfig {
        &self.inner.config
    }

    /// Whether a write session currently holds the primary log's append lock
    pub fn is_locked(&self) -> bool {
        self.append_lock(&self.inner.log).try_lock().is_err()
    }

    /// Store a blob and return its id once every block is appended
    pub async fn put(&self, data: &[u8], options: WriteOptions) -> BlobResult<BlobId> {
        let mut writer = self.create_write_stream(options)?;
        writer.write(data).await?;
        let id = writer.finish().await?;
        debug!("Stored blob {}", id);
        Ok(id)
    }

    /// Read a blob (or a byte window of it) into one buffer.
    ///
    /// A whole-blob read of blocks that are missing locally with `wait`
    /// disabled yields `None`; sub-range reads surface the error instead.
    pub async fn get(&self, id: &BlobId, options: ReadOptions) -> BlobResult<Option<Bytes>> {
        let whole = options.range.is_whole();
        let mut reader = self.create_read_stream(id, options)?;
        match reader.read_to_end().await {
            Ok(data) => Ok(Some(data)),
            Err(BlobError::BlockNotAvailable { index }) if whole => {
                debug!("Blob {} incomplete locally at block {}", id, index);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Open a lazy read pipeline over a blob's bytes
    pub fn create_read_stream(&self, id: &BlobId, options: ReadOptions) -> BlobResult<BlobReader> {
        let log = options.log.clone().unwrap_or_else(|| self.inner.log.clone());
        let prefetch = options
            .prefetch
            .clone()
            .unwrap_or_else(|| self.inner.config.prefetch.clone());
        BlobReader::new(log, *id, &options, prefetch)
    }

    /// [`create_read_stream`](Self::create_read_stream) as a `Stream`
    pub fn read_stream(&self, id: &BlobId, options: ReadOptions) -> BlobResult<BlobStream> {
        Ok(self.create_read_stream(id, options)?.into_stream())
    }

    /// Open a write pipeline; nothing is locked until the first write
    pub fn create_write_stream(&self, options: WriteOptions) -> BlobResult<BlobWriter> {
        let block_size = options.block_size.unwrap_or(self.inner.config.block_size);
        if block_size == 0 {
            return Err(BlobError::invalid("block_size must be greater than zero"));
        }
        let log = options.log.unwrap_or_else(|| self.inner.log.clone());
        let lock = self.append_lock(&log);
        Ok(BlobWriter::new(
            log,
            lock,
            block_size,
            self.inner.config.max_batch_blocks,
        ))
    }

    /// Drop the local copies of a blob's blocks; the id stays valid
    pub async fn clear(&self, id: &BlobId, options: ClearOptions) -> BlobResult<()> {
        let log = options.log.unwrap_or_else(|| self.inner.log.clone());
        log.clear(id.block_offset, id.block_end()).await?;
        debug!("Cleared {}", id);
        Ok(())
    }

    /// Track upload and download progress of one blob
    pub fn monitor(&self, id: &BlobId) -> Monitor {
        self.inner.monitors.open(*id)
    }

    /// Number of monitors currently open
    pub fn monitor_count(&self) -> usize {
        self.inner.monitors.len()
    }

    /// Start a batch of staged writes on the primary log
    pub fn batch(&self) -> BlobBatch {
        let log = self.inner.log.clone();
        let lock = self.append_lock(&log);
        BlobBatch::new(self.clone(), log, lock)
    }

    /// The append lock shared by every writer of `log`
    pub(crate) fn append_lock(&self, log: &Arc<dyn BlockLog>) -> Arc<AppendLock<()>> {
        let target = Arc::as_ptr(log) as *const ();
        let mut locks = self.inner.locks.lock();
        locks.retain(|(weak, _)| weak.strong_count() > 0);

        if let Some((_, lock)) = locks
            .iter()
            .find(|(weak, _)| Weak::as_ptr(weak) as *const () == target)
        {
            return lock.clone();
        }

        let lock = Arc::new(AppendLock::new(()));
        locks.push((Arc::downgrade(log), lock.clone()));
        lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryLog;

    fn adapter() -> (Arc<MemoryLog>, BlobAdapter) {
        let log = Arc::new(MemoryLog::new());
        let adapter = BlobAdapter::new(log.clone(), BlobConfig::new().with_block_size(4)).unwrap();
        (log, adapter)
    }

    #[test]
    fn invalid_config_is_rejected() {
        let log = Arc::new(MemoryLog::new());
        let err = BlobAdapter::new(log, BlobConfig::new().with_block_size(0)).err().unwrap();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn write_stream_holds_the_lock_until_finished() {
        let (_log, adapter) = adapter();
        let mut writer = adapter.create_write_stream(WriteOptions::new()).unwrap();
        assert!(!adapter.is_locked());

        writer.write(b"abc").await.unwrap();
        assert!(adapter.is_locked());

        writer.finish().await.unwrap();
        assert!(!adapter.is_locked());
    }

    #[tokio::test]
    async fn locks_are_shared_per_log() {
        let (log, adapter) = adapter();
        let other: Arc<dyn BlockLog> = Arc::new(MemoryLog::new());
        let primary: Arc<dyn BlockLog> = log;

        let a = adapter.append_lock(&primary);
        let b = adapter.append_lock(&primary);
        let c = adapter.append_lock(&other);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(Arc::ptr_eq(&c, &adapter.clone().append_lock(&other)));
    }

    #[tokio::test]
    async fn dead_logs_are_pruned() {
        let (_log, adapter) = adapter();
        let other: Arc<dyn BlockLog> = Arc::new(MemoryLog::new());
        adapter.append_lock(&other);
        assert_eq!(adapter.inner.locks.lock().len(), 2);

        drop(other);
        let third: Arc<dyn BlockLog> = Arc::new(MemoryLog::new());
        adapter.append_lock(&third);
        assert_eq!(adapter.inner.locks.lock().len(), 2);
    }

    #[tokio::test]
    async fn zero_block_size_override_is_rejected() {
        let (_log, adapter) = adapter();
        let err = adapter
            .put(b"abc", WriteOptions::new().with_block_size(0))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn clear_drops_only_the_blob() {
        let (log, adapter) = adapter();
        let a = adapter.put(b"aaaaaaaa", WriteOptions::new()).await.unwrap();
        let b = adapter.put(b"bbbb", WriteOptions::new()).await.unwrap();

        adapter.clear(&a, ClearOptions::new()).await.unwrap();
        assert!(!log.has(0) && !log.has(1));
        assert!(log.has(2));
        assert_eq!(
            adapter.get(&b, ReadOptions::new()).await.unwrap(),
            Some(Bytes::from_static(b"bbbb"))
        );
    }
}
