use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::chunker::Chunker;
use crate::log::BlockLog;
use crate::{BlobError, BlobId, BlobResult, ByteStream, PipelineState};

/// Write pipeline: re-chunks incoming bytes into blocks and appends them
/// while holding the log's exclusive append lock.
///
/// Nothing touches the log until the first write (or an explicit `open`). The
/// lock is held from then until `finish`, a failure, `destroy`, or drop.
pub struct BlobWriter {
    log: Arc<dyn BlockLog>,
    lock: Arc<Mutex<()>>,
    session: Option<OwnedMutexGuard<()>>,
    state: PipelineState,
    chunker: Chunker,
    batch: Vec<Bytes>,
    max_batch_blocks: usize,
    byte_offset: u64,
    block_offset: u64,
    id: Option<BlobId>,
}

impl BlobWriter {
    pub(crate) fn new(
        log: Arc<dyn BlockLog>,
        lock: Arc<Mutex<()>>,
        block_size: usize,
        max_batch_blocks: usize,
    ) -> Self {
        Self {
            log,
            lock,
            session: None,
            state: PipelineState::Opening,
            chunker: Chunker::new(block_size),
            batch: Vec::with_capacity(max_batch_blocks),
            max_batch_blocks,
            byte_offset: 0,
            block_offset: 0,
            id: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// The committed blob, once `finish` succeeded
    pub fn id(&self) -> Option<BlobId> {
        self.id
    }

    /// Wait for the log and take the append lock
    pub async fn open(&mut self) -> BlobResult<()> {
        match self.state {
            PipelineState::Opening => {}
            PipelineState::Streaming => return Ok(()),
            state => {
                return Err(BlobError::invalid(format!(
                    "write stream is not writable ({:?})",
                    state
                )))
            }
        }

        if let Err(err) = self.log.ready().await {
            self.fail();
            return Err(err.into());
        }

        let session = self.lock.clone().lock_owned().await;
        // Offsets are only meaningful once no other writer can move them
        self.byte_offset = self.log.byte_length();
        self.block_offset = self.log.length();
        self.session = Some(session);
        self.state = PipelineState::Streaming;

        debug!(
            "Write session opened at block {} byte {}",
            self.block_offset, self.byte_offset
        );
        Ok(())
    }

    pub async fn write(&mut self, data: &[u8]) -> BlobResult<()> {
        self.open().await?;
        for block in self.chunker.push(data) {
            self.batch.push(block);
            if self.batch.len() >= self.max_batch_blocks {
                self.flush_batch().await?;
            }
        }
        Ok(())
    }

    /// Drain a byte stream into the blob
    pub async fn write_stream(&mut self, mut stream: ByteStream) -> BlobResult<()> {
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => self.write(&chunk).await?,
                Err(err) => {
                    self.fail();
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Append what is left, release the lock and return the blob's id
    pub async fn finish(&mut self) -> BlobResult<BlobId> {
        if let (PipelineState::Closed, Some(id)) = (self.state, self.id) {
            return Ok(id);
        }
        self.open().await?;

        self.state = PipelineState::Finalizing;
        if let Some(tail) = self.chunker.finish() {
            self.batch.push(tail);
        }
        self.flush_batch().await?;

        let id = BlobId::new(
            self.byte_offset,
            self.log.byte_length() - self.byte_offset,
            self.block_offset,
            self.log.length() - self.block_offset,
        );
        self.session = None;
        self.state = PipelineState::Closed;
        self.id = Some(id);

        debug!("Write session committed {}", id);
        Ok(id)
    }

    /// Abandon the stream; blocks already appended stay in the log
    pub fn destroy(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.session = None;
        self.batch.clear();
        self.state = PipelineState::Closed;
    }

    async fn flush_batch(&mut self) -> BlobResult<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let blocks = std::mem::replace(&mut self.batch, Vec::with_capacity(self.max_batch_blocks));
        let count = blocks.len();
        if let Err(err) = self.log.append(blocks).await {
            warn!("Append of {} blocks failed, aborting write session: {}", count, err);
            self.fail();
            return Err(BlobError::append_failed(err));
        }
        Ok(())
    }

    fn fail(&mut self) {
        self.session = None;
        self.batch.clear();
        self.state = PipelineState::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryLog;
    use tracing_test::traced_test;

    fn writer(log: &Arc<MemoryLog>, lock: &Arc<Mutex<()>>, block_size: usize) -> BlobWriter {
        BlobWriter::new(log.clone(), lock.clone(), block_size, 16)
    }

    #[tokio::test]
    async fn construction_touches_nothing() {
        let log = Arc::new(MemoryLog::new());
        let lock = Arc::new(Mutex::new(()));
        let w = writer(&log, &lock, 4);
        assert_eq!(w.state(), PipelineState::Opening);
        assert!(lock.try_lock().is_ok());
    }

    #[tokio::test]
    async fn finish_reports_offsets() {
        let log = Arc::new(MemoryLog::new());
        log.append(vec![Bytes::from_static(b"xyz")]).await.unwrap();
        let lock = Arc::new(Mutex::new(()));

        let mut w = writer(&log, &lock, 4);
        w.write(b"hello").await.unwrap();
        w.write(b" world").await.unwrap();
        assert!(lock.try_lock().is_err());

        let id = w.finish().await.unwrap();
        assert_eq!(id, BlobId::new(3, 11, 1, 3));
        assert_eq!(w.id(), Some(id));
        assert_eq!(w.state(), PipelineState::Closed);
        assert!(lock.try_lock().is_ok());
    }

    #[tokio::test]
    async fn empty_blob_has_no_blocks() {
        let log = Arc::new(MemoryLog::new());
        let lock = Arc::new(Mutex::new(()));
        let id = writer(&log, &lock, 4).finish().await.unwrap();
        assert_eq!(id, BlobId::new(0, 0, 0, 0));
        assert_eq!(log.length(), 0);
    }

    #[tokio::test]
    async fn full_batches_are_appended_early() {
        let log = Arc::new(MemoryLog::new());
        let lock = Arc::new(Mutex::new(()));
        let mut w = BlobWriter::new(log.clone(), lock.clone(), 2, 3);

        w.write(b"aabbc").await.unwrap();
        assert_eq!(log.length(), 0);
        w.write(b"c").await.unwrap();
        assert_eq!(log.length(), 3);
        w.write(b"d").await.unwrap();

        let id = w.finish().await.unwrap();
        assert_eq!(id.block_length, 4);
        assert_eq!(id.byte_length, 7);
    }

    #[tokio::test]
    #[traced_test]
    async fn append_failure_releases_lock() {
        let log = Arc::new(MemoryLog::new());
        let lock = Arc::new(Mutex::new(()));
        let mut w = writer(&log, &lock, 4);
        w.open().await.unwrap();
        log.close();

        w.write(b"hello").await.unwrap();
        let err = w.finish().await.unwrap_err();
        assert_eq!(err.code(), "APPEND_FAILED");
        assert_eq!(w.state(), PipelineState::Failed);
        assert!(lock.try_lock().is_ok());
        assert!(w.write(b"more").await.is_err());
        assert!(logs_contain("aborting write session"));
    }

    #[tokio::test]
    async fn destroy_releases_lock() {
        let log = Arc::new(MemoryLog::new());
        let lock = Arc::new(Mutex::new(()));
        let mut w = writer(&log, &lock, 4);
        w.write(b"abcdef").await.unwrap();
        w.destroy();
        assert!(lock.try_lock().is_ok());
        assert_eq!(w.id(), None);

        let id = writer(&log, &lock, 4).finish().await.unwrap();
        assert_eq!(id.block_offset, 0);
    }

    #[tokio::test]
    async fn failed_input_stream_aborts() {
        let log = Arc::new(MemoryLog::new());
        let lock = Arc::new(Mutex::new(()));
        let mut w = writer(&log, &lock, 4);

        let stream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone")),
        ]);
        let err = w.write_stream(Box::pin(stream)).await.unwrap_err();
        assert_eq!(err.code(), "IO_ERROR");
        assert!(lock.try_lock().is_ok());
    }
}
