use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::log::{BlockLog, LogSession};
use crate::prefetch::Prefetcher;
use crate::{BlobError, BlobId, BlobResult, BlobStream, PipelineState, PrefetchConfig, ReadOptions};

/// Position of a read pipeline inside the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCursor {
    /// Absolute byte position of the next byte to emit
    pub pos: u64,
    /// Absolute byte position one past the last byte to emit
    pub end: u64,
    pub block_index: u64,
    /// Offset inside `block_index` of `pos`; only non-zero before the first block
    pub relative_offset: u64,
}

/// Read pipeline: a lazy, forward-only sequence of chunks covering exactly
/// one byte window of a blob.
///
/// Each call to [`next_chunk`](Self::next_chunk) fetches at most one block.
/// The first and last blocks are trimmed to the window. Finishing, failing or
/// dropping the reader tears down its prefetch window and closes its session.
pub struct BlobReader {
    id: BlobId,
    session: LogSession,
    prefetch: PrefetchConfig,
    prefetcher: Option<Prefetcher>,
    state: PipelineState,
    cursor: ReadCursor,
}

impl BlobReader {
    pub(crate) fn new(
        log: Arc<dyn BlockLog>,
        id: BlobId,
        options: &ReadOptions,
        prefetch: PrefetchConfig,
    ) -> BlobResult<Self> {
        let (pos, end) = options.range.resolve(&id)?;
        Ok(Self {
            id,
            session: LogSession::open(log, options.wait, options.timeout),
            prefetch,
            prefetcher: None,
            state: PipelineState::Opening,
            cursor: ReadCursor {
                pos,
                end,
                block_index: id.block_offset,
                relative_offset: 0,
            },
        })
    }

    pub fn id(&self) -> &BlobId {
        &self.id
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn cursor(&self) -> ReadCursor {
        self.cursor
    }

    /// Current read-ahead window, if one is armed
    pub fn prefetch_window(&self) -> Option<(u64, u64)> {
        self.prefetcher
            .as_ref()
            .filter(|p| p.is_armed())
            .map(Prefetcher::window)
    }

    /// Produce the next chunk, or `None` once the window is exhausted
    pub async fn next_chunk(&mut self) -> BlobResult<Option<Bytes>> {
        loop {
            match self.state {
                PipelineState::Opening => {
                    if let Err(err) = self.open().await {
                        return Err(self.fail(err));
                    }
                }
                PipelineState::Streaming => {
                    if self.cursor.pos >= self.cursor.end {
                        self.close();
                        return Ok(None);
                    }
                    return match self.pull().await {
                        Ok(chunk) => Ok(Some(chunk)),
                        Err(err) => Err(self.fail(err)),
                    };
                }
                PipelineState::Finalizing | PipelineState::Closed | PipelineState::Failed => {
                    return Ok(None)
                }
            }
        }
    }

    /// Drain the remaining window into one buffer
    pub async fn read_to_end(&mut self) -> BlobResult<Bytes> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            chunks.push(chunk);
        }
        if chunks.len() == 1 {
            return Ok(chunks.remove(0));
        }

        let mut buf = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
        for chunk in chunks {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    pub fn into_stream(self) -> BlobStream {
        Box::pin(async_stream::try_stream! {
            let mut reader = self;
            while let Some(chunk) = reader.next_chunk().await? {
                yield chunk;
            }
        })
    }

    /// Stop reading; safe to call in any state
    pub fn close(&mut self) {
        self.teardown();
        if !self.state.is_terminal() {
            self.state = PipelineState::Closed;
        }
    }

    async fn open(&mut self) -> BlobResult<()> {
        if self.cursor.pos != self.id.byte_offset {
            let bounds = self.id.block_offset..self.id.block_end();
            let position = self
                .session
                .seek(self.cursor.pos, bounds)
                .await?
                .ok_or_else(|| BlobError::not_available(self.id.block_offset))?;
            self.cursor.block_index = position.index;
            self.cursor.relative_offset = position.relative_offset;
        }

        if self.prefetch.enabled && self.cursor.pos < self.cursor.end {
            self.prefetcher = Some(Prefetcher::new(
                self.session.log().clone(),
                &self.prefetch,
                self.id.block_offset,
                self.id.block_end(),
            ));
        }

        self.state = PipelineState::Streaming;
        debug!(
            "Read stream opened for {} at block {}+{}",
            self.id, self.cursor.block_index, self.cursor.relative_offset
        );
        Ok(())
    }

    async fn pull(&mut self) -> BlobResult<Bytes> {
        let index = self.cursor.block_index;
        if let Some(prefetcher) = self.prefetcher.as_mut() {
            prefetcher.advance(index);
        }

        let block = self
            .session
            .get(index)
            .await?
            .ok_or_else(|| BlobError::not_available(index))?;

        let remainder = self.cursor.end - self.cursor.pos;
        let len = block.len() as u64;
        let chunk = if self.cursor.relative_offset > 0 || remainder < len {
            let start = self.cursor.relative_offset.min(len);
            let end = start.saturating_add(remainder).min(len);
            block.slice(start as usize..end as usize)
        } else {
            block
        };
        if chunk.is_empty() {
            return Err(BlobError::invalid(format!(
                "block {} is shorter than the blob layout requires",
                index
            )));
        }

        self.cursor.block_index += 1;
        self.cursor.relative_offset = 0;
        self.cursor.pos += chunk.len() as u64;
        Ok(chunk)
    }

    fn fail(&mut self, err: BlobError) -> BlobError {
        debug!("Read stream for {} failed: {}", self.id, err);
        self.teardown();
        self.state = PipelineState::Failed;
        err
    }

    fn teardown(&mut self) {
        if let Some(mut prefetcher) = self.prefetcher.take() {
            prefetcher.destroy();
        }
        self.session.close();
    }
}

impl Drop for BlobReader {
    fn drop(&mut self) {
        self.teardown();
    }
}
