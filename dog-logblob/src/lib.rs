//! # dog-logblob: Blob storage on top of an append-only block log
//!
//! `dog-logblob` stores arbitrary byte blobs inside a replicable, append-only,
//! block-addressed log and reads them back by id, with random-access byte
//! ranges, streaming and read-ahead over sparsely replicated data.
//!
//! ## Key Features
//!
//! - **Plain-data ids**: a [`BlobId`] is four numbers and is all you need to read a blob back
//! - **Contiguous writes**: one exclusive append lock per log keeps every blob's blocks together
//! - **Byte ranges**: reads seek to the right block and trim the first and last blocks
//! - **Streaming-first**: read and write pipelines pull or push one block at a time
//! - **Prefetching**: an adaptive read-ahead window downloads missing blocks ahead of the reader
//! - **Batches**: stage writes and read them back before they are committed
//! - **Progress monitors**: live upload/download stats for a single blob
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use dog_logblob::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> BlobResult<()> {
//! let log = Arc::new(MemoryLog::new());
//! let blobs = BlobAdapter::new(log, BlobConfig::default())?;
//!
//! let id = blobs.put(b"hello world", WriteOptions::new()).await?;
//! let tail = blobs.get(&id, ReadOptions::new().with_start(6)).await?;
//! assert_eq!(tail.as_deref(), Some(&b"world"[..]));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Your Service  │  ← Keeps BlobIds, nothing else
//! ├─────────────────┤
//! │   BlobAdapter   │  ← Pipelines, prefetch, batches, monitors
//! ├─────────────────┤
//! │    BlockLog     │  ← Durability, replication, presence bitfield
//! └─────────────────┘
//! ```
//!
//! Any log can sit under the adapter by implementing [`BlockLog`];
//! [`MemoryLog`] is the in-process implementation used by the tests.

pub mod adapter;
mod batch;
mod chunker;
mod config;
mod error;
pub mod log;
mod memory_log;
mod monitor;
mod prefetch;
mod reader;
mod types;
mod writer;

// Re-export main types for clean API
pub use adapter::BlobAdapter;
pub use batch::BlobBatch;
pub use config::{BlobConfig, PrefetchConfig, DEFAULT_BLOCK_SIZE, DEFAULT_MAX_BATCH_BLOCKS};
pub use error::{BlobError, BlobResult, LogError, LogResult};
pub use log::{
    AppendRange, BlockLog, DownloadHandle, DownloadRange, ListenerId, LogEvent, LogListener,
    LogSession, PeerId, SeekPosition,
};
pub use memory_log::MemoryLog;
pub use monitor::{Direction, Monitor, MonitorStats, MonitorUpdate};
pub use prefetch::Prefetcher;
pub use reader::{BlobReader, ReadCursor};
pub use types::{
    BlobId, BlobStream, ByteRange, ByteStream, ClearOptions, PipelineState, ReadOptions,
    WriteOptions,
};
pub use writer::BlobWriter;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        BlobAdapter, BlobBatch, BlobConfig, BlobError, BlobId, BlobResult, BlockLog,
        ClearOptions, MemoryLog, Monitor, ReadOptions, WriteOptions,
    };
}
