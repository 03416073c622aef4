use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::log::{
    AppendRange, BlockLog, DownloadHandle, DownloadRange, ListenerId, LogEvent, LogListener,
    PeerId, SeekPosition,
};
use crate::{LogError, LogResult};

/// In-memory log for testing, demos and embedding.
///
/// A log created with [`MemoryLog::replicate`] starts sparse: it knows the
/// upstream's block sizes but holds no data until blocks are fetched or
/// downloaded, and every transfer is reported as an upload on the upstream and
/// a download on the replica.
pub struct MemoryLog {
    peer: PeerId,
    state: RwLock<LogState>,
    upstream: Option<Arc<MemoryLog>>,
    replicas: Mutex<Vec<Weak<MemoryLog>>>,
    arrivals: Notify,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn LogListener>)>>,
    next_listener: AtomicU64,
    next_download: AtomicU64,
}

#[derive(Default)]
struct LogState {
    /// Presence bitfield and block data
    blocks: Vec<Option<Bytes>>,
    /// Known size of every block, present or not
    sizes: Vec<u64>,
    byte_length: u64,
    downloads: HashMap<DownloadHandle, DownloadRange>,
    peers: usize,
    closed: bool,
}

enum Located {
    Found(SeekPosition),
    Outside,
    Unknown,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::with_upstream(None)
    }

    fn with_upstream(upstream: Option<Arc<MemoryLog>>) -> Self {
        Self {
            peer: PeerId::new(),
            state: RwLock::new(LogState::default()),
            upstream,
            replicas: Mutex::new(Vec::new()),
            arrivals: Notify::new(),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            next_download: AtomicU64::new(1),
        }
    }

    /// Create a sparse replica connected to `upstream` as a peer
    pub fn replicate(upstream: &Arc<MemoryLog>) -> Arc<MemoryLog> {
        let replica = Arc::new(Self::with_upstream(Some(upstream.clone())));
        replica.state.write().peers += 1;
        upstream.state.write().peers += 1;
        upstream.replicas.lock().push(Arc::downgrade(&replica));

        upstream.emit(LogEvent::PeerAdd {
            peer: replica.peer.clone(),
        });
        replica.emit(LogEvent::PeerAdd {
            peer: upstream.peer.clone(),
        });
        replica
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer
    }

    /// Close the log, waking suspended readers and disconnecting from the upstream
    pub fn close(&self) {
        {
            let mut state = self.state.write();
            if state.closed {
                return;
            }
            state.closed = true;
            state.downloads.clear();
        }
        self.arrivals.notify_waiters();

        if let Some(upstream) = &self.upstream {
            {
                let mut state = self.state.write();
                state.peers = state.peers.saturating_sub(1);
            }
            {
                let mut state = upstream.state.write();
                state.peers = state.peers.saturating_sub(1);
            }
            upstream.emit(LogEvent::PeerRemove {
                peer: self.peer.clone(),
            });
            self.emit(LogEvent::PeerRemove {
                peer: upstream.peer.clone(),
            });
        }
        debug!("Closed memory log {}", self.peer);
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// Ranges currently requested for background download
    pub fn active_downloads(&self) -> Vec<DownloadRange> {
        let mut ranges: Vec<_> = self.state.read().downloads.values().copied().collect();
        ranges.sort_by_key(|r| (r.start, r.end));
        ranges
    }

    fn emit(&self, event: LogEvent) {
        let listeners: Vec<Arc<dyn LogListener>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener.on_event(&event);
        }
    }

    /// Pick up blocks the upstream committed since the last look
    fn sync_tree(&self) {
        let Some(upstream) = &self.upstream else {
            return;
        };
        let known = self.state.read().sizes.len();
        let fresh: Vec<u64> = {
            let up = upstream.state.read();
            if up.sizes.len() <= known {
                return;
            }
            up.sizes[known..].to_vec()
        };

        let mut state = self.state.write();
        for size in fresh.into_iter().skip(state.sizes.len() - known) {
            state.sizes.push(size);
            state.blocks.push(None);
            state.byte_length += size;
        }
    }

    fn local(&self, index: u64) -> Option<Bytes> {
        self.state
            .read()
            .blocks
            .get(index as usize)
            .cloned()
            .flatten()
    }

    /// Copy one block from the upstream, reporting the transfer on both sides
    fn transfer(&self, index: u64) -> Option<Bytes> {
        let upstream = self.upstream.as_ref()?;
        let block = upstream.local(index)?;
        {
            let mut state = self.state.write();
            let slot = state.blocks.get_mut(index as usize)?;
            if slot.is_some() {
                return slot.clone();
            }
            *slot = Some(block.clone());
        }
        self.arrivals.notify_waiters();

        let bytes = block.len() as u64;
        upstream.emit(LogEvent::Upload {
            index,
            bytes,
            peer: self.peer.clone(),
        });
        self.emit(LogEvent::Download {
            index,
            bytes,
            peer: upstream.peer.clone(),
        });
        Some(block)
    }

    fn locate(&self, byte_offset: u64, bounds: &Range<u64>) -> Located {
        let state = self.state.read();
        let known = state.sizes.len() as u64;

        if bounds.start <= known {
            let mut offset: u64 = state.sizes[..bounds.start as usize].iter().sum();
            for index in bounds.start..bounds.end.min(known) {
                let size = state.sizes[index as usize];
                if byte_offset < offset {
                    return Located::Outside;
                }
                if byte_offset < offset + size {
                    return Located::Found(SeekPosition {
                        index,
                        relative_offset: byte_offset - offset,
                    });
                }
                offset += size;
            }
        }

        if byte_offset >= state.byte_length && bounds.end > known {
            Located::Unknown
        } else {
            Located::Outside
        }
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockLog for MemoryLog {
    async fn ready(&self) -> LogResult<()> {
        if self.is_closed() {
            return Err(LogError::Closed);
        }
        Ok(())
    }

    fn length(&self) -> u64 {
        self.sync_tree();
        self.state.read().sizes.len() as u64
    }

    fn byte_length(&self) -> u64 {
        self.sync_tree();
        self.state.read().byte_length
    }

    async fn append(&self, blocks: Vec<Bytes>) -> LogResult<AppendRange> {
        if self.upstream.is_some() {
            return Err(LogError::Backend("replica logs are read-only".to_string()));
        }

        let range = {
            let mut state = self.state.write();
            if state.closed {
                return Err(LogError::Closed);
            }
            let start = state.sizes.len() as u64;
            for block in blocks {
                let size = block.len() as u64;
                state.sizes.push(size);
                state.blocks.push(Some(block));
                state.byte_length += size;
            }
            AppendRange {
                start,
                end: state.sizes.len() as u64,
            }
        };
        trace!("Appended blocks {}..{}", range.start, range.end);

        self.arrivals.notify_waiters();
        self.replicas.lock().retain(|replica| match replica.upgrade() {
            Some(replica) => {
                replica.arrivals.notify_waiters();
                true
            }
            None => false,
        });
        Ok(range)
    }

    async fn get(&self, index: u64, wait: bool) -> LogResult<Option<Bytes>> {
        loop {
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return Err(LogError::Closed);
            }
            self.sync_tree();
            if let Some(block) = self.local(index) {
                return Ok(Some(block));
            }
            if !wait {
                return Ok(None);
            }
            if let Some(block) = self.transfer(index) {
                return Ok(Some(block));
            }
            notified.await;
        }
    }

    async fn seek(
        &self,
        byte_offset: u64,
        bounds: Range<u64>,
        wait: bool,
    ) -> LogResult<Option<SeekPosition>> {
        loop {
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return Err(LogError::Closed);
            }
            self.sync_tree();
            match self.locate(byte_offset, &bounds) {
                Located::Found(position) => return Ok(Some(position)),
                Located::Outside => return Ok(None),
                Located::Unknown if !wait => return Ok(None),
                Located::Unknown => notified.await,
            }
        }
    }

    fn download(&self, range: DownloadRange) -> DownloadHandle {
        let handle = DownloadHandle(self.next_download.fetch_add(1, Ordering::Relaxed));
        self.state.write().downloads.insert(handle, range);

        if self.upstream.is_some() {
            self.sync_tree();
            for index in range.start..range.end {
                if !self.has(index) {
                    self.transfer(index);
                }
            }
        }
        handle
    }

    fn undownload(&self, handle: DownloadHandle) {
        self.state.write().downloads.remove(&handle);
    }

    async fn clear(&self, start: u64, end: u64) -> LogResult<()> {
        self.sync_tree();
        let mut state = self.state.write();
        if state.closed {
            return Err(LogError::Closed);
        }
        let length = state.blocks.len() as u64;
        if start > length {
            return Err(LogError::OutOfBounds { index: start, length });
        }
        let end = end.min(length);
        for index in start..end {
            state.blocks[index as usize] = None;
        }
        Ok(())
    }

    fn has(&self, index: u64) -> bool {
        self.local(index).is_some()
    }

    fn first_unset(&self, from: u64) -> u64 {
        self.sync_tree();
        let state = self.state.read();
        let mut index = from;
        while let Some(Some(_)) = state.blocks.get(index as usize) {
            index += 1;
        }
        index
    }

    fn peers(&self) -> usize {
        self.state.read().peers
    }

    fn listen(&self, listener: Arc<dyn LogListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    fn unlisten(&self, id: ListenerId) {
        self.listeners.write().retain(|(existing, _)| *existing != id);
    }
}
