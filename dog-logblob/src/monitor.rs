use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use crate::log::{BlockLog, ListenerId, LogEvent, LogListener};
use crate::BlobId;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Direction of a block transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

/// Live transfer statistics for one direction of one blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStats {
    /// Time of the first matching transfer
    pub start_time: Option<DateTime<Utc>>,
    pub blocks: u64,
    pub total_bytes: u64,
    /// Bytes transferred since the monitor was created
    pub monitoring_bytes: u64,
    pub target_blocks: u64,
    pub target_bytes: u64,
    /// `blocks / target_blocks` as a percentage, two decimals
    pub percentage: f64,
    /// Bytes per second
    pub speed: f64,
    pub peers: usize,
}

impl MonitorStats {
    fn new(id: &BlobId, peers: usize) -> Self {
        Self {
            start_time: None,
            blocks: 0,
            total_bytes: 0,
            monitoring_bytes: 0,
            target_blocks: id.block_length,
            target_bytes: id.byte_length,
            percentage: 0.0,
            speed: 0.0,
            peers,
        }
    }

    fn record(&mut self, bytes: u64, speed: f64) {
        if self.start_time.is_none() {
            self.start_time = Some(Utc::now());
        }
        self.blocks += 1;
        self.total_bytes += bytes;
        self.monitoring_bytes += bytes;
        self.speed = speed;
        self.percentage = if self.target_blocks == 0 {
            0.0
        } else {
            round2(self.blocks as f64 / self.target_blocks as f64 * 100.0)
        };
    }
}

/// Notification sent to subscribers whenever a monitor's stats change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorUpdate {
    Peers {
        peers: usize,
    },
    Transfer {
        direction: Direction,
        index: u64,
        bytes: u64,
    },
}

/// Exponentially decaying byte-rate estimator
#[derive(Debug, Clone)]
pub(crate) struct SpeedMeter {
    window: Duration,
    rate: f64,
    last: Option<Instant>,
}

impl SpeedMeter {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            rate: 0.0,
            last: None,
        }
    }

    /// Add a sample and return the updated rate
    pub(crate) fn record(&mut self, bytes: u64) -> f64 {
        let now = Instant::now();
        self.rate = self.decayed(now) + bytes as f64 / self.window_secs();
        self.last = Some(now);
        self.rate
    }

    /// Rate as of now, without adding a sample
    pub(crate) fn current(&self) -> f64 {
        self.decayed(Instant::now())
    }

    fn decayed(&self, now: Instant) -> f64 {
        match self.last {
            Some(last) => {
                let elapsed = now.saturating_duration_since(last).as_secs_f64();
                self.rate * (-elapsed / self.window_secs()).exp()
            }
            None => 0.0,
        }
    }

    fn window_secs(&self) -> f64 {
        self.window.as_secs_f64().max(f64::EPSILON)
    }
}

struct MonitorState {
    upload: MonitorStats,
    download: MonitorStats,
    upload_speed: SpeedMeter,
    download_speed: SpeedMeter,
    peers: usize,
}

struct MonitorShared {
    key: u64,
    id: BlobId,
    state: Mutex<MonitorState>,
    updates: broadcast::Sender<MonitorUpdate>,
    closed: AtomicBool,
}

impl MonitorShared {
    fn handle(&self, event: &LogEvent, peers: usize) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let update = match event {
            LogEvent::PeerAdd { .. } | LogEvent::PeerRemove { .. } => {
                let mut state = self.state.lock();
                state.peers = peers;
                state.upload.peers = peers;
                state.download.peers = peers;
                MonitorUpdate::Peers { peers }
            }
            LogEvent::Upload { index, bytes, .. } => {
                if !self.id.contains_block(*index) {
                    return;
                }
                let mut state = self.state.lock();
                let speed = state.upload_speed.record(*bytes);
                state.upload.record(*bytes, speed);
                MonitorUpdate::Transfer {
                    direction: Direction::Upload,
                    index: *index,
                    bytes: *bytes,
                }
            }
            LogEvent::Download { index, bytes, .. } => {
                if !self.id.contains_block(*index) {
                    return;
                }
                let mut state = self.state.lock();
                let speed = state.download_speed.record(*bytes);
                state.download.record(*bytes, speed);
                MonitorUpdate::Transfer {
                    direction: Direction::Download,
                    index: *index,
                    bytes: *bytes,
                }
            }
        };

        let _ = self.updates.send(update);
    }
}

/// Set of open monitors on one log, sharing a single log listener.
///
/// The listener is attached when the first monitor opens and detached when
/// the last one closes.
pub(crate) struct MonitorRegistry {
    log: Arc<dyn BlockLog>,
    speed_window: Duration,
    monitors: Mutex<HashMap<u64, Arc<MonitorShared>>>,
    listener: Mutex<Option<ListenerId>>,
    next_key: AtomicU64,
}

impl MonitorRegistry {
    pub(crate) fn new(log: Arc<dyn BlockLog>, speed_window: Duration) -> Arc<Self> {
        Arc::new(Self {
            log,
            speed_window,
            monitors: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            next_key: AtomicU64::new(1),
        })
    }

    pub(crate) fn open(self: &Arc<Self>, id: BlobId) -> Monitor {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let peers = self.log.peers();
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let shared = Arc::new(MonitorShared {
            key,
            id,
            state: Mutex::new(MonitorState {
                upload: MonitorStats::new(&id, peers),
                download: MonitorStats::new(&id, peers),
                upload_speed: SpeedMeter::new(self.speed_window),
                download_speed: SpeedMeter::new(self.speed_window),
                peers,
            }),
            updates,
            closed: AtomicBool::new(false),
        });

        let mut monitors = self.monitors.lock();
        monitors.insert(key, shared.clone());
        if monitors.len() == 1 {
            let listener = Arc::new(RegistryListener(Arc::downgrade(self)));
            *self.listener.lock() = Some(self.log.listen(listener));
            debug!("Attached monitor listener");
        }
        drop(monitors);

        debug!("Monitor {} opened for {}", key, id);
        Monitor {
            shared,
            registry: Arc::downgrade(self),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.monitors.lock().len()
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.listener.lock().is_some()
    }

    fn remove(&self, key: u64) {
        let mut monitors = self.monitors.lock();
        if monitors.remove(&key).is_none() {
            return;
        }
        if monitors.is_empty() {
            if let Some(listener) = self.listener.lock().take() {
                self.log.unlisten(listener);
                debug!("Detached monitor listener");
            }
        }
    }

    fn dispatch(&self, event: &LogEvent) {
        let monitors: Vec<Arc<MonitorShared>> = self.monitors.lock().values().cloned().collect();
        if monitors.is_empty() {
            return;
        }
        let peers = self.log.peers();
        for monitor in monitors {
            monitor.handle(event, peers);
        }
    }
}

impl Drop for MonitorRegistry {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            self.log.unlisten(listener);
        }
    }
}

struct RegistryListener(Weak<MonitorRegistry>);

impl LogListener for RegistryListener {
    fn on_event(&self, event: &LogEvent) {
        if let Some(registry) = self.0.upgrade() {
            registry.dispatch(event);
        }
    }
}

/// Live upload/download progress of one blob.
///
/// Closing (or dropping) the monitor unregisters it; the stats stop changing
/// from then on.
pub struct Monitor {
    shared: Arc<MonitorShared>,
    registry: Weak<MonitorRegistry>,
}

impl Monitor {
    pub fn id(&self) -> &BlobId {
        &self.shared.id
    }

    pub fn upload_stats(&self) -> MonitorStats {
        self.shared.state.lock().upload.clone()
    }

    pub fn download_stats(&self) -> MonitorStats {
        self.shared.state.lock().download.clone()
    }

    /// Current upload rate in bytes per second
    pub fn upload_speed(&self) -> f64 {
        self.shared.state.lock().upload_speed.current()
    }

    /// Current download rate in bytes per second
    pub fn download_speed(&self) -> f64 {
        self.shared.state.lock().download_speed.current()
    }

    pub fn peers(&self) -> usize {
        self.shared.state.lock().peers
    }

    /// Receive a notification for every stats change
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorUpdate> {
        self.shared.updates.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.shared.key);
        }
        debug!("Monitor {} closed", self.shared.key);
    }

    /// Alias of [`close`](Self::close)
    pub fn destroy(&self) {
        self.close();
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.close();
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryLog;
    use bytes::Bytes;

    async fn origin_with_blocks(count: usize) -> Arc<MemoryLog> {
        let origin = Arc::new(MemoryLog::new());
        origin
            .append((0..count).map(|_| Bytes::from_static(b"12345")).collect())
            .await
            .unwrap();
        origin
    }

    fn registry(log: &Arc<MemoryLog>) -> Arc<MonitorRegistry> {
        MonitorRegistry::new(log.clone(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn creation_records_targets_and_peers() {
        let origin = origin_with_blocks(4).await;
        let _replica = MemoryLog::replicate(&origin);

        let monitor = registry(&origin).open(BlobId::new(5, 15, 1, 3));
        let stats = monitor.download_stats();
        assert_eq!(stats.target_blocks, 3);
        assert_eq!(stats.target_bytes, 15);
        assert_eq!(stats.peers, 1);
        assert_eq!(stats.start_time, None);
        assert_eq!(monitor.upload_stats().peers, 1);
    }

    #[tokio::test]
    async fn only_transfers_inside_the_blob_count() {
        let origin = origin_with_blocks(4).await;
        let replica = MemoryLog::replicate(&origin);
        let registry = registry(&replica);
        let monitor = registry.open(BlobId::new(10, 10, 2, 2));

        replica.get(0, true).await.unwrap();
        assert_eq!(monitor.download_stats().blocks, 0);

        replica.get(2, true).await.unwrap();
        let stats = monitor.download_stats();
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.total_bytes, 5);
        assert_eq!(stats.monitoring_bytes, 5);
        assert_eq!(stats.percentage, 50.0);
        assert!(stats.start_time.is_some());
        assert!(stats.speed > 0.0);
        assert_eq!(monitor.upload_stats().blocks, 0);
    }

    #[tokio::test]
    async fn uploads_are_seen_on_the_origin() {
        let origin = origin_with_blocks(3).await;
        let replica = MemoryLog::replicate(&origin);
        let registry = registry(&origin);
        let monitor = registry.open(BlobId::new(0, 15, 0, 3));

        for index in 0..3 {
            replica.get(index, true).await.unwrap();
        }
        let stats = monitor.upload_stats();
        assert_eq!(stats.blocks, 3);
        assert_eq!(stats.percentage, 100.0);
        assert!(monitor.upload_speed() > 0.0);
        assert_eq!(monitor.download_speed(), 0.0);
    }

    #[tokio::test]
    async fn percentage_is_rounded() {
        let origin = origin_with_blocks(3).await;
        let replica = MemoryLog::replicate(&origin);
        let registry = registry(&replica);
        let monitor = registry.open(BlobId::new(0, 15, 0, 3));

        replica.get(0, true).await.unwrap();
        assert_eq!(monitor.download_stats().percentage, 33.33);
    }

    #[tokio::test]
    async fn listener_attaches_on_first_and_detaches_on_last() {
        let origin = origin_with_blocks(1).await;
        let registry = registry(&origin);
        assert!(!registry.is_attached());

        let a = registry.open(BlobId::new(0, 5, 0, 1));
        let b = registry.open(BlobId::new(0, 5, 0, 1));
        assert!(registry.is_attached());
        assert_eq!(registry.len(), 2);

        a.close();
        a.close();
        assert_eq!(registry.len(), 1);
        assert!(registry.is_attached());

        drop(b);
        assert_eq!(registry.len(), 0);
        assert!(!registry.is_attached());
    }

    #[tokio::test]
    async fn closed_monitor_stops_counting() {
        let origin = origin_with_blocks(2).await;
        let replica = MemoryLog::replicate(&origin);
        let registry = registry(&replica);
        let monitor = registry.open(BlobId::new(0, 10, 0, 2));

        replica.get(0, true).await.unwrap();
        monitor.destroy();
        replica.get(1, true).await.unwrap();

        assert!(monitor.is_closed());
        assert_eq!(monitor.download_stats().blocks, 1);
    }

    #[tokio::test]
    async fn peer_changes_are_broadcast() {
        let origin = origin_with_blocks(1).await;
        let registry = registry(&origin);
        let monitor = registry.open(BlobId::new(0, 5, 0, 1));
        let mut updates = monitor.subscribe();

        let replica = MemoryLog::replicate(&origin);
        assert_eq!(updates.try_recv().unwrap(), MonitorUpdate::Peers { peers: 1 });
        assert_eq!(monitor.peers(), 1);

        replica.close();
        assert_eq!(updates.try_recv().unwrap(), MonitorUpdate::Peers { peers: 0 });
        assert_eq!(monitor.download_stats().peers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn speed_decays_over_the_window() {
        let mut meter = SpeedMeter::new(Duration::from_secs(1));
        assert_eq!(meter.current(), 0.0);
        assert_eq!(meter.record(1000), 1000.0);

        tokio::time::advance(Duration::from_secs(1)).await;
        let decayed = meter.current();
        assert!((decayed - 1000.0 / std::f64::consts::E).abs() < 1.0);

        let rate = meter.record(1000);
        assert!((rate - (decayed + 1000.0)).abs() < 1.0);
    }

    #[test]
    fn stats_serialize_camel_case() {
        let stats = MonitorStats::new(&BlobId::new(0, 10, 0, 2), 0);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["targetBlocks"], 2);
        assert_eq!(json["monitoringBytes"], 0);
    }
}
