use std::sync::Arc;

use tracing::trace;

use crate::log::{BlockLog, DownloadHandle, DownloadRange};
use crate::PrefetchConfig;

/// Sliding read-ahead window of block downloads for one read pipeline.
///
/// At most `max` blocks that are not yet local are kept inside the window at
/// any time. The window never leaves `[start_bound, end_bound)` and never runs
/// further ahead of the cursor than `max_read_ahead` blocks.
pub struct Prefetcher {
    log: Arc<dyn BlockLog>,
    max: u64,
    linear: bool,
    start_bound: u64,
    end_bound: u64,
    max_read_ahead: u64,
    start: u64,
    end: u64,
    missing: u64,
    range: Option<DownloadHandle>,
}

impl Prefetcher {
    pub fn new(log: Arc<dyn BlockLog>, config: &PrefetchConfig, start: u64, end: u64) -> Self {
        let end = end.max(start);
        let span = end - start;
        let ratio_blocks = (span as f64 * config.read_ahead_ratio).floor() as u64;
        Self {
            log,
            max: config.max,
            linear: config.linear,
            start_bound: start,
            end_bound: end,
            max_read_ahead: config.max.saturating_mul(2).max(ratio_blocks),
            start,
            end: start,
            missing: 0,
            range: None,
        }
    }

    /// Current window as `[start, end)`
    pub fn window(&self) -> (u64, u64) {
        (self.start, self.end)
    }

    /// Blocks in the window that were not local when it was extended
    pub fn missing(&self) -> u64 {
        self.missing
    }

    pub fn is_armed(&self) -> bool {
        self.range.is_some()
    }

    /// Tell the scheduler the cursor is now consuming block `position`
    pub fn advance(&mut self, position: u64) {
        let position = position.clamp(self.start_bound, self.end_bound);

        if self.range.is_none() {
            self.start = position;
            self.end = self.end.max(position);
            self.extend();
        } else if position >= self.start && position < self.end {
            self.start = position;
            self.missing = self.missing.saturating_sub(1);
            self.extend();
        } else if position >= self.end {
            self.start = position;
            self.end = position;
            self.missing = 0;
            self.extend();
        }
    }

    fn extend(&mut self) {
        if self.missing >= self.max && self.range.is_some() {
            return;
        }

        let mut end = self.end;
        while end < self.end_bound && self.missing < self.max {
            let unset = self.log.first_unset(end);
            if unset >= self.end_bound {
                end = self.end_bound;
                break;
            }
            end = unset + 1;
            self.missing += 1;
        }

        end = end
            .min(self.start.saturating_add(self.max_read_ahead))
            .min(self.end_bound);
        self.end = end.max(self.start);

        if let Some(handle) = self.range.take() {
            self.log.undownload(handle);
        }
        if self.start >= self.end {
            return;
        }

        trace!(
            "Prefetch window {}..{} ({} missing)",
            self.start,
            self.end,
            self.missing
        );
        self.range = Some(self.log.download(DownloadRange {
            start: self.start,
            end: self.end,
            linear: self.linear,
        }));
    }

    /// Cancel the active download and reset; safe to call repeatedly
    pub fn destroy(&mut self) {
        if let Some(handle) = self.range.take() {
            self.log.undownload(handle);
        }
        self.end = self.start;
        self.missing = 0;
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.destroy();
    }
}
