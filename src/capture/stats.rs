use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use super::types::DeviceId;

// ── Per-stream capture telemetry ──

/// Relaxed counters bumped from the producer and worker paths.
///
/// Atomic ops only, so updates are safe from signal context. Exposed for a
/// host application's debug overlay or shutdown log.
#[derive(Debug, Default)]
pub struct CaptureStats {
    /// Periods accepted and handed to the worker
    pub periods_captured: AtomicU64,
    /// Periods dropped because the worker had not caught up
    pub periods_skipped: AtomicU64,
    /// Scratch growths delegated to the worker (async mode)
    pub grows_deferred: AtomicU64,
    /// Largest period seen, in bytes
    pub max_period_bytes: AtomicU64,
}

impl CaptureStats {
    pub fn record_capture(&self, bytes: usize) {
        self.periods_captured.fetch_add(1, Ordering::Relaxed);
        self.max_period_bytes.fetch_max(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_skip(&self) {
        self.periods_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deferred_grow(&self) {
        self.grows_deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, device: DeviceId, stream_id: u32) -> StreamStats {
        StreamStats {
            device: device.0,
            stream_id,
            periods_captured: self.periods_captured.load(Ordering::Relaxed),
            periods_skipped: self.periods_skipped.load(Ordering::Relaxed),
            grows_deferred: self.grows_deferred.load(Ordering::Relaxed),
            max_period_bytes: self.max_period_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of one stream's counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStats {
    pub device: usize,
    pub stream_id: u32,
    pub periods_captured: u64,
    pub periods_skipped: u64,
    pub grows_deferred: u64,
    pub max_period_bytes: u64,
}
