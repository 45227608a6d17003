use std::io;
use std::sync::atomic::{AtomicU32, Ordering};

// ── Downstream packet stream ──

/// Write side of one packet channel on the downstream stream buffer.
///
/// Each emitted message is bracketed by `open` .. `close`; `set_size`
/// declares the total payload before the first `write` so the buffer can
/// reserve space in one piece.
pub trait PacketChannel: Send {
    fn open(&mut self) -> io::Result<()>;
    fn set_size(&mut self, size: usize) -> io::Result<()>;
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn close(&mut self) -> io::Result<()>;
}

/// The shared downstream buffer consumed by the encoding/muxing pipeline.
///
/// Workers obtain one channel each; the buffer serializes concurrently
/// written packets internally. The engine only ever writes.
pub trait PacketBuffer: Send + Sync {
    fn channel(&self) -> io::Result<Box<dyn PacketChannel>>;
}

// ── Session services ──

/// Monotonic session clock sampled at deposit time.
///
/// Implementations must be async-signal-safe: the producer path may call
/// this from the host's signal handler.
pub trait CaptureClock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// Allocator of positive, session-unique stream ids. Id 0 is reserved to
/// mean "not yet assigned".
pub trait StreamIds: Send + Sync {
    fn next_stream_id(&self) -> u32;
}

/// `CLOCK_MONOTONIC` via `clock_gettime(2)`, which is async-signal-safe.
#[derive(Debug, Default)]
pub struct MonotonicClock;

impl CaptureClock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
    }
}

/// Sequential id allocator starting at 1.
#[derive(Debug)]
pub struct SerialStreamIds {
    next: AtomicU32,
}

impl SerialStreamIds {
    pub fn new() -> SerialStreamIds {
        SerialStreamIds {
            next: AtomicU32::new(1),
        }
    }
}

impl Default for SerialStreamIds {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamIds for SerialStreamIds {
    fn next_stream_id(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
