use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;

use super::error::CaptureError;
use super::stats::CaptureStats;
use super::sync::{Semaphore, SpinLock, WriteGuard};
use super::types::{ChannelArea, ChannelLayout, DeviceId, OpenMode, SampleFormat};

// ── Producer → worker job slot ──

/// What the producer has asked the worker to do with the scratch buffer.
///
/// The worker reads this after a `full` wake-up; the value is always stored
/// before the matching post.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingJob {
    /// Nothing deposited.
    Idle,
    /// Serialize the first `len` bytes of scratch downstream.
    Emit(usize),
    /// Ensure scratch capacity of at least `len` bytes before the next
    /// deposit; the period that wanted it was dropped.
    Grow(usize),
}

// ── Mutable per-stream state ──

/// State guarded by the stream's write lock on the producer/control side.
/// The worker touches it only between its `full` wake-up and the matching
/// `ready`/`empty` hand-back, which the deposit protocol serializes against
/// the producer.
pub struct StreamState {
    pub format: SampleFormat,
    pub channels: u32,
    pub rate: u32,
    pub period_size: u64,
    pub layout: ChannelLayout,
    /// Most recent period, `len == capacity`, zero-filled beyond deposits
    pub scratch: Vec<u8>,
    pub pending: PendingJob,
    /// Monotonic nanoseconds sampled at deposit time
    pub capture_time_ns: u64,
    /// Window snapshotted at `mmap_begin` for the matching commit
    pub mmap_areas: *const ChannelArea,
    pub mmap_area_count: usize,
    pub mmap_offset: u64,
    pub mmap_frames: u64,
}

impl StreamState {
    fn new() -> StreamState {
        StreamState {
            // Placeholder until negotiation; `has_format` gates every use.
            format: SampleFormat::S16Le,
            channels: 0,
            rate: 0,
            period_size: 0,
            layout: ChannelLayout::Interleaved,
            scratch: Vec::new(),
            pending: PendingJob::Idle,
            capture_time_ns: 0,
            mmap_areas: std::ptr::null(),
            mmap_area_count: 0,
            mmap_offset: 0,
            mmap_frames: 0,
        }
    }

    /// Bytes per `frames` frames at the negotiated format.
    pub fn frames_to_bytes(&self, frames: u64) -> usize {
        frames as usize * self.channels as usize * self.format.sample_size()
    }

    /// Bytes per `frames` single-channel samples at the negotiated format.
    pub fn samples_to_bytes(&self, frames: u64) -> usize {
        frames as usize * self.format.sample_size()
    }

    /// Reallocate scratch to hold `size` bytes. Never called on the async
    /// producer path. Allocation failure leaves the buffer empty, as if the
    /// capacity had been lost.
    pub fn grow_scratch(&mut self, size: usize) -> Result<(), CaptureError> {
        if size <= self.scratch.len() {
            return Ok(());
        }
        let additional = size - self.scratch.len();
        if self.scratch.try_reserve_exact(additional).is_err() {
            self.scratch = Vec::new();
            return Err(CaptureError::OutOfMemory);
        }
        self.scratch.resize(size, 0);
        Ok(())
    }
}

// ── Capture stream record ──

/// Per-device capture stream.
///
/// Created on first sighting of a device handle by any intercept; pinned in
/// the registry until the engine drops. The format fields become meaningful
/// once `has_format` is set by negotiation, and `initialized` marks that the
/// format message went downstream and a worker is attached.
pub struct CaptureStream {
    pub device: DeviceId,
    mode: AtomicU32,
    /// 0 until the first accepted format; stable thereafter
    pub stream_id: AtomicU32,
    pub has_format: AtomicBool,
    pub initialized: AtomicBool,
    /// Worker liveness; cleared to ask the worker to exit, or by the worker
    /// itself on a terminal packet error
    pub running: AtomicBool,
    /// Set while the worker is parked on `full`, able to take a deposit
    pub ready: AtomicBool,
    /// Posted by the producer when a period (or grow request) is in scratch
    pub full: Semaphore,
    /// Posted by the worker when a non-async producer may deposit again
    pub empty: Semaphore,
    write_mutex: Mutex<()>,
    write_spin: SpinLock,
    state: UnsafeCell<StreamState>,
    pub worker: Mutex<Option<JoinHandle<()>>>,
    pub stats: CaptureStats,
}

// CaptureStream is shared between the host's threads (producer), the worker,
// and the control surface. The UnsafeCell'd state is guarded by the write
// lock plus the full/empty handoff; the mmap area pointer it carries is only
// dereferenced under that discipline.
unsafe impl Send for CaptureStream {}
unsafe impl Sync for CaptureStream {}

impl CaptureStream {
    pub fn new(device: DeviceId) -> CaptureStream {
        CaptureStream {
            device,
            mode: AtomicU32::new(0),
            stream_id: AtomicU32::new(0),
            has_format: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            full: Semaphore::new(0),
            empty: Semaphore::new(1),
            write_mutex: Mutex::new(()),
            write_spin: SpinLock::new(),
            state: UnsafeCell::new(StreamState::new()),
            worker: Mutex::new(None),
            stats: CaptureStats::default(),
        }
    }

    pub fn set_mode(&self, mode: OpenMode) {
        self.mode.store(mode.bits(), Ordering::Relaxed);
    }

    pub fn mode(&self) -> OpenMode {
        OpenMode::from_bits(self.mode.load(Ordering::Relaxed))
    }

    pub fn is_async(&self) -> bool {
        self.mode().is_async()
    }

    /// Mode-dispatched write lock: blocking mutex for ordinary streams,
    /// spinlock for async ones.
    pub fn lock_write(&self) -> WriteGuard<'_> {
        if self.is_async() {
            WriteGuard::spinning(&self.write_spin)
        } else {
            WriteGuard::blocking(&self.write_mutex)
        }
    }

    /// Raw access to the guarded state.
    ///
    /// # Safety
    ///
    /// Caller must hold the write lock, or be the worker inside its handoff
    /// window (between a `full` wake-up and the `ready`/`empty` hand-back).
    pub unsafe fn state(&self) -> *mut StreamState {
        self.state.get()
    }

    /// Stop and join the worker if one is attached. Safe to call with the
    /// write lock held: the worker never takes the write lock.
    pub fn quiesce_worker(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            self.running.store(false, Ordering::SeqCst);
            self.full.post();
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_stream_defaults() {
        let stream = CaptureStream::new(DeviceId(0xdead));
        assert_eq!(stream.stream_id.load(Ordering::Relaxed), 0);
        assert!(!stream.has_format.load(Ordering::Relaxed));
        assert!(!stream.initialized.load(Ordering::Relaxed));
        assert!(!stream.is_async());
        let st = unsafe { &*stream.state() };
        assert_eq!(st.pending, PendingJob::Idle);
        assert!(st.scratch.is_empty());
    }

    #[test]
    fn byte_conversions_follow_negotiated_format() {
        let stream = CaptureStream::new(DeviceId(1));
        let st = unsafe { &mut *stream.state() };
        st.format = SampleFormat::S16Le;
        st.channels = 2;
        assert_eq!(st.frames_to_bytes(480), 1920);
        assert_eq!(st.samples_to_bytes(480), 960);

        st.format = SampleFormat::S32Le;
        assert_eq!(st.frames_to_bytes(256), 2048);
    }

    #[test]
    fn grow_scratch_is_monotonic() {
        let stream = CaptureStream::new(DeviceId(1));
        let st = unsafe { &mut *stream.state() };
        st.grow_scratch(4096).unwrap();
        assert_eq!(st.scratch.len(), 4096);
        // shrinking requests leave the buffer alone
        st.grow_scratch(16).unwrap();
        assert_eq!(st.scratch.len(), 4096);
    }
}
