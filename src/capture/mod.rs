pub mod error;
pub mod sink;
pub mod stats;
pub mod stream;
pub mod sync;
pub mod types;
pub mod wire;
mod worker;

// Re-export the public surface so embedding shims see one flat namespace
pub use error::CaptureError;
pub use sink::{CaptureClock, MonotonicClock, PacketBuffer, PacketChannel, SerialStreamIds, StreamIds};
pub use stats::{CaptureStats, StreamStats};
pub use stream::CaptureStream;
pub use types::{
    ChannelArea, ChannelLayout, DeviceId, HwParams, OpenMode, PcmAccess, PcmFormat, SampleFormat,
    StreamDirection,
};

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, PoisonError};

use stream::{PendingJob, StreamState};

// ── Engine flags ──

const CAPTURING: u32 = 0x1;
const ALLOW_SKIP: u32 = 0x2;

// ── errno preservation ──

/// Restores the host-visible errno on every exit path of an intercept; the
/// host must not observe the capture engine's syscalls.
struct ErrnoGuard(i32);

impl ErrnoGuard {
    fn save() -> ErrnoGuard {
        ErrnoGuard(unsafe { *libc::__errno_location() })
    }
}

impl Drop for ErrnoGuard {
    fn drop(&mut self) {
        unsafe {
            *libc::__errno_location() = self.0;
        }
    }
}

// ── Stream registry ──

struct StreamNode {
    stream: Arc<CaptureStream>,
    next: *mut StreamNode,
}

/// Head-insert, append-only list of capture streams.
///
/// Nodes are never freed or relocated until the engine drops, so traversal
/// needs only atomic loads and is safe from signal context. Typical stream
/// counts are tiny (a host rarely opens more than a few PCM devices), so
/// linear lookup is fine.
struct StreamRegistry {
    head: AtomicPtr<StreamNode>,
}

impl StreamRegistry {
    fn new() -> StreamRegistry {
        StreamRegistry {
            head: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    fn find(&self, device: DeviceId) -> Option<Arc<CaptureStream>> {
        let mut node = self.head.load(Ordering::Acquire);
        while !node.is_null() {
            let n = unsafe { &*node };
            if n.stream.device == device {
                return Some(Arc::clone(&n.stream));
            }
            node = n.next;
        }
        None
    }

    /// Resolve a device's stream, creating the record on first sighting.
    /// In practice a new device first appears via the non-signal `open`
    /// intercept; either way existing entries stay pinned in place.
    fn get_or_create(&self, device: DeviceId) -> Arc<CaptureStream> {
        if let Some(found) = self.find(device) {
            return found;
        }
        let stream = Arc::new(CaptureStream::new(device));
        let node = Box::into_raw(Box::new(StreamNode {
            stream: Arc::clone(&stream),
            next: std::ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            unsafe {
                (*node).next = head;
            }
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        stream
    }

    fn for_each<F: FnMut(&Arc<CaptureStream>)>(&self, mut f: F) {
        let mut node = self.head.load(Ordering::Acquire);
        while !node.is_null() {
            let n = unsafe { &*node };
            f(&n.stream);
            node = n.next;
        }
    }
}

impl Drop for StreamRegistry {
    fn drop(&mut self) {
        let mut node = *self.head.get_mut();
        while !node.is_null() {
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
        }
    }
}

// ── Capture engine ──

/// Per-session capture engine.
///
/// Owns one [`CaptureStream`] per intercepted device handle and fronts the
/// intercept surface the interposer shims call into. The producer side
/// (`writei`/`writen`/`mmap_*`) may execute inside the host's signal handler
/// when a device was opened in async mode, so everything on that path sticks
/// to atomics, semaphore posts, spinlocks and plain copies; blocking I/O and
/// allocation happen on the per-stream worker threads.
pub struct CaptureEngine {
    flags: AtomicU32,
    started: AtomicBool,
    target: OnceLock<Arc<dyn PacketBuffer>>,
    streams: StreamRegistry,
    clock: Arc<dyn CaptureClock>,
    ids: Arc<dyn StreamIds>,
}

impl CaptureEngine {
    pub fn new() -> CaptureEngine {
        Self::with_services(Arc::new(MonotonicClock), Arc::new(SerialStreamIds::new()))
    }

    /// Engine with caller-provided clock and stream-id services.
    pub fn with_services(clock: Arc<dyn CaptureClock>, ids: Arc<dyn StreamIds>) -> CaptureEngine {
        CaptureEngine {
            flags: AtomicU32::new(0),
            started: AtomicBool::new(false),
            target: OnceLock::new(),
            streams: StreamRegistry::new(),
            clock,
            ids,
        }
    }

    // ── Control surface ──

    /// Bind the downstream packet buffer all workers write into. One-shot.
    pub fn bind_target(&self, buffer: Arc<dyn PacketBuffer>) -> Result<(), CaptureError> {
        self.target.set(buffer).map_err(|_| CaptureError::AlreadyBound)
    }

    /// When set, an async producer that finds the worker busy drops the
    /// period immediately instead of spinning for it.
    pub fn allow_skip(&self, allow: bool) {
        if allow {
            self.flags.fetch_or(ALLOW_SKIP, Ordering::Relaxed);
        } else {
            self.flags.fetch_and(!ALLOW_SKIP, Ordering::Relaxed);
        }
    }

    pub fn start(&self) -> Result<(), CaptureError> {
        if self.target.get().is_none() {
            log::error!("capture start refused: no target buffer bound");
            return Err(CaptureError::NotReady);
        }
        if !self.started.load(Ordering::SeqCst) {
            self.init_streams();
        }
        if self.flags.load(Ordering::Relaxed) & CAPTURING != 0 {
            log::warn!("capture is already active");
        } else {
            log::info!("starting capture");
        }
        self.flags.fetch_or(CAPTURING, Ordering::Relaxed);
        Ok(())
    }

    pub fn stop(&self) {
        if self.flags.load(Ordering::Relaxed) & CAPTURING != 0 {
            log::info!("stopping capture");
        } else {
            log::warn!("capture is already stopped");
        }
        self.flags.fetch_and(!CAPTURING, Ordering::Relaxed);
    }

    /// Telemetry snapshots for every known stream, most recently seen first.
    pub fn stream_stats(&self) -> Vec<StreamStats> {
        let mut out = Vec::new();
        self.streams.for_each(|s| {
            out.push(s.stats.snapshot(s.device, s.stream_id.load(Ordering::Relaxed)));
        });
        out
    }

    fn capturing(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & CAPTURING != 0
    }

    fn skip_allowed(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & ALLOW_SKIP != 0
    }

    /// First start: bring up every stream that negotiated a format while the
    /// engine was idle. Per-stream failures are logged, not propagated; the
    /// host's audio must keep flowing regardless.
    fn init_streams(&self) {
        self.streams.for_each(|stream| {
            if stream.has_format.load(Ordering::SeqCst) && !stream.initialized.load(Ordering::SeqCst)
            {
                let _guard = stream.lock_write();
                if let Err(e) = self.initialize_stream(stream) {
                    log::error!("{}: stream initialization failed: {}", stream.device, e);
                }
            }
        });
        self.started.store(true, Ordering::SeqCst);
    }

    // ── Lifecycle intercepts ──

    /// Device opened by the host. Creates the stream record and pins the
    /// open mode; async mode decides the stream's locking discipline.
    pub fn open(&self, device: DeviceId, name: &str, dir: StreamDirection, mode: OpenMode) {
        let _errno = ErrnoGuard::save();
        let stream = self.streams.get_or_create(device);
        stream.set_mode(mode);
        log::info!(
            "{}: opened device \"{}\" for {:?} with mode {:#04x} (async={}, nonblock={})",
            device,
            name,
            dir,
            mode.bits(),
            if mode.is_async() { "yes" } else { "no" },
            if mode.is_nonblock() { "yes" } else { "no" },
        );
    }

    /// Device closed by the host. Only drops the format so the next start
    /// will not reinitialize; the worker keeps draining any in-flight
    /// period. Full teardown happens at engine drop.
    pub fn close(&self, device: DeviceId) {
        let _errno = ErrnoGuard::save();
        let stream = self.streams.get_or_create(device);
        log::info!(
            "{}: closing stream {}",
            device,
            stream.stream_id.load(Ordering::Relaxed)
        );
        stream.has_format.store(false, Ordering::SeqCst);
    }

    // ── Format negotiation ──

    /// Translate the host's hardware parameters into the stream's format
    /// descriptor. Unsupported sample formats are rejected and the stream
    /// stays uninitialized; the host continues unaffected.
    pub fn hw_params(&self, device: DeviceId, params: &HwParams) -> Result<(), CaptureError> {
        let _errno = ErrnoGuard::save();
        let stream = self.streams.get_or_create(device);
        let _guard = stream.lock_write();

        log::debug!(
            "{}: creating/updating configuration for stream {}",
            device,
            stream.stream_id.load(Ordering::Relaxed)
        );

        let format = match SampleFormat::from_pcm(params.format) {
            Some(format) => format,
            None => {
                log::error!("{}: unsupported sample format {:?}", device, params.format);
                return Err(CaptureError::NotSupported(format!(
                    "sample format {:?}",
                    params.format
                )));
            }
        };
        let layout = ChannelLayout::from_access(params.access);

        // A live worker only touches scratch/pending/capture_time; the
        // format fields can be written without waiting for it.
        unsafe {
            let st = stream.state();
            (*st).format = format;
            (*st).rate = params.rate;
            (*st).channels = params.channels;
            (*st).period_size = params.period_size;
            (*st).layout = layout;
        }
        log::debug!(
            "{}: {} channels, rate {}, period {}, layout {:?}",
            device,
            params.channels,
            params.rate,
            params.period_size,
            layout
        );

        stream.has_format.store(true, Ordering::SeqCst);
        if self.started.load(Ordering::SeqCst) {
            self.initialize_stream(&stream)?;
        }
        Ok(())
    }

    /// Bind the stream to the downstream buffer for its current format:
    /// emit the format message and (re)spawn the worker. Caller holds the
    /// stream's write lock.
    fn initialize_stream(&self, stream: &Arc<CaptureStream>) -> Result<(), CaptureError> {
        if stream.stream_id.load(Ordering::SeqCst) == 0 {
            stream
                .stream_id
                .store(self.ids.next_stream_id(), Ordering::SeqCst);
        }
        let stream_id = stream.stream_id.load(Ordering::SeqCst);
        log::info!("{}: initializing stream {}", stream.device, stream_id);

        // A previous worker owns the previous packet channel; both go away
        // here. Safe mid-lock: workers never take the write lock.
        stream.quiesce_worker();

        // Handoff state starts clean for the new worker. No producer can be
        // parked on `empty` while we hold the write lock.
        stream.full.reset(0);
        stream.empty.reset(1);
        stream.ready.store(false, Ordering::SeqCst);
        unsafe {
            (*stream.state()).pending = PendingJob::Idle;
        }

        let target = self.target.get().ok_or(CaptureError::NotReady)?;
        let mut packet = target.channel()?;

        let msg = {
            let st = unsafe { &*stream.state() };
            wire::FormatMessage {
                stream_id,
                flags: if st.layout.emits_interleaved() {
                    wire::FORMAT_INTERLEAVED
                } else {
                    0
                },
                rate: st.rate,
                channels: st.channels,
                format: st.format.wire_code(),
            }
        };
        worker::emit_format(packet.as_mut(), &msg)?;

        stream.running.store(true, Ordering::SeqCst);
        let handle =
            worker::spawn_capture_worker(Arc::clone(stream), packet, stream_id, stream.is_async())?;
        *stream
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        stream.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    // ── Producer path ──

    /// Interleaved read-write deposit. May run in signal context for async
    /// streams. `buf` must hold at least `frames` frames at the negotiated
    /// format.
    pub fn writei(&self, device: DeviceId, buf: &[u8], frames: u64) -> Result<(), CaptureError> {
        let _errno = ErrnoGuard::save();
        if !self.capturing() {
            return Ok(());
        }
        let stream = self.streams.get_or_create(device);
        if !stream.initialized.load(Ordering::SeqCst) {
            return Err(CaptureError::InvalidState);
        }
        let _guard = stream.lock_write();
        self.wait_for_worker(&stream)?;

        let result = (|| {
            let size = unsafe { (*stream.state()).frames_to_bytes(frames) };
            self.prepare_deposit(&stream, size)?;
            {
                let st = unsafe { &mut *stream.state() };
                st.capture_time_ns = self.clock.now_ns();
                st.scratch[..size].copy_from_slice(&buf[..size]);
            }
            stream.stats.record_capture(size);
            stream.full.post();
            Ok(())
        })();
        if result.is_err() {
            self.abort_deposit(&stream);
        }
        result
    }

    /// Planar read-write deposit: channel `c` of `bufs` lands in its own
    /// contiguous slab. Rejected on interleaved streams. Each buffer must
    /// hold at least `frames` samples.
    pub fn writen(
        &self,
        device: DeviceId,
        bufs: &[&[u8]],
        frames: u64,
    ) -> Result<(), CaptureError> {
        let _errno = ErrnoGuard::save();
        if !self.capturing() {
            return Ok(());
        }
        let stream = self.streams.get_or_create(device);
        if !stream.initialized.load(Ordering::SeqCst) {
            return Err(CaptureError::InvalidState);
        }
        let _guard = stream.lock_write();

        let layout = unsafe { (*stream.state()).layout };
        if layout == ChannelLayout::Interleaved {
            if !stream.is_async() {
                log::error!(
                    "{}: stream layout (interleaved) incompatible with per-channel write",
                    device
                );
            }
            return Err(CaptureError::InvalidArg(
                "per-channel write on an interleaved stream",
            ));
        }

        self.wait_for_worker(&stream)?;
        let result = (|| {
            let (size, chan_bytes, channels) = unsafe {
                let st = &*stream.state();
                (
                    st.frames_to_bytes(frames),
                    st.samples_to_bytes(frames),
                    st.channels as usize,
                )
            };
            self.prepare_deposit(&stream, size)?;
            {
                let st = unsafe { &mut *stream.state() };
                st.capture_time_ns = self.clock.now_ns();
                for (c, chan) in bufs.iter().enumerate().take(channels) {
                    st.scratch[c * chan_bytes..(c + 1) * chan_bytes]
                        .copy_from_slice(&chan[..chan_bytes]);
                }
            }
            stream.stats.record_capture(size);
            stream.full.post();
            Ok(())
        })();
        if result.is_err() {
            self.abort_deposit(&stream);
        }
        result
    }

    /// Snapshot the mmap window for the matching commit. No deposit happens
    /// here.
    ///
    /// # Safety
    ///
    /// `areas`, and the host mappings its entries point into, must remain
    /// valid until the matching `mmap_commit` on this device returns; the
    /// commit reads host memory through the stored pointers.
    pub unsafe fn mmap_begin(
        &self,
        device: DeviceId,
        areas: &[ChannelArea],
        offset: u64,
        frames: u64,
    ) -> Result<(), CaptureError> {
        let _errno = ErrnoGuard::save();
        if !self.capturing() {
            return Ok(());
        }
        let stream = self.streams.get_or_create(device);
        if !stream.initialized.load(Ordering::SeqCst) {
            return Err(CaptureError::InvalidState);
        }
        let _guard = stream.lock_write();
        let st = stream.state();
        (*st).mmap_areas = areas.as_ptr();
        (*st).mmap_area_count = areas.len();
        (*st).mmap_offset = offset;
        (*st).mmap_frames = frames;
        Ok(())
    }

    /// Deposit the frames the host just committed from its mmap window.
    pub fn mmap_commit(
        &self,
        device: DeviceId,
        offset: u64,
        frames: u64,
    ) -> Result<(), CaptureError> {
        let _errno = ErrnoGuard::save();
        if !self.capturing() {
            return Ok(());
        }
        let stream = self.streams.get_or_create(device);
        let _guard = stream.lock_write();

        let (channels, areas_ptr, area_count, begin_offset) = unsafe {
            let st = stream.state();
            (
                (*st).channels,
                (*st).mmap_areas,
                (*st).mmap_area_count,
                (*st).mmap_offset,
            )
        };
        if channels == 0 {
            return Ok(());
        }
        if areas_ptr.is_null() {
            // commit without begin does happen with some hosts
            if !stream.is_async() {
                log::warn!("{}: mmap commit before mmap begin", device);
            }
            return Ok(());
        }
        if offset != begin_offset && !stream.is_async() {
            log::warn!(
                "{}: commit offset {} != begin offset {}",
                device,
                offset,
                begin_offset
            );
        }

        self.wait_for_worker(&stream)?;
        let result = (|| {
            let size = unsafe { (*stream.state()).frames_to_bytes(frames) };
            self.prepare_deposit(&stream, size)?;
            {
                let st = unsafe { &mut *stream.state() };
                st.capture_time_ns = self.clock.now_ns();
                // Valid per mmap_begin's contract: the window outlives the
                // commit.
                let areas = unsafe { std::slice::from_raw_parts(areas_ptr, area_count) };
                match st.layout {
                    ChannelLayout::Interleaved => unsafe {
                        let src = areas[0].pos(offset);
                        std::ptr::copy_nonoverlapping(src, st.scratch.as_mut_ptr(), size);
                    },
                    ChannelLayout::ComplexPlanar => {
                        complex_to_interleaved(st, areas, offset, frames);
                    }
                    ChannelLayout::Planar => {
                        let chan_bytes = st.samples_to_bytes(frames);
                        for c in 0..st.channels as usize {
                            unsafe {
                                let src = areas[c].pos(offset);
                                std::ptr::copy_nonoverlapping(
                                    src,
                                    st.scratch.as_mut_ptr().add(c * chan_bytes),
                                    chan_bytes,
                                );
                            }
                        }
                    }
                }
            }
            stream.stats.record_capture(size);
            stream.full.post();
            Ok(())
        })();
        if result.is_err() {
            self.abort_deposit(&stream);
        }
        result
    }

    // ── Producer-path plumbing ──

    /// Block (or spin) until the stream's worker can take a new deposit.
    fn wait_for_worker(&self, stream: &CaptureStream) -> Result<(), CaptureError> {
        if stream.is_async() {
            // Signal context: busy-check the worker's parked flag instead of
            // sleeping on the empty credit.
            while !stream.ready.load(Ordering::SeqCst) {
                if !stream.running.load(Ordering::SeqCst) || self.skip_allowed() {
                    stream.stats.record_skip();
                    return Err(CaptureError::Busy);
                }
                unsafe {
                    libc::sched_yield();
                }
            }
        } else {
            if !stream.running.load(Ordering::SeqCst) {
                // worker died on a packet error; the stream is silently dead
                stream.stats.record_skip();
                return Err(CaptureError::Busy);
            }
            stream.empty.wait();
        }
        Ok(())
    }

    /// Size the pending payload. On success the caller fills
    /// `scratch[..size]` and posts `full`. `Err(Busy)` means the grow was
    /// deferred to the worker (async mode) and `full` has been posted here;
    /// the period is dropped.
    fn prepare_deposit(&self, stream: &CaptureStream, size: usize) -> Result<(), CaptureError> {
        let deferred = {
            let st = unsafe { &mut *stream.state() };
            if size <= st.scratch.len() {
                st.pending = PendingJob::Emit(size);
                false
            } else if !stream.is_async() {
                st.grow_scratch(size)?;
                st.pending = PendingJob::Emit(size);
                false
            } else {
                // Allocation is forbidden in signal context; ask the worker
                // to enlarge the buffer for next time on our behalf.
                st.pending = PendingJob::Grow(size);
                true
            }
        };
        if deferred {
            stream.stats.record_deferred_grow();
            stream.full.post();
            return Err(CaptureError::Busy);
        }
        Ok(())
    }

    /// Hand the consumed empty credit back when a deposit fails after the
    /// worker wait; without this the next non-async period would block
    /// forever.
    fn abort_deposit(&self, stream: &CaptureStream) {
        if !stream.is_async() {
            stream.empty.post();
        }
    }
}

impl Default for CaptureEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        // Quiesce every worker before the registry frees the records.
        self.streams.for_each(|stream| stream.quiesce_worker());
    }
}

/// De-interleave a complex-planar window into packed interleaved frames:
/// channel `c` sample `s` lands at `s * frame_stride + c * sample_size`.
/// One copy per sample; this is the expensive layout.
fn complex_to_interleaved(st: &mut StreamState, areas: &[ChannelArea], offset: u64, frames: u64) {
    let frame_stride = st.frames_to_bytes(1);
    let sample_size = st.samples_to_bytes(1);
    for c in 0..st.channels as usize {
        let mut dst = c * sample_size;
        for s in 0..frames {
            unsafe {
                let src = areas[c].pos(offset + s);
                std::ptr::copy_nonoverlapping(src, st.scratch.as_mut_ptr().add(dst), sample_size);
            }
            dst += frame_stride;
        }
    }
}
