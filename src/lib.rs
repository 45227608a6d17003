//! Out-of-band capture of a host process's PCM playback.
//!
//! `pcm-tap` sits behind a set of interposed playback-library entry points
//! (`open`, `hw_params`, `writei`, `writen`, `mmap_begin`, `mmap_commit`,
//! `close`). Each intercepted call deposits one period of samples into a
//! per-device capture stream and returns without perturbing the host's audio
//! path; a dedicated worker thread per stream serializes the deposits into a
//! downstream packet stream for a separate encoding/muxing pipeline.
//!
//! The awkward part, and the reason for the shape of everything in
//! [`capture`], is that hosts using async PCM I/O drive these entry points
//! from a SIGIO handler: the producer side must stay async-signal-safe, so
//! it is restricted to atomics, semaphore posts, spinlocks and plain copies,
//! with blocking packet I/O and buffer growth delegated to the workers.

pub mod capture;

pub use capture::{
    CaptureClock, CaptureEngine, CaptureError, ChannelArea, ChannelLayout, DeviceId, HwParams,
    MonotonicClock, OpenMode, PacketBuffer, PacketChannel, PcmAccess, PcmFormat, SampleFormat,
    SerialStreamIds, StreamDirection, StreamIds, StreamStats,
};
