use serde::{Deserialize, Serialize};

// ── Device identity ──

/// Opaque identity of an intercepted device handle.
///
/// The engine never dereferences this; it exists only so intercepts on the
/// same host handle resolve to the same capture stream. Interposer shims
/// typically pass the host handle's pointer value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceId(pub usize);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// ── Open mode ──

/// Host open-mode bits recorded at `open` time.
///
/// `ASYNC` is the one that matters: it means the host drives its PCM I/O from
/// a signal handler, so the producer path must stay async-signal-safe.
/// `NONBLOCK` is cosmetic and only logged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenMode {
    bits: u32,
}

impl OpenMode {
    pub const NONBLOCK: OpenMode = OpenMode { bits: 0x1 };
    pub const ASYNC: OpenMode = OpenMode { bits: 0x2 };

    pub fn from_bits(bits: u32) -> OpenMode {
        OpenMode { bits }
    }

    pub fn bits(self) -> u32 {
        self.bits
    }

    pub fn is_async(self) -> bool {
        self.bits & Self::ASYNC.bits != 0
    }

    pub fn is_nonblock(self) -> bool {
        self.bits & Self::NONBLOCK.bits != 0
    }
}

impl std::ops::BitOr for OpenMode {
    type Output = OpenMode;
    fn bitor(self, rhs: OpenMode) -> OpenMode {
        OpenMode { bits: self.bits | rhs.bits }
    }
}

/// Direction of the host stream; the engine only taps playback but records
/// what it was told for the open log line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamDirection {
    Playback,
    Capture,
}

// ── Sample formats ──

/// Raw sample-format code as reported by the host library at negotiation
/// time. Only the three little-endian signed linear codes are supported;
/// everything else is rejected in `hw_params`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcmFormat(pub u32);

impl PcmFormat {
    pub const S16_LE: PcmFormat = PcmFormat(2);
    pub const S24_LE: PcmFormat = PcmFormat(6);
    pub const S32_LE: PcmFormat = PcmFormat(10);
}

/// Negotiated sample format of a capture stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    S16Le,
    S24Le,
    S32Le,
}

impl SampleFormat {
    pub fn from_pcm(fmt: PcmFormat) -> Option<SampleFormat> {
        match fmt {
            PcmFormat::S16_LE => Some(SampleFormat::S16Le),
            PcmFormat::S24_LE => Some(SampleFormat::S24Le),
            PcmFormat::S32_LE => Some(SampleFormat::S32Le),
            _ => None,
        }
    }

    /// Bytes one sample occupies in host memory. S24_LE is LSB-justified in
    /// a 32-bit container, so its physical width is 4 bytes, not 3.
    pub fn sample_size(self) -> usize {
        match self {
            SampleFormat::S16Le => 2,
            SampleFormat::S24Le => 4,
            SampleFormat::S32Le => 4,
        }
    }

    /// Format code carried in the downstream format message.
    pub fn wire_code(self) -> u32 {
        match self {
            SampleFormat::S16Le => 1,
            SampleFormat::S24Le => 2,
            SampleFormat::S32Le => 3,
        }
    }
}

// ── Access / layout ──

/// Access mode reported by the host at negotiation time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PcmAccess {
    MmapInterleaved,
    MmapNoninterleaved,
    MmapComplex,
    RwInterleaved,
    RwNoninterleaved,
}

/// How the period payload reaches the engine.
///
/// `ComplexPlanar` means per-channel strides inside a shared mapping; those
/// deposits are converted to packed interleaved frames on copy, so the
/// emitted format is flagged interleaved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelLayout {
    Interleaved,
    Planar,
    ComplexPlanar,
}

impl ChannelLayout {
    pub fn from_access(access: PcmAccess) -> ChannelLayout {
        match access {
            PcmAccess::RwInterleaved | PcmAccess::MmapInterleaved => ChannelLayout::Interleaved,
            PcmAccess::MmapComplex => ChannelLayout::ComplexPlanar,
            PcmAccess::RwNoninterleaved | PcmAccess::MmapNoninterleaved => ChannelLayout::Planar,
        }
    }

    /// Whether the bytes this stream emits downstream are interleaved.
    pub fn emits_interleaved(self) -> bool {
        !matches!(self, ChannelLayout::Planar)
    }
}

// ── Negotiation input ──

/// Hardware parameters extracted from the host's negotiation call.
#[derive(Clone, Copy, Debug)]
pub struct HwParams {
    pub format: PcmFormat,
    pub rate: u32,
    pub channels: u32,
    pub period_size: u64,
    pub access: PcmAccess,
}

// ── Memory-mapped channel areas ──

/// One channel's addressing info within a host memory mapping.
///
/// `first` and `step` are in bits, as the host library reports them. Values
/// that are not multiples of 8 are unsupported (rejected layouts never reach
/// the copy path in practice; see `area_pos`).
#[derive(Clone, Copy, Debug)]
pub struct ChannelArea {
    pub addr: *mut u8,
    pub first: u32,
    pub step: u32,
}

impl ChannelArea {
    /// Address of frame `offset` within this area.
    ///
    /// # Safety
    ///
    /// `addr` must point into a live mapping large enough for `offset`.
    pub(crate) unsafe fn pos(&self, offset: u64) -> *const u8 {
        debug_assert!(self.first % 8 == 0 && self.step % 8 == 0);
        self.addr
            .add((self.first / 8) as usize + offset as usize * (self.step / 8) as usize)
    }
}
