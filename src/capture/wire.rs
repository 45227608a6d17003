//! Downstream message framing.
//!
//! Every message is emitted as one packet on the downstream stream buffer.
//! All integers are little-endian and fields are packed in declaration
//! order, so a consumer in another process can parse them without a schema.
//!
//! Packet layout:
//!
//! ```text
//! AUDIO_FORMAT (kind 1):
//!   0  u32 kind
//!   4  u32 stream_id
//!   8  u32 flags          bit 0 = payload is interleaved
//!  12  u32 rate
//!  16  u32 channels
//!  20  u32 format_code    1 = S16_LE, 2 = S24_LE, 3 = S32_LE
//!
//! AUDIO_DATA (kind 2):
//!   0  u32 kind
//!   4  u32 stream_id
//!   8  u64 timestamp_ns
//!  16  u64 size
//!  24  ... size bytes of PCM ...
//! ```

pub const MSG_AUDIO_FORMAT: u32 = 1;
pub const MSG_AUDIO_DATA: u32 = 2;

/// Format-message flag: payload frames are interleaved.
pub const FORMAT_INTERLEAVED: u32 = 0x1;

pub const MESSAGE_HEADER_LEN: usize = 4;
pub const FORMAT_MESSAGE_LEN: usize = 20;
pub const DATA_HEADER_LEN: usize = 20;

/// Leading header of every downstream message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub kind: u32,
}

impl MessageHeader {
    pub fn to_bytes(self) -> [u8; MESSAGE_HEADER_LEN] {
        self.kind.to_le_bytes()
    }
}

/// Stream format announcement; precedes all data messages for its stream id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatMessage {
    pub stream_id: u32,
    pub flags: u32,
    pub rate: u32,
    pub channels: u32,
    pub format: u32,
}

impl FormatMessage {
    pub fn to_bytes(&self) -> [u8; FORMAT_MESSAGE_LEN] {
        let mut out = [0u8; FORMAT_MESSAGE_LEN];
        out[0..4].copy_from_slice(&self.stream_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.flags.to_le_bytes());
        out[8..12].copy_from_slice(&self.rate.to_le_bytes());
        out[12..16].copy_from_slice(&self.channels.to_le_bytes());
        out[16..20].copy_from_slice(&self.format.to_le_bytes());
        out
    }
}

/// Header of one captured period.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataHeader {
    pub stream_id: u32,
    pub timestamp_ns: u64,
    pub size: u64,
}

impl DataHeader {
    pub fn to_bytes(&self) -> [u8; DATA_HEADER_LEN] {
        let mut out = [0u8; DATA_HEADER_LEN];
        out[0..4].copy_from_slice(&self.stream_id.to_le_bytes());
        out[4..12].copy_from_slice(&self.timestamp_ns.to_le_bytes());
        out[12..20].copy_from_slice(&self.size.to_le_bytes());
        out
    }
}
