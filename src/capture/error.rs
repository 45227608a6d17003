/// Typed capture errors surfaced to the interposer shim.
///
/// The shim decides what the host sees; most of these translate to an errno
/// on the interposed call, and `Busy` under allow-skip is plain success from
/// the host's point of view.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("downstream buffer already bound")]
    AlreadyBound,
    #[error("no downstream buffer bound")]
    NotReady,
    #[error("stream is not initialized")]
    InvalidState,
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),
    #[error("unsupported hardware configuration: {0}")]
    NotSupported(String),
    #[error("capture buffer allocation failed")]
    OutOfMemory,
    #[error("capture worker is busy")]
    Busy,
    #[error("packet stream error: {0}")]
    Io(#[from] std::io::Error),
}
