use thiserror::Error;

/// Errors surfaced by the platform adapter at agent load.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("unsupported platform: {0}")]
    UnavailablePlatform(&'static str),
    /// Fatal: without a monotonic clock there are no usable timestamps.
    #[error("required symbol not found: {0}")]
    SymbolNotFound(&'static str),
}

/// Why the instrumentation framework refused to attach a listener.
///
/// All variants share one disposition: the hook is silently dropped, its
/// func-id reclaimed, and the overall command still succeeds.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AttachError {
    #[error("address too small to hook")]
    AddressTooSmall,
    #[error("address not executable")]
    NotExecutable,
}

/// Recoverable per-target memory failures. Sibling targets proceed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Null pointer at {0}")]
    NullPointer(String),
    #[error("Address 0x{0:x} not readable")]
    AddressNotReadable(u64),
    #[error("Address 0x{addr:x} misaligned for {size}-byte access")]
    InvalidAlignment { addr: u64, size: u8 },
}

/// Whole-command rejections for malformed configuration.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("validation failed: {0}")]
    Validation(String),
}

impl CommandError {
    pub fn validation(msg: impl Into<String>) -> Self {
        CommandError::Validation(msg.into())
    }
}
