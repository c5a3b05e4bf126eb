//! Domain-specific error types for pixwire.
//!
//! Wire and transport operations return `Result<T, PixwireError>`.
//! Encode attempts return `Result<T, EncodeError>` so the pipeline can
//! branch on the failure kind (retry, fall back, or drop the frame)
//! instead of unwinding.

use thiserror::Error;

/// The canonical error type for pixwire.
#[derive(Debug, Error)]
pub enum PixwireError {
    // ── Framing Errors ───────────────────────────────────────────
    /// A packet header could not be parsed or failed validation.
    #[error("malformed header: {0}")]
    MalformedHeader(&'static str),

    /// A packet declared a size above the codec limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A packet violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    // ── Compression Errors ───────────────────────────────────────
    /// The payload exceeds the compression ceiling.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The level byte selects an algorithm that is not enabled.
    #[error("unsupported compressor: {0}")]
    UnsupportedCompressor(String),

    /// The compressor itself failed.
    #[error("compression error: {0}")]
    Compression(String),

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// A channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding or decoding of a packet body failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    // ── Pipeline Errors ──────────────────────────────────────────
    /// An encode attempt failed.
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── EncodeError ──────────────────────────────────────────────────

/// Why a single encode attempt failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EncodeError {
    /// No scored (csc, encoder) combination can handle the frame.
    #[error("no video pipeline for {format} {width}x{height}")]
    NoPipeline {
        format: String,
        width: u32,
        height: u32,
    },

    /// A converter or encoder failed to initialise.
    #[error("{codec} failed to initialise: {reason}")]
    CodecInit { codec: String, reason: String },

    /// A converter or encoder failed while processing a frame.
    #[error("{codec} failed: {reason}")]
    Codec { codec: String, reason: String },

    /// The encoder instance was closed underneath us.
    #[error("{0} is closed")]
    Closed(String),

    /// The frame's sequence was cancelled before or during encoding.
    #[error("sequence {0} was cancelled")]
    Cancelled(u64),

    /// The requested encoding is not available.
    #[error("unsupported encoding: {0}")]
    Unsupported(String),

    /// The frame does not match what the codec expects.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

impl EncodeError {
    /// Whether another option (or a non-video encoding) may succeed
    /// where this attempt failed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EncodeError::NoPipeline { .. }
                | EncodeError::CodecInit { .. }
                | EncodeError::Codec { .. }
                | EncodeError::Unsupported(_)
        )
    }

    /// Short stable key used to log each failure kind only once.
    pub fn kind(&self) -> &'static str {
        match self {
            EncodeError::NoPipeline { .. } => "no-pipeline",
            EncodeError::CodecInit { .. } => "codec-init",
            EncodeError::Codec { .. } => "codec",
            EncodeError::Closed(_) => "closed",
            EncodeError::Cancelled(_) => "cancelled",
            EncodeError::Unsupported(_) => "unsupported",
            EncodeError::InvalidFrame(_) => "invalid-frame",
        }
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for PixwireError {
    fn from(s: String) -> Self {
        PixwireError::Other(s)
    }
}

impl From<&str> for PixwireError {
    fn from(s: &str) -> Self {
        PixwireError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for PixwireError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        PixwireError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for PixwireError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        PixwireError::Encoding(e.to_string())
    }
}

impl From<serde_json::Error> for PixwireError {
    fn from(e: serde_json::Error) -> Self {
        PixwireError::Encoding(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = PixwireError::MalformedHeader("short read");
        assert!(e.to_string().contains("short read"));

        let e = PixwireError::PayloadTooLarge {
            size: 1000,
            max: 500,
        };
        assert!(e.to_string().contains("1000"));
        assert!(e.to_string().contains("500"));
    }

    #[test]
    fn from_string() {
        let e: PixwireError = "something broke".into();
        assert!(matches!(e, PixwireError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: PixwireError = io_err.into();
        assert!(matches!(e, PixwireError::Connection(_)));
    }

    #[test]
    fn transient_kinds() {
        let e = EncodeError::Codec {
            codec: "x".into(),
            reason: "boom".into(),
        };
        assert!(e.is_transient());
        assert_eq!(e.kind(), "codec");
        assert!(!EncodeError::Cancelled(3).is_transient());
        assert!(!EncodeError::Closed("enc".into()).is_transient());
    }
}
