//! # Error Definitions

/// Failures while framing, encoding or decoding wire data.
#[derive(Debug, Clone)]
pub enum Error {
    /// A value could not be encoded.
    Serialization(String),
    /// Bytes on the wire did not decode into the expected shape.
    Deserialization(String),
    /// A frame exceeded the configured size limit.
    FrameTooLarge { len: usize, max: usize },
    /// The peer's first frame was not a valid preamble.
    BadPreamble(String),
    /// The peer speaks a protocol version we do not.
    UnsupportedVersion(u16),
    /// The underlying byte stream failed.
    Io(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(msg) => write!(f, "Serialization failed: {}", msg),
            Self::Deserialization(msg) => write!(f, "Deserialization failed: {}", msg),
            Self::FrameTooLarge { len, max } => {
                write!(f, "Frame of {} bytes exceeds limit of {} bytes", len, max)
            }
            Self::BadPreamble(msg) => write!(f, "Bad preamble: {}", msg),
            Self::UnsupportedVersion(v) => write!(f, "Unsupported protocol version: {}", v),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// A specialized Result type for wire operations.
pub type Result<T> = std::result::Result<T, Error>;
