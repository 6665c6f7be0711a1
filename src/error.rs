// Error types shared by the decode pipeline and the playback engine
// Every failure carries an ErrorKind (what the collaborator switches on) plus a message

use std::fmt;
use std::io;

use thiserror::Error;

/// Error taxonomy reported to the UI collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    FileNotFound,
    UnsupportedFormat,
    DecodingFailed,
    DeviceError,
    MemoryError,
    InvalidParameters,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::FileNotFound => "File not found",
            ErrorKind::UnsupportedFormat => "Unsupported audio format",
            ErrorKind::DecodingFailed => "Audio decoding failed",
            ErrorKind::DeviceError => "Audio device error",
            ErrorKind::MemoryError => "Memory allocation error",
            ErrorKind::InvalidParameters => "Invalid parameters",
        };
        f.write_str(label)
    }
}

/// A typed engine error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct AudioError {
    kind: ErrorKind,
    message: String,
}

impl AudioError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn file_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FileNotFound, message)
    }

    pub fn unsupported_format(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedFormat, message)
    }

    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DecodingFailed, message)
    }

    pub fn device(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeviceError, message)
    }

    pub fn memory(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MemoryError, message)
    }

    pub fn invalid_parameters(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParameters, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<io::Error> for AudioError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => AudioError::file_not_found(err.to_string()),
            io::ErrorKind::OutOfMemory => AudioError::memory(err.to_string()),
            _ => AudioError::decoding_failed(format!("I/O error: {}", err)),
        }
    }
}

impl From<std::collections::TryReserveError> for AudioError {
    fn from(err: std::collections::TryReserveError) -> Self {
        AudioError::memory(format!("Could not grow PCM buffer: {}", err))
    }
}

impl From<symphonia::core::errors::Error> for AudioError {
    fn from(err: symphonia::core::errors::Error) -> Self {
        use symphonia::core::errors::Error as SymphoniaError;
        match err {
            SymphoniaError::IoError(e) => AudioError::from(e),
            SymphoniaError::Unsupported(what) => {
                AudioError::unsupported_format(format!("Unsupported: {}", what))
            }
            other => AudioError::decoding_failed(other.to_string()),
        }
    }
}

impl From<hound::Error> for AudioError {
    fn from(err: hound::Error) -> Self {
        match err {
            hound::Error::IoError(e) => AudioError::from(e),
            hound::Error::Unsupported => {
                AudioError::unsupported_format("WAV sample layout is not supported")
            }
            hound::Error::FormatError(what) => {
                AudioError::unsupported_format(format!("Not a usable WAV file: {}", what))
            }
            other => AudioError::decoding_failed(other.to_string()),
        }
    }
}

impl From<rubato::ResamplerConstructionError> for AudioError {
    fn from(err: rubato::ResamplerConstructionError) -> Self {
        AudioError::decoding_failed(format!("Could not initialize resampler: {}", err))
    }
}

impl From<rubato::ResampleError> for AudioError {
    fn from(err: rubato::ResampleError) -> Self {
        AudioError::decoding_failed(format!("Resampling failed: {}", err))
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, AudioError>;

/// Errors raised while reading or writing the engine configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}
