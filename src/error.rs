//! Error types and handling for the avring library

use thiserror::Error;

/// Result type alias for avring operations
pub type Result<T> = std::result::Result<T, AvringError>;

/// Main error type for the avring library
#[derive(Error, Debug)]
pub enum AvringError {
    /// I/O errors from shared memory or socket operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call errors surfaced through nix
    #[error("System call error: {0}")]
    Sys(#[from] nix::Error),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Error message describing the configuration issue
        message: String,
    },

    /// The consumer id is not registered with the queue
    #[error("Consumer {id} not registered")]
    ConsumerNotFound {
        /// The unknown consumer id
        id: i32,
    },

    /// All consumer slots are taken
    #[error("Consumer table is full")]
    ConsumerTableFull,

    /// The consumer's local view of the ring is empty
    #[error("No buffer available")]
    NoBuffer,

    /// Memory allocation errors
    #[error("Memory allocation error: {message}")]
    Memory {
        /// Error message describing the memory issue
        message: String,
    },

    /// A produced frame exceeds the queue's preallocated slot size
    #[error("Frame of {len} bytes exceeds slot size {max}")]
    FrameTooLarge {
        /// Length of the rejected frame
        len: usize,
        /// Maximum frame size the queue was created with
        max: usize,
    },

    /// Fd channel socket errors
    #[error("Socket error: {message}")]
    Socket {
        /// Error message describing the socket issue
        message: String,
    },

    /// Generic error for unexpected conditions.
    /// This error should be used for situations that are not expected to
    /// happen in a correctly functioning system, such as a logic error.
    #[error("Unexpected error: {message}")]
    Unexpected {
        /// Error message describing the unexpected condition
        message: String,
    },
}

impl AvringError {
    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a new memory allocation error
    pub fn memory(message: impl Into<String>) -> Self {
        Self::Memory {
            message: message.into(),
        }
    }

    /// Create a new socket error
    pub fn socket(message: impl Into<String>) -> Self {
        Self::Socket {
            message: message.into(),
        }
    }

    /// Create a new unexpected error
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable by retrying later
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NoBuffer | Self::Socket { .. } | Self::Io(_))
    }

    /// Check if this error indicates a misuse of the queue API
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. }
                | Self::ConsumerNotFound { .. }
                | Self::FrameTooLarge { .. }
        )
    }
}
