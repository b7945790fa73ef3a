//! # Error Types
//!
//! Error handling for the pickle codec.
//!
//! Every failure of a single `dumps`/`loads` call is reported through
//! [`PickleError`]. None of them touch shared state: the extension registry,
//! the security gate and other pickler/unpickler instances stay usable.
//!
//! ## Error Categories
//! - **Pickling**: the value graph cannot be expressed on the wire
//! - **Unpickling**: the byte stream is malformed (see [`UnpicklingError`])
//! - **Security**: a named global was not authorised by the host
//! - **End of input**: the stream stops before a value is complete
//! - **Configuration / registration**: host-side setup mistakes
//!
//! ## Example Usage
//! ```rust
//! use pickle_codec::error::PickleError;
//! use tracing::warn;
//!
//! fn report(err: &PickleError) {
//!     if err.is_security() {
//!         warn!(error = %err, "rejected untrusted pickle");
//!     }
//! }
//! # report(&PickleError::Pickling("x".into()));
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Registry lock errors
    pub const ERR_REGISTRY_WRITE_LOCK: &str = "Failed to acquire write lock on registry";
    pub const ERR_REGISTRY_READ_LOCK: &str = "Failed to acquire read lock on registry";

    /// Packing errors
    pub const ERR_MAX_DEPTH: &str =
        "Maximum nesting depth exceeded (cyclic value packed without reference tracking?)";
    pub const ERR_MEMO_OVERFLOW: &str = "Memo index space exhausted";
    pub const ERR_CONTAINER_TOO_LARGE: &str = "Container exceeds 2^32 - 1 elements";

    /// Unpacking errors
    pub const ERR_NESTED_VERSION: &str = "Protocol marker inside a value";
    pub const ERR_UNHASHABLE_KEY: &str = "Unhashable dictionary key";
    pub const ERR_UNHASHABLE_MEMBER: &str = "Unhashable set member";
    pub const ERR_INVALID_UTF8: &str = "Text payload is not valid UTF-8";
    pub const ERR_FRAME_TOO_LARGE: &str = "Buffered frame exceeds maximum frame size";
    pub const ERR_MAX_NESTING: &str = "Maximum nesting depth exceeded";
    pub const ERR_ODD_PAIR_STREAM: &str = "Pair stream ended after a key without a value";
    pub const ERR_CHUNK_HEADER: &str = "Expected a chunk header or end marker";
    pub const ERR_EXTENSION_WIDTH: &str = "Extension code must be 1, 2 or 4 bytes wide";
}

/// Distinguished kinds of malformed input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnpicklingError {
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("unsupported extension type {0}")]
    UnsupportedExtType(u8),

    #[error("extension code {0} is not registered")]
    UnknownExtensionCode(u32),

    #[error("end marker without an open item stream or chunk group")]
    UnmatchedEnd,

    #[error("reference to memo index {0} that was never assigned")]
    DanglingReference(u32),

    #[error("reference to memo index {0} before its object was built")]
    ForwardReference(u32),

    #[error("expected {expected}, found {found}")]
    UnexpectedValue {
        expected: &'static str,
        found: &'static str,
    },

    #[error("{0}")]
    Malformed(String),
}

// PickleError is the primary error type for all codec operations
#[derive(Error, Debug)]
pub enum PickleError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Pickling error: {0}")]
    Pickling(String),

    #[error("Unpickling error: {0}")]
    Unpickling(#[from] UnpicklingError),

    #[error("Security error: {module}.{name} is not allowed to be unpickled")]
    Security { module: String, name: String },

    #[error("Unexpected end of input: {needed} more byte(s) required")]
    EndOfInput { needed: usize },

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Registration error: {0}")]
    Registration(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl PickleError {
    /// True for security gate denials.
    pub fn is_security(&self) -> bool {
        matches!(self, PickleError::Security { .. })
    }

    /// True when the input stopped before the value was complete.
    pub fn is_end_of_input(&self) -> bool {
        matches!(self, PickleError::EndOfInput { .. })
    }

    /// True for malformed streams (data corruption rather than policy).
    pub fn is_malformed(&self) -> bool {
        matches!(self, PickleError::Unpickling(_))
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        PickleError::Unpickling(UnpicklingError::Malformed(msg.into()))
    }

    pub(crate) fn unexpected(expected: &'static str, found: &'static str) -> Self {
        PickleError::Unpickling(UnpicklingError::UnexpectedValue { expected, found })
    }
}

/// Type alias for Results using PickleError
pub type Result<T> = std::result::Result<T, PickleError>;
