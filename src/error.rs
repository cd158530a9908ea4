use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::{IndexedFrame, Phase};

/// Every error this library can return.
///
/// Most fallible operations return a [`Result<T, NetplayError>`]. Conditions the
/// core is designed to absorb (packet loss, duplicate input batches, a snapshot
/// miss) are not errors and never show up here.
///
/// [`Result<T, NetplayError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetplayError {
    /// You made an invalid request, usually by using wrong parameters for function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// A configuration value is outside its permitted range.
    ConfigValueOutOfRange {
        /// Name of the offending field.
        field: &'static str,
        /// Smallest accepted value.
        min: u64,
        /// Largest accepted value.
        max: u64,
        /// The value that was supplied.
        actual: u64,
    },
    /// The requested phase is not reachable from the current phase.
    InvalidPhaseTransition {
        /// Phase the sync manager was in.
        from: Phase,
        /// Phase that was requested.
        to: Phase,
    },
    /// Remote input for the current frame has not arrived yet; the caller should
    /// skip this tick and try again.
    NotReady {
        /// The local indexed frame that is waiting.
        local: IndexedFrame,
        /// The newest remote indexed frame known.
        remote: IndexedFrame,
    },
    /// A snapshot operation was attempted before `allocate()`.
    SnapshotsNotAllocated,
    /// The memory accessor could not read or write the requested range.
    MemoryAccess {
        /// First address of the failed access.
        address: usize,
        /// Number of bytes requested.
        len: usize,
    },
    /// Serialization or deserialization of data failed.
    SerializationError {
        /// A description of what failed to serialize/deserialize.
        context: String,
    },
    /// An internal error occurred that should not happen under normal operation.
    InternalError {
        /// A description of the internal error.
        context: String,
    },
}

impl Display for NetplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetplayError::InvalidRequest { info } => {
                write!(f, "Invalid Request: {}", info)
            },
            NetplayError::ConfigValueOutOfRange {
                field,
                min,
                max,
                actual,
            } => {
                write!(
                    f,
                    "Configuration value {} = {} is outside [{}, {}]",
                    field, actual, min, max
                )
            },
            NetplayError::InvalidPhaseTransition { from, to } => {
                write!(f, "Invalid phase transition: {:?} -> {:?}", from, to)
            },
            NetplayError::NotReady { local, remote } => {
                write!(
                    f,
                    "Remote input not ready: local={}, remote={}",
                    local, remote
                )
            },
            NetplayError::SnapshotsNotAllocated => {
                write!(f, "Snapshot store used before allocate()")
            },
            NetplayError::MemoryAccess { address, len } => {
                write!(
                    f,
                    "Memory access failed at {:#x} ({} bytes)",
                    address, len
                )
            },
            NetplayError::SerializationError { context } => {
                write!(f, "Serialization error: {}", context)
            },
            NetplayError::InternalError { context } => {
                write!(f, "Internal error (please report as bug): {}", context)
            },
        }
    }
}

impl Error for NetplayError {}

impl From<crate::network::codec::CodecError> for NetplayError {
    fn from(err: crate::network::codec::CodecError) -> Self {
        NetplayError::SerializationError {
            context: err.to_string(),
        }
    }
}
