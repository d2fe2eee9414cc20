//! Error types for mpiparams

use thiserror::Error;

/// Result type for MPI operations
pub type Result<T> = std::result::Result<T, Error>;

/// MPI error classes, as reported by `MPI_Error_class`.
///
/// The numeric values follow the MPI standard's ordering of the predefined
/// classes. Implementation-specific classes map to [`MpiErrorClass::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MpiErrorClass {
    /// No error
    Success,
    /// Invalid buffer pointer
    Buffer,
    /// Invalid count argument
    Count,
    /// Invalid datatype argument
    Type,
    /// Invalid tag argument
    Tag,
    /// Invalid communicator
    Comm,
    /// Invalid rank
    Rank,
    /// Invalid request handle
    Request,
    /// Invalid root
    Root,
    /// Invalid group
    Group,
    /// Invalid operation
    Op,
    /// Invalid topology
    Topology,
    /// Invalid dimension argument
    Dims,
    /// Invalid argument of some other kind
    Arg,
    /// Unknown error
    Unknown,
    /// Message truncated on receive
    Truncate,
    /// Known error not in this list
    Other,
    /// Internal MPI (implementation) error
    Intern,
    /// Error code is in status
    InStatus,
    /// Pending request
    Pending,
}

impl MpiErrorClass {
    /// Map a raw MPI error class to the enum.
    pub fn from_raw(class: i32) -> Self {
        match class {
            0 => MpiErrorClass::Success,
            1 => MpiErrorClass::Buffer,
            2 => MpiErrorClass::Count,
            3 => MpiErrorClass::Type,
            4 => MpiErrorClass::Tag,
            5 => MpiErrorClass::Comm,
            6 => MpiErrorClass::Rank,
            7 => MpiErrorClass::Request,
            8 => MpiErrorClass::Root,
            9 => MpiErrorClass::Group,
            10 => MpiErrorClass::Op,
            11 => MpiErrorClass::Topology,
            12 => MpiErrorClass::Dims,
            13 => MpiErrorClass::Arg,
            14 => MpiErrorClass::Unknown,
            15 => MpiErrorClass::Truncate,
            17 => MpiErrorClass::Intern,
            18 => MpiErrorClass::InStatus,
            19 => MpiErrorClass::Pending,
            _ => MpiErrorClass::Other,
        }
    }

    /// The raw MPI error class value.
    pub fn as_raw(self) -> i32 {
        match self {
            MpiErrorClass::Success => 0,
            MpiErrorClass::Buffer => 1,
            MpiErrorClass::Count => 2,
            MpiErrorClass::Type => 3,
            MpiErrorClass::Tag => 4,
            MpiErrorClass::Comm => 5,
            MpiErrorClass::Rank => 6,
            MpiErrorClass::Request => 7,
            MpiErrorClass::Root => 8,
            MpiErrorClass::Group => 9,
            MpiErrorClass::Op => 10,
            MpiErrorClass::Topology => 11,
            MpiErrorClass::Dims => 12,
            MpiErrorClass::Arg => 13,
            MpiErrorClass::Unknown => 14,
            MpiErrorClass::Truncate => 15,
            MpiErrorClass::Other => 16,
            MpiErrorClass::Intern => 17,
            MpiErrorClass::InStatus => 18,
            MpiErrorClass::Pending => 19,
        }
    }
}

impl std::fmt::Display for MpiErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Error types for MPI operations
#[derive(Error, Debug)]
pub enum Error {
    /// MPI has already been initialized
    #[error("MPI has already been initialized")]
    AlreadyInitialized,

    /// A rank, tag, root or parameter combination is not acceptable
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An output buffer must grow but its resize policy forbids it
    #[error("Buffer too small: {required} elements required, {actual} available and resizing is not allowed")]
    SizePolicyViolated {
        /// Number of elements the operation needs
        required: usize,
        /// Number of elements the buffer holds
        actual: usize,
    },

    /// An explicit count disagrees with the size of the buffer it describes
    #[error("Size mismatch: expected {expected} elements, buffer holds {actual}")]
    SizeMismatch {
        /// Count the caller supplied (or the operation derived)
        expected: usize,
        /// Elements available in the buffer
        actual: usize,
    },

    /// The underlying transport returned an error code
    #[error("MPI error (class {class}, code {code}): {message}")]
    Mpi {
        /// Error class of the failure
        class: MpiErrorClass,
        /// Raw error code returned by the transport
        code: i32,
        /// Message reported by the transport
        message: String,
    },

    /// Send and receive datatypes differ where the operation requires them equal
    #[error("Datatype mismatch: {0}")]
    TypeMismatch(String),

    /// A user-defined reduction operator could not be created
    #[error("Failed to create reduction operator: {0}")]
    OperatorConstruction(String),

    /// A rank that must provide a parameter did not provide it
    #[error("Logic error: {0}")]
    LogicError(String),

    /// Operation not supported by the active transport
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Encoding or decoding a serialized value failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an error from a transport error code and class.
    pub fn transport(code: i32, class: MpiErrorClass, message: impl Into<String>) -> Self {
        Error::Mpi {
            class,
            code,
            message: message.into(),
        }
    }

    /// Create an error from an MPI error code returned by the C layer.
    ///
    /// The error class and message are queried from the MPI runtime when the
    /// `mpi` feature is enabled.
    pub fn from_code(code: i32) -> Self {
        #[cfg(feature = "mpi")]
        {
            crate::transport::mpi::error_from_code(code)
        }
        #[cfg(not(feature = "mpi"))]
        {
            Error::Mpi {
                class: MpiErrorClass::Unknown,
                code,
                message: format!("transport returned code {code}"),
            }
        }
    }

    /// Check an MPI return code, returning Ok(()) for success.
    pub fn check(code: i32) -> Result<()> {
        if code == 0 {
            Ok(())
        } else {
            Err(Error::from_code(code))
        }
    }

    /// The transport error class, if this error came from the transport.
    pub fn class(&self) -> Option<MpiErrorClass> {
        match self {
            Error::Mpi { class, .. } => Some(*class),
            _ => None,
        }
    }

    /// The raw transport error code, if this error came from the transport.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Mpi { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_class_round_trips_through_raw() {
        for raw in 0..20 {
            let class = MpiErrorClass::from_raw(raw);
            assert_eq!(class.as_raw(), raw, "class {class:?} from raw {raw}");
        }
        assert_eq!(MpiErrorClass::from_raw(54), MpiErrorClass::Other);
    }

    #[test]
    fn check_success_is_ok() {
        assert!(Error::check(0).is_ok());
    }

    #[test]
    fn transport_error_keeps_code_and_class() {
        let err = Error::transport(6, MpiErrorClass::Rank, "invalid rank 9");
        assert_eq!(err.code(), Some(6));
        assert_eq!(err.class(), Some(MpiErrorClass::Rank));
        assert!(err.to_string().contains("invalid rank 9"));
    }

    #[test]
    fn size_policy_message_names_both_sizes() {
        let err = Error::SizePolicyViolated {
            required: 10,
            actual: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains("10") && msg.contains('4'), "{msg}");
        assert_eq!(err.code(), None);
    }
}
