//! Error types and status codes shared across the boundary.
//!
//! Library internals return `Result` with these types; the C ABI collapses
//! them into the sentinel codes the host sees.
use thiserror::Error;

/// Status code for a successful engine or adapter call.
pub const STATUS_OK: i32 = 0;

/// Universal "invalid" sentinel for method and model ids.
pub const INVALID_ID: i32 = -1;

/// Errors raised by the memory bridge.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("invalid block size: {0}")]
    InvalidSize(i64),

    #[error("block of {size} bytes exceeds the limit of {limit} bytes")]
    BlockTooLarge { size: usize, limit: usize },

    #[error("allocation of {0} bytes failed")]
    AllocationFailed(usize),

    #[error("unknown or released handle: {0}")]
    UnknownHandle(u64),

    #[error("handle {handle}: access of {len} bytes at offset {offset} exceeds block size {size}")]
    OutOfBounds {
        handle: u64,
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("handle {handle}: offset {offset} is not aligned to {align} bytes")]
    Misaligned {
        handle: u64,
        offset: usize,
        align: usize,
    },

    #[error("handle {0} refers to an embedding batch; use release_batch")]
    NotHostBlock(u64),

    #[error("handle {0} does not refer to an embedding batch")]
    NotBatch(u64),
}

/// Failure statuses returned by generation calls.
///
/// The discriminants are the exact codes that cross the C boundary.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    #[error("invalid argument")]
    InvalidArgument = -1,

    #[error("unknown method or model, or modality not supported by the model")]
    InvalidModel = -2,

    #[error("input payload is empty")]
    EmptyInput = -3,

    #[error("modality tag does not match the populated slice arrays")]
    ModalityMismatch = -4,

    #[error("text slice is not valid UTF-8")]
    InvalidUtf8 = -5,

    #[error("embedding generation failed")]
    GenerationFailed = -6,

    #[error("output allocation failed")]
    AllocationFailed = -7,
}

impl Status {
    /// Every failure status, in code order.
    pub const ALL: [Status; 7] = [
        Status::InvalidArgument,
        Status::InvalidModel,
        Status::EmptyInput,
        Status::ModalityMismatch,
        Status::InvalidUtf8,
        Status::GenerationFailed,
        Status::AllocationFailed,
    ];

    /// The raw code for this status.
    #[must_use]
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map a raw engine code back to a status.
    ///
    /// Returns `None` for `0` and for codes outside the known set.
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }
}

/// Failure of a generate call.
///
/// Engine codes outside [`Status`] are kept as-is so the host sees exactly
/// what the engine returned.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerateError {
    #[error(transparent)]
    Status(#[from] Status),

    #[error("engine returned status {0}")]
    Engine(i32),
}

impl GenerateError {
    /// Wrap a non-zero engine code.
    #[must_use]
    pub fn from_engine(code: i32) -> Self {
        Status::from_code(code).map_or(Self::Engine(code), Self::Status)
    }

    /// The raw code returned to the host.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Status(status) => status.code(),
            Self::Engine(code) => code,
        }
    }

    /// Collapse a `Result` into the code the host sees.
    #[must_use]
    pub fn code_of<T>(result: &Result<T, GenerateError>) -> i32 {
        match result {
            Ok(_) => STATUS_OK,
            Err(e) => e.code(),
        }
    }
}

impl From<BridgeError> for GenerateError {
    fn from(err: BridgeError) -> Self {
        Self::Status(err.into())
    }
}

impl From<BridgeError> for Status {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::AllocationFailed(_) | BridgeError::BlockTooLarge { .. } => {
                Status::AllocationFailed
            }
            _ => Status::InvalidArgument,
        }
    }
}
