use thiserror::Error;

/// Wire-level error codes carried in mailbox reply slots and exposed at the
/// API boundary. The numeric values are part of the shared-memory protocol.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok = 0,
    InvalArg = 1,
    NoMemory = 2,
    NotFound = 3,
    Exists = 4,
    Internal = 5,
    Unsupported = 6,
    ValidationFailed = 7,
    OperationFailed = 8,
    Unauthorized = 9,
    Locked = 10,
    Timeout = 11,
    CallbackFailed = 12,
    CallbackShelve = 13,
}

impl ErrorCode {
    pub fn from_u32(value: u32) -> ErrorCode {
        match value {
            0 => ErrorCode::Ok,
            1 => ErrorCode::InvalArg,
            2 => ErrorCode::NoMemory,
            3 => ErrorCode::NotFound,
            4 => ErrorCode::Exists,
            6 => ErrorCode::Unsupported,
            7 => ErrorCode::ValidationFailed,
            8 => ErrorCode::OperationFailed,
            9 => ErrorCode::Unauthorized,
            10 => ErrorCode::Locked,
            11 => ErrorCode::Timeout,
            12 => ErrorCode::CallbackFailed,
            13 => ErrorCode::CallbackShelve,
            _ => ErrorCode::Internal,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalArg(String),
    #[error("out of memory: {0}")]
    NoMemory(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    Exists(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("operation failed: {0}")]
    OperationFailed(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("locked: {0}")]
    Locked(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("callback failed: {0}")]
    CallbackFailed(String),
    /// Only legal from a CHANGE callback; tells the dispatcher to retry this
    /// subscriber on a later poll instead of replying now.
    #[error("callback shelved")]
    CallbackShelve,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalArg(_) => ErrorCode::InvalArg,
            Error::NoMemory(_) => ErrorCode::NoMemory,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::Exists(_) => ErrorCode::Exists,
            Error::Internal(_) => ErrorCode::Internal,
            Error::Unsupported(_) => ErrorCode::Unsupported,
            Error::ValidationFailed(_) => ErrorCode::ValidationFailed,
            Error::OperationFailed(_) => ErrorCode::OperationFailed,
            Error::Unauthorized(_) => ErrorCode::Unauthorized,
            Error::Locked(_) => ErrorCode::Locked,
            Error::Timeout(_) => ErrorCode::Timeout,
            Error::CallbackFailed(_) => ErrorCode::CallbackFailed,
            Error::CallbackShelve => ErrorCode::CallbackShelve,
            Error::Io(_) => ErrorCode::Internal,
        }
    }

    /// Rebuild an error from a wire code.
    pub fn from_code(code: ErrorCode, msg: &str) -> Error {
        match code {
            ErrorCode::Ok | ErrorCode::Internal => Error::Internal(msg.to_string()),
            ErrorCode::InvalArg => Error::InvalArg(msg.to_string()),
            ErrorCode::NoMemory => Error::NoMemory(msg.to_string()),
            ErrorCode::NotFound => Error::NotFound(msg.to_string()),
            ErrorCode::Exists => Error::Exists(msg.to_string()),
            ErrorCode::Unsupported => Error::Unsupported("unsupported operation"),
            ErrorCode::ValidationFailed => Error::ValidationFailed(msg.to_string()),
            ErrorCode::OperationFailed => Error::OperationFailed(msg.to_string()),
            ErrorCode::Unauthorized => Error::Unauthorized(msg.to_string()),
            ErrorCode::Locked => Error::Locked(msg.to_string()),
            ErrorCode::Timeout => Error::Timeout(msg.to_string()),
            ErrorCode::CallbackFailed => Error::CallbackFailed(msg.to_string()),
            ErrorCode::CallbackShelve => Error::CallbackShelve,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
