use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Primary SQLite result codes plus crate-specific conditions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    Ok,
    Error,
    Internal,
    Perm,
    Abort,
    Busy,
    Locked,
    NoMem,
    ReadOnly,
    Interrupt,
    IoErr,
    Corrupt,
    NotFound,
    Full,
    CantOpen,
    Protocol,
    Empty,
    Schema,
    TooBig,
    Constraint,
    Mismatch,
    Misuse,
    NoLfs,
    Auth,
    Format,
    Range,
    NotADb,
    Notice,
    Warning,
    Row,
    Done,
    /// Requested optional capability is unavailable in the backend.
    FeatureUnavailable,
    /// Unknown or backend-specific result code.
    Unknown(i32),
}

const PRIMARY_CODES: [ErrorCode; 29] = [
    ErrorCode::Ok,
    ErrorCode::Error,
    ErrorCode::Internal,
    ErrorCode::Perm,
    ErrorCode::Abort,
    ErrorCode::Busy,
    ErrorCode::Locked,
    ErrorCode::NoMem,
    ErrorCode::ReadOnly,
    ErrorCode::Interrupt,
    ErrorCode::IoErr,
    ErrorCode::Corrupt,
    ErrorCode::NotFound,
    ErrorCode::Full,
    ErrorCode::CantOpen,
    ErrorCode::Protocol,
    ErrorCode::Empty,
    ErrorCode::Schema,
    ErrorCode::TooBig,
    ErrorCode::Constraint,
    ErrorCode::Mismatch,
    ErrorCode::Misuse,
    ErrorCode::NoLfs,
    ErrorCode::Auth,
    ErrorCode::Format,
    ErrorCode::Range,
    ErrorCode::NotADb,
    ErrorCode::Notice,
    ErrorCode::Warning,
];

impl ErrorCode {
    /// Decode a raw result code. Extended codes map by their primary low byte.
    pub const fn from_code(code: i32) -> ErrorCode {
        let primary = code & 0xff;
        match primary {
            0..=28 => PRIMARY_CODES[primary as usize],
            100 => ErrorCode::Row,
            101 => ErrorCode::Done,
            _ => ErrorCode::Unknown(code),
        }
    }

    /// Numeric primary code, when this is an engine condition.
    pub fn code(self) -> Option<i32> {
        match self {
            ErrorCode::Row => Some(100),
            ErrorCode::Done => Some(101),
            ErrorCode::FeatureUnavailable => None,
            ErrorCode::Unknown(code) => Some(code),
            known => PRIMARY_CODES
                .iter()
                .position(|c| *c == known)
                .map(|idx| idx as i32),
        }
    }
}

pub(crate) const SQLITE_NOMEM: i32 = 7;

/// Error returned by bridge operations.
///
/// Resource-state, encoding and argument errors are raised before the engine
/// is touched; `Engine` always carries the exact status the engine returned.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Non-OK status returned by the engine.
    #[error("{}", engine_display(*code, message.as_deref()))]
    Engine {
        /// Exact native status (extended when extended codes are enabled).
        code: i32,
        /// Extended code reported by the connection, when queried.
        extended: Option<i32>,
        /// Engine error message, when obtainable.
        message: Option<String>,
    },
    #[error("database connection closed")]
    Closed,
    #[error("database already opened")]
    AlreadyOpen,
    #[error("statement finalized")]
    Finalized,
    /// Malformed UTF-8, CESU-8 or UTF-16 input.
    #[error("Bad UTF-8 coding! ({reason} at offset {offset})")]
    BadEncoding { offset: usize, reason: &'static str },
    #[error("Out of memory")]
    OutOfMemory,
    #[error("{0}")]
    Misuse(String),
    #[error("{0}")]
    FeatureUnavailable(&'static str),
}

fn engine_display(code: i32, message: Option<&str>) -> String {
    match message {
        Some(msg) => msg.to_owned(),
        None => format!("sqlite error code {}", code),
    }
}

impl Error {
    /// Build an error from a raw engine status.
    ///
    /// Memory exhaustion is never reported as an engine error.
    pub fn engine(code: i32, message: Option<String>, extended: Option<i32>) -> Self {
        if code & 0xff == SQLITE_NOMEM {
            return Error::OutOfMemory;
        }
        Error::Engine {
            code,
            extended,
            message,
        }
    }

    pub fn misuse(msg: impl Into<String>) -> Self {
        Error::Misuse(msg.into())
    }

    pub fn bad_encoding(offset: usize, reason: &'static str) -> Self {
        Error::BadEncoding { offset, reason }
    }

    /// Classify this error by primary result code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Engine { code, .. } => ErrorCode::from_code(*code),
            Error::OutOfMemory => ErrorCode::NoMem,
            Error::FeatureUnavailable(_) => ErrorCode::FeatureUnavailable,
            Error::BadEncoding { .. } => ErrorCode::Error,
            Error::Closed | Error::AlreadyOpen | Error::Finalized | Error::Misuse(_) => {
                ErrorCode::Misuse
            }
        }
    }

    /// Exact numeric status: the native code for engine errors, the primary
    /// code of the classification otherwise.
    pub fn raw_code(&self) -> Option<i32> {
        match self {
            Error::Engine { code, .. } => Some(*code),
            other => other.code().code(),
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.code(), ErrorCode::Busy)
    }

    /// Whether the failure was detected locally, before any engine call.
    pub fn is_resource_state(&self) -> bool {
        matches!(self, Error::Closed | Error::AlreadyOpen | Error::Finalized)
    }
}
