use thiserror::Error;

use crate::driver::DriverError;

pub type Result<T> = std::result::Result<T, Error>;

/// Domain error codes attached by the error-codes hook.
///
/// Codes map onto transport status codes so services can surface database
/// failures without inspecting error strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    DatabaseError = 2000,
    BadConnection = 2001,
    Reconnected = 2002,
}

impl Code {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// HTTP status code equivalent.
    pub fn http(self) -> u16 {
        match self {
            Code::DatabaseError => 500,
            Code::BadConnection | Code::Reconnected => 502,
        }
    }

    /// gRPC status code equivalent (Internal / Unavailable).
    pub fn grpc(self) -> u8 {
        match self {
            Code::DatabaseError => 13,
            Code::BadConnection | Code::Reconnected => 14,
        }
    }
}

/// All errors produced by this crate.
///
/// Driver errors travel up verbatim; hooks may enrich them (`CanRetry`,
/// `Coded`) but the original message always stays visible through `Display`
/// because the error classifier matches on substrings.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("addr already exists: {0}")]
    AddrAlreadyExists(String),

    #[error("no available clients")]
    NoAvailableClients,

    #[error("max retry attempts has been reached")]
    MaxRetryAttempts,

    #[error("is not pending")]
    NotPending,

    #[error("context canceled")]
    Canceled,

    /// Sentinel produced by the reconnect hook after a successful reconnect:
    /// the original error is wrapped so the retry engine knows a fresh
    /// attempt is worthwhile.
    #[error("connection reconnect: {0}")]
    CanRetry(#[source] Box<Error>),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("{message}: {source}")]
    Coded {
        code: Code,
        message: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// The domain code attached by the error-codes hook, if any.
    pub fn code(&self) -> Option<Code> {
        match self {
            Error::Coded { code, .. } => Some(*code),
            Error::CanRetry(inner) => inner.code(),
            _ => None,
        }
    }

    /// The SQLSTATE reported by the driver, walking through any wrapping.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Driver(err) => err.sqlstate.as_deref(),
            Error::CanRetry(inner) => inner.sqlstate(),
            Error::Coded { source, .. } => source.sqlstate(),
            _ => None,
        }
    }

    /// A transaction rollback reported by the driver with SQLSTATE 40001.
    pub fn is_serialization_failure(&self) -> bool {
        self.sqlstate() == Some("40001")
    }

    /// An empty result set where one row was required.
    pub fn is_no_rows(&self) -> bool {
        match self {
            Error::Driver(err) => err.is_no_rows(),
            Error::CanRetry(inner) => inner.is_no_rows(),
            Error::Coded { source, .. } => source.is_no_rows(),
            _ => false,
        }
    }

    /// True when the reconnect hook already re-established the handle and a
    /// fresh attempt is worthwhile.
    pub fn is_can_retry(&self) -> bool {
        match self {
            Error::CanRetry(_) => true,
            Error::Coded { source, .. } => source.is_can_retry(),
            _ => false,
        }
    }

    pub fn is_canceled(&self) -> bool {
        match self {
            Error::Canceled => true,
            Error::CanRetry(inner) => inner.is_canceled(),
            Error::Coded { source, .. } => source.is_canceled(),
            _ => false,
        }
    }
}
