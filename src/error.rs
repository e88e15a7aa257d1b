use std::ffi::CStr;
use std::fmt;
use std::io;
use std::os::raw::c_int;
use std::result;

use lmdb_sys as ffi;
use thiserror::Error;

/// Result type for every operation of this crate.
pub type Result<T> = result::Result<T, Error>;

/// Kind of handle an [`Error::InvalidHandle`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handle {
    Environment,
    Database,
    Cursor,
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handle::Environment => f.write_str("environment"),
            Handle::Database => f.write_str("database"),
            Handle::Cursor => f.write_str("cursor"),
        }
    }
}

/// Engine resource whose limit was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// `max_size` of the mapped region.
    MapSize,
    /// `max_readers` reader slots.
    Readers,
    /// `max_dbs` named databases.
    Databases,
    /// Thread-local storage keys.
    ThreadSlots,
    /// Dirty pages of one transaction.
    DirtyPages,
    /// Cursor stack depth.
    CursorStack,
    /// Space on a single page.
    PageSpace,
}

/// Errors raised by the environment, transactions, databases and cursors.
#[derive(Debug, Error)]
pub enum Error {
    /// No matching key/data pair found
    #[error("no matching key/data pair found")]
    NotFound,

    /// Key/data pair already exists
    #[error("key/data pair already exists")]
    KeyExist,

    /// Operation on a committed or aborted transaction, or one that is
    /// otherwise not usable right now.
    #[error("transaction state error: {0}")]
    TransactionState(&'static str),

    /// Operation on a closed environment, database or cursor.
    #[error("{0} is closed")]
    InvalidHandle(Handle),

    /// Cursor used after its transaction ended.
    #[error("cursor used outside of its transaction")]
    InvalidCursor,

    /// Write attempted in a read-only scope.
    #[error("permission denied: {0}")]
    Permission(&'static str),

    /// An engine limit was reached.
    #[error("resource exhausted: {0:?}")]
    ResourceExhausted(Resource),

    /// On-disk structures are inconsistent.
    #[error("corrupt environment: {0}")]
    Corrupt(String),

    /// Configuration rejected before or by the engine.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation and database or environment are incompatible.
    #[error("incompatible operation: {0}")]
    Incompatible(&'static str),

    /// Key is empty or too long, or data has the wrong size for a
    /// fixed-size duplicate table.
    #[error("unsupported size of key or data")]
    BadValueSize,

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Engine status code without a dedicated variant.
    #[error("engine error {code}: {message}")]
    Engine { code: c_int, message: String },
}

/// Fieldless mirror of [`Error`] for matching on the kind alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    KeyExist,
    TransactionState,
    InvalidHandle,
    InvalidCursor,
    Permission,
    ResourceExhausted,
    Corrupt,
    InvalidConfig,
    Incompatible,
    BadValueSize,
    Io,
    Engine,
}

impl Error {
    /// Translate an engine status code. `0` is not an error and must be
    /// filtered by the caller (see [`mdb_result`]).
    pub fn from_code(code: c_int) -> Error {
        match code {
            ffi::MDB_NOTFOUND => Error::NotFound,
            ffi::MDB_KEYEXIST => Error::KeyExist,
            ffi::MDB_PAGE_NOTFOUND
            | ffi::MDB_CORRUPTED
            | ffi::MDB_PANIC
            | ffi::MDB_VERSION_MISMATCH
            | ffi::MDB_INVALID => Error::Corrupt(strerror(code)),
            ffi::MDB_MAP_FULL | ffi::MDB_MAP_RESIZED => Error::ResourceExhausted(Resource::MapSize),
            ffi::MDB_DBS_FULL => Error::ResourceExhausted(Resource::Databases),
            ffi::MDB_READERS_FULL => Error::ResourceExhausted(Resource::Readers),
            ffi::MDB_TLS_FULL => Error::ResourceExhausted(Resource::ThreadSlots),
            ffi::MDB_TXN_FULL => Error::ResourceExhausted(Resource::DirtyPages),
            ffi::MDB_CURSOR_FULL => Error::ResourceExhausted(Resource::CursorStack),
            ffi::MDB_PAGE_FULL => Error::ResourceExhausted(Resource::PageSpace),
            ffi::MDB_INCOMPATIBLE => Error::Incompatible("operation and database incompatible"),
            ffi::MDB_BAD_RSLOT => Error::TransactionState("invalid reuse of reader locktable slot"),
            ffi::MDB_BAD_TXN => Error::TransactionState("transaction must abort, has a child, or is invalid"),
            ffi::MDB_BAD_VALSIZE => Error::BadValueSize,
            ffi::MDB_BAD_DBI => Error::InvalidHandle(Handle::Database),
            libc::EACCES | libc::EROFS => Error::Permission("engine refused a write"),
            // Outside of `Environment::open` an invalid argument is a broken
            // engine contract, not a configuration problem.
            libc::EINVAL => Error::Engine {
                code,
                message: strerror(code),
            },
            code if code > 0 => Error::Io(io::Error::from_raw_os_error(code)),
            code => Error::Engine {
                code,
                message: strerror(code),
            },
        }
    }

    /// Kind of this error, without its payload.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound => ErrorKind::NotFound,
            Error::KeyExist => ErrorKind::KeyExist,
            Error::TransactionState(_) => ErrorKind::TransactionState,
            Error::InvalidHandle(_) => ErrorKind::InvalidHandle,
            Error::InvalidCursor => ErrorKind::InvalidCursor,
            Error::Permission(_) => ErrorKind::Permission,
            Error::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Error::Corrupt(_) => ErrorKind::Corrupt,
            Error::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Error::Incompatible(_) => ErrorKind::Incompatible,
            Error::BadValueSize => ErrorKind::BadValueSize,
            Error::Io(_) => ErrorKind::Io,
            Error::Engine { .. } => ErrorKind::Engine,
        }
    }

    /// Whether this is the routine "key absent" condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

impl From<c_int> for Error {
    fn from(code: c_int) -> Error {
        Error::from_code(code)
    }
}

impl From<std::ffi::NulError> for Error {
    fn from(_: std::ffi::NulError) -> Error {
        Error::InvalidConfig("name or path contains an interior NUL byte".to_string())
    }
}

/// Turn an engine return code into a `Result`.
pub(crate) fn mdb_result(code: c_int) -> Result<()> {
    if code == ffi::MDB_SUCCESS {
        Ok(())
    } else {
        Err(Error::from_code(code))
    }
}

/// Like [`mdb_result`], for the calls that set up an environment, where an
/// invalid argument means the configuration was rejected.
pub(crate) fn setup_result(code: c_int) -> Result<()> {
    match code {
        ffi::MDB_SUCCESS => Ok(()),
        libc::EINVAL => Err(Error::InvalidConfig(strerror(code))),
        code => Err(Error::from_code(code)),
    }
}

/// Engine message for a status code, with the `"MDB_XXX: "` prefix removed.
fn strerror(code: c_int) -> String {
    // mdb_strerror returns a pointer to a static string or to strerror's buffer.
    let message = unsafe { CStr::from_ptr(ffi::mdb_strerror(code)) }.to_string_lossy();
    match message.find(": ") {
        Some(pos) if message.starts_with("MDB_") => message[pos + 2..].to_string(),
        _ => message.into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routine_codes() {
        assert!(Error::from_code(ffi::MDB_NOTFOUND).is_not_found());
        assert_eq!(Error::from_code(ffi::MDB_KEYEXIST).kind(), ErrorKind::KeyExist);
    }

    #[test]
    fn corruption_codes() {
        for code in [ffi::MDB_CORRUPTED, ffi::MDB_PANIC, ffi::MDB_INVALID, ffi::MDB_VERSION_MISMATCH] {
            assert_eq!(Error::from_code(code).kind(), ErrorKind::Corrupt, "code {}", code);
        }
    }

    #[test]
    fn limit_codes() {
        assert!(matches!(
            Error::from_code(ffi::MDB_MAP_FULL),
            Error::ResourceExhausted(Resource::MapSize)
        ));
        assert!(matches!(
            Error::from_code(ffi::MDB_READERS_FULL),
            Error::ResourceExhausted(Resource::Readers)
        ));
        assert!(matches!(
            Error::from_code(ffi::MDB_DBS_FULL),
            Error::ResourceExhausted(Resource::Databases)
        ));
    }

    #[test]
    fn os_codes() {
        assert_eq!(Error::from_code(libc::EACCES).kind(), ErrorKind::Permission);
        assert_eq!(Error::from_code(libc::EINVAL).kind(), ErrorKind::Engine);
        match Error::from_code(libc::ENOENT) {
            Error::Io(err) => assert_eq!(err.kind(), io::ErrorKind::NotFound),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn mdb_result_success() {
        assert!(mdb_result(0).is_ok());
        assert!(mdb_result(ffi::MDB_NOTFOUND).is_err());
    }

    #[test]
    fn invalid_argument_during_setup_is_config() {
        assert!(setup_result(0).is_ok());
        assert_eq!(setup_result(libc::EINVAL).unwrap_err().kind(), ErrorKind::InvalidConfig);
        assert_eq!(setup_result(ffi::MDB_NOTFOUND).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn message_has_no_code_prefix() {
        let Error::Corrupt(message) = Error::from_code(ffi::MDB_CORRUPTED) else {
            panic!("expected corrupt");
        };
        assert!(!message.starts_with("MDB_"), "{}", message);
    }
}
