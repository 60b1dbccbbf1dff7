use crate::core::constants::TransactionID;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("bad parameter: {reason}")]
    BadParameter { reason: String },

    #[error("lock timeout: could not acquire {mode} intent on '{collection}' within {timeout_secs}s")]
    LockTimeout {
        collection: String,
        mode: String,
        timeout_secs: f64,
    },

    #[error("locked: {reason}")]
    Locked { reason: String },

    #[error("write-write conflict: collection={collection:?}, key={key:?}, expected={expected:?}, actual={actual:?}")]
    Conflict {
        collection: String,
        key: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    #[error("document not found: collection={collection:?}, key={key:?}")]
    DocumentNotFound { collection: String, key: String },

    #[error("collection or view not found: {name}")]
    DataSourceNotFound { name: String },

    #[error("duplicate name: {name}")]
    DuplicateName { name: String },

    #[error("unique constraint violated: collection={collection:?}, index={index:?}, key={key:?}")]
    UniqueConstraintViolation {
        collection: String,
        index: String,
        key: String,
    },

    #[error("illegal document key: {key:?}")]
    DocumentKeyBad { key: String },

    #[error("out of keys: collection={collection:?}")]
    OutOfKeys { collection: String },

    #[error("invalid document type: {reason}")]
    DocumentTypeInvalid { reason: String },

    #[error("database not found: {name}")]
    DatabaseNotFound { name: String },

    #[error("query parse error: {message}")]
    QueryParse { message: String },

    #[error("no value specified for declared bind parameter '{name}'")]
    QueryBindParameterMissing { name: String },

    #[error("bind parameter '{name}' was not declared in the query")]
    QueryBindParameterUndeclared { name: String },

    #[error("bind parameter '{name}' has an invalid value or type")]
    QueryBindParameterType { name: String },

    #[error("cursor not found: {id}")]
    CursorNotFound { id: u64 },

    #[error("internal transaction error: {reason}")]
    TransactionInternal { reason: String },

    #[error("collection '{collection}' not registered for {access} access in transaction")]
    UnregisteredCollection { collection: String, access: String },

    #[error("transaction {id} is not running (status: {status})")]
    TransactionNotRunning { id: TransactionID, status: String },

    #[error("transaction {id} not found")]
    TransactionNotFound { id: TransactionID },

    #[error("lock poisoned: {lock_name} (another thread panicked while holding this lock)")]
    LockPoisoned { lock_name: String },
}

impl Error {
    /// Stable numeric code, shared with the error numbers clients of the
    /// original document store already know.
    pub fn code(&self) -> u32 {
        match self {
            Error::LockPoisoned { .. } => 4,
            Error::BadParameter { .. } => 10,
            Error::LockTimeout { .. } => 18,
            Error::Locked { .. } => 28,
            Error::Conflict { .. } => 1200,
            Error::DocumentNotFound { .. } => 1202,
            Error::DataSourceNotFound { .. } => 1203,
            Error::DuplicateName { .. } => 1207,
            Error::UniqueConstraintViolation { .. } => 1210,
            Error::DocumentKeyBad { .. } => 1221,
            Error::OutOfKeys { .. } => 1222,
            Error::DocumentTypeInvalid { .. } => 1227,
            Error::DatabaseNotFound { .. } => 1228,
            Error::QueryParse { .. } => 1501,
            Error::QueryBindParameterMissing { .. } => 1551,
            Error::QueryBindParameterUndeclared { .. } => 1552,
            Error::QueryBindParameterType { .. } => 1553,
            Error::CursorNotFound { .. } => 1600,
            Error::TransactionInternal { .. } => 1650,
            Error::UnregisteredCollection { .. } => 1652,
            Error::TransactionNotRunning { .. } => 1654,
            Error::TransactionNotFound { .. } => 1655,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::DocumentNotFound { .. }
                | Error::DataSourceNotFound { .. }
                | Error::DatabaseNotFound { .. }
                | Error::TransactionNotFound { .. }
        )
    }

    pub(crate) fn bad_parameter(reason: impl Into<String>) -> Self {
        Error::BadParameter { reason: reason.into() }
    }

    pub(crate) fn parse(message: impl Into<String>) -> Self {
        Error::QueryParse { message: message.into() }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::DocumentTypeInvalid {
            reason: format!("JSON error: {}", err),
        }
    }
}

pub trait PoisonedLockExt<'a, T> {
    fn recover_poison(self) -> T;
}

impl<'a, T> PoisonedLockExt<'a, std::sync::RwLockReadGuard<'a, T>> for std::sync::LockResult<std::sync::RwLockReadGuard<'a, T>> {
    fn recover_poison(self) -> std::sync::RwLockReadGuard<'a, T> {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<'a, T> PoisonedLockExt<'a, std::sync::RwLockWriteGuard<'a, T>> for std::sync::LockResult<std::sync::RwLockWriteGuard<'a, T>> {
    fn recover_poison(self) -> std::sync::RwLockWriteGuard<'a, T> {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<'a, T> PoisonedLockExt<'a, std::sync::MutexGuard<'a, T>> for std::sync::LockResult<std::sync::MutexGuard<'a, T>> {
    fn recover_poison(self) -> std::sync::MutexGuard<'a, T> {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Error::bad_parameter("x").code(), 10);
        assert_eq!(
            Error::Conflict {
                collection: "c".into(),
                key: "k".into(),
                expected: None,
                actual: None,
            }
            .code(),
            1200
        );
        assert_eq!(Error::TransactionNotFound { id: 7 }.code(), 1655);
        assert_eq!(
            Error::UnregisteredCollection {
                collection: "c".into(),
                access: "write".into(),
            }
            .code(),
            1652
        );
    }

    #[test]
    fn test_classification() {
        assert!(Error::DataSourceNotFound { name: "x".into() }.is_not_found());
        assert!(Error::TransactionNotFound { id: 1 }.is_not_found());
        assert!(!Error::Locked { reason: "cursor".into() }.is_not_found());
    }

    #[test]
    fn test_display_mentions_transaction() {
        let err = Error::TransactionNotRunning {
            id: 42,
            status: "aborted".to_string(),
        };
        assert_eq!(err.to_string(), "transaction 42 is not running (status: aborted)");
    }
}
