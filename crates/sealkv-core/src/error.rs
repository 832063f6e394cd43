use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::cipher::CipherError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Public operation a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Open,
    GetOne,
    GetByPrefix,
    GetKeyList,
    Save,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Open => "open",
            Operation::GetOne => "get_one",
            Operation::GetByPrefix => "get_by_prefix",
            Operation::GetKeyList => "get_key_list",
            Operation::Save => "save",
            Operation::Delete => "delete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("invalid path name: {}", .0.display())]
    PathInvalid(PathBuf),

    #[error("invalid file name: {}", .0.display())]
    FileNameInvalid(PathBuf),

    #[error("invalid store options in {}: {source}", .path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid bucket name: bucket names must not be empty")]
    BucketNameInvalid,

    #[error("{op}: invalid key or key is empty")]
    KeyInvalid { op: Operation },

    #[error("{op}: bucket {bucket:?} not found")]
    BucketNotFound { op: Operation, bucket: String },

    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("{op}: cannot decrypt {bucket}/{key}: {source}")]
    Decrypt {
        op: Operation,
        bucket: String,
        key: String,
        #[source]
        source: CipherError,
    },

    #[error("{op}: serialization of {bucket}/{key} failed: {source}")]
    Serialization {
        op: Operation,
        bucket: String,
        key: String,
        #[source]
        source: BoxError,
    },

    #[error("store error: {0}")]
    Store(#[from] redb::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VaultError {
    /// True for the failures raised while validating the store options.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            VaultError::PathInvalid(_)
                | VaultError::FileNameInvalid(_)
                | VaultError::BucketNameInvalid
                | VaultError::Config { .. }
        )
    }

    pub(crate) fn bucket_not_found(op: Operation, bucket: &str) -> Self {
        VaultError::BucketNotFound {
            op,
            bucket: bucket.to_string(),
        }
    }
}

impl From<redb::DatabaseError> for VaultError {
    fn from(e: redb::DatabaseError) -> Self {
        VaultError::Store(e.into())
    }
}

impl From<redb::TransactionError> for VaultError {
    fn from(e: redb::TransactionError) -> Self {
        VaultError::Store(e.into())
    }
}

impl From<redb::TableError> for VaultError {
    fn from(e: redb::TableError) -> Self {
        VaultError::Store(e.into())
    }
}

impl From<redb::StorageError> for VaultError {
    fn from(e: redb::StorageError) -> Self {
        VaultError::Store(e.into())
    }
}

impl From<redb::CommitError> for VaultError {
    fn from(e: redb::CommitError) -> Self {
        VaultError::Store(e.into())
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
