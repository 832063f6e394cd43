//! sealkv-core: encrypted bucket/key/value storage
//!
//! # Model
//! A store is one file holding named buckets. Each bucket maps string keys to
//! byte values kept in key order, so prefix queries are ordered range walks.
//! Values are encrypted with AES-256-CFB under a key derived from the store
//! secret; an empty secret stores them in plaintext. Keys are never encrypted.
//!
//! # Lifecycle
//! A [`StoreManager`] opens the store per operation and closes it afterwards.
//! Batch mode keeps it open across operations until turned off or
//! [`StoreManager::close`] is called.
//!
//! # Module layout
//! - `cipher`: AES-256-CFB record sealing
//! - `codec`: typed payload encoding (JSON by default)
//! - `engine`: storage engine seam, redb and in-memory engines
//! - `manager`: store lifecycle and the public operations
//! - `options`: store location and open behaviour
//! - `error`: unified error type

pub mod cipher;
pub mod codec;
pub mod engine;
pub mod error;
pub mod manager;
pub mod options;

pub use cipher::{CipherBox, CipherError};
pub use codec::{Codec, JsonCodec};
pub use engine::{Engine, MemoryEngine, RedbEngine};
pub use error::{Operation, Result, VaultError};
pub use manager::{StoreBuilder, StoreManager};
pub use options::StoreOptions;
