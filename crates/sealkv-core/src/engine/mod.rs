//! Storage engine seam.
//!
//! The manager never talks to an engine directly. It opens a [`Handle`] and runs
//! closures inside read-only ([`Handle::view`]) or read-write
//! ([`Handle::update`]) transactions. Inside a transaction, buckets are looked
//! up by name and walked with an ordered cursor.
//!
//! Closing a store is dropping its handle.

use std::ops::ControlFlow;
use std::path::Path;

use crate::error::Result;

pub mod memory;
pub mod redb_engine;

pub use memory::MemoryEngine;
pub use redb_engine::RedbEngine;

/// Cursor callback: receives `(key, value)` in key order, returns
/// `ControlFlow::Break(())` to stop the walk.
pub type Visitor<'v> = dyn FnMut(&[u8], &[u8]) -> ControlFlow<()> + 'v;

pub trait Engine: Send + Sync {
    type Handle: Handle;

    /// Open the store at `path`, creating an empty store file when absent.
    fn open(&self, path: &Path) -> Result<Self::Handle>;
}

/// An open store. Read transactions may run concurrently; the engine
/// serializes write transactions.
pub trait Handle: Send + Sync {
    type Read: ReadTxn;
    type Write: WriteTxn;

    fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Self::Read) -> Result<T>;

    /// Commits when `f` returns `Ok`, rolls back otherwise.
    fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self::Write) -> Result<T>;
}

pub trait ReadTxn {
    type Bucket<'a>: ReadBucket
    where
        Self: 'a;

    /// `None` when no bucket of that name exists.
    fn bucket(&self, name: &str) -> Result<Option<Self::Bucket<'_>>>;
}

pub trait WriteTxn {
    type Bucket<'a>: WriteBucket
    where
        Self: 'a;

    fn bucket(&mut self, name: &str) -> Result<Option<Self::Bucket<'_>>>;

    fn create_bucket_if_missing(&mut self, name: &str) -> Result<()>;
}

pub trait ReadBucket {
    /// Walk entries whose key is `>= from`, in byte order.
    fn seek(&self, from: &[u8], visit: &mut Visitor<'_>) -> Result<()>;
}

pub trait WriteBucket: ReadBucket {
    /// Insert or overwrite.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Removing a missing key is not an error.
    fn delete(&mut self, key: &[u8]) -> Result<()>;
}
