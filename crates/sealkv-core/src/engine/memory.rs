//! In-process engine.
//!
//! Every open of a `MemoryEngine` (or any clone of it) sees the same data, as if
//! it were one store file. Reads run against a snapshot taken at `view` time;
//! writes stage a private copy that replaces the shared state only on commit.
//! Snapshots copy the whole store, so this is meant for tests and small
//! ephemeral stores.
//!
//! The engine counts opens and closes so callers can observe handle lifecycle.

use std::collections::BTreeMap;
use std::ops::{Bound, ControlFlow};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{Engine, Handle, ReadBucket, ReadTxn, Visitor, WriteBucket, WriteTxn};
use crate::error::{Result, VaultError};

type Entries = BTreeMap<Vec<u8>, Vec<u8>>;
type Buckets = BTreeMap<String, Entries>;

#[derive(Default)]
struct Shared {
    buckets: RwLock<Buckets>,
    writer: Mutex<()>,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MemoryEngine {
    shared: Arc<Shared>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    /// Handles currently alive.
    pub fn live_handles(&self) -> usize {
        self.open_count() - self.close_count()
    }

    /// Stored bytes for `key`, exactly as written (ciphertext when encrypted).
    pub fn raw_value(&self, bucket: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.shared.buckets.read().get(bucket)?.get(key).cloned()
    }

    /// Overwrite stored bytes behind the manager's back.
    pub fn put_raw(&self, bucket: &str, key: &[u8], value: &[u8]) {
        let _writer = self.shared.writer.lock();
        self.shared
            .buckets
            .write()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
    }

    /// Remove a bucket and its records, as an external tool would.
    pub fn drop_bucket(&self, bucket: &str) -> bool {
        let _writer = self.shared.writer.lock();
        self.shared.buckets.write().remove(bucket).is_some()
    }

    pub fn bucket_names(&self) -> Vec<String> {
        self.shared.buckets.read().keys().cloned().collect()
    }
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("opens", &self.open_count())
            .field("closes", &self.close_count())
            .finish()
    }
}

impl Engine for MemoryEngine {
    type Handle = MemoryHandle;

    fn open(&self, _path: &Path) -> Result<MemoryHandle> {
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryHandle {
            shared: self.shared.clone(),
        })
    }
}

pub struct MemoryHandle {
    shared: Arc<Shared>,
}

impl Drop for MemoryHandle {
    fn drop(&mut self) {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
    }
}

impl Handle for MemoryHandle {
    type Read = MemorySnapshot;
    type Write = MemoryTxn;

    fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&MemorySnapshot) -> Result<T>,
    {
        let snapshot = MemorySnapshot {
            buckets: self.shared.buckets.read().clone(),
        };
        f(&snapshot)
    }

    fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut MemoryTxn) -> Result<T>,
    {
        let _writer = self.shared.writer.lock();
        let mut txn = MemoryTxn {
            buckets: self.shared.buckets.read().clone(),
        };
        let value = f(&mut txn)?;
        *self.shared.buckets.write() = txn.buckets;
        Ok(value)
    }
}

pub struct MemorySnapshot {
    buckets: Buckets,
}

pub struct MemoryTxn {
    buckets: Buckets,
}

pub struct MemoryBucket<'a> {
    entries: &'a Entries,
}

pub struct MemoryBucketMut<'a> {
    entries: &'a mut Entries,
}

impl ReadTxn for MemorySnapshot {
    type Bucket<'a> = MemoryBucket<'a>
    where
        Self: 'a;

    fn bucket(&self, name: &str) -> Result<Option<MemoryBucket<'_>>> {
        Ok(self.buckets.get(name).map(|entries| MemoryBucket { entries }))
    }
}

impl WriteTxn for MemoryTxn {
    type Bucket<'a> = MemoryBucketMut<'a>
    where
        Self: 'a;

    fn bucket(&mut self, name: &str) -> Result<Option<MemoryBucketMut<'_>>> {
        Ok(self
            .buckets
            .get_mut(name)
            .map(|entries| MemoryBucketMut { entries }))
    }

    fn create_bucket_if_missing(&mut self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(VaultError::BucketNameInvalid);
        }
        self.buckets.entry(name.to_string()).or_default();
        Ok(())
    }
}

fn seek_entries(entries: &Entries, from: &[u8], visit: &mut Visitor<'_>) {
    let range = entries.range::<[u8], _>((Bound::Included(from), Bound::Unbounded));
    for (key, value) in range {
        if let ControlFlow::Break(()) = visit(key.as_slice(), value.as_slice()) {
            break;
        }
    }
}

impl ReadBucket for MemoryBucket<'_> {
    fn seek(&self, from: &[u8], visit: &mut Visitor<'_>) -> Result<()> {
        seek_entries(self.entries, from, visit);
        Ok(())
    }
}

impl ReadBucket for MemoryBucketMut<'_> {
    fn seek(&self, from: &[u8], visit: &mut Visitor<'_>) -> Result<()> {
        seek_entries(&*self.entries, from, visit);
        Ok(())
    }
}

impl WriteBucket for MemoryBucketMut<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Operation;

    #[test]
    fn handles_share_one_store() {
        let engine = MemoryEngine::new();
        let first = engine.open(Path::new("a")).unwrap();
        first
            .update(|txn| {
                txn.create_bucket_if_missing("b")?;
                txn.bucket("b")?.expect("bucket exists").put(b"k", b"v")
            })
            .unwrap();
        drop(first);

        let second = engine.open(Path::new("a")).unwrap();
        let found = second
            .view(|txn| {
                let mut found = None;
                txn.bucket("b")?.expect("bucket exists").seek(b"k", &mut |k, v| {
                    found = Some((k.to_vec(), v.to_vec()));
                    ControlFlow::Break(())
                })?;
                Ok(found)
            })
            .unwrap();
        assert_eq!(found, Some((b"k".to_vec(), b"v".to_vec())));
        assert_eq!(engine.open_count(), 2);
        assert_eq!(engine.close_count(), 1);
        assert_eq!(engine.live_handles(), 1);
    }

    #[test]
    fn failed_update_leaves_store_untouched() {
        let engine = MemoryEngine::new();
        let handle = engine.open(Path::new("a")).unwrap();
        let result: Result<()> = handle.update(|txn| {
            txn.create_bucket_if_missing("b")?;
            Err(VaultError::KeyInvalid {
                op: Operation::Save,
            })
        });
        assert!(result.is_err());
        assert!(engine.bucket_names().is_empty());
    }

    #[test]
    fn empty_bucket_name_cannot_be_created() {
        let engine = MemoryEngine::new();
        let handle = engine.open(Path::new("a")).unwrap();
        let err = handle.update(|txn| txn.create_bucket_if_missing("")).unwrap_err();
        assert!(matches!(err, VaultError::BucketNameInvalid));
        assert!(handle.view(|txn| Ok(txn.bucket("")?.is_none())).unwrap());
    }

    #[test]
    fn dropped_bucket_disappears() {
        let engine = MemoryEngine::new();
        engine.put_raw("b", b"k", b"v");
        assert_eq!(engine.raw_value("b", b"k"), Some(b"v".to_vec()));
        assert!(engine.drop_bucket("b"));
        assert!(!engine.drop_bucket("b"));
        assert_eq!(engine.raw_value("b", b"k"), None);
    }
}
