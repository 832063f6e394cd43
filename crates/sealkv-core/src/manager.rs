//! Store lifecycle and encrypted record access.
//!
//! Every public operation opens the store when needed, runs exactly one
//! transaction and closes the store again unless batch mode is on. The open
//! state is reference counted: concurrent operations on one manager share the
//! handle, and the last one to finish closes it.

use std::fmt;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn, Dispatch};
use zeroize::Zeroizing;

use crate::cipher::CipherBox;
use crate::codec::{self, Codec};
use crate::engine::{Engine, Handle, ReadBucket, ReadTxn, RedbEngine, WriteBucket, WriteTxn};
use crate::error::{Operation, Result, VaultError};
use crate::options::StoreOptions;

struct Lifecycle<H> {
    handle: Option<Arc<H>>,
    active: usize,
    batch_mode: bool,
    close_pending: bool,
}

impl<H> Lifecycle<H> {
    fn should_close(&self) -> bool {
        self.active == 0 && (!self.batch_mode || self.close_pending)
    }
}

pub struct StoreManager<E: Engine = RedbEngine> {
    name: String,
    dir: PathBuf,
    full_path: PathBuf,
    buckets: Vec<String>,
    engine: E,
    cipher: RwLock<Option<Arc<CipherBox>>>,
    lifecycle: Mutex<Lifecycle<E::Handle>>,
    dispatch: Option<Dispatch>,
}

pub struct StoreBuilder<E: Engine = RedbEngine> {
    options: StoreOptions,
    secret: Zeroizing<Vec<u8>>,
    engine: E,
    dispatch: Option<Dispatch>,
}

impl StoreManager<RedbEngine> {
    pub fn builder(options: StoreOptions) -> StoreBuilder<RedbEngine> {
        StoreBuilder {
            options,
            secret: Zeroizing::new(Vec::new()),
            engine: RedbEngine,
            dispatch: None,
        }
    }

    /// redb-backed manager. An empty `secret` stores values in plaintext.
    pub fn create(options: StoreOptions, secret: impl AsRef<[u8]>) -> Result<Self> {
        Self::builder(options).secret(secret).build()
    }
}

impl<E: Engine> StoreBuilder<E> {
    pub fn secret(mut self, secret: impl AsRef<[u8]>) -> Self {
        self.secret = Zeroizing::new(secret.as_ref().to_vec());
        self
    }

    pub fn engine<E2: Engine>(self, engine: E2) -> StoreBuilder<E2> {
        StoreBuilder {
            options: self.options,
            secret: self.secret,
            engine,
            dispatch: self.dispatch,
        }
    }

    /// Route this manager's log events to `dispatch` instead of the ambient
    /// subscriber.
    pub fn dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// Validate the location, set up the cipher and create missing buckets.
    /// The store is left closed whatever the batch mode.
    pub fn build(self) -> Result<StoreManager<E>> {
        let StoreBuilder {
            options,
            secret,
            engine,
            dispatch,
        } = self;
        let full_path = validate_options(&options)?;
        let manager = StoreManager {
            name: options.name,
            dir: options.dir,
            full_path,
            buckets: options.buckets,
            engine,
            cipher: RwLock::new(None),
            lifecycle: Mutex::new(Lifecycle {
                handle: None,
                active: 0,
                batch_mode: options.batch_mode,
                close_pending: false,
            }),
            dispatch,
        };
        manager.scoped(|| -> Result<()> {
            manager.set_secret(secret.as_slice())?;
            let handle = manager.open_handle()?;
            drop(handle);
            debug!(path = %manager.full_path.display(), "store initialized");
            Ok(())
        })?;
        Ok(manager)
    }
}

fn validate_options(options: &StoreOptions) -> Result<PathBuf> {
    if !options.dir.as_os_str().is_empty() {
        match std::fs::metadata(&options.dir) {
            Ok(meta) if meta.is_dir() => {}
            _ => return Err(VaultError::PathInvalid(options.dir.clone())),
        }
    }
    if options.buckets.iter().any(|name| name.is_empty()) {
        return Err(VaultError::BucketNameInvalid);
    }
    let full_path = options.full_path();
    if options.name.is_empty() {
        return Err(VaultError::FileNameInvalid(full_path));
    }
    // a missing file is fine, the engine creates it
    if let Ok(meta) = std::fs::metadata(&full_path) {
        if !meta.is_file() {
            return Err(VaultError::FileNameInvalid(full_path));
        }
    }
    Ok(full_path)
}

/// Keeps one operation registered against the open handle until dropped.
struct Lease<'m, E: Engine> {
    manager: &'m StoreManager<E>,
    handle: Option<Arc<E::Handle>>,
}

impl<E: Engine> Drop for Lease<'_, E> {
    fn drop(&mut self) {
        let mut state = self.manager.lifecycle.lock();
        state.active -= 1;
        // drop our reference first so the close below is the final one,
        // and happens before anyone else can reopen
        self.handle = None;
        if state.should_close() {
            state.close_pending = false;
            if state.handle.take().is_some() {
                debug!(path = %self.manager.full_path.display(), "store closed");
            }
        }
    }
}

impl<E: Engine> StoreManager<E> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Full path of the store file.
    pub fn path(&self) -> &Path {
        &self.full_path
    }

    pub fn buckets(&self) -> &[String] {
        &self.buckets
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.read().is_some()
    }

    pub fn batch_mode(&self) -> bool {
        self.lifecycle.lock().batch_mode
    }

    pub fn is_open(&self) -> bool {
        self.lifecycle.lock().handle.is_some()
    }

    /// Replace the value cipher. An empty secret turns encryption off.
    /// Records already stored are not re-encrypted.
    pub fn set_secret(&self, secret: impl AsRef<[u8]>) -> Result<()> {
        let secret = secret.as_ref();
        let cipher = if secret.is_empty() {
            None
        } else {
            Some(Arc::new(CipherBox::new(secret)?))
        };
        *self.cipher.write() = cipher;
        Ok(())
    }

    /// Turning batch mode off closes the store as soon as no operation is
    /// using it.
    pub fn set_batch_mode(&self, on: bool) {
        let mut state = self.lifecycle.lock();
        state.batch_mode = on;
        if state.should_close() && state.handle.take().is_some() {
            self.scoped(|| debug!(path = %self.full_path.display(), "store closed"));
        }
    }

    /// Close the store now, or once in-flight operations finish. The next
    /// operation reopens it.
    pub fn close(&self) {
        let mut state = self.lifecycle.lock();
        if state.active > 0 {
            state.close_pending = true;
            return;
        }
        if state.handle.take().is_some() {
            self.scoped(|| debug!(path = %self.full_path.display(), "store closed"));
        }
    }

    /// Value of the first key at or after `key` that starts with `key`.
    ///
    /// This is a prefix seek, not an exact lookup: with only `"a-10"` stored,
    /// `get_one(bucket, "a-1")` returns its value.
    pub fn get_one(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        self.scoped(|| {
            let found = self.first_with_prefix(Operation::GetOne, bucket, key)?;
            match found {
                Some((k, v)) => self.open_value(Operation::GetOne, bucket, &k, v).map(Some),
                None => Ok(None),
            }
        })
    }

    pub fn get_one_as<T: DeserializeOwned>(&self, bucket: &str, key: &str) -> Result<Option<T>> {
        self.get_one_decoded(bucket, key, |bytes| serde_json::from_slice(bytes))
    }

    pub fn get_one_with<T, C: Codec<T>>(
        &self,
        codec: &C,
        bucket: &str,
        key: &str,
    ) -> Result<Option<T>> {
        self.get_one_decoded(bucket, key, |bytes| codec.decode(bytes))
    }

    /// Values of every key starting with `prefix`, in key order.
    pub fn get_by_prefix(&self, bucket: &str, prefix: &str) -> Result<Vec<Vec<u8>>> {
        self.scoped(|| {
            let records = self.records_with_prefix(Operation::GetByPrefix, bucket, prefix)?;
            records
                .into_iter()
                .map(|(k, v)| self.open_value(Operation::GetByPrefix, bucket, &k, v))
                .collect()
        })
    }

    pub fn get_by_prefix_as<T: DeserializeOwned>(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<T>> {
        self.get_by_prefix_decoded(bucket, prefix, |bytes| serde_json::from_slice(bytes))
    }

    pub fn get_by_prefix_with<T, C: Codec<T>>(
        &self,
        codec: &C,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<T>> {
        self.get_by_prefix_decoded(bucket, prefix, |bytes| codec.decode(bytes))
    }

    /// Keys starting with `prefix`, in key order. Values are not decrypted.
    pub fn get_key_list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        self.scoped(|| {
            self.walk_prefix(Operation::GetKeyList, bucket, prefix, |k, _| {
                String::from_utf8_lossy(k).into_owned()
            })
        })
    }

    /// Store pre-serialized bytes, encrypting them when a secret is set.
    pub fn save_raw(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()> {
        self.scoped(|| self.put(bucket, key, data))
    }

    /// Store `value` as JSON.
    pub fn save<T: Serialize + ?Sized>(&self, bucket: &str, key: &str, value: &T) -> Result<()> {
        let data = codec::to_json(value)
            .map_err(|e| serialization_error(Operation::Save, bucket, key.as_bytes(), e))?;
        self.save_raw(bucket, key, &data)
    }

    pub fn save_with<T, C: Codec<T>>(
        &self,
        codec: &C,
        bucket: &str,
        key: &str,
        value: &T,
    ) -> Result<()> {
        let data = codec
            .encode(value)
            .map_err(|e| serialization_error(Operation::Save, bucket, key.as_bytes(), e))?;
        self.save_raw(bucket, key, &data)
    }

    /// Remove `key`. Deleting a missing key succeeds.
    pub fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.scoped(|| {
            if key.is_empty() {
                return Err(VaultError::KeyInvalid {
                    op: Operation::Delete,
                });
            }
            self.with_handle(|handle| {
                handle.update(|txn| {
                    let mut records = txn
                        .bucket(bucket)?
                        .ok_or_else(|| VaultError::bucket_not_found(Operation::Delete, bucket))?;
                    records.delete(key.as_bytes())
                })
            })
        })
    }

    fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(VaultError::KeyInvalid { op: Operation::Save });
        }
        let value = match self.cipher() {
            Some(cipher) => cipher.encrypt(data)?,
            None => data.to_vec(),
        };
        self.with_handle(|handle| {
            handle.update(|txn| {
                let mut records = txn
                    .bucket(bucket)?
                    .ok_or_else(|| VaultError::bucket_not_found(Operation::Save, bucket))?;
                records.put(key.as_bytes(), &value)
            })
        })
    }

    fn get_one_decoded<T, Er>(
        &self,
        bucket: &str,
        key: &str,
        decode: impl Fn(&[u8]) -> std::result::Result<T, Er>,
    ) -> Result<Option<T>>
    where
        Er: std::error::Error + Send + Sync + 'static,
    {
        self.scoped(|| {
            let Some((k, v)) = self.first_with_prefix(Operation::GetOne, bucket, key)? else {
                return Ok(None);
            };
            let plain = self.open_value(Operation::GetOne, bucket, &k, v)?;
            decode(&plain)
                .map(Some)
                .map_err(|e| serialization_error(Operation::GetOne, bucket, &k, e))
        })
    }

    fn get_by_prefix_decoded<T, Er>(
        &self,
        bucket: &str,
        prefix: &str,
        decode: impl Fn(&[u8]) -> std::result::Result<T, Er>,
    ) -> Result<Vec<T>>
    where
        Er: std::error::Error + Send + Sync + 'static,
    {
        self.scoped(|| {
            let records = self.records_with_prefix(Operation::GetByPrefix, bucket, prefix)?;
            records
                .into_iter()
                .map(|(k, v)| {
                    let plain = self.open_value(Operation::GetByPrefix, bucket, &k, v)?;
                    decode(&plain)
                        .map_err(|e| serialization_error(Operation::GetByPrefix, bucket, &k, e))
                })
                .collect()
        })
    }

    fn first_with_prefix(
        &self,
        op: Operation,
        bucket: &str,
        key: &str,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if key.is_empty() {
            return Err(VaultError::KeyInvalid { op });
        }
        let prefix = key.as_bytes();
        self.with_handle(|handle| {
            handle.view(|txn| {
                let records = txn
                    .bucket(bucket)?
                    .ok_or_else(|| VaultError::bucket_not_found(op, bucket))?;
                let mut found = None;
                records.seek(prefix, &mut |k, v| {
                    if k.starts_with(prefix) {
                        found = Some((k.to_vec(), v.to_vec()));
                    }
                    ControlFlow::Break(())
                })?;
                Ok(found)
            })
        })
    }

    fn records_with_prefix(
        &self,
        op: Operation,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.walk_prefix(op, bucket, prefix, |k, v| (k.to_vec(), v.to_vec()))
            .inspect_err(|e| warn!(%op, bucket, prefix, error = %e, "prefix scan failed"))
    }

    fn walk_prefix<T>(
        &self,
        op: Operation,
        bucket: &str,
        prefix: &str,
        mut pick: impl FnMut(&[u8], &[u8]) -> T,
    ) -> Result<Vec<T>> {
        let prefix = prefix.as_bytes();
        self.with_handle(|handle| {
            handle.view(|txn| {
                let records = txn
                    .bucket(bucket)?
                    .ok_or_else(|| VaultError::bucket_not_found(op, bucket))?;
                let mut out = Vec::new();
                records.seek(prefix, &mut |k, v| {
                    if !k.starts_with(prefix) {
                        return ControlFlow::Break(());
                    }
                    out.push(pick(k, v));
                    ControlFlow::Continue(())
                })?;
                Ok(out)
            })
        })
    }

    fn open_value(&self, op: Operation, bucket: &str, key: &[u8], value: Vec<u8>) -> Result<Vec<u8>> {
        match self.cipher() {
            Some(cipher) => cipher.decrypt_vec(value).map_err(|source| VaultError::Decrypt {
                op,
                bucket: bucket.to_string(),
                key: String::from_utf8_lossy(key).into_owned(),
                source,
            }),
            None => Ok(value),
        }
    }

    fn cipher(&self) -> Option<Arc<CipherBox>> {
        self.cipher.read().clone()
    }

    /// Run `f` against an open handle, opening the store if needed.
    fn with_handle<T>(&self, f: impl FnOnce(&E::Handle) -> Result<T>) -> Result<T> {
        let handle = self.acquire()?;
        let lease = Lease {
            manager: self,
            handle: Some(handle.clone()),
        };
        let result = f(&handle);
        drop(handle);
        drop(lease);
        result
    }

    fn acquire(&self) -> Result<Arc<E::Handle>> {
        let mut state = self.lifecycle.lock();
        let handle = match &state.handle {
            Some(handle) => handle.clone(),
            None => {
                let handle = Arc::new(self.open_handle()?);
                state.handle = Some(handle.clone());
                handle
            }
        };
        state.active += 1;
        Ok(handle)
    }

    fn open_handle(&self) -> Result<E::Handle> {
        let handle = self.engine.open(&self.full_path)?;
        handle.update(|txn| {
            for name in &self.buckets {
                txn.create_bucket_if_missing(name)?;
            }
            Ok(())
        })?;
        debug!(
            path = %self.full_path.display(),
            buckets = self.buckets.len(),
            "store opened"
        );
        Ok(handle)
    }

    fn scoped<T>(&self, f: impl FnOnce() -> T) -> T {
        match &self.dispatch {
            Some(dispatch) => tracing::dispatcher::with_default(dispatch, f),
            None => f(),
        }
    }
}

fn serialization_error<Er>(op: Operation, bucket: &str, key: &[u8], e: Er) -> VaultError
where
    Er: std::error::Error + Send + Sync + 'static,
{
    VaultError::Serialization {
        op,
        bucket: bucket.to_string(),
        key: String::from_utf8_lossy(key).into_owned(),
        source: Box::new(e),
    }
}

impl<E: Engine> fmt::Debug for StoreManager<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreManager")
            .field("path", &self.full_path)
            .field("buckets", &self.buckets)
            .field("batch_mode", &self.batch_mode())
            .field("encrypted", &self.is_encrypted())
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use tempfile::tempdir;

    fn memory_manager(batch_mode: bool) -> (tempfile::TempDir, MemoryEngine, StoreManager<MemoryEngine>) {
        let dir = tempdir().unwrap();
        let engine = MemoryEngine::new();
        let options = StoreOptions::new("test.dat", dir.path())
            .bucket("article")
            .batch_mode(batch_mode);
        let manager = StoreManager::builder(options)
            .engine(engine.clone())
            .secret("secret")
            .build()
            .unwrap();
        (dir, engine, manager)
    }

    #[test]
    fn construction_leaves_store_closed() {
        let (_dir, engine, manager) = memory_manager(true);
        assert!(!manager.is_open());
        assert_eq!(engine.open_count(), 1);
        assert_eq!(engine.close_count(), 1);
        assert_eq!(engine.bucket_names(), vec!["article".to_string()]);
    }

    #[test]
    fn lease_closes_after_error() {
        let (_dir, engine, manager) = memory_manager(false);
        let err = manager.get_one("missing", "k").unwrap_err();
        assert!(matches!(err, VaultError::BucketNotFound { op: Operation::GetOne, .. }));
        assert!(!manager.is_open());
        assert_eq!(engine.live_handles(), 0);
    }

    #[test]
    fn close_waits_for_in_flight_operation() {
        let (_dir, engine, manager) = memory_manager(true);
        manager.save("article", "a-1", &"one").unwrap();
        let seen_open = manager
            .with_handle(|_| {
                manager.close();
                Ok(manager.is_open())
            })
            .unwrap();
        assert!(seen_open);
        assert!(!manager.is_open());
        assert_eq!(engine.live_handles(), 0);
        // batch mode survives an explicit close
        assert!(manager.batch_mode());
    }

    #[test]
    fn secret_can_be_switched_off() {
        let (_dir, engine, manager) = memory_manager(false);
        manager.set_secret("").unwrap();
        assert!(!manager.is_encrypted());
        manager.save_raw("article", "a-1", b"plain").unwrap();
        assert_eq!(engine.raw_value("article", b"a-1"), Some(b"plain".to_vec()));
    }
}
