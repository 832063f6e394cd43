//! redb binding. Buckets are redb tables keyed and valued by raw bytes.

use std::fs::{File, OpenOptions};
use std::path::Path;

use redb::{
    Database, ReadOnlyTable, ReadTransaction, ReadableTable, Table, TableDefinition, TableError,
    TableHandle, WriteTransaction,
};
use tracing::{debug, warn};

use super::{Engine, Handle, ReadBucket, ReadTxn, Visitor, WriteBucket, WriteTxn};
use crate::error::{Result, VaultError};

type Bytes = &'static [u8];

fn definition(name: &str) -> TableDefinition<'_, Bytes, Bytes> {
    TableDefinition::new(name)
}

/// Owner-only permissions on unix; redb takes over the file from here.
fn store_file(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true).truncate(false);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RedbEngine;

impl Engine for RedbEngine {
    type Handle = RedbHandle;

    fn open(&self, path: &Path) -> Result<RedbHandle> {
        let file = store_file(path)?;
        let db = Database::builder().create_file(file)?;
        debug!(path = %path.display(), "redb store opened");
        Ok(RedbHandle { db })
    }
}

pub struct RedbHandle {
    db: Database,
}

impl Handle for RedbHandle {
    type Read = ReadTransaction;
    type Write = WriteTransaction;

    fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ReadTransaction) -> Result<T>,
    {
        let txn = self.db.begin_read()?;
        f(&txn)
    }

    fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut WriteTransaction) -> Result<T>,
    {
        let mut txn = self.db.begin_write()?;
        match f(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort) = txn.abort() {
                    warn!(error = %abort, "write transaction abort failed");
                }
                Err(e)
            }
        }
    }
}

impl ReadTxn for ReadTransaction {
    type Bucket<'a> = ReadOnlyTable<Bytes, Bytes>
    where
        Self: 'a;

    fn bucket(&self, name: &str) -> Result<Option<Self::Bucket<'_>>> {
        // redb panics on empty table names
        if name.is_empty() {
            return Ok(None);
        }
        match self.open_table(definition(name)) {
            Ok(table) => Ok(Some(table)),
            Err(TableError::TableDoesNotExist(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl WriteTxn for WriteTransaction {
    type Bucket<'a> = Table<'a, Bytes, Bytes>
    where
        Self: 'a;

    fn bucket(&mut self, name: &str) -> Result<Option<Self::Bucket<'_>>> {
        if name.is_empty() {
            return Ok(None);
        }
        // open_table would create the table, so check first
        let exists = self.list_tables()?.any(|table| table.name() == name);
        if !exists {
            return Ok(None);
        }
        Ok(Some(self.open_table(definition(name))?))
    }

    fn create_bucket_if_missing(&mut self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(VaultError::BucketNameInvalid);
        }
        self.open_table(definition(name))?;
        Ok(())
    }
}

fn seek_table<T>(table: &T, from: &[u8], visit: &mut Visitor<'_>) -> Result<()>
where
    T: ReadableTable<Bytes, Bytes>,
{
    for entry in table.range::<&[u8]>(from..)? {
        let (key, value) = entry?;
        if visit(key.value(), value.value()).is_break() {
            break;
        }
    }
    Ok(())
}

impl ReadBucket for ReadOnlyTable<Bytes, Bytes> {
    fn seek(&self, from: &[u8], visit: &mut Visitor<'_>) -> Result<()> {
        seek_table(self, from, visit)
    }
}

impl ReadBucket for Table<'_, Bytes, Bytes> {
    fn seek(&self, from: &[u8], visit: &mut Visitor<'_>) -> Result<()> {
        seek_table(self, from, visit)
    }
}

impl WriteBucket for Table<'_, Bytes, Bytes> {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.insert(key, value)?;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.remove(key)?;
        Ok(())
    }
}
