//! Record-level helpers on [`Database`].
//!
//! Each helper runs inside the calling thread's active transaction when there
//! is one, and otherwise inside an implicit transaction that commits when the
//! helper returns and aborts if it fails.

use crate::constants::WriteFlags;
use crate::cursor::Cursor;
use crate::database::Database;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::transaction::Transaction;
use crate::types::{Record, Stat};

/// What a helper needs from the transaction it runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    Write,
    /// Reuse whatever is active; otherwise start a write transaction, or a
    /// read-only one on a read-only environment.
    Any,
}

impl Environment {
    pub(crate) fn with_implicit_txn<R, F>(&self, access: Access, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction) -> Result<R>,
    {
        if let Some(txn) = self.active_transaction() {
            if access == Access::Write && txn.is_read_only() {
                return Err(Error::Permission("write in a read-only transaction"));
            }
            return f(&txn);
        }
        let read_only = match access {
            Access::Read => true,
            Access::Write => false,
            Access::Any => self.config().read_only,
        };
        self.transaction(read_only, f)
    }
}

fn found<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(Error::NotFound) => Ok(None),
        Err(err) => Err(err),
    }
}

impl Database {
    fn run<R, F>(&self, access: Access, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction) -> Result<R>,
    {
        self.check_open()?;
        self.environment()?.with_implicit_txn(access, f)
    }

    /// Value stored under `key`, the first one in a dup-sort table.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.run(Access::Read, |txn| found(txn.get(self, key)))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_with(key, value, WriteFlags::empty())
    }

    /// Store a record with explicit write flags.
    pub fn put_with(&self, key: &[u8], value: &[u8], flags: WriteFlags) -> Result<()> {
        self.run(Access::Write, |txn| txn.put(self, key, value, flags))
    }

    /// Delete `key`, or only the pair `key`/`value`. Fails with
    /// [`Error::NotFound`] when nothing matches.
    pub fn delete(&self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        self.run(Access::Write, |txn| txn.del(self, key, value))
    }

    /// Like [`delete`](Self::delete), but report a missing record as `false`.
    pub fn delete_if_present(&self, key: &[u8], value: Option<&[u8]>) -> Result<bool> {
        self.run(Access::Write, |txn| Ok(found(txn.del(self, key, value))?.is_some()))
    }

    /// Whether `key` exists, or with a value, whether that exact pair does.
    pub fn has(&self, key: &[u8], value: Option<&[u8]>) -> Result<bool> {
        self.run(Access::Read, |txn| match value {
            None => Ok(found(txn.get(self, key))?.is_some()),
            Some(value) => Ok(txn.cursor(self)?.set_exact(key, value)?.is_some()),
        })
    }

    /// Visit every record in key order.
    pub fn each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        self.run(Access::Read, |txn| {
            let cursor = txn.cursor(self)?;
            while let Some((key, value)) = cursor.next()? {
                f(&key, &value)?;
            }
            Ok(())
        })
    }

    /// Visit every distinct key in order.
    pub fn each_key<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        self.run(Access::Read, |txn| {
            let cursor = txn.cursor(self)?;
            while let Some((key, _)) = cursor.next_nodup()? {
                f(&key)?;
            }
            Ok(())
        })
    }

    /// Visit every value stored under `key`.
    pub fn each_value<F>(&self, key: &[u8], mut f: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        self.run(Access::Read, |txn| {
            let cursor = txn.cursor(self)?;
            let mut record = cursor.set(key)?;
            while let Some((_, value)) = record {
                f(&value)?;
                record = cursor.next_dup()?;
            }
            Ok(())
        })
    }

    /// Number of values stored under `key`.
    pub fn cardinality(&self, key: &[u8]) -> Result<usize> {
        self.run(Access::Read, |txn| {
            let cursor = txn.cursor(self)?;
            match cursor.set(key)? {
                None => Ok(0),
                Some(_) if self.is_dup_sort() => cursor.count(),
                Some(_) => Ok(1),
            }
        })
    }

    /// Number of records.
    pub fn size(&self) -> Result<usize> {
        Ok(self.stat()?.entries)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    pub fn stat(&self) -> Result<Stat> {
        self.run(Access::Read, |txn| txn.stat(self))
    }

    /// Every distinct key, in order.
    pub fn keys(&self) -> Result<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        self.each_key(|key| {
            keys.push(key.to_vec());
            Ok(())
        })?;
        Ok(keys)
    }

    /// Every value stored under `key`.
    pub fn values(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut values = Vec::new();
        self.each_value(key, |value| {
            values.push(value.to_vec());
            Ok(())
        })?;
        Ok(values)
    }

    /// Every record, in key order.
    pub fn to_vec(&self) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        self.each(|key, value| {
            records.push((key.to_vec(), value.to_vec()));
            Ok(())
        })?;
        Ok(records)
    }

    /// Run `f` with a cursor that is closed when `f` returns.
    ///
    /// Without an active transaction a write transaction is started, so the
    /// cursor can modify records.
    pub fn cursor<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Cursor) -> Result<R>,
    {
        self.run(Access::Any, |txn| {
            let cursor = txn.cursor(self)?;
            let result = f(&cursor);
            cursor.close()?;
            result
        })
    }

    /// Remove every record, keeping the database.
    pub fn clear(&self) -> Result<()> {
        self.run(Access::Write, |txn| txn.clear(self))
    }

    /// Delete the database from the environment and close this handle.
    pub fn drop_database(&self) -> Result<()> {
        self.run(Access::Write, |txn| txn.drop_database(self))
    }
}
