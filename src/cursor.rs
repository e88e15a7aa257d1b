use std::cell::Cell;
use std::fmt;
use std::os::raw::c_uint;
use std::ptr;
use std::sync::Arc;

use lmdb_sys as ffi;
use log::trace;
use parking_lot::Mutex;

use crate::constants::WriteFlags;
use crate::database::Database;
use crate::error::{mdb_result, Error, Handle, Result};
use crate::transaction::Transaction;
use crate::types::{CursorOp, Record};
use crate::value::{copy_val, empty_val, to_val};

struct RawCursor(*mut ffi::MDB_cursor);

unsafe impl Send for RawCursor {}

/// Engine cursor shared between a [`Cursor`] and its transaction, so that
/// whichever ends first closes it. Null once closed.
pub(crate) struct CursorSlot {
    raw: Mutex<RawCursor>,
}

impl CursorSlot {
    pub(crate) fn new(raw: *mut ffi::MDB_cursor) -> CursorSlot {
        CursorSlot {
            raw: Mutex::new(RawCursor(raw)),
        }
    }

    fn get(&self) -> *mut ffi::MDB_cursor {
        self.raw.lock().0
    }

    /// Close the engine cursor. Returns false if it already was.
    pub(crate) fn close(&self) -> bool {
        let mut raw = self.raw.lock();
        if raw.0.is_null() {
            return false;
        }
        unsafe { ffi::mdb_cursor_close(raw.0) };
        raw.0 = ptr::null_mut();
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    /// Not placed yet, or parked before the first record.
    Unset,
    /// On a record.
    Record,
    /// A move ran off either end.
    Exhausted,
}

/// A position inside one database, valid for the life of its transaction.
///
/// Every move returns the record it lands on, or `None` when there is no such
/// record. Once the transaction ends any use fails with
/// [`Error::InvalidCursor`].
pub struct Cursor {
    slot: Arc<CursorSlot>,
    txn: Transaction,
    db: Database,
    position: Cell<Position>,
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("database", &self.db.name())
            .field("transaction", &self.txn.id())
            .field("position", &self.position.get())
            .finish()
    }
}

impl Cursor {
    pub(crate) fn new(slot: Arc<CursorSlot>, txn: Transaction, db: Database) -> Cursor {
        Cursor {
            slot,
            txn,
            db,
            position: Cell::new(Position::Unset),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn transaction(&self) -> &Transaction {
        &self.txn
    }

    /// Whether the cursor currently sits on a record.
    pub fn is_positioned(&self) -> bool {
        self.position.get() == Position::Record
    }

    fn raw(&self) -> Result<*mut ffi::MDB_cursor> {
        if !self.txn.is_active() {
            return Err(Error::InvalidCursor);
        }
        if self.txn.inner().has_child() {
            return Err(Error::TransactionState("transaction has an active child"));
        }
        let raw = self.slot.get();
        if raw.is_null() {
            return Err(Error::InvalidHandle(Handle::Cursor));
        }
        Ok(raw)
    }

    fn get(&self, op: CursorOp, key: Option<&[u8]>, value: Option<&[u8]>) -> Result<Option<Record>> {
        let raw = self.raw()?;
        debug_assert!(key.is_some() == op.takes_key());
        let mut key_val = key.map_or_else(empty_val, to_val);
        let mut data = value.map_or_else(empty_val, to_val);
        match mdb_result(unsafe { ffi::mdb_cursor_get(raw, &mut key_val, &mut data, op.code()) }) {
            Ok(()) => {
                self.position.set(Position::Record);
                Ok(Some(unsafe { (copy_val(&key_val), copy_val(&data)) }))
            }
            Err(Error::NotFound) => {
                match op {
                    // Moves within a key's duplicates keep the cursor where it was.
                    CursorOp::NextDup | CursorOp::FirstDup | CursorOp::LastDup => {}
                    _ => self.position.set(Position::Exhausted),
                }
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Move to the first record.
    pub fn first(&self) -> Result<Option<Record>> {
        self.get(CursorOp::First, None, None)
    }

    /// Move to the last record.
    pub fn last(&self) -> Result<Option<Record>> {
        self.get(CursorOp::Last, None, None)
    }

    /// Move to the next record; from an unplaced cursor, the first one.
    pub fn next(&self) -> Result<Option<Record>> {
        match self.position.get() {
            Position::Unset => self.first(),
            _ => self.get(CursorOp::Next, None, None),
        }
    }

    /// Move to the previous record; from an unplaced cursor, the last one.
    pub fn prev(&self) -> Result<Option<Record>> {
        match self.position.get() {
            Position::Unset => self.last(),
            _ => self.get(CursorOp::Prev, None, None),
        }
    }

    /// Like [`next`](Self::next), but stop at keys greater than `bound`
    /// (ordered by the database's comparator). When stopping, the cursor
    /// steps back so the out-of-range record is not consumed.
    pub fn next_range(&self, bound: &[u8]) -> Result<Option<Record>> {
        let Some((key, value)) = self.next()? else {
            return Ok(None);
        };
        if self.compare_keys(&key, bound)? <= 0 {
            return Ok(Some((key, value)));
        }
        if self.get(CursorOp::Prev, None, None)?.is_none() {
            // Stepped back from the first record: park before it.
            self.position.set(Position::Unset);
        }
        Ok(None)
    }

    fn compare_keys(&self, a: &[u8], b: &[u8]) -> Result<i32> {
        self.raw()?;
        let a = to_val(a);
        let b = to_val(b);
        Ok(unsafe { ffi::mdb_cmp(self.txn.inner().raw(), self.db.dbi(), &a, &b) })
    }

    /// The record under the cursor.
    pub fn current(&self) -> Result<Option<Record>> {
        if self.position.get() != Position::Record {
            self.raw()?;
            return Ok(None);
        }
        self.get(CursorOp::GetCurrent, None, None)
    }

    /// Move to `key`; in a dup-sort table, to its first value.
    pub fn set(&self, key: &[u8]) -> Result<Option<Record>> {
        self.get(CursorOp::SetKey, Some(key), None)
    }

    /// Move to the exact pair `key`/`value`.
    pub fn set_exact(&self, key: &[u8], value: &[u8]) -> Result<Option<Record>> {
        if self.db.is_dup_sort() {
            return self.get(CursorOp::GetBoth, Some(key), Some(value));
        }
        match self.set(key)? {
            Some(record) if record.1 == value => Ok(Some(record)),
            Some(_) => Ok(None),
            None => Ok(None),
        }
    }

    /// Move to the first key greater than or equal to `key`.
    pub fn set_range(&self, key: &[u8]) -> Result<Option<Record>> {
        self.get(CursorOp::SetRange, Some(key), None)
    }

    /// Next value of the current key, in a dup-sort table.
    pub fn next_dup(&self) -> Result<Option<Record>> {
        if !self.on_dup_sort_record()? {
            return Ok(None);
        }
        self.get(CursorOp::NextDup, None, None)
    }

    /// First record of the next key, skipping remaining duplicates.
    pub fn next_nodup(&self) -> Result<Option<Record>> {
        match self.position.get() {
            Position::Unset => self.first(),
            _ => self.get(CursorOp::NextNoDup, None, None),
        }
    }

    /// First value of the current key.
    pub fn first_dup(&self) -> Result<Option<Record>> {
        if !self.on_dup_sort_record()? {
            return self.current();
        }
        // The engine only reports the value for these two moves.
        self.get(CursorOp::FirstDup, None, None)?;
        self.current()
    }

    /// Last value of the current key.
    pub fn last_dup(&self) -> Result<Option<Record>> {
        if !self.on_dup_sort_record()? {
            return self.current();
        }
        self.get(CursorOp::LastDup, None, None)?;
        self.current()
    }

    fn on_dup_sort_record(&self) -> Result<bool> {
        self.raw()?;
        Ok(self.db.is_dup_sort() && self.position.get() == Position::Record)
    }

    /// Number of values stored under the current key of a dup-sort table.
    pub fn count(&self) -> Result<usize> {
        let raw = self.raw()?;
        if !self.db.is_dup_sort() {
            return Err(Error::Incompatible("count needs a dup-sort database"));
        }
        if self.position.get() != Position::Record {
            return Err(Error::NotFound);
        }
        let mut count: usize = 0;
        mdb_result(unsafe { ffi::mdb_cursor_count(raw, &mut count) })?;
        Ok(count)
    }

    /// Store a record and move onto it.
    pub fn put(&self, key: &[u8], value: &[u8], flags: WriteFlags) -> Result<()> {
        let raw = self.raw()?;
        if self.txn.is_read_only() {
            return Err(Error::Permission("write in a read-only transaction"));
        }
        if flags.intersects(WriteFlags::UNSUPPORTED) {
            return Err(Error::Incompatible("RESERVE and MULTIPLE writes are not supported"));
        }
        let mut key_val = to_val(key);
        let mut data = to_val(value);
        mdb_result(unsafe { ffi::mdb_cursor_put(raw, &mut key_val, &mut data, flags.bits() as c_uint) })?;
        self.position.set(Position::Record);
        Ok(())
    }

    /// Delete the record under the cursor, or with `all_duplicates` every
    /// value of its key.
    pub fn delete(&self, all_duplicates: bool) -> Result<()> {
        let raw = self.raw()?;
        if self.txn.is_read_only() {
            return Err(Error::Permission("write in a read-only transaction"));
        }
        if self.position.get() != Position::Record {
            return Err(Error::NotFound);
        }
        let flags = if all_duplicates && self.db.is_dup_sort() {
            WriteFlags::NODUPDATA
        } else {
            WriteFlags::empty()
        };
        mdb_result(unsafe { ffi::mdb_cursor_del(raw, flags.bits() as c_uint) })
    }

    /// Close the cursor. Closing twice, or after the transaction ended, does
    /// nothing.
    pub fn close(&self) -> Result<()> {
        if self.slot.close() {
            self.txn.inner().forget_cursor(&self.slot);
            trace!("closed cursor on {:?} in transaction {}", self.db.name(), self.txn.id());
        }
        Ok(())
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
