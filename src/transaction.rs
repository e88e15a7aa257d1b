use std::ffi::CString;
use std::fmt;
use std::marker::PhantomData;
use std::os::raw::c_uint;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use lmdb_sys as ffi;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::constants::{TransactionFlags, WriteFlags};
use crate::cursor::{Cursor, CursorSlot};
use crate::database::{Database, DatabaseOptions};
use crate::env::Environment;
use crate::error::{mdb_result, Error, Result};
use crate::types::Stat;
use crate::value::{copy_val, empty_val, to_val};

/// Engine transaction pointer. Only ever touched by the thread that began it.
pub(crate) struct RawTxn(pub(crate) *mut ffi::MDB_txn);

unsafe impl Send for RawTxn {}
unsafe impl Sync for RawTxn {}

/// Where a transaction is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    Aborted,
}

pub(crate) struct TxnInner {
    id: u64,
    pub(crate) env: Environment,
    pub(crate) parent: Option<Arc<TxnInner>>,
    raw: RawTxn,
    flags: AtomicU32,
    /// Live `Transaction` handles; the last one to go aborts an active txn.
    handles: AtomicUsize,
    cursors: Mutex<Vec<Arc<CursorSlot>>>,
    /// Handles opened in this scope, not yet visible outside of it.
    databases: Mutex<Vec<Database>>,
}

impl TxnInner {
    fn flags(&self) -> TransactionFlags {
        TransactionFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    fn insert_flags(&self, flags: TransactionFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    fn remove_flags(&self, flags: TransactionFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn is_active(&self) -> bool {
        !self.flags().contains(TransactionFlags::FINISHED)
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.flags().contains(TransactionFlags::RDONLY)
    }

    pub(crate) fn has_child(&self) -> bool {
        self.flags().contains(TransactionFlags::HAS_CHILD)
    }

    fn status(&self) -> TransactionStatus {
        let flags = self.flags();
        if !flags.contains(TransactionFlags::FINISHED) {
            TransactionStatus::Active
        } else if flags.contains(TransactionFlags::ABORTED) {
            TransactionStatus::Aborted
        } else {
            TransactionStatus::Committed
        }
    }

    /// Active and not shadowed by a child.
    pub(crate) fn check_usable(&self) -> Result<()> {
        match self.status() {
            TransactionStatus::Committed => Err(Error::TransactionState("transaction is committed")),
            TransactionStatus::Aborted => Err(Error::TransactionState("transaction is aborted")),
            TransactionStatus::Active if self.has_child() => {
                Err(Error::TransactionState("transaction has an active child"))
            }
            TransactionStatus::Active => Ok(()),
        }
    }

    pub(crate) fn raw(&self) -> *mut ffi::MDB_txn {
        self.raw.0
    }

    /// Id of the top-level transaction this one is nested in.
    pub(crate) fn root_id(&self) -> u64 {
        self.parent.as_ref().map_or(self.id, |parent| parent.root_id())
    }

    pub(crate) fn register_cursor(&self, slot: Arc<CursorSlot>) {
        self.cursors.lock().push(slot);
    }

    pub(crate) fn forget_cursor(&self, slot: &Arc<CursorSlot>) {
        self.cursors.lock().retain(|other| !Arc::ptr_eq(other, slot));
    }

    /// Close every cursor still open in this transaction.
    fn release_cursors(&self) {
        let cursors: Vec<Arc<CursorSlot>> = self.cursors.lock().drain(..).collect();
        for slot in cursors {
            slot.close();
        }
    }

    pub(crate) fn pending_database(&self, name: &str) -> Option<Database> {
        self.databases
            .lock()
            .iter()
            .find(|db| db.is_open() && db.name() == name)
            .cloned()
    }

    fn take_databases(&self) -> Vec<Database> {
        self.databases.lock().drain(..).collect()
    }

    fn invalidate_databases(&self) {
        for db in self.take_databases() {
            debug!("discarding database {:?} opened in transaction {}", db.name(), self.id);
            self.env.discard_database(&db);
        }
    }

    fn finish(&self, aborted: bool) {
        let mut flags = TransactionFlags::FINISHED;
        if aborted {
            flags |= TransactionFlags::ABORTED;
        }
        self.insert_flags(flags);
    }
}

/// A read-only or read-write transaction.
///
/// Transactions belong to the thread that began them. Each thread keeps a
/// stack of active transactions; a new one nests under the top of that stack.
/// Committing or aborting a transaction finishes its active descendants too.
///
/// `Transaction` is a shared handle. When the last handle to an active
/// transaction is dropped, the transaction is aborted.
pub struct Transaction {
    inner: Arc<TxnInner>,
    _not_send: PhantomData<*const ()>,
}

impl Clone for Transaction {
    fn clone(&self) -> Self {
        Transaction::from_inner(self.inner.clone())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.inner.handles.fetch_sub(1, Ordering::AcqRel) == 1 && self.inner.is_active() {
            warn!("transaction {} dropped while active, aborting", self.inner.id);
            if let Err(err) = self.abort() {
                warn!("failed to abort transaction {}: {}", self.inner.id, err);
            }
        }
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Transaction {}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("read_only", &self.inner.is_read_only())
            .field("status", &self.inner.status())
            .finish()
    }
}

/// Aborts its transaction when dropped before `finish`, including on unwind.
struct Scope {
    txn: Transaction,
}

impl Scope {
    fn finish<R>(self, result: Result<R>) -> Result<R> {
        match result {
            Ok(value) => {
                if self.txn.is_active() {
                    self.txn.commit()?;
                }
                Ok(value)
            }
            Err(err) => {
                if self.txn.is_active() {
                    if let Err(abort_err) = self.txn.abort() {
                        warn!("failed to abort transaction {}: {}", self.txn.id(), abort_err);
                    }
                }
                Err(err)
            }
        }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        if self.txn.is_active() {
            debug!("transaction {} unwound, aborting", self.txn.id());
            if let Err(err) = self.txn.abort() {
                warn!("failed to abort transaction {}: {}", self.txn.id(), err);
            }
        }
    }
}

impl Environment {
    /// Begin a transaction nested under the calling thread's active
    /// transaction, if any.
    ///
    /// A read-only transaction cannot have children, and only a write
    /// transaction can be nested, under another write transaction.
    pub fn begin(&self, read_only: bool) -> Result<Transaction> {
        let parent = self.current_inner();
        self.begin_under(parent, read_only)
    }

    /// Run `f` in a new transaction; see [`begin`](Self::begin).
    ///
    /// The transaction commits when `f` returns `Ok` and aborts when it
    /// returns `Err` or panics. If `f` already committed or aborted it,
    /// nothing more happens.
    pub fn transaction<R, F>(&self, read_only: bool, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction) -> Result<R>,
    {
        let scope = Scope {
            txn: self.begin(read_only)?,
        };
        let result = f(&scope.txn);
        scope.finish(result)
    }

    fn begin_under(&self, parent: Option<Arc<TxnInner>>, read_only: bool) -> Result<Transaction> {
        let _open = self.guard()?;
        match &parent {
            Some(parent) => {
                parent.check_usable()?;
                if parent.is_read_only() {
                    return Err(if read_only {
                        Error::Incompatible("read-only transactions cannot be nested")
                    } else {
                        Error::Permission("cannot begin a write transaction inside a read-only one")
                    });
                }
                if read_only {
                    return Err(Error::Incompatible("read-only transactions cannot be nested"));
                }
                if self.config().write_map {
                    return Err(Error::Incompatible("nested transactions are unavailable with write_map"));
                }
            }
            None if !read_only && self.config().read_only => {
                return Err(Error::Permission("environment is read-only"));
            }
            None => {}
        }

        let flags = if read_only {
            TransactionFlags::RDONLY
        } else {
            TransactionFlags::empty()
        };
        let parent_raw = parent.as_ref().map_or(ptr::null_mut(), |p| p.raw());
        let mut raw: *mut ffi::MDB_txn = ptr::null_mut();
        mdb_result(unsafe { ffi::mdb_txn_begin(self.raw(), parent_raw, flags.bits() as c_uint, &mut raw) })?;

        let inner = Arc::new(TxnInner {
            id: self.next_txn_id(),
            env: self.clone(),
            parent: parent.clone(),
            raw: RawTxn(raw),
            flags: AtomicU32::new(flags.bits()),
            handles: AtomicUsize::new(0),
            cursors: Mutex::new(Vec::new()),
            databases: Mutex::new(Vec::new()),
        });
        if let Some(parent) = &parent {
            parent.insert_flags(TransactionFlags::HAS_CHILD);
        }
        self.push_scope(inner.clone());

        debug!(
            "began {} transaction {}{}",
            if read_only { "read-only" } else { "write" },
            inner.id,
            parent.map_or(String::new(), |p| format!(" under {}", p.id))
        );
        Ok(Transaction::from_inner(inner))
    }
}

impl Transaction {
    pub(crate) fn from_inner(inner: Arc<TxnInner>) -> Transaction {
        inner.handles.fetch_add(1, Ordering::AcqRel);
        Transaction {
            inner,
            _not_send: PhantomData,
        }
    }

    pub(crate) fn inner(&self) -> &Arc<TxnInner> {
        &self.inner
    }

    /// Process-unique transaction number, for logs.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn environment(&self) -> &Environment {
        &self.inner.env
    }

    pub fn parent(&self) -> Option<Transaction> {
        self.inner.parent.clone().map(Transaction::from_inner)
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    pub fn status(&self) -> TransactionStatus {
        self.inner.status()
    }

    /// Begin a child of this transaction, which must be the innermost one of
    /// the calling thread.
    pub fn begin_nested(&self, read_only: bool) -> Result<Transaction> {
        self.check_innermost()?;
        self.inner.env.begin_under(Some(self.inner.clone()), read_only)
    }

    /// Run `f` in a child of this transaction; see
    /// [`Environment::transaction`].
    pub fn transaction<R, F>(&self, read_only: bool, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction) -> Result<R>,
    {
        let scope = Scope {
            txn: self.begin_nested(read_only)?,
        };
        let result = f(&scope.txn);
        scope.finish(result)
    }

    fn check_innermost(&self) -> Result<()> {
        self.inner.check_usable()?;
        match self.inner.env.current_inner() {
            Some(top) if Arc::ptr_eq(&top, &self.inner) => Ok(()),
            _ => Err(Error::TransactionState("transaction is not the innermost one of this thread")),
        }
    }

    /// Commit this transaction and every active descendant.
    ///
    /// A child's writes and opened databases pass to its parent; only the
    /// top-level commit makes them durable and visible to others. If the
    /// engine rejects the commit, the transaction ends aborted.
    pub fn commit(&self) -> Result<()> {
        match self.inner.status() {
            TransactionStatus::Committed => return Err(Error::TransactionState("transaction is already committed")),
            TransactionStatus::Aborted => return Err(Error::TransactionState("transaction is already aborted")),
            TransactionStatus::Active => {}
        }
        let descendants = self.inner.env.unwind_to(&self.inner)?;
        for child in &descendants {
            child.release_cursors();
        }
        self.inner.release_cursors();

        // Committing a parent commits its open child in the engine.
        let outcome = mdb_result(unsafe { ffi::mdb_txn_commit(self.inner.raw()) });
        let aborted = outcome.is_err();

        for child in &descendants {
            child.finish(aborted);
            let databases = child.take_databases();
            match &child.parent {
                Some(parent) if !aborted => parent.databases.lock().extend(databases),
                _ => databases.iter().for_each(|db| self.inner.env.discard_database(db)),
            }
        }
        self.inner.finish(aborted);
        if aborted {
            self.inner.invalidate_databases();
        } else {
            let databases = self.inner.take_databases();
            match &self.inner.parent {
                Some(parent) => parent.databases.lock().extend(databases),
                None => self.inner.env.publish_databases(databases),
            }
        }
        match &self.inner.parent {
            Some(parent) => parent.remove_flags(TransactionFlags::HAS_CHILD),
            None => self.inner.env.end_root(self.inner.id),
        }

        match outcome {
            Ok(()) => {
                debug!("committed transaction {}", self.inner.id);
                Ok(())
            }
            Err(err) => {
                warn!("commit of transaction {} failed: {}", self.inner.id, err);
                Err(err)
            }
        }
    }

    /// Abort this transaction and every active descendant, discarding their
    /// writes and the databases opened in them. Aborting a finished
    /// transaction does nothing.
    pub fn abort(&self) -> Result<()> {
        if !self.inner.is_active() {
            return Ok(());
        }
        let descendants = self.inner.env.unwind_to(&self.inner)?;
        for child in &descendants {
            child.release_cursors();
        }
        self.inner.release_cursors();

        // Aborting a parent aborts its open child in the engine.
        unsafe { ffi::mdb_txn_abort(self.inner.raw()) };

        for child in &descendants {
            child.finish(true);
            child.invalidate_databases();
        }
        self.inner.finish(true);
        self.inner.invalidate_databases();
        match &self.inner.parent {
            Some(parent) => parent.remove_flags(TransactionFlags::HAS_CHILD),
            None => self.inner.env.end_root(self.inner.id),
        }

        debug!("aborted transaction {}", self.inner.id);
        Ok(())
    }

    /// Open a database in this transaction.
    ///
    /// The handle stays provisional until the top-level transaction commits:
    /// it is discarded if this transaction, or an ancestor, aborts. An empty
    /// name opens the unnamed main database.
    ///
    /// Every open of one database returns the same handle. While another
    /// thread's transaction that opened a database is still running, this
    /// fails with [`Error::TransactionState`].
    pub fn open_database(&self, name: &str, options: DatabaseOptions) -> Result<Database> {
        options.validate()?;
        self.inner.check_usable()?;
        let env = &self.inner.env;
        if let Some(db) = env.lookup_database(name, Some(&self.inner)) {
            return Ok(db);
        }
        if options.create && self.is_read_only() {
            return Err(Error::Permission("cannot create a database in a read-only transaction"));
        }

        let c_name = if name.is_empty() {
            None
        } else {
            Some(CString::new(name)?)
        };
        let root = self.inner.root_id();
        let mut dbi: ffi::MDB_dbi = 0;
        let mut flags: c_uint = 0;
        let mut dbis = env.inner.dbis.lock();
        dbis.check_opener(root)?;
        mdb_result(unsafe {
            ffi::mdb_dbi_open(
                self.inner.raw(),
                c_name.as_ref().map_or(ptr::null(), |n| n.as_ptr()),
                options.flags().bits(),
                &mut dbi,
            )
        })?;
        if let Some(db) = dbis.get(dbi) {
            return Ok(db);
        }
        mdb_result(unsafe { ffi::mdb_dbi_flags(self.inner.raw(), dbi, &mut flags) })?;

        let db = Database::new(env, name, dbi, flags);
        dbis.register(&db, root);
        drop(dbis);

        debug!("opened database {:?} in transaction {}", name, self.inner.id);
        self.inner.databases.lock().push(db.clone());
        Ok(db)
    }

    /// Check that `db` can be used in this transaction right now.
    pub(crate) fn check_database(&self, db: &Database) -> Result<()> {
        self.inner.check_usable()?;
        db.check_open()?;
        if !db.belongs_to(&self.inner.env) {
            return Err(Error::Incompatible("database belongs to another environment"));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.is_read_only() {
            Err(Error::Permission("write in a read-only transaction"))
        } else {
            Ok(())
        }
    }

    /// Value stored under `key`; the first one in a dup-sort table.
    pub fn get(&self, db: &Database, key: &[u8]) -> Result<Vec<u8>> {
        self.check_database(db)?;
        let mut key_val = to_val(key);
        let mut data = empty_val();
        mdb_result(unsafe { ffi::mdb_get(self.inner.raw(), db.dbi(), &mut key_val, &mut data) })?;
        Ok(unsafe { copy_val(&data) })
    }

    /// Store `value` under `key`.
    ///
    /// `RESERVE` and `MULTIPLE` are not supported. With `APPEND` an
    /// out-of-order key fails with [`Error::KeyExist`].
    pub fn put(&self, db: &Database, key: &[u8], value: &[u8], flags: WriteFlags) -> Result<()> {
        self.check_database(db)?;
        self.check_writable()?;
        if flags.intersects(WriteFlags::UNSUPPORTED) {
            return Err(Error::Incompatible("RESERVE and MULTIPLE writes are not supported"));
        }
        let mut key_val = to_val(key);
        let mut data = to_val(value);
        mdb_result(unsafe { ffi::mdb_put(self.inner.raw(), db.dbi(), &mut key_val, &mut data, flags.bits()) })
    }

    /// Delete `key`, or only the pair `key`/`value` when a value is given.
    /// Fails with [`Error::NotFound`] when nothing matches.
    pub fn del(&self, db: &Database, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        self.check_database(db)?;
        self.check_writable()?;
        let mut key_val = to_val(key);
        match value {
            Some(value) if db.is_dup_sort() => {
                let mut data = to_val(value);
                mdb_result(unsafe { ffi::mdb_del(self.inner.raw(), db.dbi(), &mut key_val, &mut data) })
            }
            Some(value) => {
                // The engine ignores the value outside dup-sort tables.
                if self.get(db, key)? != value {
                    return Err(Error::NotFound);
                }
                mdb_result(unsafe { ffi::mdb_del(self.inner.raw(), db.dbi(), &mut key_val, ptr::null_mut()) })
            }
            None => mdb_result(unsafe { ffi::mdb_del(self.inner.raw(), db.dbi(), &mut key_val, ptr::null_mut()) }),
        }
    }

    /// Structure of `db` as seen by this transaction.
    pub fn stat(&self, db: &Database) -> Result<Stat> {
        self.check_database(db)?;
        let mut stat: ffi::MDB_stat = unsafe { std::mem::zeroed() };
        mdb_result(unsafe { ffi::mdb_stat(self.inner.raw(), db.dbi(), &mut stat) })?;
        Ok(Stat::from(&stat))
    }

    /// Open a cursor over `db`. It is closed when dropped, or when this
    /// transaction ends, whichever comes first.
    pub fn cursor(&self, db: &Database) -> Result<Cursor> {
        self.check_database(db)?;
        let mut raw: *mut ffi::MDB_cursor = ptr::null_mut();
        mdb_result(unsafe { ffi::mdb_cursor_open(self.inner.raw(), db.dbi(), &mut raw) })?;
        let slot = Arc::new(CursorSlot::new(raw));
        self.inner.register_cursor(slot.clone());
        Ok(Cursor::new(slot, self.clone(), db.clone()))
    }

    /// Remove every record of `db`, keeping the database.
    pub fn clear(&self, db: &Database) -> Result<()> {
        self.check_database(db)?;
        self.check_writable()?;
        mdb_result(unsafe { ffi::mdb_drop(self.inner.raw(), db.dbi(), 0) })
    }

    /// Delete `db` from the environment. The handle is closed immediately;
    /// the deletion itself is subject to this transaction committing.
    pub fn drop_database(&self, db: &Database) -> Result<()> {
        self.check_database(db)?;
        self.check_writable()?;
        if db.name().is_empty() {
            return Err(Error::Incompatible("the main database cannot be dropped"));
        }
        {
            let _dbis = self.inner.env.inner.dbis.lock();
            mdb_result(unsafe { ffi::mdb_drop(self.inner.raw(), db.dbi(), 1) })?;
        }
        self.inner.env.discard_database(db);
        debug!("dropped database {:?} in transaction {}", db.name(), self.inner.id);
        Ok(())
    }
}
