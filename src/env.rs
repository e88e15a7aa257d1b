use std::collections::HashMap;
use std::ffi::CString;
use std::fmt;
use std::fs;
use std::os::raw::{c_int, c_uint};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use lmdb_sys as ffi;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::config::EnvConfig;
use crate::constants::{CopyFlags, EnvFlags};
use crate::database::{Database, DatabaseOptions};
use crate::error::{mdb_result, setup_result, Error, Handle, Result};
use crate::transaction::{Transaction, TxnInner};
use crate::types::{EnvInfo, Stat};

/// Engine environment pointer. The engine allows an environment to be used
/// from any thread.
pub(crate) struct RawEnv(pub(crate) *mut ffi::MDB_env);

unsafe impl Send for RawEnv {}
unsafe impl Sync for RawEnv {}

pub(crate) struct EnvInner {
    pub(crate) raw: RawEnv,
    path: PathBuf,
    config: EnvConfig,
    /// Cleared by `close`; readers hold it while touching the engine handle.
    open: RwLock<bool>,
    /// Per-thread stack of active transactions, innermost last.
    scopes: Mutex<HashMap<ThreadId, Vec<Arc<TxnInner>>>>,
    /// Handles published by committed top-level transactions.
    databases: Mutex<HashMap<String, Database>>,
    /// Every live handle by dbi. Held across `mdb_dbi_open` and
    /// `mdb_dbi_close`, which must not run concurrently.
    pub(crate) dbis: Mutex<DbiRegistry>,
    next_txn_id: AtomicU64,
}

impl Drop for EnvInner {
    fn drop(&mut self) {
        if *self.open.get_mut() {
            warn!("environment {} dropped without close", self.path.display());
            unsafe { ffi::mdb_env_close(self.raw.0) };
        }
    }
}

/// Live database handles, one per engine dbi.
///
/// A transaction that makes the engine allocate a dbi must end before any
/// other transaction may open a database; `opener` names its top-level
/// transaction until then.
#[derive(Default)]
pub(crate) struct DbiRegistry {
    handles: HashMap<ffi::MDB_dbi, Database>,
    opener: Option<u64>,
    /// Closed while transactions were live; released once none are.
    deferred: Vec<ffi::MDB_dbi>,
}

impl DbiRegistry {
    /// Fail unless the chain rooted at `root` may call `mdb_dbi_open`.
    pub(crate) fn check_opener(&self, root: u64) -> Result<()> {
        match self.opener {
            Some(owner) if owner != root => Err(Error::TransactionState(
                "another transaction opened a database and has not finished",
            )),
            _ => Ok(()),
        }
    }

    pub(crate) fn get(&self, dbi: ffi::MDB_dbi) -> Option<Database> {
        self.handles.get(&dbi).filter(|db| db.is_open()).cloned()
    }

    /// Record a handle for a dbi the registry did not know.
    pub(crate) fn register(&mut self, db: &Database, root: u64) {
        self.deferred.retain(|dbi| *dbi != db.dbi());
        self.handles.insert(db.dbi(), db.clone());
        self.opener = Some(root);
    }

    fn unregister(&mut self, db: &Database) {
        if self.handles.get(&db.dbi()).map_or(false, |known| known == db) {
            self.handles.remove(&db.dbi());
        }
    }
}

/// An open LMDB environment: one store on disk holding one or more
/// databases.
///
/// `Environment` is a cheap handle; clones refer to the same store. It owns
/// every [`Database`] handle opened through it and the per-thread stack of
/// active transactions.
#[derive(Clone)]
pub struct Environment {
    pub(crate) inner: Arc<EnvInner>,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("path", &self.inner.path)
            .field("open", &self.is_open())
            .finish()
    }
}

impl PartialEq for Environment {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Environment {}

/// Version of the linked engine as `(major, minor, patch)`.
pub fn version() -> (i32, i32, i32) {
    let (mut major, mut minor, mut patch): (c_int, c_int, c_int) = (0, 0, 0);
    unsafe { ffi::mdb_version(&mut major, &mut minor, &mut patch) };
    (major, minor, patch)
}

impl Environment {
    /// Open the environment at `path`.
    ///
    /// With `sub_dirs` (the default) the path is a directory, created when
    /// missing unless the environment is read-only.
    pub fn open<P: AsRef<Path>>(path: P, config: EnvConfig) -> Result<Environment> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        if config.sub_dirs && !config.read_only && !path.exists() {
            fs::create_dir_all(&path)?;
        }
        let c_path = path_to_cstring(&path)?;

        let mut raw: *mut ffi::MDB_env = ptr::null_mut();
        mdb_result(unsafe { ffi::mdb_env_create(&mut raw) })?;

        let setup = (|| -> Result<()> {
            unsafe {
                setup_result(ffi::mdb_env_set_maxreaders(raw, config.max_readers as c_uint))?;
                setup_result(ffi::mdb_env_set_mapsize(raw, config.max_size))?;
                setup_result(ffi::mdb_env_set_maxdbs(raw, config.max_dbs as ffi::MDB_dbi))?;
                setup_result(ffi::mdb_env_open(
                    raw,
                    c_path.as_ptr(),
                    config.flags().bits(),
                    config.mode as libc::mode_t,
                ))
            }
        })();
        if let Err(err) = setup {
            // The handle must be closed even when mdb_env_open failed.
            unsafe { ffi::mdb_env_close(raw) };
            return Err(err);
        }

        debug!("opened environment {} with {:?}", path.display(), config.flags());
        Ok(Environment {
            inner: Arc::new(EnvInner {
                raw: RawEnv(raw),
                path,
                config,
                open: RwLock::new(true),
                scopes: Mutex::new(HashMap::new()),
                databases: Mutex::new(HashMap::new()),
                dbis: Mutex::new(DbiRegistry::default()),
                next_txn_id: AtomicU64::new(1),
            }),
        })
    }

    /// Open the environment, run `f`, and close it again on every exit path.
    pub fn open_scoped<P, R, F>(path: P, config: EnvConfig, f: F) -> Result<R>
    where
        P: AsRef<Path>,
        F: FnOnce(&Environment) -> Result<R>,
    {
        let env = Environment::open(path, config)?;
        let result = f(&env);
        let closed = env.close();
        let value = result?;
        closed.map(|_| value)
    }

    /// Close the environment and release the map.
    ///
    /// Fails while any transaction of this environment is active, on any
    /// thread. Every database handle opened through the environment is
    /// invalidated. Closing a closed environment does nothing.
    pub fn close(&self) -> Result<()> {
        let mut open = self.inner.open.write();
        if !*open {
            return Ok(());
        }
        let active = self.active_count();
        if active > 0 {
            warn!(
                "refusing to close environment {} with {} active transactions",
                self.inner.path.display(),
                active
            );
            return Err(Error::TransactionState("environment has active transactions"));
        }

        self.inner.databases.lock().clear();
        let databases: Vec<Database> = {
            let mut dbis = self.inner.dbis.lock();
            dbis.deferred.clear();
            dbis.opener = None;
            dbis.handles.drain().map(|(_, db)| db).collect()
        };
        for db in &databases {
            db.invalidate();
        }
        unsafe { ffi::mdb_env_close(self.inner.raw.0) };
        *open = false;

        debug!("closed environment {}", self.inner.path.display());
        Ok(())
    }

    /// Whether [`close`](Self::close) has not been called yet.
    pub fn is_open(&self) -> bool {
        *self.inner.open.read_recursive()
    }

    /// Path the environment was opened with.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn config(&self) -> &EnvConfig {
        &self.inner.config
    }

    /// Structure of the main B+tree.
    pub fn stat(&self) -> Result<Stat> {
        let _open = self.guard()?;
        let mut stat: ffi::MDB_stat = unsafe { std::mem::zeroed() };
        mdb_result(unsafe { ffi::mdb_env_stat(self.inner.raw.0, &mut stat) })?;
        Ok(Stat::from(&stat))
    }

    /// Map and reader table state.
    pub fn info(&self) -> Result<EnvInfo> {
        let _open = self.guard()?;
        let mut info: ffi::MDB_envinfo = unsafe { std::mem::zeroed() };
        mdb_result(unsafe { ffi::mdb_env_info(self.inner.raw.0, &mut info) })?;
        Ok(EnvInfo::from(&info))
    }

    /// Flush the data buffers to disk.
    ///
    /// Only needed when the environment runs without `sync`, or with
    /// `map_async`. `force` flushes synchronously even then.
    pub fn sync(&self, force: bool) -> Result<()> {
        let _open = self.guard()?;
        mdb_result(unsafe { ffi::mdb_env_sync(self.inner.raw.0, force as c_int) })
    }

    /// Copy the environment to `path`, which must be an empty directory
    /// (created when missing) or, without `sub_dirs`, a file path.
    pub fn copy<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.copy_with(path.as_ref(), CopyFlags::empty())
    }

    /// Copy the environment to `path`, omitting free pages.
    pub fn copy_compact<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.copy_with(path.as_ref(), CopyFlags::COMPACT)
    }

    fn copy_with(&self, path: &Path, flags: CopyFlags) -> Result<()> {
        let _open = self.guard()?;
        if self.inner.config.sub_dirs && !path.exists() {
            fs::create_dir_all(path)?;
        }
        let c_path = path_to_cstring(path)?;
        mdb_result(unsafe { ffi::mdb_env_copy2(self.inner.raw.0, c_path.as_ptr(), flags.bits()) })?;
        debug!("copied environment {} to {}", self.inner.path.display(), path.display());
        Ok(())
    }

    /// Flags currently in effect.
    pub fn flags(&self) -> Result<EnvFlags> {
        let _open = self.guard()?;
        let mut flags: c_uint = 0;
        mdb_result(unsafe { ffi::mdb_env_get_flags(self.inner.raw.0, &mut flags) })?;
        Ok(EnvFlags::from_bits_truncate(flags))
    }

    /// Turn on runtime-changeable flags.
    pub fn set_flags(&self, flags: EnvFlags) -> Result<()> {
        self.toggle_flags(flags, true)
    }

    /// Turn off runtime-changeable flags.
    pub fn clear_flags(&self, flags: EnvFlags) -> Result<()> {
        self.toggle_flags(flags, false)
    }

    fn toggle_flags(&self, flags: EnvFlags, on: bool) -> Result<()> {
        if !EnvFlags::CHANGEABLE.contains(flags) {
            return Err(Error::InvalidConfig(format!(
                "{:?} cannot be changed on an open environment",
                flags.difference(EnvFlags::CHANGEABLE)
            )));
        }
        let _open = self.guard()?;
        mdb_result(unsafe { ffi::mdb_env_set_flags(self.inner.raw.0, flags.bits(), on as c_int) })
    }

    /// Grow (or shrink) the map ceiling. Rejected while transactions are
    /// active.
    pub fn set_max_size(&self, bytes: usize) -> Result<()> {
        let open = self.inner.open.write();
        if !*open {
            return Err(Error::InvalidHandle(Handle::Environment));
        }
        if self.active_count() > 0 {
            return Err(Error::TransactionState("cannot resize the map with active transactions"));
        }
        mdb_result(unsafe { ffi::mdb_env_set_mapsize(self.inner.raw.0, bytes) })
    }

    /// Longest key the engine accepts.
    pub fn max_key_size(&self) -> Result<usize> {
        let _open = self.guard()?;
        Ok(unsafe { ffi::mdb_env_get_maxkeysize(self.inner.raw.0) } as usize)
    }

    /// Release reader slots left behind by dead processes or threads.
    /// Returns how many were cleared.
    pub fn reader_check(&self) -> Result<usize> {
        let _open = self.guard()?;
        let mut dead: c_int = 0;
        mdb_result(unsafe { ffi::mdb_reader_check(self.inner.raw.0, &mut dead) })?;
        Ok(dead as usize)
    }

    /// Get a database handle, opening it on first use.
    ///
    /// A cached handle is returned as is. Otherwise the database is opened
    /// inside the current transaction, or an implicit one. With
    /// `options.create` a missing database is created; without it a missing
    /// database is [`Error::NotFound`].
    pub fn database(&self, name: &str, options: DatabaseOptions) -> Result<Database> {
        if let Some(db) = self.lookup_database(name, self.current_inner().as_ref()) {
            return Ok(db);
        }
        if options.create && self.inner.config.read_only {
            return Err(Error::Permission("cannot create a database in a read-only environment"));
        }
        let access = if options.create {
            crate::convenience::Access::Write
        } else {
            crate::convenience::Access::Read
        };
        self.with_implicit_txn(access, |txn| txn.open_database(name, options))
    }

    /// Open a database, run `f`, and close the handle on every exit path.
    pub fn with_database<R, F>(&self, name: &str, options: DatabaseOptions, f: F) -> Result<R>
    where
        F: FnOnce(&Database) -> Result<R>,
    {
        let db = self.database(name, options)?;
        let result = f(&db);
        let closed = db.close();
        let value = result?;
        closed.map(|_| value)
    }

    /// The calling thread's innermost active transaction.
    pub fn active_transaction(&self) -> Option<Transaction> {
        self.current_inner().map(Transaction::from_inner)
    }

    pub(crate) fn guard(&self) -> Result<RwLockReadGuard<'_, bool>> {
        let open = self.inner.open.read_recursive();
        if *open {
            Ok(open)
        } else {
            Err(Error::InvalidHandle(Handle::Environment))
        }
    }

    pub(crate) fn next_txn_id(&self) -> u64 {
        self.inner.next_txn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn current_inner(&self) -> Option<Arc<TxnInner>> {
        self.inner
            .scopes
            .lock()
            .get(&thread::current().id())
            .and_then(|stack| stack.last().cloned())
    }

    pub(crate) fn push_scope(&self, txn: Arc<TxnInner>) {
        self.inner
            .scopes
            .lock()
            .entry(thread::current().id())
            .or_default()
            .push(txn);
    }

    /// Pop `target` and everything above it off the calling thread's stack.
    /// Returns the popped descendants, innermost first.
    pub(crate) fn unwind_to(&self, target: &Arc<TxnInner>) -> Result<Vec<Arc<TxnInner>>> {
        let id = thread::current().id();
        let mut scopes = self.inner.scopes.lock();
        let stack = scopes
            .get_mut(&id)
            .ok_or(Error::TransactionState("transaction is not active on this thread"))?;
        let pos = stack
            .iter()
            .rposition(|txn| Arc::ptr_eq(txn, target))
            .ok_or(Error::TransactionState("transaction is not active on this thread"))?;

        let mut popped = stack.split_off(pos);
        if stack.is_empty() {
            scopes.remove(&id);
        }
        popped.remove(0);
        popped.reverse();
        Ok(popped)
    }

    fn active_count(&self) -> usize {
        self.inner.scopes.lock().values().map(Vec::len).sum()
    }

    /// Find an open handle visible from `txn`: handles still provisional in
    /// its chain first, then the published cache.
    pub(crate) fn lookup_database(&self, name: &str, txn: Option<&Arc<TxnInner>>) -> Option<Database> {
        let mut scope = txn.cloned();
        while let Some(current) = scope {
            if let Some(db) = current.pending_database(name) {
                return Some(db);
            }
            scope = current.parent.clone();
        }
        let mut databases = self.inner.databases.lock();
        match databases.get(name) {
            Some(db) if db.is_open() => Some(db.clone()),
            Some(_) => {
                databases.remove(name);
                None
            }
            None => None,
        }
    }

    /// Make handles opened by a committed top-level transaction visible to
    /// everyone.
    pub(crate) fn publish_databases(&self, databases: Vec<Database>) {
        let mut cache = self.inner.databases.lock();
        for db in databases.into_iter().filter(Database::is_open) {
            debug!("published database {:?}", db.name());
            cache.entry(db.name().to_string()).or_insert(db);
        }
    }

    /// Drop a closed handle from the cache and, when nothing can still be
    /// using it, from the engine.
    pub(crate) fn forget_database(&self, db: &Database) {
        self.forget_cached(db);
        let Ok(_open) = self.guard() else {
            return;
        };
        let mut dbis = self.inner.dbis.lock();
        dbis.unregister(db);
        if self.active_count() == 0 {
            unsafe { ffi::mdb_dbi_close(self.inner.raw.0, db.dbi()) };
        } else {
            debug!("deferring close of database {:?} until transactions end", db.name());
            dbis.deferred.push(db.dbi());
        }
    }

    /// Remove a handle that is no longer valid from the cache and the
    /// registry, leaving the engine dbi alone.
    pub(crate) fn discard_database(&self, db: &Database) {
        db.invalidate();
        self.forget_cached(db);
        self.inner.dbis.lock().unregister(db);
    }

    pub(crate) fn forget_cached(&self, db: &Database) {
        let mut cache = self.inner.databases.lock();
        if cache.get(db.name()).map_or(false, |cached| cached == db) {
            cache.remove(db.name());
        }
    }

    /// Bookkeeping once the top-level transaction `root` has ended: other
    /// transactions may open databases again, and closes deferred while
    /// transactions were live are carried out.
    pub(crate) fn end_root(&self, root: u64) {
        let Ok(_open) = self.guard() else {
            return;
        };
        let mut dbis = self.inner.dbis.lock();
        if dbis.opener == Some(root) {
            dbis.opener = None;
        }
        if !dbis.deferred.is_empty() && self.active_count() == 0 {
            for dbi in dbis.deferred.drain(..) {
                unsafe { ffi::mdb_dbi_close(self.inner.raw.0, dbi) };
            }
        }
    }

    pub(crate) fn raw(&self) -> *mut ffi::MDB_env {
        self.inner.raw.0
    }
}

fn path_to_cstring(path: &Path) -> Result<CString> {
    let path = path
        .to_str()
        .ok_or_else(|| Error::InvalidConfig(format!("path {} is not valid UTF-8", path.display())))?;
    Ok(CString::new(path)?)
}
