use std::fmt;
use std::os::raw::c_uint;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use lmdb_sys as ffi;
use log::debug;

use crate::constants::DbFlags;
use crate::env::{EnvInner, Environment};
use crate::error::{Error, Handle, Result};

/// How to open a database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatabaseOptions {
    /// Create the database if it does not exist.
    pub create: bool,
    /// Allow several sorted values per key.
    pub dup_sort: bool,
    /// With `dup_sort`: all values of a key have the same size.
    pub dup_fixed: bool,
    /// Keys are native unsigned integers.
    pub integer_key: bool,
    /// Compare keys from the last byte.
    pub reverse_key: bool,
    /// With `dup_sort`: values are native unsigned integers.
    pub integer_dup: bool,
    /// With `dup_sort`: compare values from the last byte.
    pub reverse_dup: bool,
}

impl DatabaseOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn create(mut self) -> Self {
        self.create = true;
        self
    }

    #[must_use]
    pub const fn dup_sort(mut self) -> Self {
        self.dup_sort = true;
        self
    }

    #[must_use]
    pub const fn dup_fixed(mut self) -> Self {
        self.dup_fixed = true;
        self
    }

    #[must_use]
    pub const fn integer_key(mut self) -> Self {
        self.integer_key = true;
        self
    }

    #[must_use]
    pub const fn reverse_key(mut self) -> Self {
        self.reverse_key = true;
        self
    }

    #[must_use]
    pub const fn integer_dup(mut self) -> Self {
        self.integer_dup = true;
        self
    }

    #[must_use]
    pub const fn reverse_dup(mut self) -> Self {
        self.reverse_dup = true;
        self
    }

    /// Duplicate-value options only make sense for dup-sort tables.
    pub fn validate(&self) -> Result<()> {
        if !self.dup_sort && (self.dup_fixed || self.integer_dup || self.reverse_dup) {
            return Err(Error::InvalidConfig(
                "dup_fixed, integer_dup and reverse_dup require dup_sort".to_string(),
            ));
        }
        Ok(())
    }

    /// Engine flags for `mdb_dbi_open`.
    pub fn flags(&self) -> DbFlags {
        let mut flags = DbFlags::empty();
        flags.set(DbFlags::CREATE, self.create);
        flags.set(DbFlags::DUPSORT, self.dup_sort);
        flags.set(DbFlags::DUPFIXED, self.dup_fixed);
        flags.set(DbFlags::INTEGERKEY, self.integer_key);
        flags.set(DbFlags::REVERSEKEY, self.reverse_key);
        flags.set(DbFlags::INTEGERDUP, self.integer_dup);
        flags.set(DbFlags::REVERSEDUP, self.reverse_dup);
        flags
    }
}

pub(crate) struct DbInner {
    env: Weak<EnvInner>,
    name: String,
    dbi: ffi::MDB_dbi,
    flags: DbFlags,
    open: AtomicBool,
}

/// Handle to a named database (table) inside an [`Environment`].
///
/// Handles are shared and can be used from any thread, inside any of the
/// environment's transactions. Record-level helpers that run in an implicit
/// transaction live in the `convenience` layer.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("dbi", &self.inner.dbi)
            .field("flags", &self.inner.flags)
            .field("open", &self.is_open())
            .finish()
    }
}

impl PartialEq for Database {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Database {}

impl Database {
    pub(crate) fn new(env: &Environment, name: &str, dbi: ffi::MDB_dbi, flags: c_uint) -> Database {
        Database {
            inner: Arc::new(DbInner {
                env: Arc::downgrade(&env.inner),
                name: name.to_string(),
                dbi,
                flags: DbFlags::from_bits_truncate(flags) & DbFlags::PERSISTENT,
                open: AtomicBool::new(true),
            }),
        }
    }

    /// Name the database was opened with; empty for the main database.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Flags describing the table, as stored by the engine.
    pub fn flags(&self) -> DbFlags {
        self.inner.flags
    }

    pub fn is_dup_sort(&self) -> bool {
        self.inner.flags.contains(DbFlags::DUPSORT)
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// The environment this handle belongs to.
    pub fn environment(&self) -> Result<Environment> {
        self.inner
            .env
            .upgrade()
            .map(|inner| Environment { inner })
            .ok_or(Error::InvalidHandle(Handle::Environment))
    }

    /// Close the handle. A later [`Environment::database`] call opens the
    /// database again. Closing a closed handle does nothing.
    pub fn close(&self) -> Result<()> {
        if !self.inner.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Ok(env) = self.environment() {
            env.forget_database(self);
        }
        debug!("closed database {:?}", self.inner.name);
        Ok(())
    }

    pub(crate) fn dbi(&self) -> ffi::MDB_dbi {
        self.inner.dbi
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::InvalidHandle(Handle::Database))
        }
    }

    pub(crate) fn belongs_to(&self, env: &Environment) -> bool {
        ptr::eq(self.inner.env.as_ptr(), Arc::as_ptr(&env.inner))
    }

    /// Mark the handle unusable without touching the engine.
    pub(crate) fn invalidate(&self) {
        self.inner.open.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let options = DatabaseOptions::default();
        assert!(!options.create);
        assert_eq!(options.flags(), DbFlags::empty());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn builder_sets_flags() {
        let options = DatabaseOptions::new().create().dup_sort().dup_fixed();
        assert_eq!(options.flags(), DbFlags::CREATE | DbFlags::DUPSORT | DbFlags::DUPFIXED);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn duplicate_options_need_dup_sort() {
        for options in [
            DatabaseOptions::new().dup_fixed(),
            DatabaseOptions::new().integer_dup(),
            DatabaseOptions::new().reverse_dup(),
        ] {
            assert!(matches!(options.validate(), Err(Error::InvalidConfig(_))));
        }
    }
}
