//! Transaction, handle and cursor lifecycle on top of the LMDB storage engine.
//!
//! An [`Environment`] owns the store, the [`Database`] handles opened through
//! it, and a per-thread stack of active [`Transaction`]s. New transactions
//! nest under the calling thread's innermost one, and record-level helpers on
//! [`Database`] reuse it or run in an implicit transaction of their own.
//!
//! ```no_run
//! use lmdb_scope::{DatabaseOptions, EnvConfig, Environment};
//!
//! # fn main() -> lmdb_scope::Result<()> {
//! let env = Environment::open("/tmp/pets", EnvConfig::new().max_dbs(2))?;
//! let cats = env.database("cats", DatabaseOptions::new().create())?;
//! env.transaction(false, |_txn| {
//!     cats.put(b"garfield", b"orange")?;
//!     cats.put(b"tom", b"grey")
//! })?;
//! assert_eq!(cats.get(b"tom")?, Some(b"grey".to_vec()));
//! env.close()
//! # }
//! ```

mod config;
mod constants;
mod convenience;
mod cursor;
mod database;
mod env;
mod error;
mod transaction;
mod types;
mod value;

pub use config::EnvConfig;
pub use constants::{DbFlags, EnvFlags, WriteFlags};
pub use cursor::Cursor;
pub use database::{Database, DatabaseOptions};
pub use env::{version, Environment};
pub use error::{Error, ErrorKind, Handle, Resource, Result};
pub use transaction::{Transaction, TransactionStatus};
pub use types::{EnvInfo, Record, Stat};
