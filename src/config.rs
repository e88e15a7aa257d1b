//! Environment configuration.

use crate::constants::EnvFlags;
use crate::error::{Error, Result};

/// Every option understood by [`Environment::open`](crate::Environment::open).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    /// File mode for newly created data and lock files.
    pub mode: u32,

    /// Ceiling of the memory-mapped region, in bytes.
    pub max_size: usize,

    /// Maximum number of named databases.
    pub max_dbs: u32,

    /// Maximum number of concurrent reader slots.
    pub max_readers: u32,

    /// Store the environment as a directory holding a data and a lock file.
    /// When false, the path names the data file itself.
    pub sub_dirs: bool,

    /// Open the environment read-only.
    pub read_only: bool,

    /// Write through a writable memory map. Faster, less protected against
    /// stray writes, and incompatible with nested transactions.
    pub write_map: bool,

    /// Flush the writable map asynchronously. Requires `write_map`.
    pub map_async: bool,

    /// Tie reader slots to transactions instead of threads.
    pub no_tls: bool,

    /// Flush system buffers to disk on every commit.
    pub sync: bool,

    /// Flush the meta page together with the data on every commit.
    pub meta_sync: bool,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            mode: 0o755,
            max_size: 1 << 28, // 256 MB
            max_dbs: 16,
            max_readers: 126,
            sub_dirs: true,
            read_only: false,
            write_map: false,
            map_async: false,
            no_tls: false,
            sync: true,
            meta_sync: false,
        }
    }
}

impl EnvConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the file mode.
    #[must_use]
    pub const fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the map size ceiling.
    #[must_use]
    pub const fn max_size(mut self, bytes: usize) -> Self {
        self.max_size = bytes;
        self
    }

    /// Sets the maximum number of named databases.
    #[must_use]
    pub const fn max_dbs(mut self, count: u32) -> Self {
        self.max_dbs = count;
        self
    }

    /// Sets the maximum number of reader slots.
    #[must_use]
    pub const fn max_readers(mut self, count: u32) -> Self {
        self.max_readers = count;
        self
    }

    /// Sets whether the path is a directory.
    #[must_use]
    pub const fn sub_dirs(mut self, value: bool) -> Self {
        self.sub_dirs = value;
        self
    }

    /// Sets read-only mode.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Sets writable-map mode.
    #[must_use]
    pub const fn write_map(mut self, value: bool) -> Self {
        self.write_map = value;
        self
    }

    /// Sets asynchronous map flushing.
    #[must_use]
    pub const fn map_async(mut self, value: bool) -> Self {
        self.map_async = value;
        self
    }

    /// Sets thread-independent reader slots.
    #[must_use]
    pub const fn no_tls(mut self, value: bool) -> Self {
        self.no_tls = value;
        self
    }

    /// Sets flush-on-commit.
    #[must_use]
    pub const fn sync(mut self, value: bool) -> Self {
        self.sync = value;
        self
    }

    /// Sets meta page flushing.
    #[must_use]
    pub const fn meta_sync(mut self, value: bool) -> Self {
        self.meta_sync = value;
        self
    }

    /// Reject combinations the engine would refuse or silently ignore.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::InvalidConfig("max_size must be positive".to_string()));
        }
        if self.max_readers == 0 {
            return Err(Error::InvalidConfig("max_readers must be positive".to_string()));
        }
        if self.map_async && !self.write_map {
            return Err(Error::InvalidConfig("map_async requires write_map".to_string()));
        }
        if self.write_map && self.read_only {
            return Err(Error::InvalidConfig("write_map cannot be combined with read_only".to_string()));
        }
        Ok(())
    }

    /// Engine flags for `mdb_env_open`.
    pub fn flags(&self) -> EnvFlags {
        let mut flags = EnvFlags::empty();
        flags.set(EnvFlags::NOSUBDIR, !self.sub_dirs);
        flags.set(EnvFlags::RDONLY, self.read_only);
        flags.set(EnvFlags::WRITEMAP, self.write_map);
        flags.set(EnvFlags::MAPASYNC, self.map_async);
        flags.set(EnvFlags::NOTLS, self.no_tls);
        flags.set(EnvFlags::NOSYNC, !self.sync);
        flags.set(EnvFlags::NOMETASYNC, !self.meta_sync);
        flags
    }
}
