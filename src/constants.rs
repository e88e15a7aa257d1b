use bitflags::bitflags;

// Environment flags
bitflags! {
    /// Flags passed to `mdb_env_open`. Values are fixed by the engine ABI.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EnvFlags: u32 {
        const FIXEDMAP = 0x01;
        const NOSUBDIR = 0x4000;
        const NOSYNC = 0x10000;
        const RDONLY = 0x20000;
        const NOMETASYNC = 0x40000;
        const WRITEMAP = 0x80000;
        const MAPASYNC = 0x100000;
        const NOTLS = 0x200000;
        const NOLOCK = 0x400000;
        const NORDAHEAD = 0x800000;
        const NOMEMINIT = 0x1000000;
    }
}

impl EnvFlags {
    /// Flags that may be toggled on an open environment.
    pub const CHANGEABLE: EnvFlags = EnvFlags::NOSYNC
        .union(EnvFlags::NOMETASYNC)
        .union(EnvFlags::MAPASYNC)
        .union(EnvFlags::NOMEMINIT);
}

// Database flags
bitflags! {
    /// Flags passed to `mdb_dbi_open`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DbFlags: u32 {
        const REVERSEKEY = 0x02;
        const DUPSORT = 0x04;
        const INTEGERKEY = 0x08;
        const DUPFIXED = 0x10;
        const INTEGERDUP = 0x20;
        const REVERSEDUP = 0x40;
        const CREATE = 0x40000;
    }
}

impl DbFlags {
    /// Flags that describe the table itself, as opposed to how it is opened.
    pub const PERSISTENT: DbFlags = DbFlags::REVERSEKEY
        .union(DbFlags::DUPSORT)
        .union(DbFlags::INTEGERKEY)
        .union(DbFlags::DUPFIXED)
        .union(DbFlags::INTEGERDUP)
        .union(DbFlags::REVERSEDUP);
}

// Write operation flags
bitflags! {
    /// Flags passed to `mdb_put` and `mdb_cursor_put`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WriteFlags: u32 {
        const NOOVERWRITE = 0x10;
        const NODUPDATA = 0x20;
        const CURRENT = 0x40;
        const RESERVE = 0x10000;
        const APPEND = 0x20000;
        const APPENDDUP = 0x40000;
        const MULTIPLE = 0x80000;
    }
}

impl WriteFlags {
    /// Flags that hand a buffer back to the caller, which this layer never does.
    pub(crate) const UNSUPPORTED: WriteFlags = WriteFlags::RESERVE.union(WriteFlags::MULTIPLE);
}

// Transaction state, tracked by this layer rather than the engine
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct TransactionFlags: u32 {
        const RDONLY = EnvFlags::RDONLY.bits();

        const FINISHED = 0x01;
        const ABORTED = 0x02;
        const HAS_CHILD = 0x10;
    }
}

// Copy operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct CopyFlags: u32 {
        const COMPACT = 0x01;
    }
}
