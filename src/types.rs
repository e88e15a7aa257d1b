use lmdb_sys as ffi;

/// A key/value pair copied out of the engine.
pub type Record = (Vec<u8>, Vec<u8>);

/// Cursor positioning operations used by [`Cursor`](crate::Cursor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CursorOp {
    First,
    FirstDup,
    GetBoth,
    GetCurrent,
    Last,
    LastDup,
    Next,
    NextDup,
    NextNoDup,
    Prev,
    SetKey,
    SetRange,
}

impl CursorOp {
    pub(crate) fn code(self) -> ffi::MDB_cursor_op {
        match self {
            CursorOp::First => ffi::MDB_FIRST,
            CursorOp::FirstDup => ffi::MDB_FIRST_DUP,
            CursorOp::GetBoth => ffi::MDB_GET_BOTH,
            CursorOp::GetCurrent => ffi::MDB_GET_CURRENT,
            CursorOp::Last => ffi::MDB_LAST,
            CursorOp::LastDup => ffi::MDB_LAST_DUP,
            CursorOp::Next => ffi::MDB_NEXT,
            CursorOp::NextDup => ffi::MDB_NEXT_DUP,
            CursorOp::NextNoDup => ffi::MDB_NEXT_NODUP,
            CursorOp::Prev => ffi::MDB_PREV,
            CursorOp::SetKey => ffi::MDB_SET_KEY,
            CursorOp::SetRange => ffi::MDB_SET_RANGE,
        }
    }

    /// Whether the operation reads the key (and maybe the value) it is given.
    pub(crate) fn takes_key(self) -> bool {
        matches!(self, CursorOp::GetBoth | CursorOp::SetKey | CursorOp::SetRange)
    }
}

/// Point-in-time structure of the environment or of one database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// Size of a database page.
    pub page_size: u32,
    /// Depth of the B+tree.
    pub depth: u32,
    pub branch_pages: usize,
    pub leaf_pages: usize,
    pub overflow_pages: usize,
    /// Number of key/value pairs.
    pub entries: usize,
}

impl From<&ffi::MDB_stat> for Stat {
    fn from(stat: &ffi::MDB_stat) -> Self {
        Stat {
            page_size: stat.ms_psize,
            depth: stat.ms_depth,
            branch_pages: stat.ms_branch_pages,
            leaf_pages: stat.ms_leaf_pages,
            overflow_pages: stat.ms_overflow_pages,
            entries: stat.ms_entries,
        }
    }
}

/// Point-in-time state of the environment's map and reader table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvInfo {
    /// Address of the map, when `FIXEDMAP` was requested; otherwise whatever
    /// the engine reports.
    pub map_address: usize,
    pub map_size: usize,
    /// ID of the last used page.
    pub last_page: usize,
    /// ID of the last committed transaction.
    pub last_txn_id: usize,
    pub max_readers: u32,
    /// Reader slots currently in use.
    pub num_readers: u32,
}

impl From<&ffi::MDB_envinfo> for EnvInfo {
    fn from(info: &ffi::MDB_envinfo) -> Self {
        EnvInfo {
            map_address: info.me_mapaddr as usize,
            map_size: info.me_mapsize,
            last_page: info.me_last_pgno,
            last_txn_id: info.me_last_txnid,
            max_readers: info.me_maxreaders,
            num_readers: info.me_numreaders,
        }
    }
}
