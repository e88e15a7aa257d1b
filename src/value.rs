use std::ptr;
use std::slice;

use lmdb_sys as ffi;

/// Borrow a byte string as an engine value. The engine only reads through
/// the pointer for input arguments.
pub(crate) fn to_val(data: &[u8]) -> ffi::MDB_val {
    ffi::MDB_val {
        mv_size: data.len(),
        mv_data: data.as_ptr() as *mut _,
    }
}

/// An engine value slot to be filled in by a lookup.
pub(crate) fn empty_val() -> ffi::MDB_val {
    ffi::MDB_val {
        mv_size: 0,
        mv_data: ptr::null_mut(),
    }
}

/// Copy an engine value out of the map.
///
/// # Safety
///
/// `val` must have been filled in by the engine inside a transaction that is
/// still active.
pub(crate) unsafe fn copy_val(val: &ffi::MDB_val) -> Vec<u8> {
    if val.mv_size == 0 || val.mv_data.is_null() {
        return Vec::new();
    }
    slice::from_raw_parts(val.mv_data as *const u8, val.mv_size).to_vec()
}
