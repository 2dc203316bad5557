//! SQLite-vec extension loader.
//!
//! This module contains the unsafe initialization code for the sqlite-vec extension.
//! It is separated to minimize the scope of unsafe code in the crate.

use std::sync::Once;

use rusqlite::ffi::{sqlite3, sqlite3_api_routines, sqlite3_auto_extension};
use sqlite_vec::sqlite3_vec_init;

type SqliteExtensionFn =
    unsafe extern "C" fn(*mut sqlite3, *mut *mut i8, *const sqlite3_api_routines) -> i32;

static REGISTER: Once = Once::new();

/// Register sqlite-vec as an auto-loaded extension for every new connection.
///
/// Must run before opening a connection used by
/// [`SqliteVectorIndex`](crate::memory::storage::SqliteVectorIndex).
/// Repeated calls are no-ops.
#[allow(unsafe_code)]
pub fn init_sqlite_vec_extension() {
    REGISTER.call_once(|| {
        // SAFETY: sqlite3_auto_extension is a stable SQLite API that registers
        // an extension entry point for new connections; sqlite3_vec_init has
        // the expected extension signature.
        unsafe {
            sqlite3_auto_extension(Some(std::mem::transmute::<*const (), SqliteExtensionFn>(
                sqlite3_vec_init as *const (),
            )));
        }
    });
}
