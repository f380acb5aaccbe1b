//! Small helpers shared across the crate.

pub mod hg_path;

use std::ffi::OsString;

/// Converts a filename from `read_dir` into the bytes stored in the
/// dirstate.
///
/// Dirstate paths are raw bytes; on Unix this is a free conversion.
#[cfg(unix)]
pub fn get_bytes_from_os_string(os_string: OsString) -> Vec<u8> {
    use std::os::unix::ffi::OsStringExt;
    os_string.into_vec()
}

#[cfg(not(unix))]
pub fn get_bytes_from_os_string(os_string: OsString) -> Vec<u8> {
    // A lossy conversion is wrong for non-UTF-8 names, but non-Unix
    // support as a whole is still incomplete.
    os_string.to_string_lossy().into_owned().into_bytes()
}
