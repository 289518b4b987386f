// src/disk.rs
//
// =============================================================================
// BBSYNCER: DISK SPACE PROBE
// =============================================================================
//
// Free-space checks before a sync, and the used/free split shown on the
// web UI. Straight statvfs: it answers for whatever filesystem actually
// holds the path, overlay and tmpfs included.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

const MIB: f64 = 1024.0 * 1024.0;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

fn statvfs(path: &Path) -> io::Result<libc::statvfs> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is a valid NUL-terminated string and stat is a
    // properly sized out-parameter.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat)
}

/// Free megabytes available to unprivileged writers at `path`.
pub fn free_mb(path: &Path) -> io::Result<f64> {
    let stat = statvfs(path)?;
    Ok(stat.f_bavail as f64 * stat.f_frsize as f64 / MIB)
}

/// (used_gb, free_gb) for the filesystem containing `path`.
pub fn used_and_free_gb(path: &Path) -> io::Result<(f64, f64)> {
    let stat = statvfs(path)?;
    let total = stat.f_blocks as f64 * stat.f_frsize as f64;
    let free = stat.f_bavail as f64 * stat.f_frsize as f64;
    Ok(((total - free) / GIB, free / GIB))
}
