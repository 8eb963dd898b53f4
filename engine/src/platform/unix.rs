//! Unix implementations of platform helpers.

use std::fs;
use std::io;
use std::path::Path;

/// A directory symlink stands in for a junction.
pub fn create_junction(link: &Path, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

pub fn remove_junction(link: &Path) -> io::Result<()> {
    fs::remove_file(link)
}

/// True for a symlink that resolves to a directory.
pub fn is_junction(path: &Path) -> io::Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            Ok(fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false))
        }
        Ok(_) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn is_elevated() -> bool {
    unsafe { libc::geteuid() == 0 }
}
