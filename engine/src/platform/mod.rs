//! Platform-specific helpers.
//! Junctions, elevation and (on Windows) raw registry access live here so the
//! rest of the engine stays platform-agnostic.
//!
//! On Unix a junction is a directory symlink and "elevated" means root; this
//! keeps the engine buildable and testable off Windows.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::{create_junction, is_elevated, is_junction, remove_junction};

#[cfg(windows)]
pub use windows::{create_junction, is_elevated, is_junction, remove_junction, RegKey};
