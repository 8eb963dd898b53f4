//! Windows implementations of platform helpers.
//!
//! Notes:
//! - Junctions are NTFS mount-point reparse points set with FSCTL_SET_REPARSE_POINT.
//!   Unlike symlinks they need no developer mode and resolve for every process.
//! - Removing a junction with RemoveDirectoryW never touches its target.
//! - Registry access is limited to string values of one open key.

use std::ffi::OsStr;
use std::fs::{self, OpenOptions};
use std::io;
use std::iter::once;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::fs::{MetadataExt, OpenOptionsExt};
use std::os::windows::io::AsRawHandle;
use std::path::{Path, PathBuf};

use windows_sys::Win32::Foundation::{ERROR_FILE_NOT_FOUND, ERROR_SUCCESS};
use windows_sys::Win32::Storage::FileSystem::{
    FILE_ATTRIBUTE_REPARSE_POINT, FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OPEN_REPARSE_POINT,
};
use windows_sys::Win32::System::IO::DeviceIoControl;
use windows_sys::Win32::System::Registry::{
    RegCloseKey, RegDeleteValueW, RegOpenKeyExW, RegQueryValueExW, RegSetValueExW, HKEY,
    HKEY_CURRENT_USER, KEY_QUERY_VALUE, KEY_SET_VALUE, REG_EXPAND_SZ, REG_SZ,
};
use windows_sys::Win32::UI::Shell::IsUserAnAdmin;

const FSCTL_SET_REPARSE_POINT: u32 = 0x0009_00A4;
const IO_REPARSE_TAG_MOUNT_POINT: u32 = 0xA000_0003;
const NON_INTERPRETED_PREFIX: &str = r"\??\";
const VERBATIM_PREFIX: &str = r"\\?\";

fn to_wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(once(0)).collect()
}

/// Strip a `\\?\` prefix that canonicalize adds; mount points store plain DOS paths.
fn plain_target(target: &Path) -> io::Result<PathBuf> {
    let absolute = if target.is_absolute() {
        target.to_path_buf()
    } else {
        std::env::current_dir()?.join(target)
    };
    let text = absolute.to_string_lossy();
    Ok(match text.strip_prefix(VERBATIM_PREFIX) {
        Some(rest) if !rest.starts_with("UNC\\") => PathBuf::from(rest),
        _ => absolute,
    })
}

/// REPARSE_DATA_BUFFER for a mount point: header, four name offsets, then
/// substitute and print names, each NUL-terminated.
fn mount_point_buffer(target: &Path) -> io::Result<Vec<u8>> {
    let print: Vec<u16> = target.as_os_str().encode_wide().collect();
    let substitute: Vec<u16> = OsStr::new(NON_INTERPRETED_PREFIX)
        .encode_wide()
        .chain(target.as_os_str().encode_wide())
        .collect();

    let substitute_len = substitute.len() * 2;
    let print_len = print.len() * 2;
    let path_buffer_len = substitute_len + 2 + print_len + 2;
    let data_len = 8 + path_buffer_len;
    if data_len > u16::MAX as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("junction target too long: {}", target.display()),
        ));
    }

    let mut buf = Vec::with_capacity(8 + data_len);
    buf.extend_from_slice(&IO_REPARSE_TAG_MOUNT_POINT.to_le_bytes());
    buf.extend_from_slice(&(data_len as u16).to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&(substitute_len as u16).to_le_bytes());
    buf.extend_from_slice(&((substitute_len + 2) as u16).to_le_bytes());
    buf.extend_from_slice(&(print_len as u16).to_le_bytes());
    for unit in substitute.iter().chain(once(&0)).chain(print.iter()).chain(once(&0)) {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
    Ok(buf)
}

/// Create `link` as an empty directory and turn it into a mount point for `target`.
pub fn create_junction(link: &Path, target: &Path) -> io::Result<()> {
    let target = plain_target(target)?;
    let buffer = mount_point_buffer(&target)?;
    fs::create_dir(link)?;

    let result = (|| {
        let dir = OpenOptions::new()
            .write(true)
            .custom_flags(FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OPEN_REPARSE_POINT)
            .open(link)?;
        let mut returned = 0u32;
        let ok = unsafe {
            DeviceIoControl(
                dir.as_raw_handle() as _,
                FSCTL_SET_REPARSE_POINT,
                buffer.as_ptr() as _,
                buffer.len() as u32,
                std::ptr::null_mut(),
                0,
                &mut returned,
                std::ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_dir(link);
    }
    result
}

pub fn remove_junction(link: &Path) -> io::Result<()> {
    fs::remove_dir(link)
}

pub fn is_junction(path: &Path) -> io::Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            Ok(meta.is_dir() && meta.file_attributes() & FILE_ATTRIBUTE_REPARSE_POINT != 0)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn is_elevated() -> bool {
    unsafe { IsUserAnAdmin() != 0 }
}

fn check(code: u32) -> io::Result<()> {
    if code == ERROR_SUCCESS {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(code as i32))
    }
}

/// An open HKEY_CURRENT_USER subkey. Closed on drop.
pub struct RegKey {
    hkey: HKEY,
}

// SAFETY: an HKEY is a process-wide handle; the registry API is thread-safe.
unsafe impl Send for RegKey {}
unsafe impl Sync for RegKey {}

impl RegKey {
    pub fn open_current_user(subkey: &str) -> io::Result<Self> {
        let wide = to_wide(OsStr::new(subkey));
        let mut hkey: HKEY = std::ptr::null_mut();
        check(unsafe {
            RegOpenKeyExW(
                HKEY_CURRENT_USER,
                wide.as_ptr(),
                0,
                KEY_QUERY_VALUE | KEY_SET_VALUE,
                &mut hkey,
            )
        })?;
        Ok(RegKey { hkey })
    }

    /// Read a REG_SZ or REG_EXPAND_SZ value. Returns `(data, is_expand)`.
    pub fn query_string(&self, name: &str) -> io::Result<Option<(String, bool)>> {
        let wide = to_wide(OsStr::new(name));
        let mut kind = 0u32;
        let mut len = 0u32;
        let code = unsafe {
            RegQueryValueExW(
                self.hkey,
                wide.as_ptr(),
                std::ptr::null(),
                &mut kind,
                std::ptr::null_mut(),
                &mut len,
            )
        };
        if code == ERROR_FILE_NOT_FOUND {
            return Ok(None);
        }
        check(code)?;
        if kind != REG_SZ && kind != REG_EXPAND_SZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("value '{name}' is not a string (type {kind})"),
            ));
        }

        let mut data = vec![0u16; (len as usize).div_ceil(2)];
        let mut len_bytes = (data.len() * 2) as u32;
        check(unsafe {
            RegQueryValueExW(
                self.hkey,
                wide.as_ptr(),
                std::ptr::null(),
                &mut kind,
                data.as_mut_ptr() as *mut u8,
                &mut len_bytes,
            )
        })?;
        data.truncate(len_bytes as usize / 2);
        while data.last() == Some(&0) {
            data.pop();
        }
        Ok(Some((String::from_utf16_lossy(&data), kind == REG_EXPAND_SZ)))
    }

    pub fn set_string(&self, name: &str, data: &str, expand: bool) -> io::Result<()> {
        let wide_name = to_wide(OsStr::new(name));
        let wide_data = to_wide(OsStr::new(data));
        let kind = if expand { REG_EXPAND_SZ } else { REG_SZ };
        check(unsafe {
            RegSetValueExW(
                self.hkey,
                wide_name.as_ptr(),
                0,
                kind,
                wide_data.as_ptr() as *const u8,
                (wide_data.len() * 2) as u32,
            )
        })
    }

    /// Delete a value; a missing value is not an error.
    pub fn delete_value(&self, name: &str) -> io::Result<()> {
        let wide = to_wide(OsStr::new(name));
        let code = unsafe { RegDeleteValueW(self.hkey, wide.as_ptr()) };
        if code == ERROR_FILE_NOT_FOUND {
            return Ok(());
        }
        check(code)
    }
}

impl Drop for RegKey {
    fn drop(&mut self) {
        unsafe {
            let _ = RegCloseKey(self.hkey);
        }
    }
}
