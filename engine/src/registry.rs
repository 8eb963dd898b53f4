//! Access to the folder-location registry values.
//!
//! `FolderRegistry` is the only way the engine reaches `User Shell Folders`.
//! `WindowsRegistry` talks to HKEY_CURRENT_USER; `InMemoryRegistry` is the
//! double used by tests and non-Windows builds.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::model::{FolderType, RegistryValue};

pub const USER_SHELL_FOLDERS_KEY: &str =
    r"Software\Microsoft\Windows\CurrentVersion\Explorer\User Shell Folders";

/// String values under the folder-location key.
pub trait FolderRegistry: Send + Sync {
    /// `Ok(None)` when the value does not exist.
    fn read_value(&self, name: &str) -> io::Result<Option<RegistryValue>>;

    fn write_value(&self, name: &str, value: &RegistryValue) -> io::Result<()>;

    /// Deleting a missing value succeeds.
    fn delete_value(&self, name: &str) -> io::Result<()>;
}

/// Registry double backed by a map.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    values: Mutex<HashMap<String, RegistryValue>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: seed a value.
    pub fn with_value(self, name: &str, value: RegistryValue) -> Self {
        if let Ok(mut values) = self.values.lock() {
            values.insert(name.to_string(), value);
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<RegistryValue> {
        self.values.lock().ok().and_then(|v| v.get(name).cloned())
    }

    fn values(&self) -> io::Result<std::sync::MutexGuard<'_, HashMap<String, RegistryValue>>> {
        self.values
            .lock()
            .map_err(|_| io::Error::other("registry double poisoned"))
    }
}

impl FolderRegistry for InMemoryRegistry {
    fn read_value(&self, name: &str) -> io::Result<Option<RegistryValue>> {
        Ok(self.values()?.get(name).cloned())
    }

    fn write_value(&self, name: &str, value: &RegistryValue) -> io::Result<()> {
        self.values()?.insert(name.to_string(), value.clone());
        Ok(())
    }

    fn delete_value(&self, name: &str) -> io::Result<()> {
        self.values()?.remove(name);
        Ok(())
    }
}

/// The current user's `User Shell Folders` key.
#[cfg(windows)]
pub struct WindowsRegistry {
    key: crate::platform::RegKey,
}

#[cfg(windows)]
impl WindowsRegistry {
    pub fn open() -> io::Result<Self> {
        Ok(WindowsRegistry {
            key: crate::platform::RegKey::open_current_user(USER_SHELL_FOLDERS_KEY)?,
        })
    }
}

#[cfg(windows)]
impl FolderRegistry for WindowsRegistry {
    fn read_value(&self, name: &str) -> io::Result<Option<RegistryValue>> {
        use crate::model::RegistryValueKind;
        Ok(self.key.query_string(name)?.map(|(data, expand)| RegistryValue {
            data,
            kind: if expand {
                RegistryValueKind::ExpandString
            } else {
                RegistryValueKind::String
            },
        }))
    }

    fn write_value(&self, name: &str, value: &RegistryValue) -> io::Result<()> {
        use crate::model::RegistryValueKind;
        let expand = value.kind == RegistryValueKind::ExpandString;
        self.key.set_string(name, &value.data, expand)
    }

    fn delete_value(&self, name: &str) -> io::Result<()> {
        self.key.delete_value(name)
    }
}

/// Replace `%NAME%` references with environment values. Unknown names and
/// unmatched `%` are left as written. Names match case-insensitively.
pub fn expand_env_vars(input: &str) -> String {
    expand_with(input, |name| {
        std::env::var(name).ok().or_else(|| {
            std::env::vars()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
        })
    })
}

fn expand_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('%') {
            Some(end) if end > 0 => {
                let name = &after[..end];
                match lookup(name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('%');
                        out.push_str(name);
                        out.push('%');
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push('%');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// The folder's current location according to the registry, expanded.
pub fn current_location(
    registry: &dyn FolderRegistry,
    folder: FolderType,
) -> io::Result<Option<PathBuf>> {
    for name in folder.registry_value_names() {
        if let Some(value) = registry.read_value(name)? {
            return Ok(Some(PathBuf::from(expand_env_vars(&value.data))));
        }
    }
    Ok(None)
}
