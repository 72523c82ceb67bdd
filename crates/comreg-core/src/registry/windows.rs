//! advapi32-backed [`Registry`].

use super::{KeyPath, PredefinedRoot, Registry};
use crate::error::RegistryError;
use crate::process::OwnedHandle;
use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use std::sync::atomic::AtomicBool;
use windows_sys::Win32::Foundation::{
    GetLastError, ERROR_FILE_NOT_FOUND, ERROR_MORE_DATA, ERROR_NOT_ALL_ASSIGNED,
    ERROR_NO_MORE_ITEMS, ERROR_SUCCESS, HANDLE, LUID,
};
use windows_sys::Win32::Security::{
    AdjustTokenPrivileges, LookupPrivilegeValueW, LUID_AND_ATTRIBUTES, SE_PRIVILEGE_ENABLED,
    TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES, TOKEN_QUERY,
};
use windows_sys::Win32::System::Registry::{
    RegCloseKey, RegCreateKeyExW, RegDeleteTreeW, RegEnumKeyExW, RegOpenKeyExW,
    RegOverridePredefKey, RegQueryValueExW, RegSaveKeyW, HKEY, HKEY_CLASSES_ROOT,
    HKEY_CURRENT_CONFIG, HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE, HKEY_USERS, KEY_ALL_ACCESS,
    KEY_READ, REG_EXPAND_SZ, REG_OPTION_NON_VOLATILE, REG_SAM_FLAGS, REG_SZ,
};
use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

/// Overrides apply to the whole process, so the slot does too.
static SCOPE_SLOT: AtomicBool = AtomicBool::new(false);

/// Longest key name the registry allows, plus the terminator.
const MAX_KEY_NAME: usize = 256;

pub(crate) fn wide(s: impl AsRef<OsStr>) -> Vec<u16> {
    s.as_ref().encode_wide().chain(std::iter::once(0)).collect()
}

fn predefined(root: PredefinedRoot) -> HKEY {
    match root {
        PredefinedRoot::ClassesRoot => HKEY_CLASSES_ROOT,
        PredefinedRoot::CurrentUser => HKEY_CURRENT_USER,
        PredefinedRoot::LocalMachine => HKEY_LOCAL_MACHINE,
        PredefinedRoot::Users => HKEY_USERS,
        PredefinedRoot::CurrentConfig => HKEY_CURRENT_CONFIG,
    }
}

fn check(op: &'static str, status: u32) -> Result<(), RegistryError> {
    if status == ERROR_SUCCESS {
        Ok(())
    } else {
        Err(RegistryError::os(op, status))
    }
}

/// Open registry key, closed on drop.
struct OwnedKey(HKEY);

impl OwnedKey {
    fn create(key: &KeyPath) -> Result<Self, RegistryError> {
        let subkey = wide(key.subkey());
        let mut raw: HKEY = 0;
        // SAFETY: all pointers reference live locals for the duration of the call.
        let status = unsafe {
            RegCreateKeyExW(
                predefined(key.root()),
                subkey.as_ptr(),
                0,
                ptr::null(),
                REG_OPTION_NON_VOLATILE,
                KEY_ALL_ACCESS,
                ptr::null(),
                &mut raw,
                ptr::null_mut(),
            )
        };
        check("RegCreateKeyEx", status)?;
        Ok(Self(raw))
    }

    /// `None` when the key does not exist.
    fn open(key: &KeyPath, access: REG_SAM_FLAGS) -> Result<Option<Self>, RegistryError> {
        let subkey = wide(key.subkey());
        let mut raw: HKEY = 0;
        // SAFETY: as above.
        let status = unsafe {
            RegOpenKeyExW(predefined(key.root()), subkey.as_ptr(), 0, access, &mut raw)
        };
        if status == ERROR_FILE_NOT_FOUND {
            return Ok(None);
        }
        check("RegOpenKeyEx", status)?;
        Ok(Some(Self(raw)))
    }

    fn raw(&self) -> HKEY {
        self.0
    }
}

impl Drop for OwnedKey {
    fn drop(&mut self) {
        // SAFETY: the handle came from RegCreateKeyEx/RegOpenKeyEx and is closed once.
        unsafe {
            RegCloseKey(self.0);
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsRegistry;

impl WindowsRegistry {
    pub fn new() -> Self {
        Self
    }
}

impl Registry for WindowsRegistry {
    fn create_key(&self, key: &KeyPath) -> Result<(), RegistryError> {
        OwnedKey::create(key).map(drop)
    }

    fn delete_tree(&self, key: &KeyPath) -> Result<(), RegistryError> {
        let subkey = wide(key.subkey());
        // SAFETY: `subkey` is a NUL-terminated buffer that outlives the call.
        let status = unsafe { RegDeleteTreeW(predefined(key.root()), subkey.as_ptr()) };
        if status == ERROR_FILE_NOT_FOUND {
            return Ok(());
        }
        check("RegDeleteTree", status)
    }

    fn subkey_names(&self, key: &KeyPath) -> Result<Option<Vec<String>>, RegistryError> {
        let Some(handle) = OwnedKey::open(key, KEY_READ)? else {
            return Ok(None);
        };
        let mut names = Vec::new();
        let mut buf = [0u16; MAX_KEY_NAME];
        for index in 0.. {
            let mut len = buf.len() as u32;
            // SAFETY: `len` tells the call how much of `buf` it may write.
            let status = unsafe {
                RegEnumKeyExW(
                    handle.raw(),
                    index,
                    buf.as_mut_ptr(),
                    &mut len,
                    ptr::null(),
                    ptr::null_mut(),
                    ptr::null_mut(),
                    ptr::null_mut(),
                )
            };
            if status == ERROR_NO_MORE_ITEMS {
                break;
            }
            check("RegEnumKeyEx", status)?;
            names.push(String::from_utf16_lossy(&buf[..len as usize]));
        }
        Ok(Some(names))
    }

    fn default_value(&self, key: &KeyPath) -> Result<Option<String>, RegistryError> {
        let Some(handle) = OwnedKey::open(key, KEY_READ)? else {
            return Ok(None);
        };
        let mut kind = 0u32;
        let mut size = 0u32;
        // SAFETY: size query only; no data buffer is passed.
        let status = unsafe {
            RegQueryValueExW(
                handle.raw(),
                ptr::null(),
                ptr::null(),
                &mut kind,
                ptr::null_mut(),
                &mut size,
            )
        };
        if status == ERROR_FILE_NOT_FOUND {
            return Ok(None);
        }
        if status != ERROR_MORE_DATA {
            check("RegQueryValueEx", status)?;
        }
        if kind != REG_SZ && kind != REG_EXPAND_SZ {
            return Ok(None);
        }

        let mut data = vec![0u16; (size as usize).div_ceil(2)];
        let mut size = (data.len() * 2) as u32;
        // SAFETY: `data` holds `size` bytes.
        let status = unsafe {
            RegQueryValueExW(
                handle.raw(),
                ptr::null(),
                ptr::null(),
                &mut kind,
                data.as_mut_ptr().cast(),
                &mut size,
            )
        };
        check("RegQueryValueEx", status)?;
        data.truncate(size as usize / 2);
        while data.last() == Some(&0) {
            data.pop();
        }
        Ok(Some(String::from_utf16_lossy(&data)))
    }

    fn override_root(&self, root: PredefinedRoot, target: &KeyPath) -> Result<(), RegistryError> {
        let handle = OwnedKey::open(target, KEY_ALL_ACCESS)?
            .ok_or_else(|| RegistryError::NotFound(target.to_string()))?;
        // SAFETY: both are valid key handles; the override keeps its own reference.
        let status = unsafe { RegOverridePredefKey(predefined(root), handle.raw()) };
        check("RegOverridePredefKey", status)
    }

    fn revert_root(&self, root: PredefinedRoot) -> Result<(), RegistryError> {
        // SAFETY: a null replacement restores the default mapping.
        let status = unsafe { RegOverridePredefKey(predefined(root), 0) };
        check("RegOverridePredefKey", status)
    }

    fn enable_backup_privilege(&self) -> Result<(), RegistryError> {
        let mut raw: HANDLE = 0;
        // SAFETY: GetCurrentProcess returns a pseudo handle that needs no close.
        let ok = unsafe {
            OpenProcessToken(GetCurrentProcess(), TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY, &mut raw)
        };
        if ok == 0 {
            return Err(RegistryError::os("OpenProcessToken", unsafe { GetLastError() }));
        }
        let token = OwnedHandle::new(raw);

        let name = wide("SeBackupPrivilege");
        let mut luid = LUID {
            LowPart: 0,
            HighPart: 0,
        };
        // SAFETY: `name` is NUL-terminated and `luid` is a valid out pointer.
        if unsafe { LookupPrivilegeValueW(ptr::null(), name.as_ptr(), &mut luid) } == 0 {
            return Err(RegistryError::os("LookupPrivilegeValue", unsafe { GetLastError() }));
        }

        let privileges = TOKEN_PRIVILEGES {
            PrivilegeCount: 1,
            Privileges: [LUID_AND_ATTRIBUTES {
                Luid: luid,
                Attributes: SE_PRIVILEGE_ENABLED,
            }],
        };
        // SAFETY: `privileges` outlives the call; no previous state is requested.
        let ok = unsafe {
            AdjustTokenPrivileges(
                token.raw(),
                0,
                &privileges,
                0,
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        // Succeeds even when the privilege is missing from the token.
        let last = unsafe { GetLastError() };
        if ok == 0 || last == ERROR_NOT_ALL_ASSIGNED {
            return Err(RegistryError::os("AdjustTokenPrivileges", last));
        }
        Ok(())
    }

    fn save_key(&self, key: &KeyPath, file: &Path) -> Result<(), RegistryError> {
        let handle = OwnedKey::open(key, KEY_READ)?
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;
        let file = wide(file.as_os_str());
        // SAFETY: `file` is NUL-terminated; default security descriptor.
        let status = unsafe { RegSaveKeyW(handle.raw(), file.as_ptr(), ptr::null()) };
        check("RegSaveKey", status)
    }

    fn scope_slot(&self) -> &AtomicBool {
        &SCOPE_SLOT
    }
}
