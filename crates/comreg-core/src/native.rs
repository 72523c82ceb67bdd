//! Boundary to a library's own COM registration entry point.

use anyhow::Result;
use std::path::Path;

/// Runs a library's self-registration. Called inside a virtualization scope.
pub trait NativeRegistrar: Send + Sync {
    fn register(&self, path: &Path) -> Result<()>;
}

/// Loads the library and calls its exported `DllRegisterServer`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DllRegistrar;

#[cfg(windows)]
mod imp {
    use crate::registry::windows::wide;
    use anyhow::{anyhow, bail, Context, Result};
    use std::path::Path;
    use windows_sys::Win32::Foundation::HMODULE;
    use windows_sys::Win32::System::LibraryLoader::{FreeLibrary, GetProcAddress, LoadLibraryW};

    type DllRegisterServer = unsafe extern "system" fn() -> i32;

    /// Module handle released with `FreeLibrary` on drop.
    pub(super) struct LoadedLibrary(HMODULE);

    impl LoadedLibrary {
        pub(super) fn load(path: &Path) -> Result<Self> {
            let full = if path.is_absolute() {
                path.to_path_buf()
            } else {
                std::env::current_dir()?.join(path)
            };
            let name = wide(full.as_os_str());
            // SAFETY: `name` is NUL-terminated and outlives the call.
            let module = unsafe { LoadLibraryW(name.as_ptr()) };
            if module == 0 {
                return Err(std::io::Error::last_os_error())
                    .with_context(|| format!("LoadLibrary failed: {}", full.display()));
            }
            Ok(Self(module))
        }

        pub(super) fn register_server(&self) -> Result<()> {
            // SAFETY: the symbol name is a NUL-terminated ASCII literal.
            let proc = unsafe { GetProcAddress(self.0, b"DllRegisterServer\0".as_ptr()) }
                .ok_or_else(|| {
                    anyhow!(
                        "DllRegisterServer not exported: {}",
                        std::io::Error::last_os_error()
                    )
                })?;
            // SAFETY: COM defines DllRegisterServer as `HRESULT STDAPICALLTYPE (void)`.
            let entry: DllRegisterServer = unsafe { std::mem::transmute(proc) };
            let hr = unsafe { entry() };
            if hr < 0 {
                bail!("DllRegisterServer failed with HRESULT 0x{:08X}", hr as u32);
            }
            Ok(())
        }
    }

    impl Drop for LoadedLibrary {
        fn drop(&mut self) {
            // SAFETY: the module was loaded by this wrapper and is freed once.
            unsafe {
                FreeLibrary(self.0);
            }
        }
    }
}

impl NativeRegistrar for DllRegistrar {
    #[cfg(windows)]
    fn register(&self, path: &Path) -> Result<()> {
        imp::LoadedLibrary::load(path)?.register_server()
    }

    #[cfg(not(windows))]
    fn register(&self, path: &Path) -> Result<()> {
        anyhow::bail!(
            "native COM registration is only available on Windows: {}",
            path.display()
        )
    }
}
