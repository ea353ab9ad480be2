//! Scoped owners for the OS resources the service juggles.
//!
//! Every handle, registry key, mapped view and environment block acquired
//! anywhere in the service is wrapped here so release happens on all exit
//! paths, error paths included. Raw `HANDLE`s only ever cross module
//! boundaries as borrows of these owners.

use std::ffi::c_void;
use std::io;
use std::ptr;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, LocalFree, ERROR_FILE_NOT_FOUND, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::System::Diagnostics::Debug::{
    FormatMessageW, FORMAT_MESSAGE_FROM_SYSTEM, FORMAT_MESSAGE_IGNORE_INSERTS,
};
use windows_sys::Win32::System::Environment::DestroyEnvironmentBlock;
use windows_sys::Win32::System::Memory::{UnmapViewOfFile, MEMORY_MAPPED_VIEW_ADDRESS};
use windows_sys::Win32::System::Registry::{
    RegCloseKey, RegDeleteValueW, RegGetValueW, RegOpenKeyExW, RegSetValueExW, HKEY,
    HKEY_LOCAL_MACHINE, KEY_ALL_ACCESS, REG_SZ, RRF_RT_REG_SZ,
};
use windows_sys::Win32::System::Threading::CreateEventW;

/// Win32 error code carried through handler paths. Acks put the raw code on
/// the wire, so it stays a `u32` until the logging edge.
pub type Win32Result<T> = Result<T, u32>;

pub fn last_error() -> u32 {
    unsafe { GetLastError() }
}

/// NUL-terminated UTF-16 for passing into the API.
pub fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Lossy conversion of an API-filled buffer, cut at the first NUL.
pub fn from_wide(buf: &[u16]) -> String {
    let end = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..end])
}

/// Render a Win32 error code the way it would read in the system UI.
/// Falls back to the numeric code when the system has no text for it.
pub fn system_message(code: u32) -> String {
    let mut buf = [0u16; 512];
    let len = unsafe {
        FormatMessageW(
            FORMAT_MESSAGE_FROM_SYSTEM | FORMAT_MESSAGE_IGNORE_INSERTS,
            ptr::null(),
            code,
            0,
            buf.as_mut_ptr(),
            buf.len() as u32,
            ptr::null(),
        )
    };
    if len == 0 {
        return format!("error {code:#010x}");
    }
    from_wide(&buf[..len as usize]).trim_end().to_string()
}

/// Owner of a kernel object handle. Null and `INVALID_HANDLE_VALUE` are both
/// treated as "nothing to close".
pub struct OwnedHandle(HANDLE);

// SAFETY: kernel object handles are process-global tokens; the operations we
// perform on them (wait, close, duplicate, I/O) are thread-safe.
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl OwnedHandle {
    /// Take ownership of a raw handle. The caller must not close it.
    pub fn from_raw(handle: HANDLE) -> Self {
        OwnedHandle(handle)
    }

    pub fn as_raw(&self) -> HANDLE {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_null() && self.0 != INVALID_HANDLE_VALUE
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if self.is_valid() {
            unsafe { CloseHandle(self.0) };
        }
        self.0 = ptr::null_mut();
    }
}

/// Unnamed event object, manual- or auto-reset, initially unsignalled.
pub fn create_event(manual_reset: bool) -> io::Result<OwnedHandle> {
    let handle = unsafe { CreateEventW(ptr::null(), manual_reset as i32, 0, ptr::null()) };
    if handle.is_null() {
        return Err(io::Error::last_os_error());
    }
    Ok(OwnedHandle::from_raw(handle))
}

/// Open registry key under HKLM. All DNS and WINS bookkeeping goes through
/// this type; values are read and written as wide `REG_SZ`.
pub struct RegKey(HKEY);

unsafe impl Send for RegKey {}

impl RegKey {
    pub fn open_local_machine(path: &str) -> Win32Result<RegKey> {
        let wide = to_wide(path);
        let mut key: HKEY = ptr::null_mut();
        let err = unsafe {
            RegOpenKeyExW(HKEY_LOCAL_MACHINE, wide.as_ptr(), 0, KEY_ALL_ACCESS, &mut key)
        };
        if err != 0 {
            return Err(err as u32);
        }
        Ok(RegKey(key))
    }

    pub fn open_subkey(&self, name: &str) -> Win32Result<RegKey> {
        let wide = to_wide(name);
        let mut key: HKEY = ptr::null_mut();
        let err = unsafe { RegOpenKeyExW(self.0, wide.as_ptr(), 0, KEY_ALL_ACCESS, &mut key) };
        if err != 0 {
            return Err(err as u32);
        }
        Ok(RegKey(key))
    }

    /// Read a string value. `Ok(None)` when the value does not exist.
    pub fn get_string(&self, value: &str) -> Win32Result<Option<String>> {
        let wide = to_wide(value);
        let mut buf = [0u16; 2048];
        let mut size = (buf.len() * 2) as u32;
        let err = unsafe {
            RegGetValueW(
                self.0,
                ptr::null(),
                wide.as_ptr(),
                RRF_RT_REG_SZ,
                ptr::null_mut(),
                buf.as_mut_ptr() as *mut c_void,
                &mut size,
            )
        };
        match err as u32 {
            0 => Ok(Some(from_wide(&buf))),
            ERROR_FILE_NOT_FOUND => Ok(None),
            other => Err(other),
        }
    }

    pub fn set_string(&self, value: &str, data: &str) -> Win32Result<()> {
        let name = to_wide(value);
        let wide = to_wide(data);
        let err = unsafe {
            RegSetValueExW(
                self.0,
                name.as_ptr(),
                0,
                REG_SZ,
                wide.as_ptr() as *const u8,
                (wide.len() * 2) as u32,
            )
        };
        if err != 0 {
            return Err(err as u32);
        }
        Ok(())
    }

    pub fn delete_value(&self, value: &str) -> Win32Result<()> {
        let name = to_wide(value);
        let err = unsafe { RegDeleteValueW(self.0, name.as_ptr()) };
        match err as u32 {
            0 | ERROR_FILE_NOT_FOUND => Ok(()),
            other => Err(other),
        }
    }
}

impl Drop for RegKey {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { RegCloseKey(self.0) };
        }
    }
}

/// File mapping view, unmapped on drop.
pub struct MappedView(*mut c_void);

unsafe impl Send for MappedView {}

impl MappedView {
    /// Wrap a view address returned by `MapViewOfFile`. Must be non-null.
    pub fn from_address(addr: MEMORY_MAPPED_VIEW_ADDRESS) -> MappedView {
        MappedView(addr.Value)
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.0
    }
}

impl Drop for MappedView {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS { Value: self.0 }) };
            self.0 = ptr::null_mut();
        }
    }
}

/// Environment block produced for the client token, destroyed on drop.
pub struct EnvironmentBlock(*mut c_void);

unsafe impl Send for EnvironmentBlock {}

impl EnvironmentBlock {
    pub fn from_raw(ptr: *mut c_void) -> EnvironmentBlock {
        EnvironmentBlock(ptr)
    }

    pub fn as_ptr(&self) -> *const c_void {
        self.0
    }
}

impl Drop for EnvironmentBlock {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { DestroyEnvironmentBlock(self.0) };
        }
    }
}

/// Owner for API allocations that must be released with `LocalFree`
/// (DACLs from `SetEntriesInAclW`, descriptors from SDDL conversion).
pub struct LocalBox<T>(*mut T);

unsafe impl<T> Send for LocalBox<T> {}

impl<T> LocalBox<T> {
    pub fn from_raw(ptr: *mut T) -> LocalBox<T> {
        LocalBox(ptr)
    }

    pub fn as_ptr(&self) -> *mut T {
        self.0
    }
}

impl<T> Drop for LocalBox<T> {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { LocalFree(self.0 as *mut c_void) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_round_trip_stops_at_nul() {
        let wide = to_wide("tun0");
        assert_eq!(wide.last(), Some(&0));
        let mut padded = wide.clone();
        padded.extend_from_slice(&[0x41, 0x42]);
        assert_eq!(from_wide(&padded), "tun0");
    }

    #[test]
    fn system_message_never_empty() {
        // Code 5 is ERROR_ACCESS_DENIED; any system has text for it, and the
        // fallback covers exotic codes.
        assert!(!system_message(5).is_empty());
        assert!(system_message(0xE000_0001).contains("e0000001"));
    }
}
