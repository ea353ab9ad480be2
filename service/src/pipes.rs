//! Overlapped named-pipe plumbing.
//!
//! All pipe traffic goes through three operations that pair an overlapped
//! I/O event with the caller's cancel set. Peek waits forever and is the
//! quiescent point of a session; read and write are bounded by
//! `IO_TIMEOUT_MS`. Any wake from the cancel set cancels the pending I/O
//! and surfaces as "0 bytes", which callers treat as the end of the
//! conversation. That collapses timeout, cancellation and peer death into
//! one signal, the same way the wait loops expect it.

use std::ffi::c_void;
use std::ptr;

use log::error;
use windows_sys::Win32::Foundation::{
    ERROR_IO_PENDING, ERROR_MORE_DATA, GENERIC_READ, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE,
    WAIT_OBJECT_0,
};
use windows_sys::Win32::Security::Authorization::ConvertStringSecurityDescriptorToSecurityDescriptorW;
use windows_sys::Win32::Security::{PSECURITY_DESCRIPTOR, SECURITY_ATTRIBUTES};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadFile, WriteFile, FILE_FLAG_FIRST_PIPE_INSTANCE, FILE_FLAG_OVERLAPPED,
    OPEN_EXISTING, PIPE_ACCESS_DUPLEX,
};
use windows_sys::Win32::System::Pipes::{
    CreateNamedPipeW, PeekNamedPipe, SetNamedPipeHandleState,
    PIPE_READMODE_MESSAGE, PIPE_REJECT_REMOTE_CLIENTS, PIPE_TYPE_MESSAGE, PIPE_UNLIMITED_INSTANCES,
    PIPE_WAIT,
};
use windows_sys::Win32::System::Threading::{GetCurrentThreadId, WaitForMultipleObjects, INFINITE};
use windows_sys::Win32::System::IO::{CancelIo, GetOverlappedResult, OVERLAPPED};

use shared::constants::{CLIENT_PIPE_BUFFER, CLIENT_PIPE_PREFIX, ENGINE_PIPE_BUFFER, IO_TIMEOUT_MS};

use crate::handles::{create_event, last_error, to_wide, LocalBox, OwnedHandle, Win32Result};

/// Generic access right WRITE_DAC, requested on the client pipe so the
/// service can adjust the descriptor later if it ever has to.
const WRITE_DAC: u32 = 0x0004_0000;

/// Descriptor for the client endpoint:
/// local system gets everything, nobody may create further pipe instances
/// (0x4 = FILE_CREATE_PIPE_INSTANCE), authenticated users get read/write,
/// anonymous gets nothing.
const CLIENT_PIPE_SDDL: &str =
    "D:(A;OICI;GA;;;S-1-5-18)(D;OICI;0x4;;;S-1-1-0)(A;OICI;GRGW;;;S-1-5-11)(D;;GA;;;S-1-5-7)";

const SDDL_REVISION_1: u32 = 1;

#[derive(Clone, Copy, PartialEq, Eq)]
enum PipeOp {
    Peek,
    Read,
    Write,
}

/// Issue one overlapped pipe operation and wait on `{io_event, ...cancel}`.
/// Returns the number of bytes transferred (for peek: available), or 0 on
/// timeout, cancellation or any failure.
fn async_pipe_op(op: PipeOp, pipe: HANDLE, buffer: *mut c_void, size: u32, cancel: &[HANDLE]) -> u32 {
    let io_event = match create_event(true) {
        Ok(ev) => ev,
        Err(_) => return 0,
    };

    let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
    overlapped.hEvent = io_event.as_raw();

    let ok = unsafe {
        match op {
            PipeOp::Write => WriteFile(pipe, buffer as *const u8, size, ptr::null_mut(), &mut overlapped),
            // Peek issues a zero-byte read that completes once a message is
            // pending, hence ERROR_MORE_DATA is expected.
            PipeOp::Read | PipeOp::Peek => {
                ReadFile(pipe, buffer as *mut u8, size, ptr::null_mut(), &mut overlapped)
            }
        }
    };
    if ok == 0 {
        let err = last_error();
        if err != ERROR_IO_PENDING && err != ERROR_MORE_DATA {
            return 0;
        }
    }

    let mut handles = Vec::with_capacity(cancel.len() + 1);
    handles.push(io_event.as_raw());
    handles.extend_from_slice(cancel);

    let timeout = if op == PipeOp::Peek { INFINITE } else { IO_TIMEOUT_MS };
    let wait = unsafe {
        WaitForMultipleObjects(handles.len() as u32, handles.as_ptr(), 0, timeout)
    };
    if wait != WAIT_OBJECT_0 {
        unsafe { CancelIo(pipe) };
        return 0;
    }

    let mut bytes = 0u32;
    unsafe {
        if op == PipeOp::Peek {
            PeekNamedPipe(pipe, ptr::null_mut(), 0, ptr::null_mut(), &mut bytes, ptr::null_mut());
        } else {
            GetOverlappedResult(pipe, &overlapped, &mut bytes, 1);
        }
    }
    bytes
}

/// Wait until the peer has a message pending and report its size in bytes.
/// 0 means the pipe closed or the cancel set fired.
pub fn peek_pipe(pipe: HANDLE, cancel: &[HANDLE]) -> u32 {
    async_pipe_op(PipeOp::Peek, pipe, ptr::null_mut(), 0, cancel)
}

pub fn read_pipe(pipe: HANDLE, buf: &mut [u8], cancel: &[HANDLE]) -> u32 {
    async_pipe_op(PipeOp::Read, pipe, buf.as_mut_ptr() as *mut c_void, buf.len() as u32, cancel)
}

pub fn write_pipe(pipe: HANDLE, data: &[u8], cancel: &[HANDLE]) -> u32 {
    async_pipe_op(PipeOp::Write, pipe, data.as_ptr() as *mut c_void, data.len() as u32, cancel)
}

/// Name of the client-facing pipe for a given instance suffix.
pub fn client_pipe_name(instance: &str) -> String {
    format!(r"{CLIENT_PIPE_PREFIX}{instance}\service")
}

/// Name of the private engine pipe for the current worker thread.
pub fn engine_pipe_name(instance: &str) -> String {
    let tid = unsafe { GetCurrentThreadId() };
    format!(r"{CLIENT_PIPE_PREFIX}{instance}\service_{tid}")
}

/// Create the next client pipe instance. Only the very first instance may
/// claim `FILE_FLAG_FIRST_PIPE_INSTANCE`; it proves nobody squatted the name.
pub fn create_client_pipe_instance(instance: &str, first: bool) -> Win32Result<OwnedHandle> {
    let sddl = to_wide(CLIENT_PIPE_SDDL);
    let mut sd: PSECURITY_DESCRIPTOR = ptr::null_mut();
    let ok = unsafe {
        ConvertStringSecurityDescriptorToSecurityDescriptorW(
            sddl.as_ptr(),
            SDDL_REVISION_1,
            &mut sd,
            ptr::null_mut(),
        )
    };
    if ok == 0 {
        let err = last_error();
        error!("could not convert pipe security descriptor: {err}");
        return Err(err);
    }
    let sd = LocalBox::from_raw(sd);

    let sa = SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: sd.as_ptr(),
        bInheritHandle: 0,
    };

    let mut flags = PIPE_ACCESS_DUPLEX | WRITE_DAC | FILE_FLAG_OVERLAPPED;
    if first {
        flags |= FILE_FLAG_FIRST_PIPE_INSTANCE;
    }

    let name = to_wide(&client_pipe_name(instance));
    let pipe = unsafe {
        CreateNamedPipeW(
            name.as_ptr(),
            flags,
            PIPE_TYPE_MESSAGE | PIPE_READMODE_MESSAGE | PIPE_REJECT_REMOTE_CLIENTS,
            PIPE_UNLIMITED_INSTANCES,
            CLIENT_PIPE_BUFFER,
            CLIENT_PIPE_BUFFER,
            0,
            &sa,
        )
    };
    if pipe == INVALID_HANDLE_VALUE {
        let err = last_error();
        error!("could not create client pipe instance: {err}");
        return Err(err);
    }
    Ok(OwnedHandle::from_raw(pipe))
}

/// Create the per-session engine pipe and open its far end.
///
/// Returns `(service_end, engine_end)`. The engine end is inheritable and is
/// handed to the child by handle value on its command line; the service end
/// is what the worker serves requests from.
pub fn create_engine_pipe_pair(instance: &str) -> Win32Result<(OwnedHandle, OwnedHandle)> {
    let name = to_wide(&engine_pipe_name(instance));

    let service_end = unsafe {
        CreateNamedPipeW(
            name.as_ptr(),
            PIPE_ACCESS_DUPLEX | FILE_FLAG_FIRST_PIPE_INSTANCE | FILE_FLAG_OVERLAPPED,
            PIPE_TYPE_MESSAGE | PIPE_READMODE_MESSAGE | PIPE_WAIT,
            1,
            ENGINE_PIPE_BUFFER,
            ENGINE_PIPE_BUFFER,
            0,
            ptr::null(),
        )
    };
    if service_end == INVALID_HANDLE_VALUE {
        return Err(last_error());
    }
    let service_end = OwnedHandle::from_raw(service_end);

    let inheritable = SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: ptr::null_mut(),
        bInheritHandle: 1,
    };
    let engine_end = unsafe {
        CreateFileW(
            name.as_ptr(),
            GENERIC_READ | GENERIC_WRITE,
            0,
            &inheritable,
            OPEN_EXISTING,
            0,
            ptr::null_mut(),
        )
    };
    if engine_end == INVALID_HANDLE_VALUE {
        return Err(last_error());
    }
    let engine_end = OwnedHandle::from_raw(engine_end);

    let mut mode = PIPE_READMODE_MESSAGE;
    let ok = unsafe {
        SetNamedPipeHandleState(engine_end.as_raw(), &mut mode, ptr::null(), ptr::null())
    };
    if ok == 0 {
        return Err(last_error());
    }

    Ok((service_end, engine_end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_names_carry_instance_suffix() {
        assert_eq!(client_pipe_name(""), r"\\.\pipe\tunserv\service");
        assert_eq!(client_pipe_name("-test"), r"\\.\pipe\tunserv-test\service");
        assert!(engine_pipe_name("").starts_with(r"\\.\pipe\tunserv\service_"));
    }
}
