//! Child command execution and the register-DNS worker.
//!
//! System tools are always resolved through the system directory at call
//! time; the service never trusts PATH. Commands run without a window and
//! are killed when they outlive their timeout.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use log::{error, info, warn};
use windows_sys::Win32::Foundation::{ERROR_SEM_TIMEOUT, STILL_ACTIVE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows_sys::Win32::System::SystemInformation::GetSystemDirectoryW;
use windows_sys::Win32::System::Threading::{
    CreateProcessW, GetExitCodeProcess, ReleaseSemaphore, TerminateProcess, WaitForMultipleObjects,
    WaitForSingleObject, CREATE_NO_WINDOW, CREATE_UNICODE_ENVIRONMENT, INFINITE,
    PROCESS_INFORMATION, STARTUPINFOW,
};

use shared::constants::RDNS_TIMEOUT_S;

use crate::dispatcher::ServiceCtx;
use crate::handles::{from_wide, last_error, to_wide, OwnedHandle};

/// Full path of a binary in the system directory (`ipconfig.exe`,
/// `netsh.exe`).
pub fn system_binary(name: &str) -> PathBuf {
    let mut buf = [0u16; 260];
    let len = unsafe { GetSystemDirectoryW(buf.as_mut_ptr(), buf.len() as u32) };
    let dir = if len == 0 {
        // Resolution failing is unheard of; fall back to the usual location.
        String::from(r"C:\Windows\System32")
    } else {
        from_wide(&buf[..len as usize])
    };
    Path::new(&dir).join(name)
}

/// Run `cmdline` and return its exit code. A process still running after
/// `timeout_ms` is terminated and reported as `WAIT_TIMEOUT`.
pub fn run_command(argv0: &Path, cmdline: &str, timeout_ms: u32) -> u32 {
    let argv0_wide = to_wide(&argv0.to_string_lossy());
    // CreateProcess may scribble on the command line; give it its own copy.
    let mut cmdline_wide = to_wide(cmdline);

    let mut si: STARTUPINFOW = unsafe { std::mem::zeroed() };
    si.cb = std::mem::size_of::<STARTUPINFOW>() as u32;
    let mut pi: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };

    let ok = unsafe {
        CreateProcessW(
            argv0_wide.as_ptr(),
            cmdline_wide.as_mut_ptr(),
            std::ptr::null(),
            std::ptr::null(),
            0,
            CREATE_NO_WINDOW | CREATE_UNICODE_ENVIRONMENT,
            std::ptr::null(),
            std::ptr::null(),
            &si,
            &mut pi,
        )
    };
    if ok == 0 {
        let err = last_error();
        error!("could not run \"{cmdline}\": {err}");
        return err;
    }

    let process = OwnedHandle::from_raw(pi.hProcess);
    let _thread = OwnedHandle::from_raw(pi.hThread);

    let timeout = if timeout_ms == 0 { INFINITE } else { timeout_ms };
    unsafe { WaitForSingleObject(process.as_raw(), timeout) };

    let mut exit_code = 0u32;
    if unsafe { GetExitCodeProcess(process.as_raw(), &mut exit_code) } == 0 {
        exit_code = last_error();
        error!("could not read exit code of \"{cmdline}\": {exit_code}");
    } else if exit_code == STILL_ACTIVE as u32 {
        exit_code = WAIT_TIMEOUT;
        unsafe { TerminateProcess(process.as_raw(), exit_code) };
        error!("\"{cmdline}\" killed after timeout");
    } else if exit_code != 0 {
        warn!("\"{cmdline}\" exited with status {exit_code}");
    } else {
        info!("\"{cmdline}\" completed");
    }

    exit_code
}

/// Body of a register-DNS worker thread. Serialised process-wide through
/// the semaphore so concurrent sessions cannot stack `ipconfig` runs.
fn register_dns_worker(ctx: Arc<ServiceCtx>) {
    let timeout_ms = RDNS_TIMEOUT_S * 1000;
    let ipconfig = system_binary("ipconfig.exe");

    let waits = [ctx.rdns_semaphore.as_raw(), ctx.exit_event.as_raw()];
    let wait = unsafe { WaitForMultipleObjects(waits.len() as u32, waits.as_ptr(), 0, timeout_ms) };
    if wait != WAIT_OBJECT_0 {
        error!("register-dns: could not lock the semaphore, giving up");
        return;
    }

    run_command(&ipconfig, "ipconfig /flushdns", timeout_ms);
    run_command(&ipconfig, "ipconfig /registerdns", timeout_ms);

    if unsafe { ReleaseSemaphore(ctx.rdns_semaphore.as_raw(), 1, std::ptr::null_mut()) } == 0 {
        error!("register-dns: failed to release semaphore: {}", last_error());
    }
}

/// Ack the request as soon as the worker is off the ground; the flush and
/// re-registration run for up to ten minutes on their own.
pub fn handle_register_dns(ctx: &Arc<ServiceCtx>) -> u32 {
    let ctx = Arc::clone(ctx);
    match thread::Builder::new()
        .name("register_dns".into())
        .spawn(move || register_dns_worker(ctx))
    {
        Ok(_handle) => 0,
        Err(e) => e.raw_os_error().unwrap_or(ERROR_SEM_TIMEOUT as i32) as u32,
    }
}
