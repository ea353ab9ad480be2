//! Accept loop and service context.
//!
//! The dispatcher owns the listening pipe: it issues an overlapped connect,
//! waits on the connect event plus the worker thread handles, and spawns a
//! session worker per accepted client. The process-wide exit event joins
//! the wait set only while no workers exist; while workers run, they carry
//! the exit event in their own wait sets and the dispatcher learns about
//! shutdown through their exits.

use std::io;
use std::os::windows::io::AsRawHandle;
use std::ptr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info};
use windows_sys::Win32::Foundation::{
    ERROR_IO_PENDING, ERROR_PIPE_CONNECTED, HANDLE, WAIT_FAILED, WAIT_OBJECT_0,
};
use windows_sys::Win32::System::Pipes::ConnectNamedPipe;
use windows_sys::Win32::System::Threading::{
    CreateSemaphoreW, ResetEvent, SetEvent, WaitForMultipleObjects, INFINITE,
};
use windows_sys::Win32::System::IO::{CancelIo, OVERLAPPED};

use crate::access::OptionPolicy;
use crate::handles::{create_event, last_error, OwnedHandle};
use crate::pipes::create_client_pipe_instance;
use crate::session::run_session;
use crate::settings::Settings;

/// Everything a worker needs from the process: the immutable settings, the
/// shutdown signal, the option policy, and the one genuinely process-wide
/// resource, the register-DNS semaphore.
pub struct ServiceCtx {
    pub settings: Settings,
    pub exit_event: OwnedHandle,
    pub rdns_semaphore: OwnedHandle,
    pub policy: Box<dyn OptionPolicy>,
}

impl ServiceCtx {
    pub fn new(settings: Settings, policy: Box<dyn OptionPolicy>) -> io::Result<ServiceCtx> {
        let exit_event = create_event(true)?;

        let rdns_semaphore =
            unsafe { CreateSemaphoreW(ptr::null(), 1, 1, ptr::null()) };
        if rdns_semaphore.is_null() {
            return Err(io::Error::last_os_error());
        }

        Ok(ServiceCtx {
            settings,
            exit_event,
            rdns_semaphore: OwnedHandle::from_raw(rdns_semaphore),
            policy,
        })
    }

    /// Ask every worker, and then the dispatcher, to wind down.
    pub fn signal_exit(&self) {
        unsafe { SetEvent(self.exit_event.as_raw()) };
    }
}

/// Run the accept loop until the exit event is signalled (graceful) or the
/// wait set fails (escalated shutdown). The error value is the Win32 code
/// reported to the control manager.
pub fn run(ctx: &Arc<ServiceCtx>) -> Result<(), u32> {
    let connect_event = create_event(true).map_err(|e| e.raw_os_error().unwrap_or(1) as u32)?;
    let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
    overlapped.hEvent = connect_event.as_raw();

    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    let mut pipe = create_client_pipe_instance(&ctx.settings.instance, true)?;

    info!("accepting clients");
    loop {
        let ok = unsafe { ConnectNamedPipe(pipe.as_raw(), &mut overlapped) };
        if ok == 0 {
            let err = last_error();
            if err != ERROR_PIPE_CONNECTED && err != ERROR_IO_PENDING {
                error!("could not connect the client pipe: {err}");
                return Err(err);
            }
        }

        let mut handles: Vec<HANDLE> = vec![connect_event.as_raw()];
        if workers.is_empty() {
            handles.push(ctx.exit_event.as_raw());
        }
        handles.extend(workers.iter().map(|w| w.as_raw_handle() as HANDLE));

        let wait =
            unsafe { WaitForMultipleObjects(handles.len() as u32, handles.as_ptr(), 0, INFINITE) };

        if wait == WAIT_OBJECT_0 {
            // Client connected; line up the next instance and hand this
            // pipe to a fresh worker.
            let next_pipe = create_client_pipe_instance(&ctx.settings.instance, false);

            let worker_ctx = Arc::clone(ctx);
            let client = pipe;
            match thread::Builder::new()
                .name("session".into())
                .spawn(move || run_session(worker_ctx, client))
            {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // The pipe closed with the dropped closure; the client
                    // sees a disconnect.
                    error!("insufficient resources to service a new client: {e}");
                }
            }

            unsafe { ResetEvent(connect_event.as_raw()) };
            overlapped = unsafe { std::mem::zeroed() };
            overlapped.hEvent = connect_event.as_raw();

            pipe = match next_pipe {
                Ok(pipe) => pipe,
                Err(err) => {
                    error!("could not create the next pipe instance: {err}");
                    ctx.signal_exit();
                    return Err(err);
                }
            };
            continue;
        }

        unsafe { CancelIo(pipe.as_raw()) };

        if wait == WAIT_FAILED {
            let err = last_error();
            error!("dispatcher wait failed: {err}");
            ctx.signal_exit();
            // Give the workers a moment to unwind their ledgers.
            thread::sleep(Duration::from_secs(1));
            return Err(err);
        }

        if workers.is_empty() {
            // Exit event: nothing left to wait for.
            unsafe { ResetEvent(ctx.exit_event.as_raw()) };
            info!("dispatcher stopping");
            return Ok(());
        }

        // A worker thread ended; index 0 is the connect event.
        let idx = (wait - WAIT_OBJECT_0) as usize - 1;
        if idx < workers.len() {
            let _ = workers.remove(idx).join();
        }
    }
}
