use std::env;
use std::ffi::c_void;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use log::{error, info};
use windows_sys::Win32::Foundation::ERROR_CALL_NOT_IMPLEMENTED;
use windows_sys::Win32::System::Services::{
    RegisterServiceCtrlHandlerExW, SetServiceStatus, StartServiceCtrlDispatcherW,
    SERVICE_ACCEPT_STOP, SERVICE_CONTROL_INTERROGATE, SERVICE_CONTROL_STOP, SERVICE_RUNNING,
    SERVICE_START_PENDING, SERVICE_STATUS, SERVICE_STATUS_HANDLE, SERVICE_STOPPED,
    SERVICE_STOP_PENDING, SERVICE_TABLE_ENTRYW, SERVICE_WIN32_OWN_PROCESS,
};

use crate::access::ConfigFileOnlyPolicy;
use crate::dispatcher::ServiceCtx;
use crate::handles::to_wide;
use crate::settings::{find_settings_file, Settings};

mod access;
mod dispatcher;
mod dns;
mod exec;
mod handles;
mod logger;
mod net;
mod pipes;
mod rings;
mod session;
mod settings;
mod undo;
mod wfp;
mod wins;

const SERVICE_NAME: &str = "tunserv";

/// Built before the control dispatcher starts; the SCM entry points have no
/// way to receive it as an argument.
static SERVICE_CTX: OnceLock<Arc<ServiceCtx>> = OnceLock::new();
static STATUS_HANDLE: AtomicUsize = AtomicUsize::new(0);

/// Entry point for the privileged helper service.
///
/// Initializes logging and settings, builds the service context, and either
/// hands control to the service manager or (with `--foreground`) runs the
/// dispatcher directly for development.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let foreground = env::args().any(|a| a == "--foreground" || a == "-f");

    // Keep logger alive for the duration of the process.
    let _logger = logger::init_logger(foreground)?;

    let settings = Settings::load(&find_settings_file())?;
    info!("settings loaded; engine at {}", settings.engine_path.display());

    let ctx = Arc::new(ServiceCtx::new(settings, Box::new(ConfigFileOnlyPolicy))?);
    let _ = SERVICE_CTX.set(Arc::clone(&ctx));

    if foreground {
        // Same startup sequence the service path runs, minus the SCM.
        dns::cleanup_registry();
        info!("running in the foreground; stop with the service control or Ctrl+C");
        dispatcher::run(&ctx)
            .map_err(|code| io::Error::from_raw_os_error(code as i32))?;
        return Ok(());
    }

    let name = to_wide(SERVICE_NAME);
    let table = [
        SERVICE_TABLE_ENTRYW {
            lpServiceName: name.as_ptr() as *mut u16,
            lpServiceProc: Some(service_main),
        },
        SERVICE_TABLE_ENTRYW {
            lpServiceName: ptr::null_mut(),
            lpServiceProc: None,
        },
    ];
    if unsafe { StartServiceCtrlDispatcherW(table.as_ptr()) } == 0 {
        return Err(Box::new(io::Error::last_os_error()));
    }
    Ok(())
}

fn report_status(state: u32, wait_hint: u32, exit_code: u32) {
    let handle = STATUS_HANDLE.load(Ordering::Acquire) as SERVICE_STATUS_HANDLE;
    if handle.is_null() {
        return;
    }
    let status = SERVICE_STATUS {
        dwServiceType: SERVICE_WIN32_OWN_PROCESS,
        dwCurrentState: state,
        dwControlsAccepted: if state == SERVICE_RUNNING { SERVICE_ACCEPT_STOP } else { 0 },
        dwWin32ExitCode: exit_code,
        dwServiceSpecificExitCode: 0,
        dwCheckPoint: 0,
        dwWaitHint: wait_hint,
    };
    unsafe { SetServiceStatus(handle, &status) };
}

unsafe extern "system" fn service_main(_argc: u32, _argv: *mut *mut u16) {
    let Some(ctx) = SERVICE_CTX.get() else {
        return;
    };

    let name = to_wide(SERVICE_NAME);
    let handle =
        RegisterServiceCtrlHandlerExW(name.as_ptr(), Some(service_ctrl), ptr::null_mut());
    if handle.is_null() {
        error!("could not register the service control handler");
        return;
    }
    STATUS_HANDLE.store(handle as usize, Ordering::Release);

    report_status(SERVICE_START_PENDING, 3000, 0);

    // Drain leftovers of crashed sessions before accepting anyone.
    dns::cleanup_registry();

    report_status(SERVICE_RUNNING, 0, 0);

    let exit_code = match dispatcher::run(ctx) {
        Ok(()) => 0,
        Err(code) => code,
    };

    report_status(SERVICE_STOPPED, 0, exit_code);
}

unsafe extern "system" fn service_ctrl(
    control: u32,
    _event_type: u32,
    _event_data: *mut c_void,
    _context: *mut c_void,
) -> u32 {
    match control {
        SERVICE_CONTROL_STOP => {
            report_status(SERVICE_STOP_PENDING, 3000, 0);
            if let Some(ctx) = SERVICE_CTX.get() {
                ctx.signal_exit();
            }
            0
        }
        SERVICE_CONTROL_INTERROGATE => 0,
        _ => ERROR_CALL_NOT_IMPLEMENTED,
    }
}
