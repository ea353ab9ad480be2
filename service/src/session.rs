//! Per-client session worker.
//!
//! One worker owns one client pipe: it reads and validates the startup
//! blob, authenticates the caller, launches the engine under the caller's
//! token, then serves requests from the engine's private pipe until the
//! engine goes quiet or misbehaves. Whatever the session changed on the
//! system is unwound from the ledger on the way out, no matter which step
//! failed.

use std::ffi::c_void;
use std::mem;
use std::path::Path;
use std::ptr;
use std::sync::Arc;

use log::{error, info, warn};
use windows_sys::Win32::Foundation::{
    SetHandleInformation, GENERIC_WRITE, HANDLE, HANDLE_FLAG_INHERIT, INVALID_HANDLE_VALUE,
    STILL_ACTIVE,
};
use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FlushFileBuffers, WriteFile, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::Environment::CreateEnvironmentBlock;
use windows_sys::Win32::System::Pipes::{CreatePipe, DisconnectNamedPipe};
use windows_sys::Win32::System::Threading::{
    CreateProcessAsUserW, GetExitCodeProcess, TerminateProcess, WaitForSingleObject,
    CREATE_NO_WINDOW, CREATE_UNICODE_ENVIRONMENT, PROCESS_INFORMATION, STARTF_USESTDHANDLES,
    STARTUPINFOW,
};

use shared::constants::{ERROR_ENGINE_STARTUP, ERROR_STARTUP_DATA, IO_TIMEOUT_MS};
use shared::errors::StartupDataError;
use shared::protocol::{decode_request, Ack, Header, Request, MAX_REQUEST_SIZE};

use crate::access::{
    duplicate_primary_token, is_authorized_user, service_token, validate_options, ChildSecurity,
    ImpersonationGuard, TokenUserInfo,
};
use crate::dispatcher::ServiceCtx;
use crate::handles::{
    last_error, system_message, to_wide, EnvironmentBlock, OwnedHandle,
};
use crate::pipes::{create_engine_pipe_pair, peek_pipe, read_pipe, write_pipe};
use crate::undo::{undo_all, UndoLedger};
use crate::{dns, exec, net, rings, wfp, wins};

/// The three strings a client hands over when it connects.
#[derive(Debug, PartialEq, Eq)]
pub struct StartupData {
    pub directory: String,
    pub options: String,
    pub std_input: String,
}

fn take_string(units: &[u16]) -> Option<(String, &[u16])> {
    let pos = units.iter().position(|&u| u == 0)?;
    Some((String::from_utf16_lossy(&units[..pos]), &units[pos + 1..]))
}

/// Split the startup blob into working directory, option string and stdin
/// payload. Exactly three NUL-terminated strings; a missing trailing NUL is
/// fatal.
pub fn parse_startup_blob(units: &[u16]) -> Result<StartupData, StartupDataError> {
    if units.is_empty() {
        return Err(StartupDataError::Empty);
    }
    if units[units.len() - 1] != 0 {
        return Err(StartupDataError::NotTerminated);
    }

    let (directory, rest) = take_string(units).ok_or(StartupDataError::NotTerminated)?;
    if rest.is_empty() {
        return Err(StartupDataError::MissingOptions);
    }
    let (options, rest) = take_string(rest).ok_or(StartupDataError::MissingOptions)?;
    if rest.is_empty() {
        return Err(StartupDataError::MissingStdin);
    }
    let (std_input, _) = take_string(rest).ok_or(StartupDataError::MissingStdin)?;

    Ok(StartupData { directory, options, std_input })
}

/// Write an error report to the client: three UTF-16 lines carrying the
/// code, a context string and the system's text for the code. The engine
/// startup sentinel has no system text; its context line says it all.
pub fn report_error(pipe: &OwnedHandle, code: u32, context: &str, cancel: &[HANDLE]) {
    let sysmsg = if code == ERROR_ENGINE_STARTUP {
        String::new()
    } else {
        system_message(code)
    };
    let text = format!("{code:#010x}\n{context}\n{sysmsg}");

    let bytes: Vec<u8> = text.encode_utf16().flat_map(u16::to_le_bytes).collect();
    write_pipe(pipe.as_raw(), &bytes, cancel);
    error!("{}", text.replace('\n', " | "));
}

fn report_last_error(pipe: &OwnedHandle, context: &str, cancel: &[HANDLE]) {
    report_error(pipe, last_error(), context, cancel);
}

/// Successful-launch report: same three-line shape with code 0 and the
/// engine's process id on the second line.
fn report_pid(pipe: &OwnedHandle, pid: u32, cancel: &[HANDLE]) {
    let text = format!("{:#010x}\n{pid:#010x}\nProcess ID", 0);
    let bytes: Vec<u8> = text.encode_utf16().flat_map(u16::to_le_bytes).collect();
    write_pipe(pipe.as_raw(), &bytes, cancel);
}

/// Peek-then-read the startup blob off the client pipe.
fn read_startup_data(pipe: &OwnedHandle, cancel: &[HANDLE]) -> Option<StartupData> {
    let bytes = peek_pipe(pipe.as_raw(), cancel);
    if bytes == 0 {
        report_last_error(pipe, "waiting for startup data", cancel);
        return None;
    }

    let mut buf = vec![0u8; bytes as usize];
    let read = read_pipe(pipe.as_raw(), &mut buf, cancel);
    if read != bytes {
        report_last_error(pipe, "reading startup data", cancel);
        return None;
    }

    let units: Vec<u16> = buf
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();

    match parse_startup_blob(&units) {
        Ok(sud) => Some(sud),
        Err(err) => {
            report_error(pipe, ERROR_STARTUP_DATA, &err.to_string(), cancel);
            None
        }
    }
}

fn create_nul_stdout(inheritable: &SECURITY_ATTRIBUTES) -> Option<OwnedHandle> {
    let name = to_wide("NUL");
    let handle = unsafe {
        CreateFileW(
            name.as_ptr(),
            GENERIC_WRITE,
            FILE_SHARE_WRITE,
            inheritable,
            OPEN_EXISTING,
            0,
            ptr::null_mut(),
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return None;
    }
    Some(OwnedHandle::from_raw(handle))
}

/// Anonymous pipe feeding the engine's stdin. Only the read end may be
/// inherited.
fn create_stdin_pipe(inheritable: &SECURITY_ATTRIBUTES) -> Option<(OwnedHandle, OwnedHandle)> {
    let mut read: HANDLE = ptr::null_mut();
    let mut write: HANDLE = ptr::null_mut();
    if unsafe { CreatePipe(&mut read, &mut write, inheritable, 0) } == 0 {
        return None;
    }
    let read = OwnedHandle::from_raw(read);
    let write = OwnedHandle::from_raw(write);
    if unsafe { SetHandleInformation(write.as_raw(), HANDLE_FLAG_INHERIT, 0) } == 0 {
        return None;
    }
    Some((read, write))
}

pub(crate) fn engine_cmdline(engine_path: &Path, options: &str, channel: usize) -> String {
    let argv0 = engine_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "engine".to_string());
    format!("{argv0} {options} --service-channel {channel}")
}

struct LaunchedEngine {
    process: OwnedHandle,
    pid: u32,
    engine_pipe: OwnedHandle,
    stdin_write: OwnedHandle,
}

/// Authenticate the client and start the engine under its token.
/// Every failure is reported over the client pipe before returning.
fn launch_engine(
    ctx: &ServiceCtx,
    pipe: &OwnedHandle,
    sud: &StartupData,
    cancel: &[HANDLE],
) -> Option<LaunchedEngine> {
    let svc_token = match service_token() {
        Ok(token) => token,
        Err(err) => {
            report_error(pipe, err, "opening the service token", cancel);
            return None;
        }
    };
    let svc_user = match TokenUserInfo::from_token(svc_token.as_raw()) {
        Ok(user) => user,
        Err(err) => {
            report_error(pipe, err, "reading the service token user", cancel);
            return None;
        }
    };

    let guard = match ImpersonationGuard::impersonate_pipe_client(pipe.as_raw()) {
        Ok(guard) => guard,
        Err(err) => {
            report_error(pipe, err, "impersonating the client", cancel);
            return None;
        }
    };
    let imp_token = match guard.client_token() {
        Ok(token) => token,
        Err(err) => {
            report_error(pipe, err, "opening the client token", cancel);
            return None;
        }
    };
    let client_user = match TokenUserInfo::from_token(imp_token.as_raw()) {
        Ok(user) => user,
        Err(err) => {
            report_error(pipe, err, "reading the client token user", cancel);
            return None;
        }
    };

    // Unprivileged clients only get whitelisted options; group members and
    // the service account may run anything.
    if let Err(errmsg) = validate_options(
        ctx.policy.as_ref(),
        &sud.directory,
        &sud.options,
        &ctx.settings.admin_group,
    ) {
        if !is_authorized_user(
            &client_user,
            &imp_token,
            &ctx.settings.admin_group,
            &ctx.settings.service_user,
        ) {
            report_error(pipe, ERROR_STARTUP_DATA, &errmsg, cancel);
            return None;
        }
    }

    let mut child_sec = match ChildSecurity::new(svc_user.sid(), client_user.sid()) {
        Ok(sec) => sec,
        Err(err) => {
            report_error(pipe, err, "building the engine security descriptor", cancel);
            return None;
        }
    };

    let pri_token = match duplicate_primary_token(imp_token.as_raw()) {
        Ok(token) => token,
        Err(err) => {
            report_error(pipe, err, "duplicating the client token", cancel);
            return None;
        }
    };

    let inheritable = SECURITY_ATTRIBUTES {
        nLength: mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: ptr::null_mut(),
        bInheritHandle: 1,
    };

    // The engine logs through its own facilities; stdout goes nowhere.
    let Some(stdout_write) = create_nul_stdout(&inheritable) else {
        report_last_error(pipe, "opening NUL for the engine", cancel);
        return None;
    };
    let Some((stdin_read, stdin_write)) = create_stdin_pipe(&inheritable) else {
        report_last_error(pipe, "creating the engine stdin pipe", cancel);
        return None;
    };

    let (engine_pipe, engine_end) = match create_engine_pipe_pair(&ctx.settings.instance) {
        Ok(pair) => pair,
        Err(err) => {
            report_error(pipe, err, "creating the engine service pipe", cancel);
            return None;
        }
    };

    let mut env_ptr: *mut c_void = ptr::null_mut();
    if unsafe { CreateEnvironmentBlock(&mut env_ptr, imp_token.as_raw(), 0) } == 0 {
        report_last_error(pipe, "building the engine environment", cancel);
        return None;
    }
    let env = EnvironmentBlock::from_raw(env_ptr);

    let exe = to_wide(&ctx.settings.engine_path.to_string_lossy());
    let mut cmdline = to_wide(&engine_cmdline(
        &ctx.settings.engine_path,
        &sud.options,
        engine_end.as_raw() as usize,
    ));
    let workdir = to_wide(&sud.directory);

    let mut si: STARTUPINFOW = unsafe { mem::zeroed() };
    si.cb = mem::size_of::<STARTUPINFOW>() as u32;
    si.dwFlags = STARTF_USESTDHANDLES;
    si.hStdInput = stdin_read.as_raw();
    si.hStdOutput = stdout_write.as_raw();
    si.hStdError = stdout_write.as_raw();

    let mut pi: PROCESS_INFORMATION = unsafe { mem::zeroed() };
    let sa = child_sec.attributes();

    let ok = unsafe {
        CreateProcessAsUserW(
            pri_token.as_raw(),
            exe.as_ptr(),
            cmdline.as_mut_ptr(),
            &sa,
            ptr::null(),
            1,
            ctx.settings.priority.creation_flag() | CREATE_NO_WINDOW | CREATE_UNICODE_ENVIRONMENT,
            env.as_ptr(),
            workdir.as_ptr(),
            &si,
            &mut pi,
        )
    };
    if ok == 0 {
        report_last_error(pipe, "creating the engine process", cancel);
        return None;
    }
    let process = OwnedHandle::from_raw(pi.hProcess);
    let _thread = OwnedHandle::from_raw(pi.hThread);

    if let Err(err) = guard.revert() {
        unsafe { TerminateProcess(process.as_raw(), 1) };
        report_error(pipe, err, "reverting impersonation", cancel);
        return None;
    }

    info!("engine started with pid {}", pi.dwProcessId);
    report_pid(pipe, pi.dwProcessId, cancel);

    // Our copies of the engine's ends close here; the child keeps its own.
    drop(stdout_write);
    drop(stdin_read);
    drop(engine_end);

    Some(LaunchedEngine {
        process,
        pid: pi.dwProcessId,
        engine_pipe,
        stdin_write,
    })
}

/// Best effort: the stdin payload (keys, passwords) goes to the engine as
/// UTF-8. The engine may have closed its end already; that is its choice.
fn forward_std_input(engine: &LaunchedEngine, std_input: &str) {
    if std_input.is_empty() {
        return;
    }
    let bytes = std_input.as_bytes();
    let mut written = 0u32;
    unsafe {
        WriteFile(
            engine.stdin_write.as_raw(),
            bytes.as_ptr(),
            bytes.len() as u32,
            &mut written,
            ptr::null_mut(),
        )
    };
}

fn dispatch_request(
    ctx: &Arc<ServiceCtx>,
    request: &Request,
    engine_proc: HANDLE,
    ledger: &mut UndoLedger,
) -> u32 {
    match request {
        Request::AddAddress(m) => net::handle_address(m, true, ledger),
        Request::DelAddress(m) => net::handle_address(m, false, ledger),
        Request::AddRoute(m) => net::handle_route(m, true, ledger),
        Request::DelRoute(m) => net::handle_route(m, false, ledger),
        Request::FlushNeighbors(m) => net::handle_flush_neighbors(m),
        Request::AddWfpBlock(m) => {
            wfp::handle_wfp_block(m, true, &ctx.settings.engine_path, ledger)
        }
        Request::DelWfpBlock(m) => {
            wfp::handle_wfp_block(m, false, &ctx.settings.engine_path, ledger)
        }
        Request::RegisterDns => exec::handle_register_dns(ctx),
        Request::AddDnsCfg(m) => dns::handle_dns_cfg(m, true, ledger),
        Request::DelDnsCfg(m) => dns::handle_dns_cfg(m, false, ledger),
        Request::AddWinsCfg(m) => wins::handle_wins_cfg(m, true, ledger),
        Request::DelWinsCfg(m) => wins::handle_wins_cfg(m, false, ledger),
        Request::EnableDhcp(m) => net::handle_enable_dhcp(m),
        Request::RegisterRingBuffers(m) => {
            rings::handle_register_ring_buffers(m, engine_proc, ledger)
        }
        Request::SetMtu(m) => net::handle_set_mtu(m),
    }
}

/// Read one frame, handle it, always answer with an ack. A frame whose
/// byte count disagrees with what was peeked, or that fails to decode,
/// is answered without touching any handler.
fn handle_message(
    ctx: &Arc<ServiceCtx>,
    engine: &LaunchedEngine,
    bytes: u32,
    ledger: &mut UndoLedger,
    cancel: &[HANDLE],
) {
    let mut buf = vec![0u8; bytes as usize];
    let read = read_pipe(engine.engine_pipe.as_raw(), &mut buf, cancel);

    let mut ack = Ack {
        message_id: u32::MAX,
        error: shared::constants::ERROR_MESSAGE_DATA,
    };

    if read == bytes {
        if let Some(header) = Header::parse(&buf) {
            ack.message_id = header.message_id;
        }
        match decode_request(&buf) {
            Ok(request) => {
                ack.error = dispatch_request(ctx, &request, engine.process.as_raw(), ledger);
                info!("{} -> {}", request.kind(), ack.error);
            }
            Err(err) => {
                warn!("rejecting request from engine {}: {err}", engine.pid);
                ack.error = err.ack_code();
            }
        }
    }

    write_pipe(engine.engine_pipe.as_raw(), &ack.encode(), cancel);
}

/// Serve the engine until it goes quiet, misbehaves, or the service exits.
fn serve(ctx: &Arc<ServiceCtx>, engine: &LaunchedEngine, ledger: &mut UndoLedger, cancel: &[HANDLE]) {
    loop {
        let bytes = peek_pipe(engine.engine_pipe.as_raw(), cancel);
        if bytes == 0 {
            break;
        }
        if bytes as usize > MAX_REQUEST_SIZE {
            error!(
                "engine {} sent an oversized frame ({bytes} bytes); terminating it",
                engine.pid
            );
            break;
        }
        handle_message(ctx, engine, bytes, ledger, cancel);
    }
}

/// Give the engine a moment to exit on its own, then make sure it is gone.
/// A non-zero exit is reported to the client.
fn wait_for_engine(engine: &LaunchedEngine, pipe: &OwnedHandle, cancel: &[HANDLE]) {
    unsafe { WaitForSingleObject(engine.process.as_raw(), IO_TIMEOUT_MS) };

    let mut exit_code = 0u32;
    if unsafe { GetExitCodeProcess(engine.process.as_raw(), &mut exit_code) } == 0 {
        return;
    }
    if exit_code == STILL_ACTIVE as u32 {
        warn!("engine {} still running at session end; terminating it", engine.pid);
        unsafe { TerminateProcess(engine.process.as_raw(), 1) };
    } else if exit_code != 0 {
        report_error(
            pipe,
            ERROR_ENGINE_STARTUP,
            &format!("engine exited with error: exit code = {exit_code}"),
            cancel,
        );
    }
}

/// Entry point of a session worker thread. Owns the client pipe.
pub fn run_session(ctx: Arc<ServiceCtx>, pipe: OwnedHandle) {
    let cancel = [ctx.exit_event.as_raw()];
    let mut ledger = UndoLedger::new();

    if let Some(sud) = read_startup_data(&pipe, &cancel) {
        if let Some(engine) = launch_engine(&ctx, &pipe, &sud, &cancel) {
            forward_std_input(&engine, &sud.std_input);
            serve(&ctx, &engine, &mut ledger, &cancel);
            wait_for_engine(&engine, &pipe, &cancel);
        }
    }

    undo_all(&mut ledger);

    unsafe {
        FlushFileBuffers(pipe.as_raw());
        DisconnectNamedPipe(pipe.as_raw());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(parts: &[&str], terminated: bool) -> Vec<u16> {
        let mut units = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            units.extend(part.encode_utf16());
            if terminated || i + 1 < parts.len() {
                units.push(0);
            }
        }
        units
    }

    #[test]
    fn startup_blob_splits_into_three_strings() {
        let units = blob(&["C:\\work", "--config office.conf", "secret"], true);
        let sud = parse_startup_blob(&units).unwrap();
        assert_eq!(sud.directory, "C:\\work");
        assert_eq!(sud.options, "--config office.conf");
        assert_eq!(sud.std_input, "secret");
    }

    #[test]
    fn empty_stdin_string_is_allowed() {
        let units = blob(&["C:\\work", "opts", ""], true);
        let sud = parse_startup_blob(&units).unwrap();
        assert_eq!(sud.std_input, "");
    }

    #[test]
    fn missing_terminator_is_fatal() {
        let units = blob(&["C:\\work", "opts", "stdin"], false);
        assert_eq!(
            parse_startup_blob(&units).unwrap_err(),
            StartupDataError::NotTerminated
        );
    }

    #[test]
    fn blob_ending_at_the_working_directory_is_rejected() {
        let units = blob(&["C:\\work"], true);
        assert_eq!(
            parse_startup_blob(&units).unwrap_err(),
            StartupDataError::MissingOptions
        );
    }

    #[test]
    fn blob_ending_at_the_options_is_rejected() {
        let units = blob(&["C:\\work", "opts"], true);
        assert_eq!(
            parse_startup_blob(&units).unwrap_err(),
            StartupDataError::MissingStdin
        );
    }

    #[test]
    fn empty_blob_is_rejected() {
        assert_eq!(parse_startup_blob(&[]).unwrap_err(), StartupDataError::Empty);
    }

    #[test]
    fn engine_cmdline_embeds_the_channel_handle() {
        let cmdline = engine_cmdline(Path::new(r"C:\prog\engine.exe"), "--config a.conf", 0x1a4);
        assert_eq!(cmdline, "engine --config a.conf --service-channel 420");
    }
}
