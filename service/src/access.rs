//! The per-client security boundary: token capture, impersonation, the
//! authorized-user test and the DACL handed to the engine process.
//!
//! Option policy is deliberately a seam. The service decides *when* options
//! must be validated and what happens on rejection; *which* options pass
//! belongs to the [`OptionPolicy`] implementation installed at startup.

use std::ffi::c_void;
use std::mem;
use std::ptr;

use log::{error, warn};
use windows_sys::Win32::Foundation::{
    GetLastError, LocalFree, ERROR_INSUFFICIENT_BUFFER, HANDLE,
};
use windows_sys::Win32::Security::Authorization::{
    SetEntriesInAclW, EXPLICIT_ACCESS_W, SET_ACCESS, TRUSTEE_IS_SID,
    TRUSTEE_IS_UNKNOWN,
};
use windows_sys::Win32::Security::{
    CheckTokenMembership, DuplicateTokenEx, GetTokenInformation, InitializeSecurityDescriptor,
    IsValidSid, LookupAccountNameW, LookupAccountSidW, RevertToSelf, SetSecurityDescriptorDacl,
    SetSecurityDescriptorOwner, TokenPrimary, TokenUser, ACL, NO_INHERITANCE, PSID,
    SECURITY_ATTRIBUTES, SECURITY_DESCRIPTOR, SID_NAME_USE, TOKEN_ALL_ACCESS, TOKEN_QUERY,
    TOKEN_USER,
};
use windows_sys::Win32::System::Pipes::ImpersonateNamedPipeClient;
use windows_sys::Win32::System::SystemServices::SECURITY_DESCRIPTOR_REVISION;
use windows_sys::Win32::System::Threading::{
    GetCurrentProcess, GetCurrentThread, OpenProcessToken, OpenThreadToken,
    PROCESS_QUERY_INFORMATION, PROCESS_TERMINATE, PROCESS_VM_READ,
};
use windows_sys::Win32::UI::Shell::CommandLineToArgvW;

use crate::handles::{from_wide, last_error, to_wide, LocalBox, OwnedHandle, Win32Result};

// Generic standard/specific rights; values fixed by the access-mask layout.
const SPECIFIC_RIGHTS_ALL: u32 = 0x0000_FFFF;
const STANDARD_RIGHTS_ALL: u32 = 0x001F_0000;
const READ_CONTROL: u32 = 0x0002_0000;
const SYNCHRONIZE: u32 = 0x0010_0000;

/// Buffer-backed `TOKEN_USER`, keeping the SID pointer valid for as long
/// as the callers need it.
pub struct TokenUserInfo {
    buf: Vec<u8>,
}

impl TokenUserInfo {
    pub fn from_token(token: HANDLE) -> Win32Result<TokenUserInfo> {
        let mut len = 0u32;
        unsafe { GetTokenInformation(token, TokenUser, ptr::null_mut(), 0, &mut len) };
        if unsafe { GetLastError() } != ERROR_INSUFFICIENT_BUFFER {
            return Err(last_error());
        }

        let mut buf = vec![0u8; len as usize];
        let ok = unsafe {
            GetTokenInformation(token, TokenUser, buf.as_mut_ptr() as *mut c_void, len, &mut len)
        };
        if ok == 0 {
            return Err(last_error());
        }

        let info = TokenUserInfo { buf };
        if unsafe { IsValidSid(info.sid()) } == 0 {
            return Err(last_error());
        }
        Ok(info)
    }

    pub fn sid(&self) -> PSID {
        unsafe { (*(self.buf.as_ptr() as *const TOKEN_USER)).User.Sid }
    }
}

/// Token of the account the service itself runs under.
pub fn service_token() -> Win32Result<OwnedHandle> {
    let mut token: HANDLE = ptr::null_mut();
    if unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) } == 0 {
        return Err(last_error());
    }
    Ok(OwnedHandle::from_raw(token))
}

/// Impersonation scope for the connected pipe client. `revert` must be
/// called on the success path so its failure can terminate the child; the
/// drop impl only backstops error paths.
pub struct ImpersonationGuard {
    active: bool,
}

impl ImpersonationGuard {
    pub fn impersonate_pipe_client(pipe: HANDLE) -> Win32Result<ImpersonationGuard> {
        if unsafe { ImpersonateNamedPipeClient(pipe) } == 0 {
            return Err(last_error());
        }
        Ok(ImpersonationGuard { active: true })
    }

    /// The client's token, readable only while impersonating.
    pub fn client_token(&self) -> Win32Result<OwnedHandle> {
        let mut token: HANDLE = ptr::null_mut();
        if unsafe { OpenThreadToken(GetCurrentThread(), TOKEN_ALL_ACCESS, 0, &mut token) } == 0 {
            return Err(last_error());
        }
        Ok(OwnedHandle::from_raw(token))
    }

    pub fn revert(mut self) -> Win32Result<()> {
        self.active = false;
        if unsafe { RevertToSelf() } == 0 {
            return Err(last_error());
        }
        Ok(())
    }
}

impl Drop for ImpersonationGuard {
    fn drop(&mut self) {
        if self.active {
            unsafe { RevertToSelf() };
        }
    }
}

/// Turn the client's impersonation token into a primary token the engine
/// process can be created with.
pub fn duplicate_primary_token(imp_token: HANDLE) -> Win32Result<OwnedHandle> {
    let mut token: HANDLE = ptr::null_mut();
    let ok = unsafe {
        DuplicateTokenEx(imp_token, TOKEN_ALL_ACCESS, ptr::null(), 0, TokenPrimary, &mut token)
    };
    if ok == 0 {
        return Err(last_error());
    }
    Ok(OwnedHandle::from_raw(token))
}

fn lookup_account_name_of_sid(sid: PSID) -> Option<String> {
    let mut name = [0u16; 256];
    let mut name_len = name.len() as u32;
    let mut domain = [0u16; 256];
    let mut domain_len = domain.len() as u32;
    let mut use_kind: SID_NAME_USE = 0;
    let ok = unsafe {
        LookupAccountSidW(
            ptr::null(),
            sid,
            name.as_mut_ptr(),
            &mut name_len,
            domain.as_mut_ptr(),
            &mut domain_len,
            &mut use_kind,
        )
    };
    if ok == 0 {
        return None;
    }
    Some(from_wide(&name))
}

fn lookup_sid_of_account(account: &str) -> Option<Vec<u8>> {
    let wide = to_wide(account);
    let mut sid_len = 0u32;
    let mut domain_len = 0u32;
    let mut use_kind: SID_NAME_USE = 0;
    unsafe {
        LookupAccountNameW(
            ptr::null(),
            wide.as_ptr(),
            ptr::null_mut(),
            &mut sid_len,
            ptr::null_mut(),
            &mut domain_len,
            &mut use_kind,
        )
    };
    if sid_len == 0 {
        return None;
    }

    let mut sid = vec![0u8; sid_len as usize];
    let mut domain = vec![0u16; domain_len as usize];
    let ok = unsafe {
        LookupAccountNameW(
            ptr::null(),
            wide.as_ptr(),
            sid.as_mut_ptr() as PSID,
            &mut sid_len,
            domain.as_mut_ptr(),
            &mut domain_len,
            &mut use_kind,
        )
    };
    if ok == 0 {
        return None;
    }
    Some(sid)
}

/// A client may run arbitrary options when it is the configured service
/// account or a member of the configured admin group.
pub fn is_authorized_user(
    client: &TokenUserInfo,
    imp_token: &OwnedHandle,
    admin_group: &str,
    service_user: &str,
) -> bool {
    if let Some(name) = lookup_account_name_of_sid(client.sid()) {
        if name.eq_ignore_ascii_case(service_user) {
            return true;
        }
    }

    let Some(group_sid) = lookup_sid_of_account(admin_group) else {
        warn!("admin group '{admin_group}' could not be resolved");
        return false;
    };

    let mut is_member = 0i32;
    let ok = unsafe {
        CheckTokenMembership(imp_token.as_raw(), group_sid.as_ptr() as PSID, &mut is_member)
    };
    if ok == 0 {
        error!("membership check for '{admin_group}' failed: {}", last_error());
        return false;
    }
    is_member != 0
}

/// Security descriptor for the engine process: the service account owns it
/// with full access, the client gets just enough to watch, read and kill
/// its own engine.
pub struct ChildSecurity {
    sd: Box<SECURITY_DESCRIPTOR>,
    _dacl: LocalBox<ACL>,
}

impl ChildSecurity {
    pub fn new(service_sid: PSID, client_sid: PSID) -> Win32Result<ChildSecurity> {
        let mut sd: Box<SECURITY_DESCRIPTOR> = Box::new(unsafe { mem::zeroed() });
        let sd_ptr = sd.as_mut() as *mut SECURITY_DESCRIPTOR as *mut c_void;

        if unsafe { InitializeSecurityDescriptor(sd_ptr, SECURITY_DESCRIPTOR_REVISION) } == 0 {
            return Err(last_error());
        }
        if unsafe { SetSecurityDescriptorOwner(sd_ptr, service_sid, 0) } == 0 {
            return Err(last_error());
        }

        let mut ea: [EXPLICIT_ACCESS_W; 2] = unsafe { mem::zeroed() };
        ea[0].grfAccessPermissions = SPECIFIC_RIGHTS_ALL | STANDARD_RIGHTS_ALL;
        ea[0].grfAccessMode = SET_ACCESS;
        ea[0].grfInheritance = NO_INHERITANCE;
        ea[0].Trustee.TrusteeForm = TRUSTEE_IS_SID;
        ea[0].Trustee.TrusteeType = TRUSTEE_IS_UNKNOWN;
        ea[0].Trustee.ptstrName = service_sid as *mut u16;
        ea[1].grfAccessPermissions =
            READ_CONTROL | SYNCHRONIZE | PROCESS_VM_READ | PROCESS_TERMINATE | PROCESS_QUERY_INFORMATION;
        ea[1].grfAccessMode = SET_ACCESS;
        ea[1].grfInheritance = NO_INHERITANCE;
        ea[1].Trustee.TrusteeForm = TRUSTEE_IS_SID;
        ea[1].Trustee.TrusteeType = TRUSTEE_IS_UNKNOWN;
        ea[1].Trustee.ptstrName = client_sid as *mut u16;

        let mut dacl: *mut ACL = ptr::null_mut();
        let err = unsafe { SetEntriesInAclW(ea.len() as u32, ea.as_ptr(), ptr::null(), &mut dacl) };
        if err != 0 {
            return Err(err);
        }
        let dacl = LocalBox::from_raw(dacl);

        if unsafe { SetSecurityDescriptorDacl(sd_ptr, 1, dacl.as_ptr(), 0) } == 0 {
            return Err(last_error());
        }

        Ok(ChildSecurity { sd, _dacl: dacl })
    }

    /// Attributes for `CreateProcessAsUser`. Valid while `self` lives.
    pub fn attributes(&mut self) -> SECURITY_ATTRIBUTES {
        SECURITY_ATTRIBUTES {
            nLength: mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: self.sd.as_mut() as *mut SECURITY_DESCRIPTOR as *mut c_void,
            bInheritHandle: 0,
        }
    }
}

/// Decides which engine options an unprivileged client may use. The rules
/// themselves live outside this crate's responsibility; the service only
/// enforces the verdict.
pub trait OptionPolicy: Send + Sync {
    /// `args[0]` is the option under test, the rest of the slice the
    /// remaining command line.
    fn check_option(&self, workdir: &str, args: &[String]) -> bool;
}

/// Baseline policy: a plain config file next to the working directory is
/// fine, anything else needs group membership.
pub struct ConfigFileOnlyPolicy;

impl OptionPolicy for ConfigFileOnlyPolicy {
    fn check_option(&self, _workdir: &str, args: &[String]) -> bool {
        if args.first().map(String::as_str) != Some("--config") {
            return false;
        }
        let Some(file) = args.get(1) else {
            return false;
        };
        // The config must resolve inside the working directory.
        !file.contains('/') && !file.contains('\\') && !file.contains("..")
    }
}

fn is_option(arg: &str) -> bool {
    arg.starts_with("--")
}

fn command_line_to_argv(options: &str) -> Option<Vec<String>> {
    if options.trim().is_empty() {
        return Some(Vec::new());
    }
    let wide = to_wide(options);
    let mut argc = 0i32;
    let argv = unsafe { CommandLineToArgvW(wide.as_ptr(), &mut argc) };
    if argv.is_null() {
        return None;
    }
    let mut out = Vec::with_capacity(argc as usize);
    for i in 0..argc as usize {
        let arg = unsafe { *argv.add(i) };
        let mut len = 0usize;
        while unsafe { *arg.add(len) } != 0 {
            len += 1;
        }
        out.push(String::from_utf16_lossy(unsafe {
            std::slice::from_raw_parts(arg, len)
        }));
    }
    unsafe { LocalFree(argv as *mut c_void) };
    Some(out)
}

/// Validate the option vector the client wants the engine started with.
///
/// A single bare argument is shorthand for `--config <arg>`. On rejection
/// the returned message names the offending option or config location and
/// the group that would have allowed it.
pub fn validate_options(
    policy: &dyn OptionPolicy,
    workdir: &str,
    options: &str,
    admin_group: &str,
) -> Result<(), String> {
    let config_msg = |file: &str| {
        format!(
            "You have specified a config file location ({file} relative to {workdir}) that \
             requires admin approval. This error may be avoided by adding your account to \
             the \"{admin_group}\" group"
        )
    };

    let Some(argv) = command_line_to_argv(options) else {
        return Err(format!(
            "Cannot validate options: parsing the command line failed with error = {:#010x}",
            last_error()
        ));
    };

    if argv.is_empty() {
        return Ok(());
    }

    if argv.len() == 1 {
        let args = vec!["--config".to_string(), argv[0].clone()];
        if !policy.check_option(workdir, &args) {
            return Err(config_msg(&argv[0]));
        }
        return Ok(());
    }

    for i in 0..argv.len() {
        if !is_option(&argv[i]) {
            continue;
        }
        if !policy.check_option(workdir, &argv[i..]) {
            if argv[i] == "--config" && argv.len() > i + 1 {
                return Err(config_msg(&argv[i + 1]));
            }
            return Err(format!(
                "You have specified an option ({}) that may be used only with admin \
                 approval. This error may be avoided by adding your account to the \
                 \"{admin_group}\" group",
                argv[i]
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_policy_allows_plain_config_names() {
        let policy = ConfigFileOnlyPolicy;
        let args = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        assert!(policy.check_option("C:\\cfg", &args(&["--config", "office.conf"])));
        assert!(!policy.check_option("C:\\cfg", &args(&["--config", "..\\other.conf"])));
        assert!(!policy.check_option("C:\\cfg", &args(&["--config", "C:\\evil.conf"])));
        assert!(!policy.check_option("C:\\cfg", &args(&["--up", "evil.bat"])));
        assert!(!policy.check_option("C:\\cfg", &args(&["--config"])));
    }

    #[test]
    fn option_prefix_detection() {
        assert!(is_option("--config"));
        assert!(!is_option("office.conf"));
        assert!(!is_option("-v"));
    }
}
