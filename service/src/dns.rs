//! Name-server and search-list management.
//!
//! Name servers are written to the per-interface `NameServer` registry
//! value. Search suffixes go wherever the effective `SearchList` lives:
//! the group-policy hive overrules the system-wide list, which overrules
//! per-interface lists, so the service probes in that order and edits the
//! first location holding a usable list. Before the first append to a
//! pre-existing list, the pristine value is parked in `InitialSearchList`
//! so it survives a crashed session and can be drained at next startup.
//!
//! After every mutation the resolver is told to reload: a WNF publish of
//! the group-policy-changes state name (only when the policy hive was
//! touched) plus a param-change control to the Dnscache service.

use std::ffi::c_void;
use std::net::IpAddr;
use std::ptr;

use log::{error, info, warn};
use windows_sys::Win32::Foundation::{ERROR_FILE_NOT_FOUND, ERROR_INSUFFICIENT_BUFFER, ERROR_INVALID_PARAMETER};
use windows_sys::Win32::NetworkManagement::IpHelper::ConvertInterfaceLuidToGuid;
use windows_sys::Win32::System::Services::{
    CloseServiceHandle, ControlService, OpenSCManagerW, OpenServiceW, SC_MANAGER_CONNECT,
    SERVICE_CONTROL_PARAMCHANGE, SERVICE_PAUSE_CONTINUE, SERVICE_STATUS,
};

use shared::constants::ERROR_MESSAGE_DATA;
use shared::protocol::{DnsCfgMessage, Family};

use crate::handles::{last_error, to_wide, RegKey, Win32Result};
use crate::net::interface_luid;
use crate::undo::{UndoKind, UndoLedger, UndoRecord};

const GPOL_KEY: &str = r"SOFTWARE\Policies\Microsoft\Windows NT\DNSClient";
const TCPIP_PARAMS_KEY: &str = r"System\CurrentControlSet\Services\TCPIP\Parameters";
const TCPIP_INTERFACES_KEY: &str = r"System\CurrentControlSet\Services\TCPIP\Parameters\Interfaces";
const TCPIP6_INTERFACES_KEY: &str = r"System\CurrentControlSet\Services\Tcpip6\Parameters\Interfaces";

/// `SearchList` values larger than this (in UTF-16 units, terminator
/// included) are rejected rather than truncated.
const MAX_SEARCH_LIST: usize = 2048;

/// Where a session's search-list edits land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsScope {
    GroupPolicy,
    SystemWide,
    Interface,
}

/// The registry location chosen for search-list edits, resolved fresh for
/// every DNS operation because a higher-precedence list may have appeared
/// between calls.
pub struct SearchListKey {
    pub key: RegKey,
    pub scope: DnsScope,
    /// Whether the location already holds a list that must be preserved.
    /// Interface scope never contributes an initial list.
    pub have_list: bool,
}

impl SearchListKey {
    pub fn gpol(&self) -> bool {
        self.scope == DnsScope::GroupPolicy
    }
}

/// The string interface id (GUID with braces) for an interface alias.
pub fn interface_id_string(alias: &str) -> Win32Result<String> {
    let luid = interface_luid(alias)?;
    let mut guid = windows_sys::core::GUID {
        data1: 0,
        data2: 0,
        data3: 0,
        data4: [0; 8],
    };
    let err = unsafe { ConvertInterfaceLuidToGuid(&luid, &mut guid) };
    if err != 0 {
        error!("could not convert interface '{alias}' to an id: {err}");
        return Err(err);
    }
    Ok(format!(
        "{{{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}}}",
        guid.data1,
        guid.data2,
        guid.data3,
        guid.data4[0],
        guid.data4[1],
        guid.data4[2],
        guid.data4[3],
        guid.data4[4],
        guid.data4[5],
        guid.data4[6],
        guid.data4[7],
    ))
}

/// A list is usable when it contains at least one domain-name character.
/// The point is to reject whitespace-only values, nothing stricter.
fn is_valid_search_list(list: &str) -> bool {
    list.chars().any(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

fn key_has_valid_search_list(key: &RegKey) -> bool {
    matches!(key.get_string("SearchList"), Ok(Some(list)) if is_valid_search_list(&list))
}

/// Probe group policy, then system-wide, then the per-interface key.
///
/// `None` means no location is available at all, which callers treat as an
/// unrecoverable error for the current operation.
pub fn open_search_list_key(alias: Option<&str>) -> Option<SearchListKey> {
    if let Ok(key) = RegKey::open_local_machine(GPOL_KEY) {
        if key_has_valid_search_list(&key) {
            return Some(SearchListKey { key, scope: DnsScope::GroupPolicy, have_list: true });
        }
    }

    if let Ok(key) = RegKey::open_local_machine(TCPIP_PARAMS_KEY) {
        if key_has_valid_search_list(&key) {
            return Some(SearchListKey { key, scope: DnsScope::SystemWide, have_list: true });
        }
    }

    let alias = alias?;
    let iid = interface_id_string(alias).ok()?;
    let interfaces = RegKey::open_local_machine(TCPIP_INTERFACES_KEY).ok()?;
    let key = interfaces.open_subkey(&iid).ok()?;
    Some(SearchListKey { key, scope: DnsScope::Interface, have_list: false })
}

fn initial_search_list_exists(key: &RegKey) -> bool {
    match key.get_string("InitialSearchList") {
        Ok(found) => found.is_some(),
        Err(err) => {
            // Unreadable is treated as present so we never overwrite it.
            error!("could not probe InitialSearchList: {err}");
            true
        }
    }
}

/// Park the pristine list so it can be restored later, unless a previous
/// session in this scope already did.
fn store_initial_search_list(key: &RegKey, list: &str) -> Win32Result<()> {
    if list.is_empty() {
        error!("refusing to store an empty initial search list");
        return Err(ERROR_INVALID_PARAMETER);
    }
    if initial_search_list_exists(key) {
        return Ok(());
    }
    key.set_string("InitialSearchList", list)
}

/// Append suffixes to the effective list, preserving the original first.
fn add_search_domains(key: &RegKey, have_list: bool, domains: &str) -> Win32Result<()> {
    let combined = if have_list {
        let list = key.get_string("SearchList")?.unwrap_or_default();
        store_initial_search_list(key, &list)?;

        let units = list.encode_utf16().count() + domains.encode_utf16().count() + 2;
        if units > MAX_SEARCH_LIST {
            error!("not enough space in the search list for '{domains}'");
            return Err(ERROR_INSUFFICIENT_BUFFER);
        }
        format!("{list},{domains}")
    } else {
        domains.to_string()
    };

    key.set_string("SearchList", &combined)
}

/// Cut `domains` (and its separator comma) out of `list`. `None` when the
/// suffixes are not part of the list.
fn splice_out_domains(list: &str, domains: &str) -> Option<String> {
    let pos = list.find(domains)?;
    let mut start = pos;
    let mut end = pos + domains.len();
    if start > 0 {
        // Take the comma in front.
        start -= 1;
    } else if list[end..].starts_with(',') {
        // Removed from the head; take the comma behind instead.
        end += 1;
    }
    Some(format!("{}{}", &list[..start], &list[end..]))
}

/// Put the parked list back and drop the marker. `false` when there was no
/// marker, meaning nothing was ever appended in this scope.
fn reset_search_domains(key: &RegKey) -> bool {
    let initial = match key.get_string("InitialSearchList") {
        Ok(Some(list)) => list,
        Ok(None) => return false,
        Err(err) => {
            error!("could not read InitialSearchList: {err}");
            return false;
        }
    };

    if let Err(err) = key.set_string("SearchList", &initial) {
        error!("could not restore SearchList: {err}");
        return false;
    }
    let _ = key.delete_value("InitialSearchList");
    true
}

/// Remove suffixes this session appended. When the shortened list equals
/// the parked original, the original is restored and the marker removed.
fn remove_search_domains(key: &RegKey, domains: &str) {
    let list = match key.get_string("SearchList") {
        Ok(Some(list)) => list,
        Ok(None) => return,
        Err(err) => {
            error!("could not read SearchList: {err}");
            return;
        }
    };

    let Some(spliced) = splice_out_domains(&list, domains) else {
        error!("could not find '{domains}' in the search list");
        return;
    };

    if !spliced.is_empty() {
        match key.get_string("InitialSearchList") {
            Ok(Some(initial)) if spliced == initial => {
                reset_search_domains(key);
                return;
            }
            Ok(_) => {}
            Err(err) => {
                error!("could not read InitialSearchList: {err}");
                return;
            }
        }
    }

    if let Err(err) = key.set_string("SearchList", &spliced) {
        error!("could not write SearchList: {err}");
    }
}

/// Undo path for a domains record: the scope is re-resolved by alias since
/// it may have been created or emptied since the append.
pub fn undo_search_domains(alias: &str, domains: &str) {
    if let Some(slk) = open_search_list_key(Some(alias)) {
        remove_search_domains(&slk.key, domains);
        apply_dns_settings(slk.gpol());
    }
}

fn interfaces_key(family: Family) -> Win32Result<RegKey> {
    let path = match family {
        Family::V4 => TCPIP_INTERFACES_KEY,
        Family::V6 => TCPIP6_INTERFACES_KEY,
    };
    RegKey::open_local_machine(path).map_err(|err| {
        error!("could not open interfaces registry key for {family}: {err}");
        err
    })
}

fn set_name_servers_value(iface_id: &str, family: Family, value: &str) -> u32 {
    let itfs = match interfaces_key(family) {
        Ok(key) => key,
        Err(err) => return err,
    };
    let itf = match itfs.open_subkey(iface_id) {
        Ok(key) => key,
        Err(err) => {
            error!("could not open interface key {iface_id} for {family}: {err}");
            return err;
        }
    };
    match itf.set_string("NameServer", value) {
        Ok(()) => 0,
        Err(err) => {
            error!("could not set name servers '{value}' for {iface_id}: {err}");
            err
        }
    }
}

pub fn set_name_servers(iface_id: &str, family: Family, addrs: &str) -> u32 {
    set_name_servers_value(iface_id, family, addrs)
}

pub fn reset_name_servers(iface_id: &str, family: Family) -> u32 {
    set_name_servers_value(iface_id, family, "")
}

#[cfg(target_pointer_width = "64")]
#[link(name = "ntdll")]
extern "system" {
    fn RtlPublishWnfStateData(
        state_name: u64,
        type_id: *const c_void,
        buffer: *const c_void,
        length: u32,
        explicit_scope: *const c_void,
    ) -> i32;
}

#[cfg(target_pointer_width = "64")]
fn publish_gpol_notification() -> bool {
    let status = unsafe {
        RtlPublishWnfStateData(
            shared::constants::WNF_GPOL_SYSTEM_CHANGES,
            ptr::null(),
            ptr::null(),
            0,
            ptr::null(),
        )
    };
    status == 0
}

#[cfg(target_pointer_width = "32")]
#[link(name = "ntdll")]
extern "system" {
    fn RtlPublishWnfStateData(
        state_name_lo: u32,
        state_name_hi: u32,
        type_id: u32,
        buffer: u32,
        length: u32,
        explicit_scope: u32,
    ) -> i32;
}

#[cfg(target_pointer_width = "32")]
fn publish_gpol_notification() -> bool {
    let status = unsafe {
        RtlPublishWnfStateData(
            shared::constants::WNF_GPOL_SYSTEM_CHANGES_LO,
            shared::constants::WNF_GPOL_SYSTEM_CHANGES_HI,
            0,
            0,
            0,
            0,
        )
    };
    status == 0
}

/// Tell the resolver to reload its settings. `gpol` additionally publishes
/// the group-policy notification so the policy hive is re-read.
pub fn apply_dns_settings(gpol: bool) {
    if gpol && !publish_gpol_notification() {
        error!("sending the group-policy change notification failed");
    }

    unsafe {
        let scm = OpenSCManagerW(ptr::null(), ptr::null(), SC_MANAGER_CONNECT);
        if scm.is_null() {
            error!("could not connect to the service manager: {}", last_error());
            return;
        }

        let name = to_wide("Dnscache");
        let dnssvc = OpenServiceW(scm, name.as_ptr(), SERVICE_PAUSE_CONTINUE);
        if dnssvc.is_null() {
            error!("could not open the DNS cache service: {}", last_error());
            CloseServiceHandle(scm);
            return;
        }

        let mut status: SERVICE_STATUS = std::mem::zeroed();
        if ControlService(dnssvc, SERVICE_CONTROL_PARAMCHANGE, &mut status) == 0 {
            error!("could not notify the DNS cache service: {}", last_error());
        }

        CloseServiceHandle(dnssvc);
        CloseServiceHandle(scm);
    }
}

pub(crate) fn make_addr_list(addrs: &[IpAddr]) -> String {
    addrs
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Install or remove search domains for an interface, tracking the change
/// in the ledger. An empty or absent `domains` only removes what this
/// session previously appended.
fn set_search_domains(
    alias: &str,
    domains: Option<&str>,
    gpol: &mut bool,
    ledger: &mut UndoLedger,
) -> u32 {
    let Some(slk) = open_search_list_key(Some(alias)) else {
        error!("could not locate a search list registry key for '{alias}'");
        return ERROR_FILE_NOT_FOUND;
    };
    *gpol = slk.gpol();

    // Whatever this session appended before is removed first; repeated adds
    // replace, they do not accumulate.
    if let Some(UndoRecord::DnsDomains { domains: old, .. }) =
        ledger.remove_matching(UndoKind::DnsDomains, |_| true)
    {
        remove_search_domains(&slk.key, &old);
    }

    if let Some(domains) = domains.filter(|d| !d.is_empty()) {
        if let Err(err) = add_search_domains(&slk.key, slk.have_list, domains) {
            return err;
        }
        ledger.append(UndoRecord::DnsDomains {
            iface_alias: alias.to_string(),
            domains: domains.to_string(),
        });
    }

    0
}

/// The add/del DNS configuration handler.
///
/// Name servers for the (interface, family) pair are reset before anything
/// else; the fresh list (if any) is then written and recorded per family.
/// Search domains piggyback on the same message and follow the scope rules
/// above. The resolver reload runs even on the delete path.
pub fn handle_dns_cfg(msg: &DnsCfgMessage, add: bool, ledger: &mut UndoLedger) -> u32 {
    if msg.iface.name.is_empty() {
        return ERROR_MESSAGE_DATA;
    }

    let iid = match interface_id_string(&msg.iface.name) {
        Ok(iid) => iid,
        Err(err) => return err,
    };
    let kind = match msg.family {
        Family::V4 => UndoKind::DnsV4,
        Family::V6 => UndoKind::DnsV6,
    };

    if !msg.addrs.is_empty() || !add {
        let err = reset_name_servers(&iid, msg.family);
        if err != 0 {
            return err;
        }
        // One slot per family: whatever was recorded before is superseded.
        ledger.remove_matching(kind, |_| true);
    }

    if !add {
        let mut gpol = false;
        let mut err = 0;
        if !msg.domains.is_empty() {
            // A non-empty field on the delete path clears what was added.
            err = set_search_domains(&msg.iface.name, None, &mut gpol, ledger);
        }
        apply_dns_settings(gpol);
        return err;
    }

    if !msg.addrs.is_empty() {
        let addrs = make_addr_list(&msg.addrs);
        let err = set_name_servers(&iid, msg.family, &addrs);
        if err != 0 {
            return err;
        }
        ledger.append(UndoRecord::DnsServers { family: msg.family, iface_id: iid });
        info!("name servers for {} ({}) set to {addrs}", msg.iface.name, msg.family);
    }

    let mut gpol = false;
    let mut err = 0;
    if !msg.domains.is_empty() {
        err = set_search_domains(&msg.iface.name, Some(&msg.domains), &mut gpol, ledger);
    }
    apply_dns_settings(gpol);

    err
}

/// Startup pass draining leftovers of crashed sessions: if any scope still
/// parks an `InitialSearchList`, restore it and tell the resolver.
pub fn cleanup_registry() {
    let Some(slk) = open_search_list_key(None) else {
        return;
    };
    if reset_search_domains(&slk.key) {
        warn!("restored a search list left behind by an earlier session");
        apply_dns_settings(slk.gpol());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_only_lists_are_not_valid() {
        assert!(!is_valid_search_list(""));
        assert!(!is_valid_search_list("  \t,"));
        assert!(is_valid_search_list("corp.example"));
        assert!(is_valid_search_list("x"));
        assert!(is_valid_search_list("-"));
    }

    #[test]
    fn splice_removes_tail_suffix_and_comma() {
        assert_eq!(
            splice_out_domains("corp.example,vpn.example", "vpn.example").as_deref(),
            Some("corp.example")
        );
    }

    #[test]
    fn splice_removes_sole_entry() {
        assert_eq!(splice_out_domains("vpn.example", "vpn.example").as_deref(), Some(""));
    }

    #[test]
    fn splice_removes_head_entry_with_following_comma() {
        assert_eq!(
            splice_out_domains("vpn.example,corp.example", "vpn.example").as_deref(),
            Some("corp.example")
        );
    }

    #[test]
    fn splice_reports_missing_suffix() {
        assert_eq!(splice_out_domains("corp.example", "vpn.example"), None);
    }

    #[test]
    fn addr_list_is_comma_separated() {
        let addrs: Vec<IpAddr> =
            vec!["10.8.0.1".parse().unwrap(), "10.8.0.2".parse().unwrap()];
        assert_eq!(make_addr_list(&addrs), "10.8.0.1,10.8.0.2");

        let v6: Vec<IpAddr> = vec!["fd00::1".parse().unwrap()];
        assert_eq!(make_addr_list(&v6), "fd00::1");
    }
}
