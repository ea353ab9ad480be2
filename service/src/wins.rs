//! WINS configuration, driven through netsh.
//!
//! Unlike DNS there is no registry shortcut worth taking here; netsh is the
//! supported interface and the timeout budget covers its slow starts.

use log::error;

use shared::constants::NETSH_TIMEOUT_MS;
use shared::protocol::WinsCfgMessage;

use crate::exec::{run_command, system_binary};
use crate::undo::{UndoKind, UndoLedger, UndoRecord};

/// `netsh interface ip <action> wins "<alias>" [static] <addr>`.
///
/// `addr == None` with action `delete` clears all addresses; with any other
/// action there is nothing to do. Action `set` inserts `static` before the
/// address.
fn wins_cmdline(action: &str, alias: &str, addr: Option<&str>) -> Option<String> {
    let addr = match addr {
        Some(addr) => addr,
        None if action == "delete" => "all",
        None => return None,
    };
    let addr_static = if action == "set" { "static " } else { "" };
    Some(format!(
        "netsh interface ip {action} wins \"{alias}\" {addr_static}{addr}"
    ))
}

pub fn netsh_wins_cmd(action: &str, alias: &str, addr: Option<&str>) -> u32 {
    match wins_cmdline(action, alias, addr) {
        Some(cmdline) => run_command(&system_binary("netsh.exe"), &cmdline, NETSH_TIMEOUT_MS),
        None => 0,
    }
}

/// The add/del WINS handler. Existing addresses are cleared before any new
/// ones are applied; the first new address uses `set`, later ones `add`,
/// and failures past the first are ignored since duplicates are expected.
pub fn handle_wins_cfg(msg: &WinsCfgMessage, add: bool, ledger: &mut UndoLedger) -> u32 {
    if msg.iface.name.is_empty() {
        return shared::constants::ERROR_MESSAGE_DATA;
    }
    let alias = msg.iface.name.as_str();

    if !msg.addrs.is_empty() || !add {
        let err = netsh_wins_cmd("delete", alias, None);
        if err != 0 {
            return err;
        }
        ledger.remove_matching(UndoKind::Wins, |rec| {
            matches!(rec, UndoRecord::Wins { iface_alias } if iface_alias == alias)
        });
    }

    if !add {
        return 0;
    }

    for (i, addr) in msg.addrs.iter().enumerate() {
        let action = if i == 0 { "set" } else { "add" };
        let err = netsh_wins_cmd(action, alias, Some(&addr.to_string()));
        if i == 0 && err != 0 {
            return err;
        }
        if err != 0 {
            error!("ignoring failure to add extra WINS address {addr}: {err}");
        }
    }

    if !msg.addrs.is_empty() {
        ledger.append(UndoRecord::Wins { iface_alias: alias.to_string() });
    }

    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_inserts_static_before_the_address() {
        assert_eq!(
            wins_cmdline("set", "tun0", Some("10.8.0.1")).unwrap(),
            "netsh interface ip set wins \"tun0\" static 10.8.0.1"
        );
    }

    #[test]
    fn delete_without_address_clears_all() {
        assert_eq!(
            wins_cmdline("delete", "tun0", None).unwrap(),
            "netsh interface ip delete wins \"tun0\" all"
        );
    }

    #[test]
    fn add_without_address_is_a_no_op() {
        assert_eq!(wins_cmdline("add", "tun0", None), None);
    }
}
