//! Address, route, neighbor-cache, DHCP and MTU actuation.
//!
//! Handlers return a Win32 error code (0 on success) which the session puts
//! straight into the ack. A failed OS call leaves the ledger untouched; a
//! successful add appends exactly one record.

use std::mem;
use std::net::IpAddr;

use windows_sys::Win32::NetworkManagement::IpHelper::{
    ConvertInterfaceAliasToLuid, CreateIpForwardEntry2, CreateUnicastIpAddressEntry,
    DeleteIpForwardEntry2, DeleteUnicastIpAddressEntry, FlushIpNetTable, FlushIpNetTable2,
    GetIpInterfaceEntry, InitializeIpInterfaceEntry, InitializeUnicastIpAddressEntry,
    SetIpInterfaceEntry, MIB_IPFORWARD_ROW2, MIB_IPINTERFACE_ROW,
    MIB_UNICASTIPADDRESS_ROW,
};
use windows_sys::Win32::NetworkManagement::Ndis::NET_LUID_LH;
use windows_sys::Win32::Networking::WinSock::{AF_INET, AF_INET6, MIB_IPPROTO_NETMGMT, SOCKADDR_INET};

use shared::protocol::{
    AddressMessage, EnableDhcpMessage, Family, FlushNeighborsMessage, Iface, RouteMessage,
    SetMtuMessage,
};

use crate::exec;
use crate::handles::{to_wide, Win32Result};
use crate::undo::{UndoKind, UndoLedger, UndoRecord};

/// Route rows never expire on their own.
const INFINITE_LIFETIME: u32 = 0xffff_ffff;

pub fn sockaddr_inet(addr: &IpAddr) -> SOCKADDR_INET {
    let mut sa: SOCKADDR_INET = unsafe { mem::zeroed() };
    match addr {
        IpAddr::V4(v4) => {
            sa.Ipv4.sin_family = AF_INET;
            sa.Ipv4.sin_addr.S_un.S_addr = u32::from_ne_bytes(v4.octets());
        }
        IpAddr::V6(v6) => {
            sa.Ipv6.sin6_family = AF_INET6;
            sa.Ipv6.sin6_addr.u.Byte = v6.octets();
        }
    }
    sa
}

/// Resolve an interface alias to its LUID.
pub fn interface_luid(alias: &str) -> Win32Result<NET_LUID_LH> {
    let wide = to_wide(alias);
    let mut luid: NET_LUID_LH = unsafe { mem::zeroed() };
    let status = unsafe { ConvertInterfaceAliasToLuid(wide.as_ptr(), &mut luid) };
    if status != 0 {
        return Err(status);
    }
    Ok(luid)
}

fn struct_bytes<T>(v: &T) -> &[u8] {
    // Rows are compared whole, the same way they were built.
    unsafe { std::slice::from_raw_parts(v as *const T as *const u8, mem::size_of::<T>()) }
}

/// A unicast address row, ready to be created or deleted.
pub struct AddressRow(MIB_UNICASTIPADDRESS_ROW);

impl AddressRow {
    fn from_message(msg: &AddressMessage) -> Win32Result<AddressRow> {
        let mut row: MIB_UNICASTIPADDRESS_ROW = unsafe { mem::zeroed() };
        unsafe { InitializeUnicastIpAddressEntry(&mut row) };
        row.Address = sockaddr_inet(&msg.address);
        row.OnLinkPrefixLength = msg.prefix_len;
        if msg.iface.has_index() {
            row.InterfaceIndex = msg.iface.index as u32;
        } else {
            row.InterfaceLuid = interface_luid(&msg.iface.name)?;
        }
        Ok(AddressRow(row))
    }

    fn same_row(&self, other: &AddressRow) -> bool {
        struct_bytes(&self.0) == struct_bytes(&other.0)
    }
}

pub fn delete_address_row(row: &AddressRow) -> u32 {
    unsafe { DeleteUnicastIpAddressEntry(&row.0) }
}

pub fn handle_address(msg: &AddressMessage, add: bool, ledger: &mut UndoLedger) -> u32 {
    let row = match AddressRow::from_message(msg) {
        Ok(row) => row,
        Err(err) => return err,
    };

    if add {
        let err = unsafe { CreateUnicastIpAddressEntry(&row.0) };
        if err != 0 {
            return err;
        }
        ledger.append(UndoRecord::Address(row));
    } else {
        let err = delete_address_row(&row);
        if err != 0 {
            return err;
        }
        ledger.remove_matching(UndoKind::Address, |rec| {
            matches!(rec, UndoRecord::Address(other) if other.same_row(&row))
        });
    }
    0
}

/// A forwarding-table row, ready to be created or deleted.
pub struct RouteRow(MIB_IPFORWARD_ROW2);

impl RouteRow {
    fn from_message(msg: &RouteMessage) -> Win32Result<RouteRow> {
        let mut row: MIB_IPFORWARD_ROW2 = unsafe { mem::zeroed() };
        row.ValidLifetime = INFINITE_LIFETIME;
        row.PreferredLifetime = INFINITE_LIFETIME;
        row.Protocol = MIB_IPPROTO_NETMGMT;
        row.Metric = msg.metric;
        row.DestinationPrefix.Prefix = sockaddr_inet(&msg.prefix);
        row.DestinationPrefix.PrefixLength = msg.prefix_len;
        row.NextHop = sockaddr_inet(&msg.gateway);

        if msg.iface.has_index() {
            row.InterfaceIndex = msg.iface.index as u32;
        } else if !msg.iface.name.is_empty() {
            row.InterfaceLuid = interface_luid(&msg.iface.name)?;
        }
        // Neither index nor alias: the stack picks the interface from the
        // gateway.
        Ok(RouteRow(row))
    }

    fn same_row(&self, other: &RouteRow) -> bool {
        struct_bytes(&self.0) == struct_bytes(&other.0)
    }
}

pub fn delete_route_row(row: &RouteRow) -> u32 {
    unsafe { DeleteIpForwardEntry2(&row.0) }
}

pub fn handle_route(msg: &RouteMessage, add: bool, ledger: &mut UndoLedger) -> u32 {
    let row = match RouteRow::from_message(msg) {
        Ok(row) => row,
        Err(err) => return err,
    };

    if add {
        let err = unsafe { CreateIpForwardEntry2(&row.0) };
        if err != 0 {
            return err;
        }
        ledger.append(UndoRecord::Route(row));
    } else {
        let err = delete_route_row(&row);
        if err != 0 {
            return err;
        }
        ledger.remove_matching(UndoKind::Route, |rec| {
            matches!(rec, UndoRecord::Route(other) if other.same_row(&row))
        });
    }
    0
}

/// Neighbor-cache flush. Ephemeral, so nothing is recorded for undo.
pub fn handle_flush_neighbors(msg: &FlushNeighborsMessage) -> u32 {
    match msg.family {
        Family::V4 => unsafe { FlushIpNetTable(msg.iface.index as u32) },
        Family::V6 => unsafe { FlushIpNetTable2(msg.family.raw(), msg.iface.index as u32) },
    }
}

pub(crate) fn dhcp_cmdline(iface: &Iface) -> String {
    format!(
        "netsh interface ipv4 set address name=\"{}\" source=dhcp",
        iface.index
    )
}

/// Hand the interface back to DHCP. May fail when DHCP is already active,
/// which callers treat as non-fatal. Not undone at session end.
pub fn handle_enable_dhcp(msg: &EnableDhcpMessage) -> u32 {
    exec::run_command(&exec::system_binary("netsh.exe"), &dhcp_cmdline(&msg.iface), 5000)
}

pub fn handle_set_mtu(msg: &SetMtuMessage) -> u32 {
    let mut row: MIB_IPINTERFACE_ROW = unsafe { mem::zeroed() };
    unsafe { InitializeIpInterfaceEntry(&mut row) };
    row.Family = msg.family.raw();
    row.InterfaceIndex = msg.iface.index as u32;

    let err = unsafe { GetIpInterfaceEntry(&mut row) };
    if err != 0 {
        return err;
    }
    if msg.family == Family::V4 {
        // SetIpInterfaceEntry rejects IPv4 rows with a site prefix set.
        row.SitePrefixLength = 0;
    }
    row.NlMtu = msg.mtu;
    unsafe { SetIpInterfaceEntry(&mut row) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dhcp_command_uses_the_interface_index() {
        let cmd = dhcp_cmdline(&Iface::by_index(17));
        assert_eq!(
            cmd,
            "netsh interface ipv4 set address name=\"17\" source=dhcp"
        );
    }
}
