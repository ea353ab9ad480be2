//! Per-session ledger of reversible side effects.
//!
//! Each successful mutating request appends exactly one record; a matching
//! delete request removes it again. Whatever is left when the session ends
//! is replayed in reverse insertion order, kind by kind. Records are
//! self-contained: they hold interface indices, aliases and registry ids,
//! never borrowed OS handles that could dangle (the one owned handle, the
//! filter engine inside a WFP record, is released with the record).

use log::{info, warn};
use strum_macros::Display;

use shared::protocol::Family;

use crate::net::{AddressRow, RouteRow};
use crate::rings::RingMaps;
use crate::wfp::BlockUndo;
use crate::{dns, net, wfp, wins};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum UndoKind {
    Address,
    Route,
    WfpBlock,
    DnsV4,
    DnsV6,
    DnsDomains,
    Wins,
    RingBuffer,
}

const KIND_ORDER: [UndoKind; 8] = [
    UndoKind::Address,
    UndoKind::Route,
    UndoKind::WfpBlock,
    UndoKind::DnsV4,
    UndoKind::DnsV6,
    UndoKind::DnsDomains,
    UndoKind::Wins,
    UndoKind::RingBuffer,
];

pub enum UndoRecord {
    Address(AddressRow),
    Route(RouteRow),
    WfpBlock(BlockUndo),
    /// Name servers were written for this interface id and family; undo
    /// clears the per-interface `NameServer` value.
    DnsServers { family: Family, iface_id: String },
    /// Search suffixes appended for this interface; undo re-resolves the
    /// scope by alias and splices them out again.
    DnsDomains { iface_alias: String, domains: String },
    Wins { iface_alias: String },
    RingBuffers(RingMaps),
}

impl UndoRecord {
    pub fn kind(&self) -> UndoKind {
        match self {
            UndoRecord::Address(_) => UndoKind::Address,
            UndoRecord::Route(_) => UndoKind::Route,
            UndoRecord::WfpBlock(_) => UndoKind::WfpBlock,
            UndoRecord::DnsServers { family: Family::V4, .. } => UndoKind::DnsV4,
            UndoRecord::DnsServers { family: Family::V6, .. } => UndoKind::DnsV6,
            UndoRecord::DnsDomains { .. } => UndoKind::DnsDomains,
            UndoRecord::Wins { .. } => UndoKind::Wins,
            UndoRecord::RingBuffers(_) => UndoKind::RingBuffer,
        }
    }
}

/// Single-owner per session; never shared across sessions.
#[derive(Default)]
pub struct UndoLedger {
    stacks: [Vec<UndoRecord>; KIND_ORDER.len()],
}

fn slot(kind: UndoKind) -> usize {
    KIND_ORDER.iter().position(|&k| k == kind).unwrap_or(0)
}

impl UndoLedger {
    pub fn new() -> Self {
        UndoLedger::default()
    }

    pub fn append(&mut self, record: UndoRecord) {
        self.stacks[slot(record.kind())].push(record);
    }

    /// Remove the most recently appended record of `kind` matching the
    /// predicate, if any.
    pub fn remove_matching<F>(&mut self, kind: UndoKind, pred: F) -> Option<UndoRecord>
    where
        F: Fn(&UndoRecord) -> bool,
    {
        let stack = &mut self.stacks[slot(kind)];
        let idx = stack.iter().rposition(pred)?;
        Some(stack.remove(idx))
    }

    pub fn is_empty(&self, kind: UndoKind) -> bool {
        self.stacks[slot(kind)].is_empty()
    }

    /// Drain every record, LIFO within each kind.
    pub fn drain(&mut self) -> impl Iterator<Item = UndoRecord> + '_ {
        self.stacks.iter_mut().flat_map(|stack| stack.drain(..).rev())
    }
}

/// Replay everything left in the ledger. Failures are logged and do not stop
/// the replay; each record is an independent side effect.
pub fn undo_all(ledger: &mut UndoLedger) {
    for record in ledger.drain() {
        let kind = record.kind();
        info!("undoing {kind}");
        match record {
            UndoRecord::Address(row) => {
                let err = net::delete_address_row(&row);
                if err != 0 {
                    warn!("failed to remove address: {err}");
                }
            }
            UndoRecord::Route(row) => {
                let err = net::delete_route_row(&row);
                if err != 0 {
                    warn!("failed to remove route: {err}");
                }
            }
            UndoRecord::WfpBlock(block) => wfp::undo_block(block),
            UndoRecord::DnsServers { family, iface_id } => {
                let err = dns::reset_name_servers(&iface_id, family);
                if err != 0 {
                    warn!("failed to reset name servers on {iface_id}: {err}");
                }
            }
            UndoRecord::DnsDomains { iface_alias, domains } => {
                dns::undo_search_domains(&iface_alias, &domains);
            }
            UndoRecord::Wins { iface_alias } => {
                let err = wins::netsh_wins_cmd("delete", &iface_alias, None);
                if err != 0 {
                    warn!("failed to reset WINS on {iface_alias}: {err}");
                }
            }
            UndoRecord::RingBuffers(maps) => {
                // Dropping the maps unmaps both views.
                drop(maps);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dns(iface: &str, family: Family) -> UndoRecord {
        UndoRecord::DnsServers { family, iface_id: iface.to_string() }
    }

    fn wins(iface: &str) -> UndoRecord {
        UndoRecord::Wins { iface_alias: iface.to_string() }
    }

    fn id(record: &UndoRecord) -> String {
        match record {
            UndoRecord::DnsServers { iface_id, .. } => iface_id.clone(),
            UndoRecord::Wins { iface_alias } => iface_alias.clone(),
            _ => unreachable!("test records only"),
        }
    }

    #[test]
    fn drain_is_lifo_within_a_kind() {
        let mut ledger = UndoLedger::new();
        ledger.append(dns("a", Family::V4));
        ledger.append(dns("b", Family::V4));
        ledger.append(dns("c", Family::V4));

        let order: Vec<String> = ledger.drain().map(|r| id(&r)).collect();
        assert_eq!(order, ["c", "b", "a"]);
    }

    #[test]
    fn families_land_in_separate_kinds() {
        let mut ledger = UndoLedger::new();
        ledger.append(dns("four", Family::V4));
        ledger.append(dns("six", Family::V6));

        assert!(!ledger.is_empty(UndoKind::DnsV4));
        assert!(!ledger.is_empty(UndoKind::DnsV6));
        assert!(ledger
            .remove_matching(UndoKind::DnsV6, |_| true)
            .is_some());
        assert!(ledger.is_empty(UndoKind::DnsV6));
        assert!(!ledger.is_empty(UndoKind::DnsV4));
    }

    #[test]
    fn remove_matching_takes_the_most_recent_match() {
        let mut ledger = UndoLedger::new();
        ledger.append(wins("tun0"));
        ledger.append(wins("tun1"));
        ledger.append(wins("tun0"));

        let removed = ledger.remove_matching(UndoKind::Wins, |r| id(r) == "tun0");
        assert!(removed.is_some());
        // The earlier tun0 record is still there, behind tun1.
        let order: Vec<String> = ledger.drain().map(|r| id(&r)).collect();
        assert_eq!(order, ["tun1", "tun0"]);
    }

    #[test]
    fn successful_add_then_del_leaves_kind_empty() {
        let mut ledger = UndoLedger::new();
        ledger.append(wins("tun0"));
        ledger.remove_matching(UndoKind::Wins, |r| id(r) == "tun0");
        assert!(ledger.is_empty(UndoKind::Wins));
        assert_eq!(ledger.drain().count(), 0);
    }
}
