//! Firewall block filters and interface-metric handling.
//!
//! Filters live in a dynamic filter-engine session, so the engine handle in
//! the undo record is the teardown: closing it removes every filter the
//! session installed. While a block is active both interface metrics are
//! pinned low so the tunnel interface wins route selection; the previous
//! metrics travel in the undo record (`-1` for "was automatic") and are put
//! back when the block is removed.

use std::mem;
use std::path::Path;
use std::ptr;

use log::{debug, error, info, warn};
use windows_sys::core::GUID;
use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::NetworkManagement::IpHelper::{
    ConvertInterfaceIndexToLuid, GetIpInterfaceEntry, InitializeIpInterfaceEntry,
    SetIpInterfaceEntry, MIB_IPINTERFACE_ROW,
};
use windows_sys::Win32::NetworkManagement::Ndis::NET_LUID_LH;
use windows_sys::Win32::NetworkManagement::WindowsFilteringPlatform::{
    FwpmEngineClose0, FwpmEngineOpen0, FwpmFilterAdd0, FwpmFreeMemory0, FwpmGetAppIdFromFileName0,
    FwpmSubLayerAdd0, FWPM_ACTION0, FWPM_CONDITION_ALE_APP_ID, FWPM_CONDITION_FLAGS,
    FWPM_CONDITION_IP_LOCAL_INTERFACE, FWPM_CONDITION_IP_REMOTE_PORT, FWPM_DISPLAY_DATA0,
    FWPM_FILTER0, FWPM_FILTER_CONDITION0, FWPM_LAYER_ALE_AUTH_CONNECT_V4,
    FWPM_LAYER_ALE_AUTH_CONNECT_V6, FWPM_SESSION0, FWPM_SESSION_FLAG_DYNAMIC, FWPM_SUBLAYER0,
    FWP_ACTION_BLOCK, FWP_ACTION_PERMIT, FWP_BYTE_BLOB, FWP_BYTE_BLOB_TYPE,
    FWP_CONDITION_FLAG_IS_LOOPBACK, FWP_CONDITION_VALUE0, FWP_MATCH_EQUAL, FWP_MATCH_FLAGS_ALL_SET,
    FWP_UINT16, FWP_UINT32, FWP_UINT64, FWP_UINT8, FWP_VALUE0,
};

use shared::protocol::{Family, WfpBlockMessage};

use crate::handles::{to_wide, Win32Result};
use crate::undo::{UndoKind, UndoLedger, UndoRecord};

/// Metric pinned on the tunnel interface while a block is active.
pub const BLOCK_IFACE_METRIC: u32 = 3;

const RPC_C_AUTHN_WINNT: u32 = 10;
const FWP_E_ALREADY_EXISTS: u32 = 0x8032_0009;
const DNS_PORT: u16 = 53;

/// Sublayer all block-session filters hang off. Adding it twice is fine;
/// each session tolerates "already exists".
const BLOCK_SUBLAYER_KEY: GUID = GUID::from_u128(0x1e2f9c63_7a54_4b91_8d3c_52a1e60b94d7);

/// Open filter-engine session. The session is dynamic: every filter added
/// through it disappears when the handle closes, which is exactly the
/// teardown guarantee the undo ledger needs.
pub struct FilterEngine(HANDLE);

unsafe impl Send for FilterEngine {}

impl Drop for FilterEngine {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { FwpmEngineClose0(self.0) };
            self.0 = ptr::null_mut();
        }
    }
}

/// Undo record for one installed block: the engine session owning the
/// filters plus the metrics to put back.
pub struct BlockUndo {
    pub engine: FilterEngine,
    pub iface_index: u32,
    pub metric_v4: i32,
    pub metric_v6: i32,
}

fn interface_row(index: u32, family: Family) -> Win32Result<MIB_IPINTERFACE_ROW> {
    let mut row: MIB_IPINTERFACE_ROW = unsafe { mem::zeroed() };
    unsafe { InitializeIpInterfaceEntry(&mut row) };
    row.Family = family.raw();
    row.InterfaceIndex = index;
    let err = unsafe { GetIpInterfaceEntry(&mut row) };
    if err != 0 {
        return Err(err);
    }
    Ok(row)
}

/// Current metric of an interface, `-1` when it is automatic (or cannot be
/// read, e.g. because the address family is disabled on the interface).
pub fn get_interface_metric(index: u32, family: Family) -> i32 {
    match interface_row(index, family) {
        Ok(row) if row.UseAutomaticMetric != 0 => -1,
        Ok(row) => row.Metric as i32,
        Err(err) => {
            debug!("could not read {family} metric of interface {index}: {err}");
            -1
        }
    }
}

/// Set an interface metric; 0 switches back to automatic.
pub fn set_interface_metric(index: u32, family: Family, metric: u32) -> u32 {
    let mut row = match interface_row(index, family) {
        Ok(row) => row,
        Err(err) => return err,
    };
    if metric == 0 {
        row.UseAutomaticMetric = 1;
    } else {
        row.UseAutomaticMetric = 0;
        row.Metric = metric;
    }
    if family == Family::V4 {
        row.SitePrefixLength = 0;
    }
    unsafe { SetIpInterfaceEntry(&mut row) }
}

fn uint8_weight(weight: u8) -> FWP_VALUE0 {
    let mut value: FWP_VALUE0 = unsafe { mem::zeroed() };
    value.r#type = FWP_UINT8;
    value.Anonymous.uint8 = weight;
    value
}

struct FilterSpec {
    name: String,
    layer: GUID,
    action: u32,
    weight: u8,
    conditions: Vec<FWPM_FILTER_CONDITION0>,
}

fn add_filter(engine: &FilterEngine, spec: &FilterSpec) -> Win32Result<()> {
    let name = to_wide(&spec.name);
    let mut filter: FWPM_FILTER0 = unsafe { mem::zeroed() };
    filter.displayData = FWPM_DISPLAY_DATA0 {
        name: name.as_ptr() as *mut u16,
        description: ptr::null_mut(),
    };
    filter.layerKey = spec.layer;
    filter.subLayerKey = BLOCK_SUBLAYER_KEY;
    filter.weight = uint8_weight(spec.weight);
    filter.numFilterConditions = spec.conditions.len() as u32;
    filter.filterCondition = spec.conditions.as_ptr() as *mut FWPM_FILTER_CONDITION0;
    filter.action = FWPM_ACTION0 {
        r#type: spec.action,
        Anonymous: unsafe { mem::zeroed() },
    };

    let mut filter_id = 0u64;
    let err = unsafe { FwpmFilterAdd0(engine.0, &filter, ptr::null_mut(), &mut filter_id) };
    if err != 0 {
        error!("could not add filter '{}': {err:#010x}", spec.name);
        return Err(err);
    }
    Ok(())
}

fn app_id_condition(app_id: *mut FWP_BYTE_BLOB) -> FWPM_FILTER_CONDITION0 {
    let mut value: FWP_CONDITION_VALUE0 = unsafe { mem::zeroed() };
    value.r#type = FWP_BYTE_BLOB_TYPE;
    value.Anonymous.byteBlob = app_id;
    FWPM_FILTER_CONDITION0 {
        fieldKey: FWPM_CONDITION_ALE_APP_ID,
        matchType: FWP_MATCH_EQUAL,
        conditionValue: value,
    }
}

fn dns_port_condition() -> FWPM_FILTER_CONDITION0 {
    let mut value: FWP_CONDITION_VALUE0 = unsafe { mem::zeroed() };
    value.r#type = FWP_UINT16;
    value.Anonymous.uint16 = DNS_PORT;
    FWPM_FILTER_CONDITION0 {
        fieldKey: FWPM_CONDITION_IP_REMOTE_PORT,
        matchType: FWP_MATCH_EQUAL,
        conditionValue: value,
    }
}

fn loopback_condition() -> FWPM_FILTER_CONDITION0 {
    let mut value: FWP_CONDITION_VALUE0 = unsafe { mem::zeroed() };
    value.r#type = FWP_UINT32;
    value.Anonymous.uint32 = FWP_CONDITION_FLAG_IS_LOOPBACK;
    FWPM_FILTER_CONDITION0 {
        fieldKey: FWPM_CONDITION_FLAGS,
        matchType: FWP_MATCH_FLAGS_ALL_SET,
        conditionValue: value,
    }
}

fn local_interface_condition(luid: &NET_LUID_LH) -> FWPM_FILTER_CONDITION0 {
    let mut value: FWP_CONDITION_VALUE0 = unsafe { mem::zeroed() };
    value.r#type = FWP_UINT64;
    // WFP takes 64-bit condition values by pointer; the LUID lives in the
    // caller's frame for the duration of the add.
    value.Anonymous.uint64 = unsafe { &luid.Value as *const u64 as *mut u64 };
    FWPM_FILTER_CONDITION0 {
        fieldKey: FWPM_CONDITION_IP_LOCAL_INTERFACE,
        matchType: FWP_MATCH_EQUAL,
        conditionValue: value,
    }
}

/// Install the block filter set scoped to the tunnel interface and the
/// engine executable.
///
/// Per address family: permit the engine binary, permit loopback, permit
/// the tunnel interface, block the rest. In `dns_only` mode every filter
/// additionally matches remote port 53, limiting the block to the DNS path.
pub fn add_block_filters(
    iface_index: u32,
    engine_exe: &Path,
    dns_only: bool,
) -> Win32Result<FilterEngine> {
    let mut session: FWPM_SESSION0 = unsafe { mem::zeroed() };
    session.flags = FWPM_SESSION_FLAG_DYNAMIC;

    let mut handle: HANDLE = ptr::null_mut();
    let err = unsafe {
        FwpmEngineOpen0(ptr::null(), RPC_C_AUTHN_WINNT, ptr::null(), &session, &mut handle)
    };
    if err != 0 {
        error!("could not open the filter engine: {err:#010x}");
        return Err(err);
    }
    let engine = FilterEngine(handle);

    let sublayer_name = to_wide("tunserv traffic block");
    let mut sublayer: FWPM_SUBLAYER0 = unsafe { mem::zeroed() };
    sublayer.subLayerKey = BLOCK_SUBLAYER_KEY;
    sublayer.displayData = FWPM_DISPLAY_DATA0 {
        name: sublayer_name.as_ptr() as *mut u16,
        description: ptr::null_mut(),
    };
    sublayer.weight = 0x100;
    let err = unsafe { FwpmSubLayerAdd0(engine.0, &sublayer, ptr::null_mut()) };
    if err != 0 && err != FWP_E_ALREADY_EXISTS {
        error!("could not add the block sublayer: {err:#010x}");
        return Err(err);
    }

    let exe_wide = to_wide(&engine_exe.to_string_lossy());
    let mut app_id: *mut FWP_BYTE_BLOB = ptr::null_mut();
    let err = unsafe { FwpmGetAppIdFromFileName0(exe_wide.as_ptr(), &mut app_id) };
    if err != 0 {
        error!("could not derive the engine app id: {err:#010x}");
        return Err(err);
    }

    let mut luid: NET_LUID_LH = unsafe { mem::zeroed() };
    let err = unsafe { ConvertInterfaceIndexToLuid(iface_index, &mut luid) };
    if err != 0 {
        unsafe { FwpmFreeMemory0(&mut (app_id as *mut std::ffi::c_void)) };
        return Err(err);
    }

    let port = dns_only.then(dns_port_condition);
    let mut result = Ok(());
    for (layer, tag) in [
        (FWPM_LAYER_ALE_AUTH_CONNECT_V4, "v4"),
        (FWPM_LAYER_ALE_AUTH_CONNECT_V6, "v6"),
    ] {
        let with_port = |mut conds: Vec<FWPM_FILTER_CONDITION0>| {
            if let Some(port) = port {
                conds.push(port);
            }
            conds
        };

        let specs = [
            FilterSpec {
                name: format!("permit engine traffic ({tag})"),
                layer,
                action: FWP_ACTION_PERMIT,
                weight: 0xF,
                conditions: with_port(vec![app_id_condition(app_id)]),
            },
            FilterSpec {
                name: format!("permit loopback ({tag})"),
                layer,
                action: FWP_ACTION_PERMIT,
                weight: 0xE,
                conditions: with_port(vec![loopback_condition()]),
            },
            FilterSpec {
                name: format!("permit tunnel interface ({tag})"),
                layer,
                action: FWP_ACTION_PERMIT,
                weight: 0xE,
                conditions: with_port(vec![local_interface_condition(&luid)]),
            },
            FilterSpec {
                name: format!("block bypass traffic ({tag})"),
                layer,
                action: FWP_ACTION_BLOCK,
                weight: 0x1,
                conditions: with_port(Vec::new()),
            },
        ];

        for spec in &specs {
            if let Err(err) = add_filter(&engine, spec) {
                result = Err(err);
                break;
            }
        }
        if result.is_err() {
            break;
        }
    }

    unsafe { FwpmFreeMemory0(&mut (app_id as *mut std::ffi::c_void)) };

    result.map(|()| {
        info!(
            "block filters installed on interface {iface_index}{}",
            if dns_only { " (DNS only)" } else { "" }
        );
        engine
    })
}

/// Remove the filters and restore both metrics. A stashed `-1` restores
/// "automatic"; restore failures are logged and ignored since the family
/// may simply be disabled on the interface.
pub fn undo_block(block: BlockUndo) {
    drop(block.engine);
    for (family, metric) in [(Family::V4, block.metric_v4), (Family::V6, block.metric_v6)] {
        let restore = if metric < 0 { 0 } else { metric as u32 };
        let err = set_interface_metric(block.iface_index, family, restore);
        if err != 0 {
            debug!(
                "could not restore {family} metric on interface {}: {err}",
                block.iface_index
            );
        }
    }
}

fn delete_block(ledger: &mut UndoLedger) -> u32 {
    match ledger.remove_matching(UndoKind::WfpBlock, |_| true) {
        Some(UndoRecord::WfpBlock(block)) => {
            undo_block(block);
            0
        }
        _ => {
            warn!("no previous block filters to delete");
            0
        }
    }
}

/// The add/del WFP block handler. A session holds at most one block; a
/// repeated add tears the previous one down first.
pub fn handle_wfp_block(
    msg: &WfpBlockMessage,
    add: bool,
    engine_exe: &Path,
    ledger: &mut UndoLedger,
) -> u32 {
    if !add {
        return delete_block(ledger);
    }

    if !ledger.is_empty(UndoKind::WfpBlock) {
        delete_block(ledger);
    }

    let index = msg.iface.index as u32;
    let engine = match add_block_filters(index, engine_exe, msg.dns_only()) {
        Ok(engine) => engine,
        Err(err) => return err,
    };

    let metric_v4 = get_interface_metric(index, Family::V4);
    let metric_v6 = get_interface_metric(index, Family::V6);

    let err = set_interface_metric(index, Family::V4, BLOCK_IFACE_METRIC);
    if err != 0 {
        // Filters die with the engine handle.
        return err;
    }
    // IPv6 may be disabled on the interface; a failing metric set must not
    // fail the whole block.
    set_interface_metric(index, Family::V6, BLOCK_IFACE_METRIC);

    ledger.append(UndoRecord::WfpBlock(BlockUndo {
        engine,
        iface_index: index,
        metric_v4,
        metric_v6,
    }));
    0
}
