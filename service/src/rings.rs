//! Ring-buffer registration with the tun device.
//!
//! The engine owns the device handle, the two ring sections and the two
//! tail-moved events; it can only tell us their handle values. Every handle
//! is duplicated out of the engine process (never taken from our own handle
//! table), the sections are mapped read-write into this process, and the
//! duplicated set is handed to the tun driver in one IOCTL. The mappings
//! stay alive in the undo ledger until the session ends; the duplicated
//! device and event handles are closed right after the IOCTL since the
//! driver keeps its own references.

use std::ffi::c_void;
use std::mem::size_of;
use std::ptr;

use log::{error, info};
use windows_sys::Win32::Foundation::{DuplicateHandle, DUPLICATE_SAME_ACCESS, HANDLE};
use windows_sys::Win32::System::Memory::{MapViewOfFile, FILE_MAP_ALL_ACCESS};
use windows_sys::Win32::System::Threading::GetCurrentProcess;
use windows_sys::Win32::System::IO::DeviceIoControl;

use shared::constants::{IOCTL_REGISTER_RINGS, RING_CAPACITY, RING_TRAILING_BYTES};
use shared::protocol::RegisterRingBuffersMessage;

use crate::handles::{last_error, MappedView, OwnedHandle, Win32Result};
use crate::undo::{UndoKind, UndoLedger, UndoRecord};

/// Shared-memory ring as the tun driver lays it out: producer and consumer
/// cursors, an alertable flag, then the data region with trailing slack so
/// frames never wrap mid-packet.
#[repr(C)]
pub struct TunRing {
    head: u32,
    tail: u32,
    alertable: i32,
    data: [u8; RING_CAPACITY + RING_TRAILING_BYTES],
}

/// One ring as the registration IOCTL wants it described.
#[repr(C)]
struct RingDescriptor {
    ring_size: u32,
    ring: *mut TunRing,
    tail_moved: HANDLE,
}

#[repr(C)]
struct RingRegister {
    send: RingDescriptor,
    receive: RingDescriptor,
}

/// A ring section mapped into the service. Unmapped on drop.
pub struct MappedRing(MappedView);

impl MappedRing {
    fn as_ptr(&self) -> *mut TunRing {
        self.0.as_ptr() as *mut TunRing
    }
}

/// The session's two mapped rings, owned by the undo ledger once the
/// registration succeeded. Dropping the record is the undo: both views
/// unmap.
pub struct RingMaps {
    _send: MappedRing,
    _receive: MappedRing,
}

/// Duplicate a handle value out of the engine process into ours.
fn duplicate_from(engine_proc: HANDLE, remote: u64) -> Win32Result<OwnedHandle> {
    let mut local: HANDLE = ptr::null_mut();
    let ok = unsafe {
        DuplicateHandle(
            engine_proc,
            remote as usize as HANDLE,
            GetCurrentProcess(),
            &mut local,
            0,
            0,
            DUPLICATE_SAME_ACCESS,
        )
    };
    if ok == 0 {
        let err = last_error();
        error!("could not duplicate engine handle: {err}");
        return Err(err);
    }
    Ok(OwnedHandle::from_raw(local))
}

/// Duplicate a section handle and map the full ring. The section handle is
/// closed right away; the mapping keeps the section alive.
fn duplicate_and_map(engine_proc: HANDLE, remote: u64) -> Win32Result<MappedRing> {
    let section = duplicate_from(engine_proc, remote)?;
    let addr = unsafe {
        MapViewOfFile(section.as_raw(), FILE_MAP_ALL_ACCESS, 0, 0, size_of::<TunRing>())
    };
    if addr.Value.is_null() {
        let err = last_error();
        error!("could not map ring section: {err}");
        return Err(err);
    }
    Ok(MappedRing(MappedView::from_address(addr)))
}

/// The register-ring-buffers handler.
///
/// A repeated registration replaces the previous one; its mappings are
/// released first. On any failure nothing is recorded and all intermediate
/// duplicates are closed.
pub fn handle_register_ring_buffers(
    msg: &RegisterRingBuffersMessage,
    engine_proc: HANDLE,
    ledger: &mut UndoLedger,
) -> u32 {
    // Drop a previous registration's mappings before building the new one.
    ledger.remove_matching(UndoKind::RingBuffer, |_| true);

    let device = match duplicate_from(engine_proc, msg.device) {
        Ok(h) => h,
        Err(err) => return err,
    };
    let send = match duplicate_and_map(engine_proc, msg.send_ring) {
        Ok(m) => m,
        Err(err) => return err,
    };
    let receive = match duplicate_and_map(engine_proc, msg.recv_ring) {
        Ok(m) => m,
        Err(err) => return err,
    };
    let send_tail_moved = match duplicate_from(engine_proc, msg.send_tail_event) {
        Ok(h) => h,
        Err(err) => return err,
    };
    let receive_tail_moved = match duplicate_from(engine_proc, msg.recv_tail_event) {
        Ok(h) => h,
        Err(err) => return err,
    };

    let register = RingRegister {
        send: RingDescriptor {
            ring_size: size_of::<TunRing>() as u32,
            ring: send.as_ptr(),
            tail_moved: send_tail_moved.as_raw(),
        },
        receive: RingDescriptor {
            ring_size: size_of::<TunRing>() as u32,
            ring: receive.as_ptr(),
            tail_moved: receive_tail_moved.as_raw(),
        },
    };

    let mut bytes = 0u32;
    let ok = unsafe {
        DeviceIoControl(
            device.as_raw(),
            IOCTL_REGISTER_RINGS,
            &register as *const RingRegister as *const c_void,
            size_of::<RingRegister>() as u32,
            ptr::null_mut(),
            0,
            &mut bytes,
            ptr::null_mut(),
        )
    };
    if ok == 0 {
        let err = last_error();
        error!("could not register ring buffers with the tun device: {err}");
        return err;
    }

    info!("ring buffers registered with the tun device");
    ledger.append(UndoRecord::RingBuffers(RingMaps { _send: send, _receive: receive }));
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_layout_matches_the_driver_contract() {
        // 12-byte header before the data region.
        assert_eq!(
            size_of::<TunRing>(),
            12 + RING_CAPACITY + RING_TRAILING_BYTES
        );
    }
}
