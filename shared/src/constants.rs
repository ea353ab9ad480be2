//! Protocol-level constants shared between the service and its clients.
//!
//! Everything a client needs to talk to the service lives here: pipe names,
//! buffer sizing, the error sentinels carried in acks, and the tun device
//! IOCTL used for ring-buffer registration. Keeping these out of the service
//! crate lets a GUI or test client link against `shared` alone.

/// Base of the client-facing pipe name. The configured instance suffix is
/// inserted before `\service`, so a second service instance can coexist.
pub const CLIENT_PIPE_PREFIX: &str = r"\\.\pipe\tunserv";

/// Buffer size (bytes) for the client-facing pipe, both directions.
pub const CLIENT_PIPE_BUFFER: u32 = 1024;

/// Buffer size (bytes) for the per-session engine pipe, both directions.
/// Requests are small; the engine pipe never carries bulk data.
pub const ENGINE_PIPE_BUFFER: u32 = 128;

/// Timeout applied to non-peek pipe I/O, in milliseconds.
pub const IO_TIMEOUT_MS: u32 = 2000;

/// Seconds a register-DNS worker waits for the process-wide semaphore.
pub const RDNS_TIMEOUT_S: u32 = 600;

/// Timeout for netsh invocations, in milliseconds.
pub const NETSH_TIMEOUT_MS: u32 = 30_000;

/// Error sentinels reported in ack messages and startup error reports.
/// They live above the Win32 error space so clients can tell them apart
/// from OS codes.
pub const ERROR_ENGINE_STARTUP: u32 = 0x2000_0000;
pub const ERROR_STARTUP_DATA: u32 = 0x2000_0001;
pub const ERROR_MESSAGE_DATA: u32 = 0x2000_0002;
pub const ERROR_MESSAGE_TYPE: u32 = 0x2000_0003;

const FILE_READ_DATA: u32 = 0x1;
const FILE_WRITE_DATA: u32 = 0x2;
const METHOD_BUFFERED: u32 = 0;

/// CTL_CODE(DeviceType, Function, Method, Access)
/// = (DeviceType << 16) | (Access << 14) | (Function << 2) | Method
macro_rules! ctl_code {
    ($dev:expr, $func:expr, $method:expr, $access:expr) => {
        ($dev << 16) | ($access << 14) | ($func << 2) | $method
    };
}

/// Tun device IOCTL that registers the two shared-memory rings and their
/// tail-moved events. The device type matches the tun driver's interface
/// contract and is not ours to change.
///
/// CTL_CODE(51820, 0x970, METHOD_BUFFERED, FILE_READ_DATA | FILE_WRITE_DATA)
pub const IOCTL_REGISTER_RINGS: u32 =
    ctl_code!(51820u32, 0x970, METHOD_BUFFERED, FILE_READ_DATA | FILE_WRITE_DATA);

/// Data capacity of one tun ring, in bytes.
pub const RING_CAPACITY: usize = 0x80_0000;

/// Slack after the data region so a packet written near the end of the ring
/// never wraps mid-frame.
pub const RING_TRAILING_BYTES: usize = 0x1_0000;

/// WNF state name published after group-policy DNS values change, so the
/// resolver re-reads the policy hive. Split into halves for the 32-bit
/// publish variant.
pub const WNF_GPOL_SYSTEM_CHANGES: u64 = 0x0D89_1E2A_A3BC_0875;
pub const WNF_GPOL_SYSTEM_CHANGES_LO: u32 = 0xA3BC_0875;
pub const WNF_GPOL_SYSTEM_CHANGES_HI: u32 = 0x0D89_1E2A;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_code_matches_device_contract() {
        // 51820 == 0xCA6C, access 3 << 14, function 0x970 << 2.
        assert_eq!(IOCTL_REGISTER_RINGS, 0xCA6C_E5C0);
    }

    #[test]
    fn wnf_halves_recompose() {
        let recomposed =
            ((WNF_GPOL_SYSTEM_CHANGES_HI as u64) << 32) | WNF_GPOL_SYSTEM_CHANGES_LO as u64;
        assert_eq!(recomposed, WNF_GPOL_SYSTEM_CHANGES);
    }
}
