//! Binary request/ack protocol spoken on the engine pipe.
//!
//! Frames are fixed-layout little-endian structs with no implicit padding.
//! Every frame starts with a 12-byte header `{type, size, message_id}` whose
//! `size` field is authoritative: it must equal both the number of bytes
//! received in the message and the fixed size of the variant named by `type`.
//! The decoder enforces that before anything else touches the payload.
//!
//! The peer at the other end of the pipe is less privileged than we are, so
//! fixed-length string fields are never trusted to be terminated: the last
//! byte of each one is treated as NUL regardless of what was sent.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use strum_macros::Display;

use crate::errors::DecodeError;

pub const HEADER_SIZE: usize = 12;

/// Interface reference: 4-byte index (-1 when unused) plus a fixed-length
/// UTF-8 alias field.
pub const IFACE_NAME_LEN: usize = 256;
pub const IFACE_SIZE: usize = 4 + IFACE_NAME_LEN;

pub const DNS_MAX_ADDRS: usize = 4;
pub const DNS_DOMAINS_LEN: usize = 512;
pub const WINS_MAX_ADDRS: usize = 4;

pub const ADDRESS_SIZE: usize = HEADER_SIZE + 2 + 1 + IFACE_SIZE + 16;
pub const ROUTE_SIZE: usize = HEADER_SIZE + 2 + 1 + IFACE_SIZE + 16 + 16 + 4;
pub const FLUSH_NEIGHBORS_SIZE: usize = HEADER_SIZE + 2 + IFACE_SIZE;
pub const WFP_BLOCK_SIZE: usize = HEADER_SIZE + 4 + IFACE_SIZE;
pub const REGISTER_DNS_SIZE: usize = HEADER_SIZE;
pub const DNS_CFG_SIZE: usize = HEADER_SIZE + IFACE_SIZE + 2 + 4 + 16 * DNS_MAX_ADDRS + DNS_DOMAINS_LEN;
pub const WINS_CFG_SIZE: usize = HEADER_SIZE + IFACE_SIZE + 4 + 4 * WINS_MAX_ADDRS;
pub const ENABLE_DHCP_SIZE: usize = HEADER_SIZE + IFACE_SIZE;
pub const REGISTER_RING_BUFFERS_SIZE: usize = HEADER_SIZE + 5 * 8;
pub const SET_MTU_SIZE: usize = HEADER_SIZE + 2 + IFACE_SIZE + 4;
pub const ACK_SIZE: usize = HEADER_SIZE + 4;

/// Size of the largest request variant. A peek reporting more bytes than
/// this means the peer is misbehaving and the session must end.
pub const MAX_REQUEST_SIZE: usize = DNS_CFG_SIZE;

/// Windows address family values as they appear on the wire.
const AF_INET: u16 = 2;
const AF_INET6: u16 = 23;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Ack = 0,
    AddAddress = 1,
    DelAddress = 2,
    AddRoute = 3,
    DelRoute = 4,
    FlushNeighbors = 5,
    AddWfpBlock = 6,
    DelWfpBlock = 7,
    RegisterDns = 8,
    AddDnsCfg = 9,
    DelDnsCfg = 10,
    AddWinsCfg = 11,
    DelWinsCfg = 12,
    EnableDhcp = 13,
    RegisterRingBuffers = 14,
    SetMtu = 15,
}

impl MessageKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        use MessageKind::*;
        Some(match raw {
            0 => Ack,
            1 => AddAddress,
            2 => DelAddress,
            3 => AddRoute,
            4 => DelRoute,
            5 => FlushNeighbors,
            6 => AddWfpBlock,
            7 => DelWfpBlock,
            8 => RegisterDns,
            9 => AddDnsCfg,
            10 => DelDnsCfg,
            11 => AddWinsCfg,
            12 => DelWinsCfg,
            13 => EnableDhcp,
            14 => RegisterRingBuffers,
            15 => SetMtu,
            _ => return None,
        })
    }

    /// Fixed wire size of this variant, header included.
    pub fn wire_size(self) -> usize {
        use MessageKind::*;
        match self {
            Ack => ACK_SIZE,
            AddAddress | DelAddress => ADDRESS_SIZE,
            AddRoute | DelRoute => ROUTE_SIZE,
            FlushNeighbors => FLUSH_NEIGHBORS_SIZE,
            AddWfpBlock | DelWfpBlock => WFP_BLOCK_SIZE,
            RegisterDns => REGISTER_DNS_SIZE,
            AddDnsCfg | DelDnsCfg => DNS_CFG_SIZE,
            AddWinsCfg | DelWinsCfg => WINS_CFG_SIZE,
            EnableDhcp => ENABLE_DHCP_SIZE,
            RegisterRingBuffers => REGISTER_RING_BUFFERS_SIZE,
            SetMtu => SET_MTU_SIZE,
        }
    }
}

/// Address family tag used by address, route, flush, DNS and MTU requests.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    fn from_raw(raw: u16) -> Result<Self, DecodeError> {
        match raw {
            AF_INET => Ok(Family::V4),
            AF_INET6 => Ok(Family::V6),
            _ => Err(DecodeError::Malformed("unknown address family")),
        }
    }

    pub fn raw(self) -> u16 {
        match self {
            Family::V4 => AF_INET,
            Family::V6 => AF_INET6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub kind: u32,
    pub size: u32,
    pub message_id: u32,
}

impl Header {
    /// Parse the common header if enough bytes are present. Used by the
    /// worker to mirror `message_id` into the ack even when the rest of the
    /// frame turns out to be garbage.
    pub fn parse(frame: &[u8]) -> Option<Header> {
        if frame.len() < HEADER_SIZE {
            return None;
        }
        Some(Header {
            kind: u32::from_le_bytes(frame[0..4].try_into().ok()?),
            size: u32::from_le_bytes(frame[4..8].try_into().ok()?),
            message_id: u32::from_le_bytes(frame[8..12].try_into().ok()?),
        })
    }
}

/// Interface designator. `index == -1` means "resolve by alias".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iface {
    pub index: i32,
    pub name: String,
}

impl Iface {
    pub fn by_index(index: u32) -> Self {
        Iface { index: index as i32, name: String::new() }
    }

    pub fn by_name(name: &str) -> Self {
        Iface { index: -1, name: name.to_string() }
    }

    pub fn has_index(&self) -> bool {
        self.index != -1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressMessage {
    pub family: Family,
    pub prefix_len: u8,
    pub iface: Iface,
    pub address: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMessage {
    pub family: Family,
    pub prefix_len: u8,
    pub iface: Iface,
    pub prefix: IpAddr,
    pub gateway: IpAddr,
    pub metric: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushNeighborsMessage {
    pub family: Family,
    pub iface: Iface,
}

pub const WFP_BLOCK_DNS_ONLY: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WfpBlockMessage {
    pub flags: u32,
    pub iface: Iface,
}

impl WfpBlockMessage {
    pub fn dns_only(&self) -> bool {
        self.flags == WFP_BLOCK_DNS_ONLY
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsCfgMessage {
    pub iface: Iface,
    pub family: Family,
    pub addrs: Vec<IpAddr>,
    /// Comma separated search suffixes, possibly empty.
    pub domains: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WinsCfgMessage {
    pub iface: Iface,
    pub addrs: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnableDhcpMessage {
    pub iface: Iface,
}

/// Handle values are process-local to the engine; the service duplicates
/// them out of the engine process before use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRingBuffersMessage {
    pub device: u64,
    pub send_ring: u64,
    pub recv_ring: u64,
    pub send_tail_event: u64,
    pub recv_tail_event: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetMtuMessage {
    pub family: Family,
    pub iface: Iface,
    pub mtu: u32,
}

/// A decoded request. The add/del pairing is kept in the variant so handlers
/// can branch on it the same way the wire does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    AddAddress(AddressMessage),
    DelAddress(AddressMessage),
    AddRoute(RouteMessage),
    DelRoute(RouteMessage),
    FlushNeighbors(FlushNeighborsMessage),
    AddWfpBlock(WfpBlockMessage),
    DelWfpBlock(WfpBlockMessage),
    RegisterDns,
    AddDnsCfg(DnsCfgMessage),
    DelDnsCfg(DnsCfgMessage),
    AddWinsCfg(WinsCfgMessage),
    DelWinsCfg(WinsCfgMessage),
    EnableDhcp(EnableDhcpMessage),
    RegisterRingBuffers(RegisterRingBuffersMessage),
    SetMtu(SetMtuMessage),
}

impl Request {
    pub fn kind(&self) -> MessageKind {
        use Request::*;
        match self {
            AddAddress(_) => MessageKind::AddAddress,
            DelAddress(_) => MessageKind::DelAddress,
            AddRoute(_) => MessageKind::AddRoute,
            DelRoute(_) => MessageKind::DelRoute,
            FlushNeighbors(_) => MessageKind::FlushNeighbors,
            AddWfpBlock(_) => MessageKind::AddWfpBlock,
            DelWfpBlock(_) => MessageKind::DelWfpBlock,
            RegisterDns => MessageKind::RegisterDns,
            AddDnsCfg(_) => MessageKind::AddDnsCfg,
            DelDnsCfg(_) => MessageKind::DelDnsCfg,
            AddWinsCfg(_) => MessageKind::AddWinsCfg,
            DelWinsCfg(_) => MessageKind::DelWinsCfg,
            EnableDhcp(_) => MessageKind::EnableDhcp,
            RegisterRingBuffers(_) => MessageKind::RegisterRingBuffers,
            SetMtu(_) => MessageKind::SetMtu,
        }
    }
}

/// Acknowledgement for one request. `error` is 0 on success, a Win32 code
/// on OS failure or one of the `ERROR_*` sentinels from `constants`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub message_id: u32,
    pub error: u32,
}

impl Ack {
    pub fn encode(&self) -> [u8; ACK_SIZE] {
        let mut out = [0u8; ACK_SIZE];
        out[0..4].copy_from_slice(&(MessageKind::Ack as u32).to_le_bytes());
        out[4..8].copy_from_slice(&(ACK_SIZE as u32).to_le_bytes());
        out[8..12].copy_from_slice(&self.message_id.to_le_bytes());
        out[12..16].copy_from_slice(&self.error.to_le_bytes());
        out
    }

    pub fn decode(frame: &[u8]) -> Result<Ack, DecodeError> {
        let header = Header::parse(frame).ok_or(DecodeError::Malformed("short ack"))?;
        if header.kind != MessageKind::Ack as u32 {
            return Err(DecodeError::UnknownType(header.kind));
        }
        if frame.len() != ACK_SIZE || header.size as usize != ACK_SIZE {
            return Err(DecodeError::Malformed("ack size mismatch"));
        }
        Ok(Ack {
            message_id: header.message_id,
            error: u32::from_le_bytes(frame[12..16].try_into().unwrap()),
        })
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.buf.len())
            .ok_or(DecodeError::Malformed("frame underrun"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    /// Fixed-length string field. The last byte is treated as NUL no matter
    /// what the peer sent, then the field is cut at the first NUL.
    fn c_string(&mut self, n: usize) -> Result<String, DecodeError> {
        let field = self.bytes(n)?;
        let body = &field[..n - 1];
        let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
        std::str::from_utf8(&body[..end])
            .map(str::to_owned)
            .map_err(|_| DecodeError::Malformed("string field is not UTF-8"))
    }

    fn family(&mut self) -> Result<Family, DecodeError> {
        Family::from_raw(self.u16()?)
    }

    fn iface(&mut self) -> Result<Iface, DecodeError> {
        let index = self.u32()? as i32;
        let name = self.c_string(IFACE_NAME_LEN)?;
        Ok(Iface { index, name })
    }

    /// 16-byte address field interpreted per family; for IPv4 only the
    /// leading 4 bytes are meaningful.
    fn address(&mut self, family: Family) -> Result<IpAddr, DecodeError> {
        let raw: [u8; 16] = self.bytes(16)?.try_into().unwrap();
        Ok(match family {
            Family::V4 => IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3])),
            Family::V6 => IpAddr::V6(Ipv6Addr::from(raw)),
        })
    }
}

/// Decode one request frame.
///
/// Check order matches the ack the peer will see: a frame whose length and
/// `size` field disagree is `MESSAGE_DATA`; an unknown discriminant is
/// `MESSAGE_TYPE`; a known discriminant with the wrong fixed size is
/// `MESSAGE_DATA` again.
pub fn decode_request(frame: &[u8]) -> Result<Request, DecodeError> {
    let header = Header::parse(frame).ok_or(DecodeError::Malformed("short frame"))?;
    if header.size as usize != frame.len() {
        return Err(DecodeError::Malformed("size field disagrees with frame length"));
    }

    let kind = MessageKind::from_raw(header.kind).ok_or(DecodeError::UnknownType(header.kind))?;
    if kind == MessageKind::Ack {
        // Acks only ever flow service -> engine.
        return Err(DecodeError::UnknownType(header.kind));
    }
    if frame.len() != kind.wire_size() {
        return Err(DecodeError::Malformed("frame length does not match variant"));
    }

    let mut r = Reader::new(&frame[HEADER_SIZE..]);
    let request = match kind {
        MessageKind::AddAddress | MessageKind::DelAddress => {
            let family = r.family()?;
            let prefix_len = r.u8()?;
            let iface = r.iface()?;
            let address = r.address(family)?;
            let msg = AddressMessage { family, prefix_len, iface, address };
            if kind == MessageKind::AddAddress {
                Request::AddAddress(msg)
            } else {
                Request::DelAddress(msg)
            }
        }
        MessageKind::AddRoute | MessageKind::DelRoute => {
            let family = r.family()?;
            let prefix_len = r.u8()?;
            let iface = r.iface()?;
            let prefix = r.address(family)?;
            let gateway = r.address(family)?;
            let metric = r.u32()?;
            let msg = RouteMessage { family, prefix_len, iface, prefix, gateway, metric };
            if kind == MessageKind::AddRoute {
                Request::AddRoute(msg)
            } else {
                Request::DelRoute(msg)
            }
        }
        MessageKind::FlushNeighbors => {
            let family = r.family()?;
            let iface = r.iface()?;
            Request::FlushNeighbors(FlushNeighborsMessage { family, iface })
        }
        MessageKind::AddWfpBlock | MessageKind::DelWfpBlock => {
            let flags = r.u32()?;
            let iface = r.iface()?;
            let msg = WfpBlockMessage { flags, iface };
            if kind == MessageKind::AddWfpBlock {
                Request::AddWfpBlock(msg)
            } else {
                Request::DelWfpBlock(msg)
            }
        }
        MessageKind::RegisterDns => Request::RegisterDns,
        MessageKind::AddDnsCfg | MessageKind::DelDnsCfg => {
            let iface = r.iface()?;
            let family = r.family()?;
            // A peer can claim more addresses than the field holds; the
            // count is clamped rather than rejected.
            let addr_len = (r.u32()? as usize).min(DNS_MAX_ADDRS);
            let mut addrs = Vec::with_capacity(addr_len);
            for i in 0..DNS_MAX_ADDRS {
                let addr = r.address(family)?;
                if i < addr_len {
                    addrs.push(addr);
                }
            }
            let domains = r.c_string(DNS_DOMAINS_LEN)?;
            let msg = DnsCfgMessage { iface, family, addrs, domains };
            if kind == MessageKind::AddDnsCfg {
                Request::AddDnsCfg(msg)
            } else {
                Request::DelDnsCfg(msg)
            }
        }
        MessageKind::AddWinsCfg | MessageKind::DelWinsCfg => {
            let iface = r.iface()?;
            let addr_len = (r.u32()? as usize).min(WINS_MAX_ADDRS);
            let mut addrs = Vec::with_capacity(addr_len);
            for i in 0..WINS_MAX_ADDRS {
                let raw: [u8; 4] = r.bytes(4)?.try_into().unwrap();
                if i < addr_len {
                    addrs.push(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]));
                }
            }
            let msg = WinsCfgMessage { iface, addrs };
            if kind == MessageKind::AddWinsCfg {
                Request::AddWinsCfg(msg)
            } else {
                Request::DelWinsCfg(msg)
            }
        }
        MessageKind::EnableDhcp => {
            let iface = r.iface()?;
            Request::EnableDhcp(EnableDhcpMessage { iface })
        }
        MessageKind::RegisterRingBuffers => Request::RegisterRingBuffers(RegisterRingBuffersMessage {
            device: r.u64()?,
            send_ring: r.u64()?,
            recv_ring: r.u64()?,
            send_tail_event: r.u64()?,
            recv_tail_event: r.u64()?,
        }),
        MessageKind::SetMtu => {
            let family = r.family()?;
            let iface = r.iface()?;
            let mtu = r.u32()?;
            Request::SetMtu(SetMtuMessage { family, iface, mtu })
        }
        MessageKind::Ack => unreachable!("rejected above"),
    };

    Ok(request)
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new(kind: MessageKind, message_id: u32) -> Self {
        let mut buf = Vec::with_capacity(kind.wire_size());
        buf.extend_from_slice(&(kind as u32).to_le_bytes());
        buf.extend_from_slice(&(kind.wire_size() as u32).to_le_bytes());
        buf.extend_from_slice(&message_id.to_le_bytes());
        Writer { buf }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn c_string(&mut self, s: &str, n: usize) {
        let bytes = s.as_bytes();
        let len = bytes.len().min(n - 1);
        self.buf.extend_from_slice(&bytes[..len]);
        self.buf.extend(std::iter::repeat(0).take(n - len));
    }

    fn iface(&mut self, iface: &Iface) {
        self.u32(iface.index as u32);
        self.c_string(&iface.name, IFACE_NAME_LEN);
    }

    fn address(&mut self, addr: &IpAddr) {
        let mut raw = [0u8; 16];
        match addr {
            IpAddr::V4(v4) => raw[..4].copy_from_slice(&v4.octets()),
            IpAddr::V6(v6) => raw.copy_from_slice(&v6.octets()),
        }
        self.buf.extend_from_slice(&raw);
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Encode a request frame. Used by in-repo clients and tests; the service
/// itself only ever decodes requests and encodes acks.
pub fn encode_request(request: &Request, message_id: u32) -> Vec<u8> {
    let kind = request.kind();
    let mut w = Writer::new(kind, message_id);
    match request {
        Request::AddAddress(m) | Request::DelAddress(m) => {
            w.u16(m.family.raw());
            w.u8(m.prefix_len);
            w.iface(&m.iface);
            w.address(&m.address);
        }
        Request::AddRoute(m) | Request::DelRoute(m) => {
            w.u16(m.family.raw());
            w.u8(m.prefix_len);
            w.iface(&m.iface);
            w.address(&m.prefix);
            w.address(&m.gateway);
            w.u32(m.metric);
        }
        Request::FlushNeighbors(m) => {
            w.u16(m.family.raw());
            w.iface(&m.iface);
        }
        Request::AddWfpBlock(m) | Request::DelWfpBlock(m) => {
            w.u32(m.flags);
            w.iface(&m.iface);
        }
        Request::RegisterDns => {}
        Request::AddDnsCfg(m) | Request::DelDnsCfg(m) => {
            w.iface(&m.iface);
            w.u16(m.family.raw());
            w.u32(m.addrs.len() as u32);
            for i in 0..DNS_MAX_ADDRS {
                match m.addrs.get(i) {
                    Some(addr) => w.address(addr),
                    None => w.buf.extend_from_slice(&[0u8; 16]),
                }
            }
            w.c_string(&m.domains, DNS_DOMAINS_LEN);
        }
        Request::AddWinsCfg(m) | Request::DelWinsCfg(m) => {
            w.iface(&m.iface);
            w.u32(m.addrs.len() as u32);
            for i in 0..WINS_MAX_ADDRS {
                match m.addrs.get(i) {
                    Some(addr) => w.buf.extend_from_slice(&addr.octets()),
                    None => w.buf.extend_from_slice(&[0u8; 4]),
                }
            }
        }
        Request::EnableDhcp(m) => {
            w.iface(&m.iface);
        }
        Request::RegisterRingBuffers(m) => {
            w.u64(m.device);
            w.u64(m.send_ring);
            w.u64(m.recv_ring);
            w.u64(m.send_tail_event);
            w.u64(m.recv_tail_event);
        }
        Request::SetMtu(m) => {
            w.u16(m.family.raw());
            w.iface(&m.iface);
            w.u32(m.mtu);
        }
    }
    let frame = w.finish();
    debug_assert_eq!(frame.len(), kind.wire_size());
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{ERROR_MESSAGE_DATA, ERROR_MESSAGE_TYPE};

    fn route() -> Request {
        Request::AddRoute(RouteMessage {
            family: Family::V4,
            prefix_len: 16,
            iface: Iface::by_index(17),
            prefix: "10.8.0.0".parse().unwrap(),
            gateway: "10.8.0.1".parse().unwrap(),
            metric: 100,
        })
    }

    #[test]
    fn route_frame_carries_declared_size() {
        let frame = encode_request(&route(), 7);
        assert_eq!(frame.len(), ROUTE_SIZE);
        let header = Header::parse(&frame).unwrap();
        assert_eq!(header.size as usize, ROUTE_SIZE);
        assert_eq!(header.message_id, 7);
        assert_eq!(decode_request(&frame).unwrap(), route());
    }

    #[test]
    fn size_field_must_match_frame_length() {
        let mut frame = encode_request(&route(), 1);
        // Claim one byte more than was sent.
        frame[4..8].copy_from_slice(&(ROUTE_SIZE as u32 + 1).to_le_bytes());
        let err = decode_request(&frame).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
        assert_eq!(err.ack_code(), ERROR_MESSAGE_DATA);
    }

    #[test]
    fn unknown_type_with_consistent_size() {
        let mut frame = vec![0u8; HEADER_SIZE];
        frame[0..4].copy_from_slice(&0xDEADu32.to_le_bytes());
        frame[4..8].copy_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
        frame[8..12].copy_from_slice(&9u32.to_le_bytes());
        let err = decode_request(&frame).unwrap_err();
        assert_eq!(err, DecodeError::UnknownType(0xDEAD));
        assert_eq!(err.ack_code(), ERROR_MESSAGE_TYPE);
    }

    #[test]
    fn known_type_with_wrong_variant_size_is_data_error() {
        let mut frame = vec![0u8; HEADER_SIZE + 4];
        frame[0..4].copy_from_slice(&(MessageKind::AddAddress as u32).to_le_bytes());
        frame[4..8].copy_from_slice(&((HEADER_SIZE + 4) as u32).to_le_bytes());
        let err = decode_request(&frame).unwrap_err();
        assert_eq!(err.ack_code(), ERROR_MESSAGE_DATA);
    }

    #[test]
    fn unterminated_iface_name_is_forcibly_cut() {
        let msg = EnableDhcpMessage { iface: Iface { index: -1, name: "x".repeat(300) } };
        let frame = encode_request(&Request::EnableDhcp(msg), 0);
        match decode_request(&frame).unwrap() {
            Request::EnableDhcp(m) => {
                // 255 payload bytes fit; the forced terminator eats the rest.
                assert_eq!(m.iface.name.len(), IFACE_NAME_LEN - 1);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn dns_addr_len_is_clamped_to_capacity() {
        let msg = DnsCfgMessage {
            iface: Iface::by_name("tun0"),
            family: Family::V4,
            addrs: vec!["10.8.0.1".parse().unwrap(), "10.8.0.2".parse().unwrap()],
            domains: "vpn.example".into(),
        };
        let mut frame = encode_request(&Request::AddDnsCfg(msg), 3);
        // addr_len sits right after iface + family.
        let off = HEADER_SIZE + IFACE_SIZE + 2;
        frame[off..off + 4].copy_from_slice(&99u32.to_le_bytes());
        match decode_request(&frame).unwrap() {
            Request::AddDnsCfg(m) => assert_eq!(m.addrs.len(), DNS_MAX_ADDRS),
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn dns_cfg_is_the_largest_variant() {
        for raw in 1..=15u32 {
            let kind = MessageKind::from_raw(raw).unwrap();
            assert!(kind.wire_size() <= MAX_REQUEST_SIZE, "{kind} exceeds the union");
        }
    }

    #[test]
    fn wins_frame_decodes_v4_addresses() {
        let msg = WinsCfgMessage {
            iface: Iface::by_name("tun0"),
            addrs: vec!["10.8.0.1".parse().unwrap()],
        };
        let frame = encode_request(&Request::AddWinsCfg(msg.clone()), 11);
        assert_eq!(frame.len(), WINS_CFG_SIZE);
        assert_eq!(decode_request(&frame).unwrap(), Request::AddWinsCfg(msg));
    }

    #[test]
    fn ring_buffer_frame_is_five_handles() {
        let msg = RegisterRingBuffersMessage {
            device: 0x11,
            send_ring: 0x22,
            recv_ring: 0x33,
            send_tail_event: 0x44,
            recv_tail_event: 0x55,
        };
        let frame = encode_request(&Request::RegisterRingBuffers(msg.clone()), 2);
        assert_eq!(frame.len(), REGISTER_RING_BUFFERS_SIZE);
        assert_eq!(
            decode_request(&frame).unwrap(),
            Request::RegisterRingBuffers(msg)
        );
    }

    #[test]
    fn ack_layout() {
        let ack = Ack { message_id: 42, error: ERROR_MESSAGE_TYPE };
        let frame = ack.encode();
        assert_eq!(frame.len(), ACK_SIZE);
        assert_eq!(Ack::decode(&frame).unwrap(), ack);
        // The size field counts the header.
        assert_eq!(u32::from_le_bytes(frame[4..8].try_into().unwrap()), ACK_SIZE as u32);
    }

    #[test]
    fn ack_frames_are_not_requests() {
        let frame = Ack { message_id: 0, error: 0 }.encode();
        assert!(matches!(
            decode_request(&frame).unwrap_err(),
            DecodeError::UnknownType(0)
        ));
    }
}
