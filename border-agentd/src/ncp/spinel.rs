//! Spinel frame encoding and decoding.
//!
//! A frame is a header byte, a packed command, a packed property key and a
//! property payload built from the spinel datatypes.

use std::net::Ipv6Addr;

use shared::types::DeviceRole;
use shared::{Error, Result};

pub const HEADER_FLAG: u8 = 0x80;
pub const HEADER_IID_SHIFT: u8 = 4;
pub const HEADER_IID_MASK: u8 = 0x30;
pub const HEADER_TID_MASK: u8 = 0x0F;

/// Largest frame the transmit buffer holds
pub const MAX_FRAME_SIZE: usize = 2048;

pub const CMD_NOOP: u32 = 0;
pub const CMD_PROP_VALUE_GET: u32 = 2;
pub const CMD_PROP_VALUE_SET: u32 = 3;
pub const CMD_PROP_VALUE_INSERT: u32 = 4;
pub const CMD_PROP_VALUE_REMOVE: u32 = 5;
pub const CMD_PROP_VALUE_IS: u32 = 6;
pub const CMD_PROP_VALUE_INSERTED: u32 = 7;
pub const CMD_PROP_VALUE_REMOVED: u32 = 8;
pub const CMD_NET_CLEAR: u32 = 10;

pub const PROP_LAST_STATUS: u32 = 0x00;
pub const PROP_NET_IF_UP: u32 = 0x41;
pub const PROP_NET_STACK_UP: u32 = 0x42;
pub const PROP_NET_ROLE: u32 = 0x43;
pub const PROP_NET_LEAVE_GRACEFULLY: u32 = 0x4C;
pub const PROP_IPV6_ML_PREFIX: u32 = 0x62;
pub const PROP_IPV6_ADDRESS_TABLE: u32 = 0x63;
pub const PROP_IPV6_MULTICAST_ADDRESS_TABLE: u32 = 0x66;
pub const PROP_STREAM_NET: u32 = 0x72;
pub const PROP_THREAD_ACTIVE_DATASET_TLVS: u32 = 0x153C;
pub const PROP_THREAD_MGMT_SET_PENDING_DATASET_TLVS: u32 = 0x153E;

// Vendor properties
pub const PROP_SRP_SERVICE_UPDATE: u32 = 0x3C00;
pub const PROP_SRP_SERVICE_UPDATE_RESULT: u32 = 0x3C01;
pub const PROP_DNSSD_QUERY_SUBSCRIBE: u32 = 0x3C02;
pub const PROP_DNSSD_QUERY_UNSUBSCRIBE: u32 = 0x3C03;
pub const PROP_DNSSD_DISCOVERED_SERVICE_INSTANCE: u32 = 0x3C04;
pub const PROP_DNSSD_DISCOVERED_HOST: u32 = 0x3C05;
pub const PROP_BACKBONE_ROUTER_STATE: u32 = 0x3C06;
pub const PROP_BACKBONE_ROUTER_MULTICAST_LISTENER: u32 = 0x3C07;

pub const STATUS_OK: u32 = 0;
pub const STATUS_FAILURE: u32 = 1;
pub const STATUS_UNIMPLEMENTED: u32 = 2;
pub const STATUS_INVALID_ARGUMENT: u32 = 3;
pub const STATUS_INVALID_STATE: u32 = 4;
pub const STATUS_PARSE_ERROR: u32 = 9;
pub const STATUS_NOMEM: u32 = 11;
pub const STATUS_BUSY: u32 = 12;
pub const STATUS_PROP_NOT_FOUND: u32 = 13;
pub const STATUS_ALREADY: u32 = 19;
pub const STATUS_ITEM_NOT_FOUND: u32 = 20;

pub const NET_ROLE_DETACHED: u8 = 0;
pub const NET_ROLE_CHILD: u8 = 1;
pub const NET_ROLE_ROUTER: u8 = 2;
pub const NET_ROLE_LEADER: u8 = 3;
pub const NET_ROLE_DISABLED: u8 = 4;

pub fn header(iid: u8, tid: u8) -> u8 {
    HEADER_FLAG | ((iid << HEADER_IID_SHIFT) & HEADER_IID_MASK) | (tid & HEADER_TID_MASK)
}

pub fn header_tid(header: u8) -> u8 {
    header & HEADER_TID_MASK
}

pub fn header_iid(header: u8) -> u8 {
    (header & HEADER_IID_MASK) >> HEADER_IID_SHIFT
}

/// Next transaction id, wrapping from 15 back to 1. Zero is reserved for
/// unsolicited notifications.
pub fn next_tid(tid: u8) -> u8 {
    if tid >= HEADER_TID_MASK {
        1
    } else {
        tid + 1
    }
}

pub fn status_to_result(status: u32) -> Result<()> {
    match status {
        STATUS_OK => Ok(()),
        STATUS_UNIMPLEMENTED => Err(Error::NotImplemented),
        STATUS_INVALID_ARGUMENT => Err(Error::InvalidArgs),
        STATUS_INVALID_STATE => Err(Error::InvalidState),
        STATUS_PARSE_ERROR => Err(Error::Parse),
        STATUS_NOMEM => Err(Error::NoBufs),
        STATUS_BUSY => Err(Error::Busy),
        STATUS_ALREADY => Err(Error::Duplicated),
        STATUS_PROP_NOT_FOUND | STATUS_ITEM_NOT_FOUND => Err(Error::NotFound),
        STATUS_FAILURE => Err(Error::Failed("coprocessor failure".to_string())),
        other => Err(Error::Failed(format!("spinel status {}", other))),
    }
}

pub fn role_from_spinel(role: u8) -> DeviceRole {
    match role {
        NET_ROLE_DETACHED => DeviceRole::Detached,
        NET_ROLE_CHILD => DeviceRole::Child,
        NET_ROLE_ROUTER => DeviceRole::Router,
        NET_ROLE_LEADER => DeviceRole::Leader,
        NET_ROLE_DISABLED => DeviceRole::Disabled,
        other => {
            tracing::warn!("Unsupported spinel net role: {}", other);
            DeviceRole::Disabled
        }
    }
}

/// Builds one outbound frame.
#[derive(Debug, Default)]
pub struct SpinelEncoder {
    buf: Vec<u8>,
    structs: Vec<usize>,
}

impl SpinelEncoder {
    pub fn begin_frame(header: u8, cmd: u32, key: u32) -> Self {
        let mut encoder = Self::default();
        encoder.buf.push(header);
        encoder.write_uint_packed(cmd);
        encoder.write_uint_packed(key);
        encoder
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.buf.push(value as u8);
        self
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Little-endian groups of seven bits, continuation flag in bit 7.
    pub fn write_uint_packed(&mut self, mut value: u32) -> &mut Self {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.push(byte);
                break;
            }
            self.buf.push(byte | 0x80);
        }
        self
    }

    pub fn write_ip6(&mut self, address: &Ipv6Addr) -> &mut Self {
        self.buf.extend_from_slice(&address.octets());
        self
    }

    pub fn write_utf8(&mut self, value: &str) -> &mut Self {
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
        self
    }

    pub fn write_data(&mut self, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(data);
        self
    }

    pub fn write_data_with_len(&mut self, data: &[u8]) -> &mut Self {
        self.write_u16(data.len() as u16);
        self.write_data(data)
    }

    #[cfg(test)]
    pub fn open_struct(&mut self) -> &mut Self {
        self.structs.push(self.buf.len());
        self.buf.extend_from_slice(&[0, 0]);
        self
    }

    #[cfg(test)]
    pub fn close_struct(&mut self) -> &mut Self {
        if let Some(start) = self.structs.pop() {
            let len = (self.buf.len() - start - 2) as u16;
            self.buf[start..start + 2].copy_from_slice(&len.to_le_bytes());
        }
        self
    }

    pub fn end_frame(self) -> Result<Vec<u8>> {
        if !self.structs.is_empty() {
            return Err(Error::InvalidState);
        }
        if self.buf.len() > MAX_FRAME_SIZE {
            return Err(Error::NoBufs);
        }
        Ok(self.buf)
    }
}

/// Reads spinel datatypes out of a payload, honouring nested struct bounds.
#[derive(Debug)]
pub struct SpinelDecoder<'a> {
    data: &'a [u8],
    pos: usize,
    ends: Vec<usize>,
}

impl<'a> SpinelDecoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            ends: Vec::new(),
        }
    }

    fn end(&self) -> usize {
        self.ends.last().copied().unwrap_or(self.data.len())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(Error::Parse)?;
        if end > self.end() {
            return Err(Error::Parse);
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn is_all_read(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn is_all_read_in_struct(&self) -> bool {
        self.pos >= self.end()
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Error::Parse),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_uint_packed(&mut self) -> Result<u32> {
        let mut value: u32 = 0;
        for shift in (0..35).step_by(7) {
            let byte = self.read_u8()?;
            value |= u32::from(byte & 0x7F)
                .checked_shl(shift)
                .ok_or(Error::Parse)?;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(Error::Parse)
    }

    pub fn read_ip6(&mut self) -> Result<Ipv6Addr> {
        let bytes = self.take(16)?;
        let mut octets = [0u8; 16];
        octets.copy_from_slice(bytes);
        Ok(Ipv6Addr::from(octets))
    }

    pub fn read_utf8(&mut self) -> Result<String> {
        let rest = &self.data[self.pos..self.end()];
        let nul = rest.iter().position(|&b| b == 0).ok_or(Error::Parse)?;
        let value = std::str::from_utf8(&rest[..nul]).map_err(|_| Error::Parse)?;
        self.pos += nul + 1;
        Ok(value.to_string())
    }

    /// Everything up to the end of the current struct or payload.
    pub fn read_data(&mut self) -> Result<&'a [u8]> {
        let len = self.end() - self.pos;
        self.take(len)
    }

    pub fn read_data_with_len(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u16()? as usize;
        self.take(len)
    }

    pub fn open_struct(&mut self) -> Result<()> {
        let len = self.read_u16()? as usize;
        let end = self.pos + len;
        if end > self.end() {
            return Err(Error::Parse);
        }
        self.ends.push(end);
        Ok(())
    }

    /// Skips whatever is left of the current struct.
    pub fn close_struct(&mut self) -> Result<()> {
        let end = self.ends.pop().ok_or(Error::InvalidState)?;
        self.pos = end;
        Ok(())
    }
}

/// A parsed inbound frame. The payload borrows from the received buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub header: u8,
    pub cmd: u32,
    pub key: u32,
    pub payload: &'a [u8],
}

impl<'a> Frame<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let mut decoder = SpinelDecoder::new(data);
        let header = decoder.read_u8()?;
        if header & HEADER_FLAG == 0 {
            return Err(Error::Parse);
        }
        let cmd = decoder.read_uint_packed()?;
        let key = decoder.read_uint_packed()?;
        let payload = decoder.read_data()?;

        Ok(Self {
            header,
            cmd,
            key,
            payload,
        })
    }

    pub fn tid(&self) -> u8 {
        header_tid(self.header)
    }
}
