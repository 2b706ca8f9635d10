//! Framing: 4 bytes LE length (code + payload), 4 bytes LE code, payload.
//! Payload fields: i32/i64 LE, single bytes, strings as `[len:i32][utf8]`.

use std::net::Ipv4Addr;

use crate::error::{Result, SoulseekError};
use crate::protocol::MessageCode;

pub const LEN_SIZE: usize = 4;
pub const CODE_SIZE: usize = 4;
pub const HEADER_SIZE: usize = LEN_SIZE + CODE_SIZE;
pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024; // 16 MiB

/// Validate the length field of an envelope and return the payload size (length minus code).
pub fn payload_len(length: i32) -> Result<usize> {
    if length < CODE_SIZE as i32 {
        return Err(SoulseekError::MessageRead(format!(
            "message length {length} is shorter than the message code"
        )));
    }
    let length = length as usize;
    if length > MAX_MESSAGE_LEN {
        return Err(SoulseekError::MessageRead(format!(
            "message length {length} exceeds maximum of {MAX_MESSAGE_LEN}"
        )));
    }
    Ok(length - CODE_SIZE)
}

/// Appends fields in declared order and prefixes the result with its length.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    bytes: Vec<u8>,
}

impl MessageBuilder {
    pub fn new(code: impl Into<MessageCode>) -> Self {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(&[0u8; LEN_SIZE]);
        bytes.extend_from_slice(&code.into().as_i32().to_le_bytes());
        Self { bytes }
    }

    pub fn write_byte(mut self, value: u8) -> Self {
        self.bytes.push(value);
        self
    }

    pub fn write_bytes(mut self, value: &[u8]) -> Self {
        self.bytes.extend_from_slice(value);
        self
    }

    pub fn write_integer(mut self, value: i32) -> Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_long(mut self, value: i64) -> Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_string(self, value: &str) -> Self {
        let len = value.len() as i32;
        self.write_integer(len).write_bytes(value.as_bytes())
    }

    /// IPv4 addresses travel with their octets reversed.
    pub fn write_ip(self, ip: Ipv4Addr) -> Self {
        let mut octets = ip.octets();
        octets.reverse();
        self.write_bytes(&octets)
    }

    pub fn build(mut self) -> Vec<u8> {
        let len = (self.bytes.len() - LEN_SIZE) as i32;
        self.bytes[..LEN_SIZE].copy_from_slice(&len.to_le_bytes());
        self.bytes
    }
}

/// Cursor over one complete envelope.
#[derive(Debug)]
pub struct MessageReader<'a> {
    bytes: &'a [u8],
    code: i32,
    position: usize,
}

impl<'a> MessageReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(SoulseekError::MessageRead(format!(
                "message of {} bytes is shorter than the {HEADER_SIZE} byte header",
                bytes.len()
            )));
        }
        let length = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let payload = payload_len(length)?;
        if HEADER_SIZE + payload != bytes.len() {
            return Err(SoulseekError::MessageRead(format!(
                "message length {length} does not match {} bytes received",
                bytes.len()
            )));
        }
        let code = i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(Self {
            bytes,
            code,
            position: HEADER_SIZE,
        })
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn has_more_data(&self) -> bool {
        self.position < self.bytes.len()
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.remaining() < count {
            return Err(SoulseekError::MessageRead(format!(
                "requested {count} bytes with only {} remaining",
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        self.take(count)
    }

    pub fn read_integer(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_long(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(i64::from_le_bytes(buf))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_integer()?;
        if len < 0 {
            return Err(SoulseekError::MessageRead(format!(
                "negative string length {len}"
            )));
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| SoulseekError::MessageRead(format!("invalid utf-8 string: {e}")))
    }

    pub fn read_ip(&mut self) -> Result<Ipv4Addr> {
        let b = self.take(4)?;
        Ok(Ipv4Addr::new(b[3], b[2], b[1], b[0]))
    }
}

/// Read just the code of a complete envelope.
pub fn peek_code(bytes: &[u8]) -> Result<i32> {
    MessageReader::new(bytes).map(|r| r.code())
}
