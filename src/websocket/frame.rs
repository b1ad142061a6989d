//! WebSocket frame encoding and decoding (RFC 6455 §5).
//!
//! Only what an ndt7 client needs: no extensions, so the RSV bits must be
//! clear, and frames from the server must not be masked.

use super::Error;
use std::io::Read;

/// Maximum payload size for control frames.
pub const MAX_CONTROL_FRAME_PAYLOAD: usize = 125;

/// Close code for a normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code reported when a Close frame carries no status.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// WebSocket frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    /// Create OpCode from the low nibble of the first header byte.
    pub fn from_u8(byte: u8) -> Result<Self, Error> {
        match byte {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(Error::Protocol(format!("reserved opcode {:#x}", other))),
        }
    }

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Control frames: Close, Ping, Pong.
    #[inline]
    pub const fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload_len: u64,
}

impl FrameHeader {
    /// Read and validate one frame header from a server.
    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let mut head = [0u8; 2];
        reader.read_exact(&mut head)?;

        let fin = (head[0] & 0x80) != 0;
        if head[0] & 0x70 != 0 {
            return Err(Error::Protocol("reserved bits set".into()));
        }
        let opcode = OpCode::from_u8(head[0] & 0x0F)?;

        if head[1] & 0x80 != 0 {
            return Err(Error::Protocol("server frames must not be masked".into()));
        }

        let payload_len = match head[1] & 0x7F {
            126 => {
                let mut ext = [0u8; 2];
                reader.read_exact(&mut ext)?;
                u16::from_be_bytes(ext) as u64
            }
            127 => {
                let mut ext = [0u8; 8];
                reader.read_exact(&mut ext)?;
                let len = u64::from_be_bytes(ext);
                if len >> 63 != 0 {
                    return Err(Error::Protocol("payload length MSB set".into()));
                }
                len
            }
            len => len as u64,
        };

        if opcode.is_control() {
            if !fin {
                return Err(Error::Protocol(
                    "control frames cannot be fragmented".into(),
                ));
            }
            if payload_len > MAX_CONTROL_FRAME_PAYLOAD as u64 {
                return Err(Error::Protocol(format!(
                    "control frame payload too large: {}",
                    payload_len
                )));
            }
        }

        Ok(Self { fin, opcode, payload_len })
    }
}

/// XOR `data` with the 4-byte masking key.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Encode a single final frame into `out`, replacing its contents.
///
/// Clients pass `Some(mask)`; a server (only in tests) passes `None`.
pub fn encode_frame(
    out: &mut Vec<u8>,
    opcode: OpCode,
    payload: &[u8],
    mask: Option<[u8; 4]>,
) {
    out.clear();
    out.reserve(payload.len() + 14);
    out.push(0x80 | opcode.as_u8());

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    let len = payload.len();
    if len < 126 {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    let start = match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            out.len()
        }
        None => out.len(),
    };
    out.extend_from_slice(payload);
    if let Some(key) = mask {
        apply_mask(&mut out[start..], key);
    }
}

/// Build a Close frame payload: big-endian code followed by the reason.
pub fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload.truncate(MAX_CONTROL_FRAME_PAYLOAD);
    payload
}

/// Split a Close frame payload into code and reason.
pub fn parse_close_payload(payload: &[u8]) -> Result<(u16, String), Error> {
    match payload.len() {
        0 => Ok((CLOSE_NO_STATUS, String::new())),
        1 => Err(Error::Protocol("close payload of one byte".into())),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
            Ok((code, reason))
        }
    }
}
