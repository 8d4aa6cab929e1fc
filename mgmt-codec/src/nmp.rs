//! Management message (header + CBOR body)
//!
//! # Header Format
//! ```text
//! Op (1 byte) | Flags (1 byte) | Length (2 bytes, BE) |
//! Group (2 bytes, BE) | Sequence (1 byte) | Id (1 byte)
//! ```
//! The header is followed by `Length` bytes of CBOR-encoded body.

use mgmt_core::{MgmtError, MgmtResult};

/// Management header length
pub const NMP_HDR_SIZE: usize = 8;

/// Management operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NmpOp {
    Read = 0,
    ReadRsp = 1,
    Write = 2,
    WriteRsp = 3,
}

impl NmpOp {
    /// Parse an operation byte
    pub fn from_u8(value: u8) -> MgmtResult<Self> {
        match value {
            0 => Ok(NmpOp::Read),
            1 => Ok(NmpOp::ReadRsp),
            2 => Ok(NmpOp::Write),
            3 => Ok(NmpOp::WriteRsp),
            other => Err(MgmtError::Decode(format!("Invalid management op: {}", other))),
        }
    }

    /// Check if this op is a response
    pub fn is_response(&self) -> bool {
        matches!(self, NmpOp::ReadRsp | NmpOp::WriteRsp)
    }

    /// The op a peer answers this request with
    pub fn response(&self) -> NmpOp {
        match self {
            NmpOp::Read | NmpOp::ReadRsp => NmpOp::ReadRsp,
            NmpOp::Write | NmpOp::WriteRsp => NmpOp::WriteRsp,
        }
    }
}

/// Management header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NmpHdr {
    pub op: NmpOp,
    pub flags: u8,
    pub len: u16,
    pub group: u16,
    pub seq: u8,
    pub id: u8,
}

impl NmpHdr {
    /// Encode header to bytes (big-endian)
    pub fn encode(&self) -> [u8; NMP_HDR_SIZE] {
        let len = self.len.to_be_bytes();
        let group = self.group.to_be_bytes();
        [
            self.op as u8,
            self.flags,
            len[0],
            len[1],
            group[0],
            group[1],
            self.seq,
            self.id,
        ]
    }

    /// Decode header from the first 8 bytes of `data`
    pub fn decode(data: &[u8]) -> MgmtResult<Self> {
        if data.len() < NMP_HDR_SIZE {
            return Err(MgmtError::Decode(format!(
                "Management header too short: expected {}, got {}",
                NMP_HDR_SIZE,
                data.len()
            )));
        }

        Ok(Self {
            op: NmpOp::from_u8(data[0])?,
            flags: data[1],
            len: u16::from_be_bytes([data[2], data[3]]),
            group: u16::from_be_bytes([data[4], data[5]]),
            seq: data[6],
            id: data[7],
        })
    }
}

/// Management message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NmpMsg {
    pub hdr: NmpHdr,
    pub body: Vec<u8>,
}

impl NmpMsg {
    /// Create a message; the header length is taken from `body`
    ///
    /// # Errors
    /// Returns `MgmtError::Encode` if the body does not fit the 16-bit
    /// length field.
    pub fn new(op: NmpOp, group: u16, id: u8, seq: u8, body: Vec<u8>) -> MgmtResult<Self> {
        let len = u16::try_from(body.len()).map_err(|_| {
            MgmtError::Encode(format!("Management body too large: {} bytes", body.len()))
        })?;
        Ok(Self {
            hdr: NmpHdr {
                op,
                flags: 0,
                len,
                group,
                seq,
                id,
            },
            body,
        })
    }

    /// Sequence number (the correlation key)
    pub fn seq(&self) -> u8 {
        self.hdr.seq
    }

    /// Encode header followed by body
    pub fn encode(&self) -> MgmtResult<Vec<u8>> {
        if self.hdr.len as usize != self.body.len() {
            return Err(MgmtError::Encode(format!(
                "Header length {} does not match body length {}",
                self.hdr.len,
                self.body.len()
            )));
        }
        let mut result = Vec::with_capacity(NMP_HDR_SIZE + self.body.len());
        result.extend_from_slice(&self.hdr.encode());
        result.extend_from_slice(&self.body);
        Ok(result)
    }

    /// Decode one complete message
    ///
    /// `data` must hold exactly the header and `len` body bytes.
    pub fn decode(data: &[u8]) -> MgmtResult<Self> {
        let hdr = NmpHdr::decode(data)?;
        let expected = NMP_HDR_SIZE + hdr.len as usize;
        if data.len() < expected {
            return Err(MgmtError::Decode(format!(
                "Management message truncated: expected {} bytes, got {}",
                expected,
                data.len()
            )));
        }
        if data.len() > expected {
            return Err(MgmtError::Decode(format!(
                "Trailing bytes after management message: expected {} bytes, got {}",
                expected,
                data.len()
            )));
        }

        Ok(Self {
            hdr,
            body: data[NMP_HDR_SIZE..].to_vec(),
        })
    }
}

/// Sequence number of the message at the start of `data`, if the header is
/// present
pub fn peek_seq(data: &[u8]) -> Option<u8> {
    if data.len() >= NMP_HDR_SIZE {
        Some(data[6])
    } else {
        None
    }
}

/// Total length (header + body) of the message at the start of `data`
pub fn frame_len(data: &[u8]) -> Option<usize> {
    if data.len() >= NMP_HDR_SIZE {
        Some(NMP_HDR_SIZE + u16::from_be_bytes([data[2], data[3]]) as usize)
    } else {
        None
    }
}
