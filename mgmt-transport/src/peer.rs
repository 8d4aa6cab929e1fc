//! Peer addressing and connection descriptors

use mgmt_core::MgmtError;
use std::fmt;
use std::str::FromStr;

/// Bluetooth device address type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddrType {
    #[default]
    Public,
    Random,
}

/// Address of the peer device
///
/// Displayed and parsed as six colon-separated hex octets, most significant
/// first (`"c4:7c:8d:6a:01:02"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PeerAddr {
    pub bytes: [u8; 6],
    pub addr_type: AddrType,
}

impl PeerAddr {
    /// Create an address from its six bytes, most significant first
    pub fn new(bytes: [u8; 6], addr_type: AddrType) -> Self {
        Self { bytes, addr_type }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.bytes;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for PeerAddr {
    type Err = MgmtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MgmtError::InvalidData(format!("Invalid peer address: {:?}", s));

        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self {
            bytes,
            addr_type: AddrType::Public,
        })
    }
}

/// Description of an established connection
///
/// Only meaningful while the link is connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnDesc {
    /// Link-layer connection handle
    pub conn_handle: u16,
    /// Address of the connected peer
    pub peer: PeerAddr,
    /// Negotiated ATT MTU
    pub att_mtu: u16,
    /// Whether the link is encrypted
    pub encrypted: bool,
}
