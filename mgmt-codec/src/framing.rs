//! Framing variants and link payload limits

use crate::coap::Token;
use crate::nmp::{NmpMsg, NMP_HDR_SIZE};
use crate::omp::{self, OMP_MSG_OVERHEAD};
use mgmt_core::MgmtResult;

/// ATT write command overhead (opcode + handle)
pub const WRITE_CMD_BASE_SZ: usize = 3;
/// ATT notification overhead (opcode + handle)
pub const NOTIFY_CMD_BASE_SZ: usize = 3;
/// Maximum length of an ATT attribute value
pub const BLE_ATT_ATTR_MAX_LEN: usize = 512;
/// ATT MTU before any exchange
pub const BLE_ATT_MTU_DFLT: u16 = 23;

/// How management messages are framed on the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// Bare management header + body
    #[default]
    Plain,
    /// Management messages inside CoAP (OMP); also supports resource GETs
    Oic,
}

impl Framing {
    /// Bytes added around a management body by this framing
    pub fn overhead(&self) -> usize {
        match self {
            Framing::Plain => NMP_HDR_SIZE,
            Framing::Oic => OMP_MSG_OVERHEAD + NMP_HDR_SIZE,
        }
    }

    /// Encode a management request for the wire
    ///
    /// `token` is only used by the CoAP framing.
    pub fn encode_nmp(&self, msg: &NmpMsg, token: Token) -> MgmtResult<Vec<u8>> {
        match self {
            Framing::Plain => msg.encode(),
            Framing::Oic => omp::encode_omp(msg, token),
        }
    }

    /// Largest management body that fits one outgoing write
    pub fn max_outgoing_payload(&self, att_mtu: u16) -> usize {
        let mtu = (att_mtu as usize)
            .saturating_sub(WRITE_CMD_BASE_SZ)
            .saturating_sub(self.overhead());
        mtu.min(BLE_ATT_ATTR_MAX_LEN)
    }

    /// Largest management body that fits one incoming notification
    pub fn max_incoming_payload(&self, att_mtu: u16) -> usize {
        (att_mtu as usize)
            .saturating_sub(NOTIFY_CMD_BASE_SZ)
            .saturating_sub(self.overhead())
    }

    /// Name used in logs and configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            Framing::Plain => "plain",
            Framing::Oic => "oic",
        }
    }
}
