//! Wire codecs for the device management stack
//!
//! This crate provides stateless encode/decode functions for the management
//! message and the two framings it travels in: bare (plain) and CoAP-wrapped
//! (OMP, plus token-correlated resource GETs).

pub mod coap;
pub mod framing;
pub mod nmp;
pub mod oic;
pub mod omp;

pub use coap::{CoapCode, CoapMessage, CoapOption, Token, TokenGenerator};
pub use framing::{Framing, BLE_ATT_ATTR_MAX_LEN, BLE_ATT_MTU_DFLT, NOTIFY_CMD_BASE_SZ, WRITE_CMD_BASE_SZ};
pub use nmp::{NmpHdr, NmpMsg, NmpOp, NMP_HDR_SIZE};
pub use omp::{OMP_MSG_OVERHEAD, OMP_URI};
