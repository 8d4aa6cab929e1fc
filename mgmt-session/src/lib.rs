//! Session layer for the device management stack
//!
//! This crate turns a connection state machine plus a framing into a
//! request/response [`Session`]:
//! - correlation of inbound responses by sequence number or CoAP token
//! - reassembly of plain frames split over several notifications
//! - single-waiter close synchronization
//! - the owner's close callback for unrequested link loss

pub mod close_wait;
pub mod config;
pub mod reassembly;
mod receiver;
pub mod session;
pub mod statistics;

pub use close_wait::{CloseWait, CloseWaitGuard};
pub use config::{CloseCallback, SessionClosed, SessionConfig, DEFAULT_CLOSE_TIMEOUT};
pub use reassembly::FrameReassembler;
pub use session::{BleSession, Session};
pub use statistics::SessionStatistics;
