//! Transport layer for the device management stack
//!
//! This crate provides the link driver interface, the connection state
//! machine that owns a driver, and an in-memory driver.

pub mod fsm;
pub mod link;
pub mod memory;
pub mod peer;
pub mod state;

pub use fsm::{ConnectionFsm, DisconnectEvent, DisconnectKind, FsmEvents, FsmParams, LinkStatus};
pub use link::{LinkDriver, LinkEvent};
pub use memory::{memory_link, MemoryLink, MemoryLinkConfig, MemoryPeer};
pub use peer::{AddrType, ConnDesc, PeerAddr};
pub use state::LinkState;
