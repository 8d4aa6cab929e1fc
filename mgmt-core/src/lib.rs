//! Core types for the device management stack
//!
//! This crate provides the error type, per-call transmit options and the
//! correlation registry shared by the transport and session layers.

pub mod correlation;
pub mod error;
pub mod options;

pub use correlation::{CorrelationRegistry, DeliverySlot};
pub use error::{MgmtError, MgmtResult};
pub use options::{wait_bounded, TxConfig, TxOptions, DEFAULT_TX_TIMEOUT};
