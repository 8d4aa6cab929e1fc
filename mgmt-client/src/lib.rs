//! Command layer for the device management stack
//!
//! This crate builds sessions and runs commands on them:
//! - [`SessionBuilder`] for configuring a [`mgmt_session::BleSession`]
//! - [`SeqAllocator`] for per-session sequence numbers
//! - [`run_with_retries`], which applies `TxOptions::tries`
//! - the echo command

pub mod builder;
pub mod command;
pub mod echo;
pub mod seq;

pub use builder::SessionBuilder;
pub use command::run_with_retries;
pub use echo::{decode_echo_rsp, EchoCmd};
pub use seq::SeqAllocator;
