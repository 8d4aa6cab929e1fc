//! mgmt - device management over connection-oriented links
//!
//! Issues request/response management commands to an embedded peer over
//! BLE, with correct timeout, cancellation and shutdown semantics.
//!
//! # Architecture
//!
//! This library is organized as a workspace with multiple crates:
//!
//! - `mgmt-core`: Error type, transmit options, correlation registry
//! - `mgmt-codec`: Management message, CoAP, OMP and resource codecs
//! - `mgmt-transport`: Link drivers and the connection state machine
//! - `mgmt-session`: Sessions (request/response over a link)
//! - `mgmt-client`: Command layer (sequence numbers, retries, commands)
//!
//! # Usage
//!
//! ```rust,ignore
//! use mgmt::client::{EchoCmd, SeqAllocator, SessionBuilder};
//! use mgmt::session::Session;
//! use mgmt::TxConfig;
//!
//! let session = SessionBuilder::new()
//!     .peer("c4:7c:8d:6a:01:02")
//!     .build(Box::new(driver))?;
//! session.open().await?;
//! session.wait_open(Some(Duration::from_secs(10))).await?;
//!
//! let opts = TxConfig::default().tx_options();
//! let text = EchoCmd::new("hello").run(&session, &SeqAllocator::new(), opts).await?;
//! session.close().await?;
//! ```

pub use mgmt_core::{MgmtError, MgmtResult, TxConfig, TxOptions};

pub mod codec {
    pub use mgmt_codec::*;
}

pub mod transport {
    pub use mgmt_transport::*;
}

pub mod session {
    pub use mgmt_session::*;
}

pub mod client {
    pub use mgmt_client::*;
}
