//! Session builder
//!
//! ```rust,ignore
//! use mgmt_client::SessionBuilder;
//!
//! let session = SessionBuilder::new()
//!     .peer("c4:7c:8d:6a:01:02")
//!     .oic()
//!     .close_timeout(Duration::from_secs(5))
//!     .build(Box::new(driver))?;
//! ```

use mgmt_codec::Framing;
use mgmt_core::{MgmtError, MgmtResult};
use mgmt_session::{BleSession, SessionClosed, SessionConfig};
use mgmt_transport::{AddrType, LinkDriver, PeerAddr};
use std::sync::Arc;
use std::time::Duration;

/// Builder for [`BleSession`]
///
/// The peer address is required; everything else has a default.
#[derive(Default)]
pub struct SessionBuilder {
    peer: Option<String>,
    random_addr: bool,
    framing: Framing,
    close_timeout: Option<Duration>,
    conn_tries: Option<u32>,
    connect_timeout: Option<Duration>,
    on_close: Option<Arc<dyn Fn(&SessionClosed) + Send + Sync>>,
}

impl SessionBuilder {
    /// Create a builder with default settings and no peer
    pub fn new() -> Self {
        Self::default()
    }

    /// Peer address as six colon-separated hex octets
    pub fn peer(mut self, addr: &str) -> Self {
        self.peer = Some(addr.to_string());
        self
    }

    /// Treat the peer address as a random address
    pub fn random_addr(mut self) -> Self {
        self.random_addr = true;
        self
    }

    /// Use the CoAP framing
    pub fn oic(mut self) -> Self {
        self.framing = Framing::Oic;
        self
    }

    /// Set the framing used on the link
    pub fn framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    /// Set how long `close` waits for the link to go down
    ///
    /// # Arguments
    ///
    /// * `timeout` - Wait limit; `Duration::ZERO` waits without bound
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = Some(timeout);
        self
    }

    /// Set the number of connection attempts per open
    pub fn conn_tries(mut self, tries: u32) -> Self {
        self.conn_tries = Some(tries);
        self
    }

    /// Set the limit for a single connection attempt
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the callback run when an open session loses its link unasked
    ///
    /// The callback runs on the session's dispatcher task and must not block.
    pub fn on_close<F>(mut self, callback: F) -> Self
    where
        F: Fn(&SessionClosed) + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(callback));
        self
    }

    /// Build the session configuration
    ///
    /// # Errors
    /// `MgmtError::InvalidData` if no peer was set or it does not parse.
    pub fn config(&self) -> MgmtResult<SessionConfig> {
        let addr = self
            .peer
            .as_deref()
            .ok_or_else(|| MgmtError::InvalidData("peer address not set".to_string()))?;
        let mut peer: PeerAddr = addr.parse()?;
        if self.random_addr {
            peer.addr_type = AddrType::Random;
        }

        let mut config = SessionConfig::new(peer).with_framing(self.framing);
        if let Some(timeout) = self.close_timeout {
            config = config.with_close_timeout(timeout);
        }
        if let Some(tries) = self.conn_tries {
            config = config.with_conn_tries(tries);
        }
        if let Some(timeout) = self.connect_timeout {
            config = config.with_connect_timeout(timeout);
        }
        config.on_close = self.on_close.clone();
        Ok(config)
    }

    /// Create an unopened session on `driver`
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self, driver: Box<dyn LinkDriver>) -> MgmtResult<BleSession> {
        Ok(BleSession::new(driver, self.config()?))
    }
}
