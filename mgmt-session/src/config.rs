//! Session configuration

use mgmt_codec::Framing;
use mgmt_core::MgmtError;
use mgmt_transport::{FsmParams, PeerAddr};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default time `close` waits for the link to go down
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Passed to the close callback when an open session loses its link
#[derive(Debug, Clone)]
pub struct SessionClosed {
    pub peer: PeerAddr,
    pub err: Option<MgmtError>,
}

/// Called when an open session's link goes down unrequested
pub type CloseCallback = Arc<dyn Fn(&SessionClosed) + Send + Sync>;

/// Configuration of a [`crate::BleSession`]
///
/// # Example
/// ```ignore
/// let config = SessionConfig::new(peer)
///     .with_framing(Framing::Oic)
///     .with_close_timeout(Duration::from_secs(5))
///     .on_close(|closed| log::warn!("{} went away", closed.peer));
/// ```
#[derive(Clone)]
pub struct SessionConfig {
    pub framing: Framing,
    /// Zero waits without bound
    pub close_timeout: Duration,
    pub on_close: Option<CloseCallback>,
    pub fsm: FsmParams,
}

impl SessionConfig {
    /// Create a configuration for `peer`
    ///
    /// # Arguments
    ///
    /// * `peer` - Device the session connects to
    ///
    /// Defaults to plain framing, a 30 second close timeout, one connection
    /// attempt and no close callback.
    pub fn new(peer: PeerAddr) -> Self {
        Self {
            framing: Framing::default(),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            on_close: None,
            fsm: FsmParams::new(peer),
        }
    }

    /// Set the framing
    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    /// Set how long `close` waits for the link to go down
    ///
    /// # Arguments
    ///
    /// * `timeout` - Wait limit; `Duration::ZERO` waits without bound
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Set the number of connection attempts per open
    pub fn with_conn_tries(mut self, conn_tries: u32) -> Self {
        self.fsm.conn_tries = conn_tries;
        self
    }

    /// Set the limit for a single connection attempt
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.fsm.connect_timeout = Some(timeout);
        self
    }

    /// Set the close callback
    pub fn on_close<F>(mut self, callback: F) -> Self
    where
        F: Fn(&SessionClosed) + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("framing", &self.framing)
            .field("close_timeout", &self.close_timeout)
            .field("on_close", &self.on_close.is_some())
            .field("fsm", &self.fsm)
            .finish()
    }
}
