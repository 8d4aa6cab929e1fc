//! Per-call transmit options and the configuration they are built from

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Default time to wait for a response
pub const DEFAULT_TX_TIMEOUT: Duration = Duration::from_secs(10);

/// Options for a single request/response exchange
///
/// `TxOptions` is a plain value passed to every transmit call. It is never
/// stored in a session.
///
/// # Fields
/// - `timeout`: how long to wait for the response. `Duration::ZERO` means
///   wait forever.
/// - `tries`: how many attempts the command layer may make. The session
///   itself always performs exactly one attempt per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOptions {
    pub timeout: Duration,
    pub tries: u32,
}

impl TxOptions {
    /// Create options with the given timeout and a single try
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, tries: 1 }
    }

    /// Set the number of tries
    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = tries;
        self
    }

    /// The bounded wait duration, or `None` for an unbounded wait
    pub fn deadline(&self) -> Option<Duration> {
        if self.timeout.is_zero() {
            None
        } else {
            Some(self.timeout)
        }
    }
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TX_TIMEOUT,
            tries: 1,
        }
    }
}

/// Transmit configuration
///
/// Built once (from a config file, command-line flags, ...) and threaded to
/// every call site, where [`TxConfig::tx_options`] produces the per-call
/// [`TxOptions`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxConfig {
    /// Response timeout in (fractional) seconds, 0 to wait forever
    pub timeout_secs: f64,
    /// Number of attempts per command
    pub tries: u32,
}

impl TxConfig {
    /// Build per-call transmit options
    ///
    /// Negative, non-finite and out-of-range timeouts are treated as "wait
    /// forever".
    pub fn tx_options(&self) -> TxOptions {
        let timeout = if self.timeout_secs > 0.0 {
            Duration::try_from_secs_f64(self.timeout_secs).unwrap_or(Duration::ZERO)
        } else {
            Duration::ZERO
        };
        TxOptions {
            timeout,
            tries: self.tries.max(1),
        }
    }
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TX_TIMEOUT.as_secs_f64(),
            tries: 1,
        }
    }
}

/// Await `fut`, giving up after `limit`
///
/// Returns `None` if the limit elapsed first. `None` as the limit waits
/// without bound.
pub async fn wait_bounded<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}
