//! Link connection states

use mgmt_core::{MgmtError, MgmtResult};
use std::fmt;

/// Connection state of a link
///
/// # State Transitions
/// ```text
/// Idle -> Connecting (on start)
/// Closed -> Connecting (on start)
/// Connecting -> Connected (link established)
/// Connecting -> Closed (all attempts failed, or stopped)
/// Connected -> Disconnecting (on stop)
/// Connected -> Closed (link lost)
/// Disconnecting -> Closed (teardown complete)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// Never started
    #[default]
    Idle,
    /// Connection attempt in progress
    Connecting,
    /// Link established, data can flow
    Connected,
    /// Teardown requested, waiting for the link to report down
    Disconnecting,
    /// Link down after having been started
    Closed,
}

impl LinkState {
    /// Check if the link is fully open
    pub fn is_open(&self) -> bool {
        matches!(self, LinkState::Connected)
    }

    /// Check if the link is fully torn down (or was never started)
    pub fn is_closed(&self) -> bool {
        matches!(self, LinkState::Idle | LinkState::Closed)
    }

    /// Check if a start request is accepted in this state
    pub fn can_start(&self) -> bool {
        self.is_closed()
    }

    /// Validate state transition
    ///
    /// # Returns
    /// `Ok(())` if transition is valid, `Err` otherwise
    pub fn validate_transition(&self, new_state: LinkState) -> MgmtResult<()> {
        let valid = matches!(
            (*self, new_state),
            (LinkState::Idle, LinkState::Connecting)
                | (LinkState::Closed, LinkState::Connecting)
                | (LinkState::Connecting, LinkState::Connected)
                | (LinkState::Connecting, LinkState::Closed)
                | (LinkState::Connected, LinkState::Disconnecting)
                | (LinkState::Connected, LinkState::Closed)
                | (LinkState::Disconnecting, LinkState::Closed)
        );

        if valid {
            Ok(())
        } else {
            Err(MgmtError::InvalidData(format!(
                "Invalid link state transition: {} -> {}",
                self, new_state
            )))
        }
    }

    /// Get human-readable state name
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Idle => "Idle",
            LinkState::Connecting => "Connecting",
            LinkState::Connected => "Connected",
            LinkState::Disconnecting => "Disconnecting",
            LinkState::Closed => "Closed",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
