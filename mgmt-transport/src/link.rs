//! Link driver interface

use crate::peer::{ConnDesc, PeerAddr};
use async_trait::async_trait;
use mgmt_core::{MgmtError, MgmtResult};
use tokio::sync::mpsc;

/// Event reported by a link driver after a successful connect
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Inbound bytes (one notification)
    Data(Vec<u8>),
    /// The link went down; `None` for an orderly disconnect
    Down(Option<MgmtError>),
}

/// Physical link access used by the connection state machine
///
/// A driver performs one connection at a time. Everything it learns about
/// an established link (inbound data, link loss, completion of a
/// requested disconnect) is reported through the event sender handed to
/// [`LinkDriver::connect`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LinkDriver: Send + Sync {
    /// Establish a link to `peer`
    ///
    /// # Arguments
    ///
    /// * `peer` - Address of the device to connect to
    /// * `events` - Sink for events of this connection
    ///
    /// # Returns
    ///
    /// Description of the established connection
    async fn connect(
        &mut self,
        peer: &PeerAddr,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> MgmtResult<ConnDesc>;

    /// Write one outgoing payload
    async fn write(&mut self, data: &[u8]) -> MgmtResult<()>;

    /// Begin tearing the link down
    ///
    /// Completion is reported later as [`LinkEvent::Down`].
    async fn disconnect(&mut self) -> MgmtResult<()>;
}
