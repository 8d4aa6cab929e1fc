//! In-memory link driver
//!
//! [`memory_link`] returns a driver to hand to the connection state machine
//! and a [`MemoryPeer`] that plays the remote device: it sees every write,
//! can inject notifications and can take the link down.

use crate::link::{LinkDriver, LinkEvent};
use crate::peer::{ConnDesc, PeerAddr};
use async_trait::async_trait;
use mgmt_core::{MgmtError, MgmtResult};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

/// Behaviour of an in-memory link
#[derive(Debug, Clone)]
pub struct MemoryLinkConfig {
    /// ATT MTU reported for every connection
    pub att_mtu: u16,
    pub encrypted: bool,
    /// Delay before a connect attempt resolves
    pub connect_delay: Option<Duration>,
}

impl Default for MemoryLinkConfig {
    fn default() -> Self {
        Self {
            att_mtu: 185,
            encrypted: false,
            connect_delay: None,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    events: Option<mpsc::UnboundedSender<LinkEvent>>,
    fail_connects: u32,
    hold_disconnect: bool,
    disconnect_held: bool,
    connects: u32,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Create a connected driver/peer pair
pub fn memory_link(config: MemoryLinkConfig) -> (MemoryLink, MemoryPeer) {
    let shared = Arc::new(Mutex::new(Shared::default()));
    let (writes_tx, writes_rx) = mpsc::unbounded_channel();
    (
        MemoryLink {
            config,
            shared: Arc::clone(&shared),
            writes: writes_tx,
        },
        MemoryPeer {
            shared,
            writes: Arc::new(tokio::sync::Mutex::new(writes_rx)),
        },
    )
}

/// Driver side of an in-memory link
#[derive(Debug)]
pub struct MemoryLink {
    config: MemoryLinkConfig,
    shared: Arc<Mutex<Shared>>,
    writes: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl LinkDriver for MemoryLink {
    async fn connect(
        &mut self,
        peer: &PeerAddr,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> MgmtResult<ConnDesc> {
        let (fail, conn_handle) = {
            let mut shared = lock(&self.shared);
            shared.connects += 1;
            let fail = shared.fail_connects > 0;
            if fail {
                shared.fail_connects -= 1;
            }
            (fail, shared.connects as u16)
        };

        if let Some(delay) = self.config.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "peer not reachable").into());
        }

        lock(&self.shared).events = Some(events);
        Ok(ConnDesc {
            conn_handle,
            peer: *peer,
            att_mtu: self.config.att_mtu,
            encrypted: self.config.encrypted,
        })
    }

    async fn write(&mut self, data: &[u8]) -> MgmtResult<()> {
        if lock(&self.shared).events.is_none() {
            return Err(MgmtError::Disconnected("memory link not connected".to_string()));
        }
        self.writes
            .send(data.to_vec())
            .map_err(|_| MgmtError::Disconnected("memory peer dropped".to_string()))
    }

    async fn disconnect(&mut self) -> MgmtResult<()> {
        let mut shared = lock(&self.shared);
        if shared.hold_disconnect {
            shared.disconnect_held = true;
            return Ok(());
        }
        if let Some(events) = shared.events.take() {
            let _ = events.send(LinkEvent::Down(None));
        }
        Ok(())
    }
}

/// Device side of an in-memory link
#[derive(Debug, Clone)]
pub struct MemoryPeer {
    shared: Arc<Mutex<Shared>>,
    writes: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl MemoryPeer {
    /// Next payload written by the host; `None` once the driver is gone
    pub async fn recv_write(&self) -> Option<Vec<u8>> {
        self.writes.lock().await.recv().await
    }

    /// Send a notification to the host
    ///
    /// Returns `false` if no link is up.
    pub fn notify(&self, data: Vec<u8>) -> bool {
        match &lock(&self.shared).events {
            Some(events) => events.send(LinkEvent::Data(data)).is_ok(),
            None => false,
        }
    }

    /// Take the link down from the device side
    pub fn drop_link(&self) -> bool {
        match lock(&self.shared).events.take() {
            Some(events) => events
                .send(LinkEvent::Down(Some(MgmtError::Disconnected(
                    "link lost".to_string(),
                ))))
                .is_ok(),
            None => false,
        }
    }

    /// Make the next `count` connect attempts fail
    pub fn fail_next_connects(&self, count: u32) {
        lock(&self.shared).fail_connects = count;
    }

    /// Accept disconnect requests without completing them
    pub fn hold_disconnect(&self) {
        lock(&self.shared).hold_disconnect = true;
    }

    /// Complete a held disconnect request
    ///
    /// Returns `false` if no disconnect was pending.
    pub fn release_disconnect(&self) -> bool {
        let mut shared = lock(&self.shared);
        shared.hold_disconnect = false;
        if !std::mem::take(&mut shared.disconnect_held) {
            return false;
        }
        match shared.events.take() {
            Some(events) => events.send(LinkEvent::Down(None)).is_ok(),
            None => false,
        }
    }

    /// Number of connect attempts seen so far
    pub fn connect_count(&self) -> u32 {
        lock(&self.shared).connects
    }

    /// Check if the driver currently holds a link
    pub fn is_connected(&self) -> bool {
        lock(&self.shared).events.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::{ConnectionFsm, DisconnectKind, FsmParams};
    use crate::state::LinkState;

    fn params() -> FsmParams {
        FsmParams::new(PeerAddr::new([0xaa, 0, 0, 0, 0, 1], Default::default()))
    }

    #[tokio::test]
    async fn test_write_and_notify() {
        let (link, peer) = memory_link(MemoryLinkConfig::default());
        let (fsm, mut events) = ConnectionFsm::spawn(Box::new(link), params());
        fsm.start().await.unwrap();
        fsm.wait_open(None).await.unwrap();
        assert!(peer.is_connected());

        fsm.write(vec![1, 2, 3]).await.unwrap();
        assert_eq!(peer.recv_write().await.unwrap(), vec![1, 2, 3]);

        assert!(peer.notify(vec![9]));
        assert_eq!(events.data.recv().await.unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn test_connect_retries_until_success() {
        let (link, peer) = memory_link(MemoryLinkConfig::default());
        peer.fail_next_connects(2);

        let (fsm, _events) = ConnectionFsm::spawn(Box::new(link), params().with_conn_tries(3));
        fsm.start().await.unwrap();
        fsm.wait_open(None).await.unwrap();
        assert_eq!(peer.connect_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let config = MemoryLinkConfig {
            connect_delay: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let (link, peer) = memory_link(config);
        let params = params()
            .with_conn_tries(2)
            .with_connect_timeout(Duration::from_secs(1));

        let (fsm, mut events) = ConnectionFsm::spawn(Box::new(link), params);
        fsm.start().await.unwrap();

        let ev = events.disconnects.recv().await.unwrap();
        assert_eq!(ev.kind, DisconnectKind::Unopened);
        assert!(matches!(ev.err, Some(MgmtError::Timeout)));
        assert_eq!(peer.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_connect() {
        let config = MemoryLinkConfig {
            connect_delay: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let (link, _peer) = memory_link(config);
        let (fsm, mut events) = ConnectionFsm::spawn(Box::new(link), params());
        fsm.start().await.unwrap();
        assert_eq!(fsm.state(), LinkState::Connecting);

        assert!(fsm.stop().await.unwrap());
        let ev = events.disconnects.recv().await.unwrap();
        assert_eq!(ev.kind, DisconnectKind::Requested);
        assert!(fsm.is_closed());
    }

    #[tokio::test]
    async fn test_held_disconnect() {
        let (link, peer) = memory_link(MemoryLinkConfig::default());
        peer.hold_disconnect();

        let (fsm, mut events) = ConnectionFsm::spawn(Box::new(link), params());
        fsm.start().await.unwrap();
        fsm.wait_open(None).await.unwrap();

        assert!(!fsm.stop().await.unwrap());
        assert_eq!(fsm.state(), LinkState::Disconnecting);
        assert!(events.disconnects.try_recv().is_err());

        assert!(peer.release_disconnect());
        let ev = events.disconnects.recv().await.unwrap();
        assert_eq!(ev.kind, DisconnectKind::Requested);
    }

    #[tokio::test]
    async fn test_reconnect_after_close() {
        let (link, peer) = memory_link(MemoryLinkConfig::default());
        let (fsm, mut events) = ConnectionFsm::spawn(Box::new(link), params());
        fsm.start().await.unwrap();
        fsm.wait_open(None).await.unwrap();

        assert!(peer.drop_link());
        assert_eq!(
            events.disconnects.recv().await.unwrap().kind,
            DisconnectKind::Opened
        );

        fsm.start().await.unwrap();
        fsm.wait_open(None).await.unwrap();
        assert_eq!(fsm.conn_info().unwrap().conn_handle, 2);
    }
}
