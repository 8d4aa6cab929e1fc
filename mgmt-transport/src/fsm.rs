//! Connection state machine
//!
//! The state machine owns a [`LinkDriver`] and runs on its own task. The
//! [`ConnectionFsm`] handle talks to that task over a command channel; the
//! task reports back through two channels handed out at spawn time
//! ([`FsmEvents`]): raw inbound data, and disconnect notifications.
//!
//! Nothing is ever reported from the context of a `start`/`stop` caller.

use crate::link::{LinkDriver, LinkEvent};
use crate::peer::{ConnDesc, PeerAddr};
use crate::state::LinkState;
use mgmt_core::{wait_bounded, DeliverySlot, MgmtError, MgmtResult};
use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

const COMMAND_QUEUE_DEPTH: usize = 32;

/// Parameters of the connection state machine
#[derive(Debug, Clone)]
pub struct FsmParams {
    /// Device to connect to
    pub peer: PeerAddr,
    /// Connection attempts per start (at least one is made)
    pub conn_tries: u32,
    /// Limit for a single connection attempt; `None` waits for the driver
    pub connect_timeout: Option<Duration>,
}

impl FsmParams {
    /// Create parameters for `peer`
    ///
    /// # Arguments
    ///
    /// * `peer` - Device to connect to
    ///
    /// One connection attempt per start, with no attempt timeout.
    pub fn new(peer: PeerAddr) -> Self {
        Self {
            peer,
            conn_tries: 1,
            connect_timeout: None,
        }
    }

    /// Set the number of connection attempts per start
    ///
    /// Zero is treated as one.
    pub fn with_conn_tries(mut self, conn_tries: u32) -> Self {
        self.conn_tries = conn_tries;
        self
    }

    /// Bound each connection attempt by `timeout`
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

/// Why the link went down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    /// The link never became fully open (connect failure)
    Unopened,
    /// An open link went down without being asked to
    Opened,
    /// Teardown was requested with `stop`
    Requested,
}

/// Disconnect notification
#[derive(Debug, Clone)]
pub struct DisconnectEvent {
    pub kind: DisconnectKind,
    pub peer: PeerAddr,
    pub err: Option<MgmtError>,
}

/// Receiving ends of the state machine's notifications
#[derive(Debug)]
pub struct FsmEvents {
    pub data: mpsc::UnboundedReceiver<Vec<u8>>,
    pub disconnects: mpsc::UnboundedReceiver<DisconnectEvent>,
}

/// Published link status
#[derive(Debug, Clone, Default)]
pub struct LinkStatus {
    pub state: LinkState,
    pub conn: Option<ConnDesc>,
    /// Error of the most recent failed connect or link loss
    pub last_error: Option<MgmtError>,
}

enum Command {
    Start(oneshot::Sender<MgmtResult<()>>),
    Stop(oneshot::Sender<MgmtResult<bool>>),
    Write(Vec<u8>, oneshot::Sender<MgmtResult<()>>),
}

/// Handle to a running connection state machine
///
/// Dropping the handle stops the task; an open link is disconnected
/// without further notifications.
#[derive(Debug)]
pub struct ConnectionFsm {
    cmd_tx: mpsc::Sender<Command>,
    status: watch::Receiver<LinkStatus>,
    peer: PeerAddr,
}

impl ConnectionFsm {
    /// Spawn the state machine task
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(driver: Box<dyn LinkDriver>, params: FsmParams) -> (Self, FsmEvents) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (status_tx, status) = watch::channel(LinkStatus::default());
        let (data_tx, data) = mpsc::unbounded_channel();
        let (disconnect_tx, disconnects) = mpsc::unbounded_channel();

        let peer = params.peer;
        let worker = Worker {
            driver,
            params,
            state: LinkState::Idle,
            conn: None,
            last_error: None,
            cmd_rx,
            deferred: VecDeque::new(),
            link_rx: None,
            status_tx,
            data_tx,
            disconnect_tx,
        };
        tokio::spawn(worker.run());

        (
            Self {
                cmd_tx,
                status,
                peer,
            },
            FsmEvents { data, disconnects },
        )
    }

    /// Start connecting
    ///
    /// Returns as soon as the request is accepted; the link is established
    /// in the background.
    ///
    /// # Errors
    /// `MgmtError::AlreadyOpen` unless the link is idle or closed.
    pub async fn start(&self) -> MgmtResult<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Start(reply), rx).await
    }

    /// Request teardown
    ///
    /// # Returns
    /// `true` if the link is already fully down, `false` if teardown is in
    /// progress and a [`DisconnectKind::Requested`] notification follows.
    ///
    /// # Errors
    /// `MgmtError::NotOpen` if the link was never started.
    pub async fn stop(&self) -> MgmtResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Stop(reply), rx).await
    }

    /// Write `data` to the link
    pub async fn write(&self, data: Vec<u8>) -> MgmtResult<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Write(data, reply), rx).await
    }

    /// Write `data` and wait for the result delivered to `slot`
    ///
    /// # Arguments
    ///
    /// * `data` - Encoded request
    /// * `slot` - Registration the response will be delivered to
    /// * `timeout` - Limit for the write and the wait together; `None` waits
    ///   until a result or a disconnect arrives
    ///
    /// A result delivered to `slot` while the write is still pending (an
    /// abort, say) ends the call right away.
    ///
    /// # Errors
    /// `MgmtError::Timeout` if nothing was delivered in time, otherwise the
    /// write error or the error delivered to the slot.
    pub async fn tx<K, V>(
        &self,
        data: Vec<u8>,
        slot: &mut DeliverySlot<K, V>,
        timeout: Option<Duration>,
    ) -> MgmtResult<V>
    where
        K: Eq + Hash + Clone + Debug,
    {
        let key = slot.key().clone();
        let exchange = async {
            let write = self.write(data);
            tokio::pin!(write);
            tokio::select! {
                biased;
                result = slot.recv() => return result,
                written = &mut write => written?,
            }
            slot.recv().await
        };
        match wait_bounded(timeout, exchange).await {
            Some(result) => result,
            None => {
                log::debug!("No response for {:?} within {:?}", key, timeout);
                Err(MgmtError::Timeout)
            }
        }
    }

    /// Check if the link is fully open
    pub fn is_open(&self) -> bool {
        self.status.borrow().state.is_open()
    }

    /// Check if the link is fully down
    pub fn is_closed(&self) -> bool {
        self.status.borrow().state.is_closed()
    }

    /// Current link state
    pub fn state(&self) -> LinkState {
        self.status.borrow().state
    }

    /// Address of the device this state machine connects to
    pub fn peer(&self) -> PeerAddr {
        self.peer
    }

    /// Description of the current connection
    ///
    /// # Errors
    /// `MgmtError::NotOpen` unless connected.
    pub fn conn_info(&self) -> MgmtResult<ConnDesc> {
        let status = self.status.borrow();
        match (&status.conn, status.state) {
            (Some(conn), LinkState::Connected) => Ok(conn.clone()),
            _ => Err(MgmtError::NotOpen(format!("link is {}", status.state))),
        }
    }

    /// Wait until a started link is established
    ///
    /// # Errors
    /// - `MgmtError::Timeout` if `timeout` elapsed first
    /// - the connect error if establishing the link failed
    /// - `MgmtError::NotOpen` if the link was never started
    pub async fn wait_open(&self, timeout: Option<Duration>) -> MgmtResult<()> {
        let mut status = self.status.clone();
        let wait = async move {
            loop {
                {
                    let current = status.borrow_and_update();
                    match current.state {
                        LinkState::Connected => return Ok(()),
                        LinkState::Idle => {
                            return Err(MgmtError::NotOpen("link not started".to_string()));
                        }
                        LinkState::Closed => {
                            return Err(current.last_error.clone().unwrap_or_else(|| {
                                MgmtError::NotOpen("link closed".to_string())
                            }));
                        }
                        LinkState::Connecting | LinkState::Disconnecting => {}
                    }
                }
                if status.changed().await.is_err() {
                    return Err(MgmtError::Disconnected(
                        "connection task stopped".to_string(),
                    ));
                }
            }
        };
        wait_bounded(timeout, wait)
            .await
            .unwrap_or(Err(MgmtError::Timeout))
    }

    async fn request<T>(
        &self,
        cmd: Command,
        rx: oneshot::Receiver<MgmtResult<T>>,
    ) -> MgmtResult<T> {
        let stopped = || MgmtError::Disconnected("connection task stopped".to_string());
        self.cmd_tx.send(cmd).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }
}

enum Attempt {
    Done(Option<MgmtResult<ConnDesc>>),
    Cancelled(oneshot::Sender<MgmtResult<bool>>),
    OwnerGone,
}

enum WriteOutcome {
    Done(MgmtResult<()>),
    LinkDown(Option<MgmtError>),
    Cancelled,
}

struct Worker {
    driver: Box<dyn LinkDriver>,
    params: FsmParams,
    state: LinkState,
    conn: Option<ConnDesc>,
    last_error: Option<MgmtError>,
    cmd_rx: mpsc::Receiver<Command>,
    /// Commands that arrived while a write was in flight
    deferred: VecDeque<Command>,
    link_rx: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    status_tx: watch::Sender<LinkStatus>,
    data_tx: mpsc::UnboundedSender<Vec<u8>>,
    disconnect_tx: mpsc::UnboundedSender<DisconnectEvent>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let running = if self.state == LinkState::Connecting {
                self.connect().await
            } else {
                self.serve().await
            };
            if !running {
                break;
            }
        }

        if self.state == LinkState::Connected {
            if let Err(e) = self.driver.disconnect().await {
                log::debug!("Disconnect on shutdown failed: {}", e);
            }
        }
        log::debug!("Connection task for {} stopped", self.params.peer);
    }

    /// Handle one command or link event; `false` once the owner is gone
    async fn serve(&mut self) -> bool {
        if let Some(cmd) = self.deferred.pop_front() {
            self.handle_command(cmd).await;
            return true;
        }
        tokio::select! {
            biased;
            event = next_event(&mut self.link_rx) => {
                self.handle_link_event(event);
                true
            }
            cmd = self.cmd_rx.recv() => match cmd {
                Some(cmd) => {
                    self.handle_command(cmd).await;
                    true
                }
                None => false,
            },
        }
    }

    /// Run connection attempts; `false` once the owner is gone
    async fn connect(&mut self) -> bool {
        let tries = self.params.conn_tries.max(1);
        let mut last_err = None;

        for attempt in 1..=tries {
            // A fresh channel per attempt; nothing from an earlier link
            // can leak into this one
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            self.link_rx = Some(events_rx);
            log::debug!(
                "Connecting to {} (attempt {}/{})",
                self.params.peer,
                attempt,
                tries
            );

            let outcome = {
                let pending = wait_bounded(
                    self.params.connect_timeout,
                    self.driver.connect(&self.params.peer, events_tx),
                );
                tokio::pin!(pending);
                loop {
                    tokio::select! {
                        result = &mut pending => break Attempt::Done(result),
                        cmd = self.cmd_rx.recv() => match cmd {
                            Some(Command::Stop(reply)) => break Attempt::Cancelled(reply),
                            Some(other) => reject_while_connecting(other),
                            None => break Attempt::OwnerGone,
                        },
                    }
                }
            };

            match outcome {
                Attempt::Done(Some(Ok(conn))) => {
                    log::info!(
                        "Connected to {} (handle {}, ATT MTU {})",
                        conn.peer,
                        conn.conn_handle,
                        conn.att_mtu
                    );
                    self.conn = Some(conn);
                    self.last_error = None;
                    self.set_state(LinkState::Connected);
                    return true;
                }
                Attempt::Done(Some(Err(e))) => {
                    log::warn!("Connect attempt {}/{} failed: {}", attempt, tries, e);
                    last_err = Some(e);
                }
                Attempt::Done(None) => {
                    log::warn!("Connect attempt {}/{} timed out", attempt, tries);
                    last_err = Some(MgmtError::Timeout);
                }
                Attempt::Cancelled(reply) => {
                    log::debug!("Connect to {} cancelled", self.params.peer);
                    self.link_down(DisconnectKind::Requested, None);
                    let _ = reply.send(Ok(true));
                    return true;
                }
                Attempt::OwnerGone => return false,
            }
        }

        let err = last_err
            .unwrap_or_else(|| MgmtError::Disconnected("no connection attempt made".to_string()));
        self.link_down(DisconnectKind::Unopened, Some(err));
        true
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start(reply) => {
                let result = if self.state.can_start() {
                    self.set_state(LinkState::Connecting);
                    Ok(())
                } else {
                    Err(MgmtError::AlreadyOpen)
                };
                let _ = reply.send(result);
            }
            Command::Stop(reply) => {
                let result = self.stop().await;
                let _ = reply.send(result);
            }
            Command::Write(data, reply) => {
                let result = if self.state == LinkState::Connected {
                    self.write(&data).await
                } else {
                    Err(MgmtError::NotOpen(format!("link is {}", self.state)))
                };
                let _ = reply.send(result);
            }
        }
    }

    /// Write to the driver while still serving the link
    ///
    /// Inbound data keeps flowing during the write. A link loss or a stop
    /// request abandons it; other commands wait until it completes.
    async fn write(&mut self, data: &[u8]) -> MgmtResult<()> {
        let outcome = {
            let pending = self.driver.write(data);
            tokio::pin!(pending);
            loop {
                tokio::select! {
                    biased;
                    event = next_event(&mut self.link_rx) => match event {
                        LinkEvent::Data(data) => {
                            let _ = self.data_tx.send(data);
                        }
                        LinkEvent::Down(err) => break WriteOutcome::LinkDown(err),
                    },
                    result = &mut pending => break WriteOutcome::Done(result),
                    cmd = self.cmd_rx.recv() => match cmd {
                        Some(Command::Start(reply)) => {
                            let _ = reply.send(Err(MgmtError::AlreadyOpen));
                        }
                        Some(Command::Stop(reply)) => {
                            self.deferred.push_front(Command::Stop(reply));
                            break WriteOutcome::Cancelled;
                        }
                        Some(write) => self.deferred.push_back(write),
                        None => break WriteOutcome::Cancelled,
                    },
                }
            }
        };

        match outcome {
            WriteOutcome::Done(result) => result,
            WriteOutcome::LinkDown(err) => {
                log::warn!("Link to {} lost during write", self.params.peer);
                self.link_down(DisconnectKind::Opened, err.clone());
                Err(err.unwrap_or_else(|| MgmtError::Disconnected("link closed".to_string())))
            }
            WriteOutcome::Cancelled => {
                Err(MgmtError::Disconnected("write cancelled by stop".to_string()))
            }
        }
    }

    async fn stop(&mut self) -> MgmtResult<bool> {
        match self.state {
            LinkState::Idle => Err(MgmtError::NotOpen("link never started".to_string())),
            LinkState::Connecting | LinkState::Closed => Ok(true),
            LinkState::Disconnecting => Ok(false),
            LinkState::Connected => match self.driver.disconnect().await {
                Ok(()) => {
                    self.set_state(LinkState::Disconnecting);
                    Ok(false)
                }
                Err(e) => {
                    log::warn!("Disconnect request failed, dropping link: {}", e);
                    self.link_down(DisconnectKind::Requested, Some(e));
                    Ok(true)
                }
            },
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Data(data) => match self.state {
                LinkState::Connected | LinkState::Disconnecting => {
                    let _ = self.data_tx.send(data);
                }
                state => log::debug!("Dropping {} bytes received while {}", data.len(), state),
            },
            LinkEvent::Down(err) => match self.state {
                LinkState::Connected => self.link_down(DisconnectKind::Opened, err),
                LinkState::Disconnecting => self.link_down(DisconnectKind::Requested, err),
                state => log::debug!("Ignoring link down while {}", state),
            },
        }
    }

    fn link_down(&mut self, kind: DisconnectKind, err: Option<MgmtError>) {
        match &err {
            Some(e) => log::info!("Link to {} down ({:?}): {}", self.params.peer, kind, e),
            None => log::info!("Link to {} down ({:?})", self.params.peer, kind),
        }
        self.link_rx = None;
        self.conn = None;
        self.last_error = err.clone();
        self.set_state(LinkState::Closed);

        let _ = self.disconnect_tx.send(DisconnectEvent {
            kind,
            peer: self.params.peer,
            err,
        });
    }

    fn set_state(&mut self, next: LinkState) {
        if let Err(e) = self.state.validate_transition(next) {
            log::warn!("{}", e);
        }
        log::debug!("Link state {} -> {}", self.state, next);
        self.state = next;
        self.status_tx.send_replace(LinkStatus {
            state: next,
            conn: self.conn.clone(),
            last_error: self.last_error.clone(),
        });
    }
}

fn reject_while_connecting(cmd: Command) {
    match cmd {
        Command::Start(reply) => {
            let _ = reply.send(Err(MgmtError::AlreadyOpen));
        }
        Command::Write(_, reply) => {
            let _ = reply.send(Err(MgmtError::NotOpen("link is Connecting".to_string())));
        }
        Command::Stop(reply) => {
            let _ = reply.send(Ok(true));
        }
    }
}

/// Next event of the current link; pending while there is none
async fn next_event(link_rx: &mut Option<mpsc::UnboundedReceiver<LinkEvent>>) -> LinkEvent {
    let Some(rx) = link_rx.as_mut() else {
        return std::future::pending().await;
    };
    if let Some(event) = rx.recv().await {
        return event;
    }
    *link_rx = None;
    LinkEvent::Down(Some(MgmtError::Disconnected(
        "link driver dropped the connection".to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MockLinkDriver;
    use mgmt_core::CorrelationRegistry;
    use std::io;
    use std::sync::{Arc, Mutex};

    fn peer() -> PeerAddr {
        PeerAddr::new([1, 2, 3, 4, 5, 6], Default::default())
    }

    fn conn_desc() -> ConnDesc {
        ConnDesc {
            conn_handle: 1,
            peer: peer(),
            att_mtu: 185,
            encrypted: false,
        }
    }

    type EventSink = Arc<Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>>;

    /// Driver whose connects succeed; the event sender is kept in `sink`
    fn connecting_driver(sink: EventSink) -> MockLinkDriver {
        let mut driver = MockLinkDriver::new();
        driver.expect_connect().returning(move |_, events| {
            *sink.lock().unwrap() = Some(events);
            Ok(conn_desc())
        });
        driver.expect_disconnect().returning(|| Ok(()));
        driver
    }

    #[tokio::test]
    async fn test_connect_retries_then_reports_unopened() {
        let mut driver = MockLinkDriver::new();
        driver.expect_connect().times(3).returning(|_, _| {
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused").into())
        });
        driver.expect_disconnect().never();

        let (fsm, mut events) =
            ConnectionFsm::spawn(Box::new(driver), FsmParams::new(peer()).with_conn_tries(3));
        fsm.start().await.unwrap();

        let ev = events.disconnects.recv().await.unwrap();
        assert_eq!(ev.kind, DisconnectKind::Unopened);
        assert!(matches!(ev.err, Some(MgmtError::Connection(_))));
        assert!(fsm.is_closed());
        assert!(matches!(
            fsm.wait_open(None).await,
            Err(MgmtError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let sink = EventSink::default();
        let (fsm, _events) =
            ConnectionFsm::spawn(Box::new(connecting_driver(sink)), FsmParams::new(peer()));
        fsm.start().await.unwrap();
        fsm.wait_open(None).await.unwrap();

        assert!(matches!(fsm.start().await, Err(MgmtError::AlreadyOpen)));
        assert_eq!(fsm.conn_info().unwrap().att_mtu, 185);
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let (fsm, _events) = ConnectionFsm::spawn(Box::new(MockLinkDriver::new()), FsmParams::new(peer()));
        assert!(matches!(fsm.stop().await, Err(MgmtError::NotOpen(_))));
        assert!(fsm.is_closed());
        assert!(matches!(fsm.conn_info(), Err(MgmtError::NotOpen(_))));
    }

    #[tokio::test]
    async fn test_stop_waits_for_link_down() {
        let sink = EventSink::default();
        let driver = connecting_driver(Arc::clone(&sink));

        let (fsm, mut events) = ConnectionFsm::spawn(Box::new(driver), FsmParams::new(peer()));
        fsm.start().await.unwrap();
        fsm.wait_open(None).await.unwrap();

        assert!(!fsm.stop().await.unwrap());
        assert_eq!(fsm.state(), LinkState::Disconnecting);
        // A second stop while tearing down is still "not done"
        assert!(!fsm.stop().await.unwrap());

        let events_tx = sink.lock().unwrap().take().unwrap();
        events_tx.send(LinkEvent::Down(None)).unwrap();

        let ev = events.disconnects.recv().await.unwrap();
        assert_eq!(ev.kind, DisconnectKind::Requested);
        assert!(ev.err.is_none());
        assert!(fsm.stop().await.unwrap());
    }

    #[tokio::test]
    async fn test_unsolicited_link_loss() {
        let sink = EventSink::default();
        let (fsm, mut events) = ConnectionFsm::spawn(
            Box::new(connecting_driver(Arc::clone(&sink))),
            FsmParams::new(peer()),
        );
        fsm.start().await.unwrap();
        fsm.wait_open(None).await.unwrap();

        let events_tx = sink.lock().unwrap().take().unwrap();
        events_tx.send(LinkEvent::Data(vec![1, 2])).unwrap();
        events_tx
            .send(LinkEvent::Down(Some(MgmtError::Disconnected("unplugged".into()))))
            .unwrap();

        assert_eq!(events.data.recv().await.unwrap(), vec![1, 2]);
        let ev = events.disconnects.recv().await.unwrap();
        assert_eq!(ev.kind, DisconnectKind::Opened);
        assert_eq!(ev.peer, peer());
        assert!(!fsm.is_open());
    }

    #[tokio::test]
    async fn test_write_requires_open_link() {
        let (fsm, _events) = ConnectionFsm::spawn(Box::new(MockLinkDriver::new()), FsmParams::new(peer()));
        assert!(matches!(fsm.write(vec![1]).await, Err(MgmtError::NotOpen(_))));
    }

    #[tokio::test]
    async fn test_write_error_is_returned() {
        let sink = EventSink::default();
        let mut driver = connecting_driver(sink);
        driver
            .expect_write()
            .returning(|_| Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone").into()));

        let (fsm, _events) = ConnectionFsm::spawn(Box::new(driver), FsmParams::new(peer()));
        fsm.start().await.unwrap();
        fsm.wait_open(None).await.unwrap();

        let reg: CorrelationRegistry<u8, Vec<u8>> = CorrelationRegistry::new();
        let mut slot = reg.register(1).unwrap();
        let result = fsm.tx(vec![0; 8], &mut slot, None).await;
        assert!(matches!(result, Err(MgmtError::Connection(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tx_times_out() {
        let sink = EventSink::default();
        let mut driver = connecting_driver(sink);
        driver.expect_write().returning(|_| Ok(()));

        let (fsm, _events) = ConnectionFsm::spawn(Box::new(driver), FsmParams::new(peer()));
        fsm.start().await.unwrap();
        fsm.wait_open(None).await.unwrap();

        let reg: CorrelationRegistry<u8, Vec<u8>> = CorrelationRegistry::new();
        let mut slot = reg.register(7).unwrap();
        let result = fsm
            .tx(vec![0; 8], &mut slot, Some(Duration::from_secs(1)))
            .await;
        assert!(matches!(result, Err(MgmtError::Timeout)));
    }

    /// Driver that connects at once but whose writes never complete
    struct StallingDriver {
        sink: EventSink,
        writing: Arc<tokio::sync::Notify>,
    }

    #[async_trait::async_trait]
    impl LinkDriver for StallingDriver {
        async fn connect(
            &mut self,
            _peer: &PeerAddr,
            events: mpsc::UnboundedSender<LinkEvent>,
        ) -> MgmtResult<ConnDesc> {
            *self.sink.lock().unwrap() = Some(events);
            Ok(conn_desc())
        }

        async fn write(&mut self, _data: &[u8]) -> MgmtResult<()> {
            self.writing.notify_one();
            std::future::pending().await
        }

        async fn disconnect(&mut self) -> MgmtResult<()> {
            Ok(())
        }
    }

    async fn stalled_fsm() -> (ConnectionFsm, FsmEvents, EventSink, Arc<tokio::sync::Notify>) {
        let sink = EventSink::default();
        let writing = Arc::new(tokio::sync::Notify::new());
        let driver = StallingDriver {
            sink: Arc::clone(&sink),
            writing: Arc::clone(&writing),
        };
        let (fsm, events) = ConnectionFsm::spawn(Box::new(driver), FsmParams::new(peer()));
        fsm.start().await.unwrap();
        fsm.wait_open(None).await.unwrap();
        (fsm, events, sink, writing)
    }

    #[tokio::test(start_paused = true)]
    async fn test_tx_timeout_covers_stalled_write() {
        let (fsm, _events, _sink, _writing) = stalled_fsm().await;

        let reg: CorrelationRegistry<u8, Vec<u8>> = CorrelationRegistry::new();
        let mut slot = reg.register(7).unwrap();
        let started = tokio::time::Instant::now();
        let result = fsm
            .tx(vec![0; 8], &mut slot, Some(Duration::from_secs(1)))
            .await;
        assert!(matches!(result, Err(MgmtError::Timeout)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_abort_ends_stalled_write() {
        let (fsm, _events, _sink, _writing) = stalled_fsm().await;

        let reg: CorrelationRegistry<u8, Vec<u8>> = CorrelationRegistry::new();
        let mut slot = reg.register(7).unwrap();
        assert!(reg.fail_one(&7, MgmtError::RxAborted));

        let result = fsm.tx(vec![0; 8], &mut slot, None).await;
        assert!(matches!(result, Err(MgmtError::RxAborted)));
    }

    #[tokio::test]
    async fn test_link_loss_during_stalled_write() {
        let (fsm, mut events, sink, writing) = stalled_fsm().await;
        let fsm = Arc::new(fsm);

        let writer = {
            let fsm = Arc::clone(&fsm);
            tokio::spawn(async move { fsm.write(vec![1]).await })
        };
        writing.notified().await;

        let events_tx = sink.lock().unwrap().take().unwrap();
        events_tx.send(LinkEvent::Data(vec![5])).unwrap();
        assert_eq!(events.data.recv().await.unwrap(), vec![5]);

        events_tx
            .send(LinkEvent::Down(Some(MgmtError::Disconnected("unplugged".into()))))
            .unwrap();
        let ev = events.disconnects.recv().await.unwrap();
        assert_eq!(ev.kind, DisconnectKind::Opened);
        assert!(matches!(
            writer.await.unwrap(),
            Err(MgmtError::Disconnected(_))
        ));
        assert!(fsm.is_closed());
    }

    #[tokio::test]
    async fn test_stop_during_stalled_write() {
        let (fsm, mut events, sink, writing) = stalled_fsm().await;
        let fsm = Arc::new(fsm);

        let writer = {
            let fsm = Arc::clone(&fsm);
            tokio::spawn(async move { fsm.write(vec![1]).await })
        };
        writing.notified().await;

        assert!(!fsm.stop().await.unwrap());
        assert!(matches!(
            writer.await.unwrap(),
            Err(MgmtError::Disconnected(_))
        ));
        assert_eq!(fsm.state(), LinkState::Disconnecting);

        let events_tx = sink.lock().unwrap().take().unwrap();
        events_tx.send(LinkEvent::Down(None)).unwrap();
        assert_eq!(
            events.disconnects.recv().await.unwrap().kind,
            DisconnectKind::Requested
        );
    }
}
