//! Management sessions
//!
//! A [`BleSession`] owns a connection state machine and turns the link's
//! asynchronous notifications into request/response calls. Responses are
//! matched to requests through two correlation registries: one keyed by
//! management sequence number, one keyed by CoAP token (resource GETs).
//!
//! # Concurrency
//! Any number of tasks may call into a session at once. Blocking calls
//! (`close`, `wait_closed`, `transmit_once`, `get_resource_once`) only suspend their own
//! task. Inbound data and disconnects are handled on a dispatcher task that
//! never waits on a caller, so a disconnect always unblocks pending calls.

use crate::close_wait::CloseWait;
use crate::config::SessionConfig;
use crate::reassembly::FrameReassembler;
use crate::receiver::{self, Receiver, Stats};
use crate::statistics::SessionStatistics;
use async_trait::async_trait;
use mgmt_codec::framing::BLE_ATT_MTU_DFLT;
use mgmt_codec::{oic, CoapMessage, Framing, NmpMsg, Token, TokenGenerator};
use mgmt_core::{wait_bounded, CorrelationRegistry, MgmtError, MgmtResult, TxOptions};
use mgmt_transport::{ConnDesc, ConnectionFsm, LinkDriver, LinkState};
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Request/response session with one peer
///
/// Every implementation performs exactly one attempt per transmit call;
/// retrying belongs to the caller (see `TxOptions::tries`).
#[async_trait]
pub trait Session: Send + Sync {
    /// Start opening the link
    ///
    /// Returns once the start request is accepted; use
    /// [`BleSession::wait_open`] to wait for the link itself.
    async fn open(&self) -> MgmtResult<()>;

    /// Tear the link down and wait until it is down
    ///
    /// # Errors
    /// - `MgmtError::MultipleWaiters` if another close is in progress
    /// - `MgmtError::CloseTimeout` if the link did not go down in time
    /// - `MgmtError::NotOpen` if the session was never opened
    async fn close(&self) -> MgmtResult<()>;

    /// Check if the link is fully open
    fn is_open(&self) -> bool;

    /// Largest management body that fits one outgoing write
    fn max_outgoing_payload(&self) -> usize;

    /// Largest management body that fits one incoming notification
    fn max_incoming_payload(&self) -> usize;

    /// Fail the pending request with sequence number `seq`
    ///
    /// # Errors
    /// `MgmtError::UnknownKey` if no request is waiting on `seq`.
    fn abort_rx(&self, seq: u8) -> MgmtResult<()>;

    /// Send `req` and wait for its response
    async fn transmit_once(&self, req: &NmpMsg, opts: TxOptions) -> MgmtResult<NmpMsg>;

    /// Fetch the resource at `uri`
    async fn get_resource_once(&self, uri: &str, opts: TxOptions) -> MgmtResult<Vec<u8>>;
}

/// Session over a connection-oriented link (BLE)
#[derive(Debug)]
pub struct BleSession {
    fsm: ConnectionFsm,
    framing: Framing,
    nmp: CorrelationRegistry<u8, NmpMsg>,
    oic: CorrelationRegistry<Token, CoapMessage>,
    tokens: TokenGenerator,
    close_wait: CloseWait,
    close_timeout: Duration,
    stats: Stats,
    dispatcher: JoinHandle<()>,
}

impl BleSession {
    /// Create an unopened session
    ///
    /// Spawns the connection task and the dispatcher; must be called from
    /// within a Tokio runtime.
    pub fn new(driver: Box<dyn LinkDriver>, config: SessionConfig) -> Self {
        let (fsm, events) = ConnectionFsm::spawn(driver, config.fsm);

        let nmp = CorrelationRegistry::new();
        let oic = CorrelationRegistry::new();
        let stats = Stats::default();
        let close_wait = CloseWait::new();

        let receiver = Receiver {
            framing: config.framing,
            nmp: nmp.clone(),
            oic: oic.clone(),
            reassembler: FrameReassembler::new(),
            stats: stats.clone(),
        };
        let dispatcher = tokio::spawn(receiver::dispatch(
            events,
            receiver,
            close_wait.clone(),
            config.on_close,
        ));

        Self {
            fsm,
            framing: config.framing,
            nmp,
            oic,
            tokens: TokenGenerator::new(),
            close_wait,
            close_timeout: config.close_timeout,
            stats,
            dispatcher,
        }
    }

    /// Framing chosen at construction
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Current link state
    pub fn state(&self) -> LinkState {
        self.fsm.state()
    }

    /// Description of the current connection
    pub fn conn_info(&self) -> MgmtResult<ConnDesc> {
        self.fsm.conn_info()
    }

    /// Wait until the link opened by [`Session::open`] is established
    pub async fn wait_open(&self, timeout: Option<Duration>) -> MgmtResult<()> {
        self.fsm.wait_open(timeout).await
    }

    /// Wait until the link is fully down
    ///
    /// Shares the single close-wait registration with [`Session::close`],
    /// but never requests teardown itself.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Limit for the wait; `None` waits until the link goes
    ///   down
    ///
    /// # Errors
    /// - `MgmtError::MultipleWaiters` if a close or another wait is in progress
    /// - `MgmtError::CloseTimeout` if the link is still up after `timeout`
    pub async fn wait_closed(&self, timeout: Option<Duration>) -> MgmtResult<()> {
        let mut waiter = self.close_wait.register()?;
        if self.fsm.is_closed() {
            return Ok(());
        }

        match wait_bounded(timeout, waiter.wait()).await {
            Some(result) => result.map(|_| ()),
            None => Err(MgmtError::CloseTimeout),
        }
    }

    /// Fail the pending resource request with `token`
    pub fn abort_resource_rx(&self, token: Token) -> MgmtResult<()> {
        abort(&self.oic, &token)
    }

    /// Snapshot of the session counters
    pub fn statistics(&self) -> SessionStatistics {
        receiver::stats(&self.stats).clone()
    }

    fn att_mtu(&self) -> u16 {
        self.fsm
            .conn_info()
            .map(|conn| conn.att_mtu)
            .unwrap_or(BLE_ATT_MTU_DFLT)
    }

    fn ensure_open(&self) -> MgmtResult<()> {
        if self.fsm.is_open() {
            Ok(())
        } else {
            Err(MgmtError::NotOpen(format!(
                "session with {} is {}",
                self.fsm.peer(),
                self.fsm.state()
            )))
        }
    }

    fn count_outcome<T>(&self, result: &MgmtResult<T>) {
        if let Err(MgmtError::Timeout) = result {
            receiver::stats(&self.stats).increment_timeouts();
        }
    }
}

fn abort<K, V>(registry: &CorrelationRegistry<K, V>, key: &K) -> MgmtResult<()>
where
    K: Eq + Hash + Clone + Debug,
{
    if !registry.contains(key) {
        return Err(MgmtError::UnknownKey(format!("{:?}", key)));
    }
    if !registry.fail_one(key, MgmtError::RxAborted) {
        log::debug!("Listener {:?} already completed, abort ignored", key);
    }
    Ok(())
}

#[async_trait]
impl Session for BleSession {
    async fn open(&self) -> MgmtResult<()> {
        self.fsm.start().await
    }

    async fn close(&self) -> MgmtResult<()> {
        // Held for the whole call; dropping it rolls the registration back
        let mut waiter = self.close_wait.register()?;

        if self.fsm.stop().await? {
            return Ok(());
        }

        let limit = (!self.close_timeout.is_zero()).then_some(self.close_timeout);
        match wait_bounded(limit, waiter.wait()).await {
            Some(Ok(None)) => Ok(()),
            Some(Ok(Some(cause))) => {
                log::info!("Session with {} closed: {}", self.fsm.peer(), cause);
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Err(MgmtError::CloseTimeout),
        }
    }

    fn is_open(&self) -> bool {
        self.fsm.is_open()
    }

    fn max_outgoing_payload(&self) -> usize {
        self.framing.max_outgoing_payload(self.att_mtu())
    }

    fn max_incoming_payload(&self) -> usize {
        self.framing.max_incoming_payload(self.att_mtu())
    }

    fn abort_rx(&self, seq: u8) -> MgmtResult<()> {
        abort(&self.nmp, &seq)
    }

    async fn transmit_once(&self, req: &NmpMsg, opts: TxOptions) -> MgmtResult<NmpMsg> {
        self.ensure_open()?;

        // The slot unregisters itself on every exit path
        let mut slot = self.nmp.register(req.seq())?;
        let data = self.framing.encode_nmp(req, self.tokens.next_token())?;

        receiver::stats(&self.stats).increment_requests_sent();
        let result = self.fsm.tx(data, &mut slot, opts.deadline()).await;
        self.count_outcome(&result);
        result
    }

    async fn get_resource_once(&self, uri: &str, opts: TxOptions) -> MgmtResult<Vec<u8>> {
        if self.framing == Framing::Plain {
            return Err(MgmtError::Unsupported(
                "resource requests need the CoAP framing".to_string(),
            ));
        }
        self.ensure_open()?;

        let token = self.tokens.next_token();
        let mut slot = self.oic.register(token)?;
        let data = oic::encode_get(uri, token)?;

        receiver::stats(&self.stats).increment_requests_sent();
        let result = self.fsm.tx(data, &mut slot, opts.deadline()).await;
        self.count_outcome(&result);
        oic::content_payload(result?)
    }
}

impl Drop for BleSession {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}
