//! Inbound dispatch: link notifications to waiting requests

use crate::close_wait::CloseWait;
use crate::config::{CloseCallback, SessionClosed};
use crate::reassembly::FrameReassembler;
use crate::statistics::SessionStatistics;
use mgmt_codec::{nmp, omp, CoapMessage, Framing, NmpMsg, Token};
use mgmt_core::{CorrelationRegistry, MgmtError};
use mgmt_transport::{DisconnectEvent, DisconnectKind, FsmEvents};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub(crate) type Stats = Arc<Mutex<SessionStatistics>>;

pub(crate) fn stats(stats: &Stats) -> MutexGuard<'_, SessionStatistics> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes inbound data into the correlation registries
///
/// This is the only writer into the registries besides request owners
/// cleaning up after themselves.
pub(crate) struct Receiver {
    pub framing: Framing,
    pub nmp: CorrelationRegistry<u8, NmpMsg>,
    pub oic: CorrelationRegistry<Token, CoapMessage>,
    pub reassembler: FrameReassembler,
    pub stats: Stats,
}

impl Receiver {
    pub fn on_data(&mut self, data: Vec<u8>) {
        match self.framing {
            Framing::Plain => self.on_plain_data(&data),
            Framing::Oic => self.on_oic_data(&data),
        }
    }

    fn on_plain_data(&mut self, data: &[u8]) {
        let frames = match self.reassembler.push(data) {
            Ok(frames) => frames,
            Err(e) => {
                log::warn!("Dropping inbound data: {}", e);
                stats(&self.stats).increment_decode_errors();
                return;
            }
        };

        for frame in frames {
            match NmpMsg::decode(&frame) {
                Ok(msg) => self.deliver_nmp(msg),
                Err(e) => self.fail_nmp(nmp::peek_seq(&frame), e),
            }
        }
    }

    fn on_oic_data(&mut self, data: &[u8]) {
        let coap = match CoapMessage::decode(data) {
            Ok(coap) => coap,
            Err(e) => {
                log::warn!("Dropping undecodable CoAP message: {}", e);
                stats(&self.stats).increment_decode_errors();
                return;
            }
        };

        // Resource responses are keyed by token
        if let Some(token) = coap.token_key() {
            if self.oic.contains(&token) {
                if self.oic.deliver(&token, coap) {
                    stats(&self.stats).increment_responses_received();
                }
                return;
            }
        }

        match omp::decode_omp(&coap) {
            Ok(msg) => self.deliver_nmp(msg),
            Err(e) => self.fail_nmp(omp::peek_seq(&coap.payload), e),
        }
    }

    fn deliver_nmp(&self, msg: NmpMsg) {
        let seq = msg.seq();
        if !msg.hdr.op.is_response() {
            log::debug!("Ignoring inbound {:?} request (seq {})", msg.hdr.op, seq);
            stats(&self.stats).increment_unmatched_responses();
            return;
        }
        if self.nmp.deliver(&seq, msg) {
            stats(&self.stats).increment_responses_received();
        } else {
            log::debug!("No request waiting for seq {}", seq);
            stats(&self.stats).increment_unmatched_responses();
        }
    }

    /// Hand a decode error to the request it belongs to, if that is known
    fn fail_nmp(&self, seq: Option<u8>, err: MgmtError) {
        stats(&self.stats).increment_decode_errors();
        match seq {
            Some(seq) if self.nmp.fail_one(&seq, err.clone()) => {
                log::debug!("Decode error delivered to seq {}: {}", seq, err);
            }
            _ => log::warn!("Dropping undecodable response: {}", err),
        }
    }

    /// Fail every outstanding request with `err`
    pub fn on_disconnect(&mut self, err: MgmtError) {
        self.reassembler.reset();
        let failed = self.nmp.fail_all(err.clone()) + self.oic.fail_all(err);
        if failed > 0 {
            log::debug!("Failed {} outstanding requests on disconnect", failed);
        }
    }
}

/// Session dispatcher task
///
/// Data is always drained before a disconnect is handled, so a response
/// that arrived just before link loss still reaches its request.
pub(crate) async fn dispatch(
    mut events: FsmEvents,
    mut receiver: Receiver,
    close_wait: CloseWait,
    on_close: Option<CloseCallback>,
) {
    loop {
        tokio::select! {
            biased;
            Some(data) = events.data.recv() => receiver.on_data(data),
            Some(event) = events.disconnects.recv() => {
                handle_disconnect(event, &mut receiver, &close_wait, on_close.as_ref());
            }
            else => break,
        }
    }
    log::debug!("Session dispatcher stopped");
}

fn handle_disconnect(
    event: DisconnectEvent,
    receiver: &mut Receiver,
    close_wait: &CloseWait,
    on_close: Option<&CloseCallback>,
) {
    stats(&receiver.stats).increment_disconnects();

    let err = event.err.clone().unwrap_or_else(|| {
        MgmtError::Disconnected(format!("link to {} closed", event.peer))
    });
    receiver.on_disconnect(err);

    if close_wait.notify(event.err.clone()) {
        log::debug!("Close waiter notified");
    }

    // Only an open session that lost its link unasked counts as "closed"
    if event.kind == DisconnectKind::Opened {
        if let Some(callback) = on_close {
            callback(&SessionClosed {
                peer: event.peer,
                err: event.err,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mgmt_codec::{CoapCode, NmpOp};

    fn receiver(framing: Framing) -> Receiver {
        Receiver {
            framing,
            nmp: CorrelationRegistry::new(),
            oic: CorrelationRegistry::new(),
            reassembler: FrameReassembler::new(),
            stats: Stats::default(),
        }
    }

    fn rsp(seq: u8) -> NmpMsg {
        NmpMsg::new(NmpOp::WriteRsp, 0, 0, seq, vec![0xa0]).unwrap()
    }

    #[tokio::test]
    async fn test_plain_delivery_by_seq() {
        let mut r = receiver(Framing::Plain);
        let mut slot = r.nmp.register(4).unwrap();

        let raw = rsp(4).encode().unwrap();
        r.on_data(raw[..3].to_vec());
        assert!(slot.try_recv().is_none());
        r.on_data(raw[3..].to_vec());

        assert_eq!(slot.recv().await.unwrap(), rsp(4));
        assert_eq!(stats(&r.stats).responses_received, 1);
    }

    #[tokio::test]
    async fn test_plain_decode_error_reaches_request() {
        let mut r = receiver(Framing::Plain);
        let mut slot = r.nmp.register(9).unwrap();

        let mut raw = rsp(9).encode().unwrap();
        raw[0] = 0x7f;
        r.on_data(raw);

        assert!(matches!(slot.recv().await, Err(MgmtError::Decode(_))));
        assert_eq!(stats(&r.stats).decode_errors, 1);
    }

    #[test]
    fn test_unsolicited_data_is_counted() {
        let mut r = receiver(Framing::Plain);
        r.on_data(rsp(1).encode().unwrap());
        assert_eq!(stats(&r.stats).unmatched_responses, 1);
    }

    #[tokio::test]
    async fn test_oic_token_and_seq_routing() {
        let mut r = receiver(Framing::Oic);
        let mut by_token = r.oic.register(Token(77)).unwrap();
        let mut by_seq = r.nmp.register(5).unwrap();

        let resource = CoapMessage::new(CoapCode::CONTENT, Token(77)).with_payload(vec![1]);
        r.on_data(resource.encode().unwrap());
        assert_eq!(by_token.recv().await.unwrap().payload, vec![1]);

        let omp_rsp = omp::encode_omp_rsp(&rsp(5), CoapCode::CHANGED, &Token(78).to_bytes()).unwrap();
        r.on_data(omp_rsp);
        assert_eq!(by_seq.recv().await.unwrap(), rsp(5));
    }

    #[tokio::test]
    async fn test_disconnect_fails_both_registries() {
        let mut r = receiver(Framing::Oic);
        let mut a = r.nmp.register(1).unwrap();
        let mut b = r.oic.register(Token(2)).unwrap();

        r.on_disconnect(MgmtError::Disconnected("gone".into()));
        assert!(matches!(a.recv().await, Err(MgmtError::Disconnected(_))));
        assert!(matches!(b.recv().await, Err(MgmtError::Disconnected(_))));
        assert!(r.nmp.is_empty() && r.oic.is_empty());
    }
}
