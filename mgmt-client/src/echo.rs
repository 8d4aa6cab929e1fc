//! Echo command (default group)

use crate::command::run_with_retries;
use crate::seq::SeqAllocator;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use mgmt_codec::{NmpMsg, NmpOp};
use mgmt_core::{MgmtError, MgmtResult, TxOptions};
use mgmt_session::Session;

/// Default management group
pub const GROUP_DEFAULT: u16 = 0;
/// Echo command id within the default group
pub const ID_ECHO: u8 = 0;

/// Ask the device to send `text` back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoCmd {
    pub text: String,
}

impl EchoCmd {
    /// Create an echo command carrying `text`
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Build the request with sequence number `seq`
    pub fn request(&self, seq: u8) -> MgmtResult<NmpMsg> {
        let mut body = Vec::with_capacity(self.text.len() + 4);
        Encoder::new(&mut body)
            .map(1)
            .and_then(|e| e.str("d"))
            .and_then(|e| e.str(&self.text))
            .map_err(|e| MgmtError::Encode(format!("echo request: {}", e)))?;
        NmpMsg::new(NmpOp::Write, GROUP_DEFAULT, ID_ECHO, seq, body)
    }

    /// Run the command and return the echoed text
    pub async fn run<S>(&self, session: &S, seqs: &SeqAllocator, opts: TxOptions) -> MgmtResult<String>
    where
        S: Session + ?Sized,
    {
        let rsp = run_with_retries(session, seqs, opts, |seq| self.request(seq)).await?;
        decode_echo_rsp(&rsp)
    }
}

/// Extract the echoed text from an echo response
///
/// # Errors
/// - `MgmtError::UnexpectedStatus` if the response carries a non-zero `rc`
/// - `MgmtError::Decode` if the body is malformed or has no `r` entry
pub fn decode_echo_rsp(msg: &NmpMsg) -> MgmtResult<String> {
    let err = |e: minicbor::decode::Error| MgmtError::Decode(format!("echo response: {}", e));

    let mut dec = Decoder::new(&msg.body);
    let entries = dec
        .map()
        .map_err(err)?
        .ok_or_else(|| MgmtError::Decode("echo response: indefinite map".to_string()))?;

    let mut text = None;
    for _ in 0..entries {
        if dec.datatype().map_err(err)? != Type::String {
            dec.skip().map_err(err)?;
            dec.skip().map_err(err)?;
            continue;
        }
        match dec.str().map_err(err)? {
            "r" => text = Some(dec.str().map_err(err)?.to_string()),
            "rc" => {
                let rc = dec.i64().map_err(err)?;
                if rc != 0 {
                    return Err(MgmtError::UnexpectedStatus(format!("echo rc={}", rc)));
                }
            }
            _ => dec.skip().map_err(err)?,
        }
    }

    text.ok_or_else(|| MgmtError::Decode("echo response has no \"r\" entry".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rsp_body(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut body = Vec::new();
        let mut enc = Encoder::new(&mut body);
        enc.map(entries.len() as u64).unwrap();
        for (k, v) in entries {
            enc.str(k).unwrap().str(v).unwrap();
        }
        body
    }

    #[test]
    fn test_request_layout() {
        let req = EchoCmd::new("hi").request(9).unwrap();
        assert_eq!(req.hdr.op, NmpOp::Write);
        assert_eq!(req.hdr.group, GROUP_DEFAULT);
        assert_eq!(req.hdr.id, ID_ECHO);
        assert_eq!(req.seq(), 9);
        assert_eq!(req.body, vec![0xa1, 0x61, b'd', 0x62, b'h', b'i']);
    }

    #[test]
    fn test_decode_response() {
        let msg = NmpMsg::new(NmpOp::WriteRsp, 0, 0, 1, rsp_body(&[("r", "hi")])).unwrap();
        assert_eq!(decode_echo_rsp(&msg).unwrap(), "hi");

        let empty = NmpMsg::new(NmpOp::WriteRsp, 0, 0, 1, rsp_body(&[])).unwrap();
        assert!(matches!(decode_echo_rsp(&empty), Err(MgmtError::Decode(_))));
    }

    #[test]
    fn test_nonzero_rc() {
        let mut body = Vec::new();
        Encoder::new(&mut body)
            .map(1)
            .unwrap()
            .str("rc")
            .unwrap()
            .i64(8)
            .unwrap();
        let msg = NmpMsg::new(NmpOp::WriteRsp, 0, 0, 1, body).unwrap();
        assert!(matches!(
            decode_echo_rsp(&msg),
            Err(MgmtError::UnexpectedStatus(_))
        ));
    }
}
