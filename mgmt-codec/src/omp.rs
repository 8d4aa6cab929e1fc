//! Management messages carried inside CoAP (OMP)
//!
//! The CoAP payload is a CBOR map that holds the 8-byte management header as
//! a byte string under the key `"_h"`, plus the entries of the management
//! body map. Read ops are sent as GET, write ops as PUT, to the `omgr`
//! resource.

use crate::coap::{CoapCode, CoapMessage, Token, CONTENT_FORMAT_CBOR};
use crate::nmp::{NmpHdr, NmpMsg, NmpOp};
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use mgmt_core::{MgmtError, MgmtResult};
use std::convert::Infallible;

/// Resource path of the management endpoint
pub const OMP_URI: &str = "omgr";

/// Approximate per-message CoAP framing overhead
pub const OMP_MSG_OVERHEAD: usize = 13;

const HDR_KEY: &str = "_h";

fn encode_err(e: minicbor::encode::Error<Infallible>) -> MgmtError {
    MgmtError::Encode(format!("CBOR: {}", e))
}

fn decode_err(e: minicbor::decode::Error) -> MgmtError {
    MgmtError::Decode(format!("CBOR: {}", e))
}

/// Build the CoAP request carrying `msg`
pub fn encode_omp(msg: &NmpMsg, token: Token) -> MgmtResult<Vec<u8>> {
    let code = match msg.hdr.op {
        NmpOp::Read | NmpOp::ReadRsp => CoapCode::GET,
        NmpOp::Write | NmpOp::WriteRsp => CoapCode::PUT,
    };
    let payload = encode_payload(msg)?;
    CoapMessage::new(code, token)
        .with_uri_path(OMP_URI)
        .with_content_format(CONTENT_FORMAT_CBOR)
        .with_payload(payload)
        .encode()
}

/// Build the CoAP response a peer sends for `msg`
pub fn encode_omp_rsp(msg: &NmpMsg, code: CoapCode, token: &[u8]) -> MgmtResult<Vec<u8>> {
    let payload = encode_payload(msg)?;
    CoapMessage {
        code,
        token: token.to_vec(),
        options: Vec::new(),
        payload,
    }
    .with_content_format(CONTENT_FORMAT_CBOR)
    .encode()
}

/// Extract the management message from a CoAP message
pub fn decode_omp(coap: &CoapMessage) -> MgmtResult<NmpMsg> {
    let payload = &coap.payload;
    let mut dec = Decoder::new(payload);
    let entries = dec
        .map()
        .map_err(decode_err)?
        .ok_or_else(|| MgmtError::Decode("Indefinite-length OMP map".to_string()))?;

    let mut hdr: Option<NmpHdr> = None;
    let mut spans = Vec::new();
    for _ in 0..entries {
        let start = dec.position();
        if is_hdr_key(&mut dec)? {
            let raw = dec.bytes().map_err(decode_err)?;
            hdr = Some(NmpHdr::decode(raw)?);
        } else {
            dec.skip().map_err(decode_err)?;
            spans.push((start, dec.position()));
        }
    }
    if dec.position() != payload.len() {
        return Err(MgmtError::Decode("Trailing bytes after OMP map".to_string()));
    }

    let mut hdr =
        hdr.ok_or_else(|| MgmtError::Decode("OMP payload has no \"_h\" header".to_string()))?;

    // Rebuild the body as a map of the remaining entries
    let mut body = Vec::new();
    if !spans.is_empty() {
        Encoder::new(&mut body)
            .map(spans.len() as u64)
            .map_err(encode_err)?;
        for (start, end) in spans {
            body.extend_from_slice(&payload[start..end]);
        }
    }
    hdr.len = u16::try_from(body.len())
        .map_err(|_| MgmtError::Decode(format!("OMP body too large: {} bytes", body.len())))?;

    Ok(NmpMsg { hdr, body })
}

/// Sequence number from the `"_h"` header of an OMP payload, if readable
///
/// Used to route a decode failure to the request that is waiting for it.
pub fn peek_seq(payload: &[u8]) -> Option<u8> {
    let mut dec = Decoder::new(payload);
    let entries = dec.map().ok()??;
    for _ in 0..entries {
        if is_hdr_key(&mut dec).ok()? {
            let raw = dec.bytes().ok()?;
            return crate::nmp::peek_seq(raw);
        }
        dec.skip().ok()?;
    }
    None
}

/// Consume a map key; `true` if it was the header key
fn is_hdr_key(dec: &mut Decoder<'_>) -> MgmtResult<bool> {
    match dec.datatype().map_err(decode_err)? {
        Type::String => Ok(dec.str().map_err(decode_err)? == HDR_KEY),
        _ => {
            dec.skip().map_err(decode_err)?;
            Ok(false)
        }
    }
}

fn encode_payload(msg: &NmpMsg) -> MgmtResult<Vec<u8>> {
    let mut hdr = msg.hdr;
    hdr.len = u16::try_from(msg.body.len()).map_err(|_| {
        MgmtError::Encode(format!("Management body too large: {} bytes", msg.body.len()))
    })?;
    let (entries, rest) = split_body(&msg.body)?;

    let mut payload = Vec::with_capacity(msg.body.len() + 16);
    Encoder::new(&mut payload)
        .map(entries + 1)
        .and_then(|e| e.str(HDR_KEY))
        .and_then(|e| e.bytes(&hdr.encode()))
        .map_err(encode_err)?;
    payload.extend_from_slice(rest);
    Ok(payload)
}

/// Entry count and raw entry bytes of a CBOR map body
fn split_body(body: &[u8]) -> MgmtResult<(u64, &[u8])> {
    if body.is_empty() {
        return Ok((0, body));
    }
    let mut dec = Decoder::new(body);
    let entries = dec
        .map()
        .map_err(|e| MgmtError::Encode(format!("Management body is not a CBOR map: {}", e)))?
        .ok_or_else(|| MgmtError::Encode("Indefinite-length management body".to_string()))?;
    Ok((entries, &body[dec.position()..]))
}
