//! Resource requests (CoAP GET correlated by token)

use crate::coap::{CoapCode, CoapMessage, Token};
use mgmt_core::{MgmtError, MgmtResult};

/// Encode a GET request for `uri`
///
/// # Errors
/// Returns `MgmtError::Encode` if `uri` has no path segments.
pub fn encode_get(uri: &str, token: Token) -> MgmtResult<Vec<u8>> {
    if uri.split('/').all(|s| s.is_empty()) {
        return Err(MgmtError::Encode(format!("Invalid resource URI: {:?}", uri)));
    }
    CoapMessage::new(CoapCode::GET, token)
        .with_uri_path(uri)
        .encode()
}

/// Decode a resource response
pub fn decode_rsp(data: &[u8]) -> MgmtResult<CoapMessage> {
    let msg = CoapMessage::decode(data)?;
    if msg.code.is_request() {
        return Err(MgmtError::Decode(format!(
            "Expected a CoAP response, got request code {}",
            msg.code
        )));
    }
    Ok(msg)
}

/// Payload of a successful (2.05 Content) response
///
/// # Errors
/// Returns `MgmtError::UnexpectedStatus` for any other response code.
pub fn content_payload(rsp: CoapMessage) -> MgmtResult<Vec<u8>> {
    if rsp.code != CoapCode::CONTENT {
        return Err(MgmtError::UnexpectedStatus(format!(
            "Unexpected resource response code {} ({} byte payload)",
            rsp.code,
            rsp.payload.len()
        )));
    }
    Ok(rsp.payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_request() {
        let encoded = encode_get("/dev/info", Token(0xabcdef)).unwrap();
        let msg = CoapMessage::decode(&encoded).unwrap();
        assert_eq!(msg.code, CoapCode::GET);
        assert_eq!(msg.uri_path(), "dev/info");
        assert_eq!(msg.token_key(), Some(Token(0xabcdef)));
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn test_empty_uri_rejected() {
        assert!(matches!(encode_get("", Token(1)), Err(MgmtError::Encode(_))));
        assert!(matches!(encode_get("//", Token(1)), Err(MgmtError::Encode(_))));
    }

    #[test]
    fn test_response_status() {
        let ok = CoapMessage::new(CoapCode::CONTENT, Token(3)).with_payload(vec![1, 2]);
        let decoded = decode_rsp(&ok.encode().unwrap()).unwrap();
        assert_eq!(content_payload(decoded).unwrap(), vec![1, 2]);

        let missing = CoapMessage::new(CoapCode::NOT_FOUND, Token(3));
        let decoded = decode_rsp(&missing.encode().unwrap()).unwrap();
        assert!(matches!(content_payload(decoded), Err(MgmtError::UnexpectedStatus(_))));
    }

    #[test]
    fn test_request_is_not_a_response() {
        let encoded = encode_get("res", Token(3)).unwrap();
        assert!(matches!(decode_rsp(&encoded), Err(MgmtError::Decode(_))));
    }
}
