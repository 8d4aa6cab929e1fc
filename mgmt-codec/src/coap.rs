//! CoAP message codec, reliable-transport layout (RFC 8323)
//!
//! # Message Format
//! ```text
//! Len (4 bits) | TKL (4 bits) | Extended Length (0/1/2/4 bytes) |
//! Code (1 byte) | Token (TKL bytes) | Options | 0xFF | Payload
//! ```
//! `Len` covers options, payload marker and payload; the token is not
//! included. Option deltas and lengths use the same 13/14 nibble extension
//! as RFC 7252.

use bytes::{BufMut, BytesMut};
use mgmt_core::{MgmtError, MgmtResult};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Uri-Path option number
pub const OPT_URI_PATH: u16 = 11;
/// Content-Format option number
pub const OPT_CONTENT_FORMAT: u16 = 12;
/// Content-Format value for `application/cbor`
pub const CONTENT_FORMAT_CBOR: u16 = 60;

const PAYLOAD_MARKER: u8 = 0xFF;
const MAX_TOKEN_LEN: usize = 8;

/// CoAP code (class.detail)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoapCode(pub u8);

impl CoapCode {
    pub const EMPTY: CoapCode = CoapCode(0x00);
    pub const GET: CoapCode = CoapCode(0x01);
    pub const POST: CoapCode = CoapCode(0x02);
    pub const PUT: CoapCode = CoapCode(0x03);
    pub const DELETE: CoapCode = CoapCode(0x04);
    pub const CREATED: CoapCode = CoapCode(0x41);
    pub const DELETED: CoapCode = CoapCode(0x42);
    pub const VALID: CoapCode = CoapCode(0x43);
    pub const CHANGED: CoapCode = CoapCode(0x44);
    pub const CONTENT: CoapCode = CoapCode(0x45);
    pub const BAD_REQUEST: CoapCode = CoapCode(0x80);
    pub const UNAUTHORIZED: CoapCode = CoapCode(0x81);
    pub const NOT_FOUND: CoapCode = CoapCode(0x84);
    pub const METHOD_NOT_ALLOWED: CoapCode = CoapCode(0x85);
    pub const INTERNAL_SERVER_ERROR: CoapCode = CoapCode(0xA0);

    /// Code class (0 = request, 2 = success, 4 = client error, 5 = server error)
    pub fn class(&self) -> u8 {
        self.0 >> 5
    }

    /// Code detail
    pub fn detail(&self) -> u8 {
        self.0 & 0x1F
    }

    /// Check if this is a request method code
    pub fn is_request(&self) -> bool {
        self.class() == 0 && self.detail() != 0
    }
}

impl fmt::Display for CoapCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

/// 64-bit request token, the correlation key for resource requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub u64);

impl Token {
    /// Wire form (8 bytes, big-endian)
    pub fn to_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Parse a wire token of up to 8 bytes
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() > MAX_TOKEN_LEN {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[MAX_TOKEN_LEN - bytes.len()..].copy_from_slice(bytes);
        Some(Token(u64::from_be_bytes(buf)))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Source of fresh request tokens
///
/// Starts at a random value and counts up, so tokens from two generators
/// are unlikely to collide.
#[derive(Debug)]
pub struct TokenGenerator {
    next: AtomicU64,
}

impl TokenGenerator {
    /// Create a generator seeded with a random starting value
    pub fn new() -> Self {
        Self::starting_at(rand::random())
    }

    /// Create a generator with a fixed starting value
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Take the next token
    pub fn next_token(&self) -> Token {
        Token(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TokenGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// CoAP option
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Vec<u8>,
}

/// CoAP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapMessage {
    pub code: CoapCode,
    pub token: Vec<u8>,
    pub options: Vec<CoapOption>,
    pub payload: Vec<u8>,
}

impl CoapMessage {
    /// Create a message with no options and no payload
    pub fn new(code: CoapCode, token: Token) -> Self {
        Self {
            code,
            token: token.to_bytes().to_vec(),
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Append one Uri-Path option per non-empty `/`-separated segment
    pub fn with_uri_path(mut self, path: &str) -> Self {
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.options.push(CoapOption {
                number: OPT_URI_PATH,
                value: segment.as_bytes().to_vec(),
            });
        }
        self
    }

    /// Set the Content-Format option
    pub fn with_content_format(mut self, format: u16) -> Self {
        self.options.retain(|o| o.number != OPT_CONTENT_FORMAT);
        self.options.push(CoapOption {
            number: OPT_CONTENT_FORMAT,
            value: uint_option(format),
        });
        self
    }

    /// Set the payload
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Token as a correlation key, if it is 1..=8 bytes long
    pub fn token_key(&self) -> Option<Token> {
        Token::from_bytes(&self.token)
    }

    /// Uri-Path options joined with `/`
    pub fn uri_path(&self) -> String {
        self.options
            .iter()
            .filter(|o| o.number == OPT_URI_PATH)
            .map(|o| String::from_utf8_lossy(&o.value).into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Encode the message
    pub fn encode(&self) -> MgmtResult<Vec<u8>> {
        if self.token.len() > MAX_TOKEN_LEN {
            return Err(MgmtError::Encode(format!(
                "CoAP token too long: {} bytes (max: {})",
                self.token.len(),
                MAX_TOKEN_LEN
            )));
        }

        // Options must be written in ascending order; sort is stable so
        // repeated options (Uri-Path) keep their order
        let mut options: Vec<&CoapOption> = self.options.iter().collect();
        options.sort_by_key(|o| o.number);

        let mut body = BytesMut::new();
        let mut last_number = 0u16;
        for option in options {
            let delta = (option.number - last_number) as usize;
            let (delta_nibble, delta_ext) = option_nibble(delta)?;
            let (len_nibble, len_ext) = option_nibble(option.value.len())?;
            body.put_u8((delta_nibble << 4) | len_nibble);
            body.put_slice(&delta_ext);
            body.put_slice(&len_ext);
            body.put_slice(&option.value);
            last_number = option.number;
        }
        if !self.payload.is_empty() {
            body.put_u8(PAYLOAD_MARKER);
            body.put_slice(&self.payload);
        }

        let len = body.len();
        let mut out = BytesMut::with_capacity(6 + self.token.len() + len);
        match len {
            0..=12 => out.put_u8(((len as u8) << 4) | self.token.len() as u8),
            13..=268 => {
                out.put_u8((13 << 4) | self.token.len() as u8);
                out.put_u8((len - 13) as u8);
            }
            269..=65804 => {
                out.put_u8((14 << 4) | self.token.len() as u8);
                out.put_u16((len - 269) as u16);
            }
            _ => {
                out.put_u8((15 << 4) | self.token.len() as u8);
                out.put_u32((len - 65805) as u32);
            }
        }
        out.put_u8(self.code.0);
        out.put_slice(&self.token);
        out.put_slice(&body);
        Ok(out.to_vec())
    }

    /// Decode exactly one message from `data`
    pub fn decode(data: &[u8]) -> MgmtResult<Self> {
        let mut reader = Reader::new(data);

        let first = reader.u8()?;
        let tkl = (first & 0x0F) as usize;
        if tkl > MAX_TOKEN_LEN {
            return Err(MgmtError::Decode(format!("Invalid CoAP token length: {}", tkl)));
        }
        let len = match first >> 4 {
            13 => reader.u8()? as usize + 13,
            14 => reader.u16()? as usize + 269,
            15 => reader.u32()? as usize + 65805,
            n => n as usize,
        };
        let code = CoapCode(reader.u8()?);
        let token = reader.take(tkl)?.to_vec();
        let body = reader.take(len)?;
        if !reader.is_empty() {
            return Err(MgmtError::Decode(format!(
                "Trailing bytes after CoAP message: {}",
                reader.remaining()
            )));
        }

        let (options, payload) = decode_options(body)?;
        Ok(Self {
            code,
            token,
            options,
            payload,
        })
    }
}

fn decode_options(body: &[u8]) -> MgmtResult<(Vec<CoapOption>, Vec<u8>)> {
    let mut reader = Reader::new(body);
    let mut options = Vec::new();
    let mut number = 0usize;

    while !reader.is_empty() {
        let byte = reader.u8()?;
        if byte == PAYLOAD_MARKER {
            if reader.is_empty() {
                return Err(MgmtError::Decode(
                    "CoAP payload marker followed by empty payload".to_string(),
                ));
            }
            let payload = reader.take(reader.remaining())?.to_vec();
            return Ok((options, payload));
        }

        let delta = option_value(&mut reader, byte >> 4)?;
        let len = option_value(&mut reader, byte & 0x0F)?;
        number += delta;
        let number_u16 = u16::try_from(number)
            .map_err(|_| MgmtError::Decode(format!("CoAP option number too large: {}", number)))?;
        options.push(CoapOption {
            number: number_u16,
            value: reader.take(len)?.to_vec(),
        });
    }

    Ok((options, Vec::new()))
}

fn option_nibble(value: usize) -> MgmtResult<(u8, Vec<u8>)> {
    match value {
        0..=12 => Ok((value as u8, Vec::new())),
        13..=268 => Ok((13, vec![(value - 13) as u8])),
        269..=65804 => Ok((14, ((value - 269) as u16).to_be_bytes().to_vec())),
        _ => Err(MgmtError::Encode(format!("CoAP option field too large: {}", value))),
    }
}

fn option_value(reader: &mut Reader<'_>, nibble: u8) -> MgmtResult<usize> {
    match nibble {
        13 => Ok(reader.u8()? as usize + 13),
        14 => Ok(reader.u16()? as usize + 269),
        15 => Err(MgmtError::Decode("Reserved CoAP option nibble 15".to_string())),
        n => Ok(n as usize),
    }
}

fn uint_option(value: u16) -> Vec<u8> {
    // Minimal big-endian encoding; zero is the empty string
    match value {
        0 => Vec::new(),
        1..=0xFF => vec![value as u8],
        _ => value.to_be_bytes().to_vec(),
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> MgmtResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(MgmtError::Decode(format!(
                "CoAP message truncated: need {} more bytes, have {}",
                n,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> MgmtResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> MgmtResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> MgmtResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}
