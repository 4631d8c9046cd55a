//! The LRCP wire format: four message types over `/`-delimited ASCII
//! datagrams, with `/` and `\` escaped in payloads.
//!
//! ```text
//! /connect/TOKEN/
//! /data/TOKEN/POS/ESCAPED_PAYLOAD/
//! /ack/TOKEN/LENGTH/
//! /close/TOKEN/
//! ```
//!
//! [`parse`] turns a received datagram into a [`Message`] or rejects it
//! outright; [`Message::encode`] serialises a `Message` back onto the wire,
//! escaping the payload of a `Data` message in a single pass.

use crate::config::MAX_NUMERIC_FIELD;
use crate::error::ParseError;

/// A session identifier carried in every message.
pub type Token = u32;

/// One decoded LRCP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Request to open, or idempotently re-acknowledge, a session.
    Connect { token: Token },
    /// `payload` is the **unescaped** application data; `pos` is the
    /// unescaped byte offset of `payload[0]` in the sender's stream.
    Data { token: Token, pos: u32, payload: Vec<u8> },
    /// `length` is the cumulative count of bytes the sender has
    /// successfully received.
    Ack { token: Token, length: u32 },
    /// Unilateral session teardown.
    Close { token: Token },
}

impl Message {
    /// The session token this message pertains to.
    pub fn token(&self) -> Token {
        match *self {
            Message::Connect { token }
            | Message::Data { token, .. }
            | Message::Ack { token, .. }
            | Message::Close { token } => token,
        }
    }

    /// Serialises this message onto the wire, escaping `/` and `\` in a
    /// `Data` payload as it goes.
    ///
    /// Panics (debug builds only) if the encoded datagram would exceed
    /// `max_datagram_size` — callers are responsible for keeping `Data`
    /// payloads within the per-segment limit computed by the session
    /// (see [`framing_overhead`]); a violation here is a bug in the caller,
    /// not a runtime condition to recover from.
    pub fn encode(&self, max_datagram_size: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        match self {
            Message::Connect { token } => {
                out.extend_from_slice(format!("/connect/{token}/").as_bytes());
            }
            Message::Data { token, pos, payload } => {
                out.extend_from_slice(format!("/data/{token}/{pos}/").as_bytes());
                escape_into(payload, &mut out);
                out.push(b'/');
            }
            Message::Ack { token, length } => {
                out.extend_from_slice(format!("/ack/{token}/{length}/").as_bytes());
            }
            Message::Close { token } => {
                out.extend_from_slice(format!("/close/{token}/").as_bytes());
            }
        }
        debug_assert!(
            out.len() <= max_datagram_size,
            "encoded message of {} bytes exceeds the {} byte datagram limit",
            out.len(),
            max_datagram_size
        );
        out
    }
}

/// The number of bytes of framing overhead (everything but the escaped
/// payload) a `Data{token, pos, _}` message costs on the wire:
/// `/data/TOKEN/POS//`.
pub fn framing_overhead(token: Token, pos: u32) -> usize {
    format!("/data/{token}/{pos}//").len()
}

/// Applies the escape rules (`/` -> `\/`, `\` -> `\\`) to `payload`,
/// appending the result to `out`.
fn escape_into(payload: &[u8], out: &mut Vec<u8>) {
    for &b in payload {
        match b {
            b'/' => out.extend_from_slice(b"\\/"),
            b'\\' => out.extend_from_slice(b"\\\\"),
            _ => out.push(b),
        }
    }
}

/// The escaped length `escape_into` would produce for `payload`, without
/// allocating.
pub fn escaped_len(payload: &[u8]) -> usize {
    payload
        .iter()
        .map(|&b| if b == b'/' || b == b'\\' { 2 } else { 1 })
        .sum()
}

/// Reverses [`escape_into`]. Returns an error if an unescaped `/` slipped
/// through (it shouldn't — the field scanner in [`parse`] stops at the
/// first unescaped `/`) or if a `\` is followed by anything other than `/`
/// or `\`.
fn unescape(field: &[u8]) -> Result<Vec<u8>, ParseError> {
    let mut out = Vec::with_capacity(field.len());
    let mut iter = field.iter().copied();
    while let Some(b) = iter.next() {
        if b == b'\\' {
            match iter.next() {
                Some(b'/') => out.push(b'/'),
                Some(b'\\') => out.push(b'\\'),
                Some(other) => return Err(ParseError::InvalidEscape(other as char)),
                None => return Err(ParseError::DanglingEscape),
            }
        } else {
            out.push(b);
        }
    }
    Ok(out)
}

/// Parses a full datagram payload into a single [`Message`].
///
/// Rejects the packet entirely (no partial results) on any grammar
/// violation. `max_datagram_size` bounds the raw input; LRCP conformance
/// requires 1000.
pub fn parse(datagram: &[u8], max_datagram_size: usize) -> Result<Message, ParseError> {
    if datagram.len() > max_datagram_size {
        return Err(ParseError::TooLarge(datagram.len(), max_datagram_size));
    }
    if datagram.first() != Some(&b'/') {
        return Err(ParseError::MissingLeadingSlash);
    }
    if datagram.last() != Some(&b'/') {
        return Err(ParseError::MissingTrailingSlash);
    }

    // Body is everything strictly between the leading and trailing '/'.
    let body = &datagram[1..datagram.len() - 1];

    let mut scanner = FieldScanner::new(body);
    let msg_type = scanner.next_plain_field("type")?;

    match msg_type {
        b"connect" => {
            let token = parse_token(scanner.next_plain_field("token")?)?;
            scanner.expect_exhausted()?;
            Ok(Message::Connect { token })
        }
        b"close" => {
            let token = parse_token(scanner.next_plain_field("token")?)?;
            scanner.expect_exhausted()?;
            Ok(Message::Close { token })
        }
        b"ack" => {
            let token = parse_token(scanner.next_plain_field("token")?)?;
            let length = parse_numeric(scanner.next_plain_field("length")?, "length")?;
            scanner.expect_exhausted()?;
            Ok(Message::Ack { token, length })
        }
        b"data" => {
            let token = parse_token(scanner.next_plain_field("token")?)?;
            let pos = parse_numeric(scanner.next_plain_field("pos")?, "pos")?;
            // The payload field is the remainder up to (not including) the
            // datagram's final '/'; it may legitimately contain escaped
            // '/' characters, so it cannot be split on '/' like the other
            // fields. An empty payload field is valid grammar.
            let raw_payload = scanner.remainder();
            let payload = unescape(raw_payload)?;
            Ok(Message::Data { token, pos, payload })
        }
        other => Err(ParseError::UnknownType(String::from_utf8_lossy(other).into_owned())),
    }
}

fn parse_token(field: &[u8]) -> Result<Token, ParseError> {
    parse_numeric(field, "token")
}

fn parse_numeric(field: &[u8], name: &'static str) -> Result<u32, ParseError> {
    if field.is_empty() {
        return Err(ParseError::EmptyField(name));
    }
    let text = std::str::from_utf8(field).map_err(|_| ParseError::InvalidInteger(name))?;
    if !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidInteger(name));
    }
    let value: u64 = text.parse().map_err(|_| ParseError::InvalidInteger(name))?;
    if value > MAX_NUMERIC_FIELD as u64 {
        return Err(ParseError::InvalidInteger(name));
    }
    Ok(value as u32)
}

/// Scans `/`-delimited, escape-aware fields out of the packet body (the
/// bytes between the leading and trailing `/`).
struct FieldScanner<'a> {
    rest: &'a [u8],
}

impl<'a> FieldScanner<'a> {
    fn new(body: &'a [u8]) -> Self {
        Self { rest: body }
    }

    /// Reads the next field, stopping at the first unescaped `/`. Used for
    /// `type`/`token`/`pos`/`length`, none of which may contain escapes or
    /// embedded `/` in well-formed input, but escapes are still scanned
    /// over correctly so a later field boundary isn't found inside one.
    fn next_plain_field(&mut self, name: &'static str) -> Result<&'a [u8], ParseError> {
        let mut i = 0;
        while i < self.rest.len() {
            match self.rest[i] {
                b'/' => {
                    let field = &self.rest[..i];
                    self.rest = &self.rest[i + 1..];
                    if field.is_empty() {
                        return Err(ParseError::EmptyField(name));
                    }
                    return Ok(field);
                }
                b'\\' => i += 2,
                _ => i += 1,
            }
        }
        Err(ParseError::MissingTrailingSlash)
    }

    /// Consumes and returns everything left (the `Data` payload field).
    fn remainder(&mut self) -> &'a [u8] {
        mem_take(&mut self.rest)
    }

    /// Asserts no bytes remain after the fields consumed so far (used by
    /// message types whose last field is a plain field, to reject trailing
    /// garbage such as `/connect/1/junk/`).
    fn expect_exhausted(&self) -> Result<(), ParseError> {
        if self.rest.is_empty() {
            Ok(())
        } else {
            Err(ParseError::TrailingData)
        }
    }
}

fn mem_take<'a>(slot: &mut &'a [u8]) -> &'a [u8] {
    std::mem::take(slot)
}
