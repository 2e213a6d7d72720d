//! STOMP frame type and the text codec used on every connection.
//!
//! Wire layout: `COMMAND\n(name:value\n)*\n<body>\0`. A bare end-of-line
//! between frames is a heartbeat. Decoding is incremental: callers keep a
//! `BytesMut` read buffer and call [`FrameDecoder::decode`] until it yields
//! `None`.

use std::borrow::Cow;
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Well-known header names.
pub mod header {
    pub const ACCEPT_VERSION: &str = "accept-version";
    pub const ACK: &str = "ack";
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const DESTINATION: &str = "destination";
    pub const HEART_BEAT: &str = "heart-beat";
    pub const HOST: &str = "host";
    pub const ID: &str = "id";
    pub const LOGIN: &str = "login";
    pub const MESSAGE: &str = "message";
    pub const MESSAGE_ID: &str = "message-id";
    pub const PASSCODE: &str = "passcode";
    pub const RECEIPT: &str = "receipt";
    pub const RECEIPT_ID: &str = "receipt-id";
    pub const SERVER: &str = "server";
    pub const SESSION: &str = "session";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const TRANSACTION: &str = "transaction";
    pub const VERSION: &str = "version";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    /// Header values of CONNECT and CONNECTED frames are sent verbatim.
    fn escapes_headers(self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Command {
    type Error = FrameDecodeError;

    fn try_from(value: &str) -> Result<Self, FrameDecodeError> {
        match value {
            "CONNECT" => Ok(Command::Connect),
            "STOMP" => Ok(Command::Stomp),
            "CONNECTED" => Ok(Command::Connected),
            "SEND" => Ok(Command::Send),
            "SUBSCRIBE" => Ok(Command::Subscribe),
            "UNSUBSCRIBE" => Ok(Command::Unsubscribe),
            "ACK" => Ok(Command::Ack),
            "NACK" => Ok(Command::Nack),
            "BEGIN" => Ok(Command::Begin),
            "COMMIT" => Ok(Command::Commit),
            "ABORT" => Ok(Command::Abort),
            "DISCONNECT" => Ok(Command::Disconnect),
            "MESSAGE" => Ok(Command::Message),
            "RECEIPT" => Ok(Command::Receipt),
            "ERROR" => Ok(Command::Error),
            other => Err(FrameDecodeError::UnknownCommand(other.to_string())),
        }
    }
}

/// One protocol message unit. Header names are unique and keep insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Item produced by the decoder: either a full frame or a heartbeat EOL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StompItem {
    Frame(Frame),
    Heartbeat,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("malformed header line: {0}")]
    InvalidHeader(String),

    #[error("undefined escape sequence in header")]
    InvalidEscape,

    #[error("frame header is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid content-length: {0}")]
    InvalidContentLength(String),

    #[error("frame body is not terminated by NUL")]
    MissingNul,

    #[error("frame exceeds maximum size of {0} bytes")]
    FrameTooLarge(usize),
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Builds an ERROR frame with a short `message` header and the same text as body.
    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Frame::new(Command::Error)
            .with_header(header::MESSAGE, message.clone())
            .with_header(header::CONTENT_TYPE, "text/plain")
            .with_body(message)
    }

    pub fn receipt(receipt_id: impl Into<String>) -> Self {
        Frame::new(Command::Receipt).with_header(header::RECEIPT_ID, receipt_id)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(k, _)| k == name)
    }

    /// Replaces the value in place when the header exists, appends otherwise.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.headers.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.headers.push((name, value)),
        }
    }

    pub fn remove_header(&mut self, name: &str) -> Option<String> {
        let pos = self.headers.iter().position(|(k, _)| k == name)?;
        Some(self.headers.remove(pos).1)
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Decoded frames keep the first occurrence of a repeated header.
    fn push_decoded_header(&mut self, name: String, value: String) {
        if !self.contains_header(&name) {
            self.headers.push((name, value));
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command)?;
        for (k, v) in self.headers() {
            write!(f, " {k}={v}")?;
        }
        write!(f, " ({} byte body)", self.body.len())
    }
}

/// Encode a frame into the provided buffer.
#[tracing::instrument(level = "trace", skip(frame, dst), fields(command = %frame.command))]
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) {
    let escape = frame.command.escapes_headers();
    let header_len: usize = frame
        .headers
        .iter()
        .map(|(k, v)| k.len() + v.len() + 2)
        .sum();
    dst.reserve(frame.command.as_str().len() + header_len + frame.body.len() + 32);

    dst.put_slice(frame.command.as_str().as_bytes());
    dst.put_u8(b'\n');
    for (name, value) in &frame.headers {
        if escape {
            dst.put_slice(escape_header(name).as_bytes());
            dst.put_u8(b':');
            dst.put_slice(escape_header(value).as_bytes());
        } else {
            dst.put_slice(name.as_bytes());
            dst.put_u8(b':');
            dst.put_slice(value.as_bytes());
        }
        dst.put_u8(b'\n');
    }
    if !frame.body.is_empty() && !frame.contains_header(header::CONTENT_LENGTH) {
        dst.put_slice(format!("{}:{}\n", header::CONTENT_LENGTH, frame.body.len()).as_bytes());
    }
    dst.put_u8(b'\n');
    dst.put_slice(&frame.body);
    dst.put_u8(0);
}

pub fn encode_heartbeat(dst: &mut BytesMut) {
    dst.put_u8(b'\n');
}

/// Try to decode a single item from the buffer.
///
/// Returns `Ok(None)` if there is not yet enough data for a full frame. Each
/// call starts scanning from the front of `src`; connections that read in
/// small pieces should keep a [`FrameDecoder`] instead.
pub fn try_decode_frame(
    src: &mut BytesMut,
    max_frame_size: usize,
) -> Result<Option<StompItem>, FrameDecodeError> {
    FrameDecoder::new(max_frame_size).decode(src)
}

/// Incremental decoder that remembers how far into the buffer it has already
/// scanned, so a frame arriving in many small reads is scanned once.
///
/// Between calls the caller may only append to `src`.
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
    state: DecodeState,
}

#[derive(Debug)]
enum DecodeState {
    Headers {
        line_start: usize,
        scanned: usize,
    },
    Body {
        frame: Frame,
        body_start: usize,
        scanned: usize,
    },
}

impl Default for DecodeState {
    fn default() -> Self {
        DecodeState::Headers {
            line_start: 0,
            scanned: 0,
        }
    }
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            state: DecodeState::default(),
        }
    }

    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<StompItem>, FrameDecodeError> {
        let result = self.decode_inner(src);
        if result.is_err() {
            self.state = DecodeState::default();
        }
        result
    }

    fn decode_inner(&mut self, src: &mut BytesMut) -> Result<Option<StompItem>, FrameDecodeError> {
        let max_frame_size = self.max_frame_size;

        if let DecodeState::Headers {
            line_start,
            scanned,
        } = &mut self.state
        {
            if *scanned == 0 {
                match src.first() {
                    None => return Ok(None),
                    Some(b'\n') => {
                        src.advance(1);
                        return Ok(Some(StompItem::Heartbeat));
                    }
                    Some(b'\r') => {
                        if src.len() < 2 {
                            return Ok(None);
                        }
                        if src[1] != b'\n' {
                            return Err(FrameDecodeError::InvalidHeader(
                                "stray carriage return".into(),
                            ));
                        }
                        src.advance(2);
                        return Ok(Some(StompItem::Heartbeat));
                    }
                    Some(_) => {}
                }
            }

            let Some(body_start) = find_header_end(src, line_start, scanned) else {
                if src.len() > max_frame_size {
                    return Err(FrameDecodeError::FrameTooLarge(max_frame_size));
                }
                return Ok(None);
            };
            let frame = parse_header_block(&src[..body_start])?;
            self.state = DecodeState::Body {
                frame,
                body_start,
                scanned: body_start,
            };
        }

        let DecodeState::Body {
            frame,
            body_start,
            scanned,
        } = &mut self.state
        else {
            return Ok(None);
        };
        let body_start = *body_start;

        let body_end = match frame.header(header::CONTENT_LENGTH) {
            Some(raw) => {
                let len: usize = raw
                    .trim()
                    .parse()
                    .map_err(|_| FrameDecodeError::InvalidContentLength(raw.to_string()))?;
                let end = body_start
                    .checked_add(len)
                    .ok_or_else(|| FrameDecodeError::InvalidContentLength(raw.to_string()))?;
                if end >= max_frame_size {
                    return Err(FrameDecodeError::FrameTooLarge(max_frame_size));
                }
                if src.len() <= end {
                    return Ok(None);
                }
                if src[end] != 0 {
                    return Err(FrameDecodeError::MissingNul);
                }
                end
            }
            None => match src[*scanned..].iter().position(|b| *b == 0) {
                Some(offset) => *scanned + offset,
                None if src.len() > max_frame_size => {
                    return Err(FrameDecodeError::FrameTooLarge(max_frame_size))
                }
                None => {
                    *scanned = src.len();
                    return Ok(None);
                }
            },
        };

        if body_end >= max_frame_size {
            return Err(FrameDecodeError::FrameTooLarge(max_frame_size));
        }

        let DecodeState::Body { mut frame, .. } = std::mem::take(&mut self.state) else {
            return Ok(None);
        };
        let mut raw = src.split_to(body_end + 1).freeze();
        raw.advance(body_start);
        raw.truncate(body_end - body_start);
        frame.body = raw;

        Ok(Some(StompItem::Frame(frame)))
    }
}

/// Scans for the blank line ending the header block, resuming where the last
/// call stopped. Returns the offset of the first body byte.
fn find_header_end(src: &[u8], line_start: &mut usize, scanned: &mut usize) -> Option<usize> {
    while let Some(offset) = src[*scanned..].iter().position(|b| *b == b'\n') {
        let nl = *scanned + offset;
        let start = *line_start;
        *line_start = nl + 1;
        *scanned = nl + 1;
        if start > 0 && strip_cr(&src[start..nl]).is_empty() {
            return Some(nl + 1);
        }
    }
    *scanned = src.len();
    None
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_header_block(block: &[u8]) -> Result<Frame, FrameDecodeError> {
    let text = std::str::from_utf8(block).map_err(|_| FrameDecodeError::InvalidUtf8)?;
    let mut lines = text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

    let command = Command::try_from(lines.next().unwrap_or_default())?;
    let mut frame = Frame::new(command);
    let escaped = command.escapes_headers();

    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FrameDecodeError::InvalidHeader(line.to_string()))?;
        if escaped {
            frame.push_decoded_header(unescape_header(name)?, unescape_header(value)?);
        } else {
            frame.push_decoded_header(name.to_string(), value.to_string());
        }
    }

    Ok(frame)
}

fn escape_header(raw: &str) -> Cow<'_, str> {
    if !raw.contains(['\\', '\n', '\r', ':']) {
        return Cow::Borrowed(raw);
    }
    let mut out = String::with_capacity(raw.len() + 8);
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}

fn unescape_header(raw: &str) -> Result<String, FrameDecodeError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameDecodeError::InvalidEscape),
        }
    }
    Ok(out)
}
