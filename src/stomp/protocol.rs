//! STOMP Wire Protocol
//!
//! Single responsibility: Encode and decode STOMP 1.2 frames carried in WebSocket
//! text messages.
//!
//! # Wire Format
//!
//! ```text
//! COMMAND
//! header1:value1
//! header2:value2
//!
//! body^@
//! ```
//!
//! A message made only of end-of-line characters is a heartbeat. One message may
//! carry several frames back to back. Header names and values are escaped
//! (`\\`, `\n`, `\r`, `\c`) on every frame except `CONNECT` and `CONNECTED`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::NotifyError;

/// Wire representation of a heartbeat.
pub const HEARTBEAT: &str = "\n";

/// Protocol versions offered in `CONNECT`.
pub const ACCEPT_VERSION: &str = "1.2,1.1,1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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

    /// Whether header escaping applies to this frame.
    fn escapes_headers(self) -> bool {
        !matches!(self, Command::Connect | Command::Stomp | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = NotifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "BEGIN" => Command::Begin,
            "COMMIT" => Command::Commit,
            "ABORT" => Command::Abort,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            other => {
                return Err(NotifyError::Protocol(format!("Unknown command: {}", other)))
            }
        })
    }
}

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// One decoded unit of an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Heartbeat,
    Frame(Frame),
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header. Repeated headers keep the first occurrence.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// `CONNECT` frame carrying the bearer credential as a header.
    pub fn connect(host: &str, token: Option<&str>, heart_beat: HeartBeat) -> Self {
        let mut frame = Frame::new(Command::Connect)
            .header("accept-version", ACCEPT_VERSION)
            .header("host", host)
            .header("heart-beat", heart_beat.to_string());
        if let Some(token) = token {
            frame = frame.header("Authorization", format!("Bearer {}", token));
        }
        frame
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).header("id", id)
    }

    pub fn disconnect(receipt: &str) -> Self {
        Frame::new(Command::Disconnect).header("receipt", receipt)
    }

    /// Serialize to wire format, including the trailing NUL.
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(32 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

/// Decode every frame (or heartbeat) in one inbound message.
pub fn decode_all(text: &str) -> Result<Vec<Inbound>, NotifyError> {
    if text.bytes().all(|b| b == b'\n' || b == b'\r') {
        return Ok(vec![Inbound::Heartbeat]);
    }

    let bytes = text.as_bytes();
    let mut pos = 0;
    let mut out = Vec::new();

    loop {
        while pos < bytes.len() && (bytes[pos] == b'\n' || bytes[pos] == b'\r') {
            pos += 1;
        }
        if pos >= bytes.len() {
            break;
        }
        let (frame, next) = decode_frame(text, pos)?;
        out.push(Inbound::Frame(frame));
        pos = next;
    }

    Ok(out)
}

/// Decode one frame starting at `start`; returns the frame and the offset after it.
fn decode_frame(text: &str, start: usize) -> Result<(Frame, usize), NotifyError> {
    let bytes = text.as_bytes();
    let mut pos = start;

    let command_line = read_line(text, &mut pos)
        .ok_or_else(|| NotifyError::Protocol("Frame has no command line".into()))?;
    let command: Command = command_line.parse()?;
    let escaped = command.escapes_headers();

    let mut headers = Vec::new();
    loop {
        let line = read_line(text, &mut pos)
            .ok_or_else(|| NotifyError::Protocol("Frame headers not terminated".into()))?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| NotifyError::Protocol(format!("Malformed header line: {}", line)))?;
        if escaped {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| NotifyError::Protocol(format!("Bad content-length: {}", v)))
        })
        .transpose()?;

    let (body, next) = match content_length {
        Some(len) => {
            let end = pos + len;
            if end > bytes.len() {
                return Err(NotifyError::Protocol(format!(
                    "Body shorter than content-length {}",
                    len
                )));
            }
            let body = text
                .get(pos..end)
                .ok_or_else(|| NotifyError::Protocol("content-length splits a character".into()))?;
            let next = if bytes.get(end) == Some(&0) { end + 1 } else { end };
            (body, next)
        }
        None => match bytes[pos..].iter().position(|&b| b == 0) {
            Some(nul) => (&text[pos..pos + nul], pos + nul + 1),
            None => (&text[pos..], bytes.len()),
        },
    };

    Ok((
        Frame {
            command,
            headers,
            body: body.to_string(),
        },
        next,
    ))
}

/// Read up to the next LF, stripping an optional CR. Advances `pos` past the LF.
fn read_line<'a>(text: &'a str, pos: &mut usize) -> Option<&'a str> {
    let rest = text.get(*pos..)?;
    let end = rest.find('\n')?;
    *pos += end + 1;
    Some(rest[..end].strip_suffix('\r').unwrap_or(&rest[..end]))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, NotifyError> {
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
            other => {
                return Err(NotifyError::Protocol(format!(
                    "Invalid header escape: \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

/// Heartbeat intervals in milliseconds, as carried by the `heart-beat` header.
///
/// `outgoing` is how often this side can send; `incoming` is how often it wants
/// to receive. Zero disables that direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    pub outgoing: u64,
    pub incoming: u64,
}

impl HeartBeat {
    pub fn new(outgoing: Duration, incoming: Duration) -> Self {
        Self {
            outgoing: outgoing.as_millis() as u64,
            incoming: incoming.as_millis() as u64,
        }
    }

    pub fn parse(header: &str) -> Result<Self, NotifyError> {
        let (out, inc) = header
            .split_once(',')
            .ok_or_else(|| NotifyError::Protocol(format!("Bad heart-beat header: {}", header)))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u64>()
                .map_err(|_| NotifyError::Protocol(format!("Bad heart-beat header: {}", header)))
        };
        Ok(Self {
            outgoing: parse(out)?,
            incoming: parse(inc)?,
        })
    }

    /// Negotiate effective intervals against the server's `CONNECTED` value.
    ///
    /// Returns `(send_every, expect_every)`; `None` means that direction is off.
    pub fn negotiate(self, server: HeartBeat) -> (Option<Duration>, Option<Duration>) {
        let pick = |mine: u64, theirs: u64| {
            if mine == 0 || theirs == 0 {
                None
            } else {
                Some(Duration::from_millis(mine.max(theirs)))
            }
        };
        (
            pick(self.outgoing, server.incoming),
            pick(self.incoming, server.outgoing),
        )
    }
}

impl fmt::Display for HeartBeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.outgoing, self.incoming)
    }
}
