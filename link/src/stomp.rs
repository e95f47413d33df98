//! STOMP 1.2 frame codec.
//!
//! Frames travel as WebSocket text messages. One message may carry several
//! NUL-terminated frames, and a message made only of EOLs is a heartbeat.

use crate::auth::AuthProvider;
use crate::error::{LinkError, Result};
use std::fmt;

const NUL: char = '\0';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StompCommand {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl StompCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connected => "CONNECTED",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
            Self::Disconnect => "DISCONNECT",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "CONNECT" | "STOMP" => Self::Connect,
            "CONNECTED" => Self::Connected,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            "DISCONNECT" => Self::Disconnect,
            _ => return None,
        })
    }

    /// CONNECT and CONNECTED headers are sent verbatim.
    fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl fmt::Display for StompCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single STOMP frame. Header order is preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: StompCommand,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StompFrame {
    pub fn new(command: StompCommand) -> Self {
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

    /// CONNECT frame for `host`, with heart-beating disabled at the STOMP
    /// layer (liveness uses WebSocket pings).
    pub fn connect(host: &str, auth: &AuthProvider) -> Self {
        let mut frame = Self::new(StompCommand::Connect)
            .header("accept-version", "1.2")
            .header("host", host)
            .header("heart-beat", "0,0");
        for (name, value) in auth.stomp_headers() {
            frame = frame.header(name, value);
        }
        frame
    }

    pub fn subscribe(id: &str, destination: &str, receipt: &str) -> Self {
        Self::new(StompCommand::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
            .header("receipt", receipt)
    }

    pub fn unsubscribe(id: &str) -> Self {
        Self::new(StompCommand::Unsubscribe).header("id", id)
    }

    pub fn disconnect() -> Self {
        Self::new(StompCommand::Disconnect)
    }

    /// Serialize to wire text, including the trailing NUL.
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
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
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push(NUL);
        out
    }
}

/// Decode every frame in one WebSocket text message.
///
/// Heartbeat EOLs between frames are skipped. Any bad frame fails the
/// whole message; see [`decode_frames_partial`] to keep the good prefix.
pub fn decode_frames(text: &str) -> Result<Vec<StompFrame>> {
    match decode_frames_partial(text) {
        (frames, None) => Ok(frames),
        (_, Some(err)) => Err(err),
    }
}

/// Decode frames until the first bad one.
///
/// Returns the frames decoded before the failure together with the error
/// for the undecodable tail, if any.
pub fn decode_frames_partial(text: &str) -> (Vec<StompFrame>, Option<LinkError>) {
    let mut frames = Vec::new();
    let mut rest = text;
    loop {
        rest = rest.trim_start_matches(['\r', '\n']);
        if rest.is_empty() {
            return (frames, None);
        }
        match decode_one(rest) {
            Ok((frame, consumed)) => {
                frames.push(frame);
                rest = &rest[consumed..];
            },
            Err(e) => return (frames, Some(e)),
        }
    }
}

fn decode_one(input: &str) -> Result<(StompFrame, usize)> {
    let (command_line, mut pos) = next_line(input, 0)
        .ok_or_else(|| LinkError::ProtocolError("truncated STOMP frame".to_string()))?;
    let command = StompCommand::parse(command_line).ok_or_else(|| {
        LinkError::ProtocolError(format!("unknown STOMP command '{}'", command_line))
    })?;

    let mut headers = Vec::new();
    loop {
        let (line, next) = next_line(input, pos)
            .ok_or_else(|| LinkError::ProtocolError("truncated STOMP headers".to_string()))?;
        pos = next;
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| {
            LinkError::ProtocolError(format!("malformed STOMP header '{}'", line))
        })?;
        if command.escapes_headers() {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .and_then(|(_, v)| v.trim().parse::<usize>().ok());

    let body_start = pos;
    let body_end = match content_length {
        Some(len) => {
            match body_start.checked_add(len) {
                Some(end) if end <= input.len() && input.is_char_boundary(end) => end,
                _ => {
                    return Err(LinkError::ProtocolError(
                        "STOMP content-length exceeds frame".to_string(),
                    ))
                },
            }
        },
        None => input[body_start..]
            .find(NUL)
            .map(|i| body_start + i)
            .ok_or_else(|| LinkError::ProtocolError("STOMP frame missing NUL".to_string()))?,
    };

    if !input[body_end..].starts_with(NUL) {
        return Err(LinkError::ProtocolError("STOMP frame missing NUL".to_string()));
    }

    let frame = StompFrame {
        command,
        headers,
        body: input[body_start..body_end].to_string(),
    };
    Ok((frame, body_end + NUL.len_utf8()))
}

/// Returns the line starting at `from` (without EOL) and the offset after it.
fn next_line(input: &str, from: usize) -> Option<(&str, usize)> {
    let rel = input[from..].find('\n')?;
    let end = from + rel;
    let line = input[from..end].strip_suffix('\r').unwrap_or(&input[from..end]);
    Some((line, end + 1))
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

fn unescape_header(raw: &str) -> Result<String> {
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
                return Err(LinkError::ProtocolError(format!(
                    "invalid STOMP header escape '\\{}'",
                    other.map(String::from).unwrap_or_default()
                )))
            },
        }
    }
    Ok(out)
}
