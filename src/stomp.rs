/// file: src/stomp.rs
/// description: STOMP 1.2 frame encoding and decoding for the push transport
/// reference: https://stomp.github.io/stomp-specification-1.2.html
use crate::error::StompError;
use std::fmt;
use std::time::Duration;

pub const NULL: char = '\0';
pub const EOL: &str = "\n";

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
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    fn parse(line: &str) -> Result<Self, StompError> {
        Ok(match line {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            other => return Err(StompError::UnknownCommand(other.to_string())),
        })
    }

    // CONNECT and CONNECTED headers are sent verbatim.
    fn escapes_headers(self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
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

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header; repeated headers keep the first occurrence.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn connect(host: &str, auth_token: Option<&str>, heart_beat: HeartBeat) -> Self {
        let mut frame = Frame::new(Command::Connect)
            .header("accept-version", "1.2,1.1")
            .header("host", host)
            .header("heart-beat", heart_beat.to_string());
        if let Some(token) = auth_token {
            frame = frame.header("Authorization", format!("Bearer {token}"));
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

    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(self.body.len() + 64);
        out.push_str(self.command.as_str());
        out.push_str(EOL);
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
            out.push_str(EOL);
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str(&format!("content-length:{}", self.body.len()));
            out.push_str(EOL);
        }
        out.push_str(EOL);
        out.push_str(&self.body);
        out.push(NULL);
        out
    }

    /// Decodes every frame in a transport message. Heartbeat EOLs between
    /// frames are skipped, so a pure heartbeat yields an empty vector.
    pub fn decode_all(text: &str) -> Result<Vec<Frame>, StompError> {
        let mut frames = Vec::new();
        let mut rest = text;
        loop {
            rest = rest.trim_start_matches(['\n', '\r']);
            if rest.is_empty() {
                return Ok(frames);
            }
            let (frame, consumed) = Frame::decode_one(rest)?;
            frames.push(frame);
            rest = &rest[consumed..];
        }
    }

    fn decode_one(text: &str) -> Result<(Frame, usize), StompError> {
        let header_end = text
            .find("\n\n")
            .map(|i| (i, 2))
            .or_else(|| text.find("\r\n\r\n").map(|i| (i, 4)))
            .ok_or(StompError::MissingTerminator)?;
        let head = &text[..header_end.0];
        let body_start = header_end.0 + header_end.1;

        let mut lines = head.lines();
        let command_line = lines
            .next()
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
            .ok_or(StompError::EmptyFrame)?;
        let command = Command::parse(command_line)?;

        let mut headers = Vec::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| StompError::MalformedHeader(line.to_string()))?;
            if command.escapes_headers() {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let content_length = headers
            .iter()
            .find(|(name, _)| name == "content-length")
            .map(|(_, value)| {
                value
                    .parse::<usize>()
                    .map_err(|_| StompError::InvalidContentLength(value.clone()))
            })
            .transpose()?;

        let remaining = &text[body_start..];
        let (body, consumed) = match content_length {
            Some(len) => {
                if remaining.len() < len || remaining.as_bytes().get(len) != Some(&0) {
                    return Err(StompError::MissingTerminator);
                }
                let body = remaining
                    .get(..len)
                    .ok_or_else(|| StompError::InvalidContentLength(len.to_string()))?;
                (body.to_string(), body_start + len + 1)
            }
            None => {
                let end = remaining.find(NULL).ok_or(StompError::MissingTerminator)?;
                (remaining[..end].to_string(), body_start + end + 1)
            }
        };

        Ok((
            Frame {
                command,
                headers,
                body,
            },
            consumed,
        ))
    }
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

fn unescape_header(raw: &str) -> Result<String, StompError> {
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
            _ => return Err(StompError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}

/// `heart-beat` header value: `outgoing,incoming` in milliseconds, 0 = none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    pub outgoing_ms: u64,
    pub incoming_ms: u64,
}

impl HeartBeat {
    pub fn symmetric(interval: Duration) -> Self {
        let ms = interval.as_millis() as u64;
        Self {
            outgoing_ms: ms,
            incoming_ms: ms,
        }
    }

    pub fn parse(value: &str) -> Result<Self, StompError> {
        let (out, inc) = value
            .split_once(',')
            .ok_or_else(|| StompError::InvalidHeartBeat(value.to_string()))?;
        let parse = |part: &str| {
            part.trim()
                .parse::<u64>()
                .map_err(|_| StompError::InvalidHeartBeat(value.to_string()))
        };
        Ok(Self {
            outgoing_ms: parse(out)?,
            incoming_ms: parse(inc)?,
        })
    }

    /// Negotiated intervals as (send every, expect every). `None` disables
    /// that direction.
    pub fn negotiate(client: HeartBeat, server: HeartBeat) -> (Option<Duration>, Option<Duration>) {
        let pick = |ours: u64, theirs: u64| {
            (ours > 0 && theirs > 0).then(|| Duration::from_millis(ours.max(theirs)))
        };
        (
            pick(client.outgoing_ms, server.incoming_ms),
            pick(client.incoming_ms, server.outgoing_ms),
        )
    }
}

impl fmt::Display for HeartBeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.outgoing_ms, self.incoming_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_subscribe_frame() {
        let encoded = Frame::subscribe("sub-0", "/topic/auction/7").encode();
        assert_eq!(
            encoded,
            "SUBSCRIBE\nid:sub-0\ndestination:/topic/auction/7\nack:auto\n\n\0"
        );
    }

    #[test]
    fn connect_headers_are_not_escaped() {
        let encoded = Frame::connect("example.com", Some("abc"), HeartBeat::default()).encode();
        assert!(encoded.contains("Authorization:Bearer abc\n"));
        assert!(encoded.contains("heart-beat:0,0\n"));
    }

    #[test]
    fn decodes_message_with_escaped_header() {
        let raw = "MESSAGE\ndestination:/topic/auction/7\nsubscription:sub-0\nx-note:a\\cb\n\n{\"type\":\"NEW_BID\"}\0";
        let frames = Frame::decode_all(raw).unwrap();
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.get("destination"), Some("/topic/auction/7"));
        assert_eq!(frame.get("x-note"), Some("a:b"));
        assert_eq!(frame.body, "{\"type\":\"NEW_BID\"}");
    }

    #[test]
    fn content_length_allows_null_in_body() {
        let raw = "MESSAGE\ncontent-length:3\n\na\0b\0";
        let frames = Frame::decode_all(raw).unwrap();
        assert_eq!(frames[0].body, "a\0b");
    }

    #[test]
    fn heartbeat_only_message_yields_no_frames() {
        assert!(Frame::decode_all("\n").unwrap().is_empty());
        assert!(Frame::decode_all("\r\n\n").unwrap().is_empty());
    }

    #[test]
    fn decodes_several_frames_in_one_message() {
        let raw = format!(
            "{}\n{}",
            Frame::new(Command::Receipt).header("receipt-id", "1").encode(),
            Frame::new(Command::Message).body("x").encode()
        );
        let frames = Frame::decode_all(&raw).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].body, "x");
    }

    #[test]
    fn rejects_unknown_command_and_truncated_frames() {
        assert_eq!(
            Frame::decode_all("HELLO\n\n\0"),
            Err(StompError::UnknownCommand("HELLO".into()))
        );
        assert_eq!(
            Frame::decode_all("MESSAGE\nid:1\n\nbody"),
            Err(StompError::MissingTerminator)
        );
    }

    #[test]
    fn escape_round_trip_through_encode() {
        let frame = Frame::new(Command::Send).header("k", "line\nwith:colon\\");
        let decoded = Frame::decode_all(&frame.encode()).unwrap();
        assert_eq!(decoded[0].get("k"), Some("line\nwith:colon\\"));
    }

    #[test]
    fn heartbeat_negotiation_takes_larger_interval() {
        let client = HeartBeat::symmetric(Duration::from_secs(4));
        let server = HeartBeat::parse("10000,0").unwrap();
        let (send, expect) = HeartBeat::negotiate(client, server);
        assert_eq!(send, None);
        assert_eq!(expect, Some(Duration::from_secs(10)));

        let server = HeartBeat::parse("4000,4000").unwrap();
        assert_eq!(
            HeartBeat::negotiate(client, server),
            (Some(Duration::from_secs(4)), Some(Duration::from_secs(4)))
        );
    }
}
