//! Wire protocol: newline-delimited UTF-8 text lines.
//!
//! ```text
//! client -> server:  [<seq>] PING
//! server -> client:  [<resp_seq>/<req_seq>] PONG (<client_id>)
//! server -> client:  [<seq>] keepalive
//! ```
//!
//! Literals are case-sensitive. Reply and keepalive sequence numbers come
//! from the same server-wide counter.

use crate::error::ProtocolError;
use bytes::BytesMut;
use chrono::{DateTime, Local};
use std::fmt;

/// Maximum accepted line length in bytes, excluding the terminator.
pub const MAX_LINE_LENGTH: usize = 1024;

/// A parsed line body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// Client probe.
    Ping { sequence: u64 },
    /// Server reply to one probe.
    Pong {
        response_sequence: u64,
        request_sequence: u64,
        client_id: u64,
    },
    /// Unsolicited server broadcast.
    Keepalive { sequence: u64 },
}

impl Frame {
    /// Parse one line body. A trailing `\r` is ignored.
    pub fn parse(line: &str) -> Result<Frame, ProtocolError> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.len() > MAX_LINE_LENGTH {
            return Err(ProtocolError::LineTooLong(MAX_LINE_LENGTH));
        }
        let malformed = || ProtocolError::Malformed(line.to_string());

        let rest = line.strip_prefix('[').ok_or_else(malformed)?;
        let (tag, body) = rest.split_once("] ").ok_or_else(malformed)?;

        match body {
            "PING" => {
                let sequence = parse_number(tag).ok_or_else(malformed)?;
                if sequence == 0 {
                    return Err(malformed());
                }
                Ok(Frame::Ping { sequence })
            }
            "keepalive" => {
                let sequence = parse_number(tag).ok_or_else(malformed)?;
                Ok(Frame::Keepalive { sequence })
            }
            _ => {
                let (response, request) = tag.split_once('/').ok_or_else(malformed)?;
                let client_id = body
                    .strip_prefix("PONG (")
                    .and_then(|s| s.strip_suffix(')'))
                    .and_then(parse_number)
                    .ok_or_else(malformed)?;
                Ok(Frame::Pong {
                    response_sequence: parse_number(response).ok_or_else(malformed)?,
                    request_sequence: parse_number(request).ok_or_else(malformed)?,
                    client_id,
                })
            }
        }
    }
}

/// Strict decimal: digits only, no sign, no whitespace.
fn parse_number(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Append `body` plus the line terminator to a fresh buffer.
fn frame_line(body: &dyn fmt::Display) -> BytesMut {
    let text = body.to_string();
    let mut buf = BytesMut::with_capacity(text.len() + 1);
    buf.extend_from_slice(text.as_bytes());
    buf.extend_from_slice(b"\n");
    buf
}

/// A probe as sent by a client.
#[derive(Debug, Clone)]
pub struct Request {
    pub sequence: u64,
    pub client_id: u64,
    pub send_time: DateTime<Local>,
}

impl Request {
    pub fn encode(&self) -> BytesMut {
        frame_line(self)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] PING", self.sequence)
    }
}

/// A reply as sent by the server.
#[derive(Debug, Clone)]
pub struct Response {
    pub response_sequence: u64,
    pub matched_request_sequence: u64,
    pub client_id: u64,
    pub send_time: DateTime<Local>,
}

impl Response {
    pub fn encode(&self) -> BytesMut {
        frame_line(self)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}/{}] PONG ({})",
            self.response_sequence, self.matched_request_sequence, self.client_id
        )
    }
}

/// A broadcast sent identically to every live connection.
#[derive(Debug, Clone)]
pub struct KeepaliveMessage {
    pub sequence: u64,
    pub send_time: DateTime<Local>,
}

impl KeepaliveMessage {
    pub fn encode(&self) -> BytesMut {
        frame_line(self)
    }
}

impl fmt::Display for KeepaliveMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] keepalive", self.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ping() {
        assert_eq!(Frame::parse("[7] PING"), Ok(Frame::Ping { sequence: 7 }));
        assert_eq!(Frame::parse("[7] PING\r"), Ok(Frame::Ping { sequence: 7 }));
    }

    #[test]
    fn test_parse_pong() {
        assert_eq!(
            Frame::parse("[12/7] PONG (2)"),
            Ok(Frame::Pong {
                response_sequence: 12,
                request_sequence: 7,
                client_id: 2,
            })
        );
    }

    #[test]
    fn test_parse_keepalive() {
        assert_eq!(
            Frame::parse("[13] keepalive"),
            Ok(Frame::Keepalive { sequence: 13 })
        );
    }

    #[test]
    fn test_literals_are_case_sensitive() {
        assert!(matches!(
            Frame::parse("[1] ping"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Frame::parse("[1] KEEPALIVE"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Frame::parse("[3/1] pong (1)"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_malformed_lines() {
        for line in [
            "",
            "PING",
            "[] PING",
            "[x] PING",
            "[-1] PING",
            "[0] PING",
            "[1]PING",
            "[1] PING extra",
            "[1] PONG (1)",
            "[3/] PONG (1)",
            "[3/1] PONG 1",
            "[3/1] PONG ()",
            "[ 1] PING",
        ] {
            assert!(Frame::parse(line).is_err(), "accepted {line:?}");
        }
    }

    #[test]
    fn test_line_too_long() {
        let line = format!("[{}] PING", "9".repeat(MAX_LINE_LENGTH));
        assert!(matches!(
            Frame::parse(&line),
            Err(ProtocolError::LineTooLong(_))
        ));
    }

    #[test]
    fn test_encode_messages() {
        let now = Local::now();
        let request = Request {
            sequence: 7,
            client_id: 2,
            send_time: now,
        };
        assert_eq!(&request.encode()[..], b"[7] PING\n");

        let response = Response {
            response_sequence: 12,
            matched_request_sequence: 7,
            client_id: 2,
            send_time: now,
        };
        assert_eq!(&response.encode()[..], b"[12/7] PONG (2)\n");

        let keepalive = KeepaliveMessage {
            sequence: 13,
            send_time: now,
        };
        assert_eq!(keepalive.to_string(), "[13] keepalive");
    }
}
