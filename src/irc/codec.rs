//! Line codec for the IRC wire protocol.
//!
//! Decoding yields one item per protocol line. An item is itself a
//! `Result` so that a single malformed line can be reported and skipped
//! without ending the stream; only I/O errors terminate it. Lines longer
//! than the guard are cut and flagged rather than dropped.

use crate::error::ProtocolError;
use bytes::{BufMut, BytesMut};
use irc::proto::Message;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// RFC 1459 line limit, terminator included.
pub const DEFAULT_MAX_LINE: usize = 512;

const TERMINATOR: &[u8] = b"\r\n";

/// One complete protocol line, parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    /// Line text without the terminator.
    pub raw: String,
    pub prefix: Option<String>,
    /// Command verb, upper-cased (`PRIVMSG`, `001`, ...).
    pub command: String,
    /// Ordered parameters, trailing parameter included.
    pub params: Vec<String>,
    pub message: Message,
    /// Set when the line exceeded the length guard and was cut.
    pub truncated: bool,
}

impl Line {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        Self::parse_with(raw, false)
    }

    fn parse_with(raw: &str, truncated: bool) -> Result<Self, ProtocolError> {
        let mut rest = raw.trim_end_matches(['\r', '\n']);

        // IRCv3 message tags are carried in `message` only.
        if rest.starts_with('@') {
            rest = rest.split_once(' ').map(|(_, r)| r).unwrap_or("");
        }
        let rest = rest.trim_start_matches(' ');

        let (prefix, rest) = match rest.strip_prefix(':') {
            Some(p) => match p.split_once(' ') {
                Some((prefix, r)) => (Some(prefix.to_string()), r),
                None => return Err(ProtocolError::Malformed(raw.to_string())),
            },
            None => (None, rest),
        };

        let rest = rest.trim_start_matches(' ');
        let (command, mut rest) = rest.split_once(' ').unwrap_or((rest, ""));
        if command.is_empty() {
            return Err(ProtocolError::Malformed(raw.to_string()));
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((p, r)) => {
                    params.push(p.to_string());
                    rest = r;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        let message: Message = raw
            .parse()
            .map_err(|e: irc::proto::error::ProtocolError| ProtocolError::Malformed(e.to_string()))?;

        Ok(Self {
            raw: raw.trim_end_matches(['\r', '\n']).to_string(),
            prefix,
            command: command.to_ascii_uppercase(),
            params,
            message,
            truncated,
        })
    }

    /// Nickname of the sender, if the prefix names a user.
    pub fn source_nick(&self) -> Option<&str> {
        self.message.source_nickname()
    }
}

/// Splits a byte stream on `\n` (optional `\r`) and serializes outbound lines.
pub struct LineCodec {
    /// Index of next byte to check for newline
    next_index: usize,
    max_len: usize,
    /// Dropping the tail of an over-long line until its terminator.
    discarding: bool,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_len(DEFAULT_MAX_LINE)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            next_index: 0,
            max_len: max_len.max(TERMINATOR.len() + 1),
            discarding: false,
        }
    }

    /// Content bytes allowed per line.
    fn content_limit(&self) -> usize {
        self.max_len - TERMINATOR.len()
    }

    fn finish(&self, mut body: &[u8], truncated: bool) -> Result<Line, ProtocolError> {
        if truncated {
            body = &body[..self.content_limit()];
        }
        let text = match std::str::from_utf8(body) {
            Ok(s) => s,
            // A cut can land inside a multi-byte sequence; back off to the boundary.
            Err(e) if truncated && e.error_len().is_none() => {
                std::str::from_utf8(&body[..e.valid_up_to()]).map_err(|e| {
                    ProtocolError::InvalidUtf8 {
                        valid_up_to: e.valid_up_to(),
                    }
                })?
            }
            Err(e) => {
                return Err(ProtocolError::InvalidUtf8 {
                    valid_up_to: e.valid_up_to(),
                })
            }
        };
        Line::parse_with(text, truncated)
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = Result<Line, ProtocolError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, io::Error> {
        loop {
            if let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') {
                let end = self.next_index + offset;
                let frame = src.split_to(end + 1);
                self.next_index = 0;

                if self.discarding {
                    self.discarding = false;
                    continue;
                }

                let mut body = &frame[..end];
                if body.last() == Some(&b'\r') {
                    body = &body[..body.len() - 1];
                }
                if body.is_empty() {
                    continue;
                }
                let truncated = body.len() > self.content_limit();
                return Ok(Some(self.finish(body, truncated)));
            }

            if self.discarding {
                src.clear();
                self.next_index = 0;
                return Ok(None);
            }

            // No terminator within limit + '\r': this line is over-long.
            if src.len() >= self.content_limit() + TERMINATOR.len() {
                let frame = src.split_to(src.len());
                self.next_index = 0;
                self.discarding = true;
                return Ok(Some(self.finish(&frame, true)));
            }

            self.next_index = src.len();
            return Ok(None);
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, io::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None => {
                // Unterminated tail at EOF is not a line.
                src.clear();
                self.next_index = 0;
                Ok(None)
            }
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if let Some(ch) = line.chars().find(|c| matches!(c, '\r' | '\n' | '\0')) {
            return Err(ProtocolError::ForbiddenChar(ch));
        }
        let total = line.len() + TERMINATOR.len();
        if total > self.max_len {
            return Err(ProtocolError::LineTooLong {
                actual: total,
                limit: self.max_len,
            });
        }
        dst.reserve(total);
        dst.put_slice(line.as_bytes());
        dst.put_slice(TERMINATOR);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut LineCodec, buf: &mut BytesMut) -> Vec<Result<Line, ProtocolError>> {
        let mut out = Vec::new();
        while let Some(item) = codec.decode(buf).unwrap() {
            out.push(item);
        }
        out
    }

    #[test]
    fn test_parse_privmsg() {
        let line = Line::parse(":nick!user@host PRIVMSG #test :hello there").unwrap();
        assert_eq!(line.prefix.as_deref(), Some("nick!user@host"));
        assert_eq!(line.source_nick(), Some("nick"));
        assert_eq!(line.command, "PRIVMSG");
        assert_eq!(line.params, vec!["#test", "hello there"]);
        assert!(!line.truncated);
    }

    #[test]
    fn test_parse_numeric_from_server() {
        let line = Line::parse(":irc.example.net 001 bot1 :Welcome to IRC").unwrap();
        assert_eq!(line.command, "001");
        assert_eq!(line.source_nick(), None);
        assert_eq!(line.params, vec!["bot1", "Welcome to IRC"]);
    }

    #[test]
    fn test_parse_without_prefix_and_with_tags() {
        let line = Line::parse("PING :irc.example.net").unwrap();
        assert_eq!(line.prefix, None);
        assert_eq!(line.params, vec!["irc.example.net"]);

        let tagged = Line::parse("@time=2020-01-01T00:00:00Z :a!b@c JOIN #x").unwrap();
        assert_eq!(tagged.command, "JOIN");
        assert_eq!(tagged.params, vec!["#x"]);
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(Line::parse(":prefixonly"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(Line::parse(":prefix "), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_decode_across_reads() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from("PING :a\r\nPRIVMSG #x :hel");
        let first = decode_all(&mut codec, &mut buf);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].as_ref().unwrap().command, "PING");

        buf.extend_from_slice(b"lo\nNOTICE");
        let second = decode_all(&mut codec, &mut buf);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].as_ref().unwrap().params, vec!["#x", "hello"]);
        assert_eq!(&buf[..], b"NOTICE");
    }

    #[test]
    fn test_empty_lines_skipped() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from("\r\n\nPING :x\r\n");
        let items = decode_all(&mut codec, &mut buf);
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn test_overlong_complete_line_is_truncated_and_flagged() {
        let mut codec = LineCodec::with_max_len(20);
        let mut buf = BytesMut::from("PRIVMSG #x :abcdefghijklmnop\r\nPING :y\r\n");
        let items = decode_all(&mut codec, &mut buf);
        assert_eq!(items.len(), 2);
        let cut = items[0].as_ref().unwrap();
        assert!(cut.truncated);
        assert_eq!(cut.raw.len(), 18);
        assert_eq!(cut.raw, "PRIVMSG #x :abcdef");
        assert!(!items[1].as_ref().unwrap().truncated);
    }

    #[test]
    fn test_overlong_partial_line_discards_remainder() {
        let mut codec = LineCodec::with_max_len(20);
        let mut buf = BytesMut::from("PRIVMSG #x :abcdefghijklmnop");
        let items = decode_all(&mut codec, &mut buf);
        assert_eq!(items.len(), 1);
        assert!(items[0].as_ref().unwrap().truncated);

        // Tail of the same line is dropped; the next line is intact.
        buf.extend_from_slice(b"qrstuvwxyz\r\nPING :z\r\n");
        let items = decode_all(&mut codec, &mut buf);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap().command, "PING");
    }

    #[test]
    fn test_truncation_respects_utf8_boundary() {
        let mut codec = LineCodec::with_max_len(16);
        // 'é' occupies bytes 13..15; the cut at 14 lands inside it.
        let mut buf = BytesMut::from("PRIVMSG #x :aé\r\n");
        let items = decode_all(&mut codec, &mut buf);
        let line = items[0].as_ref().unwrap();
        assert!(line.truncated);
        assert_eq!(line.raw, "PRIVMSG #x :a");
    }

    #[test]
    fn test_invalid_utf8_is_item_error() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"PRIVMSG #x :\xff\xfe\r\nPING :ok\r\n");
        let items = decode_all(&mut codec, &mut buf);
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], Err(ProtocolError::InvalidUtf8 { .. })));
        assert_eq!(items[1].as_ref().unwrap().command, "PING");
    }

    #[test]
    fn test_eof_drops_unterminated_tail() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from("PING :a\r\nPART");
        let first = codec.decode_eof(&mut buf).unwrap();
        assert!(first.is_some());
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encode_exact_bytes() {
        let mut codec = LineCodec::new();
        let mut dst = BytesMut::new();
        codec.encode("JOIN #test".to_string(), &mut dst).unwrap();
        assert_eq!(&dst[..], b"JOIN #test\r\n");
    }

    #[test]
    fn test_encode_rejects_injection_and_overlong() {
        let mut codec = LineCodec::with_max_len(16);
        let mut dst = BytesMut::new();
        assert!(matches!(
            codec.encode("PRIVMSG #x :a\r\nQUIT".to_string(), &mut dst),
            Err(ProtocolError::ForbiddenChar('\r'))
        ));
        assert!(matches!(
            codec.encode("PRIVMSG #x :0123456789".to_string(), &mut dst),
            Err(ProtocolError::LineTooLong { .. })
        ));
        assert!(dst.is_empty());
    }

    #[test]
    fn test_encode_then_decode_yields_same_line() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        let sent = "PRIVMSG #test :hello world";
        codec.encode(sent.to_string(), &mut buf).unwrap();
        let line = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(line, Line::parse(sent).unwrap());
        assert_eq!(line.raw, sent);
        assert_eq!(line.params, vec!["#test", "hello world"]);
    }
}
