//! RESP-style wire framing.
//!
//! Requests are length-prefixed arrays of length-prefixed binary strings:
//! `*<argc>\r\n` followed by `argc` bulks of `$<len>\r\n<bytes>\r\n`.
//! Replies are simple strings (`+…`), errors (`-ERR …`), integers (`:…`),
//! bulk strings, arrays, or the null bulk (`$-1\r\n`).
//!
//! The parser is incremental: `feed` appends bytes, `next_command` yields
//! one complete command at a time. Malformed framing is surfaced as
//! [`RespCommand::Malformed`] and the parser resyncs at the next CRLF, so
//! the dispatcher can reply with an error instead of hanging the
//! connection.

use bytes::{Bytes, BytesMut};

const MAX_ARGS: usize = 1024;
const MAX_BULK_LEN: usize = 8 * 1024 * 1024;

/// One parsed request frame.
#[derive(Debug, PartialEq)]
pub enum RespCommand {
    Args(Vec<Bytes>),
    Malformed,
}

enum Parse<T> {
    Done(T),
    NeedMore,
    Bad,
}

/// Incremental request parser, one per connection.
#[derive(Default)]
pub struct RespParser {
    buffer: BytesMut,
}

impl RespParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Yield the next complete command, `None` when more bytes are needed.
    pub fn next_command(&mut self) -> Option<RespCommand> {
        if self.buffer.is_empty() {
            return None;
        }
        if self.buffer[0] != b'*' {
            // Not an array header: drop through the next CRLF and report.
            let crlf = find_crlf(&self.buffer, 0)?;
            let _ = self.buffer.split_to(crlf + 2);
            return Some(RespCommand::Malformed);
        }
        let crlf = find_crlf(&self.buffer, 0)?;
        let argc = match parse_int(&self.buffer[1..crlf]) {
            Some(n) if (0..=MAX_ARGS as i64).contains(&n) => n as usize,
            _ => {
                let _ = self.buffer.split_to(crlf + 2);
                return Some(RespCommand::Malformed);
            }
        };

        let mut pos = crlf + 2;
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            match self.parse_bulk(pos) {
                Parse::Done((arg, next)) => {
                    args.push(arg);
                    pos = next;
                }
                Parse::NeedMore => return None,
                Parse::Bad => {
                    let _ = self.buffer.split_to(crlf + 2);
                    return Some(RespCommand::Malformed);
                }
            }
        }
        let _ = self.buffer.split_to(pos);
        Some(RespCommand::Args(args))
    }

    fn parse_bulk(&self, pos: usize) -> Parse<(Bytes, usize)> {
        if pos >= self.buffer.len() {
            return Parse::NeedMore;
        }
        if self.buffer[pos] != b'$' {
            return Parse::Bad;
        }
        let crlf = match find_crlf(&self.buffer, pos) {
            Some(i) => i,
            None => return Parse::NeedMore,
        };
        let len = match parse_int(&self.buffer[pos + 1..crlf]) {
            Some(n) if (0..=MAX_BULK_LEN as i64).contains(&n) => n as usize,
            _ => return Parse::Bad,
        };
        let data_start = crlf + 2;
        let data_end = data_start + len;
        if data_end + 2 > self.buffer.len() {
            return Parse::NeedMore;
        }
        if &self.buffer[data_end..data_end + 2] != b"\r\n" {
            return Parse::Bad;
        }
        let arg = Bytes::copy_from_slice(&self.buffer[data_start..data_end]);
        Parse::Done((arg, data_end + 2))
    }
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| i + from)
}

fn parse_int(digits: &[u8]) -> Option<i64> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}

// ---------------------------------------------------------------------
// Reply encoders
// ---------------------------------------------------------------------

pub fn resp_simple(s: &str) -> Vec<u8> {
    format!("+{}\r\n", s).into_bytes()
}

pub fn resp_error(s: &str) -> Vec<u8> {
    format!("-ERR {}\r\n", s).into_bytes()
}

pub fn resp_integer(v: i64) -> Vec<u8> {
    format!(":{}\r\n", v).into_bytes()
}

pub fn resp_bulk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

pub fn resp_null() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

pub fn resp_array(items: &[Vec<u8>]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", items.len()).into_bytes();
    for item in items {
        out.extend_from_slice(item);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> RespCommand {
        RespCommand::Args(parts.iter().map(|p| Bytes::copy_from_slice(p.as_bytes())).collect())
    }

    #[test]
    fn parses_complete_command() {
        let mut p = RespParser::new();
        p.feed(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$5\r\nhello\r\n");
        assert_eq!(p.next_command(), Some(args(&["SET", "k", "hello"])));
        assert_eq!(p.next_command(), None);
    }

    #[test]
    fn partial_feeds_wait_for_more() {
        let mut p = RespParser::new();
        p.feed(b"*2\r\n$4\r\nPING");
        assert_eq!(p.next_command(), None);
        p.feed(b"\r\n$2\r\nhi\r\n");
        assert_eq!(p.next_command(), Some(args(&["PING", "hi"])));
    }

    #[test]
    fn pipelined_commands_come_out_in_order() {
        let mut p = RespParser::new();
        p.feed(b"*1\r\n$4\r\nPING\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n");
        assert_eq!(p.next_command(), Some(args(&["PING"])));
        assert_eq!(p.next_command(), Some(args(&["GET", "k"])));
        assert_eq!(p.next_command(), None);
    }

    #[test]
    fn malformed_header_resyncs_at_next_line() {
        let mut p = RespParser::new();
        p.feed(b"HELLO\r\n*1\r\n$4\r\nPING\r\n");
        assert_eq!(p.next_command(), Some(RespCommand::Malformed));
        assert_eq!(p.next_command(), Some(args(&["PING"])));
    }

    #[test]
    fn oversized_argc_is_malformed() {
        let mut p = RespParser::new();
        p.feed(b"*99999\r\n");
        assert_eq!(p.next_command(), Some(RespCommand::Malformed));
    }

    #[test]
    fn bad_bulk_prefix_is_malformed() {
        let mut p = RespParser::new();
        p.feed(b"*1\r\n+oops\r\n");
        assert_eq!(p.next_command(), Some(RespCommand::Malformed));
    }

    #[test]
    fn binary_payloads_survive() {
        let mut p = RespParser::new();
        p.feed(b"*2\r\n$3\r\nSET\r\n$4\r\n\x00\x01\xff\x02\r\n");
        match p.next_command() {
            Some(RespCommand::Args(a)) => {
                assert_eq!(&a[1][..], &[0x00, 0x01, 0xff, 0x02]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn encoders_match_wire_format() {
        assert_eq!(resp_simple("OK"), b"+OK\r\n");
        assert_eq!(resp_error("nope"), b"-ERR nope\r\n");
        assert_eq!(resp_integer(-2), b":-2\r\n");
        assert_eq!(resp_bulk(b"ab"), b"$2\r\nab\r\n");
        assert_eq!(resp_null(), b"$-1\r\n");
        assert_eq!(
            resp_array(&[resp_bulk(b"a"), resp_null()]),
            b"*2\r\n$1\r\na\r\n$-1\r\n"
        );
    }
}
