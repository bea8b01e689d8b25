// src/parser.rs
//! Restartable HTTP/1.1 request parsing.
//!
//! Parsing is split into a line scanner ([`parse_line`]) and a master state
//! machine ([`RequestParser`]). Both work directly on a [`ReadBuffer`] and
//! can be re-entered after every read: when the buffered bytes run out they
//! report [`HttpCode::NoRequest`] and pick up exactly where they stopped.

use crate::buffer::{ReadBuffer, Span};
use crate::http::{HTTP_1_1, Method};
use memchr::{memchr, memchr2};
use tracing::{debug, trace};

/// Result of scanning for one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A complete line, `\r\n` overwritten with NULs.
    Ok,
    /// Malformed line framing.
    Bad,
    /// Not enough bytes yet.
    Open,
}

/// Which part of the request is being parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckState {
    #[default]
    RequestLine,
    Header,
    Body,
}

/// Outcome of processing a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCode {
    /// More bytes are needed.
    NoRequest,
    /// A complete request has been parsed.
    GetRequest,
    BadRequest,
    NoResource,
    ForbiddenRequest,
    FileRequest,
    InternalError,
}

/// Scan `[checked_idx, read_idx)` for the end of the current line.
pub fn parse_line(buf: &mut ReadBuffer) -> LineStatus {
    let base = buf.checked_idx();
    let Some(offset) = memchr2(b'\r', b'\n', buf.unchecked()) else {
        buf.set_checked(buf.read_idx());
        return LineStatus::Open;
    };
    let idx = base + offset;

    if buf.byte_at(idx) == Some(b'\r') {
        return match buf.byte_at(idx + 1) {
            // `\r` is the last byte received; rescan it next time.
            None => {
                buf.set_checked(idx);
                LineStatus::Open
            }
            Some(b'\n') => {
                buf.terminate(idx);
                buf.terminate(idx + 1);
                buf.set_checked(idx + 2);
                LineStatus::Ok
            }
            Some(_) => {
                buf.set_checked(idx);
                LineStatus::Bad
            }
        };
    }

    // Bare `\n`: fine only if the `\r` right before it is part of this line.
    if idx > buf.start_line() && buf.byte_at(idx - 1) == Some(b'\r') {
        buf.terminate(idx - 1);
        buf.terminate(idx);
        buf.set_checked(idx + 1);
        return LineStatus::Ok;
    }
    buf.set_checked(idx);
    LineStatus::Bad
}

#[inline]
fn is_blank(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

fn skip_blanks(text: &[u8], from: usize) -> usize {
    from + text[from..].iter().take_while(|&&b| is_blank(b)).count()
}

fn find_blank(text: &[u8], from: usize) -> Option<usize> {
    text[from..].iter().position(|&b| is_blank(b)).map(|i| from + i)
}

fn starts_with_ignore_case(text: &[u8], prefix: &[u8]) -> bool {
    text.len() >= prefix.len() && text[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Master state machine over the lines of one request.
///
/// Parsed fields are [`Span`]s into the read buffer; they stop resolving as
/// soon as the buffer is recycled for the next request.
#[derive(Debug, Default)]
pub struct RequestParser {
    state: CheckState,
    method: Method,
    url: Option<Span>,
    version: Option<Span>,
    host: Option<Span>,
    content_length: usize,
    keep_alive: bool,
    body: Option<Span>,
    request_end: usize,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn state(&self) -> CheckState {
        self.state
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// Offset one past the last byte of the completed request.
    pub fn request_end(&self) -> usize {
        self.request_end
    }

    pub fn url<'b>(&self, buf: &'b ReadBuffer) -> Option<&'b [u8]> {
        buf.resolve(self.url?)
    }

    pub fn version<'b>(&self, buf: &'b ReadBuffer) -> Option<&'b [u8]> {
        buf.resolve(self.version?)
    }

    pub fn host<'b>(&self, buf: &'b ReadBuffer) -> Option<&'b [u8]> {
        buf.resolve(self.host?)
    }

    pub fn body<'b>(&self, buf: &'b ReadBuffer) -> Option<&'b [u8]> {
        buf.resolve(self.body?)
    }

    /// Drive the state machine over everything buffered so far.
    ///
    /// Returns [`HttpCode::NoRequest`] when more bytes are needed,
    /// [`HttpCode::GetRequest`] once the request is complete, or
    /// [`HttpCode::BadRequest`] on a protocol error.
    pub fn parse(&mut self, buf: &mut ReadBuffer) -> HttpCode {
        loop {
            if self.state == CheckState::Body {
                return self.parse_content(buf);
            }

            match parse_line(buf) {
                LineStatus::Open => return HttpCode::NoRequest,
                LineStatus::Bad => return HttpCode::BadRequest,
                LineStatus::Ok => {}
            }
            let line = buf.take_line(buf.checked_idx() - 2);
            let Some(text) = buf.resolve(line) else {
                return HttpCode::InternalError;
            };
            trace!(line = %String::from_utf8_lossy(text), "got http line");

            let code = match self.state {
                CheckState::RequestLine => self.parse_request_line(text, line),
                CheckState::Header => self.parse_header(text, line),
                CheckState::Body => unreachable!("body is not line oriented"),
            };
            match code {
                HttpCode::NoRequest => continue,
                HttpCode::GetRequest => {
                    self.request_end = buf.checked_idx();
                    return HttpCode::GetRequest;
                }
                other => return other,
            }
        }
    }

    /// `METHOD SP target SP version`, blanks being spaces or tabs.
    fn parse_request_line(&mut self, text: &[u8], line: Span) -> HttpCode {
        let Some(method_end) = find_blank(text, 0) else {
            return HttpCode::BadRequest;
        };
        self.method = Method::from_bytes(&text[..method_end]);
        if self.method != Method::Get {
            debug!(method = %String::from_utf8_lossy(&text[..method_end]), "unsupported method");
            return HttpCode::BadRequest;
        }

        let mut url_start = skip_blanks(text, method_end);
        let Some(url_end) = find_blank(text, url_start) else {
            return HttpCode::BadRequest;
        };

        let version_start = skip_blanks(text, url_end);
        if !text[version_start..].eq_ignore_ascii_case(HTTP_1_1) {
            return HttpCode::BadRequest;
        }
        self.version = Some(line.sub(version_start, text.len()));

        // Absolute form: drop scheme and authority.
        if starts_with_ignore_case(&text[url_start..url_end], b"http://") {
            url_start += 7;
            match memchr(b'/', &text[url_start..url_end]) {
                Some(i) => url_start += i,
                None => return HttpCode::BadRequest,
            }
        }
        if text.get(url_start) != Some(&b'/') || url_start >= url_end {
            return HttpCode::BadRequest;
        }
        self.url = Some(line.sub(url_start, url_end));

        self.state = CheckState::Header;
        HttpCode::NoRequest
    }

    fn parse_header(&mut self, text: &[u8], line: Span) -> HttpCode {
        if text.is_empty() {
            if self.content_length != 0 {
                self.state = CheckState::Body;
                return HttpCode::NoRequest;
            }
            return HttpCode::GetRequest;
        }

        if starts_with_ignore_case(text, b"Connection:") {
            let value = skip_blanks(text, 11);
            if text[value..].eq_ignore_ascii_case(b"keep-alive") {
                self.keep_alive = true;
            }
        } else if starts_with_ignore_case(text, b"Content-Length:") {
            let value = skip_blanks(text, 15);
            let parsed = std::str::from_utf8(&text[value..])
                .ok()
                .and_then(|s| s.trim_end().parse::<usize>().ok());
            match parsed {
                Some(n) => self.content_length = n,
                None => return HttpCode::BadRequest,
            }
        } else if starts_with_ignore_case(text, b"Host:") {
            let value = skip_blanks(text, 5);
            self.host = Some(line.sub(value, text.len()));
        } else {
            debug!(header = %String::from_utf8_lossy(text), "unknown header");
        }
        HttpCode::NoRequest
    }

    /// The body is not interpreted, only waited for.
    fn parse_content(&mut self, buf: &ReadBuffer) -> HttpCode {
        let start = buf.start_line();
        if buf.read_idx() - start >= self.content_length {
            let end = start + self.content_length;
            self.body = Some(buf.span(start, end));
            self.request_end = end;
            return HttpCode::GetRequest;
        }
        HttpCode::NoRequest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(buf: &mut ReadBuffer, bytes: &[u8]) {
        buf.spare_mut()[..bytes.len()].copy_from_slice(bytes);
        buf.commit(bytes.len());
    }

    fn parse_all(bytes: &[u8]) -> (RequestParser, ReadBuffer, HttpCode) {
        let mut buf = ReadBuffer::new(1024);
        feed(&mut buf, bytes);
        let mut parser = RequestParser::new();
        let code = parser.parse(&mut buf);
        (parser, buf, code)
    }

    #[test]
    fn test_line_scanner_states() {
        let mut buf = ReadBuffer::new(64);
        feed(&mut buf, b"GET / HTTP/1.1\r");
        assert_eq!(parse_line(&mut buf), LineStatus::Open);
        assert_eq!(buf.checked_idx(), 14);

        feed(&mut buf, b"\n");
        assert_eq!(parse_line(&mut buf), LineStatus::Ok);
        assert_eq!(buf.checked_idx(), 16);
        assert_eq!(buf.byte_at(14), Some(0));
        assert_eq!(buf.byte_at(15), Some(0));

        let mut buf = ReadBuffer::new(64);
        feed(&mut buf, b"Host: x\rY");
        assert_eq!(parse_line(&mut buf), LineStatus::Bad);

        let mut buf = ReadBuffer::new(64);
        feed(&mut buf, b"Host: x\n");
        assert_eq!(parse_line(&mut buf), LineStatus::Bad);

        let mut buf = ReadBuffer::new(64);
        feed(&mut buf, b"no terminator");
        assert_eq!(parse_line(&mut buf), LineStatus::Open);
        assert_eq!(buf.checked_idx(), buf.read_idx());
    }

    #[test]
    fn test_parse_basic_request() {
        let (parser, buf, code) = parse_all(
            b"GET /index.html HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n",
        );
        assert_eq!(code, HttpCode::GetRequest);
        assert_eq!(parser.method(), Method::Get);
        assert_eq!(parser.url(&buf), Some(&b"/index.html"[..]));
        assert_eq!(parser.version(&buf), Some(&b"HTTP/1.1"[..]));
        assert_eq!(parser.host(&buf), Some(&b"localhost"[..]));
        assert!(parser.keep_alive());
        assert_eq!(parser.request_end(), buf.read_idx());
    }

    #[test]
    fn test_parse_incomplete_request() {
        let (parser, _buf, code) = parse_all(b"GET /some/path HTT");
        assert_eq!(code, HttpCode::NoRequest);
        assert_eq!(parser.state(), CheckState::RequestLine);

        let (parser, _buf, code) = parse_all(b"GET / HTTP/1.1\r\nHost: x\r\n");
        assert_eq!(code, HttpCode::NoRequest);
        assert_eq!(parser.state(), CheckState::Header);
    }

    #[test]
    fn test_bad_request_lines() {
        for line in [
            &b"GET /\r\n\r\n"[..],
            b"GET / HTTP/1.0\r\n\r\n",
            b"POST / HTTP/1.1\r\n\r\n",
            b"GET index.html HTTP/1.1\r\n\r\n",
            b"GET http://example.com HTTP/1.1\r\n\r\n",
            b"/ HTTP/1.1\r\n\r\n",
            b"GET\r\n\r\n",
        ] {
            let (_, _, code) = parse_all(line);
            assert_eq!(code, HttpCode::BadRequest, "{}", String::from_utf8_lossy(line));
        }
    }

    #[test]
    fn test_absolute_url_is_stripped() {
        let (parser, buf, code) =
            parse_all(b"get http://www.example.com/a/b.html\thttp/1.1\r\n\r\n");
        assert_eq!(code, HttpCode::GetRequest);
        assert_eq!(parser.url(&buf), Some(&b"/a/b.html"[..]));
        assert!(!parser.keep_alive());
    }

    #[test]
    fn test_headers_are_case_insensitive() {
        let (parser, buf, code) = parse_all(
            b"GET / HTTP/1.1\r\nHOST:\t example.org\r\nconnection: Keep-Alive\r\nUser-Agent: test\r\n\r\n",
        );
        assert_eq!(code, HttpCode::GetRequest);
        assert_eq!(parser.host(&buf), Some(&b"example.org"[..]));
        assert!(parser.keep_alive());
    }

    #[test]
    fn test_content_length_waits_for_body() {
        let mut buf = ReadBuffer::new(256);
        let mut parser = RequestParser::new();
        feed(&mut buf, b"GET / HTTP/1.1\r\nContent-Length: 5\r\n\r\nab");
        assert_eq!(parser.parse(&mut buf), HttpCode::NoRequest);
        assert_eq!(parser.state(), CheckState::Body);

        feed(&mut buf, b"cde");
        assert_eq!(parser.parse(&mut buf), HttpCode::GetRequest);
        assert_eq!(parser.body(&buf), Some(&b"abcde"[..]));
        assert_eq!(parser.request_end(), buf.read_idx());
    }

    #[test]
    fn test_zero_content_length_ends_at_blank_line() {
        let (parser, _buf, code) = parse_all(b"GET / HTTP/1.1\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(code, HttpCode::GetRequest);
        assert_eq!(parser.state(), CheckState::Header);
    }

    #[test]
    fn test_invalid_content_length() {
        let (_, _, code) = parse_all(b"GET / HTTP/1.1\r\nContent-Length: -3\r\n\r\n");
        assert_eq!(code, HttpCode::BadRequest);
        let (_, _, code) = parse_all(b"GET / HTTP/1.1\r\nContent-Length: ten\r\n\r\n");
        assert_eq!(code, HttpCode::BadRequest);
    }

    #[test]
    fn test_fragmented_delivery_parses_identically() {
        let request: &[u8] =
            b"GET http://h/x/y.txt HTTP/1.1\r\nHost: h\r\nConnection: keep-alive\r\nContent-Length: 4\r\n\r\nbody";
        let (whole, whole_buf, whole_code) = parse_all(request);
        assert_eq!(whole_code, HttpCode::GetRequest);

        for chunk in [1, 2, 3, 7, 16] {
            let mut buf = ReadBuffer::new(1024);
            let mut parser = RequestParser::new();
            let mut code = HttpCode::NoRequest;
            for piece in request.chunks(chunk) {
                assert_eq!(code, HttpCode::NoRequest);
                feed(&mut buf, piece);
                code = parser.parse(&mut buf);
            }
            assert_eq!(code, HttpCode::GetRequest, "chunk size {chunk}");
            assert_eq!(parser.url(&buf), whole.url(&whole_buf));
            assert_eq!(parser.host(&buf), whole.host(&whole_buf));
            assert_eq!(parser.body(&buf), whole.body(&whole_buf));
            assert_eq!(parser.keep_alive(), whole.keep_alive());
            assert_eq!(parser.request_end(), whole.request_end());
        }
    }

    #[test]
    fn test_fields_go_stale_after_recycle() {
        let (parser, mut buf, code) = parse_all(b"GET /a HTTP/1.1\r\n\r\n");
        assert_eq!(code, HttpCode::GetRequest);
        buf.recycle(parser.request_end());
        assert_eq!(parser.url(&buf), None);
    }

    #[test]
    fn test_pipelined_request_parses_after_recycle() {
        let (mut parser, mut buf, code) =
            parse_all(b"GET /first HTTP/1.1\r\n\r\nGET /second HTTP/1.1\r\nHost: b\r\n\r\n");
        assert_eq!(code, HttpCode::GetRequest);
        assert_eq!(parser.url(&buf), Some(&b"/first"[..]));

        buf.recycle(parser.request_end());
        parser.reset();
        assert_eq!(parser.parse(&mut buf), HttpCode::GetRequest);
        assert_eq!(parser.url(&buf), Some(&b"/second"[..]));
        assert_eq!(parser.host(&buf), Some(&b"b"[..]));
    }
}
