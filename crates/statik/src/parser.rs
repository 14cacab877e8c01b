// src/parser.rs
use tracing::trace;

/// Upper bound on lines examined by one `parse` call. Hitting it reports
/// `NeedMoreData`; the next call resumes where this one stopped.
pub const MAX_LINES_PER_PASS: usize = 100;

const SCHEME: &[u8] = b"http://";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseState {
    #[default]
    RequestLine,
    Headers,
    Body,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// A full request head (and any announced body) is buffered.
    Complete,
    /// The bytes cannot be a GET request we serve.
    Malformed,
    /// Nothing wrong yet; wait for the socket to deliver more bytes.
    NeedMoreData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        b.eq_ignore_ascii_case(b"GET").then_some(Method::Get)
    }
}

/// Offset and length of a field inside the connection's read buffer.
///
/// Spans are only meaningful until the buffer is reset; the parser is reset
/// in the same step, which zeroes every span it handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub len: usize,
}

impl Span {
    fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            len: end - start,
        }
    }

    pub fn end(&self) -> usize {
        self.start + self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn slice<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        buf.get(self.start..self.end()).unwrap_or_default()
    }

    fn skip(&self, n: usize) -> Span {
        let n = n.min(self.len);
        Span::new(self.start + n, self.end())
    }

    fn take(&self, n: usize) -> Span {
        Span::new(self.start, self.start + n.min(self.len))
    }

    /// Split on the first run of spaces or tabs. `None` if there is none.
    fn split_whitespace_once(&self, buf: &[u8]) -> Option<(Span, Span)> {
        let text = self.slice(buf);
        let gap = text.iter().position(|&b| is_blank(b))?;
        let rest = text[gap..].iter().take_while(|&&b| is_blank(b)).count();
        Some((self.take(gap), self.skip(gap + rest)))
    }

    fn trim(&self, buf: &[u8]) -> Span {
        let text = self.slice(buf);
        let lead = text.iter().take_while(|&&b| is_blank(b)).count();
        let trail = text[lead..].iter().rev().take_while(|&&b| is_blank(b)).count();
        Span::new(self.start + lead, self.end() - trail)
    }
}

fn is_blank(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

/// Fields recognised so far in the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestHead {
    pub method: Method,
    pub target: Span,
    pub version: Span,
    pub host: Option<Span>,
    pub content_length: usize,
    pub keep_alive: bool,
}

enum Line {
    Complete(Span),
    Open,
    Bad,
}

/// Incremental HTTP/1.1 request scanner over a connection's read buffer.
///
/// The caller passes the filled prefix of its buffer (`&mut read_buf[..read_end]`)
/// on every call. Line terminators are overwritten with NUL bytes in place.
/// `line_start <= scan_cursor <= read_end` holds between calls.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestParser {
    state: ParseState,
    scan_cursor: usize,
    line_start: usize,
    head: RequestHead,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn scan_cursor(&self) -> usize {
        self.scan_cursor
    }

    pub fn line_start(&self) -> usize {
        self.line_start
    }

    pub fn parse(&mut self, buf: &mut [u8]) -> ParseOutcome {
        let mut lines = 0;
        loop {
            match self.state {
                ParseState::Done => return ParseOutcome::Complete,
                ParseState::Body => return self.body(buf.len()),
                ParseState::RequestLine | ParseState::Headers => {}
            }

            if lines >= MAX_LINES_PER_PASS {
                return ParseOutcome::NeedMoreData;
            }
            let line = match self.next_line(buf) {
                Line::Complete(span) => span,
                Line::Open => return ParseOutcome::NeedMoreData,
                Line::Bad => return ParseOutcome::Malformed,
            };
            lines += 1;

            let accepted = if self.state == ParseState::RequestLine {
                self.request_line(buf, line)
            } else {
                self.header_line(buf, line)
            };
            if accepted.is_none() {
                return ParseOutcome::Malformed;
            }
        }
    }

    fn next_line(&mut self, buf: &mut [u8]) -> Line {
        while self.scan_cursor < buf.len() {
            let at = self.scan_cursor;
            match buf[at] {
                b'\r' => {
                    if at + 1 == buf.len() {
                        return Line::Open;
                    }
                    if buf[at + 1] != b'\n' {
                        return Line::Bad;
                    }
                    buf[at] = 0;
                    buf[at + 1] = 0;
                    self.scan_cursor = at + 2;
                    return self.finish_line(at);
                }
                b'\n' => {
                    if at == 0 || buf[at - 1] != b'\r' {
                        return Line::Bad;
                    }
                    buf[at - 1] = 0;
                    buf[at] = 0;
                    self.scan_cursor = at + 1;
                    return self.finish_line(at - 1);
                }
                _ => self.scan_cursor += 1,
            }
        }
        Line::Open
    }

    fn finish_line(&mut self, end: usize) -> Line {
        let line = Span::new(self.line_start, end);
        self.line_start = self.scan_cursor;
        Line::Complete(line)
    }

    fn request_line(&mut self, buf: &[u8], line: Span) -> Option<()> {
        let (method, rest) = line.split_whitespace_once(buf)?;
        let method = Method::from_bytes(method.slice(buf))?;
        let (mut target, version) = rest.split_whitespace_once(buf)?;

        let raw = target.slice(buf);
        if raw.len() >= SCHEME.len() && raw[..SCHEME.len()].eq_ignore_ascii_case(SCHEME) {
            let authority = target.skip(SCHEME.len());
            let slash = authority.slice(buf).iter().position(|&b| b == b'/')?;
            target = authority.skip(slash);
        }
        if target.slice(buf).first() != Some(&b'/') {
            return None;
        }
        if !version.slice(buf).eq_ignore_ascii_case(b"HTTP/1.1") {
            return None;
        }

        trace!(
            target_path = %String::from_utf8_lossy(target.slice(buf)),
            "request line"
        );
        self.head.method = method;
        self.head.target = target;
        self.head.version = version;
        self.state = ParseState::Headers;
        Some(())
    }

    fn header_line(&mut self, buf: &[u8], line: Span) -> Option<()> {
        if line.is_empty() {
            self.state = if self.head.content_length > 0 {
                ParseState::Body
            } else {
                ParseState::Done
            };
            return Some(());
        }

        let text = line.slice(buf);
        let Some(colon) = text.iter().position(|&b| b == b':') else {
            trace!(line = %String::from_utf8_lossy(text), "ignoring header without colon");
            return Some(());
        };
        let name = line.take(colon).trim(buf).slice(buf);
        let value = line.skip(colon + 1).trim(buf);

        if name.eq_ignore_ascii_case(b"Connection") {
            if value.slice(buf).eq_ignore_ascii_case(b"keep-alive") {
                self.head.keep_alive = true;
            }
        } else if name.eq_ignore_ascii_case(b"Content-Length") {
            let digits = value.slice(buf);
            if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
                return None;
            }
            self.head.content_length = std::str::from_utf8(digits).ok()?.parse().ok()?;
        } else if name.eq_ignore_ascii_case(b"Host") {
            self.head.host = Some(value);
        } else {
            trace!(name = %String::from_utf8_lossy(name), "ignoring header");
        }
        Some(())
    }

    /// A body end past `usize::MAX` can never be buffered; it stays
    /// `NeedMoreData` until the connection's buffer fills and it is closed.
    fn body(&mut self, read_end: usize) -> ParseOutcome {
        let covered = self
            .line_start
            .checked_add(self.head.content_length)
            .is_some_and(|end| read_end >= end);
        if covered {
            self.state = ParseState::Done;
            ParseOutcome::Complete
        } else {
            ParseOutcome::NeedMoreData
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(raw: &[u8]) -> (RequestParser, Vec<u8>, ParseOutcome) {
        let mut buf = raw.to_vec();
        let mut parser = RequestParser::new();
        let outcome = parser.parse(&mut buf);
        (parser, buf, outcome)
    }

    #[test]
    fn test_parse_basic_request() {
        let (parser, buf, outcome) = parse_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n");

        assert_eq!(outcome, ParseOutcome::Complete);
        assert_eq!(parser.state(), ParseState::Done);
        let head = parser.head();
        assert_eq!(head.method, Method::Get);
        assert_eq!(head.target.slice(&buf), b"/index.html");
        assert_eq!(head.version.slice(&buf), b"HTTP/1.1");
        assert_eq!(head.host.map(|h| h.slice(&buf)), Some(&b"x"[..]));
        assert_eq!(head.content_length, 0);
        assert!(!head.keep_alive);
    }

    #[test]
    fn test_absolute_form_target_is_stripped() {
        let (parser, buf, outcome) = parse_all(b"GET http://example.com/a/b HTTP/1.1\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::Complete);
        assert_eq!(parser.head().target.slice(&buf), b"/a/b");

        let (_, _, outcome) = parse_all(b"GET HTTP://example.com:8080 HTTP/1.1\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::Malformed);
    }

    #[test]
    fn test_rejects_other_methods() {
        for method in ["POST", "HEAD", "PUT", "DELETE", "GETX"] {
            let raw = format!("{method} / HTTP/1.1\r\n\r\n");
            let (_, _, outcome) = parse_all(raw.as_bytes());
            assert_eq!(outcome, ParseOutcome::Malformed, "{method}");
        }
        let (_, _, outcome) = parse_all(b"get / HTTP/1.1\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::Complete);
    }

    #[test]
    fn test_version_must_be_http11() {
        for version in ["HTTP/1.0", "HTTP/2", "HTTP/1.1 ", "HTTP/1.10", ""] {
            let raw = format!("GET / {version}\r\n\r\n");
            let (_, _, outcome) = parse_all(raw.as_bytes());
            assert_eq!(outcome, ParseOutcome::Malformed, "{version:?}");
        }
        let (_, _, outcome) = parse_all(b"GET / http/1.1\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::Complete);
    }

    #[test]
    fn test_target_must_be_absolute_path() {
        let (_, _, outcome) = parse_all(b"GET index.html HTTP/1.1\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::Malformed);
        let (_, _, outcome) = parse_all(b"GET /index.html\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::Malformed);
    }

    #[test]
    fn test_whitespace_runs_and_tabs() {
        let (parser, buf, outcome) = parse_all(b"GET \t /x  \tHTTP/1.1\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::Complete);
        assert_eq!(parser.head().target.slice(&buf), b"/x");
    }

    #[test]
    fn test_fragmented_delivery() {
        let raw = b"GET /frag HTTP/1.1\r\nConnection: Keep-Alive\r\nX-Other: 1\r\n\r\n";
        let mut buf = raw.to_vec();
        let mut parser = RequestParser::new();

        for end in 1..raw.len() {
            assert_eq!(parser.parse(&mut buf[..end]), ParseOutcome::NeedMoreData, "at {end}");
            assert!(parser.line_start() <= parser.scan_cursor());
            assert!(parser.scan_cursor() <= end);
        }
        assert_eq!(parser.parse(&mut buf), ParseOutcome::Complete);
        assert_eq!(parser.head().target.slice(&buf), b"/frag");
        assert!(parser.head().keep_alive);
    }

    #[test]
    fn test_line_terminators() {
        // CR as the last buffered byte waits for more input.
        let mut buf = b"GET / HTTP/1.1\r".to_vec();
        let mut parser = RequestParser::new();
        assert_eq!(parser.parse(&mut buf), ParseOutcome::NeedMoreData);
        assert_eq!(parser.state(), ParseState::RequestLine);

        let (_, _, outcome) = parse_all(b"GET / HTTP/1.1\rX\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::Malformed);
        let (_, _, outcome) = parse_all(b"GET / HTTP/1.1\n\r\n");
        assert_eq!(outcome, ParseOutcome::Malformed);
    }

    #[test]
    fn test_terminators_are_nulled_in_place() {
        let (parser, buf, _) = parse_all(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(&buf[14..], &[0, 0, 0, 0]);
        assert_eq!(parser.scan_cursor(), buf.len());
        assert_eq!(parser.line_start(), buf.len());
    }

    #[test]
    fn test_keep_alive_matching() {
        let (parser, _, _) = parse_all(b"GET / HTTP/1.1\r\nconnection:   KEEP-ALIVE  \r\n\r\n");
        assert!(parser.head().keep_alive);

        let (parser, _, _) = parse_all(b"GET / HTTP/1.1\r\nConnection: kep-alive\r\n\r\n");
        assert!(!parser.head().keep_alive);

        let (parser, _, _) = parse_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        assert!(!parser.head().keep_alive);
    }

    #[test]
    fn test_unknown_headers_are_ignored() {
        let raw = b"GET / HTTP/1.1\r\nAccept: */*\r\nno colon here\r\nUser-Agent: t\r\n\r\n";
        let (_, _, outcome) = parse_all(raw);
        assert_eq!(outcome, ParseOutcome::Complete);
    }

    #[test]
    fn test_content_length_waits_for_body() {
        let raw = b"GET / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let mut buf = raw.to_vec();
        let mut parser = RequestParser::new();

        let head_len = raw.len() - 5;
        assert_eq!(parser.parse(&mut buf[..head_len + 2]), ParseOutcome::NeedMoreData);
        assert_eq!(parser.state(), ParseState::Body);
        assert_eq!(parser.head().content_length, 5);
        assert_eq!(parser.parse(&mut buf), ParseOutcome::Complete);
        assert_eq!(parser.state(), ParseState::Done);
    }

    #[test]
    fn test_invalid_content_length() {
        let (_, _, outcome) = parse_all(b"GET / HTTP/1.1\r\nContent-Length: ten\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::Malformed);
        let (_, _, outcome) = parse_all(b"GET / HTTP/1.1\r\nContent-Length: -1\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::Malformed);
        let (_, _, outcome) = parse_all(b"GET / HTTP/1.1\r\nContent-Length: +5\r\n\r\n+5+5+");
        assert_eq!(outcome, ParseOutcome::Malformed);
        let (_, _, outcome) = parse_all(b"GET / HTTP/1.1\r\nContent-Length:\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::Malformed);
        let (_, _, outcome) = parse_all(b"GET / HTTP/1.1\r\nContent-Length: 99999999999999999999999\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::Malformed);
    }

    #[test]
    fn test_huge_content_length_is_never_complete() {
        let raw = format!("GET / HTTP/1.1\r\nContent-Length: {}\r\n\r\nabc", usize::MAX);
        let mut buf = raw.into_bytes();
        let mut parser = RequestParser::new();

        assert_eq!(parser.parse(&mut buf), ParseOutcome::NeedMoreData);
        assert_eq!(parser.state(), ParseState::Body);
        assert_eq!(parser.head().content_length, usize::MAX);
        assert_eq!(parser.parse(&mut buf), ParseOutcome::NeedMoreData);
    }

    #[test]
    fn test_line_cap_per_pass() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..150 {
            raw.extend_from_slice(format!("X-Pad-{i}: y\r\n").as_bytes());
        }
        raw.extend_from_slice(b"\r\n");

        let mut parser = RequestParser::new();
        assert_eq!(parser.parse(&mut raw), ParseOutcome::NeedMoreData);
        assert_eq!(parser.state(), ParseState::Headers);
        assert_eq!(parser.parse(&mut raw), ParseOutcome::Complete);
    }

    #[test]
    fn test_reset_clears_spans() {
        let (mut parser, _, _) = parse_all(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n");
        parser.reset();
        assert_eq!(parser, RequestParser::new());
        assert_eq!(parser.head().target, Span::default());
    }
}
