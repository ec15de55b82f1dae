use common::errors::*;

use crate::status_code::{self, StatusCode};
use crate::version::Version;

/// A malformed or over-limit request, carrying the status the error path
/// responds with. Parsing errors are ordinary values, not unwinds.
#[derive(Debug, Fail)]
#[fail(display = "{} {}", status, message)]
pub struct ProtocolError {
    pub status: StatusCode,
    pub message: String,
}

impl ProtocolError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Consumer of parse events. Implemented by the HTTP channel; a listener
/// error aborts the message with its protocol error.
pub trait MessageListener {
    fn on_message_begin(
        &mut self,
        method: &str,
        uri: &str,
        version: Version,
    ) -> std::result::Result<(), ProtocolError>;

    fn on_message_header(
        &mut self,
        name: &str,
        value: &str,
    ) -> std::result::Result<(), ProtocolError>;

    fn on_message_header_end(&mut self) -> std::result::Result<(), ProtocolError>;

    fn on_message_content(&mut self, chunk: &[u8]) -> std::result::Result<(), ProtocolError>;

    fn on_message_end(&mut self) -> std::result::Result<(), ProtocolError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParserLimits {
    pub max_request_uri_length: usize,
    pub max_header_size: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            max_request_uri_length: 4096,
            max_header_size: 16 * 1024,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// Before (or between) messages, expecting a request line.
    MessageBegin,
    HeaderLine,
    Content { remaining: u64 },
    ChunkSize,
    ChunkBody { remaining: u64 },
    /// CRLF after a chunk's data.
    ChunkBodyEnd,
    Trailer,
    /// A protocol error was diagnosed; no further input is accepted.
    Error,
}

/// Incremental request parser. `parse_fragment` consumes what it can and
/// leaves the parser resumable; one call processes at most one complete
/// message so pipelined requests are handled strictly in sequence.
pub struct Parser {
    state: State,
    limits: ParserLimits,

    /// Last parsed header, held back for LWS continuation lines.
    pending_header: Option<(String, String)>,
    header_bytes: usize,
    content_length: Option<u64>,
    chunked: bool,
    host_count: usize,
    version: Version,
}

impl Parser {
    pub fn new(limits: ParserLimits) -> Self {
        Self {
            state: State::MessageBegin,
            limits,
            pending_header: None,
            header_bytes: 0,
            content_length: None,
            chunked: false,
            host_count: 0,
            version: Version::V0_9,
        }
    }

    /// True when the parser sits between messages (the previous request
    /// was fully consumed).
    pub fn is_message_begin(&self) -> bool {
        self.state == State::MessageBegin
    }

    fn reset_message(&mut self) {
        self.state = State::MessageBegin;
        self.pending_header = None;
        self.header_bytes = 0;
        self.content_length = None;
        self.chunked = false;
        self.host_count = 0;
        self.version = Version::V0_9;
    }

    fn fail(&mut self, status: StatusCode, message: impl Into<String>) -> ProtocolError {
        self.state = State::Error;
        ProtocolError::new(status, message)
    }

    /// Consumes as much of `input` as possible, emitting events. Returns
    /// the number of bytes consumed; the caller keeps the rest buffered
    /// and calls again once more data arrived.
    pub fn parse_fragment(
        &mut self,
        input: &[u8],
        listener: &mut dyn MessageListener,
    ) -> std::result::Result<usize, ProtocolError> {
        let mut pos = 0;

        loop {
            match self.state {
                State::Error => {
                    return Err(ProtocolError::new(
                        status_code::BAD_REQUEST,
                        "parser in error state",
                    ))
                }

                State::MessageBegin => {
                    // Robustness: ignore empty line(s) before the request
                    // line.
                    while input[pos..].starts_with(b"\r\n") {
                        pos += 2;
                    }

                    let line = match self.take_line(input, &mut pos)? {
                        Some(line) => line,
                        None => {
                            if input.len() - pos
                                > self.limits.max_request_uri_length + 256
                            {
                                return Err(self.fail(
                                    status_code::URI_TOO_LONG,
                                    "request line too long",
                                ));
                            }
                            return Ok(pos);
                        }
                    };
                    self.parse_request_line(&line, listener)?;
                    self.state = State::HeaderLine;
                }

                State::HeaderLine => {
                    let line = match self.take_line(input, &mut pos)? {
                        Some(line) => line,
                        None => {
                            if input.len() - pos + self.header_bytes
                                > self.limits.max_header_size
                            {
                                return Err(self.fail(
                                    status_code::HEADER_FIELDS_TOO_LARGE,
                                    "header section too large",
                                ));
                            }
                            return Ok(pos);
                        }
                    };

                    self.header_bytes += line.len() + 2;
                    if self.header_bytes > self.limits.max_header_size {
                        return Err(self.fail(
                            status_code::HEADER_FIELDS_TOO_LARGE,
                            "header section too large",
                        ));
                    }

                    if line.is_empty() {
                        self.finish_headers(listener)?;
                        if self.chunked {
                            self.state = State::ChunkSize;
                        } else {
                            match self.content_length.unwrap_or(0) {
                                0 => {
                                    listener.on_message_end().map_err(|e| self.listener_err(e))?;
                                    self.reset_message();
                                    return Ok(pos);
                                }
                                n => self.state = State::Content { remaining: n },
                            }
                        }
                        continue;
                    }

                    self.parse_header_line(&line, listener)?;
                }

                State::Content { remaining } => {
                    if pos == input.len() {
                        return Ok(pos);
                    }
                    let take = (remaining as usize).min(input.len() - pos);
                    listener
                        .on_message_content(&input[pos..pos + take])
                        .map_err(|e| self.listener_err(e))?;
                    pos += take;

                    let remaining = remaining - take as u64;
                    if remaining == 0 {
                        listener.on_message_end().map_err(|e| self.listener_err(e))?;
                        self.reset_message();
                        return Ok(pos);
                    }
                    self.state = State::Content { remaining };
                }

                State::ChunkSize => {
                    let line = match self.take_line(input, &mut pos)? {
                        Some(line) => line,
                        None => return Ok(pos),
                    };
                    let text = match std::str::from_utf8(&line) {
                        Ok(text) => text,
                        Err(_) => {
                            return Err(
                                self.fail(status_code::BAD_REQUEST, "bad chunk size line")
                            )
                        }
                    };
                    let size_part = text.split(';').next().unwrap_or("").trim();
                    let size = match u64::from_str_radix(size_part, 16) {
                        Ok(size) => size,
                        Err(_) => {
                            return Err(
                                self.fail(status_code::BAD_REQUEST, "bad chunk size line")
                            )
                        }
                    };
                    self.state = if size == 0 {
                        State::Trailer
                    } else {
                        State::ChunkBody { remaining: size }
                    };
                }

                State::ChunkBody { remaining } => {
                    if pos == input.len() {
                        return Ok(pos);
                    }
                    let take = (remaining as usize).min(input.len() - pos);
                    listener
                        .on_message_content(&input[pos..pos + take])
                        .map_err(|e| self.listener_err(e))?;
                    pos += take;

                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        State::ChunkBodyEnd
                    } else {
                        State::ChunkBody { remaining }
                    };
                }

                State::ChunkBodyEnd => {
                    if input.len() - pos < 2 {
                        return Ok(pos);
                    }
                    if &input[pos..pos + 2] != b"\r\n" {
                        return Err(self.fail(
                            status_code::BAD_REQUEST,
                            "missing CRLF after chunk data",
                        ));
                    }
                    pos += 2;
                    self.state = State::ChunkSize;
                }

                State::Trailer => {
                    let line = match self.take_line(input, &mut pos)? {
                        Some(line) => line,
                        None => return Ok(pos),
                    };
                    if line.is_empty() {
                        if let Some((name, value)) = self.pending_header.take() {
                            listener
                                .on_message_header(&name, &value)
                                .map_err(|e| self.listener_err(e))?;
                        }
                        listener.on_message_end().map_err(|e| self.listener_err(e))?;
                        self.reset_message();
                        return Ok(pos);
                    }
                    self.parse_header_line(&line, listener)?;
                }
            }
        }
    }

    /// Takes one CRLF-terminated line starting at `pos`, or None when the
    /// terminator has not arrived. Bare LF line endings are rejected.
    fn take_line(
        &mut self,
        input: &[u8],
        pos: &mut usize,
    ) -> std::result::Result<Option<Vec<u8>>, ProtocolError> {
        let rest = &input[*pos..];
        for i in 0..rest.len() {
            match rest[i] {
                b'\r' => {
                    if i + 1 >= rest.len() {
                        return Ok(None);
                    }
                    if rest[i + 1] != b'\n' {
                        return Err(
                            self.fail(status_code::BAD_REQUEST, "stray CR in message")
                        );
                    }
                    let line = rest[..i].to_vec();
                    *pos += i + 2;
                    return Ok(Some(line));
                }
                b'\n' => {
                    return Err(self.fail(
                        status_code::BAD_REQUEST,
                        "bare LF line ending is not allowed",
                    ))
                }
                _ => {}
            }
        }
        Ok(None)
    }

    fn parse_request_line(
        &mut self,
        line: &[u8],
        listener: &mut dyn MessageListener,
    ) -> std::result::Result<(), ProtocolError> {
        let text = match std::str::from_utf8(line) {
            Ok(text) => text,
            Err(_) => return Err(self.fail(status_code::BAD_REQUEST, "bad request line")),
        };

        let mut parts = text.split(' ');
        let (method, uri, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(method), Some(uri), Some(version), None) => (method, uri, version),
            _ => return Err(self.fail(status_code::BAD_REQUEST, "bad request line")),
        };

        if method.is_empty() || !method.bytes().all(is_token_char) {
            return Err(self.fail(status_code::BAD_REQUEST, "bad request method"));
        }
        if uri.is_empty() || uri.bytes().any(|b| b <= 0x20 || b == 0x7f) {
            return Err(self.fail(status_code::BAD_REQUEST, "bad request target"));
        }
        if uri.len() > self.limits.max_request_uri_length {
            return Err(self.fail(status_code::URI_TOO_LONG, "request target too long"));
        }

        let version = match Version::parse(version) {
            Some(version) => version,
            None => {
                return Err(self.fail(
                    status_code::VERSION_NOT_SUPPORTED,
                    format!("unsupported HTTP version '{}'", version),
                ))
            }
        };
        self.version = version;

        listener
            .on_message_begin(method, uri, version)
            .map_err(|e| self.listener_err(e))
    }

    fn parse_header_line(
        &mut self,
        line: &[u8],
        listener: &mut dyn MessageListener,
    ) -> std::result::Result<(), ProtocolError> {
        let text = match std::str::from_utf8(line) {
            Ok(text) => text,
            Err(_) => return Err(self.fail(status_code::BAD_REQUEST, "bad header field")),
        };

        // LWS continuation extends the previous field value.
        if text.starts_with(' ') || text.starts_with('\t') {
            match &mut self.pending_header {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(text.trim());
                    return Ok(());
                }
                None => {
                    return Err(self.fail(
                        status_code::BAD_REQUEST,
                        "continuation line without a header field",
                    ))
                }
            }
        }

        if let Some((name, value)) = self.pending_header.take() {
            self.emit_header(name, value, listener)?;
        }

        let (name, value) = match text.split_once(':') {
            Some((name, value)) => (name, value.trim()),
            None => return Err(self.fail(status_code::BAD_REQUEST, "header field without colon")),
        };
        if name.is_empty() || !name.bytes().all(is_token_char) {
            return Err(self.fail(
                status_code::BAD_REQUEST,
                format!("illegal header field name '{}'", name),
            ));
        }

        self.pending_header = Some((name.to_string(), value.to_string()));
        Ok(())
    }

    fn emit_header(
        &mut self,
        name: String,
        value: String,
        listener: &mut dyn MessageListener,
    ) -> std::result::Result<(), ProtocolError> {
        if name.eq_ignore_ascii_case("Content-Length") {
            if self.content_length.is_some() {
                return Err(self.fail(
                    status_code::BAD_REQUEST,
                    "multiple Content-Length headers",
                ));
            }
            match value.trim().parse::<u64>() {
                Ok(length) => self.content_length = Some(length),
                Err(_) => {
                    return Err(self.fail(status_code::BAD_REQUEST, "bad Content-Length"))
                }
            }
        } else if name.eq_ignore_ascii_case("Transfer-Encoding") {
            let last = value.rsplit(',').next().unwrap_or("").trim();
            if last.eq_ignore_ascii_case("chunked") {
                self.chunked = true;
            } else {
                return Err(self.fail(
                    status_code::NOT_IMPLEMENTED,
                    format!("unsupported transfer coding '{}'", last),
                ));
            }
        } else if name.eq_ignore_ascii_case("Host") {
            self.host_count += 1;
            if self.host_count > 1 {
                // rfc7230, section 5.4
                return Err(self.fail(
                    status_code::BAD_REQUEST,
                    "multiple Host headers are illegal",
                ));
            }
        }

        listener
            .on_message_header(&name, &value)
            .map_err(|e| self.listener_err(e))
    }

    fn finish_headers(
        &mut self,
        listener: &mut dyn MessageListener,
    ) -> std::result::Result<(), ProtocolError> {
        if let Some((name, value)) = self.pending_header.take() {
            self.emit_header(name, value, listener)?;
        }

        // rfc7230, section 5.4
        if self.version == Version::V1_1 && self.host_count == 0 {
            return Err(self.fail(status_code::BAD_REQUEST, "no Host header given"));
        }

        if self.chunked && self.content_length.is_some() {
            return Err(self.fail(
                status_code::BAD_REQUEST,
                "both Content-Length and chunked Transfer-Encoding",
            ));
        }

        listener
            .on_message_header_end()
            .map_err(|e| self.listener_err(e))
    }

    fn listener_err(&mut self, e: ProtocolError) -> ProtocolError {
        self.state = State::Error;
        e
    }
}

fn is_token_char(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^'
        | b'_' | b'`' | b'|' | b'~'
        | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
}
