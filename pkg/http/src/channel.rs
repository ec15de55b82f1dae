use std::any::Any;
use std::io::{Read, Seek, SeekFrom};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use common::errors::*;
use net::endpoint::FileRegion;

use crate::date::DateSource;
use crate::method::Method;
use crate::request::Request;
use crate::response::Response;
use crate::status_code::{self, StatusCode};
use crate::v1::generator::Generator;
use crate::v1::parser::{MessageListener, ProtocolError};
use crate::version::Version;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Reading,
    Handling,
    Sending,
}

/// Response body transformation. Applied to every body chunk; the final
/// chunk arrives with `last` set so the filter can flush.
pub trait Filter: Send {
    fn filter(&mut self, input: &[u8], output: &mut Vec<u8>, last: bool);
}

/// The application side of the channel: produce a response and finish it
/// with `channel.completed()`.
pub trait HttpHandler: Send + Sync {
    fn handle(&self, channel: &mut Channel) -> Result<()>;
}

pub struct ChannelConfig {
    pub max_request_uri_length: usize,
    pub max_request_body_length: u64,
    /// Responses served per connection before `Connection: close`.
    pub max_request_count: usize,
    pub max_keep_alive: Duration,
    pub cork_stream: bool,
    pub server_tag: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_request_uri_length: 4096,
            max_request_body_length: 16 * 1024 * 1024,
            max_request_count: 100,
            max_keep_alive: Duration::from_secs(8),
            cork_stream: false,
            server_tag: concat!("x0d/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Per-request state machine bridging the parser, the application handler
/// and the generator. Reset in place for keep-alive reuse.
pub struct Channel {
    state: ChannelState,
    pub request: Request,
    pub response: Response,
    generator: Generator,

    config: Arc<ChannelConfig>,
    date_source: Arc<DateSource>,
    handler: Arc<dyn HttpHandler>,
    filters: Vec<Box<dyn Filter>>,

    persistent: bool,
    request_count: usize,
    response_complete: bool,
    aborted: bool,
    interim_sent: bool,

    /// Per-request scratch space for the application (reset between
    /// requests).
    pub custom_data: Option<Box<dyn Any + Send>>,
}

impl Channel {
    pub fn new(
        config: Arc<ChannelConfig>,
        date_source: Arc<DateSource>,
        handler: Arc<dyn HttpHandler>,
        remote_ip: IpAddr,
    ) -> Self {
        Self {
            state: ChannelState::Reading,
            request: Request::new(remote_ip),
            response: Response::new(),
            generator: Generator::new(),
            config,
            date_source,
            handler,
            filters: vec![],
            persistent: false,
            request_count: 0,
            response_complete: false,
            aborted: false,
            interim_sent: false,
            custom_data: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn set_state(&mut self, state: ChannelState) {
        trace!("channel state {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn set_persistent(&mut self, persistent: bool) {
        self.persistent = persistent;
    }

    pub fn response_complete(&self) -> bool {
        self.response_complete
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn generator_mut(&mut self) -> &mut Generator {
        &mut self.generator
    }

    /// Prepares for the next request on the same connection. The request
    /// counter and keep-alive disposition survive.
    pub fn reset(&mut self) {
        self.set_state(ChannelState::Reading);
        self.request.recycle();
        self.response.recycle();
        self.generator.reset();
        self.filters.clear();
        self.response_complete = false;
        self.interim_sent = false;
        self.custom_data = None;
    }

    /// Installs a response body filter; not allowed once committed.
    pub fn add_output_filter(&mut self, filter: Box<dyn Filter>) -> Result<()> {
        if self.response.is_committed() {
            return Err(err_msg("cannot add output filters after commit"));
        }
        self.filters.push(filter);
        Ok(())
    }

    // {{{ response production (called by the handler)

    /// Appends a body chunk, committing the response on first use.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_sendable()?;

        let data = self.apply_filters(data, false);

        if !self.response.is_committed() {
            self.commit_inline(&data);
        } else {
            self.generator.generate_body(&mut self.response, &data);
        }
        Ok(())
    }

    /// Appends a file region through the zero-copy path. With filters
    /// installed the region is read and pushed through `send` instead.
    pub fn send_file(&mut self, mut region: FileRegion) -> Result<()> {
        self.ensure_sendable()?;

        if !self.filters.is_empty() {
            let mut data = vec![0u8; region.length as usize];
            region.file.seek(SeekFrom::Start(region.offset))?;
            region.file.read_exact(&mut data)?;
            return self.send(&data);
        }

        if !self.response.is_committed() {
            self.commit_inline(b"");
        }
        self.generator.generate_body_file(&mut self.response, region);
        Ok(())
    }

    /// Marks the response as fully produced: checks the identity-framing
    /// length contract, flushes filters and trailers.
    pub fn completed(&mut self) {
        if self.response_complete {
            return;
        }

        if self.response.status == status_code::NO_RESPONSE {
            self.aborted = true;
            self.response_complete = true;
            return;
        }

        if !self.filters.is_empty() {
            let flushed = self.apply_filters(b"", true);
            if !self.response.is_committed() {
                self.commit_inline(&flushed);
            } else {
                self.generator.generate_body(&mut self.response, &flushed);
            }
        } else if !self.response.is_committed() {
            if !self.response.has_content_length() && self.request.method != Method::Head {
                self.response.set_content_length(0);
            }
            self.commit_inline(b"");
        }

        if self.request.method != Method::Head
            && !self.generator.is_chunked()
            && self.generator.pending_content_length().unwrap_or(0) > 0
        {
            error!(
                "response completed with {} declared bytes unwritten",
                self.generator.pending_content_length().unwrap_or(0)
            );
            self.aborted = true;
            self.response_complete = true;
            return;
        }

        let trailers = self.response.trailers.clone();
        self.generator.generate_trailers(&trailers);
        self.response_complete = true;
    }

    /// Produces a complete error response, unless the wire already
    /// carries response bytes, in which case the transport is aborted.
    pub fn send_error(&mut self, status: StatusCode, message: &str) {
        debug!("send_error: {} {}", status, message);

        if self.response.is_committed() {
            self.aborted = true;
            self.response_complete = true;
            return;
        }

        if self.state != ChannelState::Handling {
            self.set_state(ChannelState::Handling);
        }

        self.filters.clear();
        self.response.headers.clear();
        self.response.status = status;
        self.response.reason = None;

        let body = if status.is_content_forbidden() {
            vec![]
        } else {
            format!("{} {}\r\n", status.as_u16(), status.reason_phrase()).into_bytes()
        };

        self.response.set_content_length(body.len() as u64);
        self.response
            .headers
            .push("Content-Type", "text/plain");
        if self.send(&body).is_ok() {
            self.completed();
        }
    }

    fn ensure_sendable(&mut self) -> Result<()> {
        if self.response_complete {
            return Err(err_msg("response already completed"));
        }
        match self.state {
            ChannelState::Handling | ChannelState::Reading => Ok(()),
            ChannelState::Sending => Err(err_msg("response already fully generated")),
        }
    }

    fn apply_filters(&mut self, data: &[u8], last: bool) -> Vec<u8> {
        if self.filters.is_empty() {
            return data.to_vec();
        }
        let mut current = data.to_vec();
        for filter in &mut self.filters {
            let mut next = vec![];
            filter.filter(&current, &mut next, last);
            current = next;
        }
        current
    }

    /// The commit pass: interim 100, Date and Server patching, keep-alive
    /// disposition, then the head plus first body chunk.
    fn commit_inline(&mut self, first_chunk: &[u8]) {
        if self.request.expect_100_continue && !self.interim_sent {
            self.send_100_continue();
        }

        if self.response.status.as_u16() >= 200 {
            if !self.response.headers.contains("Date") {
                self.response
                    .headers
                    .push("Date", self.date_source.http_date());
            }
            if !self.response.headers.contains("Server") {
                self.response
                    .headers
                    .push("Server", self.config.server_tag.clone());
            }

            if self.persistent && self.request_count + 1 < self.config.max_request_count {
                self.request_count += 1;
                self.response.headers.push("Connection", "Keep-Alive");
                self.response.headers.push(
                    "Keep-Alive",
                    format!(
                        "timeout={}, max={}",
                        self.config.max_keep_alive.as_secs(),
                        self.config.max_request_count - self.request_count
                    ),
                );
            } else {
                self.persistent = false;
                self.response.headers.push("Connection", "close");
            }
        }

        self.response.set_committed();
        let is_head = self.request.method == Method::Head;
        self.generator
            .generate_response(&mut self.response, is_head, first_chunk);
    }

    /// Sends the `100 Continue` interim response.
    pub fn send_100_continue(&mut self) {
        self.request.expect_100_continue = false;
        self.interim_sent = true;
        self.generator
            .generate_interim(self.request.version, status_code::CONTINUE);
    }

    // }}}
    // {{{ request intake

    fn handle_request(&mut self) {
        // Over-long declared bodies are refused before the handler runs.
        if let Some(length) = self.request.content_length() {
            if length > self.config.max_request_body_length {
                let status = if self.request.expect_100_continue {
                    self.request.expect_100_continue = false;
                    status_code::EXPECTATION_FAILED
                } else {
                    status_code::PAYLOAD_TOO_LARGE
                };
                self.persistent = false;
                self.send_error(status, "request body too large");
                return;
            }
        }

        let handler = self.handler.clone();
        if let Err(e) = handler.handle(self) {
            error!("handler failed: {}", e);
            self.send_error(
                status_code::INTERNAL_SERVER_ERROR,
                "unhandled handler failure",
            );
            return;
        }

        if !self.response_complete {
            if self.response.is_committed() {
                self.completed();
            } else {
                self.send_error(status_code::NOT_FOUND, "request not handled");
            }
        }
    }

    // }}}
}

impl MessageListener for Channel {
    fn on_message_begin(
        &mut self,
        method: &str,
        uri: &str,
        version: Version,
    ) -> std::result::Result<(), ProtocolError> {
        self.request.version = version;
        self.response.version = version;
        self.request.method = Method::from_token(method);

        if !self.request.set_uri(uri) {
            return Err(ProtocolError::new(
                status_code::BAD_REQUEST,
                "invalid request target",
            ));
        }

        trace!(
            "message begin: {} {} {}",
            method,
            self.request.path,
            version
        );
        Ok(())
    }

    fn on_message_header(
        &mut self,
        name: &str,
        value: &str,
    ) -> std::result::Result<(), ProtocolError> {
        if name.eq_ignore_ascii_case("Expect") && value.eq_ignore_ascii_case("100-continue") {
            self.request.expect_100_continue = true;
        }
        if name.eq_ignore_ascii_case("Host") && self.request.host.is_empty() {
            self.request.host = value.to_string();
        }

        self.request.headers.push(name, value);
        Ok(())
    }

    fn on_message_header_end(&mut self) -> std::result::Result<(), ProtocolError> {
        // Keep-alive disposition: a 1.1 peer stays persistent unless it
        // asked to close; a 1.0 peer must ask for keep-alive.
        self.persistent = match self.request.version {
            Version::V1_1 => !connection_includes(&self.request, "close"),
            Version::V1_0 => connection_includes(&self.request, "keep-alive"),
            Version::V0_9 => false,
        };

        if self.state != ChannelState::Handling {
            self.set_state(ChannelState::Handling);
            self.handle_request();
        }
        Ok(())
    }

    fn on_message_content(&mut self, chunk: &[u8]) -> std::result::Result<(), ProtocolError> {
        if self.request.body.len() as u64 + chunk.len() as u64
            > self.config.max_request_body_length
        {
            return Err(ProtocolError::new(
                status_code::PAYLOAD_TOO_LARGE,
                "request body too large",
            ));
        }
        self.request.body.extend_from_slice(chunk);
        Ok(())
    }

    fn on_message_end(&mut self) -> std::result::Result<(), ProtocolError> {
        self.request.complete = true;
        Ok(())
    }
}

fn connection_includes(request: &Request, token: &str) -> bool {
    match request.headers.get("Connection") {
        Some(value) => value
            .split(',')
            .any(|part| part.trim().eq_ignore_ascii_case(token)),
        None => false,
    }
}
