use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use net::endpoint::{Connection, ConnectionFactory, Endpoint};

use crate::channel::{Channel, ChannelConfig, ChannelState, HttpHandler};
use crate::date::DateSource;
use crate::v1::generator::OutputChunk;
use crate::v1::parser::{Parser, ParserLimits};
use crate::version::Version;

/// What the protocol machine wants from the transport next.
enum Action {
    WantFill,
    WantFlush,
    Close,
}

/// One HTTP/1 connection: reads request bytes from the endpoint, feeds
/// the parser, lets the channel produce the response, and drains the
/// generator back into the endpoint. Handles keep-alive and pipelining.
pub struct Http1Connection {
    state: Mutex<ConnState>,
    cork_stream: bool,
}

struct ConnState {
    parser: Parser,
    input: Vec<u8>,
    input_offset: usize,
    channel: Channel,
    bytes_transmitted: u64,
}

impl Http1Connection {
    pub fn new(
        config: Arc<ChannelConfig>,
        limits: ParserLimits,
        date_source: Arc<DateSource>,
        handler: Arc<dyn HttpHandler>,
        remote_ip: IpAddr,
    ) -> Self {
        let cork_stream = config.cork_stream;
        Self {
            state: Mutex::new(ConnState {
                parser: Parser::new(limits),
                input: vec![],
                input_offset: 0,
                channel: Channel::new(config, date_source, handler, remote_ip),
                bytes_transmitted: 0,
            }),
            cork_stream,
        }
    }

    /// Connection factory for plain HTTP/1 endpoints.
    pub fn factory(
        config: Arc<ChannelConfig>,
        limits: ParserLimits,
        date_source: Arc<DateSource>,
        handler: Arc<dyn HttpHandler>,
    ) -> ConnectionFactory {
        Arc::new(move |endpoint: &Endpoint| -> Arc<dyn Connection> {
            Arc::new(Http1Connection::new(
                config.clone(),
                limits,
                date_source.clone(),
                handler.clone(),
                endpoint.remote_addr().ip(),
            ))
        })
    }

    /// Drives parse/flush cycles until the connection blocks on I/O,
    /// closes, or runs out of buffered input.
    fn process(&self, state: &mut ConnState, endpoint: &Endpoint) -> Action {
        loop {
            if state.channel.is_aborted() {
                return Action::Close;
            }

            // Drain generated output first; nothing new happens while
            // response bytes are still owed to the socket.
            if state.channel.generator_mut().has_output() {
                if self.cork_stream {
                    endpoint.set_corking(true);
                }
                match self.try_flush(state, endpoint) {
                    FlushResult::Drained => {}
                    FlushResult::Blocked => return Action::WantFlush,
                    FlushResult::Failed => return Action::Close,
                }
            }

            if state.channel.response_complete() {
                let close_delimited = state.channel.generator_mut().is_close_delimited();
                if !state.channel.is_persistent()
                    || close_delimited
                    || !state.parser.is_message_begin()
                {
                    trace!("response complete, closing connection");
                    return Action::Close;
                }

                // Keep-alive: recycle the exchange and continue with any
                // pipelined bytes already buffered.
                state
                    .channel
                    .response
                    .set_bytes_transmitted(state.bytes_transmitted);
                state.channel.reset();
                if self.cork_stream {
                    endpoint.set_corking(false);
                }
            }

            if state.input_offset >= state.input.len() {
                state.input.clear();
                state.input_offset = 0;
                return Action::WantFill;
            }

            let parsed = {
                let input = &state.input[state.input_offset..];
                // Safety valve for the borrow: parser and channel are
                // distinct fields.
                let (parser, channel) = (&mut state.parser, &mut state.channel);
                parser.parse_fragment(input, channel)
            };

            match parsed {
                Ok(n) => {
                    state.input_offset += n;
                    if !state.channel.response_complete()
                        && !state.channel.generator_mut().has_output()
                    {
                        // Message still incomplete; wait for more bytes.
                        self.compact(state);
                        return Action::WantFill;
                    }
                }
                Err(e) => {
                    debug!("protocol error: {}", e);

                    // An error before the request line completed has no
                    // negotiated version to answer with.
                    if state.channel.request.unparsed_uri.is_empty() {
                        state.channel.response.version = Version::V0_9;
                    }
                    if state.channel.state() == ChannelState::Reading {
                        state.channel.set_state(ChannelState::Handling);
                    }
                    state.channel.set_persistent(false);
                    state.channel.send_error(e.status, &e.message);
                }
            }
        }
    }

    fn try_flush(&self, state: &mut ConnState, endpoint: &Endpoint) -> FlushResult {
        if state.channel.response_complete()
            && state.channel.state() != ChannelState::Sending
        {
            state.channel.set_state(ChannelState::Sending);
        }

        loop {
            let output = state.channel.generator_mut().output_mut();
            let chunk = match output.front_mut() {
                Some(chunk) => chunk,
                None => {
                    if state.channel.state() == ChannelState::Sending {
                        state.channel.set_state(ChannelState::Handling);
                    }
                    return FlushResult::Drained;
                }
            };

            match chunk {
                OutputChunk::Data(data) => match endpoint.flush(data) {
                    Ok(0) => return FlushResult::Blocked,
                    Ok(n) if n < data.len() => {
                        data.drain(..n);
                        state.bytes_transmitted += n as u64;
                        return FlushResult::Blocked;
                    }
                    Ok(n) => {
                        state.bytes_transmitted += n as u64;
                        output.pop_front();
                    }
                    Err(e) => {
                        debug!("flush: {}", e);
                        return FlushResult::Failed;
                    }
                },
                OutputChunk::File(region) => match endpoint.flush_file(region) {
                    Ok(0) => return FlushResult::Blocked,
                    Ok(n) => {
                        state.bytes_transmitted += n as u64;
                        if region.is_drained() {
                            output.pop_front();
                        } else {
                            return FlushResult::Blocked;
                        }
                    }
                    Err(e) => {
                        debug!("flush_file: {}", e);
                        return FlushResult::Failed;
                    }
                },
            }
        }
    }

    fn compact(&self, state: &mut ConnState) {
        if state.input_offset == state.input.len() {
            state.input.clear();
            state.input_offset = 0;
        } else if state.input_offset > 64 * 1024 {
            state.input.drain(..state.input_offset);
            state.input_offset = 0;
        }
    }

    fn apply(&self, action: Action, endpoint: &Endpoint) {
        match action {
            Action::WantFill => endpoint.want_fill(),
            Action::WantFlush => endpoint.want_flush(),
            Action::Close => endpoint.close(),
        }
    }
}

enum FlushResult {
    Drained,
    Blocked,
    Failed,
}

impl Connection for Http1Connection {
    fn on_open(&self, endpoint: &Endpoint) {
        trace!("connection open from {}", endpoint.remote_addr());
        endpoint.want_fill();
    }

    fn on_fillable(&self, endpoint: &Endpoint) {
        let action = {
            let mut state = self.state.lock().unwrap();

            match endpoint.fill(&mut state.input) {
                Ok(0) => {
                    // Peer closed (or nothing to read on a spurious
                    // wakeup; treated as close, matching one-shot
                    // readiness semantics).
                    Action::Close
                }
                Ok(_) => self.process(&mut state, endpoint),
                Err(e) => {
                    debug!("fill: {}", e);
                    Action::Close
                }
            }
        };
        self.apply(action, endpoint);
    }

    fn on_flushable(&self, endpoint: &Endpoint) {
        let action = {
            let mut state = self.state.lock().unwrap();
            self.process(&mut state, endpoint)
        };
        self.apply(action, endpoint);
    }

    fn on_read_timeout(&self, endpoint: &Endpoint) -> bool {
        debug!("read timeout on {}", endpoint.remote_addr());
        true
    }

    fn on_write_timeout(&self, endpoint: &Endpoint) -> bool {
        debug!("write timeout on {}", endpoint.remote_addr());
        true
    }

    fn on_close(&self, endpoint: &Endpoint) {
        trace!("connection closed: {}", endpoint.remote_addr());
    }
}
