use std::collections::VecDeque;
use std::fmt::Write as _;

use net::endpoint::FileRegion;

use crate::header::Headers;
use crate::response::Response;
use crate::status_code::StatusCode;
use crate::version::Version;

/// One queued piece of wire output.
pub enum OutputChunk {
    Data(Vec<u8>),
    File(FileRegion),
}

/// Serializes one response: status line, headers, body framing (identity,
/// chunked, or close-delimited), trailers. Output accumulates in a chunk
/// queue the connection drains against the endpoint; nothing is written
/// past what the socket accepted.
pub struct Generator {
    output: VecDeque<OutputChunk>,

    chunked: bool,
    close_delimited: bool,
    is_head_response: bool,
    /// Identity framing: declared bytes still owed.
    pending_content_length: Option<u64>,
    bytes_generated: u64,
}

impl Generator {
    pub fn new() -> Self {
        Self {
            output: VecDeque::new(),
            chunked: false,
            close_delimited: false,
            is_head_response: false,
            pending_content_length: None,
            bytes_generated: 0,
        }
    }

    pub fn reset(&mut self) {
        self.chunked = false;
        self.close_delimited = false;
        self.is_head_response = false;
        self.pending_content_length = None;
        // The output queue survives: it may still hold undrained bytes of
        // the previous response.
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// Close-delimited framing requires the connection to not be reused.
    pub fn is_close_delimited(&self) -> bool {
        self.close_delimited
    }

    pub fn pending_content_length(&self) -> Option<u64> {
        self.pending_content_length
    }

    pub fn bytes_generated(&self) -> u64 {
        self.bytes_generated
    }

    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    pub fn output_mut(&mut self) -> &mut VecDeque<OutputChunk> {
        &mut self.output
    }

    fn push_data(&mut self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        self.bytes_generated += data.len() as u64;
        // Coalesce small writes into the tail buffer.
        if let Some(OutputChunk::Data(tail)) = self.output.back_mut() {
            tail.extend_from_slice(&data);
            return;
        }
        self.output.push_back(OutputChunk::Data(data));
    }

    /// Emits an interim status line, e.g. `100 Continue`.
    pub fn generate_interim(&mut self, version: Version, status: StatusCode) {
        let mut head = String::new();
        let _ = write!(
            head,
            "{} {} {}\r\n\r\n",
            version.as_str(),
            status.as_u16(),
            status.reason_phrase()
        );
        self.push_data(head.into_bytes());
    }

    /// Emits status line and headers, selects the body framing, and
    /// appends the first body chunk.
    pub fn generate_response(&mut self, response: &mut Response, is_head: bool, body: &[u8]) {
        self.is_head_response = is_head;

        let suppress_body = is_head || response.status.is_content_forbidden();

        if let Some(length) = response.content_length() {
            self.pending_content_length = Some(length);
            response
                .headers
                .overwrite("Content-Length", length.to_string());
        } else if suppress_body {
            self.pending_content_length = Some(0);
        } else if response.version >= Version::V1_1 {
            self.chunked = true;
            response.headers.overwrite("Transfer-Encoding", "chunked");
        } else {
            // HTTP/1.0 without a length: the body runs until close.
            self.close_delimited = true;
        }

        let mut head = String::new();
        let _ = write!(
            head,
            "{} {} {}\r\n",
            response.version.as_str(),
            response.status.as_u16(),
            response.reason_phrase()
        );
        response.headers.serialize(&mut head);
        head.push_str("\r\n");
        self.push_data(head.into_bytes());

        self.generate_body(response, body);
    }

    /// Appends one body chunk under the selected framing.
    pub fn generate_body(&mut self, response: &mut Response, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        if self.is_head_response || response.status.is_content_forbidden() {
            // Headers only; the body is computed but never sent.
            response.add_actual_content_length(data.len() as u64);
            return;
        }

        if self.chunked {
            let mut chunk = format!("{:x}\r\n", data.len()).into_bytes();
            chunk.extend_from_slice(data);
            chunk.extend_from_slice(b"\r\n");
            response.add_actual_content_length(data.len() as u64);
            self.push_data(chunk);
            return;
        }

        let data = match self.pending_content_length {
            Some(pending) => {
                let allowed = (pending as usize).min(data.len());
                if allowed < data.len() {
                    error!(
                        "response body exceeds the declared Content-Length; {} bytes dropped",
                        data.len() - allowed
                    );
                }
                self.pending_content_length = Some(pending - allowed as u64);
                &data[..allowed]
            }
            None => data,
        };

        response.add_actual_content_length(data.len() as u64);
        self.push_data(data.to_vec());
    }

    /// Appends a file region (zero-copy path; identity framing only).
    pub fn generate_body_file(&mut self, response: &mut Response, region: FileRegion) {
        if self.is_head_response || response.status.is_content_forbidden() {
            response.add_actual_content_length(region.length);
            return;
        }

        debug_assert!(!self.chunked);
        let length = match self.pending_content_length {
            Some(pending) => {
                let allowed = pending.min(region.length);
                self.pending_content_length = Some(pending - allowed);
                allowed
            }
            None => region.length,
        };
        if length == 0 {
            return;
        }

        response.add_actual_content_length(length);
        self.bytes_generated += length;
        self.output.push_back(OutputChunk::File(FileRegion {
            file: region.file,
            offset: region.offset,
            length,
        }));
    }

    /// Terminates the message: last chunk plus trailers in chunked mode;
    /// in identity mode this is where the declared length must have been
    /// produced exactly.
    pub fn generate_trailers(&mut self, trailers: &Headers) {
        if !self.chunked {
            debug_assert!(
                self.is_head_response || self.pending_content_length.unwrap_or(0) == 0
            );
            return;
        }

        let mut tail = String::from("0\r\n");
        trailers.serialize(&mut tail);
        tail.push_str("\r\n");
        self.push_data(tail.into_bytes());
    }
}

impl Default for Generator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status_code;

    fn wire_data(generator: &mut Generator) -> Vec<u8> {
        let mut out = vec![];
        while let Some(chunk) = generator.output_mut().pop_front() {
            match chunk {
                OutputChunk::Data(data) => out.extend_from_slice(&data),
                OutputChunk::File(_) => panic!("unexpected file chunk"),
            }
        }
        out
    }

    #[test]
    fn identity_framing_with_content_length() {
        let mut response = Response::new();
        response.set_content_length(5);
        response.headers.push("Content-Type", "text/plain");

        let mut generator = Generator::new();
        generator.generate_response(&mut response, false, b"hel");
        generator.generate_body(&mut response, b"lo");
        generator.generate_trailers(&response.trailers.clone());

        let wire = wire_data(&mut generator);
        let text = String::from_utf8(wire).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
        assert_eq!(response.actual_content_length(), 5);
        assert_eq!(generator.pending_content_length(), Some(0));
    }

    #[test]
    fn chunked_framing_without_content_length() {
        let mut response = Response::new();

        let mut generator = Generator::new();
        generator.generate_response(&mut response, false, b"hello");
        generator.generate_body(&mut response, b" world");
        generator.generate_trailers(&Headers::new());

        let text = String::from_utf8(wire_data(&mut generator)).unwrap();
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(text.contains("5\r\nhello\r\n"));
        assert!(text.contains("6\r\n world\r\n"));
        // Exactly one terminating zero chunk with the final CRLF.
        assert!(text.ends_with("0\r\n\r\n"));
        assert_eq!(text.matches("0\r\n\r\n").count(), 1);
    }

    #[test]
    fn chunked_trailers_are_appended() {
        let mut response = Response::new();
        response.trailers.push("X-Checksum", "abc");

        let mut generator = Generator::new();
        generator.generate_response(&mut response, false, b"data");
        let trailers = response.trailers.clone();
        generator.generate_trailers(&trailers);

        let text = String::from_utf8(wire_data(&mut generator)).unwrap();
        assert!(text.ends_with("0\r\nX-Checksum: abc\r\n\r\n"));
    }

    #[test]
    fn head_response_suppresses_body_but_not_headers() {
        let mut response = Response::new();
        response.set_content_length(100);

        let mut generator = Generator::new();
        generator.generate_response(&mut response, true, b"");
        generator.generate_body(&mut response, &[0u8; 100]);
        generator.generate_trailers(&Headers::new());

        let text = String::from_utf8(wire_data(&mut generator)).unwrap();
        assert!(text.contains("Content-Length: 100\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn http10_without_length_is_close_delimited() {
        let mut response = Response::new();
        response.version = Version::V1_0;

        let mut generator = Generator::new();
        generator.generate_response(&mut response, false, b"old school");

        assert!(generator.is_close_delimited());
        let text = String::from_utf8(wire_data(&mut generator)).unwrap();
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(!text.contains("Transfer-Encoding"));
        assert!(text.ends_with("old school"));
    }

    #[test]
    fn overlong_identity_body_is_clipped() {
        let mut response = Response::new();
        response.set_content_length(4);

        let mut generator = Generator::new();
        generator.generate_response(&mut response, false, b"12345678");

        let text = String::from_utf8(wire_data(&mut generator)).unwrap();
        assert!(text.ends_with("\r\n\r\n1234"));
        assert_eq!(response.actual_content_length(), 4);
    }

    #[test]
    fn error_status_line_carries_reason_phrase() {
        let mut response = Response::new();
        response.status = status_code::BAD_REQUEST;
        response.version = Version::V0_9;
        response.set_content_length(0);

        let mut generator = Generator::new();
        generator.generate_response(&mut response, false, b"");

        let text = String::from_utf8(wire_data(&mut generator)).unwrap();
        assert!(text.starts_with("HTTP/0.9 400 Bad Request\r\n"));
    }
}
