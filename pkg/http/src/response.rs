use crate::header::Headers;
use crate::status_code::{self, StatusCode};
use crate::version::Version;

/// Response state for one request/response exchange. Body generation and
/// completion run through the channel.
#[derive(Debug)]
pub struct Response {
    pub version: Version,
    pub status: StatusCode,
    pub reason: Option<String>,
    pub headers: Headers,
    pub trailers: Headers,

    committed: bool,
    content_length: Option<u64>,
    actual_content_length: u64,
    bytes_transmitted: u64,
}

impl Response {
    pub fn new() -> Self {
        Self {
            version: Version::V1_1,
            status: status_code::OK,
            reason: None,
            headers: Headers::new(),
            trailers: Headers::new(),
            committed: false,
            content_length: None,
            actual_content_length: 0,
            bytes_transmitted: 0,
        }
    }

    pub fn recycle(&mut self) {
        self.version = Version::V1_1;
        self.status = status_code::OK;
        self.reason = None;
        self.headers.clear();
        self.trailers.clear();
        self.committed = false;
        self.content_length = None;
        self.actual_content_length = 0;
        self.bytes_transmitted = 0;
    }

    pub fn reason_phrase(&self) -> &str {
        match &self.reason {
            Some(reason) => reason,
            None => self.status.reason_phrase(),
        }
    }

    /// Declares identity framing with an exact body length. Only valid
    /// before commit.
    pub fn set_content_length(&mut self, length: u64) {
        debug_assert!(!self.committed);
        self.content_length = Some(length);
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn has_content_length(&self) -> bool {
        self.content_length.is_some()
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn set_committed(&mut self) {
        self.committed = true;
    }

    pub fn add_actual_content_length(&mut self, n: u64) {
        self.actual_content_length += n;
    }

    pub fn actual_content_length(&self) -> u64 {
        self.actual_content_length
    }

    pub fn set_bytes_transmitted(&mut self, n: u64) {
        self.bytes_transmitted = n;
    }

    pub fn bytes_transmitted(&self) -> u64 {
        self.bytes_transmitted
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}
