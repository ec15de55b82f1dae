use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct StatusCode(pub u16);

pub const CONTINUE: StatusCode = StatusCode(100);
pub const OK: StatusCode = StatusCode(200);
pub const PARTIAL_CONTENT: StatusCode = StatusCode(206);
pub const NOT_MODIFIED: StatusCode = StatusCode(304);
pub const BAD_REQUEST: StatusCode = StatusCode(400);
pub const FORBIDDEN: StatusCode = StatusCode(403);
pub const NOT_FOUND: StatusCode = StatusCode(404);
pub const METHOD_NOT_ALLOWED: StatusCode = StatusCode(405);
pub const REQUEST_TIMEOUT: StatusCode = StatusCode(408);
pub const PRECONDITION_FAILED: StatusCode = StatusCode(412);
pub const PAYLOAD_TOO_LARGE: StatusCode = StatusCode(413);
pub const URI_TOO_LONG: StatusCode = StatusCode(414);
pub const RANGE_NOT_SATISFIABLE: StatusCode = StatusCode(416);
pub const EXPECTATION_FAILED: StatusCode = StatusCode(417);
pub const HEADER_FIELDS_TOO_LARGE: StatusCode = StatusCode(431);
/// Internal marker: produce no response at all and abort the transport.
pub const NO_RESPONSE: StatusCode = StatusCode(444);
pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
pub const NOT_IMPLEMENTED: StatusCode = StatusCode(501);
pub const SERVICE_UNAVAILABLE: StatusCode = StatusCode(503);
pub const VERSION_NOT_SUPPORTED: StatusCode = StatusCode(505);

impl StatusCode {
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    pub fn is_error(&self) -> bool {
        self.0 >= 400
    }

    /// Whether a message with this status code carries a body at all.
    pub fn is_content_forbidden(&self) -> bool {
        matches!(self.0, 100..=199 | 204 | 304)
    }

    pub fn reason_phrase(&self) -> &'static str {
        match self.0 {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            206 => "Partial Content",
            301 => "Moved Permanently",
            302 => "Found",
            304 => "Not Modified",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            406 => "Not Acceptable",
            408 => "Request Timeout",
            409 => "Conflict",
            410 => "Gone",
            411 => "Length Required",
            412 => "Precondition Failed",
            413 => "Payload Too Large",
            414 => "URI Too Long",
            416 => "Range Not Satisfiable",
            417 => "Expectation Failed",
            431 => "Request Header Fields Too Large",
            444 => "No Response",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            505 => "HTTP Version Not Supported",
            _ => "",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
