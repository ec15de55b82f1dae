use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Version {
    V0_9,
    V1_0,
    V1_1,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::V0_9 => "HTTP/0.9",
            Version::V1_0 => "HTTP/1.0",
            Version::V1_1 => "HTTP/1.1",
        }
    }

    /// Parses the `HTTP/x.y` production of the request line.
    pub fn parse(text: &str) -> Option<Version> {
        match text {
            "HTTP/0.9" => Some(Version::V0_9),
            "HTTP/1.0" => Some(Version::V1_0),
            "HTTP/1.1" => Some(Version::V1_1),
            _ => None,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
