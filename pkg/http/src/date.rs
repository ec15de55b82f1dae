use std::sync::Mutex;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

pub const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %T GMT";

/// Shared source for `Date` header values, re-rendered at most once per
/// second.
pub struct DateSource {
    cached: Mutex<(i64, String)>,
}

impl DateSource {
    pub fn new() -> Self {
        Self {
            cached: Mutex::new((0, String::new())),
        }
    }

    pub fn http_date(&self) -> String {
        let now = Utc::now();
        let second = now.timestamp();

        let mut cached = self.cached.lock().unwrap();
        if cached.0 != second {
            *cached = (second, now.format(HTTP_DATE_FORMAT).to_string());
        }
        cached.1.clone()
    }
}

impl Default for DateSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders an arbitrary timestamp as an HTTP date.
pub fn format_http_date(time: DateTime<Utc>) -> String {
    time.format(HTTP_DATE_FORMAT).to_string()
}

/// Parses an HTTP date (`%a, %d %b %Y %T GMT`).
pub fn parse_http_date(text: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(text, HTTP_DATE_FORMAT).ok()?;
    Some(Utc.from_utc_datetime(&naive))
}
