use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use net::endpoint::FileRegion;

use crate::channel::Channel;
use crate::date::{format_http_date, parse_http_date};
use crate::method::Method;
use crate::status_code;

/// Serves regular files under a document root: conditional GET, single
/// and multipart byte ranges, and the zero-copy send path.
pub struct StaticFileHandler {
    root: PathBuf,
    boundary_seq: AtomicU64,
}

impl StaticFileHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            boundary_seq: AtomicU64::new(seed()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Produces a complete response for the channel's current request.
    pub fn handle(&self, channel: &mut Channel) {
        if channel.request.method != Method::Get && channel.request.method != Method::Head {
            let body = b"405 Method Not Allowed\r\n";
            channel.response.status = status_code::METHOD_NOT_ALLOWED;
            channel.response.headers.push("Allow", "GET, HEAD");
            channel.response.headers.push("Content-Type", "text/plain");
            channel.response.set_content_length(body.len() as u64);
            if channel.send(body).is_ok() {
                channel.completed();
            }
            return;
        }

        let path = match self.resolve(&channel.request.path) {
            Some(path) => path,
            None => {
                channel.send_error(status_code::BAD_REQUEST, "invalid path");
                return;
            }
        };

        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                let status = match e.kind() {
                    std::io::ErrorKind::NotFound => status_code::NOT_FOUND,
                    std::io::ErrorKind::PermissionDenied => status_code::FORBIDDEN,
                    _ => status_code::INTERNAL_SERVER_ERROR,
                };
                channel.send_error(status, "cannot open file");
                return;
            }
        };

        let metadata = match file.metadata() {
            Ok(metadata) => metadata,
            Err(_) => {
                channel.send_error(status_code::INTERNAL_SERVER_ERROR, "stat failed");
                return;
            }
        };
        if !metadata.is_file() {
            channel.send_error(status_code::NOT_FOUND, "not a regular file");
            return;
        }

        let etag = etag(&metadata);
        let last_modified = format_http_date(mtime(&metadata));
        let size = metadata.len();

        channel.response.headers.push("Last-Modified", last_modified.clone());
        channel.response.headers.push("ETag", etag.clone());

        if let Some(status) = self.check_conditions(channel, &etag, &metadata) {
            channel.response.status = status;
            channel.response.set_content_length(0);
            channel.completed();
            return;
        }

        if self.handle_range(channel, file, &metadata, &etag, &last_modified) {
            return;
        }

        // Re-open: the range path may have consumed the handle.
        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(_) => {
                channel.send_error(status_code::INTERNAL_SERVER_ERROR, "cannot open file");
                return;
            }
        };

        channel.response.headers.push("Accept-Ranges", "bytes");
        channel
            .response
            .headers
            .push("Content-Type", mime_type(&path));
        channel.response.set_content_length(size);

        if channel.request.method == Method::Get && size > 0 {
            if channel.send_file(FileRegion::new(file, 0, size)).is_err() {
                return;
            }
        }
        channel.completed();
    }

    /// Maps the request path under the document root; dot-dot segments
    /// are refused.
    fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        let relative = Path::new(request_path.trim_start_matches('/'));
        let mut path = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(path)
    }

    /// Evaluates the conditional request headers; a Some return carries
    /// the short-circuit status (304 or 412).
    fn check_conditions(
        &self,
        channel: &Channel,
        etag: &str,
        metadata: &Metadata,
    ) -> Option<status_code::StatusCode> {
        let headers = &channel.request.headers;
        let modified = mtime(metadata).timestamp();

        if let Some(value) = headers.get("If-None-Match") {
            if etag_list_matches(value, etag) {
                return Some(status_code::NOT_MODIFIED);
            }
        }

        if let Some(value) = headers.get("If-Modified-Since") {
            if let Some(since) = parse_http_date(value) {
                if modified <= since.timestamp() {
                    return Some(status_code::NOT_MODIFIED);
                }
            }
        }

        if let Some(value) = headers.get("If-Match") {
            if value != "*" && !etag_list_matches(value, etag) {
                return Some(status_code::PRECONDITION_FAILED);
            }
        }

        if let Some(value) = headers.get("If-Unmodified-Since") {
            if let Some(since) = parse_http_date(value) {
                if modified > since.timestamp() {
                    return Some(status_code::PRECONDITION_FAILED);
                }
            }
        }

        None
    }

    /// Serves a Range request. Returns false when the request carries no
    /// applicable range and the full representation should be served.
    fn handle_range(
        &self,
        channel: &mut Channel,
        file: std::fs::File,
        metadata: &Metadata,
        etag: &str,
        last_modified: &str,
    ) -> bool {
        let size = metadata.len();

        let range_value = match channel.request.headers.get("Range") {
            Some(value) => value.to_string(),
            None => return false,
        };
        let specs = match parse_range_spec(&range_value) {
            Some(specs) => specs,
            None => return false, // syntactically invalid: full response
        };

        // An If-Range that matches neither validator disables the range.
        if let Some(cond) = channel.request.headers.get("If-Range") {
            if cond != etag && cond != last_modified {
                return false;
            }
        }

        let offsets: Vec<(u64, u64)> = specs
            .iter()
            .filter_map(|spec| make_offsets(*spec, size))
            .collect();
        if offsets.is_empty() {
            channel.response.status = status_code::RANGE_NOT_SATISFIABLE;
            channel
                .response
                .headers
                .push("Content-Range", format!("bytes */{}", size));
            channel.response.set_content_length(0);
            channel.completed();
            return true;
        }

        channel.response.status = status_code::PARTIAL_CONTENT;
        let path_mime = mime_type(Path::new(&channel.request.path));
        let is_head = channel.request.method == Method::Head;

        if offsets.len() == 1 {
            let (begin, end) = offsets[0];
            let length = end - begin + 1;
            channel.response.headers.push("Content-Type", path_mime);
            channel
                .response
                .headers
                .push("Content-Range", format!("bytes {}-{}/{}", begin, end, size));
            channel.response.set_content_length(length);

            if !is_head {
                if channel
                    .send_file(FileRegion::new(file, begin, length))
                    .is_err()
                {
                    return true;
                }
            }
            channel.completed();
            return true;
        }

        // multipart/byteranges with a precomputed total length.
        let boundary = self.make_boundary();
        let mut part_heads = vec![];
        let mut content_length = 0u64;
        for (begin, end) in &offsets {
            let head = format!(
                "\r\n--{}\r\nContent-Type: {}\r\nContent-Range: bytes {}-{}/{}\r\n\r\n",
                boundary, path_mime, begin, end, size
            );
            content_length += head.len() as u64 + (end - begin + 1);
            part_heads.push(head);
        }
        let trailer = format!("\r\n--{}--\r\n", boundary);
        content_length += trailer.len() as u64;

        channel.response.headers.push(
            "Content-Type",
            format!("multipart/byteranges; boundary={}", boundary),
        );
        channel.response.set_content_length(content_length);

        for ((begin, end), head) in offsets.iter().zip(part_heads) {
            if channel.send(head.as_bytes()).is_err() {
                return true;
            }
            if !is_head {
                let file = match file.try_clone() {
                    Ok(file) => file,
                    Err(_) => {
                        channel.send_error(status_code::INTERNAL_SERVER_ERROR, "dup failed");
                        return true;
                    }
                };
                let length = end - begin + 1;
                if channel
                    .send_file(FileRegion::new(file, *begin, length))
                    .is_err()
                {
                    return true;
                }
            }
        }
        if channel.send(trailer.as_bytes()).is_ok() {
            channel.completed();
        }
        true
    }

    fn make_boundary(&self) -> String {
        let seq = self.boundary_seq.fetch_add(1, Ordering::Relaxed);
        format!("{:016x}", seq.wrapping_mul(0x9e3779b97f4a7c15))
    }
}

fn seed() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
        | 1
}

fn mtime(metadata: &Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

/// Strong validator from inode, size and mtime, matched byte-exact.
fn etag(metadata: &Metadata) -> String {
    format!(
        "\"{:x}-{:x}-{:x}\"",
        metadata.ino(),
        metadata.len(),
        metadata.mtime()
    )
}

fn etag_list_matches(value: &str, etag: &str) -> bool {
    value == "*" || value.split(',').any(|candidate| candidate.trim() == etag)
}

/// `bytes=a-b,c-,-d` into (first, last) options; None on syntax errors.
fn parse_range_spec(value: &str) -> Option<Vec<(Option<u64>, Option<u64>)>> {
    let spec = value.strip_prefix("bytes=")?;
    let mut out = vec![];
    for part in spec.split(',') {
        let part = part.trim();
        let (first, last) = part.split_once('-')?;
        let first = if first.is_empty() {
            None
        } else {
            Some(first.parse().ok()?)
        };
        let last = if last.is_empty() {
            None
        } else {
            Some(last.parse().ok()?)
        };
        if first.is_none() && last.is_none() {
            return None;
        }
        out.push((first, last));
    }
    if out.is_empty() {
        return None;
    }
    Some(out)
}

/// Resolves one range spec to inclusive offsets, or None when it cannot
/// be satisfied by a representation of `size` bytes.
fn make_offsets(spec: (Option<u64>, Option<u64>), size: u64) -> Option<(u64, u64)> {
    if size == 0 {
        return None;
    }
    match spec {
        // last-N-bytes form
        (None, Some(n)) => {
            if n == 0 {
                return None;
            }
            Some((size.saturating_sub(n), size - 1))
        }
        (Some(first), None) => {
            if first >= size {
                return None;
            }
            Some((first, size - 1))
        }
        (Some(first), Some(last)) => {
            if first > last || first >= size {
                return None;
            }
            Some((first, last.min(size - 1)))
        }
        (None, None) => None,
    }
}

fn mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "txt" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, HttpHandler};
    use crate::date::DateSource;
    use crate::v1::generator::OutputChunk;
    use crate::v1::parser::MessageListener;
    use crate::version::Version;
    use common::errors::*;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::sync::Arc;

    struct ServeHandler(Arc<StaticFileHandler>);

    impl HttpHandler for ServeHandler {
        fn handle(&self, channel: &mut Channel) -> Result<()> {
            self.0.handle(channel);
            Ok(())
        }
    }

    fn make_channel(handler: Arc<StaticFileHandler>) -> Channel {
        Channel::new(
            Arc::new(ChannelConfig::default()),
            Arc::new(DateSource::new()),
            Arc::new(ServeHandler(handler)),
            "127.0.0.1".parse().unwrap(),
        )
    }

    fn drive(channel: &mut Channel, method: &str, uri: &str, headers: &[(&str, &str)]) {
        channel
            .on_message_begin(method, uri, Version::V1_1)
            .unwrap();
        channel.on_message_header("Host", "t").unwrap();
        for (name, value) in headers {
            channel.on_message_header(name, value).unwrap();
        }
        channel.on_message_header_end().unwrap();
        channel.on_message_end().unwrap();
    }

    /// Collects the wire bytes, materializing file regions.
    fn wire(channel: &mut Channel) -> Vec<u8> {
        let mut out = vec![];
        while let Some(chunk) = channel.generator_mut().output_mut().pop_front() {
            match chunk {
                OutputChunk::Data(data) => out.extend_from_slice(&data),
                OutputChunk::File(mut region) => {
                    region.file.seek(SeekFrom::Start(region.offset)).unwrap();
                    let mut data = vec![0u8; region.length as usize];
                    region.file.read_exact(&mut data).unwrap();
                    out.extend_from_slice(&data);
                }
            }
        }
        out
    }

    fn docroot_with(content: &[u8]) -> (tempfile::TempDir, Arc<StaticFileHandler>) {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("data.txt")).unwrap();
        file.write_all(content).unwrap();
        let handler = Arc::new(StaticFileHandler::new(dir.path()));
        (dir, handler)
    }

    fn current_etag(dir: &tempfile::TempDir) -> String {
        etag(&std::fs::metadata(dir.path().join("data.txt")).unwrap())
    }

    #[test]
    fn serves_whole_file() {
        let (_dir, handler) = docroot_with(b"0123456789");
        let mut channel = make_channel(handler);
        drive(&mut channel, "GET", "/data.txt", &[]);

        let text = String::from_utf8(wire(&mut channel)).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 10\r\n"));
        assert!(text.contains("Accept-Ranges: bytes\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("ETag: \""));
        assert!(text.contains("Last-Modified: "));
        assert!(text.ends_with("0123456789"));
    }

    #[test]
    fn head_omits_the_body() {
        let (_dir, handler) = docroot_with(b"0123456789");
        let mut channel = make_channel(handler);
        drive(&mut channel, "HEAD", "/data.txt", &[]);

        let text = String::from_utf8(wire(&mut channel)).unwrap();
        assert!(text.contains("Content-Length: 10\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn missing_file_is_404() {
        let (_dir, handler) = docroot_with(b"x");
        let mut channel = make_channel(handler);
        drive(&mut channel, "GET", "/nope.txt", &[]);
        let text = String::from_utf8(wire(&mut channel)).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn post_is_405_with_allow() {
        let (_dir, handler) = docroot_with(b"x");
        let mut channel = make_channel(handler);
        drive(&mut channel, "POST", "/data.txt", &[]);
        let text = String::from_utf8(wire(&mut channel)).unwrap();
        assert!(text.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        assert!(text.contains("Allow: GET, HEAD\r\n"));
    }

    #[test]
    fn dotdot_is_rejected() {
        let (_dir, handler) = docroot_with(b"x");
        let mut channel = make_channel(handler);
        drive(&mut channel, "GET", "/../etc/passwd", &[]);
        let text = String::from_utf8(wire(&mut channel)).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn single_range_yields_206() {
        let (_dir, handler) = docroot_with(b"0123456789");
        let mut channel = make_channel(handler);
        drive(&mut channel, "GET", "/data.txt", &[("Range", "bytes=0-3")]);

        let text = String::from_utf8(wire(&mut channel)).unwrap();
        assert!(text.starts_with("HTTP/1.1 206 Partial Content\r\n"));
        assert!(text.contains("Content-Range: bytes 0-3/10\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.ends_with("0123"));
    }

    #[test]
    fn suffix_range_serves_the_tail() {
        let (_dir, handler) = docroot_with(b"0123456789");
        let mut channel = make_channel(handler);
        drive(&mut channel, "GET", "/data.txt", &[("Range", "bytes=-4")]);

        let text = String::from_utf8(wire(&mut channel)).unwrap();
        assert!(text.contains("Content-Range: bytes 6-9/10\r\n"));
        assert!(text.ends_with("6789"));
    }

    #[test]
    fn open_ended_range_runs_to_eof() {
        let (_dir, handler) = docroot_with(b"0123456789");
        let mut channel = make_channel(handler);
        drive(&mut channel, "GET", "/data.txt", &[("Range", "bytes=7-")]);

        let text = String::from_utf8(wire(&mut channel)).unwrap();
        assert!(text.contains("Content-Range: bytes 7-9/10\r\n"));
        assert!(text.ends_with("789"));
    }

    #[test]
    fn multiple_ranges_yield_multipart_with_exact_length() {
        let (_dir, handler) = docroot_with(b"0123456789");
        let mut channel = make_channel(handler);
        drive(
            &mut channel,
            "GET",
            "/data.txt",
            &[("Range", "bytes=0-1,8-9")],
        );

        let data = wire(&mut channel);
        let text = String::from_utf8(data.clone()).unwrap();
        assert!(text.starts_with("HTTP/1.1 206 Partial Content\r\n"));
        assert!(text.contains("Content-Type: multipart/byteranges; boundary="));
        assert!(text.contains("Content-Range: bytes 0-1/10"));
        assert!(text.contains("Content-Range: bytes 8-9/10"));

        // The declared length covers the generated multipart body
        // exactly.
        let header_end = text.find("\r\n\r\n").unwrap() + 4;
        let declared: usize = text
            .lines()
            .find(|l| l.starts_with("Content-Length: "))
            .and_then(|l| l["Content-Length: ".len()..].trim().parse().ok())
            .unwrap();
        assert_eq!(data.len() - header_end, declared);
        assert!(text.ends_with("--\r\n"));
    }

    #[test]
    fn unsatisfiable_range_is_416() {
        let (_dir, handler) = docroot_with(b"0123456789");
        let mut channel = make_channel(handler);
        drive(&mut channel, "GET", "/data.txt", &[("Range", "bytes=50-60")]);

        let text = String::from_utf8(wire(&mut channel)).unwrap();
        assert!(text.starts_with("HTTP/1.1 416 Range Not Satisfiable\r\n"));
    }

    #[test]
    fn syntactically_bad_range_serves_full_body() {
        let (_dir, handler) = docroot_with(b"0123456789");
        let mut channel = make_channel(handler);
        drive(&mut channel, "GET", "/data.txt", &[("Range", "bytes=abc")]);

        let text = String::from_utf8(wire(&mut channel)).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    }

    #[test]
    fn if_range_mismatch_disables_ranges() {
        let (_dir, handler) = docroot_with(b"0123456789");
        let mut channel = make_channel(handler);
        drive(
            &mut channel,
            "GET",
            "/data.txt",
            &[("Range", "bytes=0-3"), ("If-Range", "\"stale-etag\"")],
        );

        let text = String::from_utf8(wire(&mut channel)).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("0123456789"));
    }

    #[test]
    fn if_range_with_current_etag_applies_range() {
        let (dir, handler) = docroot_with(b"0123456789");
        let etag = current_etag(&dir);
        let mut channel = make_channel(handler);
        drive(
            &mut channel,
            "GET",
            "/data.txt",
            &[("Range", "bytes=0-3"), ("If-Range", etag.as_str())],
        );

        let text = String::from_utf8(wire(&mut channel)).unwrap();
        assert!(text.starts_with("HTTP/1.1 206 Partial Content\r\n"));
    }

    #[test]
    fn if_none_match_yields_304_without_body() {
        let (dir, handler) = docroot_with(b"0123456789");
        let etag = current_etag(&dir);
        let mut channel = make_channel(handler);
        drive(
            &mut channel,
            "GET",
            "/data.txt",
            &[("If-None-Match", etag.as_str())],
        );

        let text = String::from_utf8(wire(&mut channel)).unwrap();
        assert!(text.starts_with("HTTP/1.1 304 Not Modified\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn if_modified_since_future_yields_304() {
        let (_dir, handler) = docroot_with(b"0123456789");
        let mut channel = make_channel(handler);
        drive(
            &mut channel,
            "GET",
            "/data.txt",
            &[("If-Modified-Since", "Fri, 01 Jan 2038 00:00:00 GMT")],
        );

        let text = String::from_utf8(wire(&mut channel)).unwrap();
        assert!(text.starts_with("HTTP/1.1 304 Not Modified\r\n"));
    }

    #[test]
    fn if_match_mismatch_yields_412() {
        let (_dir, handler) = docroot_with(b"0123456789");
        let mut channel = make_channel(handler);
        drive(
            &mut channel,
            "GET",
            "/data.txt",
            &[("If-Match", "\"other\"")],
        );

        let text = String::from_utf8(wire(&mut channel)).unwrap();
        assert!(text.starts_with("HTTP/1.1 412 Precondition Failed\r\n"));
    }

    #[test]
    fn if_unmodified_since_past_yields_412() {
        let (_dir, handler) = docroot_with(b"0123456789");
        let mut channel = make_channel(handler);
        drive(
            &mut channel,
            "GET",
            "/data.txt",
            &[("If-Unmodified-Since", "Mon, 01 Jan 1990 00:00:00 GMT")],
        );

        let text = String::from_utf8(wire(&mut channel)).unwrap();
        assert!(text.starts_with("HTTP/1.1 412 Precondition Failed\r\n"));
    }
}
