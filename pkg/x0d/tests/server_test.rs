use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use x0d::{Overrides, Server};

const ECHO_PATH_CONFIG: &str = "handler main {\n    resp.write req.path + \"\\n\";\n    return;\n}\n";

fn start(config: &str) -> (Arc<Server>, std::thread::JoinHandle<()>) {
    let overrides = Overrides {
        listen: Some("127.0.0.1:0".parse().unwrap()),
        workers: Some(2),
    };
    let server = Arc::new(Server::start(config, "test.conf", overrides).unwrap());
    let runner = server.clone();
    let thread = std::thread::spawn(move || runner.run());
    (server, thread)
}

fn stop(server: Arc<Server>, thread: std::thread::JoinHandle<()>) {
    server.shutdown();
    thread.join().unwrap();
}

/// Raw test client with response framing: reads one header block plus its
/// Content-Length body per call, keeping pipelined leftovers buffered.
struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    fn connect(server: &Server) -> Client {
        let stream = TcpStream::connect(server.local_addr()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Client {
            stream,
            buf: vec![],
        }
    }

    fn send(&mut self, data: &[u8]) {
        self.stream.write_all(data).unwrap();
    }

    fn read_response(&mut self) -> (String, Vec<u8>) {
        let mut chunk = [0u8; 4096];

        let header_end = loop {
            if let Some(at) = find(&self.buf, b"\r\n\r\n") {
                break at + 4;
            }
            let n = self.stream.read(&mut chunk).unwrap();
            assert!(n > 0, "connection closed before header end");
            self.buf.extend_from_slice(&chunk[..n]);
        };

        let head = String::from_utf8(self.buf[..header_end].to_vec()).unwrap();
        let content_length: usize = head
            .lines()
            .find_map(|line| line.strip_prefix("Content-Length: "))
            .map(|v| v.trim().parse().unwrap())
            .unwrap_or(0);

        while self.buf.len() < header_end + content_length {
            let n = self.stream.read(&mut chunk).unwrap();
            assert!(n > 0, "connection closed mid-body");
            self.buf.extend_from_slice(&chunk[..n]);
        }

        let body = self.buf[header_end..header_end + content_length].to_vec();
        self.buf.drain(..header_end + content_length);
        (head, body)
    }

    /// Reads to EOF; asserts no unframed bytes remain.
    fn expect_eof(&mut self) {
        let mut rest = vec![];
        self.stream.read_to_end(&mut rest).unwrap();
        assert!(self.buf.is_empty(), "unread response bytes left");
        assert!(rest.is_empty(), "unexpected trailing bytes");
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[test]
fn simple_get_http11() {
    let (server, thread) = start(ECHO_PATH_CONFIG);

    let mut client = Client::connect(&server);
    client.send(b"GET /hello HTTP/1.1\r\nHost: t\r\n\r\n");

    let (head, body) = client.read_response();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {}", head);
    assert!(head.contains("\r\nConnection: Keep-Alive\r\n"));
    assert!(head.contains("\r\nContent-Length: 7\r\n"));
    assert!(head.contains("\r\nDate: "));
    assert!(head.contains("\r\nServer: "));
    assert_eq!(body, b"/hello\n");

    stop(server, thread);
}

#[test]
fn keep_alive_serves_a_second_request() {
    let (server, thread) = start(ECHO_PATH_CONFIG);

    let mut client = Client::connect(&server);
    client.send(b"GET /first HTTP/1.1\r\nHost: t\r\n\r\n");
    let (_, body) = client.read_response();
    assert_eq!(body, b"/first\n");

    client.send(b"GET /second HTTP/1.1\r\nHost: t\r\n\r\n");
    let (_, body) = client.read_response();
    assert_eq!(body, b"/second\n");

    stop(server, thread);
}

#[test]
fn http10_closes_after_response() {
    let (server, thread) = start(ECHO_PATH_CONFIG);

    let mut client = Client::connect(&server);
    client.send(b"GET / HTTP/1.0\r\n\r\n");

    let (head, body) = client.read_response();
    assert!(head.starts_with("HTTP/1.0 200 OK\r\n"), "head: {}", head);
    assert!(head.contains("\r\nConnection: close\r\n"));
    assert_eq!(body, b"/\n");

    // The server closes; further reads hit EOF.
    client.expect_eof();

    stop(server, thread);
}

#[test]
fn pipelined_requests_answer_in_order() {
    let (server, thread) = start(ECHO_PATH_CONFIG);

    let mut client = Client::connect(&server);
    client.send(
        b"GET /one HTTP/1.1\r\nHost: t\r\n\r\n\
          GET /two HTTP/1.1\r\nHost: t\r\n\r\n\
          GET /three HTTP/1.1\r\nHost: t\r\n\r\n",
    );

    for expected in [&b"/one\n"[..], &b"/two\n"[..], &b"/three\n"[..]] {
        let (head, body) = client.read_response();
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body, expected);
    }

    stop(server, thread);
}

#[test]
fn malformed_request_line_is_rejected() {
    let (server, thread) = start(ECHO_PATH_CONFIG);

    let mut client = Client::connect(&server);
    client.send(b"GET\r\n\r\n");

    let (head, _) = client.read_response();
    assert!(
        head.starts_with("HTTP/0.9 400 Bad Request\r\n"),
        "head: {}",
        head
    );

    // No further request is processed on this connection.
    let _ = client.stream.write_all(b"GET / HTTP/1.1\r\nHost: t\r\n\r\n");
    client.expect_eof();

    stop(server, thread);
}

#[test]
fn range_request_on_static_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("data.bin"), b"0123456789").unwrap();

    let config = format!(
        "handler setup {{ docroot \"{}\"; }}\nhandler main {{ serve; }}\n",
        dir.path().display()
    );
    let (server, thread) = start(&config);

    let mut client = Client::connect(&server);
    client.send(b"GET /data.bin HTTP/1.1\r\nHost: t\r\nRange: bytes=0-3\r\n\r\n");

    let (head, body) = client.read_response();
    assert!(
        head.starts_with("HTTP/1.1 206 Partial Content\r\n"),
        "head: {}",
        head
    );
    assert!(head.contains("\r\nContent-Range: bytes 0-3/10\r\n"));
    assert_eq!(body, b"0123");

    stop(server, thread);
}

#[test]
fn conditional_get_yields_304() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("page.html"), b"<html></html>").unwrap();

    let config = format!(
        "handler setup {{ docroot \"{}\"; }}\nhandler main {{ serve; }}\n",
        dir.path().display()
    );
    let (server, thread) = start(&config);

    let mut client = Client::connect(&server);
    client.send(b"GET /page.html HTTP/1.1\r\nHost: t\r\n\r\n");
    let (head, _) = client.read_response();
    let etag = head
        .lines()
        .find_map(|line| line.strip_prefix("ETag: "))
        .unwrap()
        .trim()
        .to_string();

    client.send(
        format!(
            "GET /page.html HTTP/1.1\r\nHost: t\r\nIf-None-Match: {}\r\n\r\n",
            etag
        )
        .as_bytes(),
    );
    let (head, body) = client.read_response();
    assert!(head.starts_with("HTTP/1.1 304 Not Modified\r\n"), "head: {}", head);
    assert!(body.is_empty());

    stop(server, thread);
}

#[test]
fn missing_file_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let config = format!(
        "handler setup {{ docroot \"{}\"; }}\nhandler main {{ serve; }}\n",
        dir.path().display()
    );
    let (server, thread) = start(&config);

    let mut client = Client::connect(&server);
    client.send(b"GET /missing HTTP/1.1\r\nHost: t\r\n\r\n");

    let (head, _) = client.read_response();
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"), "head: {}", head);

    stop(server, thread);
}

#[test]
fn flow_routing_with_match() {
    let config = "handler api { resp.write \"api\"; return; }\n\
                  handler main {\n\
                      match req.path {\n\
                          on \"/api/\" api;\n\
                          else respond 404;\n\
                      }\n\
                  }\n";
    let (server, thread) = start(config);

    let mut client = Client::connect(&server);
    client.send(b"GET /api/v1/x HTTP/1.1\r\nHost: t\r\n\r\n");
    let (head, body) = client.read_response();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"api");

    client.send(b"GET /other HTTP/1.1\r\nHost: t\r\n\r\n");
    let (head, _) = client.read_response();
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));

    stop(server, thread);
}
