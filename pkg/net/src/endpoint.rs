use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::errors::*;

use crate::scheduler::{Scheduler, WatchHandle};

/// First byte of an alternative-protocol prelude: `0x01` followed by a
/// length-prefixed protocol name selects a non-default connection factory.
pub const MAGIC_PROTOCOL_SWITCH_BYTE: u8 = 0x01;

/// A file range handed to the kernel zero-copy send path. `offset` and
/// `length` advance as bytes are transmitted.
pub struct FileRegion {
    pub file: std::fs::File,
    pub offset: u64,
    pub length: u64,
}

impl FileRegion {
    pub fn new(file: std::fs::File, offset: u64, length: u64) -> Self {
        Self {
            file,
            offset,
            length,
        }
    }

    pub fn is_drained(&self) -> bool {
        self.length == 0
    }
}

/// The protocol-level object owning one endpoint's traffic. Callbacks run
/// on the endpoint's loop thread and receive the endpoint by reference;
/// the connection never stores it.
pub trait Connection: Send + Sync {
    fn on_open(&self, endpoint: &Endpoint);
    fn on_fillable(&self, endpoint: &Endpoint);
    fn on_flushable(&self, endpoint: &Endpoint);

    /// Returns true when the endpoint should be closed on a read timeout.
    fn on_read_timeout(&self, _endpoint: &Endpoint) -> bool {
        true
    }

    fn on_write_timeout(&self, _endpoint: &Endpoint) -> bool {
        true
    }

    fn on_close(&self, _endpoint: &Endpoint) {}
}

pub type ConnectionFactory = Arc<dyn Fn(&Endpoint) -> Arc<dyn Connection> + Send + Sync>;

/// One accepted transport connection, pinned to one scheduler for its
/// whole lifetime.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

struct Inner {
    fd: RawFd,
    scheduler: Arc<Scheduler>,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    state: Mutex<State>,
}

struct State {
    closed: bool,
    corking: bool,
    read_timeout: Duration,
    write_timeout: Duration,
    /// Bytes consumed ahead of the connection (protocol detection).
    readahead: Vec<u8>,
    io_watch: Option<WatchHandle>,
    connection: Option<Arc<dyn Connection>>,
    on_closed: Option<Box<dyn FnOnce(&Endpoint) + Send>>,
}

impl Endpoint {
    pub fn new(
        fd: RawFd,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        scheduler: Arc<Scheduler>,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                fd,
                scheduler,
                remote_addr,
                local_addr,
                state: Mutex::new(State {
                    closed: false,
                    corking: false,
                    read_timeout,
                    write_timeout,
                    readahead: vec![],
                    io_watch: None,
                    connection: None,
                    on_closed: None,
                }),
            }),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.inner.scheduler
    }

    pub fn is_open(&self) -> bool {
        !self.inner.state.lock().unwrap().closed
    }

    pub fn set_connection(&self, connection: Arc<dyn Connection>) {
        self.inner.state.lock().unwrap().connection = Some(connection);
    }

    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.inner.state.lock().unwrap().connection.clone()
    }

    /// Hook invoked once when the endpoint closes; the listener uses it
    /// to unlink the endpoint from its connected set.
    pub fn set_on_closed(&self, hook: Box<dyn FnOnce(&Endpoint) + Send>) {
        self.inner.state.lock().unwrap().on_closed = Some(hook);
    }

    pub fn set_read_timeout(&self, timeout: Duration) {
        self.inner.state.lock().unwrap().read_timeout = timeout;
    }

    pub fn set_write_timeout(&self, timeout: Duration) {
        self.inner.state.lock().unwrap().write_timeout = timeout;
    }

    /// Reads once into `buf`. Returns the byte count; 0 means end of
    /// stream or nothing available right now. Soft errors (EAGAIN,
    /// EINTR) are not failures.
    pub fn fill(&self, buf: &mut Vec<u8>) -> Result<usize> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return Ok(0);
            }
            if !state.readahead.is_empty() {
                let n = state.readahead.len();
                buf.extend_from_slice(&state.readahead);
                state.readahead.clear();
                return Ok(n);
            }
        }

        let mut chunk = [0u8; 16 * 1024];
        loop {
            let n = unsafe {
                libc::read(
                    self.inner.fd,
                    chunk.as_mut_ptr() as *mut libc::c_void,
                    chunk.len(),
                )
            };
            if n >= 0 {
                buf.extend_from_slice(&chunk[..n as usize]);
                return Ok(n as usize);
            }

            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            match errno {
                libc::EINTR => continue,
                libc::EAGAIN => return Ok(0),
                _ => return Err(errno_error("read", self.inner.fd)),
            }
        }
    }

    /// Writes once from `src`; returns the accepted byte count (0 on
    /// would-block).
    pub fn flush(&self, src: &[u8]) -> Result<usize> {
        if !self.is_open() {
            return Err(err_msg("flush on closed endpoint"));
        }

        loop {
            let n = unsafe {
                libc::write(
                    self.inner.fd,
                    src.as_ptr() as *const libc::c_void,
                    src.len(),
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }

            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            match errno {
                libc::EINTR => continue,
                libc::EAGAIN => return Ok(0),
                _ => return Err(errno_error("write", self.inner.fd)),
            }
        }
    }

    /// Kernel zero-copy transmit of a file region; advances the region by
    /// the accepted byte count.
    pub fn flush_file(&self, region: &mut FileRegion) -> Result<usize> {
        if !self.is_open() {
            return Err(err_msg("flush on closed endpoint"));
        }

        let mut offset = region.offset as libc::off_t;
        loop {
            let n = unsafe {
                libc::sendfile(
                    self.inner.fd,
                    region.file.as_raw_fd(),
                    &mut offset,
                    region.length as usize,
                )
            };
            if n >= 0 {
                let n = n as usize;
                region.offset += n as u64;
                region.length -= n as u64;
                return Ok(n);
            }

            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            match errno {
                libc::EINTR => continue,
                libc::EAGAIN => return Ok(0),
                _ => return Err(errno_error("sendfile", self.inner.fd)),
            }
        }
    }

    /// Arms a one-shot readable watch plus the read timeout. On
    /// readiness the connection's `on_fillable` runs; on timeout,
    /// `on_read_timeout` decides whether to close.
    pub fn want_fill(&self) {
        let (connection, read_timeout, has_readahead) = {
            let state = self.inner.state.lock().unwrap();
            if state.closed {
                return;
            }
            (
                state.connection.clone(),
                state.read_timeout,
                !state.readahead.is_empty(),
            )
        };
        let connection = match connection {
            Some(connection) => connection,
            None => return,
        };

        // Bytes buffered from protocol detection are immediately
        // consumable; do not wait for the socket.
        if has_readahead {
            let endpoint = self.clone();
            self.inner.scheduler.execute(move || {
                connection.on_fillable(&endpoint);
            });
            return;
        }

        let endpoint = self.clone();
        let io_connection = connection.clone();
        let io = Box::new(move || {
            endpoint.inner.state.lock().unwrap().io_watch = None;
            io_connection.on_fillable(&endpoint);
        });

        let endpoint = self.clone();
        let timeout = Box::new(move || {
            endpoint.inner.state.lock().unwrap().io_watch = None;
            if connection.on_read_timeout(&endpoint) {
                endpoint.close();
            }
        });

        match self.inner.scheduler.execute_on_readable(
            self.inner.fd,
            io,
            Some((read_timeout, timeout)),
        ) {
            Ok(handle) => {
                self.inner.state.lock().unwrap().io_watch = Some(handle);
            }
            Err(e) => warn!("want_fill: {}", e),
        }
    }

    /// Writable-side counterpart of `want_fill`.
    pub fn want_flush(&self) {
        let (connection, write_timeout) = {
            let state = self.inner.state.lock().unwrap();
            if state.closed {
                return;
            }
            (state.connection.clone(), state.write_timeout)
        };
        let connection = match connection {
            Some(connection) => connection,
            None => return,
        };

        let endpoint = self.clone();
        let io_connection = connection.clone();
        let io = Box::new(move || {
            endpoint.inner.state.lock().unwrap().io_watch = None;
            io_connection.on_flushable(&endpoint);
        });

        let endpoint = self.clone();
        let timeout = Box::new(move || {
            endpoint.inner.state.lock().unwrap().io_watch = None;
            if connection.on_write_timeout(&endpoint) {
                endpoint.close();
            }
        });

        match self.inner.scheduler.execute_on_writable(
            self.inner.fd,
            io,
            Some((write_timeout, timeout)),
        ) {
            Ok(handle) => {
                self.inner.state.lock().unwrap().io_watch = Some(handle);
            }
            Err(e) => warn!("want_flush: {}", e),
        }
    }

    pub fn set_corking(&self, enable: bool) {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed || state.corking == enable {
            return;
        }
        let flag: libc::c_int = if enable { 1 } else { 0 };
        unsafe {
            libc::setsockopt(
                self.inner.fd,
                libc::IPPROTO_TCP,
                libc::TCP_CORK,
                &flag as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        state.corking = enable;
    }

    pub fn set_blocking(&self, enable: bool) {
        let flags = unsafe { libc::fcntl(self.inner.fd, libc::F_GETFL) };
        if flags < 0 {
            return;
        }
        let flags = if enable {
            flags & !libc::O_NONBLOCK
        } else {
            flags | libc::O_NONBLOCK
        };
        unsafe { libc::fcntl(self.inner.fd, libc::F_SETFL, flags) };
    }

    /// Closes the endpoint: cancels the pending watch, releases the fd,
    /// and notifies the connection and the listener hook.
    pub fn close(&self) {
        let (connection, on_closed, watch) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                state.connection.take(),
                state.on_closed.take(),
                state.io_watch.take(),
            )
        };

        if let Some(watch) = watch {
            watch.cancel();
        }
        unsafe { libc::close(self.inner.fd) };

        if let Some(connection) = connection {
            connection.on_close(self);
        }
        if let Some(hook) = on_closed {
            hook(self);
        }
    }

    /// Reads the first bytes and dispatches on the protocol-switch
    /// prelude: `0x01 <len> <name>` selects the named factory, anything
    /// else goes to the default factory with all bytes preserved for the
    /// connection.
    pub fn start_detect_protocol(
        &self,
        default_factory: ConnectionFactory,
        factories: HashMap<String, ConnectionFactory>,
    ) {
        let endpoint = self.clone();
        let io = Box::new(move || {
            endpoint.on_detect_protocol(&default_factory, &factories);
        });

        let read_timeout = self.inner.state.lock().unwrap().read_timeout;
        let endpoint = self.clone();
        let timeout = Box::new(move || {
            endpoint.close();
        });

        match self
            .inner
            .scheduler
            .execute_on_readable(self.inner.fd, io, Some((read_timeout, timeout)))
        {
            Ok(handle) => {
                self.inner.state.lock().unwrap().io_watch = Some(handle);
            }
            Err(e) => {
                warn!("start_detect_protocol: {}", e);
                self.close();
            }
        }
    }

    fn on_detect_protocol(
        &self,
        default_factory: &ConnectionFactory,
        factories: &HashMap<String, ConnectionFactory>,
    ) {
        self.inner.state.lock().unwrap().io_watch = None;

        let mut buf = vec![];
        match self.fill(&mut buf) {
            Ok(0) | Err(_) => {
                self.close();
                return;
            }
            Ok(_) => {}
        }

        let mut factory = default_factory;
        if buf[0] == MAGIC_PROTOCOL_SWITCH_BYTE && buf.len() >= 2 {
            let name_len = buf[1] as usize;
            if buf.len() >= 2 + name_len {
                let name = String::from_utf8_lossy(&buf[2..2 + name_len]).into_owned();
                buf.drain(..2 + name_len);
                match factories.get(&name) {
                    Some(named) => factory = named,
                    None => {
                        debug!("unknown protocol '{}', closing", name);
                        self.close();
                        return;
                    }
                }
            }
        }

        self.inner.state.lock().unwrap().readahead = buf;

        let connection = factory(self);
        self.set_connection(connection.clone());
        connection.on_open(self);
    }
}

fn errno_error(what: &str, fd: RawFd) -> Error {
    format_err!("{} (fd {}): {}", what, fd, std::io::Error::last_os_error())
}
