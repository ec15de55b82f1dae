use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::errors::*;

use crate::endpoint::{ConnectionFactory, Endpoint};
use crate::scheduler::{errno_error, Scheduler, WatchHandle};

pub struct ListenerOptions {
    pub backlog: i32,
    pub reuse_addr: bool,
    pub reuse_port: bool,
    pub defer_accept: bool,
    pub quick_ack: bool,
    /// Upper bound on accepted sockets per readiness event.
    pub multi_accept: usize,
    /// FIN_WAIT2 timeout (TCP_LINGER2) applied to accepted sockets.
    pub fin_timeout: Option<u32>,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            backlog: 128,
            reuse_addr: true,
            reuse_port: false,
            defer_accept: false,
            quick_ack: false,
            multi_accept: 1,
            fin_timeout: None,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
        }
    }
}

/// Picks the scheduler an accepted endpoint is pinned to.
pub type SchedulerSelector = Arc<dyn Fn() -> Arc<Scheduler> + Send + Sync>;

/// Bound listening TCP socket with a burst accept loop. Each accepted
/// socket becomes an Endpoint on a selector-chosen worker loop.
pub struct TcpListener {
    inner: Arc<Inner>,
}

struct Inner {
    fd: RawFd,
    addr: SocketAddr,
    scheduler: Arc<Scheduler>,
    selector: SchedulerSelector,
    factory: ConnectionFactory,
    options: ListenerOptions,
    state: Mutex<State>,
}

struct State {
    closed: bool,
    accept_watch: Option<WatchHandle>,
    endpoints: Vec<Endpoint>,
    protocol_factories: HashMap<String, ConnectionFactory>,
}

impl TcpListener {
    /// Binds and listens. The accept watch is not armed until `start`.
    pub fn bind(
        addr: SocketAddr,
        scheduler: Arc<Scheduler>,
        selector: SchedulerSelector,
        factory: ConnectionFactory,
        options: ListenerOptions,
    ) -> Result<Self> {
        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };

        let fd = unsafe {
            libc::socket(
                family,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(errno_error("socket"));
        }

        if options.reuse_addr {
            set_option(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
        }
        if options.reuse_port {
            set_option(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;
        }

        let (storage, len) = sockaddr_from_addr(&addr);
        let rv = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if rv < 0 {
            let e = errno_error("bind");
            unsafe { libc::close(fd) };
            return Err(e);
        }

        if options.defer_accept {
            set_option(fd, libc::IPPROTO_TCP, libc::TCP_DEFER_ACCEPT, 1)?;
        }

        let rv = unsafe { libc::listen(fd, options.backlog) };
        if rv < 0 {
            let e = errno_error("listen");
            unsafe { libc::close(fd) };
            return Err(e);
        }

        // Re-read the address for the ephemeral-port case.
        let addr = local_addr(fd).unwrap_or(addr);

        info!("listening on {}", addr);

        Ok(Self {
            inner: Arc::new(Inner {
                fd,
                addr,
                scheduler,
                selector,
                factory,
                options,
                state: Mutex::new(State {
                    closed: false,
                    accept_watch: None,
                    endpoints: vec![],
                    protocol_factories: HashMap::new(),
                }),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.addr
    }

    pub fn connected_count(&self) -> usize {
        self.inner.state.lock().unwrap().endpoints.len()
    }

    /// Registers an alternative connection factory reachable through the
    /// protocol-switch prelude.
    pub fn add_protocol_factory(&self, name: &str, factory: ConnectionFactory) {
        self.inner
            .state
            .lock()
            .unwrap()
            .protocol_factories
            .insert(name.to_string(), factory);
    }

    /// Arms the accept watch on the listener's own loop.
    pub fn start(&self) {
        self.arm();
    }

    fn arm(&self) {
        let listener = self.clone_inner();
        let handle = self.inner.scheduler.execute_on_readable(
            self.inner.fd,
            Box::new(move || {
                listener.on_acceptable();
            }),
            None,
        );

        match handle {
            Ok(handle) => {
                self.inner.state.lock().unwrap().accept_watch = Some(handle);
            }
            Err(e) => error!("listener: failed to arm accept watch: {}", e),
        }
    }

    fn clone_inner(&self) -> TcpListener {
        TcpListener {
            inner: self.inner.clone(),
        }
    }

    fn on_acceptable(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.accept_watch = None;
            if state.closed {
                return;
            }
        }

        // Accept a burst to amortize the readiness notification.
        for _ in 0..self.inner.options.multi_accept.max(1) {
            if !self.accept_one() {
                break;
            }
        }

        self.arm();
    }

    /// Returns false when the backlog is drained.
    fn accept_one(&self) -> bool {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        let client_fd = loop {
            let rv = unsafe {
                libc::accept4(
                    self.inner.fd,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if rv >= 0 {
                break rv;
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            match errno {
                libc::EINTR => continue,
                libc::EAGAIN => return false,
                _ => {
                    warn!("accept: {}", std::io::Error::last_os_error());
                    return false;
                }
            }
        };

        let remote = match sockaddr_to_addr(&storage) {
            Some(addr) => addr,
            None => {
                unsafe { libc::close(client_fd) };
                return true;
            }
        };

        if self.inner.options.quick_ack {
            let _ = set_option(client_fd, libc::IPPROTO_TCP, libc::TCP_QUICKACK, 1);
        }
        if let Some(seconds) = self.inner.options.fin_timeout {
            let _ = set_option(
                client_fd,
                libc::IPPROTO_TCP,
                libc::TCP_LINGER2,
                seconds as libc::c_int,
            );
        }

        debug!("accepted connection from {}", remote);

        let scheduler = (self.inner.selector)();
        let endpoint = Endpoint::new(
            client_fd,
            remote,
            self.inner.addr,
            scheduler.clone(),
            self.inner.options.read_timeout,
            self.inner.options.write_timeout,
        );

        let protocol_factories = {
            let mut state = self.inner.state.lock().unwrap();
            state.endpoints.push(endpoint.clone());
            state.protocol_factories.clone()
        };

        let unlink_target = self.inner.clone();
        endpoint.set_on_closed(Box::new(move |ep| {
            let mut state = unlink_target.state.lock().unwrap();
            state.endpoints.retain(|e| e.fd() != ep.fd());
        }));

        // Hand the endpoint over to its own loop.
        let factory = self.inner.factory.clone();
        scheduler.execute(move || {
            if protocol_factories.is_empty() {
                let connection = factory(&endpoint);
                endpoint.set_connection(connection.clone());
                connection.on_open(&endpoint);
            } else {
                endpoint.start_detect_protocol(factory, protocol_factories);
            }
        });

        true
    }

    /// Stops accepting and releases the listening socket. Connected
    /// endpoints keep running until they close themselves.
    pub fn close(&self) {
        let watch = {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            state.accept_watch.take()
        };
        if let Some(watch) = watch {
            watch.cancel();
        }
        unsafe { libc::close(self.inner.fd) };
    }
}

fn set_option(fd: RawFd, level: libc::c_int, option: libc::c_int, value: libc::c_int) -> Result<()> {
    let rv = unsafe {
        libc::setsockopt(
            fd,
            level,
            option,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rv < 0 {
        return Err(errno_error("setsockopt"));
    }
    Ok(())
}

fn local_addr(fd: RawFd) -> Option<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rv = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if rv < 0 {
        return None;
    }
    sockaddr_to_addr(&storage)
}

fn sockaddr_from_addr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin as *const _ as *const u8,
                    &mut storage as *mut _ as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in>(),
                );
            }
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin6 as *const _ as *const u8,
                    &mut storage as *mut _ as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in6>(),
                );
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin: &libc::sockaddr_in = unsafe { &*(storage as *const _ as *const _) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6: &libc::sockaddr_in6 = unsafe { &*(storage as *const _ as *const _) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(
                IpAddr::V6(ip),
                u16::from_be(sin6.sin6_port),
            ))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Connection;
    use std::io::{Read, Write};
    use std::sync::Mutex;

    /// Writes back everything it reads.
    struct EchoConnection {
        pending: Mutex<Vec<u8>>,
    }

    impl Connection for EchoConnection {
        fn on_open(&self, endpoint: &Endpoint) {
            endpoint.want_fill();
        }

        fn on_fillable(&self, endpoint: &Endpoint) {
            let mut buf = vec![];
            match endpoint.fill(&mut buf) {
                Ok(0) | Err(_) => {
                    endpoint.close();
                    return;
                }
                Ok(_) => {}
            }
            self.pending.lock().unwrap().extend_from_slice(&buf);
            self.on_flushable(endpoint);
        }

        fn on_flushable(&self, endpoint: &Endpoint) {
            let mut pending = self.pending.lock().unwrap();
            if !pending.is_empty() {
                match endpoint.flush(&pending) {
                    Ok(n) => {
                        pending.drain(..n);
                    }
                    Err(_) => {
                        drop(pending);
                        endpoint.close();
                        return;
                    }
                }
            }
            let done = pending.is_empty();
            drop(pending);
            if done {
                endpoint.want_fill();
            } else {
                endpoint.want_flush();
            }
        }
    }

    #[test]
    fn accepts_and_echoes() {
        let scheduler = Arc::new(Scheduler::new().unwrap());

        let worker = scheduler.clone();
        let selector: SchedulerSelector = Arc::new(move || worker.clone());
        let factory: ConnectionFactory = Arc::new(|_| {
            Arc::new(EchoConnection {
                pending: Mutex::new(vec![]),
            })
        });

        let listener = TcpListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            scheduler.clone(),
            selector,
            factory,
            ListenerOptions::default(),
        )
        .unwrap();
        let addr = listener.local_addr();
        listener.start();

        let loop_scheduler = scheduler.clone();
        let thread = std::thread::spawn(move || loop_scheduler.run_loop());

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.write_all(b"hello").unwrap();

        let mut out = [0u8; 5];
        client.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"hello");

        drop(client);
        // Give the loop a moment to observe the close before shutdown.
        std::thread::sleep(Duration::from_millis(50));
        listener.close();
        scheduler.break_loop();
        thread.join().unwrap();
    }

    #[test]
    fn multi_accept_burst_accepts_several() {
        let scheduler = Arc::new(Scheduler::new().unwrap());

        let worker = scheduler.clone();
        let selector: SchedulerSelector = Arc::new(move || worker.clone());
        let factory: ConnectionFactory = Arc::new(|_| {
            Arc::new(EchoConnection {
                pending: Mutex::new(vec![]),
            })
        });

        let options = ListenerOptions {
            multi_accept: 8,
            ..Default::default()
        };
        let listener = TcpListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            scheduler.clone(),
            selector,
            factory,
            options,
        )
        .unwrap();
        let addr = listener.local_addr();
        listener.start();

        let loop_scheduler = scheduler.clone();
        let thread = std::thread::spawn(move || loop_scheduler.run_loop());

        let mut clients = vec![];
        for _ in 0..4 {
            let mut client = std::net::TcpStream::connect(addr).unwrap();
            client
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            client.write_all(b"x").unwrap();
            clients.push(client);
        }
        for client in &mut clients {
            let mut out = [0u8; 1];
            client.read_exact(&mut out).unwrap();
            assert_eq!(&out, b"x");
        }

        drop(clients);
        std::thread::sleep(Duration::from_millis(50));
        listener.close();
        scheduler.break_loop();
        thread.join().unwrap();
    }
}
