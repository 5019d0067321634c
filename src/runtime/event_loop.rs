//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS. Both are edge-triggered through
//! mio, so every handler drains its socket until `WouldBlock`.
//!
//! A single thread owns the listener, the poll registry and every
//! connection. Compilation either runs inline on this thread or, when
//! workers are configured, on the compile pool, whose results come back
//! through the waker token.

use super::connection::{CloseReason, Connection, ConnectionRegistry, Phase, Progress};
use super::pool::{CompilePool, Job};
use super::token::{self, Source};
use crate::backend::{Artifact, CompileError, SharedBackend};
use crate::config::Config;
use crate::protocol::ShaderKind;
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Waker};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Per-connection state for the mio backend.
struct Client {
    conn: Connection<TcpStream>,
    peer: SocketAddr,
    /// Distinguishes this connection from later ones reusing its slab slot.
    serial: u64,
}

/// Stops a running [`EventLoop`] from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) -> io::Result<()> {
        self.stop.store(true, Ordering::Release);
        self.waker.wake()
    }
}

/// The reactor: listener, poll registry and all live connections.
pub struct EventLoop {
    poll: Poll,
    event_capacity: usize,
    listener: TcpListener,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
    clients: ConnectionRegistry<Client>,
    /// Connections that reached `Closing` during the current batch.
    closing: Vec<usize>,
    backend: SharedBackend,
    pool: Option<CompilePool>,
    /// Jobs waiting for room in the pool queue.
    backlog: VecDeque<Job>,
    idle_timeout: Option<Duration>,
    failure_sentinel: bool,
    next_serial: u64,
}

impl EventLoop {
    /// Bind the listener and set up the poll registry.
    ///
    /// Failing to bind or listen is fatal for the server and is returned
    /// before any connection is served.
    pub fn bind(config: &Config, backend: SharedBackend) -> io::Result<Self> {
        let addr = config
            .listen_addr()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(create_listener(addr)?);
        poll.registry()
            .register(&mut listener, token::LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), token::WAKER)?);

        let pool = if config.workers > 0 {
            Some(CompilePool::new(
                config.workers,
                config.queue_depth,
                Arc::clone(&backend),
                Arc::clone(&waker),
            )?)
        } else {
            None
        };

        info!(
            addr = %listener.local_addr()?,
            workers = pool.as_ref().map_or(0, CompilePool::worker_count),
            max_connections = ?config.max_connections,
            idle_timeout = ?config.idle_timeout,
            "Listening"
        );

        Ok(Self {
            poll,
            event_capacity: config.event_capacity,
            listener,
            waker,
            stop: Arc::new(AtomicBool::new(false)),
            clients: ConnectionRegistry::new(config.max_connections),
            closing: Vec::new(),
            backend,
            pool,
            backlog: VecDeque::new(),
            idle_timeout: config.idle_timeout,
            failure_sentinel: config.failure_sentinel,
            next_serial: 0,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: Arc::clone(&self.stop),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Dispatch readiness until shut down or until polling fails.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.event_capacity);

        loop {
            let timeout = self.next_timeout();
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                self.dispatch(event);
            }

            self.reap_idle();
            self.release_closed();

            if self.stop.load(Ordering::Acquire) {
                info!(open = self.clients.len(), "Event loop stopped");
                return Ok(());
            }
        }
    }

    fn dispatch(&mut self, event: &Event) {
        match Source::of(event.token()) {
            Source::Listener => self.accept_connections(),
            Source::Waker => self.drain_completions(),
            Source::Connection(conn_id) => self.handle_connection_event(conn_id, event),
        }
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.clients.is_full() {
                        warn!(peer = %peer, "Connection limit reached");
                        continue;
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        trace!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let serial = self.next_serial;
                    self.next_serial += 1;
                    let client = Client {
                        conn: Connection::new(stream),
                        peer,
                        serial,
                    };
                    let Ok(conn_id) = self.clients.insert(client) else {
                        continue;
                    };

                    let registered = match self.clients.get_mut(conn_id) {
                        Some(client) => self.poll.registry().register(
                            client.conn.stream_mut(),
                            token::connection(conn_id),
                            Interest::READABLE,
                        ),
                        None => continue,
                    };
                    if let Err(e) = registered {
                        warn!(peer = %peer, error = %e, "Failed to register connection");
                        self.clients.remove(conn_id);
                        continue;
                    }

                    debug!(conn_id, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn handle_connection_event(&mut self, conn_id: usize, event: &Event) {
        let Some(client) = self.clients.get_mut(conn_id) else {
            return;
        };

        // A client that half-closes after sending its request still gets a
        // response; only errors and full hangups tear the connection down.
        if event.is_error() || (event.is_read_closed() && event.is_write_closed()) {
            client.conn.close(CloseReason::Hangup);
            self.closing.push(conn_id);
            return;
        }

        if event.is_readable() {
            let progress = client.conn.on_readable();
            self.apply(conn_id, progress);
        }

        if event.is_writable() {
            if let Some(client) = self.clients.get_mut(conn_id) {
                let progress = client.conn.on_writable();
                self.apply(conn_id, progress);
            }
        }
    }

    /// Act on what a state transition asked for.
    fn apply(&mut self, conn_id: usize, progress: Progress) {
        match progress {
            Progress::Pending => {}
            Progress::Compile => self.start_compile(conn_id),
            Progress::Send => self.start_send(conn_id),
            Progress::Closed => self.closing.push(conn_id),
        }
    }

    fn start_compile(&mut self, conn_id: usize) {
        let Some(client) = self.clients.get_mut(conn_id) else {
            return;
        };
        let serial = client.serial;
        let Some((kind, source)) = client.conn.take_source() else {
            return;
        };
        debug!(conn_id, kind = %kind, len = source.len(), "Payload received");

        if self.pool.is_none() {
            // Inline compile: every other connection waits until it returns.
            let result = self.backend.compile(kind, &source);
            self.complete_compile(conn_id, serial, kind, result);
            return;
        }

        let job = Job {
            conn_id,
            serial,
            kind,
            source,
        };
        if !self.backlog.is_empty() {
            self.backlog.push_back(job);
            return;
        }
        if let Some(pool) = &self.pool {
            if let Err(job) = pool.submit(job) {
                trace!(conn_id, "Compile queue full, deferring");
                self.backlog.push_back(job);
            }
        }
    }

    fn drain_completions(&mut self) {
        let done: Vec<_> = match &self.pool {
            Some(pool) => pool.completions().collect(),
            None => return,
        };
        for completion in done {
            self.complete_compile(
                completion.conn_id,
                completion.serial,
                completion.kind,
                completion.result,
            );
        }
        self.flush_backlog();
    }

    fn flush_backlog(&mut self) {
        let Some(pool) = &self.pool else {
            return;
        };
        while let Some(job) = self.backlog.pop_front() {
            let live = self
                .clients
                .get(job.conn_id)
                .is_some_and(|client| client.serial == job.serial);
            if !live {
                continue;
            }
            if let Err(job) = pool.submit(job) {
                self.backlog.push_front(job);
                break;
            }
        }
    }

    fn complete_compile(
        &mut self,
        conn_id: usize,
        serial: u64,
        kind: ShaderKind,
        result: Result<Artifact, CompileError>,
    ) {
        let Some(client) = self
            .clients
            .get_mut(conn_id)
            .filter(|client| client.serial == serial)
        else {
            trace!(conn_id, "Dropping result for closed connection");
            return;
        };

        match &result {
            Ok(artifact) => debug!(
                conn_id,
                kind = %kind,
                format = artifact.format,
                len = artifact.bytes.len(),
                "Compiled"
            ),
            Err(e) => warn!(
                conn_id,
                peer = %client.peer,
                kind = %kind,
                stage = %e.stage,
                log = %e.log,
                "Compilation failed"
            ),
        }

        let progress = client.conn.finish_compile(result, self.failure_sentinel);
        self.apply(conn_id, progress);
    }

    fn start_send(&mut self, conn_id: usize) {
        let Some(client) = self.clients.get_mut(conn_id) else {
            return;
        };

        if let Err(e) = self.poll.registry().reregister(
            client.conn.stream_mut(),
            token::connection(conn_id),
            Interest::WRITABLE,
        ) {
            client.conn.close(CloseReason::Io(e.kind()));
            self.closing.push(conn_id);
            return;
        }

        // Try right away; the writable edge only fires after a WouldBlock.
        let progress = client.conn.on_writable();
        self.apply(conn_id, progress);
    }

    /// Close connections whose idle deadline has passed.
    fn reap_idle(&mut self) {
        let Some(timeout) = self.idle_timeout else {
            return;
        };
        let now = Instant::now();

        for (conn_id, client) in self.clients.iter_mut() {
            let expired = client
                .conn
                .idle_deadline(timeout)
                .is_some_and(|deadline| deadline <= now);
            if expired {
                client.conn.close(CloseReason::IdleTimeout);
                self.closing.push(conn_id);
            }
        }
    }

    /// Release every connection that reached `Closing` in this batch.
    ///
    /// Deferred to the end of the batch so a slot is never reused while
    /// events for its previous owner are still being dispatched.
    fn release_closed(&mut self) {
        for conn_id in self.closing.drain(..) {
            let Some(mut client) = self.clients.remove(conn_id) else {
                continue;
            };
            let _ = self.poll.registry().deregister(client.conn.stream_mut());
            debug_assert_eq!(client.conn.phase(), Phase::Closing);

            debug!(
                conn_id,
                peer = %client.peer,
                reason = %client.conn.close_reason().unwrap_or(CloseReason::Completed),
                received = client.conn.bytes_received(),
                sent = client.conn.bytes_sent(),
                "Connection closed"
            );
        }
    }

    /// Poll timeout: the nearest idle deadline, or block indefinitely.
    fn next_timeout(&self) -> Option<Duration> {
        let timeout = self.idle_timeout?;
        let now = Instant::now();
        self.clients
            .iter()
            .filter_map(|(_, client)| client.conn.idle_deadline(timeout))
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::ScriptedBackend;
    use crate::backend::NagaBackend;
    use crate::config::Mode;
    use crate::protocol::{encode_header, Header, MAGIC};
    use crate::runtime::connection::tests::request;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;
    use std::thread::{self, JoinHandle};

    fn test_config() -> Config {
        Config {
            mode: Mode::Serve,
            host: "127.0.0.1".to_string(),
            port: 0,
            max_connections: None,
            event_capacity: 64,
            idle_timeout: None,
            workers: 0,
            queue_depth: 4,
            failure_sentinel: false,
            log_level: "debug".to_string(),
        }
    }

    struct TestServer {
        addr: SocketAddr,
        handle: ShutdownHandle,
        thread: Option<JoinHandle<io::Result<()>>>,
    }

    impl TestServer {
        fn start(config: Config, backend: SharedBackend) -> Self {
            let mut event_loop = EventLoop::bind(&config, backend).unwrap();
            let addr = event_loop.local_addr().unwrap();
            let handle = event_loop.shutdown_handle();
            let thread = thread::spawn(move || event_loop.run());
            Self {
                addr,
                handle,
                thread: Some(thread),
            }
        }

        fn connect(&self) -> StdTcpStream {
            let stream = StdTcpStream::connect(self.addr).unwrap();
            stream.set_nodelay(true).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            stream
        }

        fn stop(mut self) -> io::Result<()> {
            self.handle.shutdown().unwrap();
            self.thread.take().unwrap().join().unwrap()
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            if let Some(thread) = self.thread.take() {
                let _ = self.handle.shutdown();
                let _ = thread.join();
            }
        }
    }

    /// Read until the server closes; a reset counts as a close.
    fn read_until_close(stream: &mut StdTcpStream) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => return out,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => return out,
                Err(e) => panic!("read failed: {e}"),
            }
        }
    }

    /// Send `bytes` in chunks of `chunk` and collect everything sent back.
    fn exchange(server: &TestServer, bytes: &[u8], chunk: usize) -> Vec<u8> {
        let mut stream = server.connect();
        for part in bytes.chunks(chunk) {
            // The server may close early on a bad header.
            if stream.write_all(part).is_err() {
                break;
            }
            if chunk < bytes.len() {
                thread::sleep(Duration::from_millis(1));
            }
        }
        read_until_close(&mut stream)
    }

    fn expect_response(kind: ShaderKind, source: &[u8]) -> Vec<u8> {
        let artifact = ScriptedBackend::expected(kind, source);
        let mut out = (artifact.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(&artifact);
        out
    }

    fn raw_header(kind: u32, len: u32) -> Vec<u8> {
        let mut out = MAGIC.to_be_bytes().to_vec();
        out.extend_from_slice(&kind.to_be_bytes());
        out.extend_from_slice(&len.to_be_bytes());
        out
    }

    #[test]
    fn test_compile_round_trip() {
        let server = TestServer::start(test_config(), ScriptedBackend::shared());
        let source = [b'v'; 42];

        let response = exchange(&server, &request(ShaderKind::Vertex, &source), usize::MAX);

        let declared = u32::from_be_bytes(response[..4].try_into().unwrap()) as usize;
        assert!(declared > 0);
        assert_eq!(response.len(), 4 + declared);
        assert_eq!(response, expect_response(ShaderKind::Vertex, &source));
        server.stop().unwrap();
    }

    #[test]
    fn test_oversized_header_closes_without_response() {
        let server = TestServer::start(test_config(), ScriptedBackend::shared());
        let response = exchange(&server, &raw_header(1, 2_000_000), usize::MAX);
        assert!(response.is_empty());
    }

    #[test]
    fn test_invalid_headers_close_without_response() {
        let server = TestServer::start(test_config(), ScriptedBackend::shared());

        let mut bad_magic = request(ShaderKind::Vertex, b"abcd");
        bad_magic[0] ^= 0xff;
        assert!(exchange(&server, &bad_magic, usize::MAX).is_empty());

        let mut bad_kind = raw_header(9, 4);
        bad_kind.extend_from_slice(b"abcd");
        assert!(exchange(&server, &bad_kind, 1).is_empty());

        assert!(exchange(&server, &raw_header(1, 0), usize::MAX).is_empty());
    }

    #[test]
    fn test_compile_failure_closes_without_response() {
        let server = TestServer::start(test_config(), ScriptedBackend::shared());
        let response = exchange(&server, &request(ShaderKind::Fragment, b"#error bad"), usize::MAX);
        assert!(response.is_empty());
    }

    #[test]
    fn test_compile_failure_sentinel() {
        let mut config = test_config();
        config.failure_sentinel = true;
        let server = TestServer::start(config, ScriptedBackend::shared());

        let response = exchange(&server, &request(ShaderKind::Fragment, b"#error bad"), usize::MAX);
        assert_eq!(response, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_fragmented_delivery() {
        let server = TestServer::start(test_config(), ScriptedBackend::shared());
        let source: Vec<u8> = b"void main() { }".repeat(4);
        let bytes = request(ShaderKind::Fragment, &source);

        let whole = exchange(&server, &bytes, bytes.len());
        assert_eq!(whole, expect_response(ShaderKind::Fragment, &source));
        assert_eq!(exchange(&server, &bytes, 1), whole);
        assert_eq!(exchange(&server, &bytes, 2), whole);
    }

    #[test]
    fn test_interleaved_sessions_are_isolated() {
        let server = TestServer::start(test_config(), ScriptedBackend::shared());

        let requests: Vec<(ShaderKind, Vec<u8>)> = (0..8u8)
            .map(|i| {
                let kind = if i % 2 == 0 {
                    ShaderKind::Vertex
                } else {
                    ShaderKind::Fragment
                };
                let source: Vec<u8> = (0..20 + i as usize * 7)
                    .map(|j| b'a' + ((i as usize + j) % 26) as u8)
                    .collect();
                (kind, source)
            })
            .collect();
        let payloads: Vec<Vec<u8>> = requests
            .iter()
            .map(|(kind, source)| request(*kind, source))
            .collect();
        let mut streams: Vec<StdTcpStream> = requests.iter().map(|_| server.connect()).collect();

        // Round-robin one byte at a time across all clients.
        let longest = payloads.iter().map(Vec::len).max().unwrap();
        for offset in 0..longest {
            for (stream, payload) in streams.iter_mut().zip(&payloads) {
                if let Some(byte) = payload.get(offset) {
                    stream.write_all(std::slice::from_ref(byte)).unwrap();
                }
            }
        }

        for (stream, (kind, source)) in streams.iter_mut().zip(&requests) {
            assert_eq!(read_until_close(stream), expect_response(*kind, source));
        }
    }

    #[test]
    fn test_worker_pool_serves_concurrent_clients() {
        let mut config = test_config();
        config.workers = 2;
        config.queue_depth = 1;
        let backend = Arc::new(ScriptedBackend {
            delay: Some(Duration::from_millis(50)),
        });
        let server = TestServer::start(config, backend);

        let clients: Vec<_> = (0..6u8)
            .map(|i| {
                let source = vec![b'0' + i; 10 + i as usize];
                let mut stream = server.connect();
                stream.write_all(&request(ShaderKind::Vertex, &source)).unwrap();
                (stream, source)
            })
            .collect();

        for (mut stream, source) in clients {
            assert_eq!(
                read_until_close(&mut stream),
                expect_response(ShaderKind::Vertex, &source)
            );
        }
        server.stop().unwrap();
    }

    #[test]
    fn test_result_for_aborted_client_is_discarded() {
        let mut config = test_config();
        config.workers = 1;
        config.queue_depth = 1;
        let backend = Arc::new(ScriptedBackend {
            delay: Some(Duration::from_millis(300)),
        });
        let server = TestServer::start(config, backend);

        let send = |source: &[u8]| {
            let mut stream = server.connect();
            stream.write_all(&request(ShaderKind::Vertex, source)).unwrap();
            thread::sleep(Duration::from_millis(30));
            stream
        };

        // One job on the worker, one in the queue, the third in the backlog.
        let mut running = send(b"running");
        let mut queued = send(b"queued");
        let aborted = send(b"aborted");

        // Reset instead of FIN so the reactor sees an error event.
        socket2::SockRef::from(&aborted)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(aborted);
        thread::sleep(Duration::from_millis(50));

        // Takes the freed slot while the aborted job is still backlogged.
        let mut reused = send(b"reused");

        assert_eq!(
            read_until_close(&mut running),
            expect_response(ShaderKind::Vertex, b"running")
        );
        assert_eq!(
            read_until_close(&mut queued),
            expect_response(ShaderKind::Vertex, b"queued")
        );
        assert_eq!(
            read_until_close(&mut reused),
            expect_response(ShaderKind::Vertex, b"reused")
        );
    }

    #[test]
    fn test_result_for_closed_connection_in_flight_is_discarded() {
        let mut config = test_config();
        config.workers = 1;
        let backend = Arc::new(ScriptedBackend {
            delay: Some(Duration::from_millis(200)),
        });
        let server = TestServer::start(config, backend);

        let mut aborted = server.connect();
        aborted
            .write_all(&request(ShaderKind::Fragment, b"in flight"))
            .unwrap();
        thread::sleep(Duration::from_millis(30));
        socket2::SockRef::from(&aborted)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(aborted);
        thread::sleep(Duration::from_millis(50));

        // Same slot, new serial: the in-flight result must not reach it.
        let response = exchange(&server, &request(ShaderKind::Vertex, b"fresh"), usize::MAX);
        assert_eq!(response, expect_response(ShaderKind::Vertex, b"fresh"));
    }

    #[test]
    fn test_huge_idle_timeout_is_accepted() {
        let mut config = test_config();
        config.idle_timeout = Some(Duration::from_secs(u64::MAX));
        let server = TestServer::start(config, ScriptedBackend::shared());

        let response = exchange(&server, &request(ShaderKind::Vertex, b"patient"), 3);
        assert_eq!(response, expect_response(ShaderKind::Vertex, b"patient"));
        server.stop().unwrap();
    }

    #[test]
    fn test_idle_connection_is_closed() {
        let mut config = test_config();
        config.idle_timeout = Some(Duration::from_millis(100));
        let server = TestServer::start(config, ScriptedBackend::shared());

        let mut stream = server.connect();
        stream.write_all(&raw_header(1, 64)[..5]).unwrap();

        let started = Instant::now();
        assert!(read_until_close(&mut stream).is_empty());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_connection_limit() {
        let mut config = test_config();
        config.max_connections = Some(1);
        let server = TestServer::start(config, ScriptedBackend::shared());
        let bytes = request(ShaderKind::Vertex, b"limited");

        let mut first = server.connect();
        first.write_all(&bytes[..6]).unwrap();
        thread::sleep(Duration::from_millis(100));

        let mut second = server.connect();
        assert!(read_until_close(&mut second).is_empty());

        first.write_all(&bytes[6..]).unwrap();
        assert_eq!(
            read_until_close(&mut first),
            expect_response(ShaderKind::Vertex, b"limited")
        );
    }

    #[test]
    fn test_half_closed_client_still_gets_response() {
        let server = TestServer::start(test_config(), ScriptedBackend::shared());
        let mut stream = server.connect();
        stream.write_all(&request(ShaderKind::Vertex, b"half")).unwrap();
        stream.shutdown(std::net::Shutdown::Write).unwrap();

        assert_eq!(
            read_until_close(&mut stream),
            expect_response(ShaderKind::Vertex, b"half")
        );
    }

    #[test]
    fn test_naga_backend_end_to_end() {
        let server = TestServer::start(test_config(), Arc::new(NagaBackend::new()));
        let source = b"#version 450\nvoid main() { gl_Position = vec4(0.0); }\n";
        let header = Header {
            kind: ShaderKind::Vertex,
            payload_len: source.len() as u32,
        };
        let mut bytes = encode_header(&header).to_vec();
        bytes.extend_from_slice(source);

        let response = exchange(&server, &bytes, 7);
        let declared = u32::from_be_bytes(response[..4].try_into().unwrap()) as usize;
        assert!(declared > 0);
        assert_eq!(response.len(), 4 + declared);
        assert_eq!(&response[4..8], &0x0723_0203u32.to_le_bytes());
    }

    #[test]
    fn test_shutdown_stops_loop() {
        let server = TestServer::start(test_config(), ScriptedBackend::shared());
        let _idle = server.connect();
        assert!(server.stop().is_ok());
    }

    #[test]
    fn test_shutdown_from_another_thread_joins_pool() {
        let mut config = test_config();
        config.workers = 2;
        let backend = Arc::new(ScriptedBackend {
            delay: Some(Duration::from_millis(100)),
        });
        let server = TestServer::start(config, backend);

        let mut busy = server.connect();
        busy.write_all(&request(ShaderKind::Vertex, b"busy")).unwrap();
        thread::sleep(Duration::from_millis(20));

        let handle = server.handle.clone();
        thread::spawn(move || handle.shutdown().unwrap())
            .join()
            .unwrap();
        assert!(server.stop().is_ok());
    }

    #[test]
    fn test_bind_failure_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = test_config();
        config.port = taken.local_addr().unwrap().port();
        assert!(EventLoop::bind(&config, ScriptedBackend::shared()).is_err());
    }
}
