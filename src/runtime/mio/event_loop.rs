//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! Everything runs on the calling thread. The listener and every connection
//! are registered with a single `Poll`; connections live in a
//! [`ConnectionRegistry`] keyed by their mio `Token`, and a connection ends
//! only when `close_connection` removes it from the registry.

use crate::collector::Collector;
use crate::config::Config;
use crate::runtime::{Connection, ConnectionRegistry};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

#[cfg(test)]
use mio::Waker;

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Listen backlog passed to `listen(2)`.
const BACKLOG: i32 = 1024;

/// Stops a running [`EventLoop`] from another thread.
#[cfg(test)]
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

#[cfg(test)]
impl ShutdownHandle {
    /// Ask the loop to stop after the current batch of events.
    pub fn shutdown(&self) -> io::Result<()> {
        self.flag.store(true, Ordering::Release);
        self.waker.wake()
    }
}

/// Single-threaded reactor owning the listener and every connection.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    connections: ConnectionRegistry<TcpStream>,
    handshake: Vec<u8>,
    shutdown: Arc<AtomicBool>,
    #[cfg(test)]
    waker: Arc<Waker>,
}

impl EventLoop {
    /// Bind the listening socket and set up the poller.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let poll = Poll::new()?;
        #[cfg(test)]
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let mut listener = TcpListener::from_std(create_listener(addr)?);
        let local_addr = listener.local_addr()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(config.event_capacity),
            listener: Some(listener),
            local_addr,
            connections: ConnectionRegistry::new(config.max_connections),
            handshake: config.handshake_bytes().to_vec(),
            shutdown: Arc::new(AtomicBool::new(false)),
            #[cfg(test)]
            waker,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for stopping the loop from another thread.
    #[cfg(test)]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Run until shut down, handing completed records to `collector`.
    ///
    /// Returns `Ok(())` after a shutdown request. If the listener fails it is
    /// dropped; the loop keeps serving open connections and returns the
    /// accept error once the last one ends.
    pub fn run<C: Collector>(&mut self, collector: &mut C) -> io::Result<()> {
        let Self {
            poll,
            events,
            listener,
            local_addr,
            connections,
            handshake,
            shutdown,
            ..
        } = self;

        info!(
            addr = %local_addr,
            max_connections = connections.capacity(),
            "Event loop started"
        );

        let mut accept_error: Option<io::Error> = None;

        loop {
            if shutdown.load(Ordering::Acquire) {
                info!(open = connections.len(), "Shutting down event loop");
                connections.clear();
                return Ok(());
            }

            if let Err(e) = poll.poll(events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {}
                    LISTENER_TOKEN => {
                        let Some(active) = listener.as_ref() else {
                            continue;
                        };
                        if let Err(e) = accept_connections(
                            active,
                            poll.registry(),
                            connections,
                            handshake.as_slice(),
                        ) {
                            if let Some(mut failed) = listener.take() {
                                on_accept_error(poll.registry(), &mut failed, &e);
                            }
                            accept_error = Some(e);
                        }
                    }
                    Token(conn_id) => {
                        if let Err(e) = handle_connection_event(
                            conn_id,
                            event,
                            poll.registry(),
                            connections,
                            collector,
                        ) {
                            if e.kind() == io::ErrorKind::UnexpectedEof {
                                debug!(conn_id, "Peer disconnected");
                            } else {
                                warn!(conn_id, error = %e, "Connection error");
                            }
                            close_connection(poll.registry(), connections, conn_id);
                        }
                    }
                }
            }

            collector.flush();

            if listener.is_none() && connections.is_empty() {
                return Err(accept_error.take().unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::NotConnected, "listener closed")
                }));
            }
        }
    }
}

/// Accept every pending connection, creating one handler per stream.
///
/// Returns `Err` only for failures of the listening socket itself.
fn accept_connections(
    listener: &TcpListener,
    registry: &Registry,
    connections: &mut ConnectionRegistry<TcpStream>,
    handshake: &[u8],
) -> io::Result<()> {
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                let conn_id = match connections.insert(Connection::new(stream, handshake)) {
                    Ok(id) => id,
                    Err(_rejected) => {
                        warn!(peer = %peer_addr, "Connection limit reached");
                        continue;
                    }
                };

                let Some(conn) = connections.get_mut(conn_id) else {
                    continue;
                };
                let interest = if conn.wants_write() {
                    Interest::READABLE | Interest::WRITABLE
                } else {
                    Interest::READABLE
                };

                if let Err(e) = registry.register(conn.stream_mut(), Token(conn_id), interest) {
                    warn!(peer = %peer_addr, error = %e, "Failed to register connection");
                    connections.remove(conn_id);
                    continue;
                }

                debug!(conn_id, peer = %peer_addr, "Accepted connection");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                ) =>
            {
                debug!(error = %e, "Accept interrupted");
            }
            Err(e) if is_resource_exhaustion(&e) => {
                // The pending connection stays queued; retry on the next event.
                warn!(error = %e, "Accept deferred");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}

/// Report a listener failure and stop accepting.
///
/// Existing connections are left alone; the listener is not reacquired.
fn on_accept_error(registry: &Registry, listener: &mut TcpListener, err: &io::Error) {
    error!(error = %err, "Accept failed, closing listener");
    let _ = registry.deregister(listener);
}

fn is_resource_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

fn handle_connection_event<C: Collector>(
    conn_id: usize,
    event: &mio::event::Event,
    registry: &Registry,
    connections: &mut ConnectionRegistry<TcpStream>,
    collector: &mut C,
) -> io::Result<()> {
    let Some(conn) = connections.get_mut(conn_id) else {
        return Ok(());
    };

    if event.is_readable() || event.is_read_closed() || event.is_error() {
        let frames = conn.on_readable(collector)?;
        if frames > 0 {
            trace!(conn_id, frames, "Frames collected");
        }
    }

    if event.is_writable() && conn.wants_write() && conn.on_writable()? {
        registry.reregister(conn.stream_mut(), Token(conn_id), Interest::READABLE)?;
        debug!(conn_id, "Handshake flushed");
    }

    Ok(())
}

/// Remove a connection, deregistering and closing its socket.
///
/// A second call for the same id finds nothing and does nothing.
fn close_connection(
    registry: &Registry,
    connections: &mut ConnectionRegistry<TcpStream>,
    conn_id: usize,
) {
    if let Some(mut conn) = connections.remove(conn_id) {
        let _ = registry.deregister(conn.stream_mut());
        debug!(conn_id, "Connection closed");
    }
}

/// Create a non-blocking TCP listener.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_frame;
    use bytes::Bytes;
    use std::io::{Read, Write};
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};

    const WAIT: Duration = Duration::from_secs(5);

    struct ChannelCollector(Sender<Bytes>);

    impl Collector for ChannelCollector {
        fn append(&mut self, record: Bytes) {
            let _ = self.0.send(record);
        }
    }

    struct Harness {
        addr: SocketAddr,
        shutdown: ShutdownHandle,
        records: Receiver<Bytes>,
        handle: JoinHandle<io::Result<()>>,
    }

    impl Harness {
        fn start(max_connections: usize, handshake: Option<&str>) -> Self {
            let config = Config {
                listen: "127.0.0.1:0".to_string(),
                max_connections,
                event_capacity: 64,
                handshake: handshake.map(str::to_string),
                output: "-".to_string(),
                timestamps: false,
                log_level: "info".to_string(),
            };

            let mut event_loop = EventLoop::bind(&config).unwrap();
            let addr = event_loop.local_addr();
            let shutdown = event_loop.shutdown_handle();
            let (tx, records) = mpsc::channel();
            let handle = thread::spawn(move || event_loop.run(&mut ChannelCollector(tx)));

            Self {
                addr,
                shutdown,
                records,
                handle,
            }
        }

        fn connect(&self) -> std::net::TcpStream {
            let stream = std::net::TcpStream::connect(self.addr).unwrap();
            stream.set_read_timeout(Some(WAIT)).unwrap();
            stream
        }

        fn next_record(&self) -> Bytes {
            self.records.recv_timeout(WAIT).unwrap()
        }

        fn stop(self) {
            self.shutdown.shutdown().unwrap();
            self.handle.join().unwrap().unwrap();
        }
    }

    #[test]
    fn test_frames_over_loopback() {
        let harness = Harness::start(16, None);
        let mut client = harness.connect();

        client.write_all(&encode_frame(b"service started")).unwrap();
        assert_eq!(&harness.next_record()[..], b"service started");

        // Same frame in small pieces, split inside the header.
        let frame = encode_frame(b"slow writer");
        for piece in frame.chunks(3) {
            client.write_all(piece).unwrap();
            client.flush().unwrap();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(&harness.next_record()[..], b"slow writer");

        let mut burst = Vec::new();
        for i in 0..20 {
            burst.extend(encode_frame(format!("burst {i}").as_bytes()));
        }
        client.write_all(&burst).unwrap();
        for i in 0..20 {
            assert_eq!(harness.next_record(), Bytes::from(format!("burst {i}")));
        }

        harness.stop();
    }

    #[test]
    fn test_partial_frame_discarded_on_close() {
        let harness = Harness::start(16, None);

        let mut quitter = harness.connect();
        let frame = encode_frame(b"never finished");
        quitter.write_all(&frame[..7]).unwrap();
        drop(quitter);

        let mut client = harness.connect();
        client.write_all(&encode_frame(b"complete")).unwrap();

        assert_eq!(&harness.next_record()[..], b"complete");
        assert!(harness
            .records
            .recv_timeout(Duration::from_millis(100))
            .is_err());

        harness.stop();
    }

    #[test]
    fn test_handshake_then_read_only() {
        let harness = Harness::start(16, Some("LOGWELL 1\n"));
        let mut client = harness.connect();

        let mut greeting = [0u8; 10];
        client.read_exact(&mut greeting).unwrap();
        assert_eq!(&greeting, b"LOGWELL 1\n");

        client.write_all(&encode_frame(b"after handshake")).unwrap();
        assert_eq!(&harness.next_record()[..], b"after handshake");

        harness.stop();
    }

    #[test]
    fn test_writable_interest_dropped_after_handshake() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client.set_read_timeout(Some(WAIT)).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        let mut poll = Poll::new().unwrap();
        let mut events = Events::with_capacity(16);
        let mut connections = ConnectionRegistry::new(4);
        let Ok(conn_id) = connections.insert(Connection::new(TcpStream::from_std(server), b"HELLO\n"))
        else {
            panic!("registry full");
        };
        let conn = connections.get_mut(conn_id).unwrap();
        poll.registry()
            .register(
                conn.stream_mut(),
                Token(conn_id),
                Interest::READABLE | Interest::WRITABLE,
            )
            .unwrap();

        let mut records: Vec<Bytes> = Vec::new();
        let deadline = Instant::now() + WAIT;

        let mut flushed = false;
        while !flushed {
            assert!(Instant::now() < deadline, "no writable event");
            poll.poll(&mut events, Some(Duration::from_millis(100))).unwrap();
            for event in events.iter() {
                assert_eq!(event.token(), Token(conn_id));
                flushed |= event.is_writable();
                handle_connection_event(conn_id, event, poll.registry(), &mut connections, &mut records)
                    .unwrap();
            }
        }
        assert!(!connections.get_mut(conn_id).unwrap().wants_write());

        let mut greeting = [0u8; 6];
        client.read_exact(&mut greeting).unwrap();
        assert_eq!(&greeting, b"HELLO\n");

        // epoll reports every ready bit in the registered mask, so a leftover
        // WRITABLE registration would show up alongside this read.
        client.write_all(&encode_frame(b"after")).unwrap();
        while records.is_empty() {
            assert!(Instant::now() < deadline, "no readable event");
            poll.poll(&mut events, Some(Duration::from_millis(100))).unwrap();
            for event in events.iter() {
                assert!(event.is_readable());
                assert!(!event.is_writable());
                handle_connection_event(conn_id, event, poll.registry(), &mut connections, &mut records)
                    .unwrap();
            }
        }
        assert_eq!(&records[0][..], b"after");

        poll.poll(&mut events, Some(Duration::from_millis(50))).unwrap();
        assert!(events.iter().all(|event| !event.is_writable()));
    }

    #[test]
    fn test_connection_limit_rejects_extra_peer() {
        let harness = Harness::start(1, None);

        let mut first = harness.connect();
        first.write_all(&encode_frame(b"first")).unwrap();
        assert_eq!(&harness.next_record()[..], b"first");

        let mut second = harness.connect();
        let mut buf = [0u8; 1];
        assert_eq!(second.read(&mut buf).unwrap_or(0), 0);

        first.write_all(&encode_frame(b"still here")).unwrap();
        assert_eq!(&harness.next_record()[..], b"still here");

        harness.stop();
    }

    #[test]
    fn test_shutdown_closes_connections() {
        let harness = Harness::start(16, None);
        let mut client = harness.connect();
        client.write_all(&encode_frame(b"before shutdown")).unwrap();
        assert_eq!(&harness.next_record()[..], b"before shutdown");

        harness.stop();

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
    }

    #[test]
    fn test_bind_rejects_bad_address() {
        let config = Config {
            listen: "not an address".to_string(),
            max_connections: 1,
            event_capacity: 1,
            handshake: None,
            output: "-".to_string(),
            timestamps: false,
            log_level: "info".to_string(),
        };
        let err = EventLoop::bind(&config).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
