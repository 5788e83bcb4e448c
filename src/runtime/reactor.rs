//! mio event loop.
//!
//! Readiness-based model: poll tells us which registered sockets are ready,
//! then we perform non-blocking read/write syscalls. Uses epoll on Linux,
//! kqueue on macOS.
//!
//! Everything runs on one thread. Each ready batch is serviced in full
//! before the next poll, and every handler runs to completion, so the
//! registry needs no locking. The analysis call happens inside the read
//! handler and holds up the whole loop while it runs; moving it to a worker
//! pool with a completion queue back into the loop would be the next step if
//! concurrent throughput matters.

use crate::analysis::TextProcessor;
use crate::runtime::acceptor::Acceptor;
use crate::runtime::connection::{ConnectionError, Step};
use crate::runtime::registry::{ConnectionRegistry, Entry, Handler};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_mio::v1_0::Signals;
use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const WAKER_TOKEN: Token = Token(usize::MAX);
const SIGNAL_TOKEN: Token = Token(usize::MAX - 1);

/// Tuning knobs for the event loop.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Bytes read per request.
    pub buffer_size: usize,
    /// Maximum number of registered clients.
    pub max_connections: usize,
    /// Readiness events fetched per poll.
    pub event_capacity: usize,
    /// Accepts performed per listener event.
    pub accept_batch: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            max_connections: 10_000,
            event_capacity: 1024,
            accept_batch: 1,
        }
    }
}

/// Stops a running reactor from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Ask the reactor to close everything and return from `run`.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn shutdown(&self) -> io::Result<()> {
        self.requested.store(true, Ordering::SeqCst);
        self.waker.wake()
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Owns the poller, the listener and every client connection.
pub struct Reactor<P> {
    poll: Poll,
    events: Events,
    registry: ConnectionRegistry,
    acceptor: Acceptor,
    local_addr: SocketAddr,
    processor: P,
    config: ReactorConfig,
    shutdown: ShutdownHandle,
    signals: Option<Signals>,
}

impl<P: TextProcessor> Reactor<P> {
    /// Bind the listening socket and register it.
    pub fn bind(addr: SocketAddr, config: ReactorConfig, processor: P) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let listener = TcpListener::from_std(create_listener(addr)?);
        let local_addr = listener.local_addr()?;

        let mut registry =
            ConnectionRegistry::new(poll.registry().try_clone()?, config.max_connections);
        let listener = registry.insert_listener(listener)?;

        info!(addr = %local_addr, "Listening");

        Ok(Self {
            poll,
            events: Events::with_capacity(config.event_capacity),
            registry,
            acceptor: Acceptor::new(listener, config.buffer_size, config.accept_batch),
            local_addr,
            processor,
            config,
            shutdown: ShutdownHandle {
                requested: Arc::new(AtomicBool::new(false)),
                waker: Arc::new(waker),
            },
            signals: None,
        })
    }

    /// Shut down on SIGINT or SIGTERM.
    pub fn handle_signals(&mut self) -> io::Result<()> {
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        self.poll
            .registry()
            .register(&mut signals, SIGNAL_TOKEN, Interest::READABLE)?;
        self.signals = Some(signals);
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Run until shutdown is requested or polling fails.
    ///
    /// Per-connection failures never escape; only a failing poll does.
    pub fn run(&mut self) -> io::Result<()> {
        info!(
            addr = %self.local_addr,
            buffer_size = self.config.buffer_size,
            max_connections = self.config.max_connections,
            "Reactor started"
        );

        while !self.shutdown.is_requested() {
            self.turn(None)?;
        }

        let clients = self.registry.clients();
        let closed = self.registry.close_all();
        debug_assert!(self.registry.is_empty());
        info!(clients, closed, "Reactor stopped");
        Ok(())
    }

    /// Poll once and service the whole ready batch.
    ///
    /// Returns the number of events handled.
    fn turn(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout = self.acceptor.poll_timeout(timeout);
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => {
                error!(error = %e, "Poll failed");
                return Err(e);
            }
        }

        let mut handled = 0;
        let mut freed = false;
        for event in self.events.iter() {
            handled += 1;
            match event.token() {
                WAKER_TOKEN => {}
                SIGNAL_TOKEN => {
                    if let Some(signals) = self.signals.as_mut() {
                        for signal in signals.pending() {
                            info!(signal, "Shutdown signal received");
                            self.shutdown.requested.store(true, Ordering::SeqCst);
                        }
                    }
                }
                token if token == self.acceptor.token() => {
                    self.acceptor.on_ready(&mut self.registry);
                }
                token => freed |= service_client(&mut self.registry, &self.processor, token),
            }
        }

        self.acceptor.resume(&mut self.registry, freed);
        Ok(handled)
    }
}

/// Dispatch one readiness event to a client and apply the outcome.
///
/// Errors and panics stop here: the client is closed and the loop goes on.
/// Returns true if the client was closed.
fn service_client<P>(registry: &mut ConnectionRegistry, processor: &P, token: Token) -> bool
where
    P: TextProcessor + ?Sized,
{
    let Some(Entry {
        handler: Handler::Client(conn),
        ..
    }) = registry.get_mut(token)
    else {
        // Closed earlier in this batch.
        return false;
    };
    let peer = conn.peer();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| conn.on_ready(processor)));
    match outcome {
        Ok(Ok(Step::Continue(interest))) => match registry.rearm(token, interest) {
            Ok(()) => return false,
            Err(e) => warn!(conn_id = token.0, peer = %peer, error = %e, "Re-register failed"),
        },
        Ok(Ok(Step::Eof)) => {
            debug!(conn_id = token.0, peer = %peer, "Peer closed connection");
        }
        Ok(Err(ConnectionError::Io(e))) => {
            debug!(conn_id = token.0, peer = %peer, error = %e, "Connection error");
        }
        Ok(Err(e)) => {
            warn!(conn_id = token.0, peer = %peer, error = %e, "Request failed");
        }
        Err(payload) => {
            error!(
                conn_id = token.0,
                peer = %peer,
                panic = panic_message(&*payload),
                "Handler panicked"
            );
        }
    }

    if let Some(Handler::Client(conn)) = registry.remove(token) {
        debug!(
            conn_id = token.0,
            peer = %conn.peer(),
            requests = conn.requests(),
            "Connection closed"
        );
    }
    true
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
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
