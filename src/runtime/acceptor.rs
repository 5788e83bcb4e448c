//! Turns listener readiness into registered connections.

use crate::runtime::connection::Connection;
use crate::runtime::registry::{ConnectionRegistry, Entry, Handler, RegisterError};
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// How long accepting stays paused after running out of resources when no
/// client closes in the meantime.
const RETRY_AFTER: Duration = Duration::from_millis(100);

/// Result of one accept attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// A client was registered under this token.
    Registered(Token),
    /// Accepted but not kept (limit reached or registration failed).
    Dropped,
    /// Nothing pending.
    Empty,
    /// Accept failed for one pending connection; the listener is re-armed.
    Failed,
    /// Out of descriptors or memory; accepting pauses until resumed.
    Exhausted,
}

/// Accept state of the listening socket.
#[derive(Debug)]
pub struct Acceptor {
    token: Token,
    buffer_size: usize,
    accept_batch: usize,
    paused_since: Option<Instant>,
}

impl Acceptor {
    pub fn new(token: Token, buffer_size: usize, accept_batch: usize) -> Self {
        Self {
            token,
            buffer_size,
            accept_batch,
            paused_since: None,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn is_paused(&self) -> bool {
        self.paused_since.is_some()
    }

    /// Accept up to `accept_batch` pending connections.
    ///
    /// The listener is re-armed afterwards so that any remaining backlog
    /// shows up as the next readiness event instead of being drained here.
    /// A drained backlog needs no re-arm, and an exhausted one waits for
    /// [`Acceptor::resume`].
    pub fn on_ready(&mut self, registry: &mut ConnectionRegistry) -> Vec<AcceptOutcome> {
        self.on_ready_with(registry, TcpListener::accept)
    }

    /// [`Acceptor::on_ready`] with the accept call supplied by the caller.
    pub fn on_ready_with<F>(
        &mut self,
        registry: &mut ConnectionRegistry,
        mut accept: F,
    ) -> Vec<AcceptOutcome>
    where
        F: FnMut(&TcpListener) -> io::Result<(TcpStream, SocketAddr)>,
    {
        let mut outcomes = Vec::with_capacity(self.accept_batch);

        for _ in 0..self.accept_batch {
            let result = match registry.get_mut(self.token) {
                Some(Entry {
                    handler: Handler::Listener(listener),
                    ..
                }) => accept(&*listener),
                _ => return outcomes,
            };

            let outcome = admit(registry, result, self.buffer_size);
            let more = matches!(outcome, AcceptOutcome::Registered(_) | AcceptOutcome::Dropped);
            outcomes.push(outcome);
            if !more {
                break;
            }
        }

        match outcomes.last() {
            Some(AcceptOutcome::Exhausted) => {
                debug!("Accept paused");
                self.paused_since = Some(Instant::now());
            }
            Some(AcceptOutcome::Empty) => self.paused_since = None,
            _ => {
                self.paused_since = None;
                self.rearm(registry);
            }
        }
        outcomes
    }

    /// Clamp a poll timeout so a paused acceptor gets its retry.
    pub fn poll_timeout(&self, timeout: Option<Duration>) -> Option<Duration> {
        let Some(since) = self.paused_since else {
            return timeout;
        };
        let left = RETRY_AFTER.saturating_sub(since.elapsed());
        Some(timeout.map_or(left, |t| t.min(left)))
    }

    /// Re-arm a paused listener once a descriptor was freed or the retry
    /// delay has passed. Returns true if accepting resumed.
    pub fn resume(&mut self, registry: &mut ConnectionRegistry, freed: bool) -> bool {
        let Some(since) = self.paused_since else {
            return false;
        };
        if !freed && since.elapsed() < RETRY_AFTER {
            return false;
        }
        debug!(freed, "Accept resumed");
        self.paused_since = None;
        self.rearm(registry);
        true
    }

    fn rearm(&self, registry: &mut ConnectionRegistry) {
        if let Err(e) = registry.rearm(self.token, Interest::READABLE) {
            error!(error = %e, "Failed to re-arm listener");
        }
    }
}

/// Register the result of a single accept call.
fn admit(
    registry: &mut ConnectionRegistry,
    result: io::Result<(TcpStream, SocketAddr)>,
    buffer_size: usize,
) -> AcceptOutcome {
    let (stream, peer) = match result {
        Ok(accepted) => accepted,
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return AcceptOutcome::Empty,
        Err(ref e) if is_resource_exhaustion(e) => {
            warn!(error = %e, "Accept failed, out of resources");
            return AcceptOutcome::Exhausted;
        }
        Err(e) => {
            error!(error = %e, "Accept failed");
            return AcceptOutcome::Failed;
        }
    };

    // mio hands out accepted streams already in non-blocking mode.
    match registry.insert_client(Connection::new(stream, peer, buffer_size)) {
        Ok(token) => {
            debug!(conn_id = token.0, peer = %peer, "Accepted connection");
            AcceptOutcome::Registered(token)
        }
        Err(RegisterError::Full(conn)) => {
            warn!(peer = %conn.peer(), "Connection limit reached");
            AcceptOutcome::Dropped
        }
        Err(RegisterError::Io(e)) => {
            warn!(peer = %peer, error = %e, "Failed to register connection");
            AcceptOutcome::Dropped
        }
    }
}

fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}
