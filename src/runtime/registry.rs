//! Registry of sources the reactor polls.
//!
//! Every entry is registered with the OS readiness mechanism under
//! `Token(slab key)`. Inserting registers, removing deregisters and drops
//! the socket, so an entry and its registration never exist apart.

use crate::runtime::connection::Connection;
use mio::event::Source;
use mio::net::TcpListener;
use mio::{Interest, Registry, Token};
use slab::Slab;
use std::io;
use tracing::{debug, trace};

/// Readiness handler stored per token.
#[derive(Debug)]
pub enum Handler {
    /// The listening socket; readiness means pending connections.
    Listener(TcpListener),
    /// An accepted client.
    Client(Connection),
}

impl Source for Handler {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Handler::Listener(l) => l.register(registry, token, interests),
            Handler::Client(c) => c.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Handler::Listener(l) => l.reregister(registry, token, interests),
            Handler::Client(c) => c.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Handler::Listener(l) => l.deregister(registry),
            Handler::Client(c) => c.deregister(registry),
        }
    }
}

/// A registered source and the readiness it waits for.
#[derive(Debug)]
pub struct Entry {
    pub interest: Interest,
    pub handler: Handler,
}

/// Why a client could not be registered.
#[derive(Debug)]
pub enum RegisterError {
    /// `max_connections` clients are already registered.
    Full(Connection),
    Io(io::Error),
}

/// Connections and the listener, keyed by token.
pub struct ConnectionRegistry {
    registry: Registry,
    entries: Slab<Entry>,
    clients: usize,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a registry that registers sources with `registry`.
    pub fn new(registry: Registry, max_connections: usize) -> Self {
        Self {
            registry,
            entries: Slab::with_capacity(max_connections.min(1024) + 1),
            clients: 0,
            max_connections,
        }
    }

    /// Register the listening socket for readability.
    pub fn insert_listener(&mut self, listener: TcpListener) -> io::Result<Token> {
        self.insert(Handler::Listener(listener), Interest::READABLE)
    }

    /// Register a client with the interest its state asks for.
    pub fn insert_client(&mut self, conn: Connection) -> Result<Token, RegisterError> {
        if self.clients >= self.max_connections {
            return Err(RegisterError::Full(conn));
        }
        let interest = conn.interest();
        let token = self
            .insert(Handler::Client(conn), interest)
            .map_err(RegisterError::Io)?;
        self.clients += 1;
        Ok(token)
    }

    fn insert(&mut self, mut handler: Handler, interest: Interest) -> io::Result<Token> {
        let vacant = self.entries.vacant_entry();
        let token = Token(vacant.key());
        // On failure the handler is dropped here and nothing is inserted.
        self.registry.register(&mut handler, token, interest)?;
        vacant.insert(Entry { interest, handler });
        Ok(token)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Entry> {
        self.entries.get_mut(token.0)
    }

    #[cfg(test)]
    pub fn contains(&self, token: Token) -> bool {
        self.entries.contains(token.0)
    }

    /// Re-register an entry with `interest`.
    ///
    /// Also re-arms edge-triggered backends: if the source is still ready,
    /// the next poll reports it again.
    pub fn rearm(&mut self, token: Token, interest: Interest) -> io::Result<()> {
        let entry = self
            .entries
            .get_mut(token.0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "token not registered"))?;
        self.registry
            .reregister(&mut entry.handler, token, interest)?;
        if entry.interest != interest {
            trace!(conn_id = token.0, ?interest, "Interest changed");
            entry.interest = interest;
        }
        Ok(())
    }

    /// Deregister an entry and close its socket.
    pub fn remove(&mut self, token: Token) -> Option<Handler> {
        let mut entry = self.entries.try_remove(token.0)?;
        if let Err(e) = self.registry.deregister(&mut entry.handler) {
            debug!(conn_id = token.0, error = %e, "Deregister failed");
        }
        if matches!(entry.handler, Handler::Client(_)) {
            self.clients -= 1;
        }
        Some(entry.handler)
    }

    /// Deregister and close every entry, listener included.
    pub fn close_all(&mut self) -> usize {
        let tokens: Vec<Token> = self.entries.iter().map(|(key, _)| Token(key)).collect();
        let count = tokens.len();
        for token in tokens {
            self.remove(token);
        }
        count
    }

    /// Number of registered clients.
    pub fn clients(&self) -> usize {
        self.clients
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Poll;
    use std::net::SocketAddr;

    fn client_for(listener: &TcpListener) -> (Connection, std::net::TcpStream) {
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (stream, peer) = loop {
            match listener.accept() {
                Ok(accepted) => break accepted,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::yield_now(),
                Err(e) => panic!("accept failed: {e}"),
            }
        };
        (Connection::new(stream, peer, 64), client)
    }

    fn listener() -> TcpListener {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        TcpListener::bind(addr).unwrap()
    }

    #[test]
    fn test_insert_and_remove() {
        let poll = Poll::new().unwrap();
        let mut registry = ConnectionRegistry::new(poll.registry().try_clone().unwrap(), 8);
        let probe = listener();

        let listen_token = registry.insert_listener(listener()).unwrap();
        let (conn, _client) = client_for(&probe);
        let peer = conn.peer();
        let token = registry.insert_client(conn).unwrap();

        assert_ne!(listen_token, token);
        assert!(registry.contains(listen_token));
        assert_eq!(registry.clients(), 1);
        assert_eq!(registry.get_mut(token).unwrap().interest, Interest::READABLE);

        registry.rearm(token, Interest::WRITABLE).unwrap();
        assert_eq!(registry.get_mut(token).unwrap().interest, Interest::WRITABLE);

        match registry.remove(token) {
            Some(Handler::Client(conn)) => assert_eq!(conn.peer(), peer),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!registry.contains(token));
        assert_eq!(registry.clients(), 0);
        assert!(registry.remove(token).is_none());
        assert!(registry.rearm(token, Interest::READABLE).is_err());
    }

    #[test]
    fn test_capacity() {
        let poll = Poll::new().unwrap();
        let mut registry = ConnectionRegistry::new(poll.registry().try_clone().unwrap(), 1);
        let probe = listener();

        let (c1, _k1) = client_for(&probe);
        let (c2, _k2) = client_for(&probe);
        let t1 = registry.insert_client(c1).unwrap();
        assert!(matches!(registry.insert_client(c2), Err(RegisterError::Full(_))));

        // The listener does not count against the client limit.
        registry.insert_listener(listener()).unwrap();

        registry.remove(t1);
        let (c3, _k3) = client_for(&probe);
        assert!(registry.insert_client(c3).is_ok());
    }

    #[test]
    fn test_close_all() {
        let poll = Poll::new().unwrap();
        let mut registry = ConnectionRegistry::new(poll.registry().try_clone().unwrap(), 8);
        let probe = listener();

        registry.insert_listener(listener()).unwrap();
        let mut clients = Vec::new();
        for _ in 0..3 {
            let (conn, client) = client_for(&probe);
            registry.insert_client(conn).unwrap();
            clients.push(client);
        }

        assert_eq!(registry.close_all(), 4);
        assert!(registry.is_empty());
        assert_eq!(registry.clients(), 0);

        // Every client sees the server side closed.
        for mut client in clients {
            let mut buf = [0u8; 8];
            assert_eq!(std::io::Read::read(&mut client, &mut buf).unwrap(), 0);
        }
    }
}
