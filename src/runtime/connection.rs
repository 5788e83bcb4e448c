//! Connection state machine for client sockets.
//!
//! A connection is OPEN while it sits in the registry and CLOSED once the
//! registry drops it. While open it is either reading (waiting for the next
//! request) or flushing a response the socket could not take in one write.
//!
//! ```text
//! Reading --read 0 bytes / error--> CLOSED
//! Reading --request--> write response --complete--> Reading
//!                                     --WouldBlock--> Flushing --drained--> Reading
//! ```

use crate::analysis::{ProcessError, TextProcessor};
use crate::runtime::protocol::{decode_request, encode_response};
use bytes::{Buf, BytesMut};
use mio::event::Source;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::str::Utf8Error;
use thiserror::Error;
use tracing::debug;

/// Errors that end a single connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("request is not valid UTF-8: {0}")]
    Decode(#[from] Utf8Error),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Current state of an open connection.
#[derive(Debug)]
enum ConnState {
    /// Waiting for the next request.
    Reading,
    /// Response bytes the socket has not accepted yet.
    Flushing { pending: BytesMut },
}

/// What the reactor should do with a connection after servicing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Keep it registered with this interest.
    Continue(Interest),
    /// Peer shut down its side; close it.
    Eof,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    state: ConnState,
    read_buf: Vec<u8>,
    requests: u64,
}

impl Connection {
    /// Wrap an accepted non-blocking stream.
    pub fn new(stream: TcpStream, peer: SocketAddr, buffer_size: usize) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Reading,
            read_buf: vec![0u8; buffer_size],
            requests: 0,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Number of requests answered so far.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Readiness this connection is waiting for.
    pub fn interest(&self) -> Interest {
        match self.state {
            ConnState::Reading => Interest::READABLE,
            ConnState::Flushing { .. } => Interest::WRITABLE,
        }
    }

    /// Service a readiness event.
    pub fn on_ready<P>(&mut self, processor: &P) -> Result<Step, ConnectionError>
    where
        P: TextProcessor + ?Sized,
    {
        match self.state {
            ConnState::Reading => self.on_readable(processor),
            ConnState::Flushing { .. } => self.flush(),
        }
    }

    /// Read one request, analyze it and write the response.
    fn on_readable<P>(&mut self, processor: &P) -> Result<Step, ConnectionError>
    where
        P: TextProcessor + ?Sized,
    {
        let n = loop {
            match self.stream.read(&mut self.read_buf) {
                Ok(0) => return Ok(Step::Eof),
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Step::Continue(Interest::READABLE));
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };

        let request = match decode_request(&self.read_buf[..n])? {
            Some(request) => request,
            None => return Ok(Step::Continue(Interest::READABLE)),
        };

        // Runs on the reactor thread: every other connection waits on this call.
        let lengths = processor.process(request)?;
        debug!(peer = %self.peer, request, units = lengths.len(), "Processed request");

        let response = encode_response(request, &lengths);
        self.requests += 1;
        self.state = ConnState::Flushing { pending: response };
        self.flush()
    }

    /// Write as much of the pending response as the socket takes.
    fn flush(&mut self) -> Result<Step, ConnectionError> {
        let ConnState::Flushing { pending } = &mut self.state else {
            return Ok(Step::Continue(Interest::READABLE));
        };

        while !pending.is_empty() {
            match self.stream.write(&pending[..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => pending.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Step::Continue(Interest::WRITABLE));
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.state = ConnState::Reading;
        Ok(Step::Continue(Interest::READABLE))
    }
}

impl Source for Connection {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.stream.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.stream.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.stream.deregister(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll};
    use std::net::{Shutdown, TcpListener};
    use std::time::{Duration, Instant};

    const TOKEN: Token = Token(7);

    type Stub = fn(&str) -> Result<Vec<usize>, ProcessError>;

    fn word_lengths(text: &str) -> Result<Vec<usize>, ProcessError> {
        Ok(text.split_whitespace().map(str::len).collect())
    }

    fn always_fails(_: &str) -> Result<Vec<usize>, ProcessError> {
        Err(ProcessError::new("boom"))
    }

    /// Accepted connection plus the client end and a poll it is registered with.
    fn pair(buffer_size: usize) -> (Connection, std::net::TcpStream, Poll) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        socket2::SockRef::from(&server)
            .set_send_buffer_size(4096)
            .unwrap();

        let mut conn = Connection::new(TcpStream::from_std(server), peer, buffer_size);
        let poll = Poll::new().unwrap();
        poll.registry()
            .register(&mut conn, TOKEN, Interest::READABLE)
            .unwrap();
        (conn, client, poll)
    }

    fn wait(poll: &mut Poll) {
        let mut events = Events::with_capacity(8);
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            poll.poll(&mut events, Some(Duration::from_millis(100))).unwrap();
            if events.iter().any(|e| e.token() == TOKEN) {
                return;
            }
            assert!(Instant::now() < deadline, "no readiness event");
        }
    }

    #[test]
    fn test_request_response() {
        let (mut conn, mut client, mut poll) = pair(1024);
        client.write_all(b"hello world\n").unwrap();
        wait(&mut poll);

        let step = conn.on_ready(&(word_lengths as Stub)).unwrap();
        assert_eq!(step, Step::Continue(Interest::READABLE));
        assert_eq!(conn.interest(), Interest::READABLE);
        assert_eq!(conn.requests(), 1);

        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world: 5 5\n");
    }

    #[test]
    fn test_eof() {
        let (mut conn, client, mut poll) = pair(1024);
        client.shutdown(Shutdown::Write).unwrap();
        wait(&mut poll);

        assert_eq!(conn.on_ready(&(word_lengths as Stub)).unwrap(), Step::Eof);
        assert_eq!(conn.requests(), 0);
    }

    #[test]
    fn test_processor_error_writes_nothing() {
        let (mut conn, mut client, mut poll) = pair(1024);
        client.write_all(b"bad input").unwrap();
        wait(&mut poll);

        let err = conn.on_ready(&(always_fails as Stub)).unwrap_err();
        assert!(matches!(err, ConnectionError::Process(_)));
        drop(conn);

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_invalid_utf8() {
        let (mut conn, mut client, mut poll) = pair(1024);
        client.write_all(&[0xc3, 0x28, 0xff]).unwrap();
        wait(&mut poll);

        let err = conn.on_ready(&(word_lengths as Stub)).unwrap_err();
        assert!(matches!(err, ConnectionError::Decode(_)));
    }

    #[test]
    fn test_blank_request_ignored() {
        let (mut conn, mut client, mut poll) = pair(1024);
        client.write_all(b" \r\n").unwrap();
        wait(&mut poll);

        let step = conn.on_ready(&(word_lengths as Stub)).unwrap();
        assert_eq!(step, Step::Continue(Interest::READABLE));
        assert_eq!(conn.requests(), 0);
    }

    #[test]
    fn test_one_read_is_one_request() {
        let (mut conn, mut client, mut poll) = pair(4);
        client.write_all(b"abcdefg").unwrap();
        wait(&mut poll);

        conn.on_ready(&(word_lengths as Stub)).unwrap();
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"abcd: 4\n");
    }

    #[test]
    fn test_backpressure_defers_to_writable() {
        let (mut conn, mut client, mut poll) = pair(1024);
        let lengths = vec![1usize; 1 << 20];
        let processor = move |_: &str| -> Result<Vec<usize>, ProcessError> { Ok(lengths.clone()) };

        client.write_all(b"big").unwrap();
        wait(&mut poll);

        let step = conn.on_ready(&processor).unwrap();
        assert_eq!(step, Step::Continue(Interest::WRITABLE));
        assert_eq!(conn.interest(), Interest::WRITABLE);

        let reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            client.read_to_end(&mut buf).unwrap();
            buf
        });

        poll.registry()
            .reregister(&mut conn, TOKEN, Interest::WRITABLE)
            .unwrap();
        loop {
            wait(&mut poll);
            match conn.on_ready(&processor).unwrap() {
                Step::Continue(interest) if interest == Interest::READABLE => break,
                Step::Continue(_) => {}
                Step::Eof => panic!("unexpected eof"),
            }
        }
        drop(conn);

        let response = reader.join().unwrap();
        // "big: " + (2^20 ones separated by spaces) + "\n"
        assert_eq!(response.len(), 5 + (2 << 20) - 1 + 1);
        assert!(response.starts_with(b"big: 1 1 "));
        assert!(response.ends_with(b" 1\n"));
    }
}
