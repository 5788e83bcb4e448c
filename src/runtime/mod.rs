//! Single-threaded reactor runtime.
//!
//! Readiness-based I/O via mio (epoll on Linux, kqueue on macOS):
//! - `ConnectionRegistry`: token to listener/client mapping, kept in step
//!   with the OS registration
//! - `Connection`: per-client read/analyze/write state machine
//! - `acceptor`: listener readiness to new connections
//! - `Reactor`: the poll loop that dispatches each ready batch

mod acceptor;
mod connection;
mod protocol;
mod reactor;
mod registry;

pub use reactor::{Reactor, ReactorConfig};

use crate::analysis::TextProcessor;
use crate::config::Config;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use tracing::info;

impl From<&Config> for ReactorConfig {
    fn from(config: &Config) -> Self {
        Self {
            buffer_size: config.buffer_size,
            max_connections: config.max_connections,
            event_capacity: config.event_capacity,
            accept_batch: config.accept_batch,
        }
    }
}

/// Resolve `host:port` to the first address it names.
pub fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address for {host}:{port}"),
        )
    })
}

/// Bind per `config` and serve until SIGINT/SIGTERM.
pub fn run<P: TextProcessor>(config: &Config, processor: P) -> io::Result<()> {
    let addr = resolve(&config.host, config.port)?;
    let mut reactor = Reactor::bind(addr, ReactorConfig::from(config), processor)?;
    reactor.handle_signals()?;
    reactor.run()?;
    info!("Server stopped");
    Ok(())
}
