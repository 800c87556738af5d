//! Connection table behind the NET* opcodes.
//!
//! Each open TCP stream is stored in a [`SlotTable`] and handed to the
//! program as a word tagged with [`RefTag::CONNECTION`]. Failing to set up
//! a socket is reported to the program as a 0 reference; misusing a
//! reference or losing the peer mid-transfer is fatal.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddrV4, TcpListener, TcpStream};

use thiserror::Error;
use tracing::{debug, warn};

use super::Word;
use super::slots::{RefTag, SlotTable};

pub const CONNECTION_TABLE_INITIAL: usize = 8;
pub const CONNECTION_TABLE_GROWTH: usize = 2;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("{0:#010X} is not an open connection")]
    InvalidReference(Word),
    #[error("connection {0:#010X} closed by peer")]
    PeerClosed(Word),
    #[error("connection {reference:#010X}: {source}")]
    Io {
        reference: Word,
        #[source]
        source: io::Error,
    },
    #[error("too many open connections")]
    TableFull,
}

/// How a connection was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted on a listening port (NETBIND).
    Server,
    /// Outgoing (NETCONNECT).
    Client,
}

#[derive(Debug)]
pub struct Connection {
    role: Role,
    stream: TcpStream,
}

impl Connection {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> Option<std::net::SocketAddr> {
        self.stream.peer_addr().ok()
    }
}

#[derive(Debug)]
pub struct ConnectionTable {
    connections: SlotTable<Connection>,
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self {
            connections: SlotTable::new(
                RefTag::CONNECTION,
                CONNECTION_TABLE_INITIAL,
                CONNECTION_TABLE_GROWTH,
            ),
        }
    }
}

impl ConnectionTable {
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Word, &Connection)> + '_ {
        self.connections.iter()
    }

    /// Listen on `0.0.0.0:port` and block until one peer connects.
    ///
    /// Returns 0 when the socket cannot be bound or the accept fails.
    pub fn bind(&mut self, port: Word) -> Result<Word, NetError> {
        let Some(port) = checked_port(port, "NETBIND") else {
            return Ok(0);
        };
        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        let accepted = TcpListener::bind(addr).and_then(|listener| listener.accept());
        match accepted {
            Ok((stream, peer)) => {
                debug!(%addr, %peer, "accepted connection");
                self.store(Role::Server, stream)
            }
            Err(err) => {
                warn!(%addr, error = %err, "NETBIND failed");
                Ok(0)
            }
        }
    }

    /// Connect to the IPv4 address `host` (as a big-endian word) on `port`.
    ///
    /// Returns 0 when the connection cannot be established.
    pub fn connect(&mut self, host: Word, port: Word) -> Result<Word, NetError> {
        let Some(port) = checked_port(port, "NETCONNECT") else {
            return Ok(0);
        };
        let addr = SocketAddrV4::new(Ipv4Addr::from(host as u32), port);
        match TcpStream::connect(addr) {
            Ok(stream) => {
                debug!(%addr, "connected");
                self.store(Role::Client, stream)
            }
            Err(err) => {
                warn!(%addr, error = %err, "NETCONNECT failed");
                Ok(0)
            }
        }
    }

    fn store(&mut self, role: Role, stream: TcpStream) -> Result<Word, NetError> {
        self.connections
            .insert(Connection { role, stream })
            .map_err(|conn| {
                let _ = conn.stream.shutdown(Shutdown::Both);
                NetError::TableFull
            })
    }

    fn stream(&mut self, reference: Word) -> Result<&mut TcpStream, NetError> {
        self.connections
            .get_mut(reference)
            .map(|conn| &mut conn.stream)
            .map_err(|_| NetError::InvalidReference(reference))
    }

    /// Receive exactly one byte.
    pub fn recv(&mut self, reference: Word) -> Result<Word, NetError> {
        let stream = self.stream(reference)?;
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).map_err(|source| {
            if source.kind() == io::ErrorKind::UnexpectedEof {
                NetError::PeerClosed(reference)
            } else {
                NetError::Io { reference, source }
            }
        })?;
        Ok(byte[0] as Word)
    }

    /// Send the low byte of `data`.
    pub fn send(&mut self, reference: Word, data: Word) -> Result<(), NetError> {
        let stream = self.stream(reference)?;
        stream
            .write_all(&[data as u8])
            .map_err(|source| NetError::Io { reference, source })
    }

    /// Shut the connection down and release its reference.
    pub fn close(&mut self, reference: Word) -> Result<(), NetError> {
        let conn = self
            .connections
            .remove(reference)
            .map_err(|_| NetError::InvalidReference(reference))?;
        // The peer may already be gone; nothing left to report.
        let _ = conn.stream.shutdown(Shutdown::Both);
        debug!(reference = format_args!("{reference:#010X}"), "connection closed");
        Ok(())
    }

    /// Close every connection. Safe to call repeatedly.
    pub fn destroy(&mut self) {
        for conn in self.connections.drain() {
            let _ = conn.stream.shutdown(Shutdown::Both);
        }
    }
}

fn checked_port(port: Word, op: &str) -> Option<u16> {
    let checked = u16::try_from(port).ok();
    if checked.is_none() {
        warn!(port, op, "port out of range");
    }
    checked
}
