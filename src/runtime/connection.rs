//! Connection state for relay clients.
//!
//! Each connection owns its socket, the bytes received but not yet
//! consumed, the payload it is waiting for (if any), and the response
//! bytes the socket has not accepted yet.

use crate::runtime::request::{abort_pending, process_inbound, PendingPayload};
use crate::storage::Store;
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

/// Outcome of draining a socket's readable data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Socket drained; peer may send more.
    Open,
    /// Peer closed its write side.
    Closed,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    /// Non-blocking client socket.
    pub stream: TcpStream,
    /// Remote address, for logging.
    pub peer: SocketAddr,
    /// Received bytes not yet consumed as a frame or payload.
    inbound: BytesMut,
    /// Payload still being awaited by a `put` or `store_key`.
    pending: Option<PendingPayload>,
    /// Response bytes not yet written to the socket.
    outbound: BytesMut,
    /// Whether writable interest is currently registered.
    pub write_interest: bool,
    /// Peer shut down its write side; close once `outbound` drains.
    pub read_closed: bool,
}

impl Connection {
    /// Create a new connection with empty buffers.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            inbound: BytesMut::new(),
            pending: None,
            outbound: BytesMut::new(),
            write_interest: false,
            read_closed: false,
        }
    }

    /// Read everything currently available on the socket.
    ///
    /// mio readiness is edge-triggered, so this keeps reading until the
    /// socket would block. `scratch` is shared by every connection on the
    /// loop and must not be empty.
    pub fn fill(&mut self, scratch: &mut [u8]) -> io::Result<ReadStatus> {
        loop {
            match self.stream.read(scratch) {
                Ok(0) => return Ok(ReadStatus::Closed),
                Ok(n) => self.inbound.extend_from_slice(&scratch[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadStatus::Open)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Run every complete frame through the dispatcher.
    ///
    /// Returns the number of commands completed.
    pub fn process(&mut self, store: &mut Store) -> usize {
        process_inbound(
            &mut self.inbound,
            &mut self.pending,
            store,
            &mut self.outbound,
        )
    }

    /// Fail a payload the peer will never finish sending.
    pub fn abort_pending(&mut self) -> bool {
        abort_pending(&mut self.pending, &mut self.outbound)
    }

    /// Whether a payload is being awaited.
    pub fn is_awaiting_payload(&self) -> bool {
        self.pending.is_some()
    }

    /// Write as much of the outbound buffer as the socket accepts.
    ///
    /// Returns `true` once everything has been written.
    pub fn flush(&mut self) -> io::Result<bool> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => self.outbound.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

/// Registry of active connections using slab allocation.
///
/// The slab index doubles as the mio token.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Whether another connection can be accepted.
    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        self.connections.try_remove(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    /// Build a connected (server-side mio stream, client std stream) pair.
    fn socket_pair() -> (TcpStream, SocketAddr, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), peer, client)
    }

    #[test]
    fn test_fill_process_flush() {
        let (stream, peer, mut client) = socket_pair();
        let mut conn = Connection::new(stream, peer);
        let mut store = Store::new();
        let mut scratch = [0u8; 4];

        // Frame is longer than the scratch buffer and arrives over several reads
        client.write_all(b"put alice hello 5\nwor").unwrap();
        thread::sleep(Duration::from_millis(50));

        assert_eq!(conn.fill(&mut scratch).unwrap(), ReadStatus::Open);
        assert_eq!(conn.process(&mut store), 0);
        assert!(conn.is_awaiting_payload());

        client.write_all(b"ld").unwrap();
        thread::sleep(Duration::from_millis(50));

        assert_eq!(conn.fill(&mut scratch).unwrap(), ReadStatus::Open);
        assert_eq!(conn.process(&mut store), 1);
        assert!(!conn.is_awaiting_payload());
        assert!(conn.flush().unwrap());

        let mut response = [0u8; 3];
        client.read_exact(&mut response).unwrap();
        assert_eq!(&response, b"OK\n");
    }

    #[test]
    fn test_fill_reports_close() {
        let (stream, peer, client) = socket_pair();
        let mut conn = Connection::new(stream, peer);

        drop(client);
        thread::sleep(Duration::from_millis(50));

        assert_eq!(conn.fill(&mut [0u8; 1024]).unwrap(), ReadStatus::Closed);
    }

    #[test]
    fn test_scratch_shared_between_connections() {
        let (s1, p1, mut c1) = socket_pair();
        let (s2, p2, mut c2) = socket_pair();
        let mut first = Connection::new(s1, p1);
        let mut second = Connection::new(s2, p2);
        let mut store = Store::new();
        let mut scratch = vec![0u8; 8];

        c1.write_all(b"put a first 3\none").unwrap();
        c2.write_all(b"put b second 3\ntwo").unwrap();
        thread::sleep(Duration::from_millis(50));

        // Leftover scratch bytes from one connection never leak into another
        assert_eq!(first.fill(&mut scratch).unwrap(), ReadStatus::Open);
        assert_eq!(second.fill(&mut scratch).unwrap(), ReadStatus::Open);
        assert_eq!(first.process(&mut store), 1);
        assert_eq!(second.process(&mut store), 1);

        assert_eq!(store.get("a", 1).unwrap().body.as_ref(), b"one");
        assert_eq!(store.get("b", 1).unwrap().body.as_ref(), b"two");
        assert_eq!(store.list("b"), vec![(1, "second")]);
    }

    #[test]
    fn test_connection_registry() {
        let mut registry = ConnectionRegistry::new(2);

        let (s1, p1, _c1) = socket_pair();
        let (s2, p2, _c2) = socket_pair();
        let (s3, p3, _c3) = socket_pair();

        let id1 = registry.insert(Connection::new(s1, p1)).unwrap();
        let id2 = registry.insert(Connection::new(s2, p2)).unwrap();

        // At capacity
        assert!(registry.is_full());
        assert!(registry.insert(Connection::new(s3, p3)).is_none());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get_mut(id2).unwrap().peer, p2);

        assert!(registry.remove(id1).is_some());
        assert!(registry.remove(id1).is_none());
        assert!(registry.get_mut(id1).is_none());
        assert_eq!(registry.len(), 1);
    }
}
