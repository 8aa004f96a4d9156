//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! One thread owns the listener, every connection and the store. A payload
//! that has not fully arrived is parked in its connection's state, so a slow
//! client never holds up the others.

use crate::config::Config;
use crate::runtime::connection::{Connection, ConnectionRegistry, ReadStatus};
use crate::storage::Store;
use mio::event::Event;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Listen backlog for the server socket.
const BACKLOG: i32 = 1024;

/// Single-threaded relay server.
pub struct EventLoop {
    poll: Poll,
    /// `None` only while a failed listener is being replaced.
    listener: Option<TcpListener>,
    /// Resolved listen address, reused when the listener is recreated.
    addr: SocketAddr,
    connections: ConnectionRegistry,
    store: Store,
    /// Read buffer shared by every connection.
    scratch: Vec<u8>,
    /// Connections closed while handling the current event batch. Their
    /// slab slots may already belong to a newly accepted socket.
    closed_in_batch: Vec<usize>,
    event_capacity: usize,
    poll_timeout: Duration,
    shutdown: Arc<AtomicBool>,
}

impl EventLoop {
    /// Bind the listener and register it with a fresh poller.
    pub fn bind(config: &Config, store: Store) -> io::Result<Self> {
        let requested = (config.host.as_str(), config.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("cannot resolve {}:{}", config.host, config.port),
                )
            })?;

        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(create_listener(requested)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        // Resolve port 0 so a recreated listener comes back on the same port
        let addr = listener.local_addr()?;

        info!(
            addr = %addr,
            max_connections = config.max_connections,
            "Server listening"
        );

        Ok(Self {
            poll,
            listener: Some(listener),
            addr,
            connections: ConnectionRegistry::new(config.max_connections),
            store,
            scratch: vec![0u8; config.read_buffer_size.max(1)],
            closed_in_batch: Vec::new(),
            event_capacity: config.event_capacity.max(1),
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Address the listener is bound to.
    #[cfg(test)]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Flag that stops `run` after the current poll round once set.
    #[cfg(test)]
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Drive the reactor until shutdown is requested.
    ///
    /// Returns an error only if polling fails or the listener cannot be
    /// recreated after a failure.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.event_capacity);

        while !self.shutdown.load(Ordering::Relaxed) {
            match self.poll.poll(&mut events, Some(self.poll_timeout)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            self.closed_in_batch.clear();
            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => {
                        if event.is_error() {
                            self.recover_listener()?;
                            continue;
                        }
                        self.accept_connections();
                    }
                    Token(conn_id) => {
                        if self.is_stale(conn_id) {
                            trace!(conn_id, "Skipping event for closed connection");
                            continue;
                        }
                        if let Err(e) = self.handle_connection_event(conn_id, event) {
                            debug!(conn_id, error = %e, "Connection error");
                            self.close_connection(conn_id);
                        }
                    }
                }
            }
        }

        info!(connections = self.connections.len(), "Server shutting down");
        Ok(())
    }

    /// Accept until the listener would block.
    fn accept_connections(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };

        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if self.connections.is_full() {
                        warn!(peer = %peer, "Connection limit reached");
                        continue;
                    }

                    let Some(conn_id) = self.connections.insert(Connection::new(stream, peer))
                    else {
                        continue;
                    };

                    // Re-borrow after insert
                    let Some(conn) = self.connections.get_mut(conn_id) else {
                        continue;
                    };
                    if let Err(e) = self.poll.registry().register(
                        &mut conn.stream,
                        Token(conn_id),
                        Interest::READABLE,
                    ) {
                        warn!(peer = %peer, error = %e, "Failed to register connection");
                        self.connections.remove(conn_id);
                        continue;
                    }

                    debug!(conn_id, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Accept error: {}", e);
                    break;
                }
            }
        }
    }

    /// Whether events for `conn_id` in the current batch predate its closing.
    fn is_stale(&self, conn_id: usize) -> bool {
        self.closed_in_batch.contains(&conn_id)
    }

    fn handle_connection_event(&mut self, conn_id: usize, event: &Event) -> io::Result<()> {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return Ok(());
        };

        if event.is_error() {
            return Err(conn
                .stream
                .take_error()?
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "socket error")));
        }

        if !conn.read_closed && (event.is_readable() || event.is_read_closed()) {
            let status = conn.fill(&mut self.scratch)?;
            let completed = conn.process(&mut self.store);
            if completed > 0 {
                trace!(
                    conn_id,
                    completed,
                    awaiting_payload = conn.is_awaiting_payload(),
                    "Processed commands"
                );
            }

            if status == ReadStatus::Closed {
                if conn.abort_pending() {
                    debug!(conn_id, peer = %conn.peer, "Peer closed mid-payload");
                }
                // A half-closed peer still reads; finish sending before closing
                conn.read_closed = true;
            }
        }

        if event.is_writable() || !conn.write_interest || conn.read_closed {
            let drained = conn.flush()?;
            if drained && conn.read_closed {
                self.close_connection(conn_id);
                return Ok(());
            }
            update_interest(&self.poll, conn, conn_id, drained)?;
        }

        Ok(())
    }

    /// Replace a failed listener with a fresh one on the same address.
    fn recover_listener(&mut self) -> io::Result<()> {
        warn!(addr = %self.addr, "Listener failed, recreating");

        // The old socket must be closed before the address can be rebound
        if let Some(mut old) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut old);
        }

        let mut listener = TcpListener::from_std(create_listener(self.addr).map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to recreate listener");
            e
        })?);
        self.poll
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        self.listener = Some(listener);
        info!(addr = %self.addr, "Listener recreated");
        Ok(())
    }

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut conn) = self.connections.remove(conn_id) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            self.closed_in_batch.push(conn_id);
            debug!(conn_id, peer = %conn.peer, "Connection closed");
        }
    }
}

/// Register writable interest while output is pending, drop it once drained.
fn update_interest(
    poll: &Poll,
    conn: &mut Connection,
    conn_id: usize,
    drained: bool,
) -> io::Result<()> {
    let want_write = !drained;
    if want_write == conn.write_interest {
        return Ok(());
    }

    let interest = if want_write {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    };
    poll.registry()
        .reregister(&mut conn.stream, Token(conn_id), interest)?;
    conn.write_interest = want_write;
    Ok(())
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
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}
