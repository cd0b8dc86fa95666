//! Single-threaded readiness event loop.
//!
//! Readiness-based model: poll tells us when sockets are ready, then
//! we perform non-blocking read/write syscalls. One thread services
//! accepts, reads and writes for every connection; handlers run to
//! completion before the next event is dispatched, so the room is
//! owned by the loop and needs no lock.

use crate::config::Config;
use crate::room::{Participant, Room};
use crate::runtime::Connection;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Registry, Token};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Connection tokens start here; lower tokens index listeners.
const CONN_TOKEN_BASE: usize = 1024;

const EVENTS_CAPACITY: usize = 1024;

/// The relay's event loop: listeners, live connections and the room.
pub struct EventLoop {
    poll: Poll,
    listeners: Vec<TcpListener>,
    connections: Slab<Connection>,
    room: Room,
}

impl EventLoop {
    /// Bind every configured port and register the listeners.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let poll = Poll::new()?;

        let mut listeners = Vec::with_capacity(config.ports.len());
        for (idx, port) in config.ports.iter().enumerate() {
            let addr: SocketAddr = format!("{}:{}", config.host, port)
                .parse()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

            let mut listener = TcpListener::from_std(create_listener(addr)?);
            poll.registry()
                .register(&mut listener, Token(idx), Interest::READABLE)?;
            info!(address = %addr, "Server listening");
            listeners.push(listener);
        }

        Ok(EventLoop {
            poll,
            listeners,
            connections: Slab::new(),
            room: Room::new(config.history_capacity),
        })
    }

    /// Addresses actually bound (ports resolved by the OS).
    pub fn local_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        self.listeners.iter().map(|l| l.local_addr()).collect()
    }

    /// Dispatch events until the poll itself fails.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        loop {
            self.poll.poll(&mut events, None)?;

            for event in events.iter() {
                let token = event.token();
                if token.0 < CONN_TOKEN_BASE {
                    self.accept_connections(token.0)?;
                } else {
                    let key = token.0 - CONN_TOKEN_BASE;
                    if let Err(e) = self.handle_connection_event(key, event) {
                        debug!(conn = key, error = %e, "Connection error");
                        self.close_connection(key);
                    }
                }
            }
        }
    }

    /// Accept until the listener would block, joining each new
    /// connection to the room.
    fn accept_connections(&mut self, listener_idx: usize) -> io::Result<()> {
        loop {
            match self.listeners[listener_idx].accept() {
                Ok((stream, peer_addr)) => {
                    let key = self.connections.insert(Connection::new(stream));
                    let token = Token(CONN_TOKEN_BASE + key);

                    let conn = &mut self.connections[key];
                    self.poll
                        .registry()
                        .register(&mut conn.stream, token, Interest::READABLE)?;
                    self.room
                        .join(Arc::clone(&conn.queue) as Arc<dyn Participant>);

                    debug!(conn = key, peer = %peer_addr, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }

        // A joiner with history gets its replay pushed out right away.
        self.flush_pending();
        Ok(())
    }

    fn handle_connection_event(
        &mut self,
        key: usize,
        event: &mio::event::Event,
    ) -> io::Result<()> {
        if !self.connections.contains(key) {
            return Ok(());
        }

        let read_result = if event.is_readable() {
            self.handle_readable(key)
        } else {
            Ok(())
        };

        // Frames delivered above sit queued on their receivers; push
        // them out before surfacing any read error.
        self.flush_pending();
        read_result?;

        if event.is_writable() && self.connections.contains(key) {
            let registry = self.poll.registry();
            let conn = &mut self.connections[key];
            flush_outbound(registry, conn, Token(CONN_TOKEN_BASE + key))?;
        }

        Ok(())
    }

    /// Drain readable bytes: exact header reads, then exact body
    /// reads, delivering each completed frame to the room before
    /// reading on.
    fn handle_readable(&mut self, key: usize) -> io::Result<()> {
        loop {
            let conn = &mut self.connections[key];
            let window = conn.assembler.window();

            let n = match conn.stream.read(window) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::ConnectionReset, "EOF")),
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            match conn.assembler.advance(n) {
                Ok(Some(msg)) => self.room.deliver(msg),
                Ok(None) => {}
                Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            }
        }
    }

    /// Flush every connection with queued output, closing any whose
    /// socket fails mid-write.
    fn flush_pending(&mut self) {
        let mut dead = Vec::new();

        let registry = self.poll.registry();
        for (key, conn) in self.connections.iter_mut() {
            if conn.queue.is_empty() && !conn.wants_write {
                continue;
            }
            if let Err(e) = flush_outbound(registry, conn, Token(CONN_TOKEN_BASE + key)) {
                debug!(conn = key, error = %e, "Write failed");
                dead.push(key);
            }
        }

        for key in dead {
            self.close_connection(key);
        }
    }

    /// Tear down a connection. The room forgets the participant
    /// before the socket is released, so no dead member lingers.
    fn close_connection(&mut self, key: usize) {
        if let Some(mut conn) = self.connections.try_remove(key) {
            self.room.leave(conn.queue.id());
            let _ = self.poll.registry().deregister(&mut conn.stream);
            debug!(conn = key, "Connection closed");
        }
    }
}

/// Write queued frames until drained or the socket backs up. Write
/// interest stays registered only while bytes remain queued.
fn flush_outbound(registry: &Registry, conn: &mut Connection, token: Token) -> io::Result<()> {
    loop {
        let Some((frame, written)) = conn.queue.head() else {
            if conn.wants_write {
                registry.reregister(&mut conn.stream, token, Interest::READABLE)?;
                conn.wants_write = false;
            }
            return Ok(());
        };

        match conn.stream.write(&frame[written..]) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
            Ok(n) => conn.queue.advance(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                if !conn.wants_write {
                    registry.reregister(
                        &mut conn.stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    )?;
                    conn.wants_write = true;
                }
                return Ok(());
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

/// Create a non-blocking TCP listener bound to `addr`.
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
