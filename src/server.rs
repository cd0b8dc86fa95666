//! TCP server for the default (tokio) runtime.
//!
//! Every configured port gets an accept loop; every connection gets a
//! session. A session splits its stream: the reader half drives the
//! header -> body -> deliver state machine, and a writer task drains
//! the session's outbound queue. The queue is an unbounded channel,
//! so a slow consumer accumulates memory rather than exerting
//! backpressure; the single writer task keeps at most one write
//! outstanding per socket and preserves delivery order.

use crate::config::Config;
use crate::protocol::{self, Message, HEADER_LEN};
use crate::room::{Participant, ParticipantId, Room};
use bytes::Bytes;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Room handle shared between accept loops and sessions.
pub type SharedRoom = Arc<Mutex<Room>>;

/// Lock the room, recovering the guard if a holder panicked. Room
/// mutations are single non-blocking calls, so the state behind a
/// poisoned lock is still consistent.
fn lock_room(room: &SharedRoom) -> MutexGuard<'_, Room> {
    room.lock().unwrap_or_else(|e| e.into_inner())
}

/// Server instance: one room shared by every listener.
pub struct Server {
    config: Config,
    room: SharedRoom,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let room = Arc::new(Mutex::new(Room::new(config.history_capacity)));
        Server { config, room }
    }

    /// Bind every configured port and serve until shutdown.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let mut accept_loops = Vec::with_capacity(self.config.ports.len());

        for port in &self.config.ports {
            let addr = format!("{}:{}", self.config.host, port);
            let listener = TcpListener::bind(&addr).await?;
            info!(address = %addr, "Server listening");

            let room = Arc::clone(&self.room);
            accept_loops.push(tokio::spawn(accept_loop(listener, room)));
        }

        for handle in accept_loops {
            handle.await?;
        }
        Ok(())
    }

    /// Get a reference to the room for testing
    #[cfg(test)]
    pub fn room(&self) -> &SharedRoom {
        &self.room
    }
}

/// Accept connections on one listener, spawning a session per socket.
async fn accept_loop(listener: TcpListener, room: SharedRoom) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(peer = %addr, "New connection");

                let room = Arc::clone(&room);
                tokio::spawn(async move {
                    if let Err(e) = run_session(stream, room).await {
                        debug!(peer = %addr, error = %e, "Session ended");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}

/// Write-side handle registered with the room.
///
/// Delivery enqueues the encoded frame and returns; the session's
/// writer task is the only writer on the socket. A closed queue means
/// the session is tearing down, and the reader half will leave the
/// room when it notices the socket error.
struct SessionHandle {
    id: ParticipantId,
    outbound: mpsc::UnboundedSender<Bytes>,
}

impl Participant for SessionHandle {
    fn id(&self) -> ParticipantId {
        self.id
    }

    fn deliver(&self, msg: &Message) {
        let _ = self.outbound.send(msg.encode());
    }
}

/// Handle a single client connection.
async fn run_session(stream: TcpStream, room: SharedRoom) -> io::Result<()> {
    let (reader, writer) = stream.into_split();
    drive_session(reader, writer, room).await
}

/// Join the room, then read frames until the peer goes away or
/// violates the protocol. The last action on every exit path is
/// leaving the room, so no dead participant lingers in the member set.
async fn drive_session<R, W>(reader: R, writer: W, room: SharedRoom) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let participant = Arc::new(SessionHandle {
        id: ParticipantId::next(),
        outbound: outbound_tx,
    });
    let id = participant.id();

    // Joining replays history into the queue before any newer message
    // can be delivered.
    lock_room(&room).join(participant);

    let writer_task = tokio::spawn(write_outbound(writer, outbound_rx));

    let result = read_frames(reader, &room).await;

    // Leaving drops the last queue sender; the writer task drains
    // whatever is already queued, then exits. The session is released
    // only once no write is outstanding.
    lock_room(&room).leave(id);
    let _ = writer_task.await;
    result
}

/// Read state machine: a fixed-size header read, then an exact body
/// read, then deliver to the room before re-arming. One in-flight
/// inbound message per connection, never more.
async fn read_frames<R>(mut reader: R, room: &SharedRoom) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    loop {
        reader.read_exact(&mut header).await?;
        let body_len = protocol::decode_header(&header)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut body = vec![0u8; body_len];
        reader.read_exact(&mut body).await?;

        lock_room(room).deliver(Message::from_body(body.into()));
    }
}

/// Drain the outbound queue, one frame at a time, in enqueue order.
async fn write_outbound<W>(mut writer: W, mut outbound_rx: mpsc::UnboundedReceiver<Bytes>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = outbound_rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!(error = %e, "Write failed, dropping outbound queue");
            break;
        }
    }
}
