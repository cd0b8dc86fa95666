//! Per-connection state for the readiness runtime.
//!
//! Each connection tracks its inbound read phase (header, then body)
//! and an outbound queue of encoded frames. The queue is the
//! session's participant face: room fan-out enqueues here, the event
//! loop owns the socket and flushes.

use crate::protocol::{self, FrameError, Message, HEADER_LEN, MAX_BODY_LEN};
use crate::room::{Participant, ParticipantId};
use bytes::Bytes;
use mio::net::TcpStream;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// Current inbound read phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPhase {
    /// Accumulating the fixed-width length header.
    Header { filled: usize },
    /// Accumulating exactly the declared body length.
    Body { len: usize, filled: usize },
}

/// Reassembles frames from exact-size reads.
///
/// The caller reads into [`window`](Self::window) and reports the byte
/// count to [`advance`](Self::advance); a completed body yields a
/// message and re-arms the header phase. At most one inbound message
/// is in flight per connection.
pub struct FrameAssembler {
    phase: ReadPhase,
    buf: [u8; MAX_BODY_LEN],
}

impl FrameAssembler {
    /// Start in the header phase.
    pub fn new() -> Self {
        FrameAssembler {
            phase: ReadPhase::Header { filled: 0 },
            buf: [0u8; MAX_BODY_LEN],
        }
    }

    /// Current phase.
    pub fn phase(&self) -> ReadPhase {
        self.phase
    }

    /// Slice the next read should fill: the remainder of the header,
    /// or the remainder of the declared body.
    pub fn window(&mut self) -> &mut [u8] {
        match self.phase {
            ReadPhase::Header { filled } => &mut self.buf[filled..HEADER_LEN],
            ReadPhase::Body { len, filled } => &mut self.buf[filled..len],
        }
    }

    /// Account `n` freshly read bytes, yielding a message once the
    /// body completes. A malformed or oversized header is a protocol
    /// violation and poisons the connection, never truncates.
    pub fn advance(&mut self, n: usize) -> Result<Option<Message>, FrameError> {
        match self.phase {
            ReadPhase::Header { filled } => {
                let filled = filled + n;
                debug_assert!(filled <= HEADER_LEN);
                if filled < HEADER_LEN {
                    self.phase = ReadPhase::Header { filled };
                    return Ok(None);
                }

                let len = protocol::decode_header(&self.buf[..HEADER_LEN])?;
                if len == 0 {
                    self.phase = ReadPhase::Header { filled: 0 };
                    return Ok(Some(Message::from_body(Bytes::new())));
                }
                self.phase = ReadPhase::Body { len, filled: 0 };
                Ok(None)
            }
            ReadPhase::Body { len, filled } => {
                let filled = filled + n;
                debug_assert!(filled <= len);
                if filled < len {
                    self.phase = ReadPhase::Body { len, filled };
                    return Ok(None);
                }

                let msg = Message::from_body(Bytes::copy_from_slice(&self.buf[..len]));
                self.phase = ReadPhase::Header { filled: 0 };
                Ok(Some(msg))
            }
        }
    }
}

/// Outbound frame queue shared between the room and the event loop.
///
/// `deliver` only enqueues; the event loop is the single writer on
/// the socket, so frames go out whole and in delivery order with at
/// most one write in flight. The queue is unbounded: a slow consumer
/// accumulates memory instead of applying backpressure.
pub struct OutboundQueue {
    id: ParticipantId,
    pending: Mutex<PendingWrites>,
}

struct PendingWrites {
    frames: VecDeque<Bytes>,
    /// Bytes of the head frame already written to the socket.
    head_written: usize,
}

impl OutboundQueue {
    /// Create an empty queue with a fresh participant id.
    pub fn new() -> Arc<Self> {
        Arc::new(OutboundQueue {
            id: ParticipantId::next(),
            pending: Mutex::new(PendingWrites {
                frames: VecDeque::new(),
                head_written: 0,
            }),
        })
    }

    fn pending(&self) -> MutexGuard<'_, PendingWrites> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether any frame bytes remain queued.
    pub fn is_empty(&self) -> bool {
        self.pending().frames.is_empty()
    }

    /// The head frame and its write cursor.
    pub fn head(&self) -> Option<(Bytes, usize)> {
        let pending = self.pending();
        pending
            .frames
            .front()
            .map(|frame| (frame.clone(), pending.head_written))
    }

    /// Account `n` bytes written, dropping the head frame once fully
    /// sent.
    pub fn advance(&self, n: usize) {
        let mut pending = self.pending();
        pending.head_written += n;
        if let Some(frame) = pending.frames.front() {
            if pending.head_written >= frame.len() {
                pending.frames.pop_front();
                pending.head_written = 0;
            }
        }
    }
}

impl Participant for OutboundQueue {
    fn id(&self) -> ParticipantId {
        self.id
    }

    fn deliver(&self, msg: &Message) {
        self.pending().frames.push_back(msg.encode());
    }
}

/// A live connection on the event loop.
pub struct Connection {
    pub stream: TcpStream,
    pub queue: Arc<OutboundQueue>,
    pub assembler: FrameAssembler,
    /// Whether write interest is currently registered.
    pub wants_write: bool,
}

impl Connection {
    /// Wrap an accepted socket in its initial reading state.
    pub fn new(stream: TcpStream) -> Self {
        Connection {
            stream,
            queue: OutboundQueue::new(),
            assembler: FrameAssembler::new(),
            wants_write: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Copy `bytes` into the assembler's window and account them.
    fn feed(asm: &mut FrameAssembler, bytes: &[u8]) -> Result<Option<Message>, FrameError> {
        let window = asm.window();
        window[..bytes.len()].copy_from_slice(bytes);
        asm.advance(bytes.len())
    }

    #[test]
    fn test_assembler_header_then_body() {
        let mut asm = FrameAssembler::new();
        assert_eq!(asm.phase(), ReadPhase::Header { filled: 0 });
        assert_eq!(asm.window().len(), HEADER_LEN);

        assert_eq!(feed(&mut asm, b"0005"), Ok(None));
        assert_eq!(asm.phase(), ReadPhase::Body { len: 5, filled: 0 });
        assert_eq!(asm.window().len(), 5);

        let msg = feed(&mut asm, b"hello").unwrap().unwrap();
        assert_eq!(msg.body(), b"hello");
        assert_eq!(asm.phase(), ReadPhase::Header { filled: 0 });
    }

    #[test]
    fn test_assembler_handles_split_reads() {
        let mut asm = FrameAssembler::new();
        assert_eq!(feed(&mut asm, b"00"), Ok(None));
        assert_eq!(asm.phase(), ReadPhase::Header { filled: 2 });
        assert_eq!(asm.window().len(), 2);
        assert_eq!(feed(&mut asm, b"05"), Ok(None));

        assert_eq!(feed(&mut asm, b"hel"), Ok(None));
        assert_eq!(asm.phase(), ReadPhase::Body { len: 5, filled: 3 });
        let msg = feed(&mut asm, b"lo").unwrap().unwrap();
        assert_eq!(msg.body(), b"hello");
    }

    #[test]
    fn test_assembler_zero_length_body() {
        let mut asm = FrameAssembler::new();
        let msg = feed(&mut asm, b"0000").unwrap().unwrap();
        assert!(msg.is_empty());
        assert_eq!(asm.phase(), ReadPhase::Header { filled: 0 });
    }

    #[test]
    fn test_assembler_rejects_bad_header() {
        let mut asm = FrameAssembler::new();
        assert_eq!(feed(&mut asm, b"12ab"), Err(FrameError::BadHeader));
    }

    #[test]
    fn test_assembler_rejects_oversized_header() {
        let mut asm = FrameAssembler::new();
        assert_eq!(feed(&mut asm, b"9999"), Err(FrameError::BodyTooLarge(9999)));
    }

    #[test]
    fn test_queue_preserves_delivery_order() {
        let queue = OutboundQueue::new();
        let m1 = Message::new("first").unwrap();
        let m2 = Message::new("second").unwrap();
        queue.deliver(&m1);
        queue.deliver(&m2);

        let (head, written) = queue.head().unwrap();
        assert_eq!(&head[..], &m1.encode()[..]);
        assert_eq!(written, 0);

        queue.advance(head.len());
        let (head, written) = queue.head().unwrap();
        assert_eq!(&head[..], &m2.encode()[..]);
        assert_eq!(written, 0);

        queue.advance(head.len());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_tracks_partial_writes() {
        let queue = OutboundQueue::new();
        queue.deliver(&Message::new("hello").unwrap());

        queue.advance(4);
        let (head, written) = queue.head().unwrap();
        assert_eq!(&head[..], b"0005hello");
        assert_eq!(written, 4);

        queue.advance(5);
        assert!(queue.head().is_none());
        assert!(queue.is_empty());
    }
}
