//! Broadcast room: participant registry plus bounded history.
//!
//! The room is the only state shared across connections. It never
//! performs I/O: `deliver` on a participant may only enqueue the
//! message and at most start one write, so join/leave/deliver are
//! short, non-blocking critical sections.

use crate::history::History;
use crate::protocol::Message;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Process-unique identity of a room participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticipantId(u64);

static NEXT_PARTICIPANT_ID: AtomicU64 = AtomicU64::new(1);

impl ParticipantId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        ParticipantId(NEXT_PARTICIPANT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Capability to receive broadcast messages.
///
/// Implementations must not block in `deliver`.
pub trait Participant: Send + Sync {
    /// Stable identity; membership is keyed by it.
    fn id(&self) -> ParticipantId;

    /// Hand the participant a message for transmission.
    fn deliver(&self, msg: &Message);
}

/// The shared broadcast domain.
pub struct Room {
    members: HashMap<ParticipantId, Arc<dyn Participant>>,
    history: History,
}

impl Room {
    /// Create an empty room retaining `history_capacity` messages.
    pub fn new(history_capacity: usize) -> Self {
        Room {
            members: HashMap::new(),
            history: History::new(history_capacity),
        }
    }

    /// Add a participant and replay retained history to it, oldest
    /// first. Re-joining an already-present id is a no-op and does not
    /// replay twice.
    pub fn join(&mut self, participant: Arc<dyn Participant>) {
        let id = participant.id();
        if self.members.contains_key(&id) {
            return;
        }

        for msg in self.history.snapshot() {
            participant.deliver(&msg);
        }
        self.members.insert(id, participant);

        debug!(participant = %id, members = self.members.len(), "Participant joined");
    }

    /// Remove a participant; no-op when absent.
    pub fn leave(&mut self, id: ParticipantId) {
        if self.members.remove(&id).is_some() {
            debug!(participant = %id, members = self.members.len(), "Participant left");
        }
    }

    /// Record a message and fan it out.
    ///
    /// Every member present at the start of the call receives exactly
    /// one delivery, the sender included; iteration order across
    /// members is unspecified.
    pub fn deliver(&mut self, msg: Message) {
        self.history.push(msg.clone());

        let members: Vec<Arc<dyn Participant>> = self.members.values().cloned().collect();
        for member in members {
            member.deliver(&msg);
        }
    }

    /// Whether `id` is currently a member.
    pub fn contains(&self, id: ParticipantId) -> bool {
        self.members.contains_key(&id)
    }

    /// Current member count.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the room has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Retained history, oldest first.
    pub fn history(&self) -> Vec<Message> {
        self.history.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every delivered message.
    struct Recorder {
        id: ParticipantId,
        seen: Mutex<Vec<Message>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Recorder {
                id: ParticipantId::next(),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<Message> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl Participant for Recorder {
        fn id(&self) -> ParticipantId {
            self.id
        }

        fn deliver(&self, msg: &Message) {
            self.seen.lock().unwrap().push(msg.clone());
        }
    }

    fn msg(text: &str) -> Message {
        Message::new(text.to_string()).unwrap()
    }

    #[test]
    fn test_join_replays_history_in_order() {
        let mut room = Room::new(100);
        room.deliver(msg("m1"));
        room.deliver(msg("m2"));
        room.deliver(msg("m3"));

        let joiner = Recorder::new();
        room.join(joiner.clone());

        assert_eq!(joiner.seen(), vec![msg("m1"), msg("m2"), msg("m3")]);
    }

    #[test]
    fn test_history_replay_precedes_new_traffic() {
        let mut room = Room::new(100);
        room.deliver(msg("old"));

        let joiner = Recorder::new();
        room.join(joiner.clone());
        room.deliver(msg("new"));

        assert_eq!(joiner.seen(), vec![msg("old"), msg("new")]);
    }

    #[test]
    fn test_rejoin_is_noop() {
        let mut room = Room::new(100);
        room.deliver(msg("m1"));

        let member = Recorder::new();
        room.join(member.clone());
        room.join(member.clone());

        assert_eq!(room.len(), 1);
        // History is not replayed a second time.
        assert_eq!(member.seen(), vec![msg("m1")]);
    }

    #[test]
    fn test_fanout_reaches_every_member_once() {
        let mut room = Room::new(100);
        let a = Recorder::new();
        let b = Recorder::new();
        let c = Recorder::new();
        room.join(a.clone());
        room.join(b.clone());
        room.join(c.clone());

        room.deliver(msg("broadcast"));

        for member in [&a, &b, &c] {
            assert_eq!(member.seen(), vec![msg("broadcast")]);
        }
    }

    #[test]
    fn test_sender_receives_own_message() {
        // The sender is an ordinary member: echo-back is intentional.
        let mut room = Room::new(100);
        let sender = Recorder::new();
        room.join(sender.clone());

        room.deliver(msg("mine"));

        assert_eq!(sender.seen(), vec![msg("mine")]);
    }

    #[test]
    fn test_leave_stops_delivery() {
        let mut room = Room::new(100);
        let stayer = Recorder::new();
        let leaver = Recorder::new();
        room.join(stayer.clone());
        room.join(leaver.clone());

        room.deliver(msg("before"));
        room.leave(leaver.id());
        room.deliver(msg("after"));

        assert!(!room.contains(leaver.id()));
        assert_eq!(leaver.seen(), vec![msg("before")]);
        assert_eq!(stayer.seen(), vec![msg("before"), msg("after")]);
    }

    #[test]
    fn test_leave_absent_is_noop() {
        let mut room = Room::new(100);
        room.leave(ParticipantId::next());
        assert!(room.is_empty());
    }

    #[test]
    fn test_deliver_to_empty_room_still_records_history() {
        let mut room = Room::new(100);
        room.deliver(msg("unheard"));
        assert_eq!(room.history(), vec![msg("unheard")]);
    }
}
