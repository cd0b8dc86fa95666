//! Readiness-loop runtime.
//!
//! Alternative to the default executor backend: a single thread, a
//! single `Poll`, and explicit per-connection state machines. All
//! I/O completions for every connection dispatch on the same thread,
//! so the room is mutated without a lock.
//!
//! Shared abstractions:
//! - `Connection`: per-connection read phase + outbound queue
//! - `EventLoop`: accept/read/flush dispatch

mod connection;
mod event_loop;

pub(crate) use connection::Connection;

use crate::config::Config;
use std::io;

/// Run the relay on the readiness loop.
pub fn run(config: Config) -> io::Result<()> {
    event_loop::EventLoop::bind(&config)?.run()
}
