//! NDJSON streaming of live run events.
//!
//! A session subscribes to every event category on the bus, then checks that
//! the run exists. It relays events and heartbeats as newline-terminated JSON
//! and always finishes with exactly one `end` line unless the client leaves
//! first. An unknown run gets `error`, a best-effort `summary`, then `end`.
//! A run whose row turns terminal mid-stream is replayed from storage.

mod messages;
mod session;

pub use messages::*;
pub use session::{open_stream, run_session, StreamContext, StreamOutcome, StreamRequest};
