//! graphpad-server: WebSocket relay server for collaborative graph documents.
//!
//! Features:
//! - Rooms keyed by an unguessable 32-char hex token; the token is the
//!   only access credential
//! - One authoritative in-memory document per room, mutated by a stream of
//!   client commands and rebroadcast to every peer (sender included, as ack)
//! - Command batches buffered per room and flushed on size or time,
//!   sorted by client timestamp (last writer wins)
//! - 1 Hz presence heartbeats carrying cursors and the room's id high-water
//!   mark; silent clients are disconnected by a missed-heartbeat watchdog
//! - Periodic LZ4-compressed snapshots to SQLite; rooms re-hydrate from the
//!   newest snapshot on first join after a restart
//!
//! Protocol: JSON text frames over WebSocket, discriminated by `type`
//! (see the graphpad-proto crate).

pub mod buffer;
pub mod client;
pub mod compress;
pub mod config;
pub mod db;
pub mod error;
pub mod net;
pub mod room;
pub mod sched;
pub mod server;
pub mod state;

pub use config::Config;
pub use error::{ErrorKind, RelayError};
pub use server::CollabServer;

/// Milliseconds since the Unix epoch, the timestamp unit used throughout
/// the wire protocol and the database.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
