//! Wire protocol and document model for graphpad collaboration.
//!
//! This matches the graphpad-server protocol exactly: JSON text frames over
//! WebSocket, discriminated by a `type` field. The server treats page, node
//! and edge payloads as opaque JSON; only the handful of fields the command
//! handlers touch are modeled as struct fields, everything else round-trips
//! through flattened maps.

pub mod command;
pub mod document;
pub mod envelope;
pub mod messages;

pub use command::{Command, CommandKind, ObjectType};
pub use document::{AppState, GraphPage, Id};
pub use envelope::{CompressedBlob, CompressionMethod};
pub use messages::{ClientMsg, Cursor, JoinIntent, PresenceEntry, RoomSummary, ServerMsg};
