//! Client <-> server frames (JSON text over WebSocket).

use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::document::AppState;
use crate::envelope::CompressedBlob;

/// Presence cursor, in document coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
}

/// What a joining client wants from the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinIntent {
    /// Receive the current document in `room_joined.stateData`.
    Download,
    /// Join without a document transfer; an `upload_state` follows.
    Upload,
}

/// One row of `welcome.availableRooms`. Deliberately open for expansion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room_id: String,
}

/// One row of `heartbeat_response.clients`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub client_id: String,
    pub cursor: Cursor,
}

/// Client -> server frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    #[serde(rename_all = "camelCase")]
    CreateRoom { server_protocol_version: u32 },
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        server_protocol_version: u32,
        intent: JoinIntent,
    },
    CommandBatch { commands: Vec<Command> },
    #[serde(rename_all = "camelCase")]
    Heartbeat {
        cursor: Cursor,
        local_id_counter: String,
    },
    #[serde(rename_all = "camelCase")]
    UploadState { state_data: CompressedBlob },
}

/// Server -> client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    #[serde(rename_all = "camelCase")]
    Welcome {
        server_protocol_version: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        available_rooms: Option<Vec<RoomSummary>>,
    },
    /// `state_data` is present iff the join intent was download.
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_id: String,
        client_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        state_data: Option<AppState>,
    },
    CommandBatch { commands: Vec<Command> },
    #[serde(rename_all = "camelCase")]
    HeartbeatResponse {
        clients: Vec<PresenceEntry>,
        highest_id_counter: String,
    },
    /// Reserved for server-initiated state pushes.
    #[serde(rename_all = "camelCase")]
    StateSnapshot { state_data: CompressedBlob },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl ClientMsg {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl ServerMsg {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
