//! Connection demultiplexing and room routing.
//!
//! The server owns the registries: live rooms, connected clients, and the
//! client -> room binding (read on every message, written on join/leave).
//! A connection starts in the welcome state with no client identity; a
//! successful create/join mints a client and binds it to exactly one room.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use graphpad_proto::{ClientMsg, CompressedBlob, Cursor, JoinIntent, RoomSummary, ServerMsg};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use rand::Rng;

use crate::client::{Client, MessageSink};
use crate::compress::Compression;
use crate::config::Config;
use crate::db::Database;
use crate::error::{ErrorKind, RelayError, Result, report};
use crate::now_ms;
use crate::room::Room;
use crate::sched::{TimerHandle, safe_interval};

/// One duplex connection, from accept to socket close. Carries no client
/// identity until a create/join succeeds.
pub struct Connection {
    sink: Arc<dyn MessageSink>,
    client_id: Mutex<Option<String>>,
}

impl Connection {
    pub fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self {
            sink,
            client_id: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> Option<String> {
        self.client_id.lock().clone()
    }

    fn send(&self, msg: &ServerMsg) {
        if !self.sink.is_open() {
            return;
        }
        if let Err(err) = self.sink.send_text(msg.to_json()) {
            report(&err);
        }
    }
}

pub struct CollabServer {
    config: Arc<Config>,
    compression: Arc<Compression>,
    db: Arc<Database>,
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    clients: Mutex<HashMap<String, Arc<Client>>>,
    client_rooms: RwLock<HashMap<String, String>>,
    maintenance: Mutex<Option<TimerHandle>>,
}

impl CollabServer {
    pub fn new(
        config: Arc<Config>,
        db: Arc<Database>,
        compression: Arc<Compression>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            compression,
            db,
            rooms: Mutex::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            client_rooms: RwLock::new(HashMap::new()),
            maintenance: Mutex::new(None),
        })
    }

    /// Start the periodic database sweep (command-log pruning plus snapshot
    /// retention).
    pub fn start_maintenance(self: &Arc<Self>) {
        let target = Arc::downgrade(self);
        let handle = safe_interval(
            "db-cleanup",
            Duration::from_millis(self.config.db_cleanup_interval_ms),
            move || {
                let Some(server) = target.upgrade() else {
                    return Ok(());
                };
                let stats = server
                    .db
                    .cleanup(server.config.command_max_age_ms as i64, now_ms())?;
                if stats.commands_removed > 0 || stats.snapshots_removed > 0 {
                    info!(
                        "db cleanup removed {} command(s), {} snapshot(s)",
                        stats.commands_removed, stats.snapshots_removed
                    );
                }
                Ok(())
            },
        );
        *self.maintenance.lock() = Some(handle);
    }

    /// Greet a fresh connection with the protocol version and the rooms it
    /// could join.
    pub fn handle_connection(&self, conn: &Connection) {
        conn.send(&ServerMsg::Welcome {
            server_protocol_version: self.config.protocol_version,
            available_rooms: Some(self.advertised_rooms()),
        });
    }

    /// Parse and dispatch one inbound frame; client-visible failures go back
    /// as `error` frames on the same connection. A panicking handler is
    /// reported like any other internal error and leaves the connection up.
    pub fn handle_message(self: &Arc<Self>, conn: &Connection, raw: &str) {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.dispatch(conn, raw)
        }))
        .unwrap_or_else(|panic| {
            Err(RelayError::new(
                ErrorKind::Internal,
                format!(
                    "message handler panicked: {}",
                    crate::error::panic_message(panic.as_ref())
                ),
            ))
        });
        if let Err(err) = outcome {
            if let Some(frame) = report(&err) {
                conn.send(&frame);
            }
        }
    }

    pub fn handle_disconnection(&self, conn: &Connection) {
        let Some(client_id) = conn.client_id.lock().take() else {
            return;
        };
        let client = self.clients.lock().get(&client_id).cloned();
        match client {
            // disconnect() fires on_disconnect, which lands in remove_client
            Some(client) => client.disconnect(),
            None => self.remove_client(&client_id),
        }
    }

    fn dispatch(self: &Arc<Self>, conn: &Connection, raw: &str) -> Result<()> {
        let msg = ClientMsg::from_json(raw).map_err(|e| {
            RelayError::new(ErrorKind::InvalidMessage, "frame is not a recognized message")
                .with_source(e)
        })?;
        match msg {
            ClientMsg::CreateRoom {
                server_protocol_version,
            } => self.handle_create_room(conn, server_protocol_version),
            ClientMsg::JoinRoom {
                room_id,
                server_protocol_version,
                intent,
            } => self.handle_join_room(conn, &room_id, server_protocol_version, intent),
            ClientMsg::CommandBatch { commands } => {
                let (client_id, room) = self.room_of(conn)?;
                room.handle_command_batch(&client_id, commands)
            }
            ClientMsg::Heartbeat {
                cursor,
                local_id_counter,
            } => self.handle_heartbeat(conn, cursor, local_id_counter),
            ClientMsg::UploadState { state_data } => self.handle_upload_state(conn, &state_data),
        }
    }

    fn handle_create_room(
        self: &Arc<Self>,
        conn: &Connection,
        version: u32,
    ) -> Result<()> {
        self.check_version(version)?;
        self.ensure_not_joined(conn)?;

        let room_id = mint_room_id();
        self.db.upsert_room(&room_id, now_ms())?;
        let room = Room::new(
            room_id.clone(),
            self.config.clone(),
            self.compression.clone(),
            self.db.clone(),
        );
        {
            let mut rooms = self.rooms.lock();
            if rooms.len() >= self.config.max_rooms {
                drop(rooms);
                room.dispose();
                return Err(RelayError::new(
                    ErrorKind::RoomFull,
                    format!("server already hosts {} rooms", self.config.max_rooms),
                ));
            }
            rooms.insert(room_id.clone(), room.clone());
        }
        info!("[room:{room_id}] created");
        self.join_room_internal(conn, &room, version, JoinIntent::Upload)
    }

    fn handle_join_room(
        self: &Arc<Self>,
        conn: &Connection,
        room_id: &str,
        version: u32,
        intent: JoinIntent,
    ) -> Result<()> {
        self.check_version(version)?;
        self.ensure_not_joined(conn)?;
        let room = self.lookup_or_revive(room_id)?;
        self.db.upsert_room(room_id, now_ms())?;
        self.join_room_internal(conn, &room, version, intent)
    }

    /// Find a live room, or re-create one known to the database so its
    /// constructor can re-hydrate the newest snapshot.
    fn lookup_or_revive(&self, room_id: &str) -> Result<Arc<Room>> {
        if let Some(room) = self.rooms.lock().get(room_id) {
            return Ok(room.clone());
        }
        if self.db.get_room(room_id)?.is_none() {
            return Err(RelayError::new(
                ErrorKind::RoomNotFound,
                format!("room {room_id} does not exist"),
            )
            .with_context("room_id", room_id));
        }
        let revived = Room::new(
            room_id.to_string(),
            self.config.clone(),
            self.compression.clone(),
            self.db.clone(),
        );
        let mut rooms = self.rooms.lock();
        if rooms.len() >= self.config.max_rooms && !rooms.contains_key(room_id) {
            drop(rooms);
            revived.dispose();
            return Err(RelayError::new(
                ErrorKind::RoomFull,
                format!("server already hosts {} rooms", self.config.max_rooms),
            ));
        }
        // a concurrent join may have revived it first; keep that one
        Ok(rooms
            .entry(room_id.to_string())
            .or_insert(revived)
            .clone())
    }

    fn join_room_internal(
        self: &Arc<Self>,
        conn: &Connection,
        room: &Arc<Room>,
        version: u32,
        intent: JoinIntent,
    ) -> Result<()> {
        let client_id = room.mint_client_id();
        let target: Weak<CollabServer> = Arc::downgrade(self);
        let client = Client::new(
            client_id.clone(),
            version,
            conn.sink.clone(),
            self.config.heartbeat_timeout_ms,
            self.config.max_missed_heartbeats,
            move |id| {
                if let Some(server) = target.upgrade() {
                    server.remove_client(id);
                }
            },
        );

        let joined = room.add_client(client.clone(), intent)?;
        client.start_watchdog();
        self.clients.lock().insert(client_id.clone(), client);
        self.client_rooms
            .write()
            .insert(client_id.clone(), room.room_id().to_string());
        *conn.client_id.lock() = Some(client_id);
        conn.send(&joined);
        Ok(())
    }

    fn handle_heartbeat(
        &self,
        conn: &Connection,
        cursor: Cursor,
        local_id_counter: String,
    ) -> Result<()> {
        let (client_id, room) = self.room_of(conn)?;
        let client = self.clients.lock().get(&client_id).cloned().ok_or_else(|| {
            RelayError::new(ErrorKind::InvalidMessage, "heartbeat from unknown client")
                .with_context("client_id", &client_id)
        })?;
        client.update_from_heartbeat(cursor, local_id_counter);
        room.handle_heartbeat(&client);
        Ok(())
    }

    fn handle_upload_state(&self, conn: &Connection, state_data: &CompressedBlob) -> Result<()> {
        let (client_id, room) = self.room_of(conn)?;
        let doc = self
            .compression
            .unpack(state_data)
            .map_err(|e| e.with_context("client_id", &client_id))?;
        if doc.version != self.config.protocol_version {
            return Err(RelayError::new(
                ErrorKind::VersionMismatch,
                format!(
                    "uploaded document version {} does not match server version {}",
                    doc.version, self.config.protocol_version
                ),
            )
            .with_context("client_id", &client_id));
        }
        room.set_room_state(&client_id, doc);
        Ok(())
    }

    /// Resolve the connection's client and its room; fails when the
    /// connection never joined.
    fn room_of(&self, conn: &Connection) -> Result<(String, Arc<Room>)> {
        let client_id = conn.client_id().ok_or_else(|| {
            RelayError::new(
                ErrorKind::InvalidMessage,
                "message requires joining a room first",
            )
        })?;
        let room_id = self
            .client_rooms
            .read()
            .get(&client_id)
            .cloned()
            .ok_or_else(|| {
                RelayError::new(ErrorKind::InvalidMessage, "client is not bound to a room")
                    .with_context("client_id", &client_id)
            })?;
        let room = self.rooms.lock().get(&room_id).cloned().ok_or_else(|| {
            RelayError::new(ErrorKind::RoomNotFound, format!("room {room_id} is gone"))
                .with_context("room_id", &room_id)
        })?;
        Ok((client_id, room))
    }

    /// Unregister a client everywhere and reclaim its room if that left the
    /// room empty.
    pub fn remove_client(&self, client_id: &str) {
        let client = self.clients.lock().remove(client_id);
        let room_id = self.client_rooms.write().remove(client_id);

        if let Some(room_id) = room_id {
            let room = self.rooms.lock().get(&room_id).cloned();
            if let Some(room) = room {
                room.remove_client(client_id);
                let emptied = {
                    let mut rooms = self.rooms.lock();
                    if room.client_count() == 0 {
                        rooms.remove(&room_id);
                        true
                    } else {
                        false
                    }
                };
                if emptied {
                    room.dispose();
                    info!("[room:{room_id}] empty, removed from registry");
                }
            }
        }

        if let Some(client) = client {
            // idempotent; covers removal paths that did not start at the
            // client's own watchdog
            client.disconnect();
        } else {
            debug!("[client:{client_id}] already unregistered");
        }
    }

    pub fn is_version_compatible(&self, version: u32) -> bool {
        // exact match today; may widen to a range
        version == self.config.protocol_version
    }

    fn check_version(&self, version: u32) -> Result<()> {
        if self.is_version_compatible(version) {
            return Ok(());
        }
        Err(RelayError::new(
            ErrorKind::VersionMismatch,
            format!(
                "client protocol version {version} is not supported (server speaks {})",
                self.config.protocol_version
            ),
        ))
    }

    fn ensure_not_joined(&self, conn: &Connection) -> Result<()> {
        match conn.client_id() {
            Some(client_id) => Err(RelayError::new(
                ErrorKind::InvalidMessage,
                "connection already joined a room",
            )
            .with_context("client_id", client_id)),
            None => Ok(()),
        }
    }

    /// Room ids shown in `welcome`: everything live plus everything the
    /// database still knows about.
    fn advertised_rooms(&self) -> Vec<RoomSummary> {
        let mut ids: Vec<String> = self.rooms.lock().keys().cloned().collect();
        match self.db.list_rooms() {
            Ok(rows) => {
                for row in rows {
                    if !ids.contains(&row.room_id) {
                        ids.push(row.room_id);
                    }
                }
            }
            Err(err) => {
                report(&err);
            }
        }
        ids.into_iter()
            .map(|room_id| RoomSummary { room_id })
            .collect()
    }

    pub fn find_room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.lock().get(room_id).cloned()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Stop timers and tear down every room (final dirty snapshots are
    /// written on dispose).
    pub fn shutdown(&self) {
        info!("shutting down");
        self.maintenance.lock().take();
        let rooms: Vec<Arc<Room>> = self.rooms.lock().drain().map(|(_, room)| room).collect();
        self.client_rooms.write().clear();
        self.clients.lock().clear();
        for room in rooms {
            room.dispose();
        }
    }
}

fn mint_room_id() -> String {
    // 16 bytes from a CSPRNG, lowercase hex; the token is the credential
    format!("{:032x}", rand::rng().random::<u128>())
}
