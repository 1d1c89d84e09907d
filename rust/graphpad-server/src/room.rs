//! A collaboration room: one authoritative document, its clients, the
//! command buffer, and the snapshot/heartbeat pumps.
//!
//! Rooms are ephemeral in memory; the server disposes a room when its last
//! client leaves. The constructor eagerly re-hydrates from the newest stored
//! snapshot so a room can be rejoined after a restart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use graphpad_proto::{AppState, Command, JoinIntent, PresenceEntry, ServerMsg};
use log::{debug, info};
use parking_lot::Mutex;

use crate::buffer::CommandBuffer;
use crate::client::Client;
use crate::compress::Compression;
use crate::config::Config;
use crate::db::Database;
use crate::error::{ErrorKind, RelayError, Result, report};
use crate::now_ms;
use crate::sched::{TimerHandle, safe_interval};
use crate::state::RoomState;

pub struct Room {
    room_id: String,
    config: Arc<Config>,
    compression: Arc<Compression>,
    db: Arc<Database>,
    state: Mutex<RoomState>,
    clients: Mutex<HashMap<String, Arc<Client>>>,
    next_client_number: AtomicU64,
    buffer: Arc<CommandBuffer>,
    timers: Mutex<Vec<TimerHandle>>,
    disposed: AtomicBool,
}

impl Room {
    pub fn new(
        room_id: String,
        config: Arc<Config>,
        compression: Arc<Compression>,
        db: Arc<Database>,
    ) -> Arc<Self> {
        Self::with_state(room_id, config, compression, db, RoomState::new())
    }

    /// Build a room around an existing state (tests inject pre-initialized
    /// replicas this way).
    pub fn with_state(
        room_id: String,
        config: Arc<Config>,
        compression: Arc<Compression>,
        db: Arc<Database>,
        state: RoomState,
    ) -> Arc<Self> {
        let room = Arc::new_cyclic(|weak: &Weak<Room>| {
            let flush_target = weak.clone();
            let buffer = CommandBuffer::new(
                config.buffer_ms,
                config.max_command_batch,
                move |batch| {
                    if let Some(room) = flush_target.upgrade() {
                        room.handle_command_flush(batch);
                    }
                },
            );
            Room {
                room_id,
                config,
                compression,
                db,
                state: Mutex::new(state),
                clients: Mutex::new(HashMap::new()),
                next_client_number: AtomicU64::new(1),
                buffer,
                timers: Mutex::new(Vec::new()),
                disposed: AtomicBool::new(false),
            }
        });
        room.rehydrate();
        room.start_timers();
        room
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().is_initialized()
    }

    /// Short human-readable ids: `u1`, `u2`, ...
    pub fn mint_client_id(&self) -> String {
        format!("u{}", self.next_client_number.fetch_add(1, Ordering::SeqCst))
    }

    /// Load the newest persisted snapshot into the replica, if one exists.
    /// Failures are reported and leave the room uninitialized.
    fn rehydrate(&self) {
        let blob = match self.db.load_snapshot(&self.room_id) {
            Ok(Some(blob)) => blob,
            Ok(None) => return,
            Err(err) => {
                report(&err.with_context("room_id", &self.room_id));
                return;
            }
        };
        match self.compression.unpack(&blob) {
            Ok(doc) => {
                info!("[room:{}] re-hydrated from snapshot", self.room_id);
                self.state.lock().set_state(doc);
            }
            Err(err) => {
                report(&err.with_context("room_id", &self.room_id));
            }
        }
    }

    fn start_timers(self: &Arc<Self>) {
        let snapshot_target = Arc::downgrade(self);
        let snapshot = safe_interval(
            format!("snapshot:{}", self.room_id),
            Duration::from_millis(self.config.snapshot_interval_ms),
            move || match snapshot_target.upgrade() {
                Some(room) => room
                    .write_snapshot()
                    .map_err(|e| e.with_context("room_id", room.room_id())),
                None => Ok(()),
            },
        );

        let heartbeat_target = Arc::downgrade(self);
        let heartbeat = safe_interval(
            format!("heartbeat:{}", self.room_id),
            Duration::from_millis(self.config.heartbeat_interval_ms),
            move || {
                if let Some(room) = heartbeat_target.upgrade() {
                    room.heartbeat_tick();
                }
                Ok(())
            },
        );

        self.timers.lock().extend([snapshot, heartbeat]);
    }

    /// Admit a client. The returned `room_joined` frame carries the current
    /// document iff the intent was download.
    pub fn add_client(&self, client: Arc<Client>, intent: JoinIntent) -> Result<ServerMsg> {
        let mut clients = self.clients.lock();
        if clients.len() >= self.config.max_clients_per_room {
            return Err(RelayError::new(
                ErrorKind::RoomFull,
                format!(
                    "room {} already has {} clients",
                    self.room_id,
                    clients.len()
                ),
            )
            .with_context("room_id", &self.room_id));
        }

        let state_data = {
            let state = self.state.lock();
            match intent {
                JoinIntent::Download => {
                    if !state.can_get_state() {
                        return Err(RelayError::new(
                            ErrorKind::StateNotInitialized,
                            "room has no document to download yet",
                        )
                        .with_context("room_id", &self.room_id));
                    }
                    Some(state.get_state()?.clone())
                }
                JoinIntent::Upload => {
                    if !state.can_set_state() {
                        return Err(RelayError::new(
                            ErrorKind::UploadNotAuthorized,
                            "room does not accept uploads",
                        )
                        .with_context("room_id", &self.room_id));
                    }
                    None
                }
            }
        };

        let client_id = client.client_id().to_string();
        clients.insert(client_id.clone(), client);
        info!(
            "[room:{}] client {client_id} joined ({intent:?}), {} client(s)",
            self.room_id,
            clients.len()
        );
        Ok(ServerMsg::RoomJoined {
            room_id: self.room_id.clone(),
            client_id,
            state_data,
        })
    }

    pub fn remove_client(&self, client_id: &str) -> bool {
        let removed = self.clients.lock().remove(client_id).is_some();
        if removed {
            info!(
                "[room:{}] client {client_id} left, {} client(s) remaining",
                self.room_id,
                self.client_count()
            );
        }
        removed
    }

    /// Apply a batch to the replica and enqueue it for broadcast. Batches
    /// from clients not in the room are dropped silently. On an application
    /// failure nothing is applied or enqueued and the error propagates so
    /// the sender gets told; the connection stays up.
    pub fn handle_command_batch(&self, client_id: &str, commands: Vec<Command>) -> Result<()> {
        if !self.clients.lock().contains_key(client_id) {
            debug!(
                "[room:{}] dropping batch from unknown client {client_id}",
                self.room_id
            );
            return Ok(());
        }
        self.state.lock().apply_commands(&commands).map_err(|err| {
            err.with_context("room_id", &self.room_id)
                .with_context("client_id", client_id)
        })?;
        self.buffer.add_commands(commands);
        Ok(())
    }

    /// Fold a client's reported id counter into the room high-water mark.
    pub fn handle_heartbeat(&self, client: &Arc<Client>) {
        self.state
            .lock()
            .update_id_counter(&client.local_id_counter());
    }

    /// The id high-water mark echoed in heartbeat responses.
    pub fn highest_id_counter(&self) -> String {
        self.state.lock().id_counter()
    }

    /// Install an uploaded document and persist it right away.
    pub fn set_room_state(&self, client_id: &str, doc: AppState) {
        info!(
            "[room:{}] client {client_id} uploaded state ({} pages)",
            self.room_id,
            doc.pages.len()
        );
        self.state.lock().set_state(doc);
        if let Err(err) = self.write_snapshot() {
            report(&err.with_context("room_id", &self.room_id));
        }
    }

    pub fn broadcast(&self, msg: &ServerMsg, exclude: Option<&str>) {
        let text = msg.to_json();
        let targets: Vec<Arc<Client>> = self
            .clients
            .lock()
            .values()
            .filter(|c| exclude != Some(c.client_id()))
            .cloned()
            .collect();
        for client in targets {
            client.send_raw(text.clone());
        }
    }

    /// Flush callback: every peer gets the sorted batch, the originator
    /// included — the echo doubles as its acknowledgment and fixes the
    /// global order it observed.
    fn handle_command_flush(&self, batch: Vec<Command>) {
        debug!(
            "[room:{}] flushing {} command(s)",
            self.room_id,
            batch.len()
        );
        if self.config.command_log {
            if let Err(err) = self.db.save_commands(&self.room_id, &batch) {
                report(&err.with_context("room_id", &self.room_id));
            }
        }
        self.broadcast(&ServerMsg::CommandBatch { commands: batch }, None);
    }

    /// Snapshot pump body: persist iff the replica changed since last look.
    fn write_snapshot(&self) -> Result<()> {
        let changes = self.state.lock().consume_changes();
        if !changes.has_changed {
            return Ok(());
        }
        let Some(doc) = changes.data else {
            return Ok(());
        };
        let blob = self.compression.pack(&doc)?;
        self.db
            .save_snapshot(&self.room_id, &blob, now_ms(), self.client_count())?;
        debug!(
            "[room:{}] snapshot persisted ({} bytes, {})",
            self.room_id,
            blob.data.len(),
            blob.method
        );
        Ok(())
    }

    /// Heartbeat pump body: presence sweep plus the id high-water mark.
    fn heartbeat_tick(&self) {
        let clients: Vec<PresenceEntry> = self
            .clients
            .lock()
            .values()
            .map(|c| PresenceEntry {
                client_id: c.client_id().to_string(),
                cursor: c.cursor(),
            })
            .collect();
        if clients.is_empty() {
            return;
        }
        let highest_id_counter = self.state.lock().id_counter();
        self.broadcast(
            &ServerMsg::HeartbeatResponse {
                clients,
                highest_id_counter,
            },
            None,
        );
    }

    /// Tear the room down: stop timers, drop the buffer's pending commands,
    /// persist a final snapshot if dirty, disconnect everyone.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[room:{}] disposing", self.room_id);
        for timer in self.timers.lock().drain(..) {
            timer.cancel();
        }
        self.buffer.dispose();
        if let Err(err) = self.write_snapshot() {
            report(&err.with_context("room_id", &self.room_id));
        }
        let clients: Vec<Arc<Client>> = self.clients.lock().drain().map(|(_, c)| c).collect();
        for client in clients {
            client.disconnect();
        }
    }
}
