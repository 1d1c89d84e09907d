//! Per-connection client state.
//!
//! A client exists from the moment a create/join succeeds until its socket
//! closes or its heartbeat watchdog gives up. Outbound delivery goes through
//! the [`MessageSink`] abstraction so the core never touches the WebSocket
//! directly; writes are gated on an observed open state and send failures
//! are reported, never propagated.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use graphpad_proto::{Cursor, ServerMsg};
use log::{info, warn};
use parking_lot::Mutex;

use crate::error::{RelayError, report};
use crate::now_ms;
use crate::sched::{TimerHandle, safe_timeout};

/// Abstract outbound half of a duplex message channel.
pub trait MessageSink: Send + Sync {
    fn send_text(&self, text: String) -> Result<(), RelayError>;
    fn is_open(&self) -> bool;
    fn close(&self);
}

pub struct Client {
    client_id: String,
    protocol_version: u32,
    sink: Arc<dyn MessageSink>,
    heartbeat_timeout_ms: u64,
    max_missed_heartbeats: u32,
    presence: Mutex<Presence>,
    missed_heartbeats: AtomicU32,
    watchdog: Mutex<Option<TimerHandle>>,
    disconnected: AtomicBool,
    on_disconnect: Box<dyn Fn(&str) + Send + Sync>,
}

#[derive(Debug, Clone)]
struct Presence {
    cursor: Cursor,
    local_id_counter: String,
    last_heartbeat_ms: i64,
}

impl Client {
    pub fn new(
        client_id: String,
        protocol_version: u32,
        sink: Arc<dyn MessageSink>,
        heartbeat_timeout_ms: u64,
        max_missed_heartbeats: u32,
        on_disconnect: impl Fn(&str) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            client_id,
            protocol_version,
            sink,
            heartbeat_timeout_ms,
            max_missed_heartbeats,
            presence: Mutex::new(Presence {
                cursor: Cursor::default(),
                local_id_counter: "0".to_string(),
                last_heartbeat_ms: now_ms(),
            }),
            missed_heartbeats: AtomicU32::new(0),
            watchdog: Mutex::new(None),
            disconnected: AtomicBool::new(false),
            on_disconnect: Box::new(on_disconnect),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    pub fn cursor(&self) -> Cursor {
        self.presence.lock().cursor
    }

    pub fn local_id_counter(&self) -> String {
        self.presence.lock().local_id_counter.clone()
    }

    pub fn missed_heartbeats(&self) -> u32 {
        self.missed_heartbeats.load(Ordering::SeqCst)
    }

    /// Wall-clock of the last heartbeat (or of construction).
    pub fn last_heartbeat_ms(&self) -> i64 {
        self.presence.lock().last_heartbeat_ms
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Arm the missed-heartbeat watchdog. Called once after the client is
    /// admitted to a room.
    pub fn start_watchdog(self: &Arc<Self>) {
        self.arm_watchdog();
    }

    fn arm_watchdog(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = safe_timeout(
            format!("heartbeat-watchdog:{}", self.client_id),
            Duration::from_millis(self.heartbeat_timeout_ms),
            move || {
                if let Some(client) = weak.upgrade() {
                    client.watchdog_fired();
                }
                Ok(())
            },
        );
        *self.watchdog.lock() = Some(handle);
    }

    fn watchdog_fired(self: &Arc<Self>) {
        if self.is_disconnected() {
            return;
        }
        let missed = self.missed_heartbeats.fetch_add(1, Ordering::SeqCst) + 1;
        if missed >= self.max_missed_heartbeats {
            warn!(
                "[client:{}] missed {missed} heartbeats, disconnecting",
                self.client_id
            );
            self.disconnect();
        } else {
            self.arm_watchdog();
        }
    }

    /// Record cursor and id counter from a heartbeat, reset the missed
    /// counter, and re-arm the watchdog.
    pub fn update_from_heartbeat(self: &Arc<Self>, cursor: Cursor, local_id_counter: String) {
        {
            let mut presence = self.presence.lock();
            presence.cursor = cursor;
            presence.local_id_counter = local_id_counter;
            presence.last_heartbeat_ms = now_ms();
        }
        self.missed_heartbeats.store(0, Ordering::SeqCst);
        self.arm_watchdog();
    }

    pub fn send_message(&self, msg: &ServerMsg) {
        self.send_raw(msg.to_json());
    }

    /// Write on the outbound only while it is open; failures are reported
    /// and swallowed.
    pub fn send_raw(&self, text: String) {
        if !self.sink.is_open() {
            return;
        }
        if let Err(err) = self.sink.send_text(text) {
            report(&err.with_context("client_id", &self.client_id));
        }
    }

    /// Idempotent teardown: clear the watchdog, close the outbound, notify
    /// the owner once.
    pub fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.watchdog.lock().take();
        self.sink.close();
        info!("[client:{}] disconnected", self.client_id);
        (self.on_disconnect)(&self.client_id);
    }
}
