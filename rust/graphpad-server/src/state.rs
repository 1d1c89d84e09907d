//! Authoritative in-memory document replica and command interpreter.
//!
//! A room's state starts uninitialized; the first `upload_state` (or a
//! snapshot rehydration) installs a document. Commands mutate the replica in
//! place and never perform I/O. A dirty flag tracks whether anything changed
//! since the snapshot pump last looked.

use graphpad_proto::{AppState, Command, CommandKind, ObjectType};
use serde_json::Value;

use crate::error::{ErrorKind, RelayError, Result};

#[derive(Debug, Default)]
pub struct RoomState {
    doc: Option<AppState>,
    dirty: bool,
}

/// Outcome of one dirty-flag consume.
#[derive(Debug, Clone)]
pub struct StateChanges {
    pub data: Option<AppState>,
    pub has_changed: bool,
}

impl RoomState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.doc.is_some()
    }

    /// Uploads are always admissible.
    pub fn can_set_state(&self) -> bool {
        true
    }

    /// Downloads require an uploaded document.
    pub fn can_get_state(&self) -> bool {
        self.is_initialized()
    }

    /// Replace the document wholesale. Any previous document is discarded.
    pub fn set_state(&mut self, doc: AppState) {
        self.doc = Some(doc);
        self.dirty = true;
    }

    /// Callers must have checked [`can_get_state`](Self::can_get_state).
    pub fn get_state(&self) -> Result<&AppState> {
        self.doc.as_ref().ok_or_else(|| {
            RelayError::new(
                ErrorKind::Internal,
                "state requested before initialization",
            )
        })
    }

    /// Current document plus whether it changed since the last consume.
    /// Resets the dirty flag.
    pub fn consume_changes(&mut self) -> StateChanges {
        let has_changed = self.dirty;
        self.dirty = false;
        StateChanges {
            data: self.doc.clone(),
            has_changed,
        }
    }

    /// Advance the id high-water mark from a client heartbeat. The stored
    /// value never decreases: `max(current, incoming)` when both parse as
    /// integers, otherwise the incoming value only replaces a non-numeric
    /// current one.
    pub fn update_id_counter(&mut self, incoming: &str) {
        let Some(doc) = &mut self.doc else { return };
        let advance = match (doc.id_gen.parse::<u64>(), incoming.parse::<u64>()) {
            (Ok(current), Ok(new)) => new > current,
            (Err(_), _) => true,
            (Ok(_), Err(_)) => false,
        };
        if advance {
            doc.id_gen = incoming.to_string();
        }
        self.dirty = true;
    }

    /// `"0"` until a document exists.
    pub fn id_counter(&self) -> String {
        self.doc
            .as_ref()
            .map(|d| d.id_gen.clone())
            .unwrap_or_else(|| "0".to_string())
    }

    /// Apply a batch in order. Fails up front when uninitialized. The batch
    /// is transactional: a failing command leaves the replica exactly as it
    /// was, so the replica never advances past what gets broadcast.
    pub fn apply_commands(&mut self, commands: &[Command]) -> Result<()> {
        let Some(doc) = &self.doc else {
            return Err(RelayError::new(
                ErrorKind::StateNotInitialized,
                "commands received before any client uploaded state",
            ));
        };
        if commands.is_empty() {
            return Ok(());
        }
        let mut working = doc.clone();
        for command in commands {
            Self::apply_to(&mut working, command)
                .map_err(|err| err.with_context("command_id", &command.command_id))?;
        }
        self.doc = Some(working);
        self.dirty = true;
        Ok(())
    }

    pub fn apply_command(&mut self, command: &Command) -> Result<()> {
        let doc = self.doc.as_mut().ok_or_else(|| {
            RelayError::new(
                ErrorKind::StateNotInitialized,
                "command received before any client uploaded state",
            )
        })?;
        Self::apply_to(doc, command)
    }

    fn apply_to(doc: &mut AppState, command: &Command) -> Result<()> {
        match &command.kind {
            CommandKind::PageAdd { data, .. } => {
                // no uniqueness check: last writer wins on duplicate ids
                doc.pages.push(data.clone());
            }
            CommandKind::PageDelete { page_id } => {
                if let Some(index) = doc.pages.iter().position(|p| &p.id == page_id) {
                    doc.pages.remove(index);
                }
            }
            CommandKind::PageModify { page_id, data } => {
                if let Some(page) = doc.page_mut(page_id) {
                    for (key, value) in data {
                        match key.as_str() {
                            "id" => {
                                if let Value::String(id) = value {
                                    page.id = id.clone();
                                }
                            }
                            "nodes" => {
                                if let Value::Object(nodes) = value {
                                    page.nodes = nodes.clone();
                                }
                            }
                            "edges" => {
                                if let Value::Object(edges) = value {
                                    page.edges = edges.clone();
                                }
                            }
                            _ => {
                                page.extra.insert(key.clone(), value.clone());
                            }
                        }
                    }
                }
            }
            CommandKind::PageReorder { page_order } => {
                let mut remaining = std::mem::take(&mut doc.pages);
                let mut reordered = Vec::with_capacity(remaining.len());
                for page_id in page_order {
                    if let Some(index) = remaining.iter().position(|p| &p.id == page_id) {
                        reordered.push(remaining.remove(index));
                    }
                }
                // unmentioned pages keep their relative order at the end
                reordered.extend(remaining);
                doc.pages = reordered;
            }
            CommandKind::ObjectAdd {
                page_id,
                object_type,
                object_id,
                data,
            } => {
                let page = doc.page_mut(page_id).ok_or_else(|| {
                    RelayError::new(
                        ErrorKind::InvalidMessage,
                        format!("object.add targets unknown page {page_id}"),
                    )
                    .with_context("page_id", page_id)
                })?;
                let map = match object_type {
                    ObjectType::Node => &mut page.nodes,
                    ObjectType::Edge => &mut page.edges,
                };
                map.insert(object_id.clone(), data.clone());
            }
            CommandKind::ObjectDelete { page_id, object_id } => {
                // the server does not know which map holds the id
                if let Some(page) = doc.page_mut(page_id) {
                    page.nodes.remove(object_id);
                    page.edges.remove(object_id);
                }
            }
            CommandKind::ObjectModify {
                page_id,
                object_id,
                data,
            } => {
                if let Some(page) = doc.page_mut(page_id) {
                    if page.nodes.contains_key(object_id) {
                        page.nodes.insert(object_id.clone(), data.clone());
                    } else if page.edges.contains_key(object_id) {
                        page.edges.insert(object_id.clone(), data.clone());
                    }
                    // absent on both maps: silent no-op
                }
            }
        }
        Ok(())
    }
}
