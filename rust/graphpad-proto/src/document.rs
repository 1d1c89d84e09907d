//! Thin document model.
//!
//! A room's document is a list of pages, each holding a node map and an edge
//! map keyed by opaque string ids. The server never inspects node or edge
//! payloads; fields it does not know about (`currentPageId`, `view`, tool
//! mode, selection, ...) are preserved verbatim in the flattened `extra` maps
//! so clients get back exactly what they uploaded.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque entity identifier minted by clients.
pub type Id = String;

/// The authoritative per-room document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    /// Protocol version the uploading client spoke. Checked on ingest.
    pub version: u32,
    /// High-water mark for client-side id generation, as a decimal string.
    pub id_gen: String,
    #[serde(default)]
    pub pages: Vec<GraphPage>,
    /// Everything else (`currentPageId` and friends) is stored, never read.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One page of the document: two keyed object maps plus opaque metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphPage {
    pub id: Id,
    #[serde(default)]
    pub nodes: Map<String, Value>,
    #[serde(default)]
    pub edges: Map<String, Value>,
    /// `name`, `icon`, `view`, client-local selection state, ...
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AppState {
    pub fn page(&self, page_id: &str) -> Option<&GraphPage> {
        self.pages.iter().find(|p| p.id == page_id)
    }

    pub fn page_mut(&mut self, page_id: &str) -> Option<&mut GraphPage> {
        self.pages.iter_mut().find(|p| p.id == page_id)
    }
}
