//! Coarse-grained document mutation commands.
//!
//! Every command carries the shared envelope (`commandId`, `clientId`,
//! `timestamp`) plus a `type`-tagged payload. The dotted type names
//! (`page.add`, `object.modify`, ...) are the wire contract; an unknown type
//! fails deserialization and is rejected at the message boundary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::document::{GraphPage, Id};

/// A single timestamped mutation, as sent by clients and rebroadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub command_id: String,
    pub client_id: String,
    /// Client wall-clock milliseconds. Flushes sort by this; ties keep
    /// arrival order.
    pub timestamp: i64,
    #[serde(flatten)]
    pub kind: CommandKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Node,
    Edge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CommandKind {
    /// Append a full page. No uniqueness check: last writer wins.
    #[serde(rename = "page.add", rename_all = "camelCase")]
    PageAdd { page_id: Id, data: GraphPage },
    #[serde(rename = "page.delete", rename_all = "camelCase")]
    PageDelete { page_id: Id },
    /// Shallow-merge `data` into the page, preserving untouched fields.
    #[serde(rename = "page.modify", rename_all = "camelCase")]
    PageModify { page_id: Id, data: Map<String, Value> },
    /// Reorder by listed ids; unmentioned pages keep their relative order
    /// and move to the end.
    #[serde(rename = "page.reorder", rename_all = "camelCase")]
    PageReorder { page_order: Vec<Id> },
    #[serde(rename = "object.add", rename_all = "camelCase")]
    ObjectAdd {
        page_id: Id,
        object_type: ObjectType,
        object_id: Id,
        data: Value,
    },
    #[serde(rename = "object.delete", rename_all = "camelCase")]
    ObjectDelete { page_id: Id, object_id: Id },
    /// Whole-value replace in whichever map holds the id; silent no-op
    /// when absent.
    #[serde(rename = "object.modify", rename_all = "camelCase")]
    ObjectModify {
        page_id: Id,
        object_id: Id,
        data: Value,
    },
}
