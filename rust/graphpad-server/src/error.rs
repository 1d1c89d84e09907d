//! Error taxonomy and the central reporting boundary.
//!
//! Every failure in the server maps onto a closed set of kinds, each with a
//! wire code. Errors carry structured context and a client-visible flag;
//! [`report`] logs one structured line (code, message, context, cause chain)
//! and yields the `error` frame for the originating socket when the failure
//! is something the client should see.

use std::collections::BTreeMap;
use std::error::Error as StdError;

use graphpad_proto::ServerMsg;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

/// The closed set of failure kinds, with their wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    VersionMismatch,
    RoomNotFound,
    RoomFull,
    InvalidMessage,
    Internal,
    UploadNotAuthorized,
    StateNotInitialized,
    Timeout,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::VersionMismatch => "VERSION_MISMATCH",
            ErrorKind::RoomNotFound => "ROOM_NOT_FOUND",
            ErrorKind::RoomFull => "ROOM_FULL",
            ErrorKind::InvalidMessage => "INVALID_MESSAGE",
            ErrorKind::Internal => "INTERNAL_ERROR",
            ErrorKind::UploadNotAuthorized => "UPLOAD_NOT_AUTHORIZED",
            ErrorKind::StateNotInitialized => "STATE_NOT_INITIALIZED",
            ErrorKind::Timeout => "TIMEOUT",
        }
    }

    /// Internal failures stay server-side unless explicitly surfaced;
    /// everything else describes a request the client made.
    fn default_visibility(self) -> bool {
        !matches!(self, ErrorKind::Internal)
    }
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct RelayError {
    pub kind: ErrorKind,
    pub message: String,
    pub context: BTreeMap<&'static str, String>,
    pub client_visible: bool,
    #[source]
    pub source: Option<Box<dyn StdError + Send + Sync>>,
}

impl RelayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: BTreeMap::new(),
            client_visible: kind.default_visibility(),
            source: None,
        }
    }

    /// Wrap an unexpected failure as `INTERNAL_ERROR`, cause preserved,
    /// not client visible.
    pub fn internal(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::new(ErrorKind::Internal, message).with_source(source)
    }

    pub fn with_context(mut self, key: &'static str, value: impl ToString) -> Self {
        self.context.insert(key, value.to_string());
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn visible(mut self, visible: bool) -> Self {
        self.client_visible = visible;
        self
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Log a structured line for the error and, when it is client visible,
/// return the `error` frame the caller should send on the originating
/// socket.
pub fn report(err: &RelayError) -> Option<ServerMsg> {
    let mut line = format!("{}: {}", err.kind.code(), err.message);
    if !err.context.is_empty() {
        let ctx: Vec<String> = err
            .context
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        line.push_str(&format!(" [{}]", ctx.join(", ")));
    }
    let mut cause: Option<&(dyn StdError + 'static)> = err.source.as_deref().map(|s| s as _);
    while let Some(c) = cause {
        line.push_str(&format!(" <- {c}"));
        cause = c.source();
    }
    log::error!("{line}");

    err.client_visible.then(|| ServerMsg::Error {
        message: err.message.clone(),
        code: Some(err.kind.code().to_string()),
    })
}
