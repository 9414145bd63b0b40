use serde_json::Value;
use tracing::{debug, warn};

use castline_types::{SenderIdentity, WireMessage};

use crate::error::{ChatError, Result};

/// The locally signed-in user, as far as the session store knows.
///
/// An unknown viewer is legal: every message then resolves to "not mine".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewerIdentity {
    backend_id: Option<i64>,
}

impl ViewerIdentity {
    pub fn new(backend_id: i64) -> Self {
        Self {
            backend_id: Some(backend_id),
        }
    }

    pub fn unknown() -> Self {
        Self::default()
    }

    /// Reads the stored `user` record (`{"id": 7, ...}`). Missing or corrupt
    /// records yield an unknown viewer.
    pub fn from_stored_user(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::unknown();
        };

        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!("Stored user record is not JSON: {}", e);
                return Self::unknown();
            }
        };

        let backend_id = match value.get("id") {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };

        if backend_id.is_none() {
            warn!("Stored user record has no usable id");
        }
        Self { backend_id }
    }

    pub fn backend_id(&self) -> Option<i64> {
        self.backend_id
    }

    /// String handle form of the viewer, `u{id}`.
    pub fn handle(&self) -> Option<String> {
        self.backend_id.map(|id| format!("u{}", id))
    }
}

/// Decides whether `msg` was written by `viewer`.
///
/// Fails only with [`ChatError::IdentityAmbiguous`] when the message names no
/// sender at all.
pub fn resolve(msg: &WireMessage, viewer: &ViewerIdentity) -> Result<bool> {
    match &msg.sender {
        SenderIdentity::Numeric(id) => Ok(viewer.backend_id == Some(*id)),
        SenderIdentity::Handle(handle) => Ok(viewer.handle().as_deref() == Some(handle.as_str())),
        SenderIdentity::Unknown => Err(ChatError::IdentityAmbiguous {
            message_id: msg.id.clone(),
        }),
    }
}

/// [`resolve`] with the safe default: ambiguous messages are not ours.
pub fn is_authored_by_viewer(msg: &WireMessage, viewer: &ViewerIdentity) -> bool {
    resolve(msg, viewer).unwrap_or_else(|e| {
        debug!("{}; treating as not authored by viewer", e);
        false
    })
}
