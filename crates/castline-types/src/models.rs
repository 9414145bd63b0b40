use std::fmt;

use serde::{Deserialize, Serialize};

// -- Conversations --

/// Key of one server-held message log.
///
/// Approved matches map to `chat_{campaignId}_{modelId}`; any other non-blank
/// string handed out by the backend is accepted verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Returns `None` for blank identifiers, which the backend never issues.
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            None
        } else {
            Some(Self(raw))
        }
    }

    pub fn for_match(campaign_id: i64, model_id: i64) -> Self {
        Self(format!("chat_{}_{}", campaign_id, model_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry of the conversation list shown next to the chat pane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub conversation_id: ConversationId,
    pub campaign_id: i64,
    pub model_name: String,
    pub title: String,
    pub avatar_url: Option<String>,
    pub city: Option<String>,
}

// -- Wire messages --

/// Who wrote a message, as far as the backend tells us.
///
/// Older backend revisions send a numeric `senderBackendId`, newer ones a
/// `senderUid` handle of the form `u{id}`, and some records carry neither.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderIdentity {
    Numeric(i64),
    Handle(String),
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    /// Kinds introduced by newer backends; rendered like text.
    #[serde(other)]
    Other,
}

/// Server creation time in whichever encoding the backend used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CreatedAt {
    /// Firestore-style `{seconds, nanoseconds}` pair.
    Structured {
        #[serde(alias = "_seconds")]
        seconds: i64,
        #[serde(default, alias = "_nanoseconds")]
        nanoseconds: u32,
    },
    Iso(String),
    EpochMillis(i64),
    /// Anything else. Kept so one odd record never fails a whole fetch.
    Unrecognized(serde_json::Value),
}

/// A message record exactly as the backend returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireMessageRepr", into = "WireMessageRepr")]
pub struct WireMessage {
    pub id: String,
    pub text: String,
    pub sender: SenderIdentity,
    pub kind: MessageKind,
    pub attachment_url: Option<String>,
    pub created_at: Option<CreatedAt>,
    pub read_by: Vec<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessageRepr {
    id: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sender_backend_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sender_uid: Option<String>,
    #[serde(default, rename = "type", alias = "kind")]
    kind: MessageKind,
    #[serde(default)]
    attachment_url: Option<String>,
    #[serde(default)]
    created_at: Option<CreatedAt>,
    #[serde(default)]
    read_by: Option<Vec<String>>,
}

impl From<WireMessageRepr> for WireMessage {
    fn from(repr: WireMessageRepr) -> Self {
        // Numeric id wins when a record carries both.
        let sender = match (repr.sender_backend_id, repr.sender_uid) {
            (Some(id), _) => SenderIdentity::Numeric(id),
            (None, Some(uid)) => SenderIdentity::Handle(uid),
            (None, None) => SenderIdentity::Unknown,
        };

        Self {
            id: repr.id,
            text: repr.text.unwrap_or_default(),
            sender,
            kind: repr.kind,
            attachment_url: repr.attachment_url.filter(|url| !url.is_empty()),
            created_at: repr.created_at,
            read_by: repr.read_by.unwrap_or_default(),
        }
    }
}

impl From<WireMessage> for WireMessageRepr {
    fn from(msg: WireMessage) -> Self {
        let (sender_backend_id, sender_uid) = match msg.sender {
            SenderIdentity::Numeric(id) => (Some(id), Some(format!("u{}", id))),
            SenderIdentity::Handle(uid) => (None, Some(uid)),
            SenderIdentity::Unknown => (None, None),
        };

        Self {
            id: msg.id,
            text: Some(msg.text),
            sender_backend_id,
            sender_uid,
            kind: msg.kind,
            attachment_url: msg.attachment_url,
            created_at: msg.created_at,
            read_by: Some(msg.read_by),
        }
    }
}

// -- View messages --

/// Display-ready message row. `timestamp` is already formatted and is never
/// parsed again downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewMessage {
    pub id: String,
    pub text: String,
    pub is_me: bool,
    pub timestamp: String,
}
