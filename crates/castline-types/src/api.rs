use serde::{Deserialize, Serialize};

use crate::models::{ChatSummary, ConversationId, MessageKind, WireMessage};

// -- JWT Claims --

/// Bearer token claims. `sub` is the numeric backend id of the user, which is
/// also what the backend stamps on messages as `senderBackendId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    #[serde(default)]
    pub name: String,
    pub exp: usize,
}

// -- Messages --

/// Body of `GET /conversations/{id}/messages`.
///
/// `messages` stays optional so a body without the array can be told apart
/// from an empty conversation.
#[derive(Debug, Serialize, Deserialize)]
pub struct FetchMessagesResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub messages: Option<Vec<WireMessage>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
    #[serde(default)]
    pub kind: MessageKind,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

// -- Matches --

/// One approved campaign/model pairing; every pairing owns a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovedMatch {
    pub id: i64,
    pub model_id: i64,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApprovedMatchesResponse {
    pub success: bool,
    #[serde(default)]
    pub campaigns: Vec<ApprovedMatch>,
}

impl From<ApprovedMatch> for ChatSummary {
    fn from(m: ApprovedMatch) -> Self {
        Self {
            conversation_id: ConversationId::for_match(m.id, m.model_id),
            campaign_id: m.id,
            model_name: m.model_name,
            title: m.title,
            avatar_url: m.avatar_url,
            city: m.city,
        }
    }
}
