use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::{debug, info};
use uuid::Uuid;

use castline_types::api::{
    ApprovedMatchesResponse, Claims, FetchMessagesResponse, SendMessageRequest, SendMessageResponse,
};
use castline_types::{ConversationId, CreatedAt, SenderIdentity, WireMessage};

use crate::AppState;

/// Full log of a conversation, oldest first. Unknown conversations are empty,
/// not an error.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<ConversationId>,
    Extension(claims): Extension<Claims>,
) -> impl IntoResponse {
    let conversations = state.conversations.read().await;
    let conversation = conversations.get(&conversation_id);

    debug!(
        "User {} fetched {} ({} messages)",
        claims.sub,
        conversation_id,
        conversation.map_or(0, |c| c.messages.len())
    );

    Json(FetchMessagesResponse {
        success: true,
        title: conversation.and_then(|c| c.title.clone()),
        messages: Some(conversation.map(|c| c.messages.clone()).unwrap_or_default()),
    })
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<ConversationId>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> impl IntoResponse {
    if req.text.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(SendMessageResponse {
                ok: false,
                message_id: None,
            }),
        );
    }

    let message_id = Uuid::new_v4().to_string();
    let message = WireMessage {
        id: message_id.clone(),
        text: req.text,
        sender: SenderIdentity::Numeric(claims.sub),
        kind: req.kind,
        attachment_url: None,
        created_at: Some(CreatedAt::Iso(chrono::Utc::now().to_rfc3339())),
        read_by: vec![format!("u{}", claims.sub)],
    };
    state.push_message(&conversation_id, message).await;

    info!("User {} posted {} to {}", claims.sub, message_id, conversation_id);

    (
        StatusCode::CREATED,
        Json(SendMessageResponse {
            ok: true,
            message_id: Some(message_id),
        }),
    )
}

pub async fn approved_matches(
    State(state): State<AppState>,
    Extension(_claims): Extension<Claims>,
) -> impl IntoResponse {
    Json(ApprovedMatchesResponse {
        success: true,
        campaigns: state.matches.read().await.clone(),
    })
}
