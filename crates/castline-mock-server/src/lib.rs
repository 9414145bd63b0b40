//! In-memory development backend for the chat REST contract.
//!
//! Serves the same routes as the production backend so the client can be run
//! and tested without it. Nothing is persisted.

pub mod auth;
pub mod messages;

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::get,
};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use castline_types::api::ApprovedMatch;
use castline_types::{ConversationId, CreatedAt, MessageKind, SenderIdentity, WireMessage};

pub use auth::mint_token;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub jwt_secret: String,
    pub conversations: RwLock<HashMap<ConversationId, Conversation>>,
    pub matches: RwLock<Vec<ApprovedMatch>>,
}

#[derive(Debug, Clone, Default)]
pub struct Conversation {
    pub title: Option<String>,
    pub messages: Vec<WireMessage>,
}

impl AppStateInner {
    pub fn new(jwt_secret: impl Into<String>) -> AppState {
        Arc::new(Self {
            jwt_secret: jwt_secret.into(),
            conversations: RwLock::new(HashMap::new()),
            matches: RwLock::new(Vec::new()),
        })
    }

    /// Registers an approved match and opens its conversation.
    pub async fn add_match(&self, approved: ApprovedMatch) -> ConversationId {
        let id = ConversationId::for_match(approved.id, approved.model_id);
        self.conversations
            .write()
            .await
            .entry(id.clone())
            .or_default()
            .title = Some(approved.title.clone());
        self.matches.write().await.push(approved);
        id
    }

    /// Appends a message directly, bypassing the HTTP layer.
    pub async fn push_message(&self, conversation: &ConversationId, message: WireMessage) {
        self.conversations
            .write()
            .await
            .entry(conversation.clone())
            .or_default()
            .messages
            .push(message);
    }
}

/// Loads a demo match between agency user 1 and model user 2.
pub async fn seed(state: &AppStateInner) -> ConversationId {
    let id = state
        .add_match(ApprovedMatch {
            id: 1,
            model_id: 2,
            model_name: "Giulia".into(),
            title: "Spring campaign".into(),
            avatar_url: None,
            city: Some("Milano".into()),
        })
        .await;

    state
        .push_message(
            &id,
            WireMessage {
                id: "seed-1".into(),
                text: "Hi! We saw your profile and would love to talk about the spring shoot.".into(),
                sender: SenderIdentity::Numeric(1),
                kind: MessageKind::Text,
                attachment_url: None,
                created_at: Some(CreatedAt::Structured {
                    seconds: chrono::Utc::now().timestamp() - 600,
                    nanoseconds: 0,
                }),
                read_by: vec!["u1".into()],
            },
        )
        .await;
    state
        .push_message(
            &id,
            WireMessage {
                id: "seed-2".into(),
                text: "Thanks for reaching out, happy to discuss.".into(),
                sender: SenderIdentity::Handle("u2".into()),
                kind: MessageKind::Text,
                attachment_url: None,
                created_at: Some(CreatedAt::Iso((chrono::Utc::now() - chrono::Duration::minutes(5)).to_rfc3339())),
                read_by: vec![],
            },
        )
        .await;

    id
}

pub fn router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route(
            "/conversations/{conversation_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route("/agency/approved-matches", get(messages::approved_matches))
        .layer(middleware::from_fn_with_state(state.clone(), auth::require_auth))
        .with_state(state);

    Router::new()
        .route("/ping", get(|| async { "pong" }))
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    info!("Mock chat backend listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}
