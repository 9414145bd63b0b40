//! Records shared by the chat engine and the development backend.

pub mod api;
pub mod models;

pub use models::{
    ChatSummary, ConversationId, CreatedAt, MessageKind, SenderIdentity, ViewMessage, WireMessage,
};
