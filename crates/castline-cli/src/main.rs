use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use castline_chat::optimistic::is_placeholder_id;
use castline_chat::{
    ChatConfig, ChatHandle, ChatSession, ChatSnapshot, ChatTransport, FileStore, HttpTransport,
    SessionContext, SessionOptions,
};
use castline_types::{ConversationId, ViewMessage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Logs go to stderr so they don't interleave with the transcript
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "castline_chat=info,castline_cli=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = ChatConfig::from_env()?;
    let store = FileStore::open(&config.store_path)?;
    let mut ctx = SessionContext::load(&store)?;
    if ctx.credential.is_none() {
        warn!("No token in {}, requests will be unauthenticated", config.store_path.display());
    }

    let transport = HttpTransport::connect(
        &config.api_base_url,
        config.mock_api_url.as_deref(),
        ctx.credential.clone(),
        config.request_timeout,
    )
    .await?;
    info!("Using backend {}", transport.base_url());

    let conversation = match std::env::args().nth(1) {
        Some(raw) => ConversationId::new(raw).context("conversation id must not be blank")?,
        None => {
            let summaries = transport.list_conversations().await.unwrap_or_else(|e| {
                warn!("Could not list conversations: {}", e);
                Vec::new()
            });
            for summary in &summaries {
                eprintln!("  {}  {} with {}", summary.conversation_id, summary.title, summary.model_name);
            }
            ctx.initial_conversation(&summaries)
                .context("no conversation to open, pass its id as the first argument")?
        }
    };
    ctx.remember_conversation(&store, &conversation)?;

    let session = ChatSession::start(
        Arc::new(transport),
        ctx.viewer.clone(),
        SessionOptions::from(&config),
    );
    session.open(conversation)?;

    let mut transcript = Transcript::default();
    let mut snapshots = session.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                transcript.render(&snapshot);
            }
            line = lines.next_line() => match line? {
                Some(text) if text.trim().is_empty() => {}
                Some(text) => spawn_send(session.handle(), text),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.stop().await;
    Ok(())
}

fn spawn_send(handle: ChatHandle, text: String) {
    tokio::spawn(async move {
        if let Err(e) = handle.send(text).await {
            eprintln!("message not sent: {}", e);
        }
    });
}

/// Append-only rendering of snapshots: each logical message is printed once.
#[derive(Default)]
struct Transcript {
    printed: HashSet<String>,
    /// Placeholder id -> text of sends printed while still pending.
    sending: Vec<(String, String)>,
    title: Option<String>,
    error: Option<String>,
}

impl Transcript {
    fn render(&mut self, snapshot: &ChatSnapshot) {
        if let Some(e) = self.error_change(snapshot) {
            eprintln!("sync failed: {}", e);
        }
        for line in self.lines(snapshot) {
            println!("{}", line);
        }
    }

    fn error_change(&mut self, snapshot: &ChatSnapshot) -> Option<String> {
        let error = snapshot.last_error.as_ref().map(|e| e.to_string());
        if error == self.error {
            return None;
        }
        self.error = error.clone();
        error
    }

    /// New stdout lines for `snapshot`.
    fn lines(&mut self, snapshot: &ChatSnapshot) -> Vec<String> {
        let mut out = Vec::new();

        if snapshot.title.is_some() && snapshot.title != self.title {
            self.title = snapshot.title.clone();
            if let Some(title) = &self.title {
                out.push(format!("== {} ==", title));
            }
        }

        // A placeholder leaves the snapshot in the same update that brings in
        // its server record, so those texts must not be printed again.
        let present: HashSet<&str> = snapshot.messages.iter().map(|m| m.id.as_str()).collect();
        let mut settled = Vec::new();
        self.sending.retain(|(id, text)| {
            let pending = present.contains(id.as_str());
            if !pending {
                settled.push(text.clone());
            }
            pending
        });

        for message in &snapshot.messages {
            if !self.printed.insert(message.id.clone()) {
                continue;
            }
            if is_placeholder_id(&message.id) {
                self.sending.push((message.id.clone(), message.text.clone()));
            } else if message.is_me {
                if let Some(pos) = settled.iter().position(|text| *text == message.text) {
                    settled.remove(pos);
                    continue;
                }
            }
            out.push(line(message));
        }

        out
    }
}

fn line(message: &ViewMessage) -> String {
    let who = if message.is_me { "me" } else { "them" };
    let status = if is_placeholder_id(&message.id) { " (sending)" } else { "" };
    format!("[{}] {}: {}{}", message.timestamp, who, message.text, status)
}
