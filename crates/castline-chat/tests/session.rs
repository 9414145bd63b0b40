use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;

use castline_chat::optimistic::is_placeholder_id;
use castline_chat::{
    ChatError, ChatSession, ChatSnapshot, ChatTransport, ClockStyle, DisplayClock, FetchedLog,
    Result, SessionOptions, SyncState, ViewerIdentity,
};
use castline_types::{
    ChatSummary, ConversationId, CreatedAt, MessageKind, SenderIdentity, ViewMessage, WireMessage,
};

const VIEWER: i64 = 7;
const OTHER: i64 = 8;

enum SendBehaviour {
    /// Store the message and answer with the next id.
    Accept,
    /// Answer with `id` once `release` flips to true. Stores nothing.
    Hold {
        id: String,
        release: watch::Receiver<bool>,
    },
    Fail(ChatError),
}

#[derive(Default)]
struct FakeTransport {
    logs: Mutex<HashMap<ConversationId, FetchedLog>>,
    gates: Mutex<HashMap<ConversationId, watch::Receiver<bool>>>,
    fetch_failure: Mutex<Option<ChatError>>,
    sends: Mutex<VecDeque<SendBehaviour>>,
    fetches: AtomicUsize,
    next_id: AtomicUsize,
}

impl FakeTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicUsize::new(100),
            ..Default::default()
        })
    }

    fn push(&self, conversation: &ConversationId, message: WireMessage) {
        self.logs
            .lock()
            .unwrap()
            .entry(conversation.clone())
            .or_default()
            .messages
            .push(message);
    }

    fn set_title(&self, conversation: &ConversationId, title: &str) {
        self.logs
            .lock()
            .unwrap()
            .entry(conversation.clone())
            .or_default()
            .title = Some(title.to_string());
    }

    /// Fetches of `conversation` block until the returned sender sends `true`.
    fn gate(&self, conversation: &ConversationId) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(false);
        self.gates.lock().unwrap().insert(conversation.clone(), rx);
        tx
    }

    fn fail_fetches(&self, error: Option<ChatError>) {
        *self.fetch_failure.lock().unwrap() = error;
    }

    fn queue_send(&self, behaviour: SendBehaviour) {
        self.sends.lock().unwrap().push_back(behaviour);
    }

    fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl ChatTransport for FakeTransport {
    async fn fetch_log(&self, conversation: &ConversationId) -> Result<FetchedLog> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let gate = self.gates.lock().unwrap().get(conversation).cloned();
        if let Some(mut gate) = gate {
            while !*gate.borrow_and_update() {
                if gate.changed().await.is_err() {
                    break;
                }
            }
        }

        if let Some(e) = self.fetch_failure.lock().unwrap().clone() {
            return Err(e);
        }
        Ok(self
            .logs
            .lock()
            .unwrap()
            .get(conversation)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(&self, conversation: &ConversationId, text: &str) -> Result<String> {
        let behaviour = self
            .sends
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SendBehaviour::Accept);

        match behaviour {
            SendBehaviour::Accept => {
                let id = format!("m{}", self.next_id.fetch_add(1, Ordering::SeqCst));
                self.push(conversation, wire(&id, text, VIEWER));
                Ok(id)
            }
            SendBehaviour::Hold { id, mut release } => {
                while !*release.borrow_and_update() {
                    if release.changed().await.is_err() {
                        break;
                    }
                }
                Ok(id)
            }
            SendBehaviour::Fail(e) => Err(e),
        }
    }

    async fn list_conversations(&self) -> Result<Vec<ChatSummary>> {
        Ok(Vec::new())
    }
}

fn wire(id: &str, text: &str, sender: i64) -> WireMessage {
    WireMessage {
        id: id.into(),
        text: text.into(),
        sender: SenderIdentity::Numeric(sender),
        kind: MessageKind::Text,
        attachment_url: None,
        created_at: Some(CreatedAt::Iso("2024-01-01T10:00:00Z".into())),
        read_by: vec![],
    }
}

fn options() -> SessionOptions {
    SessionOptions::default()
        .with_poll_interval(Duration::from_millis(20))
        .with_request_timeout(Duration::from_secs(2))
        .with_clock(DisplayClock::utc(ClockStyle::TwelveHour))
}

fn start(transport: &Arc<FakeTransport>, options: SessionOptions) -> ChatSession {
    ChatSession::start(transport.clone(), ViewerIdentity::new(VIEWER), options)
}

fn chat(id: &str) -> ConversationId {
    ConversationId::new(id).unwrap()
}

async fn until(
    session: &ChatSession,
    mut condition: impl FnMut(&ChatSnapshot) -> bool,
) -> ChatSnapshot {
    let mut rx = session.subscribe();
    let snapshot = timeout(Duration::from_secs(5), rx.wait_for(|s| condition(s)))
        .await
        .expect("condition not reached in time")
        .expect("session ended")
        .clone();
    snapshot
}

fn texts(snapshot: &ChatSnapshot) -> Vec<&str> {
    snapshot.messages.iter().map(|m| m.text.as_str()).collect()
}

fn has_placeholder(snapshot: &ChatSnapshot) -> bool {
    snapshot.messages.iter().any(|m| is_placeholder_id(&m.id))
}

#[tokio::test]
async fn open_fetches_and_transcodes_log() {
    let transport = FakeTransport::new();
    let a = chat("chat_1_2");
    transport.set_title(&a, "Spring campaign");
    transport.push(&a, wire("m1", "hi", VIEWER));
    transport.push(
        &a,
        WireMessage {
            sender: SenderIdentity::Unknown,
            ..wire("m2", "who am I", OTHER)
        },
    );

    let session = start(&transport, options());
    assert_eq!(session.snapshot().state, SyncState::Idle);

    session.open(a.clone()).unwrap();
    let snapshot = until(&session, |s| s.state == SyncState::Synced).await;

    assert_eq!(snapshot.conversation, Some(a));
    assert_eq!(snapshot.title.as_deref(), Some("Spring campaign"));
    assert_eq!(
        snapshot.messages,
        vec![
            ViewMessage {
                id: "m1".into(),
                text: "hi".into(),
                is_me: true,
                timestamp: "10:00 AM".into(),
            },
            ViewMessage {
                id: "m2".into(),
                text: "who am I".into(),
                is_me: false,
                timestamp: "10:00 AM".into(),
            },
        ]
    );
    assert_eq!(snapshot.last_error, None);

    session.stop().await;
}

#[tokio::test]
async fn send_is_replaced_by_server_record() {
    let transport = FakeTransport::new();
    let a = chat("chat_1_2");
    transport.push(&a, wire("m1", "hi", OTHER));

    let session = start(&transport, options());
    session.open(a).unwrap();
    until(&session, |s| s.state == SyncState::Synced).await;

    let sent = session.send("hello").await.unwrap();
    assert_eq!(sent.id, "m100");
    assert_eq!(sent.text, "hello");
    assert!(sent.is_me);

    let snapshot = session.snapshot();
    assert!(!has_placeholder(&snapshot));
    assert_eq!(snapshot.messages.last().map(|m| m.id.as_str()), Some("m100"));

    // Once the log contains it, it is still shown exactly once.
    let polled_from = transport.fetch_count();
    until(&session, |_| transport.fetch_count() >= polled_from + 2).await;
    let snapshot = until(&session, |s| s.state == SyncState::Synced).await;
    assert_eq!(texts(&snapshot), vec!["hi", "hello"]);
    assert!(!has_placeholder(&snapshot));

    session.stop().await;
}

#[tokio::test]
async fn pending_send_is_not_duplicated_by_poll() {
    let transport = FakeTransport::new();
    let a = chat("chat_1_2");
    transport.push(&a, wire("m1", "hi", OTHER));
    let (release, release_rx) = watch::channel(false);
    transport.queue_send(SendBehaviour::Hold {
        id: "m99".into(),
        release: release_rx,
    });

    let session = start(&transport, options());
    session.open(a.clone()).unwrap();
    until(&session, |s| s.state == SyncState::Synced).await;

    let handle = session.handle();
    let send = tokio::spawn(async move { handle.send("hello").await });

    let snapshot = until(&session, has_placeholder).await;
    let pending = snapshot.messages.last().unwrap();
    assert!(pending.id.starts_with("tmp-"));
    assert_eq!(pending.text, "hello");
    assert!(pending.is_me);
    assert_eq!(texts(&snapshot), vec!["hi", "hello"]);

    // Server stores the message before its response arrives.
    transport.push(&a, wire("m99", "hello", VIEWER));
    let snapshot = until(&session, |s| s.messages.iter().any(|m| m.id == "m99")).await;
    assert_eq!(texts(&snapshot), vec!["hi", "hello"]);
    assert!(!has_placeholder(&snapshot));

    release.send(true).unwrap();
    let sent = send.await.unwrap().unwrap();
    assert_eq!(sent.id, "m99");

    let snapshot = session.snapshot();
    assert_eq!(texts(&snapshot), vec!["hi", "hello"]);
    assert!(!has_placeholder(&snapshot));

    session.stop().await;
}

#[tokio::test]
async fn failed_send_restores_previous_sequence() {
    let transport = FakeTransport::new();
    let a = chat("chat_1_2");
    transport.push(&a, wire("m1", "hi", OTHER));
    transport.queue_send(SendBehaviour::Fail(ChatError::Transport("connection reset".into())));

    let session = start(&transport, options());
    session.open(a).unwrap();
    let before = until(&session, |s| s.state == SyncState::Synced).await;

    let err = session.send("hello").await.unwrap_err();
    assert_eq!(err, ChatError::Transport("connection reset".into()));
    assert!(err.is_transport());
    assert_eq!(session.snapshot().messages, before.messages);

    session.stop().await;
}

#[tokio::test]
async fn rejected_send_is_reported() {
    let transport = FakeTransport::new();
    let a = chat("chat_1_2");
    transport.queue_send(SendBehaviour::Fail(ChatError::SendRejected("HTTP 403".into())));

    let session = start(&transport, options());
    session.open(a).unwrap();
    until(&session, |s| s.state == SyncState::Synced).await;

    let err = session.send("hello").await.unwrap_err();
    assert!(matches!(err, ChatError::SendRejected(_)));
    assert!(session.snapshot().messages.is_empty());

    // The next send goes through normally.
    let sent = session.send("hello again").await.unwrap();
    assert_eq!(sent.id, "m100");

    session.stop().await;
}

#[tokio::test]
async fn invalid_sends_never_reach_transport() {
    let transport = FakeTransport::new();
    let session = start(&transport, options());

    assert_eq!(
        session.send("hello").await.unwrap_err(),
        ChatError::NoActiveConversation
    );

    session.open(chat("chat_1_2")).unwrap();
    until(&session, |s| s.state == SyncState::Synced).await;
    assert_eq!(session.send("   ").await.unwrap_err(), ChatError::EmptyMessage);
    assert!(session.snapshot().messages.is_empty());
    assert!(transport.logs.lock().unwrap().values().all(|log| log.messages.is_empty()));

    session.stop().await;
}

#[tokio::test]
async fn fetch_failure_keeps_last_good_sequence() {
    let transport = FakeTransport::new();
    let a = chat("chat_1_2");
    transport.push(&a, wire("m1", "hi", OTHER));

    let session = start(&transport, options());
    session.open(a.clone()).unwrap();
    until(&session, |s| s.state == SyncState::Synced).await;

    transport.fail_fetches(Some(ChatError::Transport("offline".into())));
    let snapshot = until(&session, |s| s.last_error.is_some()).await;
    assert_eq!(texts(&snapshot), vec!["hi"]);
    assert_eq!(snapshot.state, SyncState::Synced);

    transport.fail_fetches(None);
    transport.push(&a, wire("m2", "still there?", OTHER));
    let snapshot = until(&session, |s| s.last_error.is_none() && s.messages.len() == 2).await;
    assert_eq!(texts(&snapshot), vec!["hi", "still there?"]);

    session.stop().await;
}

#[tokio::test]
async fn switching_conversation_clears_and_ignores_stale_response() {
    let transport = FakeTransport::new();
    let a = chat("chat_1_2");
    let b = chat("chat_3_4");
    transport.push(&a, wire("a1", "from A", OTHER));
    transport.push(&b, wire("b1", "from B", OTHER));
    let release_a = transport.gate(&a);
    let release_b = transport.gate(&b);

    let session = start(&transport, options());
    session.open(a).unwrap();
    until(&session, |s| s.state == SyncState::Loading).await;

    session.open(b.clone()).unwrap();
    let snapshot = until(&session, |s| s.conversation.as_ref() == Some(&b)).await;
    assert!(snapshot.messages.is_empty());
    assert_eq!(snapshot.state, SyncState::Loading);

    // A's response lands late and must not show up under B.
    release_a.send(true).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(session.snapshot().messages.is_empty());

    release_b.send(true).unwrap();
    let snapshot = until(&session, |s| s.state == SyncState::Synced).await;
    assert_eq!(snapshot.conversation, Some(b));
    assert_eq!(texts(&snapshot), vec!["from B"]);

    session.stop().await;
}

#[tokio::test]
async fn send_released_after_switch_does_not_touch_new_conversation() {
    let transport = FakeTransport::new();
    let a = chat("chat_1_2");
    let b = chat("chat_3_4");
    transport.push(&b, wire("b1", "from B", OTHER));
    let (release, release_rx) = watch::channel(false);
    transport.queue_send(SendBehaviour::Hold {
        id: "m42".into(),
        release: release_rx,
    });

    let session = start(&transport, options());
    session.open(a).unwrap();
    until(&session, |s| s.state == SyncState::Synced).await;

    let handle = session.handle();
    let send = tokio::spawn(async move { handle.send("for A").await });
    until(&session, has_placeholder).await;

    session.open(b.clone()).unwrap();
    until(&session, |s| s.conversation.as_ref() == Some(&b) && s.state == SyncState::Synced).await;

    release.send(true).unwrap();
    let sent = send.await.unwrap().unwrap();
    assert_eq!(sent.id, "m42");

    // The reply is sent after the completion was handled.
    let snapshot = session.snapshot();
    assert_eq!(snapshot.conversation, Some(b));
    assert_eq!(texts(&snapshot), vec!["from B"]);
    assert!(snapshot.messages.iter().all(|m| m.id != "m42"));

    session.stop().await;
}

#[tokio::test]
async fn switching_drops_previous_messages() {
    let transport = FakeTransport::new();
    let a = chat("chat_1_2");
    let b = chat("chat_3_4");
    transport.push(&a, wire("a1", "from A", OTHER));
    transport.push(&b, wire("b1", "from B", OTHER));

    let session = start(&transport, options());
    session.open(a).unwrap();
    until(&session, |s| texts(s) == vec!["from A"]).await;

    session.open(b).unwrap();
    let snapshot = until(&session, |s| s.state == SyncState::Synced).await;
    assert_eq!(texts(&snapshot), vec!["from B"]);

    session.stop().await;
}

#[tokio::test]
async fn slow_fetch_times_out() {
    let transport = FakeTransport::new();
    let a = chat("chat_1_2");
    let _never = transport.gate(&a);

    let limit = Duration::from_millis(50);
    let session = start(&transport, options().with_request_timeout(limit));
    session.open(a).unwrap();

    let snapshot = until(&session, |s| s.last_error.is_some()).await;
    assert_eq!(snapshot.last_error, Some(ChatError::Timeout(limit)));
    assert_eq!(snapshot.state, SyncState::Loading);
    assert!(snapshot.messages.is_empty());

    session.stop().await;
}

#[tokio::test]
async fn close_returns_to_idle() {
    let transport = FakeTransport::new();
    let a = chat("chat_1_2");
    transport.push(&a, wire("m1", "hi", OTHER));

    let session = start(&transport, options());
    session.open(a).unwrap();
    until(&session, |s| s.state == SyncState::Synced).await;

    session.close().unwrap();
    let snapshot = until(&session, |s| s.state == SyncState::Idle).await;
    assert_eq!(snapshot.conversation, None);
    assert!(snapshot.messages.is_empty());
    assert_eq!(
        session.send("hello").await.unwrap_err(),
        ChatError::NoActiveConversation
    );

    session.stop().await;
}

#[tokio::test]
async fn stop_ends_polling() {
    let transport = FakeTransport::new();
    let session = start(&transport, options());
    session.open(chat("chat_1_2")).unwrap();
    until(&session, |_| transport.fetch_count() >= 2).await;

    let handle = session.handle();
    let mut snapshots = session.subscribe();
    session.stop().await;

    assert_eq!(snapshots.borrow_and_update().state, SyncState::Idle);
    let stopped_at = transport.fetch_count();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.fetch_count(), stopped_at);

    assert_eq!(handle.send("late").await.unwrap_err(), ChatError::SessionClosed);
    assert_eq!(handle.open(chat("chat_3_4")).unwrap_err(), ChatError::SessionClosed);
}
