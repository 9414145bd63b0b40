use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use castline_types::{ConversationId, ViewMessage};

use crate::config::ChatConfig;
use crate::error::{ChatError, Result};
use crate::identity::ViewerIdentity;
use crate::optimistic::{OptimisticBuffer, PlaceholderId};
use crate::timestamp::DisplayClock;
use crate::transcode::transcode_log;
use crate::transport::{ChatTransport, FetchedLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No conversation is open.
    Idle,
    /// A fetch for the active conversation is in flight.
    Loading,
    /// The last fetch was applied.
    Synced,
}

/// What the UI renders. Published whole on every change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSnapshot {
    pub conversation: Option<ConversationId>,
    pub title: Option<String>,
    pub state: SyncState,
    /// Server messages in log order, then optimistic entries in submission
    /// order. Ids are unique.
    pub messages: Vec<ViewMessage>,
    /// Most recent fetch failure, cleared by the next successful fetch.
    pub last_error: Option<ChatError>,
}

impl ChatSnapshot {
    fn idle() -> Self {
        Self {
            conversation: None,
            title: None,
            state: SyncState::Idle,
            messages: Vec::new(),
            last_error: None,
        }
    }
}

/// Shortest poll period the loop will run with.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub poll_interval: Duration,
    /// Upper bound on a single fetch or send.
    pub request_timeout: Duration,
    pub clock: DisplayClock,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&ChatConfig::default())
    }
}

impl From<&ChatConfig> for SessionOptions {
    fn from(config: &ChatConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            request_timeout: config.request_timeout,
            clock: config.clock,
        }
    }
}

impl SessionOptions {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_clock(mut self, clock: DisplayClock) -> Self {
        self.clock = clock;
        self
    }
}

/// Stamp carried by every in-flight request. A result is applied only if its
/// ticket still names the active conversation and epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Ticket {
    conversation: ConversationId,
    epoch: u64,
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.conversation, self.epoch)
    }
}

enum Command {
    Open(ConversationId),
    Close,
    Send {
        text: String,
        reply: oneshot::Sender<Result<ViewMessage>>,
    },
}

enum Completion {
    Fetch {
        ticket: Ticket,
        result: Result<FetchedLog>,
    },
    Send {
        ticket: Ticket,
        placeholder: PlaceholderId,
        optimistic: ViewMessage,
        result: Result<String>,
        reply: oneshot::Sender<Result<ViewMessage>>,
    },
}

/// Cloneable front end of a running session: opens conversations, sends
/// messages and hands out snapshot receivers.
#[derive(Clone)]
pub struct ChatHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<ChatSnapshot>,
}

impl ChatHandle {
    /// Makes `conversation` the active one: clears the sequence, fetches at
    /// once and polls from then on.
    pub fn open(&self, conversation: ConversationId) -> Result<()> {
        self.command(Command::Open(conversation))
    }

    /// Stops polling and clears the sequence without ending the session.
    pub fn close(&self) -> Result<()> {
        self.command(Command::Close)
    }

    /// Appends an optimistic entry right away and resolves once the server
    /// answered. On success the returned message carries the server id; on
    /// failure the optimistic entry is already gone.
    pub async fn send(&self, text: impl Into<String>) -> Result<ViewMessage> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send {
            text: text.into(),
            reply,
        })?;
        rx.await.map_err(|_| ChatError::SessionClosed)?
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatSnapshot> {
        self.snapshots.clone()
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| ChatError::SessionClosed)
    }
}

/// Owner of a running synchronization loop.
///
/// The loop owns the displayed sequence; handles only send commands and read
/// snapshots. Dropping the session cancels the loop, but [`ChatSession::stop`]
/// should be awaited on teardown so in-flight requests are gone before it
/// returns.
pub struct ChatSession {
    handle: ChatHandle,
    cancel: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ChatSession {
    /// Spawns the loop on the current Tokio runtime. No conversation is open
    /// until [`ChatSession::open`] is called.
    pub fn start<T: ChatTransport>(
        transport: Arc<T>,
        viewer: ViewerIdentity,
        options: SessionOptions,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(ChatSnapshot::idle());
        let cancel = CancellationToken::new();

        let sync = SyncLoop::new(transport, viewer, options, snapshot_tx);
        let task = tokio::spawn(sync.run(commands_rx, cancel.clone()));

        Self {
            handle: ChatHandle {
                commands: commands_tx,
                snapshots: snapshot_rx,
            },
            cancel,
            task: Some(task),
        }
    }

    pub fn handle(&self) -> ChatHandle {
        self.handle.clone()
    }

    pub fn open(&self, conversation: ConversationId) -> Result<()> {
        self.handle.open(conversation)
    }

    pub fn close(&self) -> Result<()> {
        self.handle.close()
    }

    pub async fn send(&self, text: impl Into<String>) -> Result<ViewMessage> {
        self.handle.send(text).await
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.handle.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatSnapshot> {
        self.handle.subscribe()
    }

    /// Ends polling and waits for the loop to exit. In-flight requests are
    /// aborted and pending `send` calls resolve to [`ChatError::SessionClosed`].
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Chat session task failed: {}", e);
            }
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct SyncLoop<T> {
    transport: Arc<T>,
    viewer: ViewerIdentity,
    options: SessionOptions,

    active: Option<ConversationId>,
    /// Bumped on every conversation change.
    epoch: u64,
    title: Option<String>,
    state: SyncState,
    synced_once: bool,
    /// Transcoded server log of the active conversation.
    server: Vec<ViewMessage>,
    buffer: OptimisticBuffer,
    in_flight_fetch: Option<(Ticket, AbortHandle)>,
    last_error: Option<ChatError>,

    publisher: watch::Sender<ChatSnapshot>,
    tasks: JoinSet<Completion>,
    ticker: Interval,
}

impl<T: ChatTransport> SyncLoop<T> {
    fn new(
        transport: Arc<T>,
        viewer: ViewerIdentity,
        options: SessionOptions,
        publisher: watch::Sender<ChatSnapshot>,
    ) -> Self {
        // `interval` panics on a zero period.
        let period = options.poll_interval.max(MIN_POLL_INTERVAL);
        if period != options.poll_interval {
            warn!("Poll interval {:?} too short, using {:?}", options.poll_interval, period);
        }
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            transport,
            viewer,
            options,
            active: None,
            epoch: 0,
            title: None,
            state: SyncState::Idle,
            synced_once: false,
            server: Vec::new(),
            buffer: OptimisticBuffer::new(),
            in_flight_fetch: None,
            last_error: None,
            publisher,
            tasks: JoinSet::new(),
            ticker,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                _ = self.ticker.tick() => self.poll(),
                Some(joined) = self.tasks.join_next() => match joined {
                    Ok(completion) => self.handle_completion(completion),
                    Err(e) if e.is_cancelled() => trace!("Aborted request task reaped"),
                    Err(e) => error!("Chat request task panicked: {}", e),
                },
            }
        }

        self.tasks.shutdown().await;
        self.active = None;
        self.reset_conversation_state();
        self.state = SyncState::Idle;
        self.publish();
        info!("Chat session stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open(conversation) => self.open(conversation),
            Command::Close => {
                if let Some(previous) = self.active.take() {
                    info!("Closing conversation {}", previous);
                }
                self.epoch += 1;
                self.reset_conversation_state();
                self.state = SyncState::Idle;
                self.publish();
            }
            Command::Send { text, reply } => self.send(text, reply),
        }
    }

    fn open(&mut self, conversation: ConversationId) {
        if self.active.as_ref() == Some(&conversation) {
            debug!("Conversation {} already open", conversation);
            return;
        }

        info!("Opening conversation {}", conversation);
        self.epoch += 1;
        self.reset_conversation_state();
        self.active = Some(conversation);
        self.start_fetch();
        self.ticker.reset();
        self.publish();
    }

    /// Drops everything tied to the previous conversation, including any
    /// fetch still in flight for it.
    fn reset_conversation_state(&mut self) {
        if let Some((ticket, handle)) = self.in_flight_fetch.take() {
            debug!("Abandoning fetch {}", ticket);
            handle.abort();
        }
        self.server.clear();
        self.buffer.clear();
        self.title = None;
        self.synced_once = false;
        self.last_error = None;
    }

    fn poll(&mut self) {
        if self.active.is_none() {
            return;
        }
        if let Some((ticket, _)) = &self.in_flight_fetch {
            trace!("Fetch {} still in flight, skipping tick", ticket);
            return;
        }
        self.start_fetch();
        self.publish();
    }

    fn current_ticket(&self) -> Option<Ticket> {
        self.active.as_ref().map(|conversation| Ticket {
            conversation: conversation.clone(),
            epoch: self.epoch,
        })
    }

    fn start_fetch(&mut self) {
        let Some(ticket) = self.current_ticket() else {
            return;
        };

        let transport = self.transport.clone();
        let timeout = self.options.request_timeout;
        let stamped = ticket.clone();
        let handle = self.tasks.spawn(async move {
            let result = bounded(timeout, transport.fetch_log(&stamped.conversation)).await;
            Completion::Fetch {
                ticket: stamped,
                result,
            }
        });

        trace!("Fetch {} started", ticket);
        self.in_flight_fetch = Some((ticket, handle));
        self.state = SyncState::Loading;
    }

    fn send(&mut self, text: String, reply: oneshot::Sender<Result<ViewMessage>>) {
        let Some(ticket) = self.current_ticket() else {
            let _ = reply.send(Err(ChatError::NoActiveConversation));
            return;
        };
        if text.trim().is_empty() {
            let _ = reply.send(Err(ChatError::EmptyMessage));
            return;
        }

        let (placeholder, optimistic) = self.buffer.create(&text, &self.options.clock);
        self.publish();

        let transport = self.transport.clone();
        let timeout = self.options.request_timeout;
        self.tasks.spawn(async move {
            let result = bounded(timeout, transport.send_message(&ticket.conversation, &text)).await;
            Completion::Send {
                ticket,
                placeholder,
                optimistic,
                result,
                reply,
            }
        });
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Fetch { ticket, result } => self.apply_fetch(ticket, result),
            Completion::Send {
                ticket,
                placeholder,
                optimistic,
                result,
                reply,
            } => {
                let current = self.current_ticket().as_ref() == Some(&ticket);
                let outcome = match result {
                    Ok(server_id) => {
                        if current {
                            self.buffer.confirm(placeholder, &server_id, None);
                        }
                        Ok(ViewMessage {
                            id: server_id,
                            ..optimistic
                        })
                    }
                    Err(e) => {
                        warn!("Send in {} failed: {}", ticket, e);
                        if current {
                            self.buffer.discard(placeholder);
                        }
                        Err(e)
                    }
                };
                if current {
                    self.publish();
                }
                // The caller may have given up waiting.
                let _ = reply.send(outcome);
            }
        }
    }

    fn apply_fetch(&mut self, ticket: Ticket, result: Result<FetchedLog>) {
        match &self.in_flight_fetch {
            Some((in_flight, _)) if *in_flight == ticket => self.in_flight_fetch = None,
            _ => {
                debug!("Dropping stale fetch response {}", ticket);
                return;
            }
        }

        match result {
            Ok(log) => {
                self.server = transcode_log(&log.messages, &self.viewer, &self.options.clock);
                self.buffer.reconcile(&self.server);
                if log.title.is_some() {
                    self.title = log.title;
                }
                self.state = SyncState::Synced;
                self.synced_once = true;
                self.last_error = None;
                trace!("Fetch {} applied, {} server messages", ticket, self.server.len());
            }
            Err(e) => {
                warn!("Fetch {} failed, keeping last known messages: {}", ticket, e);
                self.last_error = Some(e);
                self.state = if self.synced_once {
                    SyncState::Synced
                } else {
                    SyncState::Loading
                };
            }
        }
        self.publish();
    }

    fn publish(&self) {
        let messages = self
            .server
            .iter()
            .chain(self.buffer.visible())
            .cloned()
            .collect();

        self.publisher.send_replace(ChatSnapshot {
            conversation: self.active.clone(),
            title: self.title.clone(),
            state: self.state,
            messages,
            last_error: self.last_error.clone(),
        });
    }
}

async fn bounded<F, V>(limit: Duration, request: F) -> Result<V>
where
    F: std::future::Future<Output = Result<V>>,
{
    match tokio::time::timeout(limit, request).await {
        Ok(result) => result,
        Err(_) => Err(ChatError::Timeout(limit)),
    }
}
