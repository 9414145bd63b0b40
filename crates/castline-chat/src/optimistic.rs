use std::collections::{HashMap, HashSet};
use std::fmt;

use tracing::{debug, trace};
use uuid::Uuid;

use castline_types::ViewMessage;

use crate::timestamp::DisplayClock;

/// Reserved prefix of locally generated message ids.
pub const PLACEHOLDER_PREFIX: &str = "tmp-";

/// Identifier of a message that exists only locally. Each one is a fresh v4
/// UUID, so a retired placeholder never comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaceholderId(Uuid);

impl PlaceholderId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PlaceholderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PLACEHOLDER_PREFIX, self.0)
    }
}

pub fn is_placeholder_id(id: &str) -> bool {
    id.starts_with(PLACEHOLDER_PREFIX)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryState {
    /// Waiting for the send to resolve.
    Pending,
    /// Send succeeded; shown under the server id until a fetch contains it.
    Confirmed(String),
}

#[derive(Debug, Clone)]
struct Entry {
    placeholder: PlaceholderId,
    view: ViewMessage,
    state: EntryState,
    /// Fetch generation current when the user hit send.
    submitted_at_gen: u64,
    /// Server id of a fetched message that is this send, if one was found.
    matched: Option<String>,
}

/// Locally originated messages between submission and server confirmation.
///
/// Entries keep submission order and are always displayed after the server
/// portion of the sequence.
#[derive(Debug, Default)]
pub struct OptimisticBuffer {
    entries: Vec<Entry>,
    /// Server ids of the last fetched log -> generation they first showed up in.
    first_seen: HashMap<String, u64>,
    /// Server ids owned by confirmed sends. Never matched to another entry.
    settled: HashSet<String>,
    fetch_gen: u64,
}

impl OptimisticBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a pending entry for outgoing `text`, timestamped with local
    /// wall-clock time.
    pub fn create(&mut self, text: &str, clock: &DisplayClock) -> (PlaceholderId, ViewMessage) {
        let placeholder = PlaceholderId::generate();
        let view = ViewMessage {
            id: placeholder.to_string(),
            text: text.to_string(),
            is_me: true,
            timestamp: clock.now(),
        };

        self.entries.push(Entry {
            placeholder,
            view: view.clone(),
            state: EntryState::Pending,
            submitted_at_gen: self.fetch_gen,
            matched: None,
        });
        trace!("Optimistic entry {} created", placeholder);

        (placeholder, view)
    }

    /// Swaps the placeholder for the server-confirmed record in place.
    ///
    /// Returns `false` if the placeholder is unknown or already retired.
    pub fn confirm(&mut self, placeholder: PlaceholderId, server_id: &str, text: Option<&str>) -> bool {
        let Some(idx) = self.pending_index(placeholder) else {
            return false;
        };
        self.settled.insert(server_id.to_string());

        if self.first_seen.contains_key(server_id) {
            // Already on screen as a server message.
            self.entries.remove(idx);
            debug!("Optimistic entry {} retired, {} already fetched", placeholder, server_id);
            return true;
        }

        let entry = &mut self.entries[idx];
        entry.view.id = server_id.to_string();
        if let Some(text) = text {
            entry.view.text = text.to_string();
        }
        entry.state = EntryState::Confirmed(server_id.to_string());
        entry.matched = None;
        debug!("Optimistic entry {} confirmed as {}", placeholder, server_id);
        true
    }

    /// Drops a pending entry. Unknown, already discarded and already
    /// confirmed placeholders are ignored.
    pub fn discard(&mut self, placeholder: PlaceholderId) -> bool {
        match self.pending_index(placeholder) {
            Some(idx) => {
                self.entries.remove(idx);
                debug!("Optimistic entry {} discarded", placeholder);
                true
            }
            None => false,
        }
    }

    /// Folds a freshly fetched server portion into the buffer.
    ///
    /// Confirmed entries whose id is now in the log are retired. Pending
    /// entries are paired with own messages carrying the same text that
    /// appeared after the entry was submitted, so a send that the server
    /// stored before its response reached us is not shown twice.
    pub fn reconcile(&mut self, server: &[ViewMessage]) {
        self.fetch_gen += 1;
        let generation = self.fetch_gen;

        let mut first_seen = HashMap::with_capacity(server.len());
        for view in server {
            let seen = self.first_seen.get(&view.id).copied().unwrap_or(generation);
            first_seen.insert(view.id.clone(), seen);
        }
        self.first_seen = first_seen;

        self.entries.retain(|entry| match &entry.state {
            EntryState::Confirmed(id) => !self.first_seen.contains_key(id),
            EntryState::Pending => true,
        });

        // Keep ids still in the log or still awaiting their first fetch.
        let entries = &self.entries;
        let first_seen = &self.first_seen;
        self.settled.retain(|id| {
            first_seen.contains_key(id)
                || entries
                    .iter()
                    .any(|entry| matches!(&entry.state, EntryState::Confirmed(c) if c == id))
        });

        let mut claimed: HashSet<&str> = self.settled.iter().map(String::as_str).collect();
        for entry in &mut self.entries {
            if entry.state != EntryState::Pending {
                continue;
            }
            entry.matched = server
                .iter()
                .find(|view| {
                    view.is_me
                        && view.text == entry.view.text
                        && self.first_seen[&view.id] > entry.submitted_at_gen
                        && !claimed.contains(view.id.as_str())
                })
                .map(|view| {
                    claimed.insert(view.id.as_str());
                    view.id.clone()
                });
        }
    }

    /// Entries that belong on screen, in submission order.
    pub fn visible(&self) -> impl Iterator<Item = &ViewMessage> {
        self.entries
            .iter()
            .filter(|entry| match &entry.state {
                EntryState::Pending => entry.matched.is_none(),
                EntryState::Confirmed(id) => !self.first_seen.contains_key(id),
            })
            .map(|entry| &entry.view)
    }

    /// Number of sends still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.state == EntryState::Pending)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forgets everything, including the fetch history. Used when the active
    /// conversation changes.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.first_seen.clear();
        self.settled.clear();
        self.fetch_gen = 0;
    }

    fn pending_index(&self, placeholder: PlaceholderId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.placeholder == placeholder && entry.state == EntryState::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::ClockStyle;

    fn clock() -> DisplayClock {
        DisplayClock::utc(ClockStyle::TwentyFourHour)
    }

    fn server(id: &str, text: &str, is_me: bool) -> ViewMessage {
        ViewMessage {
            id: id.into(),
            text: text.into(),
            is_me,
            timestamp: "10:00".into(),
        }
    }

    fn visible_ids(buf: &OptimisticBuffer) -> Vec<String> {
        buf.visible().map(|v| v.id.clone()).collect()
    }

    #[test]
    fn create_uses_reserved_prefix_and_unique_ids() {
        let mut buf = OptimisticBuffer::new();
        let (a, view_a) = buf.create("hello", &clock());
        let (b, _) = buf.create("hello", &clock());

        assert_ne!(a, b);
        assert!(is_placeholder_id(&view_a.id));
        assert!(view_a.is_me);
        assert_eq!(view_a.text, "hello");
        assert_eq!(view_a.timestamp.len(), 5);
        assert_eq!(buf.pending_count(), 2);
    }

    #[test]
    fn confirm_substitutes_in_place() {
        let mut buf = OptimisticBuffer::new();
        let (first, _) = buf.create("one", &clock());
        let (_second, second_view) = buf.create("two", &clock());

        assert!(buf.confirm(first, "m99", None));
        assert_eq!(visible_ids(&buf), vec!["m99".to_string(), second_view.id]);

        // Placeholder is retired: neither confirm nor discard act on it again.
        assert!(!buf.confirm(first, "m100", None));
        assert!(!buf.discard(first));
        assert_eq!(buf.pending_count(), 1);
    }

    #[test]
    fn discard_is_idempotent() {
        let mut buf = OptimisticBuffer::new();
        let (p, _) = buf.create("oops", &clock());

        assert!(buf.discard(p));
        assert!(!buf.discard(p));
        assert!(buf.is_empty());
    }

    #[test]
    fn confirmed_entry_retires_once_fetched() {
        let mut buf = OptimisticBuffer::new();
        let (p, _) = buf.create("hello", &clock());
        buf.confirm(p, "m99", None);

        buf.reconcile(&[server("m1", "hi", false)]);
        assert_eq!(visible_ids(&buf), vec!["m99"]);

        buf.reconcile(&[server("m1", "hi", false), server("m99", "hello", true)]);
        assert!(buf.is_empty());
    }

    #[test]
    fn confirm_after_fetch_already_contains_id() {
        let mut buf = OptimisticBuffer::new();
        buf.reconcile(&[server("m1", "hi", false)]);
        let (p, _) = buf.create("hello", &clock());

        buf.reconcile(&[server("m1", "hi", false), server("m99", "hello", true)]);
        assert!(visible_ids(&buf).is_empty(), "matched entry must be hidden");

        assert!(buf.confirm(p, "m99", None));
        assert!(buf.is_empty());
    }

    #[test]
    fn old_history_is_not_matched() {
        let mut buf = OptimisticBuffer::new();
        buf.reconcile(&[server("m1", "hello", true)]);
        let (_, view) = buf.create("hello", &clock());

        buf.reconcile(&[server("m1", "hello", true)]);
        assert_eq!(visible_ids(&buf), vec![view.id]);
    }

    #[test]
    fn identical_texts_claim_distinct_server_messages() {
        let mut buf = OptimisticBuffer::new();
        buf.reconcile(&[]);
        let (_, a) = buf.create("ok", &clock());
        let (_, b) = buf.create("ok", &clock());

        buf.reconcile(&[server("m5", "ok", true)]);
        assert_eq!(visible_ids(&buf), vec![b.id.clone()]);

        buf.reconcile(&[server("m5", "ok", true), server("m6", "ok", true)]);
        assert!(visible_ids(&buf).is_empty());
        let _ = a;
    }

    #[test]
    fn confirmed_record_is_not_claimed_by_later_send() {
        let mut buf = OptimisticBuffer::new();
        buf.reconcile(&[]);
        let (first, _) = buf.create("ok", &clock());
        let (_, second) = buf.create("ok", &clock());

        assert!(buf.confirm(first, "m5", None));
        buf.reconcile(&[server("m5", "ok", true)]);
        assert_eq!(visible_ids(&buf), vec![second.id.clone()]);

        // Still owned by the first send on later fetches.
        buf.reconcile(&[server("m5", "ok", true)]);
        assert_eq!(visible_ids(&buf), vec![second.id]);

        buf.reconcile(&[server("m5", "ok", true), server("m6", "ok", true)]);
        assert!(visible_ids(&buf).is_empty());
    }

    #[test]
    fn clear_forgets_everything() {
        let mut buf = OptimisticBuffer::new();
        buf.reconcile(&[server("m1", "hi", false)]);
        buf.create("x", &clock());
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.visible().count(), 0);
    }
}
