//! Castline chat synchronization engine.
//!
//! Keeps a client's view of one conversation consistent with the server-held
//! message log under a polling transport, while the local user's sends show up
//! immediately as optimistic entries until the server confirms or refuses them.
//!
//! Data flows leaf to root: [`timestamp`] and [`identity`] feed [`transcode`],
//! which [`session`] runs over every fetched log before merging it with the
//! [`optimistic`] buffer and publishing a [`session::ChatSnapshot`].

pub mod config;
pub mod error;
pub mod identity;
pub mod optimistic;
pub mod session;
pub mod store;
pub mod timestamp;
pub mod transcode;
pub mod transport;

pub use config::ChatConfig;
pub use error::{ChatError, Result};
pub use identity::ViewerIdentity;
pub use session::{ChatHandle, ChatSession, ChatSnapshot, MIN_POLL_INTERVAL, SessionOptions, SyncState};
pub use store::{FileStore, KeyValueStore, MemoryStore, SessionContext};
pub use timestamp::{ClockStyle, DisplayClock};
pub use transport::{ChatTransport, FetchedLog, HttpTransport};

pub use castline_types as types;
