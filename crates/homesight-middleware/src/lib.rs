//! `homesight-middleware` – the event plumbing.
//!
//! Routes session lifecycle changes, history entries and alerts from the
//! camera sessions to whoever is watching (the CLI log sink, the activity
//! log, tests) without the sessions knowing who listens.
//!
//! # Modules
//!
//! - [`bus`] – Headless, topic-based publish/subscribe event bus built on
//!   Tokio broadcast channels.

pub mod bus;

pub use bus::{EventBus, Topic, TopicReceiver};
