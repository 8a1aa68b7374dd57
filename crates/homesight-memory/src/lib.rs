//! `homesight-memory` – what each session remembers.
//!
//! # Modules
//!
//! - [`history`] – [`SessionHistory`][history::SessionHistory]: the bounded,
//!   oldest-evicted ring of recent perceptions, decisions, commands and
//!   failures that feeds the planning prompt.
//! - [`activity_log`] – [`ActivityLog`][activity_log::ActivityLog]: optional
//!   SQLite journal of every history entry, with retention pruning, so
//!   failures and actions can be inspected after the ring has moved on.

pub mod activity_log;
pub mod history;

pub use activity_log::{ActivityLog, ActivityLogError, ActivityRecord};
pub use history::SessionHistory;
