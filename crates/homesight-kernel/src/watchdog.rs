//! [`Watchdog`] – per-session inactivity deadlines.
//!
//! A session calls [`Watchdog::touch`] every time it accepts a frame. A
//! session that has not been touched within its deadline is reported by
//! [`Watchdog::expired`] so the orchestrator can reap it.
//!
//! Time is read from [`tokio::time::Instant`], so paused-clock tests can
//! advance it.

use std::collections::HashMap;
use std::time::Duration;

use homesight_types::SessionId;
use tokio::time::Instant;

/// Liveness reported for a single session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    Active,
    Inactive { idle_for: Duration },
}

struct Deadline {
    last_activity: Instant,
    timeout: Duration,
}

/// Tracks the last activity of every registered session.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use homesight_kernel::watchdog::{Liveness, Watchdog};
/// use homesight_types::SessionId;
///
/// let mut wd = Watchdog::new();
/// let porch = SessionId::new("porch");
/// wd.track(&porch, Duration::from_secs(600));
/// wd.touch(&porch);
///
/// assert_eq!(wd.liveness(&porch), Some(Liveness::Active));
/// ```
#[derive(Default)]
pub struct Watchdog {
    sessions: HashMap<SessionId, Deadline>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `session_id`. Tracking an already tracked session
    /// resets its deadline.
    pub fn track(&mut self, session_id: &SessionId, timeout: Duration) {
        self.sessions.insert(
            session_id.clone(),
            Deadline {
                last_activity: Instant::now(),
                timeout,
            },
        );
    }

    /// Record activity. No-op for untracked sessions.
    pub fn touch(&mut self, session_id: &SessionId) {
        if let Some(d) = self.sessions.get_mut(session_id) {
            d.last_activity = Instant::now();
        }
    }

    pub fn forget(&mut self, session_id: &SessionId) {
        self.sessions.remove(session_id);
    }

    /// `None` for untracked sessions.
    pub fn liveness(&self, session_id: &SessionId) -> Option<Liveness> {
        self.sessions.get(session_id).map(|d| {
            let idle_for = d.last_activity.elapsed();
            if idle_for <= d.timeout {
                Liveness::Active
            } else {
                Liveness::Inactive { idle_for }
            }
        })
    }

    /// Sessions past their deadline, in id order.
    pub fn expired(&self) -> Vec<SessionId> {
        let mut out: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, d)| d.last_activity.elapsed() > d.timeout)
            .map(|(id, _)| id.clone())
            .collect();
        out.sort();
        out
    }
}
