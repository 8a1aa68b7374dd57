//! [`DuplicateGuard`] – repeated-action suppressor.
//!
//! A camera that keeps seeing the same scene keeps producing the same
//! decision. The guard remembers each dispatched action for a window; an
//! identical action proposed again inside the window is suppressed so the
//! household is not notified about the same parcel every second.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use homesight_runtime::duplicate_guard::DuplicateGuard;
//! use homesight_types::HomeAction;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut guard = DuplicateGuard::new(Duration::from_secs(60));
//! let notify = HomeAction::Notify { message: "parcel at the door".into() };
//!
//! assert!(!guard.is_duplicate(&notify));
//! guard.record(&notify);
//! assert!(guard.is_duplicate(&notify));
//! # }
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use homesight_types::HomeAction;
use tokio::time::Instant;

/// Remembers recently dispatched actions of one session.
///
/// [`HomeAction::NoOp`] is never recorded nor reported as a duplicate.
pub struct DuplicateGuard {
    window: Duration,
    recent: VecDeque<(Instant, HomeAction)>,
}

impl DuplicateGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            recent: VecDeque::new(),
        }
    }

    /// `true` when `action` was recorded less than one window ago.
    pub fn is_duplicate(&mut self, action: &HomeAction) -> bool {
        if action.is_noop() || self.window.is_zero() {
            return false;
        }
        self.expire();
        self.recent.iter().any(|(_, a)| a == action)
    }

    /// Remember that `action` was just dispatched.
    pub fn record(&mut self, action: &HomeAction) {
        if action.is_noop() || self.window.is_zero() {
            return;
        }
        self.expire();
        self.recent.retain(|(_, a)| a != action);
        self.recent.push_back((Instant::now(), action.clone()));
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    pub fn reset(&mut self) {
        self.recent.clear();
    }

    fn expire(&mut self) {
        let now = Instant::now();
        while let Some((at, _)) = self.recent.front() {
            if now.duration_since(*at) < self.window {
                break;
            }
            self.recent.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn light_on() -> HomeAction {
        HomeAction::ActuateDevice {
            device_id: "light.porch".into(),
            command: "turn_on".into(),
            value: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_inside_window_is_duplicate() {
        let mut guard = DuplicateGuard::new(Duration::from_secs(60));
        assert!(!guard.is_duplicate(&light_on()));
        guard.record(&light_on());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(guard.is_duplicate(&light_on()));
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_after_window_is_allowed() {
        let mut guard = DuplicateGuard::new(Duration::from_secs(60));
        guard.record(&light_on());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!guard.is_duplicate(&light_on()));
        assert!(guard.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn different_parameters_are_not_duplicates() {
        let mut guard = DuplicateGuard::new(Duration::from_secs(60));
        guard.record(&light_on());
        let off = HomeAction::ActuateDevice {
            device_id: "light.porch".into(),
            command: "turn_off".into(),
            value: None,
        };
        assert!(!guard.is_duplicate(&off));
    }

    #[tokio::test(start_paused = true)]
    async fn noop_is_never_tracked() {
        let mut guard = DuplicateGuard::new(Duration::from_secs(60));
        guard.record(&HomeAction::NoOp);
        assert!(guard.is_empty());
        assert!(!guard.is_duplicate(&HomeAction::NoOp));
    }

    #[tokio::test(start_paused = true)]
    async fn re_recording_refreshes_the_window() {
        let mut guard = DuplicateGuard::new(Duration::from_secs(60));
        guard.record(&light_on());
        tokio::time::advance(Duration::from_secs(50)).await;
        guard.record(&light_on());
        assert_eq!(guard.len(), 1);
        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(guard.is_duplicate(&light_on()));
        guard.reset();
        assert!(!guard.is_duplicate(&light_on()));
    }
}
