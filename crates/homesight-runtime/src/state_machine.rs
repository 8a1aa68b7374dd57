//! Per-camera lifecycle state machine.
//!
//! Pure bookkeeping: no I/O and no clocks. The session worker feeds it
//! frames and stage results and acts on its verdicts.
//!
//! ```text
//!   Idle ─▶ Sampling ─▶ Perceiving ─▶ Planning ─▶ Acting
//!    ▲         ▲            │            │          │
//!    │         └────────────┘            │          │
//!    └───────────────────────────────────┴──────────┘
//!   any ─▶ Error ─▶ Sampling          any ─▶ Stopped
//! ```
//!
//! Frames are ordered by `(epoch, sequence)`. A frame that is not newer than
//! the last accepted one is rejected. A newer frame arriving mid-cycle never
//! interrupts the cycle; it becomes the next cycle's input and, while
//! perceiving or planning, marks the running cycle as superseded.

use homesight_types::{CycleKey, HomeError, SessionId, SessionState};

/// What to do with an offered frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameVerdict {
    /// Start a cycle on this frame now.
    StartCycle,
    /// Keep the frame as the latest input for the next cycle. When
    /// `supersedes` is set the running cycle's results must be dropped.
    Deferred { supersedes: bool },
    /// Out of order or duplicate; discard.
    Rejected,
}

/// `true` when `from → to` is a legal transition.
pub fn is_valid_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;
    match (from, to) {
        (Stopped, _) => false,
        (_, Stopped) => true,
        (Error, Error) => false,
        (_, Error) => true,
        (Idle, Sampling)
        | (Sampling, Perceiving)
        | (Perceiving, Planning)
        | (Perceiving, Sampling)
        | (Planning, Acting)
        | (Planning, Idle)
        | (Acting, Idle)
        | (Error, Sampling) => true,
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    session_id: SessionId,
    state: SessionState,
    last_accepted: Option<(u64, u64)>,
    cycle: Option<(u64, u64)>,
    superseded: bool,
    supersede_in_flight: bool,
    consecutive_supersessions: u32,
    starvation_limit: u32,
}

impl SessionStateMachine {
    /// A new machine in [`SessionState::Idle`].
    ///
    /// After `starvation_limit` consecutive superseded cycles the next cycle
    /// is protected and runs to completion.
    pub fn new(session_id: SessionId, supersede_in_flight: bool, starvation_limit: u32) -> Self {
        Self {
            session_id,
            state: SessionState::Idle,
            last_accepted: None,
            cycle: None,
            superseded: false,
            supersede_in_flight,
            consecutive_supersessions: 0,
            starvation_limit,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Position of the newest accepted frame.
    pub fn last_accepted(&self) -> Option<(u64, u64)> {
        self.last_accepted
    }

    /// Position of the frame the running cycle started on.
    pub fn cycle(&self) -> Option<(u64, u64)> {
        self.cycle
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded
    }

    pub fn consecutive_supersessions(&self) -> u32 {
        self.consecutive_supersessions
    }

    /// `true` when the running cycle may no longer be superseded.
    pub fn is_protected(&self) -> bool {
        self.consecutive_supersessions >= self.starvation_limit
    }

    /// Move to `to`, returning the state left.
    ///
    /// # Errors
    ///
    /// [`HomeError::InvalidTransition`] when `to` is not reachable from the
    /// current state. The state is unchanged.
    pub fn transition(&mut self, to: SessionState) -> Result<SessionState, HomeError> {
        let from = self.state;
        if !is_valid_transition(from, to) {
            return Err(HomeError::InvalidTransition { from, to });
        }
        self.state = to;
        if matches!(to, SessionState::Error | SessionState::Stopped) {
            self.cycle = None;
            self.superseded = false;
        }
        Ok(from)
    }

    /// Judge a frame offered by the sampler.
    pub fn offer_frame(&mut self, key: &CycleKey) -> FrameVerdict {
        if self.state == SessionState::Stopped
            || self.last_accepted.is_some_and(|last| key.position() <= last)
        {
            return FrameVerdict::Rejected;
        }
        self.last_accepted = Some(key.position());

        match self.state {
            SessionState::Sampling => FrameVerdict::StartCycle,
            SessionState::Perceiving | SessionState::Planning
                if self.supersede_in_flight && !self.is_protected() =>
            {
                self.superseded = true;
                FrameVerdict::Deferred { supersedes: true }
            }
            _ => FrameVerdict::Deferred { supersedes: false },
        }
    }

    /// `Sampling → Perceiving` on the frame at `key`.
    ///
    /// # Errors
    ///
    /// [`HomeError::InvalidTransition`] outside [`SessionState::Sampling`].
    pub fn begin_cycle(&mut self, key: &CycleKey) -> Result<(), HomeError> {
        self.transition(SessionState::Perceiving)?;
        self.cycle = Some(key.position());
        self.superseded = false;
        Ok(())
    }

    /// `true` when a stage result for `key` may be applied: it belongs to
    /// the running cycle and the cycle has not been superseded.
    pub fn accepts_result(&self, key: &CycleKey) -> bool {
        !self.superseded && self.cycle == Some(key.position())
    }

    /// Close the running cycle. `superseded` feeds the starvation guard.
    pub fn finish_cycle(&mut self, superseded: bool) {
        if superseded {
            self.consecutive_supersessions += 1;
        } else {
            self.consecutive_supersessions = 0;
        }
        self.cycle = None;
        self.superseded = false;
    }
}
