//! Tracker lifecycle state machine.
//!
//! The machine only tracks phases. It decides which operations the capture
//! pipeline may attempt, never performs them.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::types::unix_now;

/// Transitions kept by `history()`.
pub const HISTORY_LEN: usize = 64;

// ---------------------------------------------------------------------------
// States and triggers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Initializing,
    Scanning,
    Connecting,
    Transmitting,
    Error,
}

impl State {
    pub const ALL: [State; 5] = [
        State::Initializing,
        State::Scanning,
        State::Connecting,
        State::Transmitting,
        State::Error,
    ];

    pub fn name(self) -> &'static str {
        match self {
            State::Initializing => "INITIALIZING",
            State::Scanning => "SCANNING",
            State::Connecting => "CONNECTING",
            State::Transmitting => "TRANSMITTING",
            State::Error => "ERROR",
        }
    }

    pub fn from_name(s: &str) -> Option<State> {
        State::ALL
            .into_iter()
            .find(|st| st.name().eq_ignore_ascii_case(s))
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    InitializeComplete,
    WifiAvailable,
    TransmissionComplete,
    TransmissionFailed,
    ConnectionFailed,
    ErrorOccurred,
    ErrorResolved,
}

impl Trigger {
    pub const ALL: [Trigger; 7] = [
        Trigger::InitializeComplete,
        Trigger::WifiAvailable,
        Trigger::TransmissionComplete,
        Trigger::TransmissionFailed,
        Trigger::ConnectionFailed,
        Trigger::ErrorOccurred,
        Trigger::ErrorResolved,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Trigger::InitializeComplete => "initialize_complete",
            Trigger::WifiAvailable => "wifi_available",
            Trigger::TransmissionComplete => "transmission_complete",
            Trigger::TransmissionFailed => "transmission_failed",
            Trigger::ConnectionFailed => "connection_failed",
            Trigger::ErrorOccurred => "error_occurred",
            Trigger::ErrorResolved => "error_resolved",
        }
    }

    pub fn from_name(s: &str) -> Option<Trigger> {
        Trigger::ALL.into_iter().find(|t| t.name() == s)
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Transition table. `None` as source means "any state".
pub const TRANSITIONS: &[(Trigger, Option<State>, State)] = &[
    (Trigger::InitializeComplete, Some(State::Initializing), State::Scanning),
    (Trigger::WifiAvailable, Some(State::Scanning), State::Connecting),
    (Trigger::TransmissionComplete, Some(State::Connecting), State::Scanning),
    (Trigger::TransmissionFailed, Some(State::Transmitting), State::Scanning),
    (Trigger::ConnectionFailed, Some(State::Connecting), State::Scanning),
    (Trigger::ErrorOccurred, None, State::Error),
    (Trigger::ErrorResolved, Some(State::Error), State::Scanning),
];

/// Destination for `(state, trigger)`, or `None` if the pair is undefined.
pub fn next_state(state: State, trigger: Trigger) -> Option<State> {
    TRANSITIONS
        .iter()
        .find(|(t, src, _)| *t == trigger && src.map_or(true, |s| s == state))
        .map(|&(_, _, dest)| dest)
}

// ---------------------------------------------------------------------------
// Operation gates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Scan,
    Connect,
    Transmit,
    Persist,
}

impl Operation {
    /// Whether this operation may run while the machine is in `state`.
    pub fn permitted_in(self, state: State) -> bool {
        match self {
            Operation::Scan | Operation::Persist => state == State::Scanning,
            Operation::Connect => state == State::Connecting,
            Operation::Transmit => matches!(state, State::Connecting | State::Transmitting),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("trigger {trigger} is not defined in state {state}")]
    InvalidTransition { state: State, trigger: Trigger },
    #[error("lifecycle is shut down, rejected trigger {trigger}")]
    ShutDown { trigger: Trigger },
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub from: State,
    pub to: State,
    pub trigger: Trigger,
    /// Unix seconds.
    pub at: f64,
}

#[derive(Debug)]
pub struct Lifecycle {
    state: State,
    entered_at: f64,
    last_transition: Option<Transition>,
    history: VecDeque<Transition>,
    rescan_interval: Duration,
    shut_down: bool,
}

impl Lifecycle {
    /// Start in INITIALIZING.
    pub fn new(rescan_interval: Duration) -> Self {
        Lifecycle {
            state: State::Initializing,
            entered_at: unix_now(),
            last_transition: None,
            history: VecDeque::with_capacity(HISTORY_LEN),
            rescan_interval,
            shut_down: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn fire(&mut self, trigger: Trigger) -> Result<State, LifecycleError> {
        self.fire_at(trigger, unix_now())
    }

    /// Apply `trigger` with an explicit timestamp.
    pub fn fire_at(&mut self, trigger: Trigger, now: f64) -> Result<State, LifecycleError> {
        if self.shut_down {
            return Err(LifecycleError::ShutDown { trigger });
        }
        let to = next_state(self.state, trigger).ok_or(LifecycleError::InvalidTransition {
            state: self.state,
            trigger,
        })?;

        let transition = Transition {
            from: self.state,
            to,
            trigger,
            at: now,
        };
        if to == State::Error {
            info!(from = %self.state, %trigger, "lifecycle entering ERROR");
        } else {
            debug!(from = %self.state, to = %to, %trigger, "lifecycle transition");
        }

        self.state = to;
        self.entered_at = now;
        self.last_transition = Some(transition);
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(transition);
        Ok(to)
    }

    pub fn last_transition(&self) -> Option<&Transition> {
        self.last_transition.as_ref()
    }

    /// Recent transitions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &Transition> {
        self.history.iter()
    }

    pub fn rescan_interval(&self) -> Duration {
        self.rescan_interval
    }

    pub fn permits(&self, op: Operation) -> bool {
        !self.shut_down && op.permitted_in(self.state)
    }

    /// True once SCANNING has lasted longer than the re-scan interval.
    pub fn rescan_due(&self, now: f64) -> bool {
        !self.shut_down
            && self.state == State::Scanning
            && now - self.entered_at >= self.rescan_interval.as_secs_f64()
    }

    /// Stop accepting triggers. The current state is left as is.
    pub fn shutdown(&mut self) {
        if !self.shut_down {
            info!(state = %self.state, "lifecycle shut down");
            self.shut_down = true;
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Render the transition table as a Graphviz digraph.
    pub fn to_dot() -> String {
        let mut out = String::from("digraph lifecycle {\n    rankdir=LR;\n");
        out.push_str("    node [shape=box];\n");
        out.push_str(&format!(
            "    start [shape=point];\n    start -> {};\n",
            State::Initializing
        ));
        for &(trigger, src, dest) in TRANSITIONS {
            match src {
                Some(s) => out.push_str(&format!("    {s} -> {dest} [label=\"{trigger}\"];\n")),
                None => {
                    for s in State::ALL.into_iter().filter(|&s| s != dest) {
                        out.push_str(&format!(
                            "    {s} -> {dest} [label=\"{trigger}\", style=dashed];\n"
                        ));
                    }
                }
            }
        }
        out.push_str("}\n");
        out
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Lifecycle::new(Duration::from_secs(60))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
