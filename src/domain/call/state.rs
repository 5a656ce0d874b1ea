//! Call State Machine
//!
//! Lifecycle of one bridged call attempt, from the inbound INVITE to the
//! moment both legs and the media anchor are gone.

use crate::domain::shared::{DomainError, Result};
use std::time::Instant;

/// Call State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Context created, nothing done yet
    Idle,
    /// Looking up the callee in the location registry
    Resolving,
    /// Asking the media anchor for the outbound offer
    Anchoring,
    /// Creating the outbound leg
    Offering,
    /// Outbound leg created, 180 sent to the caller
    Ringing,
    /// Outbound leg answered, preparing the inbound answer
    Answering,
    /// Both legs up, media bridged
    Bridged,
    /// A step failed; teardown pending
    Failed,
    /// Both legs and the anchor are released
    Destroyed,
}

impl CallState {
    /// Check if state is active (not failed or destroyed)
    pub fn is_active(&self) -> bool {
        !matches!(self, CallState::Failed | CallState::Destroyed)
    }

    /// Check if the outbound leg has not answered yet
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            CallState::Idle
                | CallState::Resolving
                | CallState::Anchoring
                | CallState::Offering
                | CallState::Ringing
                | CallState::Answering
        )
    }

    pub fn is_bridged(&self) -> bool {
        matches!(self, CallState::Bridged)
    }

    /// Get state name
    pub fn name(&self) -> &'static str {
        match self {
            CallState::Idle => "Idle",
            CallState::Resolving => "Resolving",
            CallState::Anchoring => "Anchoring",
            CallState::Offering => "Offering",
            CallState::Ringing => "Ringing",
            CallState::Answering => "Answering",
            CallState::Bridged => "Bridged",
            CallState::Failed => "Failed",
            CallState::Destroyed => "Destroyed",
        }
    }
}

/// Call Statistics
#[derive(Debug, Clone)]
pub struct CallStats {
    /// When the call was created
    pub created_at: Instant,
    /// When the call was bridged (if applicable)
    pub answered_at: Option<Instant>,
    /// When the call ended (if applicable)
    pub ended_at: Option<Instant>,
    /// Number of provisional responses seen on the outbound leg
    pub provisional_count: u32,
}

impl CallStats {
    pub fn new() -> Self {
        Self {
            created_at: Instant::now(),
            answered_at: None,
            ended_at: None,
            provisional_count: 0,
        }
    }

    /// Get call setup duration (time from created to bridged)
    pub fn setup_duration(&self) -> Option<std::time::Duration> {
        self.answered_at.map(|t| t.duration_since(self.created_at))
    }

    /// Get call duration (time from bridged to ended)
    pub fn call_duration(&self) -> Option<std::time::Duration> {
        match (self.answered_at, self.ended_at) {
            (Some(answered), Some(ended)) => Some(ended.duration_since(answered)),
            _ => None,
        }
    }
}

impl Default for CallStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Call State Machine Event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    /// Inbound INVITE accepted for processing
    Invite,
    /// Callee contact found
    Resolved,
    /// Outbound offer prepared by the media anchor
    Anchored,
    /// Outbound leg created
    OutboundCreated,
    /// 1xx received on the outbound leg
    Provisional,
    /// 2xx received on the outbound leg
    Answered,
    /// Inbound leg answered and media bridged
    Bridged,
    /// Either leg hung up
    Hangup,
    /// Any failure before or during setup
    Fail,
    /// Teardown after failure finished
    Cleanup,
}

/// State Machine
#[derive(Debug, Clone)]
pub struct CallStateMachine {
    state: CallState,
    stats: CallStats,
}

impl CallStateMachine {
    pub fn new() -> Self {
        Self {
            state: CallState::Idle,
            stats: CallStats::new(),
        }
    }

    /// Get current state
    pub fn state(&self) -> CallState {
        self.state
    }

    /// Get statistics
    pub fn stats(&self) -> &CallStats {
        &self.stats
    }

    /// Process an event and transition state
    pub fn process_event(&mut self, event: CallEvent) -> Result<CallState> {
        let new_state = match (self.state, event) {
            (CallState::Idle, CallEvent::Invite) => CallState::Resolving,
            (CallState::Resolving, CallEvent::Resolved) => CallState::Anchoring,
            (CallState::Anchoring, CallEvent::Anchored) => CallState::Offering,
            (CallState::Offering, CallEvent::OutboundCreated) => CallState::Ringing,
            (CallState::Ringing, CallEvent::Provisional) => CallState::Ringing,
            (CallState::Ringing, CallEvent::Answered) => CallState::Answering,
            (CallState::Answering, CallEvent::Bridged) => CallState::Bridged,
            (CallState::Bridged, CallEvent::Hangup) => CallState::Destroyed,

            // Any non-terminal state may fail
            (state, CallEvent::Fail) if state.is_active() => CallState::Failed,
            (CallState::Failed, CallEvent::Cleanup) => CallState::Destroyed,

            // Invalid transitions
            (state, event) => {
                return Err(DomainError::InvalidStateTransition(format!(
                    "{} + {:?}",
                    state.name(),
                    event
                )))
            }
        };

        // Update statistics
        match event {
            CallEvent::Provisional => {
                self.stats.provisional_count += 1;
            }
            CallEvent::Bridged => {
                self.stats.answered_at = Some(Instant::now());
            }
            CallEvent::Hangup | CallEvent::Fail => {
                self.stats.ended_at = Some(Instant::now());
            }
            _ => {}
        }

        self.state = new_state;
        Ok(new_state)
    }
}

impl Default for CallStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
