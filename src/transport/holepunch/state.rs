use std::fmt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::transport::TransportError;

/// Which side of the exchange a session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PunchRole {
    /// Builds channels, sends the offer through the relay, forwards the original message
    Initiator,
    /// Answers an offer, replies with the pairing and punches toward the initiator
    Responder,
}

/// Named states of a hole punching session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PunchState {
    Idle,
    Binding,
    /// Initiator: offer is out, waiting for the relay reply
    AwaitingReply,
    /// Initiator: reply accepted, forwarding over matched channels
    Forwarding,
    /// Responder: Reply-OK handed back, retry scheduled
    Replied,
    /// Responder: sending punch packets
    Punching,
    Completed,
    Failed,
}

impl PunchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PunchState::Completed | PunchState::Failed)
    }
}

impl fmt::Display for PunchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Events driving the session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PunchEvent {
    Start,
    ChannelsBound,
    OfferSent,
    ReplyAccepted,
    ForwardsAttempted,
    ReplyBuilt,
    RetryFired,
    PunchesSent,
    Fail,
}

/// Transition table. `None` means the event is not valid in that state.
pub fn transition(role: PunchRole, state: PunchState, event: PunchEvent) -> Option<PunchState> {
    use PunchEvent as E;
    use PunchRole::*;
    use PunchState as S;

    match (role, state, event) {
        (_, s, E::Fail) if !s.is_terminal() => Some(S::Failed),

        (_, S::Idle, E::Start) => Some(S::Binding),

        (Initiator, S::Binding, E::ChannelsBound) => Some(S::Binding),
        (Initiator, S::Binding, E::OfferSent) => Some(S::AwaitingReply),
        (Initiator, S::AwaitingReply, E::ReplyAccepted) => Some(S::Forwarding),
        (Initiator, S::Forwarding, E::ForwardsAttempted) => Some(S::Completed),

        (Responder, S::Binding, E::ChannelsBound) => Some(S::Binding),
        (Responder, S::Binding, E::ReplyBuilt) => Some(S::Replied),
        (Responder, S::Replied, E::RetryFired) => Some(S::Punching),
        (Responder, S::Punching, E::PunchesSent) => Some(S::Completed),

        _ => None,
    }
}

/// Session state published through a watch channel.
///
/// The machine is owned by whichever stage currently drives the session;
/// observers only ever hold receivers.
#[derive(Debug)]
pub struct PunchStateMachine {
    role: PunchRole,
    sender: watch::Sender<PunchState>,
}

impl PunchStateMachine {
    pub fn new(role: PunchRole) -> Self {
        let (sender, _) = watch::channel(PunchState::Idle);
        Self { role, sender }
    }

    pub fn role(&self) -> PunchRole {
        self.role
    }

    pub fn state(&self) -> PunchState {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PunchState> {
        self.sender.subscribe()
    }

    /// Apply `event`, rejecting transitions missing from the table
    pub fn advance(&self, event: PunchEvent) -> Result<PunchState, TransportError> {
        let state = self.state();
        let next = transition(self.role, state, event)
            .ok_or(TransportError::InvalidTransition { state, event })?;
        self.sender.send_replace(next);
        Ok(next)
    }

    /// Move to `Failed` unless already terminal
    pub fn fail(&self) {
        let _ = self.advance(PunchEvent::Fail);
    }
}
