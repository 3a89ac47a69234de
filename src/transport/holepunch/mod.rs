//! UDP hole punching through a rendezvous relay.
//!
//! The initiator binds N channels, offers their ports through the relay,
//! and once the responder answers with (offered, bound) pairs it forwards
//! the original message over every matched channel. The responder binds its
//! own N channels, replies with the pairing and, after a scheduled delay,
//! punches toward the initiator's offered ports.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub mod builders;
pub mod join;
pub mod rpc;
pub mod scheduler;
pub mod state;
pub mod validation;

pub use rpc::HolePunchRpc;

use builders::{PortMapping, build_forward, build_offer, build_port_mappings, build_punch, build_reply};
use join::bind_with_policy;
use scheduler::{PunchScheduler, ScheduledPunch};
use state::{PunchEvent, PunchRole, PunchState, PunchStateMachine};
use validation::{PortPair, reply_port_pairs};

use crate::config::HolePunchConfig;
use crate::transport::{
    ChannelFactory, ChannelHandle, Command, ContextualError, Dispatcher, ErrorContext, ErrorSeverity,
    HandlerConfig, InboundMessage, Message, MessageType, Messenger, PeerAddress, PeerReachability,
    TransportError,
};

/// Collaborators and settings shared by the sessions of one peer
#[derive(Clone)]
pub struct PunchContext {
    /// This peer's own address
    pub local_peer: PeerAddress,
    pub channel_factory: Arc<dyn ChannelFactory>,
    pub messenger: Arc<dyn Messenger>,
    /// Routes traffic arriving on responder channels; required by responders
    pub dispatcher: Option<Arc<dyn Dispatcher>>,
    pub reachability: Arc<dyn PeerReachability>,
    pub scheduler: Arc<dyn PunchScheduler>,
    pub config: HolePunchConfig,
}

/// A successful forward of the original message over one punched pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedSend {
    pub pair: PortPair,
    pub local_addr: SocketAddr,
}

/// A pair the original message could not be forwarded over
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardFailure {
    pub pair: PortPair,
    pub reason: String,
}

/// Completion signal: every pair of the reply has been attempted
#[derive(Debug, Clone, Default)]
pub struct ForwardReport {
    pub sent: Vec<ForwardedSend>,
    pub failures: Vec<ForwardFailure>,
}

impl ForwardReport {
    pub fn attempted(&self) -> usize {
        self.sent.len() + self.failures.len()
    }

    pub fn all_sent(&self) -> bool {
        self.failures.is_empty() && !self.sent.is_empty()
    }
}

/// Completion signal: the first application-level answer on a punched channel
#[derive(Debug)]
pub struct Acknowledgement {
    command: Command,
    receiver: mpsc::UnboundedReceiver<InboundMessage>,
    cancel: CancellationToken,
}

impl Acknowledgement {
    /// Wait for an OK carrying the original command.
    ///
    /// Other traffic on the punched channels (punch packets, unrelated
    /// replies) is skipped.
    pub async fn wait(mut self, limit: Duration) -> Result<InboundMessage, TransportError> {
        let deadline = Instant::now() + limit;
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TransportError::Cancelled),
                received = timeout_at(deadline, self.receiver.recv()) => received,
            };
            match received {
                Err(_) => return Err(TransportError::AcknowledgementTimeout { timeout: limit }),
                Ok(None) => return Err(TransportError::SessionClosed),
                Ok(Some(inbound)) => {
                    if inbound.message.is(self.command, MessageType::Ok) {
                        return Ok(inbound);
                    }
                    debug!("not acknowledged yet, got {} from {}", inbound.message, inbound.source);
                }
            }
        }
    }
}

/// Everything an initiator session produced
#[derive(Debug)]
pub struct InitiatorOutcome {
    pub session_id: Uuid,
    pub report: ForwardReport,
    pub acknowledgement: Acknowledgement,
    /// Punched channels; dropping the outcome releases them
    pub channels: Vec<ChannelHandle>,
    pub relay_channel: ChannelHandle,
    cancel: CancellationToken,
}

impl InitiatorOutcome {
    /// Stop every receive loop and pending wait of the session
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// One hole punching attempt, in either role
pub struct HolePuncher {
    session_id: Uuid,
    context: PunchContext,
    number_of_holes: usize,
    original: Message,
    state: PunchStateMachine,
    cancel: CancellationToken,
}

impl HolePuncher {
    /// Session that delivers `original` to its relayed recipient
    pub fn initiator(context: PunchContext, number_of_holes: usize, original: Message) -> Self {
        Self::new(PunchRole::Initiator, context, number_of_holes, original)
    }

    /// Session answering the inbound `offer`
    pub fn responder(context: PunchContext, number_of_holes: usize, offer: Message) -> Self {
        Self::new(PunchRole::Responder, context, number_of_holes, offer)
    }

    fn new(role: PunchRole, context: PunchContext, number_of_holes: usize, original: Message) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            context,
            number_of_holes,
            original,
            state: PunchStateMachine::new(role),
            cancel: CancellationToken::new(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn role(&self) -> PunchRole {
        self.state.role()
    }

    pub fn state(&self) -> PunchState {
        self.state.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<PunchState> {
        self.state.subscribe()
    }

    /// Token aborting every outstanding bind, send and wait of this session
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn config(&self) -> &HolePunchConfig {
        &self.context.config
    }

    fn peer_id(&self) -> &str {
        match self.role() {
            PunchRole::Initiator => &self.original.recipient.peer_id,
            PunchRole::Responder => &self.original.sender.peer_id,
        }
    }

    /// Mark the session failed, release its channels and log why
    fn abort(&self, operation: &str, error: TransportError) -> TransportError {
        self.state.fail();
        self.cancel.cancel();
        let context = ErrorContext::new(operation)
            .with_session(self.session_id)
            .with_peer_id(self.peer_id().to_string())
            .add_info("holes", self.number_of_holes.to_string())
            .add_info("recoverable", error.is_recoverable().to_string());
        let message = ContextualError::new(error.clone(), context).log_message();
        match error.severity() {
            ErrorSeverity::Info => info!("{}", message),
            ErrorSeverity::Warning => warn!("{}", message),
            _ => error!("{}", message),
        }
        error
    }

    /// Run the initiator procedure
    pub async fn initiate(self) -> Result<InitiatorOutcome, TransportError> {
        if self.role() != PunchRole::Initiator {
            return Err(TransportError::InvalidTransition { state: self.state(), event: PunchEvent::OfferSent });
        }
        match self.run_initiator().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(self.abort("initiate hole punch", e)),
        }
    }

    async fn run_initiator(&self) -> Result<InitiatorOutcome, TransportError> {
        let config = self.config();
        self.state.advance(PunchEvent::Start)?;

        let relay = self.original.recipient.random_relay().ok_or_else(|| TransportError::NoRelayAvailable {
            peer_id: self.original.recipient.peer_id.clone(),
        })?;

        let (ack_sender, ack_receiver) = mpsc::unbounded_channel();
        let handlers = HandlerConfig::session(ack_sender, config.idle_timeout, config.broadcast)
            .with_cancel(self.cancel.clone());
        let outcome = bind_with_policy(
            self.context.channel_factory.clone(),
            self.number_of_holes,
            &handlers,
            config.bind_policy,
            &self.cancel,
        )
        .await?;
        for failure in &outcome.failures {
            warn!("session {}: bind {} failed: {}", self.session_id, failure.attempt, failure.reason);
        }
        let channels = outcome.bound;
        self.state.advance(PunchEvent::ChannelsBound)?;

        let offer = build_offer(&self.original, relay, &channels);
        let (reply_sender, mut reply_receiver) = mpsc::unbounded_channel();
        let relay_handlers = HandlerConfig::session(reply_sender, config.idle_timeout, config.broadcast)
            .with_cancel(self.cancel.clone());
        let relay_channel = self
            .context
            .messenger
            .send_via_relay(relay_handlers, offer, config.idle_timeout, config.broadcast)
            .await?;
        self.state.advance(PunchEvent::OfferSent)?;
        info!(
            "session {}: offered {} ports to {} via relay {}",
            self.session_id,
            channels.len(),
            self.original.recipient.peer_id,
            relay.udp_socket_addr()
        );

        let reply = self.await_reply(&mut reply_receiver).await?;
        let pairs = reply_port_pairs(&reply.message)?;
        self.state.advance(PunchEvent::ReplyAccepted)?;

        let report = self.forward(&channels, &pairs).await;
        self.state.advance(PunchEvent::ForwardsAttempted)?;
        info!(
            "session {}: forwarded over {} of {} pairs",
            self.session_id,
            report.sent.len(),
            pairs.len()
        );

        Ok(InitiatorOutcome {
            session_id: self.session_id,
            report,
            acknowledgement: Acknowledgement {
                command: self.original.command,
                receiver: ack_receiver,
                cancel: self.cancel.clone(),
            },
            channels,
            relay_channel,
            cancel: self.cancel.clone(),
        })
    }

    async fn await_reply(
        &self,
        receiver: &mut mpsc::UnboundedReceiver<InboundMessage>,
    ) -> Result<InboundMessage, TransportError> {
        let limit = self.config().relay_reply_timeout;
        let received = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TransportError::Cancelled),
            received = timeout(limit, receiver.recv()) => received,
        };
        match received {
            Err(_) => Err(TransportError::RelayReplyTimeout { timeout: limit }),
            Ok(None) => Err(TransportError::RelayClosed),
            Ok(Some(reply)) => {
                debug!("session {}: relay reply {} from {}", self.session_id, reply.message, reply.source);
                Ok(reply)
            }
        }
    }

    async fn forward(&self, channels: &[ChannelHandle], pairs: &[PortPair]) -> ForwardReport {
        let mut report = ForwardReport::default();

        for pair in pairs {
            let Some(channel) = channels.iter().find(|c| c.local_port() == pair.local_port) else {
                warn!("session {}: no channel bound to local port {}", self.session_id, pair.local_port);
                report.failures.push(ForwardFailure {
                    pair: *pair,
                    reason: format!("no channel bound to local port {}", pair.local_port),
                });
                continue;
            };

            let message = build_forward(&self.original, *pair);
            let remote = message.recipient.udp_socket_addr();
            match self.context.messenger.send_direct(message, channel, false).await {
                Ok(()) => report.sent.push(ForwardedSend {
                    pair: *pair,
                    local_addr: channel.local_addr(),
                }),
                Err(e) => {
                    let context = ErrorContext::new("forward original message")
                        .with_session(self.session_id)
                        .with_addresses(channel.local_addr(), remote);
                    warn!("{}", ContextualError::new(e.clone(), context).log_message());
                    report.failures.push(ForwardFailure { pair: *pair, reason: e.to_string() });
                }
            }
        }

        report
    }

    /// Run the responder procedure, returning the Reply-OK to send back
    /// through the relay. A second punch attempt is scheduled before
    /// returning.
    pub async fn reply(self) -> Result<Message, TransportError> {
        if self.role() != PunchRole::Responder {
            return Err(TransportError::InvalidTransition { state: self.state(), event: PunchEvent::ReplyBuilt });
        }
        let prepared = match self.prepare_reply().await {
            Ok(prepared) => prepared,
            Err(e) => return Err(self.abort("reply to hole punch", e)),
        };
        if let Err(e) = self.state.advance(PunchEvent::ReplyBuilt) {
            return Err(self.abort("reply to hole punch", e));
        }

        let delay = self.config().retry_delay;
        let scheduler = self.context.scheduler.clone();
        let reply = prepared.reply.clone();
        info!(
            "session {}: replying with {} port pairs to {}",
            self.session_id,
            reply.int_list.len() / 2,
            prepared.requester.peer_id
        );

        let session = Arc::new(ResponderSession {
            session_id: self.session_id,
            local_peer: self.context.local_peer.clone(),
            requester: prepared.requester,
            channels: prepared.channels,
            mappings: prepared.mappings,
            messenger: self.context.messenger.clone(),
            reachability: self.context.reachability.clone(),
            state: self.state,
            cancel: self.cancel,
        });
        scheduler.schedule(delay, session);

        Ok(reply)
    }

    async fn prepare_reply(&self) -> Result<PreparedReply, TransportError> {
        let config = self.config();
        self.state.advance(PunchEvent::Start)?;

        if !self.original.is(Command::HOLE_PUNCH, MessageType::OFFER) {
            return Err(TransportError::violation(format!("expected a hole punch offer, got {}", self.original)));
        }
        let requester = self.original.requester.clone().ok_or_else(|| TransportError::AddressDerivation {
            reason: format!("offer {} carries no requester address", self.original.message_id),
        })?;
        let dispatcher = self.context.dispatcher.clone().ok_or_else(|| TransportError::ConfigurationError {
            field: "dispatcher".to_string(),
            reason: "responder channels need a dispatcher".to_string(),
        })?;

        let handlers = HandlerConfig::dispatcher(dispatcher, config.idle_timeout, config.broadcast)
            .with_cancel(self.cancel.clone());
        let outcome = bind_with_policy(
            self.context.channel_factory.clone(),
            self.number_of_holes,
            &handlers,
            config.bind_policy,
            &self.cancel,
        )
        .await?;
        for failure in &outcome.failures {
            warn!("session {}: bind {} failed: {}", self.session_id, failure.attempt, failure.reason);
        }
        self.state.advance(PunchEvent::ChannelsBound)?;

        let mappings = build_port_mappings(&self.original.int_list, &outcome.bound);
        if mappings.iter().all(|m| m.remote_port.is_none()) {
            return Err(TransportError::violation("offer contains no usable ports"));
        }
        let reply = build_reply(&self.original, &self.context.local_peer, &mappings);

        Ok(PreparedReply {
            requester,
            channels: outcome.bound,
            mappings,
            reply,
        })
    }
}

struct PreparedReply {
    requester: PeerAddress,
    channels: Vec<ChannelHandle>,
    mappings: Vec<PortMapping>,
    reply: Message,
}

/// Responder state after the reply, frozen and handed to the scheduler
pub struct ResponderSession {
    session_id: Uuid,
    local_peer: PeerAddress,
    requester: PeerAddress,
    channels: Vec<ChannelHandle>,
    mappings: Vec<PortMapping>,
    messenger: Arc<dyn Messenger>,
    reachability: Arc<dyn PeerReachability>,
    state: PunchStateMachine,
    cancel: CancellationToken,
}

impl ResponderSession {
    pub fn requester(&self) -> &PeerAddress {
        &self.requester
    }

    pub fn mappings(&self) -> &[PortMapping] {
        &self.mappings
    }

    pub fn channels(&self) -> &[ChannelHandle] {
        &self.channels
    }

    pub fn state(&self) -> PunchState {
        self.state.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<PunchState> {
        self.state.subscribe()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn punch(&self) -> Result<usize, TransportError> {
        self.state.advance(PunchEvent::RetryFired)?;

        let mut sent = 0;
        for (channel, mapping) in self.channels.iter().zip(&self.mappings) {
            let Some(punch) = build_punch(&self.local_peer, &self.requester, mapping) else {
                continue;
            };
            match self.messenger.send_direct(punch, channel, true).await {
                Ok(()) => {
                    sent += 1;
                    self.reachability.peer_found(&self.requester, &self.requester, None).await;
                }
                Err(e) => warn!("session {}: punch from port {} failed: {}", self.session_id, mapping.local_port, e),
            }
        }

        self.state.advance(PunchEvent::PunchesSent)?;
        debug!("session {}: {} punches toward {}", self.session_id, sent, self.requester.peer_id);
        Ok(sent)
    }
}

#[async_trait]
impl ScheduledPunch for ResponderSession {
    fn session_id(&self) -> Uuid {
        self.session_id
    }

    async fn try_connect(&self) -> Result<usize, TransportError> {
        if self.cancel.is_cancelled() {
            self.state.fail();
            return Err(TransportError::Cancelled);
        }
        // a repeated fire leaves the finished session and its channels alone
        let state = self.state.state();
        if state.is_terminal() {
            return Err(TransportError::InvalidTransition { state, event: PunchEvent::RetryFired });
        }
        match self.punch().await {
            Ok(sent) => Ok(sent),
            Err(e) => {
                self.state.fail();
                self.cancel.cancel();
                warn!("session {}: punching toward {} failed: {}", self.session_id, self.requester.peer_id, e);
                Err(e)
            }
        }
    }
}
