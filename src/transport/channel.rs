use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{Message, PeerAddress, TransportError};

/// Source-address filter applied to inbound datagrams of a channel
pub type ChannelFilter = Arc<dyn Fn(SocketAddr) -> bool + Send + Sync>;

/// A bound UDP channel owned by exactly one hole punching session
#[derive(Clone)]
pub struct ChannelHandle {
    id: Uuid,
    local_addr: SocketAddr,
    socket: Option<Arc<UdpSocket>>,
}

impl ChannelHandle {
    pub fn new(local_addr: SocketAddr, socket: Arc<UdpSocket>) -> Self {
        Self {
            id: Uuid::new_v4(),
            local_addr,
            socket: Some(socket),
        }
    }

    /// Handle without an OS socket, for in-memory channel factories
    pub fn detached(local_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            local_addr,
            socket: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn socket(&self) -> Option<&Arc<UdpSocket>> {
        self.socket.as_ref()
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("attached", &self.socket.is_some())
            .finish()
    }
}

/// Message received on a channel routed to a session
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message: Message,
    pub source: SocketAddr,
    pub local_addr: SocketAddr,
}

/// Where inbound traffic of a channel goes
#[derive(Clone)]
pub enum InboundRoute {
    /// Straight into the session that owns the channel
    Session(mpsc::UnboundedSender<InboundMessage>),
    /// Through the peer's dispatcher, whose answer is sent back to the source
    Dispatcher(Arc<dyn Dispatcher>),
}

impl fmt::Debug for InboundRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboundRoute::Session(_) => write!(f, "Session"),
            InboundRoute::Dispatcher(_) => write!(f, "Dispatcher"),
        }
    }
}

/// Per-channel handler pipeline configuration
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub route: InboundRoute,
    /// Channel is closed after this long without inbound traffic
    pub idle_timeout: Duration,
    pub broadcast: bool,
    /// Closes the channel when cancelled
    pub cancel: CancellationToken,
}

impl HandlerConfig {
    pub fn configure(route: InboundRoute, idle_timeout: Duration, broadcast: bool) -> Self {
        Self {
            route,
            idle_timeout,
            broadcast,
            cancel: CancellationToken::new(),
        }
    }

    /// Tie the channel's lifetime to `cancel`
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Route inbound messages into a session-owned queue
    pub fn session(
        sender: mpsc::UnboundedSender<InboundMessage>,
        idle_timeout: Duration,
        broadcast: bool,
    ) -> Self {
        Self::configure(InboundRoute::Session(sender), idle_timeout, broadcast)
    }

    /// Route inbound messages through a dispatcher
    pub fn dispatcher(dispatcher: Arc<dyn Dispatcher>, idle_timeout: Duration, broadcast: bool) -> Self {
        Self::configure(InboundRoute::Dispatcher(dispatcher), idle_timeout, broadcast)
    }
}

/// Allocates and binds UDP channels
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn bind_channel(
        &self,
        broadcast: bool,
        handlers: HandlerConfig,
        filter: Option<ChannelFilter>,
    ) -> Result<ChannelHandle, TransportError>;
}

/// Sends protocol messages over relay or direct paths
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send through a freshly bound channel whose inbound traffic follows
    /// `handlers`; the channel is returned so the caller keeps it alive.
    async fn send_via_relay(
        &self,
        handlers: HandlerConfig,
        message: Message,
        idle_timeout: Duration,
        broadcast: bool,
    ) -> Result<ChannelHandle, TransportError>;

    /// Send over an already bound channel
    async fn send_direct(
        &self,
        message: Message,
        channel: &ChannelHandle,
        fire_and_forget: bool,
    ) -> Result<(), TransportError>;
}

/// Handles inbound requests; the returned message is sent back to the source
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, message: Message, source: SocketAddr) -> Option<Message>;
}

/// Informed whenever a peer was observed reachable on some path
#[async_trait]
pub trait PeerReachability: Send + Sync {
    async fn peer_found(
        &self,
        observed: &PeerAddress,
        reporter: &PeerAddress,
        referrer: Option<&PeerAddress>,
    ) -> bool;
}
