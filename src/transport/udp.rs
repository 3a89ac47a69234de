//! Tokio UDP implementations of the channel, messaging, relay and
//! reachability collaborators.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use log::{debug, info, trace, warn};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;

use super::codec::{self, MAX_DATAGRAM_SIZE};
use super::{
    ChannelFactory, ChannelFilter, ChannelHandle, HandlerConfig, InboundMessage, InboundRoute, Message,
    Messenger, PeerAddress, PeerId, PeerReachability, PeerSocketAddress, TransportError,
};

/// Binds real UDP sockets on ephemeral ports and drives their receive loops
#[derive(Debug, Clone)]
pub struct UdpChannelFactory {
    bind_ip: IpAddr,
    shutdown: CancellationToken,
}

impl UdpChannelFactory {
    pub fn new(bind_ip: IpAddr) -> Self {
        Self {
            bind_ip,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn localhost() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    pub fn bind_ip(&self) -> IpAddr {
        self.bind_ip
    }

    /// Close every channel this factory has bound
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl ChannelFactory for UdpChannelFactory {
    async fn bind_channel(
        &self,
        broadcast: bool,
        handlers: HandlerConfig,
        filter: Option<ChannelFilter>,
    ) -> Result<ChannelHandle, TransportError> {
        let socket = UdpSocket::bind(SocketAddr::new(self.bind_ip, 0)).await?;
        if broadcast {
            socket.set_broadcast(true)?;
        }
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        debug!("bound channel {} ({:?}, idle {:?})", local_addr, handlers.route, handlers.idle_timeout);

        tokio::spawn(receive_loop(
            socket.clone(),
            local_addr,
            handlers,
            filter,
            self.shutdown.clone(),
        ));

        Ok(ChannelHandle::new(local_addr, socket))
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    handlers: HandlerConfig,
    filter: Option<ChannelFilter>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = handlers.cancel.cancelled() => break,
            received = timeout(handlers.idle_timeout, socket.recv_from(&mut buf)) => received,
        };

        let (len, source) = match received {
            Err(_) => {
                debug!("channel {} idle for {:?}, closing", local_addr, handlers.idle_timeout);
                break;
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                trace!("channel {}: {}", local_addr, e);
                continue;
            }
            Ok(Err(e)) => {
                warn!("channel {} receive failed: {}", local_addr, e);
                break;
            }
            Ok(Ok(received)) => received,
        };

        if let Some(filter) = &filter {
            if !filter(source) {
                trace!("channel {} dropped datagram from {}", local_addr, source);
                continue;
            }
        }

        let message = match codec::decode(&buf[..len]) {
            Ok(message) => message,
            Err(e) => {
                warn!("channel {} got undecodable datagram from {}: {}", local_addr, source, e);
                continue;
            }
        };
        trace!("channel {} received {} from {}", local_addr, message, source);

        match &handlers.route {
            InboundRoute::Session(sender) => {
                if sender.send(InboundMessage { message, source, local_addr }).is_err() {
                    debug!("session behind channel {} is gone, closing", local_addr);
                    break;
                }
            }
            InboundRoute::Dispatcher(dispatcher) => {
                let dispatcher = dispatcher.clone();
                let socket = socket.clone();
                tokio::spawn(async move {
                    let Some(response) = dispatcher.dispatch(message, source).await else {
                        return;
                    };
                    let sent = match codec::encode(&response) {
                        Ok(bytes) => socket.send_to(&bytes, source).await.map_err(TransportError::from),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = sent {
                        warn!("channel {} could not answer {}: {}", local_addr, source, e);
                    }
                });
            }
        }
    }
}

/// Sends messages over channels from a [`ChannelFactory`]
#[derive(Clone)]
pub struct UdpMessenger {
    factory: Arc<dyn ChannelFactory>,
}

impl UdpMessenger {
    pub fn new(factory: Arc<dyn ChannelFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl Messenger for UdpMessenger {
    async fn send_via_relay(
        &self,
        handlers: HandlerConfig,
        message: Message,
        idle_timeout: Duration,
        broadcast: bool,
    ) -> Result<ChannelHandle, TransportError> {
        let handlers = HandlerConfig {
            idle_timeout,
            broadcast,
            ..handlers
        };
        let channel = self.factory.bind_channel(broadcast, handlers, None).await?;
        self.send_direct(message, &channel, false).await?;
        Ok(channel)
    }

    async fn send_direct(
        &self,
        mut message: Message,
        channel: &ChannelHandle,
        fire_and_forget: bool,
    ) -> Result<(), TransportError> {
        let socket = channel.socket().ok_or(TransportError::ChannelClosed {
            local_addr: channel.local_addr(),
        })?;
        message.fire_and_forget |= fire_and_forget;

        let target = message.recipient.udp_socket_addr();
        let bytes = codec::encode(&message)?;
        socket.send_to(&bytes, target).await?;
        debug!("sent {} from {} to {}", message, channel.local_addr(), target);
        Ok(())
    }
}

/// How long the relay remembers where to send an answer
pub const DEFAULT_ROUTE_TTL: Duration = Duration::from_secs(30);
/// Upper bound on unanswered requests the relay tracks
pub const MAX_PENDING_ROUTES: usize = 4096;

/// Where the answer to a relayed request goes, until `expires`
#[derive(Debug, Clone, Copy)]
struct PendingRoute {
    origin: SocketAddr,
    expires: Instant,
}

type PendingRoutes = Arc<RwLock<HashMap<u32, PendingRoute>>>;

/// Minimal rendezvous relay.
///
/// Registered peers keep a control address at the relay. Messages whose
/// recipient is registered are forwarded there, and answers from that peer
/// are routed back to the origin by message id. Unanswered requests are
/// forgotten after the route TTL.
pub struct UdpRelay {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    peers: Arc<RwLock<HashMap<PeerId, SocketAddr>>>,
    pending: PendingRoutes,
    route_ttl: Duration,
    shutdown: CancellationToken,
}

impl UdpRelay {
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        info!("relay listening on {}", local_addr);

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            peers: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(RwLock::new(HashMap::new())),
            route_ttl: DEFAULT_ROUTE_TTL,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_route_ttl(mut self, ttl: Duration) -> Self {
        self.route_ttl = ttl;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The relay as advertised in a peer's relay list
    pub fn socket_address(&self) -> PeerSocketAddress {
        PeerSocketAddress::from_udp(self.local_addr)
    }

    pub async fn register_peer(&self, peer_id: impl Into<PeerId>, control_addr: SocketAddr) {
        let peer_id = peer_id.into();
        debug!("relay: {} registered at {}", peer_id, control_addr);
        self.peers.write().await.insert(peer_id, control_addr);
    }

    /// Requests still tracked for their answer, expired ones included
    /// until the next relayed request sweeps them
    pub async fn pending_routes(&self) -> usize {
        self.pending.read().await.len()
    }

    pub fn spawn(&self) -> JoinHandle<()> {
        tokio::spawn(relay_loop(
            self.socket.clone(),
            self.peers.clone(),
            self.pending.clone(),
            self.route_ttl,
            self.shutdown.clone(),
        ))
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn relay_loop(
    socket: Arc<UdpSocket>,
    peers: Arc<RwLock<HashMap<PeerId, SocketAddr>>>,
    pending: PendingRoutes,
    route_ttl: Duration,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let (len, source) = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    trace!("relay receive error: {}", e);
                    continue;
                }
            },
        };

        let message = match codec::decode(&buf[..len]) {
            Ok(message) => message,
            Err(e) => {
                warn!("relay got undecodable datagram from {}: {}", source, e);
                continue;
            }
        };

        let from_registered = peers.read().await.values().any(|addr| *addr == source);
        let answer_route = if from_registered {
            pending
                .write()
                .await
                .remove(&message.message_id)
                .filter(|route| route.expires > Instant::now())
        } else {
            None
        };

        let target = match answer_route {
            Some(route) => Some(route.origin),
            None => {
                let target = peers.read().await.get(&message.recipient.peer_id).copied();
                if target.is_some() && !message.fire_and_forget {
                    remember_route(&pending, message.message_id, source, route_ttl).await;
                }
                target
            }
        };

        match target {
            Some(target) => {
                debug!("relay: {} {} -> {}", message, source, target);
                if let Err(e) = socket.send_to(&buf[..len], target).await {
                    warn!("relay could not forward to {}: {}", target, e);
                }
            }
            None => debug!("relay: no route for {} from {}", message, source),
        }
    }
}

/// Track where the answer to `message_id` goes, sweeping expired routes
/// and refusing new ones once the table is full
async fn remember_route(pending: &PendingRoutes, message_id: u32, origin: SocketAddr, ttl: Duration) {
    let now = Instant::now();
    let mut pending = pending.write().await;
    pending.retain(|_, route| route.expires > now);
    if pending.len() >= MAX_PENDING_ROUTES {
        warn!("relay tracks {} unanswered requests, not routing the answer to {}", pending.len(), origin);
        return;
    }
    pending.insert(message_id, PendingRoute { origin, expires: now + ttl });
}

/// In-memory record of peers observed reachable
#[derive(Debug, Default)]
pub struct ReachablePeers {
    peers: RwLock<HashMap<PeerId, PeerAddress>>,
}

impl ReachablePeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, peer_id: &str) -> Option<PeerAddress> {
        self.peers.read().await.get(peer_id).cloned()
    }

    pub async fn contains(&self, peer_id: &str) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}

#[async_trait]
impl PeerReachability for ReachablePeers {
    async fn peer_found(
        &self,
        observed: &PeerAddress,
        reporter: &PeerAddress,
        referrer: Option<&PeerAddress>,
    ) -> bool {
        trace!(
            "{} reachable on {} (reported by {}, via {:?})",
            observed.peer_id,
            observed.udp_socket_addr(),
            reporter.peer_id,
            referrer.map(|r| &r.peer_id)
        );
        let previous = self.peers.write().await.insert(observed.peer_id.clone(), observed.clone());
        previous.as_ref() != Some(observed)
    }
}
