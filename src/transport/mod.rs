use std::net::{IpAddr, SocketAddr};
use serde::{Deserialize, Serialize};
use rand::seq::SliceRandom;

pub mod error;
pub mod message;
pub mod channel;
pub mod codec;
pub mod udp;
pub mod holepunch;

// Re-export main types
pub use error::{TransportError, ErrorSeverity, ErrorCategory, ErrorContext, ContextualError};
pub use message::{Message, Command, MessageType, Buffer};
pub use channel::{
    ChannelFactory, ChannelFilter, ChannelHandle, Messenger, Dispatcher, PeerReachability,
    HandlerConfig, InboundRoute, InboundMessage,
};
pub use udp::{UdpChannelFactory, UdpMessenger, UdpRelay, ReachablePeers};
pub use holepunch::{
    HolePuncher, PunchContext, InitiatorOutcome, ForwardReport, ForwardedSend, ForwardFailure,
    Acknowledgement, ResponderSession, HolePunchRpc,
    join::{CountdownJoin, CompletionSignal, BindOutcome, BindFailure, BindPolicy, bind_channels, bind_with_policy},
    state::{PunchRole, PunchState, PunchEvent, PunchStateMachine},
    builders::{PortMapping, build_port_mappings},
    validation::{ReplyRejection, PortPair, validate_reply, reply_port_pairs},
    scheduler::{PunchScheduler, ScheduledPunch, TokioPunchScheduler},
};

/// Unique identifier for a peer in the network
pub type PeerId = String;

/// A socket address a peer can be reached through (typically one of its relays)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PeerSocketAddress {
    pub ip: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
}

impl PeerSocketAddress {
    pub fn new(ip: IpAddr, tcp_port: u16, udp_port: u16) -> Self {
        Self { ip, tcp_port, udp_port }
    }

    /// Build from a UDP socket address, reusing the UDP port for TCP
    pub fn from_udp(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port(), addr.port())
    }

    pub fn udp_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }
}

/// Addressing information carried in every protocol message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerAddress {
    /// Unique identifier of the peer
    pub peer_id: PeerId,
    /// Address the peer is (believed to be) reachable on
    pub ip: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
    /// Whether inbound TCP is blocked by a firewall/NAT
    pub firewalled_tcp: bool,
    /// Whether inbound UDP is blocked by a firewall/NAT
    pub firewalled_udp: bool,
    /// Whether the peer is only reachable through relays
    pub relayed: bool,
    /// Relays currently serving this peer
    #[serde(default)]
    pub relays: Vec<PeerSocketAddress>,
}

impl PeerAddress {
    /// Create a new, directly reachable PeerAddress
    pub fn new(peer_id: impl Into<PeerId>, ip: IpAddr, tcp_port: u16, udp_port: u16) -> Self {
        Self {
            peer_id: peer_id.into(),
            ip,
            tcp_port,
            udp_port,
            firewalled_tcp: false,
            firewalled_udp: false,
            relayed: false,
            relays: Vec::new(),
        }
    }

    pub fn udp_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    pub fn tcp_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    /// Copy with new ports; `None` keeps the current TCP port
    pub fn change_ports(&self, tcp_port: Option<u16>, udp_port: u16) -> Self {
        Self {
            tcp_port: tcp_port.unwrap_or(self.tcp_port),
            udp_port,
            ..self.clone()
        }
    }

    pub fn change_address(&self, ip: IpAddr) -> Self {
        Self { ip, ..self.clone() }
    }

    pub fn change_firewalled_tcp(&self, firewalled: bool) -> Self {
        Self { firewalled_tcp: firewalled, ..self.clone() }
    }

    pub fn change_firewalled_udp(&self, firewalled: bool) -> Self {
        Self { firewalled_udp: firewalled, ..self.clone() }
    }

    pub fn change_relayed(&self, relayed: bool) -> Self {
        Self { relayed, ..self.clone() }
    }

    /// Copy pointing at `udp_port` with every firewall and relay flag cleared
    pub fn punched(&self, udp_port: u16) -> Self {
        Self {
            udp_port,
            firewalled_tcp: false,
            firewalled_udp: false,
            relayed: false,
            ..self.clone()
        }
    }

    /// Register a relay for this peer
    pub fn add_relay(&mut self, relay: PeerSocketAddress) {
        if !self.relays.contains(&relay) {
            self.relays.push(relay);
        }
    }

    /// Pick one of the advertised relays at random
    pub fn random_relay(&self) -> Option<PeerSocketAddress> {
        self.relays.choose(&mut rand::thread_rng()).copied()
    }
}
