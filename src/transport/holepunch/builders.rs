//! Message construction for the three hole punching phases.

use serde::{Deserialize, Serialize};

use super::validation::PortPair;
use crate::transport::{
    Buffer, ChannelHandle, Command, Message, MessageType, PeerAddress, PeerSocketAddress,
};

/// Responder-side pairing of an offered port with a locally bound port.
///
/// `remote_port` is `None` when the offer had no usable port at that
/// position; such entries are never put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub remote_port: Option<u16>,
    pub local_port: u16,
}

/// Pair offered ports with bound channels index by index
pub fn build_port_mappings(offered: &[i32], channels: &[ChannelHandle]) -> Vec<PortMapping> {
    channels
        .iter()
        .enumerate()
        .map(|(i, channel)| PortMapping {
            remote_port: offered
                .get(i)
                .and_then(|&port| u16::try_from(port).ok())
                .filter(|port| *port != 0),
            local_port: channel.local_port(),
        })
        .collect()
}

/// Offer sent to the relay, listing every bound local port unpaired
pub fn build_offer(original: &Message, relay: PeerSocketAddress, channels: &[ChannelHandle]) -> Message {
    let recipient = original
        .recipient
        .change_address(relay.ip)
        .change_ports(Some(relay.tcp_port), relay.udp_port)
        .change_relayed(false);

    let mut offer = Message::new(Command::HOLE_PUNCH, MessageType::OFFER, original.sender.clone(), recipient);
    offer.version = original.version;
    offer.udp = true;
    offer.requester = Some(original.sender.clone());
    for channel in channels {
        offer.push_int(i32::from(channel.local_port()));
    }
    offer
}

/// Copy of the original message retargeted at one punched port pair.
///
/// Payload buffers are duplicated, never shared, so every copy keeps its
/// own read position.
pub fn build_forward(original: &Message, pair: PortPair) -> Message {
    Message {
        message_id: original.message_id,
        version: original.version,
        command: original.command,
        message_type: original.message_type,
        sender: original.sender.punched(pair.local_port),
        recipient: original.recipient.punched(pair.remote_port),
        int_list: original.int_list.clone(),
        buffers: original.buffers.iter().map(Buffer::duplicate).collect(),
        udp: true,
        fire_and_forget: original.fire_and_forget,
        requester: None,
    }
}

/// Reply-OK carrying (offered, bound) pairs in mapping order
pub fn build_reply(offer: &Message, local: &PeerAddress, mappings: &[PortMapping]) -> Message {
    let mut reply = Message::new(Command::HOLE_PUNCH, MessageType::Ok, local.clone(), offer.sender.clone())
        .with_message_id(offer.message_id);
    reply.version = offer.version;
    reply.udp = true;

    for mapping in mappings {
        if let Some(remote_port) = mapping.remote_port {
            reply.push_int(i32::from(remote_port));
            reply.push_int(i32::from(mapping.local_port));
        }
    }
    reply
}

/// Payload-free punch packet from `mapping.local_port` toward the requester
pub fn build_punch(local: &PeerAddress, requester: &PeerAddress, mapping: &PortMapping) -> Option<Message> {
    let remote_port = mapping.remote_port?;
    let recipient = requester
        .change_firewalled_udp(false)
        .change_relayed(false)
        .change_ports(None, remote_port);
    let sender = local.change_ports(None, mapping.local_port);

    let mut punch = Message::new(Command::HOLE_PUNCH, MessageType::PUNCH, sender, recipient);
    punch.udp = true;
    punch.fire_and_forget = true;
    Some(punch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    fn channel(port: u16) -> ChannelHandle {
        ChannelHandle::detached(SocketAddr::new(localhost(), port))
    }

    fn original() -> Message {
        let sender = PeerAddress::new("alice", localhost(), 4000, 4001).change_firewalled_udp(true);
        let mut recipient = PeerAddress::new("bob", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 4100, 4101)
            .change_firewalled_udp(true)
            .change_relayed(true);
        recipient.add_relay(PeerSocketAddress::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), 7000, 7001));

        let mut message = Message::new(Command::DIRECT_DATA, MessageType::Request1, sender, recipient)
            .with_message_id(77);
        message.push_buffer(Buffer::new(&b"first"[..]));
        message.push_buffer(Buffer::new(&b"second"[..]));
        message
    }

    #[test]
    fn test_offer_lists_bound_ports() {
        let original = original();
        let relay = original.recipient.relays[0];
        let offer = build_offer(&original, relay, &[channel(5000), channel(5001)]);

        assert!(offer.is(Command::HOLE_PUNCH, MessageType::OFFER));
        assert!(offer.udp);
        assert_eq!(offer.int_list, vec![5000, 5001]);
        assert_eq!(offer.recipient.peer_id, "bob");
        assert_eq!(offer.recipient.udp_socket_addr(), relay.udp_socket_addr());
        assert_eq!(offer.recipient.tcp_port, 7000);
        assert!(!offer.recipient.relayed);
        assert_eq!(offer.sender, original.sender);
        assert_eq!(offer.requester.as_ref(), Some(&original.sender));
        assert!(offer.buffers.is_empty());
    }

    #[test]
    fn test_forward_copies_are_independent() {
        let original = original();
        let mut first = build_forward(&original, PortPair { local_port: 100, remote_port: 200 });
        let mut second = build_forward(&original, PortPair { local_port: 101, remote_port: 201 });

        assert_eq!(&first.buffers[0].read_all()[..], b"first");
        assert_eq!(&first.buffers[1].read_all()[..], b"second");
        assert_eq!(first.buffers[0].remaining(), 0);

        assert_eq!(second.buffers[0].remaining(), 5);
        assert_eq!(&second.buffers[0].read_all()[..], b"first");
        assert_eq!(&second.buffers[1].read_all()[..], b"second");
        assert_eq!(original.buffers[1].remaining(), 6);
    }

    #[test]
    fn test_forward_rewrites_addresses() {
        let original = original();
        let forward = build_forward(&original, PortPair { local_port: 100, remote_port: 200 });

        assert_eq!(forward.message_id, 77);
        assert_eq!(forward.command, Command::DIRECT_DATA);
        assert_eq!(forward.message_type, MessageType::Request1);
        assert!(forward.udp);
        assert_eq!(forward.sender.udp_port, 100);
        assert_eq!(forward.recipient.udp_port, 200);
        assert_eq!(forward.recipient.ip, original.recipient.ip);
        assert!(!forward.sender.firewalled_udp);
        assert!(!forward.recipient.firewalled_udp);
        assert!(!forward.recipient.relayed);
    }

    #[test]
    fn test_mappings_and_reply_interleave() {
        let offer = {
            let mut offer = Message::new(
                Command::HOLE_PUNCH,
                MessageType::OFFER,
                original().sender,
                PeerAddress::new("bob", localhost(), 1, 1),
            );
            offer.int_list = vec![100, 101];
            offer
        };

        let mappings = build_port_mappings(&offer.int_list, &[channel(5000), channel(5001)]);
        assert_eq!(
            mappings,
            vec![
                PortMapping { remote_port: Some(100), local_port: 5000 },
                PortMapping { remote_port: Some(101), local_port: 5001 },
            ]
        );

        let local = PeerAddress::new("bob", localhost(), 1, 1);
        let reply = build_reply(&offer, &local, &mappings);
        assert!(reply.is(Command::HOLE_PUNCH, MessageType::Ok));
        assert_eq!(reply.message_id, offer.message_id);
        assert_eq!(reply.recipient.peer_id, "alice");
        assert_eq!(reply.int_list, vec![100, 5000, 101, 5001]);
    }

    #[test]
    fn test_reply_skips_unusable_mappings() {
        let mappings = build_port_mappings(&[100, -5], &[channel(5000), channel(5001), channel(5002)]);
        assert_eq!(mappings.len(), 3);
        assert_eq!(mappings[1].remote_port, None);
        assert_eq!(mappings[2].remote_port, None);

        let local = PeerAddress::new("bob", localhost(), 1, 1);
        let reply = build_reply(&original(), &local, &mappings);
        assert_eq!(reply.int_list, vec![100, 5000]);
    }

    #[test]
    fn test_punch_is_minimal() {
        let requester = original().sender.change_relayed(true);
        let local = PeerAddress::new("bob", localhost(), 1, 1);

        let punch = build_punch(&local, &requester, &PortMapping { remote_port: Some(100), local_port: 5000 }).unwrap();
        assert!(punch.is(Command::HOLE_PUNCH, MessageType::PUNCH));
        assert!(punch.fire_and_forget);
        assert!(punch.buffers.is_empty());
        assert!(punch.int_list.is_empty());
        assert_eq!(punch.sender.udp_port, 5000);
        assert_eq!(punch.recipient.udp_port, 100);
        assert!(!punch.recipient.firewalled_udp);
        assert!(!punch.recipient.relayed);

        assert!(build_punch(&local, &requester, &PortMapping { remote_port: None, local_port: 5000 }).is_none());
    }
}
