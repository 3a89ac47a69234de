use thiserror::Error;

use crate::transport::{Command, Message, MessageType, TransportError};

/// Why a Reply-OK was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplyRejection {
    #[error("could not acquire a connection via hole punching, got command {command} with type {message_type}")]
    UnexpectedMessage { command: Command, message_type: MessageType },

    #[error("port list in reply was empty, no ports available")]
    EmptyPortList,

    #[error("odd number of ports in reply port list ({count})")]
    OddPortCount { count: usize },

    #[error("value {value} at position {position} of the reply port list is not a port")]
    PortOutOfRange { position: usize, value: i32 },
}

impl From<ReplyRejection> for TransportError {
    fn from(rejection: ReplyRejection) -> Self {
        TransportError::violation(rejection.to_string())
    }
}

/// (local, remote) pair as read by the initiator from a Reply-OK
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortPair {
    pub local_port: u16,
    pub remote_port: u16,
}

/// Accept a reply only if it is a hole punch OK with a non-empty, even port list
pub fn validate_reply(reply: &Message) -> Result<(), ReplyRejection> {
    if !reply.is(Command::HOLE_PUNCH, MessageType::Ok) {
        return Err(ReplyRejection::UnexpectedMessage {
            command: reply.command,
            message_type: reply.message_type,
        });
    }
    if reply.int_list.is_empty() {
        return Err(ReplyRejection::EmptyPortList);
    }
    if reply.int_list.len() % 2 != 0 {
        return Err(ReplyRejection::OddPortCount { count: reply.int_list.len() });
    }
    Ok(())
}

/// Validate `reply` and read its port list pairwise.
///
/// All ports are checked before any pair is returned, so a malformed
/// entry anywhere rejects the whole reply.
pub fn reply_port_pairs(reply: &Message) -> Result<Vec<PortPair>, ReplyRejection> {
    validate_reply(reply)?;

    let ports = reply
        .int_list
        .iter()
        .enumerate()
        .map(|(position, &value)| {
            u16::try_from(value)
                .ok()
                .filter(|port| *port != 0)
                .ok_or(ReplyRejection::PortOutOfRange { position, value })
        })
        .collect::<Result<Vec<u16>, _>>()?;

    Ok(ports
        .chunks_exact(2)
        .map(|pair| PortPair {
            local_port: pair[0],
            remote_port: pair[1],
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PeerAddress;
    use std::net::{IpAddr, Ipv4Addr};

    fn reply(command: Command, message_type: MessageType, ports: &[i32]) -> Message {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let mut message = Message::new(
            command,
            message_type,
            PeerAddress::new("bob", localhost, 1, 1),
            PeerAddress::new("alice", localhost, 2, 2),
        );
        message.int_list = ports.to_vec();
        message
    }

    #[test]
    fn test_accepts_even_list() {
        let pairs = reply_port_pairs(&reply(Command::HOLE_PUNCH, MessageType::Ok, &[100, 200, 101, 201])).unwrap();
        assert_eq!(
            pairs,
            vec![
                PortPair { local_port: 100, remote_port: 200 },
                PortPair { local_port: 101, remote_port: 201 },
            ]
        );
    }

    #[test]
    fn test_rejects_wrong_command_or_type() {
        let err = validate_reply(&reply(Command::PING, MessageType::Ok, &[1, 2])).unwrap_err();
        assert_eq!(err, ReplyRejection::UnexpectedMessage { command: Command::PING, message_type: MessageType::Ok });

        let err = validate_reply(&reply(Command::HOLE_PUNCH, MessageType::Denied, &[1, 2])).unwrap_err();
        assert!(matches!(err, ReplyRejection::UnexpectedMessage { message_type: MessageType::Denied, .. }));
    }

    #[test]
    fn test_rejects_empty_list() {
        let err = validate_reply(&reply(Command::HOLE_PUNCH, MessageType::Ok, &[])).unwrap_err();
        assert_eq!(err, ReplyRejection::EmptyPortList);
    }

    #[test]
    fn test_rejects_odd_list() {
        let err = reply_port_pairs(&reply(Command::HOLE_PUNCH, MessageType::Ok, &[100, 200, 101])).unwrap_err();
        assert_eq!(err, ReplyRejection::OddPortCount { count: 3 });

        let transport: TransportError = err.into();
        assert!(transport.to_string().contains("odd number of ports"));
    }

    #[test]
    fn test_rejects_out_of_range_port() {
        let err = reply_port_pairs(&reply(Command::HOLE_PUNCH, MessageType::Ok, &[100, 200, 101, 70000])).unwrap_err();
        assert_eq!(err, ReplyRejection::PortOutOfRange { position: 3, value: 70000 });

        let err = reply_port_pairs(&reply(Command::HOLE_PUNCH, MessageType::Ok, &[-1, 200])).unwrap_err();
        assert_eq!(err, ReplyRejection::PortOutOfRange { position: 0, value: -1 });
    }
}
