use std::fmt;
use bytes::{Buf, Bytes};
use serde::{Deserialize, Serialize};

use super::PeerAddress;

/// Current protocol version stamped on newly created messages
pub const PROTOCOL_VERSION: u32 = 1;

/// RPC command identifier carried by every message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Command(pub u8);

impl Command {
    pub const PING: Command = Command(0);
    pub const DIRECT_DATA: Command = Command(7);
    pub const RELAY: Command = Command(15);
    pub const HOLE_PUNCH: Command = Command(25);

    pub fn is_hole_punch(&self) -> bool {
        *self == Command::HOLE_PUNCH
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Command::PING => write!(f, "PING"),
            Command::DIRECT_DATA => write!(f, "DIRECT_DATA"),
            Command::RELAY => write!(f, "RELAY"),
            Command::HOLE_PUNCH => write!(f, "HOLE_PUNCH"),
            Command(other) => write!(f, "CMD({})", other),
        }
    }
}

/// Message phase/type tag. Discriminants are the on-wire values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request1 = 0,
    Request2 = 1,
    Request3 = 2,
    Request4 = 3,
    RequestFf1 = 4,
    RequestFf2 = 5,
    Ok = 6,
    PartiallyOk = 7,
    NotFound = 8,
    Denied = 9,
    UnknownId = 10,
    Exception = 11,
    Cancel = 12,
    User1 = 13,
    User2 = 14,
}

impl MessageType {
    /// Candidate-port offer sent through the relay
    pub const OFFER: MessageType = MessageType::Request1;
    /// Direct punch packet sent by the responder
    pub const PUNCH: MessageType = MessageType::Request3;

    pub fn is_request(&self) -> bool {
        (*self as u8) <= MessageType::RequestFf2 as u8
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Opaque payload buffer with its own read cursor.
///
/// Cloning through [`Buffer::duplicate`] shares the underlying bytes but not
/// the cursor, so each copy can be read exactly once independently.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Buffer {
    bytes: Bytes,
}

impl Buffer {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self { bytes: bytes.into() }
    }

    /// Independent copy starting at this buffer's current read position
    pub fn duplicate(&self) -> Self {
        Self { bytes: self.bytes.clone() }
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.bytes.remaining()
    }

    /// Read up to `len` bytes, advancing the cursor
    pub fn read(&mut self, len: usize) -> Bytes {
        let len = len.min(self.bytes.remaining());
        self.bytes.copy_to_bytes(len)
    }

    /// Consume everything left in the buffer
    pub fn read_all(&mut self) -> Bytes {
        let len = self.bytes.remaining();
        self.read(len)
    }
}

/// Wire-level protocol message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub message_id: u32,
    pub version: u32,
    pub command: Command,
    pub message_type: MessageType,
    pub sender: PeerAddress,
    pub recipient: PeerAddress,
    /// Integer list, read pairwise by the hole punching protocol
    #[serde(default)]
    pub int_list: Vec<i32>,
    #[serde(default)]
    pub buffers: Vec<Buffer>,
    /// Whether the message must travel over the datagram transport
    #[serde(default)]
    pub udp: bool,
    /// Set when the sender expects no answer
    #[serde(default)]
    pub fire_and_forget: bool,
    /// Explicit address of the peer that started a hole punch (offers only)
    #[serde(default)]
    pub requester: Option<PeerAddress>,
}

impl Message {
    pub fn new(
        command: Command,
        message_type: MessageType,
        sender: PeerAddress,
        recipient: PeerAddress,
    ) -> Self {
        Self {
            message_id: rand::random(),
            version: PROTOCOL_VERSION,
            command,
            message_type,
            sender,
            recipient,
            int_list: Vec::new(),
            buffers: Vec::new(),
            udp: false,
            fire_and_forget: false,
            requester: None,
        }
    }

    pub fn with_message_id(mut self, message_id: u32) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn push_int(&mut self, value: i32) {
        self.int_list.push(value);
    }

    pub fn push_buffer(&mut self, buffer: Buffer) {
        self.buffers.push(buffer);
    }

    /// Check the command/type pair in one go
    pub fn is(&self, command: Command, message_type: MessageType) -> bool {
        self.command == command && self.message_type == message_type
    }

    /// Response skeleton addressed back to the sender of this message
    pub fn response(&self, message_type: MessageType, local: PeerAddress) -> Message {
        Message {
            message_id: self.message_id,
            version: self.version,
            command: self.command,
            message_type,
            sender: local,
            recipient: self.sender.clone(),
            int_list: Vec::new(),
            buffers: Vec::new(),
            udp: self.udp,
            fire_and_forget: false,
            requester: None,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "msg[id={}, cmd={}, type={}, {}:{} -> {}:{}, ints={}, buffers={}]",
            self.message_id,
            self.command,
            self.message_type,
            self.sender.peer_id,
            self.sender.udp_port,
            self.recipient.peer_id,
            self.recipient.udp_port,
            self.int_list.len(),
            self.buffers.len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer(id: &str, port: u16) -> PeerAddress {
        PeerAddress::new(id, IpAddr::V4(Ipv4Addr::LOCALHOST), port, port)
    }

    #[test]
    fn test_message_type_wire_values() {
        assert_eq!(MessageType::OFFER as u8, 0);
        assert_eq!(MessageType::PUNCH as u8, 2);
        assert_eq!(MessageType::Ok as u8, 6);
        assert!(MessageType::PUNCH.is_request());
        assert!(!MessageType::Ok.is_request());
    }

    #[test]
    fn test_buffer_duplicate_has_own_cursor() {
        let mut original = Buffer::new(&b"hello world"[..]);
        let mut copy = original.duplicate();

        assert_eq!(&copy.read(5)[..], b"hello");
        assert_eq!(copy.remaining(), 6);
        assert_eq!(original.remaining(), 11);

        assert_eq!(&original.read_all()[..], b"hello world");
        assert_eq!(original.remaining(), 0);
        assert_eq!(&copy.read_all()[..], b" world");
    }

    #[test]
    fn test_read_past_end_is_clamped() {
        let mut buffer = Buffer::new(vec![1u8, 2, 3]);
        assert_eq!(buffer.read(10).len(), 3);
        assert!(buffer.read(1).is_empty());
    }

    #[test]
    fn test_response_targets_sender() {
        let request = Message::new(Command::DIRECT_DATA, MessageType::Request1, peer("alice", 1000), peer("bob", 2000))
            .with_message_id(42);
        let response = request.response(MessageType::Ok, peer("bob", 2000));

        assert_eq!(response.message_id, 42);
        assert_eq!(response.recipient.peer_id, "alice");
        assert_eq!(response.sender.peer_id, "bob");
        assert!(response.is(Command::DIRECT_DATA, MessageType::Ok));
    }

    #[test]
    fn test_command_display() {
        assert_eq!(Command::HOLE_PUNCH.to_string(), "HOLE_PUNCH");
        assert_eq!(Command(99).to_string(), "CMD(99)");
    }
}
