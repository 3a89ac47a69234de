//! Datagram encoding used by the bundled UDP collaborators.

use super::{Message, TransportError};

/// Largest datagram the receive loops accept
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

pub fn encode(message: &Message) -> Result<Vec<u8>, TransportError> {
    let bytes = serde_json::to_vec(message).map_err(|e| TransportError::Serialization(e.to_string()))?;
    if bytes.len() > MAX_DATAGRAM_SIZE {
        return Err(TransportError::Serialization(format!(
            "encoded message is {} bytes, limit is {}",
            bytes.len(),
            MAX_DATAGRAM_SIZE
        )));
    }
    Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> Result<Message, TransportError> {
    serde_json::from_slice(bytes).map_err(|e| TransportError::Serialization(e.to_string()))
}
