use crate::error::ProtocolError;
use crate::protocol::{Event, Operation};

/// Transport-side encoding of the session protocol.
///
/// A transport adapter owns the framing (WebSocket messages, length-prefixed
/// TCP, ...). It hands each complete frame to `decode` and writes the bytes
/// returned by `encode`; the engine only ever sees `Operation` and `Event`.
pub trait SessionCodec: Send + Sync {
    /// Decode one inbound frame. An error is fatal for the session.
    fn decode(&self, frame: &[u8]) -> Result<Operation, ProtocolError>;

    /// Encode one outbound event into a frame.
    fn encode(&self, event: &Event) -> Result<Vec<u8>, ProtocolError>;
}
