use serde::{Deserialize, Serialize};

/// Control messages exchanged between file servers.
///
/// Every bulk transfer is announced with a header (`StoreAnnouncement` or
/// `GetResponse`) and only streamed once the receiver has answered with an
/// `Ack` for the same `transfer` id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// A replica of `key` from `namespace` follows as a `size`-byte stream.
    StoreAnnouncement { transfer: u64, namespace: String, key: String, size: u64 },
    GetRequest { key: String },
    /// The responder holds `key`; a length-prefixed stream of `size` bytes follows the ack.
    GetResponse { transfer: u64, key: String, size: u64 },
    NotFound { key: String },
    Ack { transfer: u64, accepted: bool },
}

impl ControlMessage {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::StoreAnnouncement { .. } => "store announcement",
            ControlMessage::GetRequest { .. } => "get request",
            ControlMessage::GetResponse { .. } => "get response",
            ControlMessage::NotFound { .. } => "not found",
            ControlMessage::Ack { .. } => "ack",
        }
    }
}
