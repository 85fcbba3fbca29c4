use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub const UNKNOWN: &str = "UNKNOWN";

/// Bytes of an unidentified payload echoed into the warning log.
pub const UNKNOWN_BYTES_TO_PRINT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketKind {
    Command,
    Telemetry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub kind: PacketKind,
    pub target_name: String,
    pub packet_name: String,
    #[serde(with = "serde_bytes")]
    pub buffer: Vec<u8>,
    /// Nanoseconds since the Unix epoch, `None` until stamped.
    pub received_time: Option<u64>,
    pub received_count: u64,
    pub identified: bool,
    pub stored: bool,
    pub hazardous: bool,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Packet {
    pub fn new(kind: PacketKind, target_name: &str, packet_name: &str, buffer: Vec<u8>) -> Self {
        Self {
            kind,
            target_name: target_name.to_uppercase(),
            packet_name: packet_name.to_uppercase(),
            buffer,
            received_time: None,
            received_count: 0,
            identified: true,
            stored: false,
            hazardous: false,
            extra: serde_json::Map::new(),
        }
    }

    /// Raw frame straight off a transport, identity still to be resolved.
    pub fn unidentified(kind: PacketKind, buffer: Vec<u8>) -> Self {
        Self {
            kind,
            target_name: UNKNOWN.into(),
            packet_name: UNKNOWN.into(),
            buffer,
            received_time: None,
            received_count: 0,
            identified: false,
            stored: false,
            hazardous: false,
            extra: serde_json::Map::new(),
        }
    }

    pub fn unknown(kind: PacketKind, buffer: Vec<u8>) -> Self {
        let mut packet = Self::new(kind, UNKNOWN, UNKNOWN, buffer);
        packet.identified = false;
        packet
    }

    pub fn is_unknown(&self) -> bool {
        self.target_name == UNKNOWN && self.packet_name == UNKNOWN
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clears identity so the buffer goes back through identification.
    pub fn clear_identity(&mut self) {
        self.target_name = UNKNOWN.into();
        self.packet_name = UNKNOWN.into();
        self.identified = false;
    }

    pub fn stamp_if_unset(&mut self) {
        if self.received_time.is_none() {
            self.received_time = Some(now_nsec());
        }
    }

    /// Uppercase hex of at most the first [`UNKNOWN_BYTES_TO_PRINT`] bytes.
    pub fn hex_prefix(&self) -> String {
        let n = UNKNOWN_BYTES_TO_PRINT.min(self.buffer.len());
        hex::encode_upper(&self.buffer[..n])
    }
}

pub fn now_nsec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}
