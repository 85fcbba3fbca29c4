//! Packet dictionary contract.
//!
//! The dictionary resolves `(target, packet)` pairs to structural definitions,
//! builds commands from parameters, identifies raw buffers and keeps the live
//! current-value table and received counters. It is injected into the engine
//! as an `Arc<dyn PacketDictionary>`; nothing here is process-global.

mod static_dict;

pub use static_dict::{
    DataType, DictionaryDefinition, ItemDefinition, PacketDefinition, StateDefinition,
    StaticDictionary,
};

use crate::error::Result;
use crate::packet::{Packet, PacketKind};
use serde_json::{Map, Value};

pub trait PacketDictionary: Send + Sync {
    fn target_names(&self) -> Vec<String>;

    /// Packet names defined for `target`, in definition order.
    fn packet_names(&self, kind: PacketKind, target_name: &str) -> Result<Vec<String>>;

    /// Builds a command from named parameters. `raw` disables state-name
    /// conversion, `range_check` enforces item minimum/maximum.
    fn build_command(
        &self,
        target_name: &str,
        command_name: &str,
        params: &Map<String, Value>,
        range_check: bool,
        raw: bool,
    ) -> Result<Packet>;

    /// Matches `buffer` against every definition of `target_names`, in order.
    /// Does not touch the current value table.
    fn identify(&self, kind: PacketKind, buffer: &[u8], target_names: &[String]) -> Option<Packet>;

    /// Wraps `buffer` as the named packet; errors when the identity is unknown.
    fn define(&self, kind: PacketKind, target_name: &str, packet_name: &str, buffer: &[u8]) -> Result<Packet>;

    /// Stores `packet.buffer` as the latest live value of its packet.
    fn update_current_value(&self, packet: &Packet);

    fn current_value(&self, kind: PacketKind, target_name: &str, packet_name: &str) -> Option<Vec<u8>>;

    /// `Some(description)` when the command, or one of its parameter values,
    /// is flagged hazardous.
    fn hazardous(&self, command: &Packet) -> Option<String>;

    /// Human-readable command line, e.g. `cmd("INST COLLECT with TYPE 'NORMAL'")`.
    fn format(&self, command: &Packet) -> String;

    /// Decoded item values of `packet`; empty when the packet has no definition.
    fn decode(&self, packet: &Packet) -> Map<String, Value>;

    fn received_count(&self, kind: PacketKind, target_name: &str, packet_name: &str) -> u64;

    fn set_received_count(&self, kind: PacketKind, target_name: &str, packet_name: &str, count: u64);

    /// Bumps the packet's counter and returns the new value.
    fn increment_received_count(&self, kind: PacketKind, target_name: &str, packet_name: &str) -> u64;
}
