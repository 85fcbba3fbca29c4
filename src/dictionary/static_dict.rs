use super::PacketDictionary;
use crate::error::{LinkError, Result};
use crate::packet::{Packet, PacketKind, UNKNOWN};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[default]
    Uint,
    Int,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDefinition {
    pub name: String,
    pub value: i64,
    #[serde(default)]
    pub hazardous: Option<String>,
}

/// Fixed-position big-endian integer field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemDefinition {
    pub name: String,
    /// Byte offset from the start of the buffer.
    pub offset: usize,
    /// Width in bytes, 1 to 8.
    pub size: usize,
    #[serde(default)]
    pub data_type: DataType,
    /// Identification value; items carrying one are matched during identify.
    #[serde(default)]
    pub id_value: Option<i64>,
    #[serde(default)]
    pub default: i64,
    #[serde(default)]
    pub minimum: Option<i64>,
    #[serde(default)]
    pub maximum: Option<i64>,
    #[serde(default)]
    pub states: Vec<StateDefinition>,
}

impl ItemDefinition {
    fn end(&self) -> usize {
        self.offset + self.size
    }

    fn read(&self, buffer: &[u8]) -> Option<i64> {
        if self.size == 0 || self.size > 8 || self.end() > buffer.len() {
            return None;
        }
        let raw = buffer[self.offset..self.end()]
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        match self.data_type {
            DataType::Uint => Some(raw as i64),
            DataType::Int => {
                let shift = 64 - self.size * 8;
                Some(((raw << shift) as i64) >> shift)
            }
        }
    }

    fn write(&self, buffer: &mut [u8], value: i64) -> Result<()> {
        let fits = self.size != 0 && self.size <= 8 && self.end() <= buffer.len() && {
            let bits = self.size as u32 * 8;
            match self.data_type {
                DataType::Uint => value >= 0 && (bits >= 64 || (value as u64) < (1u64 << bits)),
                DataType::Int => {
                    bits >= 64 || (value >= -(1i64 << (bits - 1)) && value < (1i64 << (bits - 1)))
                }
            }
        };
        if !fits {
            return Err(LinkError::protocol(format!(
                "Value {} does not fit item {} ({} bytes)",
                value, self.name, self.size
            )));
        }
        let bytes = (value as u64).to_be_bytes();
        buffer[self.offset..self.end()].copy_from_slice(&bytes[8 - self.size..]);
        Ok(())
    }

    fn state_for(&self, value: i64) -> Option<&StateDefinition> {
        self.states.iter().find(|s| s.value == value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketDefinition {
    pub target_name: String,
    pub packet_name: String,
    #[serde(default)]
    pub description: String,
    /// Present when the whole command needs operator confirmation.
    #[serde(default)]
    pub hazardous: Option<String>,
    #[serde(default)]
    pub items: Vec<ItemDefinition>,
}

impl PacketDefinition {
    fn length(&self) -> usize {
        self.items.iter().map(ItemDefinition::end).max().unwrap_or(0)
    }

    fn id_items(&self) -> impl Iterator<Item = &ItemDefinition> {
        self.items.iter().filter(|i| i.id_value.is_some())
    }

    fn matches(&self, buffer: &[u8]) -> bool {
        let mut any = false;
        for item in self.id_items() {
            any = true;
            if item.read(buffer) != item.id_value {
                return false;
            }
        }
        any
    }

    fn item(&self, name: &str) -> Option<&ItemDefinition> {
        self.items.iter().find(|i| i.name.eq_ignore_ascii_case(name))
    }
}

/// On-disk dictionary layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DictionaryDefinition {
    #[serde(default)]
    pub commands: Vec<PacketDefinition>,
    #[serde(default)]
    pub telemetry: Vec<PacketDefinition>,
}

type PacketKey = (PacketKind, String, String);

#[derive(Debug, Default)]
struct PacketLiveState {
    received_count: u64,
    current_value: Option<Vec<u8>>,
}

/// In-memory dictionary loaded from a [`DictionaryDefinition`].
#[derive(Debug)]
pub struct StaticDictionary {
    commands: Vec<PacketDefinition>,
    telemetry: Vec<PacketDefinition>,
    live: Mutex<HashMap<PacketKey, PacketLiveState>>,
}

impl StaticDictionary {
    pub fn new(definition: DictionaryDefinition) -> Self {
        let normalize = |mut defs: Vec<PacketDefinition>| {
            for def in &mut defs {
                def.target_name = def.target_name.to_uppercase();
                def.packet_name = def.packet_name.to_uppercase();
                for item in &mut def.items {
                    item.name = item.name.to_uppercase();
                }
            }
            defs
        };
        Self {
            commands: normalize(definition.commands),
            telemetry: normalize(definition.telemetry),
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    fn definitions(&self, kind: PacketKind) -> &[PacketDefinition] {
        match kind {
            PacketKind::Command => &self.commands,
            PacketKind::Telemetry => &self.telemetry,
        }
    }

    fn definition(&self, kind: PacketKind, target_name: &str, packet_name: &str) -> Result<&PacketDefinition> {
        let defs = self.definitions(kind);
        if !defs.iter().any(|d| d.target_name.eq_ignore_ascii_case(target_name)) {
            return Err(LinkError::Dictionary(format!(
                "Target '{}' does not exist",
                target_name.to_uppercase()
            )));
        }
        defs.iter()
            .find(|d| {
                d.target_name.eq_ignore_ascii_case(target_name)
                    && d.packet_name.eq_ignore_ascii_case(packet_name)
            })
            .ok_or_else(|| {
                let what = match kind {
                    PacketKind::Command => "Command",
                    PacketKind::Telemetry => "Packet",
                };
                LinkError::Dictionary(format!(
                    "{} '{} {}' does not exist",
                    what,
                    target_name.to_uppercase(),
                    packet_name.to_uppercase()
                ))
            })
    }

    fn key(kind: PacketKind, target_name: &str, packet_name: &str) -> PacketKey {
        (kind, target_name.to_uppercase(), packet_name.to_uppercase())
    }

    fn convert_param(def: &PacketDefinition, item: &ItemDefinition, value: &Value, raw: bool) -> Result<i64> {
        match value {
            Value::Number(n) => {
                if let Some(v) = n.as_i64() {
                    Ok(v)
                } else if let Some(f) = n.as_f64().filter(|f| f.fract() == 0.0) {
                    Ok(f as i64)
                } else {
                    Err(LinkError::protocol(format!(
                        "Command parameter '{} {} {}' must be an integer",
                        def.target_name, def.packet_name, item.name
                    )))
                }
            }
            Value::String(s) if !raw => item
                .states
                .iter()
                .find(|st| st.name.eq_ignore_ascii_case(s))
                .map(|st| st.value)
                .ok_or_else(|| {
                    LinkError::protocol(format!(
                        "Unknown state '{}' for command parameter '{} {} {}'",
                        s, def.target_name, def.packet_name, item.name
                    ))
                }),
            other => Err(LinkError::protocol(format!(
                "Invalid value {} for command parameter '{} {} {}'",
                other, def.target_name, def.packet_name, item.name
            ))),
        }
    }
}

impl PacketDictionary for StaticDictionary {
    fn target_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for def in self.commands.iter().chain(self.telemetry.iter()) {
            if !names.contains(&def.target_name) {
                names.push(def.target_name.clone());
            }
        }
        names
    }

    fn packet_names(&self, kind: PacketKind, target_name: &str) -> Result<Vec<String>> {
        let names: Vec<String> = self
            .definitions(kind)
            .iter()
            .filter(|d| d.target_name.eq_ignore_ascii_case(target_name))
            .map(|d| d.packet_name.clone())
            .collect();
        if names.is_empty() {
            return Err(LinkError::Dictionary(format!(
                "Target '{}' does not exist",
                target_name.to_uppercase()
            )));
        }
        Ok(names)
    }

    fn build_command(
        &self,
        target_name: &str,
        command_name: &str,
        params: &Map<String, Value>,
        range_check: bool,
        raw: bool,
    ) -> Result<Packet> {
        let def = self.definition(PacketKind::Command, target_name, command_name)?;
        let mut buffer = vec![0u8; def.length()];
        for item in &def.items {
            item.write(&mut buffer, item.id_value.unwrap_or(item.default))?;
        }

        for (name, value) in params {
            let item = def.item(name).ok_or_else(|| {
                LinkError::protocol(format!(
                    "Packet item '{} {} {}' does not exist",
                    def.target_name,
                    def.packet_name,
                    name.to_uppercase()
                ))
            })?;
            let converted = Self::convert_param(def, item, value, raw)?;
            if range_check {
                let below = item.minimum.is_some_and(|min| converted < min);
                let above = item.maximum.is_some_and(|max| converted > max);
                if below || above {
                    return Err(LinkError::protocol(format!(
                        "Command parameter '{} {} {}' = {} not in valid range of {} to {}",
                        def.target_name,
                        def.packet_name,
                        item.name,
                        converted,
                        item.minimum.map_or_else(|| "-".to_string(), |v| v.to_string()),
                        item.maximum.map_or_else(|| "-".to_string(), |v| v.to_string()),
                    )));
                }
            }
            item.write(&mut buffer, converted)?;
        }

        let mut packet = Packet::new(PacketKind::Command, &def.target_name, &def.packet_name, buffer);
        packet.hazardous = self.hazardous(&packet).is_some();
        Ok(packet)
    }

    fn identify(&self, kind: PacketKind, buffer: &[u8], target_names: &[String]) -> Option<Packet> {
        for target_name in target_names {
            let found = self
                .definitions(kind)
                .iter()
                .filter(|d| d.target_name.eq_ignore_ascii_case(target_name))
                .find(|d| d.matches(buffer));
            if let Some(def) = found {
                let mut packet = Packet::new(kind, &def.target_name, &def.packet_name, buffer.to_vec());
                if kind == PacketKind::Command {
                    packet.hazardous = self.hazardous(&packet).is_some();
                }
                return Some(packet);
            }
        }
        None
    }

    fn define(&self, kind: PacketKind, target_name: &str, packet_name: &str, buffer: &[u8]) -> Result<Packet> {
        if target_name.eq_ignore_ascii_case(UNKNOWN) && packet_name.eq_ignore_ascii_case(UNKNOWN) {
            return Ok(Packet::unknown(kind, buffer.to_vec()));
        }
        let def = self.definition(kind, target_name, packet_name)?;
        Ok(Packet::new(kind, &def.target_name, &def.packet_name, buffer.to_vec()))
    }

    fn update_current_value(&self, packet: &Packet) {
        let mut live = self.live.lock();
        live.entry(Self::key(packet.kind, &packet.target_name, &packet.packet_name))
            .or_default()
            .current_value = Some(packet.buffer.clone());
    }

    fn current_value(&self, kind: PacketKind, target_name: &str, packet_name: &str) -> Option<Vec<u8>> {
        self.live
            .lock()
            .get(&Self::key(kind, target_name, packet_name))
            .and_then(|s| s.current_value.clone())
    }

    fn hazardous(&self, command: &Packet) -> Option<String> {
        let def = self
            .definition(PacketKind::Command, &command.target_name, &command.packet_name)
            .ok()?;
        if let Some(description) = &def.hazardous {
            return Some(description.clone());
        }
        def.items.iter().find_map(|item| {
            let value = item.read(&command.buffer)?;
            item.state_for(value)?.hazardous.clone()
        })
    }

    fn format(&self, command: &Packet) -> String {
        let Ok(def) = self.definition(PacketKind::Command, &command.target_name, &command.packet_name) else {
            return format!("cmd(\"{} {}\")", command.target_name, command.packet_name);
        };
        let params: Vec<String> = def
            .items
            .iter()
            .filter(|item| item.id_value.is_none())
            .filter_map(|item| {
                let value = item.read(&command.buffer)?;
                Some(match item.state_for(value) {
                    Some(state) => format!("{} '{}'", item.name, state.name),
                    None => format!("{} {}", item.name, value),
                })
            })
            .collect();
        if params.is_empty() {
            format!("cmd(\"{} {}\")", def.target_name, def.packet_name)
        } else {
            format!("cmd(\"{} {} with {}\")", def.target_name, def.packet_name, params.join(", "))
        }
    }

    fn decode(&self, packet: &Packet) -> Map<String, Value> {
        let mut values = Map::new();
        let Ok(def) = self.definition(packet.kind, &packet.target_name, &packet.packet_name) else {
            return values;
        };
        for item in &def.items {
            if let Some(value) = item.read(&packet.buffer) {
                let decoded = match item.state_for(value) {
                    Some(state) => Value::String(state.name.clone()),
                    None => Value::from(value),
                };
                values.insert(item.name.clone(), decoded);
            }
        }
        values
    }

    fn received_count(&self, kind: PacketKind, target_name: &str, packet_name: &str) -> u64 {
        self.live
            .lock()
            .get(&Self::key(kind, target_name, packet_name))
            .map_or(0, |s| s.received_count)
    }

    fn set_received_count(&self, kind: PacketKind, target_name: &str, packet_name: &str, count: u64) {
        self.live
            .lock()
            .entry(Self::key(kind, target_name, packet_name))
            .or_default()
            .received_count = count;
    }

    fn increment_received_count(&self, kind: PacketKind, target_name: &str, packet_name: &str) -> u64 {
        let mut live = self.live.lock();
        let state = live.entry(Self::key(kind, target_name, packet_name)).or_default();
        state.received_count += 1;
        state.received_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, offset: usize, size: usize) -> ItemDefinition {
        ItemDefinition {
            name: name.into(),
            offset,
            size,
            data_type: DataType::Uint,
            id_value: None,
            default: 0,
            minimum: None,
            maximum: None,
            states: Vec::new(),
        }
    }

    #[test]
    fn test_signed_item_round_trip() {
        let mut field = item("TEMP", 0, 2);
        field.data_type = DataType::Int;
        let mut buffer = vec![0u8; 2];
        field.write(&mut buffer, -5).unwrap();
        assert_eq!(buffer, vec![0xFF, 0xFB]);
        assert_eq!(field.read(&buffer), Some(-5));
    }

    #[test]
    fn test_item_overflow_rejected() {
        let field = item("BYTE", 0, 1);
        let mut buffer = vec![0u8; 1];
        assert!(field.write(&mut buffer, 256).is_err());
        assert!(field.write(&mut buffer, -1).is_err());
        assert!(field.write(&mut buffer, 255).is_ok());
    }

    #[test]
    fn test_zero_size_item_rejected() {
        let mut field = item("EMPTY", 0, 0);
        field.data_type = DataType::Int;
        let mut buffer = vec![0u8; 2];
        assert!(field.write(&mut buffer, 0).is_err());
        assert_eq!(field.read(&buffer), None);
    }

    #[test]
    fn test_read_past_end_is_none() {
        let field = item("WORD", 3, 2);
        assert_eq!(field.read(&[0, 0, 0, 1]), None);
    }
}
