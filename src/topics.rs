//! Topic naming and the typed writers/readers built on [`MessageBus`].

use crate::bus::{MessageBus, TopicMessage};
use crate::error::{LinkError, Result};
use crate::packet::{now_nsec, Packet, PacketKind, UNKNOWN};
use crate::LinkKind;
use serde_json::{Map, Value};

/// Retention for command, control and ack streams.
pub const COMMAND_TOPIC_MAXLEN: usize = 100;
/// Retention for telemetry streams.
pub const TELEMETRY_TOPIC_MAXLEN: usize = 1000;

pub fn control_topic(scope: &str, kind: LinkKind, name: &str) -> String {
    match kind {
        LinkKind::Interface => format!("{{{scope}__CMD}}INTERFACE__{name}"),
        LinkKind::Router => format!("{{{scope}__CMD}}ROUTER__{name}"),
    }
}

pub fn target_command_topic(scope: &str, target_name: &str) -> String {
    format!("{{{scope}__CMD}}TARGET__{target_name}")
}

pub fn telemetry_topic(scope: &str, target_name: &str, packet_name: &str) -> String {
    format!("{scope}__TELEMETRY__{{{target_name}}}__{packet_name}")
}

pub fn command_topic(scope: &str, target_name: &str, packet_name: &str) -> String {
    format!("{scope}__COMMAND__{{{target_name}}}__{packet_name}")
}

pub fn decom_command_topic(scope: &str, target_name: &str, packet_name: &str) -> String {
    format!("{scope}__DECOMCMD__{{{target_name}}}__{packet_name}")
}

/// `{SCOPE__CMD}INTERFACE__NAME` acks on `{SCOPE__ACKCMD}INTERFACE__NAME`.
pub fn ack_topic(topic: &str) -> String {
    let mut parts: Vec<String> = topic.split("__").map(str::to_string).collect();
    if parts.len() > 1 {
        parts[1] = format!("ACK{}", parts[1]);
    }
    parts.join("__")
}

pub fn is_control_topic(topic: &str) -> bool {
    topic.contains("CMD}INTERFACE") || topic.contains("CMD}ROUTER")
}

/// Command input topics of an interface: its own control topic first, then
/// one per command target.
pub fn interface_topics(scope: &str, name: &str, cmd_target_names: &[String]) -> Vec<String> {
    let mut topics = vec![control_topic(scope, LinkKind::Interface, name)];
    topics.extend(cmd_target_names.iter().map(|t| target_command_topic(scope, t)));
    topics
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

pub async fn write_ack(bus: &dyn MessageBus, topic: &str, result: &str, id: &str) -> Result<()> {
    let message = TopicMessage::new().with("result", result).with("id", id);
    bus.write_topic(&ack_topic(topic), message, COMMAND_TOPIC_MAXLEN).await?;
    Ok(())
}

fn packet_message(packet: &Packet) -> Result<TopicMessage> {
    let mut message = TopicMessage::new()
        .with("target_name", packet.target_name.as_str())
        .with("packet_name", packet.packet_name.as_str())
        .with("received_count", packet.received_count.to_string())
        .with("time", packet.received_time.unwrap_or_else(now_nsec).to_string())
        .with("stored", bool_str(packet.stored))
        .with("buffer", packet.buffer.clone());
    if !packet.extra.is_empty() {
        message.insert("extra", serde_json::to_vec(&packet.extra)?);
    }
    Ok(message)
}

pub async fn write_telemetry(bus: &dyn MessageBus, scope: &str, packet: &Packet) -> Result<()> {
    let topic = telemetry_topic(scope, &packet.target_name, &packet.packet_name);
    bus.write_topic(&topic, packet_message(packet)?, TELEMETRY_TOPIC_MAXLEN).await?;
    Ok(())
}

pub async fn write_command(bus: &dyn MessageBus, scope: &str, packet: &Packet) -> Result<()> {
    let topic = command_topic(scope, &packet.target_name, &packet.packet_name);
    bus.write_topic(&topic, packet_message(packet)?, COMMAND_TOPIC_MAXLEN).await?;
    Ok(())
}

pub async fn write_decom_command(
    bus: &dyn MessageBus,
    scope: &str,
    packet: &Packet,
    decoded: &Map<String, Value>,
) -> Result<()> {
    let topic = decom_command_topic(scope, &packet.target_name, &packet.packet_name);
    let message = TopicMessage::new()
        .with("target_name", packet.target_name.as_str())
        .with("packet_name", packet.packet_name.as_str())
        .with("time", packet.received_time.unwrap_or_else(now_nsec).to_string())
        .with("stored", bool_str(packet.stored))
        .with("received_count", packet.received_count.to_string())
        .with("json_data", serde_json::to_vec(decoded)?);
    bus.write_topic(&topic, message, COMMAND_TOPIC_MAXLEN).await?;
    Ok(())
}

/// Rebuilds a packet from a telemetry topic entry.
pub fn telemetry_from_message(message: &TopicMessage) -> Result<Packet> {
    let target_name = message
        .get_str("target_name")
        .ok_or_else(|| LinkError::protocol("Telemetry entry missing target_name"))?;
    let packet_name = message
        .get_str("packet_name")
        .ok_or_else(|| LinkError::protocol("Telemetry entry missing packet_name"))?;
    let mut packet = Packet::new(
        PacketKind::Telemetry,
        target_name,
        packet_name,
        message.get("buffer").map(<[u8]>::to_vec).unwrap_or_default(),
    );
    packet.identified = !packet.is_unknown();
    packet.stored = message.flag("stored");
    packet.received_time = message.get_u64("time");
    packet.received_count = message.get_u64("received_count").unwrap_or(0);
    if let Some(extra) = message.get("extra") {
        packet.extra = serde_json::from_slice(extra)?;
    }
    Ok(packet)
}

/// Forwards an inbound router frame to the command topic of its target.
///
/// Unidentified frames go to the only command target when there is exactly
/// one; otherwise there is no route.
pub async fn route_command(
    bus: &dyn MessageBus,
    scope: &str,
    packet: &Packet,
    cmd_target_names: &[String],
) -> Result<()> {
    let (topic, target_name) = if packet.identified {
        (target_command_topic(scope, &packet.target_name), packet.target_name.as_str())
    } else if cmd_target_names.len() == 1 {
        (target_command_topic(scope, &cmd_target_names[0]), UNKNOWN)
    } else {
        return Err(LinkError::protocol(format!(
            "No route for command: {} {}",
            packet.target_name, packet.packet_name
        )));
    };
    let cmd_name = if packet.identified { packet.packet_name.as_str() } else { UNKNOWN };
    let message = TopicMessage::new()
        .with("target_name", target_name)
        .with("cmd_name", cmd_name)
        .with("cmd_buffer", packet.buffer.clone());
    bus.write_topic(&topic, message, COMMAND_TOPIC_MAXLEN).await?;
    Ok(())
}

// Client-side helpers for driving a link over its control topic.

pub async fn connect_link(
    bus: &dyn MessageBus,
    scope: &str,
    kind: LinkKind,
    name: &str,
    params: &[Value],
) -> Result<String> {
    let mut message = TopicMessage::new().with("connect", "true");
    if !params.is_empty() {
        message.insert("params", serde_json::to_vec(params)?);
    }
    bus.write_topic(&control_topic(scope, kind, name), message, COMMAND_TOPIC_MAXLEN).await
}

pub async fn disconnect_link(bus: &dyn MessageBus, scope: &str, kind: LinkKind, name: &str) -> Result<String> {
    let message = TopicMessage::new().with("disconnect", "true");
    bus.write_topic(&control_topic(scope, kind, name), message, COMMAND_TOPIC_MAXLEN).await
}

pub async fn set_raw_logging(
    bus: &dyn MessageBus,
    scope: &str,
    kind: LinkKind,
    name: &str,
    enabled: bool,
) -> Result<String> {
    let message = TopicMessage::new().with("log_raw", bool_str(enabled));
    bus.write_topic(&control_topic(scope, kind, name), message, COMMAND_TOPIC_MAXLEN).await
}

pub async fn write_raw(bus: &dyn MessageBus, scope: &str, name: &str, data: &[u8]) -> Result<String> {
    let message = TopicMessage::new().with("raw", data.to_vec());
    bus.write_topic(&control_topic(scope, LinkKind::Interface, name), message, COMMAND_TOPIC_MAXLEN)
        .await
}

pub async fn request_shutdown(bus: &dyn MessageBus, scope: &str, kind: LinkKind, name: &str) -> Result<String> {
    let message = TopicMessage::new().with("shutdown", "true");
    bus.write_topic(&control_topic(scope, kind, name), message, COMMAND_TOPIC_MAXLEN).await
}

/// Options attached to a structured command request.
#[derive(Debug, Clone, Copy)]
pub struct CommandOptions {
    pub range_check: bool,
    pub raw: bool,
    pub hazardous_check: bool,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            range_check: true,
            raw: false,
            hazardous_check: true,
        }
    }
}

pub async fn send_command(
    bus: &dyn MessageBus,
    scope: &str,
    target_name: &str,
    cmd_name: &str,
    params: &Map<String, Value>,
    options: CommandOptions,
) -> Result<String> {
    let message = TopicMessage::new()
        .with("target_name", target_name)
        .with("cmd_name", cmd_name)
        .with("cmd_params", serde_json::to_vec(params)?)
        .with("range_check", bool_str(options.range_check))
        .with("raw", bool_str(options.raw))
        .with("hazardous_check", bool_str(options.hazardous_check));
    bus.write_topic(&target_command_topic(scope, target_name), message, COMMAND_TOPIC_MAXLEN)
        .await
}

pub async fn send_command_buffer(
    bus: &dyn MessageBus,
    scope: &str,
    target_name: &str,
    buffer: &[u8],
) -> Result<String> {
    let message = TopicMessage::new()
        .with("target_name", target_name)
        .with("cmd_buffer", buffer.to_vec());
    bus.write_topic(&target_command_topic(scope, target_name), message, COMMAND_TOPIC_MAXLEN)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert_eq!(control_topic("DEFAULT", LinkKind::Interface, "INST_INT"), "{DEFAULT__CMD}INTERFACE__INST_INT");
        assert_eq!(control_topic("DEFAULT", LinkKind::Router, "RT"), "{DEFAULT__CMD}ROUTER__RT");
        assert_eq!(target_command_topic("DEFAULT", "INST"), "{DEFAULT__CMD}TARGET__INST");
        assert_eq!(telemetry_topic("DEFAULT", "INST", "HEALTH"), "DEFAULT__TELEMETRY__{INST}__HEALTH");
    }

    #[test]
    fn test_ack_topic_prefixes_second_segment() {
        assert_eq!(ack_topic("{DEFAULT__CMD}INTERFACE__INST_INT"), "{DEFAULT__ACKCMD}INTERFACE__INST_INT");
        assert_eq!(ack_topic("{DEFAULT__CMD}TARGET__INST"), "{DEFAULT__ACKCMD}TARGET__INST");
    }

    #[test]
    fn test_control_topic_detection() {
        assert!(is_control_topic("{DEFAULT__CMD}INTERFACE__X"));
        assert!(is_control_topic("{DEFAULT__CMD}ROUTER__X"));
        assert!(!is_control_topic("{DEFAULT__CMD}TARGET__X"));
    }

    #[test]
    fn test_telemetry_message_round_trip_keeps_identity() {
        let mut packet = Packet::new(PacketKind::Telemetry, "INST", "HEALTH", vec![1, 2, 3]);
        packet.received_count = 7;
        packet.received_time = Some(99);
        packet.stored = true;
        let message = packet_message(&packet).unwrap();

        let rebuilt = telemetry_from_message(&message).unwrap();
        assert_eq!(rebuilt.target_name, "INST");
        assert_eq!(rebuilt.received_count, 7);
        assert_eq!(rebuilt.received_time, Some(99));
        assert!(rebuilt.stored);
        assert_eq!(rebuilt.buffer, vec![1, 2, 3]);
    }
}
