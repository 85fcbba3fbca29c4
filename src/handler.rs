//! Bus-facing tasks: the interface command handler and the router telemetry
//! handler. Each consumes its topics in a loop until the link is cancelled
//! and never lets a per-message error escape.

use crate::bus::{TopicCursor, TopicMessage};
use crate::error::{LinkError, Result};
use crate::link::Link;
use crate::packet::{now_nsec, Packet, PacketKind, UNKNOWN};
use crate::topics;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long one bus read blocks before the cancel flag is checked again.
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

const SUCCESS: &str = "SUCCESS";

enum Reply {
    Result(String),
    Shutdown,
}

/// Ack payload for a failed message. Hazardous rejections carry the
/// description and the formatted command on their own lines.
pub fn ack_result(err: &LinkError) -> String {
    match err {
        LinkError::HazardousCommandRejected { description, formatted } => {
            format!("HazardousError\n{description}\n{formatted}")
        }
        other => other.to_string(),
    }
}

fn not_connected(link: &Link) -> String {
    format!("Interface not connected: {}", link.name())
}

fn connect_params(message: &TopicMessage) -> Result<Vec<Value>> {
    match message.get("params") {
        None => Ok(Vec::new()),
        Some(bytes) => serde_json::from_slice(bytes)
            .map_err(|e| LinkError::config(format!("Invalid connect params: {e}"))),
    }
}

/// Control keys shared by interfaces and routers. `None` when the message
/// carries none of them.
async fn handle_control(link: &Link, message: &TopicMessage) -> Option<Result<Reply>> {
    if message.contains("shutdown") {
        info!("{}: Shutdown requested", link.name());
        return Some(Ok(Reply::Shutdown));
    }
    if message.contains("connect") {
        info!("{}: Connect requested", link.name());
        let result = match connect_params(message) {
            Ok(params) => link.attempting(&params).await,
            Err(e) => Err(e),
        };
        return Some(result.map(|()| Reply::Result(SUCCESS.into())));
    }
    if message.contains("disconnect") {
        info!("{}: Disconnect requested", link.name());
        link.disconnect(false).await;
        return Some(Ok(Reply::Result(SUCCESS.into())));
    }
    if message.contains("log_raw") {
        let endpoint = link.endpoint();
        if message.flag("log_raw") {
            info!("{}: Enable raw logging", link.name());
            endpoint.start_raw_logging();
        } else {
            info!("{}: Disable raw logging", link.name());
            endpoint.stop_raw_logging();
        }
        return Some(Ok(Reply::Result(SUCCESS.into())));
    }
    None
}

/// Reads control and command topics of an interface, writes commands to the
/// endpoint and acks every message.
pub struct CommandHandler {
    link: Arc<Link>,
    cursor: TopicCursor,
}

impl CommandHandler {
    pub fn new(link: Arc<Link>, cursor: TopicCursor) -> Self {
        Self { link, cursor }
    }

    pub async fn run(mut self) {
        let link = self.link.clone();
        loop {
            let batch = tokio::select! {
                () = link.cancelled() => break,
                batch = link.bus().read_topics(&mut self.cursor, READ_TIMEOUT) => batch,
            };
            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    error!("{}: Command topic read failed: {}", link.name(), e);
                    link.sleeper().sleep(READ_TIMEOUT).await;
                    continue;
                }
            };
            for (topic, message) in batch {
                let (result, stop) = match self.handle_message(&topic, &message).await {
                    Ok(Reply::Result(result)) => (result, false),
                    Ok(Reply::Shutdown) => (SUCCESS.to_string(), true),
                    Err(LinkError::Cancelled) => (LinkError::Cancelled.to_string(), true),
                    Err(e) => {
                        match &e {
                            LinkError::HazardousCommandRejected { description, .. } => {
                                info!("{}: Hazardous command not sent: {}", link.name(), description)
                            }
                            other => error!("{}: {}", link.name(), other),
                        }
                        link.note_error(e.to_string());
                        (ack_result(&e), false)
                    }
                };
                if let Err(e) = topics::write_ack(link.bus(), &topic, &result, &message.id).await {
                    error!("{}: Ack write failed: {}", link.name(), e);
                }
                if stop {
                    link.cancel();
                    info!("{}: Command handler stopped", link.name());
                    return;
                }
            }
        }
        info!("{}: Command handler stopped", link.name());
    }

    async fn handle_message(&self, topic: &str, message: &TopicMessage) -> Result<Reply> {
        let link = self.link.as_ref();
        if topics::is_control_topic(topic) {
            let raw_write =
                message.contains("raw") && !message.contains("cmd_params") && !message.contains("cmd_buffer");
            if raw_write {
                let data = message.get("raw").unwrap_or_default();
                return self.write_raw(data).await.map(Reply::Result);
            }
            if let Some(reply) = handle_control(link, message).await {
                return reply;
            }
        }

        let mut command = self.build_command(message)?;
        command.received_time = Some(now_nsec());

        if message.flag("hazardous_check") {
            if let Some(description) = link.dictionary().hazardous(&command) {
                return Err(LinkError::HazardousCommandRejected {
                    description,
                    formatted: link.dictionary().format(&command),
                });
            }
        }

        if !link.is_connected() {
            return Ok(Reply::Result(not_connected(link)));
        }
        link.endpoint().write(&command).await?;
        link.counters().record_write(command.len());
        link.counters().increment();
        if !command.is_unknown() {
            command.received_count = link.dictionary().increment_received_count(
                PacketKind::Command,
                &command.target_name,
                &command.packet_name,
            );
        }
        debug!("{}: Sent {}", link.name(), link.dictionary().format(&command));
        topics::write_command(link.bus(), link.scope(), &command).await?;
        let decoded = link.dictionary().decode(&command);
        topics::write_decom_command(link.bus(), link.scope(), &command, &decoded).await?;
        link.publish_status().await;
        Ok(Reply::Result(SUCCESS.into()))
    }

    fn build_command(&self, message: &TopicMessage) -> Result<Packet> {
        let link = self.link.as_ref();
        let dictionary = link.dictionary();
        let target_name = message.get_str("target_name");

        if let Some(raw_params) = message.get("cmd_params") {
            let params: Map<String, Value> = serde_json::from_slice(raw_params)?;
            let target_name =
                target_name.ok_or_else(|| LinkError::protocol("Command missing target_name"))?;
            let cmd_name = message
                .get_str("cmd_name")
                .ok_or_else(|| LinkError::protocol("Command missing cmd_name"))?;
            return dictionary.build_command(
                target_name,
                cmd_name,
                &params,
                message.flag("range_check"),
                message.flag("raw"),
            );
        }

        if let Some(buffer) = message.get("cmd_buffer") {
            let targets = match target_name {
                Some(target) if target != UNKNOWN => vec![target.to_uppercase()],
                _ => link.cmd_target_names().to_vec(),
            };
            return Ok(match dictionary.identify(PacketKind::Command, buffer, &targets) {
                Some(command) => command,
                None => {
                    let mut command = Packet::unknown(PacketKind::Command, buffer.to_vec());
                    command.received_count =
                        dictionary.increment_received_count(PacketKind::Command, UNKNOWN, UNKNOWN);
                    command
                }
            });
        }

        Err(LinkError::protocol(format!(
            "Invalid command received: {:?}",
            message.fields.keys().collect::<Vec<_>>()
        )))
    }

    async fn write_raw(&self, data: &[u8]) -> Result<String> {
        let link = self.link.as_ref();
        if !link.is_connected() {
            return Ok(not_connected(link));
        }
        info!("{}: Write raw", link.name());
        let mut command = Packet::unknown(PacketKind::Command, data.to_vec());
        command.received_time = Some(now_nsec());
        command.received_count =
            link.dictionary().increment_received_count(PacketKind::Command, UNKNOWN, UNKNOWN);
        topics::write_command(link.bus(), link.scope(), &command).await?;
        link.endpoint().write_raw(data).await?;
        link.counters().record_write(data.len());
        link.counters().increment();
        link.publish_status().await;
        Ok(SUCCESS.into())
    }
}

/// Reads a router's control topic and the telemetry of its targets, and
/// forwards each telemetry entry out through the router endpoint.
pub struct RouterTelemetryHandler {
    link: Arc<Link>,
    cursor: TopicCursor,
}

impl RouterTelemetryHandler {
    pub fn new(link: Arc<Link>, cursor: TopicCursor) -> Self {
        Self { link, cursor }
    }

    pub async fn run(mut self) {
        let link = self.link.clone();
        loop {
            let batch = tokio::select! {
                () = link.cancelled() => break,
                batch = link.bus().read_topics(&mut self.cursor, READ_TIMEOUT) => batch,
            };
            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    error!("{}: Telemetry topic read failed: {}", link.name(), e);
                    link.sleeper().sleep(READ_TIMEOUT).await;
                    continue;
                }
            };
            for (topic, message) in batch {
                if topics::is_control_topic(&topic) {
                    let (result, stop) = match handle_control(&link, &message).await {
                        Some(Ok(Reply::Result(result))) => (result, false),
                        Some(Ok(Reply::Shutdown)) => (SUCCESS.to_string(), true),
                        Some(Err(LinkError::Cancelled)) => (LinkError::Cancelled.to_string(), true),
                        Some(Err(e)) => {
                            error!("{}: {}", link.name(), e);
                            (ack_result(&e), false)
                        }
                        None => {
                            warn!("{}: Unrecognized router control message", link.name());
                            (format!("Invalid router message: {:?}", message.fields.keys().collect::<Vec<_>>()), false)
                        }
                    };
                    if let Err(e) = topics::write_ack(link.bus(), &topic, &result, &message.id).await {
                        error!("{}: Ack write failed: {}", link.name(), e);
                    }
                    if stop {
                        link.cancel();
                        info!("{}: Telemetry handler stopped", link.name());
                        return;
                    }
                } else if let Err(e) = self.forward(&message).await {
                    error!("{}: Error forwarding telemetry: {}", link.name(), e);
                    link.note_error(e.to_string());
                }
            }
        }
        info!("{}: Telemetry handler stopped", link.name());
    }

    async fn forward(&self, message: &TopicMessage) -> Result<()> {
        let link = self.link.as_ref();
        if !link.is_connected() {
            return Ok(());
        }
        let packet = topics::telemetry_from_message(message)?;
        link.endpoint().write(&packet).await?;
        link.counters().record_write(packet.len());
        link.counters().increment();
        link.publish_status().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hazardous_ack_has_three_lines() {
        let err = LinkError::HazardousCommandRejected {
            description: "Clears the counters".into(),
            formatted: "cmd(\"INST CLEAR\")".into(),
        };
        let result = ack_result(&err);
        let lines: Vec<&str> = result.lines().collect();
        assert_eq!(lines, vec!["HazardousError", "Clears the counters", "cmd(\"INST CLEAR\")"]);
    }

    #[test]
    fn test_connect_params_parsing() {
        let message = TopicMessage::new().with("connect", "true").with("params", r#"["10.0.0.1", 8080]"#);
        assert_eq!(connect_params(&message).unwrap().len(), 2);

        let message = TopicMessage::new().with("connect", "true");
        assert!(connect_params(&message).unwrap().is_empty());

        let message = TopicMessage::new().with("params", "not json");
        assert!(matches!(connect_params(&message), Err(LinkError::Configuration(_))));
    }
}
