//! Identification of inbound frames and router command forwarding.

use crate::bus::MessageBus;
use crate::dictionary::PacketDictionary;
use crate::error::Result;
use crate::packet::{Packet, PacketKind};
use crate::topics;
use tracing::warn;

/// Resolves the identity of a telemetry frame read from an endpoint.
///
/// A pre-tagged frame is defined directly; an unknown tag is cleared and the
/// buffer identified against `tlm_target_names`. Frames nothing matches come
/// back as `UNKNOWN/UNKNOWN` with the original buffer. Live frames update the
/// current value table and bump the received counter; stored frames only
/// report what the next count would be.
pub fn identify_telemetry(
    dictionary: &dyn PacketDictionary,
    link_name: &str,
    mut frame: Packet,
    tlm_target_names: &[String],
) -> Packet {
    frame.stamp_if_unset();
    let kind = PacketKind::Telemetry;

    let mut identified = None;
    if frame.identified {
        match dictionary.define(kind, &frame.target_name, &frame.packet_name, &frame.buffer) {
            Ok(packet) => identified = Some(packet),
            Err(_) => {
                warn!(
                    "{}: Received unknown identified telemetry: {} {}",
                    link_name, frame.target_name, frame.packet_name
                );
                frame.clear_identity();
            }
        }
    }
    if identified.is_none() {
        identified = dictionary.identify(kind, &frame.buffer, tlm_target_names);
    }

    let mut packet = match identified {
        Some(packet) => packet,
        None => {
            let packet = Packet::unknown(kind, frame.buffer.clone());
            warn!(
                "{}: {} {} packet length: {} starting with: {}",
                link_name,
                packet.target_name,
                packet.packet_name,
                packet.len(),
                packet.hex_prefix()
            );
            packet
        }
    };
    packet.received_time = frame.received_time;
    packet.stored = frame.stored;
    packet.extra = frame.extra;

    if packet.stored {
        packet.received_count =
            dictionary.received_count(kind, &packet.target_name, &packet.packet_name) + 1;
    } else {
        dictionary.update_current_value(&packet);
        packet.received_count =
            dictionary.increment_received_count(kind, &packet.target_name, &packet.packet_name);
    }
    packet
}

/// Identifies a frame a router read against its command targets and forwards
/// it to the matching target command topic.
pub async fn route_router_frame(
    bus: &dyn MessageBus,
    dictionary: &dyn PacketDictionary,
    scope: &str,
    frame: Packet,
    cmd_target_names: &[String],
) -> Result<()> {
    let packet = if frame.identified {
        frame
    } else {
        dictionary
            .identify(PacketKind::Command, &frame.buffer, cmd_target_names)
            .unwrap_or(frame)
    };
    topics::route_command(bus, scope, &packet, cmd_target_names).await
}
