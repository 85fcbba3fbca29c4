mod common;

use common::*;
use satlink::topics::{self, CommandOptions};
use satlink::*;
use serde_json::{json, Map, Value};

fn params(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

async fn connected_interface(name: &str) -> Harness {
    let mut harness = Harness::new(interface_config(name)).await;
    harness.start();
    harness.wait_for_state(ConnectionState::Connected).await;
    harness
}

#[tokio::test]
async fn test_command_rejected_while_disconnected() {
    let mut config = interface_config("INST_INT");
    config.connect_on_startup = false;
    let mut harness = Harness::new(config).await;
    harness.start();
    assert_eq!(harness.microservice.state(), ConnectionState::Disconnected);

    let id = topics::send_command(
        harness.bus.as_ref(),
        SCOPE,
        "INST",
        "NOOP",
        &Map::new(),
        CommandOptions::default(),
    )
    .await
    .unwrap();

    let result = harness.ack(&target_ack_topic("INST"), &id).await;
    assert_eq!(result, "Interface not connected: INST_INT");
    assert!(harness.endpoint().written().is_empty());
    assert_eq!(harness.endpoint().connects(), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_command_written_and_published() {
    let harness = connected_interface("INST_INT").await;

    let id = topics::send_command(
        harness.bus.as_ref(),
        SCOPE,
        "INST",
        "COLLECT",
        &params(json!({"TYPE": "NORMAL", "DURATION": 10})),
        CommandOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(harness.ack(&target_ack_topic("INST"), &id).await, "SUCCESS");
    assert_eq!(harness.endpoint().written(), vec![vec![0, 1, 0, 0, 10]]);

    let published = harness.bus.messages("DEFAULT__COMMAND__{INST}__COLLECT");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].get_str("received_count"), Some("1"));
    assert_eq!(published[0].get("buffer"), Some(&[0u8, 1, 0, 0, 10][..]));

    let decom = harness.bus.messages("DEFAULT__DECOMCMD__{INST}__COLLECT");
    assert_eq!(decom.len(), 1);
    let values: Map<String, Value> = serde_json::from_slice(decom[0].get("json_data").unwrap()).unwrap();
    assert_eq!(values["DURATION"], json!(10));
    assert_eq!(values["TYPE"], json!("NORMAL"));

    let status = harness.status.link(SCOPE, LinkKind::Interface, "INST_INT").unwrap();
    assert_eq!(status.write_count, 1);
    assert_eq!(status.bytes_written, 5);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_hazardous_command_intercepted() {
    let harness = connected_interface("INST_INT").await;

    let id = topics::send_command(
        harness.bus.as_ref(),
        SCOPE,
        "INST",
        "CLEAR",
        &Map::new(),
        CommandOptions::default(),
    )
    .await
    .unwrap();

    let result = harness.ack(&target_ack_topic("INST"), &id).await;
    let lines: Vec<&str> = result.lines().collect();
    assert_eq!(lines[0], "HazardousError");
    assert_eq!(lines[1], "Clears all counters");
    assert!(lines[2].contains("INST CLEAR"));
    assert!(harness.endpoint().written().is_empty());
    assert!(harness.bus.messages("DEFAULT__COMMAND__{INST}__CLEAR").is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_hazardous_state_value_intercepted() {
    let harness = connected_interface("INST_INT").await;

    let id = topics::send_command(
        harness.bus.as_ref(),
        SCOPE,
        "INST",
        "COLLECT",
        &params(json!({"TYPE": "SPECIAL"})),
        CommandOptions::default(),
    )
    .await
    .unwrap();

    let result = harness.ack(&target_ack_topic("INST"), &id).await;
    assert!(result.starts_with("HazardousError\nSpecial collect overheats the sensor\n"));
    assert!(result.contains("TYPE 'SPECIAL'"));
    assert!(harness.endpoint().written().is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_hazardous_command_sent_without_check() {
    let harness = connected_interface("INST_INT").await;

    let options = CommandOptions {
        hazardous_check: false,
        ..CommandOptions::default()
    };
    let id = topics::send_command(harness.bus.as_ref(), SCOPE, "INST", "CLEAR", &Map::new(), options)
        .await
        .unwrap();

    assert_eq!(harness.ack(&target_ack_topic("INST"), &id).await, "SUCCESS");
    assert_eq!(harness.endpoint().written(), vec![vec![0, 2]]);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_range_error_returned_as_result() {
    let harness = connected_interface("INST_INT").await;

    let id = topics::send_command(
        harness.bus.as_ref(),
        SCOPE,
        "INST",
        "COLLECT",
        &params(json!({"DURATION": 500})),
        CommandOptions::default(),
    )
    .await
    .unwrap();

    let result = harness.ack(&target_ack_topic("INST"), &id).await;
    assert!(result.contains("not in valid range"), "got {result}");
    assert!(harness.endpoint().written().is_empty());

    // The handler keeps serving after an error
    let id = topics::send_command(
        harness.bus.as_ref(),
        SCOPE,
        "INST",
        "NOOP",
        &Map::new(),
        CommandOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(harness.ack(&target_ack_topic("INST"), &id).await, "SUCCESS");

    harness.shutdown().await;
}

#[tokio::test]
async fn test_unknown_command_buffer_published_as_unknown() {
    let harness = connected_interface("INST_INT").await;

    let id = topics::send_command_buffer(harness.bus.as_ref(), SCOPE, "INST", &[0xFF, 0xFE])
        .await
        .unwrap();

    assert_eq!(harness.ack(&target_ack_topic("INST"), &id).await, "SUCCESS");
    assert_eq!(harness.endpoint().written(), vec![vec![0xFF, 0xFE]]);
    let published = harness.bus.messages("DEFAULT__COMMAND__{UNKNOWN}__UNKNOWN");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].get_str("received_count"), Some("1"));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_command_buffer_identified() {
    let harness = connected_interface("INST_INT").await;

    let id = topics::send_command_buffer(harness.bus.as_ref(), SCOPE, "INST", &[0, 3])
        .await
        .unwrap();

    assert_eq!(harness.ack(&target_ack_topic("INST"), &id).await, "SUCCESS");
    assert_eq!(harness.bus.messages("DEFAULT__COMMAND__{INST}__NOOP").len(), 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_invalid_command_message() {
    let harness = connected_interface("INST_INT").await;

    let message = TopicMessage::new().with("target_name", "INST");
    let id = harness
        .bus
        .write_topic("{DEFAULT__CMD}TARGET__INST", message, topics::COMMAND_TOPIC_MAXLEN)
        .await
        .unwrap();

    let result = harness.ack(&target_ack_topic("INST"), &id).await;
    assert!(result.starts_with("Invalid command received"), "got {result}");

    harness.shutdown().await;
}

#[tokio::test]
async fn test_raw_write() {
    let harness = connected_interface("INST_INT").await;

    let id = topics::write_raw(harness.bus.as_ref(), SCOPE, "INST_INT", &[0xCA, 0xFE])
        .await
        .unwrap();

    assert_eq!(harness.ack(&interface_ack_topic("INST_INT"), &id).await, "SUCCESS");
    assert_eq!(harness.endpoint().raw_written(), vec![vec![0xCA, 0xFE]]);
    assert_eq!(
        harness
            .dictionary
            .received_count(PacketKind::Command, UNKNOWN, UNKNOWN),
        1
    );
    assert_eq!(harness.bus.messages("DEFAULT__COMMAND__{UNKNOWN}__UNKNOWN").len(), 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_raw_write_while_disconnected() {
    let mut config = interface_config("INST_INT");
    config.connect_on_startup = false;
    let harness = Harness::new(config).await;

    let id = topics::write_raw(harness.bus.as_ref(), SCOPE, "INST_INT", &[1])
        .await
        .unwrap();

    assert_eq!(
        harness.ack(&interface_ack_topic("INST_INT"), &id).await,
        "Interface not connected: INST_INT"
    );
    assert!(harness.endpoint().raw_written().is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_log_raw_toggles_endpoint_logging() {
    let harness = connected_interface("INST_INT").await;

    let id = topics::set_raw_logging(harness.bus.as_ref(), SCOPE, LinkKind::Interface, "INST_INT", true)
        .await
        .unwrap();
    assert_eq!(harness.ack(&interface_ack_topic("INST_INT"), &id).await, "SUCCESS");
    assert!(harness.endpoint().raw_logger().is_enabled());

    let id = topics::set_raw_logging(harness.bus.as_ref(), SCOPE, LinkKind::Interface, "INST_INT", false)
        .await
        .unwrap();
    assert_eq!(harness.ack(&interface_ack_topic("INST_INT"), &id).await, "SUCCESS");
    assert!(!harness.endpoint().raw_logger().is_enabled());

    harness.shutdown().await;
}

#[test]
fn test_build_then_format_names_command() {
    let dictionary = dictionary();
    let command = dictionary
        .build_command("inst", "collect", &params(json!({"DURATION": 5})), true, false)
        .unwrap();
    let formatted = dictionary.format(&command);
    assert!(formatted.contains("INST"));
    assert!(formatted.contains("COLLECT"));
    assert!(formatted.contains("DURATION 5"));
}
