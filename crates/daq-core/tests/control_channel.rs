//! Control messages as a controller would write them by hand.

use daq_core::{ControlMessage, DaqError, MessageType};

#[test]
fn test_parse_controller_configure_message() {
    let text = r#"{
        "msg_type": "cmd",
        "msg_val": "configure",
        "id": 42,
        "timestamp": "2024-05-01T12:00:00Z",
        "params": {
            "decoder_config": {
                "frame_timeout_ms": 500,
                "enable_packet_logging": false,
                "unknown_setting": "ignored"
            }
        }
    }"#;

    let msg = ControlMessage::from_json(text).unwrap();
    assert_eq!(msg.msg_type, MessageType::Cmd);
    assert_eq!(msg.msg_val, "configure");
    assert_eq!(
        msg.params.get_u64("decoder_config/frame_timeout_ms").unwrap(),
        Some(500)
    );

    let ack = msg.ack(msg.params.clone());
    let reparsed = ControlMessage::from_json(&ack.to_json().unwrap()).unwrap();
    assert_eq!(reparsed.msg_type, MessageType::Ack);
    assert_eq!(reparsed.id, 42);
}

#[test]
fn test_params_default_when_absent() {
    let text = r#"{"msg_type":"cmd","msg_val":"status","id":1,"timestamp":"2024-05-01T12:00:00Z"}"#;
    let msg = ControlMessage::from_json(text).unwrap();
    assert!(msg.params.is_empty());
}

#[test]
fn test_unknown_message_type_is_malformed() {
    let text = r#"{"msg_type":"shout","msg_val":"status","id":1,"timestamp":"2024-05-01T12:00:00Z"}"#;
    let err = ControlMessage::from_json(text).unwrap_err();
    assert!(matches!(err, DaqError::MalformedMessage(_)));
    assert!(err.is_configuration());
}
