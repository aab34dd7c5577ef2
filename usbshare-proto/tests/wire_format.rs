use k9::assert_equal;
use usbshare_proto::device::DeviceEntry;
use usbshare_proto::relay::{ParseError, RelayMessage};

#[test]
fn test_type_tags_match_the_wire_protocol() {
    let json = RelayMessage::ShareDevice {
        key: "abc123".to_string(),
        device_id: "1-1".to_string(),
    }
    .to_json();

    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_equal!(value["type"].as_str(), Some("share_device"));
    assert_equal!(value["key"].as_str(), Some("abc123"));
    assert_equal!(value["device_id"].as_str(), Some("1-1"));
}

#[test]
fn test_host_connect_parses_from_external_json() {
    let msg = RelayMessage::from_json(r#"{"type":"host_connect","key":"abc123"}"#).unwrap();
    assert_equal!(
        msg,
        RelayMessage::HostConnect {
            key: "abc123".to_string()
        }
    );
}

#[test]
fn test_extra_fields_are_ignored_for_routing() {
    // Senders attach whatever their payloads need; the envelope parse only
    // cares about the fields the relay routes on.
    let msg = RelayMessage::from_json(
        r#"{"type":"relay_message","payload":"ping","origin":"host-app","seq":42}"#,
    )
    .unwrap();
    match msg {
        RelayMessage::Relay { payload } => {
            assert_equal!(payload.as_str(), Some("ping"));
        }
        other => panic!("expected relay_message, got {:?}", other),
    }
}

#[test]
fn test_device_entry_metadata_flattens() {
    let json = r#"{"id":"1-1","vendor":"Logitech","product":"USB Receiver"}"#;
    let entry: DeviceEntry = serde_json::from_str(json).unwrap();
    assert_equal!(entry.id, "1-1");
    assert_equal!(entry.info.get("vendor").map(String::as_str), Some("Logitech"));

    let back = serde_json::to_value(&entry).unwrap();
    assert_equal!(back["product"].as_str(), Some("USB Receiver"));
}

#[test]
fn test_unknown_type_is_rejected_explicitly() {
    let err = RelayMessage::from_json(r#"{"type":"host_port_update","port":1234}"#).unwrap_err();
    match err {
        ParseError::UnknownType(tag) => {
            assert_equal!(tag, "host_port_update");
        }
        other => panic!("expected UnknownType, got {:?}", other),
    }
}

#[test]
fn test_missing_required_field_is_not_an_unknown_type() {
    let err = RelayMessage::from_json(r#"{"type":"share_device","key":"abc123"}"#).unwrap_err();
    match err {
        ParseError::MissingField { tag, .. } => {
            assert_equal!(tag, "share_device");
        }
        other => panic!("expected MissingField, got {:?}", other),
    }
}

#[test]
fn test_malformed_json_and_missing_type() {
    assert!(matches!(
        RelayMessage::from_json("{not json"),
        Err(ParseError::Malformed(_))
    ));
    assert!(matches!(
        RelayMessage::from_json(r#"{"key":"abc123"}"#),
        Err(ParseError::MissingType)
    ));
}

#[test]
fn test_registration_success_omits_absent_device_list() {
    let json = RelayMessage::RegistrationSuccess {
        message: "Successfully registered as client".to_string(),
        devices: None,
    }
    .to_json();
    assert!(!json.contains("devices"));

    let json = RelayMessage::RegistrationSuccess {
        message: "Successfully registered as host".to_string(),
        devices: Some(vec![DeviceEntry::new("1-1")]),
    }
    .to_json();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_equal!(value["devices"][0]["id"].as_str(), Some("1-1"));
}
