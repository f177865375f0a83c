//! Pins the JSON shapes that cross process boundaries: notification
//! payloads on the dispatcher channel and event payloads in the log. Old
//! and new worker versions share a database during deploys, so these shapes
//! are a compatibility contract, not an implementation detail.

use courier_core::outbox::{EventPayload, WakeSignal};
use serde_json::json;

#[test]
fn wake_signal_event_appended_shape() {
    let signal = WakeSignal::EventAppended {
        event_id: 42,
        event_type: "message_created".to_string(),
    };
    let value = serde_json::to_value(&signal).unwrap();
    assert_eq!(
        value,
        json!({
            "kind": "event_appended",
            "event_id": 42,
            "event_type": "message_created",
        })
    );
}

#[test]
fn wake_signal_keepalive_shape() {
    let signal = WakeSignal::Keepalive { probe: 7 };
    let value = serde_json::to_value(&signal).unwrap();
    assert_eq!(value, json!({"kind": "keepalive", "probe": 7}));
}

#[test]
fn wake_signal_parses_from_raw_channel_payload() {
    // What an older worker would have published
    let raw = r#"{"kind":"event_appended","event_id":9001,"event_type":"reaction_added"}"#;
    match serde_json::from_str::<WakeSignal>(raw).unwrap() {
        WakeSignal::EventAppended {
            event_id,
            event_type,
        } => {
            assert_eq!(event_id, 9001);
            assert_eq!(event_type, "reaction_added");
        }
        WakeSignal::Keepalive { .. } => panic!("wrong variant"),
    }
}

#[test]
fn unknown_wake_signal_kind_is_rejected_not_misparsed() {
    // The dispatcher treats this as a parse error and still wakes consumers
    let raw = r#"{"kind":"schema_migrated","version":3}"#;
    assert!(serde_json::from_str::<WakeSignal>(raw).is_err());
}

#[test]
fn event_payload_tag_matches_column_value() {
    let payload = EventPayload::ReactionAdded {
        message_id: 10,
        workspace_id: "acme".to_string(),
        user_id: 5,
        emoji: "🎉".to_string(),
    };
    let value = serde_json::to_value(&payload).unwrap();
    assert_eq!(value["event_type"], payload.event_type());

    let back: EventPayload = serde_json::from_value(value).unwrap();
    assert_eq!(back, payload);
}
