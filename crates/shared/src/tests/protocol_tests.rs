use super::*;

use chrono::TimeZone;
use serde_json::json;

use crate::{
    domain::{LocationSource, MessageId},
    error::{ApiError, ErrorCode},
};

#[test]
fn client_events_encode_as_named_frames() {
    let register = ClientEvent::Register(UserId::from("alice")).encode().expect("encode");
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&register).expect("json"),
        json!({ "event": "register", "data": "alice" })
    );

    let snapshot = ClientEvent::RequestSnapshot {
        topic: topics::RECEIVE_MESSAGE.to_string(),
        room: None,
    };
    let frame = Frame::decode(&snapshot.encode().expect("encode")).expect("frame");
    assert_eq!(frame.event, snapshot.name());
    assert_eq!(frame.data, json!({ "topic": "receiveMessage" }));
}

#[test]
fn location_update_carries_accuracy_in_meters() {
    let sample = LocationSample {
        lat: 1.5,
        lng: 2.5,
        accuracy_m: 120.0,
        source: LocationSource::Network,
        timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
    };

    let event = ClientEvent::LocationUpdate(LocationUpdatePayload::from(&sample));
    let frame = Frame::decode(&event.encode().expect("encode")).expect("frame");

    assert_eq!(frame.event, "locationUpdate");
    assert_eq!(frame.data["accuracy"], json!(120.0));
    assert_eq!(sample.accuracy_class(), crate::domain::AccuracyClass::Balanced);
}

#[test]
fn delivered_payload_becomes_a_durable_message() {
    let payload: MessagePayload = serde_json::from_value(json!({
        "id": "m1",
        "conversationId": "c1",
        "senderId": "bob",
        "content": "hey",
        "timestamp": "2024-05-01T12:00:00Z",
        "tempId": "temp-123",
    }))
    .expect("payload");

    assert_eq!(payload.temp_id, Some(MessageId::from("temp-123")));
    let message = payload.into_message();
    assert_eq!(message.sender.as_str(), "bob");
    assert!(!message.pending);
    assert!(message.delivered);
    assert!(message.attachments.is_empty());
}

#[test]
fn temporary_ids_are_recognisable() {
    assert!(MessageId::temporary().is_temporary());
    assert!(!MessageId::from("m42").is_temporary());
}

#[test]
fn bounds_handle_the_antimeridian() {
    let pacific = Bounds {
        north: 10.0,
        south: -10.0,
        east: -170.0,
        west: 170.0,
    };
    assert!(pacific.contains(0.0, 175.0));
    assert!(pacific.contains(0.0, -175.0));
    assert!(!pacific.contains(0.0, 0.0));
}

#[test]
fn api_errors_accept_either_message_field() {
    let parsed: ApiError =
        serde_json::from_value(json!({ "code": "rate_limited", "error": "slow down" }))
            .expect("api error");
    assert_eq!(parsed, ApiError::new(ErrorCode::RateLimited, "slow down"));

    let unknown: ApiError =
        serde_json::from_value(json!({ "code": "teapot", "message": "?" })).expect("api error");
    assert_eq!(unknown.code, ErrorCode::Internal);
    assert_eq!(ErrorCode::from_status(503), ErrorCode::Unavailable);
}

#[test]
fn user_location_update_tolerates_missing_accuracy() {
    let update: UserLocationPayload = serde_json::from_value(json!({
        "userId": "bob",
        "lat": 40.7,
        "lng": -74.0,
        "timestamp": "2024-05-01T09:00:00Z",
    }))
    .expect("decode");

    assert_eq!(update.user_id.as_str(), "bob");
    assert_eq!(update.accuracy, None);
}
