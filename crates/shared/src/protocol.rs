use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Attachment, Bounds, ConversationId, LocationSample, Message, MessageId, UserId};

/// Inbound topic names as the service emits them.
pub mod topics {
    pub const RECEIVE_MESSAGE: &str = "receiveMessage";
    pub const TYPING: &str = "typing";
    pub const USER_LOCATION_UPDATE: &str = "userLocationUpdate";
    pub const USER_OFFLINE: &str = "userOffline";
    pub const MATCH_UPDATE: &str = "match-update";
    pub const NEW_MATCH: &str = "new-match";
    pub const GYM_CREATED: &str = "gymCreated";
    pub const GYM_UPDATED: &str = "gymUpdated";

    pub const ALL: [&str; 8] = [
        RECEIVE_MESSAGE,
        TYPING,
        USER_LOCATION_UPDATE,
        USER_OFFLINE,
        MATCH_UPDATE,
        NEW_MATCH,
        GYM_CREATED,
        GYM_UPDATED,
    ];
}

/// One channel frame: `{"event": name, "data": payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Frame {
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "register")]
    Register(UserId),
    #[serde(rename = "sendMessage")]
    SendMessage(OutboundMessage),
    #[serde(rename = "typing")]
    Typing(TypingPayload),
    #[serde(rename = "locationUpdate")]
    LocationUpdate(LocationUpdatePayload),
    #[serde(rename = "subscribeToMapUpdates")]
    SubscribeToMapUpdates(MapSubscription),
    #[serde(rename = "joinRoom")]
    JoinRoom { room: String },
    #[serde(rename = "leaveRoom")]
    LeaveRoom { room: String },
    #[serde(rename = "requestSnapshot")]
    RequestSnapshot {
        topic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<String>,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Register(_) => "register",
            Self::SendMessage(_) => "sendMessage",
            Self::Typing(_) => "typing",
            Self::LocationUpdate(_) => "locationUpdate",
            Self::SubscribeToMapUpdates(_) => "subscribeToMapUpdates",
            Self::JoinRoom { .. } => "joinRoom",
            Self::LeaveRoom { .. } => "leaveRoom",
            Self::RequestSnapshot { .. } => "requestSnapshot",
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub temp_id: MessageId,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub is_typing: bool,
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdatePayload {
    pub lat: f64,
    pub lng: f64,
    pub accuracy: f64,
    pub timestamp: DateTime<Utc>,
}

impl From<&LocationSample> for LocationUpdatePayload {
    fn from(sample: &LocationSample) -> Self {
        Self {
            lat: sample.lat,
            lng: sample.lng,
            accuracy: sample.accuracy_m,
            timestamp: sample.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapSubscription {
    pub bounds: Bounds,
    pub zoom: u8,
    pub timestamp: DateTime<Utc>,
}

/// `receiveMessage` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<MessageId>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl MessagePayload {
    pub fn into_message(self) -> Message {
        Message {
            id: self.id,
            conversation_id: self.conversation_id,
            sender: self.sender_id,
            content: self.content,
            attachments: self.attachments,
            timestamp: self.timestamp,
            pending: false,
            delivered: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLocationPayload {
    pub user_id: UserId,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOfflinePayload {
    pub user_id: UserId,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
