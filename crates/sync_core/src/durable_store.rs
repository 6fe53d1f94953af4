//! Request/response side of the remote service.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{
        AccuracyClass, Bounds, ConversationId, LocationSample, LocationSource, Message, MessageId,
        UserId,
    },
    error::{ApiError, ErrorCode},
    protocol::OutboundMessage,
};
use tracing::{debug, warn};

use crate::config::SyncSettings;

/// The durable-store write for a message carries the same body as the
/// channel's `sendMessage` event.
pub type SendMessageRequest = OutboundMessage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub success: bool,
    #[serde(default)]
    pub message_id: Option<MessageId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapUser {
    pub id: UserId,
    #[serde(default)]
    pub name: Option<String>,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gym {
    pub id: String,
    pub name: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GymFilters {
    pub bounds: Option<Bounds>,
    pub search: Option<String>,
    pub limit: Option<u32>,
}

impl GymFilters {
    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(bounds) = &self.bounds {
            pairs.extend(bounds_query(bounds));
        }
        if let Some(search) = &self.search {
            pairs.push(("search", search.clone()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit", limit.to_string()));
        }
        pairs
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LocationSyncBody {
    lat: f64,
    lng: f64,
    accuracy: f64,
    accuracy_class: AccuracyClass,
    source: LocationSource,
    timestamp: DateTime<Utc>,
}

impl From<&LocationSample> for LocationSyncBody {
    fn from(sample: &LocationSample) -> Self {
        Self {
            lat: sample.lat,
            lng: sample.lng,
            accuracy: sample.accuracy_m,
            accuracy_class: sample.accuracy_class(),
            source: sample.source,
            timestamp: sample.timestamp,
        }
    }
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn fetch_history(&self, conversation_id: &ConversationId) -> Result<Vec<Message>>;
    async fn send_message(&self, request: &SendMessageRequest) -> Result<SendMessageResponse>;
    async fn sync_location(&self, sample: &LocationSample) -> Result<SyncResponse>;
    async fn fetch_map_users(&self, bounds: Bounds) -> Result<Vec<MapUser>>;
    async fn fetch_gyms(&self, filters: &GymFilters) -> Result<Vec<Gym>>;
}

pub struct HttpDurableStore {
    http: Client,
    base_url: String,
}

impl HttpDurableStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self::new(settings.base_url.clone())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl DurableStore for HttpDurableStore {
    async fn fetch_history(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        let response = self
            .http
            .get(format!("{}/api/messages/{conversation_id}", self.base_url))
            .send()
            .await?;
        let messages: Vec<Message> = check(response).await?.json().await?;
        debug!(
            conversation_id = %conversation_id,
            count = messages.len(),
            "durable_store: history fetched"
        );
        Ok(messages)
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<SendMessageResponse> {
        let response = self
            .http
            .post(format!("{}/api/messages", self.base_url))
            .json(request)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn sync_location(&self, sample: &LocationSample) -> Result<SyncResponse> {
        let response = self
            .http
            .post(format!("{}/api/location", self.base_url))
            .json(&LocationSyncBody::from(sample))
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn fetch_map_users(&self, bounds: Bounds) -> Result<Vec<MapUser>> {
        let response = self
            .http
            .get(format!("{}/api/map/users", self.base_url))
            .query(&bounds_query(&bounds))
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn fetch_gyms(&self, filters: &GymFilters) -> Result<Vec<Gym>> {
        let response = self
            .http
            .get(format!("{}/api/gyms", self.base_url))
            .query(&filters.query_pairs())
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }
}

fn bounds_query(bounds: &Bounds) -> [(&'static str, String); 4] {
    [
        ("north", bounds.north.to_string()),
        ("south", bounds.south.to_string()),
        ("east", bounds.east.to_string()),
        ("west", bounds.west.to_string()),
    ]
}

/// Turns a non-2xx response into an [`ApiError`], keeping the server's code and
/// message when the body carries one.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().clone();
    let body = response.text().await.unwrap_or_default();
    let error = serde_json::from_str::<ApiError>(&body).unwrap_or_else(|_| {
        let message = if body.trim().is_empty() {
            status.to_string()
        } else {
            body
        };
        ApiError::new(ErrorCode::from_status(status.as_u16()), message)
    });
    warn!(%url, status = status.as_u16(), code = ?error.code, "durable_store: request rejected");
    Err(error.into())
}

#[cfg(test)]
#[path = "tests/durable_store_tests.rs"]
mod tests;
