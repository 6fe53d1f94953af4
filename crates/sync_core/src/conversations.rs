//! Chat-facing façade: history loading, optimistic sends and live delivery for
//! every open conversation.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Utc;
use shared::{
    domain::{Attachment, ConversationId, Message, MessageId, UserId},
    protocol::{topics, ClientEvent, MessagePayload, OutboundMessage, TypingPayload},
};
use tokio::{sync::broadcast, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    channel::ChannelManager,
    config::SyncSettings,
    durable_store::{DurableStore, SendMessageResponse},
    error::SyncError,
    lock,
    reconciliation::{ConversationTimeline, DayGroup, DeliveryOutcome},
    request_cache::{CacheError, CallOptions, RequestCache},
    subscriptions::{SubscribeOptions, Subscription, SubscriptionHub},
};

#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub conversation_id: ConversationId,
    pub receiver_id: UserId,
    pub content: String,
    pub attachments: Vec<Attachment>,
}

impl OutgoingMessage {
    pub fn text(
        conversation_id: ConversationId,
        receiver_id: UserId,
        content: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id,
            receiver_id,
            content: content.into(),
            attachments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimelineUpdate {
    HistoryLoaded {
        conversation_id: ConversationId,
        count: usize,
    },
    Optimistic {
        conversation_id: ConversationId,
        temp_id: MessageId,
    },
    Delivered {
        conversation_id: ConversationId,
        message_id: MessageId,
        outcome: DeliveryOutcome,
    },
    Confirmed {
        conversation_id: ConversationId,
        temp_id: MessageId,
        message_id: MessageId,
    },
    SendFailed {
        conversation_id: ConversationId,
        temp_id: MessageId,
    },
}

pub struct ConversationSync {
    shared: Arc<ConversationsShared>,
    delivery: Mutex<Option<Subscription>>,
}

struct ConversationsShared {
    channel: Arc<ChannelManager>,
    store: Arc<dyn DurableStore>,
    history: RequestCache<Vec<Message>>,
    sends: RequestCache<SendMessageResponse>,
    options: CallOptions,
    dedup_window: Duration,
    retention: Duration,
    timelines: Mutex<HashMap<ConversationId, ConversationTimeline>>,
    updates: broadcast::Sender<TimelineUpdate>,
}

fn history_key(conversation_id: &ConversationId) -> String {
    format!("history:{conversation_id}")
}

impl ConversationSync {
    pub fn new(
        channel: Arc<ChannelManager>,
        store: Arc<dyn DurableStore>,
        history: RequestCache<Vec<Message>>,
        settings: &SyncSettings,
    ) -> Self {
        let (updates, _) = broadcast::channel(1024);
        Self {
            shared: Arc::new(ConversationsShared {
                channel,
                store,
                history,
                sends: RequestCache::new(settings.debounce()),
                options: CallOptions::from_settings(settings),
                dedup_window: settings.dedup_window(),
                retention: settings.recent_retention(),
                timelines: Mutex::new(HashMap::new()),
                updates,
            }),
            delivery: Mutex::new(None),
        }
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<TimelineUpdate> {
        self.shared.updates.subscribe()
    }

    /// Routes `receiveMessage` deliveries into the matching timelines.
    pub fn attach(&self, hub: &SubscriptionHub) {
        let shared = Arc::clone(&self.shared);
        let subscription = hub.subscribe(
            topics::RECEIVE_MESSAGE,
            move |payload: MessagePayload| {
                shared.deliver(payload);
                Ok(())
            },
            SubscribeOptions::default(),
        );
        if lock(&self.delivery).replace(subscription).is_some() {
            debug!("conversations: replaced previous delivery subscription");
        }
    }

    pub fn detach(&self) {
        lock(&self.delivery).take();
    }

    /// Fetches history through the shared cache and replaces the local list.
    pub async fn load_history(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, SyncError> {
        let store = Arc::clone(&self.shared.store);
        let id = conversation_id.clone();
        let messages = self
            .shared
            .history
            .call(
                &history_key(conversation_id),
                move || {
                    let store = Arc::clone(&store);
                    let id = id.clone();
                    async move { store.fetch_history(&id).await }
                },
                self.shared.options,
            )
            .await
            .map_err(|source| SyncError::History {
                conversation_id: conversation_id.clone(),
                source,
            })?;

        self.shared
            .with_timeline(conversation_id, |timeline| {
                timeline.replace_history(messages.clone())
            });
        info!(
            conversation_id = %conversation_id,
            count = messages.len(),
            "conversations: history loaded"
        );
        self.shared.publish(TimelineUpdate::HistoryLoaded {
            conversation_id: conversation_id.clone(),
            count: messages.len(),
        });
        Ok(messages)
    }

    /// Appends an optimistic entry, emits it on the channel and writes it to
    /// the durable store. The returned message carries the durable id when the
    /// store answered with one.
    pub async fn send_message(&self, outgoing: OutgoingMessage) -> Result<Message, SyncError> {
        let sender = self
            .shared
            .channel
            .identity()
            .ok_or(SyncError::MissingIdentity)?;
        if outgoing.content.trim().is_empty() && outgoing.attachments.is_empty() {
            return Err(SyncError::EmptyMessage);
        }

        let temp_id = MessageId::temporary();
        let conversation_id = outgoing.conversation_id.clone();
        let request = OutboundMessage {
            conversation_id: conversation_id.clone(),
            sender_id: sender.clone(),
            receiver_id: outgoing.receiver_id,
            content: outgoing.content,
            timestamp: Utc::now(),
            temp_id: temp_id.clone(),
            attachments: outgoing.attachments,
        };
        let optimistic = Message {
            id: temp_id.clone(),
            conversation_id: conversation_id.clone(),
            sender,
            content: request.content.clone(),
            attachments: request.attachments.clone(),
            timestamp: request.timestamp,
            pending: true,
            delivered: false,
        };
        self.shared
            .with_timeline(&conversation_id, |timeline| {
                timeline.append_optimistic(optimistic.clone())
            });
        self.shared.publish(TimelineUpdate::Optimistic {
            conversation_id: conversation_id.clone(),
            temp_id: temp_id.clone(),
        });

        if !self
            .shared
            .channel
            .send(&ClientEvent::SendMessage(request.clone()))
        {
            debug!(
                temp_id = %temp_id,
                "conversations: live send skipped, relying on durable store"
            );
        }

        let response = match self.write_durably(request).await {
            Ok(response) => response,
            Err(source) => {
                self.shared.publish(TimelineUpdate::SendFailed {
                    conversation_id,
                    temp_id: temp_id.clone(),
                });
                return Err(SyncError::Send { temp_id, source });
            }
        };

        match (response.success, response.message_id) {
            (true, Some(message_id)) => {
                let changed = self.shared.with_timeline(&conversation_id, |timeline| {
                    timeline.confirm_sent(&temp_id, &message_id)
                });
                if !changed {
                    debug!(
                        temp_id = %temp_id,
                        message_id = %message_id,
                        "conversations: entry already settled by delivery"
                    );
                }
                self.shared
                    .history
                    .clear_cache(Some(&history_key(&conversation_id)));
                self.shared.publish(TimelineUpdate::Confirmed {
                    conversation_id,
                    temp_id,
                    message_id: message_id.clone(),
                });
                Ok(Message {
                    id: message_id,
                    pending: false,
                    ..optimistic
                })
            }
            // Accepted without an id: the delivery echo will replace the entry.
            (true, None) => Ok(optimistic),
            (false, _) => {
                warn!(temp_id = %temp_id, "conversations: durable store rejected message");
                self.shared.publish(TimelineUpdate::SendFailed {
                    conversation_id,
                    temp_id: temp_id.clone(),
                });
                Err(SyncError::Rejected { temp_id })
            }
        }
    }

    async fn write_durably(
        &self,
        request: OutboundMessage,
    ) -> Result<SendMessageResponse, CacheError> {
        let store = Arc::clone(&self.shared.store);
        let key = format!("send:{}", request.temp_id);
        let request = Arc::new(request);
        let options = self
            .shared
            .options
            .with_cache_time(Duration::ZERO)
            .with_min_interval(Duration::ZERO)
            .bypassing_cache();
        let result = self
            .shared
            .sends
            .call(
                &key,
                move || {
                    let store = Arc::clone(&store);
                    let request = Arc::clone(&request);
                    async move { store.send_message(&request).await }
                },
                options,
            )
            .await;
        self.shared.sends.clear_cache(Some(&key));
        result
    }

    /// Notifies the other participant. Returns whether the event went out.
    pub fn send_typing(
        &self,
        conversation_id: &ConversationId,
        receiver_id: &UserId,
        is_typing: bool,
    ) -> Result<bool, SyncError> {
        let sender_id = self
            .shared
            .channel
            .identity()
            .ok_or(SyncError::MissingIdentity)?;
        Ok(self.shared.channel.send(&ClientEvent::Typing(TypingPayload {
            sender_id,
            receiver_id: receiver_id.clone(),
            is_typing,
            conversation_id: conversation_id.clone(),
        })))
    }

    /// Removes an optimistic entry the caller gave up on.
    pub fn discard_pending(&self, conversation_id: &ConversationId, temp_id: &MessageId) -> bool {
        lock(&self.shared.timelines)
            .get_mut(conversation_id)
            .and_then(|timeline| timeline.discard_pending(temp_id))
            .is_some()
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        lock(&self.shared.timelines)
            .get(conversation_id)
            .map(|timeline| timeline.messages().to_vec())
            .unwrap_or_default()
    }

    pub fn grouped(&self, conversation_id: &ConversationId) -> Vec<DayGroup> {
        lock(&self.shared.timelines)
            .get(conversation_id)
            .map(ConversationTimeline::group_by_day)
            .unwrap_or_default()
    }
}

impl ConversationsShared {
    fn with_timeline<R>(
        &self,
        conversation_id: &ConversationId,
        apply: impl FnOnce(&mut ConversationTimeline) -> R,
    ) -> R {
        let mut timelines = lock(&self.timelines);
        let timeline = timelines
            .entry(conversation_id.clone())
            .or_insert_with(|| {
                ConversationTimeline::new(
                    conversation_id.clone(),
                    self.dedup_window,
                    self.retention,
                )
            });
        apply(timeline)
    }

    fn deliver(&self, payload: MessagePayload) {
        let temp_id = payload.temp_id.clone();
        let message = payload.into_message();
        let conversation_id = message.conversation_id.clone();
        let message_id = message.id.clone();
        let outcome = self.with_timeline(&conversation_id, |timeline| {
            timeline.accept_tagged_delivery(message, temp_id.as_ref(), Instant::now())
        });
        debug!(
            conversation_id = %conversation_id,
            message_id = %message_id,
            ?outcome,
            "conversations: delivery applied"
        );
        if outcome.changed_list() {
            self.history.clear_cache(Some(&history_key(&conversation_id)));
            self.publish(TimelineUpdate::Delivered {
                conversation_id,
                message_id,
                outcome,
            });
        }
    }

    fn publish(&self, update: TimelineUpdate) {
        let _ = self.updates.send(update);
    }
}

#[cfg(test)]
#[path = "tests/conversations_tests.rs"]
mod tests;
