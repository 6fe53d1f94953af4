//! Per-conversation message list that tolerates duplicated and reordered
//! delivery.

use std::{collections::VecDeque, time::Duration};

use chrono::NaiveDate;
use shared::domain::{ConversationId, Message, MessageId, UserId};
use tokio::time::Instant;
use tracing::debug;

use crate::config::SyncSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// An entry with the same id is already present.
    DuplicateId,
    /// Same sender, content and second seen within the dedup window.
    DuplicateRecent,
    /// An optimistic entry was upgraded in place.
    ReplacedPending,
    Appended,
}

impl DeliveryOutcome {
    pub fn changed_list(self) -> bool {
        matches!(self, Self::ReplacedPending | Self::Appended)
    }
}

/// Messages from one calendar day (UTC), oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct DayGroup {
    pub day: NaiveDate,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DedupKey {
    sender: UserId,
    content: String,
    second: i64,
}

impl DedupKey {
    fn of(message: &Message) -> Self {
        Self {
            sender: message.sender.clone(),
            content: message.content.clone(),
            second: message.timestamp.timestamp(),
        }
    }
}

#[derive(Debug, Clone)]
struct RecentDelivery {
    key: DedupKey,
    seen_at: Instant,
}

#[derive(Debug, Clone)]
pub struct ConversationTimeline {
    conversation_id: ConversationId,
    messages: Vec<Message>,
    recent: VecDeque<RecentDelivery>,
    dedup_window: Duration,
    retention: Duration,
}

impl ConversationTimeline {
    pub fn new(
        conversation_id: ConversationId,
        dedup_window: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            conversation_id,
            messages: Vec::new(),
            recent: VecDeque::new(),
            dedup_window,
            retention,
        }
    }

    pub fn from_settings(conversation_id: ConversationId, settings: &SyncSettings) -> Self {
        Self::new(
            conversation_id,
            settings.dedup_window(),
            settings.recent_retention(),
        )
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn recent_len(&self) -> usize {
        self.recent.len()
    }

    /// Replaces the list wholesale and forgets every dedup tracker. Optimistic
    /// entries still waiting on the durable store are carried over.
    pub fn replace_history(&mut self, messages: Vec<Message>) {
        let pending: Vec<Message> = self.messages.drain(..).filter(|m| m.pending).collect();
        self.messages = messages;
        self.messages.extend(pending);
        self.recent.clear();
    }

    /// Inserts a local entry before any round trip. The entry is marked pending.
    pub fn append_optimistic(&mut self, mut message: Message) {
        message.pending = true;
        message.delivered = false;
        self.messages.push(message);
    }

    /// Applies one inbound delivery event.
    pub fn accept_delivery(&mut self, message: Message, now: Instant) -> DeliveryOutcome {
        self.accept_tagged_delivery(message, None, now)
    }

    /// Like [`accept_delivery`](Self::accept_delivery), for an echo that names
    /// the temporary id it was sent under. That pending entry is replaced
    /// ahead of any other with the same sender and content.
    pub fn accept_tagged_delivery(
        &mut self,
        message: Message,
        temp_id: Option<&MessageId>,
        now: Instant,
    ) -> DeliveryOutcome {
        let retention = self.retention;
        self.recent
            .retain(|seen| now.saturating_duration_since(seen.seen_at) < retention);

        if let Some(existing) = self.messages.iter_mut().find(|m| m.id == message.id) {
            existing.delivered = true;
            debug!(message_id = %message.id, "reconciliation: duplicate id");
            return DeliveryOutcome::DuplicateId;
        }

        let key = DedupKey::of(&message);
        let window = self.dedup_window;
        let seen_recently = self
            .recent
            .iter()
            .any(|seen| seen.key == key && now.saturating_duration_since(seen.seen_at) < window);
        if seen_recently {
            debug!(message_id = %message.id, "reconciliation: duplicate within dedup window");
            return DeliveryOutcome::DuplicateRecent;
        }
        self.recent.push_back(RecentDelivery { key, seen_at: now });

        let tagged = temp_id.and_then(|temp_id| {
            self.messages
                .iter()
                .position(|m| m.pending && &m.id == temp_id)
        });
        let pending = tagged.or_else(|| {
            self.messages.iter().position(|m| {
                m.pending && m.sender == message.sender && m.content == message.content
            })
        });
        if let Some(index) = pending {
            let entry = &mut self.messages[index];
            debug!(
                temp_id = %entry.id,
                message_id = %message.id,
                "reconciliation: pending entry replaced"
            );
            *entry = Message {
                pending: false,
                delivered: true,
                ..message
            };
            return DeliveryOutcome::ReplacedPending;
        }

        self.messages.push(Message {
            pending: false,
            ..message
        });
        DeliveryOutcome::Appended
    }

    /// Applies the durable-store answer for an optimistic send. Returns `false`
    /// when nothing changed, which is the case when a delivery already
    /// replaced the pending entry.
    pub fn confirm_sent(&mut self, temp_id: &MessageId, durable_id: &MessageId) -> bool {
        let Some(index) = self.messages.iter().position(|m| &m.id == temp_id) else {
            return false;
        };
        if self.messages.iter().any(|m| &m.id == durable_id) {
            self.messages.remove(index);
            debug!(
                temp_id = %temp_id,
                message_id = %durable_id,
                "reconciliation: dropped superseded pending entry"
            );
            return true;
        }
        let entry = &mut self.messages[index];
        entry.id = durable_id.clone();
        entry.pending = false;
        true
    }

    /// Drops an optimistic entry whose send failed.
    pub fn discard_pending(&mut self, temp_id: &MessageId) -> Option<Message> {
        let index = self
            .messages
            .iter()
            .position(|m| &m.id == temp_id && m.pending)?;
        Some(self.messages.remove(index))
    }

    /// Display projection: sorted by timestamp and split by calendar day.
    pub fn group_by_day(&self) -> Vec<DayGroup> {
        group_by_day(&self.messages)
    }
}

pub fn group_by_day(messages: &[Message]) -> Vec<DayGroup> {
    let mut sorted = messages.to_vec();
    sorted.sort_by_key(|m| m.timestamp);

    let mut groups: Vec<DayGroup> = Vec::new();
    for message in sorted {
        let day = message.timestamp.date_naive();
        match groups.last_mut() {
            Some(group) if group.day == day => group.messages.push(message),
            _ => groups.push(DayGroup {
                day,
                messages: vec![message],
            }),
        }
    }
    groups
}

#[cfg(test)]
#[path = "tests/reconciliation_tests.rs"]
mod tests;
