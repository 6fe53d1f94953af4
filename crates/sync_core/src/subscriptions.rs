//! Typed, topic-scoped subscriptions on top of the raw channel handlers.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
};

use futures::StreamExt;
use serde::de::DeserializeOwned;
use shared::protocol::ClientEvent;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    channel::{ChannelManager, ChannelState, HandlerId},
    config::SyncSettings,
    lock,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub room: Option<String>,
    pub request_initial: bool,
}

impl SubscribeOptions {
    pub fn in_room(room: impl Into<String>) -> Self {
        Self {
            room: Some(room.into()),
            request_initial: false,
        }
    }

    pub fn with_initial_snapshot(mut self) -> Self {
        self.request_initial = true;
        self
    }
}

pub struct SubscriptionHub {
    shared: Arc<HubShared>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

struct HubShared {
    channel: Arc<ChannelManager>,
    registry: Mutex<Registry>,
    critical_topics: HashSet<String>,
    rejoin_rooms: bool,
}

#[derive(Default)]
struct Registry {
    subscriptions: HashMap<Uuid, SubscriptionRecord>,
    rooms: HashMap<String, RoomMembership>,
}

struct SubscriptionRecord {
    topic: String,
    room: Option<String>,
    snapshot_pending: bool,
}

struct RoomMembership {
    refs: usize,
    joined: bool,
}

/// Handle returned by [`SubscriptionHub::subscribe`]; dropping it unsubscribes.
pub struct Subscription {
    id: Uuid,
    topic: String,
    handler_id: HandlerId,
    hub: Weak<HubShared>,
    active: AtomicBool,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Safe to call any number of times.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id, &self.topic, self.handler_id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl SubscriptionHub {
    pub fn new(channel: Arc<ChannelManager>, settings: &SyncSettings) -> Self {
        Self::with_policy(
            channel,
            settings.critical_topics.iter().cloned(),
            settings.rejoin_rooms_on_reconnect,
        )
    }

    pub fn with_policy(
        channel: Arc<ChannelManager>,
        critical_topics: impl IntoIterator<Item = String>,
        rejoin_rooms: bool,
    ) -> Self {
        let states = BroadcastStream::new(channel.subscribe_state());
        let already_connected = channel.is_connected();
        let shared = Arc::new(HubShared {
            channel,
            registry: Mutex::new(Registry::default()),
            critical_topics: critical_topics.into_iter().collect(),
            rejoin_rooms,
        });
        let watcher = tokio::spawn(watch_channel(
            Arc::clone(&shared),
            states,
            already_connected,
        ));
        Self {
            shared,
            watcher: Mutex::new(Some(watcher)),
        }
    }

    /// Registers `handler` for `topic`. Payloads are decoded into `T`; decode
    /// failures, handler errors and handler panics are logged and contained.
    pub fn subscribe<T, F>(
        &self,
        topic: &str,
        handler: F,
        options: SubscribeOptions,
    ) -> Subscription
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        let topic_name = topic.to_string();
        let handler_id = self
            .shared
            .channel
            .on_event(topic, move |data| deliver::<T, F>(&topic_name, data, &handler));

        let first_in_room = {
            let mut registry = lock(&self.shared.registry);
            registry.subscriptions.insert(
                id,
                SubscriptionRecord {
                    topic: topic.to_string(),
                    room: options.room.clone(),
                    snapshot_pending: options.request_initial,
                },
            );
            options.room.as_ref().and_then(|room| {
                let membership = registry.rooms.entry(room.clone()).or_insert(RoomMembership {
                    refs: 0,
                    joined: false,
                });
                membership.refs += 1;
                (membership.refs == 1).then(|| room.clone())
            })
        };

        if let Some(room) = first_in_room {
            self.shared.join_room(&room);
        }
        if options.request_initial {
            self.shared.request_snapshot(id, topic, options.room.as_deref());
        }
        debug!(topic, room = ?options.room, "subscriptions: subscribed");

        Subscription {
            id,
            topic: topic.to_string(),
            handler_id,
            hub: Arc::downgrade(&self.shared),
            active: AtomicBool::new(true),
        }
    }

    pub fn active_count(&self) -> usize {
        lock(&self.shared.registry).subscriptions.len()
    }

    pub fn room_refs(&self, room: &str) -> usize {
        lock(&self.shared.registry)
            .rooms
            .get(room)
            .map_or(0, |membership| membership.refs)
    }

    /// Stops reacting to channel state changes.
    pub fn shutdown(&self) {
        if let Some(watcher) = lock(&self.watcher).take() {
            watcher.abort();
        }
    }
}

impl Drop for SubscriptionHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn deliver<T, F>(topic: &str, data: &serde_json::Value, handler: &F)
where
    T: DeserializeOwned,
    F: Fn(T) -> anyhow::Result<()>,
{
    let payload = match T::deserialize(data) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(topic, error = %err, "subscriptions: dropping undecodable payload");
            return;
        }
    };
    match panic::catch_unwind(AssertUnwindSafe(|| handler(payload))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(topic, error = %err, "subscriptions: handler failed"),
        Err(_) => error!(topic, "subscriptions: handler panicked"),
    }
}

async fn watch_channel(
    shared: Arc<HubShared>,
    mut states: BroadcastStream<ChannelState>,
    mut has_connected: bool,
) {
    while let Some(state) = states.next().await {
        match state {
            Ok(ChannelState::Connected) => {
                shared.on_connected(has_connected);
                has_connected = true;
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "subscriptions: missed channel state updates"),
        }
    }
}

impl HubShared {
    fn join_room(&self, room: &str) {
        let sent = self.channel.send(&ClientEvent::JoinRoom {
            room: room.to_string(),
        });
        if sent {
            if let Some(membership) = lock(&self.registry).rooms.get_mut(room) {
                membership.joined = true;
            }
        }
    }

    fn request_snapshot(&self, id: Uuid, topic: &str, room: Option<&str>) {
        let sent = self.channel.send(&ClientEvent::RequestSnapshot {
            topic: topic.to_string(),
            room: room.map(str::to_string),
        });
        if sent {
            if let Some(record) = lock(&self.registry).subscriptions.get_mut(&id) {
                record.snapshot_pending = false;
            }
        }
    }

    fn on_connected(&self, reconnect: bool) {
        let (rooms, snapshots, pending_ids) = {
            let registry = lock(&self.registry);
            let rooms: Vec<String> = registry
                .rooms
                .iter()
                .filter(|(_, membership)| !membership.joined || (reconnect && self.rejoin_rooms))
                .map(|(room, _)| room.clone())
                .collect();

            let mut snapshots = BTreeSet::new();
            let mut pending_ids = Vec::new();
            for (id, record) in &registry.subscriptions {
                if record.snapshot_pending {
                    pending_ids.push(*id);
                    snapshots.insert((record.topic.clone(), record.room.clone()));
                } else if reconnect && self.critical_topics.contains(&record.topic) {
                    snapshots.insert((record.topic.clone(), record.room.clone()));
                }
            }
            (rooms, snapshots, pending_ids)
        };

        if reconnect {
            info!(
                refreshes = snapshots.len(),
                rejoins = rooms.len(),
                "subscriptions: channel reconnected"
            );
        }

        for room in rooms {
            self.join_room(&room);
        }
        let mut all_sent = true;
        for (topic, room) in snapshots {
            all_sent &= self
                .channel
                .send(&ClientEvent::RequestSnapshot { topic, room });
        }
        if all_sent && !pending_ids.is_empty() {
            let mut registry = lock(&self.registry);
            for id in pending_ids {
                if let Some(record) = registry.subscriptions.get_mut(&id) {
                    record.snapshot_pending = false;
                }
            }
        }
    }

    fn remove(&self, id: Uuid, topic: &str, handler_id: HandlerId) {
        self.channel.off_event(topic, handler_id);
        let leave = {
            let mut registry = lock(&self.registry);
            let Some(record) = registry.subscriptions.remove(&id) else {
                return;
            };
            record.room.and_then(|room| {
                let membership = registry.rooms.get_mut(&room)?;
                membership.refs = membership.refs.saturating_sub(1);
                if membership.refs > 0 {
                    return None;
                }
                let joined = membership.joined;
                registry.rooms.remove(&room);
                joined.then_some(room)
            })
        };
        if let Some(room) = leave {
            self.channel.send(&ClientEvent::LeaveRoom { room });
        }
        debug!(topic, "subscriptions: unsubscribed");
    }
}

#[cfg(test)]
#[path = "tests/subscriptions_tests.rs"]
mod tests;
