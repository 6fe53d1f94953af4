//! Ownership of the single persistent event channel.
//!
//! [`ChannelManager`] dials through a [`Transport`], keeps the link alive with a
//! bounded reconnect loop, dispatches inbound frames to raw handlers by event
//! name, and publishes every state transition on a broadcast channel.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::StreamExt;
use shared::{
    domain::UserId,
    protocol::{ClientEvent, Frame},
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::SyncSettings,
    lock,
    transport::{Transport, TransportLink},
};

pub type RawHandler = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            attempts: settings.reconnect_attempts,
            delay: settings.reconnect_delay(),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(1_000),
        }
    }
}

pub struct ChannelManager {
    shared: Arc<ChannelShared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

struct ChannelShared {
    transport: Arc<dyn Transport>,
    url: Url,
    policy: ReconnectPolicy,
    state: Mutex<ChannelState>,
    state_tx: broadcast::Sender<ChannelState>,
    identity: Mutex<Option<UserId>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    handlers: Mutex<HashMap<String, Vec<(HandlerId, RawHandler)>>>,
    next_handler_id: AtomicU64,
}

impl ChannelManager {
    pub fn new(transport: Arc<dyn Transport>, url: Url, policy: ReconnectPolicy) -> Arc<Self> {
        let (state_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            shared: Arc::new(ChannelShared {
                transport,
                url,
                policy,
                state: Mutex::new(ChannelState::Disconnected),
                state_tx,
                identity: Mutex::new(None),
                outbound: Mutex::new(None),
                handlers: Mutex::new(HashMap::new()),
                next_handler_id: AtomicU64::new(1),
            }),
            supervisor: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ChannelState {
        *lock(&self.shared.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Every transition from now on, in order.
    pub fn subscribe_state(&self) -> broadcast::Receiver<ChannelState> {
        self.shared.state_tx.subscribe()
    }

    pub fn identity(&self) -> Option<UserId> {
        lock(&self.shared.identity).clone()
    }

    /// Records the signed-in identity and registers it right away when connected.
    pub fn set_identity(&self, identity: Option<UserId>) {
        *lock(&self.shared.identity) = identity.clone();
        if let Some(identity) = identity {
            if self.is_connected() {
                self.send(&ClientEvent::Register(identity));
            }
        }
    }

    /// Starts the channel unless a session is already active.
    pub fn connect(&self) {
        {
            let mut state = lock(&self.shared.state);
            if *state != ChannelState::Disconnected {
                debug!(state = ?*state, "channel: connect ignored, session already active");
                return;
            }
            *state = ChannelState::Connecting;
            let _ = self.shared.state_tx.send(ChannelState::Connecting);
        }
        info!(url = %self.shared.url, "channel: connecting");

        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move { shared.supervise().await });
        if let Some(previous) = lock(&self.supervisor).replace(task) {
            previous.abort();
        }
    }

    /// Hands one event to the link. Returns `false` (after logging) when the
    /// channel is not connected.
    pub fn send(&self, event: &ClientEvent) -> bool {
        self.shared.send(event)
    }

    pub fn on_event<F>(&self, event: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        let id = HandlerId(self.shared.next_handler_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.shared.handlers)
            .entry(event.into())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    pub fn off_event(&self, event: &str, id: HandlerId) -> bool {
        let mut handlers = lock(&self.shared.handlers);
        let Some(list) = handlers.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(event);
        }
        removed
    }

    pub fn handler_count(&self, event: &str) -> usize {
        lock(&self.shared.handlers).get(event).map_or(0, Vec::len)
    }

    /// Closes the channel and forgets every handler.
    pub fn teardown(&self) {
        if let Some(task) = lock(&self.supervisor).take() {
            task.abort();
        }
        lock(&self.shared.outbound).take();
        lock(&self.shared.handlers).clear();
        self.shared.set_state(ChannelState::Disconnected);
        info!("channel: torn down");
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.supervisor).take() {
            task.abort();
        }
    }
}

impl ChannelShared {
    async fn supervise(self: Arc<Self>) {
        let mut failures: u32 = 0;
        loop {
            match self.transport.open(&self.url).await {
                Ok(link) => {
                    failures = 0;
                    self.run_link(link).await;
                    info!("channel: link dropped");
                }
                Err(err) => {
                    warn!(attempt = failures, error = %err, "channel: connect attempt failed");
                }
            }

            if failures >= self.policy.attempts {
                warn!(
                    attempts = self.policy.attempts,
                    "channel: reconnection attempts exhausted, giving up"
                );
                self.set_state(ChannelState::Disconnected);
                return;
            }
            failures += 1;
            self.set_state(ChannelState::Reconnecting);
            tokio::time::sleep(self.policy.delay).await;
        }
    }

    async fn run_link(&self, link: TransportLink) {
        let TransportLink {
            outbound,
            mut inbound,
        } = link;
        *lock(&self.outbound) = Some(outbound);

        let identity = lock(&self.identity).clone();
        if let Some(identity) = identity {
            self.write(&ClientEvent::Register(identity));
        }
        self.set_state(ChannelState::Connected);

        while let Some(frame) = inbound.next().await {
            match frame {
                Ok(text) => self.dispatch(&text),
                Err(err) => {
                    warn!(error = %err, "channel: receive failed");
                    break;
                }
            }
        }
        lock(&self.outbound).take();
    }

    fn dispatch(&self, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "channel: dropping undecodable frame");
                return;
            }
        };
        let handlers: Vec<RawHandler> = lock(&self.handlers)
            .get(&frame.event)
            .map(|list| list.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(event = %frame.event, "channel: no handler for event");
        }
        for handler in handlers {
            handler(&frame.data);
        }
    }

    fn send(&self, event: &ClientEvent) -> bool {
        let state = *lock(&self.state);
        if state != ChannelState::Connected {
            warn!(event = event.name(), ?state, "channel: not connected, dropping send");
            return false;
        }
        self.write(event)
    }

    fn write(&self, event: &ClientEvent) -> bool {
        let text = match event.encode() {
            Ok(text) => text,
            Err(err) => {
                warn!(event = event.name(), error = %err, "channel: failed to encode event");
                return false;
            }
        };
        match lock(&self.outbound).as_ref() {
            Some(tx) => tx.send(text).is_ok(),
            None => false,
        }
    }

    fn set_state(&self, next: ChannelState) {
        let mut state = lock(&self.state);
        if *state == next {
            return;
        }
        debug!(from = ?*state, to = ?next, "channel: state transition");
        *state = next;
        let _ = self.state_tx.send(next);
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
