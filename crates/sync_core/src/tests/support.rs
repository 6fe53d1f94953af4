use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use shared::{
    domain::{Bounds, ConversationId, LocationSample, Message, MessageId},
    protocol::Frame,
};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use url::Url;

use crate::{
    channel::{ChannelManager, ChannelState, ReconnectPolicy},
    durable_store::{
        DurableStore, Gym, GymFilters, MapUser, SendMessageRequest, SendMessageResponse,
        SyncResponse,
    },
    transport::{Transport, TransportLink},
};

/// Server half of one in-memory link.
pub(crate) struct ServerEnd {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: Option<mpsc::UnboundedSender<Result<String>>>,
}

impl ServerEnd {
    pub(crate) async fn next_frame(&mut self) -> Frame {
        let text = tokio::time::timeout(Duration::from_secs(5), self.from_client.recv())
            .await
            .expect("frame should arrive")
            .expect("client side open");
        Frame::decode(&text).expect("client frames are valid json")
    }

    pub(crate) fn try_next_frame(&mut self) -> Option<Frame> {
        self.from_client
            .try_recv()
            .ok()
            .map(|text| Frame::decode(&text).expect("client frames are valid json"))
    }

    pub(crate) fn push(&self, event: &str, data: serde_json::Value) {
        let frame = serde_json::json!({ "event": event, "data": data });
        self.push_raw(frame.to_string());
    }

    pub(crate) fn push_raw(&self, text: String) {
        self.to_client
            .as_ref()
            .expect("link still open")
            .send(Ok(text))
            .expect("client still reading");
    }

    /// Ends the inbound stream, which the client sees as a dropped link.
    pub(crate) fn drop_link(&mut self) {
        self.to_client.take();
    }
}

#[derive(Clone)]
pub(crate) struct MemoryTransport {
    opens: Arc<AtomicU32>,
    failing: Arc<Mutex<bool>>,
    links: mpsc::UnboundedSender<ServerEnd>,
}

impl MemoryTransport {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<ServerEnd>) {
        let (links, links_rx) = mpsc::unbounded_channel();
        (
            Self {
                opens: Arc::new(AtomicU32::new(0)),
                failing: Arc::new(Mutex::new(false)),
                links,
            },
            links_rx,
        )
    }

    pub(crate) fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        *self.failing.lock().expect("lock") = failing;
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, _url: &Url) -> Result<TransportLink> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if *self.failing.lock().expect("lock") {
            return Err(anyhow!("connection refused"));
        }
        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound_rx) = mpsc::unbounded_channel();
        self.links
            .send(ServerEnd {
                from_client,
                to_client: Some(to_client),
            })
            .map_err(|_| anyhow!("test harness gone"))?;
        Ok(TransportLink {
            outbound,
            inbound: UnboundedReceiverStream::new(inbound_rx).boxed(),
        })
    }
}

pub(crate) fn test_url() -> Url {
    Url::parse("ws://sync.test/ws").expect("url")
}

pub(crate) fn memory_channel() -> (
    Arc<ChannelManager>,
    MemoryTransport,
    mpsc::UnboundedReceiver<ServerEnd>,
) {
    let (transport, links) = MemoryTransport::new();
    let channel = ChannelManager::new(
        Arc::new(transport.clone()),
        test_url(),
        ReconnectPolicy::default(),
    );
    (channel, transport, links)
}

pub(crate) async fn next_link(links: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
    tokio::time::timeout(Duration::from_secs(5), links.recv())
        .await
        .expect("link should open")
        .expect("transport alive")
}

pub(crate) async fn wait_for_state(
    states: &mut broadcast::Receiver<ChannelState>,
    target: ChannelState,
) {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match states.recv().await {
                Ok(state) if state == target => return,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(err) => panic!("state stream closed: {err}"),
            }
        }
    })
    .await
    .expect("state should be reached");
}

/// Connects and returns the open server end once the channel reports Connected.
pub(crate) async fn connected_channel() -> (
    Arc<ChannelManager>,
    MemoryTransport,
    mpsc::UnboundedReceiver<ServerEnd>,
    ServerEnd,
) {
    let (channel, transport, mut links) = memory_channel();
    let mut states = channel.subscribe_state();
    channel.connect();
    let server = next_link(&mut links).await;
    wait_for_state(&mut states, ChannelState::Connected).await;
    (channel, transport, links, server)
}

/// In-memory durable store that records every write.
pub(crate) struct MockStore {
    history: Mutex<Vec<Message>>,
    history_calls: AtomicU32,
    sent: Mutex<Vec<SendMessageRequest>>,
    send_delay: Mutex<Duration>,
    send_failing: Mutex<bool>,
    durable_id: Mutex<String>,
    locations: Mutex<Vec<LocationSample>>,
}

impl MockStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            history: Mutex::new(Vec::new()),
            history_calls: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
            send_delay: Mutex::new(Duration::ZERO),
            send_failing: Mutex::new(false),
            durable_id: Mutex::new("m42".to_string()),
            locations: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn set_history(&self, messages: Vec<Message>) {
        *self.history.lock().expect("lock") = messages;
    }

    pub(crate) fn history_calls(&self) -> u32 {
        self.history_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().expect("lock") = delay;
    }

    pub(crate) fn set_send_failing(&self, failing: bool) {
        *self.send_failing.lock().expect("lock") = failing;
    }

    pub(crate) fn set_durable_id(&self, id: &str) {
        *self.durable_id.lock().expect("lock") = id.to_string();
    }

    pub(crate) fn sent(&self) -> Vec<SendMessageRequest> {
        self.sent.lock().expect("lock").clone()
    }

    pub(crate) fn locations(&self) -> Vec<LocationSample> {
        self.locations.lock().expect("lock").clone()
    }
}

#[async_trait]
impl DurableStore for MockStore {
    async fn fetch_history(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .history
            .lock()
            .expect("lock")
            .iter()
            .filter(|message| &message.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<SendMessageResponse> {
        self.sent.lock().expect("lock").push(request.clone());
        let delay = *self.send_delay.lock().expect("lock");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if *self.send_failing.lock().expect("lock") {
            return Err(anyhow!("store unavailable"));
        }
        let id = self.durable_id.lock().expect("lock").clone();
        Ok(SendMessageResponse {
            success: true,
            message_id: Some(MessageId::from(id)),
        })
    }

    async fn sync_location(&self, sample: &LocationSample) -> Result<SyncResponse> {
        self.locations.lock().expect("lock").push(sample.clone());
        Ok(SyncResponse { success: true })
    }

    async fn fetch_map_users(&self, _bounds: Bounds) -> Result<Vec<MapUser>> {
        Ok(Vec::new())
    }

    async fn fetch_gyms(&self, _filters: &GymFilters) -> Result<Vec<Gym>> {
        Ok(Vec::new())
    }
}
