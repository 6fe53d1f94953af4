use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use shared::{
    domain::{ConversationId, LocationSample, LocationSource, UserId},
    protocol::{topics, UserLocationPayload},
};
use sync_core::{
    load_settings, ChannelManager, ConversationSync, HttpDurableStore, LocationProvider,
    LocationScheduler, ReconnectPolicy, RequestCache, SchedulerConfig, SubscribeOptions,
    SubscriptionHub, WebSocketTransport,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides the configured base url.
    #[arg(long)]
    base_url: Option<String>,
    /// Identity to register on the channel.
    #[arg(long)]
    user: Option<String>,
    /// Conversations whose history is loaded on start.
    #[arg(long = "conversation")]
    conversations: Vec<String>,
    /// Publish a fixed position through the location scheduler.
    #[arg(long, requires = "lng")]
    lat: Option<f64>,
    #[arg(long, requires = "lat")]
    lng: Option<f64>,
}

struct FixedLocation {
    lat: f64,
    lng: f64,
}

#[async_trait]
impl LocationProvider for FixedLocation {
    async fn current_location(&self, _force_fresh: bool) -> Result<Option<LocationSample>> {
        Ok(Some(LocationSample {
            lat: self.lat,
            lng: self.lng,
            accuracy_m: 0.0,
            source: LocationSource::Manual,
            timestamp: Utc::now(),
        }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(base_url) = args.base_url {
        settings.base_url = base_url;
    }
    let channel_url = settings.channel_url()?;
    info!(base_url = %settings.base_url, channel_url = %channel_url, "probe: starting");

    let channel = ChannelManager::new(
        Arc::new(WebSocketTransport),
        channel_url,
        ReconnectPolicy::from_settings(&settings),
    );
    channel.set_identity(args.user.map(UserId::from));
    let store = Arc::new(HttpDurableStore::from_settings(&settings));
    let hub = SubscriptionHub::new(Arc::clone(&channel), &settings);

    let _logged: Vec<_> = topics::ALL
        .into_iter()
        .filter(|topic| *topic != topics::USER_LOCATION_UPDATE)
        .map(|topic| {
            hub.subscribe(
                topic,
                move |payload: serde_json::Value| {
                    info!(topic, %payload, "probe: delivery");
                    Ok(())
                },
                SubscribeOptions::default(),
            )
        })
        .collect();
    let _locations = hub.subscribe(
        topics::USER_LOCATION_UPDATE,
        |update: UserLocationPayload| {
            info!(
                user_id = %update.user_id,
                lat = update.lat,
                lng = update.lng,
                accuracy = ?update.accuracy,
                "probe: user moved"
            );
            Ok(())
        },
        SubscribeOptions::default(),
    );

    let conversations = ConversationSync::new(
        Arc::clone(&channel),
        store.clone(),
        RequestCache::new(settings.debounce()),
        &settings,
    );
    conversations.attach(&hub);

    let scheduler = match (args.lat, args.lng) {
        (Some(lat), Some(lng)) => Some(LocationScheduler::start(
            Arc::clone(&channel),
            store.clone(),
            Arc::new(FixedLocation { lat, lng }),
            SchedulerConfig::from_settings(&settings),
        )),
        _ => None,
    };

    channel.connect();

    for conversation in args.conversations {
        let conversation_id = ConversationId::from(conversation);
        match conversations.load_history(&conversation_id).await {
            Ok(messages) => info!(
                conversation_id = %conversation_id,
                count = messages.len(),
                "probe: history loaded"
            ),
            Err(err) => warn!(
                conversation_id = %conversation_id,
                error = %err,
                "probe: history failed"
            ),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("probe: shutting down");
    if let Some(scheduler) = scheduler {
        scheduler.stop();
    }
    conversations.detach();
    hub.shutdown();
    channel.teardown();
    Ok(())
}
