//! Activity-driven location publishing.
//!
//! A cadence task asks the [`LocationProvider`] for a sample at an interval
//! picked from the current [`ActivityLevel`]; an idle-check task demotes the
//! level when input stops. Every accepted sample goes to the channel (when
//! connected) and to the durable store. [`LocationScheduler::push_location`] is
//! the one entry point for all call sites and enforces a minimum gap between
//! sends.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{Bounds, LocationSample},
    protocol::{ClientEvent, MapSubscription},
};
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    activity::{ActivityLevel, ActivityTracker, IDLE_DEMOTION_AFTER},
    channel::ChannelManager,
    config::SyncSettings,
    durable_store::DurableStore,
    lock,
};

#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Latest known position. `force_fresh` asks for a new reading rather than
    /// a cached fix. `None` means no position is available right now.
    async fn current_location(&self, force_fresh: bool) -> Result<Option<LocationSample>>;
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub excluded_pages: HashSet<String>,
    pub low_priority_pages: HashSet<String>,
    pub min_send_gap: Duration,
    pub low_priority_send_gap: Duration,
    pub idle_check_every: Duration,
    pub idle_after: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_settings(&SyncSettings::default())
    }
}

impl SchedulerConfig {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            excluded_pages: settings.excluded_pages.iter().cloned().collect(),
            low_priority_pages: settings.low_priority_pages.iter().cloned().collect(),
            min_send_gap: Duration::from_secs(2 * 60),
            low_priority_send_gap: Duration::from_secs(5 * 60),
            idle_check_every: Duration::from_secs(60),
            idle_after: IDLE_DEMOTION_AFTER,
        }
    }
}

/// Hard floor on how often a sample may leave the device.
#[derive(Debug, Clone)]
pub struct SendGuard {
    min_gap: Duration,
    low_priority_gap: Duration,
    last_sent: Option<Instant>,
}

impl SendGuard {
    pub fn new(min_gap: Duration, low_priority_gap: Duration) -> Self {
        Self {
            min_gap,
            low_priority_gap,
            last_sent: None,
        }
    }

    /// Records `now` as the last send and returns `true` when the gap allows it.
    pub fn try_accept(&mut self, low_priority: bool, now: Instant) -> bool {
        let gap = if low_priority {
            self.low_priority_gap
        } else {
            self.min_gap
        };
        if let Some(last) = self.last_sent {
            if now.saturating_duration_since(last) < gap {
                return false;
            }
        }
        self.last_sent = Some(now);
        true
    }

    pub fn last_sent(&self) -> Option<Instant> {
        self.last_sent
    }
}

pub struct LocationScheduler {
    shared: Arc<SchedulerShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct SchedulerShared {
    channel: Arc<ChannelManager>,
    store: Arc<dyn DurableStore>,
    provider: Arc<dyn LocationProvider>,
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    level_tx: watch::Sender<ActivityLevel>,
}

struct SchedulerState {
    tracker: ActivityTracker,
    guard: SendGuard,
    current_page: Option<String>,
    ticks_since_activation: u64,
    last_sample: Option<LocationSample>,
}

impl LocationScheduler {
    /// Starts the cadence and idle-check timers.
    pub fn start(
        channel: Arc<ChannelManager>,
        store: Arc<dyn DurableStore>,
        provider: Arc<dyn LocationProvider>,
        config: SchedulerConfig,
    ) -> Self {
        let now = Instant::now();
        let tracker = ActivityTracker::new(now).with_idle_after(config.idle_after);
        let level = tracker.level(now);
        let (level_tx, _) = watch::channel(level);
        let shared = Arc::new(SchedulerShared {
            channel,
            store,
            provider,
            state: Mutex::new(SchedulerState {
                tracker,
                guard: SendGuard::new(config.min_send_gap, config.low_priority_send_gap),
                current_page: None,
                ticks_since_activation: 0,
                last_sample: None,
            }),
            config,
            level_tx,
        });

        let cadence = tokio::spawn(Arc::clone(&shared).run_cadence());
        let idle_check = tokio::spawn(Arc::clone(&shared).run_idle_check());
        info!(?level, "location: scheduler started");

        Self {
            shared,
            tasks: Mutex::new(vec![cadence, idle_check]),
        }
    }

    pub fn level(&self) -> ActivityLevel {
        *self.shared.level_tx.borrow()
    }

    pub fn subscribe_level(&self) -> watch::Receiver<ActivityLevel> {
        self.shared.level_tx.subscribe()
    }

    pub fn set_foreground(&self, foreground: bool) {
        let now = Instant::now();
        lock(&self.shared.state).tracker.set_foreground(foreground, now);
        self.shared.refresh_level(now);
    }

    /// Pointer, touch or keyboard activity.
    pub fn record_input(&self) {
        let now = Instant::now();
        lock(&self.shared.state).tracker.record_input(now);
        self.shared.refresh_level(now);
    }

    pub fn set_map_engaged(&self, engaged: bool) {
        lock(&self.shared.state).tracker.set_map_engaged(engaged);
        self.shared.refresh_level(Instant::now());
    }

    /// Called by the map view when it shows `bounds`: holds the level at
    /// `Active` and asks the service for map updates in that viewport.
    /// Returns whether the subscription went out.
    pub fn watch_map(&self, bounds: Bounds, zoom: u8) -> bool {
        self.set_map_engaged(true);
        self.shared
            .channel
            .send(&ClientEvent::SubscribeToMapUpdates(MapSubscription {
                bounds,
                zoom,
                timestamp: Utc::now(),
            }))
    }

    pub fn set_current_page(&self, page: impl Into<String>) {
        let page = page.into();
        debug!(page = %page, "location: page changed");
        lock(&self.shared.state).current_page = Some(page);
    }

    pub fn last_sample(&self) -> Option<LocationSample> {
        lock(&self.shared.state).last_sample.clone()
    }

    /// Sends `sample` unless the minimum gap since the last accepted send has
    /// not elapsed. Returns whether it was accepted.
    pub async fn push_location(&self, sample: LocationSample) -> bool {
        self.shared.push(sample).await
    }

    pub fn stop(&self) {
        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            task.abort();
        }
        info!("location: scheduler stopped");
    }
}

impl Drop for LocationScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl SchedulerShared {
    async fn run_cadence(self: Arc<Self>) {
        let mut level_rx = self.level_tx.subscribe();
        loop {
            let level = *level_rx.borrow_and_update();
            tokio::select! {
                _ = tokio::time::sleep(level.cadence()) => self.tick(level).await,
                changed = level_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn run_idle_check(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.config.idle_check_every).await;
            self.refresh_level(Instant::now());
        }
    }

    fn refresh_level(&self, now: Instant) {
        let mut state = lock(&self.state);
        let next = state.tracker.level(now);
        let previous = *self.level_tx.borrow();
        if next == previous {
            return;
        }
        if next > previous {
            state.ticks_since_activation = 0;
        }
        drop(state);
        info!(from = ?previous, to = ?next, "location: activity level changed");
        self.level_tx.send_replace(next);
    }

    async fn tick(&self, level: ActivityLevel) {
        let force_fresh = {
            let mut state = lock(&self.state);
            if let Some(page) = state
                .current_page
                .as_ref()
                .filter(|page| self.config.excluded_pages.contains(*page))
            {
                debug!(page = %page, "location: tick skipped on excluded page");
                return;
            }
            state.ticks_since_activation += 1;
            let tick = state.ticks_since_activation;
            tick == 1 || tick % level.fresh_read_every() == 0
        };

        match self.provider.current_location(force_fresh).await {
            Ok(Some(sample)) => {
                self.push(sample).await;
            }
            Ok(None) => debug!("location: no position available"),
            Err(err) => warn!(error = %err, force_fresh, "location: read failed"),
        }
    }

    async fn push(&self, sample: LocationSample) -> bool {
        {
            let mut state = lock(&self.state);
            let low_priority = state
                .current_page
                .as_ref()
                .is_some_and(|page| self.config.low_priority_pages.contains(page));
            if !state.guard.try_accept(low_priority, Instant::now()) {
                debug!(low_priority, "location: send suppressed by minimum gap");
                return false;
            }
            state.last_sample = Some(sample.clone());
        }

        if self.channel.is_connected() {
            self.channel
                .send(&ClientEvent::LocationUpdate((&sample).into()));
        }
        if let Err(err) = self.store.sync_location(&sample).await {
            warn!(error = %err, "location: durable sync failed");
        }
        true
    }
}

#[cfg(test)]
#[path = "tests/location_scheduler_tests.rs"]
mod tests;
