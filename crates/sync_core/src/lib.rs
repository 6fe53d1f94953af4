use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod activity;
pub mod channel;
pub mod config;
pub mod conversations;
pub mod durable_store;
pub mod error;
pub mod location_scheduler;
pub mod reconciliation;
pub mod request_cache;
pub mod subscriptions;
pub mod transport;

pub use activity::{ActivityLevel, ActivitySignals, ActivityTracker};
pub use channel::{ChannelManager, ChannelState, ReconnectPolicy};
pub use config::{load_settings, SyncSettings};
pub use conversations::{ConversationSync, OutgoingMessage, TimelineUpdate};
pub use durable_store::{DurableStore, HttpDurableStore};
pub use error::SyncError;
pub use location_scheduler::{LocationProvider, LocationScheduler, SchedulerConfig};
pub use reconciliation::{ConversationTimeline, DayGroup, DeliveryOutcome};
pub use request_cache::{CacheError, CallOptions, RequestCache};
pub use subscriptions::{SubscribeOptions, Subscription, SubscriptionHub};
pub use transport::{Transport, TransportLink, WebSocketTransport};

/// Short critical sections never span an await, so a poisoned lock still
/// holds consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
