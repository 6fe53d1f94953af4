//! Memoization, throttling, coalescing and retry around keyed async calls.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{config::SyncSettings, lock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    pub cache_time: Duration,
    pub min_interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub bypass_cache: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            cache_time: Duration::from_secs(5 * 60),
            min_interval: Duration::from_millis(1_000),
            max_retries: 3,
            retry_delay: Duration::from_millis(1_000),
            bypass_cache: false,
        }
    }
}

impl CallOptions {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            cache_time: Duration::from_millis(settings.cache_ttl_ms),
            min_interval: Duration::from_millis(settings.min_interval_ms),
            max_retries: settings.max_retries,
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
            bypass_cache: false,
        }
    }

    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn bypassing_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }
}

/// Cloneable so one shared call can hand the same failure to every waiter.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("call for '{key}' failed after {attempts} attempt(s): {last_error}")]
    Exhausted {
        key: String,
        attempts: u32,
        last_error: Arc<anyhow::Error>,
    },
    #[error("call for '{key}' ended before producing a result")]
    Aborted { key: String },
}

type SharedCall<V> = Shared<BoxFuture<'static, Result<V, CacheError>>>;
type ErasedFetch<V> = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<V>> + Send + Sync>;

struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
}

struct DebouncedCall<V> {
    latest: ErasedFetch<V>,
    call: SharedCall<V>,
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    in_flight: HashMap<String, SharedCall<V>>,
    last_call: HashMap<String, Instant>,
    debounced: HashMap<String, DebouncedCall<V>>,
}

enum Step<V> {
    Ready(V),
    Join(SharedCall<V>),
    Wait(Duration),
}

pub struct RequestCache<V> {
    inner: Arc<Mutex<CacheState<V>>>,
    debounce: Duration,
}

impl<V> Clone for RequestCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            debounce: self.debounce,
        }
    }
}

impl<V> RequestCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(debounce: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                in_flight: HashMap::new(),
                last_call: HashMap::new(),
                debounced: HashMap::new(),
            })),
            debounce,
        }
    }

    pub async fn call<F, Fut>(
        &self,
        key: &str,
        fetch: F,
        options: CallOptions,
    ) -> Result<V, CacheError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let fetch = Arc::new(fetch);
        loop {
            let step = {
                let mut state = lock(&self.inner);
                self.next_step(&mut state, key, &fetch, options)
            };
            match step {
                Step::Ready(value) => return Ok(value),
                Step::Join(call) => return call.await,
                Step::Wait(remaining) => {
                    debug!(
                        key,
                        wait_ms = remaining.as_millis() as u64,
                        "cache: throttled, waiting"
                    );
                    tokio::time::sleep(remaining).await;
                }
            }
        }
    }

    fn next_step<F, Fut>(
        &self,
        state: &mut CacheState<V>,
        key: &str,
        fetch: &Arc<F>,
        options: CallOptions,
    ) -> Step<V>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let now = Instant::now();
        if !options.bypass_cache {
            if let Some(entry) = state.entries.get(key) {
                if now.duration_since(entry.stored_at) < options.cache_time {
                    debug!(key, "cache: hit");
                    return Step::Ready(entry.value.clone());
                }
            }
        }

        let throttled_for = state
            .last_call
            .get(key)
            .map(|last| now.duration_since(*last))
            .filter(|elapsed| *elapsed < options.min_interval)
            .map(|elapsed| options.min_interval - elapsed);
        if let Some(remaining) = throttled_for {
            if let Some(entry) = state.entries.get(key) {
                debug!(key, "cache: within min interval, serving cached value");
                return Step::Ready(entry.value.clone());
            }
            return match state.in_flight.get(key) {
                Some(call) => Step::Join(call.clone()),
                None => Step::Wait(remaining),
            };
        }

        if let Some(call) = state.in_flight.get(key) {
            debug!(key, "cache: joining in-flight call");
            return Step::Join(call.clone());
        }

        Step::Join(self.start(state, key, Arc::clone(fetch), options))
    }

    fn start<F, Fut>(
        &self,
        state: &mut CacheState<V>,
        key: &str,
        fetch: Arc<F>,
        options: CallOptions,
    ) -> SharedCall<V>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        debug!(key, "cache: miss, invoking");
        state.last_call.insert(key.to_string(), Instant::now());

        // Spawned so the call completes and fills the cache even if every
        // caller stops awaiting.
        let task = tokio::spawn(run_with_retries(
            Arc::clone(&self.inner),
            key.to_string(),
            fetch,
            options,
        ));
        let owned_key = key.to_string();
        let call = async move {
            task.await
                .unwrap_or_else(|_| Err(CacheError::Aborted { key: owned_key }))
        }
        .boxed()
        .shared();
        state.in_flight.insert(key.to_string(), call.clone());
        call
    }

    /// Groups calls for `key` arriving within the debounce window into one;
    /// the most recently supplied `fetch` is the one that runs.
    pub async fn call_debounced<F, Fut>(
        &self,
        key: &str,
        fetch: F,
        options: CallOptions,
    ) -> Result<V, CacheError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let latest: ErasedFetch<V> = Arc::new(move || fetch().boxed());
        let call = {
            let mut state = lock(&self.inner);
            if let Some(pending) = state.debounced.get_mut(key) {
                pending.latest = latest;
                pending.call.clone()
            } else {
                let cache = self.clone();
                let owned_key = key.to_string();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(cache.debounce).await;
                    let latest = lock(&cache.inner)
                        .debounced
                        .remove(&owned_key)
                        .map(|pending| pending.latest);
                    match latest {
                        Some(latest) => cache.call(&owned_key, move || latest(), options).await,
                        None => Err(CacheError::Aborted { key: owned_key }),
                    }
                });
                let aborted_key = key.to_string();
                let call = async move {
                    task.await
                        .unwrap_or_else(|_| Err(CacheError::Aborted { key: aborted_key }))
                }
                .boxed()
                .shared();
                state.debounced.insert(
                    key.to_string(),
                    DebouncedCall {
                        latest,
                        call: call.clone(),
                    },
                );
                call
            }
        };
        call.await
    }

    /// Cached value of any age, without calling anything.
    pub fn peek(&self, key: &str) -> Option<V> {
        lock(&self.inner)
            .entries
            .get(key)
            .map(|entry| entry.value.clone())
    }

    /// Invalidates one key, or everything when `key` is `None`.
    pub fn clear_cache(&self, key: Option<&str>) {
        let mut state = lock(&self.inner);
        match key {
            Some(key) => {
                state.entries.remove(key);
                state.last_call.remove(key);
            }
            None => {
                state.entries.clear();
                state.last_call.clear();
            }
        }
    }
}

async fn run_with_retries<V, F, Fut>(
    inner: Arc<Mutex<CacheState<V>>>,
    key: String,
    fetch: Arc<F>,
    options: CallOptions,
) -> Result<V, CacheError>
where
    V: Clone + Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
{
    let mut attempt: u32 = 0;
    loop {
        match (*fetch)().await {
            Ok(value) => {
                let mut state = lock(&inner);
                state.entries.insert(
                    key.clone(),
                    CacheEntry {
                        value: value.clone(),
                        stored_at: Instant::now(),
                    },
                );
                state.in_flight.remove(&key);
                return Ok(value);
            }
            Err(err) if attempt < options.max_retries => {
                attempt += 1;
                let delay = options.retry_delay * attempt;
                warn!(
                    key = %key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "cache: call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                let mut state = lock(&inner);
                state.in_flight.remove(&key);
                if let Some(entry) = state.entries.get(&key) {
                    warn!(
                        key = %key,
                        error = %err,
                        "cache: retries exhausted, serving stale value"
                    );
                    return Ok(entry.value.clone());
                }
                return Err(CacheError::Exhausted {
                    key,
                    attempts: attempt + 1,
                    last_error: Arc::new(err),
                });
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/request_cache_tests.rs"]
mod tests;
