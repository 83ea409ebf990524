//! Thread-safe, count/cost/age-bounded LRU cache.
//!
//! Wraps [`crate::lru::IntrusiveLru`] behind a mutex, enforces the three
//! independent limits, and defers destruction of evicted values to a
//! background release queue so that eviction never blocks a reader.

use crate::lru::{Evicted, IntrusiveLru};
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// How an evicted batch's values get dropped.
///
/// [`ReleasePolicy::Background`] dominates whenever `release_asynchronously`
/// is set — this is the common case and keeps eviction off whatever thread
/// triggered it. `MainThread` is only reachable when async release is
/// disabled and the caller opted into `release_on_main_thread`; since a
/// generic Rust target has no UIKit-style main dispatch queue to route to,
/// it resolves to an inline drop, same as `Inline`, but is kept as a
/// distinct variant so the distinction is visible in logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReleasePolicy {
    Background,
    MainThread,
    Inline,
}

fn resolve_release_policy(release_asynchronously: bool, release_on_main_thread: bool) -> ReleasePolicy {
    if release_asynchronously {
        ReleasePolicy::Background
    } else if release_on_main_thread {
        ReleasePolicy::MainThread
    } else {
        ReleasePolicy::Inline
    }
}

/// Configuration for a [`MemoryCache`]. All fields have effects; see the
/// field docs for defaults.
pub struct MemoryCacheConfig {
    /// Diagnostics/debug-description identifier only.
    pub name: String,
    /// Maximum number of entries; excess is evicted from the tail. `None` is unbounded.
    pub count_limit: Option<usize>,
    /// Maximum sum of costs; excess is evicted from the tail. `None` is unbounded.
    pub cost_limit: Option<u64>,
    /// Maximum age of an entry before the timer-driven trim evicts it. `None` is unbounded.
    pub age_limit: Option<Duration>,
    /// Period of the background trim task.
    pub auto_trim_interval: Duration,
    /// If true, destructors run on the host's main dispatch context.
    pub release_on_main_thread: bool,
    /// If true, destructors run off the caller's thread.
    pub release_asynchronously: bool,
    /// Clears the cache on a host low-memory signal.
    pub remove_all_on_memory_pressure: bool,
    /// Clears the cache on a host background transition.
    pub remove_all_on_background: bool,
    /// Invoked first in [`MemoryCache::notify_memory_pressure`], before any clear.
    pub on_memory_pressure: Option<Box<dyn Fn() + Send + Sync>>,
    /// Invoked first in [`MemoryCache::notify_did_enter_background`], before any clear.
    pub on_enter_background: Option<Box<dyn Fn() + Send + Sync>>,
}

impl std::fmt::Debug for MemoryCacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCacheConfig")
            .field("name", &self.name)
            .field("count_limit", &self.count_limit)
            .field("cost_limit", &self.cost_limit)
            .field("age_limit", &self.age_limit)
            .field("auto_trim_interval", &self.auto_trim_interval)
            .field("release_on_main_thread", &self.release_on_main_thread)
            .field("release_asynchronously", &self.release_asynchronously)
            .field("remove_all_on_memory_pressure", &self.remove_all_on_memory_pressure)
            .field("remove_all_on_background", &self.remove_all_on_background)
            .field("on_memory_pressure", &self.on_memory_pressure.is_some())
            .field("on_enter_background", &self.on_enter_background.is_some())
            .finish()
    }
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            name: "MemoryCache".to_string(),
            count_limit: None,
            cost_limit: None,
            age_limit: None,
            auto_trim_interval: Duration::from_secs(5),
            release_on_main_thread: false,
            release_asynchronously: true,
            remove_all_on_memory_pressure: true,
            remove_all_on_background: true,
            on_memory_pressure: None,
            on_enter_background: None,
        }
    }
}

#[derive(Clone, Copy)]
enum Limit {
    Count(usize),
    Cost(u64),
    Age(Duration),
}

struct Inner<K, V> {
    config: MemoryCacheConfig,
    lru: Mutex<IntrusiveLru<K, V>>,
    release_tx: Sender<Vec<Evicted<K, V>>>,
}

/// A thread-safe, in-process LRU cache with count, cost, and age limits.
///
/// `K` must be cheap to clone (it is stored both as the map key and inside
/// each node); `V` must be `Clone` because `get` hands back an owned copy —
/// references can't outlive the internal mutex guard.
pub struct MemoryCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for MemoryCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> MemoryCache<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::with_config(MemoryCacheConfig::default())
    }

    pub fn with_config(config: MemoryCacheConfig) -> Self {
        let (release_tx, release_rx) = mpsc::channel::<Vec<Evicted<K, V>>>();
        // Dedicated release-queue thread. Exits once the channel's last
        // sender (held by `Inner`) is dropped, i.e. when the cache is torn down.
        std::thread::Builder::new()
            .name(format!("{}-release", config.name))
            .spawn(move || {
                while let Ok(batch) = release_rx.recv() {
                    drop(batch);
                }
            })
            .expect("failed to spawn release queue thread");

        let auto_trim_interval = config.auto_trim_interval;
        let inner = Arc::new(Inner {
            config,
            lru: Mutex::new(IntrusiveLru::new()),
            release_tx,
        });

        if !auto_trim_interval.is_zero() {
            let weak: Weak<Inner<K, V>> = Arc::downgrade(&inner);
            std::thread::spawn(move || Self::auto_trim_loop(weak, auto_trim_interval));
        }

        Self { inner }
    }

    /// Self-re-arming background timer. Captures only a weak reference so it
    /// exits as soon as the cache is dropped rather than keeping it alive.
    fn auto_trim_loop(weak: Weak<Inner<K, V>>, interval: Duration) {
        loop {
            std::thread::sleep(interval);
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let cache = MemoryCache { inner };
            cache.trim_to_cost_if_limited();
            cache.trim_to_count_if_limited();
            cache.trim_to_age_if_limited();
        }
    }

    fn release(&self, batch: Vec<Evicted<K, V>>) {
        if batch.is_empty() {
            return;
        }
        match resolve_release_policy(
            self.inner.config.release_asynchronously,
            self.inner.config.release_on_main_thread,
        ) {
            ReleasePolicy::Background => {
                // Best-effort: if the release thread is gone (cache being torn
                // down concurrently) just drop the batch inline.
                if self.inner.release_tx.send(batch).is_err() {
                    tracing::debug!(cache = %self.inner.config.name, "release queue gone, dropping inline");
                }
            }
            ReleasePolicy::MainThread | ReleasePolicy::Inline => {
                drop(batch);
            }
        }
    }

    /// Read-locked map probe.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lru.lock().contains(key)
    }

    /// Read-locked look-up. On hit, updates the entry's time and brings it to the head.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut guard = self.inner.lru.lock();
        let value = guard.peek(key).cloned();
        if value.is_some() {
            guard.bring_to_head(key);
        }
        value
    }

    /// Inserts, updates, or (if `value` is `None`) removes `key`.
    pub fn set(&self, key: K, value: Option<V>, cost: u64) {
        let Some(value) = value else {
            self.remove(&key);
            return;
        };

        let now = Instant::now();
        {
            let mut guard = self.inner.lru.lock();
            if guard.contains(&key) {
                guard.update(&key, value, cost, now);
                guard.bring_to_head(&key);
            } else {
                guard.insert_at_head(key.clone(), value, cost, now);
            }
        }

        if let Some(cost_limit) = self.inner.config.cost_limit {
            let over = { self.inner.lru.lock().total_cost() > cost_limit };
            if over {
                let this = self.clone();
                std::thread::spawn(move || this.trim_to_cost(cost_limit));
            }
        }

        if let Some(count_limit) = self.inner.config.count_limit {
            let mut guard = self.inner.lru.lock();
            if guard.total_count() > count_limit {
                let evicted = guard.remove_tail();
                drop(guard);
                if let Some(e) = evicted {
                    self.release(vec![e]);
                }
            }
        }
    }

    /// Write-locked removal; the evicted node is handed to the release queue.
    pub fn remove(&self, key: &K) {
        let evicted = self.inner.lru.lock().remove(key);
        if let Some(e) = evicted {
            self.release(vec![e]);
        }
    }

    /// Write-locked clear of the whole cache.
    pub fn remove_all(&self) {
        let drained = self.inner.lru.lock().remove_all();
        self.release(drained);
    }

    pub fn total_count(&self) -> usize {
        self.inner.lru.lock().total_count()
    }

    pub fn total_cost(&self) -> u64 {
        self.inner.lru.lock().total_cost()
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Signals a host low-memory event. Runs the configured
    /// `on_memory_pressure` hook, if any, then clears the cache if
    /// `remove_all_on_memory_pressure` is set.
    pub fn notify_memory_pressure(&self) {
        if let Some(hook) = &self.inner.config.on_memory_pressure {
            hook();
        }
        if self.inner.config.remove_all_on_memory_pressure {
            self.remove_all();
        }
    }

    /// Signals a host background-transition event. Runs the configured
    /// `on_enter_background` hook, if any, then clears the cache if
    /// `remove_all_on_background` is set.
    pub fn notify_did_enter_background(&self) {
        if let Some(hook) = &self.inner.config.on_enter_background {
            hook();
        }
        if self.inner.config.remove_all_on_background {
            self.remove_all();
        }
    }

    pub fn trim_to_count(&self, n: usize) {
        self.trim(Limit::Count(n));
    }

    pub fn trim_to_cost(&self, c: u64) {
        self.trim(Limit::Cost(c));
    }

    pub fn trim_to_age(&self, age: Duration) {
        self.trim(Limit::Age(age));
    }

    fn trim_to_cost_if_limited(&self) {
        if let Some(c) = self.inner.config.cost_limit {
            self.trim_to_cost(c);
        }
    }

    fn trim_to_count_if_limited(&self) {
        if let Some(n) = self.inner.config.count_limit {
            self.trim_to_count(n);
        }
    }

    fn trim_to_age_if_limited(&self) {
        if let Some(age) = self.inner.config.age_limit {
            self.trim_to_age(age);
        }
    }

    fn within_limit(guard: &IntrusiveLru<K, V>, limit: Limit) -> bool {
        match limit {
            Limit::Count(n) => guard.total_count() <= n,
            Limit::Cost(c) => guard.total_cost() <= c,
            // An empty tail means nothing left to trim — not "keep trimming".
            Limit::Age(age) => match guard.tail_time() {
                None => true,
                Some(t) => t.elapsed() <= age,
            },
        }
    }

    /// Deliberately does not hold the mutex across the whole eviction loop:
    /// destroying many values under the lock would stall readers. Instead it
    /// repeatedly try-locks, evicts one tail node per successful acquisition,
    /// and releases — sleeping briefly between failed attempts.
    fn trim(&self, limit: Limit) {
        if let Limit::Count(0) | Limit::Cost(0) = limit {
            self.remove_all();
            return;
        }

        {
            let guard = self.inner.lru.lock();
            if Self::within_limit(&guard, limit) {
                return;
            }
        }

        let mut holder = Vec::new();
        loop {
            match self.inner.lru.try_lock() {
                Some(mut guard) => {
                    if Self::within_limit(&guard, limit) {
                        break;
                    }
                    match guard.remove_tail() {
                        Some(evicted) => holder.push(evicted),
                        None => break,
                    }
                }
                None => {
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }
        self.release(holder);
    }
}

impl<K, V> Default for MemoryCache<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
