//! Subresource history store
//!
//! Shared by every tab's manager and read by the pre-connection workers.
//! Two locks guard it:
//!
//! - `structure` is held for the whole of every mutating call and
//!   serializes inserts, evictions and lifecycle bookkeeping.
//! - `entries` guards the map and the histories inside it and is only held
//!   for the short in-place update or read itself.
//!
//! Readers take `entries` alone and never wait on `structure`. They do
//! wait for an in-place update holding `entries`, such as the load-finished
//! recomputation. Lock order is always `structure` then `entries`.
//!
//! The store is reference counted through [`HistoryRegistry`]: the first
//! [`HistoryRegistry::acquire`] loads it from a [`HistoryStore`] and starts
//! the periodic writer, the last [`HistoryHandle`] release saves it and
//! tears it down.

use std::collections::HashMap;
use std::io;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::HistoryConfig;
use crate::store::HistoryStore;
use crate::subhost::Subhost;
use crate::url_history::{UrlHistory, UrlHistoryRecord};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Main host to subresource history mapping
#[derive(Debug)]
pub struct SubResourcesHistory {
    structure: Mutex<()>,
    entries: Mutex<HashMap<String, UrlHistory>>,
    dirty: AtomicBool,
    config: HistoryConfig,
}

impl Default for SubResourcesHistory {
    fn default() -> Self {
        Self::new(HistoryConfig::default())
    }
}

impl SubResourcesHistory {
    /// Empty history with the given limits
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            structure: Mutex::new(()),
            entries: Mutex::new(HashMap::with_capacity(config.max_main_hosts + 1)),
            dirty: AtomicBool::new(false),
            config,
        }
    }

    /// Record one resource of `main_host` fetched from `sub_host`
    pub fn add_sub_host(&self, main_host: &str, sub_host: &str) {
        let (main_host, sub_host) = (main_host.trim(), sub_host.trim());
        if main_host.is_empty() || sub_host.is_empty() {
            return;
        }

        let _structure = lock(&self.structure);
        self.dirty.store(true, Ordering::SeqCst);

        if let Some(history) = lock(&self.entries).get_mut(main_host) {
            history.add_subhost(sub_host);
            return;
        }

        let mut history = UrlHistory::with_limits(main_host, self.config.url_history);
        history.add_subhost(sub_host);
        self.insert(history);
    }

    /// Rehydrate one persisted subhost; leaves the store clean
    pub fn restore_sub_host(&self, main_host: &str, subhost: Subhost) {
        let main_host = main_host.trim();
        if main_host.is_empty() || subhost.host().is_empty() {
            return;
        }

        let _structure = lock(&self.structure);

        if let Some(history) = lock(&self.entries).get_mut(main_host) {
            history.restore_subhost(subhost);
            return;
        }

        let mut history = UrlHistory::with_limits(main_host, self.config.url_history);
        history.restore_subhost(subhost);
        self.insert(history);
    }

    /// Overwrite the use count of a known main host
    pub fn set_use_count(&self, main_host: &str, use_count: u32) {
        let _structure = lock(&self.structure);
        if let Some(history) = lock(&self.entries).get_mut(main_host.trim()) {
            history.set_use_count(use_count);
        }
    }

    /// Use count of `main_host`, 0 when unknown
    pub fn use_count(&self, main_host: &str) -> u32 {
        lock(&self.entries)
            .get(main_host)
            .map(UrlHistory::use_count)
            .unwrap_or(0)
    }

    /// Load of `main_host` finished
    pub fn on_load_finished(&self, main_host: &str) {
        let _structure = lock(&self.structure);
        let mut entries = lock(&self.entries);

        if let Some(history) = entries.get_mut(main_host) {
            history.increment_use_count();
            history.update_subhosts_references();
            history.update_subhosts_to_connect();
            self.dirty.store(true, Ordering::SeqCst);
        }
    }

    /// Load of `main_host` started
    pub fn update_url_history(&self, main_host: &str) {
        let _structure = lock(&self.structure);
        if let Some(history) = lock(&self.entries).get_mut(main_host) {
            history.reset_subhosts_weight();
        }
    }

    /// Recompute the candidates of every main host
    pub fn update_all_subhosts_to_connect(&self) {
        let _structure = lock(&self.structure);
        for history in lock(&self.entries).values_mut() {
            history.update_subhosts_to_connect();
        }
    }

    /// Ranked candidates of `main_host`, if any were computed
    pub fn get_subhosts_to_connect(&self, main_host: &str) -> Option<Vec<Subhost>> {
        lock(&self.entries)
            .get(main_host)?
            .subhosts_to_connect()
            .map(<[Subhost]>::to_vec)
    }

    /// All tracked subhosts of `main_host`, unordered
    pub fn get_subhosts(&self, main_host: &str) -> Option<Vec<Subhost>> {
        lock(&self.entries).get(main_host).map(UrlHistory::subhosts)
    }

    /// Tracked main hosts, unordered
    pub fn main_hosts(&self) -> Vec<String> {
        lock(&self.entries).keys().cloned().collect()
    }

    /// Check if `main_host` has a history
    pub fn contains(&self, main_host: &str) -> bool {
        lock(&self.entries).contains_key(main_host)
    }

    /// Number of tracked main hosts
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Check if no main host is tracked
    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Changed since the last successful save
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Persistable copy of the whole store, ordered by main host
    pub fn snapshot(&self) -> Vec<UrlHistoryRecord> {
        let mut records: Vec<UrlHistoryRecord> = lock(&self.entries)
            .values()
            .map(UrlHistory::to_record)
            .collect();
        records.sort_by(|a, b| a.main_host.cmp(&b.main_host));
        records
    }

    /// Rebuild from persisted records
    pub fn restore(&self, records: Vec<UrlHistoryRecord>) {
        for record in records {
            self.restore_main_host(&record.main_host);
            for subhost in record.subhosts {
                self.restore_sub_host(&record.main_host, subhost);
            }
            self.set_use_count(&record.main_host, record.use_count);
        }
        self.update_all_subhosts_to_connect();
    }

    /// Save to `store`; the dirty flag is cleared on success
    pub fn save(&self, store: &dyn HistoryStore) -> bool {
        let records = {
            let _structure = lock(&self.structure);
            self.dirty.store(false, Ordering::SeqCst);
            self.snapshot()
        };

        match store.save_all(&records) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to save subresource history: {}", e);
                self.dirty.store(true, Ordering::SeqCst);
                false
            }
        }
    }

    /// Save only if something changed since the last save
    pub fn flush_if_dirty(&self, store: &dyn HistoryStore) -> bool {
        if !self.is_dirty() {
            return false;
        }
        self.save(store)
    }

    /// Rehydrate a persisted main host, even one without subhosts
    fn restore_main_host(&self, main_host: &str) {
        let main_host = main_host.trim();
        if main_host.is_empty() {
            return;
        }

        let _structure = lock(&self.structure);
        if lock(&self.entries).contains_key(main_host) {
            return;
        }
        self.insert(UrlHistory::with_limits(main_host, self.config.url_history));
    }

    /// Caller holds `structure`
    fn insert(&self, history: UrlHistory) {
        if self.config.max_main_hosts == 0 {
            return;
        }

        self.make_room();
        lock(&self.entries).insert(history.main_host().to_string(), history);
    }

    /// Caller holds `structure`, so the ranking stays valid after the
    /// entries lock is dropped
    fn make_room(&self) {
        let mut ranked: Vec<(String, u32)> = {
            let entries = lock(&self.entries);
            if entries.len() < self.config.max_main_hosts {
                return;
            }
            entries
                .values()
                .map(|h| (h.main_host().to_string(), h.use_count()))
                .collect()
        };

        // Most used first, the tail is evicted
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let batch = self.config.main_host_evict_batch.max(1).min(ranked.len());
        let victims = ranked.split_off(ranked.len() - batch);

        tracing::debug!("Evicting {} main hosts from subresource history", victims.len());

        let mut entries = lock(&self.entries);
        for (main_host, _) in victims {
            entries.remove(&main_host);
        }
    }
}

/// Owner of the shared history, created on first acquire and torn down on
/// last release
pub struct HistoryRegistry {
    store: Arc<dyn HistoryStore>,
    config: HistoryConfig,
    shared: Mutex<Option<SharedHistory>>,
}

struct SharedHistory {
    history: Arc<SubResourcesHistory>,
    owners: usize,
    writer: Option<PeriodicWriter>,
}

impl std::fmt::Debug for HistoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryRegistry")
            .field("config", &self.config)
            .field("owners", &self.owners())
            .finish()
    }
}

impl HistoryRegistry {
    pub fn new(store: Arc<dyn HistoryStore>, config: HistoryConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            shared: Mutex::new(None),
        })
    }

    /// Get the shared history, loading it on first use
    pub fn acquire(self: &Arc<Self>) -> HistoryHandle {
        let mut shared = lock(&self.shared);

        let state = shared.get_or_insert_with(|| {
            let history = Arc::new(SubResourcesHistory::new(self.config));

            match self.store.load_all() {
                Ok(records) => {
                    tracing::debug!("Loaded {} subresource histories", records.len());
                    history.restore(records);
                }
                Err(e) => tracing::warn!("Failed to load subresource history: {}", e),
            }

            let writer = match PeriodicWriter::start(
                Arc::downgrade(&history),
                Arc::clone(&self.store),
                self.config.persist_interval,
            ) {
                Ok(writer) => Some(writer),
                Err(e) => {
                    tracing::warn!("Failed to start periodic writer: {}", e);
                    None
                }
            };

            SharedHistory {
                history,
                owners: 0,
                writer,
            }
        });

        state.owners += 1;

        HistoryHandle {
            history: Arc::clone(&state.history),
            registry: Arc::clone(self),
            released: false,
        }
    }

    /// Number of live handles
    pub fn owners(&self) -> usize {
        lock(&self.shared).as_ref().map(|s| s.owners).unwrap_or(0)
    }

    pub fn is_live(&self) -> bool {
        lock(&self.shared).is_some()
    }

    fn release(&self) {
        let mut shared = lock(&self.shared);

        let Some(state) = shared.as_mut() else {
            return;
        };

        state.owners = state.owners.saturating_sub(1);
        if state.owners > 0 {
            return;
        }

        if let Some(mut state) = shared.take() {
            if let Some(writer) = state.writer.as_mut() {
                writer.stop();
            }
            state.history.save(&*self.store);
            tracing::debug!("Subresource history released");
        }
    }
}

/// One owner's reference to the shared history
///
/// Dropping the handle releases it; [`HistoryHandle::release`] does the
/// same explicitly.
#[derive(Debug)]
pub struct HistoryHandle {
    history: Arc<SubResourcesHistory>,
    registry: Arc<HistoryRegistry>,
    released: bool,
}

impl HistoryHandle {
    pub fn history(&self) -> &Arc<SubResourcesHistory> {
        &self.history
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.registry.release();
        }
    }
}

impl Deref for HistoryHandle {
    type Target = SubResourcesHistory;

    fn deref(&self) -> &Self::Target {
        &self.history
    }
}

impl Drop for HistoryHandle {
    fn drop(&mut self) {
        self.release_once();
    }
}

struct WriterSignal {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

/// Background thread flushing dirty history on an interval
struct PeriodicWriter {
    signal: Arc<WriterSignal>,
    thread: Option<JoinHandle<()>>,
}

impl PeriodicWriter {
    fn start(
        history: Weak<SubResourcesHistory>,
        store: Arc<dyn HistoryStore>,
        interval: Duration,
    ) -> io::Result<Self> {
        let signal = Arc::new(WriterSignal {
            stopped: Mutex::new(false),
            condvar: Condvar::new(),
        });
        let thread_signal = Arc::clone(&signal);

        let thread = thread::Builder::new()
            .name("fos-periodic-writer".to_string())
            .spawn(move || {
                while thread_signal.sleep(interval) {
                    let Some(history) = history.upgrade() else {
                        break;
                    };
                    tracing::trace!("Periodic writer woke up");
                    history.flush_if_dirty(&*store);
                }
                tracing::trace!("Periodic writer exiting");
            })?;

        Ok(Self {
            signal,
            thread: Some(thread),
        })
    }

    fn stop(&mut self) {
        *lock(&self.signal.stopped) = true;
        self.signal.condvar.notify_all();

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PeriodicWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

impl WriterSignal {
    /// Wait out `interval`; false once stop was requested
    fn sleep(&self, interval: Duration) -> bool {
        let deadline = Instant::now() + interval;
        let mut stopped = lock(&self.stopped);

        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            stopped = self
                .condvar
                .wait_timeout(stopped, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        false
    }
}
