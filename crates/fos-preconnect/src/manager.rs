//! Per-tab pre-connection manager
//!
//! Receives the tab's page load events, records which hosts each page
//! fetches from and starts a worker when a known page starts loading.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use url::Url;

use crate::PreconnectError;
use crate::config::PreconnectConfig;
use crate::connection_pool::RecycleConnection;
use crate::history::{HistoryHandle, HistoryRegistry};
use crate::slots::{WorkerSlots, WorkerTicket};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Normalize a URL or bare host to a history key
///
/// The key is the lower-cased host, followed by `:port` when the port is
/// not the scheme's default. Bare hosts are read as `http`.
pub fn host_key(input: &str) -> Result<String, PreconnectError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(PreconnectError::InvalidHost(input.to_string()));
    }

    let parsed = if input.contains("://") {
        Url::parse(input)
    } else {
        Url::parse(&format!("http://{}", input))
    };
    let url = parsed.map_err(|_| PreconnectError::InvalidHost(input.to_string()))?;

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| PreconnectError::InvalidHost(input.to_string()))?;

    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Pre-connection manager of one tab
pub struct PreconnectManager {
    config: PreconnectConfig,
    history: Option<HistoryHandle>,
    workers: Arc<WorkerSlots>,
    pool: Arc<dyn RecycleConnection>,
    current_url: Option<String>,
    main_host: Option<String>,
    active: Arc<Mutex<Option<WorkerTicket>>>,
    proxy_configured: bool,
}

impl std::fmt::Debug for PreconnectManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreconnectManager")
            .field("enabled", &self.is_enabled())
            .field("current_url", &self.current_url)
            .field("main_host", &self.main_host)
            .field("active", &self.active_worker())
            .field("proxy_configured", &self.proxy_configured)
            .finish()
    }
}

impl PreconnectManager {
    /// Create a manager; acquires the shared history only when enabled
    pub fn new(
        registry: &Arc<HistoryRegistry>,
        workers: Arc<WorkerSlots>,
        pool: Arc<dyn RecycleConnection>,
        config: PreconnectConfig,
    ) -> Self {
        let history = config.enabled.then(|| registry.acquire());
        if !config.enabled {
            tracing::info!("TCP pre-connection disabled");
        }

        Self {
            config,
            history,
            workers,
            pool,
            current_url: None,
            main_host: None,
            active: Arc::new(Mutex::new(None)),
            proxy_configured: false,
        }
    }

    /// Enabled and not yet destroyed
    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.history.is_some()
    }

    pub fn current_url(&self) -> Option<&str> {
        self.current_url.as_deref()
    }

    /// History key of the page being loaded
    pub fn main_host(&self) -> Option<&str> {
        self.main_host.as_deref()
    }

    pub fn active_worker(&self) -> Option<WorkerTicket> {
        *lock(&self.active)
    }

    /// Connections through a proxy gain nothing from pre-connecting
    pub fn set_proxy_configured(&mut self, configured: bool) {
        self.proxy_configured = configured;
    }

    /// Track an externally managed worker; false when the slot is out of range
    pub fn set_worker_slot(&self, ticket: Option<WorkerTicket>) -> bool {
        if let Some(t) = ticket {
            if t.slot >= self.workers.capacity() {
                tracing::warn!("Ignoring out of range worker slot {}", t.slot);
                return false;
            }
        }
        *lock(&self.active) = ticket;
        true
    }

    /// A page load started in this tab
    pub fn on_load_started(&mut self, url: &str) {
        if !self.is_enabled() || self.proxy_configured {
            return;
        }
        if self.current_url.as_deref() == Some(url) {
            return;
        }

        self.stop_worker();
        self.current_url = Some(url.to_string());

        self.main_host = match host_key(url) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::debug!("Not tracking load of {}: {}", url, e);
                None
            }
        };

        if let Some(main_host) = self.main_host.clone() {
            self.preconnect(&main_host);
            if let Some(history) = &self.history {
                history.update_url_history(&main_host);
            }
        }
    }

    /// The page load in this tab finished
    pub fn on_load_finished(&mut self) {
        if !self.is_enabled() {
            return;
        }

        if let (Some(history), Some(main_host)) = (&self.history, &self.main_host) {
            history.on_load_finished(main_host);
        }

        self.stop_worker();
        self.pool.release_preconnected();
        self.current_url = None;
        self.main_host = None;
    }

    /// A subresource of the current page was requested from `sub_host`
    ///
    /// An empty `sub_host` means the page's own host.
    pub fn on_resource_load(&mut self, sub_host: &str) {
        if !self.is_enabled() {
            return;
        }
        let (Some(history), Some(main_host)) = (&self.history, &self.main_host) else {
            return;
        };

        let sub_host = if sub_host.trim().is_empty() {
            main_host.clone()
        } else {
            match host_key(sub_host) {
                Ok(key) => key,
                Err(e) => {
                    tracing::trace!("Ignoring resource host: {}", e);
                    return;
                }
            }
        };

        history.add_sub_host(main_host, &sub_host);
    }

    /// Stop the worker and release the shared history
    pub fn on_destroy(&mut self) {
        self.stop_worker();
        if let Some(history) = self.history.take() {
            history.release();
        }
        self.current_url = None;
        self.main_host = None;
    }

    fn preconnect(&self, main_host: &str) {
        let Some(history) = &self.history else {
            return;
        };
        let Some(candidates) = history.get_subhosts_to_connect(main_host) else {
            return;
        };
        if candidates.is_empty() {
            return;
        }

        // Held across the spawn so the exit callback can't run before the
        // ticket is recorded
        let mut active = lock(&self.active);
        let on_exit_active = Arc::clone(&self.active);

        let spawned = self.workers.spawn(
            candidates,
            Arc::clone(&self.pool),
            self.config.worker,
            move |ticket, _report| {
                let mut active = lock(&on_exit_active);
                if *active == Some(ticket) {
                    *active = None;
                }
            },
        );

        match spawned {
            Ok(ticket) => *active = Some(ticket),
            Err(e) => tracing::debug!("No pre-connect for {}: {}", main_host, e),
        }
    }

    fn stop_worker(&self) {
        if let Some(ticket) = lock(&self.active).take() {
            self.workers.stop(ticket);
        }
    }
}

impl Drop for PreconnectManager {
    fn drop(&mut self) {
        self.on_destroy();
    }
}
