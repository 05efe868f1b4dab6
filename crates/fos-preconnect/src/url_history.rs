//! Per main host subresource history
//!
//! Bounded map of the subhosts a main page pulls resources from, and the
//! ranked list of those worth pre-connecting on its next load.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::UrlHistoryLimits;
use crate::subhost::Subhost;

/// Persisted form of one main host's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlHistoryRecord {
    pub main_host: String,
    pub use_count: u32,
    pub subhosts: Vec<Subhost>,
}

/// Subhosts of one main host
#[derive(Debug, Clone)]
pub struct UrlHistory {
    main_host: String,
    use_count: u32,
    subhosts: HashMap<String, Subhost>,
    subhosts_to_connect: Option<Vec<Subhost>>,
    limits: UrlHistoryLimits,
}

impl UrlHistory {
    /// History with the default limits
    pub fn new(main_host: &str) -> Self {
        Self::with_limits(main_host, UrlHistoryLimits::default())
    }

    /// History with custom limits
    pub fn with_limits(main_host: &str, limits: UrlHistoryLimits) -> Self {
        Self {
            main_host: main_host.to_string(),
            use_count: 0,
            subhosts: HashMap::with_capacity(limits.max_subhosts + 1),
            subhosts_to_connect: None,
            limits,
        }
    }

    /// Host of the page this history belongs to
    pub fn main_host(&self) -> &str {
        &self.main_host
    }

    /// Number of finished loads of the page
    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    /// Overwrite the use count
    pub fn set_use_count(&mut self, use_count: u32) {
        self.use_count = use_count;
    }

    /// Count one more finished load
    pub fn increment_use_count(&mut self) {
        self.use_count = self.use_count.saturating_add(1);
    }

    /// Number of tracked subhosts
    pub fn len(&self) -> usize {
        self.subhosts.len()
    }

    /// Check if no subhost is tracked
    pub fn is_empty(&self) -> bool {
        self.subhosts.is_empty()
    }

    /// Tracked subhost by host name
    pub fn get(&self, host: &str) -> Option<&Subhost> {
        self.subhosts.get(host)
    }

    /// Record one resource fetched from `host`
    pub fn add_subhost(&mut self, host: &str) {
        let host = host.trim();
        if host.is_empty() {
            return;
        }

        if let Some(sub) = self.subhosts.get_mut(host) {
            sub.increment_references();
            sub.increment_weight(self.limits.weight_increment);
            return;
        }

        if self.limits.max_subhosts == 0 {
            return;
        }

        if self.subhosts.len() >= self.limits.max_subhosts {
            self.remove_low_weight_subhosts();
        }

        self.subhosts.insert(host.to_string(), Subhost::new(host));
    }

    /// Insert a persisted subhost as is, unless already tracked
    pub fn restore_subhost(&mut self, subhost: Subhost) {
        if subhost.host().is_empty()
            || self.subhosts.contains_key(subhost.host())
            || self.subhosts.len() >= self.limits.max_subhosts
        {
            return;
        }

        self.subhosts.insert(subhost.host().to_string(), subhost);
    }

    /// All tracked subhosts, unordered
    pub fn subhosts(&self) -> Vec<Subhost> {
        self.subhosts.values().cloned().collect()
    }

    /// Ranked candidates from the last `update_subhosts_to_connect`
    pub fn subhosts_to_connect(&self) -> Option<&[Subhost]> {
        self.subhosts_to_connect.as_deref()
    }

    /// Called on load start
    pub fn reset_subhosts_weight(&mut self) {
        for sub in self.subhosts.values_mut() {
            sub.decrement_weight(self.limits.weight_decay);
            sub.reset_references();
        }
    }

    /// Called on load finish
    pub fn update_subhosts_references(&mut self) {
        for sub in self.subhosts.values_mut() {
            sub.update_references();
        }
    }

    /// Recompute the ranked candidates
    pub fn update_subhosts_to_connect(&mut self) {
        let mut ranked: Vec<Subhost> = self
            .subhosts
            .values()
            .map(|sub| Subhost::with_stats(sub.host(), sub.number_of_references(), sub.weight()))
            .collect();

        ranked.sort_by(by_weight_desc);
        ranked.truncate(self.limits.max_to_connect);

        self.subhosts_to_connect = Some(ranked);
    }

    /// Persistable copy, heaviest subhosts first
    pub fn to_record(&self) -> UrlHistoryRecord {
        let mut subhosts = self.subhosts();
        subhosts.sort_by(by_weight_desc);

        UrlHistoryRecord {
            main_host: self.main_host.clone(),
            use_count: self.use_count,
            subhosts,
        }
    }

    fn remove_low_weight_subhosts(&mut self) {
        let mut ranked: Vec<(&String, &Subhost)> = self.subhosts.iter().collect();
        ranked.sort_by(|a, b| by_weight_desc(a.1, b.1));

        let batch = self.limits.subhost_evict_batch.max(1).min(ranked.len());
        let evicted: Vec<String> = ranked[ranked.len() - batch..]
            .iter()
            .map(|(host, _)| (*host).clone())
            .collect();

        tracing::trace!(
            "Evicting {} subhosts of {}: {:?}",
            evicted.len(),
            self.main_host,
            evicted
        );

        for host in evicted {
            self.subhosts.remove(&host);
        }
    }
}

/// Heaviest first, equal weights by host name
fn by_weight_desc(a: &Subhost, b: &Subhost) -> Ordering {
    b.weight()
        .total_cmp(&a.weight())
        .then_with(|| a.host().cmp(b.host()))
}
