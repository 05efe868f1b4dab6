//! Pre-connection configuration
//!
//! Every tunable of the engine lives here with its default value.

use std::time::Duration;

/// Environment variable gating the whole engine ("0"/"false" disables)
pub const ENV_PRECONNECT: &str = "FOS_PRECONNECT";

/// Environment variable overriding the periodic writer interval (milliseconds)
pub const ENV_WRITER_INTERVAL_MS: &str = "FOS_PRECONNECT_WRITER_INTERVAL_MS";

/// Per main host limits and weighting model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UrlHistoryLimits {
    /// Max subhosts tracked per main host
    pub max_subhosts: usize,
    /// Subhosts evicted at once when the map is full
    pub subhost_evict_batch: usize,
    /// Max pre-connect candidates
    pub max_to_connect: usize,
    /// Added to a subhost's weight on every reference
    pub weight_increment: f64,
    /// Multiplied into every weight once per load start
    pub weight_decay: f64,
}

impl Default for UrlHistoryLimits {
    fn default() -> Self {
        Self {
            max_subhosts: 30,
            subhost_evict_batch: 4,
            max_to_connect: 15,
            weight_increment: 0.33,
            weight_decay: 0.67,
        }
    }
}

/// History store configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryConfig {
    /// Max main hosts kept in the store
    pub max_main_hosts: usize,
    /// Main hosts evicted at once when the store is full
    pub main_host_evict_batch: usize,
    /// How often the periodic writer flushes dirty state
    pub persist_interval: Duration,
    /// Limits applied to every main host's history
    pub url_history: UrlHistoryLimits,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_main_hosts: 300,
            main_host_evict_batch: 30,
            persist_interval: Duration::from_secs(10 * 60),
            url_history: UrlHistoryLimits::default(),
        }
    }
}

/// Pre-connection run configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerConfig {
    /// Port used when a subhost carries none
    pub default_port: u16,
    /// Minimal weight for a subhost to be pre-connected at all
    pub weight_threshold: f64,
    /// References above which one extra connection is opened
    pub first_level_references: u32,
    /// References above which two extra connections are opened
    pub second_level_references: u32,
    pub first_level_connections: usize,
    pub second_level_connections: usize,
    /// Bound on connects initiated during one run
    pub max_pending_connections: usize,
    /// Time budget of the second tier reap
    pub extra_level_budget: Duration,
    /// Longest wait between two completion sweeps
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            default_port: 80,
            weight_threshold: 0.8,
            first_level_references: 10,
            second_level_references: 20,
            first_level_connections: 1,
            second_level_connections: 2,
            max_pending_connections: 25,
            extra_level_budget: Duration::from_millis(500),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Top level configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreconnectConfig {
    /// Feature flag, the engine is a no-op when false
    pub enabled: bool,
    /// Max workers running at once across all managers
    pub max_workers: usize,
    pub history: HistoryConfig,
    pub worker: WorkerConfig,
}

impl Default for PreconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_workers: 5,
            history: HistoryConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl PreconnectConfig {
    /// Defaults overridden by the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_PRECONNECT) {
            match parse_flag(&value) {
                Some(enabled) => config.enabled = enabled,
                None => tracing::warn!("Ignoring invalid {}={:?}", ENV_PRECONNECT, value),
            }
        }

        if let Some(value) = lookup(ENV_WRITER_INTERVAL_MS) {
            match value.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => {
                    config.history.persist_interval = Duration::from_millis(ms);
                }
                _ => tracing::warn!("Ignoring invalid {}={:?}", ENV_WRITER_INTERVAL_MS, value),
            }
        }

        config
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PreconnectConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_workers, 5);
        assert_eq!(config.history.max_main_hosts, 300);
        assert_eq!(config.history.main_host_evict_batch, 30);
        assert_eq!(config.history.persist_interval, Duration::from_secs(600));
        assert_eq!(config.history.url_history.max_subhosts, 30);
        assert_eq!(config.history.url_history.max_to_connect, 15);
        assert_eq!(config.worker.max_pending_connections, 25);
        assert_eq!(config.worker.extra_level_budget, Duration::from_millis(500));
        assert_eq!(config.worker.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_env_disables_feature() {
        let config = PreconnectConfig::from_lookup(lookup(&[(ENV_PRECONNECT, "false")]));
        assert!(!config.enabled);

        let config = PreconnectConfig::from_lookup(lookup(&[(ENV_PRECONNECT, " 0 ")]));
        assert!(!config.enabled);
    }

    #[test]
    fn test_env_writer_interval() {
        let config = PreconnectConfig::from_lookup(lookup(&[(ENV_WRITER_INTERVAL_MS, "250")]));
        assert_eq!(config.history.persist_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_env_invalid_values_keep_defaults() {
        let config = PreconnectConfig::from_lookup(lookup(&[
            (ENV_PRECONNECT, "maybe"),
            (ENV_WRITER_INTERVAL_MS, "soon"),
        ]));
        assert_eq!(config, PreconnectConfig::default());
    }
}
