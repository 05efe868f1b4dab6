//! fOS TCP Pre-connection
//!
//! Learns which hosts a page pulls its subresources from and opens TCP
//! connections to them as soon as the page starts loading again.

pub mod config;
pub mod subhost;
pub mod url_history;
pub mod store;
pub mod history;
pub mod tcp;
pub mod connection_pool;
pub mod worker;
pub mod slots;
pub mod manager;

pub use config::{HistoryConfig, PreconnectConfig, UrlHistoryLimits, WorkerConfig};
pub use subhost::Subhost;
pub use url_history::{UrlHistory, UrlHistoryRecord};
pub use store::{HistoryStore, JsonFileStore, MemoryStore};
pub use history::{HistoryHandle, HistoryRegistry, SubResourcesHistory};
pub use tcp::{PendingConnect, resolve_host};
pub use connection_pool::{HostKey, IdleConnectionCache, PoolConfig, PoolStats, PreConnection, RecycleConnection};
pub use worker::{CancelToken, PreconnectWorker, RunOutcome, RunReport};
pub use slots::{SlotId, WorkerSlots, WorkerTicket};
pub use manager::{PreconnectManager, host_key};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Pre-connection error
#[derive(Debug, thiserror::Error)]
pub enum PreconnectError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid host: {0}")]
    InvalidHost(String),

    #[error("No free pre-connection worker slot")]
    NoFreeWorkerSlot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PreconnectError::InvalidHost("::".to_string());
        assert_eq!(err.to_string(), "Invalid host: ::");

        let err: PreconnectError = std::io::Error::other("boom").into();
        assert!(err.to_string().contains("boom"));
    }
}
