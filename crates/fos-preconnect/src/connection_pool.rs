//! Connection pool hand-off
//!
//! Workers hand every connection they open to a [`RecycleConnection`]
//! implementation. [`IdleConnectionCache`] is the bounded in-process one.

use std::net::TcpStream;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use url::Url;

use crate::tcp::split_host_port;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Host key for connection pooling
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostKey {
    pub host: Box<str>,
    pub port: u16,
    pub is_tls: bool,
}

impl HostKey {
    pub fn new(host: &str, port: u16, is_tls: bool) -> Self {
        Self {
            host: host.to_ascii_lowercase().into(),
            port,
            is_tls,
        }
    }

    /// Key of a plain connection to a subhost (`host` or `host:port`)
    pub fn from_subhost(subhost: &str, default_port: u16) -> Self {
        let (host, port) = split_host_port(subhost, default_port);
        Self::new(host, port, false)
    }

    pub fn from_url(url: &str) -> Option<Self> {
        let url = Url::parse(url).ok()?;
        let is_tls = url.scheme() == "https";
        let host = url.host_str()?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Some(Self::new(host, url.port_or_known_default()?, is_tls))
    }
}

/// Connection opened ahead of the page's own requests
#[derive(Debug)]
pub struct PreConnection {
    /// Destination
    pub key: HostKey,
    /// Connected socket, blocking mode
    pub stream: TcpStream,
    /// Kept out of idle eviction until the page load finishes
    pub protected: bool,
    /// Opened at, or released from protection at
    pub idle_since: Instant,
}

impl PreConnection {
    pub fn new(key: HostKey, stream: TcpStream) -> Self {
        Self {
            key,
            stream,
            protected: true,
            idle_since: Instant::now(),
        }
    }

    /// Check if connection is stale
    pub fn is_stale(&self, max_idle: Duration) -> bool {
        !self.protected && self.idle_since.elapsed() > max_idle
    }
}

/// Receiver of pre-opened connections
pub trait RecycleConnection: Send + Sync {
    /// Take ownership of `conn`; false when the pool has no room, in which
    /// case the connection is closed
    fn recycle_connection(&self, conn: PreConnection) -> bool;

    /// The page load that triggered pre-connection finished
    fn release_preconnected(&self) {}
}

/// Pool configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolConfig {
    /// Max idle connections held
    pub max_idle: usize,
    /// Idle timeout once unprotected
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 32,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub recycled: u64,
    pub rejected: u64,
    pub hits: u64,
    pub misses: u64,
    pub evicted: u64,
}

impl PoolStats {
    /// Share of `take` calls that found a connection
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Bounded cache of idle pre-opened connections
#[derive(Debug, Default)]
pub struct IdleConnectionCache {
    idle: Mutex<Vec<PreConnection>>,
    stats: Mutex<PoolStats>,
    config: PoolConfig,
}

impl IdleConnectionCache {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(config.max_idle)),
            stats: Mutex::new(PoolStats::default()),
            config,
        }
    }

    /// Take an idle connection to `key`, oldest first
    pub fn take(&self, key: &HostKey) -> Option<PreConnection> {
        let mut idle = lock(&self.idle);
        let found = idle.iter().position(|c| &c.key == key).map(|i| idle.remove(i));

        let mut stats = lock(&self.stats);
        if found.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        found
    }

    /// Close unprotected connections idle longer than the timeout
    pub fn evict_stale(&self) -> usize {
        let mut idle = lock(&self.idle);
        let before = idle.len();
        idle.retain(|c| !c.is_stale(self.config.idle_timeout));

        let evicted = before - idle.len();
        if evicted > 0 {
            tracing::debug!("Evicted {} stale pre-connections", evicted);
            lock(&self.stats).evicted += evicted as u64;
        }
        evicted
    }

    /// Number of idle connections
    pub fn len(&self) -> usize {
        lock(&self.idle).len()
    }

    /// Check if no connection is idle
    pub fn is_empty(&self) -> bool {
        lock(&self.idle).is_empty()
    }

    /// Idle connections to `key`
    pub fn count_for(&self, key: &HostKey) -> usize {
        lock(&self.idle).iter().filter(|c| &c.key == key).count()
    }

    /// Number of connections still protected from eviction
    pub fn protected_count(&self) -> usize {
        lock(&self.idle).iter().filter(|c| c.protected).count()
    }

    /// Snapshot of the statistics
    pub fn stats(&self) -> PoolStats {
        *lock(&self.stats)
    }
}

impl RecycleConnection for IdleConnectionCache {
    fn recycle_connection(&self, conn: PreConnection) -> bool {
        let mut idle = lock(&self.idle);

        if idle.len() >= self.config.max_idle {
            lock(&self.stats).rejected += 1;
            tracing::trace!("Pre-connection to {} rejected, pool full", conn.key.host);
            return false;
        }

        idle.push(conn);
        lock(&self.stats).recycled += 1;
        true
    }

    fn release_preconnected(&self) {
        let now = Instant::now();
        for conn in lock(&self.idle).iter_mut().filter(|c| c.protected) {
            conn.protected = false;
            conn.idle_since = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn connection(listener: &TcpListener) -> PreConnection {
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        PreConnection::new(HostKey::new("127.0.0.1", addr.port(), false), stream)
    }

    #[test]
    fn test_host_key_from_url() {
        let key = HostKey::from_url("https://Example.com/path").unwrap();
        assert_eq!(&*key.host, "example.com");
        assert_eq!(key.port, 443);
        assert!(key.is_tls);

        let key = HostKey::from_url("http://example.com:8080/").unwrap();
        assert_eq!(key.port, 8080);
        assert!(!key.is_tls);
    }

    #[test]
    fn test_host_key_from_subhost() {
        assert_eq!(HostKey::from_subhost("cdn.com", 80), HostKey::new("cdn.com", 80, false));
        assert_eq!(HostKey::from_subhost("cdn.com:81", 80), HostKey::new("cdn.com", 81, false));
    }

    #[test]
    fn test_recycle_until_full() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let pool = IdleConnectionCache::new(PoolConfig {
            max_idle: 2,
            ..Default::default()
        });

        assert!(pool.recycle_connection(connection(&listener)));
        assert!(pool.recycle_connection(connection(&listener)));
        assert!(!pool.recycle_connection(connection(&listener)));

        assert_eq!(pool.len(), 2);
        let stats = pool.stats();
        assert_eq!(stats.recycled, 2);
        assert_eq!(stats.rejected, 1);
    }

    #[test]
    fn test_take_by_key() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let pool = IdleConnectionCache::default();
        let conn = connection(&listener);
        let key = conn.key.clone();
        pool.recycle_connection(conn);

        assert_eq!(pool.count_for(&key), 1);
        assert!(pool.take(&key).is_some());
        assert!(pool.take(&key).is_none());
        assert_eq!(pool.stats().hits, 1);
        assert_eq!(pool.stats().misses, 1);
        assert_eq!(pool.stats().hit_rate(), 0.5);
        assert_eq!(PoolStats::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_protected_until_released() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let pool = IdleConnectionCache::new(PoolConfig {
            max_idle: 4,
            idle_timeout: Duration::ZERO,
        });
        pool.recycle_connection(connection(&listener));

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(pool.evict_stale(), 0);
        assert_eq!(pool.protected_count(), 1);

        pool.release_preconnected();
        assert_eq!(pool.protected_count(), 0);

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(pool.evict_stale(), 1);
        assert!(pool.is_empty());
    }
}
