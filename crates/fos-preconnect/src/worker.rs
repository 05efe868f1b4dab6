//! Pre-connection worker
//!
//! Opens TCP connections to the ranked subhosts of a page in two tiers and
//! hands every one that completes to the connection pool.
//!
//! 1. Every subhost at or above the weight threshold gets one connection.
//! 2. Frequently referenced subhosts get one or two extra connections,
//!    which are awaited for a bounded time.
//!
//! The total number of sockets opened per run is capped, the pool may stop
//! the run by refusing a connection, and a [`CancelToken`] stops it between
//! any two steps. Whatever is still connecting when the run ends is closed.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Poll, Waker};
use std::time::{Duration, Instant};

use smol::{Timer, future};

use crate::config::WorkerConfig;
use crate::connection_pool::{HostKey, PreConnection, RecycleConnection};
use crate::subhost::Subhost;
use crate::tcp::PendingConnect;

/// Cooperative stop flag shared with the worker
///
/// Cancelling also wakes a worker sleeping in [`CancelToken::cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<CancelState>);

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop and wake the waiting worker
    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        let waker = self
            .0
            .waker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled
    pub async fn cancelled(&self) {
        future::poll_fn(|cx| {
            if self.is_cancelled() {
                return Poll::Ready(());
            }
            *self
                .0
                .waker
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(cx.waker().clone());

            // A cancel between the first check and the store above
            if self.is_cancelled() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await;
    }
}

/// Why a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every initiated connect finished
    Completed,
    /// Stopped through the cancel token
    Cancelled,
    /// The pool refused a connection
    PoolFull,
    /// Extra connections were still pending when the budget ran out
    TimedOut,
}

/// Summary of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Sockets whose connect was issued
    pub initiated: usize,
    /// Connections accepted by the pool
    pub opened: usize,
    /// Connects closed unfinished at the end of the run
    pub abandoned: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    InitiateFirstLevel,
    StoreFirstLevel,
    InitiateExtraLevel,
    StoreExtraLevel,
}

/// One pre-connection run over a candidate snapshot
pub struct PreconnectWorker {
    subhosts: Vec<Subhost>,
    pending: Vec<PendingConnect>,
    pending_connections: usize,
    opened_connections: usize,
    pool: Arc<dyn RecycleConnection>,
    cancel: CancelToken,
    config: WorkerConfig,
}

impl std::fmt::Debug for PreconnectWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreconnectWorker")
            .field("subhosts", &self.subhosts.len())
            .field("pending", &self.pending.len())
            .field("pending_connections", &self.pending_connections)
            .field("opened_connections", &self.opened_connections)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl PreconnectWorker {
    pub fn new(
        subhosts: Vec<Subhost>,
        pool: Arc<dyn RecycleConnection>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            subhosts,
            pending: Vec::new(),
            pending_connections: 0,
            opened_connections: 0,
            pool,
            cancel: CancelToken::new(),
            config,
        }
    }

    /// Replace the worker's cancel token
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run to completion on the calling thread
    pub fn run(mut self) -> RunReport {
        let outcome = smol::block_on(self.drive());
        let abandoned = self.stop_connecting();

        let report = RunReport {
            outcome,
            initiated: self.pending_connections,
            opened: self.opened_connections,
            abandoned,
        };
        tracing::debug!("Pre-connect run finished: {:?}", report);
        report
    }

    async fn drive(&mut self) -> RunOutcome {
        let mut phase = Phase::InitiateFirstLevel;

        loop {
            if self.cancel.is_cancelled() {
                return RunOutcome::Cancelled;
            }

            let step = match phase {
                Phase::InitiateFirstLevel => self
                    .initiate_first_level()
                    .await
                    .map(|()| Phase::StoreFirstLevel),
                Phase::StoreFirstLevel => self
                    .store_connections()
                    .await
                    .map(|()| Phase::InitiateExtraLevel),
                Phase::InitiateExtraLevel => self
                    .initiate_extra_level()
                    .await
                    .map(|()| Phase::StoreExtraLevel),
                Phase::StoreExtraLevel => return self.store_extra_level().await,
            };

            match step {
                Ok(next) => phase = next,
                Err(outcome) => return outcome,
            }
        }
    }

    async fn initiate_first_level(&mut self) -> Result<(), RunOutcome> {
        let hosts: Vec<String> = self
            .subhosts
            .iter()
            .filter(|s| s.weight() >= self.config.weight_threshold)
            .map(|s| s.host().to_string())
            .collect();

        tracing::trace!("Pre-connecting first level to {} hosts", hosts.len());

        for host in hosts {
            self.check_cancelled()?;
            if self.at_capacity() {
                break;
            }
            self.open(&host).await;
        }
        Ok(())
    }

    async fn initiate_extra_level(&mut self) -> Result<(), RunOutcome> {
        let plan: Vec<(String, usize)> = self
            .subhosts
            .iter()
            .filter(|s| s.weight() >= self.config.weight_threshold)
            .map(|s| (s.host().to_string(), self.extra_connections(s)))
            .filter(|(_, count)| *count > 0)
            .collect();

        for (host, count) in plan {
            for _ in 0..count {
                self.check_cancelled()?;
                if self.at_capacity() {
                    return Ok(());
                }
                self.open(&host).await;
            }
        }
        Ok(())
    }

    /// Extra connections a subhost earns from its reference count
    fn extra_connections(&self, subhost: &Subhost) -> usize {
        let references = subhost.number_of_references();
        if references > self.config.second_level_references {
            self.config.second_level_connections
        } else if references > self.config.first_level_references {
            self.config.first_level_connections
        } else {
            0
        }
    }

    /// Sweep the pending connects once, handing finished ones to the pool
    async fn store_connections(&mut self) -> Result<(), RunOutcome> {
        let mut i = 0;
        while i < self.pending.len() {
            self.check_cancelled()?;

            let finished = self.pending[i].finish_connect().await;
            match finished {
                None => i += 1,
                Some(Err(e)) => {
                    let pending = self.pending.remove(i);
                    tracing::debug!(
                        "Pre-connect to {} ({}) failed: {}",
                        pending.host(),
                        pending.addr(),
                        e
                    );
                    pending.close();
                }
                Some(Ok(stream)) => {
                    let pending = self.pending.remove(i);
                    self.recycle(pending.host(), stream)?;
                }
            }
        }
        Ok(())
    }

    async fn store_extra_level(&mut self) -> RunOutcome {
        let started = Instant::now();
        let budget = self.config.extra_level_budget;

        loop {
            if let Err(outcome) = self.store_connections().await {
                return outcome;
            }
            if self.cancel.is_cancelled() {
                return RunOutcome::Cancelled;
            }

            if self.pending.is_empty() {
                tracing::debug!("Pre-connected {} connections", self.opened_connections);
                return RunOutcome::Completed;
            }

            let elapsed = started.elapsed();
            if elapsed >= budget {
                tracing::debug!(
                    "Pre-connect budget spent with {} connects pending",
                    self.pending.len()
                );
                return RunOutcome::TimedOut;
            }

            self.wait_for_progress(self.config.poll_interval.min(budget - elapsed))
                .await;
        }
    }

    /// Sleep until any pending connect finishes, `wait` elapses or the run
    /// is cancelled
    async fn wait_for_progress(&mut self, wait: Duration) {
        let pending = &mut self.pending;
        let cancel = &self.cancel;

        let progress = future::poll_fn(|cx| {
            if pending.iter_mut().any(|p| p.poll_progress(cx).is_ready()) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        });
        let timeout = async {
            Timer::after(wait).await;
        };

        future::or(progress, future::or(timeout, cancel.cancelled())).await;
    }

    async fn open(&mut self, host: &str) {
        match PendingConnect::open(host, self.config.default_port).await {
            Ok(pending) => {
                self.pending.push(pending);
                self.pending_connections += 1;
            }
            Err(e) => tracing::debug!("Pre-connect to {} dropped: {}", host, e),
        }
    }

    fn recycle(&mut self, host: &str, stream: TcpStream) -> Result<(), RunOutcome> {
        let key = HostKey::from_subhost(host, self.config.default_port);

        if !self.pool.recycle_connection(PreConnection::new(key, stream)) {
            tracing::debug!("Connection pool full, stopping pre-connect");
            return Err(RunOutcome::PoolFull);
        }

        self.opened_connections += 1;
        Ok(())
    }

    fn at_capacity(&self) -> bool {
        self.pending_connections >= self.config.max_pending_connections
    }

    fn check_cancelled(&self) -> Result<(), RunOutcome> {
        if self.cancel.is_cancelled() {
            Err(RunOutcome::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Close everything still connecting; returns how many were closed
    fn stop_connecting(&mut self) -> usize {
        let abandoned = self.pending.len();
        for pending in self.pending.drain(..) {
            pending.close();
        }
        self.cancel.cancel();
        abandoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingPool {
        accepted: Mutex<Vec<HostKey>>,
    }

    impl RecycleConnection for CountingPool {
        fn recycle_connection(&self, conn: PreConnection) -> bool {
            self.accepted.lock().unwrap().push(conn.key);
            true
        }
    }

    fn worker(subhosts: Vec<Subhost>) -> PreconnectWorker {
        PreconnectWorker::new(subhosts, Arc::new(CountingPool::default()), WorkerConfig::default())
    }

    #[test]
    fn test_extra_connections_by_references() {
        let w = worker(Vec::new());
        assert_eq!(w.extra_connections(&Subhost::with_stats("a", 10, 1.0)), 0);
        assert_eq!(w.extra_connections(&Subhost::with_stats("a", 11, 1.0)), 1);
        assert_eq!(w.extra_connections(&Subhost::with_stats("a", 20, 1.0)), 1);
        assert_eq!(w.extra_connections(&Subhost::with_stats("a", 21, 1.0)), 2);
    }

    #[test]
    fn test_empty_run_completes() {
        let report = worker(Vec::new()).run();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.initiated, 0);
        assert_eq!(report.abandoned, 0);
    }

    #[test]
    fn test_light_subhosts_are_skipped() {
        let report = worker(vec![Subhost::with_stats("127.0.0.1:9", 50, 0.5)]).run();
        assert_eq!(report.initiated, 0);
        assert_eq!(report.outcome, RunOutcome::Completed);
    }

    #[test]
    fn test_cancelled_before_start() {
        let w = worker(vec![Subhost::with_stats("127.0.0.1:9", 1, 2.0)]);
        w.cancel_token().cancel();

        let report = w.run();
        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.initiated, 0);
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let token = CancelToken::new();
        let remote = token.clone();

        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });

        let started = Instant::now();
        smol::block_on(future::or(token.cancelled(), async {
            Timer::after(Duration::from_secs(30)).await;
        }));
        canceller.join().unwrap();

        assert!(token.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_cancelled_resolves_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        smol::block_on(token.cancelled());
    }

    #[test]
    fn test_run_cancels_token() {
        let w = worker(Vec::new());
        let token = w.cancel_token();
        w.run();
        assert!(token.is_cancelled());
    }
}
