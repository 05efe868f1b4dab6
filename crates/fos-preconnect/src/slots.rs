//! Pre-connection worker slots
//!
//! A fixed number of workers may run at once across all tabs. Each one
//! occupies a slot for the lifetime of its thread; a [`WorkerTicket`]
//! names the slot together with the generation that reserved it, so a
//! stale ticket can never stop a later worker in the same slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::PreconnectError;
use crate::config::WorkerConfig;
use crate::connection_pool::RecycleConnection;
use crate::subhost::Subhost;
use crate::worker::{CancelToken, PreconnectWorker, RunReport};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Slot index
pub type SlotId = usize;

/// Handle to a spawned worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerTicket {
    pub slot: SlotId,
    pub generation: u64,
}

#[derive(Debug)]
struct SlotEntry {
    generation: u64,
    cancel: CancelToken,
    thread: Option<JoinHandle<()>>,
}

/// Bounded set of running workers
#[derive(Debug)]
pub struct WorkerSlots {
    slots: Mutex<Vec<Option<SlotEntry>>>,
    next_generation: AtomicU64,
}

impl WorkerSlots {
    pub fn new(max_workers: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new((0..max_workers).map(|_| None).collect()),
            next_generation: AtomicU64::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        lock(&self.slots).len()
    }

    /// Number of occupied slots
    pub fn active(&self) -> usize {
        lock(&self.slots).iter().filter(|s| s.is_some()).count()
    }

    pub fn is_running(&self, ticket: WorkerTicket) -> bool {
        Self::entry(&lock(&self.slots), ticket).is_some()
    }

    /// Start a worker over `subhosts` in a free slot
    ///
    /// `on_exit` runs on the worker thread after the run, before the slot
    /// is freed.
    pub fn spawn<F>(
        self: &Arc<Self>,
        subhosts: Vec<Subhost>,
        pool: Arc<dyn RecycleConnection>,
        config: WorkerConfig,
        on_exit: F,
    ) -> Result<WorkerTicket, PreconnectError>
    where
        F: FnOnce(WorkerTicket, RunReport) + Send + 'static,
    {
        let worker = PreconnectWorker::new(subhosts, pool, config);
        let cancel = worker.cancel_token();

        // Held until the entry is in place, so the thread can't free the
        // slot before it is recorded
        let mut slots = lock(&self.slots);
        let Some(slot) = slots.iter().position(Option::is_none) else {
            return Err(PreconnectError::NoFreeWorkerSlot);
        };

        let ticket = WorkerTicket {
            slot,
            generation: self.next_generation.fetch_add(1, Ordering::SeqCst),
        };
        let registry = Arc::clone(self);

        let thread = thread::Builder::new()
            .name(format!("fos-preconnect-{}", slot))
            .spawn(move || {
                let report = worker.run();
                on_exit(ticket, report);
                registry.release(ticket);
            })?;

        slots[slot] = Some(SlotEntry {
            generation: ticket.generation,
            cancel,
            thread: Some(thread),
        });

        tracing::debug!("Pre-connect worker started in slot {}", slot);
        Ok(ticket)
    }

    /// Ask the worker to stop; false when the ticket is stale
    pub fn stop(&self, ticket: WorkerTicket) -> bool {
        match Self::entry(&lock(&self.slots), ticket) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait for the worker's thread to exit
    pub fn join(&self, ticket: WorkerTicket) {
        let thread = {
            let mut slots = lock(&self.slots);
            slots
                .get_mut(ticket.slot)
                .and_then(Option::as_mut)
                .filter(|e| e.generation == ticket.generation)
                .and_then(|e| e.thread.take())
        };

        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }

    /// Stop every worker and wait for all of them
    pub fn shutdown(&self) {
        let threads: Vec<JoinHandle<()>> = {
            let mut slots = lock(&self.slots);
            slots
                .iter_mut()
                .flatten()
                .filter_map(|entry| {
                    entry.cancel.cancel();
                    entry.thread.take()
                })
                .collect()
        };

        for thread in threads {
            let _ = thread.join();
        }
    }

    fn release(&self, ticket: WorkerTicket) {
        let mut slots = lock(&self.slots);
        if let Some(slot) = slots.get_mut(ticket.slot) {
            if slot.as_ref().is_some_and(|e| e.generation == ticket.generation) {
                *slot = None;
            }
        }
    }

    fn entry(slots: &[Option<SlotEntry>], ticket: WorkerTicket) -> Option<&SlotEntry> {
        slots
            .get(ticket.slot)?
            .as_ref()
            .filter(|e| e.generation == ticket.generation)
    }
}
