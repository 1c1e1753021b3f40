//! In-process per-file mutual exclusion.
//!
//! Maintains one FIFO ticket queue per absolute file path: at most one
//! read or write operation against a path is in flight at a time, and
//! queued operations run in submission order. Operations on different
//! paths never block each other. A queue entry is dropped from the table
//! once it drains, so the table only holds paths with pending work.
//!
//! This serializes access within a single process only. Concurrent writers
//! in separate processes sharing the same directory are not protected.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};

/// One queue per path. Tickets are handed out in submission order and
/// served one at a time.
#[derive(Default)]
struct PathQueue {
    tickets: Mutex<Tickets>,
    served: Condvar,
}

#[derive(Default)]
struct Tickets {
    /// Next ticket to hand out.
    next: u64,
    /// Ticket currently allowed to run.
    serving: u64,
}

type Registry = Mutex<HashMap<PathBuf, Arc<PathQueue>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The table's critical sections never run caller code, so a poisoned
/// mutex only records a panic elsewhere; keep serving.
fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// RAII guard for exclusive access to one file path.
/// Advances the path's queue on drop.
pub struct PathGuard {
    path: PathBuf,
    queue: Arc<PathQueue>,
}

impl PathGuard {
    /// Get the path this guard serializes.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        // Hold the table lock so ticket handout in `acquire` cannot
        // interleave with queue removal.
        let mut table = lock_unpoisoned(registry());
        let mut tickets = lock_unpoisoned(&self.queue.tickets);
        tickets.serving += 1;
        let drained = tickets.serving == tickets.next;
        drop(tickets);
        if drained {
            table.remove(&self.path);
        }
        drop(table);
        self.queue.served.notify_all();
    }
}

/// Acquire exclusive access to `path`, blocking until every operation
/// queued ahead of this one has completed.
pub fn acquire(path: &Path) -> PathGuard {
    let (queue, ticket) = {
        let mut table = lock_unpoisoned(registry());
        let queue = Arc::clone(table.entry(path.to_path_buf()).or_default());
        let mut tickets = lock_unpoisoned(&queue.tickets);
        let ticket = tickets.next;
        tickets.next += 1;
        drop(tickets);
        (queue, ticket)
    };

    let mut tickets = lock_unpoisoned(&queue.tickets);
    while tickets.serving != ticket {
        tickets = queue
            .served
            .wait(tickets)
            .unwrap_or_else(PoisonError::into_inner);
    }
    drop(tickets);

    PathGuard {
        path: path.to_path_buf(),
        queue,
    }
}

/// Run `action` while holding the lock for `path`.
/// The lock is released on all exit paths, including panics.
pub fn with_path<R>(path: &Path, action: impl FnOnce() -> R) -> R {
    let _guard = acquire(path);
    action()
}

#[cfg(test)]
fn table_contains(path: &Path) -> bool {
    lock_unpoisoned(registry()).contains_key(path)
}
