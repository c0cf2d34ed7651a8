use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use parking_lot::{Condvar, Mutex};

/// Cooperative per-path critical section. Every write path acquires the gate
/// for the target file and holds it to completion, so at most one mutating
/// operation per collection file is in flight in this process. The gate does
/// not take kernel file locks; it only protects the engine from its own
/// concurrent callers.
pub struct FileGate {
    busy: Mutex<HashSet<PathBuf>>,
    released: Condvar,
}

impl FileGate {
    pub fn new() -> Self {
        Self {
            busy: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }

    /// Blocks until no other caller holds the gate for `path`.
    pub fn acquire(&self, path: &Path) -> PathGuard<'_> {
        let mut busy = self.busy.lock();
        while busy.contains(path) {
            self.released.wait(&mut busy);
        }
        busy.insert(path.to_path_buf());
        PathGuard {
            gate: self,
            path: path.to_path_buf(),
        }
    }
}

impl Default for FileGate {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PathGuard<'a> {
    gate: &'a FileGate,
    path: PathBuf,
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        let mut busy = self.gate.busy.lock();
        busy.remove(&self.path);
        drop(busy);
        self.gate.released.notify_all();
    }
}

/// Bounds the number of gated operations in flight across all collections.
/// Additional callers queue until a permit frees up.
pub struct ConnectionLimiter {
    available: Mutex<usize>,
    freed: Condvar,
}

impl ConnectionLimiter {
    pub fn new(max_connections: usize) -> Self {
        Self {
            available: Mutex::new(max_connections.max(1)),
            freed: Condvar::new(),
        }
    }

    pub fn acquire(&self) -> Permit<'_> {
        let mut available = self.available.lock();
        while *available == 0 {
            self.freed.wait(&mut available);
        }
        *available -= 1;
        Permit { limiter: self }
    }
}

pub struct Permit<'a> {
    limiter: &'a ConnectionLimiter,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut available = self.limiter.available.lock();
        *available += 1;
        drop(available);
        self.limiter.freed.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };
    use std::thread;
    use std::time::Duration;

    #[test]
    fn same_path_serializes_different_paths_do_not() {
        let gate = Arc::new(FileGate::new());
        let in_section = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let gate = Arc::clone(&gate);
                let in_section = Arc::clone(&in_section);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    let path = PathBuf::from("shared.tdbx");
                    let _guard = gate.acquire(&path);
                    let now = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(2 + (i % 3)));
                    in_section.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);

        // Distinct paths are independent.
        let first = gate.acquire(Path::new("a.tdbx"));
        let _second = gate.acquire(Path::new("b.tdbx"));
        drop(first);
    }

    #[test]
    fn limiter_caps_concurrency() {
        let limiter = Arc::new(ConnectionLimiter::new(2));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    let _permit = limiter.acquire();
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(3));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
