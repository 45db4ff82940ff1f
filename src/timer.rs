// src/timer.rs
//
// Idle-timeout reaper. Keeps a last-activity timestamp per connection
// slot and hands expired slots to a bulk-termination callback from a
// dedicated background thread.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Pass interval of the background worker. Short poll keeps the reaper
/// responsive under millisecond-scale timeout intervals.
const POLL_INTERVAL: Duration = Duration::from_micros(100);

struct ReaperInner {
    keys: Mutex<HashMap<u32, Instant>>,
    running: AtomicBool,
}

impl ReaperInner {
    /// Removes and returns every key idle strictly longer than
    /// `interval`. Entries exactly at the boundary survive the pass.
    fn prune(&self, interval: Duration) -> Vec<u32> {
        let mut keys = self.keys.lock().unwrap();
        let now = Instant::now();

        let expired: Vec<u32> = keys
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > interval)
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            keys.remove(key);
        }
        expired
    }
}

/// Background poller that expires idle connections.
///
/// Advisory only: it has no failure mode of its own, and the callback is
/// invoked with the key map unlocked so it may re-enter `set`/`unset`.
pub struct Reaper {
    inner: Arc<ReaperInner>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Reaper {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ReaperInner {
                keys: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Starts the background worker. No-op when `interval_ms` is 0 or a
    /// worker is already running.
    pub fn run<F>(&self, interval_ms: u64, on_timeout: F)
    where
        F: Fn(&[u32]) + Send + 'static,
    {
        if interval_ms == 0 {
            return;
        }

        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }

        self.inner.running.store(true, Ordering::Release);
        let inner = self.inner.clone();
        let interval = Duration::from_millis(interval_ms);

        let handle = thread::Builder::new()
            .name("ravel-reaper".to_string())
            .spawn(move || loop {
                thread::sleep(POLL_INTERVAL);
                if !inner.running.load(Ordering::Acquire) {
                    break;
                }

                let expired = inner.prune(interval);
                if !expired.is_empty() {
                    on_timeout(&expired);
                }
            })
            .expect("failed to spawn reaper thread");

        *worker = Some(handle);
    }

    /// Records or refreshes the timestamp for `key`.
    pub fn set(&self, key: u32) {
        self.inner.keys.lock().unwrap().insert(key, Instant::now());
    }

    /// Removes `key` from the map.
    pub fn unset(&self, key: u32) {
        self.inner.keys.lock().unwrap().remove(&key);
    }

    /// Signals the worker to exit and joins it. Idempotent.
    pub fn stop(&self) {
        let handle = {
            let mut worker = self.worker.lock().unwrap();
            self.inner.running.store(false, Ordering::Release);
            worker.take()
        };

        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Default for Reaper {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}
