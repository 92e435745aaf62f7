//! Sliding window failure tracking for brute force detection
//!
//! Keeps, per source address, the timestamps of recent failed logins and
//! answers "how many failures in the last `window_seconds`". Expiry happens
//! lazily on every record and in bulk through [`WindowTracker::sweep`].

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::config::MAX_WINDOW_SECONDS;

/// Failure timestamps for one address, oldest first.
#[derive(Debug, Clone, Default)]
struct AddressWindow {
    timestamps: VecDeque<DateTime<Utc>>,
}

impl AddressWindow {
    /// Append a timestamp, clamped so the sequence stays non-decreasing
    /// when the wall clock steps backwards.
    fn push(&mut self, now: DateTime<Utc>) {
        let at = match self.timestamps.back() {
            Some(&last) if last > now => last,
            _ => now,
        };
        self.timestamps.push_back(at);
    }

    /// Drop entries with `now - t > window`.
    fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        while let Some(&oldest) = self.timestamps.front() {
            if now - oldest > window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn count_within(&self, now: DateTime<Utc>, window: Duration) -> usize {
        self.timestamps
            .iter()
            .filter(|&&t| now - t <= window)
            .count()
    }

    fn count(&self) -> usize {
        self.timestamps.len()
    }

    fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Per-address sliding window counter.
///
/// All state sits behind one mutex, so `record_and_count` and `sweep` are
/// linearizable with respect to each other for every address.
pub struct WindowTracker {
    windows: Mutex<HashMap<String, AddressWindow>>,
    window_seconds: i64,
    threshold: usize,
}

impl WindowTracker {
    /// `window_seconds` is clamped to `1..=MAX_WINDOW_SECONDS`.
    pub fn new(window_seconds: i64, threshold: usize) -> Self {
        let window_seconds = window_seconds.clamp(1, MAX_WINDOW_SECONDS);
        WindowTracker {
            windows: Mutex::new(HashMap::new()),
            window_seconds,
            threshold,
        }
    }

    pub fn window_seconds(&self) -> i64 {
        self.window_seconds
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    fn window(&self) -> Duration {
        Duration::seconds(self.window_seconds)
    }

    /// Record a failure for `address` at `now` and return the number of
    /// failures still inside the window, this one included.
    pub fn record_and_count(&self, address: &str, now: DateTime<Utc>) -> usize {
        let window = self.window();
        let mut windows = self.windows.lock();

        let entry = windows.entry(address.to_string()).or_default();
        entry.push(now);
        entry.prune(now, window);
        entry.count()
    }

    /// Failures for `address` inside the window ending at `now`, without
    /// recording anything.
    pub fn count(&self, address: &str, now: DateTime<Utc>) -> usize {
        self.windows
            .lock()
            .get(address)
            .map(|w| w.count_within(now, self.window()))
            .unwrap_or(0)
    }

    /// Prune every address and forget those left with no failures.
    /// Returns how many addresses were dropped.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let window = self.window();
        let mut windows = self.windows.lock();
        let before = windows.len();

        windows.retain(|_, entry| {
            entry.prune(now, window);
            !entry.is_empty()
        });

        before - windows.len()
    }

    /// Number of addresses currently holding at least one failure.
    pub fn tracked_addresses(&self) -> usize {
        self.windows.lock().len()
    }
}
