//! Event pipeline: classified auth log lines in, alerts and blocks out.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::alerting::{format, AlertDispatcher};
use crate::defense::DefenseController;
use crate::detection::WindowTracker;
use crate::geolocation::GeoIpCache;
use crate::input::{LineClassifier, LogFollower, TailError};
use crate::models::{AlertRecord, AlertSeverity, LoginFailureEvent};
use crate::output::OutputHandler;

const LINE_QUEUE_CAPACITY: usize = 1024;

/// Composes classification, window counting, active defense, enrichment and
/// notification for every failed login.
pub struct EventDispatcher {
    classifier: Arc<LineClassifier>,
    tracker: Arc<WindowTracker>,
    defense: Arc<DefenseController>,
    geo: Arc<GeoIpCache>,
    alerts: Arc<AlertDispatcher>,
    journal: Option<Mutex<OutputHandler>>,
    host: String,
    active_defense: bool,
    sweep_interval: Duration,
    shutdown_grace: Duration,
}

impl EventDispatcher {
    pub fn new(
        classifier: Arc<LineClassifier>,
        tracker: Arc<WindowTracker>,
        defense: Arc<DefenseController>,
        geo: Arc<GeoIpCache>,
        alerts: Arc<AlertDispatcher>,
        host: impl Into<String>,
        active_defense: bool,
    ) -> Self {
        EventDispatcher {
            classifier,
            tracker,
            defense,
            geo,
            alerts,
            journal: None,
            host: host.into(),
            active_defense,
            sweep_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(10),
        }
    }

    /// Append every alert to `journal`.
    pub fn with_journal(mut self, journal: OutputHandler) -> Self {
        self.journal = Some(Mutex::new(journal));
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// How long in-flight notifications may run once the loop has stopped.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Classify a raw line and handle it if it is a failed login.
    pub async fn handle_line(&self, line: &str) -> Option<AlertRecord> {
        match self.classifier.classify(line) {
            Some(event) => Some(self.handle_event(event).await),
            None => {
                log::trace!("Ignoring line: {}", line);
                None
            }
        }
    }

    /// Count, maybe block, enrich and notify for one failed login.
    pub async fn handle_event(&self, event: LoginFailureEvent) -> AlertRecord {
        let address = event.source_address;
        let threshold = self.tracker.threshold();

        let count = self.tracker.record_and_count(&address, event.observed_at);
        let severity = AlertSeverity::classify(count, threshold);

        let block_outcome = if severity.is_brute_force() && self.active_defense {
            Some(self.defense.maybe_block(&address, count, true).await)
        } else {
            None
        };

        let geo = self.geo.lookup(&address).await;

        let alert = AlertRecord {
            severity,
            host: self.host.clone(),
            user: event.user,
            address,
            protocol: event.protocol,
            geo,
            timestamp: event.observed_at,
            count,
            window_seconds: self.tracker.window_seconds(),
            block_outcome,
        };

        log::warn!(
            "{}: user {} from {} ({}/{} in {}s)",
            format::banner(&alert),
            alert.user,
            alert.address,
            alert.count,
            threshold,
            alert.window_seconds
        );

        if let Some(journal) = &self.journal {
            if let Err(e) = journal.lock().write_alert(&alert) {
                log::error!("Failed to write alert journal: {}", e);
            }
        }

        self.alerts.dispatch(&alert);
        alert
    }

    /// Process lines from `follower` in arrival order until it stops.
    ///
    /// The tracker is swept on a fixed interval alongside. Returns the
    /// follower's terminal error, if any, after pending notifications have
    /// had their grace period.
    pub async fn run(&self, follower: LogFollower) -> Result<(), TailError> {
        let (tx, mut rx) = mpsc::channel(LINE_QUEUE_CAPACITY);
        let tail = tokio::spawn(follower.run(tx));

        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                line = rx.recv() => match line {
                    Some(line) => {
                        self.handle_line(&line).await;
                    }
                    None => break,
                },
                _ = sweep.tick() => {
                    let removed = self.tracker.sweep(Utc::now());
                    if removed > 0 {
                        log::debug!(
                            "Expired {} idle address(es), {} still tracked",
                            removed,
                            self.tracker.tracked_addresses()
                        );
                    }
                }
            }
        }

        let result = match tail.await {
            Ok(result) => result,
            Err(e) => Err(TailError::Task(e.to_string())),
        };

        self.alerts.shutdown(self.shutdown_grace).await;
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.lock().flush() {
                log::error!("Failed to flush alert journal: {}", e);
            }
        }

        result
    }

    /// Wait for every in-flight notification.
    pub async fn flush(&self) {
        self.alerts.flush().await;
    }
}
