//! Alerting module for multi-channel notifications
//!
//! Every alert is handed to each configured [`Notifier`] on its own tokio
//! task, bounded by a send timeout. A slow or failing channel never delays
//! the other channels or the ingestion loop; failures are logged per
//! channel and otherwise dropped.

pub mod format;
pub mod transports;

pub use transports::{EmailNotifier, SmtpSettings, TelegramNotifier};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinSet;

use crate::models::AlertRecord;

/// Errors that can occur during alert delivery
#[derive(Error, Debug)]
pub enum AlertError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("Invalid mail address: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("Could not build message: {0}")]
    Message(#[from] lettre::error::Error),

    #[error("{channel} rejected the alert ({status}): {body}")]
    Rejected {
        channel: String,
        status: u16,
        body: String,
    },
}

/// Which rendering of an alert a channel wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFormat {
    Markdown,
    Plain,
}

/// One outgoing notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn channel(&self) -> &str;

    fn body_format(&self) -> BodyFormat {
        BodyFormat::Plain
    }

    async fn send(&self, subject: &str, body: &str) -> Result<(), AlertError>;
}

/// Fans alerts out to every configured channel.
pub struct AlertDispatcher {
    notifiers: Vec<Arc<dyn Notifier>>,
    send_timeout: Duration,
    in_flight: Mutex<JoinSet<()>>,
}

impl AlertDispatcher {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>, send_timeout: Duration) -> Self {
        AlertDispatcher {
            notifiers,
            send_timeout,
            in_flight: Mutex::new(JoinSet::new()),
        }
    }

    pub fn channels(&self) -> Vec<String> {
        self.notifiers.iter().map(|n| n.channel().to_string()).collect()
    }

    /// Spawn one send task per channel and return immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&self, alert: &AlertRecord) {
        if self.notifiers.is_empty() {
            return;
        }

        let subject: Arc<str> = format::subject(alert).into();
        let markdown: Arc<str> = format::render_markdown(alert).into();
        let plain: Arc<str> = format::render_plain(alert).into();

        let mut in_flight = self.in_flight.lock();
        reap_finished(&mut in_flight);

        for notifier in &self.notifiers {
            let notifier = Arc::clone(notifier);
            let subject = Arc::clone(&subject);
            let body = match notifier.body_format() {
                BodyFormat::Markdown => Arc::clone(&markdown),
                BodyFormat::Plain => Arc::clone(&plain),
            };
            let send_timeout = self.send_timeout;

            in_flight.spawn(async move {
                let channel = notifier.channel();
                match tokio::time::timeout(send_timeout, notifier.send(&subject, &body)).await {
                    Ok(Ok(())) => log::debug!("Alert delivered via {}", channel),
                    Ok(Err(e)) => log::error!("{} alert failed: {}", channel, e),
                    Err(_) => log::error!(
                        "{} alert timed out after {}s",
                        channel,
                        send_timeout.as_secs()
                    ),
                }
            });
        }
    }

    /// Number of send tasks not yet reaped.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Wait for every in-flight send to finish.
    pub async fn flush(&self) {
        let mut tasks = std::mem::take(&mut *self.in_flight.lock());
        while let Some(result) = tasks.join_next().await {
            log_join_error(result);
        }
    }

    /// Give in-flight sends up to `grace` to finish, then abort the rest.
    pub async fn shutdown(&self, grace: Duration) {
        let mut tasks = std::mem::take(&mut *self.in_flight.lock());
        if tasks.is_empty() {
            return;
        }

        log::info!("Waiting for {} pending alert(s)", tasks.len());
        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = tasks.join_next().await {
                log_join_error(result);
            }
        })
        .await;

        if drained.is_err() {
            log::warn!("Abandoning {} undelivered alert(s)", tasks.len());
            tasks.abort_all();
        }
    }
}

fn reap_finished(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        log_join_error(result);
    }
}

fn log_join_error(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            log::error!("Alert task panicked: {}", e);
        }
    }
}
