use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A failed login extracted from one auth log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginFailureEvent {
    pub user: String,
    pub source_address: String,
    pub protocol: Option<String>,
    pub observed_at: DateTime<Utc>,
}

/// Approximate location data for a source address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub country: String,
    pub city: String,
    pub isp: String,
}

impl GeoInfo {
    /// Placeholder for private, loopback and link-local ranges. These are
    /// never sent to a lookup provider.
    pub fn private() -> Self {
        GeoInfo {
            country: "Private IP".to_string(),
            city: "Local Network".to_string(),
            isp: "Unknown".to_string(),
        }
    }

    /// Placeholder used when a lookup fails or times out.
    pub fn unknown() -> Self {
        GeoInfo {
            country: "Unknown".to_string(),
            city: "Unknown".to_string(),
            isp: "Unknown".to_string(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        *self == GeoInfo::unknown()
    }
}

/// Result of a block decision for one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockOutcome {
    Skipped,
    AlreadyBlocked,
    Blocked,
    Failed,
}

/// Banner class of an alert. Selected purely from the failure count
/// relative to the brute-force threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// First crossing: `count == threshold`.
    BruteForceDetected,
    /// Still going after the first crossing: `count > threshold`.
    OngoingAttack,
    /// Below threshold, informational.
    UnauthorizedAttempt,
}

impl AlertSeverity {
    pub fn classify(count: usize, threshold: usize) -> Self {
        if count == threshold {
            AlertSeverity::BruteForceDetected
        } else if count > threshold {
            AlertSeverity::OngoingAttack
        } else {
            AlertSeverity::UnauthorizedAttempt
        }
    }

    pub fn is_brute_force(&self) -> bool {
        !matches!(self, AlertSeverity::UnauthorizedAttempt)
    }
}

/// Structured alert handed to every notification transport and the journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub severity: AlertSeverity,
    pub host: String,
    pub user: String,
    pub address: String,
    pub protocol: Option<String>,
    pub geo: GeoInfo,
    pub timestamp: DateTime<Utc>,
    pub count: usize,
    pub window_seconds: i64,
    /// `None` when no block decision was taken for this event.
    pub block_outcome: Option<BlockOutcome>,
}
