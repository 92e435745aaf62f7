//! Auth log line classification
//!
//! Maps a raw auth log line to a [`LoginFailureEvent`] when it records a
//! failed login. Patterns are tried in order and the first match wins, so
//! overlapping patterns are listed most specific first.

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::models::LoginFailureEvent;

const PATTERNS: &[(&str, &str)] = &[
    (
        "ssh_invalid_user",
        r"Failed password for invalid user (?P<user>\S+) from (?P<addr>\S+) port \d+ (?P<proto>\S+)",
    ),
    (
        "ssh_failed_password",
        r"Failed password for (?P<user>\S+) from (?P<addr>\S+) port \d+ (?P<proto>\S+)",
    ),
    // pam_unix writes `rhost=` before `user=`, other PAM modules the reverse
    (
        "pam_auth_failure",
        r"authentication failure;.*\brhost=(?P<addr>\S+).*\buser=(?P<user>\S+)",
    ),
    (
        "pam_auth_failure_user_first",
        r"authentication failure;.*\buser=(?P<user>\S+).*\brhost=(?P<addr>\S+)",
    ),
];

struct Pattern {
    name: &'static str,
    regex: Regex,
}

/// Stateless classifier for failed-login lines.
pub struct LineClassifier {
    patterns: Vec<Pattern>,
}

impl LineClassifier {
    pub fn new() -> Result<Self, regex::Error> {
        let patterns = PATTERNS
            .iter()
            .map(|&(name, source)| {
                Ok(Pattern {
                    name,
                    regex: Regex::new(source)?,
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;

        Ok(LineClassifier { patterns })
    }

    /// Classify a line, stamping the event with the current time.
    pub fn classify(&self, line: &str) -> Option<LoginFailureEvent> {
        self.classify_at(line, Utc::now())
    }

    /// Classify a line with an explicit observation time.
    pub fn classify_at(&self, line: &str, observed_at: DateTime<Utc>) -> Option<LoginFailureEvent> {
        let line = line.trim_end_matches(['\r', '\n']);

        self.patterns.iter().find_map(|pattern| {
            let caps = pattern.regex.captures(line)?;
            let user = caps.name("user")?.as_str();
            let addr = caps.name("addr")?.as_str();
            log::trace!("Line matched pattern {}", pattern.name);

            Some(LoginFailureEvent {
                user: user.to_string(),
                source_address: addr.to_string(),
                protocol: caps.name("proto").map(|m| m.as_str().to_string()),
                observed_at,
            })
        })
    }
}
