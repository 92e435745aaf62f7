//! Active defense
//!
//! Decides whether a source address should be blocked, runs the block
//! through the configured firewall backends in priority order, and
//! remembers what has already been blocked so a rule is inserted at most
//! once per address.

pub mod firewall;

pub use firewall::{FirewallBackend, FirewallError, IptablesBackend, UfwBackend};

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::models::BlockOutcome;

/// Loopback, link-local and unspecified addresses, plus `localhost`.
/// These are never handed to a firewall backend.
pub fn is_reserved_address(address: &str) -> bool {
    if address.eq_ignore_ascii_case("localhost") {
        return true;
    }

    match address.parse::<IpAddr>() {
        Ok(ip) => is_reserved_ip(&ip),
        Err(_) => false,
    }
}

fn is_reserved_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_link_local() || v4.is_unspecified(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || v6
                    .to_ipv4_mapped()
                    .map(|v4| is_reserved_ip(&IpAddr::V4(v4)))
                    .unwrap_or(false)
        }
    }
}

/// Block decision and execution for brute-force sources.
pub struct DefenseController {
    threshold: usize,
    /// Tried in order; the first success wins
    backends: Vec<Arc<dyn FirewallBackend>>,
    blocked: Mutex<HashSet<IpAddr>>,
}

impl DefenseController {
    pub fn new(threshold: usize, backends: Vec<Arc<dyn FirewallBackend>>) -> Self {
        DefenseController {
            threshold,
            backends,
            blocked: Mutex::new(HashSet::new()),
        }
    }

    /// Block `address` if active defense is on and `count` has reached the
    /// threshold.
    ///
    /// The already-blocked check, the backend calls and the insertion into
    /// the blocked set all run under one lock, so concurrent calls for the
    /// same address insert at most one firewall rule. A failed attempt
    /// leaves the address unmarked so a later event can retry.
    pub async fn maybe_block(
        &self,
        address: &str,
        count: usize,
        active_defense_enabled: bool,
    ) -> BlockOutcome {
        if is_reserved_address(address) {
            log::warn!("Refusing to block reserved address {}", address);
            return BlockOutcome::Skipped;
        }

        if !active_defense_enabled || count < self.threshold {
            return BlockOutcome::Skipped;
        }

        let ip = match address.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => {
                log::warn!("Cannot block non-IP source {:?}", address);
                return BlockOutcome::Skipped;
            }
        };

        let mut blocked = self.blocked.lock().await;
        if blocked.contains(&ip) {
            log::debug!("{} is already blocked", ip);
            return BlockOutcome::AlreadyBlocked;
        }

        if self.backends.is_empty() {
            log::error!("No firewall backend configured, cannot block {}", ip);
            return BlockOutcome::Failed;
        }

        log::info!("Attempting to block {}", ip);
        for backend in &self.backends {
            match backend.insert_deny_rule(ip).await {
                Ok(()) => {
                    log::info!("Blocked {} using {}", ip, backend.name());
                    blocked.insert(ip);
                    return BlockOutcome::Blocked;
                }
                Err(FirewallError::Unavailable(program)) => {
                    log::debug!("Firewall backend {} unavailable ({})", backend.name(), program);
                }
                Err(e) => {
                    log::warn!("Failed to block {} with {}: {}", ip, backend.name(), e);
                }
            }
        }

        log::error!("Could not block {}: every firewall backend failed", ip);
        BlockOutcome::Failed
    }

    pub async fn is_blocked(&self, address: &str) -> bool {
        match address.parse::<IpAddr>() {
            Ok(ip) => self.blocked.lock().await.contains(&ip),
            Err(_) => false,
        }
    }

    pub async fn blocked_count(&self) -> usize {
        self.blocked.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct MockBackend {
        name: &'static str,
        succeed: bool,
        calls: AtomicUsize,
    }

    impl MockBackend {
        fn new(name: &'static str, succeed: bool) -> Arc<Self> {
            Arc::new(MockBackend {
                name,
                succeed,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FirewallBackend for MockBackend {
        fn name(&self) -> &str {
            self.name
        }

        async fn insert_deny_rule(&self, _address: IpAddr) -> Result<(), FirewallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            if self.succeed {
                Ok(())
            } else {
                Err(FirewallError::CommandFailed {
                    program: self.name.to_string(),
                    status: "exit status: 1".to_string(),
                    stderr: "ERROR: problem running".to_string(),
                })
            }
        }
    }

    #[tokio::test]
    async fn test_block_then_already_blocked() {
        let backend = MockBackend::new("primary", true);
        let controller = DefenseController::new(5, vec![backend.clone()]);

        assert_eq!(controller.maybe_block("203.0.113.7", 5, true).await, BlockOutcome::Blocked);
        assert_eq!(
            controller.maybe_block("203.0.113.7", 6, true).await,
            BlockOutcome::AlreadyBlocked
        );
        assert_eq!(backend.calls(), 1);
        assert!(controller.is_blocked("203.0.113.7").await);
    }

    #[tokio::test]
    async fn test_loopback_never_blocked() {
        let backend = MockBackend::new("primary", true);
        let controller = DefenseController::new(1, vec![backend.clone()]);

        for addr in ["127.0.0.1", "::1", "localhost", "::ffff:127.0.0.1", "169.254.10.1", "fe80::1"] {
            assert_eq!(controller.maybe_block(addr, 1000, true).await, BlockOutcome::Skipped);
        }
        assert_eq!(backend.calls(), 0);
        assert_eq!(controller.blocked_count().await, 0);
    }

    #[tokio::test]
    async fn test_skipped_below_threshold_or_disabled() {
        let backend = MockBackend::new("primary", true);
        let controller = DefenseController::new(5, vec![backend.clone()]);

        assert_eq!(controller.maybe_block("203.0.113.7", 4, true).await, BlockOutcome::Skipped);
        assert_eq!(controller.maybe_block("203.0.113.7", 50, false).await, BlockOutcome::Skipped);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_falls_back_in_priority_order() {
        let primary = MockBackend::new("ufw", false);
        let fallback = MockBackend::new("iptables", true);
        let controller = DefenseController::new(5, vec![primary.clone(), fallback.clone()]);

        assert_eq!(controller.maybe_block("198.51.100.2", 5, true).await, BlockOutcome::Blocked);
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test]
    async fn test_first_success_stops_the_chain() {
        let primary = MockBackend::new("ufw", true);
        let fallback = MockBackend::new("iptables", true);
        let controller = DefenseController::new(5, vec![primary.clone(), fallback.clone()]);

        assert_eq!(controller.maybe_block("198.51.100.2", 5, true).await, BlockOutcome::Blocked);
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn test_all_backends_failing_allows_retry() {
        let primary = MockBackend::new("ufw", false);
        let controller = DefenseController::new(5, vec![primary.clone()]);

        assert_eq!(controller.maybe_block("198.51.100.3", 5, true).await, BlockOutcome::Failed);
        assert!(!controller.is_blocked("198.51.100.3").await);
        assert_eq!(controller.maybe_block("198.51.100.3", 6, true).await, BlockOutcome::Failed);
        assert_eq!(primary.calls(), 2);
    }

    #[tokio::test]
    async fn test_no_backends_is_failed() {
        let controller = DefenseController::new(5, Vec::new());
        assert_eq!(controller.maybe_block("198.51.100.4", 5, true).await, BlockOutcome::Failed);
    }

    #[tokio::test]
    async fn test_hostname_source_is_skipped() {
        let backend = MockBackend::new("primary", true);
        let controller = DefenseController::new(5, vec![backend.clone()]);

        assert_eq!(
            controller.maybe_block("scanner.example.net", 9, true).await,
            BlockOutcome::Skipped
        );
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_insert_once() {
        let backend = MockBackend::new("primary", true);
        let controller = Arc::new(DefenseController::new(5, vec![backend.clone()]));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let controller = Arc::clone(&controller);
            handles.push(tokio::spawn(async move {
                controller.maybe_block("203.0.113.50", 7, true).await
            }));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap());
        }

        assert_eq!(outcomes.iter().filter(|o| **o == BlockOutcome::Blocked).count(), 1);
        assert_eq!(
            outcomes.iter().filter(|o| **o == BlockOutcome::AlreadyBlocked).count(),
            7
        );
        assert_eq!(backend.calls(), 1);
    }

    #[test]
    fn test_reserved_address_detection() {
        assert!(is_reserved_address("127.0.0.1"));
        assert!(is_reserved_address("127.8.9.10"));
        assert!(is_reserved_address("LOCALHOST"));
        assert!(is_reserved_address("0.0.0.0"));
        assert!(!is_reserved_address("192.168.1.100"));
        assert!(!is_reserved_address("203.0.113.7"));
        assert!(!is_reserved_address("2001:db8::1"));
        assert!(!is_reserved_address("not-an-address"));
    }
}
