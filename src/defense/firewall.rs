//! Firewall backends that insert deny rules through system commands.

use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

/// Errors raised by a firewall backend
#[derive(Error, Debug)]
pub enum FirewallError {
    #[error("{0} is not installed")]
    Unavailable(String),

    #[error("{program} exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("{program} did not finish within {secs}s")]
    Timeout { program: String, secs: u64 },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A way of dropping traffic from an address at the host firewall.
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn insert_deny_rule(&self, address: IpAddr) -> Result<(), FirewallError>;
}

/// `ufw insert 1 deny from <addr> to any`
pub struct UfwBackend {
    timeout: Duration,
}

impl UfwBackend {
    pub fn new(timeout: Duration) -> Self {
        UfwBackend { timeout }
    }
}

#[async_trait]
impl FirewallBackend for UfwBackend {
    fn name(&self) -> &str {
        "ufw"
    }

    async fn insert_deny_rule(&self, address: IpAddr) -> Result<(), FirewallError> {
        let addr = address.to_string();
        run_command(
            "ufw",
            &["insert", "1", "deny", "from", &addr, "to", "any"],
            self.timeout,
        )
        .await
    }
}

/// `iptables -I INPUT -s <addr> -j DROP`, or `ip6tables` for IPv6 sources.
pub struct IptablesBackend {
    timeout: Duration,
}

impl IptablesBackend {
    pub fn new(timeout: Duration) -> Self {
        IptablesBackend { timeout }
    }
}

#[async_trait]
impl FirewallBackend for IptablesBackend {
    fn name(&self) -> &str {
        "iptables"
    }

    async fn insert_deny_rule(&self, address: IpAddr) -> Result<(), FirewallError> {
        let program = match address {
            IpAddr::V4(_) => "iptables",
            IpAddr::V6(_) => "ip6tables",
        };
        let addr = address.to_string();
        run_command(
            program,
            &["-I", "INPUT", "-s", &addr, "-j", "DROP"],
            self.timeout,
        )
        .await
    }
}

/// Build a backend from its configuration name.
pub fn backend_by_name(name: &str, timeout: Duration) -> Option<Arc<dyn FirewallBackend>> {
    match name.to_lowercase().as_str() {
        "ufw" => Some(Arc::new(UfwBackend::new(timeout))),
        "iptables" => Some(Arc::new(IptablesBackend::new(timeout))),
        _ => None,
    }
}

async fn run_command(program: &str, args: &[&str], timeout: Duration) -> Result<(), FirewallError> {
    let child = Command::new(program).args(args).kill_on_drop(true).output();

    let output = match tokio::time::timeout(timeout, child).await {
        Err(_) => {
            return Err(FirewallError::Timeout {
                program: program.to_string(),
                secs: timeout.as_secs(),
            })
        }
        Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => {
            return Err(FirewallError::Unavailable(program.to_string()))
        }
        Ok(result) => result?,
    };

    if output.status.success() {
        Ok(())
    } else {
        Err(FirewallError::CommandFailed {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
