//! Alert text rendering for chat (Telegram Markdown) and mail/SMS (plain).

use crate::models::{AlertRecord, AlertSeverity, BlockOutcome};

const RULE: &str = "━━━━━━━━━━━━━━━━━━";

/// Headline for an alert, chosen from its severity.
pub fn banner(alert: &AlertRecord) -> String {
    match alert.severity {
        AlertSeverity::BruteForceDetected => "BRUTE FORCE DETECTED".to_string(),
        AlertSeverity::OngoingAttack => format!("ONGOING ATTACK ({} attempts)", alert.count),
        AlertSeverity::UnauthorizedAttempt => "Unauthorized Login Attempt".to_string(),
    }
}

pub fn subject(alert: &AlertRecord) -> String {
    format!("Login Guard: {}", banner(alert))
}

fn block_line(outcome: Option<BlockOutcome>) -> Option<&'static str> {
    match outcome? {
        BlockOutcome::Blocked => Some("ACTION TAKEN: IP has been BLOCKED."),
        BlockOutcome::Failed => Some("ACTION FAILED: Could not block IP (Check permissions)."),
        BlockOutcome::AlreadyBlocked => Some("IP was already blocked."),
        BlockOutcome::Skipped => None,
    }
}

fn escape_markdown(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '_' | '*' | '`' | '[') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Code spans cannot contain a backtick in Telegram's legacy Markdown.
fn code(value: &str) -> String {
    format!("`{}`", value.replace('`', "'"))
}

pub fn render_markdown(alert: &AlertRecord) -> String {
    let icon = if alert.severity.is_brute_force() { "🚨" } else { "⚠️" };
    let mut lines = vec![
        format!("{} *{}*", icon, banner(alert)),
        RULE.to_string(),
        format!("*Host:* {}", code(&alert.host)),
        format!("*User:* {}", code(&alert.user)),
        format!("*Source IP:* {}", code(&alert.address)),
        format!(
            "*Location:* {}, {}",
            escape_markdown(&alert.geo.country),
            escape_markdown(&alert.geo.city)
        ),
        format!("*ISP:* {}", escape_markdown(&alert.geo.isp)),
        format!("*Time:* {}", code(&alert.timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string())),
        format!("*Attempts:* {} / {}s", code(&alert.count.to_string()), alert.window_seconds),
    ];

    if let Some(line) = block_line(alert.block_outcome) {
        match line.split_once(": ") {
            Some((head, tail)) => lines.push(format!("*{}:* {}", head, tail)),
            None => lines.push(line.to_string()),
        }
    }
    lines.push(RULE.to_string());

    lines.join("\n")
}

pub fn render_plain(alert: &AlertRecord) -> String {
    let mut lines = vec![
        banner(alert),
        RULE.to_string(),
        format!("Host: {}", alert.host),
        format!("User: {}", alert.user),
        format!("Source IP: {}", alert.address),
        format!("Location: {}, {}", alert.geo.country, alert.geo.city),
        format!("ISP: {}", alert.geo.isp),
        format!("Time: {}", alert.timestamp.format("%Y-%m-%d %H:%M:%S UTC")),
        format!("Attempts: {} / {}s", alert.count, alert.window_seconds),
    ];

    if let Some(line) = block_line(alert.block_outcome) {
        lines.push(line.to_string());
    }
    lines.push(RULE.to_string());

    lines.join("\n")
}
