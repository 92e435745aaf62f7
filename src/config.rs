use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_THRESHOLD: usize = 5;
pub const DEFAULT_WINDOW_SECONDS: i64 = 60;
/// Longest accepted sliding window, one year
pub const MAX_WINDOW_SECONDS: i64 = 365 * 24 * 3600;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Could not serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Configuration for the login guard daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub monitor: MonitorConfig,
    pub detection: DetectionConfig,
    pub defense: DefenseConfig,
    pub geoip: GeoIpConfig,
    pub alerting: AlertConfig,
    pub output: OutputConfig,
}

/// Log source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Auth log to follow
    pub log_file: PathBuf,
    /// Host identifier in alerts; the machine hostname when unset
    pub host: Option<String>,
    /// Idle poll interval of the log follower
    pub poll_interval_ms: u64,
    /// How long the log file may be missing before monitoring stops
    pub missing_grace_secs: u64,
    /// Period of the bulk expiry pass over tracked addresses
    pub sweep_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            log_file: PathBuf::from("/var/log/auth.log"),
            host: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            missing_grace_secs: 30,
            sweep_interval_secs: 60,
        }
    }
}

/// Brute force rule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Failures per address within the window that count as brute force
    pub threshold: usize,
    /// Sliding window length in seconds
    pub window_seconds: i64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        DetectionConfig {
            threshold: DEFAULT_THRESHOLD,
            window_seconds: DEFAULT_WINDOW_SECONDS,
        }
    }
}

/// Active defense configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefenseConfig {
    pub active_defense: bool,
    /// Firewall backends in priority order: "ufw", "iptables"
    pub backends: Vec<String>,
    pub command_timeout_secs: u64,
}

impl Default for DefenseConfig {
    fn default() -> Self {
        DefenseConfig {
            active_defense: false,
            backends: vec!["ufw".to_string(), "iptables".to_string()],
            command_timeout_secs: 10,
        }
    }
}

/// GeoIP enrichment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoIpConfig {
    pub enabled: bool,
    /// "ip-api" or "maxmind"
    pub provider: String,
    pub endpoint: String,
    /// GeoLite2-City database for the "maxmind" provider
    pub database: Option<PathBuf>,
    pub timeout_secs: u64,
}

impl Default for GeoIpConfig {
    fn default() -> Self {
        GeoIpConfig {
            enabled: true,
            provider: "ip-api".to_string(),
            endpoint: crate::geolocation::IpApiLookup::DEFAULT_ENDPOINT.to_string(),
            database: None,
            timeout_secs: 5,
        }
    }
}

/// Notification channels
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub send_timeout_secs: u64,
    pub telegram: Option<TelegramConfig>,
    pub email: Option<EmailConfig>,
    pub sms: Option<SmsConfig>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        AlertConfig {
            send_timeout_secs: 10,
            telegram: None,
            email: None,
            sms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

/// SMTP account and recipient. The account is shared with the SMS channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    /// Sender address; the username when unset
    pub from: Option<String>,
    pub recipient: String,
}

fn default_smtp_host() -> String {
    "smtp.gmail.com".to_string()
}

fn default_smtp_port() -> u16 {
    465
}

/// Email-to-SMS gateway address, e.g. `5551234567@vtext.com`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    pub gateway_address: String,
}

/// Alert journal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// "json", "jsonl" or "console"
    pub format: String,
    /// Journal file; no journal when unset
    pub journal: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            format: "jsonl".to_string(),
            journal: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Defaults, then the config file if present, then process environment
    /// (including a `.env` file). Never fails: unreadable or invalid input
    /// is reported and replaced by defaults.
    pub fn load(path: &Path) -> Self {
        let mut config = if path.exists() {
            match Config::from_file(path) {
                Ok(config) => config,
                Err(e) => {
                    log::warn!("Ignoring config file {:?}: {}. Using defaults.", path, e);
                    Config::default()
                }
            }
        } else {
            log::warn!("Config file {:?} not found, using defaults", path);
            Config::default()
        };

        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                log::warn!("Could not read .env file: {}", e);
            }
        }

        config.apply_env(|key| std::env::var(key).ok());
        config.sanitize();
        config
    }

    /// Apply environment overrides. `lookup` returns the value of a variable.
    ///
    /// Supported variables:
    /// - LOG_FILE_PATH, LOGIN_GUARD_HOST
    /// - BRUTE_FORCE_THRESHOLD, TIME_WINDOW, ENABLE_ACTIVE_DEFENSE
    /// - TELEGRAM_BOT_TOKEN, TELEGRAM_CHAT_ID
    /// - GMAIL_USER, GMAIL_APP_PASSWORD, ALERT_RECIPIENT_EMAIL
    /// - SMS_GATEWAY_EMAIL
    /// - GEOIP_DATABASE
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("LOG_FILE_PATH") {
            self.monitor.log_file = PathBuf::from(v);
        }
        if let Some(v) = lookup("LOGIN_GUARD_HOST") {
            self.monitor.host = Some(v);
        }

        if let Some(v) = lookup("BRUTE_FORCE_THRESHOLD") {
            match v.trim().parse::<usize>() {
                Ok(threshold) => self.detection.threshold = threshold,
                Err(_) => {
                    log::warn!(
                        "Invalid BRUTE_FORCE_THRESHOLD {:?}, using default {}",
                        v,
                        DEFAULT_THRESHOLD
                    );
                    self.detection.threshold = DEFAULT_THRESHOLD;
                }
            }
        }
        if let Some(v) = lookup("TIME_WINDOW") {
            match v.trim().parse::<i64>() {
                Ok(window) => self.detection.window_seconds = window,
                Err(_) => {
                    log::warn!(
                        "Invalid TIME_WINDOW {:?}, using default {}",
                        v,
                        DEFAULT_WINDOW_SECONDS
                    );
                    self.detection.window_seconds = DEFAULT_WINDOW_SECONDS;
                }
            }
        }
        if let Some(v) = lookup("ENABLE_ACTIVE_DEFENSE") {
            self.defense.active_defense = v.trim().eq_ignore_ascii_case("true");
        }

        match (lookup("TELEGRAM_BOT_TOKEN"), lookup("TELEGRAM_CHAT_ID")) {
            (Some(bot_token), Some(chat_id)) => {
                self.alerting.telegram = Some(TelegramConfig { bot_token, chat_id });
            }
            (Some(_), None) | (None, Some(_)) => {
                log::warn!("Telegram needs both TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID");
            }
            (None, None) => {}
        }

        match (
            lookup("GMAIL_USER"),
            lookup("GMAIL_APP_PASSWORD"),
            lookup("ALERT_RECIPIENT_EMAIL"),
        ) {
            (Some(username), Some(password), Some(recipient)) => {
                self.alerting.email = Some(EmailConfig {
                    smtp_host: default_smtp_host(),
                    smtp_port: default_smtp_port(),
                    username,
                    password,
                    from: None,
                    recipient,
                });
            }
            (None, None, None) => {}
            _ => log::warn!(
                "Email needs GMAIL_USER, GMAIL_APP_PASSWORD and ALERT_RECIPIENT_EMAIL"
            ),
        }

        if let Some(gateway_address) = lookup("SMS_GATEWAY_EMAIL") {
            self.alerting.sms = Some(SmsConfig { gateway_address });
        }

        if let Some(v) = lookup("GEOIP_DATABASE") {
            self.geoip.provider = "maxmind".to_string();
            self.geoip.database = Some(PathBuf::from(v));
        }
    }

    /// Replace out-of-range numbers with their defaults.
    pub fn sanitize(&mut self) {
        if self.detection.threshold == 0 {
            log::warn!("Threshold must be positive, using default {}", DEFAULT_THRESHOLD);
            self.detection.threshold = DEFAULT_THRESHOLD;
        }
        if !(1..=MAX_WINDOW_SECONDS).contains(&self.detection.window_seconds) {
            log::warn!(
                "Time window must be between 1s and {}s, using default {}s",
                MAX_WINDOW_SECONDS,
                DEFAULT_WINDOW_SECONDS
            );
            self.detection.window_seconds = DEFAULT_WINDOW_SECONDS;
        }
        if self.monitor.poll_interval_ms == 0 {
            self.monitor.poll_interval_ms = DEFAULT_POLL_INTERVAL_MS;
        }
        if self.monitor.sweep_interval_secs == 0 {
            self.monitor.sweep_interval_secs = MonitorConfig::default().sweep_interval_secs;
        }

        // A zero timeout would fail every call it guards
        if self.alerting.send_timeout_secs == 0 {
            let default = AlertConfig::default().send_timeout_secs;
            log::warn!("Alert send timeout must be positive, using default {}s", default);
            self.alerting.send_timeout_secs = default;
        }
        if self.geoip.timeout_secs == 0 {
            let default = GeoIpConfig::default().timeout_secs;
            log::warn!("GeoIP timeout must be positive, using default {}s", default);
            self.geoip.timeout_secs = default;
        }
        if self.defense.command_timeout_secs == 0 {
            let default = DefenseConfig::default().command_timeout_secs;
            log::warn!("Firewall command timeout must be positive, using default {}s", default);
            self.defense.command_timeout_secs = default;
        }
    }

    /// Copy with credentials masked, for display.
    pub fn redacted(&self) -> Config {
        const MASK: &str = "********";
        let mut config = self.clone();
        if let Some(telegram) = &mut config.alerting.telegram {
            telegram.bot_token = MASK.to_string();
        }
        if let Some(email) = &mut config.alerting.email {
            email.password = MASK.to_string();
        }
        config
    }

    /// Host identifier used in alerts
    pub fn host_identifier(&self) -> String {
        if let Some(host) = &self.monitor.host {
            return host.clone();
        }

        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.detection.threshold, 5);
        assert_eq!(config.detection.window_seconds, 60);
        assert!(!config.defense.active_defense);
        assert_eq!(config.monitor.log_file, PathBuf::from("/var/log/auth.log"));
        assert_eq!(config.defense.backends, vec!["ufw", "iptables"]);
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [detection]
            threshold = 3

            [defense]
            active_defense = true
            "#,
        )
        .unwrap();

        assert_eq!(config.detection.threshold, 3);
        assert_eq!(config.detection.window_seconds, 60);
        assert!(config.defense.active_defense);
        assert_eq!(config.alerting.send_timeout_secs, 10);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("LOG_FILE_PATH", "/tmp/auth.log"),
            ("BRUTE_FORCE_THRESHOLD", "8"),
            ("TIME_WINDOW", "120"),
            ("ENABLE_ACTIVE_DEFENSE", "TRUE"),
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("TELEGRAM_CHAT_ID", "42"),
            ("GMAIL_USER", "guard@gmail.com"),
            ("GMAIL_APP_PASSWORD", "secret"),
            ("ALERT_RECIPIENT_EMAIL", "ops@example.com"),
        ]));

        assert_eq!(config.monitor.log_file, PathBuf::from("/tmp/auth.log"));
        assert_eq!(config.detection.threshold, 8);
        assert_eq!(config.detection.window_seconds, 120);
        assert!(config.defense.active_defense);
        assert_eq!(config.alerting.telegram.unwrap().chat_id, "42");
        let email = config.alerting.email.unwrap();
        assert_eq!(email.smtp_host, "smtp.gmail.com");
        assert_eq!(email.smtp_port, 465);
        assert_eq!(email.recipient, "ops@example.com");
        assert!(config.alerting.sms.is_none());
    }

    #[test]
    fn test_invalid_numbers_fall_back_to_defaults() {
        let mut config = Config::default();
        config.detection.threshold = 9;
        config.apply_env(env(&[("BRUTE_FORCE_THRESHOLD", "five"), ("TIME_WINDOW", "1m")]));

        assert_eq!(config.detection.threshold, DEFAULT_THRESHOLD);
        assert_eq!(config.detection.window_seconds, DEFAULT_WINDOW_SECONDS);
    }

    #[test]
    fn test_sanitize_out_of_range() {
        let mut config = Config::default();
        config.detection.threshold = 0;
        config.detection.window_seconds = -5;
        config.monitor.poll_interval_ms = 0;
        config.alerting.send_timeout_secs = 0;
        config.geoip.timeout_secs = 0;
        config.defense.command_timeout_secs = 0;
        config.sanitize();

        assert_eq!(config.detection.threshold, DEFAULT_THRESHOLD);
        assert_eq!(config.detection.window_seconds, DEFAULT_WINDOW_SECONDS);
        assert_eq!(config.monitor.poll_interval_ms, 500);
        assert_eq!(config.alerting.send_timeout_secs, 10);
        assert_eq!(config.geoip.timeout_secs, 5);
        assert_eq!(config.defense.command_timeout_secs, 10);
    }

    #[test]
    fn test_zero_timeouts_from_file_are_replaced() {
        let mut config: Config = toml::from_str(
            r#"
            [alerting]
            send_timeout_secs = 0

            [geoip]
            timeout_secs = 0
            "#,
        )
        .unwrap();
        config.sanitize();

        assert_eq!(config.alerting.send_timeout_secs, 10);
        assert_eq!(config.geoip.timeout_secs, 5);
    }

    #[test]
    fn test_oversized_window_falls_back_to_default() {
        let mut config = Config::default();
        config.apply_env(env(&[("TIME_WINDOW", "10000000000000000")]));
        assert_eq!(config.detection.window_seconds, 10_000_000_000_000_000);
        config.sanitize();
        assert_eq!(config.detection.window_seconds, DEFAULT_WINDOW_SECONDS);

        config.detection.window_seconds = MAX_WINDOW_SECONDS;
        config.sanitize();
        assert_eq!(config.detection.window_seconds, MAX_WINDOW_SECONDS);

        let tracker = crate::detection::WindowTracker::new(
            config.detection.window_seconds,
            config.detection.threshold,
        );
        assert_eq!(tracker.record_and_count("203.0.113.7", chrono::Utc::now()), 1);
    }

    #[test]
    fn test_redacted_masks_credentials() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("TELEGRAM_BOT_TOKEN", "123:secret-token"),
            ("TELEGRAM_CHAT_ID", "42"),
            ("GMAIL_USER", "guard@gmail.com"),
            ("GMAIL_APP_PASSWORD", "app-password"),
            ("ALERT_RECIPIENT_EMAIL", "ops@example.com"),
        ]));

        let shown = toml::to_string_pretty(&config.redacted()).unwrap();
        assert!(!shown.contains("secret-token"));
        assert!(!shown.contains("app-password"));
        assert!(shown.contains("guard@gmail.com"));
        assert!(shown.contains("\"42\""));

        // The original keeps its credentials
        assert_eq!(config.alerting.email.unwrap().password, "app-password");
    }

    #[test]
    fn test_incomplete_channels_are_not_enabled() {
        let mut config = Config::default();
        config.apply_env(env(&[("TELEGRAM_BOT_TOKEN", "123:abc"), ("GMAIL_USER", "guard@gmail.com")]));

        assert!(config.alerting.telegram.is_none());
        assert!(config.alerting.email.is_none());
    }

    #[test]
    fn test_geoip_database_selects_maxmind() {
        let mut config = Config::default();
        config.apply_env(env(&[("GEOIP_DATABASE", "/usr/share/GeoIP/GeoLite2-City.mmdb")]));
        assert_eq!(config.geoip.provider, "maxmind");
        assert!(config.geoip.database.is_some());
    }

    #[test]
    fn test_explicit_host() {
        let mut config = Config::default();
        config.apply_env(env(&[("LOGIN_GUARD_HOST", "bastion-1")]));
        assert_eq!(config.host_identifier(), "bastion-1");
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("login-guard.toml");

        let mut config = Config::default();
        config.detection.threshold = 7;
        config.alerting.sms = Some(SmsConfig {
            gateway_address: "5551234567@vtext.com".to_string(),
        });
        config.to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.detection.threshold, 7);
        assert_eq!(loaded.alerting.sms.unwrap().gateway_address, "5551234567@vtext.com");
    }
}
