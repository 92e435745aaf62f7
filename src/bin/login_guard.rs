use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use login_guard::alerting::{AlertDispatcher, EmailNotifier, Notifier, SmtpSettings, TelegramNotifier};
use login_guard::config::{AlertConfig, Config, DefenseConfig, GeoIpConfig};
use login_guard::defense::{firewall, DefenseController, FirewallBackend};
use login_guard::detection::WindowTracker;
use login_guard::geolocation::{GeoIpCache, IpApiLookup, MaxMindLookup};
use login_guard::input::{FollowOptions, LineClassifier, LogFollower};
use login_guard::output::{OutputFormat, OutputHandler};
use login_guard::pipeline::EventDispatcher;

/// Login guard daemon: follows the auth log until SIGINT/SIGTERM
fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("login-guard.toml"));
    let config = Config::load(&config_path);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal, gracefully stopping...");
        let _ = shutdown_tx.send(true);
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(config, shutdown_rx))
}

async fn run(config: Config, shutdown: watch::Receiver<bool>) -> Result<(), Box<dyn std::error::Error>> {
    let host = config.host_identifier();

    let journal = match &config.output.journal {
        Some(path) => Some(OutputHandler::new(
            OutputFormat::parse(&config.output.format),
            Some(path.clone()),
        )?),
        None => None,
    };

    let notifiers = build_notifiers(&config.alerting);
    let alerts = AlertDispatcher::new(
        notifiers,
        Duration::from_secs(config.alerting.send_timeout_secs),
    );

    let tracker = WindowTracker::new(config.detection.window_seconds, config.detection.threshold);
    let defense = DefenseController::new(config.detection.threshold, build_backends(&config.defense));

    let follower = LogFollower::open(
        &config.monitor.log_file,
        FollowOptions {
            poll_interval: Duration::from_millis(config.monitor.poll_interval_ms),
            missing_grace: Duration::from_secs(config.monitor.missing_grace_secs),
        },
        shutdown,
    )
    .await?;

    log::info!("Login guard starting on {}", host);
    log::info!("Monitoring log file: {:?}", follower.path());
    log::info!(
        "Brute force rule: {} failures within {}s",
        config.detection.threshold,
        config.detection.window_seconds
    );
    log::info!(
        "Active defense: {}",
        if config.defense.active_defense { "ENABLED" } else { "disabled" }
    );
    log::info!("Alert channels: {:?}", alerts.channels());

    let mut dispatcher = EventDispatcher::new(
        Arc::new(LineClassifier::new()?),
        Arc::new(tracker),
        Arc::new(defense),
        Arc::new(build_geo(&config.geoip)),
        Arc::new(alerts),
        host,
        config.defense.active_defense,
    )
    .with_sweep_interval(Duration::from_secs(config.monitor.sweep_interval_secs))
    .with_shutdown_grace(Duration::from_secs(config.alerting.send_timeout_secs));
    if let Some(journal) = journal {
        dispatcher = dispatcher.with_journal(journal);
    }

    log::info!("Daemon running. Press Ctrl+C to stop.");
    dispatcher.run(follower).await?;

    log::info!("Login guard stopped");
    Ok(())
}

fn build_backends(config: &DefenseConfig) -> Vec<Arc<dyn FirewallBackend>> {
    let timeout = Duration::from_secs(config.command_timeout_secs);
    config
        .backends
        .iter()
        .filter_map(|name| {
            let backend = firewall::backend_by_name(name, timeout);
            if backend.is_none() {
                log::warn!("Unknown firewall backend {:?}, ignoring", name);
            }
            backend
        })
        .collect()
}

fn build_geo(config: &GeoIpConfig) -> GeoIpCache {
    if !config.enabled {
        return GeoIpCache::disabled();
    }

    let timeout = Duration::from_secs(config.timeout_secs);
    match config.provider.as_str() {
        "maxmind" => {
            let Some(path) = &config.database else {
                log::warn!("GeoIP provider maxmind needs a database path, enrichment disabled");
                return GeoIpCache::disabled();
            };
            match MaxMindLookup::open(path) {
                Ok(lookup) => {
                    log::info!("GeoIP database loaded from {:?}", path);
                    GeoIpCache::new(Arc::new(lookup), timeout)
                }
                Err(e) => {
                    log::warn!("Could not load GeoIP database: {}. Enrichment disabled.", e);
                    GeoIpCache::disabled()
                }
            }
        }
        "ip-api" => match IpApiLookup::new(&config.endpoint, timeout) {
            Ok(lookup) => GeoIpCache::new(Arc::new(lookup), timeout),
            Err(e) => {
                log::warn!("Could not set up ip-api client: {}. Enrichment disabled.", e);
                GeoIpCache::disabled()
            }
        },
        other => {
            log::warn!("Unknown GeoIP provider {:?}, enrichment disabled", other);
            GeoIpCache::disabled()
        }
    }
}

fn build_notifiers(config: &AlertConfig) -> Vec<Arc<dyn Notifier>> {
    let timeout = Duration::from_secs(config.send_timeout_secs);
    let mut notifiers: Vec<Arc<dyn Notifier>> = Vec::new();

    if let Some(telegram) = &config.telegram {
        match TelegramNotifier::new(&telegram.bot_token, &telegram.chat_id, timeout) {
            Ok(notifier) => notifiers.push(Arc::new(notifier)),
            Err(e) => log::error!("Telegram channel disabled: {}", e),
        }
    }

    let smtp = config.email.as_ref().map(|email| SmtpSettings {
        host: email.smtp_host.clone(),
        port: email.smtp_port,
        username: email.username.clone(),
        password: email.password.clone(),
        from: email.from.clone().unwrap_or_else(|| email.username.clone()),
    });

    if let (Some(email), Some(settings)) = (&config.email, &smtp) {
        match EmailNotifier::new("email", settings, &email.recipient, timeout) {
            Ok(notifier) => notifiers.push(Arc::new(notifier)),
            Err(e) => log::error!("Email channel disabled: {}", e),
        }
    }

    if let Some(sms) = &config.sms {
        match &smtp {
            Some(settings) => match EmailNotifier::sms_gateway(settings, &sms.gateway_address, timeout) {
                Ok(notifier) => notifiers.push(Arc::new(notifier)),
                Err(e) => log::error!("SMS channel disabled: {}", e),
            },
            None => log::warn!("SMS gateway configured without SMTP credentials, SMS disabled"),
        }
    }

    if notifiers.is_empty() {
        log::warn!("No alert channel configured; alerts go to the log only");
    }
    notifiers
}
