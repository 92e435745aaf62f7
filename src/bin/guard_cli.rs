use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use structopt::StructOpt;

use login_guard::config::Config;
use login_guard::input::LineClassifier;

/// Login guard command line interface
#[derive(StructOpt, Debug)]
#[structopt(name = "guard_cli", about = "Login guard utilities")]
pub enum Cli {
    /// Generate a default configuration file
    Config {
        /// Output path for the configuration file
        #[structopt(short, long, default_value = "login-guard.toml")]
        output: PathBuf,
    },
    /// Show the failed logins found in an auth log
    Parse {
        /// Path to log file
        #[structopt(short, long)]
        file: PathBuf,
        /// Number of events to show
        #[structopt(short, long, default_value = "10")]
        lines: usize,
    },
    /// Print the effective configuration (file, .env and environment merged)
    Check {
        /// Path to configuration file
        #[structopt(short, long, default_value = "login-guard.toml")]
        config: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Warn)
        .parse_default_env()
        .init();

    let cli = Cli::from_args();

    match cli {
        Cli::Config { output } => {
            let config = Config::default();
            config.to_file(&output)?;
            println!("Default configuration written to: {:?}", output);
        }
        Cli::Parse { file, lines } => {
            if !file.exists() {
                eprintln!("File not found: {:?}", file);
                std::process::exit(1);
            }

            let classifier = LineClassifier::new()?;
            let reader = BufReader::new(File::open(&file)?);

            let mut total = 0;
            let mut events = Vec::new();
            for line in reader.lines() {
                let line = line?;
                total += 1;
                if let Some(event) = classifier.classify(&line) {
                    events.push(event);
                }
            }

            let display_count = std::cmp::min(lines, events.len());
            println!(
                "Found {} failed login(s) in {} line(s) (showing {}):\n",
                events.len(),
                total,
                display_count
            );
            for event in events.iter().take(display_count) {
                println!(
                    "  User: {}, Source: {}, Protocol: {}",
                    event.user,
                    event.source_address,
                    event.protocol.as_deref().unwrap_or("-")
                );
            }
        }
        Cli::Check { config } => {
            let config = Config::load(&config);
            println!("Host: {}", config.host_identifier());
            println!("{}", toml::to_string_pretty(&config.redacted())?);
        }
    }

    Ok(())
}
