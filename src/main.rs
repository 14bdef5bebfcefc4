use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use bluetooth_heartrate_lib::config::{AppConfig, CONFIG_FILE_NAME};
use bluetooth_heartrate_lib::core::bluetooth::{ChannelSink, MonitorEvent};
use bluetooth_heartrate_lib::core::{BluestTransport, HeartrateMonitor};
use bluetooth_heartrate_lib::logging::HostLogger;
use clap::Parser;
use log::{error, info, LevelFilter};
use tokio::sync::mpsc;

/// Bridges a Bluetooth LE heart-rate sensor to stdout
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = CONFIG_FILE_NAME)]
    config: PathBuf,
}

/// Writes an event to stdout as one JSON line
fn emit(event: &MonitorEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => eprintln!("Failed to serialize event: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (tx, mut rx) = mpsc::unbounded_channel();

    // The level is narrowed below once the config is loaded
    if HostLogger::init(tx.clone(), LevelFilter::Trace).is_err() {
        env_logger::builder().filter_level(LevelFilter::Trace).init();
    }
    log::set_max_level(LevelFilter::Info);

    let config = AppConfig::load_config(&cli.config).await?;
    log::set_max_level(config.level_filter());

    let transport = match BluestTransport::new().await {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            error!("Failed to open Bluetooth adapter: {}", e);
            return Err(e.into());
        }
    };
    let monitor = HeartrateMonitor::new(transport, config.monitor.clone(), Arc::new(ChannelSink::new(tx)));
    if !monitor.initialise().await {
        return Err(anyhow!("Failed to start the heart-rate monitor"));
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            event = rx.recv() => match event {
                Some(event) => emit(&event),
                None => break,
            }
        }
    }

    monitor.teardown().await;
    while let Ok(event) = rx.try_recv() {
        emit(&event);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn config_defaults_to_the_working_directory_file() {
        let cli = Cli::try_parse_from(["bluetooth-heartrate-bridge"]).unwrap();
        assert_eq!(cli.config, PathBuf::from(CONFIG_FILE_NAME));
    }

    #[test]
    fn config_path_can_be_overridden() {
        let cli = Cli::try_parse_from(["bluetooth-heartrate-bridge", "--config", "/tmp/strap.json"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/strap.json"));
        let cli = Cli::try_parse_from(["bluetooth-heartrate-bridge", "-c", "strap.json"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("strap.json"));
    }

    #[test]
    fn unknown_arguments_are_rejected() {
        assert!(Cli::try_parse_from(["bluetooth-heartrate-bridge", "--verbose"]).is_err());
        assert!(Cli::try_parse_from(["bluetooth-heartrate-bridge", "--config"]).is_err());
    }
}
