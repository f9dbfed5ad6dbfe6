//! Redfire ACS main application

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};

use redfire_acs::{config::AcsConfig, core::AcsServer, utils::setup_logging, Result};

#[derive(Parser)]
#[command(name = "redfire-acs")]
#[command(about = "TR-069 Auto Configuration Server")]
#[command(version = redfire_acs::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the ACS
    Start,
    /// Validate configuration
    ValidateConfig,
    /// Generate default configuration
    GenerateConfig {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_configuration(&cli)?;
    let _log_guard = setup_logging(&config.logging)?;

    info!("Starting {} v{}", redfire_acs::NAME, redfire_acs::VERSION);

    match &cli.command {
        Some(Commands::Start) | None => run_server(config).await,
        Some(Commands::ValidateConfig) => validate_configuration(&config),
        Some(Commands::GenerateConfig { output }) => generate_default_config(output.clone()),
    }
}

fn load_configuration(cli: &Cli) -> Result<AcsConfig> {
    let config = if let Some(config_path) = &cli.config {
        AcsConfig::load_from_file(config_path)?
    } else {
        match AcsConfig::load_from_env() {
            Ok(config) => config,
            Err(_) => AcsConfig::default_config(),
        }
    };

    config.validate()?;
    Ok(config)
}

async fn run_server(config: AcsConfig) -> Result<()> {
    let server = AcsServer::new(config).await?;
    let shutdown = server.shutdown_token();

    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down gracefully");
                shutdown.cancel();
            }
            Err(err) => {
                error!("Unable to listen for shutdown signal: {}", err);
            }
        }
    });

    server.run().await
}

fn validate_configuration(config: &AcsConfig) -> Result<()> {
    config.validate()?;

    println!("✓ Configuration is valid");
    println!("  Listen:            {}:{}", config.server.host, config.server.port);
    println!("  Session Timeout:   {}s", config.cwmp.session_timeout);
    println!("  Inform Interval:   {}s", config.cwmp.inform_interval);
    println!("  Offline Threshold: {}s", config.device.offline_threshold);
    println!("  Sweep Interval:    {}s", config.device.sweep_interval);
    println!("  Database:          {}", config.database.url);

    Ok(())
}

fn generate_default_config(output_path: Option<PathBuf>) -> Result<()> {
    let config = AcsConfig::default_config();
    let toml_content = toml::to_string_pretty(&config)
        .map_err(|e| redfire_acs::Error::internal(format!("Failed to serialize config: {}", e)))?;

    match output_path {
        Some(path) => {
            std::fs::write(&path, toml_content)?;
            println!("✓ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", toml_content);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_generation() {
        assert!(generate_default_config(None).is_ok());
    }

    #[test]
    fn test_config_validation() {
        let config = AcsConfig::default_config();
        assert!(validate_configuration(&config).is_ok());
    }
}
