//! Command surface: `start`, `init`, `validate`

use std::io::Write as _;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use triproxy_core::{LogLevel, ProxyConfig, Server};

use crate::logging::{self, LoggingConfig};

#[derive(Parser)]
#[command(name = "triproxy")]
#[command(author, version, about = "Single-port HTTP/CONNECT/SOCKS5 forward proxy")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a config (or defaults), apply overrides, and run the proxy
    Start {
        /// Path to a YAML config file
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,

        /// Override the bind host
        #[arg(short = 'H', long = "host")]
        host: Option<String>,

        /// Override the bind port
        #[arg(short = 'p', long = "port")]
        port: Option<u16>,

        /// Override the log level: DEBUG, INFO, WARNING, ERROR, CRITICAL
        #[arg(long = "log-level")]
        log_level: Option<String>,

        /// Override the log file path (stdout if omitted)
        #[arg(short = 'l', long = "log-file")]
        log_file: Option<PathBuf>,
    },

    /// Write a default configuration file to the given path
    Init {
        /// Destination path for the generated config
        path: PathBuf,
    },

    /// Load and validate a configuration file without starting the proxy
    Validate {
        /// Path to a YAML config file
        #[arg(short = 'c', long = "config")]
        config: PathBuf,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Start {
            config,
            host,
            port,
            log_level,
            log_file,
        } => start(config, host, port, log_level, log_file),
        Commands::Init { path } => init(&path),
        Commands::Validate { config } => validate(&config),
    }
}

fn parse_log_level(raw: &str) -> Result<LogLevel> {
    match raw.to_ascii_uppercase().as_str() {
        "DEBUG" => Ok(LogLevel::Debug),
        "INFO" => Ok(LogLevel::Info),
        "WARNING" => Ok(LogLevel::Warning),
        "ERROR" => Ok(LogLevel::Error),
        "CRITICAL" => Ok(LogLevel::Critical),
        other => Err(anyhow!(
            "invalid log level {other:?} (expected DEBUG, INFO, WARNING, ERROR, or CRITICAL)"
        )),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ProxyConfig> {
    match path {
        Some(path) => {
            triproxy_core::ProxyConfig::from_yaml(path).with_context(|| {
                format!("failed to load config from {}", path.display())
            })
        }
        None => Ok(ProxyConfig::default()),
    }
}

fn start(
    config_path: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    log_level: Option<String>,
    log_file: Option<PathBuf>,
) -> Result<()> {
    let mut config = load_config(config_path.as_ref())?;

    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(raw) = &log_level {
        config.log_level = parse_log_level(raw)?;
    }
    if let Some(path) = &log_file {
        config.log_file = Some(path.display().to_string());
    }
    config
        .validate()
        .context("configuration failed validation")?;

    let _guard = logging::init(LoggingConfig {
        level: config.log_level,
        file: config.log_file.as_ref().map(PathBuf::from),
    })?;

    info!(
        host = %config.host,
        port = config.port,
        protocols = ?config.protocols,
        max_connections = config.max_connections,
        connection_timeout = config.connection_timeout,
        idle_timeout = config.idle_timeout,
        "triproxy starting"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async move {
        let server = Server::bind(config).await?;
        server.run().await?;
        anyhow::Ok(())
    })?;

    info!("triproxy stopped");
    Ok(())
}

fn init(path: &PathBuf) -> Result<()> {
    if path.exists() {
        print!(
            "{} already exists. Overwrite? [y/N] ",
            path.display()
        );
        std::io::stdout().flush().ok();
        let mut answer = String::new();
        std::io::stdin()
            .read_line(&mut answer)
            .context("failed to read confirmation from stdin")?;
        if !answer.trim().eq_ignore_ascii_case("y") {
            println!("aborted");
            return Ok(());
        }
    }

    let config = ProxyConfig::default();
    config
        .to_yaml(path)
        .with_context(|| format!("failed to write config to {}", path.display()))?;
    println!("wrote default configuration to {}", path.display());
    Ok(())
}

fn validate(path: &PathBuf) -> Result<()> {
    let config = ProxyConfig::from_yaml(path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;

    println!("configuration is valid");
    println!("  bind: {}:{}", config.host, config.port);
    println!(
        "  protocols: {}",
        config
            .protocols
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("  max_connections: {}", config.max_connections);
    println!("  connection_timeout: {}s", config.connection_timeout);
    println!("  idle_timeout: {}s", config.idle_timeout);
    println!("  buffer_size: {} bytes", config.buffer_size);
    println!(
        "  auth: {}",
        match &config.auth {
            Some(auth) if auth.enabled => format!("enabled ({} users)", auth.users.len()),
            _ => "disabled".to_string(),
        }
    );
    Ok(())
}
