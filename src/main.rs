use clap::Parser;
use connect_gateway::config::{GatewayConfig, LogFormat, LogLevel};
use connect_gateway::config_validation::validate_config;
use connect_gateway::logging::{self, parse_log_format, parse_log_level};
use connect_gateway::Gateway;
use log::{info, warn};
use std::path::{Path, PathBuf};
use tokio::signal;

#[derive(Parser)]
#[clap(
    version = "0.1.0",
    about = "A CONNECT tunneling gateway for HTTP/1.1 CONNECT and HTTP/2 extended CONNECT"
)]
struct Args {
    #[clap(short, long, value_name = "ADDR", help = "Listen address (e.g., 127.0.0.1:8000)")]
    listen: Option<String>,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(long, value_name = "USERNAME", help = "Username clients must present (Basic Auth)")]
    proxy_username: Option<String>,

    #[clap(long, value_name = "PASSWORD", help = "Password clients must present (Basic Auth)")]
    proxy_password: Option<String>,

    #[clap(long, value_name = "FILE", help = "Private key file path for the TLS listener")]
    private_key: Option<String>,

    #[clap(long, value_name = "FILE", help = "Certificate file path for the TLS listener")]
    certificate: Option<String>,

    #[clap(long, value_name = "FILE", help = "Extra CA certificate trusted for upstream TLS (can be used multiple times)")]
    ca_file: Vec<PathBuf>,

    #[clap(long, value_name = "SECONDS", help = "Upstream connection timeout in seconds")]
    connect_timeout: Option<u64>,

    #[clap(long, value_name = "BYTES", help = "Maximum HTTP/1.1 request head size in bytes")]
    max_header_size: Option<usize>,

    #[clap(long, value_name = "LEVEL", value_parser = parse_log_level, help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<LogLevel>,

    #[clap(long, value_name = "FORMAT", value_parser = parse_log_format, help = "Log format: text or json")]
    log_format: Option<LogFormat>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(config_file) = args.generate_config {
        generate_sample_config(&config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let mut config = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            return Err(format!("Configuration file not found: {}", config_file).into());
        }
        GatewayConfig::from_file(config_file)?
    } else {
        GatewayConfig::default()
    };
    apply_args(&mut config, &args)?;

    logging::init(config.logging.clone(), args.log_level, args.log_format)?;

    let report = validate_config(&config)?;
    for warning in &report.warnings {
        warn!("{}", warning);
    }
    for suggestion in &report.suggestions {
        info!("{}", suggestion);
    }

    info!("Starting CONNECT gateway...");
    let gateway = Gateway::new(config)?;

    let server_handle = tokio::spawn(async move { gateway.run().await });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => return Err(e.into()),
                Err(e) => return Err(e.into()),
                Ok(Ok(())) => {}
            }
        }
    }

    info!("CONNECT gateway stopped");
    Ok(())
}

/// Command-line values take precedence over the configuration file.
fn apply_args(config: &mut GatewayConfig, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(listen) = &args.listen {
        config.listen_addr = listen.parse()?;
    }
    if args.proxy_username.is_some() {
        config.proxy_username = args.proxy_username.clone();
    }
    if args.proxy_password.is_some() {
        config.proxy_password = args.proxy_password.clone();
    }
    if args.private_key.is_some() {
        config.private_key = args.private_key.clone();
    }
    if args.certificate.is_some() {
        config.certificate = args.certificate.clone();
    }
    config.upstream_ca_files.extend(args.ca_file.iter().cloned());
    if args.connect_timeout.is_some() {
        config.connect_timeout_secs = args.connect_timeout;
    }
    if let Some(max_header_size) = args.max_header_size {
        config.max_header_size = max_header_size;
    }
    Ok(())
}

fn generate_sample_config(file_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let sample = r#"{
  "listen_addr": "0.0.0.0:8443",
  "proxy_username": "username",
  "proxy_password": "password",
  "private_key": "/etc/connect-gateway/key.pem",
  "certificate": "/etc/connect-gateway/cert.pem",
  "upstream_ca_files": [],
  "connect_timeout_secs": 10,
  "max_header_size": 16384,
  "logging": {
    "level": "info",
    "format": "text",
    "targets": [
      { "type": "stdout" },
      { "type": "file", "path": "/var/log/connect-gateway.log", "level": "warn" }
    ]
  }
}"#;

    std::fs::write(file_path, sample)?;
    Ok(())
}
