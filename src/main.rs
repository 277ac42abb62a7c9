//! Erra CLI - An interactive HTTPS intercepting proxy

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use erra::config::{ROOT_CERT_FILE, ROOT_KEY_FILE};
use erra::{Config, GeneratedCa, ProxyServer};

#[derive(Parser)]
#[command(name = "erra")]
#[command(about = "An interactive HTTPS intercepting proxy with request/response breakpoints")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy server
    Run {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory holding erra.crt.pem and erra.key.pem (overrides config)
        #[arg(long)]
        ca_dir: Option<PathBuf>,

        /// Bind host (overrides config)
        #[arg(short, long)]
        bind: Option<String>,

        /// Plain HTTP listener port (overrides config)
        #[arg(long)]
        http_port: Option<u16>,

        /// TLS listener port (overrides config)
        #[arg(long)]
        https_port: Option<u16>,

        /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
        #[arg(short, long)]
        log_level: Option<String>,
    },

    /// Generate a new root CA certificate
    GenerateCa {
        /// Output directory for erra.crt.pem and erra.key.pem
        #[arg(short, long, default_value = "ca")]
        out: PathBuf,
    },

    /// Validate a configuration file
    ValidateConfig {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            ca_dir,
            bind,
            http_port,
            https_port,
            log_level,
        } => {
            let mut cfg = match &config {
                Some(config_path) => Config::from_file(config_path)?,
                None => Config::parse("")?,
            };

            // Apply CLI overrides
            if let Some(dir) = ca_dir {
                cfg.proxy.ca_dir = dir.to_string_lossy().to_string();
            }
            if let Some(host) = bind {
                cfg.proxy.bind_host = host;
            }
            if let Some(port) = http_port {
                cfg.proxy.http_port = port;
            }
            if let Some(port) = https_port {
                cfg.proxy.https_port = port;
            }
            if let Some(level) = log_level {
                cfg.logging.level = level;
            }
            cfg.validate()?;

            // Initialize logging
            let filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cfg.logging.level));

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();

            match &config {
                Some(path) => tracing::info!(path = %path.display(), "Loaded configuration"),
                None => tracing::info!("Using default configuration"),
            }

            if !cfg.proxy.ca_cert_path().exists() || !cfg.proxy.ca_key_path().exists() {
                eprintln!(
                    "Error: root CA not found in '{}' (expected {} and {}).",
                    cfg.proxy.ca_dir, ROOT_CERT_FILE, ROOT_KEY_FILE
                );
                eprintln!();
                eprintln!("To generate a new CA certificate:");
                eprintln!("  erra generate-ca --out {}", cfg.proxy.ca_dir);
                std::process::exit(1);
            }

            let bind_host = cfg.proxy.bind_host.clone();
            let http_port = cfg.proxy.http_port;
            let server = ProxyServer::new(cfg)?;

            tracing::info!("Starting proxy server...");
            tracing::info!("Configure clients with:");
            tracing::info!("  export HTTP_PROXY=http://{}:{}", bind_host, http_port);
            tracing::info!("  export HTTPS_PROXY=http://{}:{}", bind_host, http_port);

            // Handle Ctrl+C
            let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                tracing::info!("Shutting down...");
                let _ = shutdown_tx.send(());
            });

            server.run_until_shutdown(shutdown_rx).await?;
        }

        Commands::GenerateCa { out } => {
            println!("Generating CA certificate...");

            let ca = GeneratedCa::generate()?;
            ca.save_to_dir(&out)?;

            let cert_path = out.join(ROOT_CERT_FILE);
            println!("CA certificate generated successfully!");
            println!();
            println!("  Certificate: {}", cert_path.display());
            println!("  Private key: {}", out.join(ROOT_KEY_FILE).display());
            println!();
            println!("To use with the proxy:");
            println!("  erra run --ca-dir {}", out.display());
            println!();
            println!("To trust the CA on Ubuntu/Debian:");
            println!(
                "  sudo cp {} /usr/local/share/ca-certificates/erra.crt",
                cert_path.display()
            );
            println!("  sudo update-ca-certificates");
            println!();
            println!("IMPORTANT: Keep the private key secure!");
        }

        Commands::ValidateConfig { config } => {
            println!("Validating configuration: {}", config.display());

            let cfg = Config::from_file(&config)?;

            println!("Configuration is valid!");
            println!();
            println!("  Bind host: {}", cfg.proxy.bind_host);
            println!("  HTTP port: {}", cfg.proxy.http_port);
            println!("  HTTPS port: {}", cfg.proxy.https_port);
            println!("  CA directory: {}", cfg.proxy.ca_dir);
            println!(
                "  Certificate cache: {} entries, {}s TTL",
                cfg.certificates.cache_capacity, cfg.certificates.cache_ttl_secs
            );
            println!("  Leaf validity: {} days", cfg.certificates.leaf_validity_days);
            println!(
                "  Upstream connect timeout: {}",
                describe_timeout(cfg.timeouts.upstream_connect_secs)
            );
            println!(
                "  Tunnel idle timeout: {}",
                describe_timeout(cfg.timeouts.tunnel_idle_secs)
            );
            println!(
                "  Breakpoint timeout: {}",
                describe_timeout(cfg.timeouts.breakpoint_secs)
            );
            println!("  Log level: {}", cfg.logging.level);
            println!("  Log requests: {}", cfg.logging.log_requests);
            println!("  Log responses: {}", cfg.logging.log_responses);
        }
    }

    Ok(())
}

fn describe_timeout(secs: u64) -> String {
    if secs == 0 {
        "disabled".to_string()
    } else {
        format!("{}s", secs)
    }
}
