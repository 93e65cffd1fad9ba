//! baas-cli - Command-line interface for baas
//!
//! One-shot hash and compare calls, plus a small load generator.

mod commands;

use baas_client::ClientConfig;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "baas-cli")]
#[command(about = "Command-line interface for the baas bcrypt service")]
#[command(version)]
struct Cli {
    /// Server address (baas:// for plain TCP, baass:// for TLS)
    #[arg(short, long, env = "BAAS_URI", default_value = "baas://127.0.0.1:9485")]
    uri: String,

    /// Per-request timeout in milliseconds
    #[arg(long, env = "BAAS_TIMEOUT_MS", default_value = "2000")]
    timeout_ms: u64,

    // ===== TLS Options =====
    /// Path to CA certificate for server verification
    #[arg(long, env = "BAAS_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE)
    #[arg(long, short = 'k')]
    insecure: bool,

    /// Server name for TLS SNI (defaults to server hostname)
    #[arg(long)]
    server_name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Hash a password ("-" reads it from stdin)
    Hash {
        password: String,
    },

    /// Check a password against a bcrypt hash
    Compare {
        /// Password ("-" reads it from stdin)
        password: String,

        /// Hash to check against
        hash: String,
    },

    /// Run hash requests through a connection pool and report throughput
    Bench {
        /// Total number of requests
        #[arg(short = 'n', long, default_value = "1000")]
        requests: usize,

        /// Requests kept in flight at once
        #[arg(short, long, default_value = "50")]
        concurrency: usize,

        /// Pool size
        #[arg(long, default_value = "4")]
        connections: usize,

        /// Retire a connection after this many requests
        #[arg(long, default_value = "10000")]
        max_requests_per_connection: u64,
    },
}

impl Cli {
    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::from_uri(self.uri.clone())
            .with_request_timeout(Duration::from_millis(self.timeout_ms))
            .with_reject_unauthorized(!self.insecure);
        if let Some(ref path) = self.ca_cert {
            config = config.with_ca_cert(path);
        }
        if let Some(ref name) = self.server_name {
            config = config.with_server_name(name);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.client_config();

    match commands::execute(config, cli.command).await {
        Ok(output) => {
            println!("{}", output);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }
}
