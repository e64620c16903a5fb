//! TFTP server binary
//!
//! Serves files under a root directory over UDP (RFC 1350, octet transfers,
//! lockstep with 512-byte blocks).
//!
//! Usage:
//!   cargo run --release --bin tftpd-server -- [OPTIONS]
//!
//! Examples:
//!   # serve ./images on the standard port
//!   cargo run --release --bin tftpd-server -- --root ./images
//!
//!   # read-only on an unprivileged port
//!   cargo run --release --bin tftpd-server -- -b 0.0.0.0:6969 -r /srv/tftp --read-only

use std::path::PathBuf;

use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tftpd::{Config, Error, Result, Server};

const HELP: &str = r#"tftpd-server - lockstep TFTP server (RFC 1350)

Usage:
  cargo run --release --bin tftpd-server -- [OPTIONS]

Options:
  -b, --bind <ADDR>          Bind address (default: 0.0.0.0:69)
  -r, --root <DIR>           Directory served to clients (default: .)
      --read-only            Reject write requests
      --max-sessions <N>     Concurrent session limit (default: 1024)
      --idle-timeout <SECS>  Drop sessions idle this long (default: 30)
  -h, --help                 Print this help

Logging:
  RUST_LOG=tftpd=debug enables per-block tracing.
"#;

/// Server settings from the command line
struct ServerConfig {
    config: Config,
    show_help: bool,
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: Option<&String>) -> Result<T> {
    let value = value.ok_or_else(|| Error::InvalidArgument(format!("{} needs a value", flag)))?;
    value
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid value for {}: {}", flag, value)))
}

fn parse_args(args: &[String]) -> Result<ServerConfig> {
    let mut config = Config::default();
    let mut show_help = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                config.bind_addr = parse_value("--bind", args.get(i + 1))?;
                i += 1;
            }
            "--root" | "-r" => {
                config.root_dir = PathBuf::from(parse_value::<String>("--root", args.get(i + 1))?);
                i += 1;
            }
            "--read-only" => {
                config.allow_writes = false;
            }
            "--max-sessions" => {
                config.max_sessions = parse_value("--max-sessions", args.get(i + 1))?;
                i += 1;
            }
            "--idle-timeout" => {
                let secs: u64 = parse_value("--idle-timeout", args.get(i + 1))?;
                config.idle_timeout_ms = secs
                    .checked_mul(1000)
                    .filter(|&ms| ms > 0)
                    .ok_or_else(|| {
                        Error::InvalidArgument(format!("invalid value for --idle-timeout: {}", secs))
                    })?;
                // sweep at least once per idle period
                config.sweep_interval_ms = config.sweep_interval_ms.min(config.idle_timeout_ms);
                i += 1;
            }
            "--help" | "-h" => {
                show_help = true;
            }
            other => {
                return Err(Error::InvalidArgument(format!("unknown option: {}", other)));
            }
        }
        i += 1;
    }

    Ok(ServerConfig { config, show_help })
}

fn init_logging() -> std::result::Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(Level::INFO)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    init_logging()?;

    let args: Vec<String> = std::env::args().collect();
    let server_config = match parse_args(&args) {
        Ok(server_config) => server_config,
        Err(e) => {
            error!("{}", e);
            eprint!("{}", HELP);
            std::process::exit(2);
        }
    };

    if server_config.show_help {
        print!("{}", HELP);
        return Ok(());
    }

    let config = server_config.config;
    info!("TFTP server starting...");
    info!("Root directory: {:?}", config.root_dir);
    info!("Writes: {}", if config.allow_writes { "enabled" } else { "disabled" });
    info!("Max sessions: {}", config.max_sessions);
    info!("Idle timeout: {:?}", config.idle_timeout());

    let server = Server::bind(config).await?;
    info!("Server listening on {}", server.local_addr()?);

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Ctrl-C received, shutting down");
        })
        .await?;

    info!("Server stopped");
    Ok(())
}
