//! sstunnel local endpoint
//!
//! Usage: sstunnel-local [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -h, --help           Print help information
//!   -V, --version        Print version information

use std::env;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use sstunnel::{Config, LocalRole, Reactor};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-V" | "--version" => {
            println!("sstunnel-local {}", env!("CARGO_PKG_VERSION"));
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_local(&args[2])?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"sstunnel-local - SOCKS5 front end of an encrypted tunnel

USAGE:
    sstunnel-local [OPTIONS]

OPTIONS:
    -c, --config <FILE>  Path to configuration file
    -h, --help           Print help information
    -V, --version        Print version information

CONFIGURATION FILE FORMAT (JSON, or TOML with a .toml extension):
    {{
        "server": "tunnel.example.com",
        "server_port": 8388,
        "local_address": "127.0.0.1",
        "local_port": 1080,
        "password": "<secret>",
        "method": "chacha20-ietf-poly1305",
        "timeout": 300,
        "direct_hosts": ["intranet.example.com", "10.0.0.1"]
    }}

EXAMPLES:
    Run the local endpoint:
        sstunnel-local --config local.json

    Verbose logging:
        RUST_LOG=debug sstunnel-local -c local.json
"#
    );
}

fn run_local(config_path: &str) -> anyhow::Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path))?;
    let addr = config.local_listen_addr()?;

    tracing::info!(
        "tunneling through {}:{} using {}",
        config.server,
        config.server_port,
        config.method
    );
    if !config.direct_hosts.is_empty() {
        tracing::info!("{} direct host entries", config.direct_hosts.len());
    }

    let role = LocalRole::new(&config);
    let mut reactor = Reactor::new(role, Arc::new(config))?;
    reactor.listen(addr)?;
    reactor.run()?;
    Ok(())
}
