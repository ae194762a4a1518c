//! sstunnel remote endpoint
//!
//! Usage: sstunnel-remote [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -h, --help           Print help information
//!   -V, --version        Print version information

use std::env;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use sstunnel::{Config, Reactor, RemoteRole};

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
            println!("sstunnel-remote {}", env!("CARGO_PKG_VERSION"));
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_remote(&args[2])?;
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
        r#"sstunnel-remote - exit endpoint of an encrypted tunnel

USAGE:
    sstunnel-remote [OPTIONS]

OPTIONS:
    -c, --config <FILE>  Path to configuration file
    -h, --help           Print help information
    -V, --version        Print version information

CONFIGURATION FILE FORMAT (JSON, or TOML with a .toml extension):
    {{
        "server": "0.0.0.0",
        "server_port": 8388,
        "password": "<secret>",
        "method": "chacha20-ietf-poly1305",
        "timeout": 300,
        "dns_timeout": 5,
        "dns_cache_ttl": 300
    }}

EXAMPLES:
    Run the remote endpoint:
        sstunnel-remote --config remote.json
"#
    );
}

fn run_remote(config_path: &str) -> anyhow::Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path))?;
    let addr = config.server_listen_addr()?;

    tracing::info!("accepting tunnel connections using {}", config.method);

    let mut reactor = Reactor::new(RemoteRole::new(), Arc::new(config))?;
    reactor.listen(addr)?;
    reactor.run()?;
    Ok(())
}
