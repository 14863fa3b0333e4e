use anyhow::Result;
use clap::Parser;

mod cmd;
mod config;
mod error;
mod http;
mod net;
mod tunnel;

/// Tunnel HTTP and raw IPv4 payloads through ICMP echo messages.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: cmd::Command,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    Cli::parse().command.exec()
}
