use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Subcommand;
use crossbeam_channel::{bounded, select, Receiver};
use log::info;

use crate::config::TunnelConfig;
use crate::net::rawsock::RawSocket;
use crate::tunnel::correlator::Correlator;

mod bridge;
mod proxy;
mod serve;

/// TTL of outgoing echo messages.
const HOPS: u8 = 64;
/// How often blocked socket readers wake up to check for shutdown.
const POLL: Duration = Duration::from_millis(200);

#[derive(Subcommand)]
pub enum Command {
    /// HTTP proxy whose requests travel inside ICMP echo requests.
    Proxy(proxy::Proxy),
    /// Answer tunnelled HTTP requests arriving as echo requests.
    Serve(serve::Serve),
    /// Carry IPv4 payloads from a TUN device across the echo tunnel.
    Bridge(bridge::Bridge),
}

impl Command {
    pub fn exec(self) -> Result<()> {
        match self {
            Command::Proxy(c) => c.exec(),
            Command::Serve(c) => c.exec(),
            Command::Bridge(c) => c.exec(),
        }
    }
}

fn open_socket() -> Result<Arc<RawSocket>> {
    let sock = RawSocket::new_icmp(HOPS, POLL)
        .context("open raw icmp socket (needs root or CAP_NET_RAW)")?;
    Ok(Arc::new(sock))
}

fn open_correlator(cfg: &TunnelConfig) -> Result<Arc<Correlator<RawSocket>>> {
    Ok(Arc::new(Correlator::new(open_socket()?, cfg)?))
}

/// Runs `work` on its own thread until it returns, Ctrl-C arrives, or
/// `broken` disconnects.
fn run_until_interrupted<F>(name: &str, broken: Receiver<()>, work: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let ctrl_c_events = ctrl_channel()?;
    let (done_tx, done_rx) = bounded(1);
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let _ = done_tx.send(work());
        })?;

    select! {
        recv(done_rx) -> res => {
            res.map_err(|_| anyhow!("{name} worker exited without a result"))?
        }
        recv(ctrl_c_events) -> _ => {
            info!("interrupted, shutting down");
            Ok(())
        }
        recv(broken) -> _ => {
            Err(anyhow!("{name}: icmp socket reader stopped"))
        }
    }
}

fn ctrl_channel() -> Result<Receiver<()>, ctrlc::Error> {
    let (sender, receiver) = bounded(100);
    ctrlc::set_handler(move || {
        let _ = sender.send(());
    })?;

    Ok(receiver)
}
