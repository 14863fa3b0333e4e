use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use log::info;
use tun_tap::{Iface, Mode};

use crate::config::{EchoArgs, TunnelConfig};
use crate::net::ipv4::protocol;
use crate::tunnel::bridge;

#[derive(Args)]
pub struct Bridge {
    /// Remote IP address receiving the tunnelled payloads.
    #[arg(long)]
    remote: Ipv4Addr,

    /// TUN device to read packets from; created if missing.
    #[arg(long, default_value = "tun0")]
    tun: String,

    /// IP protocol number of the packets to carry.
    #[arg(long, default_value_t = protocol::TCP)]
    protocol: u8,

    #[command(flatten)]
    echo: EchoArgs,
}

impl Bridge {
    pub fn exec(self) -> Result<()> {
        let cfg = TunnelConfig::from(&self.echo);

        let iface = Iface::without_packet_info(&self.tun, Mode::Tun)
            .with_context(|| format!("fail to open tun device {}", self.tun))?;
        info!(
            "TUN device created: {} (assign an address and bring it up to route traffic)",
            iface.name()
        );

        let correlator = super::open_correlator(&cfg)?;
        let broken = correlator.stopped();
        let bridge = bridge::Bridge::new(
            Arc::new(iface),
            correlator,
            self.remote,
            self.protocol,
            &cfg,
        );
        info!(
            "bridging protocol {} packets to {} via ICMP",
            self.protocol, self.remote
        );

        super::run_until_interrupted("bridge", broken, move || {
            bridge.run().context("bridge stopped")?;
            Ok(())
        })
    }
}
