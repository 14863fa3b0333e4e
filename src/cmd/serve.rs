use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use log::{debug, info, trace, warn};

use crate::config::{EchoArgs, TunnelConfig};
use crate::http::{self, Request};
use crate::net::icmp::EchoKind;
use crate::net::rawsock::RawSocket;
use crate::tunnel::correlator::{listen, IcmpTransport};

#[derive(Args)]
pub struct Serve {
    #[command(flatten)]
    echo: EchoArgs,
}

impl Serve {
    pub fn exec(self) -> Result<()> {
        let cfg = TunnelConfig::from(&self.echo);
        let sock = super::open_socket()?;
        info!(
            "answering tunnelled requests with code {}; \
             kernel echo replies must be off (net.ipv4.icmp_echo_ignore_all=1)",
            cfg.code
        );

        // the listener reports socket failures itself
        super::run_until_interrupted("serve", crossbeam_channel::never(), move || {
            respond_loop(sock, cfg)
        })
    }
}

fn respond_loop(sock: Arc<RawSocket>, cfg: TunnelConfig) -> Result<()> {
    let cfg = Arc::new(cfg);
    for inbound in listen(&*sock) {
        let inbound = inbound.context("icmp listener failed")?;
        let request = inbound.message;
        if request.kind != EchoKind::Request || request.code != cfg.code {
            trace!(
                "ignoring {:?} code={} from {}",
                request.kind,
                request.code,
                inbound.from
            );
            continue;
        }

        let sock = Arc::clone(&sock);
        let cfg = Arc::clone(&cfg);
        thread::spawn(move || {
            let body = respond(&request.payload, &cfg);
            let reply = request.reply_with(body);
            match sock.send_to(&reply.encode(), inbound.from) {
                Ok(()) => debug!(
                    "answered seq={} from {} with {} bytes",
                    reply.sequence,
                    inbound.from,
                    reply.payload.len()
                ),
                Err(e) => warn!("fail to answer {}: {e}", inbound.from),
            }
        });
    }
    Ok(())
}

/// Serialized HTTP response for one tunnelled request. Failures become a
/// `502` so the client learns about them before its timeout.
fn respond(request: &[u8], cfg: &TunnelConfig) -> Vec<u8> {
    match fetch(request, cfg) {
        Ok(resp) => resp,
        Err(e) => {
            warn!("tunnelled request failed: {e:#}");
            http::simple_response(502, "Bad Gateway", &format!("{e:#}"))
        }
    }
}

fn fetch(request: &[u8], cfg: &TunnelConfig) -> Result<Vec<u8>> {
    let req = Request::parse(request, cfg.max_payload)?;
    let authority = req
        .authority()
        .ok_or_else(|| anyhow!("request names no host"))?;
    let addr = authority
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow!("{authority} resolves to no address"))?;

    let mut origin = TcpStream::connect_timeout(&addr, cfg.timeout)
        .with_context(|| format!("fail to dial {authority}"))?;
    origin.set_read_timeout(Some(cfg.timeout))?;
    origin.set_write_timeout(Some(cfg.timeout))?;
    origin.write_all(&req.to_origin_bytes())?;

    let mut resp = Vec::new();
    (&mut origin)
        .take(cfg.max_payload as u64 + 1)
        .read_to_end(&mut resp)
        .with_context(|| format!("fail to read response from {authority}"))?;
    if resp.len() > cfg.max_payload {
        bail!(
            "response from {authority} exceeds the {} byte echo payload limit",
            cfg.max_payload
        );
    }
    info!("{} {} -> {} bytes", req.method, req.target, resp.len());
    Ok(resp)
}
