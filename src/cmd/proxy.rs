use std::io::{BufReader, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Args;
use log::{debug, info, warn};

use crate::config::{EchoArgs, TunnelConfig};
use crate::http::{self, HttpError, Request};
use crate::tunnel::correlator::IcmpTransport;
use crate::tunnel::gateway::{status_for, HttpGateway};
use crate::tunnel::relay::relay;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Args)]
pub struct Proxy {
    /// Remote IP address to send ICMP requests to.
    #[arg(long)]
    remote: Ipv4Addr,

    /// Local address to listen on.
    #[arg(long, default_value = "0.0.0.0:8888")]
    listen: SocketAddr,

    #[command(flatten)]
    echo: EchoArgs,
}

impl Proxy {
    pub fn exec(self) -> Result<()> {
        let cfg = TunnelConfig::from(&self.echo);
        let correlator = super::open_correlator(&cfg)?;
        let broken = correlator.stopped();
        let gateway = Arc::new(HttpGateway::new(correlator, self.remote, &cfg));

        let listener = TcpListener::bind(self.listen)
            .with_context(|| format!("fail to listen on {}", self.listen))?;
        info!(
            "Proxy server listening on {}, forwarding requests to {} via ICMP (id={}, code={})",
            self.listen, self.remote, cfg.identifier, cfg.code
        );

        super::run_until_interrupted("proxy-accept", broken, move || {
            accept_loop(listener, gateway)
        })
    }
}

fn accept_loop<T: IcmpTransport>(
    listener: TcpListener,
    gateway: Arc<HttpGateway<T>>,
) -> Result<()> {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!("accept: {e}");
                continue;
            }
        };
        let gateway = Arc::clone(&gateway);
        thread::spawn(move || {
            let peer = stream.peer_addr().ok();
            if let Err(e) = serve_client(stream, &gateway) {
                debug!("client {peer:?}: {e:#}");
            }
        });
    }
    Ok(())
}

fn serve_client<T: IcmpTransport>(mut stream: TcpStream, gateway: &HttpGateway<T>) -> Result<()> {
    stream.set_read_timeout(Some(CLIENT_READ_TIMEOUT))?;
    let mut reader = BufReader::new(stream.try_clone()?);

    let req = match Request::read_from(&mut reader, gateway.max_payload()) {
        Ok(Some(req)) => req,
        Ok(None) => return Ok(()),
        Err(e) => {
            let (status, reason) = match e {
                HttpError::LengthRequired => (411, "Length Required"),
                HttpError::HeadTooLarge => (431, "Request Header Fields Too Large"),
                HttpError::BodyTooLarge { .. } => (413, "Payload Too Large"),
                HttpError::Io(_) | HttpError::Malformed(_) => (400, "Bad Request"),
            };
            stream.write_all(&http::simple_response(status, reason, &e.to_string()))?;
            return Ok(());
        }
    };

    if req.is_connect() {
        return tunnel(stream, reader, &req);
    }

    debug!("{} {}", req.method, req.target);
    let response = match gateway.forward(&req.to_bytes()) {
        Ok(resp) => resp,
        Err(e) => {
            warn!("{} {}: {e}", req.method, req.target);
            let (status, reason) = status_for(&e);
            http::simple_response(status, reason, &e.to_string())
        }
    };
    stream.write_all(&response)?;
    stream.shutdown(Shutdown::Write)?;
    Ok(())
}

/// CONNECT: splice the client straight to the destination, no ICMP.
fn tunnel(mut client: TcpStream, reader: BufReader<TcpStream>, req: &Request) -> Result<()> {
    let dest = match req.authority().ok_or_else(|| anyhow!("CONNECT without a target")).and_then(dial) {
        Ok(d) => d,
        Err(e) => {
            client.write_all(&http::simple_response(
                503,
                "Service Unavailable",
                &format!("{e:#}"),
            ))?;
            return Err(e);
        }
    };

    client.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")?;
    client.set_read_timeout(None)?;

    // anything the client pipelined behind the CONNECT head
    let early = reader.buffer();
    if !early.is_empty() {
        (&dest).write_all(early)?;
    }

    let stats = relay(client, dest)?;
    info!(
        "CONNECT {} closed: {} bytes up, {} bytes down",
        req.target, stats.a_to_b, stats.b_to_a
    );
    Ok(())
}

fn dial(authority: String) -> Result<TcpStream> {
    let mut last = None;
    for addr in authority.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, DIAL_TIMEOUT) {
            Ok(s) => return Ok(s),
            Err(e) => last = Some(e),
        }
    }
    Err(match last {
        Some(e) => anyhow!(e).context(format!("fail to dial {authority}")),
        None => anyhow!("{authority} resolves to no address"),
    })
}
