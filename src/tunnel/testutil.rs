//! In-memory stand-ins for the raw socket, used by unit tests.

use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::config::{TunnelConfig, DEFAULT_MAX_PAYLOAD};
use crate::error::{Result, TunnelError};
use crate::net::icmp::{self, EchoKind, EchoMessage, TUNNEL_CODE};
use crate::tunnel::correlator::{IcmpTransport, RECV_BUF_SIZE};

pub const PEER: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
pub const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 100);

const POLL: Duration = Duration::from_millis(20);

pub fn config() -> TunnelConfig {
    TunnelConfig {
        code: TUNNEL_CODE,
        identifier: 0x4242,
        timeout: Duration::from_secs(2),
        max_payload: DEFAULT_MAX_PAYLOAD,
    }
}

/// One end of a lossless point-to-point link.
pub struct MemoryTransport {
    addr: Ipv4Addr,
    tx: Sender<(Vec<u8>, Ipv4Addr)>,
    rx: Receiver<(Vec<u8>, Ipv4Addr)>,
}

impl MemoryTransport {
    /// Returns `(local, remote)`; the remote end appears as `peer`.
    pub fn pair(peer: Ipv4Addr) -> (Self, Self) {
        let (to_remote, remote_rx) = unbounded();
        let (to_local, local_rx) = unbounded();
        (
            MemoryTransport {
                addr: LOCAL,
                tx: to_remote,
                rx: local_rx,
            },
            MemoryTransport {
                addr: peer,
                tx: to_local,
                rx: remote_rx,
            },
        )
    }
}

impl IcmpTransport for MemoryTransport {
    fn send_to(&self, message: &[u8], _peer: Ipv4Addr) -> Result<()> {
        // a vanished peer is just packet loss
        let _ = self.tx.send((message.to_vec(), self.addr));
        Ok(())
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, Ipv4Addr)>> {
        match self.rx.recv_timeout(POLL) {
            Ok((msg, from)) => {
                buf[..msg.len()].copy_from_slice(&msg);
                Ok(Some((msg.len(), from)))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                thread::sleep(POLL);
                Ok(None)
            }
        }
    }
}

/// Transport whose next receive fails once the returned sender fires or is
/// dropped. Sends always succeed.
pub struct FailingTransport {
    trip: Receiver<()>,
}

impl FailingTransport {
    pub fn new() -> (Self, Sender<()>) {
        let (fail, trip) = unbounded();
        (FailingTransport { trip }, fail)
    }
}

impl IcmpTransport for FailingTransport {
    fn send_to(&self, _message: &[u8], _peer: Ipv4Addr) -> Result<()> {
        Ok(())
    }

    fn recv_from(&self, _buf: &mut [u8]) -> Result<Option<(usize, Ipv4Addr)>> {
        match self.trip.recv_timeout(POLL) {
            Err(RecvTimeoutError::Timeout) => Ok(None),
            _ => Err(TunnelError::transport(
                "fail to receive data from socket",
                io::Error::from(io::ErrorKind::ConnectionReset),
            )),
        }
    }
}

/// Answers echo requests on `transport` with whatever `handler` returns.
/// `None` leaves the request unanswered. Stops when dropped.
pub struct Peer {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

pub fn spawn_peer<F>(transport: MemoryTransport, handler: F) -> Peer
where
    F: Fn(&EchoMessage) -> Option<Vec<u8>> + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    let handle = thread::spawn(move || {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        while !flag.load(Ordering::Relaxed) {
            let Ok(Some((n, from))) = transport.recv_from(&mut buf) else {
                continue;
            };
            let Ok(req) = icmp::decode(&buf[..n]) else {
                continue;
            };
            if req.kind != EchoKind::Request {
                continue;
            }
            if let Some(body) = handler(&req) {
                let _ = transport.send_to(&req.reply_with(body).encode(), from);
            }
        }
    });
    Peer {
        stop,
        handle: Some(handle),
    }
}
