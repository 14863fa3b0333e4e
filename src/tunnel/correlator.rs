//! Echo request/reply correlation over a shared ICMP transport.
//!
//! One reader thread owns the receive side of the transport and hands each
//! Echo Reply to the caller waiting on its `(identifier, sequence)` key.
//! Any number of threads may send through the same correlator at once.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, error, trace};

use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::net::icmp::{self, EchoKind, EchoMessage};

/// Largest datagram a reader will accept.
pub const RECV_BUF_SIZE: usize = 65535;

/// Datagram transport carrying encoded ICMP messages.
pub trait IcmpTransport: Send + Sync + 'static {
    fn send_to(&self, message: &[u8], peer: Ipv4Addr) -> Result<()>;

    /// Receives one ICMP message into the front of `buf`.
    ///
    /// `Ok(None)` when nothing arrived within the transport's poll interval.
    fn recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, Ipv4Addr)>>;
}

/// An echo message together with the address it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub from: Ipv4Addr,
    pub message: EchoMessage,
}

type Key = (u16, u16);
type Pending = Arc<Mutex<HashMap<Key, Sender<Inbound>>>>;

fn lock(pending: &Pending) -> MutexGuard<'_, HashMap<Key, Sender<Inbound>>> {
    // the map stays consistent even if a holder panicked
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Correlator<T: IcmpTransport> {
    transport: Arc<T>,
    code: u8,
    identifier: u16,
    sequence: AtomicU16,
    pending: Pending,
    running: Arc<AtomicBool>,
    /// disconnects once the reader thread has exited
    reader_gone: Receiver<()>,
    reader: Option<JoinHandle<()>>,
}

impl<T: IcmpTransport> Correlator<T> {
    pub fn new(transport: Arc<T>, cfg: &TunnelConfig) -> Result<Self> {
        let pending: Pending = Arc::default();
        let running = Arc::new(AtomicBool::new(true));
        let (alive, reader_gone) = bounded::<()>(0);

        let reader = {
            let transport = Arc::clone(&transport);
            let pending = Arc::clone(&pending);
            let running = Arc::clone(&running);
            let identifier = cfg.identifier;
            thread::Builder::new()
                .name("icmp-demux".into())
                .spawn(move || demux(&*transport, identifier, &pending, &running, alive))
                .map_err(|e| TunnelError::transport("fail to spawn reader thread", e))?
        };

        Ok(Correlator {
            transport,
            code: cfg.code,
            identifier: cfg.identifier,
            sequence: AtomicU16::new(1),
            pending,
            running,
            reader_gone,
            reader: Some(reader),
        })
    }

    pub fn identifier(&self) -> u16 {
        self.identifier
    }

    /// False once the reader thread has stopped; no reply can arrive after
    /// that and every further `submit` fails.
    pub fn is_alive(&self) -> bool {
        !matches!(self.reader_gone.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Becomes ready (disconnected) when the reader thread stops, for use in
    /// `select!`.
    pub fn stopped(&self) -> Receiver<()> {
        self.reader_gone.clone()
    }

    /// Sends `payload` as an Echo Request without waiting for the reply.
    pub fn submit(&self, payload: &[u8], peer: Ipv4Addr) -> Result<PendingReply> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let key = (self.identifier, sequence);

        let (tx, rx) = bounded(1);
        {
            // registered before sending so a fast reply cannot be missed;
            // the reader drops its liveness handle before clearing this map
            let mut pending = lock(&self.pending);
            if !self.is_alive() {
                return Err(reader_stopped());
            }
            pending.insert(key, tx);
        }
        let reply = PendingReply {
            key,
            rx,
            pending: Arc::clone(&self.pending),
        };

        let request = EchoMessage::request(self.code, self.identifier, sequence, payload.to_vec());
        self.transport.send_to(&request.encode(), peer)?;
        trace!("echo request id={} seq={} to {}", key.0, key.1, peer);

        Ok(reply)
    }

    /// Sends `payload` and blocks until the matching reply arrives or
    /// `timeout` passes.
    pub fn send_and_await_reply(
        &self,
        payload: &[u8],
        peer: Ipv4Addr,
        timeout: Duration,
    ) -> Result<Inbound> {
        self.submit(payload, peer)?.wait(timeout)
    }
}

impl<T: IcmpTransport> Drop for Correlator<T> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                error!("icmp reader thread panicked");
            }
        }
    }
}

/// A request that has been sent and not yet answered.
///
/// Dropping it forgets the request; a late reply is then discarded.
pub struct PendingReply {
    key: Key,
    rx: Receiver<Inbound>,
    pending: Pending,
}

impl PendingReply {
    pub fn sequence(&self) -> u16 {
        self.key.1
    }

    pub fn wait(self, timeout: Duration) -> Result<Inbound> {
        match self.rx.recv_timeout(timeout) {
            Ok(inbound) => Ok(inbound),
            Err(RecvTimeoutError::Timeout) => Err(TunnelError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(reader_stopped()),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.key);
    }
}

fn reader_stopped() -> TunnelError {
    TunnelError::transport(
        "icmp reader stopped",
        std::io::Error::from(std::io::ErrorKind::BrokenPipe),
    )
}

fn demux<T: IcmpTransport>(
    transport: &T,
    identifier: u16,
    pending: &Pending,
    running: &AtomicBool,
    alive: Sender<()>,
) {
    let mut buf = vec![0u8; RECV_BUF_SIZE];

    while running.load(Ordering::Relaxed) {
        let (n, from) = match transport.recv_from(&mut buf) {
            Ok(Some(got)) => got,
            Ok(None) => continue,
            Err(TunnelError::Malformed(why)) => {
                trace!("dropping datagram: {why}");
                continue;
            }
            Err(e) => {
                error!("icmp reader stopped: {e}");
                break;
            }
        };

        let message = match icmp::decode(&buf[..n]) {
            Ok(m) => m,
            Err(e) => {
                trace!("dropping datagram from {from}: {e}");
                continue;
            }
        };
        if message.kind != EchoKind::Reply || message.identifier != identifier {
            trace!(
                "ignoring {:?} id={} seq={} from {}",
                message.kind,
                message.identifier,
                message.sequence,
                from
            );
            continue;
        }

        match lock(pending).remove(&message.key()) {
            Some(tx) => {
                // the waiter may have given up already
                let _ = tx.send(Inbound { from, message });
            }
            None => debug!(
                "late or unknown reply id={} seq={} from {}",
                message.identifier, message.sequence, from
            ),
        }
    }

    drop(alive);
    // wake every waiter instead of leaving it to its timeout
    lock(pending).clear();
}

/// Every echo message arriving on `transport`, requests and replies alike.
///
/// The sequence never ends by itself; poll timeouts and undecodable
/// datagrams are skipped, transport failures are yielded as errors.
pub fn listen<T: IcmpTransport>(transport: &T) -> Incoming<'_, T> {
    Incoming {
        transport,
        buf: vec![0u8; RECV_BUF_SIZE],
    }
}

pub struct Incoming<'a, T: IcmpTransport> {
    transport: &'a T,
    buf: Vec<u8>,
}

impl<T: IcmpTransport> Iterator for Incoming<'_, T> {
    type Item = Result<Inbound>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (n, from) = match self.transport.recv_from(&mut self.buf) {
                Ok(Some(got)) => got,
                Ok(None) => continue,
                Err(TunnelError::Malformed(why)) => {
                    trace!("dropping datagram: {why}");
                    continue;
                }
                Err(e) => return Some(Err(e)),
            };
            match icmp::decode(&self.buf[..n]) {
                Ok(message) => return Some(Ok(Inbound { from, message })),
                Err(e) => trace!("dropping datagram from {from}: {e}"),
            }
        }
    }
}
