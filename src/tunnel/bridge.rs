//! Carries IPv4 payloads read from a virtual adapter across the echo tunnel
//! and injects the replies back into the adapter.

use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver};
use log::{debug, info, warn};
use tun_tap::Iface;

use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::net::ipv4::{self, Ipv4Header};
use crate::tunnel::correlator::{Correlator, IcmpTransport, PendingReply};

/// Largest packet read from the adapter.
pub const PACKET_BUF_SIZE: usize = 65535;

/// Replies awaited concurrently before the outbound side blocks.
const IN_FLIGHT: usize = 256;

/// Pause after a read that found nothing, so a nonblocking adapter does not
/// spin.
const IDLE_BACKOFF: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterRead {
    /// A packet of this many bytes is at the front of the buffer.
    Packet(usize),
    /// Nothing available right now.
    Empty,
    /// The adapter handle is gone.
    Closed,
}

/// Packet-level virtual network interface.
pub trait PacketAdapter: Send + Sync + 'static {
    fn receive(&self, buf: &mut [u8]) -> Result<AdapterRead>;
    fn send(&self, packet: &[u8]) -> Result<()>;
}

/// Sorts the outcome of one adapter read into retry, stop, or failure.
pub fn classify(read: io::Result<usize>) -> Result<AdapterRead> {
    match read {
        Ok(0) => Ok(AdapterRead::Closed),
        Ok(n) => Ok(AdapterRead::Packet(n)),
        Err(e) => match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(AdapterRead::Empty),
            _ => match e.raw_os_error() {
                Some(libc::EBADF) => Ok(AdapterRead::Closed),
                Some(libc::EBADFD) | Some(libc::EFAULT) | Some(libc::EINVAL) => {
                    Err(TunnelError::AdapterFatal(e.to_string()))
                }
                _ => Err(TunnelError::transport("fail to read from adapter", e)),
            },
        },
    }
}

impl PacketAdapter for Iface {
    fn receive(&self, buf: &mut [u8]) -> Result<AdapterRead> {
        classify(self.recv(buf))
    }

    fn send(&self, packet: &[u8]) -> Result<()> {
        Iface::send(self, packet)
            .map(|_| ())
            .map_err(|e| TunnelError::transport("fail to write to adapter", e))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BridgeStats {
    /// payloads sent toward the remote
    pub forwarded: u64,
    /// reply packets written to the adapter
    pub injected: u64,
    /// packets that were not ours to carry
    pub skipped: u64,
    /// exchanges lost to timeouts or transport errors
    pub failed: u64,
}

struct InFlight {
    reply: PendingReply,
    /// sender of the original packet, the destination of the answer
    origin: Ipv4Addr,
    sent_at: Instant,
}

pub struct Bridge<A: PacketAdapter, T: IcmpTransport> {
    adapter: Arc<A>,
    correlator: Arc<Correlator<T>>,
    remote: Ipv4Addr,
    protocol: u8,
    timeout: Duration,
    max_payload: usize,
}

impl<A: PacketAdapter, T: IcmpTransport> Bridge<A, T> {
    pub fn new(
        adapter: Arc<A>,
        correlator: Arc<Correlator<T>>,
        remote: Ipv4Addr,
        protocol: u8,
        cfg: &TunnelConfig,
    ) -> Self {
        Bridge {
            adapter,
            correlator,
            remote,
            protocol,
            timeout: cfg.timeout,
            max_payload: cfg.max_payload,
        }
    }

    /// Pumps packets until the adapter closes or fails fatally.
    pub fn run(&self) -> Result<BridgeStats> {
        let (tx, rx) = bounded::<InFlight>(IN_FLIGHT);

        let inject = {
            let adapter = Arc::clone(&self.adapter);
            let protocol = self.protocol;
            let timeout = self.timeout;
            thread::Builder::new()
                .name("bridge-inject".into())
                .spawn(move || inject_replies(&*adapter, protocol, timeout, rx))
                .map_err(|e| TunnelError::transport("fail to spawn inject thread", e))?
        };

        let mut stats = BridgeStats::default();
        let outbound = self.pump_outbound(&mut stats, |flight| {
            // fails only once the inject side has stopped
            tx.send(flight).is_ok()
        });
        drop(tx);

        let returned = match inject.join() {
            Ok(r) => r,
            Err(_) => Err(TunnelError::AdapterFatal("inject thread panicked".into())),
        };

        outbound?;
        let (injected, failed) = returned?;
        stats.injected = injected;
        stats.failed += failed;
        info!(
            "bridge stopped: {} forwarded, {} injected, {} skipped, {} failed",
            stats.forwarded, stats.injected, stats.skipped, stats.failed
        );
        Ok(stats)
    }

    fn pump_outbound<F>(&self, stats: &mut BridgeStats, mut hand_off: F) -> Result<()>
    where
        F: FnMut(InFlight) -> bool,
    {
        let mut buf = vec![0u8; PACKET_BUF_SIZE];
        loop {
            let n = match self.adapter.receive(&mut buf)? {
                AdapterRead::Packet(n) => n,
                AdapterRead::Empty => {
                    thread::sleep(IDLE_BACKOFF);
                    continue;
                }
                AdapterRead::Closed => {
                    debug!("adapter closed");
                    return Ok(());
                }
            };
            let packet = &buf[..n];

            let hdr = match Ipv4Header::parse(packet) {
                Ok(hdr) if hdr.protocol == self.protocol => hdr,
                Ok(_) => {
                    stats.skipped += 1;
                    continue;
                }
                Err(e) => {
                    debug!("skipping packet: {e}");
                    stats.skipped += 1;
                    continue;
                }
            };
            let payload = &packet[hdr.payload_range()];
            if payload.len() > self.max_payload {
                warn!(
                    "dropping {} byte payload from {}: above the {} byte limit",
                    payload.len(),
                    hdr.src,
                    self.max_payload
                );
                stats.failed += 1;
                continue;
            }

            let reply = match self.correlator.submit(payload, self.remote) {
                Ok(r) => r,
                Err(e) if !self.correlator.is_alive() => {
                    stats.failed += 1;
                    return Err(e);
                }
                Err(e) => {
                    warn!("fail to forward packet from {}: {e}", hdr.src);
                    stats.failed += 1;
                    continue;
                }
            };
            stats.forwarded += 1;
            if !hand_off(InFlight {
                reply,
                origin: hdr.src,
                sent_at: Instant::now(),
            }) {
                return Ok(());
            }
        }
    }
}

/// Return direction: waits for replies in submission order and writes each
/// one into the adapter as a fresh IPv4 packet.
fn inject_replies<A: PacketAdapter>(
    adapter: &A,
    protocol: u8,
    timeout: Duration,
    flights: Receiver<InFlight>,
) -> Result<(u64, u64)> {
    let (mut injected, mut failed) = (0u64, 0u64);

    for flight in flights.iter() {
        let sequence = flight.reply.sequence();
        let left = timeout.saturating_sub(flight.sent_at.elapsed());
        let inbound = match flight.reply.wait(left) {
            Ok(inbound) => inbound,
            Err(e) => {
                debug!("no answer for seq={} from {}: {e}", sequence, flight.origin);
                failed += 1;
                continue;
            }
        };

        let packet = match ipv4::build_packet(
            protocol,
            inbound.from,
            flight.origin,
            &inbound.message.payload,
        ) {
            Ok(p) => {
                debug_assert!(ipv4::verify(&p));
                p
            }
            Err(e) => {
                warn!("fail to build reply packet: {e}");
                failed += 1;
                continue;
            }
        };

        match adapter.send(&packet) {
            Ok(()) => injected += 1,
            Err(e @ TunnelError::AdapterFatal(_)) => return Err(e),
            Err(e) => {
                warn!("fail to inject reply for {}: {e}", flight.origin);
                failed += 1;
            }
        }
    }

    Ok((injected, failed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ipv4::protocol;
    use crate::tunnel::testutil::{config, spawn_peer, FailingTransport, MemoryTransport, PEER};

    use crossbeam_channel::{unbounded, Sender};
    use std::sync::Mutex;

    const HOST: Ipv4Addr = Ipv4Addr::new(10, 8, 0, 2);
    const TARGET: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

    /// Adapter fed from a queue of read outcomes; written packets are kept.
    struct FakeAdapter {
        reads: Mutex<Vec<io::Result<Vec<u8>>>>,
        written: Sender<Vec<u8>>,
    }

    impl FakeAdapter {
        fn new(mut reads: Vec<io::Result<Vec<u8>>>) -> (Self, Receiver<Vec<u8>>) {
            reads.reverse();
            let (written, rx) = unbounded();
            (
                FakeAdapter {
                    reads: Mutex::new(reads),
                    written,
                },
                rx,
            )
        }
    }

    impl PacketAdapter for FakeAdapter {
        fn receive(&self, buf: &mut [u8]) -> Result<AdapterRead> {
            let next = self.reads.lock().unwrap().pop();
            match next {
                Some(Ok(p)) => {
                    buf[..p.len()].copy_from_slice(&p);
                    classify(Ok(p.len()))
                }
                Some(Err(e)) => classify(Err(e)),
                None => Ok(AdapterRead::Closed),
            }
        }

        fn send(&self, packet: &[u8]) -> Result<()> {
            self.written.send(packet.to_vec()).unwrap();
            Ok(())
        }
    }

    fn bridge(adapter: FakeAdapter, local: MemoryTransport) -> Bridge<FakeAdapter, MemoryTransport> {
        let cfg = config();
        let correlator = Arc::new(Correlator::new(Arc::new(local), &cfg).unwrap());
        Bridge::new(Arc::new(adapter), correlator, PEER, protocol::TCP, &cfg)
    }

    #[test]
    fn reply_is_injected_toward_original_sender() {
        let outbound = ipv4::build_packet(protocol::TCP, HOST, TARGET, b"syn").unwrap();
        let (adapter, written) = FakeAdapter::new(vec![
            Err(io::ErrorKind::WouldBlock.into()),
            Ok(outbound),
        ]);
        let (local, remote) = MemoryTransport::pair(PEER);
        let _peer = spawn_peer(remote, |req| {
            assert_eq!(req.payload, b"syn");
            Some(b"syn-ack".to_vec())
        });

        let stats = bridge(adapter, local).run().unwrap();
        assert_eq!(stats.forwarded, 1);
        assert_eq!(stats.injected, 1);

        let packet = written.try_recv().unwrap();
        assert!(ipv4::verify(&packet));
        let hdr = Ipv4Header::parse(&packet).unwrap();
        assert_eq!(hdr.src, PEER);
        assert_eq!(hdr.dst, HOST);
        assert_eq!(hdr.protocol, protocol::TCP);
        assert_eq!(&packet[hdr.payload_range()], b"syn-ack");
    }

    #[test]
    fn other_protocols_and_garbage_are_skipped() {
        let udp = ipv4::build_packet(protocol::UDP, HOST, TARGET, b"dns").unwrap();
        let (adapter, written) = FakeAdapter::new(vec![Ok(udp), Ok(vec![0x60; 40])]);
        let (local, _remote) = MemoryTransport::pair(PEER);

        let stats = bridge(adapter, local).run().unwrap();
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.forwarded, 0);
        assert!(written.try_recv().is_err());
    }

    #[test]
    fn unanswered_packet_counts_as_failed() {
        let outbound = ipv4::build_packet(protocol::TCP, HOST, TARGET, b"lost").unwrap();
        let (adapter, written) = FakeAdapter::new(vec![Ok(outbound)]);
        let (local, remote) = MemoryTransport::pair(PEER);
        let _peer = spawn_peer(remote, |_| None);

        let cfg = TunnelConfig {
            timeout: Duration::from_millis(100),
            ..config()
        };
        let correlator = Arc::new(Correlator::new(Arc::new(local), &cfg).unwrap());
        let stats = Bridge::new(Arc::new(adapter), correlator, PEER, protocol::TCP, &cfg)
            .run()
            .unwrap();

        assert_eq!(stats.forwarded, 1);
        assert_eq!(stats.failed, 1);
        assert!(written.try_recv().is_err());
    }

    #[test]
    fn fatal_adapter_state_is_surfaced() {
        let (adapter, _written) =
            FakeAdapter::new(vec![Err(io::Error::from_raw_os_error(libc::EBADFD))]);
        let (local, _remote) = MemoryTransport::pair(PEER);

        let err = bridge(adapter, local).run().unwrap_err();
        assert!(matches!(err, TunnelError::AdapterFatal(_)));
    }

    #[test]
    fn empty_reads_back_off() {
        const EMPTY_READS: u32 = 10;
        let reads = (0..EMPTY_READS)
            .map(|_| Err(io::ErrorKind::WouldBlock.into()))
            .collect();
        let (adapter, _written) = FakeAdapter::new(reads);
        let (local, _remote) = MemoryTransport::pair(PEER);

        let started = Instant::now();
        bridge(adapter, local).run().unwrap();
        assert!(started.elapsed() >= IDLE_BACKOFF * EMPTY_READS);
    }

    #[test]
    fn dead_reader_stops_the_bridge() {
        let outbound = ipv4::build_packet(protocol::TCP, HOST, TARGET, b"late").unwrap();
        let (adapter, _written) = FakeAdapter::new(vec![Ok(outbound)]);
        let (transport, fail) = FailingTransport::new();
        let correlator = Arc::new(Correlator::new(Arc::new(transport), &config()).unwrap());

        fail.send(()).unwrap();
        assert!(matches!(
            correlator.stopped().recv_timeout(Duration::from_secs(2)),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected)
        ));

        let err = Bridge::new(Arc::new(adapter), correlator, PEER, protocol::TCP, &config())
            .run()
            .unwrap_err();
        assert!(matches!(err, TunnelError::Transport { .. }));
    }

    #[test]
    fn read_outcomes() {
        assert_eq!(classify(Ok(60)).unwrap(), AdapterRead::Packet(60));
        assert_eq!(classify(Ok(0)).unwrap(), AdapterRead::Closed);
        assert_eq!(
            classify(Err(io::ErrorKind::Interrupted.into())).unwrap(),
            AdapterRead::Empty
        );
        assert_eq!(
            classify(Err(io::Error::from_raw_os_error(libc::EBADF))).unwrap(),
            AdapterRead::Closed
        );
        assert!(matches!(
            classify(Err(io::Error::from_raw_os_error(libc::EIO))),
            Err(TunnelError::Transport { .. })
        ));
    }
}
