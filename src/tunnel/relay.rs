//! Bidirectional byte pump between two stream endpoints.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::bounded;
use log::{debug, trace};

use crate::error::{Result, TunnelError};

/// A duplex stream that can hand out independent read and write halves and
/// be closed from any thread.
pub trait Endpoint: Send + Sync + 'static {
    type Reader: Read + Send + 'static;
    type Writer: Write + Send + 'static;

    fn reader(&self) -> io::Result<Self::Reader>;
    fn writer(&self) -> io::Result<Self::Writer>;
    /// Closes both directions; pending reads on other halves return.
    fn close(&self);
}

impl Endpoint for TcpStream {
    type Reader = TcpStream;
    type Writer = TcpStream;

    fn reader(&self) -> io::Result<TcpStream> {
        self.try_clone()
    }

    fn writer(&self) -> io::Result<TcpStream> {
        self.try_clone()
    }

    fn close(&self) {
        if let Err(e) = self.shutdown(Shutdown::Both) {
            // already closed by the other side
            trace!("shutdown: {e}");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    AToB,
    BToA,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Closes both endpoints when dropped, whichever way the pump exits.
struct CloseGuard<A: Endpoint, B: Endpoint> {
    a: Arc<A>,
    b: Arc<B>,
}

impl<A: Endpoint, B: Endpoint> Drop for CloseGuard<A, B> {
    fn drop(&mut self) {
        self.a.close();
        self.b.close();
    }
}

/// Copies A→B and B→A concurrently until either side reaches end of stream
/// or fails, then closes both and waits for both pumps.
///
/// The result reflects the direction that ended first; an error there is
/// returned, failures the close provokes on the other direction are not.
pub fn relay<A: Endpoint, B: Endpoint>(a: A, b: B) -> Result<RelayStats> {
    let a = Arc::new(a);
    let b = Arc::new(b);

    let halves = || -> io::Result<_> {
        Ok((a.reader()?, b.writer()?, b.reader()?, a.writer()?))
    };
    let (mut a_rd, mut b_wr, mut b_rd, mut a_wr) = match halves() {
        Ok(h) => h,
        Err(e) => {
            a.close();
            b.close();
            return Err(TunnelError::transport("fail to split relay endpoints", e));
        }
    };

    let (done_tx, done_rx) = bounded(2);

    let forward = {
        let guard = CloseGuard {
            a: Arc::clone(&a),
            b: Arc::clone(&b),
        };
        let done = done_tx.clone();
        thread::Builder::new()
            .name("relay-a-b".into())
            .spawn(move || {
                let _guard = guard;
                let res = io::copy(&mut a_rd, &mut b_wr);
                let _ = done.send((Direction::AToB, res));
            })
    };
    let forward = match forward {
        Ok(h) => h,
        Err(e) => return Err(TunnelError::transport("fail to spawn relay thread", e)),
    };

    // B→A runs on this thread
    {
        let _guard = CloseGuard {
            a: Arc::clone(&a),
            b: Arc::clone(&b),
        };
        let res = io::copy(&mut b_rd, &mut a_wr);
        let _ = done_tx.send((Direction::BToA, res));
    }
    drop(done_tx);

    if forward.join().is_err() {
        debug!("relay pump panicked");
    }

    let mut stats = RelayStats::default();
    let mut first: Option<io::Error> = None;
    let mut first_seen = false;
    for (dir, res) in done_rx.iter() {
        match res {
            Ok(n) => match dir {
                Direction::AToB => stats.a_to_b = n,
                Direction::BToA => stats.b_to_a = n,
            },
            Err(e) if !first_seen => first = Some(e),
            Err(e) => trace!("{dir:?} ended after close: {e}"),
        }
        first_seen = true;
    }

    debug!(
        "relay closed: {} bytes a->b, {} bytes b->a",
        stats.a_to_b, stats.b_to_a
    );
    match first {
        Some(e) => Err(TunnelError::transport("relay i/o failed", e)),
        None => Ok(stats),
    }
}
