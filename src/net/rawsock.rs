use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use libc::{c_int, c_void, size_t, socklen_t};
use log::error;
use os_socketaddr::OsSocketAddr;

use crate::error::{Result, TunnelError};
use crate::net::ipv4;
use crate::tunnel::correlator::IcmpTransport;

/// Raw `AF_INET`/`IPPROTO_ICMP` socket.
///
/// Every method takes `&self`; one reader thread and any number of writers
/// may share the socket through an `Arc`.
pub struct RawSocket {
    sock: c_int,
}

impl RawSocket {
    /// Opens the socket with the given outgoing TTL. Reads give up after
    /// `poll` so reader loops can notice shutdown.
    #[cfg(target_family = "unix")]
    pub fn new_icmp(ip_ttl: u8, poll: Duration) -> Result<Self> {
        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_RAW, libc::IPPROTO_ICMP) };
        if sock < 0 {
            return Err(TunnelError::transport(
                "fail to create socket",
                io::Error::last_os_error(),
            ));
        }
        // closes on early return
        let rs = RawSocket { sock };

        let ttl = ip_ttl as c_int;
        rs.setsockopt(libc::IPPROTO_IP, libc::IP_TTL, &ttl)
            .map_err(|e| TunnelError::transport("fail to set TTL", e))?;

        let tv = libc::timeval {
            tv_sec: poll.as_secs() as libc::time_t,
            tv_usec: poll.subsec_micros() as libc::suseconds_t,
        };
        rs.setsockopt(libc::SOL_SOCKET, libc::SO_RCVTIMEO, &tv)
            .map_err(|e| TunnelError::transport("fail to set receive timeout", e))?;

        Ok(rs)
    }

    fn setsockopt<T>(&self, level: c_int, name: c_int, value: &T) -> io::Result<()> {
        let rc = unsafe {
            libc::setsockopt(
                self.sock,
                level,
                name,
                value as *const T as *const c_void,
                mem::size_of::<T>() as socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(target_family = "unix")]
    pub fn sendto(&self, payload: &[u8], dst: Ipv4Addr) -> Result<usize> {
        let addr: OsSocketAddr = SocketAddr::new(IpAddr::V4(dst), 0).into();
        let nb = unsafe {
            libc::sendto(
                self.sock,
                payload.as_ptr() as *const c_void,
                payload.len() as size_t,
                0,
                addr.as_ptr(),
                addr.len(),
            )
        };
        if nb < 0 {
            return Err(TunnelError::transport(
                "fail to send data by socket",
                io::Error::last_os_error(),
            ));
        }
        Ok(nb as usize)
    }

    /// Reads one datagram, IPv4 header included. `Ok(None)` means nothing
    /// arrived within the poll interval.
    #[cfg(target_family = "unix")]
    pub fn recvfrom(&self, payload: &mut [u8]) -> Result<Option<(usize, Option<SocketAddr>)>> {
        let mut addr = OsSocketAddr::new();
        let mut addrlen = addr.capacity();
        let nb = unsafe {
            libc::recvfrom(
                self.sock,
                payload.as_mut_ptr() as *mut c_void,
                payload.len(),
                0,
                addr.as_mut_ptr(),
                &mut addrlen as *mut _,
            )
        };
        if nb < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                    Ok(None)
                }
                _ => Err(TunnelError::transport(
                    "fail to receive data from socket",
                    err,
                )),
            };
        }

        Ok(Some((nb as usize, addr.into())))
    }
}

impl IcmpTransport for RawSocket {
    fn send_to(&self, message: &[u8], peer: Ipv4Addr) -> Result<()> {
        let send = self.sendto(message, peer)?;
        if send != message.len() {
            return Err(TunnelError::transport(
                "short write on raw socket",
                io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("sent {} of {} bytes", send, message.len()),
                ),
            ));
        }
        Ok(())
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, Ipv4Addr)>> {
        let Some((recv, from)) = self.recvfrom(buf)? else {
            return Ok(None);
        };
        let from = match from {
            Some(SocketAddr::V4(a)) => *a.ip(),
            _ => return Err(TunnelError::malformed("datagram without an ipv4 source")),
        };

        Ok(Some((strip_ip_header(buf, recv)?, from)))
    }
}

/// Moves the ICMP message in `buf[..recv]` past its IPv4 header to the
/// front of `buf` and returns its length. Raw IPv4 sockets deliver the
/// header too.
fn strip_ip_header(buf: &mut [u8], recv: usize) -> Result<usize> {
    if recv == 0 {
        return Err(TunnelError::malformed("empty datagram"));
    }
    let ihl = (buf[0] & 0x0F) as usize * 4;
    if ihl < ipv4::HDR_BYTE_SIZE {
        return Err(TunnelError::malformed(format!("ihl of {ihl} bytes below minimum")));
    }
    if recv < ihl {
        return Err(TunnelError::malformed(format!(
            "datagram of {recv} bytes shorter than its ip header"
        )));
    }
    buf.copy_within(ihl..recv, 0);

    Ok(recv - ihl)
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        let code = unsafe { libc::close(self.sock) };
        if code < 0 {
            error!(
                "fail to close the socket: {}",
                io::Error::last_os_error()
            );
        }
    }
}
