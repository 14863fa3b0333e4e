use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use log::info;

use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::http;
use crate::tunnel::correlator::{Correlator, IcmpTransport};

/// Carries serialized HTTP requests to the remote responder, one echo round
/// trip per request.
pub struct HttpGateway<T: IcmpTransport> {
    correlator: Arc<Correlator<T>>,
    remote: Ipv4Addr,
    timeout: Duration,
    max_payload: usize,
}

impl<T: IcmpTransport> HttpGateway<T> {
    pub fn new(correlator: Arc<Correlator<T>>, remote: Ipv4Addr, cfg: &TunnelConfig) -> Self {
        HttpGateway {
            correlator,
            remote,
            timeout: cfg.timeout,
            max_payload: cfg.max_payload,
        }
    }

    /// Largest serialized request that fits one echo payload.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Sends `request` and returns the serialized response from the reply.
    ///
    /// Requests that would not fit one echo payload are refused before
    /// anything is sent; there is no fragmentation.
    pub fn forward(&self, request: &[u8]) -> Result<Vec<u8>> {
        if request.len() > self.max_payload {
            return Err(TunnelError::PayloadTooLarge {
                size: request.len(),
                limit: self.max_payload,
            });
        }

        let reply = self
            .correlator
            .send_and_await_reply(request, self.remote, self.timeout)?;
        let payload = reply.message.payload;

        let Some(status) = http::status_code(&payload) else {
            return Err(TunnelError::ProtocolMismatch(format!(
                "reply of {} bytes from {} is not an http response",
                payload.len(),
                reply.from
            )));
        };
        info!(
            "Get ICMP packet code: {} seq: {} status: {}",
            reply.message.code, reply.message.sequence, status
        );

        Ok(payload)
    }
}

/// HTTP status and reason reported to the client for a failed exchange.
pub fn status_for(err: &TunnelError) -> (u16, &'static str) {
    match err {
        TunnelError::Timeout(_) => (504, "Gateway Timeout"),
        TunnelError::ProtocolMismatch(_) | TunnelError::Malformed(_) => (502, "Bad Gateway"),
        TunnelError::PayloadTooLarge { .. }
        | TunnelError::Transport { .. }
        | TunnelError::AdapterFatal(_) => (503, "Service Unavailable"),
    }
}
