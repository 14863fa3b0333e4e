use std::process;
use std::time::Duration;

use clap::Args;

use crate::net::icmp::TUNNEL_CODE;

/// 1500-byte MTU less the IPv4 and ICMP headers.
pub const DEFAULT_MAX_PAYLOAD: usize = 1472;

/// Echo options shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct EchoArgs {
    /// ICMP code stamped on tunnel messages. 255 marks tunnel traffic but is
    /// non-standard and may be dropped by conformant equipment; use 0 there.
    #[arg(long, default_value_t = TUNNEL_CODE)]
    pub code: u8,

    /// Echo identifier [default: process id]
    #[arg(long)]
    pub identifier: Option<u16>,

    /// Deadline for one echo round trip, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub timeout_ms: u64,

    /// Largest payload carried by a single echo message.
    #[arg(long, default_value_t = DEFAULT_MAX_PAYLOAD)]
    pub max_payload: usize,
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub code: u8,
    pub identifier: u16,
    pub timeout: Duration,
    pub max_payload: usize,
}

impl From<&EchoArgs> for TunnelConfig {
    fn from(args: &EchoArgs) -> Self {
        TunnelConfig {
            code: args.code,
            identifier: args
                .identifier
                .unwrap_or((process::id() & 0xFFFF) as u16),
            timeout: Duration::from_millis(args.timeout_ms),
            max_payload: args.max_payload,
        }
    }
}
