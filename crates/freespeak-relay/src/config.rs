use std::net::SocketAddr;

use clap::Parser;
use freespeak_common::MAX_FRAME_BYTES;

pub const DEFAULT_MOTD: &str = "Use Tor or a proxy server for privacy.";
pub const DEFAULT_OUTBOX_CAPACITY: usize = 128;

#[derive(Parser, Debug, Clone)]
#[command(name = "freespeak-relay")]
#[command(about = "Freespeak relay - forwards opaque handshake and message frames between ephemeral identities")]
pub struct Args {
    /// HTTP/WebSocket listen address
    #[arg(long, env = "FREESPEAK_LISTEN", default_value = "127.0.0.1:3000")]
    pub listen: SocketAddr,

    /// Message of the day sent with every successful registration
    #[arg(long, env = "FREESPEAK_MOTD", default_value = DEFAULT_MOTD)]
    pub motd: String,

    /// Largest accepted text frame, in bytes
    #[arg(long, env = "FREESPEAK_MAX_FRAME_BYTES", default_value_t = MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,

    /// Frames queued per connection before forwards to it are dropped
    #[arg(long, env = "FREESPEAK_OUTBOX_CAPACITY", default_value_t = DEFAULT_OUTBOX_CAPACITY)]
    pub outbox_capacity: usize,

    /// Log level
    #[arg(long, env = "FREESPEAK_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Settings the router consults while handling frames.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub motd: String,
    pub max_frame_bytes: usize,
    pub outbox_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            motd: DEFAULT_MOTD.to_string(),
            max_frame_bytes: MAX_FRAME_BYTES,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }
}

impl From<&Args> for RelayConfig {
    fn from(args: &Args) -> Self {
        Self {
            motd: args.motd.clone(),
            max_frame_bytes: args.max_frame_bytes,
            outbox_capacity: args.outbox_capacity.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_args_defaults() {
        let args = Args::parse_from(["freespeak-relay"]);
        let config = RelayConfig::from(&args);
        let defaults = RelayConfig::default();
        assert_eq!(config.motd, defaults.motd);
        assert_eq!(config.max_frame_bytes, 16384);
        assert_eq!(config.outbox_capacity, defaults.outbox_capacity);
    }

    #[test]
    fn test_zero_outbox_capacity_is_clamped() {
        let args = Args::parse_from(["freespeak-relay", "--outbox-capacity", "0"]);
        assert_eq!(RelayConfig::from(&args).outbox_capacity, 1);
    }
}
