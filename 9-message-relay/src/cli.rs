use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    num::NonZeroUsize,
    time::Duration,
};

use clap::Parser;
use url::Url;

use crate::server::{DEFAULT_BACKEND_TIMEOUT, DEFAULT_OUTBOUND_BUFFER, RelayConfig};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address the relay binds to.
    #[arg(long, env = "RELAY_HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    /// Port the relay listens on. Use 0 for an ephemeral port.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Base URL of the backend API, e.g. https://api.example.com/api/v1
    #[arg(long, env = "BACKEND_URL")]
    pub backend_url: Url,

    /// Milliseconds to wait for the backend before dropping an event.
    #[arg(long, env = "BACKEND_TIMEOUT_MS", default_value_t = DEFAULT_BACKEND_TIMEOUT.as_millis() as u64)]
    pub backend_timeout_ms: u64,

    /// Frames buffered per client before fan-out starts dropping them.
    #[arg(long, env = "RELAY_OUTBOUND_BUFFER", default_value_t = DEFAULT_OUTBOUND_BUFFER)]
    pub outbound_buffer: NonZeroUsize,

    /// Report failed events back to the sender with an error frame.
    #[arg(long, env = "RELAY_ERROR_FRAMES")]
    pub error_frames: bool,
}

impl Cli {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            backend_url: self.backend_url.clone(),
            backend_timeout: Duration::from_millis(self.backend_timeout_ms),
            outbound_buffer: self.outbound_buffer,
            error_frames: self.error_frames,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags_into_relay_config() {
        let cli = Cli::try_parse_from([
            "message-relay",
            "--host",
            "127.0.0.1",
            "--port",
            "9001",
            "--backend-url",
            "https://backend.test/api/v1",
            "--backend-timeout-ms",
            "2500",
            "--outbound-buffer",
            "8",
            "--error-frames",
        ])
        .expect("valid arguments");

        let expected: SocketAddr = "127.0.0.1:9001".parse().expect("addr");
        assert_eq!(cli.listen_addr(), expected);
        let config = cli.relay_config();
        assert_eq!(config.backend_url.as_str(), "https://backend.test/api/v1");
        assert_eq!(config.backend_timeout, Duration::from_millis(2500));
        assert_eq!(config.outbound_buffer.get(), 8);
        assert!(config.error_frames);
    }

    #[test]
    fn defaults_match_relay_config() {
        let cli = Cli::try_parse_from(["message-relay", "--backend-url", "https://backend.test"])
            .expect("valid arguments");

        let config = cli.relay_config();
        let defaults = RelayConfig::new(cli.backend_url.clone());
        assert_eq!(config.backend_timeout, defaults.backend_timeout);
        assert_eq!(config.outbound_buffer, defaults.outbound_buffer);
    }

    #[test]
    fn rejects_zero_outbound_buffer() {
        let result = Cli::try_parse_from([
            "message-relay",
            "--backend-url",
            "https://backend.test",
            "--outbound-buffer",
            "0",
        ]);
        assert!(result.is_err());
    }
}
