use clap::Parser;

use stomp_relay::RelayConfig;

#[derive(Parser, Debug)]
#[command(name = "stomp-relay")]
#[command(version)]
#[command(about = "STOMP 1.2 relay in front of an in-process broker")]
pub struct Cli {
    /// Address to listen on (host:port)
    #[arg(short, long, default_value = "127.0.0.1:61613", env = "STOMP_RELAY_BIND")]
    pub bind: String,

    /// Value of the `server` header in CONNECTED (defaults to the client's host)
    #[arg(long, env = "STOMP_RELAY_SERVER_NAME")]
    pub server_name: Option<String>,

    /// Smallest heartbeat interval accepted, in ms
    #[arg(long, default_value_t = 10_000)]
    pub min_heartbeat: u64,

    /// Largest frame accepted, in bytes (0 disables the limit)
    #[arg(long, default_value_t = 1024 * 1024)]
    pub max_frame_size: usize,

    /// Log level (trace, debug, info, warn, error) or a full filter directive
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,
}

impl Cli {
    pub fn config(&self) -> RelayConfig {
        let config = RelayConfig::default()
            .bind_addr(self.bind.clone())
            .min_heartbeat_ms(self.min_heartbeat)
            .max_frame_size((self.max_frame_size > 0).then_some(self.max_frame_size));
        match &self.server_name {
            Some(name) => config.server_name(name.clone()),
            None => config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_max_frame_size_disables_limit() {
        let cli = Cli::parse_from(["stomp-relay", "--max-frame-size", "0", "--server-name", "edge"]);
        let config = cli.config();
        assert_eq!(config.max_frame_size, None);
        assert_eq!(config.server_name.as_deref(), Some("edge"));
        assert_eq!(config.min_heartbeat_ms, 10_000);
    }
}
