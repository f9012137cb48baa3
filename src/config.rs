/// Settings shared by every connection of a relay.
///
/// Built with chained setters in the same way as a client's connect options:
///
/// ```
/// use stomp_relay::RelayConfig;
///
/// let config = RelayConfig::default()
///     .server_name("relay/1.0")
///     .min_heartbeat_ms(5000);
/// assert_eq!(config.versions, vec!["1.2".to_string(), "1.1".to_string()]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Value of the CONNECTED `server` header. Falls back to the client's
    /// `host` header when unset.
    pub server_name: Option<String>,
    /// Supported protocol versions, newest first.
    pub versions: Vec<String>,
    /// Smallest heartbeat interval the relay agrees to, in milliseconds.
    pub min_heartbeat_ms: u64,
    /// Reserved session id of the relay's own system connection.
    pub system_session_id: String,
    /// Upper bound for a single decoded frame, if any.
    pub max_frame_size: Option<usize>,
    /// Address the TCP server binds to.
    pub bind_addr: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server_name: None,
            versions: vec!["1.2".to_string(), "1.1".to_string()],
            min_heartbeat_ms: 10_000,
            system_session_id: "$system".to_string(),
            max_frame_size: Some(1024 * 1024),
            bind_addr: "127.0.0.1:61613".to_string(),
        }
    }
}

impl RelayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Replace the supported versions. Order them newest first.
    pub fn versions<I, S>(mut self, versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.versions = versions.into_iter().map(Into::into).collect();
        self
    }

    pub fn min_heartbeat_ms(mut self, ms: u64) -> Self {
        self.min_heartbeat_ms = ms;
        self
    }

    pub fn system_session_id(mut self, id: impl Into<String>) -> Self {
        self.system_session_id = id.into();
        self
    }

    pub fn max_frame_size(mut self, max: Option<usize>) -> Self {
        self.max_frame_size = max;
        self
    }

    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    /// Newest version supported by both sides.
    pub fn negotiate_version(&self, offered: &[&str]) -> Option<&str> {
        self.versions
            .iter()
            .find(|v| offered.iter().any(|o| o.trim() == v.as_str()))
            .map(String::as_str)
    }
}
