//! Sync client configuration.

use std::time::Duration;

/// Reconnect scheduling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectMode {
    /// Exponential backoff after involuntary disconnects.
    #[default]
    Normal,
    /// Immediate reconnects; for tests only.
    Testing,
}

/// Configuration of a [`Client`](crate::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Platform description sent in the user agent.
    pub user_agent_platform_info: String,
    /// Application description appended to the user agent.
    pub user_agent_application_info: String,
    /// Abort TCP/TLS/WebSocket establishment after this long.
    pub connect_timeout: Duration,
    /// Keep an idle connection open this long before closing it.
    pub connection_linger_time: Duration,
    /// Send a PING this often.
    pub ping_keepalive_period: Duration,
    /// Terminate if no PONG arrives within this window.
    pub pong_keepalive_timeout: Duration,
    /// Reconnects within this window of a disconnect skip the upload
    /// activation delay.
    pub fast_reconnect_limit: Duration,
    /// Give every session its own connection.
    pub one_connection_per_session: bool,
    /// Upload immediately instead of waiting for the first download
    /// completion.
    pub disable_upload_activation_delay: bool,
    /// Send empty changesets instead of skipping them.
    pub disable_upload_compaction: bool,
    /// Set TCP_NODELAY on the transport.
    pub tcp_no_delay: bool,
    /// Run the protocol without applying downloads or uploading.
    pub dry_run: bool,
    /// Skip fsync on integration commits.
    pub disable_sync_to_disk: bool,
    /// Reconnect scheduling mode.
    pub reconnect_mode: ReconnectMode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent_platform_info: String::new(),
            user_agent_application_info: String::new(),
            connect_timeout: Duration::from_secs(120),
            connection_linger_time: Duration::from_secs(30),
            ping_keepalive_period: Duration::from_secs(60),
            pong_keepalive_timeout: Duration::from_secs(120),
            fast_reconnect_limit: Duration::from_secs(60),
            one_connection_per_session: false,
            disable_upload_activation_delay: false,
            disable_upload_compaction: false,
            tcp_no_delay: false,
            dry_run: false,
            disable_sync_to_disk: false,
            reconnect_mode: ReconnectMode::Normal,
        }
    }
}

impl ClientConfig {
    /// A configuration suited to tests: tiny timeouts, immediate
    /// reconnects, no activation delay.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            connection_linger_time: Duration::from_millis(50),
            ping_keepalive_period: Duration::from_millis(200),
            pong_keepalive_timeout: Duration::from_millis(400),
            fast_reconnect_limit: Duration::from_millis(500),
            disable_upload_activation_delay: true,
            reconnect_mode: ReconnectMode::Testing,
            ..Self::default()
        }
    }

    /// The combined user agent string.
    #[must_use]
    pub fn user_agent(&self) -> String {
        if self.user_agent_application_info.is_empty() {
            self.user_agent_platform_info.clone()
        } else {
            format!(
                "{} {}",
                self.user_agent_platform_info, self.user_agent_application_info
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ClientConfig::default();
        assert!(config.ping_keepalive_period < config.pong_keepalive_timeout);
        assert_eq!(config.reconnect_mode, ReconnectMode::Normal);
    }

    #[test]
    fn user_agent_concatenation() {
        let mut config = ClientConfig::default();
        config.user_agent_platform_info = "terndb/0.4".into();
        assert_eq!(config.user_agent(), "terndb/0.4");
        config.user_agent_application_info = "app/1.0".into();
        assert_eq!(config.user_agent(), "terndb/0.4 app/1.0");
    }
}
