//! QUIC connection configuration.

use std::time::Duration;

/// QUIC/HTTP3 configuration.
#[derive(Debug, Clone)]
pub struct QuicConfig {
    /// Attempt HTTP/3 when a host is known to support it
    pub enabled: bool,
    /// Give up on a QUIC handshake after this long and fall back to TCP
    pub handshake_timeout: Duration,
    /// Base cool-down after a failed QUIC attempt; doubles per consecutive failure
    pub broken_cooldown: Duration,
    /// Hosts assumed to speak HTTP/3 without an Alt-Svc hint
    pub prior_knowledge: Vec<String>,
    /// Concurrent request streams per HTTP/3 connection while the peer's
    /// own bidirectional stream limit is unknown
    pub initial_max_streams_bidi: u64,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            handshake_timeout: Duration::from_secs(5),
            broken_cooldown: Duration::from_secs(300),
            prior_knowledge: Vec::new(),
            initial_max_streams_bidi: 100,
        }
    }
}

impl QuicConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Config with HTTP/3 switched off.
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn broken_cooldown(mut self, cooldown: Duration) -> Self {
        self.broken_cooldown = cooldown;
        self
    }

    /// Treat `host` as HTTP/3-capable from the first request.
    pub fn prior_knowledge(mut self, host: impl Into<String>) -> Self {
        self.prior_knowledge.push(host.into());
        self
    }

    pub fn initial_max_streams_bidi(mut self, streams: u64) -> Self {
        self.initial_max_streams_bidi = streams;
        self
    }

    pub fn has_prior_knowledge(&self, host: &str) -> bool {
        self.prior_knowledge.iter().any(|h| h.eq_ignore_ascii_case(host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QuicConfig::default();
        assert!(config.enabled);
        assert_eq!(config.broken_cooldown, Duration::from_secs(300));
        assert_eq!(config.initial_max_streams_bidi, 100);
    }

    #[test]
    fn test_builder_pattern() {
        let config = QuicConfig::new()
            .handshake_timeout(Duration::from_secs(1))
            .prior_knowledge("B.example")
            .enabled(false);

        assert_eq!(config.handshake_timeout, Duration::from_secs(1));
        assert!(config.has_prior_knowledge("b.example"));
        assert!(!config.has_prior_knowledge("c.example"));
        assert!(!config.enabled);
        assert!(!QuicConfig::disabled().enabled);
    }
}
