//! Alt-Svc hints (RFC 7838) and QUIC breakage tracking.
//!
//! Only `h3` alternatives on the same host are recorded. A failed QUIC
//! attempt marks the origin broken for a cool-down that doubles per
//! consecutive failure, capped at 16 times the base.

use dashmap::DashMap;
use std::time::{Duration, Instant};

const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
const MAX_BACKOFF_SHIFT: u32 = 4;

#[derive(Debug, Clone, Copy)]
struct AltSvcEntry {
    port: u16,
    expires: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Broken {
    failures: u32,
    until: Instant,
}

/// One parsed alternative from an `Alt-Svc` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alternative {
    pub protocol: String,
    pub host: Option<String>,
    pub port: u16,
    pub max_age: Duration,
}

/// Parsed `Alt-Svc` header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AltSvc {
    Clear,
    Alternatives(Vec<Alternative>),
}

/// Parse an `Alt-Svc` header value. Malformed alternatives are skipped.
pub fn parse_alt_svc(value: &str) -> AltSvc {
    let value = value.trim();
    if value.eq_ignore_ascii_case("clear") {
        return AltSvc::Clear;
    }

    let mut alternatives = Vec::new();
    for entry in value.split(',') {
        let mut parts = entry.split(';').map(str::trim);
        let Some((protocol, authority)) = parts.next().and_then(|p| p.split_once('=')) else {
            continue;
        };
        let authority = authority.trim().trim_matches('"');
        let Some((host, port)) = authority.rsplit_once(':') else {
            continue;
        };
        let Ok(port) = port.parse::<u16>() else {
            continue;
        };

        let mut max_age = DEFAULT_MAX_AGE;
        for param in parts {
            if let Some((name, value)) = param.split_once('=') {
                if name.trim().eq_ignore_ascii_case("ma") {
                    if let Ok(secs) = value.trim().trim_matches('"').parse::<u64>() {
                        max_age = Duration::from_secs(secs);
                    }
                }
            }
        }
        alternatives.push(Alternative {
            protocol: protocol.trim().to_string(),
            host: Some(host.to_string()).filter(|h| !h.is_empty()),
            port,
            max_age,
        });
    }
    AltSvc::Alternatives(alternatives)
}

fn origin(host: &str, port: u16) -> String {
    format!("{}:{}", host.to_ascii_lowercase(), port)
}

/// Process-lifetime cache of HTTP/3 hints, scoped to one session.
#[derive(Debug)]
pub struct AltSvcCache {
    entries: DashMap<String, AltSvcEntry>,
    broken: DashMap<String, Broken>,
    base_cooldown: Duration,
}

impl AltSvcCache {
    pub fn new(base_cooldown: Duration) -> Self {
        Self { entries: DashMap::new(), broken: DashMap::new(), base_cooldown }
    }

    /// Record the `Alt-Svc` header of a response from `host:port`.
    pub fn record(&self, host: &str, port: u16, header: &str) {
        let key = origin(host, port);
        match parse_alt_svc(header) {
            AltSvc::Clear => {
                self.entries.remove(&key);
            }
            AltSvc::Alternatives(alternatives) => {
                let now = Instant::now();
                let h3 = alternatives.into_iter().find(|alt| {
                    alt.protocol == "h3"
                        && alt.host.as_deref().map_or(true, |h| h.eq_ignore_ascii_case(host))
                });
                if let Some(alt) = h3 {
                    tracing::trace!(origin = %key, port = alt.port, "h3 advertised");
                    self.entries.insert(key, AltSvcEntry { port: alt.port, expires: now + alt.max_age });
                }
            }
        }
    }

    /// Seed a hint without having seen a response.
    pub fn preload(&self, host: &str, port: u16, h3_port: u16, max_age: Duration) {
        self.entries
            .insert(origin(host, port), AltSvcEntry { port: h3_port, expires: Instant::now() + max_age });
    }

    /// HTTP/3 port to try for `host:port`, unless unknown, expired, or broken.
    pub fn h3_port(&self, host: &str, port: u16) -> Option<u16> {
        let key = origin(host, port);
        let now = Instant::now();
        if self.broken.get(&key).is_some_and(|b| b.until > now) {
            return None;
        }
        let entry = *self.entries.get(&key)?;
        if entry.expires <= now {
            self.entries.remove(&key);
            return None;
        }
        Some(entry.port)
    }

    pub fn is_broken(&self, host: &str, port: u16) -> bool {
        self.broken.get(&origin(host, port)).is_some_and(|b| b.until > Instant::now())
    }

    /// Record a failed QUIC attempt. Returns the cool-down applied.
    pub fn mark_broken(&self, host: &str, port: u16) -> Duration {
        let mut entry = self
            .broken
            .entry(origin(host, port))
            .or_insert(Broken { failures: 0, until: Instant::now() });
        let shift = entry.failures.min(MAX_BACKOFF_SHIFT);
        let cooldown = self.base_cooldown.saturating_mul(1 << shift);
        entry.failures = entry.failures.saturating_add(1);
        entry.until = Instant::now() + cooldown;
        cooldown
    }

    /// A QUIC connection succeeded; forget past failures.
    pub fn mark_working(&self, host: &str, port: u16) {
        self.broken.remove(&origin(host, port));
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.broken.clear();
    }
}
