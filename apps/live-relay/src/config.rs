use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::lifecycle::ReconcilePolicy;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// Base URL advertised to clients; derived from the port when unset.
    pub public_url: Option<String>,
    /// Enables the Redis session store. Sessions are kept in memory otherwise.
    pub redis_url: Option<String>,
    pub session_ttl_seconds: u64,
    pub write_timeout: Duration,
    pub flush_timeout: Duration,
    pub outbound_buffer: usize,
    pub decode_failure_limit: usize,
    pub decode_failure_window: Duration,
    pub vacancy_grace: Duration,
    pub sweep_interval: Duration,
    pub reconcile_attempts: u32,
    pub reconcile_base_delay: Duration,
    pub reconcile_max_delay: Duration,
}

fn parsed<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

fn millis(key: &str, default: u64) -> Duration {
    Duration::from_millis(parsed(key).unwrap_or(default))
}

fn secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(parsed(key).unwrap_or(default))
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: parsed("LIVE_RELAY_PORT").unwrap_or(defaults.port),
            public_url: env::var("LIVE_RELAY_PUBLIC_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.trim().is_empty()),
            session_ttl_seconds: parsed("SESSION_TTL").unwrap_or(defaults.session_ttl_seconds),
            write_timeout: millis("LIVE_RELAY_WRITE_TIMEOUT_MS", 5_000),
            flush_timeout: millis("LIVE_RELAY_FLUSH_TIMEOUT_MS", 2_000),
            outbound_buffer: parsed("LIVE_RELAY_OUTBOUND_BUFFER")
                .unwrap_or(defaults.outbound_buffer),
            decode_failure_limit: parsed("LIVE_RELAY_DECODE_FAILURE_LIMIT")
                .unwrap_or(defaults.decode_failure_limit),
            decode_failure_window: secs("LIVE_RELAY_DECODE_FAILURE_WINDOW_SECS", 10),
            vacancy_grace: secs("LIVE_RELAY_VACANCY_GRACE_SECS", 120),
            sweep_interval: secs("LIVE_RELAY_SWEEP_INTERVAL_SECS", 30),
            reconcile_attempts: parsed("LIVE_RELAY_RECONCILE_ATTEMPTS")
                .unwrap_or(defaults.reconcile_attempts),
            reconcile_base_delay: millis("LIVE_RELAY_RECONCILE_BASE_DELAY_MS", 500),
            reconcile_max_delay: millis("LIVE_RELAY_RECONCILE_MAX_DELAY_MS", 30_000),
        }
    }

    pub fn public_base_url(&self) -> String {
        self.public_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", self.port))
    }

    pub fn reconcile_policy(&self) -> ReconcilePolicy {
        ReconcilePolicy {
            attempts: self.reconcile_attempts,
            base_delay: self.reconcile_base_delay,
            max_delay: self.reconcile_max_delay,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            public_url: None,
            redis_url: None,
            session_ttl_seconds: 2_592_000, // 30 days
            write_timeout: Duration::from_secs(5),
            flush_timeout: Duration::from_secs(2),
            outbound_buffer: 256,
            decode_failure_limit: 20,
            decode_failure_window: Duration::from_secs(10),
            vacancy_grace: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(30),
            reconcile_attempts: 5,
            reconcile_base_delay: Duration::from_millis(500),
            reconcile_max_delay: Duration::from_secs(30),
        }
    }
}
