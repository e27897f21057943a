//! Runtime-configurable tuning parameters for tenax.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `TENAX_`) or by constructing a custom `EngineConfig`.

use std::time::Duration;

/// Tuning parameters for link formation and recovery transfers.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Ring-buffer size per link for store-and-forward pass-through during
    /// recovery. A pass node uses O(buffer_size) memory regardless of the
    /// payload size. Also settable at runtime via
    /// `set_param("reduce_buffer_size", ..)`.
    pub buffer_size: usize,

    /// How long to wait for the seed's link table after registering.
    pub rendezvous_timeout: Duration,

    /// How long to wait for all neighbor links to come up after the table
    /// is received.
    pub connect_timeout: Duration,

    /// Delay between link-rebuild attempts during recovery.
    pub reconnect_backoff: Duration,

    /// Address the per-node link listener binds to. Port 0 picks an
    /// ephemeral port; the actual address is published via the seed.
    pub listen_addr: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_size: 256 * 1024,
            rendezvous_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            reconnect_backoff: Duration::from_millis(200),
            listen_addr: "127.0.0.1:0".into(),
        }
    }
}

impl EngineConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `TENAX_BUFFER_SIZE`
    /// - `TENAX_RENDEZVOUS_TIMEOUT_SECS`
    /// - `TENAX_CONNECT_TIMEOUT_SECS`
    /// - `TENAX_RECONNECT_BACKOFF_MS`
    /// - `TENAX_LISTEN_ADDR`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("TENAX_BUFFER_SIZE") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.buffer_size = n;
            }
        }
        if let Ok(v) = std::env::var("TENAX_RENDEZVOUS_TIMEOUT_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                cfg.rendezvous_timeout = Duration::from_secs(s);
            }
        }
        if let Ok(v) = std::env::var("TENAX_CONNECT_TIMEOUT_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                cfg.connect_timeout = Duration::from_secs(s);
            }
        }
        if let Ok(v) = std::env::var("TENAX_RECONNECT_BACKOFF_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                cfg.reconnect_backoff = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("TENAX_LISTEN_ADDR") {
            cfg.listen_addr = v;
        }

        cfg
    }
}
