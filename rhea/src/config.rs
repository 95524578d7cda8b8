//! Client engine configuration.

use std::time::Duration;

/// Engine-wide settings.
#[derive(Clone)]
pub struct ClientConfig {
    /// Timeout applied to each request unless a proxy overrides it.
    /// `None` disables the per-request deadline.
    pub request_timeout: Option<Duration>,
    /// Capacity of the internal deadline doorbell and cancellation
    /// queues. Cancellations beyond this many queued at once degrade to
    /// local-only (the out-of-band frame is skipped).
    pub max_queued_events: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { request_timeout: Some(Duration::from_secs(3600)), max_queued_events: 256 }
    }
}

/// Per-proxy overrides.
#[derive(Clone, Default)]
pub struct ClientOptions {
    /// Timeout applied to each request made through this proxy; `None`
    /// falls back to the engine's [`ClientConfig::request_timeout`].
    pub request_timeout: Option<Duration>,
}
