use core::time::Duration;
use mtrelay_core::types::{
    DEFAULT_CLIENT_ADDR, DEFAULT_CLIENT_EVENTS_ADDR, DEFAULT_POOL_SIZE, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_SUBMIT_QUEUE_CAPACITY,
};

/// Settings shared by [`ConnectionPool`](crate::ConnectionPool) and
/// [`EventListener`](crate::EventListener).
///
/// Start from [`ClientConfig::default`] and override what differs:
///
/// ```
/// use mtrelay_client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig::default()
///     .with_request_addr("10.0.0.5:27027")
///     .with_pool_size(8)
///     .with_request_timeout(Duration::from_secs(30));
/// assert_eq!(config.pool_size, 8);
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker endpoint for request channels.
    pub request_addr: String,
    /// Broker endpoint for event subscribers.
    pub events_addr: String,
    /// Number of request channels, each serving one request at a time.
    pub pool_size: usize,
    /// Capacity of the submission queue shared by all channels.
    pub queue_capacity: usize,
    /// Reply timeout used by [`Client::request`](crate::Client::request).
    pub request_timeout: Duration,
    /// First delay before reconnecting a channel that could not connect.
    pub reconnect_min: Duration,
    /// Upper bound of the doubling reconnect delay.
    pub reconnect_max: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_addr: DEFAULT_CLIENT_ADDR.to_string(),
            events_addr: DEFAULT_CLIENT_EVENTS_ADDR.to_string(),
            pool_size: DEFAULT_POOL_SIZE,
            queue_capacity: DEFAULT_SUBMIT_QUEUE_CAPACITY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect_min: Duration::from_millis(200),
            reconnect_max: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn with_request_addr(mut self, addr: impl Into<String>) -> Self {
        self.request_addr = addr.into();
        self
    }

    #[must_use]
    pub fn with_events_addr(mut self, addr: impl Into<String>) -> Self {
        self.events_addr = addr.into();
        self
    }

    /// Sets the number of channels. Zero is raised to one.
    #[must_use]
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    /// Sets the submission queue capacity. Zero is raised to one.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_reconnect_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.reconnect_min = min;
        self.reconnect_max = max;
        self
    }
}
