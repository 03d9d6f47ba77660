//! Timeout configuration for client operations.
//!
//! Centralizes every duration the dispatcher consults: connection
//! establishment, correlated request deadlines, subscription
//! acknowledgements, and the early-send retry interval.

use std::time::Duration;

/// Timeout configuration for a [`TsdbLinkClient`](crate::TsdbLinkClient).
///
/// All values have sensible defaults.
///
/// # Examples
///
/// ```rust
/// use tsdb_link::TsdbLinkTimeouts;
/// use std::time::Duration;
///
/// // Use defaults (recommended for most cases)
/// let timeouts = TsdbLinkTimeouts::default();
///
/// // Custom timeouts for high-latency environments
/// let timeouts = TsdbLinkTimeouts::builder()
///     .connection_timeout(Duration::from_secs(60))
///     .request_timeout_millis(10_000)
///     .build();
///
/// // Aggressive timeouts for local development
/// let timeouts = TsdbLinkTimeouts::fast();
/// ```
#[derive(Debug, Clone)]
pub struct TsdbLinkTimeouts {
    /// Timeout for establishing connections (TCP + TLS + WebSocket handshake).
    /// Set to 0 to wait indefinitely.
    /// Default: 10 seconds
    pub connection_timeout: Duration,

    /// Default deadline for a correlated request that carries no query
    /// context. Context-bearing requests use their own `timeout` field.
    /// Default: 3 seconds
    pub request_timeout: Duration,

    /// Deadline for a subscription acknowledgement after the subscribe
    /// frame is sent.
    /// Default: 5 seconds
    pub subscribe_timeout: Duration,

    /// Interval at which requests issued before the transport is open are
    /// re-checked for delivery.
    /// Default: 100 milliseconds
    pub retry_interval: Duration,
}

impl Default for TsdbLinkTimeouts {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_millis(3000),
            subscribe_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_millis(100),
        }
    }
}

impl TsdbLinkTimeouts {
    /// Create a new builder for custom timeout configuration.
    pub fn builder() -> TsdbLinkTimeoutsBuilder {
        TsdbLinkTimeoutsBuilder::new()
    }

    /// Create timeouts optimized for fast local development.
    pub fn fast() -> Self {
        Self {
            connection_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_millis(1000),
            subscribe_timeout: Duration::from_secs(2),
            retry_interval: Duration::from_millis(50),
        }
    }

    /// Create timeouts optimized for high-latency or unreliable networks.
    pub fn relaxed() -> Self {
        Self {
            connection_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_millis(15_000),
            subscribe_timeout: Duration::from_secs(15),
            retry_interval: Duration::from_millis(250),
        }
    }

    /// Check if a duration represents "no timeout" (zero or very large).
    pub fn is_no_timeout(duration: Duration) -> bool {
        duration.is_zero() || duration > Duration::from_secs(86400 * 365) // > 1 year
    }
}

/// Builder for creating custom [`TsdbLinkTimeouts`] configurations.
#[derive(Debug, Clone)]
pub struct TsdbLinkTimeoutsBuilder {
    timeouts: TsdbLinkTimeouts,
}

impl TsdbLinkTimeoutsBuilder {
    fn new() -> Self {
        Self {
            timeouts: TsdbLinkTimeouts::default(),
        }
    }

    /// Set the connection timeout (TCP + TLS + WebSocket handshake).
    /// Set to 0 to wait indefinitely.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connection_timeout = timeout;
        self
    }

    /// Set the connection timeout in seconds.
    pub fn connection_timeout_secs(self, secs: u64) -> Self {
        self.connection_timeout(Duration::from_secs(secs))
    }

    /// Set the default deadline for context-free correlated requests.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.request_timeout = timeout;
        self
    }

    /// Set the default request deadline in milliseconds.
    pub fn request_timeout_millis(self, millis: u64) -> Self {
        self.request_timeout(Duration::from_millis(millis))
    }

    /// Set the subscription acknowledgement deadline.
    pub fn subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.subscribe_timeout = timeout;
        self
    }

    /// Set the subscription acknowledgement deadline in seconds.
    pub fn subscribe_timeout_secs(self, secs: u64) -> Self {
        self.subscribe_timeout(Duration::from_secs(secs))
    }

    /// Set the early-send retry interval.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.timeouts.retry_interval = interval;
        self
    }

    /// Set the early-send retry interval in milliseconds.
    pub fn retry_interval_millis(self, millis: u64) -> Self {
        self.retry_interval(Duration::from_millis(millis))
    }

    /// Build the timeout configuration.
    pub fn build(self) -> TsdbLinkTimeouts {
        self.timeouts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let timeouts = TsdbLinkTimeouts::default();
        assert_eq!(timeouts.connection_timeout, Duration::from_secs(10));
        assert_eq!(timeouts.request_timeout, Duration::from_millis(3000));
        assert_eq!(timeouts.subscribe_timeout, Duration::from_secs(5));
        assert_eq!(timeouts.retry_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_builder() {
        let timeouts = TsdbLinkTimeouts::builder()
            .connection_timeout_secs(60)
            .request_timeout_millis(10_000)
            .retry_interval_millis(25)
            .build();

        assert_eq!(timeouts.connection_timeout, Duration::from_secs(60));
        assert_eq!(timeouts.request_timeout, Duration::from_millis(10_000));
        assert_eq!(timeouts.retry_interval, Duration::from_millis(25));
    }

    #[test]
    fn test_fast_preset() {
        let timeouts = TsdbLinkTimeouts::fast();
        assert!(timeouts.connection_timeout <= Duration::from_secs(5));
        assert!(timeouts.request_timeout <= Duration::from_secs(3));
    }

    #[test]
    fn test_relaxed_preset() {
        let timeouts = TsdbLinkTimeouts::relaxed();
        assert!(timeouts.connection_timeout >= Duration::from_secs(30));
        assert!(timeouts.request_timeout >= Duration::from_secs(10));
    }

    #[test]
    fn test_is_no_timeout() {
        assert!(TsdbLinkTimeouts::is_no_timeout(Duration::ZERO));
        assert!(!TsdbLinkTimeouts::is_no_timeout(Duration::from_secs(1)));
        assert!(!TsdbLinkTimeouts::is_no_timeout(Duration::from_secs(3600)));
    }
}
