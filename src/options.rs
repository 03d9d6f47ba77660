//! Connection behavior configuration.

use std::time::Duration;

/// Reconnect and delivery-retry policy for a
/// [`TsdbLinkClient`](crate::TsdbLinkClient).
///
/// Auto-reconnect applies only to WebSocket endpoints; a message-port
/// transport has no address to dial again, so its close is terminal.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Reconnect automatically after an unexpected disconnect.
    /// Default: true
    pub auto_reconnect: bool,

    /// Base delay before the first reconnect attempt; doubles per attempt.
    /// Default: 1 second
    pub reconnect_delay: Duration,

    /// Ceiling for the exponential reconnect backoff.
    /// Default: 30 seconds
    pub max_reconnect_delay: Duration,

    /// Give up reconnecting after this many consecutive failed attempts.
    /// `None` keeps trying forever.
    /// Default: None
    pub max_reconnect_attempts: Option<u32>,

    /// Fail a request queued before the transport opened after this many
    /// delivery retries. `None` keeps it queued until the transport opens
    /// or terminally closes.
    /// Default: None
    pub max_send_retries: Option<u32>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            max_reconnect_attempts: None,
            max_send_retries: None,
        }
    }
}

impl ConnectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable auto-reconnect.
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the base reconnect delay.
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the reconnect backoff ceiling.
    pub fn max_reconnect_delay(mut self, delay: Duration) -> Self {
        self.max_reconnect_delay = delay;
        self
    }

    /// Cap the number of consecutive reconnect attempts.
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    /// Cap the number of delivery retries for early-queued requests.
    pub fn max_send_retries(mut self, retries: u32) -> Self {
        self.max_send_retries = Some(retries);
        self
    }

    /// The backoff delay for reconnect attempt `attempt` (zero-based).
    pub(crate) fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.reconnect_delay
            .saturating_mul(factor)
            .min(self.max_reconnect_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let options = ConnectionOptions::new()
            .reconnect_delay(Duration::from_secs(1))
            .max_reconnect_delay(Duration::from_secs(30));
        assert_eq!(options.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(options.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(options.backoff_delay(3), Duration::from_secs(8));
        assert_eq!(options.backoff_delay(10), Duration::from_secs(30));
        assert_eq!(options.backoff_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_defaults() {
        let options = ConnectionOptions::default();
        assert!(options.auto_reconnect);
        assert!(options.max_reconnect_attempts.is_none());
        assert!(options.max_send_retries.is_none());
    }
}
