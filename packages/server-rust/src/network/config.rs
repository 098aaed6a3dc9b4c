//! Network configuration types.

use std::time::Duration;

use serde::Deserialize;

/// Per-connection configuration controlling backpressure and timeouts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Bounded mpsc channel capacity for outbound messages per connection.
    pub outbound_channel_capacity: usize,
    /// Maximum time to wait when sending a message to a connection, in ms.
    pub send_timeout_ms: u64,
}

impl ConnectionConfig {
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_channel_capacity: 256,
            send_timeout_ms: 5_000,
        }
    }
}
