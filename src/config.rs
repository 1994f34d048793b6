//! Configuration for the rover client

use std::time::Duration;

/// Default controller address (the ESP32 access point).
pub const DEFAULT_HOST: &str = "192.168.4.1";

/// Default controller WebSocket port.
pub const DEFAULT_PORT: u16 = 81;

/// Configuration for connecting to the rover controller
#[derive(Debug, Clone)]
pub struct RoverConfig {
    /// Controller host (e.g., "192.168.4.1")
    pub host: String,

    /// Controller WebSocket port
    pub port: u16,

    /// How long to wait for the transport to open before `connect` fails
    pub connect_timeout: Duration,

    /// Delay after open before sending the identification token
    pub handshake_delay: Duration,

    /// Whether to automatically reconnect after an unexpected close
    pub auto_reconnect: bool,

    /// Flat delay between reconnection attempts
    pub reconnect_interval: Duration,

    /// Consecutive failed attempts allowed before the client stops retrying
    pub max_reconnect_attempts: u32,
}

impl Default for RoverConfig {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl RoverConfig {
    /// Create a configuration targeting the given controller address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(60),
            handshake_delay: Duration::from_secs(1),
            auto_reconnect: true,
            reconnect_interval: Duration::from_secs(3),
            max_reconnect_attempts: 5,
        }
    }

    /// Set the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the delay before the identification token is sent
    pub fn handshake_delay(mut self, delay: Duration) -> Self {
        self.handshake_delay = delay;
        self
    }

    /// Disable automatic reconnection
    pub fn no_reconnect(mut self) -> Self {
        self.auto_reconnect = false;
        self
    }

    /// Set the flat delay between reconnection attempts
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Set the reconnection attempt budget
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }
}
