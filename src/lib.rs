//! Roverlink client
//!
//! A reconnecting WebSocket client for the rover controller: it opens a
//! persistent connection to `ws://<host>:<port>/`, identifies itself with the
//! `MOBILE` token, decodes the controller's line-oriented telemetry protocol,
//! fans decoded frames and connectivity changes out to subscribers, and
//! retries a bounded number of times after an unexpected drop.
//!
//! # Example
//!
//! ```no_run
//! use roverlink::{RoverClient, RoverConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = RoverClient::new(RoverConfig::default());
//!
//!     let _telemetry = client.on_data(|frame| {
//!         println!("gas1={} us1={}", frame.gas1, frame.us1);
//!     });
//!     let _connectivity = client.on_connection(|connected| {
//!         println!("connected: {connected}");
//!     });
//!
//!     client.connect().await?;
//!
//!     if client.is_connected() {
//!         client.send_motor_command("forward");
//!     }
//!
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod error;
mod protocol;

pub use client::{
    ConnectionHandler, ConnectionState, ConnectionSubscription, DataHandler, DataSubscription,
    RoverClient,
};
pub use config::{RoverConfig, DEFAULT_HOST, DEFAULT_PORT};
pub use error::{Result, RoverError};
pub use protocol::{RobotMessage, TelemetryFrame};
