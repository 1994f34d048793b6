//! Error types for the rover client

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when using the rover client
#[derive(Error, Debug)]
pub enum RoverError {
    /// The transport could not be opened
    #[error("connection to {target} failed: {reason}")]
    Connection { target: String, reason: String },

    /// The transport did not open within the configured window
    #[error(
        "connection to {target} timed out after {timeout:?}; \
         check that the controller is powered on, reachable on this network, \
         and listening on this port (81, 80 and 8080 are common)"
    )]
    Timeout { target: String, timeout: Duration },

    /// Not currently connected to the controller
    #[error("not connected")]
    NotConnected,

    /// The client has been shut down
    #[error("client shut down")]
    Shutdown,
}

/// Result type for rover client operations
pub type Result<T> = std::result::Result<T, RoverError>;
