//! Error types for webfleet.

use thiserror::Error;

/// Main error type for webfleet.
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for webfleet operations.
pub type Result<T> = std::result::Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_message() {
        let err = FleetError::Config("missing session secret".to_string());
        let msg = err.to_string();
        assert!(msg.contains("Configuration error"));
        assert!(msg.contains("missing session secret"));
    }

    #[test]
    fn test_spawn_error_message() {
        let err = FleetError::Spawn("no such file".to_string());
        assert_eq!(err.to_string(), "Failed to spawn worker: no such file");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::AddrInUse, "address in use");
        let err: FleetError = io_err.into();
        assert!(err.to_string().contains("address in use"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ nope }").unwrap_err();
        let err: FleetError = json_err.into();
        assert!(err.to_string().contains("JSON"));
    }

    #[test]
    fn test_error_debug_format() {
        let err = FleetError::Worker("gone".to_string());
        let debug = format!("{:?}", err);
        assert!(debug.contains("Worker"));
        assert!(debug.contains("gone"));
    }
}
