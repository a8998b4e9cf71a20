//! Custom error types for the application.
//!
//! This module defines the primary error type, `ProfilerError`, for the
//! library. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the errors that can occur outside the per-frame
//! hot path, from I/O and configuration issues to camera-driver failures.
//!
//! Per-frame computation never surfaces through this type: degenerate
//! frames (too few illuminated pixels, zero power) set the `nan` flag on
//! [`crate::beam::BeamResult`] and capture continues. Transient acquisition
//! errors are counted into the worker's statistics snapshot. Only fatal
//! conditions (driver abort, device disconnect, failure to create the
//! measurement file) become `ProfilerError` values.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, ProfilerError>;

#[derive(Error, Debug)]
pub enum ProfilerError {
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Camera error: {0}")]
    Camera(#[from] crate::camera::DriverError),

    #[error("Unsupported image: {0}")]
    UnsupportedImage(String),

    #[error("Failed to create results file '{path}': {reason}")]
    MeasureFile { path: String, reason: String },

    #[error("Capture thread is already running")]
    AlreadyStarted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProfilerError::Configuration("nT out of range".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration validation error: nT out of range"
        );
    }

    #[test]
    fn test_measure_file_error() {
        let err = ProfilerError::MeasureFile {
            path: "/no/such/dir/result.csv".into(),
            reason: "permission denied".into(),
        };
        assert!(err.to_string().contains("result.csv"));
    }
}
