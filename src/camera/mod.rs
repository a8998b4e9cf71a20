//! Camera layer: driver boundary, concrete sources and the capture worker.
//!
//! Every frame source sits behind the [`CameraDriver`] trait, the narrow
//! boundary the core consumes (vendor SDK bindings implement it out of
//! tree). The capture worker drives exactly one driver on a dedicated
//! thread; the [`worker::Camera`] handle owns that thread and exposes the
//! lifecycle state machine to the UI side.

pub mod still;
pub mod virtual_demo;
pub mod worker;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::beam::Roi;
use crate::codec::PixelFormat;

/// Identity of an attached camera, as reported by enumeration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraDescriptor {
    pub id: u64,
    pub model_name: String,
    pub serial_number: String,
}

/// Static description of an opened camera.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraInfo {
    pub name: String,
    pub descr: String,
    pub width: usize,
    pub height: usize,
    pub bits: u32,
}

impl CameraInfo {
    pub fn resolution_str(&self) -> String {
        format!("{} x {} x {}bit", self.width, self.height, self.bits)
    }
}

/// Physical-units-per-pixel factor reported by the sensor.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PixelScale {
    /// Whether the sensor reports a calibrated pixel pitch.
    pub on: bool,
    /// Micrometers per pixel when `on`.
    pub factor_um: f64,
}

impl Default for PixelScale {
    fn default() -> Self {
        Self {
            on: false,
            factor_um: 1.0,
        }
    }
}

impl PixelScale {
    /// Multiplier applied to pixel quantities for output files.
    pub fn factor(&self) -> f64 {
        if self.on {
            self.factor_um
        } else {
            1.0
        }
    }
}

/// Acquisition length requested from a driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquisitionLength {
    Frames(u32),
    Infinite,
}

/// Driver-side transport counters, read at the statistics cadence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub underruns: u64,
    pub dropped: u64,
    pub incomplete: u64,
}

/// Errors surfaced by a camera driver.
///
/// Fatal kinds terminate the capture worker; transient kinds are counted
/// and the next frame is attempted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("acquisition aborted: {0}")]
    Aborted(String),

    #[error("device disconnected: {0}")]
    Disconnected(String),

    #[error("timed out waiting for frame")]
    Timeout,

    #[error("incomplete frame transfer")]
    IncompleteFrame,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("driver error: {0}")]
    Other(String),
}

impl DriverError {
    /// Whether the worker must terminate instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriverError::Aborted(_) | DriverError::Disconnected(_))
    }
}

/// Opaque handle to one acquired frame; valid until released.
#[derive(Debug, PartialEq, Eq)]
pub struct FrameHandle(pub(crate) u64);

/// The boundary the core consumes; one implementation per camera family.
///
/// The raw buffer returned by [`frame_buffer`](CameraDriver::frame_buffer)
/// is owned by the driver and valid only until the frame is released; the
/// worker copies or unpacks it into its own plane inside one loop
/// iteration and releases on every path, including error paths.
///
/// Vendor SDKs that need process-level init/exit own that lifecycle behind
/// the implementing type (acquire on construction or first open, release
/// on drop); the core assumes an opened driver is ready to stream.
pub trait CameraDriver: Send {
    /// Identity of the opened device.
    fn descriptor(&self) -> CameraDescriptor;

    /// Static device description.
    fn info(&self) -> CameraInfo;

    /// Calibrated pixel pitch, if the sensor knows it.
    fn pixel_scale(&self) -> PixelScale {
        PixelScale::default()
    }

    /// Negotiates the capture format; returns the format actually set.
    fn negotiate_pixel_format(&mut self, preferred: PixelFormat)
        -> Result<PixelFormat, DriverError>;

    /// Current hardware ROI.
    fn roi(&self) -> Roi;

    /// Requests a hardware ROI.
    fn set_roi(&mut self, roi: Roi) -> Result<(), DriverError>;

    /// Starts streaming.
    fn start_acquisition(&mut self, length: AcquisitionLength) -> Result<(), DriverError>;

    /// Stops streaming.
    fn stop_acquisition(&mut self) -> Result<(), DriverError>;

    /// Blocks until the next frame or `timeout`.
    fn wait_for_frame(&mut self, timeout: Duration) -> Result<FrameHandle, DriverError>;

    /// Raw wire bytes of an acquired frame.
    fn frame_buffer(&self, frame: &FrameHandle) -> &[u8];

    /// Returns the frame to the driver's buffer pool.
    fn release_frame(&mut self, frame: FrameHandle) -> Result<(), DriverError>;

    /// Transport counters since acquisition start.
    fn stats(&self) -> DriverStats {
        DriverStats::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(DriverError::Aborted("user".into()).is_fatal());
        assert!(DriverError::Disconnected("usb".into()).is_fatal());
        assert!(!DriverError::Timeout.is_fatal());
        assert!(!DriverError::IncompleteFrame.is_fatal());
    }

    #[test]
    fn test_pixel_scale_factor() {
        assert_eq!(PixelScale::default().factor(), 1.0);
        let s = PixelScale {
            on: true,
            factor_um: 3.45,
        };
        assert_eq!(s.factor(), 3.45);
    }

    #[test]
    fn test_resolution_str() {
        let info = CameraInfo {
            name: "demo".into(),
            descr: "demo".into(),
            width: 2592,
            height: 2048,
            bits: 8,
        };
        assert_eq!(info.resolution_str(), "2592 x 2048 x 8bit");
    }
}
