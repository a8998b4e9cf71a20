//! Core library for the beamscope application.
//!
//! This library contains the frame-processing pipeline of a real-time laser
//! beam profiler: pixel-format unpacking, the ISO 11146 centroid and
//! second-moment engine, background subtraction with iterative aperture
//! refinement, the per-camera capture worker, and the buffered measurement
//! sink. It is used by the headless capture binary and is the boundary a
//! GUI shell would plug into.

pub mod background;
pub mod beam;
pub mod camera;
pub mod codec;
pub mod config;
pub mod display;
pub mod error;
pub mod measure;
