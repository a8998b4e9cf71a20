//! Persisted camera configuration.
//!
//! The processing knobs are loaded from a TOML file and validated at load
//! time: out-of-range values are clamped back to the documented defaults
//! with a warning, and an invalid aperture is reset to the full sensor.
//! The capture worker copies the whole struct out under its config mutex,
//! so the fields stay plain data.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::beam::Roi;
use crate::error::AppResult;

/// User-configured analysis aperture in sensor coordinates.
///
/// When disabled (or invalid for the actual sensor) the full frame is used.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftAperture {
    pub enabled: bool,
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl SoftAperture {
    /// Whether the rectangle is usable on a `w` x `h` sensor.
    pub fn is_valid(&self, w: usize, h: usize) -> bool {
        Roi::from(*self).is_valid(w, h)
    }
}

impl From<SoftAperture> for Roi {
    fn from(a: SoftAperture) -> Roi {
        Roi {
            x1: a.x1,
            y1: a.y1,
            x2: a.x2,
            y2: a.y2,
        }
    }
}

/// Processing configuration for one camera.
///
/// Field ranges follow ISO 11146 practice; see the individual clamp rules
/// in [`CameraConfig::validate`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CameraConfig {
    /// Scale the displayed plane into [0, 1].
    pub normalize: bool,
    /// Run the background engine (corner baseline + noise cut).
    pub subtract_background: bool,
    /// Aperture refinement iterations; 0 means compute once.
    pub max_iters: u32,
    /// Convergence tolerance as a fraction of the smaller beam diameter.
    pub precision: f64,
    /// Linear fraction of the aperture taken by each corner patch.
    pub corner_fraction: f64,
    /// Noise threshold multiplier (sigmas above the baseline mean).
    pub n_t: f64,
    /// ROI extent as a multiple of the current beam diameter.
    pub mask_diam: f64,
    /// Optional analysis aperture.
    pub aperture: SoftAperture,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            normalize: true,
            subtract_background: true,
            max_iters: 0,
            precision: 0.05,
            corner_fraction: 0.035,
            n_t: 3.0,
            mask_diam: 3.0,
            aperture: SoftAperture::default(),
        }
    }
}

impl CameraConfig {
    /// Loads the configuration from a TOML file.
    ///
    /// A missing file yields the defaults. Out-of-range values are clamped
    /// to the defaults with a warning.
    pub fn load(path: &Path) -> AppResult<Self> {
        let mut loaded = match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str::<CameraConfig>(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!(
                    "config '{}' not found, using defaults",
                    path.display()
                );
                CameraConfig::default()
            }
            Err(e) => return Err(e.into()),
        };
        loaded.validate();
        Ok(loaded)
    }

    /// Saves the configuration as TOML.
    pub fn save(&self, path: &Path) -> AppResult<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| crate::error::ProfilerError::Configuration(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Clamps out-of-range fields back to their defaults, warning per field.
    pub fn validate(&mut self) {
        let defaults = Self::default();
        if self.max_iters > 50 {
            log::warn!(
                "maxIters {} out of range [0, 50], using {}",
                self.max_iters,
                defaults.max_iters
            );
            self.max_iters = defaults.max_iters;
        }
        if !(self.precision > 0.0 && self.precision < 1.0) {
            log::warn!(
                "precision {} out of range (0, 1), using {}",
                self.precision,
                defaults.precision
            );
            self.precision = defaults.precision;
        }
        if !(self.corner_fraction > 0.0 && self.corner_fraction < 0.5) {
            log::warn!(
                "cornerFraction {} out of range (0, 0.5), using {}",
                self.corner_fraction,
                defaults.corner_fraction
            );
            self.corner_fraction = defaults.corner_fraction;
        }
        if !(self.n_t > 0.0 && self.n_t < 10.0) {
            log::warn!("nT {} out of range (0, 10), using {}", self.n_t, defaults.n_t);
            self.n_t = defaults.n_t;
        }
        if !(self.mask_diam > 1.0 && self.mask_diam < 10.0) {
            log::warn!(
                "maskDiam {} out of range (1, 10), using {}",
                self.mask_diam,
                defaults.mask_diam
            );
            self.mask_diam = defaults.mask_diam;
        }
    }

    /// The analysis aperture to use on a `w` x `h` sensor.
    ///
    /// Falls back to the full frame when the configured rectangle is
    /// disabled or does not fit the sensor.
    pub fn resolved_aperture(&self, w: usize, h: usize) -> Roi {
        if self.aperture.enabled {
            if self.aperture.is_valid(w, h) {
                return Roi::from(self.aperture);
            }
            log::warn!(
                "aperture ({}, {})..({}, {}) invalid for {}x{} sensor, using full frame",
                self.aperture.x1,
                self.aperture.y1,
                self.aperture.x2,
                self.aperture.y2,
                w,
                h
            );
        }
        Roi::full(w, h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = CameraConfig::default();
        assert!(cfg.normalize);
        assert!(cfg.subtract_background);
        assert_eq!(cfg.max_iters, 0);
        assert_eq!(cfg.precision, 0.05);
        assert_eq!(cfg.corner_fraction, 0.035);
        assert_eq!(cfg.n_t, 3.0);
        assert_eq!(cfg.mask_diam, 3.0);
        assert!(!cfg.aperture.enabled);
    }

    #[test]
    fn test_validate_clamps_to_defaults() {
        let mut cfg = CameraConfig {
            max_iters: 200,
            precision: 1.5,
            corner_fraction: 0.9,
            n_t: -2.0,
            mask_diam: 0.5,
            ..CameraConfig::default()
        };
        cfg.validate();
        assert_eq!(cfg, CameraConfig::default());
    }

    #[test]
    fn test_validate_keeps_in_range_values() {
        let mut cfg = CameraConfig {
            max_iters: 25,
            precision: 0.001,
            corner_fraction: 0.05,
            n_t: 2.0,
            mask_diam: 5.0,
            ..CameraConfig::default()
        };
        let before = cfg;
        cfg.validate();
        assert_eq!(cfg, before);
    }

    #[test]
    fn test_invalid_aperture_resolves_to_full_sensor() {
        let cfg = CameraConfig {
            aperture: SoftAperture {
                enabled: true,
                x1: 100,
                y1: 0,
                x2: 50,
                y2: 50,
            },
            ..CameraConfig::default()
        };
        assert_eq!(cfg.resolved_aperture(640, 480), Roi::full(640, 480));

        let ok = CameraConfig {
            aperture: SoftAperture {
                enabled: true,
                x1: 10,
                y1: 20,
                x2: 200,
                y2: 220,
            },
            ..CameraConfig::default()
        };
        assert_eq!(
            ok.resolved_aperture(640, 480),
            Roi {
                x1: 10,
                y1: 20,
                x2: 200,
                y2: 220
            }
        );
    }

    #[test]
    fn test_load_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camera.toml");
        let cfg = CameraConfig {
            max_iters: 8,
            n_t: 2.5,
            aperture: SoftAperture {
                enabled: true,
                x1: 1,
                y1: 2,
                x2: 3,
                y2: 4,
            },
            ..CameraConfig::default()
        };
        cfg.save(&path).unwrap();
        let loaded = CameraConfig::load(&path).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let loaded = CameraConfig::load(Path::new("/nonexistent/beamscope.toml")).unwrap();
        assert_eq!(loaded, CameraConfig::default());
    }

    #[test]
    fn test_recognized_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camera.toml");
        std::fs::write(
            &path,
            r#"
normalize = false
subtractBackground = false
maxIters = 12
precision = 0.01
cornerFraction = 0.02
nT = 4.0
maskDiam = 2.0

[aperture]
enabled = true
x1 = 5
y1 = 6
x2 = 7
y2 = 8
"#,
        )
        .unwrap();
        let loaded = CameraConfig::load(&path).unwrap();
        assert!(!loaded.normalize);
        assert!(!loaded.subtract_background);
        assert_eq!(loaded.max_iters, 12);
        assert_eq!(loaded.n_t, 4.0);
        assert_eq!(loaded.aperture.x2, 7);
    }
}
