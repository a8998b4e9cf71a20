//! Still-image camera.
//!
//! Loads a grayscale image file and runs the same compute path as the live
//! pipeline exactly once. Useful for analyzing saved beam captures and as
//! the reference path when validating a camera setup.

use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::background::{BackgroundEngine, BackgroundState};
use crate::beam::{self, BeamResult, PlaneRef};
use crate::codec;
use crate::config::CameraConfig;
use crate::display::DisplaySink;
use crate::error::{AppResult, ProfilerError};

use super::CameraInfo;

/// Decoded grayscale plane in its native depth.
#[derive(Debug)]
enum StillPlane {
    U8(Vec<u8>),
    U16(Vec<u16>),
}

/// One-shot result of processing a still image.
#[derive(Clone, Copy, Debug)]
pub struct StillOutcome {
    pub result: BeamResult,
    /// Baseline statistics when background subtraction ran.
    pub background: Option<BackgroundState>,
    pub load_ms: f64,
    pub calc_ms: f64,
}

/// A beam image loaded from disk.
#[derive(Debug)]
pub struct StillImageCamera {
    path: PathBuf,
    width: usize,
    height: usize,
    bits: u32,
    plane: StillPlane,
    load_ms: f64,
}

impl StillImageCamera {
    /// Decodes `path`; only 8- and 16-bit grayscale images are accepted.
    pub fn load(path: &Path) -> AppResult<Self> {
        let timer = Instant::now();
        let img = image::open(path)
            .map_err(|e| ProfilerError::UnsupportedImage(format!("{}: {e}", path.display())))?;
        let load_ms = timer.elapsed().as_secs_f64() * 1e3;

        let (width, height) = (img.width() as usize, img.height() as usize);
        let (bits, plane) = match img {
            image::DynamicImage::ImageLuma8(img) => (8, StillPlane::U8(img.into_raw())),
            image::DynamicImage::ImageLuma16(img) => (16, StillPlane::U16(img.into_raw())),
            _ => {
                return Err(ProfilerError::UnsupportedImage(format!(
                    "{}: only grayscale images are supported",
                    path.display()
                )))
            }
        };
        log::debug!(
            "loaded '{}': {}x{}x{}bit in {:.1} ms",
            path.display(),
            width,
            height,
            bits,
            load_ms
        );
        Ok(Self {
            path: path.to_path_buf(),
            width,
            height,
            bits,
            plane,
            load_ms,
        })
    }

    pub fn info(&self) -> CameraInfo {
        CameraInfo {
            name: self
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.path.display().to_string()),
            descr: self.path.display().to_string(),
            width: self.width,
            height: self.height,
            bits: self.bits,
        }
    }

    fn plane_ref(&self) -> PlaneRef<'_> {
        match &self.plane {
            StillPlane::U8(buf) => PlaneRef::U8(buf),
            StillPlane::U16(buf) => PlaneRef::U16(buf),
        }
    }

    /// Runs the compute path once and renders into `display`.
    ///
    /// With `raw_view` the computation is skipped entirely and the
    /// unprocessed plane is shown with a degenerate result.
    pub fn process(
        &self,
        cfg: &CameraConfig,
        display: &mut dyn DisplaySink,
        raw_view: bool,
    ) -> StillOutcome {
        let (w, h) = (self.width, self.height);
        let aperture = cfg.resolved_aperture(w, h);
        let range_top = f64::from((1u32 << self.bits) - 1);
        display.init_graph(w, h);

        if raw_view {
            match self.plane_ref() {
                PlaneRef::U8(buf) => {
                    codec::copy_u8_to_f64(buf, display.raw_graph());
                }
                PlaneRef::U16(buf) => {
                    codec::copy_u16_to_f64(buf, display.raw_graph());
                }
                PlaneRef::F64(_) => {}
            }
            display.invalidate_graph();
            let result = BeamResult::degenerate(aperture);
            display.set_result(result, 0.0, range_top);
            return StillOutcome {
                result,
                background: None,
                load_ms: self.load_ms,
                calc_ms: 0.0,
            };
        }

        let timer = Instant::now();
        let (result, background) = if cfg.subtract_background {
            let mut engine = BackgroundEngine::new(w, h, aperture, cfg);
            let r = engine.run(self.plane_ref());
            let st = engine.state();
            let graph = display.raw_graph();
            if cfg.normalize {
                codec::copy_normalized_f64(engine.subtracted(), graph, st.min, st.max);
            } else {
                graph.copy_from_slice(engine.subtracted());
            }
            (r, Some(st))
        } else {
            let r = beam::calc(self.plane_ref(), w, aperture);
            let graph = display.raw_graph();
            match self.plane_ref() {
                PlaneRef::U8(buf) => {
                    if cfg.normalize {
                        let max = codec::find_max_u8(buf);
                        codec::render_to_doubles_norm_u8(buf, graph, max);
                    } else {
                        codec::copy_u8_to_f64(buf, graph);
                    }
                }
                PlaneRef::U16(buf) => {
                    if cfg.normalize {
                        let max = codec::find_max_u16(buf);
                        codec::render_to_doubles_norm_u16(buf, graph, max);
                    } else {
                        codec::copy_u16_to_f64(buf, graph);
                    }
                }
                PlaneRef::F64(_) => {}
            }
            (r, None)
        };
        let calc_ms = timer.elapsed().as_secs_f64() * 1e3;

        display.invalidate_graph();
        if cfg.normalize {
            display.set_result(result, 0.0, 1.0);
        } else if let Some(st) = background {
            display.set_result(result, st.min, st.max);
        } else {
            display.set_result(result, 0.0, range_top);
        }

        log::debug!(
            "'{}': calc {:.1} ms | iters {} | nan {}",
            self.path.display(),
            calc_ms,
            result.iters,
            result.nan
        );
        StillOutcome {
            result,
            background,
            load_ms: self.load_ms,
            calc_ms,
        }
    }
}
