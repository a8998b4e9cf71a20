//! Background estimation, subtraction and iterative aperture refinement.
//!
//! ISO 11146 wants moments computed on background-corrected data inside an
//! integration area a few beam diameters wide. This module estimates the
//! baseline from the four corner patches of the analysis aperture (assumed
//! beam-free), subtracts it with a noise cut, and then shrinks the working
//! ROI around the beam over a few calculator passes until the parameters
//! stop moving.
//!
//! The engine owns the `f64` subtracted plane; it is sized to the full
//! frame once and reused every frame with no further allocation.

use crate::beam::{self, BeamResult, PlaneRef, Roi, Sample};
use crate::config::CameraConfig;

/// Illuminated-pixel floor below which a frame is declared degenerate.
const MIN_ILLUMINATED: u32 = 10;

/// Baseline statistics from the most recent frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct BackgroundState {
    /// Baseline mean over the four corner patches.
    pub mean: f64,
    /// Baseline sigma (uncorrected, divided by N) over the corner patches.
    pub sdev: f64,
    /// Smallest value written to the subtracted plane inside the aperture.
    pub min: f64,
    /// Largest value written to the subtracted plane inside the aperture.
    pub max: f64,
    /// Pixels above the noise threshold.
    pub count: u32,
}

/// Per-camera background engine with its scratch plane.
pub struct BackgroundEngine {
    w: usize,
    h: usize,
    aperture: Roi,
    max_iter: u32,
    precision: f64,
    corner_fraction: f64,
    nt: f64,
    mask_diam: f64,
    subtracted: Vec<f64>,
    state: BackgroundState,
}

impl BackgroundEngine {
    /// Creates an engine for a `w` x `h` sensor.
    ///
    /// `aperture` must already be resolved (user rectangle if enabled and
    /// valid, full frame otherwise) and is fixed for the engine's lifetime;
    /// reconfiguration builds a new engine.
    pub fn new(w: usize, h: usize, aperture: Roi, cfg: &CameraConfig) -> Self {
        Self {
            w,
            h,
            aperture,
            max_iter: cfg.max_iters,
            precision: cfg.precision,
            corner_fraction: cfg.corner_fraction,
            nt: cfg.n_t,
            mask_diam: cfg.mask_diam,
            subtracted: vec![0.0; w * h],
            state: BackgroundState::default(),
        }
    }

    /// The analysis aperture this engine was built for.
    pub fn aperture(&self) -> Roi {
        self.aperture
    }

    /// Baseline statistics of the last processed frame.
    pub fn state(&self) -> BackgroundState {
        self.state
    }

    /// The background-corrected plane of the last processed frame.
    ///
    /// Inside the aperture: `I - mean` for pixels above the noise
    /// threshold, exactly zero otherwise. Outside: the raw values.
    pub fn subtracted(&self) -> &[f64] {
        &self.subtracted
    }

    /// Processes one frame: estimate baseline, subtract, refine, compute.
    pub fn run(&mut self, plane: PlaneRef<'_>) -> BeamResult {
        match plane {
            PlaneRef::U8(buf) => self.subtract(buf),
            PlaneRef::U16(buf) => self.subtract(buf),
            PlaneRef::F64(buf) => self.subtract(buf),
        }

        if self.state.count < MIN_ILLUMINATED {
            return BeamResult::degenerate(self.aperture);
        }

        let mut r = beam::calc(PlaneRef::F64(&self.subtracted), self.w, self.aperture);

        let mut iters = 0;
        while iters < self.max_iter {
            let prev = r;
            let roi = Roi {
                x1: (prev.xc - prev.dx / 2.0 * self.mask_diam) as i32,
                y1: (prev.yc - prev.dy / 2.0 * self.mask_diam) as i32,
                x2: (prev.xc + prev.dx / 2.0 * self.mask_diam) as i32,
                y2: (prev.yc + prev.dy / 2.0 * self.mask_diam) as i32,
            }
            .clamped_to(&self.aperture);

            r = beam::calc(PlaneRef::F64(&self.subtracted), self.w, roi);
            iters += 1;
            if r.nan {
                break;
            }

            let th = prev.dx.min(prev.dy) * self.precision;
            if (r.xc - prev.xc).abs() < th
                && (r.yc - prev.yc).abs() < th
                && (r.dx - prev.dx).abs() < th
                && (r.dy - prev.dy).abs() < th
            {
                break;
            }
        }
        r.iters = iters;
        r
    }

    fn subtract<T: Sample>(&mut self, buf: &[T]) {
        let w = self.w;
        let h = self.h;
        let (x1, x2) = (self.aperture.x1 as usize, self.aperture.x2 as usize);
        let (y1, y2) = (self.aperture.y1 as usize, self.aperture.y2 as usize);
        let dw = ((x2 - x1) as f64 * self.corner_fraction) as usize;
        let dh = ((y2 - y1) as f64 * self.corner_fraction) as usize;
        let (bx1, bx2) = (x1 + dw, x2 - dw);
        let (by1, by2) = (y1 + dh, y2 - dh);
        let t = &mut self.subtracted;

        // Corner patches double as scratch for the baseline estimate.
        let mut k = 0usize;
        let mut m = 0.0;
        for i in y1..y2 {
            if i < by1 || i >= by2 {
                let offset = i * w;
                for j in x1..x2 {
                    if j < bx1 || j >= bx2 {
                        t[k] = buf[offset + j].to_f64();
                        m += t[k];
                        k += 1;
                    }
                }
            }
        }
        m /= k as f64;

        let mut s = 0.0;
        for v in t.iter_mut().take(k) {
            s += (*v - m) * (*v - m);
            *v = 0.0;
        }
        s = (s / k as f64).sqrt();

        self.state.mean = m;
        self.state.sdev = s;

        let th = m + self.nt * s;
        let mut min = 1e10;
        let mut max = -1e10;
        let mut count = 0u32;

        // Everything outside the aperture is passed through untouched.
        for i in 0..y1 {
            let offset = i * w;
            for j in 0..w {
                t[offset + j] = buf[offset + j].to_f64();
            }
        }
        for i in y1..y2 {
            let offset = i * w;
            for j in 0..x1 {
                t[offset + j] = buf[offset + j].to_f64();
            }
            for j in x2..w {
                t[offset + j] = buf[offset + j].to_f64();
            }
        }
        for i in y2..h {
            let offset = i * w;
            for j in 0..w {
                t[offset + j] = buf[offset + j].to_f64();
            }
        }

        for i in y1..y2 {
            let offset = i * w;
            for j in x1..x2 {
                let idx = offset + j;
                let v = buf[idx].to_f64();
                if v > th {
                    count += 1;
                    t[idx] = v - m;
                } else {
                    t[idx] = 0.0;
                }
                if t[idx] > max {
                    max = t[idx];
                } else if t[idx] < min {
                    min = t[idx];
                }
            }
        }

        self.state.min = min;
        self.state.max = max;
        self.state.count = count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn engine(w: usize, h: usize, max_iter: u32) -> BackgroundEngine {
        let cfg = CameraConfig {
            max_iters: max_iter,
            ..CameraConfig::default()
        };
        BackgroundEngine::new(w, h, Roi::full(w, h), &cfg)
    }

    fn gaussian_on_pedestal(
        w: usize,
        h: usize,
        xc: f64,
        yc: f64,
        sigma: f64,
        peak: f64,
        pedestal: f64,
    ) -> Vec<u8> {
        let mut buf = vec![0u8; w * h];
        for i in 0..h {
            for j in 0..w {
                let ex = (j as f64 - xc) / sigma;
                let ey = (i as f64 - yc) / sigma;
                let v = pedestal + peak * (-0.5 * (ex * ex + ey * ey)).exp();
                buf[i * w + j] = v.round().min(255.0) as u8;
            }
        }
        buf
    }

    #[test]
    fn test_uniform_image_is_degenerate() {
        let (w, h) = (64usize, 64usize);
        let buf = vec![50u8; w * h];
        let cfg = CameraConfig {
            corner_fraction: 0.1,
            ..CameraConfig::default()
        };
        let mut eng = BackgroundEngine::new(w, h, Roi::full(w, h), &cfg);
        let r = eng.run(PlaneRef::U8(&buf));
        let st = eng.state();
        assert_abs_diff_eq!(st.mean, 50.0, epsilon = 1e-9);
        assert_abs_diff_eq!(st.sdev, 0.0, epsilon = 1e-9);
        assert_eq!(st.count, 0);
        assert!(r.nan);
        assert_eq!((r.xc, r.yc, r.dx, r.dy), (0.0, 0.0, 0.0, 0.0));
        // Subtracted plane is all zeros inside the aperture
        assert!(eng.subtracted().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_pedestal_is_removed_from_centroid() {
        let (w, h) = (96usize, 96usize);
        let buf = gaussian_on_pedestal(w, h, 48.0, 44.0, 8.0, 200.0, 20.0);
        let mut eng = engine(w, h, 0);
        let r = eng.run(PlaneRef::U8(&buf));
        assert!(!r.nan);
        assert_abs_diff_eq!(r.xc, 48.0, epsilon = 0.5);
        assert_abs_diff_eq!(r.yc, 44.0, epsilon = 0.5);
        let st = eng.state();
        assert_abs_diff_eq!(st.mean, 20.0, epsilon = 1.0);
        assert!(st.count >= 10);
        assert!(st.max > 150.0);
    }

    #[test]
    fn test_outside_aperture_copied_verbatim() {
        let (w, h) = (32usize, 32usize);
        let mut buf = vec![7u8; w * h];
        // Bright spot inside the aperture
        for i in 12..20 {
            for j in 12..20 {
                buf[i * w + j] = 210;
            }
        }
        let aperture = Roi {
            x1: 8,
            y1: 8,
            x2: 24,
            y2: 24,
        };
        let cfg = CameraConfig {
            corner_fraction: 0.1,
            ..CameraConfig::default()
        };
        let mut eng = BackgroundEngine::new(w, h, aperture, &cfg);
        eng.run(PlaneRef::U8(&buf));
        let sub = eng.subtracted();
        // Corner of the frame is outside the aperture: raw value survives
        assert_eq!(sub[0], 7.0);
        assert_eq!(sub[(h - 1) * w + (w - 1)], 7.0);
        // Sub-threshold aperture pixel is exactly zero
        assert_eq!(sub[9 * w + 9], 0.0);
    }

    #[test]
    fn test_refinement_converges_quickly() {
        let (w, h) = (128usize, 128usize);
        let buf = gaussian_on_pedestal(w, h, 64.0, 64.0, 10.0, 255.0, 0.0);

        let mut one_shot = engine(w, h, 0);
        let r0 = one_shot.run(PlaneRef::U8(&buf));

        let cfg = CameraConfig {
            max_iters: 25,
            precision: 0.001,
            ..CameraConfig::default()
        };
        let mut refined = BackgroundEngine::new(w, h, Roi::full(w, h), &cfg);
        let r = refined.run(PlaneRef::U8(&buf));
        assert!(!r.nan);
        assert!(r.iters <= 5, "iters = {}", r.iters);
        assert_abs_diff_eq!(r.xc, r0.xc, epsilon = 0.1);
        assert_abs_diff_eq!(r.yc, r0.yc, epsilon = 0.1);
        // Working ROI shrank around the beam and stayed inside the aperture
        assert!(r.x1 >= 0 && r.x2 <= w as i32);
        assert!(r.x2 - r.x1 < w as i32);
    }

    #[test]
    fn test_max_iter_zero_is_single_shot() {
        let (w, h) = (64usize, 64usize);
        let buf = gaussian_on_pedestal(w, h, 32.0, 32.0, 6.0, 220.0, 5.0);
        let mut eng = engine(w, h, 0);
        let r = eng.run(PlaneRef::U8(&buf));
        assert_eq!(r.iters, 0);
        assert_eq!((r.x1, r.y1, r.x2, r.y2), (0, 0, 64, 64));
    }
}
