//! Synthetic demo camera.
//!
//! Renders a tilted elliptical beam into an 8-bit frame buffer and lets the
//! beam parameters wander inside bounded random walks, so the whole
//! pipeline can be exercised without hardware. The driver produces a frame
//! whenever asked; pacing is the capture worker's job.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::beam::Roi;
use crate::codec::PixelFormat;

use super::{
    AcquisitionLength, CameraDescriptor, CameraDriver, CameraInfo, DriverError, FrameHandle,
};

const DEMO_WIDTH: usize = 2592;
const DEMO_HEIGHT: usize = 2048;

/// Bounded random walk used for the demo beam motion.
///
/// Each step moves by a uniform offset of up to a quarter of the span in
/// either direction, reflecting at the lower bound and re-entering from
/// below at the upper one.
struct RandomWalk {
    v: f64,
    dv: f64,
    v_min: f64,
    h: f64,
}

impl RandomWalk {
    fn new(start: f64, min: f64, max: f64) -> Self {
        let dv = max - min;
        Self {
            v: start - min,
            dv,
            v_min: min,
            h: dv / 4.0,
        }
    }

    fn next(&mut self, rng: &mut StdRng) -> f64 {
        self.v = (self.v + rng.gen::<f64>() * self.h - self.h * 0.5).abs();
        if self.v > self.dv {
            self.v = self.dv - rng.gen::<f64>() * self.h;
        }
        self.v + self.v_min
    }
}

/// Parameters of the rendered beam.
struct BeamSpot {
    xc: f64,
    yc: f64,
    dx: f64,
    dy: f64,
    phi: f64,
    peak: f64,
}

/// Renders a tilted elliptical spot into an 8-bit plane.
///
/// The radial profile is the quintic approximation `(1 - 2r²/5)⁵` of a
/// Gaussian, evaluated over a bounding box 1.2 diameters wide; everything
/// outside is zero.
fn render_beam_tilted(b: &BeamSpot, w: usize, h: usize, buf: &mut [u8]) {
    buf.fill(0);
    let r2 = (b.dx / 2.0) * (b.dx / 2.0);
    let (sin_phi, cos_phi) = (b.phi.to_radians()).sin_cos();
    let el = b.dx / b.dy;
    let x_min = (-b.dx * 0.6) as i32;
    let x_max = (b.dx * 0.6) as i32;
    let y_min = (-b.dy * 0.6) as i32;
    let y_max = (b.dy * 0.6) as i32;
    for y in y_min..y_max {
        let y2 = (f64::from(y) * el) * (f64::from(y) * el);
        for x in x_min..x_max {
            let x1 = (b.xc + f64::from(x) * cos_phi - f64::from(y) * sin_phi) as i64;
            let y1 = (b.yc + f64::from(x) * sin_phi + f64::from(y) * cos_phi) as i64;
            if x1 >= 0 && (x1 as usize) < w && y1 >= 0 && (y1 as usize) < h {
                let t = 1.0 + (-2.0 * (f64::from(x) * f64::from(x) + y2) / r2) / 5.0;
                buf[y1 as usize * w + x1 as usize] = (b.peak * t * t * t * t * t) as u8;
            }
        }
    }
}

/// Synthetic camera driver with a wandering elliptical beam.
pub struct VirtualBeamDriver {
    w: usize,
    h: usize,
    frame: Vec<u8>,
    spot: BeamSpot,
    dx_walk: RandomWalk,
    dy_walk: RandomWalk,
    xc_walk: RandomWalk,
    yc_walk: RandomWalk,
    phi_walk: RandomWalk,
    rng: StdRng,
    started: bool,
    frames_left: Option<u32>,
    next_handle: u64,
    held: Option<u64>,
}

impl VirtualBeamDriver {
    /// Demo camera at the stock 2592 x 2048 sensor size.
    pub fn new() -> Self {
        Self::with_size(DEMO_WIDTH, DEMO_HEIGHT)
    }

    /// Demo camera with a custom sensor size (tests use small frames).
    pub fn with_size(w: usize, h: usize) -> Self {
        Self::with_size_seeded(w, h, rand::random())
    }

    /// Deterministic variant for reproducible runs.
    pub fn with_size_seeded(w: usize, h: usize, seed: u64) -> Self {
        let dx = w as f64 / 2.0;
        let dy = dx * 0.75;
        let xc = w as f64 / 2.0;
        let yc = h as f64 / 2.0;
        let phi = 12.0;
        let wander = (w as f64 / 128.0).max(2.0);
        Self {
            w,
            h,
            frame: vec![0u8; w * h],
            spot: BeamSpot {
                xc,
                yc,
                dx,
                dy,
                phi,
                peak: 255.0,
            },
            dx_walk: RandomWalk::new(dx, dx - wander, dx + wander),
            dy_walk: RandomWalk::new(dy, dy - wander, dy + wander),
            xc_walk: RandomWalk::new(xc, xc - wander, xc + wander),
            yc_walk: RandomWalk::new(yc, yc - wander, yc + wander),
            phi_walk: RandomWalk::new(phi, 0.0, 24.0),
            rng: StdRng::seed_from_u64(seed),
            started: false,
            frames_left: None,
            next_handle: 0,
            held: None,
        }
    }

    /// Devices this driver family can offer; always exactly one.
    pub fn enumerate() -> Vec<CameraDescriptor> {
        vec![CameraDescriptor {
            id: 0,
            model_name: "VirtualDemo".into(),
            serial_number: "SIM-0000".into(),
        }]
    }
}

impl Default for VirtualBeamDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraDriver for VirtualBeamDriver {
    fn descriptor(&self) -> CameraDescriptor {
        CameraDescriptor {
            id: 0,
            model_name: "VirtualDemo".into(),
            serial_number: "SIM-0000".into(),
        }
    }

    fn info(&self) -> CameraInfo {
        CameraInfo {
            name: "Camera: VirtualDemo".into(),
            descr: format!("Synthetic beam source {}x{}", self.w, self.h),
            width: self.w,
            height: self.h,
            bits: 8,
        }
    }

    fn negotiate_pixel_format(
        &mut self,
        preferred: PixelFormat,
    ) -> Result<PixelFormat, DriverError> {
        // The demo sensor only speaks Mono8
        let _ = preferred;
        Ok(PixelFormat::Mono8)
    }

    fn roi(&self) -> Roi {
        Roi::full(self.w, self.h)
    }

    fn set_roi(&mut self, _roi: Roi) -> Result<(), DriverError> {
        Err(DriverError::Unsupported(
            "virtual camera has a fixed ROI".into(),
        ))
    }

    fn start_acquisition(&mut self, length: AcquisitionLength) -> Result<(), DriverError> {
        self.started = true;
        self.frames_left = match length {
            AcquisitionLength::Frames(n) => Some(n),
            AcquisitionLength::Infinite => None,
        };
        Ok(())
    }

    fn stop_acquisition(&mut self) -> Result<(), DriverError> {
        self.started = false;
        Ok(())
    }

    fn wait_for_frame(&mut self, _timeout: Duration) -> Result<FrameHandle, DriverError> {
        if !self.started {
            return Err(DriverError::Aborted("acquisition not running".into()));
        }
        if let Some(left) = self.frames_left.as_mut() {
            if *left == 0 {
                return Err(DriverError::Aborted("requested frame count delivered".into()));
            }
            *left -= 1;
        }
        render_beam_tilted(&self.spot, self.w, self.h, &mut self.frame);
        self.spot.dx = self.dx_walk.next(&mut self.rng);
        self.spot.dy = self.dy_walk.next(&mut self.rng);
        self.spot.xc = self.xc_walk.next(&mut self.rng);
        self.spot.yc = self.yc_walk.next(&mut self.rng);
        self.spot.phi = self.phi_walk.next(&mut self.rng);
        let handle = self.next_handle;
        self.next_handle += 1;
        self.held = Some(handle);
        Ok(FrameHandle(handle))
    }

    fn frame_buffer(&self, frame: &FrameHandle) -> &[u8] {
        debug_assert_eq!(self.held, Some(frame.0));
        &self.frame
    }

    fn release_frame(&mut self, frame: FrameHandle) -> Result<(), DriverError> {
        if self.held.take() != Some(frame.0) {
            return Err(DriverError::Other("released unknown frame".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beam::{self, PlaneRef};

    #[test]
    fn test_rendered_beam_is_measurable() {
        let mut drv = VirtualBeamDriver::with_size_seeded(256, 200, 7);
        drv.start_acquisition(AcquisitionLength::Infinite).unwrap();
        let frame = drv.wait_for_frame(Duration::from_millis(10)).unwrap();
        let buf = drv.frame_buffer(&frame).to_vec();
        drv.release_frame(frame).unwrap();

        let r = beam::calc(PlaneRef::U8(&buf), 256, Roi::full(256, 200));
        assert!(!r.nan);
        // Beam starts centered with dx = w/2
        assert!((r.xc - 128.0).abs() < 15.0);
        assert!((r.yc - 100.0).abs() < 15.0);
        assert!(r.dx > 40.0);
    }

    #[test]
    fn test_walks_stay_bounded() {
        let mut drv = VirtualBeamDriver::with_size_seeded(128, 128, 42);
        drv.start_acquisition(AcquisitionLength::Infinite).unwrap();
        for _ in 0..200 {
            let f = drv.wait_for_frame(Duration::from_millis(1)).unwrap();
            drv.release_frame(f).unwrap();
            assert!(drv.spot.phi >= 0.0 && drv.spot.phi <= 24.0);
            assert!(drv.spot.dx > 0.0);
        }
    }

    #[test]
    fn test_finite_acquisition_aborts_when_exhausted() {
        let mut drv = VirtualBeamDriver::with_size_seeded(64, 64, 1);
        drv.start_acquisition(AcquisitionLength::Frames(2)).unwrap();
        for _ in 0..2 {
            let f = drv.wait_for_frame(Duration::from_millis(1)).unwrap();
            drv.release_frame(f).unwrap();
        }
        let err = drv.wait_for_frame(Duration::from_millis(1)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_wait_before_start_is_aborted() {
        let mut drv = VirtualBeamDriver::with_size_seeded(64, 64, 1);
        let err = drv.wait_for_frame(Duration::from_millis(1)).unwrap_err();
        assert_eq!(err, DriverError::Aborted("acquisition not running".into()));
    }
}
