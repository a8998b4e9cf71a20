//! ISO 11146 beam parameter calculator.
//!
//! Computes the centroid and second-order central moments of an intensity
//! distribution over a region of interest in two naive passes, then derives
//! the principal-axis 4-sigma diameters and the azimuth of the major axis.
//!
//! # Numerical notes
//!
//! Accumulators are `f64` regardless of the source bit depth; single
//! precision visibly drifts on 2k x 2k frames. The two-pass body is written
//! once and instantiated for `u8`, `u16` and `f64` planes, so a given input
//! always takes the same arithmetic path and repeated runs are bit-identical.

use serde::{Deserialize, Serialize};

/// Multiplier turning a second-moment sum into a 4-sigma diameter:
/// `d = 2 * sqrt(2) * sqrt(xx + yy +/- s)`.
pub const D4SIGMA: f64 = 2.8284271247461903;

/// Rectangle in pixel coordinates, half-open: `x1 <= j < x2`, `y1 <= i < y2`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Roi {
    /// Full-frame rectangle for a `w` x `h` sensor.
    pub fn full(w: usize, h: usize) -> Self {
        Self {
            x1: 0,
            y1: 0,
            x2: w as i32,
            y2: h as i32,
        }
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    /// Whether the rectangle is non-degenerate and inside a `w` x `h` frame.
    pub fn is_valid(&self, w: usize, h: usize) -> bool {
        self.x1 >= 0
            && self.y1 >= 0
            && self.x1 < self.x2
            && self.y1 < self.y2
            && self.x2 <= w as i32
            && self.y2 <= h as i32
    }

    /// Clamps this rectangle into `outer`.
    pub fn clamped_to(&self, outer: &Roi) -> Roi {
        Roi {
            x1: self.x1.max(outer.x1),
            y1: self.y1.max(outer.y1),
            x2: self.x2.min(outer.x2),
            y2: self.y2.min(outer.y2),
        }
    }
}

/// Beam parameters derived from one frame.
///
/// Positions and diameters are in pixels, `phi` in degrees in [-90, 90].
/// `xx`, `yy`, `xy` are second central moments normalized by total power,
/// `power` is the plain intensity sum over the final working ROI
/// (`x1..x2` x `y1..y2`). When `nan` is set every numeric field is zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BeamResult {
    /// Centroid column.
    pub xc: f64,
    /// Centroid row.
    pub yc: f64,
    /// 4-sigma diameter along the major principal axis.
    pub dx: f64,
    /// 4-sigma diameter along the minor principal axis.
    pub dy: f64,
    /// Azimuth of the principal axis, degrees.
    pub phi: f64,
    /// Normalized second central moment in x.
    pub xx: f64,
    /// Normalized second central moment in y.
    pub yy: f64,
    /// Normalized mixed second central moment.
    pub xy: f64,
    /// Total power (intensity sum) over the working ROI.
    pub power: f64,
    /// Working ROI left edge.
    pub x1: i32,
    /// Working ROI top edge.
    pub y1: i32,
    /// Working ROI right edge (exclusive).
    pub x2: i32,
    /// Working ROI bottom edge (exclusive).
    pub y2: i32,
    /// Refinement iterations actually run (0 for single-shot).
    pub iters: u32,
    /// Set when the frame is degenerate; all other fields are zero then.
    pub nan: bool,
}

impl BeamResult {
    /// Degenerate result covering `roi`, with `nan` set.
    pub fn degenerate(roi: Roi) -> Self {
        Self {
            x1: roi.x1,
            y1: roi.y1,
            x2: roi.x2,
            y2: roi.y2,
            nan: true,
            ..Self::default()
        }
    }

    /// `min(dx, dy) / max(dx, dy)`, in (0, 1]; 1 is a perfect circle.
    pub fn ellipticity(&self) -> f64 {
        self.dx.min(self.dy) / self.dx.max(self.dy)
    }
}

/// Borrowed pixel plane in one of the supported sample depths.
///
/// Camera frames arrive as `u8` or `u16`; the background engine re-runs the
/// calculator over its `f64` subtracted plane.
#[derive(Clone, Copy, Debug)]
pub enum PlaneRef<'a> {
    U8(&'a [u8]),
    U16(&'a [u16]),
    F64(&'a [f64]),
}

pub(crate) trait Sample: Copy {
    fn to_f64(self) -> f64;
}

impl Sample for u8 {
    #[inline(always)]
    fn to_f64(self) -> f64 {
        f64::from(self)
    }
}

impl Sample for u16 {
    #[inline(always)]
    fn to_f64(self) -> f64 {
        f64::from(self)
    }
}

impl Sample for f64 {
    #[inline(always)]
    fn to_f64(self) -> f64 {
        self
    }
}

#[inline(always)]
fn sign(s: f64) -> f64 {
    if s < 0.0 {
        -1.0
    } else if s > 0.0 {
        1.0
    } else {
        0.0
    }
}

fn calc_body<T: Sample>(buf: &[T], w: usize, roi: Roi) -> BeamResult {
    let mut p = 0.0;
    let mut xc = 0.0;
    let mut yc = 0.0;
    for i in roi.y1..roi.y2 {
        let offset = i as usize * w;
        for j in roi.x1..roi.x2 {
            let v = buf[offset + j as usize].to_f64();
            p += v;
            xc += v * j as f64;
            yc += v * i as f64;
        }
    }
    if p <= 0.0 {
        return BeamResult::degenerate(roi);
    }
    xc /= p;
    yc /= p;

    let mut xx = 0.0;
    let mut yy = 0.0;
    let mut xy = 0.0;
    for i in roi.y1..roi.y2 {
        let offset = i as usize * w;
        let di = i as f64 - yc;
        for j in roi.x1..roi.x2 {
            let v = buf[offset + j as usize].to_f64();
            let dj = j as f64 - xc;
            xx += v * dj * dj;
            xy += v * dj * di;
            yy += v * di * di;
        }
    }
    xx /= p;
    xy /= p;
    yy /= p;

    let s = sign(xx - yy) * ((xx - yy) * (xx - yy) + 4.0 * xy * xy).sqrt();
    BeamResult {
        xc,
        yc,
        dx: D4SIGMA * (xx + yy + s).sqrt(),
        dy: D4SIGMA * (xx + yy - s).sqrt(),
        phi: 0.5 * (2.0 * xy).atan2(xx - yy).to_degrees(),
        xx,
        yy,
        xy,
        power: p,
        x1: roi.x1,
        y1: roi.y1,
        x2: roi.x2,
        y2: roi.y2,
        iters: 0,
        nan: false,
    }
}

/// Runs the two-pass second-moment calculation over `roi`.
///
/// `w` is the full row stride of the plane; `roi` must already be valid for
/// the plane dimensions (callers clamp before this point). A zero-power
/// region yields [`BeamResult::degenerate`].
pub fn calc(plane: PlaneRef<'_>, w: usize, roi: Roi) -> BeamResult {
    match plane {
        PlaneRef::U8(buf) => calc_body(buf, w, roi),
        PlaneRef::U16(buf) => calc_body(buf, w, roi),
        PlaneRef::F64(buf) => calc_body(buf, w, roi),
    }
}
