//! Capture worker: one dedicated thread per camera.
//!
//! The loop paces itself to the display rate rather than the camera rate:
//! it sleeps in coarse ticks until the frame interval has passed, blocks on
//! the driver for the next frame, unpacks and computes, and publishes to
//! the display sink and statistics consumers on their own slower cadences.
//! Reconfiguration and cancellation are only honored at the statistics
//! tick, so a parameter change never lands mid-frame.
//!
//! Sleep gives bad pacing precision because the OS decides how long the
//! thread actually sleeps. Disabling the sleep would give an exact frame
//! rate at the cost of a spinning core; the 5 ms tick lands at about 30 FPS
//! and a relaxed CPU, which is enough for an operator display.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use super::{
    AcquisitionLength, CameraDriver, CameraInfo, DriverStats, FrameHandle, PixelScale,
};
use crate::background::BackgroundEngine;
use crate::beam::{self, BeamResult, PlaneRef, Roi};
use crate::codec::{self, PixelFormat};
use crate::config::CameraConfig;
use crate::display::DisplaySink;
use crate::error::{AppResult, ProfilerError};
use crate::measure::MeasureSink;

/// Coarse wall-clock recheck interval while waiting out the frame pacing.
pub const LOOP_TICK_MS: u64 = 5;
/// Target time between processed frames (~33 FPS display cap).
pub const FRAME_INTERVAL_MS: i64 = 30;
/// Cadence of display publications.
pub const PLOT_INTERVAL_MS: i64 = 200;
/// Cadence of statistics, cancellation and reconfiguration checks.
pub const STAT_INTERVAL_MS: i64 = 1000;
/// Driver wait timeout per frame.
pub const FRAME_TIMEOUT_MS: u64 = 5000;

const EWMA_ALPHA: f64 = 0.1;

#[inline]
fn ewma(avg: f64, sample: f64) -> f64 {
    avg * (1.0 - EWMA_ALPHA) + sample * EWMA_ALPHA
}

/// Worker statistics snapshot, refreshed once per stat tick.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CaptureStats {
    /// Frames per second over the EWMA frame time.
    pub fps: u32,
    pub avg_frame_time_ms: f64,
    pub avg_render_time_ms: f64,
    pub avg_calc_time_ms: f64,
    /// Transient per-frame errors since capture start.
    pub err_count: u64,
    /// Driver-side transport counters.
    pub driver: DriverStats,
    /// Milliseconds since the measurement started, -1 when idle.
    pub measure_elapsed_ms: i64,
}

/// Signals emitted by the worker thread.
#[derive(Clone, Debug)]
pub enum CameraEvent {
    /// A frame (and result) was published to the display sink.
    Ready,
    /// Periodic statistics snapshot.
    Stats(CaptureStats),
    /// Fatal driver error; the worker has terminated.
    Error(String),
}

/// Camera lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraState {
    Created,
    Capturing,
    Measuring,
    Stopped,
}

struct ConfigCell {
    cfg: CameraConfig,
    reconfig: bool,
}

struct Shared {
    config: Mutex<ConfigCell>,
    cancel: AtomicBool,
    stats: Mutex<CaptureStats>,
    sink: Mutex<Option<MeasureSink>>,
}

/// Handle owning one capture thread; the UI side of the worker.
pub struct Camera {
    info: CameraInfo,
    scale: PixelScale,
    shared: Arc<Shared>,
    event_rx: Receiver<CameraEvent>,
    event_tx: Sender<CameraEvent>,
    pending: Option<(Box<dyn CameraDriver>, Box<dyn DisplaySink>, PixelFormat)>,
    handle: Option<JoinHandle<()>>,
    state: CameraState,
}

impl Camera {
    /// Opens a camera on `driver`: negotiates the pixel format and starts
    /// acquisition, but does not spawn the capture thread yet.
    pub fn open(
        mut driver: Box<dyn CameraDriver>,
        display: Box<dyn DisplaySink>,
        mut cfg: CameraConfig,
    ) -> AppResult<Self> {
        cfg.validate();
        let format = driver.negotiate_pixel_format(PixelFormat::Mono8)?;
        let info = driver.info();
        let scale = driver.pixel_scale();
        log::info!(
            "opened {} ({}), format {:?}",
            info.name,
            info.resolution_str(),
            format
        );
        driver.start_acquisition(AcquisitionLength::Infinite)?;

        let shared = Arc::new(Shared {
            config: Mutex::new(ConfigCell {
                cfg,
                reconfig: false,
            }),
            cancel: AtomicBool::new(false),
            stats: Mutex::new(CaptureStats::default()),
            sink: Mutex::new(None),
        });
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            info,
            scale,
            shared,
            event_rx,
            event_tx,
            pending: Some((driver, display, format)),
            handle: None,
            state: CameraState::Created,
        })
    }

    /// Spawns the capture thread; `Created -> Capturing`.
    pub fn start(&mut self) -> AppResult<()> {
        let (driver, display, format) = self
            .pending
            .take()
            .ok_or(ProfilerError::AlreadyStarted)?;
        let worker = CaptureWorker::new(
            driver,
            display,
            format,
            self.info.clone(),
            Arc::clone(&self.shared),
            self.event_tx.clone(),
        );
        let handle = std::thread::Builder::new()
            .name(format!("capture-{}", self.info.name))
            .spawn(move || worker.run())?;
        self.handle = Some(handle);
        self.state = CameraState::Capturing;
        Ok(())
    }

    pub fn info(&self) -> &CameraInfo {
        &self.info
    }

    pub fn pixel_scale(&self) -> PixelScale {
        self.scale
    }

    pub fn state(&self) -> CameraState {
        self.state
    }

    /// Worker event stream (ready / stats / fatal error).
    pub fn events(&self) -> &Receiver<CameraEvent> {
        &self.event_rx
    }

    /// Most recent statistics snapshot.
    pub fn stats(&self) -> CaptureStats {
        *self.shared.stats.lock()
    }

    /// Stages a configuration change; the worker applies it at the next
    /// stat tick (at most one second of latency), never mid-frame.
    pub fn reconfigure(&self, mut cfg: CameraConfig) {
        cfg.validate();
        let mut cell = self.shared.config.lock();
        cell.cfg = cfg;
        cell.reconfig = true;
    }

    /// Attaches a measurement sink; `Capturing -> Measuring`. Idempotent:
    /// a second call while measuring leaves the running session alone.
    pub fn start_measure(&mut self, sink: MeasureSink) {
        let mut guard = self.shared.sink.lock();
        if guard.is_none() {
            *guard = Some(sink);
            drop(guard);
            self.state = CameraState::Measuring;
        }
    }

    /// Detaches the sink and flushes its final partial batch.
    pub fn stop_measure(&mut self) {
        let sink = self.shared.sink.lock().take();
        if let Some(sink) = sink {
            sink.finish();
        }
        if self.state == CameraState::Measuring {
            self.state = CameraState::Capturing;
        }
    }

    /// Requests termination and joins the capture thread; terminal.
    ///
    /// The worker notices the flag at its next stat tick, so this blocks
    /// for up to about a second.
    pub fn cancel(&mut self) {
        self.stop_measure();
        self.shared.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("capture thread for {} panicked", self.info.name);
            }
        }
        self.state = CameraState::Stopped;
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.cancel();
        }
    }
}

/// Thread-side state of the capture loop.
struct CaptureWorker {
    driver: Box<dyn CameraDriver>,
    display: Box<dyn DisplaySink>,
    shared: Arc<Shared>,
    events: Sender<CameraEvent>,
    info: CameraInfo,
    format: PixelFormat,
    /// Unpack target for packed and 16-bit wire formats; worker-owned.
    plane16: Vec<u16>,
    aperture: Roi,
    engine: Option<BackgroundEngine>,
    normalize: bool,
    result: BeamResult,
    timer: Instant,
    prev_frame: i64,
    prev_ready: i64,
    prev_stat: i64,
    avg_frame_time: f64,
    avg_render_time: f64,
    avg_calc_time: f64,
    err_count: u64,
}

impl CaptureWorker {
    fn new(
        driver: Box<dyn CameraDriver>,
        display: Box<dyn DisplaySink>,
        format: PixelFormat,
        info: CameraInfo,
        shared: Arc<Shared>,
        events: Sender<CameraEvent>,
    ) -> Self {
        let pixels = info.width * info.height;
        Self {
            driver,
            display,
            shared,
            events,
            format,
            plane16: if format == PixelFormat::Mono8 {
                Vec::new()
            } else {
                vec![0u16; pixels]
            },
            aperture: Roi::full(info.width, info.height),
            engine: None,
            normalize: true,
            result: BeamResult::default(),
            info,
            timer: Instant::now(),
            prev_frame: 0,
            prev_ready: 0,
            prev_stat: 0,
            avg_frame_time: 0.0,
            avg_render_time: 0.0,
            avg_calc_time: 0.0,
            err_count: 0,
        }
    }

    fn elapsed_ms(&self) -> i64 {
        self.timer.elapsed().as_millis() as i64
    }

    /// Copies the staged configuration out and rebuilds derived state.
    fn configure(&mut self) {
        let cfg = {
            let mut cell = self.shared.config.lock();
            cell.reconfig = false;
            cell.cfg
        };
        let (w, h) = (self.info.width, self.info.height);
        self.aperture = cfg.resolved_aperture(w, h);
        self.normalize = cfg.normalize;
        self.engine = cfg
            .subtract_background
            .then(|| BackgroundEngine::new(w, h, self.aperture, &cfg));
        self.result = BeamResult::default();
        log::debug!(
            "{}: configured, aperture ({}, {})..({}, {}), subtract {}, normalize {}",
            self.info.name,
            self.aperture.x1,
            self.aperture.y1,
            self.aperture.x2,
            self.aperture.y2,
            self.engine.is_some(),
            self.normalize
        );
    }

    fn run(mut self) {
        self.run_loop();
        if let Err(e) = self.driver.stop_acquisition() {
            log::warn!("{}: failed to stop acquisition: {e}", self.info.name);
        }
        log::debug!("{}: capture thread stopped", self.info.name);
    }

    fn run_loop(&mut self) {
        log::debug!("{}: capture thread started", self.info.name);
        self.display.init_graph(self.info.width, self.info.height);
        self.configure();
        self.timer = Instant::now();
        loop {
            let tm = self.elapsed_ms();
            if tm - self.prev_frame < FRAME_INTERVAL_MS {
                std::thread::sleep(Duration::from_millis(LOOP_TICK_MS));
                continue;
            }
            self.avg_frame_time = ewma(self.avg_frame_time, (tm - self.prev_frame) as f64);
            self.prev_frame = tm;

            match self
                .driver
                .wait_for_frame(Duration::from_millis(FRAME_TIMEOUT_MS))
            {
                Ok(frame) => {
                    if !self.process_frame(frame, tm) {
                        return;
                    }
                }
                Err(e) if e.is_fatal() => {
                    log::warn!("{}: {e}", self.info.name);
                    let _ = self.events.send(CameraEvent::Error(e.to_string()));
                    return;
                }
                Err(_) => {
                    self.err_count += 1;
                }
            }

            if tm - self.prev_stat >= STAT_INTERVAL_MS {
                self.prev_stat = tm;
                self.publish_stats();
                if self.shared.cancel.load(Ordering::Relaxed) {
                    log::debug!("{}: interrupted", self.info.name);
                    return;
                }
                let reconfig = self.shared.config.lock().reconfig;
                if reconfig {
                    self.configure();
                }
            }
        }
    }

    /// Unpack, compute, record, publish; returns false on fatal errors.
    /// The frame is released on every path.
    fn process_frame(&mut self, frame: FrameHandle, tm: i64) -> bool {
        let t_unpack = self.timer.elapsed();
        {
            let buf = self.driver.frame_buffer(&frame);
            match self.format {
                PixelFormat::Mono8 => {}
                PixelFormat::Mono10g40 => codec::unpack_mono10g40(buf, &mut self.plane16),
                PixelFormat::Mono12g24 => codec::unpack_mono12g24(buf, &mut self.plane16),
                PixelFormat::Mono16 => {
                    for (dst, src) in self.plane16.iter_mut().zip(buf.chunks_exact(2)) {
                        *dst = u16::from_le_bytes([src[0], src[1]]);
                    }
                }
            }
            let unpack_ms = (self.timer.elapsed() - t_unpack).as_secs_f64() * 1e3;
            self.avg_render_time = ewma(self.avg_render_time, unpack_ms);

            let plane = match self.format {
                PixelFormat::Mono8 => PlaneRef::U8(buf),
                _ => PlaneRef::U16(&self.plane16),
            };

            let t_calc = self.timer.elapsed();
            self.result = match self.engine.as_mut() {
                Some(engine) => engine.run(plane),
                None => beam::calc(plane, self.info.width, self.aperture),
            };
            let calc_ms = (self.timer.elapsed() - t_calc).as_secs_f64() * 1e3;
            self.avg_calc_time = ewma(self.avg_calc_time, calc_ms);

            if let Some(sink) = self.shared.sink.lock().as_mut() {
                sink.append(&self.result);
            }

            if tm - self.prev_ready >= PLOT_INTERVAL_MS {
                self.prev_ready = tm;

                let normalize = self.normalize;
                let graph = self.display.raw_graph();
                let (dmin, dmax) = match self.engine.as_ref() {
                    Some(engine) => {
                        let st = engine.state();
                        if normalize {
                            codec::copy_normalized_f64(engine.subtracted(), graph, st.min, st.max);
                            (0.0, 1.0)
                        } else {
                            graph.copy_from_slice(engine.subtracted());
                            (st.min, st.max)
                        }
                    }
                    None => match plane {
                        PlaneRef::U8(raw) => {
                            if normalize {
                                let max = codec::find_max_u8(raw);
                                codec::render_to_doubles_norm_u8(raw, graph, max);
                                (0.0, 1.0)
                            } else {
                                (0.0, codec::copy_u8_to_f64(raw, graph))
                            }
                        }
                        PlaneRef::U16(raw) => {
                            if normalize {
                                let max = codec::find_max_u16(raw);
                                codec::render_to_doubles_norm_u16(raw, graph, max);
                                (0.0, 1.0)
                            } else {
                                (0.0, codec::copy_u16_to_f64(raw, graph))
                            }
                        }
                        PlaneRef::F64(_) => (0.0, 1.0),
                    },
                };
                self.display.invalidate_graph();
                self.display.set_result(self.result, dmin, dmax);
                let _ = self.events.send(CameraEvent::Ready);
            }
        }

        if let Err(e) = self.driver.release_frame(frame) {
            if e.is_fatal() {
                let _ = self.events.send(CameraEvent::Error(e.to_string()));
                return false;
            }
            log::warn!("{}: failed to release frame: {e}", self.info.name);
            self.err_count += 1;
        }
        true
    }

    fn publish_stats(&mut self) {
        let fps = if self.avg_frame_time > 0.0 {
            (1000.0 / self.avg_frame_time).round() as u32
        } else {
            0
        };
        let measure_elapsed_ms = self
            .shared
            .sink
            .lock()
            .as_ref()
            .map_or(-1, MeasureSink::elapsed_ms);
        let stats = CaptureStats {
            fps,
            avg_frame_time_ms: self.avg_frame_time,
            avg_render_time_ms: self.avg_render_time,
            avg_calc_time_ms: self.avg_calc_time,
            err_count: self.err_count,
            driver: self.driver.stats(),
            measure_elapsed_ms,
        };
        *self.shared.stats.lock() = stats;
        let _ = self.events.send(CameraEvent::Stats(stats));
        log::debug!(
            "{}: fps {} | frame {:.1} ms | render {:.2} ms | calc {:.2} ms | errors {}",
            self.info.name,
            stats.fps,
            stats.avg_frame_time_ms,
            stats.avg_render_time_ms,
            stats.avg_calc_time_ms,
            stats.err_count
        );
    }
}
