//! Headless capture binary.
//!
//! Drives the full pipeline without a GUI: opens the virtual demo camera or
//! a still image, runs the capture worker, prints rolling results at the
//! display cadence, and optionally records a measurement CSV.
//!
//! ```bash
//! beamscope --duration 10 --measure run.csv
//! beamscope --source beam.png --config camera.toml
//! ```

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;

use beamscope::beam::BeamResult;
use beamscope::camera::still::StillImageCamera;
use beamscope::camera::virtual_demo::VirtualBeamDriver;
use beamscope::camera::worker::{Camera, CameraEvent};
use beamscope::config::CameraConfig;
use beamscope::display::DisplaySink;
use beamscope::measure::MeasureSaver;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "beamscope", about = "Real-time laser beam profiler")]
struct Cli {
    /// Frame source: "virtual" or a path to a grayscale image
    #[arg(long, default_value = "virtual")]
    source: String,

    /// Camera configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Record a measurement to this CSV file
    #[arg(long)]
    measure: Option<PathBuf>,

    /// Capture duration in seconds (live sources)
    #[arg(long, default_value_t = 5)]
    duration: u64,

    /// Show the unprocessed plane (still images only)
    #[arg(long)]
    raw: bool,
}

/// Display sink that reports results on the console.
struct ConsoleDisplay {
    graph: Vec<f64>,
}

impl ConsoleDisplay {
    fn new() -> Self {
        Self { graph: Vec::new() }
    }
}

impl DisplaySink for ConsoleDisplay {
    fn init_graph(&mut self, w: usize, h: usize) {
        self.graph = vec![0.0; w * h];
    }

    fn raw_graph(&mut self) -> &mut [f64] {
        &mut self.graph
    }

    fn invalidate_graph(&mut self) {}

    fn set_result(&mut self, r: BeamResult, _min: f64, _max: f64) {
        print_result(&r);
    }
}

fn print_result(r: &BeamResult) {
    if r.nan {
        println!("no beam (degenerate frame)");
    } else {
        println!(
            "xc {:7.1}  yc {:7.1}  dx {:7.1}  dy {:7.1}  phi {:6.1}  eps {:.3}  iters {}",
            r.xc,
            r.yc,
            r.dx,
            r.dy,
            r.phi,
            r.ellipticity(),
            r.iters
        );
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let cfg = match &cli.config {
        Some(path) => CameraConfig::load(path)
            .with_context(|| format!("failed to load config '{}'", path.display()))?,
        None => CameraConfig::default(),
    };

    if cli.source == "virtual" {
        run_live(&cli, cfg)
    } else {
        run_still(&cli, cfg)
    }
}

fn run_live(cli: &Cli, cfg: CameraConfig) -> anyhow::Result<()> {
    let driver = Box::new(VirtualBeamDriver::new());
    let mut cam = Camera::open(driver, Box::new(ConsoleDisplay::new()), cfg)
        .context("failed to open the virtual camera")?;
    println!("{} ({})", cam.info().name, cam.info().resolution_str());
    cam.start().context("failed to start capture")?;

    let saver = match &cli.measure {
        Some(path) => {
            let saver = MeasureSaver::start(path, cam.pixel_scale().factor())
                .context("failed to start measurement")?;
            cam.start_measure(saver.sink());
            Some(saver)
        }
        None => None,
    };

    let deadline = Instant::now() + Duration::from_secs(cli.duration);
    while Instant::now() < deadline {
        match cam.events().recv_timeout(Duration::from_millis(200)) {
            Ok(CameraEvent::Stats(s)) => {
                log::info!(
                    "fps {} | calc {:.2} ms | errors {}",
                    s.fps,
                    s.avg_calc_time_ms,
                    s.err_count
                );
            }
            Ok(CameraEvent::Error(e)) => {
                cam.cancel();
                anyhow::bail!("capture failed: {e}");
            }
            Ok(CameraEvent::Ready) | Err(_) => {}
        }
    }

    cam.stop_measure();
    cam.cancel();
    if let Some(saver) = saver {
        let path = saver.path().to_path_buf();
        saver.finish();
        println!("measurement written to '{}'", path.display());
    }
    Ok(())
}

fn run_still(cli: &Cli, cfg: CameraConfig) -> anyhow::Result<()> {
    let path = PathBuf::from(&cli.source);
    let cam = StillImageCamera::load(&path)
        .with_context(|| format!("failed to load '{}'", path.display()))?;
    let info = cam.info();
    println!("{} ({})", info.name, info.resolution_str());

    let mut display = ConsoleDisplay::new();
    let out = cam.process(&cfg, &mut display, cli.raw);
    if let Some(st) = out.background {
        log::info!(
            "baseline mean {:.2} | sdev {:.2} | illuminated {}",
            st.mean,
            st.sdev,
            st.count
        );
    }
    log::info!("load {:.1} ms | calc {:.1} ms", out.load_ms, out.calc_ms);
    Ok(())
}
