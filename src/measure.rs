//! Buffered measurement recording.
//!
//! The capture worker appends one fixed-size record per frame into a
//! pre-allocated batch buffer; full batches travel over a channel to a
//! dedicated writer thread that appends CSV rows. Appending a record never
//! allocates: the sink keeps two [`BATCH_SIZE`] buffers and flips between
//! them, and the writer sends drained buffers back for reuse.
//!
//! Output format (one data line per record, no quoting, one trailing
//! newline per line):
//!
//! ```csv
//! Index,Timestamp,Center X,Center Y,Width X,Width Y,Azimuth,Ellipticity
//! 0,2026-03-01T14:05:12.031,1296,1024,648,486,12.0,0.750
//! ```
//!
//! Positions and widths are scaled by the sensor's physical-units-per-pixel
//! factor and truncated to integers; azimuth keeps one decimal place and
//! ellipticity three. A degenerate frame writes all numeric fields as zero.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Local};
use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::beam::BeamResult;
use crate::error::{AppResult, ProfilerError};

/// Records per batch posted to the writer thread.
pub const BATCH_SIZE: usize = 1000;

/// Per-frame measurement record; plain data, fixed size.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MeasureRecord {
    pub index: u32,
    /// Milliseconds since the session start.
    pub time_ms: i64,
    pub nan: bool,
    pub xc: f64,
    pub yc: f64,
    pub dx: f64,
    pub dy: f64,
    pub phi: f64,
}

/// A filled (or final partial) buffer on its way to the writer thread.
#[derive(Debug)]
pub struct MeasureBatch {
    /// Running batch number within the session, from 0.
    pub number: u32,
    /// Valid records in `records` (equals `records.len()`).
    pub count: usize,
    /// The drained buffer; returned to the sink for reuse after writing.
    pub records: Vec<MeasureRecord>,
    /// Wall-clock session start the record offsets are relative to.
    pub session_start: DateTime<Local>,
}

enum WriterMsg {
    Batch(MeasureBatch),
    Finish,
}

/// Worker-side record sink: append-one, batch-handoff.
pub struct MeasureSink {
    active: Vec<MeasureRecord>,
    batch_number: u32,
    record_index: u32,
    session_start: DateTime<Local>,
    started: Instant,
    tx: Sender<WriterMsg>,
    recycle_rx: Receiver<Vec<MeasureRecord>>,
}

impl MeasureSink {
    /// Appends one frame result; posts a batch when the buffer fills.
    ///
    /// Called on the capture thread under the sink mutex; allocation-free.
    pub fn append(&mut self, r: &BeamResult) {
        self.active.push(MeasureRecord {
            index: self.record_index,
            time_ms: self.started.elapsed().as_millis() as i64,
            nan: r.nan,
            xc: r.xc,
            yc: r.yc,
            dx: r.dx,
            dy: r.dy,
            phi: r.phi,
        });
        self.record_index += 1;
        if self.active.len() == BATCH_SIZE {
            self.flip();
        }
    }

    /// Milliseconds since the measurement started.
    pub fn elapsed_ms(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }

    fn flip(&mut self) {
        // The writer drains far faster than capture fills, so a recycled
        // buffer is normally waiting; allocate only if it is not.
        let spare = match self.recycle_rx.try_recv() {
            Ok(mut buf) => {
                buf.clear();
                buf
            }
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => {
                Vec::with_capacity(BATCH_SIZE)
            }
        };
        let full = std::mem::replace(&mut self.active, spare);
        let batch = MeasureBatch {
            number: self.batch_number,
            count: full.len(),
            records: full,
            session_start: self.session_start,
        };
        self.batch_number += 1;
        if self.tx.send(WriterMsg::Batch(batch)).is_err() {
            log::error!("measure writer is gone, dropping batch");
        }
    }

    /// Flushes the pending partial batch; called from `stop_measure`.
    ///
    /// Leaves the writer thread running: the saver may hand out another
    /// sink to resume recording into the same file. Only
    /// [`MeasureSaver::finish`] terminates the writer.
    pub fn finish(mut self) {
        if !self.active.is_empty() {
            self.flip();
        }
    }
}

/// Owns the writer thread and the output file for one measurement session.
#[derive(Debug)]
pub struct MeasureSaver {
    path: PathBuf,
    tx: Sender<WriterMsg>,
    recycle_tx: Sender<Vec<MeasureRecord>>,
    recycle_rx: Receiver<Vec<MeasureRecord>>,
    session_start: DateTime<Local>,
    handle: Option<JoinHandle<()>>,
}

impl MeasureSaver {
    /// Creates the output file, writes the header and starts the writer.
    ///
    /// Failure to create the file is reported synchronously; nothing is
    /// spawned in that case.
    pub fn start(path: &Path, scale: f64) -> AppResult<Self> {
        let file = File::create(path).map_err(|e| ProfilerError::MeasureFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut csv = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(file);
        csv.write_record([
            "Index",
            "Timestamp",
            "Center X",
            "Center Y",
            "Width X",
            "Width Y",
            "Azimuth",
            "Ellipticity",
        ])
        .map_err(|e| ProfilerError::MeasureFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let (tx, rx) = crossbeam_channel::unbounded();
        let (recycle_tx, recycle_rx) = crossbeam_channel::unbounded();
        let session_start = Local::now();

        let writer_recycle = recycle_tx.clone();
        let writer_path = path.to_path_buf();
        let handle = std::thread::Builder::new()
            .name("measure-writer".into())
            .spawn(move || writer_loop(csv, rx, writer_recycle, scale, &writer_path))
            .map_err(|e| ProfilerError::MeasureFile {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        log::info!("measurement started, writing to '{}'", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            tx,
            recycle_tx,
            recycle_rx,
            session_start,
            handle: Some(handle),
        })
    }

    /// Output file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Builds the worker-side sink attached to this session.
    ///
    /// The two batch buffers are allocated here, before capture touches
    /// the sink: one starts active, the other waits in the recycle lane.
    pub fn sink(&self) -> MeasureSink {
        let _ = self.recycle_tx.send(Vec::with_capacity(BATCH_SIZE));
        MeasureSink {
            active: Vec::with_capacity(BATCH_SIZE),
            batch_number: 0,
            record_index: 0,
            session_start: self.session_start,
            started: Instant::now(),
            tx: self.tx.clone(),
            recycle_rx: self.recycle_rx.clone(),
        }
    }

    /// Waits for the writer to drain and closes the file.
    pub fn finish(mut self) {
        let _ = self.tx.send(WriterMsg::Finish);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("measure writer thread panicked");
            }
        }
        log::info!("measurement stopped, '{}' closed", self.path.display());
    }
}

impl Drop for MeasureSaver {
    fn drop(&mut self) {
        let _ = self.tx.send(WriterMsg::Finish);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn writer_loop(
    mut csv: csv::Writer<File>,
    rx: Receiver<WriterMsg>,
    recycle: Sender<Vec<MeasureRecord>>,
    scale: f64,
    path: &Path,
) {
    for msg in rx.iter() {
        match msg {
            WriterMsg::Batch(batch) => {
                log::debug!("writing batch {} ({} records)", batch.number, batch.count);
                if let Err(e) = write_batch(&mut csv, &batch, scale) {
                    // A failed batch is logged and skipped; capture goes on
                    log::error!("failed to write batch {} to '{}': {e}", batch.number, path.display());
                }
                let _ = recycle.send(batch.records);
            }
            WriterMsg::Finish => break,
        }
    }
    if let Err(e) = csv.flush() {
        log::error!("failed to flush '{}': {e}", path.display());
    }
}

fn write_batch(
    csv: &mut csv::Writer<File>,
    batch: &MeasureBatch,
    scale: f64,
) -> Result<(), csv::Error> {
    for r in &batch.records {
        let timestamp = format_timestamp(batch.session_start, r.time_ms);
        if r.nan {
            csv.write_record([
                r.index.to_string(),
                timestamp,
                "0".into(),
                "0".into(),
                "0".into(),
                "0".into(),
                "0".into(),
                "0".into(),
            ])?;
        } else {
            let eps = r.dx.min(r.dy) / r.dx.max(r.dy);
            csv.write_record([
                r.index.to_string(),
                timestamp,
                ((r.xc * scale) as i64).to_string(),
                ((r.yc * scale) as i64).to_string(),
                ((r.dx * scale) as i64).to_string(),
                ((r.dy * scale) as i64).to_string(),
                format!("{:.1}", r.phi),
                format!("{eps:.3}"),
            ])?;
        }
    }
    csv.flush()?;
    Ok(())
}

/// ISO-8601 local time with milliseconds, offset from the session start.
fn format_timestamp(start: DateTime<Local>, offset_ms: i64) -> String {
    (start + ChronoDuration::milliseconds(offset_ms))
        .format("%Y-%m-%dT%H:%M:%S%.3f")
        .to_string()
}
