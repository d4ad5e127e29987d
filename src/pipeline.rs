use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use csv::{ByteRecord, Reader, ReaderBuilder, StringRecord, Terminator, WriterBuilder};
use flate2::read::GzDecoder;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};

use crate::config::CleanerConfig;
use crate::decompose::{ColumnLayout, DecomposeStats, RecordDecomposer, MESSAGE};
use crate::error::{CleanerError, Result};
use crate::tag_strip::{StripOutcome, TagStripper};
use crate::writers::{RowsWritten, StreamWriters};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Aborted,
    Finalizing,
    Done,
    AbortedDone,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::AbortedDone)
    }
}

/// Polled by the driver before each input row is read.
pub trait Interrupt {
    fn requested(&self, rows_consumed: u64) -> bool;
}

/// Set from a signal handler, read by the row loop.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Interrupt for InterruptFlag {
    fn requested(&self, _rows_consumed: u64) -> bool {
        self.is_triggered()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoInterrupt;

impl Interrupt for NoInterrupt {
    fn requested(&self, _rows_consumed: u64) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub state: PipelineState,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub rows_consumed: u64,
    pub rows_written: RowsWritten,
    pub stats: DecomposeStats,
    pub strip: StripOutcome,
    /// `None` when the run was interrupted and the pure-text artifact was skipped.
    pub pure_text_lines: Option<u64>,
}

impl RunSummary {
    pub fn aborted(&self) -> bool {
        self.state == PipelineState::AbortedDone
    }
}

/// Everything the run holds open. Owned by the driver and handed to whichever
/// finalization path ends the run.
struct RunContext {
    writers: StreamWriters,
    decomposer: RecordDecomposer,
    progress: ProgressBar,
    rows_consumed: u64,
}

pub struct PipelineDriver {
    config: CleanerConfig,
    stripper: TagStripper,
    state: PipelineState,
}

impl PipelineDriver {
    pub fn new(config: CleanerConfig) -> Self {
        let stripper = TagStripper::new(config.strip_mode);
        Self { config, stripper, state: PipelineState::Idle }
    }

    pub fn with_stripper(mut self, stripper: TagStripper) -> Self {
        self.stripper = stripper;
        self
    }

    pub fn config(&self) -> &CleanerConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    fn transition(&mut self, next: PipelineState) {
        debug!("Pipeline {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    pub fn run<I: Interrupt + ?Sized>(&mut self, interrupt: &I) -> Result<RunSummary> {
        let started_at = Utc::now();
        let start = Instant::now();
        let input = self.config.input.clone();

        if !input.exists() {
            return Err(CleanerError::InputNotFound(input));
        }
        let mut reader = open_input(&input)?;
        let layout = ColumnLayout::from_headers(reader.headers()?, &input)?;
        let decomposer = RecordDecomposer::new(layout);
        let writers = StreamWriters::create(&self.config.outputs, decomposer.layout().metadata_header())?;
        info!("Cleaning {} ({} metadata columns)", input.display(), decomposer.layout().metadata_header().len());

        let mut ctx = RunContext {
            writers,
            decomposer,
            progress: self.progress_bar()?,
            rows_consumed: 0,
        };

        self.transition(PipelineState::Running);
        let interrupted = match self.consume(&mut reader, &mut ctx, interrupt) {
            Ok(interrupted) => interrupted,
            Err(e) => {
                error!("Stopping after {} rows: {}", ctx.rows_consumed, e);
                self.salvage(ctx);
                return Err(e);
            }
        };

        if interrupted {
            self.transition(PipelineState::Aborted);
            warn!("Exiting in response to interrupt after {} rows", ctx.rows_consumed);
            ctx.progress.abandon_with_message("interrupted");
        } else {
            ctx.progress.finish_with_message("done");
        }

        self.transition(PipelineState::Finalizing);
        let stats = ctx.decomposer.stats();
        let rows_consumed = ctx.rows_consumed;
        let intermediate = ctx.writers.intermediate_text_path().to_path_buf();
        let rows_written = ctx.writers.close()?;
        let strip = self.stripper.strip_file(&intermediate, &self.config.outputs.text)?;

        // Ctrl-C during the strip of a completed run still ends it as aborted.
        let interrupted = interrupted || {
            let late = interrupt.requested(rows_consumed);
            if late {
                warn!("Interrupted while finalizing; skipping pure text");
            }
            late
        };
        let pure_text_lines = if interrupted {
            None
        } else {
            let lines = derive_pure_text(&self.config.outputs.text, &self.config.outputs.pure_text)?;
            info!("Wrote {} lines of pure text to {}", lines, self.config.outputs.pure_text.display());
            Some(lines)
        };

        self.transition(if interrupted { PipelineState::AbortedDone } else { PipelineState::Done });
        Ok(RunSummary {
            state: self.state,
            started_at,
            elapsed: start.elapsed(),
            rows_consumed,
            rows_written,
            stats,
            strip,
            pure_text_lines,
        })
    }

    /// Returns `true` when the loop stopped because of an interrupt.
    fn consume<R: Read, I: Interrupt + ?Sized>(
        &self,
        reader: &mut Reader<R>,
        ctx: &mut RunContext,
        interrupt: &I,
    ) -> Result<bool> {
        let report_every = self.config.report_every.max(1);
        let mut record = ByteRecord::new();
        loop {
            if self.config.num_rows.is_some_and(|cap| ctx.rows_consumed >= cap) {
                debug!("Row cap of {} reached", ctx.rows_consumed);
                return Ok(false);
            }
            if interrupt.requested(ctx.rows_consumed) {
                return Ok(true);
            }
            if !reader.read_byte_record(&mut record)? {
                return Ok(false);
            }

            let row = ctx.decomposer.decompose(&record);
            ctx.writers.write_row(&row)?;
            ctx.rows_consumed += 1;
            ctx.progress.inc(1);
            if ctx.rows_consumed % report_every == 0 {
                info!("Processed {} rows", ctx.rows_consumed);
            }
        }
    }

    /// Error path: release the sinks and still leave a finalized text file behind.
    fn salvage(&mut self, ctx: RunContext) {
        self.transition(PipelineState::Finalizing);
        ctx.progress.abandon_with_message("failed");
        let intermediate = ctx.writers.intermediate_text_path().to_path_buf();
        if let Err(e) = ctx.writers.close() {
            error!("Error closing output files: {}", e);
        }
        if let Err(e) = self.stripper.strip_file(&intermediate, &self.config.outputs.text) {
            error!("Could not finalize {}: {}", intermediate.display(), e);
        }
    }

    fn progress_bar(&self) -> Result<ProgressBar> {
        if !self.config.show_progress {
            return Ok(ProgressBar::hidden());
        }
        let (bar, template) = match self.config.num_rows {
            Some(cap) => (
                ProgressBar::new(cap),
                "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} rows ({eta} @ {per_sec}) {msg}",
            ),
            None => (ProgressBar::new_spinner(), "[{elapsed_precise}] {spinner} {pos} rows ({per_sec}) {msg}"),
        };
        let style = ProgressStyle::with_template(template)
            .map_err(|e| CleanerError::Config(format!("progress template: {}", e)))?
            .progress_chars("=> ");
        bar.set_style(style);
        Ok(bar)
    }
}

fn open_input(path: &Path) -> Result<Reader<Box<dyn Read>>> {
    let file = File::open(path)?;
    let source: Box<dyn Read> = if path.extension().is_some_and(|ext| ext == "gz") {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(file)
    };
    Ok(ReaderBuilder::new().has_headers(true).from_reader(source))
}

/// Copies the `message` column of the finalized text file, one record per line, no header.
pub fn derive_pure_text(text_path: &Path, pure_text_path: &Path) -> Result<u64> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(text_path)?;
    let message_idx = reader
        .headers()?
        .iter()
        .position(|h| h == MESSAGE)
        .ok_or_else(|| CleanerError::MissingColumn { column: MESSAGE.to_string(), path: text_path.to_path_buf() })?;

    if let Some(parent) = pure_text_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .terminator(Terminator::Any(b'\n'))
        .from_path(pure_text_path)?;

    let mut lines = 0;
    let mut record = StringRecord::new();
    while reader.read_record(&mut record)? {
        writer.write_record([record.get(message_idx).unwrap_or("")])?;
        lines += 1;
    }
    writer.flush()?;
    Ok(lines)
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}.{:03}s", seconds, elapsed.subsec_millis())
    }
}
