use std::fs::{self, File};
use std::path::{Path, PathBuf};

use csv::{Terminator, Writer, WriterBuilder};
use log::{debug, error, info};

use crate::config::OutputPaths;
use crate::decompose::{DecomposedRow, ENTITY_HEADER, TARGET_HEADER, TEXT_HEADER};
use crate::error::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowsWritten {
    pub metadata: u64,
    pub text: u64,
    pub entities: u64,
    pub targets: u64,
}

/// Builds a sink and writes its header before anything else can reach it.
pub fn create_csv_writer<S: AsRef<str>>(path: &Path, header: &[S]) -> Result<Writer<File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut writer = WriterBuilder::new()
        .terminator(Terminator::Any(b'\n'))
        .from_path(path)?;
    writer.write_record(header.iter().map(AsRef::<str>::as_ref))?;
    writer.flush()?;
    Ok(writer)
}

/// The four per-row sinks of one run. Message text goes to the intermediate path; the
/// final text artifact only appears after the bulk strip.
pub struct StreamWriters {
    metadata: Writer<File>,
    text: Writer<File>,
    entities: Writer<File>,
    targets: Writer<File>,
    text_path: PathBuf,
    rows_written: RowsWritten,
    closed: bool,
}

impl StreamWriters {
    pub fn create(outputs: &OutputPaths, metadata_header: &[String]) -> Result<Self> {
        let text_path = outputs.intermediate_text();
        let writers = Self {
            metadata: create_csv_writer(&outputs.metadata, metadata_header)?,
            text: create_csv_writer(&text_path, &TEXT_HEADER)?,
            entities: create_csv_writer(&outputs.entities, &ENTITY_HEADER)?,
            targets: create_csv_writer(&outputs.targets, &TARGET_HEADER)?,
            text_path,
            rows_written: RowsWritten::default(),
            closed: false,
        };
        debug!(
            "Opened sinks: {}, {}, {}, {}",
            outputs.metadata.display(),
            writers.text_path.display(),
            outputs.entities.display(),
            outputs.targets.display()
        );
        Ok(writers)
    }

    pub fn intermediate_text_path(&self) -> &Path {
        &self.text_path
    }

    pub fn write_row(&mut self, row: &DecomposedRow) -> Result<()> {
        self.metadata.write_record(&row.metadata.fields)?;
        self.rows_written.metadata += 1;

        self.text.write_record([&row.text.id, &row.text.message])?;
        self.rows_written.text += 1;

        for e in &row.entities {
            self.entities.write_record([&e.id, &e.entity, &e.entity_type])?;
        }
        self.rows_written.entities += row.entities.len() as u64;

        for t in &row.targets {
            self.targets.write_record([&t.id, &t.target, &t.segment])?;
        }
        self.rows_written.targets += row.targets.len() as u64;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.metadata.flush()?;
        self.text.flush()?;
        self.entities.flush()?;
        self.targets.flush()?;
        Ok(())
    }

    pub fn rows_written(&self) -> RowsWritten {
        self.rows_written
    }

    /// Flushes every sink and releases the file handles.
    pub fn close(mut self) -> Result<RowsWritten> {
        self.flush()?;
        self.closed = true;
        info!(
            "Closed sinks after {} rows ({} entity rows, {} target rows)",
            self.rows_written.metadata, self.rows_written.entities, self.rows_written.targets
        );
        Ok(self.rows_written)
    }
}

impl Drop for StreamWriters {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.flush() {
            error!("Error flushing CSV writers during cleanup: {}", e);
        }
    }
}
