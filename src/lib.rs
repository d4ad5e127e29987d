//! Splits a wide ad export (one row per advertisement, with JSON-encoded entity and targeting
//! lists and HTML message bodies) into metadata, message text, entity and target tables that
//! share the row `id`, plus an id-free text corpus.

/// Run settings, output naming and YAML run files.
pub mod config;
/// Row to four-record decomposition.
pub mod decompose;
pub mod error;
/// Row loop, interruption handling and finalization.
pub mod pipeline;
/// Markup removal, inline and over whole files.
pub mod tag_strip;
/// The four CSV sinks.
pub mod writers;

pub use config::{CleanerConfig, OutputOverrides, OutputPaths, RunConfig, StripMode, TaskConfig};
pub use decompose::{DecodedList, DecomposedRow, EntityRecord, RecordDecomposer, TargetRecord, TextRecord};
pub use error::{CleanerError, Result};
pub use pipeline::{Interrupt, InterruptFlag, NoInterrupt, PipelineDriver, PipelineState, RunSummary};
pub use tag_strip::{StripOutcome, TagStripper};
pub use writers::{RowsWritten, StreamWriters};
