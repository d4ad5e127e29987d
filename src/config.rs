use std::fs::File;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::Deserialize;

use crate::error::{CleanerError, Result};

/// Rows between two "Processed N rows" reports.
pub const REPORT_EVERY: u64 = 10_000;

pub const METADATA_SUFFIX: &str = "_metadata.csv";
pub const TEXT_SUFFIX: &str = "_text.csv";
pub const ENTITIES_SUFFIX: &str = "_entities.csv";
pub const TARGETS_SUFFIX: &str = "_targets.csv";
pub const PURE_TEXT_SUFFIX: &str = "_pure_text.csv";

/// Backend used for the one-shot markup removal over the accumulated text stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StripMode {
    /// Pipe the file through `sed`.
    #[default]
    Sed,
    /// Regex pass inside this process.
    Builtin,
}

/// Explicit artifact paths; anything left `None` is derived from the input path.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OutputOverrides {
    pub metadata_out: Option<PathBuf>,
    pub text_out: Option<PathBuf>,
    pub entities_out: Option<PathBuf>,
    pub targets_out: Option<PathBuf>,
    pub pure_text_out: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub metadata: PathBuf,
    pub text: PathBuf,
    pub entities: PathBuf,
    pub targets: PathBuf,
    pub pure_text: PathBuf,
}

impl OutputPaths {
    /// `dir/export.csv(.gz)` becomes `dir/export_metadata.csv`, `dir/export_text.csv`, ...
    pub fn derive_from(input: &Path) -> Result<Self> {
        let file_name = input
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CleanerError::Config(format!("cannot derive output names from {}", input.display())))?;
        let file_name = file_name.strip_suffix(".gz").unwrap_or(file_name);
        let stem = Path::new(file_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(file_name);
        let dir = input.parent().unwrap_or_else(|| Path::new(""));
        let with_suffix = |suffix: &str| dir.join(format!("{}{}", stem, suffix));

        Ok(Self {
            metadata: with_suffix(METADATA_SUFFIX),
            text: with_suffix(TEXT_SUFFIX),
            entities: with_suffix(ENTITIES_SUFFIX),
            targets: with_suffix(TARGETS_SUFFIX),
            pure_text: with_suffix(PURE_TEXT_SUFFIX),
        })
    }

    pub fn resolve(input: &Path, overrides: &OutputOverrides) -> Result<Self> {
        let derived = Self::derive_from(input)?;
        Ok(Self {
            metadata: overrides.metadata_out.clone().unwrap_or(derived.metadata),
            text: overrides.text_out.clone().unwrap_or(derived.text),
            entities: overrides.entities_out.clone().unwrap_or(derived.entities),
            targets: overrides.targets_out.clone().unwrap_or(derived.targets),
            pure_text: overrides.pure_text_out.clone().unwrap_or(derived.pure_text),
        })
    }

    /// Where raw message rows accumulate before the bulk strip.
    pub fn intermediate_text(&self) -> PathBuf {
        let mut raw = self.text.clone().into_os_string();
        raw.push(".raw");
        PathBuf::from(raw)
    }
}

/// Everything one pipeline run needs.
#[derive(Debug, Clone)]
pub struct CleanerConfig {
    pub input: PathBuf,
    pub outputs: OutputPaths,
    pub num_rows: Option<u64>,
    pub strip_mode: StripMode,
    pub report_every: u64,
    pub show_progress: bool,
}

impl CleanerConfig {
    pub fn new(input: impl Into<PathBuf>) -> Result<Self> {
        let input = input.into();
        let outputs = OutputPaths::derive_from(&input)?;
        Ok(Self {
            input,
            outputs,
            num_rows: None,
            strip_mode: StripMode::default(),
            report_every: REPORT_EVERY,
            show_progress: true,
        })
    }

    pub fn with_overrides(input: impl Into<PathBuf>, overrides: &OutputOverrides) -> Result<Self> {
        let mut config = Self::new(input)?;
        config.outputs = OutputPaths::resolve(&config.input, overrides)?;
        Ok(config)
    }
}

/// Several exports cleaned in one invocation, loaded from YAML.
#[derive(Deserialize, Debug, Clone)]
pub struct RunConfig {
    pub description: Option<String>,
    pub tasks: Vec<TaskConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct TaskConfig {
    pub description: Option<String>,
    pub input: PathBuf,
    #[serde(flatten)]
    pub outputs: OutputOverrides,
    pub num_rows: Option<u64>,
}

impl RunConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let run_config: RunConfig = serde_yaml::from_reader(file)?;
        if run_config.tasks.is_empty() {
            return Err(CleanerError::Config(format!("{} lists no tasks", path.display())));
        }
        Ok(run_config)
    }
}

impl TaskConfig {
    /// Paths and row cap for this task; the remaining settings keep their defaults.
    pub fn to_cleaner_config(&self) -> Result<CleanerConfig> {
        let mut config = CleanerConfig::with_overrides(&self.input, &self.outputs)?;
        config.num_rows = self.num_rows;
        Ok(config)
    }
}
