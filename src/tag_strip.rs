use std::borrow::Cow;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::LazyLock;

use log::{debug, info, warn};
use regex::Regex;

use crate::config::StripMode;
use crate::error::Result;

/// Anything between a `<` and the next `>`. File passes apply it one line at a time.
pub const TAG_PATTERN: &str = "<[^>]*>";

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(TAG_PATTERN).expect("valid regex"));

/// Removes angle-bracket tags from one short field value.
pub fn strip_markup(value: &str) -> Cow<'_, str> {
    TAG_RE.replace_all(value, "")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StripOutcome {
    Stripped,
    /// The bulk transform failed; the destination holds the untouched source.
    CopiedThrough { reason: String },
}

impl StripOutcome {
    pub fn is_stripped(&self) -> bool {
        matches!(self, StripOutcome::Stripped)
    }
}

/// Whole-file markup removal, run once over the accumulated message stream.
#[derive(Debug, Clone)]
pub struct TagStripper {
    mode: StripMode,
    sed_program: String,
    sed_args: Vec<String>,
}

impl TagStripper {
    pub fn new(mode: StripMode) -> Self {
        Self { mode, sed_program: "sed".to_string(), sed_args: Vec::new() }
    }

    /// Use a different executable for the `sed` backend.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.sed_program = program.into();
        self
    }

    /// Like [`TagStripper::with_program`], with arguments placed before the sed expression.
    pub fn with_command<S: Into<String>>(
        mut self,
        program: impl Into<String>,
        args: impl IntoIterator<Item = S>,
    ) -> Self {
        self.sed_program = program.into();
        self.sed_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Writes `src` minus all tags to `dest` and deletes `src`. If the transform fails, `src`
    /// is moved to `dest` unchanged and the failure is returned as [`StripOutcome::CopiedThrough`].
    /// Only a failure of that move is an error.
    pub fn strip_file(&self, src: &Path, dest: &Path) -> Result<StripOutcome> {
        debug!("Stripping markup from {} into {} ({:?})", src.display(), dest.display(), self.mode);
        let attempt = match self.mode {
            StripMode::Sed => self.run_sed(src, dest),
            StripMode::Builtin => strip_lines(src, dest).map_err(|e| e.to_string()),
        };

        match attempt {
            Ok(()) => {
                fs::remove_file(src)?;
                info!("Removed markup tags from {}", dest.display());
                Ok(StripOutcome::Stripped)
            }
            Err(reason) => {
                warn!("Could not remove markup tags from messages file: {}; keeping text as is", reason);
                move_file(src, dest)?;
                Ok(StripOutcome::CopiedThrough { reason })
            }
        }
    }

    fn run_sed(&self, src: &Path, dest: &Path) -> std::result::Result<(), String> {
        let out = File::create(dest).map_err(|e| format!("cannot create {}: {}", dest.display(), e))?;
        let mut command = Command::new(&self.sed_program);
        command
            .args(&self.sed_args)
            .arg("-e")
            .arg(format!("s/{}//g", TAG_PATTERN))
            .arg(src)
            .stdin(Stdio::null())
            .stdout(Stdio::from(out))
            .stderr(Stdio::piped());
        // Own process group: a terminal Ctrl-C must not kill the transform mid-file.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let output = command
            .output()
            .map_err(|e| format!("failed to run '{}': {}", self.sed_program, e))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(format!(
                "'{}' exited with {}: {}",
                self.sed_program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }
}

fn strip_lines(src: &Path, dest: &Path) -> std::io::Result<()> {
    let mut reader = BufReader::new(File::open(src)?);
    let mut writer = BufWriter::new(File::create(dest)?);
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        writer.write_all(strip_markup(&line).as_bytes())?;
    }
    writer.flush()
}

fn move_file(src: &Path, dest: &Path) -> std::io::Result<()> {
    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    // rename fails across filesystems
    fs::copy(src, dest)?;
    fs::remove_file(src)
}
