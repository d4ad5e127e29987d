use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use simple_logger::SimpleLogger;
use time::macros::format_description;

use ad_export_cleaner::config::REPORT_EVERY;
use ad_export_cleaner::pipeline::format_elapsed;
use ad_export_cleaner::{
    CleanerConfig, CleanerError, InterruptFlag, OutputOverrides, PipelineDriver, RunConfig, RunSummary, StripMode,
};

const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser, Clone)]
#[command(name = "Ad Export Cleaner")]
#[command(about = "Splits an ad export CSV into metadata, text, entity and target tables and strips HTML from the message texts.")]
#[command(version)]
struct Cli {
    #[arg(help = "Exported ad .csv file (may be gzip-compressed)", required_unless_present = "run_config", conflicts_with = "run_config")]
    input: Option<PathBuf>,
    #[arg(long, help = "YAML file listing several exports to clean")]
    run_config: Option<PathBuf>,
    #[arg(long, help = "Destination of each row's message text; default: <input>_text.csv")]
    text_out: Option<PathBuf>,
    #[arg(long, help = "Destination of each row's metadata; default: <input>_metadata.csv")]
    metadata_out: Option<PathBuf>,
    #[arg(long, help = "Destination of each row's entities; default: <input>_entities.csv")]
    entities_out: Option<PathBuf>,
    #[arg(long, help = "Destination of each row's targets; default: <input>_targets.csv")]
    targets_out: Option<PathBuf>,
    #[arg(long, help = "Destination of the id-free message texts; default: <input>_pure_text.csv")]
    pure_text_out: Option<PathBuf>,
    #[arg(short = 'n', long, help = "Maximum number of rows to process; default: all")]
    num_rows: Option<u64>,
    #[arg(long, value_enum, default_value_t = StripMode::Sed, help = "How HTML tags are removed from the message file")]
    tag_stripper: StripMode,
    #[arg(long, default_value_t = REPORT_EVERY, help = "Report progress every N rows")]
    report_every: u64,
    #[arg(long, help = "Do not draw a progress bar")]
    no_progress: bool,
    #[arg(short, long, default_value = "INFO", help = "Logging level (DEBUG, INFO, WARN, ERROR)")]
    log_level: String,
}

impl Cli {
    fn overrides(&self) -> OutputOverrides {
        OutputOverrides {
            metadata_out: self.metadata_out.clone(),
            text_out: self.text_out.clone(),
            entities_out: self.entities_out.clone(),
            targets_out: self.targets_out.clone(),
            pure_text_out: self.pure_text_out.clone(),
        }
    }

    fn apply_shared(&self, config: &mut CleanerConfig) {
        config.num_rows = self.num_rows;
        config.strip_mode = self.tag_stripper;
        config.report_every = self.report_every;
        config.show_progress = !self.no_progress;
    }

    /// One config per export, in run order.
    fn cleaner_configs(&self) -> Result<Vec<(String, CleanerConfig)>> {
        if let Some(run_config_path) = &self.run_config {
            info!("Loading run configuration from: {}", run_config_path.display());
            let run_config = RunConfig::from_path(run_config_path)
                .with_context(|| format!("Failed to load run configuration from {}", run_config_path.display()))?;
            if let Some(description) = &run_config.description {
                info!("Run: {}", description);
            }
            return run_config
                .tasks
                .iter()
                .enumerate()
                .map(|(i, task)| {
                    let label = format!("Task {} ({})", i + 1, task.description.as_deref().unwrap_or("No description"));
                    let mut config = task
                        .to_cleaner_config()
                        .with_context(|| format!("Task {}: invalid configuration", i + 1))?;
                    self.apply_shared(&mut config);
                    config.num_rows = task.num_rows.or(self.num_rows);
                    Ok::<_, anyhow::Error>((label, config))
                })
                .collect();
        }

        let input = self.input.clone().context("No input file given")?;
        let mut config = CleanerConfig::with_overrides(input, &self.overrides())?;
        self.apply_shared(&mut config);
        Ok(vec![(config.input.display().to_string(), config)])
    }
}

fn log_summary(label: &str, summary: &RunSummary) {
    info!("-------------------- {} --------------------", label);
    info!("Started at: {}", summary.started_at.to_rfc3339_opts(SecondsFormat::Secs, true));
    info!("Finished in state {:?} after {}", summary.state, format_elapsed(summary.elapsed));
    info!("Rows consumed: {}", summary.rows_consumed);
    info!("  - metadata rows: {}", summary.rows_written.metadata);
    info!("  - text rows: {}", summary.rows_written.text);
    info!("  - entity rows: {}", summary.rows_written.entities);
    info!("  - target rows: {}", summary.rows_written.targets);
    if summary.stats.malformed_entities > 0 || summary.stats.malformed_targets > 0 {
        warn!(
            "Rows with unreadable JSON: {} entities, {} targets",
            summary.stats.malformed_entities, summary.stats.malformed_targets
        );
    }
    if !summary.strip.is_stripped() {
        warn!("Message text was kept with its HTML tags: {:?}", summary.strip);
    }
    match summary.pure_text_lines {
        Some(lines) => info!("Pure text lines: {}", lines),
        None => info!("Pure text skipped"),
    }
}

fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_uppercase().as_str() {
        "DEBUG" => LevelFilter::Debug,
        "INFO" => LevelFilter::Info,
        "WARN" | "WARNING" => LevelFilter::Warn,
        "ERROR" => LevelFilter::Error,
        _ => {
            eprintln!("Invalid log level '{}', defaulting to INFO.", cli.log_level);
            LevelFilter::Info
        }
    };
    SimpleLogger::new()
        .with_level(log_level)
        .with_timestamp_format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .init()?;

    info!("Starting Ad Export Cleaner");
    info!("Run Timestamp: {}", Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));

    let interrupt = InterruptFlag::new();
    let handler_flag = interrupt.clone();
    ctrlc::set_handler(move || {
        eprintln!("Finishing up in response to Ctrl+C.");
        handler_flag.trigger();
    })
    .context("Failed to install Ctrl+C handler")?;

    let configs = cli.cleaner_configs()?;
    let mut interrupted = false;
    let mut failures = 0;

    for (label, config) in configs {
        info!("Processing {}", label);
        let mut driver = PipelineDriver::new(config);
        match driver.run(&interrupt) {
            Ok(summary) => {
                log_summary(&label, &summary);
                if summary.aborted() {
                    interrupted = true;
                    break;
                }
            }
            Err(CleanerError::InputNotFound(path)) => {
                error!("CSV file {} not found; quitting", path.display());
                failures += 1;
            }
            Err(e) => {
                error!("{} failed: {}", label, e);
                failures += 1;
            }
        }
    }

    info!("Total execution time: {}", format_elapsed(start_time.elapsed()));
    // the flag can be raised after a run's last poll, e.g. while the pure text is written
    if interrupted || interrupt.is_triggered() {
        warn!("Run interrupted; remaining exports were skipped.");
        std::process::exit(EXIT_INTERRUPTED);
    }
    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}
