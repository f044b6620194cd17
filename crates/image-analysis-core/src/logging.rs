use log::{error, info, warn, LevelFilter};
use std::path::Path;

use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::filter::threshold::ThresholdFilter;

use crate::catalog::TaskKey;
use crate::error::{Error, Result};
use crate::fingerprint::ImageIdentity;

/// Environment variable overriding the configured log level
pub const LOG_ENV_VAR: &str = "IMAGE_ANALYSIS_LOG";

const LOG_FILE_STEM: &str = "image-analysis";
const ROTATE_BYTES: u64 = 10 * 1024 * 1024;
const ARCHIVED_LOGS: u32 = 5;

/// Rotating file log under `log_dir`.
///
/// Everything at `default_level` (or the level in [`LOG_ENV_VAR`]) goes to
/// the file. With `mirror_errors`, error records are also printed to stderr;
/// nothing else reaches the terminal so progress bars stay intact.
pub fn init_logger(log_dir: &Path, default_level: LevelFilter, mirror_errors: bool) -> Result<()> {
    std::fs::create_dir_all(log_dir)?;

    let log_file_path = log_dir.join(format!("{}.log", LOG_FILE_STEM));
    let archived_logs_pattern = log_dir.join(format!("{}.{{}}.log", LOG_FILE_STEM));

    let roller = FixedWindowRoller::builder()
        .build(&archived_logs_pattern.to_string_lossy(), ARCHIVED_LOGS)
        .map_err(|e| log_setup_error("log roller", e))?;
    let policy = CompoundPolicy::new(
        Box::new(SizeTrigger::new(ROTATE_BYTES)),
        Box::new(roller),
    );

    let rolling_file = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S)} [{l}] [{M}:{L}] - {m}{n}",
        )))
        .build(&log_file_path, Box::new(policy))
        .map_err(|e| log_setup_error("log appender", e))?;

    let mut builder =
        Config::builder().appender(Appender::builder().build("file", Box::new(rolling_file)));
    let mut root = Root::builder().appender("file");

    if mirror_errors {
        let stderr = ConsoleAppender::builder()
            .target(Target::Stderr)
            .encoder(Box::new(PatternEncoder::new("{l}: {m}{n}")))
            .build();
        builder = builder.appender(
            Appender::builder()
                .filter(Box::new(ThresholdFilter::new(LevelFilter::Error)))
                .build("stderr", Box::new(stderr)),
        );
        root = root.appender("stderr");
    }

    let level = level_from_env().unwrap_or(default_level);
    let config = builder
        .build(root.build(level))
        .map_err(|e| log_setup_error("log config", e))?;

    log4rs::init_config(config).map_err(|e| log_setup_error("logger", e))?;

    info!("Image analysis started");
    info!("Logging to file: {}", log_file_path.display());
    Ok(())
}

fn log_setup_error(what: &str, err: impl std::fmt::Display) -> Error {
    Error::Configuration(format!("Failed to create {}: {}", what, err))
}

/// Level requested through [`LOG_ENV_VAR`], if it parses
pub fn level_from_env() -> Option<LevelFilter> {
    std::env::var(LOG_ENV_VAR)
        .ok()
        .and_then(|v| v.parse::<LevelFilter>().ok())
}

/// Log file operation that failed
pub fn log_file_error(path: &Path, operation: &str, error: &dyn std::error::Error) {
    error!(
        "File operation failed - Operation: {}, Path: {}, Error: {}",
        operation,
        path.display(),
        error
    );
}

/// Log a task that ended in error after its final attempt
pub fn log_task_failure(key: &TaskKey, attempts: u32, error: &dyn std::error::Error) {
    warn!(
        "Task failed - Task: {}, Attempts: {}, Error: {}",
        key, attempts, error
    );
}

/// Log a record write
pub fn log_record_change(identity: &ImageIdentity, path: &Path, details: &str) {
    info!(
        "Record updated - Identity: {}, Path: {}, Details: {}",
        identity.short(),
        path.display(),
        details
    );
}
