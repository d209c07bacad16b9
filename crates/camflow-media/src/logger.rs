// crates/camflow-media/src/logger.rs
//
// Process-wide log sink behind the `log` facade. Lines are formatted as
//
//   YYYY-MM-DD HH:MM:SS.uuuuuu [LEVEL ] message
//
// and written to the console (Error/Warning to stderr, the rest to stdout)
// and, optionally, to an on-disk file that rotates to a timestamped backup
// once it reaches the configured size.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Local};
use log::{Level, LevelFilter, Log, Metadata, Record};
use thiserror::Error;

use camflow_core::config::LogConfig;

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("unknown log level {0:?}")]
    UnknownLevel(String),
    #[error("failed to open log file: {0}")]
    Io(#[from] std::io::Error),
    #[error("a logger is already installed")]
    AlreadyInstalled(#[from] log::SetLoggerError),
}

/// Install the pipeline logger for the whole process. Call once, before the
/// first `Pipeline` is created.
pub fn init(config: &LogConfig) -> Result<(), LoggerError> {
    let level = parse_level(&config.level)
        .ok_or_else(|| LoggerError::UnknownLevel(config.level.clone()))?;

    let sink = match &config.file {
        Some(path) => Some(FileSink::open(path.clone(), config.max_file_size_mb)?),
        None => None,
    };

    log::set_boxed_logger(Box::new(PipelineLogger {
        level,
        sink: Mutex::new(sink),
    }))?;
    log::set_max_level(level);
    log::info!("logger initialized at level {level}");
    Ok(())
}

fn parse_level(name: &str) -> Option<LevelFilter> {
    match name.to_ascii_lowercase().as_str() {
        "error" => Some(LevelFilter::Error),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" => Some(LevelFilter::Debug),
        "trace" => Some(LevelFilter::Trace),
        _ => None,
    }
}

fn format_line(level: Level, message: &str, now: DateTime<Local>) -> String {
    format!(
        "{} [{:<6}] {}\n",
        now.format("%Y-%m-%d %H:%M:%S%.6f"),
        level,
        message
    )
}

fn backup_path(path: &Path, now: DateTime<Local>) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}", now.format("%Y%m%d_%H%M%S")));
    PathBuf::from(name)
}

fn should_rotate(written: u64, max_mb: u64) -> bool {
    max_mb > 0 && written >= max_mb * 1024 * 1024
}

// ── File sink ─────────────────────────────────────────────────────────────────

struct FileSink {
    file:    File,
    path:    PathBuf,
    max_mb:  u64,
    written: u64,
}

impl FileSink {
    fn open(path: PathBuf, max_mb: u64) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self { file, path, max_mb, written })
    }

    fn write_line(&mut self, line: &str) {
        if self.file.write_all(line.as_bytes()).is_ok() {
            self.written += line.len() as u64;
        }
        if should_rotate(self.written, self.max_mb) {
            self.rotate();
        }
    }

    fn rotate(&mut self) {
        let backup = backup_path(&self.path, Local::now());
        let _ = self.file.flush();
        if let Err(e) = std::fs::rename(&self.path, &backup) {
            eprintln!("log rotation failed: {e}");
        }
        // Reopen regardless: if the rename failed we keep appending to the
        // original file rather than losing output.
        match OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(file) => {
                self.written = file.metadata().map(|m| m.len()).unwrap_or(0);
                self.file = file;
            }
            Err(e) => eprintln!("log reopen after rotation failed: {e}"),
        }
    }
}

// ── Logger ────────────────────────────────────────────────────────────────────

struct PipelineLogger {
    level: LevelFilter,
    sink:  Mutex<Option<FileSink>>,
}

impl Log for PipelineLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_line(record.level(), &record.args().to_string(), Local::now());

        match record.level() {
            Level::Error | Level::Warn => eprint!("{line}"),
            _ => print!("{line}"),
        }

        if let Some(sink) = self.sink.lock().unwrap().as_mut() {
            sink.write_line(&line);
        }
    }

    fn flush(&self) {
        if let Some(sink) = self.sink.lock().unwrap().as_mut() {
            let _ = sink.file.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn line_format_matches_contract() {
        let when = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 6).unwrap();
        let line = format_line(Level::Info, "camera 3 connected", when);
        assert_eq!(line, "2024-03-09 14:05:06.000000 [INFO  ] camera 3 connected\n");
    }

    #[test]
    fn level_names_are_padded_to_six() {
        let when = Local.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for (level, expect) in [
            (Level::Error, "[ERROR ]"),
            (Level::Warn, "[WARN  ]"),
            (Level::Trace, "[TRACE ]"),
        ] {
            let line = format_line(level, "x", when);
            assert!(line.contains(expect), "{line:?} missing {expect:?}");
        }
    }

    #[test]
    fn backup_name_carries_timestamp() {
        let when = Local.with_ymd_and_hms(2024, 12, 31, 23, 59, 58).unwrap();
        let backup = backup_path(Path::new("/var/log/camflow.log"), when);
        assert_eq!(
            backup,
            PathBuf::from("/var/log/camflow.log.20241231_235958")
        );
    }

    #[test]
    fn rotation_threshold_is_megabytes() {
        assert!(!should_rotate(0, 1));
        assert!(!should_rotate(1024 * 1024 - 1, 1));
        assert!(should_rotate(1024 * 1024, 1));
        assert!(!should_rotate(u64::MAX, 0), "0 disables rotation");
    }

    #[test]
    fn file_sink_appends_and_rotates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("camflow.log");

        // max 0 MB: plain appending, no rotation.
        let mut sink = FileSink::open(path.clone(), 0).expect("open");
        sink.write_line("first\n");
        sink.write_line("second\n");
        drop(sink);
        let text = std::fs::read_to_string(&path).expect("read");
        assert_eq!(text, "first\nsecond\n");

        // Reopening resumes the byte count from the existing file.
        let sink = FileSink::open(path.clone(), 1).expect("reopen");
        assert_eq!(sink.written, text.len() as u64);
    }
}
