use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr as _;
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::config::LoggingConfig;

/// Installs the process-wide subscriber: stderr plus a size-rotated file at
/// `{log_dir}/{config.file}`. `RUST_LOG` overrides the configured level.
pub fn init(config: &LoggingConfig, log_dir: &Path) -> anyhow::Result<()> {
    let level = parse_level(&config.level);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level.as_str().to_ascii_lowercase()))
        .context("build log filter")?;

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("create log dir: {}", log_dir.display()))?;
    let file = RotatingFile::open(
        log_dir.join(&config.file),
        config.rotate_bytes,
        config.backup_count,
    )?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file)),
        )
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(())
}

/// Stderr-only logging for commands that have no output directory.
pub fn init_stderr() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))
        .context("build log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(())
}

/// Accepts level names in any case; anything unrecognised means `info`.
pub fn parse_level(raw: &str) -> tracing::Level {
    let normalized = match raw.trim().to_ascii_lowercase().as_str() {
        "warning" => "warn".to_owned(),
        "critical" | "fatal" => "error".to_owned(),
        other => other.to_owned(),
    };
    tracing::Level::from_str(&normalized).unwrap_or(tracing::Level::INFO)
}

/// Append-only log file that rolls over to `name.1` .. `name.{backups}` when
/// the next write would exceed `max_bytes`. `max_bytes == 0` never rotates.
#[derive(Debug)]
pub struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    state: Mutex<OpenLog>,
}

#[derive(Debug)]
struct OpenLog {
    file: File,
    len: u64,
}

impl RotatingFile {
    pub fn open(path: PathBuf, max_bytes: u64, backups: usize) -> anyhow::Result<Self> {
        let state = OpenLog::open(&path)?;
        Ok(Self {
            path,
            max_bytes,
            backups,
            state: Mutex::new(state),
        })
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    fn rotate(&self, state: &mut OpenLog) -> io::Result<()> {
        state.file.flush()?;
        if self.backups == 0 {
            state.file = File::create(&self.path)?;
            state.len = 0;
            return Ok(());
        }

        for index in (1..self.backups).rev() {
            let from = self.backup_path(index);
            if from.exists() {
                std::fs::rename(&from, self.backup_path(index + 1))?;
            }
        }
        std::fs::rename(&self.path, self.backup_path(1))?;
        *state = OpenLog::open(&self.path).map_err(io::Error::other)?;
        Ok(())
    }
}

impl OpenLog {
    fn open(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file: {}", path.display()))?;
        let len = file
            .metadata()
            .with_context(|| format!("stat log file: {}", path.display()))?
            .len();
        Ok(Self { file, len })
    }
}

impl Write for &RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        let incoming = buf.len() as u64;
        if self.max_bytes > 0 && state.len > 0 && state.len + incoming > self.max_bytes {
            self.rotate(&mut state)?;
        }
        state.file.write_all(buf)?;
        state.len += incoming;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        state.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_are_forgiving() {
        assert_eq!(parse_level("INFO"), tracing::Level::INFO);
        assert_eq!(parse_level("debug"), tracing::Level::DEBUG);
        assert_eq!(parse_level("WARNING"), tracing::Level::WARN);
        assert_eq!(parse_level("critical"), tracing::Level::ERROR);
        assert_eq!(parse_level("inf"), tracing::Level::INFO);
    }

    #[test]
    fn rotates_and_keeps_bounded_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harvest.log");
        let log = RotatingFile::open(path.clone(), 10, 2).unwrap();
        let mut writer = &log;

        for line in ["aaaaaaaa\n", "bbbbbbbb\n", "cccccccc\n", "dddddddd\n"] {
            writer.write_all(line.as_bytes()).unwrap();
        }
        writer.flush().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "dddddddd\n");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("harvest.log.1")).unwrap(),
            "cccccccc\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("harvest.log.2")).unwrap(),
            "bbbbbbbb\n"
        );
        assert!(!dir.path().join("harvest.log.3").exists());
    }

    #[test]
    fn zero_limit_never_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.log");
        let log = RotatingFile::open(path.clone(), 0, 3).unwrap();
        let mut writer = &log;

        writer.write_all(b"one\n").unwrap();
        writer.write_all(b"two\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\ntwo\n");
        assert!(!dir.path().join("plain.log.1").exists());
    }
}
