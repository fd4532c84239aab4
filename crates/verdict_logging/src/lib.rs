//! Shared logging utilities for Verdict binaries.
//!
//! Every binary logs to a size-capped file under the Verdict home
//! directory and to stderr. File output always honors the env filter;
//! stderr can be quieted for client binaries.
//!
//! File rotation is generation-based: the active file is
//! `<app>.<serial>.log`, and once it outgrows the size cap the writer
//! moves on to the next serial and deletes the oldest generations.
//! Files are never renamed, so an external `tail -F` keeps working on
//! the generation it follows.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "verdict=info,verdict_server=info,verdict_worker=info";
const KEEP_GENERATIONS: usize = 5;
const GENERATION_CAP_BYTES: u64 = 10 * 1024 * 1024;

/// Logging configuration shared by Verdict binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
    /// Client binaries set this to keep stderr at warnings only.
    pub quiet_console: bool,
}

/// Initialize tracing with a size-capped file writer and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_writer = GenerationLog::open(log_dir, config.app_name)
        .context("Failed to open log file")?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let console_filter = if config.verbose {
        EnvFilter::new("debug")
    } else if config.quiet_console {
        EnvFilter::new("warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = verdict_protocol::paths::default_logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Size-capped, generation-numbered log writer.
///
/// Cheap to clone; every clone appends to the same generation under a
/// shared lock, which is what `tracing_subscriber` needs from a
/// `MakeWriter`.
#[derive(Clone)]
struct GenerationLog {
    shared: Arc<Mutex<Generations>>,
}

struct Generations {
    dir: PathBuf,
    prefix: String,
    serial: u64,
    file: File,
    written: u64,
}

impl GenerationLog {
    /// Resume the newest generation in `dir`, or start the first one.
    fn open(dir: PathBuf, app_name: &str) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let prefix = file_prefix(app_name);

        let serial = newest_serial(&dir, &prefix)?.unwrap_or(0);
        let path = generation_path(&dir, &prefix, serial);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();

        let mut generations = Generations {
            dir,
            prefix,
            serial,
            file,
            written,
        };
        // A previous run may have left the newest generation full.
        if generations.written >= GENERATION_CAP_BYTES {
            generations.advance()?;
        }

        Ok(Self {
            shared: Arc::new(Mutex::new(generations)),
        })
    }
}

impl Generations {
    /// Start the next generation and discard the oldest ones.
    fn advance(&mut self) -> io::Result<()> {
        let _ = self.file.flush();
        self.serial += 1;
        let path = generation_path(&self.dir, &self.prefix, self.serial);
        self.file = OpenOptions::new().create(true).append(true).open(path)?;
        self.written = 0;

        if self.serial as usize >= KEEP_GENERATIONS {
            let horizon = self.serial - KEEP_GENERATIONS as u64;
            for stale in list_serials(&self.dir, &self.prefix)? {
                if stale <= horizon {
                    let _ = fs::remove_file(generation_path(&self.dir, &self.prefix, stale));
                }
            }
        }
        Ok(())
    }

    fn append(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > GENERATION_CAP_BYTES {
            self.advance()?;
        }
        let count = self.file.write(buf)?;
        self.written += count as u64;
        Ok(count)
    }
}

impl Write for GenerationLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.shared.lock() {
            Ok(mut generations) => generations.append(buf),
            Err(_) => Err(io::Error::new(io::ErrorKind::Other, "log lock poisoned")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.shared.lock() {
            Ok(mut generations) => generations.file.flush(),
            Err(_) => Err(io::Error::new(io::ErrorKind::Other, "log lock poisoned")),
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for GenerationLog {
    type Writer = GenerationLog;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn generation_path(dir: &Path, prefix: &str, serial: u64) -> PathBuf {
    dir.join(format!("{prefix}.{serial}.log"))
}

/// Serials of every generation file for `prefix` currently on disk.
fn list_serials(dir: &Path, prefix: &str) -> io::Result<Vec<u64>> {
    let mut serials = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(middle) = name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('.'))
            .and_then(|rest| rest.strip_suffix(".log"))
        else {
            continue;
        };
        if let Ok(serial) = middle.parse::<u64>() {
            serials.push(serial);
        }
    }
    Ok(serials)
}

fn newest_serial(dir: &Path, prefix: &str) -> io::Result<Option<u64>> {
    Ok(list_serials(dir, prefix)?.into_iter().max())
}

/// Filesystem-safe variant of the application name.
fn file_prefix(app_name: &str) -> String {
    let cleaned: String = app_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if cleaned.is_empty() {
        "verdict".to_string()
    } else {
        cleaned
    }
}
