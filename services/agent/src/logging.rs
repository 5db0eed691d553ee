//! Logging initialization for the agent.
//!
//! Two file outputs with daily calendar rotation plus stderr:
//! - operational log at the configured level:
//!   `<data>/logs/orchestrator-logs-YYYY-MM-DD.log`
//! - debug log at DEBUG regardless of the configured level:
//!   `<data>/debug/orchestrator-debug-YYYY-MM-DD.log`

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use crate::config::Config;

/// Appending file writer that reopens when the calendar date changes.
struct DailyFileWriter {
    dir: PathBuf,
    prefix: &'static str,
    current_date: String,
    file: Option<File>,
}

impl DailyFileWriter {
    fn new(dir: PathBuf, prefix: &'static str) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let mut writer = Self {
            dir,
            prefix,
            current_date: String::new(),
            file: None,
        };
        writer.roll(&today())?;
        Ok(writer)
    }

    fn roll(&mut self, date: &str) -> io::Result<()> {
        let path = self.dir.join(format!("{}-{}.log", self.prefix, date));
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.current_date = date.to_string();
        self.file = Some(file);
        Ok(())
    }
}

fn today() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}

impl Write for DailyFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let date = today();
        if date != self.current_date {
            self.roll(&date)?;
        }
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            // Keep the process alive even if the log target is gone.
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Thread-safe writer wrapper.
struct SharedWriter(Mutex<DailyFileWriter>);

impl Write for &SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.lock() {
            Ok(mut writer) => writer.write(buf),
            Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.0.lock() {
            Ok(mut writer) => writer.flush(),
            Err(_) => Ok(()),
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for &'static SharedWriter {
    type Writer = &'static SharedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        *self
    }
}

/// Initialize tracing with file and stderr outputs.
///
/// The writers are leaked to obtain `'static` lifetimes; the agent logs for
/// the lifetime of the process.
pub fn init(config: &Config, level: LevelFilter) -> anyhow::Result<()> {
    let operational = DailyFileWriter::new(config.logs_dir(), "orchestrator-logs")?;
    let debug = DailyFileWriter::new(config.debug_dir(), "orchestrator-debug")?;

    let operational: &'static SharedWriter =
        Box::leak(Box::new(SharedWriter(Mutex::new(operational))));
    let debug: &'static SharedWriter = Box::leak(Box::new(SharedWriter(Mutex::new(debug))));

    let operational_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(operational)
        .with_filter(level);

    let debug_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(debug)
        .with_filter(LevelFilter::DEBUG);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(io::stderr)
        .with_filter(level);

    tracing_subscriber::registry()
        .with(operational_layer)
        .with(debug_layer)
        .with(stderr_layer)
        .init();

    Ok(())
}
