use anyhow::Context;
use clap::ValueEnum;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer};

// The reload handle's concrete type names the whole subscriber stack
// and cannot reasonably be written out, so a closure that captures it
// is stashed instead.
static TRACING_FILTER_RELOAD_HANDLE: OnceLock<
    Box<dyn Fn(&str) -> anyhow::Result<()> + Send + Sync>,
> = OnceLock::new();

static RECENT_LOGS: OnceLock<RecentLogBuffer> = OnceLock::new();

/// Swap the active diagnostic log filter, e.g. from the dashboard's
/// setLogLevel action.
pub fn set_diagnostic_log_filter(new_filter: &str) -> anyhow::Result<()> {
    let func = TRACING_FILTER_RELOAD_HANDLE
        .get()
        .ok_or_else(|| anyhow::anyhow!("unable to retrieve filter reload handle"))?;
    (func)(new_filter)
}

/// The in-memory tail of the diagnostic log, for the dashboard.
/// None before logging has been initialized.
pub fn recent_logs() -> Option<&'static RecentLogBuffer> {
    RECENT_LOGS.get()
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "kebab_case")]
pub enum DiagnosticFormat {
    Pretty,
    Full,
    Compact,
    Json,
}

/// A bounded ring of recently rendered log lines.
#[derive(Clone, Default)]
pub struct RecentLogBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
}

const RECENT_LOG_CAPACITY: usize = 500;

impl RecentLogBuffer {
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    fn push_line(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == RECENT_LOG_CAPACITY {
            lines.pop_front();
        }
        lines.push_back(line);
    }
}

/// Accumulates bytes from the fmt layer and commits whole lines into
/// the ring buffer.
pub struct RecentLogWriter {
    buffer: RecentLogBuffer,
    pending: Vec<u8>,
}

impl std::io::Write for RecentLogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while let Some(idx) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=idx).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).to_string();
            self.buffer.push_line(line);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for RecentLogWriter {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            let line = String::from_utf8_lossy(&self.pending).to_string();
            self.buffer.push_line(line);
        }
    }
}

impl<'a> MakeWriter<'a> for RecentLogBuffer {
    type Writer = RecentLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RecentLogWriter {
            buffer: self.clone(),
            pending: Vec::new(),
        }
    }
}

pub struct LoggingConfig<'a> {
    pub log_dir: Option<PathBuf>,
    pub filter_env_var: &'a str,
    pub default_filter: &'a str,
    pub diag_format: DiagnosticFormat,
}

impl<'a> LoggingConfig<'a> {
    pub fn init(&self) -> anyhow::Result<()> {
        let (non_blocking, _non_blocking_flusher);
        let log_writer = if let Some(log_dir) = &self.log_dir {
            let file_appender = tracing_appender::rolling::hourly(log_dir, "log");
            (non_blocking, _non_blocking_flusher) = tracing_appender::non_blocking(file_appender);
            BoxMakeWriter::new(non_blocking)
        } else {
            BoxMakeWriter::new(std::io::stderr)
        };

        let layer = fmt::layer().with_thread_names(true).with_writer(log_writer);
        let layer = match self.diag_format {
            DiagnosticFormat::Pretty => layer.pretty().boxed(),
            DiagnosticFormat::Full => layer.boxed(),
            DiagnosticFormat::Compact => layer.compact().boxed(),
            DiagnosticFormat::Json => layer.json().boxed(),
        };

        let env_filter = EnvFilter::try_new(
            std::env::var(self.filter_env_var)
                .as_deref()
                .unwrap_or(self.default_filter),
        )?;
        let (env_filter, reload_handle) = tracing_subscriber::reload::Layer::new(env_filter);

        let recent = RecentLogBuffer::default();
        let recent_layer = fmt::layer()
            .compact()
            .with_ansi(false)
            .with_writer(recent.clone())
            .with_filter(EnvFilter::new("info"));

        tracing_subscriber::registry()
            .with(layer.with_filter(env_filter))
            .with(recent_layer)
            .init();

        RECENT_LOGS
            .set(recent)
            .map_err(|_| anyhow::anyhow!("diagnostic logging initialized twice"))?;

        TRACING_FILTER_RELOAD_HANDLE
            .set(Box::new(move |new_filter: &str| {
                let f = EnvFilter::try_new(new_filter)
                    .with_context(|| format!("parsing log filter '{new_filter}'"))?;
                Ok(reload_handle.reload(f).context("applying new log filter")?)
            }))
            .map_err(|_| anyhow::anyhow!("failed to assign reloadable logging filter"))?;

        Ok(())
    }
}
