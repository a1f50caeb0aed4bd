use std::fmt;
use std::path::Path;

use ansi_term::Colour;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

use crate::config::Config;

const LOG_ENV: &str = "RCVERBS_LOG";

// The code is adapted from tokio-rs/tracing/tracing-subscriber
struct FmtLevel<'a> {
    level: &'a Level,
    ansi: bool,
}

impl<'a> FmtLevel<'a> {
    fn new(level: &'a Level, ansi: bool) -> Self {
        Self { level, ansi }
    }
}

const TRACE_STR: &str = "TRACE";
const DEBUG_STR: &str = "DEBUG";
const INFO_STR: &str = " INFO";
const WARN_STR: &str = " WARN";
const ERROR_STR: &str = "ERROR";

impl<'a> fmt::Display for FmtLevel<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (text, colour) = match *self.level {
            Level::TRACE => (TRACE_STR, Colour::Purple),
            Level::DEBUG => (DEBUG_STR, Colour::Blue),
            Level::INFO => (INFO_STR, Colour::Green),
            Level::WARN => (WARN_STR, Colour::Yellow),
            Level::ERROR => (ERROR_STR, Colour::Red),
        };
        if self.ansi {
            write!(f, "{}", colour.paint(text))
        } else {
            f.pad(text)
        }
    }
}

/// `[time LEVEL file:line] message`
struct BenchFormatter {
    ansi: bool,
}

impl<S, N> FormatEvent<S, N> for BenchFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        use chrono::Utc;
        let metadata = event.metadata();
        let fmt_level = FmtLevel::new(metadata.level(), self.ansi && writer.has_ansi_escapes());

        write!(
            writer,
            "[{} {} {}:{}] ",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.6f"),
            fmt_level,
            metadata.file().unwrap_or("<unnamed>"),
            metadata.line().unwrap_or(0),
        )?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn env_filter(default_level: &str) -> anyhow::Result<EnvFilter> {
    Ok(EnvFilter::builder()
        .with_default_directive(default_level.parse()?)
        .with_env_var(LOG_ENV)
        .from_env_lossy())
}

/// Install the global subscriber. `log` records from the verbs layer are forwarded into it.
/// When `log_file` is set, events are also appended to that file; keep the returned guard alive
/// until exit so the writer thread flushes.
pub fn init_log(
    config: &Config,
    ansi: bool,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::prelude::*;

    tracing_log::LogTracer::init()?;

    let stdout_layer = tracing_subscriber::fmt::layer()
        .event_format(BenchFormatter { ansi })
        .with_filter(env_filter(&config.log_level)?);
    let registry = tracing_subscriber::registry().with(stdout_layer);

    match &config.log_file {
        Some(log_file) => {
            let path = Path::new(log_file);
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("log_file {:?} names no file", log_file))?;
            let (non_blocking, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let file_layer = tracing_subscriber::fmt::layer()
                .event_format(BenchFormatter { ansi: false })
                .with_writer(non_blocking)
                .with_filter(env_filter(&config.log_level)?);
            registry.with(file_layer).try_init()?;
            tracing::info!("logging to {}", log_file);
            Ok(Some(guard))
        }
        None => {
            registry.try_init()?;
            Ok(None)
        }
    }
}
