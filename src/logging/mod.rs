use crate::models::ProxyLog;
use anyhow::Result;
use chrono::Utc;
use log::{debug, error, info, trace, warn, LevelFilter};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Once;
use tracing::{Event, Subscriber};
use tracing_appender::{non_blocking, rolling};
use tracing_log::LogTracer;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Custom formatter for detailed logging with PID
pub struct DetailedFormatter;

impl<S, N> FormatEvent<S, N> for DetailedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let now = chrono::Utc::now();
        let timestamp = now.format("%Y-%m-%d %H:%M:%S%.3f UTC");
        let level = event.metadata().level();
        let process_id = std::process::id();
        let thread_id = format!("{:?}", std::thread::current().id())
            .replace("ThreadId(", "")
            .replace(')', "");
        let file = event.metadata().file().unwrap_or("unknown");
        let file_name = std::path::Path::new(file)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("unknown");
        let line = event.metadata().line().unwrap_or(0);
        let target = event.metadata().target();

        write!(
            writer,
            "{} {} PID:{} TID:{} {}:{} {} ",
            level, timestamp, process_id, thread_id, file_name, line, target
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Custom file formatter (without colors for file output)
pub struct FileFormatter;

impl<S, N> FormatEvent<S, N> for FileFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        DetailedFormatter.format_event(ctx, writer, event)
    }
}

fn ensure_logs_directory() -> Result<()> {
    let logs_dir = Path::new("logs");
    if !logs_dir.exists() {
        fs::create_dir_all(logs_dir)?;
    }
    Ok(())
}

/// Initialize logging with explicit configuration (§10.1). The single entry
/// point the demo binary uses; only the first call in a process takes effect.
pub fn init_logger_with_config(log_level: &str, enable_file_logging: bool) {
    INIT.call_once(|| {
        let level = log_level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info);
        log::set_max_level(level);

        let console_layer = tracing_subscriber::fmt::layer().event_format(DetailedFormatter);

        if enable_file_logging {
            if let Err(e) = ensure_logs_directory() {
                eprintln!("warning: failed to create logs directory: {:?}", e);
            }
            let file_appender = rolling::never("logs", "proxy.log");
            let (non_blocking_file, guard) = non_blocking(file_appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .event_format(FileFormatter)
                .with_writer(non_blocking_file);

            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(console_layer)
                .with(file_layer)
                .init();
            Box::leak(Box::new(guard));
        } else {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(console_layer)
                .init();
        }

        if let Err(e) = LogTracer::init() {
            eprintln!("warning: failed to bridge `log` into `tracing`: {:?}", e);
        }

        info!("logging initialized (file logging: {})", enable_file_logging);
    });
}

/// Log a completed proxy transaction as a pretty-printed JSON blob at `debug`.
pub fn log_transaction(log_entry: &ProxyLog) -> Result<()> {
    let timestamp = Utc::now().to_rfc3339();
    let log_message = serde_json::to_string_pretty(log_entry)?;
    debug!("[{}] transaction:\n{}", timestamp, log_message);
    Ok(())
}

pub fn log_error(message: &str) {
    error!("{}", message);
}

pub fn log_info(message: &str) {
    info!("{}", message);
}

pub fn log_warning(message: &str) {
    warn!("{}", message);
}

pub fn log_debug(message: &str) {
    debug!("{}", message);
}

pub fn log_trace(message: &str) {
    trace!("{}", message);
}

/// Convenience macro for logging proxy transactions
#[macro_export]
macro_rules! log_proxy_transaction {
    ($log_entry:expr) => {
        if let Err(e) = $crate::logging::log_transaction($log_entry) {
            eprintln!("failed to log transaction: {}", e);
        }
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::log_error(&format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::log_info(&format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_warning {
    ($($arg:tt)*) => {
        $crate::logging::log_warning(&format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::log_debug(&format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        $crate::logging::log_trace(&format!($($arg)*));
    };
}
