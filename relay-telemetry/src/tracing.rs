use relay_config::Environment;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::io::{self, Write};
use std::panic::PanicHookInfo;
use std::sync::{Once, OnceLock};
use thiserror::Error;
use tracing::subscriber::{SetGlobalDefaultError, set_global_default};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, InitError};
use tracing_log::{LogTracer, log_tracer::SetLoggerError};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, FmtSubscriber, Registry, fmt, layer::SubscriberExt};

const INSTANCE_KEY_IN_LOG: &str = "instance";
const RUN_ID_KEY_IN_LOG: &str = "run_id";

const LOG_DIR: &str = "logs";
const LOG_FILE_SUFFIX: &str = "log";
const MAX_LOG_FILES: usize = 7;

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to build the rolling log appender: {0}")]
    InitAppender(#[from] InitError),

    #[error("failed to install the log tracer: {0}")]
    InitLogTracer(#[from] SetLoggerError),

    #[error("failed to install the global subscriber: {0}")]
    SetGlobalDefault(#[from] SetGlobalDefaultError),

    #[error("failed to read the environment: {0}")]
    Io(#[from] io::Error),
}

/// Keeps buffered log lines alive until the process exits.
///
/// Drop it last in `main`; file logs written in prod are lost otherwise.
#[must_use]
pub enum LogFlusher {
    Flusher(WorkerGuard),
    NullFlusher,
}

static INIT_TEST_TRACING: Once = Once::new();

/// Installs console tracing for tests when `ENABLE_TRACING` is set.
///
/// ```bash
/// ENABLE_TRACING=1 RUST_LOG=relay=debug cargo test claim_
/// ```
pub fn init_test_tracing() {
    INIT_TEST_TRACING.call_once(|| {
        if std::env::var("ENABLE_TRACING").is_ok() {
            Environment::Dev.set();
            let _log_flusher =
                init_tracing("relay-tests", None).expect("failed to initialize test tracing");
        }
    });
}

static INSTANCE_NAME: OnceLock<String> = OnceLock::new();
static RUN_ID: OnceLock<String> = OnceLock::new();

/// Names this relay process in every JSON log line.
pub fn set_global_instance_name(instance_name: String) {
    let _ = INSTANCE_NAME.set(instance_name);
}

/// Records the identifier of the run this process serves.
///
/// A process hosts a single supervisor run, so the first value wins.
pub fn set_global_run_id(run_id: String) {
    let _ = RUN_ID.set(run_id);
}

pub fn global_run_id() -> Option<&'static str> {
    RUN_ID.get().map(String::as_str)
}

fn global_fields() -> Vec<(&'static str, &'static str)> {
    let mut fields = Vec::with_capacity(2);
    if let Some(instance_name) = INSTANCE_NAME.get() {
        fields.push((INSTANCE_KEY_IN_LOG, instance_name.as_str()));
    }
    if let Some(run_id) = RUN_ID.get() {
        fields.push((RUN_ID_KEY_IN_LOG, run_id.as_str()));
    }
    fields
}

/// Adds the given top-level fields to a JSON log line.
///
/// Returns `None` when the line is not a JSON object or already carries every field, in
/// which case the caller writes the original bytes. Existing keys are never overwritten.
fn inject_fields(line: &str, fields: &[(&str, &str)]) -> Option<String> {
    let serde_json::Value::Object(mut map) = serde_json::from_str(line).ok()? else {
        return None;
    };

    let mut modified = false;
    for (key, value) in fields {
        if !map.contains_key(*key) {
            map.insert(
                (*key).to_owned(),
                serde_json::Value::String((*value).to_owned()),
            );
            modified = true;
        }
    }

    if !modified {
        return None;
    }

    let mut rendered = serde_json::to_string(&map).ok()?;
    if line.ends_with('\n') {
        rendered.push('\n');
    }
    Some(rendered)
}

/// Wraps the file writer so JSON lines carry the instance name and run id.
struct FieldInjectingWriter<W> {
    inner: W,
}

impl<W: Write> Write for FieldInjectingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let fields = global_fields();
        if !fields.is_empty()
            && let Ok(line) = std::str::from_utf8(buf)
            && let Some(rendered) = inject_fields(line, &fields)
        {
            self.inner.write_all(rendered.as_bytes())?;
            return Ok(buf.len());
        }

        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Installs the global subscriber for a relay binary.
///
/// Prod and staging write JSON to daily rolling files under `logs/`; dev pretty-prints to
/// the terminal. `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing(
    app_name: &str,
    instance_name: Option<String>,
) -> Result<LogFlusher, TracingError> {
    if let Some(instance_name) = instance_name {
        set_global_instance_name(instance_name);
    }

    LogTracer::init()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_flusher = if Environment::load()?.is_prod() {
        configure_prod_tracing(filter, app_name)?
    } else {
        configure_dev_tracing(filter)?
    };

    set_tracing_panic_hook();

    Ok(log_flusher)
}

fn configure_prod_tracing(filter: EnvFilter, app_name: &str) -> Result<LogFlusher, TracingError> {
    let file_appender = rolling::Builder::new()
        .filename_prefix(app_name)
        .filename_suffix(LOG_FILE_SUFFIX)
        .rotation(rolling::Rotation::DAILY)
        .max_log_files(MAX_LOG_FILES)
        .build(LOG_DIR)?;

    let (file_appender, guard) = tracing_appender::non_blocking(file_appender);

    let format = fmt::format()
        .with_level(true)
        .with_ansi(false)
        .with_target(false);

    let subscriber = Registry::default().with(filter).with(
        fmt::layer()
            .event_format(format)
            .with_writer(move || FieldInjectingWriter {
                inner: file_appender.make_writer(),
            })
            .json()
            .with_current_span(true)
            .with_span_list(true),
    );

    set_global_default(subscriber)?;

    Ok(LogFlusher::Flusher(guard))
}

fn configure_dev_tracing(filter: EnvFilter) -> Result<LogFlusher, TracingError> {
    let format = fmt::format()
        .with_level(true)
        .with_ansi(true)
        .pretty()
        .with_line_number(false)
        .with_file(false)
        .with_target(true);

    let subscriber = FmtSubscriber::builder()
        .event_format(format)
        .with_env_filter(filter)
        .finish();

    set_global_default(subscriber)?;

    Ok(LogFlusher::NullFlusher)
}

fn set_tracing_panic_hook() {
    let prev_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        log_panic(info);
        prev_hook(info);
    }));
}

fn log_panic(panic_info: &PanicHookInfo) {
    let backtrace = Backtrace::capture();
    let (backtrace, note) = match backtrace.status() {
        BacktraceStatus::Captured => (Some(backtrace), None),
        BacktraceStatus::Disabled => (None, Some("set RUST_BACKTRACE=1 to capture a backtrace")),
        BacktraceStatus::Unsupported => (None, Some("backtraces are unsupported here")),
        _ => (None, Some("backtrace status is unknown")),
    };

    let payload = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    };

    let location = panic_info.location().map(|location| location.to_string());

    tracing::error!(
        panic.payload = payload,
        panic.location = location,
        panic.backtrace = backtrace.map(tracing::field::display),
        panic.note = note,
        "relay panicked",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injects_missing_fields_and_keeps_newline() {
        let line = "{\"level\":\"INFO\",\"fields\":{\"message\":\"hi\"}}\n";
        let rendered = inject_fields(line, &[("run_id", "r-1"), ("instance", "a")]).unwrap();

        assert!(rendered.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(rendered.trim_end()).unwrap();
        assert_eq!(value["run_id"], "r-1");
        assert_eq!(value["instance"], "a");
        assert_eq!(value["level"], "INFO");
    }

    #[test]
    fn existing_fields_are_not_overwritten() {
        let line = "{\"run_id\":\"mine\"}";
        assert!(inject_fields(line, &[("run_id", "other")]).is_none());
    }

    #[test]
    fn non_json_lines_pass_through() {
        assert!(inject_fields("plain text\n", &[("run_id", "r-1")]).is_none());
        assert!(inject_fields("[1,2]", &[("run_id", "r-1")]).is_none());
    }
}
