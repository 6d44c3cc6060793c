use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter::EnvFilter, fmt};

use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::PanicHookInfo;

const ENV_DEBUG: &str = "DATAFLOW_DEBUG";

/// Panic hook to send panic info to `tracing` instead of stderr.
/// Without this, a panicking callback is logged to stderr as:
/// ```text
/// {"timestamp":"2026-10-18T09:12:04.118201Z","level":"INFO","message":"Starting reactive operator","operator":"join"}
///
/// thread 'tokio-runtime-worker' panicked at src/join.rs:42:13:
/// index out of bounds: the len is 0 but the index is 0
/// ```
///
/// With the panic hook, the same is logged as:
/// ```text
/// {"timestamp":"2026-10-18T09:12:04.118201Z","level":"INFO","message":"Starting reactive operator","operator":"join"}
/// {"timestamp":"2026-10-18T09:12:04.120473Z","level":"ERROR","message":"src/join.rs:42:13: index out of bounds: the len is 0 but the index is 0"}
/// ```
fn report_panic(panic_info: &PanicHookInfo<'_>) {
    // noop if the RUST_BACKTRACE or RUST_LIB_BACKTRACE backtrace variables are both not set
    let backtrace = Backtrace::capture();
    let backtrace_captured = backtrace.status() == BacktraceStatus::Captured;
    let payload = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
        Some(*s)
    } else {
        panic_info
            .payload()
            .downcast_ref::<String>()
            .map(|s| s.as_str())
    };

    // `location` is always `Some` for now, the fallback below covers a future `None`
    match (panic_info.location(), payload, backtrace_captured) {
        (Some(location), Some(payload), false) => {
            // one line, unlike `tracing::error!("{}", panic_info)`
            tracing::error!(
                "{}:{}:{}: {}",
                location.file(),
                location.line(),
                location.column(),
                payload,
            );
        }
        _ => {
            // default formatting
            tracing::error!("{}\n{}", panic_info, backtrace);
        }
    };
}

pub fn register() {
    // RUST_LOG overrides the default level, `info` (or `debug` in debug mode).
    let debug_mode = std::env::var(ENV_DEBUG).is_ok_and(|v| v.to_lowercase() == "true");
    let default_log_level = if debug_mode { "debug" } else { "info" };

    let filter = EnvFilter::builder()
        .with_default_directive(default_log_level.parse().unwrap_or(Level::INFO.into()))
        .from_env_lossy();

    let layer = if debug_mode {
        // Text format
        fmt::layer().boxed()
    } else {
        // JSON format, flattened
        fmt::layer()
            .with_ansi(false)
            .json()
            .flatten_event(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .init();

    std::panic::set_hook(Box::new(report_panic));
}
