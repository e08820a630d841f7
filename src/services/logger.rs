use std::fs;
use std::path::Path;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the structured logging system.
///
/// Sets up:
/// - Console output on **stderr** only. stdout carries the JSON-RPC stream and
///   must never see a log line.
/// - Optional file output: daily rolling files `{log_dir}/siyuan-mcp.*.log`,
///   keeping the latest 5. If the directory cannot be created the bridge keeps
///   running with stderr logging alone.
/// - Environment filter: defaults to `info`, configurable via `RUST_LOG`.
///
/// Returns an error if a global subscriber was already installed.
pub fn init(log_dir: Option<&Path>) -> Result<(), String> {
    let file_layer = log_dir.and_then(|dir| {
        fs::create_dir_all(dir).ok()?;
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("siyuan-mcp")
            .filename_suffix("log")
            .max_log_files(5)
            .build(dir)
            .ok()?;
        Some(
            fmt::layer()
                .with_writer(appender)
                .with_ansi(false)
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
    });
    let file_enabled = file_layer.is_some();

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true)
        .compact();

    // reqwest/hyper internals are noisy at debug level.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,reqwest=warn,hyper=warn,hyper_util=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| format!("Logger already initialized: {}", e))?;

    tracing::info!(
        log_dir = ?log_dir.filter(|_| file_enabled).map(|d| d.display().to_string()),
        "Logger initialized"
    );
    Ok(())
}
