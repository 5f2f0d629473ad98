//! Tracing setup for the binary.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "todoflow=info";

fn make_filter(verbose: bool) -> EnvFilter {
    let fallback = if verbose { "todoflow=debug" } else { DEFAULT_FILTER };
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber: stderr plus, when `log_dir` is given, a
/// daily rolling file. Keep the returned guard alive to flush file output.
pub fn init_tracing(log_dir: Option<&Path>, json: bool, verbose: bool) -> Option<WorkerGuard> {
    let (file_writer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "todoflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    match (json, file_writer) {
        (true, Some(writer)) => {
            let _ = tracing_subscriber::fmt()
                .json()
                .with_env_filter(make_filter(verbose))
                .with_target(true)
                .with_writer(std::io::stderr.and(writer))
                .try_init();
        }
        (true, None) => {
            let _ = tracing_subscriber::fmt()
                .json()
                .with_env_filter(make_filter(verbose))
                .with_target(true)
                .with_writer(std::io::stderr)
                .try_init();
        }
        (false, Some(writer)) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(make_filter(verbose))
                .with_target(true)
                .with_ansi(false)
                .with_writer(std::io::stderr.and(writer))
                .try_init();
        }
        (false, None) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(make_filter(verbose))
                .with_target(true)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }

    guard
}
