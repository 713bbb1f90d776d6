use std::sync::Once;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;

static INIT: Once = Once::new();

/// Initializes the global `tracing` subscriber once per process.
///
/// Mirrors the upstream daemon's behaviour: when `log_dir` is given, events
/// go to a daily-rolling file under it as well as stdout; otherwise stdout
/// only. Returns the worker guard for the file appender (if any) — callers
/// must keep it alive for the process lifetime or buffered lines are lost.
pub fn init(debug: bool, log_dir: Option<&str>) -> Option<WorkerGuard> {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    let mut guard = None;

    INIT.call_once(|| {
        let format = tracing_subscriber::fmt::format()
            .with_target(false)
            .with_thread_ids(true)
            .compact();

        match log_dir {
            None => {
                let _ = tracing_subscriber::fmt()
                    .with_max_level(level)
                    .event_format(format)
                    .try_init();
            }
            Some(dir) => {
                let file_appender = tracing_appender::rolling::daily(dir, "pgaudit-ingest.log");
                let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
                let writer = non_blocking.and(std::io::stdout);

                let _ = tracing_subscriber::fmt()
                    .with_max_level(level)
                    .event_format(format)
                    .with_writer(writer)
                    .try_init();

                guard = Some(worker_guard);
            }
        }
    });

    guard
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{debug, info};

    #[test]
    fn init_is_idempotent() {
        let _g1 = init(true, None);
        let _g2 = init(true, None);
        debug!("log init test");
        info!("log init test");
    }
}
