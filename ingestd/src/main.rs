mod daemon;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;

use common::config::{IngestConfig, LoggingServerConfig};
use common::error::StartupError;
use ingest::Ingester;

/// pgaudit CSV log ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "pgauditd")]
#[command(version)]
#[command(about = "Tails pgaudit csvlog output into a Postgres audit schema")]
#[command(long_about = None)]
struct CliArgs {
    /// Directory of `.csv` audit logs to tail.
    log_path: PathBuf,

    /// Detach, redirect stdout to the log file, stdin/stderr to null, and
    /// start a new session group.
    #[arg(long, default_value_t = false)]
    daemon: bool,

    /// Database port.
    #[arg(long, default_value_t = 5432)]
    port: u16,

    /// Socket directory / default host.
    #[arg(long = "socket-path", default_value = "/var/run/postgresql")]
    socket_path: String,

    /// This daemon's own log file.
    #[arg(long = "log-file", default_value = "/var/log/pgauditd.log")]
    log_file: PathBuf,

    /// Database user. Defaults to the invoking OS user.
    #[arg(long)]
    user: Option<String>,

    /// Host for the logging server. Presence enables logging-server mode.
    #[arg(long = "log-server")]
    log_server: Option<String>,

    /// Database name on the logging server.
    #[arg(long = "log-database")]
    log_database: Option<String>,

    /// Port for the logging server.
    #[arg(long = "log-port", default_value_t = 5432)]
    log_port: u16,

    /// Logical source-server name used in schema naming.
    #[arg(long = "log-from-server")]
    log_from_server: Option<String>,

    /// Accepted but unused (spec.md §9 Open Questions): "central server"
    /// mode is implied only by the presence of `--log-server`.
    #[arg(long = "use-centeral-server", default_value_t = false)]
    use_centeral_server: bool,

    /// Enable debug-level logging.
    #[arg(short, long, default_value_t = false)]
    debug: bool,
}

fn build_config(args: &CliArgs) -> IngestConfig {
    let user = args
        .user
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "postgres".to_string());

    let log_server = args.log_server.clone().map(|host| LoggingServerConfig {
        host,
        database: args.log_database.clone().unwrap_or_default(),
        port: args.log_port,
        from_server: args.log_from_server.clone(),
    });

    IngestConfig {
        log_path: args.log_path.clone(),
        port: args.port,
        socket_path: args.socket_path.clone(),
        user,
        log_file: Some(args.log_file.clone()),
        log_server,
        use_central_server: args.use_centeral_server,
        daemonize: args.daemon,
    }
}

fn main() {
    let args = CliArgs::parse();

    if let Err(e) = ensure_log_file_writable(&args.log_file) {
        eprintln!("pgauditd: {e}");
        std::process::exit(1);
    }

    if args.daemon {
        if let Err(e) = daemon::daemonize(&args.log_file) {
            eprintln!("cannot daemonize: {e}");
            std::process::exit(1);
        }
    }

    let log_dir = args
        .log_file
        .parent()
        .and_then(|p| p.to_str())
        .filter(|p| !p.is_empty());
    let _guard = common::log::init(args.debug, log_dir);

    let config = build_config(&args);

    if let Err(e) = validate_startup(&config) {
        tracing::error!(error = %e, "startup failed");
        eprintln!("pgauditd: {e}");
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("pgauditd: cannot start runtime: {e}");
            std::process::exit(1);
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    register_signal_handlers(Arc::clone(&shutdown));

    runtime.block_on(async move {
        let mut ingester = Ingester::new(config);
        tracing::info!("pgauditd starting up");
        ingester.run(&shutdown).await;
        tracing::info!("pgauditd shutting down");
    });
}

/// Startup preconditions that are fatal rather than recoverable (spec.md
/// §7): the log directory must exist and already contain at least one
/// `.csv` file.
fn validate_startup(config: &IngestConfig) -> Result<(), StartupError> {
    ingest::sequencer::first_file(&config.log_path)?;
    Ok(())
}

/// Startup-fatal per spec.md §6/§7: "cannot open own log file" must exit
/// non-zero with a diagnostic rather than run with logging silently
/// dropped. Opened eagerly here, before `common::log::init`, because the
/// `tracing-appender` rolling writer only lazily creates its file on first
/// write and swallows the I/O error behind its non-blocking channel.
fn ensure_log_file_writable(path: &std::path::Path) -> Result<(), StartupError> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(|_| ())
        .map_err(|source| StartupError::LogFile {
            path: path.display().to_string(),
            source,
        })
}

fn register_signal_handlers(shutdown: Arc<AtomicBool>) {
    for sig in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        if let Err(e) = signal_hook::flag::register(sig, Arc::clone(&shutdown)) {
            tracing::warn!(error = %e, signal = sig, "failed to register signal handler");
        }
    }
}
