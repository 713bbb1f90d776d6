use std::path::PathBuf;

/// Fixed name of the account that runs this daemon's own writes.
///
/// Rows whose `user_name` equals this value are the ingester talking to
/// itself (maintenance queries against the target database) and are
/// filtered at the boundary per spec.md §6.
pub const AUDIT_ETL_USER: &str = "pgaudit_etl";

/// Single-server mode's fixed schema name.
pub const DEFAULT_SCHEMA: &str = "pgaudit";

/// How long the loop sleeps when no new rows are available (spec.md §5).
pub const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// How long the loop sleeps after a per-row transient error before
/// re-enumerating the log directory from scratch (spec.md §7).
pub const RECOVERY_SLEEP: std::time::Duration = std::time::Duration::from_secs(5);

/// Assembled, validated configuration for one run of the ingester.
///
/// Built from CLI flags in the `ingestd` binary; kept here so library code
/// in `ingest` never has to parse a flag itself.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Directory of `.csv` audit logs to tail.
    pub log_path: PathBuf,

    /// Database connection port.
    pub port: u16,

    /// Socket directory / default host, used both to connect and (per the
    /// preserved quirk documented in DESIGN.md) as a schema-naming fallback.
    pub socket_path: String,

    /// Database user this process connects as.
    pub user: String,

    /// This daemon's own log file, when not running attached to a terminal.
    pub log_file: Option<PathBuf>,

    /// Logging-server mode, enabled by presence of `--log-server`.
    pub log_server: Option<LoggingServerConfig>,

    /// Accepted but unused: see Open Questions in spec.md §9.
    pub use_central_server: bool,

    pub daemonize: bool,
}

#[derive(Debug, Clone)]
pub struct LoggingServerConfig {
    pub host: String,
    pub database: String,
    pub port: u16,
    /// Logical source-server name used in schema naming (`--log-from-server`).
    pub from_server: Option<String>,
}

impl IngestConfig {
    pub fn is_logging_server_mode(&self) -> bool {
        self.log_server.is_some()
    }
}
