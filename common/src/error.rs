use thiserror::Error;

/// Errors surfaced by any ingest component to the ingest loop.
///
/// Every variant is a per-row transient condition in the taxonomy of
/// spec.md §7: caught at the loop boundary, logged, and recovered from by
/// resetting all caches and re-enumerating the log directory.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("log directory is unreadable: {0}")]
    DirectoryUnreadable(String),

    #[error("no .csv log files found in directory on startup")]
    NoLogsFound,

    #[error("csv record malformed: {0}")]
    MalformedRecord(String),

    #[error("audit sub-record malformed: {0}")]
    MalformedAuditRecord(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("field {0} could not be parsed as {1}")]
    FieldParse(&'static str, &'static str),
}

pub type IngestResult<T> = Result<T, IngestError>;

/// Startup-fatal conditions (spec.md §7): surfaced to stderr, the process
/// exits rather than recovering.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error("cannot open own log file {path}: {source}")]
    LogFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot daemonize: {0}")]
    Daemonize(String),
}
