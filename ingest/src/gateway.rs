//! Database gateway (spec.md §4.4).
//!
//! Lazily opens one connection per target database name, probes for the
//! presence of the expected audit schema, prepares the full set of
//! parameterized statements once, and exposes typed write operations. The
//! schema-absence decision is memoized so a database without the schema is
//! never reconnected to for the rest of the run.
//!
//! Every row group's writes run inside one explicit `tokio_postgres`
//! transaction (`RowTxn`), opened with `DbGateway::begin` and closed with
//! `RowTxn::commit` once the whole row (session bookkeeping, audit writes,
//! `log_event` insert, error propagation) has succeeded. A row that fails
//! partway drops its `RowTxn` without committing, which rolls the whole
//! group back — spec.md §4.4 step 1 ("non-autocommit connection"), §4.5
//! step 4 ("Commit.") and §2 item 7 ("commits per row group") all describe
//! this same one-transaction-per-row-group shape.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use tokio_postgres::{Client, NoTls, Statement, Transaction};
use tracing::{info, warn};

use common::config::IngestConfig;
use common::error::IngestError;

/// Computes the schema a database's audit rows land in (spec.md §3).
///
/// In logging-server mode, when `log_from_server` is absent the socket
/// path is substituted for the source-host component. Whether that
/// fallback is intentional or a latent bug in the tool this was ported
/// from is unclear (spec.md §9 Open Questions); the behaviour is
/// preserved as observed rather than "fixed".
pub fn schema_name(
    logging_server_mode: bool,
    log_from_server: Option<&str>,
    socket_path: &str,
    database: &str,
) -> String {
    if !logging_server_mode {
        return common::config::DEFAULT_SCHEMA.to_string();
    }
    let source_host = log_from_server.unwrap_or(socket_path);
    format!("{source_host}_{database}")
}

pub struct SessionRow {
    pub application_name: String,
    pub state: String,
    pub session_line_num: i64,
    pub statement_id: i64,
    pub substatement_id: i64,
}

pub struct LogonRow {
    pub last_success: Option<NaiveDateTime>,
    pub current_success: Option<NaiveDateTime>,
    pub last_failure: Option<NaiveDateTime>,
    pub failures_since_last_success: i32,
}

struct PreparedStatements {
    session_select: Statement,
    session_insert: Statement,
    session_update: Statement,
    logon_select: Statement,
    logon_insert: Statement,
    logon_update: Statement,
    log_insert: Statement,
    audit_stmt_insert: Statement,
    audit_stmt_error_update: Statement,
    audit_substmt_insert: Statement,
    audit_substmt_detail_insert: Statement,
}

enum DbHandle {
    /// Schema present: live connection and prepared statements.
    Active {
        client: Client,
        stmts: PreparedStatements,
    },
    /// Schema absent: memoized so we never reconnect for this database.
    NoSchema,
}

pub struct DbGateway {
    config: IngestConfig,
    handles: HashMap<String, DbHandle>,
}

impl DbGateway {
    pub fn new(config: IngestConfig) -> Self {
        DbGateway {
            config,
            handles: HashMap::new(),
        }
    }

    /// Ensures a connection (or memoized absence) exists for `database`,
    /// returning whether rows for it should be ingested at all.
    pub async fn ensure(&mut self, database: &str) -> Result<bool, IngestError> {
        if let Some(handle) = self.handles.get(database) {
            return Ok(matches!(handle, DbHandle::Active { .. }));
        }

        let conn_str = format!(
            "host={} port={} user={} dbname={}",
            self.config.socket_path, self.config.port, self.config.user, database
        );
        let (client, connection) = tokio_postgres::connect(&conn_str, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "database connection task ended");
            }
        });

        let schema = schema_name(
            self.config.is_logging_server_mode(),
            self.config
                .log_server
                .as_ref()
                .and_then(|s| s.from_server.as_deref()),
            &self.config.socket_path,
            database,
        );

        let exists: i64 = client
            .query_one(
                "SELECT count(*) FROM information_schema.schemata WHERE schema_name = $1",
                &[&schema],
            )
            .await?
            .get(0);

        if exists == 0 {
            info!(database, schema, "audit schema absent, will not ingest");
            self.handles.insert(database.to_string(), DbHandle::NoSchema);
            return Ok(false);
        }

        let stmts = prepare_statements(&client, &schema).await?;
        self.handles
            .insert(database.to_string(), DbHandle::Active { client, stmts });
        Ok(true)
    }

    /// Opens a non-autocommit transaction against `database`'s connection,
    /// scoped to one row group. Every write made through the returned
    /// `RowTxn` stays uncommitted (and invisible to other readers) until
    /// `RowTxn::commit` is called; dropping it without committing rolls
    /// everything in the row group back.
    pub async fn begin(&mut self, database: &str) -> Result<RowTxn<'_>, IngestError> {
        match self.handles.get_mut(database) {
            Some(DbHandle::Active { client, stmts }) => {
                let txn = client.transaction().await?;
                Ok(RowTxn { txn, stmts })
            }
            _ => Err(IngestError::MalformedRecord(format!(
                "database {database} has no active gateway handle"
            ))),
        }
    }
}

/// One row group's non-autocommit transaction, scoped to a single
/// database connection (spec.md §4.4 step 1, §4.5 step 4, §2 item 7).
///
/// Holds borrowed prepared statements alongside the live
/// `tokio_postgres::Transaction` so every write issued through it — session
/// bookkeeping, logon history, audit rows, the `log_event` insert, the
/// error-propagation update — lands in the same transaction and either all
/// commit together or none do.
pub struct RowTxn<'a> {
    txn: Transaction<'a>,
    stmts: &'a PreparedStatements,
}

impl<'a> RowTxn<'a> {
    pub async fn commit(self) -> Result<(), IngestError> {
        self.txn.commit().await?;
        Ok(())
    }

    pub async fn session_select(&self, session_id: &str) -> Result<Option<SessionRow>, IngestError> {
        let row = self.txn.query_opt(&self.stmts.session_select, &[&session_id]).await?;
        Ok(row.map(|r| SessionRow {
            application_name: r.get(0),
            state: r.get(1),
            session_line_num: r.get(2),
            statement_id: r.get(3),
            substatement_id: r.get(4),
        }))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn session_insert(
        &self,
        session_id: &str,
        process_id: Option<i32>,
        session_start_time: Option<NaiveDateTime>,
        user_name: Option<&str>,
        application_name: &str,
        connection_from: &str,
        state: &str,
    ) -> Result<(), IngestError> {
        self.txn
            .execute(
                &self.stmts.session_insert,
                &[
                    &session_id,
                    &process_id,
                    &session_start_time,
                    &user_name,
                    &application_name,
                    &connection_from,
                    &state,
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn session_update(&self, session_id: &str, application_name: &str) -> Result<(), IngestError> {
        self.txn
            .execute(&self.stmts.session_update, &[&application_name, &session_id])
            .await?;
        Ok(())
    }

    pub async fn logon_select(&self, user_name: &str) -> Result<Option<LogonRow>, IngestError> {
        let row = self.txn.query_opt(&self.stmts.logon_select, &[&user_name]).await?;
        Ok(row.map(|r| LogonRow {
            last_success: r.get(0),
            current_success: r.get(1),
            last_failure: r.get(2),
            failures_since_last_success: r.get(3),
        }))
    }

    pub async fn logon_insert(
        &self,
        user_name: &str,
        current_success: Option<NaiveDateTime>,
        last_failure: Option<NaiveDateTime>,
        failures_since_last_success: i32,
    ) -> Result<(), IngestError> {
        self.txn
            .execute(
                &self.stmts.logon_insert,
                &[&user_name, &current_success, &last_failure, &failures_since_last_success],
            )
            .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn logon_update(
        &self,
        user_name: &str,
        last_success: Option<NaiveDateTime>,
        current_success: Option<NaiveDateTime>,
        last_failure: Option<NaiveDateTime>,
        failures_since_last_success: i32,
    ) -> Result<(), IngestError> {
        self.txn
            .execute(
                &self.stmts.logon_update,
                &[
                    &last_success,
                    &current_success,
                    &last_failure,
                    &failures_since_last_success,
                    &user_name,
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn log_insert(&self, row: &LogEventInsert<'_>) -> Result<(), IngestError> {
        self.txn
            .execute(
                &self.stmts.log_insert,
                &[
                    &row.session_id,
                    &row.log_time,
                    &row.session_line_num,
                    &row.command,
                    &row.error_severity,
                    &row.sql_state_code,
                    &row.virtual_transaction_id,
                    &row.transaction_id,
                    &row.message,
                    &row.detail,
                    &row.hint,
                    &row.query,
                    &row.query_pos,
                    &row.internal_query,
                    &row.internal_query_pos,
                    &row.context,
                    &row.location,
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn audit_stmt_insert(&self, session_id: &str, statement_id: i64) -> Result<(), IngestError> {
        self.txn
            .execute(&self.stmts.audit_stmt_insert, &[&session_id, &statement_id])
            .await?;
        Ok(())
    }

    pub async fn audit_stmt_error_update(
        &self,
        session_line_num: i64,
        session_id: &str,
        virtual_transaction_id: Option<&str>,
    ) -> Result<(), IngestError> {
        self.txn
            .execute(
                &self.stmts.audit_stmt_error_update,
                &[&session_line_num, &virtual_transaction_id, &session_id],
            )
            .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn audit_substmt_insert(
        &self,
        session_id: &str,
        statement_id: i64,
        substatement_id: i64,
        substatement: Option<&str>,
        parameter: Option<&str>,
    ) -> Result<(), IngestError> {
        let parameter_array: Option<Vec<&str>> = parameter.map(|p| vec![p]);
        self.txn
            .execute(
                &self.stmts.audit_substmt_insert,
                &[
                    &session_id,
                    &statement_id,
                    &substatement_id,
                    &substatement,
                    &parameter_array,
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn audit_substmt_detail_insert(&self, detail: &AuditDetailInsert<'_>) -> Result<(), IngestError> {
        self.txn
            .execute(
                &self.stmts.audit_substmt_detail_insert,
                &[
                    &detail.session_id,
                    &detail.statement_id,
                    &detail.substatement_id,
                    &detail.session_line_num,
                    &detail.audit_type,
                    &detail.class,
                    &detail.command,
                    &detail.object_type,
                    &detail.object_name,
                ],
            )
            .await?;
        Ok(())
    }
}

pub struct LogEventInsert<'a> {
    pub session_id: &'a str,
    pub log_time: Option<NaiveDateTime>,
    pub session_line_num: i64,
    pub command: Option<&'a str>,
    pub error_severity: Option<&'a str>,
    pub sql_state_code: Option<&'a str>,
    pub virtual_transaction_id: Option<&'a str>,
    pub transaction_id: Option<&'a str>,
    pub message: Option<&'a str>,
    pub detail: Option<&'a str>,
    pub hint: Option<&'a str>,
    pub query: Option<&'a str>,
    pub query_pos: Option<&'a str>,
    pub internal_query: Option<&'a str>,
    pub internal_query_pos: Option<&'a str>,
    pub context: Option<&'a str>,
    pub location: Option<&'a str>,
}

pub struct AuditDetailInsert<'a> {
    pub session_id: &'a str,
    pub statement_id: i64,
    pub substatement_id: i64,
    pub session_line_num: i64,
    pub audit_type: Option<&'a str>,
    pub class: Option<&'a str>,
    pub command: Option<&'a str>,
    pub object_type: Option<&'a str>,
    pub object_name: Option<&'a str>,
}

async fn prepare_statements(client: &Client, schema: &str) -> Result<PreparedStatements, IngestError> {
    let session_select = client
        .prepare(&format!(
            r#"SELECT
                s.application_name,
                s.state,
                COALESCE((SELECT MAX(l.session_line_num) FROM "{schema}".log_event l WHERE l.session_id = s.session_id), 0),
                COALESCE((SELECT MAX(a.statement_id) FROM "{schema}".audit_statement a WHERE a.session_id = s.session_id), 0),
                COALESCE((SELECT MAX(b.substatement_id) FROM "{schema}".audit_substatement b
                          WHERE b.session_id = s.session_id
                            AND b.statement_id = COALESCE((SELECT MAX(a2.statement_id) FROM "{schema}".audit_statement a2 WHERE a2.session_id = s.session_id), 0)), 0)
            FROM "{schema}".session s
            WHERE s.session_id = $1"#
        ))
        .await?;

    let session_insert = client
        .prepare(&format!(
            r#"INSERT INTO "{schema}".session
                (session_id, process_id, session_start_time, user_name, application_name, connection_from, state)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#
        ))
        .await?;

    let session_update = client
        .prepare(&format!(
            r#"UPDATE "{schema}".session SET application_name = $1 WHERE session_id = $2"#
        ))
        .await?;

    let logon_select = client
        .prepare(&format!(
            r#"SELECT last_success, current_success, last_failure, failures_since_last_success
               FROM "{schema}".logon WHERE user_name = $1"#
        ))
        .await?;

    let logon_insert = client
        .prepare(&format!(
            r#"INSERT INTO "{schema}".logon
                (user_name, current_success, last_failure, failures_since_last_success)
               VALUES ($1, $2, $3, $4)"#
        ))
        .await?;

    let logon_update = client
        .prepare(&format!(
            r#"UPDATE "{schema}".logon
               SET last_success = $1, current_success = $2, last_failure = $3, failures_since_last_success = $4
               WHERE user_name = $5"#
        ))
        .await?;

    let log_insert = client
        .prepare(&format!(
            r#"INSERT INTO "{schema}".log_event
                (session_id, log_time, session_line_num, command, error_severity, sql_state_code,
                 virtual_transaction_id, transaction_id, message, detail, hint, query, query_pos,
                 internal_query, internal_query_pos, context, location)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)"#
        ))
        .await?;

    let audit_stmt_insert = client
        .prepare(&format!(
            r#"INSERT INTO "{schema}".audit_statement (session_id, statement_id) VALUES ($1, $2)"#
        ))
        .await?;

    // Per spec.md §9 Open Questions: the tool this was ported from spliced a
    // hard-coded `pgaudit` schema into this one statement even in
    // logging-server mode, a latent bug. This reimplementation splices the
    // computed schema uniformly, as the spec directs.
    let audit_stmt_error_update = client
        .prepare(&format!(
            r#"UPDATE "{schema}".audit_statement
               SET state = 'error', error_session_line_num = $1
               WHERE session_id = $3
                 AND statement_id IN (
                   SELECT DISTINCT d.statement_id
                   FROM "{schema}".audit_substatement_detail d
                   JOIN "{schema}".log_event e
                     ON e.session_id = d.session_id AND e.session_line_num = d.session_line_num
                   WHERE d.session_id = $3 AND e.virtual_transaction_id = $2
                 )"#
        ))
        .await?;

    let audit_substmt_insert = client
        .prepare(&format!(
            r#"INSERT INTO "{schema}".audit_substatement
                (session_id, statement_id, substatement_id, substatement, parameter)
               VALUES ($1, $2, $3, $4, $5)"#
        ))
        .await?;

    let audit_substmt_detail_insert = client
        .prepare(&format!(
            r#"INSERT INTO "{schema}".audit_substatement_detail
                (session_id, statement_id, substatement_id, session_line_num, audit_type, class, command, object_type, object_name)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#
        ))
        .await?;

    Ok(PreparedStatements {
        session_select,
        session_insert,
        session_update,
        logon_select,
        logon_insert,
        logon_update,
        log_insert,
        audit_stmt_insert,
        audit_stmt_error_update,
        audit_substmt_insert,
        audit_substmt_detail_insert,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_server_mode_uses_fixed_schema() {
        assert_eq!(schema_name(false, None, "/var/run/postgresql", "app"), "pgaudit");
    }

    #[test]
    fn logging_server_mode_namespaces_by_source_host() {
        assert_eq!(schema_name(true, Some("db1"), "/var/run/postgresql", "app"), "db1_app");
    }

    #[test]
    fn logging_server_mode_falls_back_to_socket_path_when_source_host_missing() {
        // Preserved quirk (spec.md §9): this may be a latent bug upstream,
        // but the behaviour is kept as observed rather than "fixed".
        assert_eq!(
            schema_name(true, None, "/var/run/postgresql", "app"),
            "/var/run/postgresql_app"
        );
    }
}
