//! Log-event and audit writer (spec.md §4.7, §4.8).
//!
//! Called only for rows that already passed the monotonicity gate
//! (`SessionCache::passes_gate`) — gating itself lives in `session`, this
//! module just performs the writes and the statement/substatement
//! bookkeeping that goes with them.

use common::error::IngestError;

use crate::audit;
use crate::gateway::{AuditDetailInsert, LogEventInsert, RowTxn};
use crate::model::{AuditRecord, LogRow};
use crate::session::SessionCache;

const ERROR_SEVERITIES: &[&str] = &["error", "fatal", "panic"];

/// Writes one gated row: routes an embedded audit payload to the audit
/// writer first (nulling the message before the `log_event` insert), then
/// inserts the `log_event` row itself and advances the session's
/// high-water mark. Finally, if the row is itself an error, marks every
/// statement sharing its virtual transaction id as failed.
///
/// All of the above runs through the row group's shared `RowTxn` — the
/// audit writes, the `log_event` insert and the error-propagation update
/// either all commit together (caller commits once the whole row group is
/// done) or, on error, none do. This is what keeps the idempotence
/// invariant of spec.md §8 intact across a crash mid-row: a replayed line
/// can never find half its writes already committed.
pub async fn write_row(
    txn: &RowTxn<'_>,
    sessions: &mut SessionCache,
    session_id: &str,
    row: &LogRow,
) -> Result<(), IngestError> {
    let mut message = row.message.as_deref();

    if let Some(msg) = message {
        if audit::is_audit_message(msg) {
            let record = audit::parse_audit_message(msg)?;
            write_audit(txn, sessions, session_id, row.session_line_num, &record).await?;
            message = None;
        }
    }

    let insert = LogEventInsert {
        session_id,
        log_time: row.log_time_parsed(),
        session_line_num: row.session_line_num,
        command: row.command_tag.as_deref(),
        error_severity: row.error_severity.as_deref(),
        sql_state_code: row.sql_state_code.as_deref(),
        virtual_transaction_id: row.virtual_transaction_id.as_deref(),
        transaction_id: row.transaction_id.as_deref(),
        message,
        detail: row.detail.as_deref(),
        hint: row.hint.as_deref(),
        query: row.query.as_deref(),
        query_pos: row.query_pos.as_deref(),
        internal_query: row.internal_query.as_deref(),
        internal_query_pos: row.internal_query_pos.as_deref(),
        context: row.context.as_deref(),
        location: row.location.as_deref(),
    };
    txn.log_insert(&insert).await?;
    sessions.advance_line_num(session_id, row.session_line_num);

    if row.error_severity_is(ERROR_SEVERITIES) {
        txn.audit_stmt_error_update(
            row.session_line_num,
            session_id,
            row.virtual_transaction_id.as_deref(),
        )
        .await?;
    }

    Ok(())
}

/// Audit writer (spec.md §4.8): three independently-gated inserts sharing
/// one parsed record.
async fn write_audit(
    txn: &RowTxn<'_>,
    sessions: &mut SessionCache,
    session_id: &str,
    session_line_num: i64,
    record: &AuditRecord,
) -> Result<(), IngestError> {
    let (insert_statement, insert_substatement, cached_line_num) = {
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| IngestError::MalformedRecord(format!("unknown session {session_id}")))?;

        let insert_statement = record.statement_id > entry.statement_id;
        if insert_statement {
            entry.statement_id = record.statement_id;
            entry.substatement_id = 0;
        }

        let insert_substatement =
            record.statement_id == entry.statement_id && record.substatement_id > entry.substatement_id;
        if insert_substatement {
            entry.substatement_id = record.substatement_id;
        }

        (insert_statement, insert_substatement, entry.session_line_num)
    };

    if insert_statement {
        txn.audit_stmt_insert(session_id, record.statement_id).await?;
    }

    if insert_substatement {
        // `<none>` was already folded to `None` when the record was parsed.
        txn.audit_substmt_insert(
            session_id,
            record.statement_id,
            record.substatement_id,
            record.statement.as_deref(),
            record.parameter.as_deref(),
        )
        .await?;
    }

    if session_line_num > cached_line_num {
        let audit_type = record.audit_type.as_deref().map(str::to_lowercase);
        let class = record.class.as_deref().map(str::to_lowercase);
        let command = record.command.as_deref().map(str::to_lowercase);
        let object_type = record.object_type.as_deref().map(str::to_lowercase);
        let object_name = record.object_name.as_deref().map(str::to_lowercase);

        txn.audit_substmt_detail_insert(&AuditDetailInsert {
            session_id,
            statement_id: record.statement_id,
            substatement_id: record.substatement_id,
            session_line_num,
            audit_type: audit_type.as_deref(),
            class: class.as_deref(),
            command: command.as_deref(),
            object_type: object_type.as_deref(),
            object_name: object_name.as_deref(),
        })
        .await?;
    }

    Ok(())
}
