//! Typed views over the raw record shapes of spec.md §3 and §6.

use chrono::NaiveDateTime;

/// One of the 23 fixed columns of a csvlog line, in file order (spec.md §6).
///
/// Everything here is `Option<String>` at this layer; `LogRow::from_fields`
/// is where the few fields the rest of the ingester needs typed
/// (`session_line_num`, timestamps) get parsed out.
#[derive(Debug, Clone)]
pub struct LogRow {
    pub log_time: Option<String>,
    pub user_name: Option<String>,
    pub database_name: Option<String>,
    pub process_id: Option<String>,
    pub connection_from: Option<String>,
    pub session_id: Option<String>,
    pub session_line_num: i64,
    pub command_tag: Option<String>,
    pub session_start_time: Option<String>,
    pub virtual_transaction_id: Option<String>,
    pub transaction_id: Option<String>,
    pub error_severity: Option<String>,
    pub sql_state_code: Option<String>,
    pub message: Option<String>,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub internal_query: Option<String>,
    pub internal_query_pos: Option<String>,
    pub context: Option<String>,
    pub query: Option<String>,
    pub query_pos: Option<String>,
    pub location: Option<String>,
    pub application_name: Option<String>,
}

/// The fixed column count of a top-level csvlog record (spec.md §6).
pub const LOG_ROW_ARITY: usize = 23;

impl LogRow {
    /// Builds a typed row from the raw nullable fields the CSV reader
    /// yields, in column order. Errors if the arity doesn't match or the
    /// monotonic line counter isn't a valid integer — both indicate the
    /// upstream writer emitted something the ingester cannot place in the
    /// cross-row state machine.
    pub fn from_fields(fields: Vec<Option<String>>) -> Result<Self, common::error::IngestError> {
        if fields.len() != LOG_ROW_ARITY {
            return Err(common::error::IngestError::MalformedRecord(format!(
                "expected {} columns, got {}",
                LOG_ROW_ARITY,
                fields.len()
            )));
        }
        let mut f = fields.into_iter();
        let mut next = move || f.next().unwrap();

        let log_time = next();
        let user_name = next();
        let database_name = next();
        let process_id = next();
        let connection_from = next();
        let session_id = next();
        let session_line_num_raw = next();
        let command_tag = next();
        let session_start_time = next();
        let virtual_transaction_id = next();
        let transaction_id = next();
        let error_severity = next();
        let sql_state_code = next();
        let message = next();
        let detail = next();
        let hint = next();
        let internal_query = next();
        let internal_query_pos = next();
        let context = next();
        let query = next();
        let query_pos = next();
        let location = next();
        let application_name = next();

        let session_line_num = session_line_num_raw
            .as_deref()
            .unwrap_or("0")
            .parse::<i64>()
            .map_err(|_| common::error::IngestError::FieldParse("session_line_num", "i64"))?;

        Ok(LogRow {
            log_time,
            user_name,
            database_name,
            process_id,
            connection_from,
            session_id,
            session_line_num,
            command_tag,
            session_start_time,
            virtual_transaction_id,
            transaction_id,
            error_severity,
            sql_state_code,
            message,
            detail,
            hint,
            internal_query,
            internal_query_pos,
            context,
            query,
            query_pos,
            location,
            application_name,
        })
    }

    pub fn session_start_time_parsed(&self) -> Option<NaiveDateTime> {
        parse_timestamp(self.session_start_time.as_deref())
    }

    pub fn log_time_parsed(&self) -> Option<NaiveDateTime> {
        parse_timestamp(self.log_time.as_deref())
    }

    pub fn error_severity_is(&self, levels: &[&str]) -> bool {
        self.error_severity
            .as_deref()
            .map(|s| levels.iter().any(|l| s.eq_ignore_ascii_case(l)))
            .unwrap_or(false)
    }
}

/// Postgres csvlog timestamps look like `2024-01-01 00:00:00.123 UTC`; we
/// only need second precision for the audit tables so the zone suffix (if
/// present) is trimmed before parsing.
fn parse_timestamp(raw: Option<&str>) -> Option<NaiveDateTime> {
    let raw = raw?;
    let trimmed = raw.rsplit_once(' ').map(|(ts, _tz)| ts).unwrap_or(raw);
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
}

/// The 9-field nested record embedded in `AUDIT: <csv>` message payloads
/// (spec.md §4.3), in fixed field order.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub audit_type: Option<String>,
    pub statement_id: i64,
    pub substatement_id: i64,
    pub class: Option<String>,
    pub command: Option<String>,
    pub object_type: Option<String>,
    pub object_name: Option<String>,
    pub statement: Option<String>,
    pub parameter: Option<String>,
}

pub const AUDIT_RECORD_ARITY: usize = 9;

impl AuditRecord {
    pub fn from_fields(fields: Vec<Option<String>>) -> Result<Self, common::error::IngestError> {
        if fields.len() != AUDIT_RECORD_ARITY {
            return Err(common::error::IngestError::MalformedAuditRecord(format!(
                "expected {} columns, got {}",
                AUDIT_RECORD_ARITY,
                fields.len()
            )));
        }
        let mut f = fields.into_iter();
        let mut next = move || f.next().unwrap();

        let audit_type = next();
        let statement_id_raw = next();
        let substatement_id_raw = next();
        let class = next();
        let command = next();
        let object_type = next();
        let object_name = next();
        let statement = next();
        let parameter_raw = next();

        let statement_id = statement_id_raw
            .as_deref()
            .unwrap_or("0")
            .parse::<i64>()
            .map_err(|_| common::error::IngestError::FieldParse("statement_id", "i64"))?;
        let substatement_id = substatement_id_raw
            .as_deref()
            .unwrap_or("0")
            .parse::<i64>()
            .map_err(|_| common::error::IngestError::FieldParse("substatement_id", "i64"))?;

        // The literal `<none>` in the parameter field means absent (spec.md §4.3).
        let parameter = parameter_raw.filter(|p| p != "<none>");

        Ok(AuditRecord {
            audit_type,
            statement_id,
            substatement_id,
            class,
            command,
            object_type,
            object_name,
            statement,
            parameter,
        })
    }
}

/// Session state held in `SessionCache` (spec.md §3, §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Ok,
    Error,
}

impl SessionState {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            SessionState::Ok => "ok",
            SessionState::Error => "error",
        }
    }

    pub fn from_db_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("error") {
            SessionState::Error
        } else {
            SessionState::Ok
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub application_name: String,
    pub state: SessionState,
    pub session_line_num: i64,
    pub statement_id: i64,
    pub substatement_id: i64,
}

impl SessionEntry {
    pub fn fresh(application_name: String, state: SessionState) -> Self {
        SessionEntry {
            application_name,
            state,
            session_line_num: 0,
            statement_id: 0,
            substatement_id: 0,
        }
    }
}

/// Logon row maintained by `LogonCache` (spec.md §3, §4.6).
#[derive(Debug, Clone, Default)]
pub struct LogonEntry {
    pub last_success: Option<NaiveDateTime>,
    pub current_success: Option<NaiveDateTime>,
    pub last_failure: Option<NaiveDateTime>,
    pub failures_since_last_success: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(fields: Vec<Option<&str>>) -> Vec<Option<String>> {
        fields.into_iter().map(|f| f.map(|s| s.to_string())).collect()
    }

    #[test]
    fn parses_minimal_log_row() {
        let mut fields = vec![None; LOG_ROW_ARITY];
        fields[6] = Some("42".to_string());
        let r = LogRow::from_fields(fields).unwrap();
        assert_eq!(r.session_line_num, 42);
        assert!(r.user_name.is_none());
    }

    #[test]
    fn rejects_wrong_arity() {
        let fields = row(vec![None; 5]);
        assert!(LogRow::from_fields(fields).is_err());
    }

    #[test]
    fn audit_record_none_literal_is_absent() {
        let fields = row(vec![
            Some("READ"),
            Some("1"),
            Some("1"),
            Some("READ"),
            Some("SELECT"),
            Some("TABLE"),
            Some("public.t"),
            Some("select 1"),
            Some("<none>"),
        ]);
        let a = AuditRecord::from_fields(fields).unwrap();
        assert_eq!(a.statement_id, 1);
        assert_eq!(a.substatement_id, 1);
        assert!(a.parameter.is_none());
    }

    #[test]
    fn audit_record_keeps_real_parameter() {
        let fields = row(vec![
            Some("READ"),
            Some("1"),
            Some("1"),
            Some("READ"),
            Some("SELECT"),
            Some("TABLE"),
            Some("public.t"),
            Some("select $1"),
            Some("5"),
        ]);
        let a = AuditRecord::from_fields(fields).unwrap();
        assert_eq!(a.parameter.as_deref(), Some("5"));
    }

    #[test]
    fn error_severity_matching_is_case_insensitive() {
        let mut fields = vec![None; LOG_ROW_ARITY];
        fields[6] = Some("1".to_string());
        fields[11] = Some("FATAL".to_string());
        let r = LogRow::from_fields(fields).unwrap();
        assert!(r.error_severity_is(&["error", "fatal", "panic"]));
    }
}
