//! Session state cache and state machine (spec.md §4.5).

use std::collections::HashMap;

use common::error::IngestError;

use crate::gateway::RowTxn;
use crate::logon::LogonCache;
use crate::model::{LogRow, SessionEntry, SessionState};

const UNKNOWN: &str = "[unknown]";

#[derive(Default)]
pub struct SessionCache {
    entries: HashMap<String, SessionEntry>,
}

impl SessionCache {
    pub fn new() -> Self {
        SessionCache::default()
    }

    pub fn get(&self, session_id: &str) -> Option<&SessionEntry> {
        self.entries.get(session_id)
    }

    pub fn get_mut(&mut self, session_id: &str) -> Option<&mut SessionEntry> {
        self.entries.get_mut(session_id)
    }

    /// Monotonicity gate (spec.md §4.5): a row is written iff its
    /// `session_line_num` strictly exceeds the cached value for its
    /// session. Sessions not yet in the cache always pass (there is
    /// nothing to compare against yet — `on_row` must run first).
    pub fn passes_gate(&self, session_id: &str, session_line_num: i64) -> bool {
        match self.entries.get(session_id) {
            Some(entry) => session_line_num > entry.session_line_num,
            None => true,
        }
    }

    /// Advances the cached `session_line_num` once the corresponding
    /// `log_event` row has actually been committed.
    pub fn advance_line_num(&mut self, session_id: &str, session_line_num: i64) {
        if let Some(entry) = self.entries.get_mut(session_id) {
            entry.session_line_num = session_line_num;
        }
    }

    /// Runs spec.md §4.5 steps 1–5 for every row of a new-to-this-run
    /// session id: seed from the database on restart, or create a brand
    /// new session and roll the logon history forward. Also performs the
    /// "advance" step (last-application-name-wins) for sessions already
    /// cached.
    ///
    /// Every read and write here runs through the row group's shared
    /// `RowTxn` (spec.md §4.4 step 1, §4.5 step 4 "Commit."): a new
    /// session's insert and its logon-history update land in the same
    /// transaction as the row's eventual `log_event`/audit writes, so a
    /// crash between them can never leave one committed without the other.
    pub async fn on_row(
        &mut self,
        txn: &RowTxn<'_>,
        logons: &mut LogonCache,
        row: &LogRow,
    ) -> Result<(), IngestError> {
        let session_id = match row.session_id.as_deref() {
            Some(id) if !id.is_empty() => id,
            _ => return Ok(()),
        };

        if self.entries.contains_key(session_id) {
            self.advance_application_name(txn, session_id, row).await?;
            return Ok(());
        }

        if let Some(existing) = txn.session_select(session_id).await? {
            self.entries.insert(
                session_id.to_string(),
                SessionEntry {
                    application_name: existing.application_name,
                    state: SessionState::from_db_str(&existing.state),
                    session_line_num: existing.session_line_num,
                    statement_id: existing.statement_id,
                    substatement_id: existing.substatement_id,
                },
            );
            return Ok(());
        }

        let state = new_session_state(row);
        let application_name = row
            .application_name
            .clone()
            .unwrap_or_else(|| UNKNOWN.to_string());
        let connection_from = row
            .connection_from
            .clone()
            .unwrap_or_else(|| UNKNOWN.to_string());
        let process_id = row.process_id.as_deref().and_then(|s| s.parse::<i32>().ok());

        txn.session_insert(
            session_id,
            process_id,
            row.session_start_time_parsed(),
            row.user_name.as_deref(),
            &application_name,
            &connection_from,
            state.as_db_str(),
        )
        .await?;

        let user_name = row.user_name.clone().unwrap_or_else(|| UNKNOWN.to_string());
        logons
            .record_logon(txn, &user_name, row.session_start_time_parsed(), &state)
            .await?;

        self.entries
            .insert(session_id.to_string(), SessionEntry::fresh(application_name, state));

        Ok(())
    }

    async fn advance_application_name(
        &mut self,
        txn: &RowTxn<'_>,
        session_id: &str,
        row: &LogRow,
    ) -> Result<(), IngestError> {
        let current = self.entries.get(session_id).expect("checked by caller");
        let incoming_app = match row.application_name.as_deref() {
            Some(name) => name,
            None => return Ok(()),
        };
        if row.session_line_num > current.session_line_num && incoming_app != current.application_name {
            txn.session_update(session_id, incoming_app).await?;
            if let Some(entry) = self.entries.get_mut(session_id) {
                entry.application_name = incoming_app.to_string();
            }
        }
        Ok(())
    }
}

/// A brand new session is `error` iff its first row is a fatal
/// authentication failure; otherwise `ok` (spec.md §4.5 step 3). The
/// state, once set, is never revisited for the life of the session.
fn new_session_state(row: &LogRow) -> SessionState {
    let is_auth = row
        .command_tag
        .as_deref()
        .map(|c| c.eq_ignore_ascii_case("authentication"))
        .unwrap_or(false);
    if is_auth && row.error_severity_is(&["fatal"]) {
        SessionState::Error
    } else {
        SessionState::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_with(session_line_num: i64, command_tag: Option<&str>, severity: Option<&str>) -> LogRow {
        let mut fields: Vec<Option<String>> = vec![None; crate::model::LOG_ROW_ARITY];
        fields[6] = Some(session_line_num.to_string());
        fields[7] = command_tag.map(|s| s.to_string());
        fields[11] = severity.map(|s| s.to_string());
        LogRow::from_fields(fields).unwrap()
    }

    #[test]
    fn new_session_is_ok_by_default() {
        let row = row_with(1, None, None);
        assert_eq!(new_session_state(&row), SessionState::Ok);
    }

    #[test]
    fn fatal_authentication_makes_session_error() {
        let row = row_with(1, Some("authentication"), Some("FATAL"));
        assert_eq!(new_session_state(&row), SessionState::Error);
    }

    #[test]
    fn non_fatal_authentication_is_ok() {
        let row = row_with(1, Some("authentication"), Some("LOG"));
        assert_eq!(new_session_state(&row), SessionState::Ok);
    }

    #[test]
    fn gate_allows_unseen_session_and_blocks_non_advancing_line() {
        let mut cache = SessionCache::new();
        assert!(cache.passes_gate("s1", 1));
        cache
            .entries
            .insert("s1".to_string(), SessionEntry::fresh("[unknown]".into(), SessionState::Ok));
        cache.advance_line_num("s1", 5);
        assert!(!cache.passes_gate("s1", 5));
        assert!(!cache.passes_gate("s1", 3));
        assert!(cache.passes_gate("s1", 6));
    }
}
