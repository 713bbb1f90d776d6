//! Logon history updater (spec.md §4.6).

use chrono::NaiveDateTime;

use common::error::IngestError;

use crate::gateway::RowTxn;
use crate::model::{LogonEntry, SessionState};

/// Tracks per-user logon history. Unlike `SessionCache`, entries are not
/// required to stay resident across restarts — every new session touches
/// its user's row exactly once, so re-reading it from the database when
/// not cached is cheap and always correct.
#[derive(Default)]
pub struct LogonCache {
    entries: std::collections::HashMap<String, LogonEntry>,
}

impl LogonCache {
    pub fn new() -> Self {
        LogonCache::default()
    }

    /// Applies the transition table of spec.md §4.6 for a newly created
    /// session and persists the result. Runs through the row group's
    /// shared `RowTxn` so this write commits atomically with the session
    /// insert that triggered it (spec.md §4.5 step 4 "Commit.").
    pub async fn record_logon(
        &mut self,
        txn: &RowTxn<'_>,
        user_name: &str,
        logon_time: Option<NaiveDateTime>,
        new_state: &SessionState,
    ) -> Result<(), IngestError> {
        let prior = match self.entries.get(user_name) {
            Some(e) => Some(e.clone()),
            None => txn
                .logon_select(user_name)
                .await?
                .map(|r| LogonEntry {
                    last_success: r.last_success,
                    current_success: r.current_success,
                    last_failure: r.last_failure,
                    failures_since_last_success: r.failures_since_last_success,
                }),
        };

        let updated = match (&prior, new_state) {
            (None, SessionState::Ok) => {
                let entry = LogonEntry {
                    last_success: None,
                    current_success: logon_time,
                    last_failure: None,
                    failures_since_last_success: 0,
                };
                txn.logon_insert(user_name, entry.current_success, entry.last_failure, entry.failures_since_last_success)
                    .await?;
                entry
            }
            (None, SessionState::Error) => {
                let entry = LogonEntry {
                    last_success: None,
                    current_success: None,
                    last_failure: logon_time,
                    failures_since_last_success: 1,
                };
                txn.logon_insert(user_name, entry.current_success, entry.last_failure, entry.failures_since_last_success)
                    .await?;
                entry
            }
            (Some(prior), SessionState::Ok) => {
                let entry = LogonEntry {
                    // Promote the previously in-progress logon to
                    // `last_success` before recording the new one.
                    last_success: prior.current_success,
                    current_success: logon_time,
                    last_failure: None,
                    failures_since_last_success: 0,
                };
                txn.logon_update(
                    user_name,
                    entry.last_success,
                    entry.current_success,
                    entry.last_failure,
                    entry.failures_since_last_success,
                )
                .await?;
                entry
            }
            (Some(prior), SessionState::Error) => {
                let entry = LogonEntry {
                    last_success: prior.last_success,
                    current_success: None,
                    last_failure: logon_time,
                    failures_since_last_success: prior.failures_since_last_success + 1,
                };
                txn.logon_update(
                    user_name,
                    entry.last_success,
                    entry.current_success,
                    entry.last_failure,
                    entry.failures_since_last_success,
                )
                .await?;
                entry
            }
        };

        self.entries.insert(user_name.to_string(), updated);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn failures_zero_iff_current_success_set() {
        let entry = LogonEntry {
            last_success: None,
            current_success: Some(ts("2024-01-01 00:00:00")),
            last_failure: None,
            failures_since_last_success: 0,
        };
        assert_eq!(entry.failures_since_last_success == 0, entry.current_success.is_some());

        let entry = LogonEntry {
            last_success: None,
            current_success: None,
            last_failure: Some(ts("2024-01-01 00:00:00")),
            failures_since_last_success: 1,
        };
        assert_eq!(entry.failures_since_last_success == 0, entry.current_success.is_some());
    }
}
