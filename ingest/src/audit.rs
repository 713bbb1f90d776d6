//! Audit-message sub-parser (spec.md §4.3).

use common::error::IngestError;

use crate::model::{AuditRecord, AUDIT_RECORD_ARITY};

const AUDIT_PREFIX: &str = "AUDIT: ";

/// `true` if `message` carries an embedded audit record.
pub fn is_audit_message(message: &str) -> bool {
    message.starts_with(AUDIT_PREFIX)
}

/// Strips the `AUDIT: ` prefix and re-parses the remainder with the same
/// record grammar as the top-level CSV reader, then positionally maps the
/// nine fields (spec.md §4.3).
pub fn parse_audit_message(message: &str) -> Result<AuditRecord, IngestError> {
    let payload = message
        .strip_prefix(AUDIT_PREFIX)
        .ok_or_else(|| IngestError::MalformedAuditRecord("missing AUDIT: prefix".to_string()))?;

    let fields = crate::csv_reader::parse_record_line(payload)?;
    if fields.len() != AUDIT_RECORD_ARITY {
        return Err(IngestError::MalformedAuditRecord(format!(
            "expected {} fields, found {}",
            AUDIT_RECORD_ARITY,
            fields.len()
        )));
    }
    AuditRecord::from_fields(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_audit_prefix() {
        assert!(is_audit_message("AUDIT: READ,1,1,READ,SELECT,t,o,s,<none>"));
        assert!(!is_audit_message("connection authorized"));
    }

    #[test]
    fn parses_embedded_record() {
        let msg = r#"AUDIT: READ,1,1,READ,SELECT,TABLE,public.t,"select 1",<none>"#;
        let rec = parse_audit_message(msg).unwrap();
        assert_eq!(rec.statement_id, 1);
        assert_eq!(rec.substatement_id, 1);
        assert_eq!(rec.command.as_deref(), Some("SELECT"));
        assert!(rec.parameter.is_none());
    }
}
