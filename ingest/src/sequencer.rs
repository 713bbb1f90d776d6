//! Log-file sequencer (spec.md §4.1).
//!
//! Stateless by design: every call re-lists the directory. The upstream log
//! rotator guarantees filenames sort chronologically, so "next file" is
//! just "smallest `.csv` name strictly greater than the last one seen".

use std::path::{Path, PathBuf};

use common::error::IngestError;

/// Returns the lexicographically-smallest `.csv` file in `dir` whose name
/// is strictly greater than `after` (or the smallest overall, if `after`
/// is `None`). `None` means no such file exists yet.
pub fn next_file(dir: &Path, after: Option<&str>) -> Result<Option<PathBuf>, IngestError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| IngestError::DirectoryUnreadable(format!("{}: {e}", dir.display())))?;

    let mut names: Vec<String> = Vec::new();
    for entry in entries {
        let entry = entry
            .map_err(|e| IngestError::DirectoryUnreadable(format!("{}: {e}", dir.display())))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("csv") {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            names.push(name.to_string());
        }
    }
    names.sort();

    let next = match after {
        None => names.into_iter().next(),
        Some(after) => names.into_iter().find(|n| n.as_str() > after),
    };

    Ok(next.map(|name| dir.join(name)))
}

/// Startup precondition (spec.md §4.1): the very first call must find at
/// least one `.csv` file, or the daemon refuses to start.
pub fn first_file(dir: &Path) -> Result<PathBuf, IngestError> {
    next_file(dir, None)?.ok_or(IngestError::NoLogsFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn finds_smallest_file_first() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("log_2.csv"), "").unwrap();
        fs::write(dir.path().join("log_1.csv"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();

        let found = first_file(dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "log_1.csv");
    }

    #[test]
    fn next_after_returns_strictly_greater_name() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("log_1.csv"), "").unwrap();
        fs::write(dir.path().join("log_2.csv"), "").unwrap();

        let next = next_file(dir.path(), Some("log_1.csv")).unwrap();
        assert_eq!(next.unwrap().file_name().unwrap(), "log_2.csv");

        let none = next_file(dir.path(), Some("log_2.csv")).unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn empty_directory_on_first_call_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        match first_file(dir.path()) {
            Err(IngestError::NoLogsFound) => {}
            other => panic!("expected NoLogsFound, got {other:?}"),
        }
    }

    #[test]
    fn unreadable_directory_is_reported() {
        let missing = Path::new("/nonexistent/pgaudit/does/not/exist");
        match next_file(missing, None) {
            Err(IngestError::DirectoryUnreadable(_)) => {}
            other => panic!("expected DirectoryUnreadable, got {other:?}"),
        }
    }
}
