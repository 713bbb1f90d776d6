//! Restartable CSV record reader (spec.md §4.2).
//!
//! Wraps an open file handle that may be actively appended to. Records are
//! decoded from an internal byte buffer so that a record split across two
//! `read()` calls (because the writer hadn't flushed a full line yet, or a
//! quoted field spans a read boundary) is simply held back until the rest
//! of it arrives — the underlying handle is never consumed past the last
//! complete record.
//!
//! The high-level `csv` crate was deliberately not used here: once a field
//! is folded into a `StringRecord` there is no way to tell an unquoted
//! empty field (absent, per spec.md §6) apart from a quoted empty field
//! (empty string) — exactly the distinction this reader's caller depends
//! on. See DESIGN.md.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use common::error::IngestError;

const READ_CHUNK: usize = 64 * 1024;

pub enum ReadOutcome {
    Record(Vec<Option<String>>),
    /// End of file reached with no complete record pending. The reader's
    /// position is left at the start of whatever partial data remains
    /// buffered; call `reseek` before trying again once more bytes may
    /// have been appended.
    Exhausted,
}

pub struct RecordReader {
    file: File,
    buf: Vec<u8>,
    /// File offset corresponding to `buf[0]` — i.e. the start of the next
    /// unconsumed byte, used to resume across restarts.
    offset: u64,
}

impl RecordReader {
    /// Opens `path` and positions it at `start_offset` (0 for a fresh file).
    pub fn open(path: &std::path::Path, start_offset: u64) -> Result<Self, IngestError> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(start_offset))?;
        Ok(RecordReader {
            file,
            buf: Vec::new(),
            offset: start_offset,
        })
    }

    /// The file offset of the next byte this reader will consume. Callers
    /// persist this (via the owning session's high-water mark / restart
    /// bookkeeping) so a restart can reopen at the same place.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Many OSes cache end-of-file on a handle; re-seeking to the current
    /// position is the documented way to make the kernel notice a file
    /// that grew after we last hit EOF (spec.md §5).
    pub fn reseek(&mut self) -> Result<(), IngestError> {
        let pos = self.offset + self.buf.len() as u64;
        self.file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    /// Decodes and returns the next complete record, reading more bytes
    /// from the file as needed. Returns `Exhausted` once the file has no
    /// more bytes and the buffered remainder (if any) is not yet a full
    /// record.
    pub fn read_record(&mut self) -> Result<ReadOutcome, IngestError> {
        loop {
            if let Some((fields, consumed)) = try_parse_record(&self.buf)? {
                self.buf.drain(0..consumed);
                self.offset += consumed as u64;
                return Ok(ReadOutcome::Record(fields));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.file.read(&mut chunk)?;
            if n == 0 {
                return Ok(ReadOutcome::Exhausted);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Parses a single already-extracted line (e.g. the payload of an
/// `AUDIT: ` message) using the same record grammar as the file-tailing
/// reader above.
pub fn parse_record_line(line: &str) -> Result<Vec<Option<String>>, IngestError> {
    let mut owned = line.as_bytes().to_vec();
    if !owned.ends_with(b"\n") {
        owned.push(b'\n');
    }
    match try_parse_record(&owned)? {
        Some((fields, _consumed)) => Ok(fields),
        None => Err(IngestError::MalformedRecord(
            "incomplete record in audit payload".to_string(),
        )),
    }
}

/// Attempts to parse exactly one record from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` doesn't yet contain a complete record
/// (more bytes are needed — the caller must not treat this as an error).
fn try_parse_record(buf: &[u8]) -> Result<Option<(Vec<Option<String>>, usize)>, IngestError> {
    let n = buf.len();
    let mut i = 0usize;
    let mut fields = Vec::new();

    loop {
        if i >= n {
            return Ok(None);
        }

        let field = if buf[i] == b'"' {
            i += 1;
            let mut content = Vec::new();
            loop {
                if i >= n {
                    return Ok(None);
                }
                if buf[i] == b'"' {
                    if i + 1 < n && buf[i + 1] == b'"' {
                        content.push(b'"');
                        i += 2;
                        continue;
                    }
                    if i + 1 >= n {
                        // Could still be a doubled quote once more data
                        // arrives — wait for it.
                        return Ok(None);
                    }
                    i += 1; // consume closing quote
                    break;
                }
                content.push(buf[i]);
                i += 1;
            }
            // Quoted fields are never absent, even when empty.
            Some(String::from_utf8(content).map_err(|_| {
                IngestError::MalformedRecord("field is not valid utf-8".to_string())
            })?)
        } else {
            let start = i;
            while i < n && buf[i] != b',' && buf[i] != b'\n' && buf[i] != b'\r' {
                i += 1;
            }
            if i >= n {
                return Ok(None);
            }
            if start == i {
                None
            } else {
                Some(
                    String::from_utf8(buf[start..i].to_vec()).map_err(|_| {
                        IngestError::MalformedRecord("field is not valid utf-8".to_string())
                    })?,
                )
            }
        };

        fields.push(field);

        if i >= n {
            return Ok(None);
        }
        match buf[i] {
            b',' => {
                i += 1;
                continue;
            }
            b'\r' => {
                i += 1;
                if i >= n {
                    return Ok(None);
                }
                if buf[i] == b'\n' {
                    i += 1;
                }
                return Ok(Some((fields, i)));
            }
            b'\n' => {
                i += 1;
                return Ok(Some((fields, i)));
            }
            other => {
                return Err(IngestError::MalformedRecord(format!(
                    "unexpected byte 0x{other:02x} after field"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse_all(bytes: &[u8]) -> Vec<Vec<Option<String>>> {
        let mut out = Vec::new();
        let mut rest = bytes;
        loop {
            match try_parse_record(rest).unwrap() {
                Some((fields, consumed)) => {
                    out.push(fields);
                    rest = &rest[consumed..];
                }
                None => break,
            }
        }
        out
    }

    #[test]
    fn unquoted_empty_field_is_absent() {
        let recs = parse_all(b"a,,c\n");
        assert_eq!(recs[0], vec![Some("a".into()), None, Some("c".into())]);
    }

    #[test]
    fn quoted_empty_field_is_empty_string() {
        let recs = parse_all(b"a,\"\",c\n");
        assert_eq!(recs[0], vec![Some("a".into()), Some("".into()), Some("c".into())]);
    }

    #[test]
    fn embedded_newline_in_quotes_is_preserved() {
        let recs = parse_all(b"a,\"line1\nline2\",c\n");
        assert_eq!(
            recs[0],
            vec![Some("a".into()), Some("line1\nline2".into()), Some("c".into())]
        );
    }

    #[test]
    fn doubled_quote_is_escaped_quote() {
        let recs = parse_all(b"a,\"he said \"\"hi\"\"\",c\n");
        assert_eq!(
            recs[0][1],
            Some("he said \"hi\"".to_string())
        );
    }

    #[test]
    fn incomplete_record_returns_none() {
        assert!(try_parse_record(b"a,b,").unwrap().is_none());
        assert!(try_parse_record(b"a,\"unterminated").unwrap().is_none());
    }

    #[test]
    fn reader_resumes_across_partial_writes_and_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.csv");
        std::fs::write(&path, b"a,b\n").unwrap();

        let mut reader = RecordReader::open(&path, 0).unwrap();
        match reader.read_record().unwrap() {
            ReadOutcome::Record(f) => assert_eq!(f, vec![Some("a".into()), Some("b".into())]),
            ReadOutcome::Exhausted => panic!("expected a record"),
        }
        match reader.read_record().unwrap() {
            ReadOutcome::Exhausted => {}
            ReadOutcome::Record(_) => panic!("expected exhaustion"),
        }

        let saved_offset = reader.offset();
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(f, "c,d").unwrap();
        }

        reader.reseek().unwrap();
        match reader.read_record().unwrap() {
            ReadOutcome::Record(f) => assert_eq!(f, vec![Some("c".into()), Some("d".into())]),
            ReadOutcome::Exhausted => panic!("expected the appended record"),
        }
        assert!(reader.offset() > saved_offset);
    }
}
