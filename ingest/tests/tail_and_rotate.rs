//! Exercises the sequencer and CSV reader together across file rotation,
//! the way `Ingester::run_one_pass` does, without a database: these two
//! modules are the only ones with no I/O-free substitute, so they get an
//! integration test on real temp-directory files rather than just unit
//! tests on in-memory buffers.

use std::fs;

use ingest::csv_reader::{ReadOutcome, RecordReader};
use ingest::sequencer;

fn minimal_row(session_line_num: u32) -> String {
    format!(",,,,,sess1,{session_line_num},,,,,,,,,,,,,,,,\n")
}

#[test]
fn tails_across_rotation_in_filename_order() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("log_1.csv"), minimal_row(1)).unwrap();
    fs::write(dir.path().join("log_2.csv"), minimal_row(2)).unwrap();

    let first = sequencer::first_file(dir.path()).unwrap();
    assert_eq!(first.file_name().unwrap(), "log_1.csv");

    let mut reader = RecordReader::open(&first, 0).unwrap();
    match reader.read_record().unwrap() {
        ReadOutcome::Record(fields) => assert_eq!(fields[6], Some("1".to_string())),
        ReadOutcome::Exhausted => panic!("expected a record"),
    }
    assert!(matches!(reader.read_record().unwrap(), ReadOutcome::Exhausted));

    let current_name = "log_1.csv";
    let next = sequencer::next_file(dir.path(), Some(current_name))
        .unwrap()
        .expect("log_2.csv should be next");
    assert_eq!(next.file_name().unwrap(), "log_2.csv");

    let mut reader2 = RecordReader::open(&next, 0).unwrap();
    match reader2.read_record().unwrap() {
        ReadOutcome::Record(fields) => assert_eq!(fields[6], Some("2".to_string())),
        ReadOutcome::Exhausted => panic!("expected a record"),
    }
}

#[test]
fn reseek_picks_up_rows_appended_after_exhaustion() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log_1.csv");
    fs::write(&path, minimal_row(1)).unwrap();

    let mut reader = RecordReader::open(&path, 0).unwrap();
    assert!(matches!(reader.read_record().unwrap(), ReadOutcome::Record(_)));
    assert!(matches!(reader.read_record().unwrap(), ReadOutcome::Exhausted));

    // Simulate the writer appending a second row after we hit EOF.
    use std::io::Write;
    let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
    f.write_all(minimal_row(2).as_bytes()).unwrap();
    drop(f);

    reader.reseek().unwrap();
    match reader.read_record().unwrap() {
        ReadOutcome::Record(fields) => assert_eq!(fields[6], Some("2".to_string())),
        ReadOutcome::Exhausted => panic!("expected the appended row"),
    }
}

#[test]
fn restart_resumes_from_persisted_offset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log_1.csv");
    fs::write(&path, format!("{}{}", minimal_row(1), minimal_row(2))).unwrap();

    let offset_after_first = {
        let mut reader = RecordReader::open(&path, 0).unwrap();
        reader.read_record().unwrap();
        reader.offset()
    };

    // A fresh reader opened at the persisted offset (as a restarted
    // process would) must pick up exactly where the old one left off.
    let mut resumed = RecordReader::open(&path, offset_after_first).unwrap();
    match resumed.read_record().unwrap() {
        ReadOutcome::Record(fields) => assert_eq!(fields[6], Some("2".to_string())),
        ReadOutcome::Exhausted => panic!("expected the second row"),
    }
}
