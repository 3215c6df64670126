//! Binary recording format: header, chunk layout, trailer.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::json;
use telbbs::bbs::recorder::SessionRecorder;

/// Parse a capture back into `(sec, usec, text)` chunks.
fn parse_chunks(raw: &[u8]) -> Vec<(u32, u32, Vec<u8>)> {
    let mut chunks = Vec::new();
    let mut at = 0;
    while at < raw.len() {
        let sec = u32::from_le_bytes(raw[at..at + 4].try_into().unwrap());
        let usec = u32::from_le_bytes(raw[at + 4..at + 8].try_into().unwrap());
        let len = u32::from_le_bytes(raw[at + 8..at + 12].try_into().unwrap()) as usize;
        chunks.push((sec, usec, raw[at + 12..at + 12 + len].to_vec()));
        at += 12 + len;
    }
    chunks
}

#[tokio::test]
async fn chunks_round_trip_with_split_timestamps() {
    let dir = tempfile::tempdir().unwrap();
    let mut recorder =
        SessionRecorder::create(dir.path(), "203.0.113.9", 24, 80, Duration::ZERO).await.unwrap();
    recorder.write(Duration::from_millis(1500), "hi").await.unwrap();

    let mut info = BTreeMap::new();
    info.insert("handle".to_string(), json!("jojo"));
    info.insert("TERM".to_string(), json!("ansi"));
    let path = recorder.path().to_path_buf();
    recorder.stop(Duration::from_secs(2), &info).await.unwrap();

    let chunks = parse_chunks(&std::fs::read(&path).unwrap());

    // header: terminal geometry, then UTF-8 mode
    assert_eq!(chunks[0].2, b"\x1b[8;24;80t".to_vec());
    assert_eq!(chunks[1].2, b"\x1b%G".to_vec());

    // the recorded write: seconds and microseconds split out
    assert_eq!((chunks[2].0, chunks[2].1), (1, 500_000));
    assert_eq!(chunks[2].2, b"hi".to_vec());

    // trailer: style reset, blank line, sorted info dump, final newline
    assert_eq!(chunks[3].2, b"\x1b[m".to_vec());
    assert_eq!(chunks[4].2, b"\r\n\r\n".to_vec());
    let dump = String::from_utf8(chunks[5].2.clone()).unwrap();
    assert_eq!(dump, "TERM: ansi\r\nhandle: jojo");
    assert_eq!(chunks[6].2, b"\r\n".to_vec());
    assert_eq!(chunks.len(), 7);
}

#[tokio::test]
async fn filenames_carry_timestamp_sequence_and_origin() {
    let dir = tempfile::tempdir().unwrap();
    let first =
        SessionRecorder::create(dir.path(), "203.0.113.9", 24, 80, Duration::ZERO).await.unwrap();
    let name = first.file_name();
    assert!(name.ends_with("-203.0.113.9.rec"), "unexpected name {name}");
    assert!(name.chars().next().unwrap().is_ascii_digit());

    // a second capture in the same instant bumps the sequence digit
    let second =
        SessionRecorder::create(dir.path(), "203.0.113.9", 24, 80, Duration::ZERO).await.unwrap();
    assert_ne!(first.file_name(), second.file_name());
    assert!(first.path().exists());
    assert!(second.path().exists());
}

#[tokio::test]
async fn missing_capture_directory_is_created() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("rec").join("deep");
    let recorder =
        SessionRecorder::create(&nested, "198.51.100.7", 50, 132, Duration::ZERO).await.unwrap();
    assert!(recorder.path().starts_with(&nested));
}
