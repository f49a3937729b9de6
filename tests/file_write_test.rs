//! File-target writing with single-threaded compression: structure,
//! splitting, forcing, compression and dictionaries.

mod common;

use common::{assert_file_invariants, assert_trailer_position, read_file};
use rust_evio::format::HEADER_SIZE_BYTES;
use rust_evio::{ByteOrder, CompressionType, EventWriter, EvioError, WriterOptions};

fn options_in(dir: &tempfile::TempDir) -> WriterOptions {
    WriterOptions {
        directory: dir.path().display().to_string(),
        ..Default::default()
    }
}

#[test]
fn single_file_structure_and_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = EventWriter::to_file("basic.evio", options_in(&dir)).unwrap();

    let events: Vec<Vec<u8>> = (0..50u32)
        .map(|i| {
            let mut event = vec![0u8; 100 + (i as usize % 7)];
            event[..4].copy_from_slice(&i.to_le_bytes());
            event
        })
        .collect();
    for event in &events {
        assert!(writer.write_event(event).unwrap());
    }
    writer.close().unwrap();
    assert_eq!(writer.events_written(), 50);

    let path = dir.path().join("basic.evio");
    let file = read_file(&path);
    assert_file_invariants(&file);
    assert_trailer_position(&path);
    assert_eq!(file.event_count(), 50);
    assert_eq!(file.all_events(), events);
    assert!(file.header.has_trailer_with_index);
}

#[test]
fn forced_event_is_on_disk_before_close() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = EventWriter::to_file("forced.evio", options_in(&dir)).unwrap();
    assert!(writer.write_event_ext(&[0x42u8; 100], true, false).unwrap());

    // Before close: header plus one whole record must be durable.
    let on_disk = std::fs::metadata(dir.path().join("forced.evio"))
        .unwrap()
        .len();
    assert!(
        on_disk >= (HEADER_SIZE_BYTES + HEADER_SIZE_BYTES + 4 + 100) as u64,
        "only {on_disk} bytes on disk after forced write"
    );

    writer.close().unwrap();
    let file = read_file(&dir.path().join("forced.evio"));
    assert_file_invariants(&file);
    assert_eq!(file.event_count(), 1);
}

#[test]
fn splits_at_size_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let options = WriterOptions {
        split: 1_000_000,
        ..options_in(&dir)
    };
    let mut writer = EventWriter::to_file("split.evio", options).unwrap();

    let event = vec![0xabu8; 10 * 1024];
    for _ in 0..200 {
        assert!(writer.write_event(&event).unwrap());
    }
    writer.close().unwrap();

    // 200 * 10 KB at a 1 MB split must produce at least two files, named
    // with successive split numbers.
    let count = writer.split_count();
    assert!(count >= 2, "expected a split, got {count} file(s)");

    let mut total_events = 0u64;
    for split in 0..count {
        let path = dir.path().join(format!("split.evio.{split}"));
        let file = read_file(&path);
        assert_file_invariants(&file);
        assert_trailer_position(&path);
        assert_eq!(file.header.file_number, split);
        assert!(!file.records.is_empty());
        total_events += file.event_count();
    }
    assert_eq!(total_events, 200);
}

#[test]
fn split_numbers_follow_configured_increment() {
    let dir = tempfile::tempdir().unwrap();
    let options = WriterOptions {
        split: 200_000,
        split_number: 4,
        split_increment: 2,
        ..options_in(&dir)
    };
    let mut writer = EventWriter::to_file("stream.evio", options).unwrap();
    let event = vec![1u8; 50 * 1024];
    for _ in 0..16 {
        writer.write_event(&event).unwrap();
    }
    writer.close().unwrap();

    assert!(writer.split_count() >= 2);
    for i in 0..writer.split_count() {
        let path = dir.path().join(format!("stream.evio.{}", 4 + 2 * i));
        assert!(path.is_file(), "missing split file {}", path.display());
    }
}

#[test]
fn lz4_best_compresses_and_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let options = WriterOptions {
        compression: CompressionType::Lz4Best,
        ..options_in(&dir)
    };
    let mut writer = EventWriter::to_file("compressed.evio", options).unwrap();

    // 1 MiB of repeating bytes compresses well.
    let event: Vec<u8> = (0..1024 * 1024).map(|i| (i % 61) as u8).collect();
    writer.write_event(&event).unwrap();
    writer.close().unwrap();

    let file = read_file(&dir.path().join("compressed.evio"));
    assert_file_invariants(&file);
    let record = &file.records[0];
    assert_eq!(record.header.compression, CompressionType::Lz4Best);
    assert!(record.header.compressed_length < record.header.uncompressed_length);
    assert_eq!(record.events[0], event);
}

#[test]
fn gzip_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let options = WriterOptions {
        compression: CompressionType::Gzip,
        max_event_count: 10,
        ..options_in(&dir)
    };
    let mut writer = EventWriter::to_file("gzipped.evio", options).unwrap();
    let events: Vec<Vec<u8>> = (0..25u8).map(|i| vec![i; 4096]).collect();
    for event in &events {
        writer.write_event(event).unwrap();
    }
    writer.close().unwrap();

    let file = read_file(&dir.path().join("gzipped.evio"));
    assert_file_invariants(&file);
    // max_event_count of 10 forces several records.
    assert!(file.records.len() >= 3);
    assert_eq!(file.all_events(), events);
}

#[test]
fn big_endian_files_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let options = WriterOptions {
        byte_order: ByteOrder::Big,
        ..options_in(&dir)
    };
    let mut writer = EventWriter::to_file("big.evio", options).unwrap();
    let events: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; 32]).collect();
    for event in &events {
        writer.write_event(event).unwrap();
    }
    writer.close().unwrap();

    let file = read_file(&dir.path().join("big.evio"));
    assert_eq!(file.header.byte_order, ByteOrder::Big);
    assert_file_invariants(&file);
    assert_eq!(file.all_events(), events);
}

#[test]
fn dictionary_and_first_event_sit_in_the_file_header() {
    let dir = tempfile::tempdir().unwrap();
    let dictionary = format!("<xmlDict>{}</xmlDict>", "x".repeat(64));
    let options = WriterOptions {
        dictionary: Some(dictionary.clone()),
        first_event: Some(vec![0x11u8; 20]),
        ..options_in(&dir)
    };
    let mut writer = EventWriter::to_file("dict.evio", options).unwrap();
    writer.write_event(&[9u8; 16]).unwrap();
    writer.close().unwrap();

    let file = read_file(&dir.path().join("dict.evio"));
    assert!(file.header.has_dictionary);
    assert!(file.header.has_first_event);
    assert_eq!(file.common_events.len(), 2);
    assert_eq!(file.common_events[0], dictionary.as_bytes());
    assert_eq!(file.common_events[1], vec![0x11u8; 20]);

    // The first record carries the matching bits; the trailer does not.
    assert!(file.records[0].header.has_dictionary);
    assert!(file.records[0].header.has_first_event);
    let trailer = file.trailer.as_ref().unwrap();
    assert!(!trailer.header.has_dictionary);
    assert!(!trailer.header.has_first_event);
}

#[test]
fn set_first_event_after_writing_goes_into_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = EventWriter::to_file("late_first.evio", options_in(&dir)).unwrap();
    writer.write_event(&[1u8; 16]).unwrap();
    writer.flush().unwrap();
    // A record has hit the file: the first event must appear in the body.
    writer.set_first_event(Some(&[0xfeu8; 12])).unwrap();
    writer.close().unwrap();

    let file = read_file(&dir.path().join("late_first.evio"));
    let events = file.all_events();
    assert!(events.contains(&vec![0xfeu8; 12]));
}

#[test]
fn empty_close_still_writes_header_and_trailer() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = EventWriter::to_file("empty.evio", options_in(&dir)).unwrap();
    writer.close().unwrap();

    let path = dir.path().join("empty.evio");
    let file = read_file(&path);
    assert!(file.records.is_empty());
    assert_eq!(file.header.record_count, 0);
    assert!(file.trailer.is_some());
    assert_trailer_position(&path);
}

#[test]
fn existing_file_is_not_overwritten_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("precious.evio");
    std::fs::write(&path, b"do not touch").unwrap();

    match EventWriter::to_file("precious.evio", options_in(&dir)) {
        Err(EvioError::Config(msg)) => assert!(msg.contains("over-writing")),
        other => panic!("expected config error, got {:?}", other.map(|_| ())),
    }
    assert_eq!(std::fs::read(&path).unwrap(), b"do not touch");

    let options = WriterOptions {
        overwrite_ok: true,
        ..options_in(&dir)
    };
    let mut writer = EventWriter::to_file("precious.evio", options).unwrap();
    writer.write_event(&[5u8; 8]).unwrap();
    writer.close().unwrap();
    assert_eq!(read_file(&path).event_count(), 1);
}

#[test]
fn own_record_isolates_an_event() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = EventWriter::to_file("own.evio", options_in(&dir)).unwrap();
    writer.write_event(&[1u8; 8]).unwrap();
    writer.write_event(&[2u8; 8]).unwrap();
    writer.write_event_ext(&[3u8; 8], false, true).unwrap();
    writer.write_event(&[4u8; 8]).unwrap();
    writer.close().unwrap();

    let file = read_file(&dir.path().join("own.evio"));
    assert_file_invariants(&file);
    // Records: [1, 2], [3], [4].
    assert_eq!(file.records.len(), 3);
    assert_eq!(file.records[0].events.len(), 2);
    assert_eq!(file.records[1].events.len(), 1);
    assert_eq!(file.records[1].events[0], vec![3u8; 8]);
    assert_eq!(file.records[2].events.len(), 1);
}

#[test]
fn write_event_to_file_accepts_and_forces() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = EventWriter::to_file("tofile.evio", options_in(&dir)).unwrap();
    assert!(writer.write_event_to_file(&[1u8; 64], false, false).unwrap());
    assert!(writer.write_event_to_file(&[2u8; 64], true, false).unwrap());
    assert!(!writer.is_disk_full());
    writer.close().unwrap();

    let file = read_file(&dir.path().join("tofile.evio"));
    assert_eq!(file.event_count(), 2);
}

#[test]
fn source_id_and_event_type_reach_record_headers() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = EventWriter::to_file("tagged.evio", options_in(&dir)).unwrap();
    writer.set_source_id(17);
    writer.set_event_type(5);
    writer.write_event(&[0u8; 16]).unwrap();
    writer.close().unwrap();

    let file = read_file(&dir.path().join("tagged.evio"));
    assert_eq!(file.records[0].header.user_register1, 17);
    assert_eq!(file.records[0].header.event_type, 5);
}
