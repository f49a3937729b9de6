//! Buffer-target writing: one data record plus a trailer in a
//! caller-supplied buffer.

mod common;

use common::{read_records, ReadRecord};
use rust_evio::format::{ByteOrder, HeaderType, HEADER_SIZE_BYTES, HEADER_SIZE_WORDS};
use rust_evio::{CompressionType, EventWriter, EvioError, WriterOptions};

fn parse_buffer(bytes: &[u8], order: ByteOrder) -> (Vec<ReadRecord>, Option<ReadRecord>) {
    let (records, trailer, _) = read_records(bytes, 0, order);
    (records, trailer)
}

#[test]
fn three_small_events_and_bare_trailer() {
    // Three 16-byte events: 14 header words + 3 index words + 12 payload
    // words = 29 words, followed by a 14-word trailer.
    let options = WriterOptions {
        add_trailer_index: false,
        ..Default::default()
    };
    let mut writer = EventWriter::to_buffer(Vec::with_capacity(4096), options).unwrap();
    for i in 0..3u8 {
        assert!(writer.write_event(&[i; 16]).unwrap());
    }
    writer.close().unwrap();

    let buffer = writer.take_buffer().unwrap();
    assert_eq!(buffer.len(), (29 + 14) * 4);

    let (records, trailer) = parse_buffer(&buffer, ByteOrder::Little);
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.header.record_length_words, 29);
    assert_eq!(record.header.event_count, 3);
    assert_eq!(record.header.uncompressed_length, 48);
    assert_eq!(record.events[1], vec![1u8; 16]);

    let trailer = trailer.expect("trailer present");
    assert_eq!(trailer.header.record_length_words, HEADER_SIZE_WORDS);
    assert_eq!(trailer.header.header_type, HeaderType::Trailer);
    assert!(trailer.header.is_last);
}

#[test]
fn trailer_index_describes_the_record() {
    let mut writer =
        EventWriter::to_buffer(Vec::with_capacity(4096), WriterOptions::default()).unwrap();
    assert!(writer.write_event(&[7u8; 24]).unwrap());
    writer.close().unwrap();

    let buffer = writer.take_buffer().unwrap();
    let (records, trailer, index) = read_records(&buffer, 0, ByteOrder::Little);
    assert_eq!(records.len(), 1);
    assert!(trailer.is_some());
    assert_eq!(index.len(), 1);
    assert_eq!(index[0].0, records[0].header.record_length_bytes());
    assert_eq!(index[0].1, 1);
}

#[test]
fn refuses_events_that_overflow_the_buffer() {
    // Room for the first event but not a second one of the same size.
    let options = WriterOptions {
        add_trailer_index: false,
        ..Default::default()
    };
    let mut writer = EventWriter::to_buffer(Vec::with_capacity(256), options).unwrap();
    assert!(writer.write_event(&[1u8; 100]).unwrap());
    assert!(!writer.write_event(&[2u8; 100]).unwrap());

    writer.close().unwrap();
    let buffer = writer.take_buffer().unwrap();
    let (records, trailer) = parse_buffer(&buffer, ByteOrder::Little);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].events.len(), 1);
    assert!(trailer.is_some());
}

#[test]
fn close_is_idempotent_and_write_after_close_errors() {
    let mut writer =
        EventWriter::to_buffer(Vec::with_capacity(1024), WriterOptions::default()).unwrap();
    writer.write_event(&[0u8; 8]).unwrap();
    writer.close().unwrap();
    let first = writer.buffer().unwrap().to_vec();
    writer.close().unwrap();
    assert_eq!(writer.buffer().unwrap(), &first[..]);

    match writer.write_event(&[0u8; 8]) {
        Err(EvioError::State(_)) => {}
        other => panic!("expected state error, got {:?}", other),
    }
}

#[test]
fn set_buffer_rearms_a_closed_writer() {
    let mut writer =
        EventWriter::to_buffer(Vec::with_capacity(1024), WriterOptions::default()).unwrap();

    // Not legal while open.
    assert!(matches!(
        writer.set_buffer(Vec::with_capacity(1024)),
        Err(EvioError::State(_))
    ));

    writer.write_event(&[1u8; 8]).unwrap();
    writer.close().unwrap();
    let first = writer.take_buffer().unwrap();
    assert!(!first.is_empty());

    writer.set_buffer_with(Vec::with_capacity(1024), 5).unwrap();
    assert!(!writer.is_closed());
    writer.write_event(&[2u8; 8]).unwrap();
    writer.close().unwrap();

    let second = writer.take_buffer().unwrap();
    let (records, _) = parse_buffer(&second, ByteOrder::Little);
    assert_eq!(records[0].header.record_number, 5);
    assert_eq!(records[0].events[0], vec![2u8; 8]);
}

#[test]
fn dictionary_and_first_event_live_in_the_record_user_header() {
    let dictionary = format!("<xmlDict>{}</xmlDict>", "d".repeat(48));
    let options = WriterOptions {
        dictionary: Some(dictionary.clone()),
        first_event: Some(vec![0xeeu8; 12]),
        ..Default::default()
    };
    let mut writer = EventWriter::to_buffer(Vec::with_capacity(4096), options).unwrap();
    writer.write_event(&[3u8; 16]).unwrap();
    writer.close().unwrap();

    let buffer = writer.take_buffer().unwrap();
    let (records, _) = parse_buffer(&buffer, ByteOrder::Little);
    let record = &records[0];
    assert!(record.header.has_dictionary);
    assert!(record.header.has_first_event);
    assert!(!record.user_header.is_empty());

    // The user header is itself a record holding dictionary + first event.
    let (common, _) = common::read_record(&record.user_header, 0, ByteOrder::Little);
    assert_eq!(common.events.len(), 2);
    assert_eq!(common.events[0], dictionary.as_bytes());
    assert_eq!(common.events[1], vec![0xeeu8; 12]);
}

#[test]
fn trailer_alone_when_no_events_written() {
    let mut writer =
        EventWriter::to_buffer(Vec::with_capacity(256), WriterOptions::default()).unwrap();
    writer.close().unwrap();
    let buffer = writer.take_buffer().unwrap();
    // Trailer with an empty index.
    assert_eq!(buffer.len(), HEADER_SIZE_BYTES);
    let (records, trailer) = parse_buffer(&buffer, ByteOrder::Little);
    assert!(records.is_empty());
    assert!(trailer.is_some());
}

#[test]
fn compressed_buffer_round_trips() {
    let options = WriterOptions {
        compression: CompressionType::Gzip,
        ..Default::default()
    };
    let mut writer = EventWriter::to_buffer(Vec::with_capacity(1 << 20), options).unwrap();
    let event: Vec<u8> = (0..2048u32).flat_map(|i| (i % 251).to_le_bytes()).collect();
    writer.write_event(&event).unwrap();
    writer.close().unwrap();

    let buffer = writer.take_buffer().unwrap();
    let (records, _) = parse_buffer(&buffer, ByteOrder::Little);
    assert!(records[0].header.compressed_length < records[0].header.uncompressed_length);
    assert_eq!(records[0].events[0], event);
}
