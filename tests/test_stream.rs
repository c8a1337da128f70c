// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// AudioStream tests: segment geometry, the writer/reader bracket cycle,
// ring wraparound, and sample sanitization.

use std::sync::atomic::{AtomicUsize, Ordering};

use shmstream::{sanitize, AudioStream, Error, Segment, MAX_STREAM_CHANNELS, MAX_STREAM_LENGTH};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_id(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_stream_{}_{n}", std::process::id())
}

fn ramp(len: usize, offset: f32) -> Vec<f32> {
    (0..len).map(|i| offset + i as f32).collect()
}

// ========== Creation / open ==========

#[test]
fn create_sets_geometry() {
    let id = unique_id("geometry");
    Segment::unlink_by_name(&id);

    let stream = AudioStream::create(&id, 2, 256).expect("create");
    assert_eq!(stream.channels(), 2);
    assert_eq!(stream.length(), 256);
    assert_eq!(stream.counter(), 0);
}

#[test]
fn create_rejects_bad_geometry() {
    let id = unique_id("bad_geometry");
    assert!(matches!(
        AudioStream::create(&id, 0, 256),
        Err(Error::BadArguments)
    ));
    assert!(matches!(
        AudioStream::create(&id, MAX_STREAM_CHANNELS + 1, 256),
        Err(Error::BadArguments)
    ));
    assert!(matches!(
        AudioStream::create(&id, 2, 0),
        Err(Error::BadArguments)
    ));
    assert!(matches!(
        AudioStream::create(&id, 2, MAX_STREAM_LENGTH + 1),
        Err(Error::BadArguments)
    ));
}

#[test]
fn open_nonexistent_is_not_found() {
    let id = unique_id("open_missing");
    Segment::unlink_by_name(&id);
    assert!(matches!(AudioStream::open(&id), Err(Error::NotFound)));
}

#[test]
fn open_takes_geometry_from_header() {
    let id = unique_id("open_geometry");
    Segment::unlink_by_name(&id);

    let writer = AudioStream::create(&id, 4, 512).expect("create");
    let reader = AudioStream::open(&id).expect("open");
    assert_eq!(reader.channels(), 4);
    assert_eq!(reader.length(), 512);
    drop(writer);
}

#[test]
fn reattach_with_other_geometry_is_corrupted() {
    let id = unique_id("reattach");
    Segment::unlink_by_name(&id);

    let _writer = AudioStream::create(&id, 2, 256).expect("create");
    assert!(matches!(
        AudioStream::create(&id, 4, 256),
        Err(Error::Corrupted)
    ));
}

// ========== Bracket discipline ==========

#[test]
fn io_outside_bracket_is_bad_state() {
    let id = unique_id("bracket");
    Segment::unlink_by_name(&id);

    let writer = AudioStream::create(&id, 1, 64).unwrap();
    let block = [0.0f32; 16];
    assert!(matches!(writer.write(0, &block), Err(Error::BadState)));
    assert!(matches!(writer.end(), Err(Error::BadState)));

    writer.begin(16).unwrap();
    assert!(matches!(writer.begin(16), Err(Error::BadState)));
    writer.write(0, &block).unwrap();
    writer.end().unwrap();
    assert!(matches!(writer.end(), Err(Error::BadState)));
}

#[test]
fn begin_checks_block_size() {
    let id = unique_id("block_size");
    Segment::unlink_by_name(&id);

    let writer = AudioStream::create(&id, 1, 64).unwrap();
    assert!(matches!(writer.begin(0), Err(Error::BadArguments)));
    assert!(matches!(writer.begin(65), Err(Error::BadArguments)));
    writer.begin(64).unwrap();
    writer.end().unwrap();
}

#[test]
fn channel_bounds_checked() {
    let id = unique_id("channel_bounds");
    Segment::unlink_by_name(&id);

    let writer = AudioStream::create(&id, 2, 64).unwrap();
    writer.begin(16).unwrap();
    let block = [0.0f32; 16];
    assert!(matches!(writer.write(2, &block), Err(Error::BadArguments)));
    // More samples than the open block.
    let wide = [0.0f32; 32];
    assert!(matches!(writer.write(0, &wide), Err(Error::BadArguments)));
    writer.end().unwrap();
}

#[test]
fn direction_is_enforced() {
    let id = unique_id("direction");
    Segment::unlink_by_name(&id);

    let writer = AudioStream::create(&id, 1, 64).unwrap();
    let reader = AudioStream::open(&id).unwrap();

    writer.begin(8).unwrap();
    let mut buf = [0.0f32; 8];
    assert!(matches!(writer.read(0, &mut buf), Err(Error::BadState)));
    writer.end().unwrap();

    reader.begin(8).unwrap();
    assert!(matches!(reader.write(0, &buf), Err(Error::BadState)));
    reader.end().unwrap();
}

// ========== Data path ==========

#[test]
fn write_then_read_round_trip() {
    let id = unique_id("round_trip");
    Segment::unlink_by_name(&id);

    let writer = AudioStream::create(&id, 2, 256).unwrap();
    let reader = AudioStream::open(&id).unwrap();

    let left = ramp(64, 100.0);
    let right = ramp(64, 500.0);
    writer.begin(64).unwrap();
    writer.write(0, &left).unwrap();
    writer.write(1, &right).unwrap();
    writer.end().unwrap();
    assert_eq!(writer.counter(), 1);

    let mut out = vec![0.0f32; 64];
    reader.begin(64).unwrap();
    reader.read(0, &mut out).unwrap();
    assert_eq!(out, left);
    reader.read(1, &mut out).unwrap();
    assert_eq!(out, right);
    reader.end().unwrap();
}

// Blocks of 6 frames through a 16-frame ring cross the boundary on the
// third block; the reader stays in lockstep and must see every block
// intact.
#[test]
fn wraparound_blocks_survive() {
    let id = unique_id("wrap");
    Segment::unlink_by_name(&id);

    let writer = AudioStream::create(&id, 1, 16).unwrap();
    let reader = AudioStream::open(&id).unwrap();

    let mut out = vec![0.0f32; 6];
    for block in 0..8 {
        let data = ramp(6, block as f32 * 1000.0);
        writer.begin(6).unwrap();
        writer.write(0, &data).unwrap();
        writer.end().unwrap();

        reader.begin(6).unwrap();
        reader.read(0, &mut out).unwrap();
        reader.end().unwrap();
        assert_eq!(out, data, "block {block}");
    }
}

#[test]
fn counter_advances_only_for_writer() {
    let id = unique_id("counter");
    Segment::unlink_by_name(&id);

    let writer = AudioStream::create(&id, 1, 64).unwrap();
    let reader = AudioStream::open(&id).unwrap();

    reader.begin(16).unwrap();
    reader.end().unwrap();
    assert_eq!(writer.counter(), 0);

    for i in 1..=3 {
        writer.begin(16).unwrap();
        writer.end().unwrap();
        assert_eq!(writer.counter(), i);
        assert_eq!(reader.counter(), i);
    }
}

// ========== Sanitization ==========

#[test]
fn sanitize_strips_non_finite() {
    assert_eq!(sanitize(f32::NAN), 0.0);
    assert_eq!(sanitize(f32::INFINITY), 1.0);
    assert_eq!(sanitize(f32::NEG_INFINITY), -1.0);
    assert_eq!(sanitize(1.0e-40), 0.0); // denormal
    assert_eq!(sanitize(-1.0e-40), 0.0);
    assert_eq!(sanitize(0.25), 0.25);
    assert_eq!(sanitize(-3.5), -3.5);
    assert_eq!(sanitize(0.0), 0.0);
}

#[test]
fn write_sanitized_cleans_the_ring() {
    let id = unique_id("sanitized");
    Segment::unlink_by_name(&id);

    let writer = AudioStream::create(&id, 1, 64).unwrap();
    let reader = AudioStream::open(&id).unwrap();

    let dirty = [f32::NAN, f32::INFINITY, f32::NEG_INFINITY, 1.0e-40, 0.25];
    writer.begin(5).unwrap();
    writer.write_sanitized(0, &dirty).unwrap();
    writer.end().unwrap();

    let mut out = [9.0f32; 5];
    reader.begin(5).unwrap();
    reader.read(0, &mut out).unwrap();
    reader.end().unwrap();
    assert_eq!(out, [0.0, 1.0, -1.0, 0.0, 0.25]);
}

#[test]
fn read_sanitized_cleans_dirty_ring() {
    let id = unique_id("read_sanitized");
    Segment::unlink_by_name(&id);

    let writer = AudioStream::create(&id, 1, 64).unwrap();
    let reader = AudioStream::open(&id).unwrap();

    // Raw write leaves the garbage in place; the sanitized read scrubs it.
    let dirty = [f32::NAN, 0.5, f32::INFINITY];
    writer.begin(3).unwrap();
    writer.write(0, &dirty).unwrap();
    writer.end().unwrap();

    let mut out = [9.0f32; 3];
    reader.begin(3).unwrap();
    reader.read_sanitized(0, &mut out).unwrap();
    reader.end().unwrap();
    assert_eq!(out, [0.0, 0.5, 1.0]);
}
