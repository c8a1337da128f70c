// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Segment tests: open modes, cross-handle data visibility, the trailing
// reference counter, and last-unmapper unlink behavior.

use std::sync::atomic::{AtomicUsize, Ordering};

use shmstream::{Segment, SegmentMode};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = format!("{prefix}_seg_{}_{n}", std::process::id());
    Segment::unlink_by_name(&name);
    name
}

// ========== Open modes ==========

#[test]
fn create_maps_requested_size() {
    let name = unique_name("create");
    let seg = Segment::acquire(&name, 1024, SegmentMode::Create).expect("create");
    assert!(seg.user_size() >= 1024);
    assert!(seg.mapped_size() > seg.user_size());
    assert!(!seg.as_ptr().is_null());
    assert!(seg.created());
}

#[test]
fn create_exclusive_fails_when_present() {
    let name = unique_name("create_excl");
    let _first = Segment::acquire(&name, 256, SegmentMode::Create).expect("first create");
    assert!(Segment::acquire(&name, 256, SegmentMode::Create).is_err());
}

#[test]
fn open_nonexistent_fails() {
    let name = unique_name("open_missing");
    assert!(Segment::acquire(&name, 0, SegmentMode::Open).is_err());
}

#[test]
fn open_discovers_size_from_creator() {
    let name = unique_name("open_size");
    let creator = Segment::acquire(&name, 4096, SegmentMode::CreateOrOpen).expect("create");
    assert!(creator.created());

    // Open mode ignores the size argument entirely.
    let opener = Segment::acquire(&name, 0, SegmentMode::Open).expect("open");
    assert!(!opener.created());
    assert!(opener.user_size() >= 4096);
    assert_eq!(opener.mapped_size(), creator.mapped_size());
}

#[test]
fn create_or_open_attaches_to_existing() {
    let name = unique_name("both");
    let first = Segment::acquire(&name, 2048, SegmentMode::CreateOrOpen).expect("first");
    let second = Segment::acquire(&name, 2048, SegmentMode::CreateOrOpen).expect("second");
    assert!(first.created());
    assert!(!second.created());
}

#[test]
fn empty_name_fails() {
    assert!(Segment::acquire("", 256, SegmentMode::CreateOrOpen).is_err());
}

#[test]
fn zero_size_fails_outside_open_mode() {
    let name = unique_name("zero");
    assert!(Segment::acquire(&name, 0, SegmentMode::Create).is_err());
    assert!(Segment::acquire(&name, 0, SegmentMode::CreateOrOpen).is_err());
}

// ========== Shared data ==========

#[test]
fn data_is_visible_across_handles() {
    let name = unique_name("visible");
    let writer = Segment::acquire(&name, 512, SegmentMode::CreateOrOpen).unwrap();
    let reader = Segment::acquire(&name, 512, SegmentMode::CreateOrOpen).unwrap();

    let payload = b"stream segment payload";
    unsafe {
        std::ptr::copy_nonoverlapping(payload.as_ptr(), writer.as_mut_ptr(), payload.len());
    }
    let read_back = unsafe { std::slice::from_raw_parts(reader.as_ptr(), payload.len()) };
    assert_eq!(read_back, payload);
}

#[test]
fn struct_round_trip_across_handles() {
    let name = unique_name("structured");

    #[repr(C)]
    struct Header {
        magic: u32,
        frames: u32,
    }

    let writer = Segment::acquire(&name, 64, SegmentMode::CreateOrOpen).unwrap();
    unsafe {
        std::ptr::write(
            writer.as_mut_ptr() as *mut Header,
            Header {
                magic: 0x73415544,
                frames: 512,
            },
        );
    }

    let reader = Segment::acquire(&name, 0, SegmentMode::Open).unwrap();
    let header = unsafe { &*(reader.as_ptr() as *const Header) };
    assert_eq!(header.magic, 0x73415544);
    assert_eq!(header.frames, 512);
}

#[test]
fn fresh_segments_are_zero_filled() {
    let name = unique_name("zeroed");
    let seg = Segment::acquire(&name, 256, SegmentMode::Create).unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(seg.as_ptr(), 256) };
    assert!(bytes.iter().all(|&b| b == 0));
}

// ========== Reference counting ==========

#[test]
fn ref_count_tracks_handles() {
    let name = unique_name("refs");
    let h1 = Segment::acquire(&name, 512, SegmentMode::CreateOrOpen).unwrap();
    assert_eq!(h1.ref_count(), 1);

    let h2 = Segment::acquire(&name, 512, SegmentMode::CreateOrOpen).unwrap();
    assert_eq!(h1.ref_count(), 2);
    assert_eq!(h2.ref_count(), 2);

    let h3 = Segment::acquire(&name, 512, SegmentMode::CreateOrOpen).unwrap();
    assert_eq!(h1.ref_count(), 3);

    drop(h3);
    assert_eq!(h1.ref_count(), 2);
    drop(h2);
    assert_eq!(h1.ref_count(), 1);
}

#[cfg(unix)]
#[test]
fn last_unmapper_unlinks() {
    let name = unique_name("unlink");
    {
        let _seg = Segment::acquire(&name, 256, SegmentMode::CreateOrOpen).unwrap();
    }
    assert!(Segment::acquire(&name, 0, SegmentMode::Open).is_err());
}

#[test]
fn data_survives_while_any_handle_lives() {
    let name = unique_name("survives");
    let payload = b"still here";

    let first = Segment::acquire(&name, 128, SegmentMode::CreateOrOpen).unwrap();
    unsafe {
        std::ptr::copy_nonoverlapping(payload.as_ptr(), first.as_mut_ptr(), payload.len());
    }
    let keeper = Segment::acquire(&name, 128, SegmentMode::CreateOrOpen).unwrap();
    drop(first);

    let late = Segment::acquire(&name, 128, SegmentMode::CreateOrOpen).unwrap();
    let read_back = unsafe { std::slice::from_raw_parts(late.as_ptr(), payload.len()) };
    assert_eq!(read_back, payload);
    drop(keeper);
}

#[test]
fn various_sizes_map() {
    for &size in &[1usize, 4, 7, 64, 65, 255, 4096, 65536] {
        let name = unique_name(&format!("size_{size}"));
        let seg = Segment::acquire(&name, size, SegmentMode::CreateOrOpen)
            .unwrap_or_else(|e| panic!("size {size}: {e}"));
        assert!(seg.user_size() >= size);
    }
}
