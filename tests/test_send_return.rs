// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// AudioSend / AudioReturn tests: the publish/subscribe protocol driven
// through manual catalog service passes, stall detection, override
// semantics, and teardown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use shmstream::{
    AudioReturn, AudioSend, Catalog, ConnectionStatus, Error, Segment, STALL_THRESHOLD,
    STREAM_MAGIC,
};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn test_catalog(prefix: &str) -> Arc<Catalog> {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let domain = format!("{prefix}{}_{n}", std::process::id() % 100_000);
    Segment::unlink_by_name(&format!("shmstream.catalog.{domain}"));
    Arc::new(Catalog::open(&domain).unwrap())
}

fn ramp(len: usize, offset: f32) -> Vec<f32> {
    (0..len).map(|i| offset + i as f32).collect()
}

// ========== Publish lifecycle ==========

#[test]
fn publish_resolves_through_service() {
    let catalog = test_catalog("pub");
    let send = AudioSend::new();
    send.attach(&catalog);
    assert!(send.attached());

    assert!(send.publish("tone", 2, 1024));
    assert_eq!(send.status(), ConnectionStatus::Updating);
    assert!(!send.active());

    catalog.service();
    assert!(send.active());
    assert_eq!(send.name().as_str(), "tone");
    assert_eq!(send.channels(), 2);
    assert_eq!(send.length(), 1024);

    let record = catalog.get("tone").unwrap();
    assert_eq!(record.magic, STREAM_MAGIC);
    assert_eq!(record.version, 1);
}

#[test]
fn publish_rejects_bad_params() {
    let send = AudioSend::new();
    assert!(!send.publish("", 2, 1024));
    assert!(!send.publish("ok", 0, 1024));
    assert!(!send.publish("ok", 2, 0));
    assert!(!send.publish(&"n".repeat(64), 2, 1024));
}

#[test]
fn rapid_publishes_last_write_wins() {
    let catalog = test_catalog("lww");
    let send = AudioSend::new();
    send.attach(&catalog);

    assert!(send.publish("first", 1, 512));
    assert!(send.publish("second", 1, 512));
    assert!(send.publish("third", 1, 512));
    catalog.service();

    assert!(send.active());
    assert_eq!(send.name().as_str(), "third");
    assert!(catalog.get("third").is_ok());
    // Superseded requests never reached the catalog.
    assert!(matches!(catalog.get("first"), Err(Error::NotFound)));
    assert!(matches!(catalog.get("second"), Err(Error::NotFound)));
}

#[test]
fn revoke_goes_inactive() {
    let catalog = test_catalog("revoke");
    let send = AudioSend::new();
    send.attach(&catalog);

    send.publish("transient", 2, 512);
    catalog.service();
    assert!(send.active());

    assert!(send.revoke());
    catalog.service();
    assert_eq!(send.status(), ConnectionStatus::Inactive);
    assert!(!send.active());
}

#[test]
fn mark_for_republish_re_reserves() {
    let catalog = test_catalog("repub");
    let send = AudioSend::new();
    send.attach(&catalog);

    send.publish("layout", 2, 512);
    catalog.service();
    assert_eq!(catalog.get("layout").unwrap().version, 1);

    send.mark_for_republish();
    catalog.service();
    assert!(send.active());
    assert_eq!(catalog.get("layout").unwrap().version, 2);
}

// ========== RT bracket semantics ==========

#[test]
fn writes_without_stream_are_no_ops() {
    let send = AudioSend::new();
    let block = [0.0f32; 32];

    // Unattached and unresolved: bracketed writes still succeed.
    send.begin(32).unwrap();
    send.write(0, &block).unwrap();
    send.write_sanitized(0, &block).unwrap();
    send.end().unwrap();
}

#[test]
fn bracket_discipline_is_enforced() {
    let send = AudioSend::new();
    let block = [0.0f32; 16];

    assert!(matches!(send.write(0, &block), Err(Error::BadState)));
    assert!(matches!(send.end(), Err(Error::BadState)));

    send.begin(16).unwrap();
    assert!(matches!(send.begin(16), Err(Error::BadState)));
    send.end().unwrap();
    assert!(matches!(send.end(), Err(Error::BadState)));

    let ret = AudioReturn::new();
    let mut buf = [0.0f32; 16];
    assert!(matches!(ret.read(0, &mut buf), Err(Error::BadState)));
    assert!(matches!(ret.end(), Err(Error::BadState)));
    ret.begin(16).unwrap();
    assert!(matches!(ret.begin(16), Err(Error::BadState)));
    ret.end().unwrap();
}

#[test]
fn unresolved_return_reads_zeros() {
    let catalog = test_catalog("zeros");
    let ret = AudioReturn::new();
    ret.attach(&catalog);
    ret.connect("nowhere");
    catalog.service();
    assert!(!ret.active());

    let mut buf = [7.0f32; 64];
    ret.begin(64).unwrap();
    ret.read(0, &mut buf).unwrap();
    assert!(buf.iter().all(|&s| s == 0.0));

    buf.fill(7.0);
    ret.read_sanitized(0, &mut buf).unwrap();
    assert!(buf.iter().all(|&s| s == 0.0));
    ret.end().unwrap();
}

// ========== End-to-end data path ==========

#[test]
fn send_to_return_round_trip() {
    let catalog = test_catalog("e2e");
    let send = AudioSend::new();
    send.attach(&catalog);
    let ret = AudioReturn::new();
    ret.attach(&catalog);

    send.publish("send_a", 2, 512);
    ret.connect("send_a");
    catalog.service();
    assert!(send.active());
    assert!(ret.active());

    let left = ramp(128, 1.0);
    let right = ramp(128, -1000.0);
    send.begin(128).unwrap();
    send.write(0, &left).unwrap();
    send.write(1, &right).unwrap();
    send.end().unwrap();

    let mut out = vec![0.0f32; 128];
    ret.begin(128).unwrap();
    ret.read(0, &mut out).unwrap();
    assert_eq!(out, left);
    ret.read(1, &mut out).unwrap();
    assert_eq!(out, right);
    ret.end().unwrap();
    assert!(ret.active());
}

#[test]
fn late_publisher_is_picked_up() {
    let catalog = test_catalog("late");
    // Return attaches (and is serviced) first.
    let ret = AudioReturn::new();
    ret.attach(&catalog);
    ret.connect("later");
    catalog.service();
    assert!(!ret.active());

    let send = AudioSend::new();
    send.attach(&catalog);
    send.publish("later", 1, 512);
    catalog.service();
    catalog.service();
    assert!(send.active());
    assert!(ret.active());
}

// ========== Stall detection ==========

#[test]
fn stall_threshold_is_exact() {
    let catalog = test_catalog("stall");
    let send = AudioSend::new();
    send.attach(&catalog);
    let ret = AudioReturn::new();
    ret.attach(&catalog);

    send.publish("quiet", 1, 2048);
    ret.connect("quiet");
    catalog.service();
    assert!(ret.active());

    // Blocks above 512 frames are clamped to 512, so the threshold is
    // reached on exactly the 128th silent callback.
    let cycles = STALL_THRESHOLD / 512;
    for i in 0..cycles - 1 {
        ret.begin(1024).unwrap();
        ret.end().unwrap();
        assert!(!ret.stalled(), "stalled too early at cycle {i}");
    }
    ret.begin(1024).unwrap();
    ret.end().unwrap();
    assert!(ret.stalled());

    // One committed block revives the connection immediately.
    send.begin(64).unwrap();
    send.end().unwrap();
    ret.begin(64).unwrap();
    ret.end().unwrap();
    assert!(ret.active());
    assert!(!ret.stalled());

    // And the stall counter restarted from zero.
    ret.begin(1024).unwrap();
    ret.end().unwrap();
    assert!(!ret.stalled());
}

#[test]
fn keep_alive_outlives_a_silent_producer() {
    let catalog = test_catalog("silent");
    let send = AudioSend::new();
    send.attach(&catalog);
    let ret = AudioReturn::new();
    ret.attach(&catalog);

    send.publish("heartbeat", 1, 512);
    ret.connect("heartbeat");
    catalog.service();
    assert!(ret.active());

    // Producer goes away entirely; the subscriber's keep_alive still
    // refreshes the record, so it survives a TTL sweep.
    send.detach();
    std::thread::sleep(Duration::from_secs(2));
    catalog.service();
    assert_eq!(catalog.gc(Duration::from_secs(1)), 0);
    assert!(catalog.get("heartbeat").is_ok());
}

// ========== Override ==========

#[test]
fn second_publisher_overrides_first() {
    let catalog = test_catalog("override");
    let send_a = AudioSend::new();
    send_a.attach(&catalog);
    send_a.publish("shared_bus", 2, 512);
    catalog.service();
    assert!(send_a.active());

    let send_c = AudioSend::new();
    send_c.attach(&catalog);
    send_c.publish("shared_bus", 2, 512);
    catalog.service();
    catalog.service();

    assert!(send_c.active());
    assert!(send_a.overridden());
    assert!(!send_a.active());

    // The override half still writes as a no-op without complaint.
    let block = [0.0f32; 64];
    send_a.begin(64).unwrap();
    send_a.write(0, &block).unwrap();
    send_a.end().unwrap();
}

#[test]
fn republish_recovers_from_override() {
    let catalog = test_catalog("reclaim");
    let send_a = AudioSend::new();
    send_a.attach(&catalog);
    let send_c = AudioSend::new();
    send_c.attach(&catalog);

    send_a.publish("contested", 1, 512);
    catalog.service();
    send_c.publish("contested", 1, 512);
    catalog.service();
    catalog.service();
    assert!(send_a.overridden());

    // Publishing again takes the slot back.
    send_a.publish("contested", 1, 512);
    catalog.service();
    catalog.service();
    assert!(send_a.active());
    assert!(send_c.overridden());
}

// ========== Teardown ==========

#[test]
fn detach_is_idempotent() {
    let catalog = test_catalog("teardown");
    let send = AudioSend::new();
    send.attach(&catalog);
    send.publish("gone", 1, 512);
    catalog.service();
    assert!(send.active());
    assert_eq!(catalog.client_count(), 1);

    send.detach();
    send.detach();
    assert!(!send.attached());
    assert!(!send.active());
    assert_eq!(catalog.client_count(), 0);

    let ret = AudioReturn::new();
    ret.attach(&catalog);
    ret.detach();
    ret.detach();
    assert!(!ret.attached());
}

#[test]
fn drop_detaches() {
    let catalog = test_catalog("drop");
    {
        let send = AudioSend::new();
        send.attach(&catalog);
        let ret = AudioReturn::new();
        ret.attach(&catalog);
        assert_eq!(catalog.client_count(), 2);
    }
    assert_eq!(catalog.client_count(), 0);
}

// ========== Concurrency smoke ==========

// One writer thread, one reader thread, maintenance running hot, with
// mid-flight republishes superseding the installed handle. Exercises the
// handle hand-off under real contention; the assertion is simply that
// every cycle completes and every read is finite.
#[test]
fn concurrent_cycles_with_maintenance() {
    let catalog = test_catalog("stress");
    catalog.start_maintenance(Duration::from_millis(1)).unwrap();

    let send = AudioSend::new();
    send.attach(&catalog);
    send.publish("torture", 2, 2048);

    let ret = AudioReturn::new();
    ret.attach(&catalog);
    ret.connect("torture");

    let writer = std::thread::spawn(move || {
        let block = ramp(128, 0.25);
        for cycle in 0..500u32 {
            send.begin(128).unwrap();
            send.write(0, &block).unwrap();
            send.write_sanitized(1, &block).unwrap();
            send.end().unwrap();
            if cycle % 100 == 99 {
                send.publish("torture", 2, 2048);
            }
            std::thread::sleep(Duration::from_micros(50));
        }
        send.detach();
    });

    let mut buf = vec![0.0f32; 128];
    for _ in 0..500 {
        ret.begin(128).unwrap();
        ret.read_sanitized(0, &mut buf).unwrap();
        assert!(buf.iter().all(|s| s.is_finite()));
        ret.read_sanitized(1, &mut buf).unwrap();
        assert!(buf.iter().all(|s| s.is_finite()));
        ret.end().unwrap();
        std::thread::sleep(Duration::from_micros(50));
    }
    ret.detach();

    writer.join().unwrap();
    catalog.stop_maintenance();
}
