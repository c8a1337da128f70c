// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Subscribes to a named stream and reports RMS level plus stall status.
//
// Usage: demo_subscribe [stream_name]

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use shmstream::rt::{audio_period_ns, promote_rt_thread};
use shmstream::{AudioReturn, CatalogFactory, SharedCatalogFactory};

const SAMPLE_RATE: u32 = 48000;
const BLOCK: u32 = 256;
const CHANNELS: usize = 2;

static RUNNING: AtomicBool = AtomicBool::new(true);

#[cfg(unix)]
extern "C" fn on_signal(_: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let name = args
        .get(1)
        .cloned()
        .unwrap_or_else(|| "demo_stream".to_string());

    let factory = SharedCatalogFactory::new("demo");
    let catalog = factory.acquire().expect("catalog");
    let ret = AudioReturn::new();
    ret.attach(&catalog);
    assert!(ret.connect(&name), "connect request");

    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGINT, on_signal as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as *const () as libc::sighandler_t);
    }

    let period = audio_period_ns(SAMPLE_RATE, BLOCK);
    if promote_rt_thread(period) {
        println!("subscribe[{name}]: real-time priority set (period={period} ns)");
    } else {
        println!("subscribe[{name}]: running without RT priority");
    }
    println!(
        "subscribe[{name}]: entering pull loop (pid={})",
        std::process::id()
    );

    let mut bufs = [[0.0f32; BLOCK as usize]; CHANNELS];
    let callback_period = Duration::from_nanos(period);
    let mut next_wake = Instant::now();
    let mut accum = 0.0f64;
    let mut accum_frames: u64 = 0;
    let mut blocks: u64 = 0;

    while RUNNING.load(Ordering::Relaxed) {
        if ret.begin(BLOCK).is_ok() {
            for (ch, buf) in bufs.iter_mut().enumerate() {
                let _ = ret.read_sanitized(ch as u32, buf);
                for &s in buf.iter() {
                    accum += (s as f64) * (s as f64);
                }
            }
            let _ = ret.end();
            accum_frames += BLOCK as u64 * CHANNELS as u64;
        }

        blocks += 1;
        if blocks % (SAMPLE_RATE as u64 / BLOCK as u64) == 0 {
            let rms = if accum_frames > 0 {
                (accum / accum_frames as f64).sqrt()
            } else {
                0.0
            };
            println!(
                "subscribe[{name}]: rms={rms:.4} active={} stalled={}",
                ret.active(),
                ret.stalled()
            );
            accum = 0.0;
            accum_frames = 0;
        }

        next_wake += callback_period;
        let now = Instant::now();
        if next_wake > now {
            std::thread::sleep(next_wake - now);
        } else {
            next_wake = now;
        }
    }

    ret.disconnect();
    ret.detach();
    println!("subscribe[{name}]: shutting down");
}

#[cfg(unix)]
extern crate libc;
