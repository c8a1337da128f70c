// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Publishes a 440 Hz sine stream under a name.
//
// Usage: demo_publish [stream_name]
//
// Pair with demo_subscribe in another process to watch the stream
// arrive, stall (stop this process with ^Z), and recover.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use shmstream::rt::{audio_period_ns, promote_rt_thread};
use shmstream::{AudioSend, CatalogFactory, SharedCatalogFactory};

const SAMPLE_RATE: u32 = 48000;
const BLOCK: u32 = 256;
const CHANNELS: u32 = 2;
const RING: u32 = 2048;

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
    let send = AudioSend::new();
    send.attach(&catalog);
    assert!(send.publish(&name, CHANNELS, RING), "publish request");

    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGINT, on_signal as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as *const () as libc::sighandler_t);
    }

    let period = audio_period_ns(SAMPLE_RATE, BLOCK);
    if promote_rt_thread(period) {
        println!("publish[{name}]: real-time priority set (period={period} ns)");
    } else {
        println!("publish[{name}]: running without RT priority");
    }
    println!(
        "publish[{name}]: entering render loop (pid={})",
        std::process::id()
    );

    let mut left = [0.0f32; BLOCK as usize];
    let mut right = [0.0f32; BLOCK as usize];
    let mut phase = 0.0f32;
    let step = 2.0 * std::f32::consts::PI * 440.0 / SAMPLE_RATE as f32;
    let callback_period = Duration::from_nanos(period);
    let mut next_wake = Instant::now();
    let mut blocks: u64 = 0;

    while RUNNING.load(Ordering::Relaxed) {
        for i in 0..BLOCK as usize {
            let s = phase.sin();
            phase += step;
            if phase > 2.0 * std::f32::consts::PI {
                phase -= 2.0 * std::f32::consts::PI;
            }
            left[i] = s * 0.5;
            right[i] = s * 0.25;
        }

        if send.begin(BLOCK).is_ok() {
            let _ = send.write(0, &left);
            let _ = send.write(1, &right);
            let _ = send.end();
        }

        blocks += 1;
        if blocks % (SAMPLE_RATE as u64 / BLOCK as u64) == 0 {
            println!(
                "publish[{name}]: {blocks} blocks, active={} overridden={}",
                send.active(),
                send.overridden()
            );
        }

        next_wake += callback_period;
        let now = Instant::now();
        if next_wake > now {
            std::thread::sleep(next_wake - now);
        } else {
            next_wake = now;
        }
    }

    send.revoke();
    send.detach();
    println!("publish[{name}]: shutting down");
}

#[cfg(unix)]
extern crate libc;
