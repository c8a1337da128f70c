// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Real-time thread promotion for audio pacing loops.

/// Audio callback period in nanoseconds for a given rate and block size.
pub fn audio_period_ns(sample_rate: u32, frames_per_buffer: u32) -> u64 {
    (frames_per_buffer as u64) * 1_000_000_000 / (sample_rate as u64)
}

/// Promote the calling thread to real-time priority. Best-effort;
/// returns `true` on success.
///
/// `period_ns` is the nominal time between callbacks (see
/// [`audio_period_ns`]); only the macOS policy consumes it.
pub fn promote_rt_thread(period_ns: u64) -> bool {
    #[cfg(target_os = "macos")]
    {
        promote_macos(period_ns)
    }
    #[cfg(target_os = "linux")]
    {
        let _ = period_ns;
        promote_linux()
    }
    #[cfg(windows)]
    {
        let _ = period_ns;
        promote_windows()
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", windows)))]
    {
        let _ = period_ns;
        false
    }
}

// ---------------------------------------------------------------------------
// macOS — Mach thread time constraint policy
// ---------------------------------------------------------------------------

#[cfg(target_os = "macos")]
fn promote_macos(period_ns: u64) -> bool {
    #[repr(C)]
    struct MachTimebaseInfo {
        numer: u32,
        denom: u32,
    }

    extern "C" {
        fn mach_timebase_info(info: *mut MachTimebaseInfo) -> i32;
        fn pthread_mach_thread_np(thread: libc::pthread_t) -> u32; // mach_port_t
        fn thread_policy_set(thread: u32, flavor: u32, policy_info: *const u32, count: u32) -> i32;
    }

    const THREAD_TIME_CONSTRAINT_POLICY: u32 = 2;
    const THREAD_TIME_CONSTRAINT_POLICY_COUNT: u32 = 4;

    #[repr(C)]
    struct ThreadTimeConstraintPolicy {
        period: u32,
        computation: u32,
        constraint: u32,
        preemptible: i32, // boolean_t
    }

    let mut tb = MachTimebaseInfo { numer: 0, denom: 0 };
    unsafe {
        mach_timebase_info(&mut tb);
    }
    if tb.numer == 0 || tb.denom == 0 {
        return false;
    }

    let to_abs = |ns: u64| -> u32 { ((ns * tb.denom as u64) / tb.numer as u64) as u32 };

    let policy = ThreadTimeConstraintPolicy {
        period: to_abs(period_ns),
        computation: to_abs(period_ns / 2),
        constraint: to_abs(period_ns),
        preemptible: 1,
    };

    let kr = unsafe {
        let mach_thread = pthread_mach_thread_np(libc::pthread_self());
        thread_policy_set(
            mach_thread,
            THREAD_TIME_CONSTRAINT_POLICY,
            &policy as *const _ as *const u32,
            THREAD_TIME_CONSTRAINT_POLICY_COUNT,
        )
    };
    kr == 0 // KERN_SUCCESS
}

// ---------------------------------------------------------------------------
// Linux — SCHED_FIFO (requires CAP_SYS_NICE or root)
// ---------------------------------------------------------------------------

#[cfg(target_os = "linux")]
fn promote_linux() -> bool {
    // SCHED_FIFO with priority 80 is a common RT audio choice.
    let param = libc::sched_param { sched_priority: 80 };
    let ret =
        unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    ret == 0
}

// ---------------------------------------------------------------------------
// Windows — TIME_CRITICAL thread priority
// ---------------------------------------------------------------------------

#[cfg(windows)]
fn promote_windows() -> bool {
    use windows_sys::Win32::System::Threading::{
        GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_TIME_CRITICAL,
    };
    unsafe { SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_TIME_CRITICAL) != 0 }
}
