// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Single-producer single-consumer byte ring for length-prefixed OSC
// control events, carried out-of-band next to the audio streams.
//
// A message is stored as [u32 big-endian length][payload]; both the
// prefix and the payload wrap circularly. The atomic `size` counter is
// the occupancy gate and the only fence between producer and consumer:
// it is increased (Release) only after the full record is written, and
// decreased (Release) only after the record is copied out.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};

const LEN_PREFIX: u32 = 4;

/// Fixed-capacity SPSC ring buffer for OSC-encoded control events.
///
/// Exactly one producer thread may call `submit*`, exactly one consumer
/// thread may call `fetch`/`skip`. Neither side locks; capacity is fixed
/// at creation and must be a non-zero multiple of 4.
pub struct OscRing {
    data: UnsafeCell<Box<[u8]>>,
    capacity: u32,
    head: UnsafeCell<u32>, // consumer cursor
    tail: UnsafeCell<u32>, // producer cursor
    size: AtomicU32,
    scratch: UnsafeCell<Vec<u8>>, // producer-side encode buffer
}

// Safety: single producer / single consumer by contract. The producer
// owns `tail` and `scratch`, the consumer owns `head`; the regions of
// `data` each side touches are disjoint, separated by the `size` gate.
unsafe impl Send for OscRing {}
unsafe impl Sync for OscRing {}

fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

fn put_padded_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn put_type_tags(buf: &mut Vec<u8>, tags: &str) {
    buf.push(b',');
    buf.extend_from_slice(tags.as_bytes());
    buf.push(0);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

impl OscRing {
    /// Create a ring of `capacity` bytes (non-zero multiple of 4).
    pub fn with_capacity(capacity: u32) -> Result<Self> {
        if capacity == 0 || capacity % 4 != 0 {
            return Err(Error::BadArguments);
        }
        Ok(Self {
            data: UnsafeCell::new(vec![0u8; capacity as usize].into_boxed_slice()),
            capacity,
            head: UnsafeCell::new(0),
            tail: UnsafeCell::new(0),
            size: AtomicU32::new(0),
            scratch: UnsafeCell::new(Vec::new()),
        })
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Bytes currently stored (including length prefixes).
    pub fn used(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.used() == 0
    }

    // --- circular copies -------------------------------------------------

    /// # Safety
    /// Producer-only; the target region must be unoccupied per `size`.
    unsafe fn copy_in(&self, at: u32, src: &[u8]) {
        let data = &mut *self.data.get();
        let at = at as usize;
        let first = src.len().min(self.capacity as usize - at);
        data[at..at + first].copy_from_slice(&src[..first]);
        if first < src.len() {
            data[..src.len() - first].copy_from_slice(&src[first..]);
        }
    }

    /// # Safety
    /// Consumer-only; the source region must be occupied per `size`.
    unsafe fn copy_out(&self, at: u32, dst: &mut [u8]) {
        let data = &*self.data.get();
        let at = at as usize;
        let first = dst.len().min(self.capacity as usize - at);
        dst[..first].copy_from_slice(&data[at..at + first]);
        if first < dst.len() {
            dst[first..].copy_from_slice(&data[..dst.len() - first]);
        }
    }

    /// # Safety
    /// Consumer-only; at least 4 bytes must be occupied at `head`.
    unsafe fn peek_len(&self, head: u32) -> u32 {
        let mut be = [0u8; 4];
        self.copy_out(head, &mut be);
        u32::from_be_bytes(be)
    }

    // --- raw submit / fetch ----------------------------------------------

    /// Store one length-prefixed message. Producer side only.
    ///
    /// Fails with `BadArguments` for an empty message or one whose size
    /// is not a multiple of 4, `TooBig` if the message alone exceeds the
    /// capacity of an empty ring, and `Overflow` when occupied space
    /// leaves no room. The ring is unchanged on every failure.
    pub fn submit(&self, message: &[u8]) -> Result<()> {
        let n = message.len();
        if n == 0 || n % 4 != 0 || n > (u32::MAX - LEN_PREFIX) as usize {
            return Err(Error::BadArguments);
        }
        let need = n as u32 + LEN_PREFIX;
        let sz = self.size.load(Ordering::Acquire);
        if need > self.capacity - sz {
            return Err(if sz == 0 { Error::TooBig } else { Error::Overflow });
        }

        unsafe {
            let tail = *self.tail.get();
            self.copy_in(tail, &(n as u32).to_be_bytes());
            self.copy_in((tail + LEN_PREFIX) % self.capacity, message);
            *self.tail.get() = (tail + need) % self.capacity;
        }
        self.size.fetch_add(need, Ordering::Release);
        Ok(())
    }

    /// Copy the oldest message into `dst` and consume it. Consumer side
    /// only. Returns the message length.
    ///
    /// Fails with `NoData` when empty, `Overflow` when `dst` is too small
    /// (the message is NOT consumed — retry with a larger buffer or
    /// discard via [`skip`](Self::skip)), and `Corrupted` when the stored
    /// length disagrees with the occupancy counter.
    pub fn fetch(&self, dst: &mut [u8]) -> Result<usize> {
        let sz = self.size.load(Ordering::Acquire);
        if sz == 0 {
            return Err(Error::NoData);
        }
        unsafe {
            let head = *self.head.get();
            let len = self.peek_len(head);
            if len > sz.saturating_sub(LEN_PREFIX) {
                return Err(Error::Corrupted);
            }
            if len as usize > dst.len() {
                return Err(Error::Overflow);
            }
            self.copy_out((head + LEN_PREFIX) % self.capacity, &mut dst[..len as usize]);
            *self.head.get() = (head + LEN_PREFIX + len) % self.capacity;
            self.size.fetch_sub(len + LEN_PREFIX, Ordering::Release);
            Ok(len as usize)
        }
    }

    /// Discard the oldest message without copying it. Consumer side only.
    /// Returns the discarded message length, or 0 when the ring is empty
    /// or its framing is corrupted.
    pub fn skip(&self) -> usize {
        let sz = self.size.load(Ordering::Acquire);
        if sz == 0 {
            return 0;
        }
        unsafe {
            let head = *self.head.get();
            let len = self.peek_len(head);
            if len > sz.saturating_sub(LEN_PREFIX) {
                return 0;
            }
            *self.head.get() = (head + LEN_PREFIX + len) % self.capacity;
            self.size.fetch_sub(len + LEN_PREFIX, Ordering::Release);
            len as usize
        }
    }

    // --- typed submits ----------------------------------------------------
    //
    // Each helper encodes a single OSC message (padded address, ','-led
    // type tag string, big-endian arguments) into the reusable scratch
    // buffer before handing it to submit(). Producer side only.

    fn encode_and_submit<F>(&self, address: &str, tags: &str, estimate: usize, args: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<u8>),
    {
        if address.is_empty() || !address.starts_with('/') {
            return Err(Error::BadArguments);
        }
        let needed = pad4(address.len() + 1) + pad4(tags.len() + 2) + estimate;
        if needed + LEN_PREFIX as usize > self.capacity as usize {
            return Err(Error::TooBig);
        }

        // Safety: producer-only scratch, never touched by the consumer.
        let buf = unsafe { &mut *self.scratch.get() };
        buf.clear();
        buf.reserve(needed);
        put_padded_str(buf, address);
        put_type_tags(buf, tags);
        args(buf);
        self.submit(buf)
    }

    /// Submit a 32-bit integer event.
    pub fn submit_int32(&self, address: &str, value: i32) -> Result<()> {
        self.encode_and_submit(address, "i", 4, |buf| {
            buf.extend_from_slice(&value.to_be_bytes());
        })
    }

    /// Submit a 32-bit float event.
    pub fn submit_float32(&self, address: &str, value: f32) -> Result<()> {
        self.encode_and_submit(address, "f", 4, |buf| {
            buf.extend_from_slice(&value.to_be_bytes());
        })
    }

    /// Submit a string event.
    pub fn submit_string(&self, address: &str, value: &str) -> Result<()> {
        self.encode_and_submit(address, "s", pad4(value.len() + 1), |buf| {
            put_padded_str(buf, value);
        })
    }

    /// Submit a binary blob event.
    pub fn submit_blob(&self, address: &str, value: &[u8]) -> Result<()> {
        if value.len() > u32::MAX as usize {
            return Err(Error::BadArguments);
        }
        self.encode_and_submit(address, "b", 4 + pad4(value.len()), |buf| {
            buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
            buf.extend_from_slice(value);
            while buf.len() % 4 != 0 {
                buf.push(0);
            }
        })
    }

    /// Submit a boolean event (argument-less `T`/`F` type tag).
    pub fn submit_bool(&self, address: &str, value: bool) -> Result<()> {
        self.encode_and_submit(address, if value { "T" } else { "F" }, 0, |_| {})
    }

    /// Submit a 64-bit OSC time tag event.
    pub fn submit_time_tag(&self, address: &str, tag: u64) -> Result<()> {
        self.encode_and_submit(address, "t", 8, |buf| {
            buf.extend_from_slice(&tag.to_be_bytes());
        })
    }

    /// Submit a raw 4-byte MIDI event (port, status, data1, data2).
    pub fn submit_midi(&self, address: &str, message: [u8; 4]) -> Result<()> {
        self.encode_and_submit(address, "m", 4, |buf| {
            buf.extend_from_slice(&message);
        })
    }
}
