// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared-memory audio stream: a named segment holding a cache-line-padded
// header followed by planar f32 channel rings.
//
// One writer process fills blocks between begin()/end(); end() advances
// the shared head and bumps the monotonic write counter with Release,
// which is the liveness signal readers watch. Readers keep an independent
// local cursor, so a reader that opened at the same head position as the
// writer replays exactly the blocks the writer committed.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::error::{Error, Result};
use crate::mailbox::StreamParams;
use crate::shm::{Segment, SegmentMode};

/// Type tag of audio stream segments, also used as the catalog record magic.
pub const STREAM_MAGIC: u32 = u32::from_be_bytes(*b"sAUD");

/// Upper bound on channels per stream.
pub const MAX_STREAM_CHANNELS: u32 = 64;

/// Upper bound on the ring length, in frames.
pub const MAX_STREAM_LENGTH: u32 = 0x10000;

// ---------------------------------------------------------------------------
// Shared memory layout
// ---------------------------------------------------------------------------

#[repr(C)]
struct StreamHeader {
    magic: u32,
    channels: u32,
    length: u32, // frames per channel ring
    _reserved: u32,
    /// Monotonic commit counter, bumped by the writer's end().
    counter: AtomicU32,
    /// Shared write head, in frames.
    head: AtomicU32,
    constructed: AtomicBool,
    _pad: [u8; 39],
}

const _: () = assert!(std::mem::size_of::<StreamHeader>() == 64);

fn layout_size(channels: u32, length: u32) -> usize {
    std::mem::size_of::<StreamHeader>()
        + channels as usize * length as usize * std::mem::size_of::<f32>()
}

/// Strip NaN/Inf/denormals from one sample.
#[inline]
pub fn sanitize(x: f32) -> f32 {
    if x.is_nan() {
        0.0
    } else if x.is_infinite() {
        x.signum()
    } else if x != 0.0 && x.abs() < f32::MIN_POSITIVE {
        0.0
    } else {
        x
    }
}

// ---------------------------------------------------------------------------
// AudioStream
// ---------------------------------------------------------------------------

/// A multi-channel audio ring over a named shared-memory segment.
///
/// All I/O is bracketed: `begin(block)` … per-channel `read`/`write` …
/// `end()`. The bracket methods are lock-free and allocation-free. One
/// process writes, any number read; each handle is used by one thread at
/// a time.
pub struct AudioStream {
    shm: Segment,
    writer: bool,
    position: AtomicU32, // local ring cursor, frames
    block: AtomicU32,    // current bracket size, 0 = closed
}

impl AudioStream {
    /// Create (or re-attach to) the segment `id` for writing.
    pub fn create(id: &str, channels: u32, length: u32) -> Result<Self> {
        if channels == 0
            || channels > MAX_STREAM_CHANNELS
            || length == 0
            || length > MAX_STREAM_LENGTH
        {
            return Err(Error::BadArguments);
        }

        let shm = Segment::acquire(id, layout_size(channels, length), SegmentMode::CreateOrOpen)?;
        let hdr = unsafe { &*(shm.as_ptr() as *const StreamHeader) };
        if shm.created() {
            // Fresh segments are zero-filled; publish geometry, then flag.
            unsafe {
                let h = shm.as_mut_ptr() as *mut StreamHeader;
                (*h).magic = STREAM_MAGIC;
                (*h).channels = channels;
                (*h).length = length;
            }
            hdr.constructed.store(true, Ordering::Release);
        } else {
            if !hdr.constructed.load(Ordering::Acquire)
                || hdr.magic != STREAM_MAGIC
                || hdr.channels != channels
                || hdr.length != length
            {
                return Err(Error::Corrupted);
            }
        }

        let position = hdr.head.load(Ordering::Acquire);
        Ok(Self {
            shm,
            writer: true,
            position: AtomicU32::new(position),
            block: AtomicU32::new(0),
        })
    }

    /// Open the segment `id` for reading. Geometry is taken from the
    /// mapped header and validated against the segment size.
    pub fn open(id: &str) -> Result<Self> {
        let shm = Segment::acquire(id, 0, SegmentMode::Open)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => Error::NotFound,
                _ => Error::Io(e),
            })?;
        if shm.user_size() < std::mem::size_of::<StreamHeader>() {
            return Err(Error::Corrupted);
        }
        let hdr = unsafe { &*(shm.as_ptr() as *const StreamHeader) };
        if !hdr.constructed.load(Ordering::Acquire) || hdr.magic != STREAM_MAGIC {
            return Err(Error::Corrupted);
        }
        let (channels, length) = (hdr.channels, hdr.length);
        if channels == 0
            || channels > MAX_STREAM_CHANNELS
            || length == 0
            || length > MAX_STREAM_LENGTH
            || layout_size(channels, length) > shm.user_size()
        {
            return Err(Error::Corrupted);
        }

        let position = hdr.head.load(Ordering::Acquire);
        Ok(Self {
            shm,
            writer: false,
            position: AtomicU32::new(position),
            block: AtomicU32::new(0),
        })
    }

    fn hdr(&self) -> &StreamHeader {
        unsafe { &*(self.shm.as_ptr() as *const StreamHeader) }
    }

    /// Base pointer of one channel's ring.
    fn channel_ptr(&self, channel: u32) -> *mut f32 {
        unsafe {
            let base = self.shm.as_mut_ptr().add(std::mem::size_of::<StreamHeader>());
            (base as *mut f32).add(channel as usize * self.hdr().length as usize)
        }
    }

    pub fn channels(&self) -> u32 {
        self.hdr().channels
    }

    /// Ring length in frames.
    pub fn length(&self) -> u32 {
        self.hdr().length
    }

    /// Monotonic commit counter; advances once per writer end().
    pub fn counter(&self) -> u32 {
        self.hdr().counter.load(Ordering::Acquire)
    }

    /// Open an I/O bracket of `block_size` frames.
    pub fn begin(&self, block_size: u32) -> Result<()> {
        if block_size == 0 || block_size > self.length() {
            return Err(Error::BadArguments);
        }
        if self.block.load(Ordering::Relaxed) != 0 {
            return Err(Error::BadState);
        }
        self.block.store(block_size, Ordering::Relaxed);
        Ok(())
    }

    fn bracket(&self, channel: u32, samples: usize) -> Result<u32> {
        let block = self.block.load(Ordering::Relaxed);
        if block == 0 {
            return Err(Error::BadState);
        }
        if channel >= self.channels() || samples > block as usize {
            return Err(Error::BadArguments);
        }
        Ok(block)
    }

    /// Write `src` into `channel` at the current block position.
    pub fn write(&self, channel: u32, src: &[f32]) -> Result<()> {
        if !self.writer {
            return Err(Error::BadState);
        }
        self.bracket(channel, src.len())?;

        let len = self.length() as usize;
        let pos = self.position.load(Ordering::Relaxed) as usize;
        let base = self.channel_ptr(channel);
        let first = src.len().min(len - pos);
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), base.add(pos), first);
            if first < src.len() {
                std::ptr::copy_nonoverlapping(src.as_ptr().add(first), base, src.len() - first);
            }
        }
        Ok(())
    }

    /// Write `src` with NaN/Inf/denormals stripped.
    pub fn write_sanitized(&self, channel: u32, src: &[f32]) -> Result<()> {
        if !self.writer {
            return Err(Error::BadState);
        }
        self.bracket(channel, src.len())?;

        let len = self.length() as usize;
        let pos = self.position.load(Ordering::Relaxed) as usize;
        let base = self.channel_ptr(channel);
        unsafe {
            for (i, &x) in src.iter().enumerate() {
                *base.add((pos + i) % len) = sanitize(x);
            }
        }
        Ok(())
    }

    /// Read `dst.len()` frames of `channel` at the current block position.
    pub fn read(&self, channel: u32, dst: &mut [f32]) -> Result<()> {
        if self.writer {
            return Err(Error::BadState);
        }
        self.bracket(channel, dst.len())?;

        let len = self.length() as usize;
        let pos = self.position.load(Ordering::Relaxed) as usize;
        let base = self.channel_ptr(channel);
        let first = dst.len().min(len - pos);
        unsafe {
            std::ptr::copy_nonoverlapping(base.add(pos), dst.as_mut_ptr(), first);
            if first < dst.len() {
                std::ptr::copy_nonoverlapping(base, dst.as_mut_ptr().add(first), dst.len() - first);
            }
        }
        Ok(())
    }

    /// Read with NaN/Inf/denormals stripped.
    pub fn read_sanitized(&self, channel: u32, dst: &mut [f32]) -> Result<()> {
        if self.writer {
            return Err(Error::BadState);
        }
        self.bracket(channel, dst.len())?;

        let len = self.length() as usize;
        let pos = self.position.load(Ordering::Relaxed) as usize;
        let base = self.channel_ptr(channel);
        unsafe {
            for (i, out) in dst.iter_mut().enumerate() {
                *out = sanitize(*base.add((pos + i) % len));
            }
        }
        Ok(())
    }

    /// Close the bracket. The writer commits: shared head advances and the
    /// counter is bumped with Release so readers observe the whole block.
    pub fn end(&self) -> Result<()> {
        let block = self.block.swap(0, Ordering::Relaxed);
        if block == 0 {
            return Err(Error::BadState);
        }
        let next = (self.position.load(Ordering::Relaxed) + block) % self.length();
        self.position.store(next, Ordering::Relaxed);
        if self.writer {
            let hdr = self.hdr();
            hdr.head.store(next, Ordering::Release);
            hdr.counter.fetch_add(1, Ordering::Release);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StreamHandle — the unit of background→RT hand-off
// ---------------------------------------------------------------------------

/// A resolved (or placeholder) stream plus its requested parameters.
///
/// Created and dropped by the background maintenance thread; the
/// real-time thread only holds a borrowed `Arc` clone for the duration
/// of one begin/end bracket. `last_counter`/`stall` carry the return
/// side's liveness bookkeeping and are touched only by the RT thread.
pub struct StreamHandle {
    stream: Option<AudioStream>,
    params: StreamParams,
    pub(crate) last_counter: AtomicU32,
    pub(crate) stall: AtomicU32,
}

impl StreamHandle {
    /// Handle around a live stream.
    pub fn with_stream(stream: AudioStream, params: StreamParams) -> Self {
        let last = stream.counter();
        Self {
            stream: Some(stream),
            params,
            last_counter: AtomicU32::new(last),
            stall: AtomicU32::new(0),
        }
    }

    /// Placeholder installed when a name does not (yet) resolve.
    pub fn placeholder(params: StreamParams) -> Self {
        Self {
            stream: None,
            params,
            last_counter: AtomicU32::new(0),
            stall: AtomicU32::new(0),
        }
    }

    pub fn stream(&self) -> Option<&AudioStream> {
        self.stream.as_ref()
    }

    pub fn params(&self) -> &StreamParams {
        &self.params
    }
}
