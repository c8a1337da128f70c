// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Status taxonomy for the stream transport. The shm platform layer keeps
// plain io::Result; everything above it speaks this enum.

use std::io;

use thiserror::Error;

/// Failure modes of the stream transport.
///
/// Real-time paths never surface these upward — they degrade to zero-fill
/// reads, no-op writes, or a `false` return instead. The background
/// maintenance cycle consumes them and retries on the next pass.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed call (zero-length submit, bad channel index, name too long).
    #[error("bad arguments")]
    BadArguments,
    /// I/O call outside a begin/end bracket, or double-begin.
    #[error("bad state")]
    BadState,
    /// Ring buffer is empty.
    #[error("no data")]
    NoData,
    /// Fixed-capacity table or pool is exhausted.
    #[error("out of memory")]
    NoMem,
    /// Not enough room for the message, or the destination is too small.
    #[error("overflow")]
    Overflow,
    /// Message alone exceeds the total capacity.
    #[error("message too big")]
    TooBig,
    /// Stored framing disagrees with the occupancy counter.
    #[error("corrupted")]
    Corrupted,
    /// Catalog lookup miss.
    #[error("not found")]
    NotFound,
    /// Shared-memory syscall failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
