// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-thread hand-off primitives shared by the send and return halves.
//
// Two mailboxes exist per connection, pointing in opposite directions:
// the background thread publishes the current StreamHandle to the
// real-time thread through a StateCell, and the real-time thread posts
// publish/connect requests to the background thread through a StateCell
// fed from a fixed RequestPool. Both are single-slot, latest-value-wins.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::error::{Error, Result};

/// Longest permitted stream name, in bytes.
pub const MAX_NAME_LEN: usize = 63;

/// Number of in-flight request slots per send/return instance.
pub const REQUEST_SLOTS: usize = 4;

// ---------------------------------------------------------------------------
// ConnectionStatus
// ---------------------------------------------------------------------------

/// Connection state of a send or return, readable from any thread.
///
/// Transitions are made by the background maintenance cycle, except
/// `Updating` (set by `publish`/`connect` itself) and the
/// `Active` ⇄ `Stalled` pair, which a return drives from the real-time
/// thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionStatus {
    /// No stream, or the last resolution attempt failed.
    Inactive = 0,
    /// A request is posted and not yet applied.
    Updating = 1,
    /// Stream resolved and live.
    Active = 2,
    /// Another publisher re-reserved the catalog slot (sends only).
    Overridden = 3,
    /// The producer stopped advancing its write counter (returns only).
    Stalled = 4,
}

impl ConnectionStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Updating,
            2 => Self::Active,
            3 => Self::Overridden,
            4 => Self::Stalled,
            _ => Self::Inactive,
        }
    }
}

/// Atomic cell for a `ConnectionStatus`. Plain atomicity is enough:
/// staleness self-corrects on the next cycle.
pub(crate) struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    pub(crate) fn new(status: ConnectionStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub(crate) fn load(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.0.load(Ordering::Relaxed))
    }

    pub(crate) fn store(&self, status: ConnectionStatus) {
        self.0.store(status as u8, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// StreamName — fixed-capacity name buffer, copyable between threads
// without allocation.
// ---------------------------------------------------------------------------

/// A stream name bounded to [`MAX_NAME_LEN`] bytes.
#[derive(Clone, Copy)]
pub struct StreamName {
    bytes: [u8; MAX_NAME_LEN + 1],
    len: u8,
}

impl StreamName {
    pub const EMPTY: Self = Self {
        bytes: [0; MAX_NAME_LEN + 1],
        len: 0,
    };

    /// Copy `name` into a fixed buffer. `BadArguments` when too long.
    pub fn new(name: &str) -> Result<Self> {
        let src = name.as_bytes();
        if src.len() > MAX_NAME_LEN {
            return Err(Error::BadArguments);
        }
        let mut bytes = [0u8; MAX_NAME_LEN + 1];
        bytes[..src.len()].copy_from_slice(src);
        Ok(Self {
            bytes,
            len: src.len() as u8,
        })
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl PartialEq for StreamName {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for StreamName {}

impl PartialEq<str> for StreamName {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl fmt::Debug for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl Default for StreamName {
    fn default() -> Self {
        Self::EMPTY
    }
}

// ---------------------------------------------------------------------------
// StreamParams — the logical identity of one requested connection.
// ---------------------------------------------------------------------------

/// Requested stream setup. Copied by value between threads; never mutated
/// in place while visible to the real-time thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamParams {
    name: StreamName,
    channels: u32,
    length: u32,
}

impl StreamParams {
    /// Parameters for publishing `channels` × `length` frames under `name`.
    pub fn publish(name: &str, channels: u32, length: u32) -> Result<Self> {
        if name.is_empty() || channels == 0 || length == 0 {
            return Err(Error::BadArguments);
        }
        Ok(Self {
            name: StreamName::new(name)?,
            channels,
            length,
        })
    }

    /// Parameters for subscribing to `name` (geometry comes from the
    /// publisher).
    pub fn subscribe(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::BadArguments);
        }
        Ok(Self {
            name: StreamName::new(name)?,
            channels: 0,
            length: 0,
        })
    }

    /// Parameters requesting disconnection.
    pub fn revoke() -> Self {
        Self {
            name: StreamName::EMPTY,
            channels: 0,
            length: 0,
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Copy of the fixed name buffer (allocation-free).
    pub fn stream_name(&self) -> StreamName {
        self.name
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    /// A request with no name asks for teardown.
    pub fn is_revoke(&self) -> bool {
        self.name.is_empty()
    }
}

impl Default for StreamParams {
    fn default() -> Self {
        Self::revoke()
    }
}

// ---------------------------------------------------------------------------
// StateCell — single-slot latest-value mailbox.
// ---------------------------------------------------------------------------

/// Single-writer "latest value" cell.
///
/// The writer `push`es new values, silently superseding unconsumed ones;
/// a reader either `get`s a clone (leaving the value current) or `take`s
/// it (draining the slot). Reclamation is `Arc` refcounting: a superseded
/// value is freed when its last holder drops it, so the real-time thread
/// can hold a `get` clone across a begin/end bracket without ever racing
/// a free.
pub struct StateCell<T> {
    cell: ArcSwapOption<T>,
}

impl<T> StateCell<T> {
    pub fn new() -> Self {
        Self {
            cell: ArcSwapOption::const_empty(),
        }
    }

    /// Install a new current value, superseding any unconsumed one.
    pub fn push(&self, value: Arc<T>) {
        self.cell.store(Some(value));
    }

    /// Remove the current value.
    pub fn clear(&self) {
        self.cell.store(None);
    }

    /// Clone the current value, leaving it in place. Lock-free and
    /// allocation-free; safe on the real-time thread.
    pub fn get(&self) -> Option<Arc<T>> {
        self.cell.load_full()
    }

    /// Drain the current value.
    pub fn take(&self) -> Option<Arc<T>> {
        self.cell.swap(None)
    }
}

impl<T> Default for StateCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// RtBracket — the real-time thread's private state: the handle borrowed
// for the current begin/end bracket and a copy of the last requested
// setup for the lock-free name()/channels()/length() accessors.
// ---------------------------------------------------------------------------

pub(crate) struct RtBracket<T> {
    handle: UnsafeCell<Option<Arc<T>>>,
    setup: UnsafeCell<StreamParams>,
    open: AtomicBool,
}

// Safety: only the single real-time thread touches `handle` and `setup`;
// the background thread sees the struct through &self but never calls
// into it. `open` is atomic for the cheap double-begin check.
unsafe impl<T: Send + Sync> Sync for RtBracket<T> {}
unsafe impl<T: Send + Sync> Send for RtBracket<T> {}

impl<T> RtBracket<T> {
    pub(crate) fn new() -> Self {
        Self {
            handle: UnsafeCell::new(None),
            setup: UnsafeCell::new(StreamParams::revoke()),
            open: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    /// Mark the bracket open. `BadState` on double-begin.
    pub(crate) fn open(&self) -> Result<()> {
        if self.is_open() {
            return Err(Error::BadState);
        }
        self.open.store(true, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn set(&self, handle: Option<Arc<T>>) {
        unsafe { *self.handle.get() = handle };
    }

    pub(crate) fn get(&self) -> Option<&T> {
        unsafe { (*self.handle.get()).as_deref() }
    }

    /// Close the bracket, dropping the borrowed handle.
    pub(crate) fn close(&self) -> Result<()> {
        if !self.is_open() {
            return Err(Error::BadState);
        }
        unsafe { *self.handle.get() = None };
        self.open.store(false, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn set_setup(&self, params: StreamParams) {
        unsafe { *self.setup.get() = params };
    }

    pub(crate) fn setup(&self) -> StreamParams {
        unsafe { *self.setup.get() }
    }
}

// ---------------------------------------------------------------------------
// RequestPool — bounded arena for in-flight StreamParams requests.
// ---------------------------------------------------------------------------

/// One slot of a [`RequestPool`].
pub struct RequestSlot {
    params: UnsafeCell<StreamParams>,
    busy: AtomicBool,
}

// Safety: `params` is written by the producer after claiming the slot and
// before publishing it into a mailbox; the consumer reads it only after
// receiving the Arc through that mailbox, which orders the accesses.
unsafe impl Sync for RequestSlot {}
unsafe impl Send for RequestSlot {}

impl RequestSlot {
    /// The request recorded in this slot.
    pub fn params(&self) -> StreamParams {
        unsafe { *self.params.get() }
    }

    /// Return the slot to the pool after draining it.
    pub fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Fixed arena of [`REQUEST_SLOTS`] parameter slots.
///
/// `alloc` is lock-free and allocation-free, so `publish`/`connect` can
/// run on the real-time thread; it fails (returns `None`) when all slots
/// are in flight rather than growing. Slots superseded in a mailbox
/// (refcount back down to the pool's own reference, busy flag still set)
/// are reclaimed lazily on the producer's next `alloc`.
pub struct RequestPool {
    slots: [Arc<RequestSlot>; REQUEST_SLOTS],
}

impl RequestPool {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| {
                Arc::new(RequestSlot {
                    params: UnsafeCell::new(StreamParams::revoke()),
                    busy: AtomicBool::new(false),
                })
            }),
        }
    }

    /// Claim a free slot and record `params` in it.
    pub fn alloc(&self, params: StreamParams) -> Option<Arc<RequestSlot>> {
        // Reclaim superseded slots: only the pool holds them, but the
        // consumer never saw them so the busy flag was never cleared.
        for slot in &self.slots {
            if slot.busy.load(Ordering::Acquire) && Arc::strong_count(slot) == 1 {
                slot.busy.store(false, Ordering::Release);
            }
        }
        for slot in &self.slots {
            if slot
                .busy
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                unsafe { *slot.params.get() = params };
                return Some(Arc::clone(slot));
            }
        }
        None
    }
}

impl Default for RequestPool {
    fn default() -> Self {
        Self::new()
    }
}
