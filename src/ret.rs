// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// AudioReturn — the subscribing half of a named stream connection.
//
// Mirrors AudioSend in the opposite direction, with one addition: stall
// detection. Every begin() compares the producer's commit counter with
// the last value this return observed; while it does not advance, a
// stall counter accumulates min(block, 512) per callback and the status
// flips to Stalled at the threshold. The transition back to Active
// happens the first time the counter moves again — entirely on the
// real-time thread, with no background involvement.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, Weak};

use crate::catalog::{Catalog, CatalogClient, CatalogRecord};
use crate::error::{Error, Result};
use crate::mailbox::{
    AtomicStatus, ConnectionStatus, RequestPool, RequestSlot, RtBracket, StateCell, StreamName,
    StreamParams,
};
use crate::stream::{AudioStream, StreamHandle};

/// Cumulative stall frames after which a return reports `Stalled`.
pub const STALL_THRESHOLD: u32 = 0x10000;

/// Per-callback clamp on the stall increment.
const STALL_BLOCK_MAX: u32 = 512;

struct ReturnBack {
    record: Option<CatalogRecord>,
    active: Option<StreamParams>,
}

struct ReturnShared {
    requests: RequestPool,
    mailbox: StateCell<RequestSlot>,
    current: StateCell<StreamHandle>,
    status: AtomicStatus,
    rt: RtBracket<StreamHandle>,
    back: Mutex<ReturnBack>,
    catalog: Mutex<Option<Weak<Catalog>>>,
}

/// Subscriber to a named audio stream, with producer-stall detection.
///
/// Exactly one real-time thread drives `connect`/`disconnect` and the
/// `begin`/`read`/`end` bracket; the catalog's maintenance thread drives
/// the background protocol. Reads degrade to zero-fill whenever no
/// underlying stream is available.
pub struct AudioReturn {
    shared: Arc<ReturnShared>,
}

impl AudioReturn {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ReturnShared {
                requests: RequestPool::new(),
                mailbox: StateCell::new(),
                current: StateCell::new(),
                status: AtomicStatus::new(ConnectionStatus::Inactive),
                rt: RtBracket::new(),
                back: Mutex::new(ReturnBack {
                    record: None,
                    active: None,
                }),
                catalog: Mutex::new(None),
            }),
        }
    }

    // --- attachment --------------------------------------------------------

    /// Register this return with `catalog`'s maintenance cycle. Idempotent.
    pub fn attach(&self, catalog: &Arc<Catalog>) {
        let client: Arc<dyn CatalogClient> = self.shared.clone();
        catalog.attach(&client);
        *self.shared.catalog.lock().unwrap() = Some(Arc::downgrade(catalog));
    }

    /// Unregister from the catalog and drop the subscription.
    /// Idempotent; safe to call repeatedly and during destruction.
    pub fn detach(&self) {
        let weak = self.shared.catalog.lock().unwrap().take();
        if let Some(catalog) = weak.and_then(|w| w.upgrade()) {
            let client: Arc<dyn CatalogClient> = self.shared.clone();
            catalog.detach(&client);
        }
        {
            let mut back = self.shared.back.lock().unwrap();
            back.record = None;
            back.active = None;
        }
        self.shared.current.clear();
        self.shared.status.store(ConnectionStatus::Inactive);
    }

    pub fn attached(&self) -> bool {
        self.shared
            .catalog
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|w| w.strong_count() > 0)
    }

    // --- requests (RT-safe) ------------------------------------------------

    /// Request subscription to `name`. RT-safe; `false` when the name is
    /// invalid or all request slots are in flight.
    pub fn connect(&self, name: &str) -> bool {
        match StreamParams::subscribe(name) {
            Ok(params) => self.request(params),
            Err(_) => false,
        }
    }

    /// Request disconnection. RT-safe.
    pub fn disconnect(&self) -> bool {
        self.request(StreamParams::revoke())
    }

    fn request(&self, params: StreamParams) -> bool {
        let Some(slot) = self.shared.requests.alloc(params) else {
            return false;
        };
        self.shared.rt.set_setup(params);
        self.shared.status.store(ConnectionStatus::Updating);
        self.shared.mailbox.push(slot);
        true
    }

    // --- status (RT-safe) --------------------------------------------------

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.load()
    }

    pub fn active(&self) -> bool {
        self.status() == ConnectionStatus::Active
    }

    /// The producer stopped committing blocks.
    pub fn stalled(&self) -> bool {
        self.status() == ConnectionStatus::Stalled
    }

    /// Last requested stream name. Real-time thread only.
    pub fn name(&self) -> StreamName {
        self.shared.rt.setup().stream_name()
    }

    // --- RT bracket ---------------------------------------------------------

    /// Open a read bracket of `block_size` frames and account producer
    /// liveness. Must be paired with exactly one [`end`](Self::end).
    pub fn begin(&self, block_size: u32) -> Result<()> {
        self.shared.rt.open()?;
        let handle = self.shared.current.get();
        if let Some(h) = &handle {
            if let Some(stream) = h.stream() {
                let counter = stream.counter();
                if counter == h.last_counter.load(Ordering::Relaxed) {
                    let stall = (h.stall.load(Ordering::Relaxed)
                        + block_size.min(STALL_BLOCK_MAX))
                    .min(STALL_THRESHOLD);
                    h.stall.store(stall, Ordering::Relaxed);
                    if stall >= STALL_THRESHOLD {
                        self.shared.status.store(ConnectionStatus::Stalled);
                    }
                } else {
                    h.last_counter
                        .store(counter, Ordering::Relaxed);
                    h.stall.store(0, Ordering::Relaxed);
                    self.shared.status.store(ConnectionStatus::Active);
                }
                if stream.begin(block_size).is_err() {
                    self.shared.rt.set(None);
                    return Ok(());
                }
            }
        }
        self.shared.rt.set(handle);
        Ok(())
    }

    /// Read one channel's block. Zero-fills `dst` when no underlying
    /// stream is available — never leaves garbage behind.
    pub fn read(&self, channel: u32, dst: &mut [f32]) -> Result<()> {
        if !self.shared.rt.is_open() {
            return Err(Error::BadState);
        }
        match self.shared.rt.get().and_then(|h| h.stream()) {
            Some(stream) => stream.read(channel, dst).or_else(|_| {
                dst.fill(0.0);
                Ok(())
            }),
            None => {
                dst.fill(0.0);
                Ok(())
            }
        }
    }

    /// Read with NaN/Inf/denormals stripped; zero-fills without a stream.
    pub fn read_sanitized(&self, channel: u32, dst: &mut [f32]) -> Result<()> {
        if !self.shared.rt.is_open() {
            return Err(Error::BadState);
        }
        match self.shared.rt.get().and_then(|h| h.stream()) {
            Some(stream) => stream.read_sanitized(channel, dst).or_else(|_| {
                dst.fill(0.0);
                Ok(())
            }),
            None => {
                dst.fill(0.0);
                Ok(())
            }
        }
    }

    /// Close the bracket, releasing the per-call stream reference.
    pub fn end(&self) -> Result<()> {
        if let Some(stream) = self.shared.rt.get().and_then(|h| h.stream()) {
            let _ = stream.end();
        }
        self.shared.rt.close()
    }
}

impl Default for AudioReturn {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AudioReturn {
    fn drop(&mut self) {
        self.detach();
    }
}

// ---------------------------------------------------------------------------
// Background protocol
// ---------------------------------------------------------------------------

impl ReturnShared {
    /// Open the stream a record points at and install the handle.
    /// The record is cached only on success, so a failed open is retried
    /// on the next cycle instead of wedging on a stale record.
    fn open_stream(&self, record: CatalogRecord, params: StreamParams) -> bool {
        match AudioStream::open(&record.id) {
            Ok(stream) => {
                self.current
                    .push(Arc::new(StreamHandle::with_stream(stream, params)));
                self.status.store(ConnectionStatus::Active);
                log::debug!("return: subscribed to '{}' via {}", params.name(), record.id);
                let mut back = self.back.lock().unwrap();
                back.record = Some(record);
                back.active = Some(params);
            }
            Err(e) => {
                log::debug!("return: stream open failed for '{}': {e}", params.name());
                self.current
                    .push(Arc::new(StreamHandle::placeholder(params)));
                self.status.store(ConnectionStatus::Inactive);
                let mut back = self.back.lock().unwrap();
                back.record = None;
                back.active = Some(params);
            }
        }
        true
    }
}

impl CatalogClient for ReturnShared {
    fn apply(&self, catalog: &Catalog) -> bool {
        let Some(slot) = self.mailbox.take() else {
            return true;
        };
        let params = slot.params();

        let ok = if params.is_revoke() {
            {
                let mut back = self.back.lock().unwrap();
                back.record = None;
                back.active = None;
            }
            self.current.clear();
            self.status.store(ConnectionStatus::Inactive);
            log::debug!("return: disconnected");
            true
        } else {
            match catalog.get(params.name()) {
                Ok(record) => self.open_stream(record, params),
                Err(e) => {
                    // Name not (yet) published — keep watching from update().
                    if !matches!(e, Error::NotFound) {
                        log::warn!("return: catalog lookup failed for '{}': {e}", params.name());
                    }
                    self.current
                        .push(Arc::new(StreamHandle::placeholder(params)));
                    self.status.store(ConnectionStatus::Inactive);
                    let mut back = self.back.lock().unwrap();
                    back.record = None;
                    back.active = Some(params);
                    true
                }
            }
        };

        slot.release();
        ok
    }

    fn update(&self, catalog: &Catalog) -> bool {
        let (cached, params) = {
            let back = self.back.lock().unwrap();
            (back.record.clone(), back.active)
        };
        let Some(params) = params else { return true };

        match catalog.get(params.name()) {
            Ok(record) => {
                let unchanged = cached.as_ref().is_some_and(|c| record.matches(c));
                if unchanged {
                    return true;
                }
                // New or re-reserved entry — (re)open the stream.
                self.open_stream(record, params)
            }
            Err(Error::NotFound) => {
                if cached.is_some() {
                    log::debug!("return: '{}' disappeared", params.name());
                    self.current
                        .push(Arc::new(StreamHandle::placeholder(params)));
                    self.status.store(ConnectionStatus::Inactive);
                    self.back.lock().unwrap().record = None;
                }
                true
            }
            Err(e) => {
                log::warn!("return: catalog lookup failed for '{}': {e}", params.name());
                true
            }
        }
    }

    fn keep_alive(&self, catalog: &Catalog) {
        // Refresh even while stalled or inactive: a temporarily silent
        // producer must not lose its catalog entry to the TTL sweep.
        let back = self.back.lock().unwrap();
        if let Some(params) = &back.active {
            catalog.keep_alive(params.name());
        }
    }
}
