// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// AudioSend — the publishing half of a named stream connection.
//
// The real-time thread posts publish/revoke requests through a bounded
// request pool and a latest-value mailbox, then writes audio between
// begin()/end() against whatever StreamHandle the background thread has
// installed. The background half (the CatalogClient impl) resolves the
// name through the catalog, creates the shared stream segment, and
// detects when another publisher re-reserves the slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::catalog::{Catalog, CatalogClient, CatalogRecord};
use crate::error::{Error, Result};
use crate::mailbox::{
    AtomicStatus, ConnectionStatus, RequestPool, RequestSlot, RtBracket, StateCell, StreamName,
    StreamParams,
};
use crate::stream::{AudioStream, StreamHandle, STREAM_MAGIC};

struct SendBack {
    record: Option<CatalogRecord>,
    active: Option<StreamParams>,
}

struct SendShared {
    requests: RequestPool,
    mailbox: StateCell<RequestSlot>,
    current: StateCell<StreamHandle>,
    status: AtomicStatus,
    republish: AtomicBool,
    rt: RtBracket<StreamHandle>,
    back: Mutex<SendBack>,
    catalog: Mutex<Option<Weak<Catalog>>>,
}

/// Publisher of a named, fixed-channel-count audio stream.
///
/// Exactly one real-time thread drives `publish`/`revoke` and the
/// `begin`/`write`/`end` bracket; the catalog's maintenance thread
/// drives the background protocol. No call on the real-time path locks
/// or allocates (the request pool and mailboxes are preallocated).
pub struct AudioSend {
    shared: Arc<SendShared>,
}

impl AudioSend {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SendShared {
                requests: RequestPool::new(),
                mailbox: StateCell::new(),
                current: StateCell::new(),
                status: AtomicStatus::new(ConnectionStatus::Inactive),
                republish: AtomicBool::new(false),
                rt: RtBracket::new(),
                back: Mutex::new(SendBack {
                    record: None,
                    active: None,
                }),
                catalog: Mutex::new(None),
            }),
        }
    }

    // --- attachment --------------------------------------------------------

    /// Register this send with `catalog`'s maintenance cycle. Idempotent.
    pub fn attach(&self, catalog: &Arc<Catalog>) {
        let client: Arc<dyn CatalogClient> = self.shared.clone();
        catalog.attach(&client);
        *self.shared.catalog.lock().unwrap() = Some(Arc::downgrade(catalog));
    }

    /// Unregister from the catalog and drop the published stream.
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

    /// Request publication of `channels` × `length` frames under `name`.
    ///
    /// RT-safe. Returns `false` when the parameters are invalid or all
    /// request slots are in flight. A newer request silently supersedes
    /// an unconsumed older one.
    pub fn publish(&self, name: &str, channels: u32, length: u32) -> bool {
        match StreamParams::publish(name, channels, length) {
            Ok(params) => self.request(params),
            Err(_) => false,
        }
    }

    /// Request disconnection. RT-safe.
    pub fn revoke(&self) -> bool {
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

    /// Force the next maintenance cycle to recreate the stream (used when
    /// the host's buffer size or sample rate changes the shm layout).
    pub fn mark_for_republish(&self) {
        self.shared
            .republish
            .store(true, Ordering::Relaxed);
    }

    // --- status (RT-safe) --------------------------------------------------

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.load()
    }

    pub fn active(&self) -> bool {
        self.status() == ConnectionStatus::Active
    }

    /// Another publisher claimed the catalog slot for our name.
    pub fn overridden(&self) -> bool {
        self.status() == ConnectionStatus::Overridden
    }

    /// Last requested stream name. Real-time thread only.
    pub fn name(&self) -> StreamName {
        self.shared.rt.setup().stream_name()
    }

    /// Last requested channel count. Real-time thread only.
    pub fn channels(&self) -> u32 {
        self.shared.rt.setup().channels()
    }

    /// Last requested ring length. Real-time thread only.
    pub fn length(&self) -> u32 {
        self.shared.rt.setup().length()
    }

    // --- RT bracket ---------------------------------------------------------

    /// Open a write bracket of `block_size` frames. Must be paired with
    /// exactly one [`end`](Self::end).
    pub fn begin(&self, block_size: u32) -> Result<()> {
        self.shared.rt.open()?;
        let handle = self.shared.current.get();
        if let Some(h) = &handle {
            if let Some(stream) = h.stream() {
                if stream.begin(block_size).is_err() {
                    // Geometry no longer fits this block — skip stream I/O
                    // for this cycle and let the background thread resolve.
                    self.shared.rt.set(None);
                    return Ok(());
                }
            }
        }
        self.shared.rt.set(handle);
        Ok(())
    }

    /// Write one channel's block. A missing underlying stream is a
    /// successful no-op.
    pub fn write(&self, channel: u32, src: &[f32]) -> Result<()> {
        if !self.shared.rt.is_open() {
            return Err(Error::BadState);
        }
        match self.shared.rt.get().and_then(|h| h.stream()) {
            Some(stream) => stream.write(channel, src),
            None => Ok(()),
        }
    }

    /// Write with NaN/Inf/denormals stripped.
    pub fn write_sanitized(&self, channel: u32, src: &[f32]) -> Result<()> {
        if !self.shared.rt.is_open() {
            return Err(Error::BadState);
        }
        match self.shared.rt.get().and_then(|h| h.stream()) {
            Some(stream) => stream.write_sanitized(channel, src),
            None => Ok(()),
        }
    }

    /// Close the bracket, committing the block.
    pub fn end(&self) -> Result<()> {
        if let Some(stream) = self.shared.rt.get().and_then(|h| h.stream()) {
            let _ = stream.end();
        }
        self.shared.rt.close()
    }
}

impl Default for AudioSend {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AudioSend {
    fn drop(&mut self) {
        self.detach();
    }
}

// ---------------------------------------------------------------------------
// Background protocol
// ---------------------------------------------------------------------------

impl SendShared {
    /// Reserve the name and (re)create the backing stream segment.
    fn connect_stream(&self, catalog: &Catalog, params: StreamParams) -> bool {
        match catalog.get_or_reserve(params.name(), STREAM_MAGIC) {
            Ok(record) => {
                match AudioStream::create(&record.id, params.channels(), params.length()) {
                    Ok(stream) => {
                        self.current
                            .push(Arc::new(StreamHandle::with_stream(stream, params)));
                        self.status.store(ConnectionStatus::Active);
                        log::debug!(
                            "send: published '{}' as {} ({}ch x {})",
                            params.name(),
                            record.id,
                            params.channels(),
                            params.length()
                        );
                    }
                    Err(e) => {
                        log::warn!("send: stream create failed for '{}': {e}", params.name());
                        self.current
                            .push(Arc::new(StreamHandle::placeholder(params)));
                        self.status.store(ConnectionStatus::Inactive);
                        self.republish
                            .store(true, Ordering::Relaxed);
                    }
                }
                let mut back = self.back.lock().unwrap();
                back.record = Some(record);
                back.active = Some(params);
            }
            Err(e) => {
                // Catalog failure leaves previous state untouched; retried
                // on the next maintenance cycle.
                log::warn!("send: catalog reserve failed for '{}': {e}", params.name());
                self.back.lock().unwrap().active = Some(params);
                self.republish
                    .store(true, Ordering::Relaxed);
            }
        }
        true
    }
}

impl CatalogClient for SendShared {
    fn apply(&self, catalog: &Catalog) -> bool {
        let request = self.mailbox.take();
        let republish = self
            .republish
            .swap(false, Ordering::Relaxed);

        let params = match &request {
            Some(slot) => Some(slot.params()),
            None if republish => self.back.lock().unwrap().active,
            None => None,
        };
        let Some(params) = params else { return true };

        let ok = if params.is_revoke() {
            {
                let mut back = self.back.lock().unwrap();
                back.record = None;
                back.active = None;
            }
            self.current.clear();
            self.status.store(ConnectionStatus::Inactive);
            log::debug!("send: revoked");
            true
        } else {
            self.connect_stream(catalog, params)
        };

        if let Some(slot) = request {
            slot.release();
        }
        ok
    }

    fn update(&self, catalog: &Catalog) -> bool {
        let (cached, params) = {
            let back = self.back.lock().unwrap();
            (back.record.clone(), back.active)
        };
        let Some(params) = params else { return true };
        let Some(cached) = cached else { return true };

        match catalog.get(params.name()) {
            Ok(current) if current.matches(&cached) => {}
            Ok(_) => {
                // Someone re-reserved the slot: they own the name now.
                self.current.clear();
                self.status.store(ConnectionStatus::Overridden);
                self.back.lock().unwrap().record = None;
                log::debug!("send: '{}' overridden by another publisher", params.name());
            }
            Err(Error::NotFound) => {
                log::debug!("send: '{}' disappeared, re-reserving", params.name());
                return self.connect_stream(catalog, params);
            }
            Err(e) => {
                log::warn!("send: catalog lookup failed for '{}': {e}", params.name());
            }
        }
        true
    }

    fn keep_alive(&self, catalog: &Catalog) {
        let back = self.back.lock().unwrap();
        if let (Some(params), Some(_)) = (&back.active, &back.record) {
            catalog.keep_alive(params.name());
        }
    }
}
