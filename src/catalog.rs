// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared-memory stream catalog: the directory that maps a human-chosen
// stream name to the shared-memory segment currently backing it.
//
// Every process that opens the same domain maps the same table. A
// spinlock in the table header guards mutations; it is only ever taken
// on non-real-time threads. Reservation bumps the per-slot version and
// derives a fresh segment id, which is how racing publishers settle:
// the later reservation wins, the earlier one notices its cached record
// no longer matches and yields.
//
// Liveness is a TTL heartbeat: publishers and subscribers refresh
// `last_alive` through keep_alive(); entries nobody refreshes age out
// of the table in gc().

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::mailbox::MAX_NAME_LEN;
use crate::shm::{Segment, SegmentMode};

/// Maximum number of records per catalog domain.
pub const MAX_RECORDS: usize = 32;

/// Maximum domain name length, in bytes.
pub const MAX_DOMAIN_LEN: usize = 32;

/// Records not kept alive within this window are garbage-collected.
pub const CATALOG_TTL: Duration = Duration::from_secs(10);

const NAME_BYTES: usize = MAX_NAME_LEN + 1;

// ---------------------------------------------------------------------------
// Shared memory layout — zero-filled fresh segments are a valid empty table.
// ---------------------------------------------------------------------------

#[repr(C)]
struct CatalogEntry {
    magic: u32,
    version: u32,
    name: [u8; NAME_BYTES],
    id: [u8; NAME_BYTES],
    last_alive: i64, // unix seconds
}

impl CatalogEntry {
    fn active(&self) -> bool {
        self.name[0] != 0
    }

    fn name_str(&self) -> &str {
        str_of(&self.name)
    }

    fn clear(&mut self) {
        *self = unsafe { std::mem::zeroed() };
    }
}

#[repr(C)]
struct CatalogData {
    spinlock: AtomicI32,
    _pad: u32,
    entries: [CatalogEntry; MAX_RECORDS],
}

impl CatalogData {
    fn lock(&self) {
        while self
            .spinlock
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn unlock(&self) {
        self.spinlock.store(0, Ordering::Release);
    }
}

fn str_of(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end]).unwrap_or("")
}

fn copy_str(dst: &mut [u8; NAME_BYTES], src: &str) {
    let bytes = src.as_bytes();
    let len = bytes.len().min(NAME_BYTES - 1);
    dst[..len].copy_from_slice(&bytes[..len]);
    dst[len..].fill(0);
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// CatalogRecord — owned copy handed to clients
// ---------------------------------------------------------------------------

/// A copy of one catalog entry.
///
/// Clients cache the record they resolved and detect "the catalog entry
/// changed under us" via [`matches`](Self::matches).
#[derive(Clone, Debug)]
pub struct CatalogRecord {
    pub magic: u32,
    pub version: u32,
    pub index: i32,
    /// Shared-memory segment id backing the stream.
    pub id: String,
    pub name: String,
}

impl CatalogRecord {
    /// Identity comparison over (magic, version, index, id).
    pub fn matches(&self, other: &CatalogRecord) -> bool {
        self.magic == other.magic
            && self.version == other.version
            && self.index == other.index
            && self.id == other.id
    }
}

// ---------------------------------------------------------------------------
// CatalogClient — the protocol the maintenance cycle drives
// ---------------------------------------------------------------------------

/// Background-side contract between a send/return and the catalog.
///
/// All three methods run on the maintenance thread, never on the
/// real-time thread; they may block and allocate. Returning `false`
/// from `update` or `apply` is fatal — the catalog drops the client.
pub trait CatalogClient: Send + Sync {
    /// Re-validate cached state against the current catalog contents.
    fn update(&self, catalog: &Catalog) -> bool;

    /// Drain and execute a pending publish/connect request.
    fn apply(&self, catalog: &Catalog) -> bool;

    /// Refresh the records this client depends on.
    fn keep_alive(&self, catalog: &Catalog);
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// A shared-memory stream directory plus the client registry and the
/// background maintenance thread that serves it.
pub struct Catalog {
    shm: Segment,
    domain: String,
    clients: Mutex<Vec<Weak<dyn CatalogClient>>>,
    maint: Mutex<Option<thread::JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl Catalog {
    fn segment_name(domain: &str) -> String {
        format!("shmstream.catalog.{domain}")
    }

    /// Open (or create) the catalog for `domain`.
    pub fn open(domain: &str) -> Result<Self> {
        if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
            return Err(Error::BadArguments);
        }
        let shm = Segment::acquire(
            &Self::segment_name(domain),
            std::mem::size_of::<CatalogData>(),
            SegmentMode::CreateOrOpen,
        )?;
        Ok(Self {
            shm,
            domain: domain.to_string(),
            clients: Mutex::new(Vec::new()),
            maint: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    fn locked<R>(&self, f: impl FnOnce(&mut CatalogData) -> R) -> R {
        let data = unsafe { &mut *(self.shm.as_mut_ptr() as *mut CatalogData) };
        data.lock();
        let result = f(data);
        data.unlock();
        result
    }

    fn record_of(entry: &CatalogEntry, index: usize) -> CatalogRecord {
        CatalogRecord {
            magic: entry.magic,
            version: entry.version,
            index: index as i32,
            id: str_of(&entry.id).to_string(),
            name: entry.name_str().to_string(),
        }
    }

    /// Look up a record by name.
    pub fn get(&self, name: &str) -> Result<CatalogRecord> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(Error::BadArguments);
        }
        self.locked(|data| {
            for (i, e) in data.entries.iter().enumerate() {
                if e.active() && e.name_str() == name {
                    return Ok(Self::record_of(e, i));
                }
            }
            Err(Error::NotFound)
        })
    }

    /// Claim `name` for a publisher of type `magic`.
    ///
    /// Always re-reserves: an existing entry gets its version bumped and
    /// a fresh segment id, so the previous owner can detect it lost the
    /// slot. A missing entry is created in a free slot (`NoMem` when the
    /// table is full).
    pub fn get_or_reserve(&self, name: &str, magic: u32) -> Result<CatalogRecord> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(Error::BadArguments);
        }
        let domain = self.domain.clone();
        self.locked(|data| {
            for (i, e) in data.entries.iter_mut().enumerate() {
                if e.active() && e.name_str() == name {
                    e.magic = magic;
                    e.version = e.version.wrapping_add(1);
                    let id = derive_id(&domain, i, e.version);
                    copy_str(&mut e.id, &id);
                    e.last_alive = now_secs();
                    return Ok(Self::record_of(e, i));
                }
            }
            for (i, e) in data.entries.iter_mut().enumerate() {
                if !e.active() {
                    e.clear();
                    copy_str(&mut e.name, name);
                    e.magic = magic;
                    e.version = 1;
                    let id = derive_id(&domain, i, 1);
                    copy_str(&mut e.id, &id);
                    e.last_alive = now_secs();
                    return Ok(Self::record_of(e, i));
                }
            }
            Err(Error::NoMem)
        })
    }

    /// Refresh the liveness timestamp of `name`. Returns `false` when
    /// the entry no longer exists.
    pub fn keep_alive(&self, name: &str) -> bool {
        self.locked(|data| {
            for e in data.entries.iter_mut() {
                if e.active() && e.name_str() == name {
                    e.last_alive = now_secs();
                    return true;
                }
            }
            false
        })
    }

    /// Drop entries whose heartbeat is older than `ttl`. Returns the
    /// number of entries removed.
    pub fn gc(&self, ttl: Duration) -> usize {
        let deadline = now_secs() - ttl.as_secs() as i64;
        self.locked(|data| {
            let mut removed = 0;
            for e in data.entries.iter_mut() {
                if e.active() && e.last_alive < deadline {
                    log::debug!("catalog[{}]: expiring '{}'", self.domain, e.name_str());
                    e.clear();
                    removed += 1;
                }
            }
            removed
        })
    }

    /// Wipe the whole table.
    pub fn clear(&self) {
        self.locked(|data| {
            for e in data.entries.iter_mut() {
                e.clear();
            }
        });
    }

    // --- client registry ---------------------------------------------------

    /// Register a client with the maintenance cycle. Idempotent.
    pub fn attach(&self, client: &Arc<dyn CatalogClient>) {
        let mut clients = self.clients.lock().unwrap();
        let ptr = Arc::as_ptr(client) as *const ();
        if clients
            .iter()
            .any(|w| std::ptr::eq(w.as_ptr() as *const (), ptr))
        {
            return;
        }
        clients.push(Arc::downgrade(client));
    }

    /// Unregister a client. Idempotent; unknown clients are ignored.
    pub fn detach(&self, client: &Arc<dyn CatalogClient>) {
        let mut clients = self.clients.lock().unwrap();
        let ptr = Arc::as_ptr(client) as *const ();
        clients.retain(|w| !std::ptr::eq(w.as_ptr() as *const (), ptr));
    }

    /// Number of live attached clients.
    pub fn client_count(&self) -> usize {
        self.clients
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// One maintenance pass: drive every attached client, then collect
    /// expired records. Never called on the real-time thread.
    pub fn service(&self) {
        let live: Vec<Arc<dyn CatalogClient>> = {
            let mut clients = self.clients.lock().unwrap();
            clients.retain(|w| w.strong_count() > 0);
            clients.iter().filter_map(|w| w.upgrade()).collect()
        };

        for client in &live {
            let ok = client.apply(self) && client.update(self);
            if !ok {
                log::warn!("catalog[{}]: dropping failed client", self.domain);
                let ptr = Arc::as_ptr(client) as *const ();
                self.clients
                    .lock()
                    .unwrap()
                    .retain(|w| !std::ptr::eq(w.as_ptr() as *const (), ptr));
                continue;
            }
            client.keep_alive(self);
        }

        self.gc(CATALOG_TTL);
    }

    // --- maintenance thread ------------------------------------------------

    /// Spawn the background maintenance thread, calling [`service`] every
    /// `period`. No-op when already running.
    pub fn start_maintenance(self: &Arc<Self>, period: Duration) -> io::Result<()> {
        let mut guard = self.maint.lock().unwrap();
        if guard.is_some() {
            return Ok(());
        }
        self.shutdown.store(false, Ordering::Relaxed);
        let weak = Arc::downgrade(self);
        let handle = thread::Builder::new()
            .name("shmstream-catalog".into())
            .spawn(move || loop {
                let Some(catalog) = weak.upgrade() else { break };
                if catalog.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                catalog.service();
                drop(catalog);
                thread::sleep(period);
            })?;
        *guard = Some(handle);
        log::debug!("catalog[{}]: maintenance started", self.domain);
        Ok(())
    }

    /// Stop and join the maintenance thread. No-op when not running.
    pub fn stop_maintenance(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let handle = self.maint.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
            log::debug!("catalog[{}]: maintenance stopped", self.domain);
        }
    }
}

impl Drop for Catalog {
    fn drop(&mut self) {
        self.stop_maintenance();
    }
}

fn derive_id(domain: &str, index: usize, version: u32) -> String {
    format!("{domain}.s{index:02}.v{version}")
}
