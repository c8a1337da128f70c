// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// ShmClient — per-plugin-instance aggregator.
//
// Scans the plugin's port metadata for stream channel groups, owns one
// AudioSend/AudioReturn per group, and drives them in lockstep with the
// plugin's buffer cycle: begin → pre_process (pull returns into port
// buffers) → plugin process() → post_process (push port buffers out) →
// end. Returns are read before the plugin runs and sends are written
// after, the usual pull/push ordering of an audio graph.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::mailbox::StreamName;
use crate::ret::AudioReturn;
use crate::send::AudioSend;
use crate::stream::{MAX_STREAM_CHANNELS, MAX_STREAM_LENGTH};

/// Smallest ring length a client ever publishes, in frames.
pub const MIN_STREAM_LENGTH: u32 = 2048;

/// Published ring length is this multiple of the host buffer size.
const STREAM_LENGTH_FACTOR: u32 = 4;

/// Default maintenance period for [`SharedCatalogFactory`].
pub const DEFAULT_MAINTENANCE_PERIOD: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Port metadata
// ---------------------------------------------------------------------------

/// Role of one plugin port in the stream wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRole {
    /// One channel of an outgoing stream group.
    SendChannel,
    /// One channel of an incoming stream group.
    ReturnChannel,
    /// String port carrying the user-chosen name for a send group.
    SendName,
    /// String port carrying the user-chosen name for a return group.
    ReturnName,
}

/// Static description of one port, as scanned from the plugin metadata.
#[derive(Debug, Clone)]
pub struct PortMeta {
    /// Unique port identifier.
    pub id: String,
    pub role: PortRole,
    /// Group identifier shared by all ports of one logical stream.
    pub group: String,
    /// Channel index within the group (channel ports only).
    pub index: u32,
}

impl PortMeta {
    pub fn channel(id: &str, role: PortRole, group: &str, index: u32) -> Self {
        Self {
            id: id.to_string(),
            role,
            group: group.to_string(),
            index,
        }
    }

    pub fn name(id: &str, role: PortRole, group: &str) -> Self {
        Self {
            id: id.to_string(),
            role,
            group: group.to_string(),
            index: 0,
        }
    }
}

/// Host-side access to live port values during one buffer cycle.
///
/// All methods are called on the real-time thread and must not allocate
/// or block; lookups by id are expected to be simple map reads.
pub trait PortSet {
    /// Current value of a string (name) port.
    fn name_value(&self, port_id: &str) -> &str;

    /// Audio buffer of a channel port, for reading (send direction).
    fn channel_data(&self, port_id: &str) -> &[f32];

    /// Audio buffer of a channel port, for writing (return direction).
    fn channel_data_mut(&mut self, port_id: &str) -> &mut [f32];

    /// Raise the cleanup flag for a return group whose stream is gone,
    /// so downstream DSP clears stale buffers.
    fn request_cleanup(&mut self, group: &str);
}

// ---------------------------------------------------------------------------
// Catalog factory
// ---------------------------------------------------------------------------

/// Source of the shared per-process [`Catalog`] instance.
pub trait CatalogFactory: Send + Sync {
    fn acquire(&self) -> Result<Arc<Catalog>>;

    /// Return a catalog obtained from [`acquire`](Self::acquire). The
    /// default just drops the reference.
    fn release(&self, catalog: Arc<Catalog>) {
        drop(catalog);
    }
}

/// Factory caching one catalog per domain, started with a maintenance
/// thread on first acquire and torn down when the last holder releases.
pub struct SharedCatalogFactory {
    domain: String,
    period: Duration,
    cached: Mutex<Weak<Catalog>>,
}

impl SharedCatalogFactory {
    pub fn new(domain: &str) -> Self {
        Self::with_period(domain, DEFAULT_MAINTENANCE_PERIOD)
    }

    pub fn with_period(domain: &str, period: Duration) -> Self {
        Self {
            domain: domain.to_string(),
            period,
            cached: Mutex::new(Weak::new()),
        }
    }
}

impl CatalogFactory for SharedCatalogFactory {
    fn acquire(&self) -> Result<Arc<Catalog>> {
        let mut cached = self.cached.lock().unwrap();
        if let Some(catalog) = cached.upgrade() {
            return Ok(catalog);
        }
        let catalog = Arc::new(Catalog::open(&self.domain)?);
        catalog.start_maintenance(self.period)?;
        *cached = Arc::downgrade(&catalog);
        Ok(catalog)
    }
}

// ---------------------------------------------------------------------------
// Bindings
// ---------------------------------------------------------------------------

struct SendBinding {
    send: AudioSend,
    group: String,
    name_port: Option<String>,
    channel_ports: Vec<String>, // ordered by channel index
    pinned: StreamName,
    force: bool,
}

struct ReturnBinding {
    ret: AudioReturn,
    group: String,
    name_port: Option<String>,
    channel_ports: Vec<String>,
    pinned: StreamName,
    force: bool,
}

#[derive(Default)]
struct GroupBuild {
    channels: BTreeMap<u32, String>,
    name_port: Option<String>,
}

impl GroupBuild {
    /// Channel port ids ordered 0..=max. Holes and duplicates are
    /// metadata bugs, not runtime conditions.
    fn channel_ports(&self) -> Result<Vec<String>> {
        let Some(&max) = self.channels.keys().next_back() else {
            return Err(Error::BadArguments);
        };
        if max >= MAX_STREAM_CHANNELS || self.channels.len() != max as usize + 1 {
            return Err(Error::BadArguments);
        }
        Ok(self.channels.values().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// ShmClient
// ---------------------------------------------------------------------------

/// Owner of all sends/returns for one plugin instance.
pub struct ShmClient {
    sends: Vec<SendBinding>,
    returns: Vec<ReturnBinding>,
    catalog: Option<Arc<Catalog>>,
    factory: Option<Arc<dyn CatalogFactory>>,
    buffer_size: u32,
    sample_rate: u32,
}

impl ShmClient {
    pub fn new() -> Self {
        Self {
            sends: Vec::new(),
            returns: Vec::new(),
            catalog: None,
            factory: None,
            buffer_size: 0,
            sample_rate: 0,
        }
    }

    /// Scan `ports`, build one send/return per channel group, and attach
    /// everything to the factory's shared catalog. A catalog is only
    /// acquired when at least one group exists.
    pub fn init(&mut self, factory: Arc<dyn CatalogFactory>, ports: &[PortMeta]) -> Result<()> {
        let mut send_groups: BTreeMap<String, GroupBuild> = BTreeMap::new();
        let mut return_groups: BTreeMap<String, GroupBuild> = BTreeMap::new();

        for port in ports {
            let (groups, is_name) = match port.role {
                PortRole::SendChannel => (&mut send_groups, false),
                PortRole::SendName => (&mut send_groups, true),
                PortRole::ReturnChannel => (&mut return_groups, false),
                PortRole::ReturnName => (&mut return_groups, true),
            };
            let build = groups.entry(port.group.clone()).or_default();
            if is_name {
                if build.name_port.replace(port.id.clone()).is_some() {
                    return Err(Error::BadArguments);
                }
            } else if build.channels.insert(port.index, port.id.clone()).is_some() {
                return Err(Error::BadArguments);
            }
        }

        if send_groups.is_empty() && return_groups.is_empty() {
            return Ok(());
        }

        let catalog = factory.acquire()?;

        for (group, build) in send_groups {
            let channel_ports = build.channel_ports()?;
            let send = AudioSend::new();
            send.attach(&catalog);
            self.sends.push(SendBinding {
                send,
                group,
                name_port: build.name_port,
                channel_ports,
                pinned: StreamName::EMPTY,
                force: false,
            });
        }
        for (group, build) in return_groups {
            let channel_ports = build.channel_ports()?;
            let ret = AudioReturn::new();
            ret.attach(&catalog);
            self.returns.push(ReturnBinding {
                ret,
                group,
                name_port: build.name_port,
                channel_ports,
                pinned: StreamName::EMPTY,
                force: false,
            });
        }

        log::debug!(
            "client: bound {} send group(s), {} return group(s)",
            self.sends.len(),
            self.returns.len()
        );
        self.catalog = Some(catalog);
        self.factory = Some(factory);
        Ok(())
    }

    fn stream_length(&self) -> u32 {
        (self.buffer_size * STREAM_LENGTH_FACTOR)
            .max(MIN_STREAM_LENGTH)
            .min(MAX_STREAM_LENGTH)
    }

    /// Update the host buffer size. A change invalidates the published
    /// shm layout, so every send is forced to republish.
    pub fn set_buffer_size(&mut self, size: u32) {
        if self.buffer_size == size {
            return;
        }
        self.buffer_size = size;
        for binding in &mut self.sends {
            binding.force = true;
            binding.send.mark_for_republish();
        }
    }

    /// Update the host sample rate; forces republish like a buffer-size
    /// change.
    pub fn set_sample_rate(&mut self, rate: u32) {
        if self.sample_rate == rate {
            return;
        }
        self.sample_rate = rate;
        for binding in &mut self.sends {
            binding.force = true;
            binding.send.mark_for_republish();
        }
    }

    pub fn send_count(&self) -> usize {
        self.sends.len()
    }

    pub fn return_count(&self) -> usize {
        self.returns.len()
    }

    pub fn send(&self, group: &str) -> Option<&AudioSend> {
        self.sends
            .iter()
            .find(|b| b.group == group)
            .map(|b| &b.send)
    }

    pub fn ret(&self, group: &str) -> Option<&AudioReturn> {
        self.returns
            .iter()
            .find(|b| b.group == group)
            .map(|b| &b.ret)
    }

    // --- RT cycle -----------------------------------------------------------

    /// Open I/O brackets on every send and return, picking up name-port
    /// edits on the way. Real-time safe.
    pub fn begin(&mut self, samples: u32, ports: &dyn PortSet) {
        let length = self.stream_length();
        for binding in &mut self.sends {
            if let Some(name_port) = &binding.name_port {
                let name = ports.name_value(name_port);
                if binding.force || binding.pinned != *name {
                    binding.pinned = StreamName::new(name).unwrap_or_default();
                    binding.force = false;
                    if binding.pinned.is_empty() {
                        binding.send.revoke();
                    } else {
                        binding.send.publish(
                            binding.pinned.as_str(),
                            binding.channel_ports.len() as u32,
                            length,
                        );
                    }
                }
            }
            let _ = binding.send.begin(samples);
        }
        for binding in &mut self.returns {
            if let Some(name_port) = &binding.name_port {
                let name = ports.name_value(name_port);
                if binding.force || binding.pinned != *name {
                    binding.pinned = StreamName::new(name).unwrap_or_default();
                    binding.force = false;
                    if binding.pinned.is_empty() {
                        binding.ret.disconnect();
                    } else {
                        binding.ret.connect(binding.pinned.as_str());
                    }
                }
            }
            let _ = binding.ret.begin(samples);
        }
    }

    /// Pull sanitized return audio into the bound port buffers. Inactive
    /// returns zero-fill and raise the group's cleanup flag.
    pub fn pre_process(&mut self, samples: u32, ports: &mut dyn PortSet) {
        for binding in &self.returns {
            let live = binding.ret.active() || binding.ret.stalled();
            for (channel, port_id) in binding.channel_ports.iter().enumerate() {
                let buf = ports.channel_data_mut(port_id);
                let n = (samples as usize).min(buf.len());
                let _ = binding.ret.read_sanitized(channel as u32, &mut buf[..n]);
            }
            if !live {
                ports.request_cleanup(&binding.group);
            }
        }
    }

    /// Push sanitized port buffers out through every active send.
    pub fn post_process(&mut self, samples: u32, ports: &dyn PortSet) {
        for binding in &self.sends {
            if !binding.send.active() {
                continue;
            }
            for (channel, port_id) in binding.channel_ports.iter().enumerate() {
                let buf = ports.channel_data(port_id);
                let n = (samples as usize).min(buf.len());
                let _ = binding.send.write_sanitized(channel as u32, &buf[..n]);
            }
        }
    }

    /// Close every bracket opened by [`begin`](Self::begin).
    pub fn end(&mut self) {
        for binding in &self.sends {
            let _ = binding.send.end();
        }
        for binding in &self.returns {
            let _ = binding.ret.end();
        }
    }

    /// Detach and drop every send/return and release the shared catalog.
    /// Idempotent; must not run concurrently with an RT cycle.
    pub fn destroy(&mut self) {
        for binding in self.sends.drain(..) {
            binding.send.detach();
        }
        for binding in self.returns.drain(..) {
            binding.ret.detach();
        }
        if let Some(catalog) = self.catalog.take() {
            if let Some(factory) = self.factory.take() {
                factory.release(catalog);
            }
        }
    }
}

impl Default for ShmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ShmClient {
    fn drop(&mut self) {
        self.destroy();
    }
}
