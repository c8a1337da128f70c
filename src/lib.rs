// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Lock-free shared-memory audio stream transport between plugin instances.
//
// Independent plugin instances — possibly in different processes —
// publish and subscribe to named multi-channel audio streams through a
// shared-memory catalog. The real-time audio thread never locks,
// allocates, or blocks: all catalog lookups, stream creation/teardown,
// and garbage collection happen on a background maintenance thread,
// with single-slot atomic mailboxes carrying state between the two.

mod error;
pub use error::{Error, Result};

mod shm;
pub use shm::{Segment, SegmentMode};

mod osc;
pub use osc::OscRing;

mod mailbox;
pub use mailbox::{
    ConnectionStatus, RequestPool, RequestSlot, StateCell, StreamName, StreamParams, MAX_NAME_LEN,
    REQUEST_SLOTS,
};

mod stream;
pub use stream::{
    sanitize, AudioStream, StreamHandle, MAX_STREAM_CHANNELS, MAX_STREAM_LENGTH, STREAM_MAGIC,
};

mod catalog;
pub use catalog::{
    Catalog, CatalogClient, CatalogRecord, CATALOG_TTL, MAX_DOMAIN_LEN, MAX_RECORDS,
};

mod send;
pub use send::AudioSend;

mod ret;
pub use ret::{AudioReturn, STALL_THRESHOLD};

mod client;
pub use client::{
    CatalogFactory, PortMeta, PortRole, PortSet, SharedCatalogFactory, ShmClient,
    DEFAULT_MAINTENANCE_PERIOD, MIN_STREAM_LENGTH,
};

pub mod rt;
