//! Discovery backend abstraction and the in-process backend.
//!
//! A backend publishes the local service and browses for others. Browsing
//! yields a lazy stream of sightings; the stream ending means the scan is
//! complete.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;
use wroup_types::{Attributes, Peer, ServiceRecord, WroupError};

/// Stream of sightings from one browse.
pub type SightingStream = BoxStream<'static, Result<ServiceRecord, WroupError>>;

/// Opaque handle to a published advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementHandle(String);

impl AdvertisementHandle {
    /// Wrap a backend-specific identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The backend-specific identifier.
    pub fn id(&self) -> &str {
        &self.0
    }
}

/// Advertise and browse services on the local network.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// Publish the local service.
    async fn advertise(&self, attributes: &Attributes) -> Result<AdvertisementHandle, WroupError>;

    /// Withdraw a previously published service.
    async fn withdraw(&self, handle: AdvertisementHandle) -> Result<(), WroupError>;

    /// Start a browse.
    async fn browse(&self) -> Result<SightingStream, WroupError>;

    /// Release browse resources once the caller stops reading the stream.
    fn cancel_browse(&self) {}
}

#[derive(Debug, Default)]
struct AirState {
    next_id: u64,
    adverts: BTreeMap<u64, ServiceRecord>,
}

/// A shared in-process medium. Every backend created from the same air sees
/// every other backend's advertisements.
#[derive(Debug, Clone, Default)]
pub struct MemoryAir {
    state: Arc<Mutex<AirState>>,
}

impl MemoryAir {
    /// An empty medium.
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend for the device `local`.
    pub fn backend(&self, local: Peer) -> MemoryBackend {
        MemoryBackend {
            air: self.clone(),
            local,
            fail_next_browse: AtomicBool::new(false),
            fail_next_advertise: AtomicBool::new(false),
        }
    }

    /// Number of live advertisements.
    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.adverts.len()
    }

    /// Whether nothing is advertised.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process backend; see [`MemoryAir`].
///
/// A browse yields a snapshot of every other device's advertisements and
/// then completes.
#[derive(Debug)]
pub struct MemoryBackend {
    air: MemoryAir,
    local: Peer,
    fail_next_browse: AtomicBool,
    fail_next_advertise: AtomicBool,
}

impl MemoryBackend {
    /// Make the next `browse` fail as if the radio were unavailable.
    pub fn fail_next_browse(&self) {
        self.fail_next_browse.store(true, Ordering::SeqCst);
    }

    /// Make the next `advertise` fail.
    pub fn fail_next_advertise(&self) {
        self.fail_next_advertise.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl DiscoveryBackend for MemoryBackend {
    async fn advertise(&self, attributes: &Attributes) -> Result<AdvertisementHandle, WroupError> {
        if self.fail_next_advertise.swap(false, Ordering::SeqCst) {
            return Err(WroupError::RegistrationFailed(
                "advertisement channel unavailable".to_string(),
            ));
        }
        let mut state = self.air.state.lock().unwrap_or_else(|e| e.into_inner());
        let id = state.next_id;
        state.next_id += 1;
        state
            .adverts
            .insert(id, ServiceRecord::new(self.local.clone(), attributes.clone()));
        debug!(peer = %self.local, id, "advertised on memory air");
        Ok(AdvertisementHandle::new(id.to_string()))
    }

    async fn withdraw(&self, handle: AdvertisementHandle) -> Result<(), WroupError> {
        let id: u64 = handle
            .id()
            .parse()
            .map_err(|_| WroupError::RegistrationFailed(format!("unknown handle {}", handle.id())))?;
        let mut state = self.air.state.lock().unwrap_or_else(|e| e.into_inner());
        state.adverts.remove(&id);
        Ok(())
    }

    async fn browse(&self) -> Result<SightingStream, WroupError> {
        if self.fail_next_browse.swap(false, Ordering::SeqCst) {
            return Err(WroupError::DiscoveryUnavailable(
                "radio unavailable".to_string(),
            ));
        }
        let state = self.air.state.lock().unwrap_or_else(|e| e.into_inner());
        let seen: Vec<_> = state
            .adverts
            .values()
            .filter(|r| !r.peer.same_device(&self.local))
            .cloned()
            .map(Ok)
            .collect();
        Ok(stream::iter(seen).boxed())
    }
}
