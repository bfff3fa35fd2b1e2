//! Wroup discovery — advertise a group and find others on the local network.
//!
//! The [`DiscoveryCoordinator`] drives a [`DiscoveryBackend`] and feeds what
//! it finds into a [`ServiceRegistry`], which publishes [`DiscoveryEvent`]s.

pub mod backend;
pub mod coordinator;
pub mod event;
pub mod mdns;
pub mod registry;

pub use backend::{AdvertisementHandle, DiscoveryBackend, MemoryAir, MemoryBackend, SightingStream};
pub use coordinator::DiscoveryCoordinator;
pub use event::DiscoveryEvent;
pub use mdns::MdnsBackend;
pub use registry::ServiceRegistry;
