//! Peer identity.
//!
//! A [`Peer`] is a device sighted on the local ad-hoc network. Its identity is
//! the pair `(name, hardware_address)`; the socket endpoint and the
//! user-assigned alias can change without changing who the peer is, so a
//! `Peer` stays usable as a map or set key across endpoint updates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

/// A device participating in the ad-hoc network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    /// Display name reported by the radio stack.
    pub name: String,
    /// Hardware address. Unique on the local segment and used as the dedup key.
    pub hardware_address: String,
    /// Data socket endpoint, present once a link has been established.
    #[serde(default)]
    pub endpoint: Option<SocketAddr>,
    /// User-overridable display name. Not part of identity.
    #[serde(default)]
    pub alias: Option<String>,
}

impl Peer {
    /// Create a peer from a radio-level sighting. Endpoint and alias are unset.
    pub fn new(name: impl Into<String>, hardware_address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hardware_address: hardware_address.into(),
            endpoint: None,
            alias: None,
        }
    }

    /// Return this peer with its data socket endpoint populated.
    pub fn with_endpoint(mut self, ip: IpAddr, port: u16) -> Self {
        self.endpoint = Some(SocketAddr::new(ip, port));
        self
    }

    /// Return this peer with a user-assigned alias.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Set the endpoint in place.
    pub fn set_endpoint(&mut self, ip: IpAddr, port: u16) {
        self.endpoint = Some(SocketAddr::new(ip, port));
    }

    /// The alias if one is set, otherwise the radio-reported name.
    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Whether both values describe the same physical device.
    pub fn same_device(&self, other: &Peer) -> bool {
        self.hardware_address == other.hardware_address
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.hardware_address == other.hardware_address
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.hardware_address.hash(state);
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer[name={}][hw={}]", self.name, self.hardware_address)?;
        match self.endpoint {
            Some(addr) => write!(f, "[endpoint={addr}]")?,
            None => write!(f, "[endpoint=-]")?,
        }
        match &self.alias {
            Some(alias) => write!(f, "[alias={alias}]"),
            None => write!(f, "[alias=-]"),
        }
    }
}
