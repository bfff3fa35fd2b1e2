//! Advertised service records.

use crate::peer::Peer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Service metadata: unique string keys to string values.
pub type Attributes = BTreeMap<String, String>;

/// Attribute carrying the TCP port the group owner accepts links on.
pub const SERVICE_PORT_KEY: &str = "SERVICE_PORT";
/// Attribute identifying the protocol; see [`SERVICE_NAME_VALUE`].
pub const SERVICE_NAME_KEY: &str = "SERVICE_NAME";
/// Value of [`SERVICE_NAME_KEY`] for services speaking this protocol.
pub const SERVICE_NAME_VALUE: &str = "WROUP";
/// Attribute carrying the human-readable group name.
pub const GROUP_NAME_KEY: &str = "GROUP_NAME";

/// A peer together with the metadata it advertises.
///
/// Dedup only ever looks at [`ServiceRecord::peer`]; two records for the same
/// peer with different attributes describe the same service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// The advertising device.
    pub peer: Peer,
    /// Advertised key/value metadata.
    pub attributes: Attributes,
}

impl ServiceRecord {
    /// Create a record from a sighting.
    pub fn new(peer: Peer, attributes: Attributes) -> Self {
        Self { peer, attributes }
    }

    /// Look up an attribute.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// The advertised link port, if present and numeric.
    pub fn service_port(&self) -> Option<u16> {
        self.attribute(SERVICE_PORT_KEY)?.parse().ok()
    }

    /// The advertised group name.
    pub fn group_name(&self) -> Option<&str> {
        self.attribute(GROUP_NAME_KEY)
    }

    /// Whether the record advertises this protocol (case-insensitive).
    pub fn is_wroup_service(&self) -> bool {
        self.attribute(SERVICE_NAME_KEY)
            .is_some_and(|v| v.eq_ignore_ascii_case(SERVICE_NAME_VALUE))
    }
}

/// Build the attribute map published for a local group.
///
/// User-supplied attributes win over the defaults, except that the protocol
/// marker is always present.
pub fn group_attributes(group_name: &str, port: u16, custom: &Attributes) -> Attributes {
    let mut attrs = Attributes::new();
    attrs.insert(SERVICE_PORT_KEY.to_string(), port.to_string());
    attrs.insert(GROUP_NAME_KEY.to_string(), group_name.to_string());
    for (k, v) in custom {
        attrs.insert(k.clone(), v.clone());
    }
    attrs.insert(SERVICE_NAME_KEY.to_string(), SERVICE_NAME_VALUE.to_string());
    attrs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_well_known_attributes() {
        let record = ServiceRecord::new(
            Peer::new("host", "aa"),
            attrs(&[
                (SERVICE_PORT_KEY, "9999"),
                (GROUP_NAME_KEY, "picnic"),
                (SERVICE_NAME_KEY, "wroup"),
            ]),
        );
        assert_eq!(record.service_port(), Some(9999));
        assert_eq!(record.group_name(), Some("picnic"));
        assert!(record.is_wroup_service());
    }

    #[test]
    fn test_bad_port_is_none() {
        let record = ServiceRecord::new(
            Peer::new("host", "aa"),
            attrs(&[(SERVICE_PORT_KEY, "not-a-port")]),
        );
        assert_eq!(record.service_port(), None);
        assert!(!record.is_wroup_service());
    }

    #[test]
    fn test_group_attributes_override_and_marker() {
        let custom = attrs(&[("role", "host"), (SERVICE_NAME_KEY, "other")]);
        let out = group_attributes("picnic", 9000, &custom);
        assert_eq!(out.get("role").map(String::as_str), Some("host"));
        assert_eq!(out.get(SERVICE_PORT_KEY).map(String::as_str), Some("9000"));
        assert_eq!(
            out.get(SERVICE_NAME_KEY).map(String::as_str),
            Some(SERVICE_NAME_VALUE)
        );
    }
}
