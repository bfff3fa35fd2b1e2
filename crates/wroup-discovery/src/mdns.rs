//! mDNS backend using mdns-sd.
//!
//! The local service is registered under the configured service type with
//! its attributes as TXT properties, plus two properties naming the device.
//! Browsing maps resolved services back into [`ServiceRecord`]s. mDNS never
//! reports a finished scan, so rounds end by timeout or by `stop_discovering`.

use crate::backend::{AdvertisementHandle, DiscoveryBackend, SightingStream};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::net::IpAddr;
use tracing::{debug, info, warn};
use wroup_types::config::DEFAULT_PORT;
use wroup_types::service::SERVICE_PORT_KEY;
use wroup_types::{Attributes, Peer, ServiceRecord, WroupError};

/// TXT property carrying the advertiser's device name.
const PROP_PEER_NAME: &str = "peer_name";
/// TXT property carrying the advertiser's hardware address.
const PROP_PEER_HW: &str = "peer_hw";

/// Discovery over multicast DNS.
pub struct MdnsBackend {
    daemon: ServiceDaemon,
    service_type: String,
    local: Peer,
}

impl MdnsBackend {
    /// Start an mDNS daemon for the device `local`.
    pub fn new(service_type: impl Into<String>, local: Peer) -> Result<Self, WroupError> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| WroupError::DiscoveryUnavailable(format!("mDNS daemon: {e}")))?;
        Ok(Self {
            daemon,
            service_type: service_type.into(),
            local,
        })
    }

    fn instance_name(&self) -> String {
        let hw: String = self
            .local
            .hardware_address
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        format!("{}-{}", host_label(&self.local.name), hw)
    }
}

/// Reduce a device name to a valid DNS label.
fn host_label(name: &str) -> String {
    let label: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let label = label.trim_matches('-');
    if label.is_empty() {
        "wroup-device".to_string()
    } else {
        label.to_string()
    }
}

/// TXT properties for an advertisement: user attributes plus identity.
fn txt_properties(local: &Peer, attributes: &Attributes) -> Vec<(String, String)> {
    let mut props: Vec<(String, String)> = attributes
        .iter()
        .filter(|(k, _)| k.as_str() != PROP_PEER_NAME && k.as_str() != PROP_PEER_HW)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    props.push((PROP_PEER_NAME.to_string(), local.name.clone()));
    props.push((PROP_PEER_HW.to_string(), local.hardware_address.clone()));
    props
}

/// Split resolved TXT properties into the advertiser's identity and its
/// attributes. Falls back to the instance name when identity is missing.
fn record_from_properties(
    fullname: &str,
    mut attributes: Attributes,
    endpoint: Option<(IpAddr, u16)>,
) -> ServiceRecord {
    let instance = fullname.split('.').next().unwrap_or(fullname).to_string();
    let name = attributes.remove(PROP_PEER_NAME).unwrap_or_else(|| instance.clone());
    let hw = attributes.remove(PROP_PEER_HW).unwrap_or(instance);
    let mut peer = Peer::new(name, hw);
    if let Some((ip, port)) = endpoint {
        peer.set_endpoint(ip, port);
    }
    ServiceRecord::new(peer, attributes)
}

#[async_trait]
impl DiscoveryBackend for MdnsBackend {
    async fn advertise(&self, attributes: &Attributes) -> Result<AdvertisementHandle, WroupError> {
        let port = attributes
            .get(SERVICE_PORT_KEY)
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let host = format!("{}.local.", host_label(&self.local.name));
        let props = txt_properties(&self.local, attributes);

        let service = ServiceInfo::new(
            &self.service_type,
            &self.instance_name(),
            &host,
            "",
            port,
            &props[..],
        )
        .map_err(|e| WroupError::RegistrationFailed(format!("mDNS service info: {e}")))?
        .enable_addr_auto();

        let fullname = service.get_fullname().to_string();
        self.daemon
            .register(service)
            .map_err(|e| WroupError::RegistrationFailed(format!("mDNS register: {e}")))?;
        info!("mDNS: registered {} on port {}", fullname, port);
        Ok(AdvertisementHandle::new(fullname))
    }

    async fn withdraw(&self, handle: AdvertisementHandle) -> Result<(), WroupError> {
        self.daemon
            .unregister(handle.id())
            .map_err(|e| WroupError::RegistrationFailed(format!("mDNS unregister: {e}")))?;
        info!("mDNS: unregistered {}", handle.id());
        Ok(())
    }

    async fn browse(&self) -> Result<SightingStream, WroupError> {
        let receiver = self
            .daemon
            .browse(&self.service_type)
            .map_err(|e| WroupError::DiscoveryUnavailable(format!("mDNS browse: {e}")))?;
        let local = self.local.clone();

        let sightings = stream::unfold(receiver, move |receiver| {
            let local = local.clone();
            async move {
                loop {
                    let event = match receiver.recv_async().await {
                        Ok(event) => event,
                        Err(_) => {
                            debug!("mDNS browse channel closed");
                            return None;
                        }
                    };
                    let ServiceEvent::ServiceResolved(info) = event else {
                        continue;
                    };

                    let endpoint = info
                        .get_addresses()
                        .iter()
                        .find_map(|a| a.to_string().parse::<IpAddr>().ok())
                        .map(|ip| (ip, info.get_port()));
                    let attributes: Attributes = info
                        .get_properties()
                        .iter()
                        .map(|p| (p.key().to_string(), p.val_str().to_string()))
                        .collect();
                    let record = record_from_properties(info.get_fullname(), attributes, endpoint);

                    if record.peer.same_device(&local) {
                        continue;
                    }
                    if !record.is_wroup_service() {
                        debug!("mDNS: ignoring foreign service {}", info.get_fullname());
                        continue;
                    }
                    return Some((Ok(record), receiver));
                }
            }
        });
        Ok(sightings.boxed())
    }

    fn cancel_browse(&self) {
        if let Err(e) = self.daemon.stop_browse(&self.service_type) {
            debug!("mDNS: stop browse: {e}");
        }
    }
}

impl Drop for MdnsBackend {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.shutdown() {
            warn!("mDNS: failed to shut down daemon: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wroup_types::service::{group_attributes, GROUP_NAME_KEY};

    #[test]
    fn test_host_label() {
        assert_eq!(host_label("Pixel 7 (Ana)"), "Pixel-7--Ana");
        assert_eq!(host_label("***"), "wroup-device");
    }

    #[test]
    fn test_properties_roundtrip_identity() {
        let local = Peer::new("owner", "02:00:00:00:00:01");
        let attrs = group_attributes("party", 9999, &Attributes::new());
        let props: Attributes = txt_properties(&local, &attrs).into_iter().collect();

        let record = record_from_properties(
            "owner-020000000001._wroup._tcp.local.",
            props,
            Some(("192.168.49.1".parse().unwrap(), 9999)),
        );
        assert_eq!(record.peer, local);
        assert_eq!(record.peer.endpoint, Some("192.168.49.1:9999".parse().unwrap()));
        assert_eq!(record.attributes, attrs);
        assert_eq!(record.attribute(GROUP_NAME_KEY), Some("party"));
        assert!(record.is_wroup_service());
    }

    #[test]
    fn test_identity_falls_back_to_instance() {
        let record = record_from_properties("someone._wroup._tcp.local.", Attributes::new(), None);
        assert_eq!(record.peer.name, "someone");
        assert_eq!(record.peer.hardware_address, "someone");
        assert!(record.peer.endpoint.is_none());
    }

    #[test]
    fn test_user_attributes_cannot_spoof_identity() {
        let local = Peer::new("real", "02:00:00:00:00:02");
        let mut attrs = Attributes::new();
        attrs.insert(PROP_PEER_HW.to_string(), "fake".to_string());
        let props = txt_properties(&local, &attrs);
        let hw: Vec<_> = props.iter().filter(|(k, _)| k == PROP_PEER_HW).collect();
        assert_eq!(hw.len(), 1);
        assert_eq!(hw[0].1, "02:00:00:00:00:02");
    }
}
