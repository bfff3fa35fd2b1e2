//! Service registry for the local advertisement and the current discovery round.
//!
//! Discovery rounds are not incremental: starting a round forgets everything
//! the previous one found. Within a round each device is reported once, in
//! the order it was first sighted; later sightings replace its attributes.

use crate::event::DiscoveryEvent;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use wroup_types::{Attributes, ErrorCode, ServiceRecord};

#[derive(Debug, Default)]
struct RegistryState {
    local: Option<Attributes>,
    round_active: bool,
    discovered: Vec<ServiceRecord>,
}

/// Thread-safe registry of the local advertisement and discovered services.
pub struct ServiceRegistry {
    state: RwLock<RegistryState>,
    events: broadcast::Sender<DiscoveryEvent>,
}

impl ServiceRegistry {
    /// Create an empty registry whose event channel holds `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            state: RwLock::new(RegistryState::default()),
            events,
        }
    }

    /// Subscribe to discovery events.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    /// Record the local service attributes. Last write wins.
    pub fn advertise_local(&self, attributes: Attributes) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        debug!(keys = attributes.len(), "local attributes updated");
        state.local = Some(attributes);
    }

    /// Forget the local service attributes.
    pub fn clear_local(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.local = None;
    }

    /// The attributes currently advertised, if any.
    pub fn local_attributes(&self) -> Option<Attributes> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.local.clone()
    }

    /// The advertisement channel accepted the local service.
    pub fn registration_succeeded(&self) {
        info!("local service registered");
        let _ = self.events.send(DiscoveryEvent::ServiceRegistered);
    }

    /// The advertisement channel rejected the local service.
    pub fn registration_failed(&self, code: ErrorCode) {
        warn!(%code, "local service registration failed");
        let _ = self.events.send(DiscoveryEvent::RegistrationFailed(code));
    }

    /// Begin a round, discarding the previous round's results.
    pub fn on_discovery_round_start(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.discovered.clear();
        state.round_active = true;
        debug!("discovery round started");
    }

    /// Insert or replace a sighting. Returns `true` when the device is new
    /// to this round. Sightings outside a round are dropped.
    pub fn record_discovered(&self, record: ServiceRecord) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if !state.round_active {
            debug!(peer = %record.peer, "sighting outside a round dropped");
            return false;
        }

        match state
            .discovered
            .iter()
            .position(|r| r.peer.same_device(&record.peer))
        {
            Some(pos) => {
                debug!(peer = %record.peer, "sighting refreshed");
                state.discovered[pos] = record;
                false
            }
            None => {
                info!(peer = %record.peer, "new service discovered");
                state.discovered.push(record.clone());
                let _ = self.events.send(DiscoveryEvent::NewServiceDiscovered(record));
                true
            }
        }
    }

    /// End the round and publish its results. Returns `None` when no round
    /// was active.
    pub fn on_discovery_round_end(&self) -> Option<Vec<ServiceRecord>> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if !state.round_active {
            return None;
        }
        state.round_active = false;
        let found = state.discovered.clone();
        info!(count = found.len(), "discovery round finished");
        let _ = self.events.send(DiscoveryEvent::DiscoveryFinished(found.clone()));
        Some(found)
    }

    /// Abandon the active round with an error. Returns `false` when no round
    /// was active.
    pub fn fail_round(&self, code: ErrorCode) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if !state.round_active {
            return false;
        }
        state.round_active = false;
        warn!(%code, "discovery round abandoned");
        let _ = self.events.send(DiscoveryEvent::DiscoveryError(code));
        true
    }

    /// Whether a round is in progress.
    pub fn is_round_active(&self) -> bool {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.round_active
    }

    /// Snapshot of the current (or last) round's records, first-seen order.
    pub fn discovered(&self) -> Vec<ServiceRecord> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.discovered.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wroup_types::Peer;

    fn record(n: u8, group: &str) -> ServiceRecord {
        let mut attrs = Attributes::new();
        attrs.insert("GROUP_NAME".to_string(), group.to_string());
        ServiceRecord::new(
            Peer::new(format!("dev-{n}"), format!("02:00:00:00:00:{n:02x}")),
            attrs,
        )
    }

    fn drain(rx: &mut broadcast::Receiver<DiscoveryEvent>) -> Vec<DiscoveryEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[test]
    fn test_duplicate_sighting_keeps_latest_attributes() {
        let registry = ServiceRegistry::new(16);
        let mut rx = registry.subscribe();

        registry.on_discovery_round_start();
        assert!(registry.record_discovered(record(1, "old")));
        assert!(registry.record_discovered(record(2, "other")));
        assert!(!registry.record_discovered(record(1, "new")));
        let found = registry.on_discovery_round_end().unwrap();

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].peer, record(1, "").peer);
        assert_eq!(found[0].group_name(), Some("new"));
        assert_eq!(found[1].group_name(), Some("other"));

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                DiscoveryEvent::NewServiceDiscovered(record(1, "old")),
                DiscoveryEvent::NewServiceDiscovered(record(2, "other")),
                DiscoveryEvent::DiscoveryFinished(found),
            ]
        );
    }

    #[test]
    fn test_new_round_clears_previous_results() {
        let registry = ServiceRegistry::new(16);
        registry.on_discovery_round_start();
        registry.record_discovered(record(1, "a"));
        registry.on_discovery_round_end();
        assert_eq!(registry.discovered().len(), 1);

        let mut rx = registry.subscribe();
        registry.on_discovery_round_start();
        assert!(registry.discovered().is_empty());
        // Seen last round, but new to this one.
        assert!(registry.record_discovered(record(1, "a")));
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_failed_round_emits_one_error_and_no_finish() {
        let registry = ServiceRegistry::new(16);
        let mut rx = registry.subscribe();

        registry.on_discovery_round_start();
        registry.record_discovered(record(1, "a"));
        assert!(registry.fail_round(ErrorCode::DiscoveryUnavailable));
        assert!(!registry.fail_round(ErrorCode::DiscoveryUnavailable));
        assert_eq!(registry.on_discovery_round_end(), None);
        assert!(!registry.is_round_active());

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                DiscoveryEvent::NewServiceDiscovered(record(1, "a")),
                DiscoveryEvent::DiscoveryError(ErrorCode::DiscoveryUnavailable),
            ]
        );
    }

    #[test]
    fn test_sighting_outside_round_is_dropped() {
        let registry = ServiceRegistry::new(16);
        assert!(!registry.record_discovered(record(1, "a")));
        assert!(registry.discovered().is_empty());
    }

    #[test]
    fn test_advertise_local_last_write_wins() {
        let registry = ServiceRegistry::new(16);
        let mut first = Attributes::new();
        first.insert("a".to_string(), "1".to_string());
        first.insert("b".to_string(), "2".to_string());
        let mut second = Attributes::new();
        second.insert("c".to_string(), "3".to_string());

        registry.advertise_local(first);
        registry.advertise_local(second.clone());
        assert_eq!(registry.local_attributes(), Some(second));

        registry.clear_local();
        assert_eq!(registry.local_attributes(), None);
    }

    #[test]
    fn test_registration_outcomes_are_published() {
        let registry = ServiceRegistry::new(16);
        let mut rx = registry.subscribe();
        registry.registration_succeeded();
        registry.registration_failed(ErrorCode::RegistrationFailed);
        assert_eq!(
            drain(&mut rx),
            vec![
                DiscoveryEvent::ServiceRegistered,
                DiscoveryEvent::RegistrationFailed(ErrorCode::RegistrationFailed),
            ]
        );
    }
}
