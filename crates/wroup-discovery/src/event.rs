//! Discovery events published to the application layer.

use wroup_types::{ErrorCode, ServiceRecord};

/// Something that happened while advertising or browsing.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// A peer was sighted for the first time in the current round.
    NewServiceDiscovered(ServiceRecord),
    /// The round ended. Records are deduplicated and in first-seen order.
    DiscoveryFinished(Vec<ServiceRecord>),
    /// The round was abandoned; no `DiscoveryFinished` follows for it.
    DiscoveryError(ErrorCode),
    /// The local service is now advertised.
    ServiceRegistered,
    /// The local service could not be advertised.
    RegistrationFailed(ErrorCode),
}
