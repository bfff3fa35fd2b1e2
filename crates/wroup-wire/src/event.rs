//! Session events published to the application layer.

use crate::message::MessageEnvelope;
use wroup_types::Peer;

/// Something that happened on an active session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// An application (`Normal`) envelope arrived.
    MessageReceived(MessageEnvelope),
    /// The authoritative roster changed. Carries the full new roster.
    RosterChanged(Vec<Peer>),
    /// A peer joined the group.
    PeerConnected(Peer),
    /// A peer left the group.
    PeerDisconnected(Peer),
    /// A link dropped without a goodbye, or sent an undecodable frame.
    TransportClosed {
        /// The peer on the other end, when known.
        peer: Option<Peer>,
    },
}
