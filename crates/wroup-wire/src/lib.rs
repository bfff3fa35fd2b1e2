//! Wroup wire protocol — group sessions over framed byte streams.
//!
//! Every frame is a 4-byte big-endian length followed by a JSON envelope.
//! The group owner keeps the authoritative roster and pushes it to every
//! member whenever it changes.
//!
//! ## Architecture
//!
//! - **MessageEnvelope**: the four envelope kinds and their codec
//! - **RosterBroadcaster**: owner-side roster with per-peer ordered queues
//! - **GroupOwner / GroupMember**: session nodes driving links
//! - **Connector / Listener**: the transport seam (TCP and in-memory adapters)

pub mod error;
pub mod event;
pub mod message;
pub mod node;
pub mod roster;
pub mod transport;

pub use error::WireError;
pub use event::SessionEvent;
pub use message::{MessageEnvelope, MessageKind, Relay};
pub use node::{GroupMember, GroupOwner, SessionOptions};
pub use roster::{LinkId, RemoteRoster, RosterBroadcaster, RosterUpdate};
pub use transport::{
    in_memory, BoxedStream, Connector, Listener, MemoryConnector, MemoryEndpoint, MemoryListener,
    TcpConnector, TcpLinkListener,
};
