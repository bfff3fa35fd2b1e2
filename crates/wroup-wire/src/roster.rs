//! Session roster: who is connected, and keeping every member told.
//!
//! The [`RosterBroadcaster`] runs on the group owner. It holds one outbound
//! queue per connected peer and, on every membership change, announces the
//! change and then resends the *full* roster as a `RegisteredDevices`
//! envelope. Receivers that miss an announcement still converge, because the
//! next snapshot is authoritative.
//!
//! The [`RemoteRoster`] is the member-side view built from those envelopes.

use crate::event::SessionEvent;
use crate::message::{MessageEnvelope, MessageKind};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, info, warn};
use wroup_types::Peer;

/// Identifies one link; a peer that reconnects gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(u64);

/// Outbound queue to a single peer. Envelopes are written in queue order.
///
/// The queue is bounded: a link whose queue is full when something is sent
/// to it counts as stalled and is dropped through the disconnect path.
pub type LinkSender = mpsc::Sender<MessageEnvelope>;

struct Link {
    id: LinkId,
    peer: Peer,
    tx: LinkSender,
    removed: Arc<Notify>,
}

impl Link {
    /// Queue `envelope`. A full queue records the link in `stalled`.
    fn deliver(&self, envelope: MessageEnvelope, stalled: &mut Vec<LinkId>) -> bool {
        match self.tx.try_send(envelope) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                stalled.push(self.id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(peer = %self.peer, "outbound queue closed");
                false
            }
        }
    }
}

#[derive(Default)]
struct LinkTable {
    next_id: u64,
    closed: bool,
    links: Vec<Link>,
}

impl LinkTable {
    fn roster(&self) -> Vec<Peer> {
        self.links.iter().map(|l| l.peer.clone()).collect()
    }

    fn position(&self, id: LinkId) -> Option<usize> {
        self.links.iter().position(|l| l.id == id)
    }
}

/// Owner-side roster: connected peers plus their outbound queues.
pub struct RosterBroadcaster {
    /// The group owner itself; origin of roster snapshots.
    local: Peer,
    /// Every mutation batch runs with this held.
    table: Mutex<LinkTable>,
    /// Last committed roster. Readers clone the `Arc`.
    snapshot: RwLock<Arc<Vec<Peer>>>,
    events: broadcast::Sender<SessionEvent>,
}

impl RosterBroadcaster {
    /// Create an empty roster for the group owned by `local`.
    pub fn new(local: Peer, events: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            local,
            table: Mutex::new(LinkTable::default()),
            snapshot: RwLock::new(Arc::new(Vec::new())),
            events,
        }
    }

    /// The group owner's own identity.
    pub fn local_peer(&self) -> &Peer {
        &self.local
    }

    /// Consistent snapshot of the current roster, in connection order.
    pub fn roster(&self) -> Arc<Vec<Peer>> {
        let snapshot = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&snapshot)
    }

    /// Number of connected peers.
    pub fn len(&self) -> usize {
        self.roster().len()
    }

    /// Whether no peer is connected.
    pub fn is_empty(&self) -> bool {
        self.roster().is_empty()
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Register a newly connected peer.
    ///
    /// Sends `Connection(peer)` to every other peer, then the full roster to
    /// everyone including the newcomer. A peer already on the roster (same
    /// hardware address) has its old link replaced. Once the roster is
    /// closed the link is refused: `tx` is dropped and the returned id is
    /// never current.
    pub fn peer_connected(&self, peer: Peer, tx: LinkSender) -> LinkId {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());

        let id = LinkId(table.next_id);
        table.next_id += 1;
        if table.closed {
            debug!(peer = %peer, "roster closed, refusing link");
            return id;
        }

        if let Some(pos) = table.links.iter().position(|l| l.peer.same_device(&peer)) {
            let stale = table.links.remove(pos);
            debug!(peer = %stale.peer, "superseding existing link");
            stale.removed.notify_one();
        }

        let mut stalled = Vec::new();
        let announce = MessageEnvelope::connection(peer.clone());
        for link in &table.links {
            link.deliver(announce.clone(), &mut stalled);
        }

        table.links.push(Link {
            id,
            peer: peer.clone(),
            tx,
            removed: Arc::new(Notify::new()),
        });

        let roster = table.roster();
        self.send_roster(&table.links, &roster, &mut stalled);
        self.commit(roster.clone());

        info!(peer = %peer, members = roster.len(), "peer connected");
        let _ = self.events.send(SessionEvent::PeerConnected(peer));
        let _ = self.events.send(SessionEvent::RosterChanged(roster));
        self.evict(&mut table, stalled);
        id
    }

    /// Signal fired once link `id` leaves the roster, however it leaves.
    /// `None` if it already has.
    pub fn removal(&self, id: LinkId) -> Option<Arc<Notify>> {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let pos = table.position(id)?;
        Some(Arc::clone(&table.links[pos].removed))
    }

    /// Whether link `id` is still on the roster.
    pub fn is_current(&self, id: LinkId) -> bool {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.position(id).is_some()
    }

    /// Remove the peer on link `id`, if that link is still current.
    ///
    /// Sends `Disconnection(peer)` to the remaining peers, then the roster
    /// without the peer, then commits the removal. Returns the removed peer.
    pub fn detach(&self, id: LinkId) -> Option<Peer> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let pos = table.position(id)?;
        let mut stalled = Vec::new();
        let peer = self.remove_at(&mut table, pos, &mut stalled);
        self.evict(&mut table, stalled);
        Some(peer)
    }

    /// Link `id` failed underneath us. If it is still current, publishes
    /// `TransportClosed` for its peer and runs the disconnect path.
    pub fn link_lost(&self, id: LinkId) -> Option<Peer> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let pos = table.position(id)?;
        let mut stalled = Vec::new();
        let peer = self.drop_link(&mut table, pos, &mut stalled);
        self.evict(&mut table, stalled);
        Some(peer)
    }

    /// Remove `peer` from the roster. No-op if it isn't connected.
    pub fn peer_disconnected(&self, peer: &Peer) -> bool {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        match table.links.iter().position(|l| l.peer.same_device(peer)) {
            Some(pos) => {
                let mut stalled = Vec::new();
                self.remove_at(&mut table, pos, &mut stalled);
                self.evict(&mut table, stalled);
                true
            }
            None => false,
        }
    }

    fn remove_at(&self, table: &mut LinkTable, pos: usize, stalled: &mut Vec<LinkId>) -> Peer {
        let peer = table.links[pos].peer.clone();
        let remaining: Vec<&Link> = table
            .links
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != pos)
            .map(|(_, l)| l)
            .collect();

        let announce = MessageEnvelope::disconnection(peer.clone());
        for link in &remaining {
            link.deliver(announce.clone(), stalled);
        }

        let roster: Vec<Peer> = remaining.iter().map(|l| l.peer.clone()).collect();
        match MessageEnvelope::registered_devices(&roster, Some(self.local.clone())) {
            Ok(envelope) => {
                for link in &remaining {
                    link.deliver(envelope.clone(), stalled);
                }
            }
            Err(e) => warn!("failed to encode roster: {}", e),
        }

        info!(peer = %peer, members = roster.len(), "peer disconnected");
        let _ = self.events.send(SessionEvent::PeerDisconnected(peer.clone()));

        let link = table.links.remove(pos);
        link.removed.notify_one();
        self.commit(roster.clone());
        let _ = self.events.send(SessionEvent::RosterChanged(roster));
        peer
    }

    fn drop_link(&self, table: &mut LinkTable, pos: usize, stalled: &mut Vec<LinkId>) -> Peer {
        let _ = self.events.send(SessionEvent::TransportClosed {
            peer: Some(table.links[pos].peer.clone()),
        });
        self.remove_at(table, pos, stalled)
    }

    /// Drop every stalled link, including links that stall while the
    /// earlier ones are being announced.
    fn evict(&self, table: &mut LinkTable, mut stalled: Vec<LinkId>) {
        while let Some(id) = stalled.pop() {
            let Some(pos) = table.position(id) else {
                continue;
            };
            warn!(peer = %table.links[pos].peer, "outbound queue full, dropping stalled link");
            self.drop_link(table, pos, &mut stalled);
        }
    }

    /// Drop every link without announcements and refuse new ones (the group
    /// is going away).
    pub fn close(&self) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.closed = true;
        if table.links.is_empty() {
            return;
        }
        for link in table.links.drain(..) {
            link.removed.notify_one();
        }
        self.commit(Vec::new());
        let _ = self.events.send(SessionEvent::RosterChanged(Vec::new()));
    }

    /// Queue an envelope to one peer. Returns false if it isn't connected
    /// or its queue is full.
    pub fn send_to(&self, peer: &Peer, envelope: MessageEnvelope) -> bool {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let mut stalled = Vec::new();
        let sent = match table.links.iter().find(|l| l.peer.same_device(peer)) {
            Some(link) => link.deliver(envelope, &mut stalled),
            None => false,
        };
        self.evict(&mut table, stalled);
        sent
    }

    /// Queue an envelope to every connected peer except `skip`. Returns how
    /// many queues accepted it.
    pub fn broadcast_except(&self, skip: Option<&Peer>, envelope: MessageEnvelope) -> usize {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let mut stalled = Vec::new();
        let sent = table
            .links
            .iter()
            .filter(|l| skip.map_or(true, |s| !l.peer.same_device(s)))
            .filter(|l| l.deliver(envelope.clone(), &mut stalled))
            .count();
        self.evict(&mut table, stalled);
        sent
    }

    /// Queue an envelope to every connected peer.
    pub fn broadcast(&self, envelope: MessageEnvelope) -> usize {
        self.broadcast_except(None, envelope)
    }

    fn send_roster(&self, links: &[Link], roster: &[Peer], stalled: &mut Vec<LinkId>) {
        match MessageEnvelope::registered_devices(roster, Some(self.local.clone())) {
            Ok(envelope) => {
                for link in links {
                    link.deliver(envelope.clone(), stalled);
                }
            }
            Err(e) => warn!("failed to encode roster: {}", e),
        }
    }

    fn commit(&self, roster: Vec<Peer>) {
        let mut snapshot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *snapshot = Arc::new(roster);
    }
}

/// What applying an envelope did to a [`RemoteRoster`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterUpdate {
    /// A peer was added.
    Joined(Peer),
    /// A peer was removed.
    Left(Peer),
    /// The whole view was replaced by a snapshot.
    Replaced,
}

/// Member-side view of the group, fed by envelopes from the group owner.
#[derive(Debug, Clone, Default)]
pub struct RemoteRoster {
    peers: Vec<Peer>,
}

impl RemoteRoster {
    /// An empty view.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current view, in the owner's roster order.
    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    /// Whether the view contains `peer` (by hardware address).
    pub fn contains(&self, peer: &Peer) -> bool {
        self.peers.iter().any(|p| p.same_device(peer))
    }

    /// Apply a membership envelope. Returns `None` for envelopes that don't
    /// affect membership, or announcements that change nothing.
    pub fn apply(&mut self, envelope: &MessageEnvelope) -> Option<RosterUpdate> {
        match envelope.kind {
            MessageKind::Connection => {
                let peer = envelope.origin.as_ref()?;
                if self.contains(peer) {
                    return None;
                }
                self.peers.push(peer.clone());
                Some(RosterUpdate::Joined(peer.clone()))
            }
            MessageKind::Disconnection => {
                let peer = envelope.origin.as_ref()?;
                let pos = self.peers.iter().position(|p| p.same_device(peer))?;
                Some(RosterUpdate::Left(self.peers.remove(pos)))
            }
            MessageKind::RegisteredDevices => match envelope.roster() {
                Ok(roster) => {
                    self.peers = roster;
                    Some(RosterUpdate::Replaced)
                }
                Err(e) => {
                    warn!("ignoring undecodable roster: {}", e);
                    None
                }
            },
            MessageKind::Normal => None,
        }
    }
}
