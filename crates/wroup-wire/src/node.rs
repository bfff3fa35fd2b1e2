//! Group owner and group member session nodes.
//!
//! A [`GroupOwner`] accepts links from a [`Listener`], registers each peer
//! with its [`RosterBroadcaster`], and runs one reader task and one writer
//! task per link. A [`GroupMember`] dials a group owner through a
//! [`Connector`] and keeps a [`RemoteRoster`] up to date from what the owner
//! sends.
//!
//! A bad frame, a dropped socket or a stalled outbound queue on one link only
//! ends that link; the owner then runs the normal disconnect path for the
//! peer.
//!
//! Members reach each other through the owner: a `Normal` envelope carrying a
//! [`Relay`] request is forwarded one hop by the owner to the named peer, or
//! to the whole group.

use crate::error::WireError;
use crate::event::SessionEvent;
use crate::message::{read_envelope, write_envelope, MessageEnvelope, MessageKind, Relay};
use crate::roster::{LinkId, LinkSender, RemoteRoster, RosterBroadcaster, RosterUpdate};
use crate::transport::{BoxedStream, Connector, Listener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use wroup_types::config::WroupConfig;
use wroup_types::{Peer, WroupError};

/// Per-session limits.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Frames larger than this close the link.
    pub max_frame_size: u32,
    /// Capacity of the session event channel.
    pub event_capacity: usize,
    /// Outbound envelopes queued per link before it counts as stalled.
    pub link_queue_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&WroupConfig::default())
    }
}

impl From<&WroupConfig> for SessionOptions {
    fn from(config: &WroupConfig) -> Self {
        Self {
            max_frame_size: config.max_frame_size,
            event_capacity: config.event_capacity,
            link_queue_capacity: config.link_queue_capacity,
        }
    }
}

/// The group owner: accepts members and keeps them in sync.
pub struct GroupOwner {
    roster: RosterBroadcaster,
    events: broadcast::Sender<SessionEvent>,
    options: SessionOptions,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl GroupOwner {
    /// Create a group owned by `local`.
    pub fn new(local: Peer, options: SessionOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            roster: RosterBroadcaster::new(local, events.clone()),
            events,
            options,
            shutdown_tx,
            shutdown_rx,
            accept_task: Mutex::new(None),
        })
    }

    /// Start accepting links from `listener` in a background task.
    pub fn start(self: &Arc<Self>, listener: Box<dyn Listener>) {
        let owner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            owner.accept_loop(listener).await;
        });
        let mut slot = self.accept_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    async fn accept_loop(self: Arc<Self>, mut listener: Box<dyn Listener>) {
        loop {
            match listener.accept().await {
                Ok((peer, stream)) => {
                    self.admit(peer, stream);
                }
                Err(WireError::ConnectionClosed) => {
                    info!("listener closed; no longer accepting members");
                    return;
                }
                Err(e) => {
                    error!("accept error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Admit an established link from `peer`. Returns `None` once the owner
    /// has shut down; the stream is dropped.
    pub fn admit(self: &Arc<Self>, peer: Peer, stream: BoxedStream) -> Option<LinkId> {
        if *self.shutdown_rx.borrow() {
            debug!(peer = %peer, "shut down, refusing link");
            return None;
        }

        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(self.options.link_queue_capacity.max(1));
        tokio::spawn(write_loop(writer, rx, peer.clone()));

        let id = self.roster.peer_connected(peer.clone(), tx);

        let owner = Arc::clone(self);
        tokio::spawn(async move {
            owner.read_loop(id, peer, reader).await;
        });
        Some(id)
    }

    async fn read_loop(&self, id: LinkId, peer: Peer, mut reader: ReadHalf<BoxedStream>) {
        // Gone already (superseded, stalled or shut down).
        let Some(removed) = self.roster.removal(id) else {
            return;
        };
        let mut shutdown = self.shutdown_rx.clone();
        if *shutdown.borrow() {
            return;
        }

        let result = loop {
            let next = tokio::select! {
                biased;
                _ = removed.notified() => {
                    debug!(peer = %peer, "link removed, reader stopping");
                    return;
                }
                _ = shutdown.changed() => return,
                r = read_envelope(&mut reader, self.options.max_frame_size) => r,
            };
            match next {
                Ok(mut envelope) => match envelope.kind {
                    MessageKind::Normal => {
                        if envelope.origin.is_none() {
                            envelope.origin = Some(peer.clone());
                        }
                        debug!(peer = %peer, bytes = envelope.payload.len(), "message received");
                        self.route(&peer, envelope);
                    }
                    MessageKind::Disconnection => {
                        if envelope.origin.as_ref().is_some_and(|o| !o.same_device(&peer)) {
                            warn!(peer = %peer, "disconnection names another peer; treating as goodbye");
                        }
                        break Ok(());
                    }
                    MessageKind::Connection | MessageKind::RegisteredDevices => {
                        debug!(peer = %peer, kind = envelope.kind.tag(), "ignoring membership envelope from member");
                    }
                },
                Err(e) => break Err(e),
            }
        };

        match result {
            Ok(()) => {
                self.roster.detach(id);
            }
            Err(e) => {
                if e.is_decode() {
                    warn!(peer = %peer, error = %e, "bad frame, closing link");
                } else {
                    debug!(peer = %peer, error = %e, "link dropped");
                }
                self.roster.link_lost(id);
            }
        }
    }

    /// Deliver a member's `Normal` envelope: publish it locally, forward it,
    /// or both, as its relay request says.
    fn route(&self, from: &Peer, mut envelope: MessageEnvelope) {
        match envelope.relay.take() {
            None => {
                let _ = self.events.send(SessionEvent::MessageReceived(envelope));
            }
            Some(Relay::All) => {
                let forwarded = self.roster.broadcast_except(Some(from), envelope.clone());
                debug!(peer = %from, forwarded, "relayed to group");
                let _ = self.events.send(SessionEvent::MessageReceived(envelope));
            }
            Some(Relay::To(target)) if target.same_device(self.local_peer()) => {
                let _ = self.events.send(SessionEvent::MessageReceived(envelope));
            }
            Some(Relay::To(target)) => {
                if !self.roster.send_to(&target, envelope) {
                    debug!(peer = %from, target = %target, "relay target not reachable, dropped");
                }
            }
        }
    }

    /// The group owner's identity.
    pub fn local_peer(&self) -> &Peer {
        self.roster.local_peer()
    }

    /// Consistent snapshot of connected members.
    pub fn roster(&self) -> Arc<Vec<Peer>> {
        self.roster.roster()
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Send to one member. Unset origins are stamped with the owner.
    pub fn send_to(&self, peer: &Peer, envelope: MessageEnvelope) -> Result<(), WroupError> {
        if self.roster.send_to(peer, self.stamp(envelope)) {
            Ok(())
        } else {
            Err(WroupError::TransportClosed {
                peer: Some(peer.clone()),
            })
        }
    }

    /// Send to every member. Returns how many queues accepted it.
    pub fn broadcast(&self, envelope: MessageEnvelope) -> usize {
        self.roster.broadcast(self.stamp(envelope))
    }

    /// Send to every member except `skip`.
    pub fn broadcast_except(&self, skip: &Peer, envelope: MessageEnvelope) -> usize {
        self.roster.broadcast_except(Some(skip), self.stamp(envelope))
    }

    /// Forcefully remove a member, running the disconnect path.
    pub fn remove(&self, peer: &Peer) -> bool {
        self.roster.peer_disconnected(peer)
    }

    /// Stop accepting, close every link.
    pub fn shutdown(&self) {
        info!("group owner shutting down");
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        self.roster.close();
    }

    fn stamp(&self, mut envelope: MessageEnvelope) -> MessageEnvelope {
        if envelope.origin.is_none() {
            envelope.origin = Some(self.roster.local_peer().clone());
        }
        envelope.relay = None;
        envelope
    }
}

async fn write_loop(
    mut writer: WriteHalf<BoxedStream>,
    mut rx: mpsc::Receiver<MessageEnvelope>,
    peer: Peer,
) {
    while let Some(envelope) = rx.recv().await {
        if let Err(e) = write_envelope(&mut writer, &envelope).await {
            debug!(peer = %peer, error = %e, "write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// A group member: one link to the group owner.
pub struct GroupMember {
    local: Peer,
    host: Peer,
    view: RwLock<RemoteRoster>,
    events: broadcast::Sender<SessionEvent>,
    outbound: Mutex<Option<LinkSender>>,
    leaving: AtomicBool,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl GroupMember {
    /// Connect to the group owned by `host`.
    pub async fn join(
        connector: &dyn Connector,
        host: &Peer,
        local: Peer,
        options: SessionOptions,
    ) -> Result<Arc<Self>, WroupError> {
        let stream = connector
            .connect(host)
            .await
            .map_err(|e| e.into_wroup(Some(host)))?;
        info!(host = %host, "joined group");

        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(options.link_queue_capacity.max(1));
        let (events, _) = broadcast::channel(options.event_capacity.max(1));

        let member = Arc::new(Self {
            local,
            host: host.clone(),
            view: RwLock::new(RemoteRoster::new()),
            events,
            outbound: Mutex::new(Some(tx)),
            leaving: AtomicBool::new(false),
            writer_task: Mutex::new(None),
            reader_task: Mutex::new(None),
        });

        let writer_task = tokio::spawn(write_loop(writer, rx, host.clone()));
        let m = Arc::clone(&member);
        let max = options.max_frame_size;
        let reader_task = tokio::spawn(async move {
            m.read_loop(reader, max).await;
        });
        *member.writer_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(writer_task);
        *member.reader_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(reader_task);
        Ok(member)
    }

    async fn read_loop(&self, mut reader: ReadHalf<BoxedStream>, max_frame_size: u32) {
        let err = loop {
            let mut envelope = match read_envelope(&mut reader, max_frame_size).await {
                Ok(e) => e,
                Err(e) => break e,
            };
            if envelope.kind == MessageKind::Normal {
                if envelope.origin.is_none() {
                    envelope.origin = Some(self.host.clone());
                }
                let _ = self.events.send(SessionEvent::MessageReceived(envelope));
                continue;
            }

            let (update, roster) = {
                let mut view = self.view.write().unwrap_or_else(|e| e.into_inner());
                let update = view.apply(&envelope);
                (update, view.peers().to_vec())
            };
            match update {
                Some(RosterUpdate::Joined(peer)) => {
                    let _ = self.events.send(SessionEvent::PeerConnected(peer));
                }
                Some(RosterUpdate::Left(peer)) => {
                    let _ = self.events.send(SessionEvent::PeerDisconnected(peer));
                }
                Some(RosterUpdate::Replaced) => {}
                None => continue,
            }
            let _ = self.events.send(SessionEvent::RosterChanged(roster));
        };

        if self.leaving.load(Ordering::SeqCst) {
            return;
        }
        if err.is_decode() {
            warn!(host = %self.host, error = %err, "bad frame from group owner, closing link");
        } else {
            info!(host = %self.host, "group owner link closed");
        }
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        {
            let mut view = self.view.write().unwrap_or_else(|e| e.into_inner());
            *view = RemoteRoster::new();
        }
        let _ = self.events.send(SessionEvent::TransportClosed {
            peer: Some(self.host.clone()),
        });
        let _ = self.events.send(SessionEvent::RosterChanged(Vec::new()));
    }

    /// This device.
    pub fn local_peer(&self) -> &Peer {
        &self.local
    }

    /// The group owner.
    pub fn host(&self) -> &Peer {
        &self.host
    }

    /// Current view of the group, as last reported by the owner.
    pub fn roster(&self) -> Vec<Peer> {
        let view = self.view.read().unwrap_or_else(|e| e.into_inner());
        view.peers().to_vec()
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Send an envelope to the group owner. Unset origins are stamped with
    /// the local peer.
    ///
    /// A full outbound queue means the owner stopped reading; the link is
    /// dropped and the send fails.
    pub fn send(&self, mut envelope: MessageEnvelope) -> Result<(), WroupError> {
        if envelope.origin.is_none() {
            envelope.origin = Some(self.local.clone());
        }
        let mut outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        let result = match outbound.as_ref() {
            Some(tx) => tx.try_send(envelope),
            None => return Err(self.closed()),
        };
        match result {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(host = %self.host, "outbound queue full, dropping link");
                outbound.take();
                Err(self.closed())
            }
            Err(TrySendError::Closed(_)) => Err(self.closed()),
        }
    }

    /// Send a text message to the group owner.
    pub fn send_text(&self, text: &str) -> Result<(), WroupError> {
        self.send(MessageEnvelope::text(text, None))
    }

    /// Send to one peer of the group, relayed by the owner unless `peer` is
    /// the owner.
    pub fn send_to(&self, peer: &Peer, envelope: MessageEnvelope) -> Result<(), WroupError> {
        if peer.same_device(&self.host) {
            return self.send(envelope);
        }
        self.send(envelope.with_relay(Relay::To(peer.clone())))
    }

    /// Send to the owner and, through it, to every other member.
    pub fn broadcast(&self, envelope: MessageEnvelope) -> Result<(), WroupError> {
        self.send(envelope.with_relay(Relay::All))
    }

    fn closed(&self) -> WroupError {
        WroupError::TransportClosed {
            peer: Some(self.host.clone()),
        }
    }

    /// Say goodbye and close the link. Queued envelopes are flushed first.
    pub async fn leave(&self) {
        if self.leaving.swap(true, Ordering::SeqCst) {
            return;
        }
        let tx = self
            .outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(tx) = tx {
            let _ = tx.try_send(MessageEnvelope::disconnection(self.local.clone()));
        }

        let writer = self
            .writer_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
        if let Some(reader) = self
            .reader_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            reader.abort();
        }
        info!(host = %self.host, "left group");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::in_memory;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn peer(n: u8) -> Peer {
        Peer::new(format!("dev-{n}"), format!("02:00:00:00:00:{n:02x}"))
    }

    async fn next_roster(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<Peer> {
        loop {
            match timeout(WAIT, rx.recv()).await.unwrap().unwrap() {
                SessionEvent::RosterChanged(r) => return r,
                _ => continue,
            }
        }
    }

    async fn wait_for_roster(member: &GroupMember, rx: &mut broadcast::Receiver<SessionEvent>, n: usize) {
        while member.roster().len() != n {
            next_roster(rx).await;
        }
    }

    async fn next_message(rx: &mut broadcast::Receiver<SessionEvent>) -> MessageEnvelope {
        loop {
            match timeout(WAIT, rx.recv()).await.unwrap().unwrap() {
                SessionEvent::MessageReceived(e) => return e,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_members_converge_and_leave() {
        let owner = GroupOwner::new(peer(0), SessionOptions::default());
        let mut owner_events = owner.subscribe();
        let (listener, endpoint) = in_memory();
        owner.start(Box::new(listener));

        let a = GroupMember::join(&endpoint.connector(peer(1)), &peer(0), peer(1), SessionOptions::default())
            .await
            .unwrap();
        let mut a_events = a.subscribe();
        assert_eq!(next_roster(&mut owner_events).await, vec![peer(1)]);

        let b = GroupMember::join(&endpoint.connector(peer(2)), &peer(0), peer(2), SessionOptions::default())
            .await
            .unwrap();
        let mut b_events = b.subscribe();
        assert_eq!(next_roster(&mut owner_events).await, vec![peer(1), peer(2)]);
        wait_for_roster(&a, &mut a_events, 2).await;
        wait_for_roster(&b, &mut b_events, 2).await;

        b.leave().await;
        assert_eq!(next_roster(&mut owner_events).await, vec![peer(1)]);
        wait_for_roster(&a, &mut a_events, 1).await;
        assert_eq!(a.roster(), vec![peer(1)]);
        assert!(!owner.roster().contains(&peer(2)));
    }

    #[tokio::test]
    async fn test_messages_flow_both_ways() {
        let owner = GroupOwner::new(peer(0), SessionOptions::default());
        let mut owner_events = owner.subscribe();
        let (listener, endpoint) = in_memory();
        owner.start(Box::new(listener));

        let a = GroupMember::join(&endpoint.connector(peer(1)), &peer(0), peer(1), SessionOptions::default())
            .await
            .unwrap();
        let mut a_events = a.subscribe();
        next_roster(&mut owner_events).await;

        a.send_text("hello owner").unwrap();
        let got = next_message(&mut owner_events).await;
        assert_eq!(got.payload_text(), Some("hello owner"));
        assert_eq!(got.origin, Some(peer(1)));

        owner.send_to(&peer(1), MessageEnvelope::text("hello member", None)).unwrap();
        let got = next_message(&mut a_events).await;
        assert_eq!(got.payload_text(), Some("hello member"));
        assert_eq!(got.origin, Some(peer(0)));

        assert!(owner.send_to(&peer(7), MessageEnvelope::text("?", None)).is_err());
        assert_eq!(owner.broadcast_except(&peer(1), MessageEnvelope::text("nobody else", None)), 0);
    }

    #[tokio::test]
    async fn test_bad_frame_only_closes_that_link() {
        let owner = GroupOwner::new(peer(0), SessionOptions::default());
        let mut owner_events = owner.subscribe();

        let (good_near, good_far) = tokio::io::duplex(4096);
        let (mut bad_near, bad_far) = tokio::io::duplex(4096);
        owner.admit(peer(1), Box::new(good_far));
        owner.admit(peer(2), Box::new(bad_far));
        assert_eq!(next_roster(&mut owner_events).await.len(), 1);
        assert_eq!(next_roster(&mut owner_events).await.len(), 2);

        let body = br#"{"kind":"shout","payload":""}"#;
        bad_near.write_all(&(body.len() as u32).to_be_bytes()).await.unwrap();
        bad_near.write_all(body).await.unwrap();

        let mut closed = None;
        let roster = loop {
            match timeout(WAIT, owner_events.recv()).await.unwrap().unwrap() {
                SessionEvent::TransportClosed { peer } => closed = peer,
                SessionEvent::RosterChanged(r) => break r,
                _ => {}
            }
        };
        assert_eq!(closed, Some(peer(2)));
        assert_eq!(roster, vec![peer(1)]);

        // The good link still works.
        let (mut good_reader, _good_writer) = tokio::io::split(good_near);
        owner.broadcast(MessageEnvelope::text("still here", None));
        let mut last = None;
        for _ in 0..10 {
            let e = timeout(WAIT, read_envelope(&mut good_reader, 1 << 20))
                .await
                .unwrap()
                .unwrap();
            if e.kind == MessageKind::Normal {
                last = Some(e);
                break;
            }
        }
        assert_eq!(last.unwrap().payload_text(), Some("still here"));
    }

    #[tokio::test]
    async fn test_member_sees_owner_drop() {
        let owner = GroupOwner::new(peer(0), SessionOptions::default());
        let mut owner_events = owner.subscribe();
        let (listener, endpoint) = in_memory();
        owner.start(Box::new(listener));

        let a = GroupMember::join(&endpoint.connector(peer(1)), &peer(0), peer(1), SessionOptions::default())
            .await
            .unwrap();
        let mut a_events = a.subscribe();
        next_roster(&mut owner_events).await;

        owner.shutdown();
        let closed = loop {
            match timeout(WAIT, a_events.recv()).await.unwrap().unwrap() {
                SessionEvent::TransportClosed { peer } => break peer,
                _ => continue,
            }
        };
        assert_eq!(closed, Some(peer(0)));
        assert!(a.send_text("anyone?").is_err());
        assert!(owner.roster().is_empty());
    }

    #[tokio::test]
    async fn test_removed_member_is_silenced() {
        let owner = GroupOwner::new(peer(0), SessionOptions::default());
        let mut owner_events = owner.subscribe();
        let (listener, endpoint) = in_memory();
        owner.start(Box::new(listener));

        let a = GroupMember::join(&endpoint.connector(peer(1)), &peer(0), peer(1), SessionOptions::default())
            .await
            .unwrap();
        let mut a_events = a.subscribe();
        next_roster(&mut owner_events).await;

        assert!(owner.remove(&peer(1)));
        assert!(next_roster(&mut owner_events).await.is_empty());

        // The member learns from its link closing.
        loop {
            if let SessionEvent::TransportClosed { .. } = timeout(WAIT, a_events.recv()).await.unwrap().unwrap() {
                break;
            }
        }
        let _ = a.send_text("still there?");
        tokio::time::sleep(Duration::from_millis(50)).await;

        while let Ok(event) = owner_events.try_recv() {
            assert!(
                !matches!(
                    event,
                    SessionEvent::TransportClosed { .. } | SessionEvent::MessageReceived(_)
                ),
                "unexpected event after removal: {event:?}"
            );
        }
    }

    struct Handoff(Mutex<Option<BoxedStream>>);

    #[async_trait::async_trait]
    impl Connector for Handoff {
        async fn connect(&self, _peer: &Peer) -> Result<BoxedStream, WireError> {
            Ok(self.0.lock().unwrap().take().unwrap())
        }
    }

    #[tokio::test]
    async fn test_bad_roster_closes_member_link() {
        use base64::Engine;

        let (near, far) = tokio::io::duplex(4096);
        let stream: BoxedStream = Box::new(near);
        let connector = Handoff(Mutex::new(Some(stream)));
        let a = GroupMember::join(&connector, &peer(0), peer(1), SessionOptions::default())
            .await
            .unwrap();
        let mut a_events = a.subscribe();

        let (_owner_reader, mut owner_writer) = tokio::io::split(far);
        let payload = base64::engine::general_purpose::STANDARD.encode("this is not a roster");
        let body = format!(r#"{{"kind":"registered_devices","origin":null,"payload":"{payload}"}}"#);
        owner_writer.write_all(&(body.len() as u32).to_be_bytes()).await.unwrap();
        owner_writer.write_all(body.as_bytes()).await.unwrap();

        let closed = loop {
            match timeout(WAIT, a_events.recv()).await.unwrap().unwrap() {
                SessionEvent::TransportClosed { peer } => break peer,
                SessionEvent::RosterChanged(r) => assert!(r.is_empty()),
                _ => {}
            }
        };
        assert_eq!(closed, Some(peer(0)));
        assert!(a.roster().is_empty());
        assert!(a.send_text("hello?").is_err());
    }

    #[tokio::test]
    async fn test_member_that_never_reads_is_dropped() {
        let options = SessionOptions {
            link_queue_capacity: 4,
            ..SessionOptions::default()
        };
        let owner = GroupOwner::new(peer(0), options);
        let mut owner_events = owner.subscribe();

        // Far end is kept open but never read; frames below exceed its buffer.
        let (_near, far) = tokio::io::duplex(64);
        owner.admit(peer(1), Box::new(far)).unwrap();
        assert_eq!(owner.roster().len(), 1);

        let text = "x".repeat(128);
        let mut accepted = 0;
        for _ in 0..16 {
            accepted += owner.broadcast(MessageEnvelope::text(&text, None));
        }
        assert!(accepted < 16);
        assert!(owner.roster().is_empty());

        let closed = loop {
            match timeout(WAIT, owner_events.recv()).await.unwrap().unwrap() {
                SessionEvent::TransportClosed { peer } => break peer,
                _ => continue,
            }
        };
        assert_eq!(closed, Some(peer(1)));
    }

    #[tokio::test]
    async fn test_admit_after_shutdown_is_refused() {
        let owner = GroupOwner::new(peer(0), SessionOptions::default());
        owner.shutdown();
        let (_near, far) = tokio::io::duplex(64);
        assert!(owner.admit(peer(1), Box::new(far)).is_none());
        assert!(owner.roster().is_empty());
    }

    #[tokio::test]
    async fn test_members_reach_each_other_through_owner() {
        let owner = GroupOwner::new(peer(0), SessionOptions::default());
        let mut owner_events = owner.subscribe();
        let (listener, endpoint) = in_memory();
        owner.start(Box::new(listener));

        let a = GroupMember::join(&endpoint.connector(peer(1)), &peer(0), peer(1), SessionOptions::default())
            .await
            .unwrap();
        let mut a_events = a.subscribe();
        next_roster(&mut owner_events).await;
        let b = GroupMember::join(&endpoint.connector(peer(2)), &peer(0), peer(2), SessionOptions::default())
            .await
            .unwrap();
        let mut b_events = b.subscribe();
        assert_eq!(next_roster(&mut owner_events).await.len(), 2);

        a.send_to(&peer(2), MessageEnvelope::text("just b", None)).unwrap();
        let got = next_message(&mut b_events).await;
        assert_eq!(got.payload_text(), Some("just b"));
        assert_eq!(got.origin, Some(peer(1)));
        assert_eq!(got.relay, None);

        // The owner only sees what is addressed to it.
        a.broadcast(MessageEnvelope::text("everyone", None)).unwrap();
        assert_eq!(next_message(&mut owner_events).await.payload_text(), Some("everyone"));
        assert_eq!(next_message(&mut b_events).await.payload_text(), Some("everyone"));

        a.send_to(&peer(0), MessageEnvelope::text("owner only", None)).unwrap();
        let got = next_message(&mut owner_events).await;
        assert_eq!(got.payload_text(), Some("owner only"));
        assert_eq!(got.origin, Some(peer(1)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = a_events.try_recv() {
            assert!(!matches!(event, SessionEvent::MessageReceived(_)));
        }
        while let Ok(event) = b_events.try_recv() {
            assert!(!matches!(event, SessionEvent::MessageReceived(_)));
        }
    }

    #[tokio::test]
    async fn test_join_failure_names_host() {
        let (listener, endpoint) = in_memory();
        drop(listener);
        match GroupMember::join(&endpoint.connector(peer(1)), &peer(0), peer(1), SessionOptions::default()).await {
            Err(WroupError::ConnectFailed { peer: p, .. }) => assert_eq!(p, peer(0)),
            Err(other) => panic!("expected ConnectFailed, got {other:?}"),
            Ok(_) => panic!("expected ConnectFailed"),
        }
    }
}
