//! Command implementations.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use wroup_discovery::{DiscoveryCoordinator, DiscoveryEvent, MdnsBackend, ServiceRegistry};
use wroup_types::config::WroupConfig;
use wroup_types::service::group_attributes;
use wroup_types::{Attributes, Peer, ServiceRecord};
use wroup_wire::{
    GroupMember, GroupOwner, MessageEnvelope, SessionEvent, SessionOptions, TcpConnector,
    TcpLinkListener,
};

/// Advertise a group and run as its owner until Ctrl+C or stdin closes.
pub async fn host(config: WroupConfig, group: &str, attrs: Vec<(String, String)>) -> Result<()> {
    let listener = TcpLinkListener::bind(
        config.listen_addr,
        config.connect_timeout(),
        config.max_frame_size,
    )
    .await
    .with_context(|| format!("failed to listen on {}", config.listen_addr))?;
    let port = listener.local_addr().port();

    let local = config.local_peer();
    let owner = GroupOwner::new(local.clone(), SessionOptions::from(&config));
    let mut events = owner.subscribe();
    owner.start(Box::new(listener));

    let backend = MdnsBackend::new(config.service_type.clone(), local.clone())?;
    let coordinator = DiscoveryCoordinator::from_config(Arc::new(backend), &config);
    let custom: Attributes = attrs.into_iter().collect();
    coordinator
        .start_advertising(group_attributes(group, port, &custom))
        .await
        .context("failed to advertise group")?;
    println!("Hosting '{group}' as {} on port {port}", local.display_name());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::MessageReceived(envelope)) => print_message(&envelope),
                Ok(SessionEvent::RosterChanged(roster)) => print_roster(&roster),
                Ok(SessionEvent::PeerConnected(peer)) => println!("+ {}", peer.display_name()),
                Ok(SessionEvent::PeerDisconnected(peer)) => println!("- {}", peer.display_name()),
                Ok(SessionEvent::TransportClosed { peer }) => {
                    warn!("link closed: {}", peer.map(|p| p.to_string()).unwrap_or_default());
                }
                Err(RecvError::Lagged(n)) => warn!("dropped {} session events", n),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => match line? {
                Some(text) if !text.trim().is_empty() => {
                    let sent = owner.broadcast(MessageEnvelope::text(&text, None));
                    info!(members = sent, "message sent");
                }
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    coordinator.stop_advertising().await;
    owner.shutdown();
    Ok(())
}

/// Run one discovery round and print what was found.
pub async fn browse(mut config: WroupConfig, timeout_ms: Option<u64>) -> Result<()> {
    if let Some(ms) = timeout_ms {
        config.discovery_timeout_ms = ms;
    }
    let backend = MdnsBackend::new(config.service_type.clone(), config.local_peer())?;
    let timeout = config.discovery_timeout();
    let coordinator = DiscoveryCoordinator::new(
        Arc::new(backend),
        Arc::new(ServiceRegistry::new(config.event_capacity)),
        Some(timeout),
    );
    let mut events = coordinator.subscribe();
    coordinator.start_discovering();
    println!("Browsing for {:?}...", timeout);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(DiscoveryEvent::NewServiceDiscovered(record)) => {
                    info!(peer = %record.peer, "found");
                }
                Ok(DiscoveryEvent::DiscoveryFinished(records)) => {
                    print_records(&records);
                    return Ok(());
                }
                Ok(DiscoveryEvent::DiscoveryError(code)) => {
                    anyhow::bail!("discovery failed: {code}");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("dropped {} discovery events", n),
                Err(RecvError::Closed) => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => {
                coordinator.stop_discovering();
            }
        }
    }
}

/// Join the group owned by whoever listens on `addr`.
pub async fn join(config: WroupConfig, addr: SocketAddr) -> Result<()> {
    let local = config.local_peer();
    let host = Peer::new("group-owner", addr.to_string()).with_endpoint(addr.ip(), addr.port());
    let connector = TcpConnector::new(local.clone(), config.connect_timeout());
    let member = GroupMember::join(&connector, &host, local, SessionOptions::from(&config))
        .await
        .with_context(|| format!("failed to join group at {addr}"))?;
    let mut events = member.subscribe();
    println!("Joined group at {addr}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::MessageReceived(envelope)) => print_message(&envelope),
                Ok(SessionEvent::RosterChanged(roster)) => print_roster(&roster),
                Ok(SessionEvent::PeerConnected(peer)) => println!("+ {}", peer.display_name()),
                Ok(SessionEvent::PeerDisconnected(peer)) => println!("- {}", peer.display_name()),
                Ok(SessionEvent::TransportClosed { .. }) => {
                    println!("Group owner went away");
                    return Ok(());
                }
                Err(RecvError::Lagged(n)) => warn!("dropped {} session events", n),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => match line? {
                Some(text) if !text.trim().is_empty() => {
                    member.broadcast(MessageEnvelope::text(&text, None))?;
                }
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    member.leave().await;
    Ok(())
}

fn print_message(envelope: &MessageEnvelope) {
    let from = envelope
        .origin
        .as_ref()
        .map(|p| p.display_name().to_string())
        .unwrap_or_else(|| "?".to_string());
    match envelope.payload_text() {
        Some(text) => println!("[{from}] {text}"),
        None => println!("[{from}] <{} bytes>", envelope.payload.len()),
    }
}

fn print_roster(roster: &[Peer]) {
    let names: Vec<&str> = roster.iter().map(Peer::display_name).collect();
    println!("Group ({}): {}", roster.len(), names.join(", "));
}

fn print_records(records: &[ServiceRecord]) {
    if records.is_empty() {
        println!("No groups found.");
        return;
    }
    println!("{:<24} {:<20} {:<22} HARDWARE", "GROUP", "DEVICE", "ENDPOINT");
    for r in records {
        let endpoint = match (r.peer.endpoint, r.service_port()) {
            (Some(ep), Some(port)) => SocketAddr::new(ep.ip(), port).to_string(),
            (Some(ep), None) => ep.to_string(),
            _ => "-".to_string(),
        };
        println!(
            "{:<24} {:<20} {:<22} {}",
            r.group_name().unwrap_or("-"),
            r.peer.display_name(),
            endpoint,
            r.peer.hardware_address
        );
    }
}
