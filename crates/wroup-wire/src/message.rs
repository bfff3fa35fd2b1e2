//! Wire protocol message types.
//!
//! All communication between connected peers uses JSON-framed envelopes over
//! a byte stream. Each frame is prefixed with a 4-byte big-endian length
//! header, followed by a JSON body:
//!
//! ```text
//! {"kind": "normal" | "connection" | "disconnection" | "registered_devices",
//!  "origin": <peer> | null,
//!  "payload": "<base64>",
//!  "relay": "all" | {"to": <peer>}}       (optional, `normal` only)
//! ```
//!
//! A `registered_devices` payload is a UTF-8 JSON array of peers in roster
//! order, and is checked when the frame is decoded.

use crate::error::WireError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use wroup_types::Peer;

/// The closed set of envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Opaque application payload.
    Normal,
    /// `origin` joined the group.
    Connection,
    /// `origin` left the group.
    Disconnection,
    /// Payload is the full current roster.
    RegisteredDevices,
}

impl MessageKind {
    /// Tag used on the wire.
    pub fn tag(self) -> &'static str {
        match self {
            MessageKind::Normal => "normal",
            MessageKind::Connection => "connection",
            MessageKind::Disconnection => "disconnection",
            MessageKind::RegisteredDevices => "registered_devices",
        }
    }

    /// Parse a wire tag. Unknown tags yield `None`; callers must not guess.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "normal" => Some(MessageKind::Normal),
            "connection" => Some(MessageKind::Connection),
            "disconnection" => Some(MessageKind::Disconnection),
            "registered_devices" => Some(MessageKind::RegisteredDevices),
            _ => None,
        }
    }
}

/// Forwarding request a member attaches to a `Normal` envelope sent to the
/// group owner. The owner forwards it one hop and strips the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relay {
    /// The owner and every other member.
    All,
    /// One peer of the group.
    To(Peer),
}

/// A single unit of communication between connected peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    /// How `payload` is to be interpreted.
    pub kind: MessageKind,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// The sender, or the subject of a connection/disconnection.
    pub origin: Option<Peer>,
    /// Set by members only; see [`Relay`].
    pub relay: Option<Relay>,
}

impl MessageEnvelope {
    /// An application message.
    pub fn normal(payload: impl Into<Vec<u8>>, origin: Option<Peer>) -> Self {
        Self {
            kind: MessageKind::Normal,
            payload: payload.into(),
            origin,
            relay: None,
        }
    }

    /// An application text message.
    pub fn text(text: &str, origin: Option<Peer>) -> Self {
        Self::normal(text.as_bytes().to_vec(), origin)
    }

    /// Announce that `peer` joined.
    pub fn connection(peer: Peer) -> Self {
        Self {
            kind: MessageKind::Connection,
            payload: Vec::new(),
            origin: Some(peer),
            relay: None,
        }
    }

    /// Announce that `peer` left.
    pub fn disconnection(peer: Peer) -> Self {
        Self {
            kind: MessageKind::Disconnection,
            payload: Vec::new(),
            origin: Some(peer),
            relay: None,
        }
    }

    /// A full roster snapshot, sent by `origin`.
    pub fn registered_devices(roster: &[Peer], origin: Option<Peer>) -> Result<Self, WireError> {
        Ok(Self {
            kind: MessageKind::RegisteredDevices,
            payload: serde_json::to_vec(roster)?,
            origin,
            relay: None,
        })
    }

    /// Decode the roster carried by a `RegisteredDevices` envelope.
    pub fn roster(&self) -> Result<Vec<Peer>, WireError> {
        if self.kind != MessageKind::RegisteredDevices {
            return Err(WireError::Decode(format!(
                "{} envelope carries no roster",
                self.kind.tag()
            )));
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| WireError::Decode(format!("roster payload: {e}")))
    }

    /// Attach a forwarding request.
    pub fn with_relay(mut self, relay: Relay) -> Self {
        self.relay = Some(relay);
        self
    }

    /// The payload as UTF-8 text, if it is valid UTF-8.
    pub fn payload_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Outgoing JSON body.
#[derive(Serialize)]
struct WireBodyRef<'a> {
    kind: &'static str,
    origin: Option<&'a Peer>,
    payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    relay: Option<&'a Relay>,
}

/// Incoming JSON body; `kind` is kept as text so unknown tags can be reported.
#[derive(Deserialize)]
struct WireBody {
    kind: String,
    #[serde(default)]
    origin: Option<Peer>,
    #[serde(default)]
    payload: String,
    #[serde(default)]
    relay: Option<Relay>,
}

/// Encode an envelope to a complete frame (4-byte big-endian length + JSON).
pub fn encode(envelope: &MessageEnvelope) -> Result<Vec<u8>, WireError> {
    let body = WireBodyRef {
        kind: envelope.kind.tag(),
        origin: envelope.origin.as_ref(),
        payload: STANDARD.encode(&envelope.payload),
        relay: envelope.relay.as_ref(),
    };
    let json = serde_json::to_vec(&body)?;
    let len = u32::try_from(json.len()).map_err(|_| WireError::MessageTooLarge {
        size: json.len() as u64,
        max: u32::MAX,
    })?;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body (without length prefix) into an envelope.
///
/// A `registered_devices` payload that is not a peer list, or a relay
/// request on anything but a `normal` envelope, is a decode error.
pub fn decode_body(body: &[u8]) -> Result<MessageEnvelope, WireError> {
    let raw: WireBody = serde_json::from_slice(body)?;
    let kind = MessageKind::from_tag(&raw.kind).ok_or(WireError::UnknownKind(raw.kind))?;
    let payload = STANDARD
        .decode(raw.payload.as_bytes())
        .map_err(|e| WireError::Decode(format!("payload is not base64: {e}")))?;
    if raw.relay.is_some() && kind != MessageKind::Normal {
        return Err(WireError::Decode(format!(
            "relay request on {} envelope",
            kind.tag()
        )));
    }
    let envelope = MessageEnvelope {
        kind,
        payload,
        origin: raw.origin,
        relay: raw.relay,
    };
    if kind == MessageKind::RegisteredDevices {
        envelope.roster()?;
    }
    Ok(envelope)
}

/// Decode one complete frame. The buffer must hold exactly one frame.
pub fn decode(frame: &[u8]) -> Result<MessageEnvelope, WireError> {
    if frame.len() < 4 {
        return Err(WireError::Decode(format!(
            "frame shorter than header: {} bytes",
            frame.len()
        )));
    }
    let (header, body) = frame.split_at(4);
    let len = decode_length(&[header[0], header[1], header[2], header[3]]) as usize;
    if body.len() != len {
        return Err(WireError::Decode(format!(
            "length prefix says {len} bytes, frame has {}",
            body.len()
        )));
    }
    decode_body(body)
}

/// Write a framed envelope to a stream.
pub async fn write_envelope<W>(writer: &mut W, envelope: &MessageEnvelope) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = encode(envelope)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed envelope from a stream.
///
/// Waits until the whole frame has arrived. A clean EOF before the header
/// yields [`WireError::ConnectionClosed`]; EOF anywhere inside a frame,
/// header included, is [`WireError::Io`].
pub async fn read_envelope<R>(reader: &mut R, max_frame_size: u32) -> Result<MessageEnvelope, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 4];
    if reader.read(&mut header[..1]).await? == 0 {
        return Err(WireError::ConnectionClosed);
    }
    reader.read_exact(&mut header[1..]).await?;

    let len = decode_length(&header);
    if len > max_frame_size {
        return Err(WireError::MessageTooLarge {
            size: len as u64,
            max: max_frame_size,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    decode_body(&body)
}
