//! Message catalogue and payload layouts.

use std::fmt;

use bytes::Bytes;

use crate::codec::{MessageReader, MessageWriter};
use crate::error::CodecError;
use crate::identity::{ParticipantAddress, ParticipantId, ParticipantType};

/// Upper bound for a renderer event payload. These are never chunked.
pub const MAX_RENDERER_EVENT_SIZE: usize = 32000;

/// The kind of message carried in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    // ── Connection management ───────────────────────────────────────
    /// Zero-payload keep-alive.
    Alive,
    /// Hello: identity, listening port and role of the sender.
    ConnectionDescriptionMessage,
    /// Addresses of other participants, relayed by daemons.
    ConnectorAddressExchange,

    // ── Scene traffic ───────────────────────────────────────────────
    PublishScene,
    UnpublishScene,
    SubscribeScene,
    UnsubscribeScene,
    /// One chunk of a serialized scene update.
    SendSceneUpdate,
    CreateScene,
    RendererEvent,
}

impl MessageType {
    pub fn to_wire(self) -> u32 {
        match self {
            Self::Alive => 0,
            Self::ConnectionDescriptionMessage => 1,
            Self::ConnectorAddressExchange => 2,
            Self::PublishScene => 3,
            Self::UnpublishScene => 4,
            Self::SubscribeScene => 5,
            Self::UnsubscribeScene => 6,
            Self::SendSceneUpdate => 7,
            Self::CreateScene => 8,
            Self::RendererEvent => 9,
        }
    }

    /// `None` for values outside the catalogue.
    pub fn from_wire(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::Alive,
            1 => Self::ConnectionDescriptionMessage,
            2 => Self::ConnectorAddressExchange,
            3 => Self::PublishScene,
            4 => Self::UnpublishScene,
            5 => Self::SubscribeScene,
            6 => Self::UnsubscribeScene,
            7 => Self::SendSceneUpdate,
            8 => Self::CreateScene,
            9 => Self::RendererEvent,
            _ => return None,
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Identifies a scene across the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SceneId(pub u64);

impl fmt::Display for SceneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A scene announced as available or unavailable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneInfo {
    pub scene_id: SceneId,
    pub friendly_name: String,
}

impl SceneInfo {
    pub fn new(scene_id: SceneId, friendly_name: impl Into<String>) -> Self {
        Self {
            scene_id,
            friendly_name: friendly_name.into(),
        }
    }
}

/// A message waiting to be sent.
///
/// An empty destination list suppresses the message entirely. The payload
/// is reference counted so broadcasts share one buffer.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub destinations: Vec<ParticipantId>,
    pub message_type: MessageType,
    pub payload: Bytes,
}

impl OutboundMessage {
    pub fn new(destinations: Vec<ParticipantId>, message_type: MessageType, payload: Bytes) -> Self {
        Self {
            destinations,
            message_type,
            payload,
        }
    }

    pub fn to_one(to: ParticipantId, message_type: MessageType, payload: Bytes) -> Self {
        Self::new(vec![to], message_type, payload)
    }

    pub fn alive() -> Self {
        Self::new(Vec::new(), MessageType::Alive, Bytes::new())
    }
}

// ---------------------------------------------------------------------------
// Payload layouts
// ---------------------------------------------------------------------------

/// Hello payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescription {
    pub address: ParticipantAddress,
    pub participant_type: ParticipantType,
}

impl ConnectionDescription {
    pub fn encode(&self) -> Bytes {
        let mut w = MessageWriter::new();
        put_address(&mut w, &self.address, self.participant_type);
        w.finish()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = MessageReader::new(payload);
        let (address, participant_type) = get_address(&mut r)?;
        Ok(Self {
            address,
            participant_type,
        })
    }
}

/// Address tuple as it appears in hello and address-exchange payloads.
pub(crate) fn put_address(
    w: &mut MessageWriter,
    address: &ParticipantAddress,
    participant_type: ParticipantType,
) {
    w.put_participant_id(&address.id)
        .put_string(&address.name)
        .put_string(&address.ip)
        .put_u16(address.port)
        .put_participant_type(participant_type);
}

pub(crate) fn get_address(
    r: &mut MessageReader<'_>,
) -> Result<(ParticipantAddress, ParticipantType), CodecError> {
    let id = r.get_participant_id()?;
    let name = r.get_string()?;
    let ip = r.get_string()?;
    let port = r.get_u16()?;
    let participant_type = r.get_participant_type()?;
    Ok((ParticipantAddress::new(id, name, ip, port), participant_type))
}

/// Payload of subscribe, unsubscribe and create-scene messages.
pub fn encode_scene_id(scene_id: SceneId) -> Bytes {
    let mut w = MessageWriter::with_capacity(8);
    w.put_u64(scene_id.0);
    w.finish()
}

pub fn decode_scene_id(payload: &[u8]) -> Result<SceneId, CodecError> {
    MessageReader::new(payload).get_u64().map(SceneId)
}

/// Payload of publish and unpublish messages.
pub fn encode_scene_infos(scenes: &[SceneInfo]) -> Bytes {
    let mut w = MessageWriter::new();
    w.put_u32(scenes.len() as u32);
    for scene in scenes {
        w.put_u64(scene.scene_id.0).put_string(&scene.friendly_name);
    }
    w.finish()
}

pub fn decode_scene_infos(payload: &[u8]) -> Result<Vec<SceneInfo>, CodecError> {
    let mut r = MessageReader::new(payload);
    let count = r.get_u32()?;
    let mut scenes = Vec::new();
    for _ in 0..count {
        let scene_id = SceneId(r.get_u64()?);
        let friendly_name = r.get_string()?;
        scenes.push(SceneInfo {
            scene_id,
            friendly_name,
        });
    }
    Ok(scenes)
}

/// Payload of scene-update chunks and renderer events.
pub fn encode_scene_data(scene_id: SceneId, data: &[u8]) -> Bytes {
    let mut w = MessageWriter::with_capacity(12 + data.len());
    w.put_u64(scene_id.0).put_blob(data);
    w.finish()
}

pub fn decode_scene_data(payload: &[u8]) -> Result<(SceneId, &[u8]), CodecError> {
    let mut r = MessageReader::new(payload);
    let scene_id = SceneId(r.get_u64()?);
    let data = r.get_blob()?;
    Ok((scene_id, data))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
