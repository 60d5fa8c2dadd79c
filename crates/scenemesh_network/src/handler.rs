//! Upstream sinks for decoded scene traffic.
//!
//! Handlers are called on the connection system's background thread with
//! the framework lock held.

use crate::identity::ParticipantId;
use crate::message::{SceneId, SceneInfo};

/// Implemented by the side that owns scenes.
pub trait SceneProviderServiceHandler: Send + Sync {
    fn handle_subscribe_scene(&self, scene_id: SceneId, from: ParticipantId);
    fn handle_unsubscribe_scene(&self, scene_id: SceneId, from: ParticipantId);
    fn handle_renderer_event(&self, scene_id: SceneId, data: &[u8], from: ParticipantId);
}

/// Implemented by the side that renders scenes.
pub trait SceneRendererServiceHandler: Send + Sync {
    fn handle_new_scenes_available(&self, scenes: &[SceneInfo], from: ParticipantId);
    fn handle_scenes_became_unavailable(&self, scenes: &[SceneInfo], from: ParticipantId);
    fn handle_initialize_scene(&self, scene_id: SceneId, from: ParticipantId);
    /// One chunk of a scene update; see [`crate::chunk::SceneUpdateReassembler`].
    fn handle_scene_update(&self, scene_id: SceneId, data: &[u8], from: ParticipantId);
}
