//! The connection system: public face of the mesh layer.
//!
//! A [`ConnectionSystem`] is created from a [`NetworkConfig`] and a shared
//! [`FrameworkLock`]. [`connect_services`](ConnectionSystem::connect_services)
//! starts a background thread running the [`Reactor`]; every `send_*` and
//! `broadcast_*` call takes the framework lock, builds an
//! [`OutboundMessage`] and posts it to that thread.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use scenemesh_core::FrameworkLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::chunk::SceneUpdateSerializer;
use crate::codec::MAX_PAYLOAD_SIZE;
use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::handler::{SceneProviderServiceHandler, SceneRendererServiceHandler};
use crate::identity::ParticipantId;
use crate::message::{
    MAX_RENDERER_EVENT_SIZE, MessageType, OutboundMessage, SceneId, SceneInfo, encode_scene_data,
    encode_scene_id, encode_scene_infos,
};
use crate::reactor::{Reactor, SharedState};
use crate::status::ConnectionStatusUpdateNotifier;
use crate::transport::{self, Command, Event, EventSender};

/// Name of the background event-loop thread.
pub const THREAD_NAME: &str = "TCP_ConnSys";

/// Exists between `connect_services` and `disconnect_services`.
struct RunState {
    events: EventSender,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    listening_port: u16,
}

/// TCP mesh connection manager for one participant.
pub struct ConnectionSystem {
    config: NetworkConfig,
    shared: Arc<SharedState>,
    run_state: Mutex<Option<RunState>>,
}

impl ConnectionSystem {
    pub fn new(mut config: NetworkConfig, lock: FrameworkLock) -> Self {
        config.normalize();
        let shared = Arc::new(SharedState::new(lock, &config.participant_name));
        Self {
            config,
            shared,
            run_state: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.config.participant_id
    }

    fn name(&self) -> &str {
        &self.config.participant_name
    }

    pub fn framework_lock(&self) -> &FrameworkLock {
        &self.shared.lock
    }

    pub fn is_connected(&self) -> bool {
        self.run_state.lock().is_some()
    }

    /// Port the acceptor is bound to, while running.
    pub fn listening_port(&self) -> Option<u16> {
        self.run_state.lock().as_ref().map(|rs| rs.listening_port)
    }

    pub fn connection_status_notifier(&self) -> &ConnectionStatusUpdateNotifier {
        &self.shared.notifier
    }

    /// Peers a broadcast currently goes to.
    pub fn broadcast_targets(&self) -> Vec<ParticipantId> {
        self.shared.broadcast_targets.lock().clone()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the event loop and open the acceptor.
    ///
    /// Returns `false` if already running or if the listening socket could
    /// not be opened.
    pub fn connect_services(&self) -> bool {
        let _guard = self.shared.lock.lock();
        let mut run_state = self.run_state.lock();
        if run_state.is_some() {
            warn!(
                "ConnectionSystem({}): connect_services called while already connected",
                self.name()
            );
            return false;
        }

        if self.config.alive_timeout_too_low() {
            warn!(
                "ConnectionSystem({}): alive timeout {}ms is too close to alive interval {}ms",
                self.name(),
                self.config.alive_timeout.as_millis(),
                self.config.alive_interval.as_millis()
            );
        }

        match self.start() {
            Ok(state) => {
                info!(
                    "ConnectionSystem({}): started as {} with id {}, listening on port {}",
                    self.name(),
                    self.config.participant_type(),
                    self.config.participant_id,
                    state.listening_port
                );
                *run_state = Some(state);
                true
            }
            Err(e) => {
                error!("ConnectionSystem({}): connect_services failed: {e}", self.name());
                false
            }
        }
    }

    fn start(&self) -> Result<RunState, NetworkError> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (stop, stop_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<u16, NetworkError>>();

        let reactor = Reactor::new(&self.config, events.clone(), Arc::clone(&self.shared));
        let port = self.config.port;
        let send_buffer_size = self.config.chunk_size;

        let thread = std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(NetworkError::EventLoop(e.to_string())));
                        return;
                    }
                };
                runtime.block_on(async move {
                    let listener = match transport::open_acceptor(port, send_buffer_size) {
                        Ok(listener) => listener,
                        Err(e) => {
                            let _ = ready_tx.send(Err(NetworkError::Acceptor(e)));
                            return;
                        }
                    };
                    let bound = match listener.local_addr() {
                        Ok(addr) => addr.port(),
                        Err(e) => {
                            let _ = ready_tx.send(Err(NetworkError::Acceptor(e)));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(bound));
                    reactor
                        .with_listening_port(bound)
                        .run(listener, events_rx, stop_rx)
                        .await;
                });
            })?;

        match ready_rx.recv() {
            Ok(Ok(listening_port)) => Ok(RunState {
                events,
                stop: Some(stop),
                thread: Some(thread),
                listening_port,
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(NetworkError::EventLoop(
                    "event loop exited during startup".to_string(),
                ))
            }
        }
    }

    /// Stop the event loop and drop every connection.
    ///
    /// The framework lock is released while the background thread is
    /// joined, so handlers that are running can finish.
    pub fn disconnect_services(&self) -> bool {
        let mut guard = self.shared.lock.lock();
        let Some(mut state) = self.run_state.lock().take() else {
            warn!(
                "ConnectionSystem({}): disconnect_services called without being connected",
                self.name()
            );
            return false;
        };

        if let Some(stop) = state.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = state.thread.take() {
            if thread.thread().id() == std::thread::current().id() {
                error!(
                    "ConnectionSystem({}): disconnect_services called from the event loop; not joining",
                    self.name()
                );
            } else {
                FrameworkLock::unlocked(&mut guard, || {
                    if thread.join().is_err() {
                        error!("ConnectionSystem({}): event loop thread panicked", self.name());
                    }
                });
            }
        }
        self.shared.broadcast_targets.lock().clear();

        debug!("ConnectionSystem({}): disconnect_services done", self.name());
        true
    }

    pub fn set_scene_provider_service_handler(
        &self,
        handler: Option<Arc<dyn SceneProviderServiceHandler>>,
    ) {
        let _guard = self.shared.lock.lock();
        *self.shared.provider_handler.write() = handler;
    }

    pub fn set_scene_renderer_service_handler(
        &self,
        handler: Option<Arc<dyn SceneRendererServiceHandler>>,
    ) {
        let _guard = self.shared.lock.lock();
        *self.shared.renderer_handler.write() = handler;
    }

    // -----------------------------------------------------------------------
    // Posting
    // -----------------------------------------------------------------------

    fn post_command(&self, command: Command) -> bool {
        let run_state = self.run_state.lock();
        let Some(state) = run_state.as_ref() else {
            return false;
        };
        state.events.send(Event::Posted(command)).is_ok()
    }

    /// Hand a message to the event loop. An empty destination list is a
    /// successful no-op. Payloads that do not fit one frame are refused.
    fn post_message(&self, message: OutboundMessage) -> bool {
        let _guard = self.shared.lock.lock();
        if !self.is_connected() {
            warn!(
                "ConnectionSystem({}): post {} called without being connected",
                self.name(),
                message.message_type
            );
            return false;
        }
        if message.payload.len() > MAX_PAYLOAD_SIZE {
            error!(
                "ConnectionSystem({}): {} payload too large ({} > {MAX_PAYLOAD_SIZE} bytes)",
                self.name(),
                message.message_type,
                message.payload.len()
            );
            return false;
        }
        if message.destinations.is_empty() {
            return true;
        }
        self.post_command(Command::Send(message))
    }

    fn broadcast(&self, message_type: MessageType, payload: bytes::Bytes) -> bool {
        let _guard = self.shared.lock.lock();
        let targets = self.broadcast_targets();
        self.post_message(OutboundMessage::new(targets, message_type, payload))
    }

    // -----------------------------------------------------------------------
    // Scene traffic
    // -----------------------------------------------------------------------

    pub fn send_subscribe_scene(&self, to: ParticipantId, scene_id: SceneId) -> bool {
        debug!("ConnectionSystem({}): send subscribe scene {scene_id} to {to}", self.name());
        self.post_message(OutboundMessage::to_one(
            to,
            MessageType::SubscribeScene,
            encode_scene_id(scene_id),
        ))
    }

    pub fn send_unsubscribe_scene(&self, to: ParticipantId, scene_id: SceneId) -> bool {
        debug!("ConnectionSystem({}): send unsubscribe scene {scene_id} to {to}", self.name());
        self.post_message(OutboundMessage::to_one(
            to,
            MessageType::UnsubscribeScene,
            encode_scene_id(scene_id),
        ))
    }

    pub fn send_initialize_scene(&self, to: ParticipantId, scene_id: SceneId) -> bool {
        debug!("ConnectionSystem({}): send initialize scene {scene_id} to {to}", self.name());
        self.post_message(OutboundMessage::to_one(
            to,
            MessageType::CreateScene,
            encode_scene_id(scene_id),
        ))
    }

    /// Send a scene update in chunks of the configured size, one message
    /// per chunk. Stops at the first chunk that cannot be posted.
    pub fn send_scene_update(
        &self,
        to: ParticipantId,
        scene_id: SceneId,
        serializer: &dyn SceneUpdateSerializer,
    ) -> bool {
        debug!("ConnectionSystem({}): send scene update for {scene_id} to {to}", self.name());
        let mut packet = vec![0u8; self.config.chunk_size.max(1)];
        serializer.write_to_packets(&mut packet, &mut |chunk: &[u8]| {
            self.post_message(OutboundMessage::to_one(
                to,
                MessageType::SendSceneUpdate,
                encode_scene_data(scene_id, chunk),
            ))
        })
    }

    /// Renderer events are never chunked; payloads above
    /// [`MAX_RENDERER_EVENT_SIZE`] are rejected.
    pub fn send_renderer_event(&self, to: ParticipantId, scene_id: SceneId, data: &[u8]) -> bool {
        if data.len() > MAX_RENDERER_EVENT_SIZE {
            error!(
                "ConnectionSystem({}): renderer event for scene {scene_id} too large ({} > {MAX_RENDERER_EVENT_SIZE} bytes)",
                self.name(),
                data.len()
            );
            return false;
        }
        debug!("ConnectionSystem({}): send renderer event for scene {scene_id} to {to}", self.name());
        self.post_message(OutboundMessage::to_one(
            to,
            MessageType::RendererEvent,
            encode_scene_data(scene_id, data),
        ))
    }

    pub fn broadcast_new_scenes_available(&self, scenes: &[SceneInfo]) -> bool {
        debug!(
            "ConnectionSystem({}): broadcast new scenes available [{}]",
            self.name(),
            describe(scenes)
        );
        self.broadcast(MessageType::PublishScene, encode_scene_infos(scenes))
    }

    pub fn send_scenes_available(&self, to: ParticipantId, scenes: &[SceneInfo]) -> bool {
        debug!(
            "ConnectionSystem({}): send scenes available to {to} [{}]",
            self.name(),
            describe(scenes)
        );
        self.post_message(OutboundMessage::to_one(
            to,
            MessageType::PublishScene,
            encode_scene_infos(scenes),
        ))
    }

    pub fn broadcast_scenes_became_unavailable(&self, scenes: &[SceneInfo]) -> bool {
        debug!(
            "ConnectionSystem({}): broadcast scenes became unavailable [{}]",
            self.name(),
            describe(scenes)
        );
        self.broadcast(MessageType::UnpublishScene, encode_scene_infos(scenes))
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    /// Log identity, role and all connections.
    pub fn log_connection_info(&self) {
        let _guard = self.shared.lock.lock();
        if !self.post_command(Command::LogConnectionInfo) {
            info!(
                "ConnectionSystem({}): {} not running, protocol version {}, type {}",
                self.name(),
                self.config.participant_id,
                self.config.protocol_version,
                self.config.participant_type()
            );
        }
    }

    /// Log the ids of all connected participants.
    pub fn trigger_log_message_for_periodic_log(&self) {
        let _guard = self.shared.lock.lock();
        if !self.post_command(Command::LogPeriodic) {
            info!("ConnectionSystem({}): Not connected", self.name());
        }
    }
}

impl Drop for ConnectionSystem {
    fn drop(&mut self) {
        if self.is_connected() {
            self.disconnect_services();
        }
    }
}

fn describe(scenes: &[SceneInfo]) -> String {
    scenes
        .iter()
        .map(|s| format!("{}/{}", s.scene_id, s.friendly_name))
        .collect::<Vec<_>>()
        .join("; ")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::BlobSerializer;

    fn system(name: &str) -> ConnectionSystem {
        ConnectionSystem::new(NetworkConfig::client(name), FrameworkLock::new())
    }

    #[test]
    fn test_connect_and_disconnect() {
        let cs = system("a");
        assert!(cs.connect_services());
        assert!(cs.is_connected());
        assert!(cs.listening_port().is_some_and(|p| p != 0));
        assert!(cs.disconnect_services());
        assert!(!cs.is_connected());
        assert_eq!(cs.listening_port(), None);
    }

    #[test]
    fn test_redundant_calls_return_false() {
        let cs = system("a");
        assert!(!cs.disconnect_services());
        assert!(cs.connect_services());
        assert!(!cs.connect_services());
        assert!(cs.disconnect_services());
        assert!(!cs.disconnect_services());
        // restartable
        assert!(cs.connect_services());
        assert!(cs.disconnect_services());
    }

    #[test]
    fn test_sends_fail_when_not_running() {
        let cs = system("a");
        let to = ParticipantId::generate();
        assert!(!cs.send_subscribe_scene(to, SceneId(1)));
        assert!(!cs.send_unsubscribe_scene(to, SceneId(1)));
        assert!(!cs.send_initialize_scene(to, SceneId(1)));
        assert!(!cs.send_renderer_event(to, SceneId(1), &[1, 2, 3]));
        assert!(!cs.send_scene_update(to, SceneId(1), &BlobSerializer::new(&[0; 10])));
        assert!(!cs.broadcast_new_scenes_available(&[SceneInfo::new(SceneId(1), "x")]));
    }

    #[test]
    fn test_sends_succeed_when_running_even_without_peer() {
        let cs = system("a");
        assert!(cs.connect_services());
        let to = ParticipantId::generate();
        assert!(cs.send_subscribe_scene(to, SceneId(1)));
        assert!(cs.send_scene_update(to, SceneId(1), &BlobSerializer::new(&[7; 1000])));
        // no peers: broadcast is a successful no-op
        assert!(cs.broadcast_scenes_became_unavailable(&[]));
        assert!(cs.disconnect_services());
    }

    #[test]
    fn test_renderer_event_size_limit() {
        let cs = system("a");
        assert!(cs.connect_services());
        let to = ParticipantId::generate();
        assert!(cs.send_renderer_event(to, SceneId(1), &vec![0; MAX_RENDERER_EVENT_SIZE]));
        assert!(!cs.send_renderer_event(to, SceneId(1), &vec![0; MAX_RENDERER_EVENT_SIZE + 1]));
        assert!(cs.disconnect_services());
    }

    #[test]
    fn test_payload_above_frame_limit_is_refused() {
        let cs = system("a");
        assert!(cs.connect_services());
        let huge = SceneInfo::new(SceneId(1), "x".repeat(MAX_PAYLOAD_SIZE));
        assert!(!cs.broadcast_new_scenes_available(&[huge]));
        assert!(cs.broadcast_new_scenes_available(&[SceneInfo::new(SceneId(1), "small")]));
        assert!(cs.disconnect_services());
    }

    #[test]
    fn test_bind_failure_returns_false() {
        // a listening socket holds the port
        let blocker = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let mut config = NetworkConfig::client("second");
        config.port = blocker.local_addr().unwrap().port();
        let cs = ConnectionSystem::new(config, FrameworkLock::new());
        assert!(!cs.connect_services());
        assert!(!cs.is_connected());
    }

    #[test]
    fn test_diagnostics_work_in_both_states() {
        let cs = system("a");
        cs.log_connection_info();
        cs.trigger_log_message_for_periodic_log();
        assert!(cs.connect_services());
        cs.log_connection_info();
        cs.trigger_log_message_for_periodic_log();
        assert!(cs.disconnect_services());
    }

    #[test]
    fn test_drop_disconnects() {
        let cs = system("a");
        assert!(cs.connect_services());
        drop(cs);
    }
}
