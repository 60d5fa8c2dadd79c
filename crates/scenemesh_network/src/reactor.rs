//! The event loop behind a [`ConnectionSystem`](crate::ConnectionSystem).
//!
//! One `Reactor` runs on the connection system's background thread. It owns
//! every participant handle and processes all socket completions, timer
//! firings and posted commands serially from a single channel, so handle
//! state is only ever touched from one place.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use scenemesh_core::FrameworkLock;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{decode_frame, encode_frame};
use crate::config::NetworkConfig;
use crate::discovery::{
    AddressEntry, ConnectDecision, LocalParticipant, decode_address_exchange,
    encode_address_exchange, plan_address_exchange,
};
use crate::error::CodecError;
use crate::handler::{SceneProviderServiceHandler, SceneRendererServiceHandler};
use crate::identity::{ParticipantAddress, ParticipantId, ParticipantType};
use crate::message::{
    ConnectionDescription, MessageType, OutboundMessage, decode_scene_data, decode_scene_id,
    decode_scene_infos,
};
use crate::participant::{HandleId, Participant, ParticipantState, Reconnect, TimerKind};
use crate::status::{ConnectionStatus, ConnectionStatusUpdateNotifier};
use crate::transport::{self, Command, Event, EventReceiver, EventSender};

/// Delay before a failed outbound connect is retried.
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Delay before an address removed with [`Reconnect::WithBackoff`] is
/// evaluated again.
pub const RECONNECT_BACKOFF: Duration = Duration::from_millis(2000);

// ---------------------------------------------------------------------------
// State shared with API threads
// ---------------------------------------------------------------------------

/// State visible to both the API side and the reactor.
pub struct SharedState {
    pub lock: FrameworkLock,
    pub notifier: ConnectionStatusUpdateNotifier,
    /// Established, non-PureDaemon peers. Broadcast destinations.
    pub broadcast_targets: Mutex<Vec<ParticipantId>>,
    pub provider_handler: RwLock<Option<Arc<dyn SceneProviderServiceHandler>>>,
    pub renderer_handler: RwLock<Option<Arc<dyn SceneRendererServiceHandler>>>,
}

impl SharedState {
    pub fn new(lock: FrameworkLock, owner: &str) -> Self {
        Self {
            lock,
            notifier: ConnectionStatusUpdateNotifier::new(owner),
            broadcast_targets: Mutex::new(Vec::new()),
            provider_handler: RwLock::new(None),
            renderer_handler: RwLock::new(None),
        }
    }

    /// Update broadcast targets and tell listeners, under the framework lock.
    fn trigger_connection_update(&self, participant: ParticipantId, status: ConnectionStatus) {
        let _guard = self.lock.lock();
        {
            let mut targets = self.broadcast_targets.lock();
            match status {
                ConnectionStatus::Connected => {
                    if !targets.contains(&participant) {
                        targets.push(participant);
                    }
                }
                ConnectionStatus::NotConnected => targets.retain(|p| *p != participant),
            }
        }
        self.notifier.trigger_notification(participant, status);
    }
}

// ---------------------------------------------------------------------------
// Reactor
// ---------------------------------------------------------------------------

pub struct Reactor {
    local: LocalParticipant,
    protocol_version: u32,
    alive_interval: Duration,
    alive_timeout: Duration,
    chunk_size: usize,
    listening_port: u16,
    participants: HashMap<HandleId, Participant>,
    connecting: HashSet<HandleId>,
    established: HashMap<ParticipantId, HandleId>,
    next_handle: HandleId,
    events: EventSender,
    shared: Arc<SharedState>,
    started: Instant,
}

impl Reactor {
    pub fn new(config: &NetworkConfig, events: EventSender, shared: Arc<SharedState>) -> Self {
        Self {
            local: LocalParticipant::from_config(config),
            protocol_version: config.protocol_version,
            alive_interval: config.alive_interval,
            alive_timeout: config.alive_timeout,
            chunk_size: config.chunk_size,
            listening_port: config.port,
            participants: HashMap::new(),
            connecting: HashSet::new(),
            established: HashMap::new(),
            next_handle: 1,
            events,
            shared,
            started: Instant::now(),
        }
    }

    /// The port actually bound, announced in our hello.
    pub fn with_listening_port(mut self, port: u16) -> Self {
        self.listening_port = port;
        self
    }

    fn name(&self) -> &str {
        self.local.name()
    }

    /// Run until `stop` fires, then tear everything down.
    pub async fn run(
        mut self,
        listener: tokio::net::TcpListener,
        mut events: EventReceiver,
        mut stop: oneshot::Receiver<()>,
    ) {
        let acceptor = transport::spawn_acceptor(listener, self.events.clone(), self.name().to_string());

        self.connect_to_configured_daemon(ParticipantAddress::default());

        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }

        acceptor.abort();
        self.teardown();
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Posted(Command::Send(message)) => self.post_message(message),
            Event::Posted(Command::LogConnectionInfo) => self.log_connection_info(),
            Event::Posted(Command::LogPeriodic) => self.log_periodic(),
            Event::Accepted { stream, remote } => {
                info!("ConnectionSystem({}): accepted new connection from {remote}", self.name());
                let handle = self.insert(
                    ParticipantAddress::default(),
                    ParticipantType::Client,
                    ParticipantState::WaitingForHello,
                );
                self.initialize_connected(handle, stream);
            }
            Event::Connected { handle, result } => self.on_connected(handle, result),
            Event::HeaderRead { handle, length } => {
                trace!("ConnectionSystem({}): handle {handle} announces {length} bytes", self.name());
                self.update_last_received(handle);
            }
            Event::Received { handle, body } => {
                if self.participants.contains_key(&handle) {
                    self.update_last_received(handle);
                    self.handle_received_message(handle, body);
                }
            }
            Event::ReadFailed { handle, error } => {
                if let Some(p) = self.participants.get(&handle) {
                    warn!(
                        "ConnectionSystem({}): read from {} failed: {error}",
                        self.name(),
                        p.address.id
                    );
                    self.remove_participant(handle, Reconnect::Immediately);
                }
            }
            Event::WriteDone {
                handle,
                writer,
                result,
            } => self.on_write_done(handle, writer, result),
            Event::TimerFired {
                handle,
                kind,
                generation,
            } => self.on_timer(handle, kind, generation),
            Event::ReconnectDue {
                address,
                configured_daemon: true,
            } => self.connect_to_configured_daemon(address),
            Event::ReconnectDue { address, .. } => self.add_new_participant_by_address(address),
        }
    }

    // -- handle bookkeeping --------------------------------------------------

    fn insert(
        &mut self,
        address: ParticipantAddress,
        participant_type: ParticipantType,
        state: ParticipantState,
    ) -> HandleId {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.participants
            .insert(handle, Participant::new(address, participant_type, state));
        self.connecting.insert(handle);
        handle
    }

    fn arm_timer(&mut self, handle: HandleId, kind: TimerKind, after: Duration) {
        let events = self.events.clone();
        if let Some(p) = self.participants.get_mut(&handle) {
            p.arm_timer(kind, |generation| {
                transport::spawn_timer(handle, kind, generation, after, events)
            });
        }
    }

    /// Whether a handle in `connecting` already targets this address.
    fn is_connecting_to(&self, address: &ParticipantAddress) -> bool {
        self.connecting.iter().any(|h| {
            self.participants.get(h).is_some_and(|p| {
                p.address.same_endpoint(&address.ip, address.port)
                    || (!address.id.is_invalid() && p.address.id == address.id)
            })
        })
    }

    /// Remove a handle and apply the reconnect policy. Removing a handle
    /// that is already gone does nothing.
    pub(crate) fn remove_participant(&mut self, handle: HandleId, reconnect: Reconnect) {
        let Some(mut participant) = self.participants.remove(&handle) else {
            return;
        };
        if participant.state == ParticipantState::Invalid {
            return;
        }
        info!(
            "ConnectionSystem({}): remove participant {}/{}, state {}",
            self.name(),
            participant.address.id,
            participant.address.name,
            participant.state
        );

        let notify = participant.is_established()
            && participant.participant_type != ParticipantType::PureDaemon;
        participant.teardown();

        self.connecting.remove(&handle);
        let id = participant.address.id;
        if !id.is_invalid() && self.established.get(&id) == Some(&handle) {
            self.established.remove(&id);
        }

        if notify {
            self.shared
                .trigger_connection_update(id, ConnectionStatus::NotConnected);
        }

        let configured_daemon = participant.is_configured_daemon;
        match reconnect {
            Reconnect::Immediately if configured_daemon => {
                self.connect_to_configured_daemon(participant.address)
            }
            Reconnect::Immediately => self.add_new_participant_by_address(participant.address),
            Reconnect::WithBackoff => {
                info!(
                    "ConnectionSystem({}): will delay reconnect by {}ms",
                    self.name(),
                    RECONNECT_BACKOFF.as_millis()
                );
                transport::spawn_reconnect(
                    participant.address,
                    configured_daemon,
                    RECONNECT_BACKOFF,
                    self.events.clone(),
                );
            }
            Reconnect::Never => {}
        }
    }

    /// Dial the upstream daemon at its configured ip and port. Unlike
    /// discovered peers this ignores the id comparison and our own role:
    /// the daemon never dials back. `previous` keeps the id and name learned
    /// from an earlier hello, if any.
    fn connect_to_configured_daemon(&mut self, previous: ParticipantAddress) {
        let Some(daemon) = self.local.other_daemon.clone() else {
            return;
        };
        let address = ParticipantAddress::new(previous.id, previous.name, daemon.ip, daemon.port);
        if !address.id.is_invalid() && self.established.contains_key(&address.id) {
            debug!(
                "ConnectionSystem({}): daemon {} already established",
                self.name(),
                address.id
            );
            return;
        }
        if self.is_connecting_to(&address) {
            debug!(
                "ConnectionSystem({}): already connecting to daemon at {}:{}",
                self.name(),
                address.ip,
                address.port
            );
            return;
        }

        info!(
            "ConnectionSystem({}): initiate connection to daemon at {}:{}",
            self.name(),
            address.ip,
            address.port
        );
        let handle = self.insert(address, ParticipantType::Daemon, ParticipantState::Connecting);
        if let Some(p) = self.participants.get_mut(&handle) {
            p.is_configured_daemon = true;
        }
        self.do_connect(handle);
    }

    /// Decide whether to connect to `address` and start the attempt if so.
    fn add_new_participant_by_address(&mut self, address: ParticipantAddress) {
        // accepted sockets that never sent a hello have nothing to dial
        if address.port == 0 {
            return;
        }
        if !address.id.is_invalid() && self.established.contains_key(&address.id) {
            debug!(
                "ConnectionSystem({}): {} already established, not connecting again",
                self.name(),
                address.id
            );
            return;
        }
        if self.is_connecting_to(&address) {
            debug!(
                "ConnectionSystem({}): already connecting to {}:{}",
                self.name(),
                address.ip,
                address.port
            );
            return;
        }

        match self.local.connect_decision(&address) {
            ConnectDecision::Initiate { target_is_daemon } => {
                info!(
                    "ConnectionSystem({}): attempt new connection to participant {}/{} (daemon: {target_is_daemon})",
                    self.name(),
                    address.id,
                    address.name
                );
                let participant_type = if target_is_daemon {
                    ParticipantType::Daemon
                } else {
                    ParticipantType::Client
                };
                let handle = self.insert(address, participant_type, ParticipantState::Connecting);
                if let Some(p) = self.participants.get_mut(&handle) {
                    p.is_configured_daemon = target_is_daemon;
                }
                self.do_connect(handle);
            }
            ConnectDecision::Wait => {
                info!(
                    "ConnectionSystem({}): will wait for connection from participant {}/{}",
                    self.name(),
                    address.id,
                    address.name
                );
            }
        }
    }

    // -- connect / accept ----------------------------------------------------

    fn do_connect(&mut self, handle: HandleId) {
        let Some(p) = self.participants.get(&handle) else {
            return;
        };
        debug!(
            "ConnectionSystem({}): try connect to participant at {}:{}",
            self.name(),
            p.address.ip,
            p.address.port
        );
        let Some(ip) = transport::resolve_ip(&p.address.ip) else {
            warn!(
                "ConnectionSystem({}): failed to parse ip address '{}:{}'",
                self.name(),
                p.address.ip,
                p.address.port
            );
            self.remove_participant(handle, Reconnect::Never);
            return;
        };
        let target = SocketAddr::new(ip, p.address.port);
        let task = transport::spawn_connect(handle, target, self.chunk_size, self.events.clone());
        if let Some(p) = self.participants.get_mut(&handle) {
            p.set_connect_task(task);
        }
    }

    fn on_connected(&mut self, handle: HandleId, result: std::io::Result<TcpStream>) {
        let Some(p) = self.participants.get(&handle) else {
            return;
        };
        if p.state != ParticipantState::Connecting {
            return;
        }
        match result {
            Ok(stream) => {
                info!(
                    "ConnectionSystem({}): connection established to {}:{}",
                    self.name(),
                    p.address.ip,
                    p.address.port
                );
                self.initialize_connected(handle, stream);
            }
            Err(e) => {
                debug!(
                    "ConnectionSystem({}): connect to {}:{} failed: {e}",
                    self.name(),
                    p.address.ip,
                    p.address.port
                );
                self.arm_timer(handle, TimerKind::ConnectRetry, CONNECT_RETRY_DELAY);
            }
        }
    }

    /// Common path for accepted and connected sockets: start reading, arm
    /// the receive timeout and send our hello.
    fn initialize_connected(&mut self, handle: HandleId, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("ConnectionSystem({}): cannot disable nagle: {e}", self.name());
        }
        let (reader, writer) = stream.into_split();
        let read_task = transport::spawn_reader(handle, reader, self.events.clone());
        let Some(p) = self.participants.get_mut(&handle) else {
            read_task.abort();
            return;
        };
        p.attach_socket(writer, read_task);
        p.state = ParticipantState::WaitingForHello;
        debug!("ConnectionSystem({}): initialize newly connected participant", self.local.name());

        self.update_last_received(handle);
        self.send_connection_description(handle);
    }

    fn send_connection_description(&mut self, handle: HandleId) {
        let mut address = self.local.address.clone();
        address.port = self.listening_port;
        let hello = ConnectionDescription {
            address,
            participant_type: self.local.participant_type,
        };
        let message = OutboundMessage::new(
            Vec::new(),
            MessageType::ConnectionDescriptionMessage,
            hello.encode(),
        );
        if let Some(p) = self.participants.get_mut(&handle) {
            p.out_queue.push_front(message);
        }
        self.send_queued(handle);
    }

    // -- writing -------------------------------------------------------------

    /// Queue `message` on every established destination.
    fn post_message(&mut self, message: OutboundMessage) {
        match message.destinations.len() {
            0 => {}
            1 => {
                let to = message.destinations[0];
                let Some(&handle) = self.established.get(&to) else {
                    warn!(
                        "ConnectionSystem({}): post message {} to not (fully) connected participant {to}",
                        self.name(),
                        message.message_type
                    );
                    return;
                };
                if let Some(p) = self.participants.get_mut(&handle) {
                    p.out_queue.push_back(message);
                }
                self.send_queued(handle);
            }
            _ => {
                // skip peers that went away since the broadcast was posted
                let handles: Vec<HandleId> = message
                    .destinations
                    .iter()
                    .filter_map(|to| self.established.get(to).copied())
                    .collect();
                for handle in handles {
                    if let Some(p) = self.participants.get_mut(&handle) {
                        p.out_queue.push_back(message.clone());
                    }
                    self.send_queued(handle);
                }
            }
        }
    }

    /// Start writing the next queued message if nothing is in flight.
    fn send_queued(&mut self, handle: HandleId) {
        let Some(p) = self.participants.get_mut(&handle) else {
            return;
        };
        if !p.can_write() {
            return;
        }
        let Some(message) = p.out_queue.pop_front() else {
            return;
        };
        self.send_message(handle, message);
    }

    fn send_message(&mut self, handle: HandleId, message: OutboundMessage) {
        let frame = encode_frame(
            self.protocol_version,
            message.message_type.to_wire(),
            &message.payload,
        );
        let events = self.events.clone();
        let Some(p) = self.participants.get_mut(&handle) else {
            return;
        };
        let Some(writer) = p.begin_write() else {
            p.out_queue.push_front(message);
            return;
        };
        debug!(
            "ConnectionSystem({}): send to {}, type {}, size {}",
            self.local.name(),
            p.address.id,
            message.message_type,
            frame.len()
        );
        p.set_write_task(transport::spawn_writer(handle, writer, frame, events));
    }

    fn on_write_done(
        &mut self,
        handle: HandleId,
        writer: OwnedWriteHalf,
        result: std::io::Result<()>,
    ) {
        let Some(p) = self.participants.get_mut(&handle) else {
            return;
        };
        match result {
            Ok(()) => {
                p.finish_write(writer);
                self.arm_timer(handle, TimerKind::SendAlive, self.alive_interval);
                self.send_queued(handle);
            }
            Err(e) => {
                warn!(
                    "ConnectionSystem({}): send to {}/{} failed: {e}. Remove participant",
                    self.local.name(),
                    p.address.id,
                    p.address.name
                );
                self.remove_participant(handle, Reconnect::Immediately);
            }
        }
    }

    // -- timers --------------------------------------------------------------

    fn on_timer(&mut self, handle: HandleId, kind: TimerKind, generation: u64) {
        let Some(p) = self.participants.get_mut(&handle) else {
            return;
        };
        if !p.is_current_timer(kind, generation) {
            return;
        }
        p.timer_fired(kind);

        match kind {
            TimerKind::ConnectRetry => self.do_connect(handle),
            TimerKind::SendAlive => self.try_send_alive(handle),
            TimerKind::CheckAlive => {
                let silent_for = p
                    .last_received
                    .map(|t| t.elapsed().as_millis())
                    .unwrap_or_default();
                warn!(
                    "ConnectionSystem({}): alive message from {} too old. last received {silent_for}ms ago, expected alive every {}ms, latest after {}ms",
                    self.local.name(),
                    p.address.id,
                    self.alive_interval.as_millis(),
                    self.alive_timeout.as_millis()
                );
                self.remove_participant(handle, Reconnect::Immediately);
            }
        }
    }

    fn try_send_alive(&mut self, handle: HandleId) {
        let Some(p) = self.participants.get(&handle) else {
            return;
        };
        if !p.can_write() {
            return;
        }
        if p.out_queue.is_empty() {
            self.send_message(handle, OutboundMessage::alive());
        } else {
            self.send_queued(handle);
        }
    }

    fn update_last_received(&mut self, handle: HandleId) {
        let Some(p) = self.participants.get_mut(&handle) else {
            return;
        };
        p.last_received = Some(Instant::now());
        self.arm_timer(handle, TimerKind::CheckAlive, self.alive_timeout);
    }

    // -- receiving -----------------------------------------------------------

    fn handle_received_message(&mut self, handle: HandleId, body: Bytes) {
        let (header, payload) = match decode_frame(&body) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("ConnectionSystem({}): malformed frame: {e}", self.name());
                self.remove_participant(handle, Reconnect::WithBackoff);
                return;
            }
        };

        if header.protocol_version != self.protocol_version {
            warn!(
                "ConnectionSystem({}): invalid protocol version received (expected {}, got {}). Drop connection",
                self.name(),
                self.protocol_version,
                header.protocol_version
            );
            self.remove_participant(handle, Reconnect::WithBackoff);
            return;
        }

        let Some((from, state)) = self
            .participants
            .get(&handle)
            .map(|p| (p.address.id, p.state))
        else {
            return;
        };

        let Some(message_type) = MessageType::from_wire(header.message_type) else {
            error!(
                "ConnectionSystem({}): invalid message type {} from {from}",
                self.name(),
                header.message_type
            );
            self.remove_participant(handle, Reconnect::Never);
            return;
        };
        trace!("ConnectionSystem({}): from {from}, type {message_type}", self.name());

        let result = match message_type {
            MessageType::Alive => Ok(()),
            MessageType::ConnectionDescriptionMessage => {
                self.handle_connection_description(handle, payload);
                Ok(())
            }
            _ if state != ParticipantState::Established => {
                warn!(
                    "ConnectionSystem({}): drop {message_type} received before hello",
                    self.name()
                );
                Ok(())
            }
            MessageType::ConnectorAddressExchange => self.handle_address_exchange(from, payload),
            _ => self.dispatch_scene_message(from, message_type, payload),
        };

        if let Err(e) = result {
            warn!(
                "ConnectionSystem({}): cannot decode {message_type} from {from}: {e}",
                self.name()
            );
            self.remove_participant(handle, Reconnect::WithBackoff);
        }
    }

    fn handle_connection_description(&mut self, handle: HandleId, payload: &[u8]) {
        let Some(p) = self.participants.get(&handle) else {
            return;
        };
        match p.state {
            ParticipantState::Established => {
                warn!(
                    "ConnectionSystem({}): duplicate connection description while established from {}",
                    self.name(),
                    p.address.id
                );
                return;
            }
            ParticipantState::WaitingForHello => {}
            state => {
                error!(
                    "ConnectionSystem({}): unexpected connection description from {} in state {state}",
                    self.name(),
                    p.address.id
                );
                self.remove_participant(handle, Reconnect::WithBackoff);
                return;
            }
        }

        let hello = match ConnectionDescription::decode(payload) {
            Ok(hello) if !hello.address.id.is_invalid() => hello,
            Ok(_) => {
                warn!("ConnectionSystem({}): hello without participant id", self.name());
                self.remove_participant(handle, Reconnect::WithBackoff);
                return;
            }
            Err(e) => {
                warn!("ConnectionSystem({}): malformed hello: {e}", self.name());
                self.remove_participant(handle, Reconnect::WithBackoff);
                return;
            }
        };

        let id = hello.address.id;
        let mut inherits_daemon_role = false;
        if let Some(&stale) = self.established.get(&id) {
            if stale != handle {
                warn!(
                    "ConnectionSystem({}): {id} connected again, dropping the older link",
                    self.name()
                );
                inherits_daemon_role = self
                    .participants
                    .get(&stale)
                    .is_some_and(|p| p.is_configured_daemon);
                self.remove_participant(stale, Reconnect::Never);
            }
        }

        info!(
            "ConnectionSystem({}): hello from {}/{} type {} at {}:{}. Established now",
            self.name(),
            id,
            hello.address.name,
            hello.participant_type,
            hello.address.ip,
            hello.address.port
        );

        let Some(p) = self.participants.get_mut(&handle) else {
            return;
        };
        p.address = hello.address;
        p.participant_type = hello.participant_type;
        p.is_configured_daemon |= inherits_daemon_role;
        p.state = ParticipantState::Established;
        self.connecting.remove(&handle);
        self.established.insert(id, handle);

        if hello.participant_type != ParticipantType::PureDaemon {
            self.shared
                .trigger_connection_update(id, ConnectionStatus::Connected);
        }

        self.send_address_exchange_for_new_participant(handle);
    }

    fn send_address_exchange_for_new_participant(&mut self, handle: HandleId) {
        if !self.local.acts_as_daemon() {
            return;
        }
        let Some(new_peer) = self
            .participants
            .get(&handle)
            .map(|p| AddressEntry::new(p.address.clone(), p.participant_type))
        else {
            return;
        };
        info!(
            "ConnectionSystem({}): send address exchange for {}/{}",
            self.name(),
            new_peer.address.id,
            new_peer.address.name
        );

        let established: Vec<AddressEntry> = self
            .established
            .values()
            .filter_map(|h| self.participants.get(h))
            .map(|p| AddressEntry::new(p.address.clone(), p.participant_type))
            .collect();

        for (to, entries) in plan_address_exchange(&new_peer, &established) {
            debug!(
                "ConnectionSystem({}): send {} entries to {to}",
                self.name(),
                entries.len()
            );
            self.post_message(OutboundMessage::to_one(
                to,
                MessageType::ConnectorAddressExchange,
                encode_address_exchange(&entries),
            ));
        }
    }

    fn handle_address_exchange(
        &mut self,
        from: ParticipantId,
        payload: &[u8],
    ) -> Result<(), CodecError> {
        let entries = decode_address_exchange(payload)?;
        info!(
            "ConnectionSystem({}): address exchange from {from}, {} entries",
            self.name(),
            entries.len()
        );

        for entry in entries {
            let address = entry.address;
            debug!(
                "ConnectionSystem({}): from {from}: {address}, type {}",
                self.name(),
                entry.participant_type
            );
            if let Some(existing) = self
                .established
                .get(&address.id)
                .and_then(|h| self.participants.get(h))
            {
                if existing.address != address {
                    warn!(
                        "ConnectionSystem({}): received mismatching participant info for {}. Expect problems",
                        self.name(),
                        address.id
                    );
                } else {
                    debug!(
                        "ConnectionSystem({}): same information for existing participant {}",
                        self.name(),
                        address.id
                    );
                }
            } else if address.id == self.local.id() {
                debug!("ConnectionSystem({}): got info for self", self.name());
            } else if self.is_connecting_to(&address) {
                debug!(
                    "ConnectionSystem({}): already connecting to {address}",
                    self.name()
                );
            } else {
                self.add_new_participant_by_address(address);
            }
        }
        Ok(())
    }

    /// Decode scene traffic and hand it to the registered handler, with the
    /// framework lock held. Messages without a handler are dropped undecoded.
    fn dispatch_scene_message(
        &self,
        from: ParticipantId,
        message_type: MessageType,
        payload: &[u8],
    ) -> Result<(), CodecError> {
        let provider = self.shared.provider_handler.read().clone();
        let renderer = self.shared.renderer_handler.read().clone();

        match message_type {
            MessageType::SubscribeScene => {
                if let Some(handler) = provider {
                    let scene_id = decode_scene_id(payload)?;
                    debug!("ConnectionSystem({}): subscribe scene {scene_id} from {from}", self.name());
                    let _guard = self.shared.lock.lock();
                    handler.handle_subscribe_scene(scene_id, from);
                }
            }
            MessageType::UnsubscribeScene => {
                if let Some(handler) = provider {
                    let scene_id = decode_scene_id(payload)?;
                    debug!("ConnectionSystem({}): unsubscribe scene {scene_id} from {from}", self.name());
                    let _guard = self.shared.lock.lock();
                    handler.handle_unsubscribe_scene(scene_id, from);
                }
            }
            MessageType::RendererEvent => {
                if let Some(handler) = provider {
                    let (scene_id, data) = decode_scene_data(payload)?;
                    debug!("ConnectionSystem({}): renderer event for scene {scene_id} from {from}", self.name());
                    let _guard = self.shared.lock.lock();
                    handler.handle_renderer_event(scene_id, data, from);
                }
            }
            MessageType::PublishScene => {
                if let Some(handler) = renderer {
                    let scenes = decode_scene_infos(payload)?;
                    debug!("ConnectionSystem({}): {} scenes published by {from}", self.name(), scenes.len());
                    let _guard = self.shared.lock.lock();
                    handler.handle_new_scenes_available(&scenes, from);
                }
            }
            MessageType::UnpublishScene => {
                if let Some(handler) = renderer {
                    let scenes = decode_scene_infos(payload)?;
                    debug!("ConnectionSystem({}): {} scenes unpublished by {from}", self.name(), scenes.len());
                    let _guard = self.shared.lock.lock();
                    handler.handle_scenes_became_unavailable(&scenes, from);
                }
            }
            MessageType::CreateScene => {
                if let Some(handler) = renderer {
                    let scene_id = decode_scene_id(payload)?;
                    debug!("ConnectionSystem({}): initialize scene {scene_id} from {from}", self.name());
                    let _guard = self.shared.lock.lock();
                    handler.handle_initialize_scene(scene_id, from);
                }
            }
            MessageType::SendSceneUpdate => {
                if let Some(handler) = renderer {
                    let (scene_id, data) = decode_scene_data(payload)?;
                    trace!("ConnectionSystem({}): scene update chunk for {scene_id} from {from}", self.name());
                    let _guard = self.shared.lock.lock();
                    handler.handle_scene_update(scene_id, data, from);
                }
            }
            MessageType::Alive
            | MessageType::ConnectionDescriptionMessage
            | MessageType::ConnectorAddressExchange => {}
        }
        Ok(())
    }

    // -- diagnostics ---------------------------------------------------------

    fn log_connection_info(&self) {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "ConnectionSystem({}): {} at {}:{}, running for {}s, protocol version {}, type {}",
            self.name(),
            self.local.id(),
            self.local.address.ip,
            self.listening_port,
            self.started.elapsed().as_secs(),
            self.protocol_version,
            self.local.participant_type
        );
        match &self.local.other_daemon {
            Some(d) => {
                let _ = writeln!(out, "  daemon at {}:{}", d.ip, d.port);
            }
            None => {
                let _ = writeln!(out, "  no other daemon");
            }
        }
        let _ = writeln!(out, "  established connections: {}", self.established.len());
        for handle in self.established.values() {
            if let Some(p) = self.participants.get(handle) {
                let _ = writeln!(
                    out,
                    "    {} type {}, queued {}, last sent {}, last received {}",
                    p.address,
                    p.participant_type,
                    p.out_queue.len(),
                    ago(p.last_sent),
                    ago(p.last_received)
                );
            }
        }
        let _ = writeln!(out, "  connection attempts: {}", self.connecting.len());
        for handle in &self.connecting {
            if let Some(p) = self.participants.get(handle) {
                let daemon = if p.is_configured_daemon {
                    " (daemon)"
                } else {
                    ""
                };
                let _ = writeln!(out, "    {}:{} state {}{daemon}", p.address.ip, p.address.port, p.state);
            }
        }
        info!("{}", out.trim_end());
    }

    fn log_periodic(&self) {
        if self.established.is_empty() {
            info!("Connected Participant(s): None");
            return;
        }
        let ids: Vec<String> = self.established.keys().map(|id| id.to_string()).collect();
        info!("Connected Participant(s): {}", ids.join("; "));
    }

    /// Notify about every established peer and drop all handles.
    fn teardown(&mut self) {
        let gone: Vec<ParticipantId> = self
            .established
            .iter()
            .filter_map(|(id, h)| self.participants.get(h).map(|p| (*id, p)))
            .filter(|(_, p)| p.participant_type != ParticipantType::PureDaemon)
            .map(|(id, _)| id)
            .collect();
        for id in gone {
            self.shared
                .trigger_connection_update(id, ConnectionStatus::NotConnected);
        }

        for participant in self.participants.values_mut() {
            participant.teardown();
        }
        self.participants.clear();
        self.connecting.clear();
        self.established.clear();
        debug!("ConnectionSystem({}): event loop stopped", self.name());
    }
}

fn ago(at: Option<Instant>) -> String {
    match at {
        Some(t) => format!("{}ms ago", t.elapsed().as_millis()),
        None => String::from("never"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
