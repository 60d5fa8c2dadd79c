//! Per-connection state owned by the reactor.
//!
//! The reactor keeps every [`Participant`] in an arena keyed by
//! [`HandleId`]. Background tasks only ever carry the id, so a completion
//! arriving after the participant was removed finds nothing and is dropped.

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::task::AbortHandle;

use crate::identity::{ParticipantAddress, ParticipantType};
use crate::message::OutboundMessage;

/// Stable arena key for one connection attempt.
pub type HandleId = u64;

/// Lifecycle of a connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantState {
    /// Outbound connect in progress.
    Connecting,
    /// Socket usable, peer identity not yet known.
    WaitingForHello,
    /// Handshake complete; application traffic allowed.
    Established,
    /// Torn down. Terminal.
    Invalid,
}

impl fmt::Display for ParticipantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What to do with a peer's address after its handle was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconnect {
    /// Re-run the connect decision right away.
    Immediately,
    /// Re-run the connect decision after a two second backoff.
    WithBackoff,
    /// Forget the address.
    Never,
}

/// The three per-handle timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    ConnectRetry,
    SendAlive,
    CheckAlive,
}

impl TimerKind {
    const COUNT: usize = 3;

    fn index(self) -> usize {
        match self {
            Self::ConnectRetry => 0,
            Self::SendAlive => 1,
            Self::CheckAlive => 2,
        }
    }
}

/// One connection handle.
pub struct Participant {
    pub address: ParticipantAddress,
    pub participant_type: ParticipantType,
    pub state: ParticipantState,
    pub out_queue: VecDeque<OutboundMessage>,
    /// Created for the upstream daemon from our config. Survives the hello,
    /// so the link is redialed at the configured address whatever the
    /// daemon announces.
    pub is_configured_daemon: bool,
    /// `None` while a write is in flight (the write task owns it) or before
    /// the socket is usable.
    writer: Option<OwnedWriteHalf>,
    write_in_flight: bool,
    connect_task: Option<AbortHandle>,
    read_task: Option<AbortHandle>,
    write_task: Option<AbortHandle>,
    timers: [Option<AbortHandle>; TimerKind::COUNT],
    generations: [u64; TimerKind::COUNT],
    pub last_sent: Option<Instant>,
    pub last_received: Option<Instant>,
}

impl Participant {
    pub fn new(
        address: ParticipantAddress,
        participant_type: ParticipantType,
        state: ParticipantState,
    ) -> Self {
        Self {
            address,
            participant_type,
            state,
            out_queue: VecDeque::new(),
            is_configured_daemon: false,
            writer: None,
            write_in_flight: false,
            connect_task: None,
            read_task: None,
            write_task: None,
            timers: Default::default(),
            generations: [0; TimerKind::COUNT],
            last_sent: None,
            last_received: None,
        }
    }

    pub fn is_established(&self) -> bool {
        self.state == ParticipantState::Established
    }

    /// Whether a message may be handed to the socket right now.
    pub fn can_write(&self) -> bool {
        self.writer.is_some() && !self.write_in_flight
    }

    pub fn attach_socket(&mut self, writer: OwnedWriteHalf, read_task: AbortHandle) {
        self.writer = Some(writer);
        self.read_task = Some(read_task);
        self.connect_task = None;
    }

    pub fn set_connect_task(&mut self, task: AbortHandle) {
        if let Some(old) = self.connect_task.replace(task) {
            old.abort();
        }
    }

    /// Hand the writer to a write task. Returns `None` if a write is already
    /// in flight or the socket is not attached.
    pub fn begin_write(&mut self) -> Option<OwnedWriteHalf> {
        if self.write_in_flight {
            return None;
        }
        let writer = self.writer.take()?;
        self.write_in_flight = true;
        Some(writer)
    }

    pub fn set_write_task(&mut self, task: AbortHandle) {
        self.write_task = Some(task);
    }

    /// Take the writer back after a successful write.
    pub fn finish_write(&mut self, writer: OwnedWriteHalf) {
        self.writer = Some(writer);
        self.write_in_flight = false;
        self.write_task = None;
        self.last_sent = Some(Instant::now());
    }

    /// Replace the timer of `kind`, cancelling the previous one.
    ///
    /// `spawn` receives the new generation, which the firing must carry back
    /// to be accepted by [`is_current_timer`](Self::is_current_timer).
    pub fn arm_timer(&mut self, kind: TimerKind, spawn: impl FnOnce(u64) -> AbortHandle) {
        let i = kind.index();
        self.generations[i] += 1;
        if let Some(old) = self.timers[i].take() {
            old.abort();
        }
        self.timers[i] = Some(spawn(self.generations[i]));
    }

    pub fn cancel_timer(&mut self, kind: TimerKind) {
        let i = kind.index();
        self.generations[i] += 1;
        if let Some(old) = self.timers[i].take() {
            old.abort();
        }
    }

    pub fn is_current_timer(&self, kind: TimerKind, generation: u64) -> bool {
        let i = kind.index();
        self.generations[i] == generation && self.timers[i].is_some()
    }

    /// A fired timer is no longer pending.
    pub fn timer_fired(&mut self, kind: TimerKind) {
        self.timers[kind.index()] = None;
    }

    /// Cancel all tasks and timers and close the socket.
    pub fn teardown(&mut self) {
        for kind in [TimerKind::ConnectRetry, TimerKind::SendAlive, TimerKind::CheckAlive] {
            self.cancel_timer(kind);
        }
        for task in [
            self.connect_task.take(),
            self.read_task.take(),
            self.write_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
        self.writer = None;
        self.write_in_flight = false;
        self.out_queue.clear();
        self.state = ParticipantState::Invalid;
    }
}

impl fmt::Debug for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Participant")
            .field("address", &self.address)
            .field("participant_type", &self.participant_type)
            .field("state", &self.state)
            .field("is_configured_daemon", &self.is_configured_daemon)
            .field("queued", &self.out_queue.len())
            .field("write_in_flight", &self.write_in_flight)
            .finish_non_exhaustive()
    }
}
