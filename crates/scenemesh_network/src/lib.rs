//! SceneMesh Network: TCP mesh connection layer.
//!
//! Every participant of a distributed scene-rendering setup runs one
//! [`ConnectionSystem`]. It accepts and opens TCP links to the other
//! participants, learns about them through relay daemons, keeps idle links
//! alive with heartbeats, and exchanges scene traffic with them.
//!
//! # Architecture
//!
//! - **Transport**: one TCP stream per participant pair, length-prefixed
//!   little-endian frames (`codec`).
//! - **Discovery**: daemons relay peer addresses; a deterministic id
//!   comparison decides which side of a pair connects (`discovery`).
//! - **Reactor**: one background thread with a single-threaded tokio
//!   runtime owns all connection state (`reactor`, `participant`).
//! - **Handlers**: decoded scene messages go to the registered
//!   [`SceneProviderServiceHandler`] / [`SceneRendererServiceHandler`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use scenemesh_core::FrameworkLock;
//! use scenemesh_network::{ConnectionSystem, NetworkConfig};
//! use scenemesh_network::config::DaemonAddress;
//!
//! let mut config = NetworkConfig::client("renderer");
//! config.daemon = Some(DaemonAddress { ip: "127.0.0.1".into(), port: 5999 });
//!
//! let system = ConnectionSystem::new(config, FrameworkLock::new());
//! assert!(system.connect_services());
//! // ... peers connect, scene traffic flows through the handlers ...
//! system.disconnect_services();
//! ```

pub mod chunk;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod handler;
pub mod identity;
pub mod message;
pub mod status;
pub mod system;

mod participant;
mod reactor;
mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use chunk::{BlobSerializer, SceneUpdateReassembler, SceneUpdateSerializer};
pub use config::NetworkConfig;
pub use error::{CodecError, NetworkError};
pub use handler::{SceneProviderServiceHandler, SceneRendererServiceHandler};
pub use identity::{DAEMON_ID, ParticipantAddress, ParticipantId, ParticipantType};
pub use message::{MessageType, SceneId, SceneInfo};
pub use participant::{ParticipantState, Reconnect};
pub use reactor::{CONNECT_RETRY_DELAY, RECONNECT_BACKOFF};
pub use status::{ConnectionStatus, ConnectionStatusListener, ConnectionStatusUpdateNotifier};
pub use system::ConnectionSystem;
