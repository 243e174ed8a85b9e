//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `supervisor`: Start/stop, consumers and pair changes
//! - `session`: Provider session lifecycle and reconnection
//! - `heartbeat`: Pings and staleness detection while Live
//! - `reconnect`: Exponential backoff policy
//! - `monitor`: Connection state shared with the health readout

pub mod heartbeat;
pub mod monitor;
pub mod reconnect;
pub mod session;
pub mod supervisor;

pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatEventKind, HeartbeatManager, LivenessState};
pub use monitor::{ConnectionHealth, ConnectionMonitor, ConsumerHealth, HealthSnapshot};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectPolicy};
pub use session::{ReconnectionManager, SessionConfig, SessionContext};
pub use supervisor::{ShutdownMode, StreamSupervisor, SupervisorConfig, SupervisorError};
