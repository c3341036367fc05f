//! devfleet process supervisor.
//!
//! - [`ports`]: per-scope port and socket reservations
//! - [`process`]: spawn, stop and track dev servers and agent sessions
//! - [`health`]: polling health monitor and resource sampling

pub mod error;
pub mod health;
pub mod ports;
pub mod process;
pub mod types;

pub use error::{ErrorCategory, SupervisorError, SupervisorResult};
pub use health::{HealthMonitor, HealthProbe, HealthSettings, HttpProbe, ProbeOutcome};
pub use ports::{LoopbackProbe, PortProbe, PortRegistry, Reservation, SocketState};
pub use process::{ExitInfo, ProcessSupervisor, SupervisorSettings};
pub use types::*;
