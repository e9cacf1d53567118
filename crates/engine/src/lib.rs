//! Session synchronisation between a controller UI and a connected exercise machine.

pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod optimistic;
pub mod phase;
pub mod publisher;
pub mod session;
pub mod sport;
pub mod timer;

pub use config::{EngineConfig, LockConfig, PublishConfig};
pub use engine::{Collaborators, EngineError, EngineEvent, EngineHandle, Intent, Notice, SessionEngine};
pub use lifecycle::Navigator;
pub use phase::Phase;
pub use publisher::{CommandKey, PublishError};
pub use session::Dashboard;
pub use sport::SportState;
