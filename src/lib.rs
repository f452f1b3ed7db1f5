pub mod config;
pub mod error;
pub mod logger;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod store;
pub mod utils;

#[cfg(feature = "desktop")]
pub mod commands;

pub use config::{SignalingConfig, StoreConfig};
pub use error::{Result, SignalingError};
pub use session::{CallPhase, CallStatus};
pub use signaling::SignalingCoordinator;
pub use store::{CallRecord, MemoryStore, PostgrestStore, RendezvousStore, Side};
