// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod checkers;
pub mod config;
pub mod keywords;
pub mod metrics;
pub mod notify;
pub mod orchestrator;
pub mod reconfig;
pub mod state;

// ---- Re-exports for stable public API ----
pub use crate::checkers::{Candidate, CheckerConfig, CheckerKind, SourceClients};
pub use crate::config::{AppConfig, ConfigHandle, CursorPolicy};
pub use crate::notify::{ChatTransport, Dispatcher, OutboundMessage};
pub use crate::orchestrator::{Orchestrator, TickReport};
pub use crate::state::{CursorKey, CursorStore, SnapshotCache};
