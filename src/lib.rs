// ABOUTME: Library root for cdc-relay
// ABOUTME: Exposes the relay pipeline modules to the binary and integration tests

pub mod config;
pub mod dedup;
pub mod delivery;
pub mod event;
pub mod manager;
pub mod mysql;
pub mod normalizer;
pub mod pipeline;
pub mod rate_limit;
pub mod sink;
pub mod source;
pub mod stream;
pub mod tracker;
pub mod utils;

pub use config::{RelaySettings, SourceInfo, SourcesConfig};
pub use event::{ChangeEvent, OutboundMessage, PositionMarker, Value};
pub use manager::{Connector, SourceManager};
pub use source::{SourceDeps, SourceOrchestrator};
