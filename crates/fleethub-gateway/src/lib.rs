//! FleetHub Gateway Library
//!
//! This crate provides the gateway between the cluster manager and the edge
//! fleet: transport listeners, authorization, session tracking, and per-kind
//! buffered dispatch to bounded worker pools.

pub mod auth;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod metrics;
pub mod monitor;
pub mod registry;
pub mod router;
pub mod state;
pub mod tls;
pub mod transport;
pub mod tunnel;
pub mod upstream;

pub use config::Config;
pub use dispatch::Dispatcher;
pub use registry::SessionRegistry;
pub use router::MessageRouter;
pub use state::AppState;
