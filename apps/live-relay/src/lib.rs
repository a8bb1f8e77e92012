//! Signaling relay for multi-party peer-to-peer live sessions.
//!
//! Clients hold one websocket each and exchange offers, answers and ICE candidates with the
//! other members of their room through the relay. The relay never touches media.

pub mod cli;
pub mod config;
pub mod connection;
pub mod handlers;
pub mod lifecycle;
pub mod pairing;
pub mod registry;
pub mod relay;
pub mod signaling;
pub mod state;
pub mod store;
pub mod telemetry;

pub use config::RelayConfig;
pub use handlers::build_router;
pub use state::RelayState;
