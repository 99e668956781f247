//! # danalink-client
//!
//! Link session for Dana insulin pumps.
//!
//! This crate provides:
//! - A sans-IO state machine for the pump-check and pairing handshake
//! - An async session with one in-flight request and per-request deadlines
//! - A supervisor for keep-alive pings and automatic reconnect
//! - A transport trait for plugging in a BLE stack

pub mod config;
pub mod core;
pub mod error;
pub mod link;
pub mod state;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::{Config, ConfigError, LinkConfig, SupervisorConfig};
pub use self::core::{Action, HandshakeOutcome, LinkCore, LinkEvent, LinkState, Ticket};
pub use error::{LinkError, PairingFault};
pub use link::{ConnectOutcome, Link};
pub use state::{PersistedPumpState, StateError};
pub use supervisor::Supervisor;
pub use transport::PumpTransport;
