//! Ferroscape Game Server Library
//!
//! This library provides the network core of a 317 revision world server:
//! connection admission, the login handshake, steady-state packet decoding
//! and the world tick that keeps every client's view of nearby entities in sync.
//!
//! ## Modules
//!
//! - `config` - Server configuration management
//! - `crypto` - Cryptographic utilities (ISAAC, RSA)
//! - `error` - Error types and result definitions
//! - `game` - Game world, entities and synchronization
//! - `net` - Network handling and session management
//! - `protocol` - Handshake, login and game packet handling
//! - `state` - Shared application state

pub mod config;
pub mod crypto;
pub mod error;
pub mod game;
pub mod net;
pub mod protocol;
pub mod state;

// Re-export commonly used types
pub use config::ServerConfig;
pub use error::{FerroscapeError, Result};
pub use state::AppState;

/// Server version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Client version the login block must carry
pub const CLIENT_VERSION: u16 = 317;
