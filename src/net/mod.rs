//! Networking module
//!
//! This module handles all network-related functionality for the Ferroscape server:
//! - Per-host admission and connect throttling
//! - Byte and bit granular packet buffers
//! - Session management and the login stage machine
//! - Connection lifecycle and steady-state frame decoding

pub mod buffer;
pub mod dispatcher;
pub mod gateway;
pub mod handler;
pub mod session;
