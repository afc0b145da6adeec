//! Protocol module
//!
//! This module contains the protocol implementations for the Ferroscape server:
//! - Handshake protocol (connect request, login reply, disconnect)
//! - Login protocol (login block decoding and credential rules)
//! - Game packets (incoming frame sizes and opcode handlers)

pub mod handshake;
pub mod login;
pub mod packets;
