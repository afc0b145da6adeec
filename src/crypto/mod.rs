//! Cryptography module
//!
//! This module provides cryptographic primitives used by the Ferroscape server:
//! - ISAAC keystream for opcode obfuscation
//! - RSA for the secure part of the login block

pub mod isaac;
pub mod rsa;

// Re-export commonly used types
pub use isaac::{Isaac, IsaacPair};
pub use rsa::{RsaDecryptor, RsaKeyPair};
