//! Game module
//!
//! This module contains the core game logic for the Ferroscape server:
//! - World management (game tick, entity registries)
//! - Entities, movement and the per-tick update blocks
//! - Scheduled tasks such as the death sequence
//! - Player state persistence on a blocking worker pool

pub mod entity;
pub mod movement;
pub mod persistence;
pub mod sync;
pub mod task;
pub mod world;
