//! Entity synchronization module
//!
//! Builds the per-viewer update frames sent every game tick:
//! - Player updates (opcode 81) and NPC updates (opcode 65)
//! - Interest sets tracking which entities each viewer already knows
//! - Update flags and the attribute blocks they carry

pub mod entity_sync;
pub mod update_flags;

pub use entity_sync::{EntityUpdateEncoder, InterestSet, Syncable, Viewpoint};
pub use update_flags::{UpdateBlocks, UpdateFlags};
