//! Entity synchronization
//!
//! Builds the per-viewer update frame (opcode 81 for players, 65 for NPCs)
//! each game tick. A frame contains, in order:
//! - the number of entities the viewer already tracks
//! - a movement (or removal) record for each of them
//! - add records for newly visible entities, at most 15 per tick
//! - the attribute blocks of every written entity that has pending updates
//!
//! The viewer's interest set is updated in place as entities are added and evicted.

use parking_lot::RwLock;
use tracing::trace;

use crate::crypto::Isaac;
use crate::error::Result;
use crate::game::entity::{EntityKey, EntityList, Location, Mobile, Npc, Player};
use crate::game::sync::update_flags::{Animation, Hit, HitType, UpdateFlags};
use crate::net::buffer::{ByteOrder, FrameKind, PacketBuffer, ValueType};

/// Player update frame opcode
pub const PLAYER_UPDATE_OPCODE: u8 = 81;

/// NPC update frame opcode
pub const NPC_UPDATE_OPCODE: u8 = 65;

/// Maximum entities a client can track per kind
pub const MAX_LOCAL_ENTITIES: usize = 255;

/// Maximum entities added to an interest set per tick
pub const MAX_ADDS_PER_TICK: usize = 15;

/// Largest update frame built for one viewer
pub const UPDATE_BUFFER_SIZE: usize = 8192;

/// Slot value that ends the add list
const END_OF_ADDS: u32 = 16383;

/// Anything the encoder can write to a viewer
pub trait Syncable {
    fn key(&self) -> EntityKey;
    fn mobile(&self) -> &RwLock<Mobile>;
    /// Definition id sent in the add record
    fn type_id(&self, mobile: &Mobile) -> u16;
}

impl Syncable for Player {
    fn key(&self) -> EntityKey {
        Player::key(self)
    }

    fn mobile(&self) -> &RwLock<Mobile> {
        Player::mobile(self)
    }

    fn type_id(&self, mobile: &Mobile) -> u16 {
        mobile.blocks.transform.unwrap_or(0)
    }
}

impl Syncable for Npc {
    fn key(&self) -> EntityKey {
        Npc::key(self)
    }

    fn mobile(&self) -> &RwLock<Mobile> {
        Npc::mobile(self)
    }

    fn type_id(&self, _mobile: &Mobile) -> u16 {
        self.npc_id
    }
}

/// Entities a viewer currently tracks, in the order the client learned them.
/// Entries carry the uid so a reused slot is never mistaken for the old entity.
#[derive(Debug, Clone, Default)]
pub struct InterestSet {
    entries: Vec<(u16, u64)>,
}

impl InterestSet {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(MAX_LOCAL_ENTITIES),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= MAX_LOCAL_ENTITIES
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains(&(key.slot, key.uid))
    }

    /// Track an entity; returns false when full or already tracked
    pub fn insert(&mut self, key: &EntityKey) -> bool {
        if self.is_full() || self.contains(key) {
            return false;
        }
        self.entries.push((key.slot, key.uid));
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Where the viewer stands this tick
#[derive(Debug, Clone, Copy)]
pub struct Viewpoint {
    pub uid: u64,
    pub location: Location,
}

/// Builds the update frame of one entity kind
#[derive(Debug, Clone, Copy)]
pub struct EntityUpdateEncoder {
    opcode: u8,
}

impl EntityUpdateEncoder {
    pub const fn players() -> Self {
        Self {
            opcode: PLAYER_UPDATE_OPCODE,
        }
    }

    pub const fn npcs() -> Self {
        Self {
            opcode: NPC_UPDATE_OPCODE,
        }
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    /// Build the frame for `viewer`, updating `local` in place. Entities
    /// found dead while writing their hit blocks are pushed to `deaths`.
    pub fn encode<T: Syncable>(
        &self,
        viewer: Viewpoint,
        local: &mut InterestSet,
        entities: &EntityList<T>,
        cipher: Option<&mut Isaac>,
        deaths: &mut Vec<EntityKey>,
    ) -> Result<PacketBuffer> {
        let mut out = PacketBuffer::with_capacity(UPDATE_BUFFER_SIZE);
        let mut block = PacketBuffer::with_capacity(UPDATE_BUFFER_SIZE);

        out.write_var_header(self.opcode, FrameKind::VariableShort, cipher)?;
        out.start_bit_access()?;
        out.write_bits(8, local.len() as u32)?;

        let tracked = std::mem::take(&mut local.entries);
        for (slot, uid) in tracked {
            let entity = entities.get(slot).filter(|e| e.key().uid == uid);
            let retained = match entity {
                Some(entity) => {
                    let mut mobile = entity.mobile().write();
                    if mobile.visible
                        && !mobile.teleported
                        && mobile.location.is_viewable_from(&viewer.location)
                    {
                        let update_required = mobile.blocks.flags.is_update_required();
                        write_movement(&mut out, &mobile, update_required)?;
                        if update_required {
                            write_attributes(&mut block, &mut mobile, entity.key(), deaths)?;
                        }
                        true
                    } else {
                        false
                    }
                }
                None => false,
            };
            if retained {
                local.entries.push((slot, uid));
            } else {
                out.write_bit(true)?;
                out.write_bits(2, 3)?;
                trace!(viewer = viewer.uid, slot = slot, "Entity left view");
            }
        }

        let mut added = 0;
        for entity in entities.snapshot() {
            if added == MAX_ADDS_PER_TICK || local.is_full() {
                break;
            }
            let key = entity.key();
            if key.uid == viewer.uid || local.contains(&key) {
                continue;
            }
            let mut mobile = entity.mobile().write();
            if !mobile.visible || !mobile.location.is_viewable_from(&viewer.location) {
                continue;
            }

            local.insert(&key);
            let (dx, dy) = viewer.location.delta(&mobile.location);
            out.write_bits(14, key.slot as u32)?;
            out.write_bits(5, (dy & 31) as u32)?;
            out.write_bits(5, (dx & 31) as u32)?;
            out.write_bit(true)?;
            out.write_bits(12, entity.type_id(&mobile) as u32)?;
            out.write_bit(true)?;
            write_attributes(&mut block, &mut mobile, key, deaths)?;
            added += 1;
        }

        if !block.is_empty() {
            out.write_bits(14, END_OF_ADDS)?;
            out.finish_bit_access()?;
            out.write_bytes(block.as_bytes())?;
        } else {
            out.finish_bit_access()?;
        }
        out.finish_var_header()?;
        Ok(out)
    }
}

fn write_movement(out: &mut PacketBuffer, mobile: &Mobile, update_required: bool) -> Result<()> {
    match (mobile.primary_direction, mobile.secondary_direction) {
        (None, _) => {
            if update_required {
                out.write_bit(true)?;
                out.write_bits(2, 0)?;
            } else {
                out.write_bit(false)?;
            }
        }
        (Some(primary), None) => {
            out.write_bit(true)?;
            out.write_bits(2, 1)?;
            out.write_bits(3, primary.as_u8() as u32)?;
            out.write_bit(update_required)?;
        }
        (Some(primary), Some(secondary)) => {
            out.write_bit(true)?;
            out.write_bits(2, 2)?;
            out.write_bits(3, primary.as_u8() as u32)?;
            out.write_bits(3, secondary.as_u8() as u32)?;
            out.write_bit(update_required)?;
        }
    }
    Ok(())
}

/// Write the mask and every pending block in wire order
fn write_attributes(
    block: &mut PacketBuffer,
    mobile: &mut Mobile,
    key: EntityKey,
    deaths: &mut Vec<EntityKey>,
) -> Result<()> {
    let flags = mobile.blocks.flags;
    let mut mask = flags.protocol_mask();
    if mask >= 0x100 {
        mask |= 0x40;
        block.write_short_le(mask)?;
    } else {
        block.write_byte(mask as u8)?;
    }

    if flags.get(UpdateFlags::ANIMATION) {
        let animation = mobile.blocks.animation.unwrap_or(Animation::RESET);
        block.write_short_le(animation.id)?;
        block.write_byte(animation.delay)?;
    }
    if flags.get(UpdateFlags::HIT_2) {
        let hit = mobile.blocks.secondary_hit.unwrap_or(Hit::new(0, HitType::Blocked));
        block.write_byte_a(hit.damage)?;
        block.write_byte_c(hit.hit_type as u8)?;
        record_death(mobile, key, deaths);
        block.write_byte_a(health_byte(mobile.hp))?;
        block.write_byte(health_byte(mobile.max_hp))?;
    }
    if flags.get(UpdateFlags::GRAPHICS) {
        if let Some(graphic) = mobile.blocks.graphic {
            block.write_short(graphic.id)?;
            block.write_int(graphic.packed_delay())?;
        } else {
            block.write_short(u16::MAX)?;
            block.write_int(0)?;
        }
    }
    if flags.get(UpdateFlags::FACE_ENTITY) {
        block.write_short(mobile.blocks.face_entity.unwrap_or(u16::MAX))?;
    }
    if flags.get(UpdateFlags::FORCED_CHAT) {
        block.write_string(mobile.blocks.forced_chat.as_deref().unwrap_or(""))?;
    }
    if flags.get(UpdateFlags::HIT) {
        let hit = mobile.blocks.primary_hit.unwrap_or(Hit::new(0, HitType::Blocked));
        block.write_byte_c(hit.damage)?;
        block.write_byte_s(hit.hit_type as u8)?;
        record_death(mobile, key, deaths);
        block.write_byte_s(health_byte(mobile.hp))?;
        block.write_byte_c(health_byte(mobile.max_hp))?;
    }
    if flags.get(UpdateFlags::FACE_COORDINATE) {
        let coordinate = mobile
            .blocks
            .face_coordinate
            .map(|c| (c.x, c.y))
            .unwrap_or((0, 0));
        block.write_short_le(coordinate.0)?;
        block.write_short_le(coordinate.1)?;
    }
    if flags.get(UpdateFlags::TRANSFORM) {
        let id = mobile.blocks.transform.unwrap_or(u16::MAX);
        block.write_short_as(id, ValueType::A, ByteOrder::Little)?;
    }
    Ok(())
}

fn record_death(mobile: &mut Mobile, key: EntityKey, deaths: &mut Vec<EntityKey>) {
    if mobile.check_death() {
        trace!(slot = key.slot, uid = key.uid, "Entity died");
        deaths.push(key);
    }
}

fn health_byte(value: i32) -> u8 {
    value.clamp(0, u8::MAX as i32) as u8
}
