//! Update flags for entity synchronization
//!
//! Tracks which attribute blocks of an entity changed this tick and must be
//! sent to every viewer, along with the data each block carries.

use bitflags::bitflags;

use crate::game::entity::Location;

bitflags! {
    /// Per-tick change categories, one bit per category in declaration order
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UpdateFlags: u16 {
        /// Appearance has changed (an add record always carries the update bit)
        const APPEARANCE = 1 << 0;
        /// Public chat message
        const CHAT = 1 << 1;
        /// Graphics/spotanim effect
        const GRAPHICS = 1 << 2;
        /// Animation is playing
        const ANIMATION = 1 << 3;
        /// Forced overhead text
        const FORCED_CHAT = 1 << 4;
        /// Face another entity
        const FACE_ENTITY = 1 << 5;
        /// Face a tile
        const FACE_COORDINATE = 1 << 6;
        /// Primary hit splat
        const HIT = 1 << 7;
        /// Secondary hit splat
        const HIT_2 = 1 << 8;
        /// Model swapped for another definition
        const TRANSFORM = 1 << 9;
    }
}

/// Attribute block emission order with each category's wire bit.
/// Categories without a block (appearance, chat) only raise the update bit.
pub const BLOCK_ORDER: [(UpdateFlags, u16); 8] = [
    (UpdateFlags::ANIMATION, 0x10),
    (UpdateFlags::HIT_2, 0x8),
    (UpdateFlags::GRAPHICS, 0x80),
    (UpdateFlags::FACE_ENTITY, 0x20),
    (UpdateFlags::FORCED_CHAT, 0x1),
    (UpdateFlags::HIT, 0x40),
    (UpdateFlags::FACE_COORDINATE, 0x4),
    (UpdateFlags::TRANSFORM, 0x2),
];

impl UpdateFlags {
    pub fn flag(&mut self, flag: UpdateFlags) {
        self.insert(flag);
    }

    pub fn get(&self, flag: UpdateFlags) -> bool {
        self.contains(flag)
    }

    /// Whether any block must be sent this tick
    pub fn is_update_required(&self) -> bool {
        !self.is_empty()
    }

    pub fn reset(&mut self) {
        *self = Self::empty();
    }

    /// Mask written at the head of the attribute block
    pub fn protocol_mask(&self) -> u16 {
        BLOCK_ORDER
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .fold(0, |mask, (_, bit)| mask | bit)
    }
}

/// Animation data for the update block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Animation {
    pub id: u16,
    pub delay: u8,
}

impl Animation {
    /// Stops whatever animation is playing
    pub const RESET: Animation = Animation { id: 65535, delay: 0 };

    pub fn new(id: u16, delay: u8) -> Self {
        Self { id, delay }
    }
}

/// Graphics/SpotAnim data for the update block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Graphic {
    pub id: u16,
    /// Height (0 = ground level, 100 = normal standing)
    pub height: u16,
    pub delay: u16,
}

impl Graphic {
    pub fn new(id: u16, height: u16, delay: u16) -> Self {
        Self { id, height, delay }
    }

    /// Height and delay packed the way the client reads them
    pub fn packed_delay(&self) -> u32 {
        ((self.height as u32) << 16) | self.delay as u32
    }
}

/// Hit splat kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HitType {
    Blocked = 0,
    Normal = 1,
    Poison = 2,
    Disease = 3,
}

/// Hit splat data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    pub damage: u8,
    pub hit_type: HitType,
}

impl Hit {
    pub fn new(damage: u8, hit_type: HitType) -> Self {
        let hit_type = if damage == 0 && hit_type == HitType::Normal {
            HitType::Blocked
        } else {
            hit_type
        };
        Self { damage, hit_type }
    }
}

/// Tile to face, in the doubled coordinates the client expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceCoordinate {
    pub x: u16,
    pub y: u16,
}

impl FaceCoordinate {
    pub fn from_tile(location: Location) -> Self {
        Self {
            x: location.x.wrapping_mul(2).wrapping_add(1),
            y: location.y.wrapping_mul(2).wrapping_add(1),
        }
    }
}

/// Block data for one entity this tick
#[derive(Debug, Clone, Default)]
pub struct UpdateBlocks {
    pub flags: UpdateFlags,
    pub animation: Option<Animation>,
    pub graphic: Option<Graphic>,
    pub face_entity: Option<u16>,
    pub forced_chat: Option<String>,
    pub primary_hit: Option<Hit>,
    pub secondary_hit: Option<Hit>,
    pub face_coordinate: Option<FaceCoordinate>,
    pub transform: Option<u16>,
}

impl UpdateBlocks {
    pub fn animate(&mut self, animation: Animation) {
        self.animation = Some(animation);
        self.flags.flag(UpdateFlags::ANIMATION);
    }

    pub fn graphic(&mut self, graphic: Graphic) {
        self.graphic = Some(graphic);
        self.flags.flag(UpdateFlags::GRAPHICS);
    }

    pub fn face_entity(&mut self, index: u16) {
        self.face_entity = Some(index);
        self.flags.flag(UpdateFlags::FACE_ENTITY);
    }

    pub fn force_chat(&mut self, text: impl Into<String>) {
        self.forced_chat = Some(text.into());
        self.flags.flag(UpdateFlags::FORCED_CHAT);
    }

    pub fn face_coordinate(&mut self, location: Location) {
        self.face_coordinate = Some(FaceCoordinate::from_tile(location));
        self.flags.flag(UpdateFlags::FACE_COORDINATE);
    }

    pub fn transform(&mut self, id: u16) {
        self.transform = Some(id);
        self.flags.flag(UpdateFlags::TRANSFORM);
    }

    /// Queue a hit splat in the first free slot. Returns false when both
    /// slots are already used this tick.
    pub fn hit(&mut self, hit: Hit) -> bool {
        if !self.flags.get(UpdateFlags::HIT) {
            self.primary_hit = Some(hit);
            self.flags.flag(UpdateFlags::HIT);
            true
        } else if !self.flags.get(UpdateFlags::HIT_2) {
            self.secondary_hit = Some(hit);
            self.flags.flag(UpdateFlags::HIT_2);
            true
        } else {
            false
        }
    }

    /// Clear all block data for the next tick
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
