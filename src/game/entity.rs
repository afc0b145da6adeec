//! Entity module
//!
//! World entities and the state they share:
//! - `Location`, `Direction` and the view-distance rule
//! - `Mobile`, the per-entity state mutated by movement, tasks and handlers
//! - `Player` and `Npc`, each owning a `Mobile` behind a lock
//! - `EntityList`, the fixed-capacity slot registry the world keeps them in

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GameError, Result};
use crate::game::movement::WalkingQueue;
use crate::game::persistence::PlayerState;
use crate::game::sync::entity_sync::InterestSet;
use crate::game::sync::update_flags::{UpdateBlocks, UpdateFlags};
use crate::net::session::SessionId;

/// Tiles in each direction an entity can see
pub const VIEW_DISTANCE: i32 = 15;

/// Player location in the game world
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    /// X coordinate
    pub x: u16,
    /// Y coordinate
    pub y: u16,
    /// Z (height) level (0-3)
    pub z: u8,
}

impl Location {
    pub const fn new(x: u16, y: u16, z: u8) -> Self {
        Self { x, y, z }
    }

    /// Offset from `self` to `other`
    pub fn delta(&self, other: &Location) -> (i32, i32) {
        (
            other.x as i32 - self.x as i32,
            other.y as i32 - self.y as i32,
        )
    }

    /// Whether `other` is within view distance on the same plane
    pub fn is_viewable_from(&self, other: &Location) -> bool {
        if self.z != other.z {
            return false;
        }
        let (dx, dy) = self.delta(other);
        dx.abs() <= VIEW_DISTANCE && dy.abs() <= VIEW_DISTANCE
    }

    /// Step by `(dx, dy)`, rejecting coordinates that leave the map
    pub fn translate(&self, dx: i32, dy: i32) -> Result<Location> {
        let x = self.x as i32 + dx;
        let y = self.y as i32 + dy;
        if !(0..=u16::MAX as i32).contains(&x) || !(0..=u16::MAX as i32).contains(&y) {
            return Err(GameError::InvalidLocation {
                x,
                y,
                z: self.z as i32,
            }
            .into());
        }
        Ok(Location::new(x as u16, y as u16, self.z))
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// One-tile step directions, numbered as the client expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    NorthWest = 0,
    North = 1,
    NorthEast = 2,
    West = 3,
    East = 4,
    SouthWest = 5,
    South = 6,
    SouthEast = 7,
}

impl Direction {
    /// Direction of a single step, or `None` for no movement or a non-adjacent delta
    pub fn from_delta(dx: i32, dy: i32) -> Option<Direction> {
        match (dx, dy) {
            (-1, 1) => Some(Direction::NorthWest),
            (0, 1) => Some(Direction::North),
            (1, 1) => Some(Direction::NorthEast),
            (-1, 0) => Some(Direction::West),
            (1, 0) => Some(Direction::East),
            (-1, -1) => Some(Direction::SouthWest),
            (0, -1) => Some(Direction::South),
            (1, -1) => Some(Direction::SouthEast),
            _ => None,
        }
    }

    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::NorthWest => (-1, 1),
            Direction::North => (0, 1),
            Direction::NorthEast => (1, 1),
            Direction::West => (-1, 0),
            Direction::East => (1, 0),
            Direction::SouthWest => (-1, -1),
            Direction::South => (0, -1),
            Direction::SouthEast => (1, -1),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Player rights/privilege levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerRights {
    #[default]
    Player,
    Donator,
    Veteran,
    Moderator,
    Administrator,
    Developer,
}

impl PlayerRights {
    /// Crown level sent in the login response
    pub fn protocol_value(self) -> u8 {
        match self {
            PlayerRights::Player | PlayerRights::Donator | PlayerRights::Veteran => 0,
            PlayerRights::Moderator => 1,
            PlayerRights::Administrator | PlayerRights::Developer => 2,
        }
    }

    pub fn is_staff(self) -> bool {
        self >= PlayerRights::Moderator
    }
}

/// Which registry an entity lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Player,
    Npc,
}

/// Stable reference to an entity: the slot locates it, the uid proves it is
/// still the same entity after the slot is reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub slot: u16,
    pub uid: u64,
}

/// State shared by every entity that moves and can be seen
#[derive(Debug, Clone)]
pub struct Mobile {
    pub location: Location,
    /// Where an NPC reappears after death
    pub spawn: Location,
    pub primary_direction: Option<Direction>,
    pub secondary_direction: Option<Direction>,
    pub walking: WalkingQueue,
    pub hp: i32,
    pub max_hp: i32,
    pub has_died: bool,
    pub visible: bool,
    /// Moved this tick by other means than walking
    pub teleported: bool,
    pub blocks: UpdateBlocks,
}

impl Mobile {
    pub fn new(location: Location, max_hp: i32) -> Self {
        Self {
            location,
            spawn: location,
            primary_direction: None,
            secondary_direction: None,
            walking: WalkingQueue::default(),
            hp: max_hp,
            max_hp,
            has_died: false,
            visible: true,
            teleported: false,
            blocks: UpdateBlocks::default(),
        }
    }

    /// Advance the walking queue by one tick (two steps when running)
    pub fn process_movement(&mut self) {
        self.primary_direction = None;
        self.secondary_direction = None;
        if self.has_died {
            self.walking.clear();
            return;
        }
        if let Some((next, direction)) = self.walking.next_step(self.location) {
            self.location = next;
            self.primary_direction = Some(direction);
            if self.walking.is_running() {
                if let Some((next, direction)) = self.walking.next_step(self.location) {
                    self.location = next;
                    self.secondary_direction = Some(direction);
                }
            }
        }
    }

    /// Deal damage through the next free hit slot
    pub fn damage(&mut self, hit: crate::game::sync::update_flags::Hit) -> bool {
        if !self.blocks.hit(hit) {
            return false;
        }
        self.hp = (self.hp - hit.damage as i32).max(0);
        true
    }

    /// Mark the entity dead the first time its health is found at zero.
    /// Returns true only on that first transition.
    pub fn check_death(&mut self) -> bool {
        if !self.has_died && self.hp <= 0 {
            self.hp = 0;
            self.has_died = true;
            return true;
        }
        false
    }

    /// Move without walking. Viewers drop the entity and learn it again
    /// at the new location.
    pub fn teleport(&mut self, location: Location) {
        self.location = location;
        self.walking.clear();
        self.teleported = true;
    }

    /// End-of-tick reset of everything flushed to viewers
    pub fn reset_flags(&mut self) {
        self.blocks.reset();
        self.teleported = false;
    }
}

/// Update a connection task asks for. Only the tick turns these into
/// update flags, so every viewer sees the same set within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    /// Send the full appearance block (world entry)
    Appearance,
    /// Face another entity by its client index
    FaceEntity(u16),
}

/// Global unique entity id source
#[derive(Debug, Default)]
pub struct UidAllocator {
    next: std::sync::atomic::AtomicU64,
}

impl UidAllocator {
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1
    }
}

/// A logged-in player
pub struct Player {
    pub slot: u16,
    pub uid: u64,
    pub session_id: SessionId,
    pub username: String,
    password: String,
    rights: RwLock<PlayerRights>,
    banned: bool,
    mobile: RwLock<Mobile>,
    /// Queued by the connection task, applied at the start of the next tick
    pending: Mutex<Vec<PendingAction>>,
    /// Players this client currently tracks
    pub local_players: Mutex<InterestSet>,
    /// NPCs this client currently tracks
    pub local_npcs: Mutex<InterestSet>,
}

impl Player {
    /// Build a player from its persisted state
    pub fn from_state(slot: u16, uid: u64, session_id: SessionId, state: &PlayerState) -> Self {
        let mut mobile = Mobile::new(state.position, state.max_hp);
        mobile.hp = state.hp.clamp(1, state.max_hp.max(1));
        Self {
            slot,
            uid,
            session_id,
            username: state.username.clone(),
            password: state.password.clone(),
            rights: RwLock::new(state.staff_rights),
            banned: state.banned,
            mobile: RwLock::new(mobile),
            pending: Mutex::new(Vec::new()),
            local_players: Mutex::new(InterestSet::new()),
            local_npcs: Mutex::new(InterestSet::new()),
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey {
            kind: EntityKind::Player,
            slot: self.slot,
            uid: self.uid,
        }
    }

    pub fn rights(&self) -> PlayerRights {
        *self.rights.read()
    }

    pub fn set_rights(&self, rights: PlayerRights) {
        *self.rights.write() = rights;
    }

    pub fn mobile(&self) -> &RwLock<Mobile> {
        &self.mobile
    }

    pub fn location(&self) -> Location {
        self.mobile.read().location
    }

    pub fn queue_action(&self, action: PendingAction) {
        self.pending.lock().push(action);
    }

    pub fn pending_actions(&self) -> Vec<PendingAction> {
        self.pending.lock().clone()
    }

    /// Turn queued actions into update flags. Called by the tick only.
    pub fn apply_pending(&self) {
        let actions = std::mem::take(&mut *self.pending.lock());
        if actions.is_empty() {
            return;
        }
        let mut mobile = self.mobile.write();
        for action in actions {
            match action {
                PendingAction::Appearance => mobile.blocks.flags.flag(UpdateFlags::APPEARANCE),
                PendingAction::FaceEntity(index) => mobile.blocks.face_entity(index),
            }
        }
    }

    /// Current state in the form the store persists
    pub fn snapshot(&self) -> PlayerState {
        let mobile = self.mobile.read();
        PlayerState {
            username: self.username.clone(),
            password: self.password.clone(),
            position: mobile.location,
            staff_rights: self.rights(),
            hp: mobile.hp,
            max_hp: mobile.max_hp,
            banned: self.banned,
            last_login: Some(chrono::Utc::now()),
        }
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("slot", &self.slot)
            .field("username", &self.username)
            .field("session_id", &self.session_id)
            .field("location", &self.location())
            .field("rights", &self.rights())
            .finish()
    }
}

/// A non-player character
pub struct Npc {
    pub slot: u16,
    pub uid: u64,
    /// Definition id the client renders
    pub npc_id: u16,
    mobile: RwLock<Mobile>,
}

impl Npc {
    pub fn new(slot: u16, uid: u64, npc_id: u16, location: Location, max_hp: i32) -> Self {
        Self {
            slot,
            uid,
            npc_id,
            mobile: RwLock::new(Mobile::new(location, max_hp)),
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey {
            kind: EntityKind::Npc,
            slot: self.slot,
            uid: self.uid,
        }
    }

    pub fn mobile(&self) -> &RwLock<Mobile> {
        &self.mobile
    }

    pub fn location(&self) -> Location {
        self.mobile.read().location
    }
}

impl std::fmt::Debug for Npc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Npc")
            .field("slot", &self.slot)
            .field("npc_id", &self.npc_id)
            .field("location", &self.location())
            .finish()
    }
}

/// Fixed-capacity slot registry. Slot 0 is never handed out.
pub struct EntityList<T> {
    name: &'static str,
    slots: RwLock<Vec<Option<Arc<T>>>>,
    capacity: usize,
}

impl<T> EntityList<T> {
    /// A list holding up to `capacity` entities in slots `1..=capacity`
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            slots: RwLock::new(vec![None; capacity + 1]),
            capacity,
        }
    }

    /// Place the entity built by `create` in the lowest free slot
    pub fn add<F>(&self, create: F) -> Result<Arc<T>>
    where
        F: FnOnce(u16) -> T,
    {
        let mut slots = self.slots.write();
        let slot = slots
            .iter()
            .skip(1)
            .position(Option::is_none)
            .map(|index| index + 1)
            .ok_or(GameError::NoFreeSlot(self.name))?;
        let entity = Arc::new(create(slot as u16));
        slots[slot] = Some(entity.clone());
        debug!(list = self.name, slot = slot, "Entity added");
        Ok(entity)
    }

    pub fn remove(&self, slot: u16) -> Option<Arc<T>> {
        let removed = self
            .slots
            .write()
            .get_mut(slot as usize)
            .and_then(Option::take);
        if removed.is_some() {
            debug!(list = self.name, slot = slot, "Entity removed");
        }
        removed
    }

    pub fn get(&self, slot: u16) -> Option<Arc<T>> {
        self.slots.read().get(slot as usize).cloned().flatten()
    }

    pub fn len(&self) -> usize {
        self.slots.read().iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Entities in slot order
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.slots.read().iter().flatten().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::sync::update_flags::{Hit, HitType};

    #[test]
    fn test_viewable_distance() {
        let origin = Location::new(3200, 3200, 0);
        assert!(origin.is_viewable_from(&Location::new(3215, 3185, 0)));
        assert!(!origin.is_viewable_from(&Location::new(3216, 3200, 0)));
        assert!(!origin.is_viewable_from(&Location::new(3200, 3200, 1)));
    }

    #[test]
    fn test_delta_is_other_minus_self() {
        let viewer = Location::new(100, 100, 0);
        assert_eq!(viewer.delta(&Location::new(97, 104, 0)), (-3, 4));
    }

    #[test]
    fn test_translate_bounds() {
        let origin = Location::new(0, 5, 0);
        assert!(origin.translate(-1, 0).is_err());
        assert_eq!(origin.translate(2, -5).unwrap(), Location::new(2, 0, 0));
    }

    #[test]
    fn test_direction_round_trip() {
        for value in 0..8u8 {
            let direction = match value {
                0 => Direction::NorthWest,
                1 => Direction::North,
                2 => Direction::NorthEast,
                3 => Direction::West,
                4 => Direction::East,
                5 => Direction::SouthWest,
                6 => Direction::South,
                _ => Direction::SouthEast,
            };
            assert_eq!(direction.as_u8(), value);
            let (dx, dy) = direction.delta();
            assert_eq!(Direction::from_delta(dx, dy), Some(direction));
        }
        assert_eq!(Direction::from_delta(0, 0), None);
        assert_eq!(Direction::from_delta(2, 0), None);
    }

    #[test]
    fn test_rights_protocol_values() {
        let values: Vec<u8> = [
            PlayerRights::Player,
            PlayerRights::Donator,
            PlayerRights::Veteran,
            PlayerRights::Moderator,
            PlayerRights::Administrator,
            PlayerRights::Developer,
        ]
        .iter()
        .map(|r| r.protocol_value())
        .collect();
        assert_eq!(values, vec![0, 0, 0, 1, 2, 2]);
        assert!(PlayerRights::Moderator.is_staff());
        assert!(!PlayerRights::Veteran.is_staff());
    }

    #[test]
    fn test_death_transition_once() {
        let mut mobile = Mobile::new(Location::new(3200, 3200, 0), 10);
        assert!(mobile.damage(Hit::new(15, HitType::Normal)));
        assert_eq!(mobile.hp, 0);
        assert!(mobile.check_death());
        assert!(!mobile.check_death());
        assert!(mobile.has_died);
    }

    #[test]
    fn test_entity_list_slots() {
        let list: EntityList<u16> = EntityList::new("test", 2);
        let first = list.add(|slot| slot).unwrap();
        let second = list.add(|slot| slot).unwrap();
        assert_eq!((*first, *second), (1, 2));
        assert!(list.is_full());
        assert!(list.add(|slot| slot).is_err());

        list.remove(1);
        assert_eq!(*list.add(|slot| slot).unwrap(), 1);
        assert_eq!(list.snapshot().len(), 2);
        assert!(list.get(0).is_none());
        assert!(list.get(99).is_none());
    }

    #[test]
    fn test_player_from_state() {
        let mut state = PlayerState::new("zezima", "hunter2");
        state.staff_rights = PlayerRights::Moderator;
        let player = Player::from_state(3, 7, 11, &state);
        assert_eq!(player.slot, 3);
        assert_eq!(player.rights().protocol_value(), 1);
        assert_eq!(player.location(), state.position);

        let snapshot = player.snapshot();
        assert_eq!(snapshot.username, "zezima");
        assert_eq!(snapshot.password, "hunter2");
        assert!(snapshot.last_login.is_some());
    }

    #[test]
    fn test_pending_actions_wait_for_apply() {
        let player = Player::from_state(1, 1, 1, &PlayerState::new("zezima", "pw"));
        player.queue_action(PendingAction::Appearance);
        player.queue_action(PendingAction::FaceEntity(32770));
        assert!(!player.mobile().read().blocks.flags.is_update_required());

        player.apply_pending();
        let blocks = player.mobile().read().blocks.clone();
        assert!(blocks.flags.get(UpdateFlags::APPEARANCE));
        assert!(blocks.flags.get(UpdateFlags::FACE_ENTITY));
        assert_eq!(blocks.face_entity, Some(32770));
        assert!(player.pending_actions().is_empty());
    }
}
