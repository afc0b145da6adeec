//! Tick-based task scheduling
//!
//! Tasks run once per world tick until they report `Finished`. Every task has
//! an owner uid so all work belonging to an entity can be cancelled when it
//! leaves the world.

use std::collections::HashSet;

use parking_lot::Mutex;
use tracing::debug;

use crate::game::entity::{EntityKey, EntityKind, Location, Mobile};
use crate::game::sync::update_flags::{Animation, UpdateFlags};
use crate::game::world::World;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Finished,
}

pub trait Task: Send {
    /// Called once per tick
    fn tick(&mut self, world: &World) -> TaskState;
}

struct Scheduled {
    owner: u64,
    task: Box<dyn Task>,
}

/// Runs submitted tasks once per tick
#[derive(Default)]
pub struct TaskScheduler {
    tasks: Mutex<Vec<Scheduled>>,
    /// Owners cancelled while a tick is processing
    cancelled: Mutex<HashSet<u64>>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&self, owner: u64, task: Box<dyn Task>) {
        self.tasks.lock().push(Scheduled { owner, task });
    }

    /// Drop every task owned by `owner`, including one currently running
    pub fn cancel_tasks(&self, owner: u64) {
        self.tasks.lock().retain(|scheduled| scheduled.owner != owner);
        self.cancelled.lock().insert(owner);
    }

    /// Run every task once. Tasks submitted while processing first run next tick.
    pub fn process(&self, world: &World) {
        let running = std::mem::take(&mut *self.tasks.lock());
        self.cancelled.lock().clear();

        let mut kept = Vec::with_capacity(running.len());
        for mut scheduled in running {
            if self.cancelled.lock().contains(&scheduled.owner) {
                continue;
            }
            if scheduled.task.tick(world) == TaskState::Running {
                kept.push(scheduled);
            }
        }

        let cancelled = std::mem::take(&mut *self.cancelled.lock());
        kept.retain(|scheduled| !cancelled.contains(&scheduled.owner));

        let mut tasks = self.tasks.lock();
        kept.append(&mut tasks);
        *tasks = kept;
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

/// Death animation
pub const DEATH_ANIMATION: u16 = 0x900;

/// Ticks between the death animation and the body being handled
pub const DEATH_DELAY_TICKS: u32 = 4;

/// Ticks an NPC stays hidden before reappearing at its spawn
pub const NPC_RESPAWN_TICKS: u32 = 10;

/// Where players reappear after dying
pub const RESPAWN_LOCATION: Location = Location::new(3093, 3244, 0);

/// Death sequence of a player or NPC
pub struct DeathTask {
    target: EntityKey,
    elapsed: u32,
}

impl DeathTask {
    pub fn new(target: EntityKey) -> Self {
        Self { target, elapsed: 0 }
    }

    fn with_mobile<R>(&self, world: &World, f: impl FnOnce(&mut Mobile) -> R) -> Option<R> {
        let key = self.target;
        match key.kind {
            EntityKind::Player => world
                .players
                .get(key.slot)
                .filter(|p| p.uid == key.uid)
                .map(|p| f(&mut p.mobile().write())),
            EntityKind::Npc => world
                .npcs
                .get(key.slot)
                .filter(|n| n.uid == key.uid)
                .map(|n| f(&mut n.mobile().write())),
        }
    }
}

impl Task for DeathTask {
    fn tick(&mut self, world: &World) -> TaskState {
        let elapsed = self.elapsed;
        let kind = self.target.kind;
        self.elapsed += 1;

        let state = self.with_mobile(world, |mobile| {
            if elapsed == 0 {
                mobile.walking.clear();
                mobile.blocks.animate(Animation::new(DEATH_ANIMATION, 0));
                return TaskState::Running;
            }
            match kind {
                EntityKind::Player if elapsed == DEATH_DELAY_TICKS => {
                    mobile.teleport(RESPAWN_LOCATION);
                    mobile.hp = mobile.max_hp;
                    mobile.has_died = false;
                    mobile.blocks.animate(Animation::RESET);
                    mobile.blocks.flags.flag(UpdateFlags::APPEARANCE);
                    TaskState::Finished
                }
                EntityKind::Npc if elapsed == DEATH_DELAY_TICKS => {
                    mobile.visible = false;
                    mobile.hp = mobile.max_hp;
                    TaskState::Running
                }
                EntityKind::Npc if elapsed == DEATH_DELAY_TICKS + NPC_RESPAWN_TICKS => {
                    let spawn = mobile.spawn;
                    mobile.teleport(spawn);
                    mobile.visible = true;
                    mobile.has_died = false;
                    TaskState::Finished
                }
                _ => TaskState::Running,
            }
        });

        match state {
            Some(state) => {
                if state == TaskState::Finished {
                    debug!(slot = self.target.slot, kind = ?kind, "Death sequence complete");
                }
                state
            }
            // The entity left the world
            None => TaskState::Finished,
        }
    }
}
