//! Walking queue
//!
//! Waypoints received from the client are expanded into single-tile steps
//! which the world tick consumes one (walking) or two (running) at a time.

use std::collections::VecDeque;

use crate::game::entity::{Direction, Location};

/// Longest path a single walk request may queue
pub const MAX_QUEUED_STEPS: usize = 50;

#[derive(Debug, Clone, Default)]
pub struct WalkingQueue {
    steps: VecDeque<Location>,
    running: bool,
}

impl WalkingQueue {
    /// Replace the queue with the path from `from` through `waypoints`.
    /// Each waypoint is reached with straight or diagonal single-tile steps.
    pub fn set_path(&mut self, from: Location, waypoints: &[Location], running: bool) {
        self.steps.clear();
        self.running = running;

        let mut current = from;
        for waypoint in waypoints {
            if waypoint.z != from.z {
                break;
            }
            while current != *waypoint {
                if self.steps.len() >= MAX_QUEUED_STEPS {
                    return;
                }
                let (dx, dy) = current.delta(waypoint);
                current = Location::new(
                    (current.x as i32 + dx.signum()) as u16,
                    (current.y as i32 + dy.signum()) as u16,
                    current.z,
                );
                self.steps.push_back(current);
            }
        }
    }

    /// Pop the next step if it is adjacent to `current`. A stale queue (the
    /// entity was moved some other way) is discarded.
    pub fn next_step(&mut self, current: Location) -> Option<(Location, Direction)> {
        let next = self.steps.pop_front()?;
        let (dx, dy) = current.delta(&next);
        match Direction::from_delta(dx, dy) {
            Some(direction) if next.z == current.z => Some((next, direction)),
            _ => {
                self.clear();
                None
            }
        }
    }

    pub fn clear(&mut self) {
        self.steps.clear();
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_is_interpolated() {
        let start = Location::new(3200, 3200, 0);
        let mut queue = WalkingQueue::default();
        queue.set_path(start, &[Location::new(3203, 3201, 0)], false);
        assert_eq!(queue.len(), 3);

        let (first, direction) = queue.next_step(start).unwrap();
        assert_eq!(first, Location::new(3201, 3201, 0));
        assert_eq!(direction, Direction::NorthEast);

        let (second, direction) = queue.next_step(first).unwrap();
        assert_eq!(second, Location::new(3202, 3201, 0));
        assert_eq!(direction, Direction::East);
    }

    #[test]
    fn test_path_is_capped() {
        let start = Location::new(3000, 3000, 0);
        let mut queue = WalkingQueue::default();
        queue.set_path(start, &[Location::new(3200, 3000, 0)], true);
        assert_eq!(queue.len(), MAX_QUEUED_STEPS);
        assert!(queue.is_running());
    }

    #[test]
    fn test_stale_queue_discarded() {
        let mut queue = WalkingQueue::default();
        queue.set_path(Location::new(10, 10, 0), &[Location::new(12, 10, 0)], false);
        assert!(queue.next_step(Location::new(50, 50, 0)).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_waypoint_on_other_plane_ignored() {
        let mut queue = WalkingQueue::default();
        queue.set_path(Location::new(10, 10, 0), &[Location::new(12, 10, 1)], false);
        assert!(queue.is_empty());
    }
}
