//! Lock-step simulation driven by consumed latches.
//!
//! Characters and particles live in two independent [`ObjectPool`]s. Every
//! tick reconciles both pools, walks the characters inside a loop scope and
//! then ages the particles inside another, so anything spawned or killed
//! during the pass only takes effect once the scopes close.

use crate::{
    constants::{DUST_LIFETIME, GRAVITY, JUMP_VELOCITY, MAX_CHR, MAX_PRT, WALK_SPEED},
    latch::{Latch, LatchButtons},
    pool::{Handle, ObjectPool, PoolObject},
};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Character {
    pub pos: [f32; 3],
    pub vel_z: f32,
    pub spawn: [f32; 3],
    /// Buttons held on the previous tick, for edge detection.
    pub last_buttons: LatchButtons,
}

impl Character {
    pub fn on_ground(&self) -> bool {
        self.pos[2] <= 0.0
    }
}

impl PoolObject for Character {}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Particle {
    pub pos: [f32; 3],
    pub lifetime: u16,
    pub owner: Option<Handle>,
}

impl PoolObject for Particle {}

/// What one tick changed, for the session to act on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub frame: u32,
    /// Characters that pressed respawn. Their latch history should be dropped.
    pub respawned: Vec<Handle>,
    pub particles_spawned: usize,
    pub particles_expired: usize,
}

/// Where the character in `handle` enters the world.
pub fn spawn_point(handle: Handle) -> [f32; 3] {
    [handle.index() as f32 * 8.0, 0.0, 0.0]
}

pub struct World {
    characters: ObjectPool<Character>,
    particles: ObjectPool<Particle>,
    frame: u32,
}

impl Default for World {
    fn default() -> Self {
        Self::new(MAX_CHR, MAX_PRT)
    }
}

impl World {
    pub fn new(max_characters: usize, max_particles: usize) -> Self {
        World {
            characters: ObjectPool::new("characters", max_characters),
            particles: ObjectPool::new("particles", max_particles),
            frame: 0,
        }
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn characters(&self) -> &ObjectPool<Character> {
        &self.characters
    }

    pub fn characters_mut(&mut self) -> &mut ObjectPool<Character> {
        &mut self.characters
    }

    pub fn particles(&self) -> &ObjectPool<Particle> {
        &self.particles
    }

    pub fn character(&self, handle: Handle) -> Option<&Character> {
        self.characters.get(handle)
    }

    /// Places a character at `pos`, in `preferred` if given.
    pub fn spawn_character(&mut self, preferred: Option<Handle>, pos: [f32; 3]) -> Option<Handle> {
        let handle = self.characters.spawn(preferred)?;
        if let Some(character) = self.characters.get_mut(handle) {
            character.pos = pos;
            character.spawn = pos;
        }
        log::debug!("spawned character {} at {:?}", handle, pos);
        Some(handle)
    }

    /// Spawns a character in `handle` at its spawn point unless one is there.
    ///
    /// Every participant calls this for the same handles, so the worlds agree
    /// on where each character started.
    pub fn ensure_character(&mut self, handle: Handle) -> bool {
        if !self.characters.is_valid(handle) {
            log::warn!("{} is outside the character pool", handle);
            return false;
        }
        if self.characters.is_allocated(handle) {
            return true;
        }
        self.spawn_character(Some(handle), spawn_point(handle))
            .is_some()
    }

    pub fn remove_character(&mut self, handle: Handle) -> bool {
        self.characters.release(handle)
    }

    /// Advances one frame using the latches consumed for it.
    pub fn tick(&mut self, latches: &[(Handle, Latch)]) -> TickReport {
        self.characters.reconcile();
        self.particles.reconcile();
        self.frame = self.frame.wrapping_add(1);

        let mut by_slot: Vec<Option<Latch>> = vec![None; self.characters.capacity()];
        for (handle, latch) in latches {
            match by_slot.get_mut(handle.index()) {
                Some(slot) => *slot = Some(*latch),
                None => log::warn!("latch for {} is outside the character pool", handle),
            }
        }

        let mut report = TickReport {
            frame: self.frame,
            ..TickReport::default()
        };

        let mut particles = self.particles.begin_loop();
        {
            let mut characters = self.characters.begin_loop();
            while let Some(handle) = characters.next_in_game() {
                let Some(character) = characters.get_mut(handle) else {
                    continue;
                };
                let latch = by_slot[handle.index()].unwrap_or_default();
                let pressed = latch.buttons & !character.last_buttons;
                character.last_buttons = latch.buttons;

                if pressed.contains(LatchButtons::RESPAWN) {
                    character.pos = character.spawn;
                    character.vel_z = 0.0;
                    report.respawned.push(handle);
                    continue;
                }

                character.pos[0] += latch.x * WALK_SPEED;
                character.pos[1] += latch.y * WALK_SPEED;

                let mut jumped = false;
                if pressed.contains(LatchButtons::JUMP) && character.on_ground() {
                    character.vel_z = JUMP_VELOCITY;
                    jumped = true;
                }
                if !character.on_ground() || character.vel_z > 0.0 {
                    character.pos[2] += character.vel_z;
                    character.vel_z -= GRAVITY;
                    if character.pos[2] <= 0.0 {
                        character.pos[2] = 0.0;
                        character.vel_z = 0.0;
                    }
                }

                if jumped {
                    let at = character.pos;
                    if let Some(dust) = particles.spawn(None) {
                        if let Some(particle) = particles.get_mut(dust) {
                            particle.pos = [at[0], at[1], 0.0];
                            particle.lifetime = DUST_LIFETIME;
                            particle.owner = Some(handle);
                        }
                        report.particles_spawned += 1;
                    }
                }
            }
        }

        while let Some(handle) = particles.next_in_game() {
            let Some(particle) = particles.get_mut(handle) else {
                continue;
            };
            particle.lifetime = particle.lifetime.saturating_sub(1);
            if particle.lifetime == 0 && particles.release(handle) {
                report.particles_expired += 1;
            }
        }
        drop(particles);

        if !report.respawned.is_empty() {
            log::debug!("frame {}: respawned {:?}", self.frame, report.respawned);
        }
        report
    }

    /// Positions of every character in game, in slot order.
    pub fn snapshot(&self) -> Vec<(Handle, [f32; 3])> {
        let mut out: Vec<(Handle, [f32; 3])> = self
            .characters
            .used_handles()
            .filter(|handle| self.characters.is_in_game(*handle))
            .filter_map(|handle| Some((handle, self.characters.get(handle)?.pos)))
            .collect();
        out.sort_by_key(|(handle, _)| *handle);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::{spawn_point, World};
    use crate::{
        constants::{DUST_LIFETIME, WALK_SPEED},
        latch::{Latch, LatchButtons},
        pool::Handle,
    };

    #[test]
    fn motion_latch_moves_only_its_character() {
        let mut world = World::new(8, 8);
        let a = world.spawn_character(None, [0.0; 3]).unwrap();
        let b = world.spawn_character(None, [10.0, 0.0, 0.0]).unwrap();

        world.tick(&[(a, Latch::new(LatchButtons::empty(), 0.5, -1.0))]);

        assert_eq!(world.character(a).unwrap().pos, [0.5 * WALK_SPEED, -WALK_SPEED, 0.0]);
        assert_eq!(world.character(b).unwrap().pos, [10.0, 0.0, 0.0]);
    }

    #[test]
    fn jump_spawns_dust_that_appears_after_the_pass() {
        let mut world = World::new(4, 4);
        let hero = world.spawn_character(None, [0.0; 3]).unwrap();

        let report = world.tick(&[(hero, Latch::new(LatchButtons::JUMP, 0.0, 0.0))]);
        assert_eq!(report.particles_spawned, 1);
        assert_eq!(report.particles_expired, 0);
        assert!(world.character(hero).unwrap().pos[2] > 0.0);
        assert_eq!(world.particles().used_count(), 1);
        assert_eq!(world.particles().loop_depth(), 0);
        world.particles().check_partition().unwrap();

        // Holding jump does not jump again.
        let report = world.tick(&[(hero, Latch::new(LatchButtons::JUMP, 0.0, 0.0))]);
        assert_eq!(report.particles_spawned, 0);
    }

    #[test]
    fn dust_expires_after_its_lifetime() {
        let mut world = World::new(4, 4);
        let hero = world.spawn_character(None, [0.0; 3]).unwrap();
        world.tick(&[(hero, Latch::new(LatchButtons::JUMP, 0.0, 0.0))]);

        let mut expired = 0;
        for _ in 0..DUST_LIFETIME {
            expired += world.tick(&[]).particles_expired;
        }
        assert_eq!(expired, 1);
        assert_eq!(world.particles().used_count(), 0);
        assert_eq!(world.particles().free_count(), 4);
        world.particles().check_partition().unwrap();
    }

    #[test]
    fn respawn_returns_character_home_and_is_reported() {
        let mut world = World::new(4, 4);
        let hero = world.spawn_character(None, [1.0, 2.0, 0.0]).unwrap();
        world.tick(&[(hero, Latch::new(LatchButtons::empty(), 1.0, 1.0))]);
        assert_ne!(world.character(hero).unwrap().pos, [1.0, 2.0, 0.0]);

        let report = world.tick(&[(hero, Latch::new(LatchButtons::RESPAWN, 1.0, 1.0))]);
        assert_eq!(report.respawned, vec![hero]);
        assert_eq!(world.character(hero).unwrap().pos, [1.0, 2.0, 0.0]);
    }

    #[test]
    fn latches_for_unknown_slots_are_ignored() {
        let mut world = World::new(2, 2);
        let hero = world.spawn_character(None, [0.0; 3]).unwrap();
        let report = world.tick(&[(Handle::new(40), Latch::new(LatchButtons::JUMP, 1.0, 0.0))]);
        assert_eq!(report.particles_spawned, 0);
        assert_eq!(world.snapshot(), vec![(hero, [0.0; 3])]);
    }

    #[test]
    fn ensure_character_keeps_an_existing_occupant() {
        let mut world = World::new(4, 4);
        let hero = Handle::new(2);
        assert!(world.ensure_character(hero));
        assert_eq!(world.character(hero).unwrap().pos, spawn_point(hero));

        world.tick(&[(hero, Latch::new(LatchButtons::empty(), 1.0, 0.0))]);
        assert!(world.ensure_character(hero));
        assert_ne!(world.character(hero).unwrap().pos, spawn_point(hero));
        assert!(!world.ensure_character(Handle::new(9)));
    }

    #[test]
    fn removed_character_stops_being_simulated() {
        let mut world = World::new(2, 2);
        let hero = world.spawn_character(None, [0.0; 3]).unwrap();
        assert!(world.remove_character(hero));
        world.tick(&[(hero, Latch::new(LatchButtons::empty(), 1.0, 0.0))]);
        assert!(world.snapshot().is_empty());
        world.characters().check_partition().unwrap();
    }
}
