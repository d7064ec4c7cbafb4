//! Player registry - which peer drives which character

use bitflags::bitflags;

use crate::{
    constants::MAX_PLAYER,
    net::transport::PeerId,
    pool::Handle,
};

bitflags! {
    /// Input devices bound to a local player
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct InputDevices: u8 {
        const KEYBOARD = 1 << 0;
        const MOUSE = 1 << 1;
        const JOYSTICK_A = 1 << 2;
        const JOYSTICK_B = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Player {
    pub character: Handle,
    pub owner: PeerId,
    /// Empty for players driven from another machine.
    pub devices: InputDevices,
}

/// Up to [`MAX_PLAYER`] players, seen from one endpoint.
#[derive(Debug, Clone)]
pub struct PlayerRegistry {
    local_peer: PeerId,
    players: Vec<Player>,
}

impl PlayerRegistry {
    pub fn new(local_peer: PeerId) -> Self {
        PlayerRegistry {
            local_peer,
            players: Vec::with_capacity(MAX_PLAYER),
        }
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Binds `character` to `owner`. `None` when full or already bound.
    pub fn add(&mut self, character: Handle, owner: PeerId, devices: InputDevices) -> Option<usize> {
        if self.players.len() >= MAX_PLAYER {
            log::warn!("no room for another player, {} is unbound", character);
            return None;
        }
        if self.find(character).is_some() {
            log::warn!("{} already has a player", character);
            return None;
        }
        self.players.push(Player {
            character,
            owner,
            devices,
        });
        Some(self.players.len() - 1)
    }

    pub fn add_local(&mut self, character: Handle, devices: InputDevices) -> Option<usize> {
        self.add(character, self.local_peer, devices)
    }

    /// Drops every player of a peer that left. Returns their characters.
    pub fn remove_peer(&mut self, peer: PeerId) -> Vec<Handle> {
        let mut removed = Vec::new();
        self.players.retain(|player| {
            if player.owner == peer {
                removed.push(player.character);
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn find(&self, character: Handle) -> Option<usize> {
        self.players
            .iter()
            .position(|player| player.character == character)
    }

    pub fn owner_of(&self, character: Handle) -> Option<PeerId> {
        self.find(character).map(|index| self.players[index].owner)
    }

    pub fn is_owned_by(&self, character: Handle, peer: PeerId) -> bool {
        self.owner_of(character) == Some(peer)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Player> {
        self.players.iter()
    }

    pub fn local_players(&self) -> impl Iterator<Item = &Player> {
        let local = self.local_peer;
        self.players.iter().filter(move |player| player.owner == local)
    }

    pub fn has_local_players(&self) -> bool {
        self.local_players().next().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::{InputDevices, PlayerRegistry};
    use crate::{
        constants::MAX_PLAYER,
        net::transport::{PeerId, HOST_PEER},
        pool::Handle,
    };

    #[test]
    fn registry_is_bounded() {
        let mut registry = PlayerRegistry::new(HOST_PEER);
        for n in 0..MAX_PLAYER {
            assert_eq!(
                registry.add(Handle::new(n), PeerId(1), InputDevices::empty()),
                Some(n)
            );
        }
        assert_eq!(registry.add_local(Handle::new(99), InputDevices::KEYBOARD), None);
        assert_eq!(registry.len(), MAX_PLAYER);
    }

    #[test]
    fn a_character_has_one_player() {
        let mut registry = PlayerRegistry::new(HOST_PEER);
        assert!(registry.add_local(Handle::new(3), InputDevices::KEYBOARD).is_some());
        assert!(registry.add(Handle::new(3), PeerId(2), InputDevices::empty()).is_none());
        assert!(registry.is_owned_by(Handle::new(3), HOST_PEER));
        assert!(!registry.is_owned_by(Handle::new(3), PeerId(2)));
    }

    #[test]
    fn remove_peer_drops_only_its_players() {
        let mut registry = PlayerRegistry::new(HOST_PEER);
        registry.add_local(Handle::new(0), InputDevices::MOUSE);
        registry.add(Handle::new(1), PeerId(1), InputDevices::empty());
        registry.add(Handle::new(2), PeerId(2), InputDevices::empty());
        registry.add(Handle::new(3), PeerId(1), InputDevices::empty());

        assert_eq!(
            registry.remove_peer(PeerId(1)),
            vec![Handle::new(1), Handle::new(3)]
        );
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.local_players().count(), 1);
        assert_eq!(registry.owner_of(Handle::new(2)), Some(PeerId(2)));
    }
}
