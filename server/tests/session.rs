//! Host and remote sessions over the loopback hub, from handshake to lock-step play.

use std::{
    fs,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use ego_client::{RemoteEvent, RemotePhase, RemoteSession};
use ego_core::{
    latch::{Latch, LatchButtons},
    net::{LoopbackEndpoint, LoopbackHub, PeerId},
    player::InputDevices,
    pool::Handle,
    world::World,
};
use ego_server::{HostEvent, HostSession, RemoteStatus};

const SLOTS: usize = 16;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    std::env::temp_dir().join(format!("{prefix}_{pid}_{nanos}"))
}

/// Host with one remote that has been offered `test.mod` and driven through start.
fn started_pair(
    hub: &LoopbackHub,
    remote_character: Handle,
) -> (HostSession<LoopbackEndpoint>, RemoteSession<LoopbackEndpoint>) {
    let mut host = HostSession::new(hub.host(), SLOTS);
    let mut remote = RemoteSession::new(hub.connect_remote(), SLOTS).with_start_talk(0);

    assert_eq!(host.poll().unwrap(), vec![HostEvent::Joined(PeerId(1))]);
    assert!(host.assign_character(PeerId(1), remote_character));
    host.offer_module(42, "test.mod").unwrap();

    let events = remote.poll().unwrap();
    assert!(events.contains(&RemoteEvent::ModuleOffered {
        seed: 42,
        module: "test.mod".to_string(),
        accepted: true
    }));
    remote.module_loaded().unwrap();

    assert!(host.wait_for_all_loaded(|| false).unwrap());
    assert!(remote.wait_for_start(|| false).unwrap());
    (host, remote)
}

#[test]
fn handshake_binds_characters_and_starts_both_sides() {
    let hub = LoopbackHub::new();
    let (host, remote) = started_pair(&hub, Handle::new(2));

    assert!(host.is_started());
    assert_eq!(host.remote_status(PeerId(1)), Some(RemoteStatus::Loaded));
    assert_eq!(remote.phase(), RemotePhase::Started);
    assert_eq!(remote.seed(), Some(42));
    let local: Vec<Handle> = remote
        .players()
        .local_players()
        .map(|player| player.character)
        .collect();
    assert_eq!(local, vec![Handle::new(2)]);
}

#[test]
fn host_latch_arrives_on_the_remote_for_frame_ten() {
    let hub = LoopbackHub::new();
    let (mut host, mut remote) = started_pair(&hub, Handle::new(2));
    let hero = Handle::new(7);
    assert!(host.add_local_player(hero, InputDevices::KEYBOARD));

    for frame in 1..=10u32 {
        if frame == 10 {
            host.capture_local(hero, Latch::new(LatchButtons::from_bits_retain(0x01), 0.5, -0.5));
        }
        assert_eq!(host.talk_to_remotes().unwrap(), frame);
        host.consume_frame();

        remote.poll().unwrap();
        let consumed = remote.consume_frame();
        assert_eq!(remote.buffer().current_frame(), frame);
        if frame < 10 {
            assert!(consumed.is_empty());
        } else {
            assert_eq!(
                consumed,
                vec![(hero, Latch::new(LatchButtons::LEFT, 0.5, -0.5))]
            );
        }
    }
    assert!(!remote.is_out_of_sync());
}

#[test]
fn lock_step_worlds_stay_identical() {
    let hub = LoopbackHub::new();
    let remote_hero = Handle::new(2);
    let host_hero = Handle::new(7);
    let (mut host, mut remote) = started_pair(&hub, remote_hero);
    host.add_local_player(host_hero, InputDevices::KEYBOARD);

    let mut host_world = World::new(SLOTS, 64);
    let mut remote_world = World::new(SLOTS, 64);
    for world in [&mut host_world, &mut remote_world] {
        assert!(world.ensure_character(remote_hero));
        assert!(world.ensure_character(host_hero));
    }

    for frame in 1..=120u32 {
        let phase = frame as f32 * 0.1;
        let jump = if frame % 30 == 0 {
            LatchButtons::JUMP
        } else {
            LatchButtons::empty()
        };
        let respawn = if frame == 77 {
            LatchButtons::RESPAWN
        } else {
            LatchButtons::empty()
        };

        assert!(remote.capture_local(remote_hero, Latch::new(jump | respawn, phase.sin(), 0.3)));
        assert!(remote.talk_to_host().unwrap());
        host.poll().unwrap();

        host.capture_local(host_hero, Latch::new(jump, -0.2, phase.cos()));
        host.talk_to_remotes().unwrap();
        let host_latches = host.consume_frame();
        let host_report = host_world.tick(&host_latches);
        for character in &host_report.respawned {
            host.reset_slot(*character);
        }

        remote.poll().unwrap();
        let remote_latches = remote.consume_frame();
        let remote_report = remote_world.tick(&remote_latches);
        for character in &remote_report.respawned {
            remote.reset_slot(*character);
        }

        assert_eq!(host_latches, remote_latches, "frame {}", frame);
        assert_eq!(host_report, remote_report, "frame {}", frame);
    }

    assert_eq!(host_world.snapshot(), remote_world.snapshot());
    assert_eq!(
        host_world.particles().used_count(),
        remote_world.particles().used_count()
    );
    assert!(!remote.is_out_of_sync());
}

/// Same loop order as the binaries: the remote polls the host's broadcast
/// before it stages and reports its own input for that frame.
#[test]
fn remote_simulates_the_host_broadcast_not_its_own_input() {
    let hub = LoopbackHub::new();
    let remote_hero = Handle::new(3);
    let host_hero = Handle::new(5);
    let (mut host, mut remote) = started_pair(&hub, remote_hero);
    host.add_local_player(host_hero, InputDevices::KEYBOARD);

    let mut host_world = World::new(SLOTS, 64);
    let mut remote_world = World::new(SLOTS, 64);
    for world in [&mut host_world, &mut remote_world] {
        assert!(world.ensure_character(remote_hero));
        assert!(world.ensure_character(host_hero));
    }

    for frame in 1..=90u32 {
        host.poll().unwrap();
        host.capture_local(host_hero, Latch::new(LatchButtons::empty(), 0.3, -0.1));
        host.talk_to_remotes().unwrap();
        let host_latches = host.consume_frame();
        let host_report = host_world.tick(&host_latches);
        for character in &host_report.respawned {
            host.reset_slot(*character);
        }

        remote.poll().unwrap();
        let buttons = if frame % 20 == 0 {
            LatchButtons::JUMP
        } else if frame == 45 {
            LatchButtons::RESPAWN
        } else {
            LatchButtons::empty()
        };
        // Not a multiple of 1/1024, so the local value never survives the wire as-is.
        let local = Latch::new(buttons, 0.123, frame as f32 * 0.001);
        assert!(remote.capture_local(remote_hero, local));
        assert!(remote.talk_to_host().unwrap());
        let remote_latches = remote.consume_frame();
        let remote_report = remote_world.tick(&remote_latches);
        for character in &remote_report.respawned {
            remote.reset_slot(*character);
        }

        assert_eq!(host_latches, remote_latches, "frame {}", frame);
        assert_eq!(host_report, remote_report, "frame {}", frame);
    }

    assert_eq!(host_world.snapshot(), remote_world.snapshot());
    assert!(!remote.is_out_of_sync());
}

#[test]
fn player_files_are_replicated_before_the_module() {
    let source = unique_temp_dir("ego_host_players");
    let target = unique_temp_dir("ego_remote_players");
    fs::create_dir_all(source.join("bob")).unwrap();
    fs::write(source.join("bob/naming.txt"), b"Bob").unwrap();
    fs::write(source.join("bob/skin.txt"), vec![7u8; 3000]).unwrap();

    let hub = LoopbackHub::new();
    let mut host = HostSession::new(hub.host(), SLOTS);
    let mut remote = RemoteSession::new(hub.connect_remote(), SLOTS).with_download_dir(&target);
    host.poll().unwrap();

    host.send_directory(&source, "players").unwrap();
    let mut delivered = false;
    let mut received = None;
    for _ in 0..100 {
        for event in host.poll().unwrap() {
            delivered |= event == HostEvent::FilesDelivered(PeerId(1));
        }
        for event in remote.poll().unwrap() {
            if let RemoteEvent::FilesReceived(count) = event {
                received = Some(count);
            }
        }
        if delivered {
            break;
        }
    }

    assert!(delivered);
    assert!(host.uploads_acknowledged());
    assert_eq!(received, Some(2));
    assert!(remote.downloads().is_some_and(|downloads| downloads.is_done()));
    assert_eq!(fs::read(target.join("players/bob/naming.txt")).unwrap(), b"Bob");
    assert_eq!(fs::read(target.join("players/bob/skin.txt")).unwrap(), vec![7u8; 3000]);

    let _ = fs::remove_dir_all(&source);
    let _ = fs::remove_dir_all(&target);
}

#[test]
fn chat_goes_through_the_host() {
    let hub = LoopbackHub::new();
    let mut host = HostSession::new(hub.host(), SLOTS);
    let mut alice = RemoteSession::new(hub.connect_remote(), SLOTS);
    let mut bob = RemoteSession::new(hub.connect_remote(), SLOTS);
    host.poll().unwrap();
    alice.poll().unwrap();
    bob.poll().unwrap();

    alice.send_text("ready?").unwrap();
    let events = host.poll().unwrap();
    assert_eq!(
        events,
        vec![HostEvent::Text {
            from: PeerId(1),
            text: "ready?".to_string()
        }]
    );
    assert_eq!(bob.poll().unwrap(), vec![RemoteEvent::Text("ready?".to_string())]);
    assert!(alice.poll().unwrap().is_empty());
}

#[test]
fn remote_without_the_module_is_left_out() {
    let hub = LoopbackHub::new();
    let mut host = HostSession::new(hub.host(), SLOTS);
    let mut remote =
        RemoteSession::new(hub.connect_remote(), SLOTS).with_module_check(|_| false);
    host.poll().unwrap();
    host.offer_module(1, "rare.mod").unwrap();

    remote.poll().unwrap();
    assert_eq!(remote.phase(), RemotePhase::Connecting);
    assert_eq!(
        host.poll().unwrap(),
        vec![HostEvent::ModuleAnswer {
            peer: PeerId(1),
            accepted: false
        }]
    );
    assert!(host.all_loaded());
}
