use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use ego_client::{RemoteEvent, RemotePhase, RemoteSession};
use ego_core::constants::{MAX_CHR, TICKS};
use ego_core::latch::{Latch, LatchButtons};
use ego_core::net::TcpTransport;
use ego_core::pool::Handle;
use ego_core::settings::NetSettings;
use ego_core::world::World;

fn main() {
    let settings_path = env::args().nth(1).map(PathBuf::from);
    let settings = NetSettings::load(settings_path.as_deref());

    ego_core::initialize_logger(settings.log_level_filter(), settings.log_file.as_deref())
        .unwrap_or_else(|e| {
            eprintln!("Failed to initialize logger: {:#}. Exiting.", e);
            process::exit(1);
        });

    log::info!("Starting Egoboo remote v{}", env!("CARGO_PKG_VERSION"));

    let quit_flag = Arc::new(AtomicBool::new(false));
    let quit_flag_clone = quit_flag.clone();
    if let Err(e) = ctrlc::set_handler(move || quit_flag_clone.store(true, Ordering::SeqCst)) {
        log::error!("Failed to install signal handler: {}. Exiting.", e);
        process::exit(1);
    }

    if let Err(e) = run(&settings, &quit_flag) {
        log::error!("Remote failed: {:#}", e);
        process::exit(1);
    }

    log::info!("Remote shutdown complete.");
}

fn run(settings: &NetSettings, quit_flag: &AtomicBool) -> anyhow::Result<()> {
    let transport = TcpTransport::connect(settings.address())
        .with_context(|| format!("connecting to {}", settings.address()))?;
    let mut remote = RemoteSession::new(transport, MAX_CHR)
        .with_start_talk(settings.start_talk)
        .with_download_dir(&settings.player_dir);

    // Module offer.
    while remote.phase() == RemotePhase::Connecting {
        if quit_flag.load(Ordering::SeqCst) {
            return Ok(());
        }
        for event in remote.poll()? {
            match event {
                RemoteEvent::ModuleOffered {
                    module,
                    accepted: false,
                    ..
                } => bail!("host offered {} which is not available", module),
                RemoteEvent::FilesReceived(count) => log::info!("received {} player files", count),
                RemoteEvent::Disconnected => bail!("host closed the connection"),
                _ => {}
            }
        }
        thread::sleep(Duration::from_millis(10));
    }

    remote.module_loaded()?;
    if !remote.wait_for_start(|| quit_flag.load(Ordering::SeqCst))? {
        return Ok(());
    }

    let local: Vec<Handle> = remote
        .players()
        .local_players()
        .map(|player| player.character)
        .collect();
    log::info!("driving {:?}", local);

    let mut world = World::default();
    let tick = Duration::from_millis(1000 / TICKS as u64);
    while !quit_flag.load(Ordering::SeqCst) {
        let started = Instant::now();

        for event in remote.poll()? {
            match event {
                RemoteEvent::Text(text) => log::info!("{}", text),
                RemoteEvent::Disconnected => return Ok(()),
                _ => {}
            }
        }

        // Lock-step: never simulate a frame the host has not sent yet.
        if remote.buffer().pending_count() == 0 {
            thread::sleep(Duration::from_millis(1));
            continue;
        }

        let next = remote.buffer().current_frame().wrapping_add(1);
        for character in &local {
            remote.capture_local(*character, wander(next, *character));
        }
        remote.talk_to_host()?;

        let latches = remote.consume_frame();
        for (character, _) in &latches {
            world.ensure_character(*character);
        }
        let report = world.tick(&latches);
        for character in report.respawned {
            remote.reset_slot(character);
        }

        if let Some(rest) = tick.checked_sub(started.elapsed()) {
            thread::sleep(rest);
        }
    }

    Ok(())
}

/// Scripted input: walk in slow circles and hop every few seconds.
fn wander(frame: u32, character: Handle) -> Latch {
    let angle = (frame as f32 + character.index() as f32 * 17.0) * 0.05;
    let buttons = if frame % (TICKS * 3) == 0 {
        LatchButtons::JUMP
    } else {
        LatchButtons::empty()
    };
    Latch::new(buttons, angle.cos(), angle.sin())
}
