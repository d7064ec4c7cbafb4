use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use ego_core::constants::{MAX_CHR, TICKS};
use ego_core::net::TcpTransport;
use ego_core::pool::Handle;
use ego_core::settings::NetSettings;
use ego_core::world::World;
use ego_server::{HostEvent, HostSession};

fn main() {
    let settings_path = env::args().nth(1).map(PathBuf::from);
    let settings = NetSettings::load(settings_path.as_deref());

    ego_core::initialize_logger(settings.log_level_filter(), settings.log_file.as_deref())
        .unwrap_or_else(|e| {
            eprintln!("Failed to initialize logger: {:#}. Exiting.", e);
            process::exit(1);
        });

    log::info!("Starting Egoboo host v{}", env!("CARGO_PKG_VERSION"));

    let quit_flag = Arc::new(AtomicBool::new(false));
    let quit_flag_clone = quit_flag.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if !quit_flag_clone.load(Ordering::SeqCst) {
            log::info!("Got signal to terminate. Shutdown initiated...");
        } else {
            log::info!("Alright, alright, I'm already terminating!");
        }
        quit_flag_clone.store(true, Ordering::SeqCst);
    }) {
        log::error!("Failed to install signal handler: {}. Exiting.", e);
        process::exit(1);
    }

    if let Err(e) = run(&settings, &quit_flag) {
        log::error!("Host failed: {:#}", e);
        process::exit(1);
    }

    log::info!("Host shutdown complete.");
}

fn run(settings: &NetSettings, quit_flag: &AtomicBool) -> anyhow::Result<()> {
    let transport = TcpTransport::listen((settings.host.as_str(), settings.port))
        .with_context(|| format!("listening on {}", settings.address()))?;
    let mut host = HostSession::new(transport, MAX_CHR);
    let mut world = World::default();

    log::info!("Waiting for {} remotes...", settings.remotes);
    while host.remotes().count() < settings.remotes as usize {
        if quit_flag.load(Ordering::SeqCst) {
            return Ok(());
        }
        for event in host.poll()? {
            apply_event(&mut host, &mut world, event);
        }
        thread::sleep(Duration::from_millis(10));
    }

    if settings.player_dir.is_dir() {
        host.send_directory(&settings.player_dir, "players")?;
        while !host.uploads_acknowledged() {
            if quit_flag.load(Ordering::SeqCst) {
                return Ok(());
            }
            for event in host.poll()? {
                apply_event(&mut host, &mut world, event);
            }
            thread::sleep(Duration::from_millis(1));
        }
    } else {
        log::info!("No player directory at {:?}, nothing to send", settings.player_dir);
    }

    let seed = rand::random::<u32>();
    host.offer_module(seed, &settings.module)?;
    if !host.wait_for_all_loaded(|| quit_flag.load(Ordering::SeqCst))? {
        return Ok(());
    }

    log::info!("Entering main game loop...");
    let tick = Duration::from_millis(1000 / TICKS as u64);
    while !quit_flag.load(Ordering::SeqCst) {
        let started = Instant::now();

        for event in host.poll()? {
            apply_event(&mut host, &mut world, event);
        }
        host.talk_to_remotes()?;
        let latches = host.consume_frame();
        let report = world.tick(&latches);
        for character in report.respawned {
            host.reset_slot(character);
        }

        if report.frame % (TICKS * 60) == 0 {
            log::info!(
                "frame {}: {} characters, {} particles",
                report.frame,
                world.characters().used_count(),
                world.particles().used_count()
            );
        }

        if let Some(rest) = tick.checked_sub(started.elapsed()) {
            thread::sleep(rest);
        } else {
            log::debug!("frame {} ran long: {:?}", report.frame, started.elapsed());
        }
    }

    Ok(())
}

/// Each remote drives the character in the slot matching its peer id.
fn apply_event(host: &mut HostSession<TcpTransport>, world: &mut World, event: HostEvent) {
    match event {
        HostEvent::Joined(peer) => {
            let character = Handle::new(peer.0 as usize);
            if world.ensure_character(character) && host.assign_character(peer, character) {
                log::info!("{} drives {}", peer, character);
            } else {
                log::warn!("no character for {}", peer);
            }
        }
        HostEvent::Left(peer, characters) => {
            for character in characters {
                world.remove_character(character);
            }
            log::info!("{} left", peer);
        }
        HostEvent::Text { from, text } => log::info!("{}: {}", from, text),
        HostEvent::ModuleAnswer { peer, accepted } => {
            log::info!("{} answered the module offer: {}", peer, accepted)
        }
        HostEvent::Loaded(peer) => log::info!("{} finished loading", peer),
        HostEvent::FilesDelivered(peer) => log::info!("{} has every player file", peer),
    }
}
