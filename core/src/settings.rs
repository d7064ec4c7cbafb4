//! Session settings: JSON file, `.env` and `EGOBOO_*` environment overrides

use std::{
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context;
use log::LevelFilter;
use serde::{Deserialize, Serialize};

use crate::constants::{NETWORK_PORT, STARTTALK};

pub const DEFAULT_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetSettings {
    /// Address the host binds to, or the remote connects to.
    pub host: String,
    pub port: u16,
    /// Players on this machine, each bound to its own character.
    pub local_players: u8,
    /// Remotes the host waits for before offering the module.
    pub remotes: u8,
    /// One of `off`, `error`, `warn`, `info`, `debug`, `trace`.
    pub log_level: String,
    pub log_file: Option<String>,
    /// Imported player directories replicated to remotes before the module starts.
    pub player_dir: PathBuf,
    /// Module the host offers in `TO_REMOTE_MODULE`.
    pub module: String,
    /// Frames a remote stays quiet after the module starts.
    pub start_talk: u32,
}

impl Default for NetSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: NETWORK_PORT,
            local_players: 1,
            remotes: 1,
            log_level: "info".to_string(),
            log_file: None,
            player_dir: PathBuf::from("players"),
            module: "adventure.mod".to_string(),
            start_talk: STARTTALK,
        }
    }
}

impl NetSettings {
    /// Reads `.env`, then the JSON file if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Self {
        if let Ok(dotenv) = dotenvy::dotenv() {
            log::debug!("loaded environment from {}", dotenv.display());
        }
        let mut settings = match path {
            Some(path) => Self::load_from(path),
            None => Self::default(),
        };
        settings.apply_overrides(|key| env::var(key).ok());
        settings
    }

    /// Missing files give the defaults; unreadable ones are logged and ignored.
    pub fn load_from(path: &Path) -> Self {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(_) => return Self::default(),
        };

        match serde_json::from_slice::<NetSettings>(&bytes) {
            Ok(s) => s,
            Err(e) => {
                log::error!("Failed to parse settings file {:?}: {e}", path);
                Self::default()
            }
        }
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating settings dir {:?}", parent))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, format!("{json}\n"))
            .with_context(|| format!("writing settings file {:?}", path))?;
        Ok(())
    }

    /// Applies `EGOBOO_*` overrides. Unparseable values are logged and skipped.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("EGOBOO_HOST") {
            self.host = host;
        }
        override_parsed(&lookup, "EGOBOO_PORT", &mut self.port);
        override_parsed(&lookup, "EGOBOO_LOCAL_PLAYERS", &mut self.local_players);
        override_parsed(&lookup, "EGOBOO_REMOTES", &mut self.remotes);
        if let Some(level) = lookup("EGOBOO_LOG") {
            self.log_level = level;
        }
        if let Some(dir) = lookup("EGOBOO_PLAYER_DIR") {
            self.player_dir = PathBuf::from(dir);
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn log_level_filter(&self) -> LevelFilter {
        LevelFilter::from_str(&self.log_level).unwrap_or_else(|_| {
            log::warn!("unknown log level {:?}, using info", self.log_level);
            LevelFilter::Info
        })
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => log::warn!("ignoring {}={:?}, not a valid value", key, raw),
    }
}
