use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::autosave::{AutoSaveScheduler, DEFAULT_AUTOSAVE_DELAY_MS, DEFAULT_SAVED_DISPLAY_MS};

pub const CONFIG_PATH_ENV: &str = "GRADESD_CONFIG";
pub const AUTOSAVE_DELAY_ENV: &str = "GRADESD_AUTOSAVE_DELAY_MS";
pub const SAVED_DISPLAY_ENV: &str = "GRADESD_SAVED_DISPLAY_MS";
pub const WORKSPACE_ENV: &str = "GRADESD_WORKSPACE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub autosave_delay_ms: u64,
    pub saved_display_ms: u64,
    /// Workspace opened at start-up, if any.
    pub workspace: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            autosave_delay_ms: DEFAULT_AUTOSAVE_DELAY_MS,
            saved_display_ms: DEFAULT_SAVED_DISPLAY_MS,
            workspace: None,
        }
    }
}

impl Config {
    pub fn scheduler(&self) -> AutoSaveScheduler {
        AutoSaveScheduler::new(self.autosave_delay_ms, self.saved_display_ms)
    }

    /// File named by `GRADESD_CONFIG` (if any), then environment overrides.
    pub fn load() -> Self {
        let mut cfg = std::env::var(CONFIG_PATH_ENV)
            .ok()
            .and_then(|path| load_file(&path))
            .unwrap_or_default();
        cfg.apply_overrides(|name| std::env::var(name).ok());
        cfg
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_ms(AUTOSAVE_DELAY_ENV, lookup(AUTOSAVE_DELAY_ENV)) {
            self.autosave_delay_ms = v;
        }
        if let Some(v) = parse_ms(SAVED_DISPLAY_ENV, lookup(SAVED_DISPLAY_ENV)) {
            self.saved_display_ms = v;
        }
        if let Some(ws) = lookup(WORKSPACE_ENV).filter(|s| !s.trim().is_empty()) {
            self.workspace = Some(PathBuf::from(ws));
        }
    }
}

fn parse_ms(name: &str, raw: Option<String>) -> Option<u64> {
    let raw = raw?;
    match raw.trim().parse::<u64>() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(var = name, value = %raw, error = %e, "ignoring invalid duration");
            None
        }
    }
}

fn load_file(path: &str) -> Option<Config> {
    match std::fs::read_to_string(path) {
        Ok(s) => match toml::from_str::<Config>(&s) {
            Ok(cfg) => {
                info!(%path, "loaded config");
                Some(cfg)
            }
            Err(e) => {
                error!(%path, error = %e, "failed to parse config; using defaults");
                None
            }
        },
        Err(e) => {
            error!(%path, error = %e, "failed to read config; using defaults");
            None
        }
    }
}
