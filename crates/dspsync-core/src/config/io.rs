//! Reading and writing `SyncConfig` as YAML
//!
//! Loading never fails: a missing file, unreadable file or bad YAML all fall
//! back to defaults with a log line, and timings that would make the sync
//! thread spin are replaced.

use std::path::Path;

use anyhow::{Context, Result};

use super::{SyncConfig, TimingConfig};

/// Load the engine configuration at `path`
pub fn load_config(path: &Path) -> SyncConfig {
    let mut config = match read_yaml(path) {
        Ok(Some(config)) => {
            log::info!("Config: Loaded {:?}", path);
            config
        }
        Ok(None) => {
            log::info!("Config: No file at {:?}, using defaults", path);
            SyncConfig::default()
        }
        Err(e) => {
            log::warn!("Config: {:#}, using defaults", e);
            SyncConfig::default()
        }
    };
    sanitize_timing(&mut config.timing);
    config
}

fn read_yaml(path: &Path) -> Result<Option<SyncConfig>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("cannot read {:?}", path)),
    };
    let config: SyncConfig = serde_yaml::from_str(&contents)
        .with_context(|| format!("invalid engine config in {:?}", path))?;
    Ok(Some(config))
}

/// Zero periods would turn the timed waits into busy loops
fn sanitize_timing(timing: &mut TimingConfig) {
    let defaults = TimingConfig::default();
    if timing.frame_period_us == 0 {
        log::warn!("Config: frame_period_us must be positive, using {}", defaults.frame_period_us);
        timing.frame_period_us = defaults.frame_period_us;
    }
    if timing.wake_poll_ms == 0 {
        log::warn!("Config: wake_poll_ms must be positive, using {}", defaults.wake_poll_ms);
        timing.wake_poll_ms = defaults.wake_poll_ms;
    }
}

/// Write `config` to `path`, creating missing directories
pub fn save_config(config: &SyncConfig, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("cannot create config directory {:?}", dir))?;
    }
    let yaml = serde_yaml::to_string(config).context("cannot encode engine config")?;
    std::fs::write(path, yaml).with_context(|| format!("cannot write {:?}", path))?;
    log::info!("Config: Saved {:?}", path);
    Ok(())
}
