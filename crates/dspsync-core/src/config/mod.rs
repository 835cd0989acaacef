//! Engine configuration
//!
//! Everything here has a sensible default, so a missing or partial YAML file
//! still yields a working engine:
//!
//! ```yaml
//! firmware_paths:
//!   - dspfirm.cdc
//! bank_masks:
//!   program: 255
//!   data: 255
//! timing:
//!   frame_period_us: 4889
//!   entering_sleep_frames: 2
//! ```

mod io;
mod paths;

pub use io::{load_config, save_config};
pub use paths::default_config_path;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::driver::BankMasks;

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Firmware images tried in order before the host-supplied one
    pub firmware_paths: Vec<PathBuf>,
    /// Memory banks the firmware is loaded into
    pub bank_masks: BankMasks,
    pub timing: TimingConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            firmware_paths: vec![PathBuf::from("dspfirm.cdc")],
            bank_masks: BankMasks::default(),
            timing: TimingConfig::default(),
        }
    }
}

/// Waits and polls used by the sync thread and the teardown handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// One coprocessor frame (160 samples at ~32.7 kHz)
    pub frame_period_us: u64,
    /// Frames to wait for a last signal after Sleep before idling
    pub entering_sleep_frames: u32,
    /// Idle step while a cancelled sleep waits for Wakeup
    pub cancel_idle_ms: u64,
    /// How often the sleeping thread checks for shutdown
    pub wake_poll_ms: u64,
    /// Interval between quiescence polls during teardown
    pub quiesce_poll_interval_ms: u64,
    /// Polls before teardown continues without an acknowledgement
    pub quiesce_poll_attempts: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            frame_period_us: 4889,
            entering_sleep_frames: 2,
            cancel_idle_ms: 10,
            wake_poll_ms: 100,
            quiesce_poll_interval_ms: 1,
            quiesce_poll_attempts: 200,
        }
    }
}

impl TimingConfig {
    pub fn frame_period(&self) -> Duration {
        Duration::from_micros(self.frame_period_us)
    }

    pub fn entering_sleep_wait(&self) -> Duration {
        self.frame_period() * self.entering_sleep_frames
    }

    pub fn cancel_idle(&self) -> Duration {
        Duration::from_millis(self.cancel_idle_ms)
    }

    pub fn wake_poll(&self) -> Duration {
        Duration::from_millis(self.wake_poll_ms)
    }

    pub fn quiesce_poll_interval(&self) -> Duration {
        Duration::from_millis(self.quiesce_poll_interval_ms)
    }
}
