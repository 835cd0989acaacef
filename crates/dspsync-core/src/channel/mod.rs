//! Mixer channels
//!
//! Each of the 24 channels sits behind its own mutex so application threads
//! only contend with the sync thread, never with each other.

mod state;
mod wavebuf;

pub use state::{ChannelFields, ChannelState, DEFAULT_MIX};
pub use wavebuf::{AdpcmState, WaveBufStatus, WaveBuffer};

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::driver::CoprocessorDriver;
use crate::error::RegionError;
use crate::region::{ChannelStatus, SharedRegionTable};
use crate::types::{Bank, NUM_CHANNELS};

/// All channels of one engine
pub struct ChannelManager {
    channels: [Mutex<ChannelState>; NUM_CHANNELS],
}

impl ChannelManager {
    pub fn new() -> Self {
        Self {
            channels: std::array::from_fn(|id| Mutex::new(ChannelState::new(id))),
        }
    }

    /// Lock channel `id`, or `None` if out of range
    pub fn lock(&self, id: usize) -> Option<MutexGuard<'_, ChannelState>> {
        self.channels
            .get(id)
            .map(|ch| ch.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn each(&self) -> impl Iterator<Item = MutexGuard<'_, ChannelState>> {
        self.channels
            .iter()
            .map(|ch| ch.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Publish every channel into `bank`
    pub fn sync_all(
        &self,
        regions: &SharedRegionTable,
        bank: Bank,
        driver: &dyn CoprocessorDriver,
    ) -> Result<(), RegionError> {
        for mut ch in self.each() {
            ch.sync(regions, bank, driver)?;
        }
        Ok(())
    }

    /// Apply the status reports found in `bank`
    pub fn readback_all(&self, regions: &SharedRegionTable, bank: Bank) -> Result<(), RegionError> {
        for (id, mut ch) in self.each().enumerate() {
            let status: ChannelStatus = regions.read(bank, id)?;
            ch.readback(&status);
        }
        Ok(())
    }

    pub fn reset_all(&self) {
        for mut ch in self.each() {
            ch.reset();
        }
    }

    /// Forget every hardware report after the coprocessor was (re)booted
    pub fn restart_all(&self) {
        for mut ch in self.each() {
            ch.restart();
        }
    }

    pub fn mark_resync_dirty(&self) {
        for mut ch in self.each() {
            ch.mark_resync_dirty();
        }
    }
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::loopback::LoopbackDriver;
    use crate::region::{ChannelParams, ParamFlags};
    use crate::types::SampleFormat;
    use std::sync::Arc;

    #[test]
    fn test_reset_all_defaults() {
        let manager = ChannelManager::new();
        manager.reset_all();
        for id in 0..NUM_CHANNELS {
            let ch = manager.lock(id).unwrap();
            assert_eq!(ch.rate(), 1.0);
            assert_eq!(ch.mix(), DEFAULT_MIX);
            assert_eq!(ch.format(), SampleFormat::PCM16_MONO);
            assert_eq!(ch.queue_len(), 0);
            assert!(!ch.is_playing());
        }
        assert!(manager.lock(NUM_CHANNELS).is_none());
    }

    #[test]
    fn test_restart_forgets_old_reports() {
        let manager = ChannelManager::new();
        let report = ChannelStatus { sample_pos: 64, sync_count: 9, generation: 0, current_seq: 0, flags: 0 };
        manager.lock(1).unwrap().readback(&report);
        assert_eq!(manager.lock(1).unwrap().sample_pos(), 64);

        // New firmware instance, counters start over and reach 9 again
        manager.restart_all();
        let report = ChannelStatus { sample_pos: 32, generation: 1, ..report };
        manager.lock(1).unwrap().readback(&report);
        assert_eq!(manager.lock(1).unwrap().sample_pos(), 32);
    }

    #[test]
    fn test_dirty_field_published_once() {
        let driver = LoopbackDriver::new();
        let regions = driver.regions();
        let manager = ChannelManager::new();
        manager.sync_all(regions, Bank::Zero, &driver).unwrap();

        manager.lock(2).unwrap().set_rate(16000.0);
        manager.sync_all(regions, Bank::One, &driver).unwrap();
        assert_eq!(manager.lock(2).unwrap().dirty(), ChannelFields::empty());

        let params: ChannelParams = regions.read(Bank::One, 2).unwrap();
        assert_eq!(params.param_flags(), ParamFlags::RATE);
        assert!((params.rate - 16000.0 / crate::types::SAMPLE_RATE).abs() < 1e-6);

        manager.sync_all(regions, Bank::Zero, &driver).unwrap();
        let params: ChannelParams = regions.read(Bank::Zero, 2).unwrap();
        assert!(!params.param_flags().contains(ParamFlags::RATE));
    }

    #[test]
    fn test_queue_beyond_pipeline_depth_waits() {
        let driver = LoopbackDriver::new();
        let regions = driver.regions();
        let manager = ChannelManager::new();

        let bufs: Vec<_> = (0..7)
            .map(|_| Arc::new(WaveBuffer::new(Arc::from(vec![0u8; 32]), 16)))
            .collect();
        {
            let mut ch = manager.lock(0).unwrap();
            for buf in &bufs {
                ch.wavebuf_add(Arc::clone(buf));
            }
        }
        manager.sync_all(regions, Bank::Zero, &driver).unwrap();

        let params: ChannelParams = regions.read(Bank::Zero, 0).unwrap();
        assert!(params
            .param_flags()
            .contains(ParamFlags::ACTIVE_BUFFER | ParamFlags::QUEUED_BUFFERS));
        assert_eq!(params.active.sequence_id, 1);
        assert_eq!(params.queued_mask, 0b1111);
        assert_eq!(params.queued[3].sequence_id, 5);
        assert_eq!(bufs[0].status(), WaveBufStatus::Playing);
        assert_eq!(bufs[6].status(), WaveBufStatus::Queued);
        assert!(manager.lock(0).unwrap().is_playing());

        manager.sync_all(regions, Bank::One, &driver).unwrap();
        let params: ChannelParams = regions.read(Bank::One, 0).unwrap();
        assert_eq!(params.queued_mask, 0);
    }
}
