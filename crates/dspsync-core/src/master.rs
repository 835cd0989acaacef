//! Master mix and auxiliary buses

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::driver::CoprocessorDriver;
use crate::error::RegionError;
use crate::region::{MasterParamFlags, MasterParams, RegionRole, SharedRegionTable, AUX_FRAME_BYTES};
use crate::types::{Bank, ClippingMode, OutputMode, SpeakerPosition, NUM_AUX_BUSES};

/// Called every frame with an aux bus' interleaved 4-channel samples
pub type AuxCallback = Box<dyn FnMut(&mut [i32]) + Send>;

/// One auxiliary effect bus
#[derive(Default)]
pub struct AuxBus {
    pub enabled: bool,
    pub front_bypass: bool,
    pub volume: f32,
    callback: Option<AuxCallback>,
}

impl AuxBus {
    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }
}

impl std::fmt::Debug for AuxBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuxBus")
            .field("enabled", &self.enabled)
            .field("front_bypass", &self.front_bypass)
            .field("volume", &self.volume)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Master mix settings plus the pending-change mask
#[derive(Debug)]
pub struct MasterState {
    dirty: MasterParamFlags,
    pub volume: f32,
    pub output_mode: OutputMode,
    pub clipping_mode: ClippingMode,
    pub output_count: u16,
    pub surround_depth: u16,
    pub surround_position: SpeakerPosition,
    pub surround_rear_ratio: u16,
    pub aux: [AuxBus; NUM_AUX_BUSES],
}

impl Default for MasterState {
    fn default() -> Self {
        Self {
            dirty: MasterParamFlags::all(),
            volume: 1.0,
            output_mode: OutputMode::default(),
            clipping_mode: ClippingMode::default(),
            output_count: 2,
            surround_depth: 0x7FFF,
            surround_position: SpeakerPosition::default(),
            surround_rear_ratio: 0x8000,
            aux: std::array::from_fn(|_| AuxBus { volume: 1.0, ..Default::default() }),
        }
    }
}

impl MasterState {
    pub fn dirty(&self) -> MasterParamFlags {
        self.dirty
    }

    fn write_into(&self, params: &mut MasterParams) {
        let dirty = self.dirty;
        if dirty.contains(MasterParamFlags::VOLUME) {
            params.master_volume = self.volume;
        }
        if dirty.contains(MasterParamFlags::OUTPUT_MODE) {
            params.output_mode = self.output_mode as u16;
        }
        if dirty.contains(MasterParamFlags::CLIPPING_MODE) {
            params.clipping_mode = self.clipping_mode as u16;
        }
        if dirty.contains(MasterParamFlags::OUTPUT_COUNT) {
            params.output_count = self.output_count;
        }
        if dirty.contains(MasterParamFlags::SURROUND_DEPTH) {
            params.surround_depth = self.surround_depth;
        }
        if dirty.contains(MasterParamFlags::SURROUND_POSITION) {
            params.surround_position = self.surround_position as u16;
        }
        if dirty.contains(MasterParamFlags::SURROUND_REAR_RATIO) {
            params.surround_rear_ratio = self.surround_rear_ratio;
        }
        for (bus, aux) in self.aux.iter().enumerate() {
            if dirty.contains(MasterParamFlags::AUX_ENABLE) {
                params.aux_enable[bus] = aux.enabled as u8;
            }
            if dirty.contains(MasterParamFlags::AUX_FRONT_BYPASS) {
                params.aux_front_bypass[bus] = aux.front_bypass as u8;
            }
            if dirty.contains(MasterParamFlags::AUX_VOLUME) {
                params.aux_volume[bus] = aux.volume;
            }
        }
    }
}

/// Lock-protected master state of one engine
#[derive(Debug, Default)]
pub struct MasterMixManager {
    state: Mutex<MasterState>,
}

impl MasterMixManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, MasterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change state under the lock and mark `field` pending
    pub fn update(&self, field: MasterParamFlags, apply: impl FnOnce(&mut MasterState)) {
        let mut state = self.lock();
        apply(&mut state);
        state.dirty |= field;
    }

    /// Apply an aux bus change; out-of-range buses are ignored
    pub fn update_aux(&self, bus: usize, field: MasterParamFlags, apply: impl FnOnce(&mut AuxBus)) {
        let mut state = self.lock();
        if let Some(aux) = state.aux.get_mut(bus) {
            apply(aux);
            state.dirty |= field;
        }
    }

    pub fn set_aux_callback(&self, bus: usize, callback: Option<AuxCallback>) {
        if let Some(aux) = self.lock().aux.get_mut(bus) {
            aux.callback = callback;
        }
    }

    pub fn mark_all_dirty(&self) {
        self.lock().dirty = MasterParamFlags::all();
    }

    pub fn reset(&self) {
        *self.lock() = MasterState::default();
    }

    /// Write pending fields and the headphone flag into `bank`
    pub fn sync(
        &self,
        regions: &SharedRegionTable,
        bank: Bank,
        driver: &dyn CoprocessorDriver,
    ) -> Result<(), RegionError> {
        let mut state = self.lock();
        let mut params: MasterParams = regions.read(bank, 0)?;

        state.write_into(&mut params);
        params.headphones = driver.headphones_connected() as u8;
        params.flags = (state.dirty | MasterParamFlags::HEADPHONES).bits();
        regions.write(bank, 0, &params)?;

        state.dirty = MasterParamFlags::empty();
        Ok(())
    }

    /// Run the callbacks of enabled buses over their frame in `bank`
    ///
    /// Callbacks run without the master lock held, so they may call setters.
    pub fn run_aux_callbacks(&self, regions: &SharedRegionTable, bank: Bank) -> Result<(), RegionError> {
        for bus in 0..NUM_AUX_BUSES {
            let callback = {
                let mut state = self.lock();
                let aux = &mut state.aux[bus];
                if !aux.enabled {
                    continue;
                }
                aux.callback.take()
            };
            let Some(mut callback) = callback else { continue };

            let mut samples = vec![0i32; AUX_FRAME_BYTES / std::mem::size_of::<i32>()];
            let result = regions
                .view(RegionRole::AuxBuffers, bank)
                .read(bus * AUX_FRAME_BYTES, bytemuck::cast_slice_mut(&mut samples))
                .and_then(|()| {
                    callback(&mut samples);
                    regions.write_bytes(RegionRole::AuxBuffers, bank, bus, bytemuck::cast_slice(&samples))
                });

            let mut state = self.lock();
            let slot = &mut state.aux[bus].callback;
            if slot.is_none() {
                *slot = Some(callback);
            }
            result?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::loopback::LoopbackDriver;

    #[test]
    fn test_defaults() {
        let master = MasterMixManager::new();
        let state = master.lock();
        assert_eq!(state.volume, 1.0);
        assert_eq!(state.output_mode, OutputMode::Stereo);
        assert_eq!(state.output_count, 2);
        assert!(state.aux.iter().all(|aux| !aux.enabled && aux.volume == 1.0));
        assert_eq!(state.dirty(), MasterParamFlags::all());
    }

    #[test]
    fn test_sync_publishes_dirty_fields_and_headphones() {
        let driver = LoopbackDriver::new();
        let master = MasterMixManager::new();
        master.sync(driver.regions(), Bank::Zero, &driver).unwrap();

        driver.set_headphones(true);
        master.update(MasterParamFlags::VOLUME, |s| s.volume = 0.25);
        master.sync(driver.regions(), Bank::One, &driver).unwrap();

        let params: MasterParams = driver.regions().read(Bank::One, 0).unwrap();
        assert_eq!(params.param_flags(), MasterParamFlags::VOLUME | MasterParamFlags::HEADPHONES);
        assert_eq!(params.master_volume, 0.25);
        assert_eq!(params.headphones, 1);
        assert_eq!(master.lock().dirty(), MasterParamFlags::empty());
    }

    #[test]
    fn test_aux_callback_edits_frame() {
        let driver = LoopbackDriver::new();
        let master = MasterMixManager::new();
        master.update_aux(1, MasterParamFlags::AUX_ENABLE, |aux| aux.enabled = true);
        master.set_aux_callback(1, Some(Box::new(|samples: &mut [i32]| samples[0] = 42)));

        master.run_aux_callbacks(driver.regions(), Bank::Zero).unwrap();

        let bytes = driver.regions().read_bytes(RegionRole::AuxBuffers, Bank::Zero, 1).unwrap();
        assert_eq!(i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), 42);
        assert!(master.lock().aux[1].has_callback());
    }

    #[test]
    fn test_disabled_aux_is_skipped() {
        let driver = LoopbackDriver::new();
        let master = MasterMixManager::new();
        master.set_aux_callback(0, Some(Box::new(|_: &mut [i32]| panic!("disabled bus ran"))));
        master.run_aux_callbacks(driver.regions(), Bank::Zero).unwrap();
    }
}
