//! Application-facing engine context
//!
//! A [`Dsp`] owns one set of channels, one master mix and, while
//! initialized, one sync thread. `init`/`exit` are reference counted: only
//! the first `init` boots the coprocessor and only the matching last `exit`
//! shuts it down.
//!
//! ```ignore
//! let dsp = DspBuilder::new(driver).config(config).build();
//! dsp.init()?;
//! let ch = dsp.channel(0).unwrap();
//! ch.set_rate(22050.0);
//! ch.wavebuf_add(Arc::new(WaveBuffer::new(samples, 4096)));
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam::channel::Receiver;

use crate::channel::{ChannelState, WaveBuffer};
use crate::config::SyncConfig;
use crate::driver::{BankMasks, CoprocessorDriver};
use crate::engine::{FrameCallback, SharedState, SyncEngine, SyncThread, SyncThreadHandle};
use crate::error::InitError;
use crate::loader::{ComponentLoader, FirmwareSource};
use crate::master::{AuxBus, AuxCallback, MasterState};
use crate::region::MasterParamFlags;
use crate::types::{
    ClippingMode, InterpMode, OutputMode, PowerEvent, SampleFormat, SpeakerPosition, ADPCM_COEF_LEN,
    MIX_LEN, NUM_CHANNELS,
};

#[derive(Default)]
struct Lifecycle {
    refcount: u32,
    worker: Option<SyncThreadHandle>,
}

/// Builder for [`Dsp`]
pub struct DspBuilder {
    driver: Arc<dyn CoprocessorDriver>,
    config: SyncConfig,
    host_firmware: Option<Box<dyn FirmwareSource>>,
    power_rx: Option<Receiver<PowerEvent>>,
}

impl DspBuilder {
    pub fn new(driver: Arc<dyn CoprocessorDriver>) -> Self {
        Self {
            driver,
            config: SyncConfig::default(),
            host_firmware: None,
            power_rx: None,
        }
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Firmware source tried after every configured path
    pub fn host_firmware(mut self, source: Box<dyn FirmwareSource>) -> Self {
        self.host_firmware = Some(source);
        self
    }

    /// Where Sleep/Wakeup/Cancel notifications come from
    pub fn power_events(mut self, power_rx: Receiver<PowerEvent>) -> Self {
        self.power_rx = Some(power_rx);
        self
    }

    pub fn build(self) -> Dsp {
        let loader = ComponentLoader::new(
            self.config.firmware_paths.clone(),
            self.config.bank_masks,
            self.host_firmware,
        );
        Dsp {
            config: self.config,
            driver: self.driver,
            loader: Mutex::new(loader),
            shared: Arc::new(SharedState::new()),
            active: AtomicBool::new(false),
            lifecycle: Mutex::new(Lifecycle::default()),
            power_rx: self.power_rx.unwrap_or_else(crossbeam::channel::never),
        }
    }
}

/// One engine instance
pub struct Dsp {
    config: SyncConfig,
    driver: Arc<dyn CoprocessorDriver>,
    loader: Mutex<ComponentLoader>,
    shared: Arc<SharedState>,
    active: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
    power_rx: Receiver<PowerEvent>,
}

impl Dsp {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn loader(&self) -> MutexGuard<'_, ComponentLoader> {
        self.loader.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Use `blob` as the firmware instead of searching for one
    pub fn use_component(&self, blob: Vec<u8>, masks: BankMasks) {
        self.loader().load_from(blob, masks);
    }

    /// Boot the coprocessor (first call) or take another reference
    ///
    /// On failure everything acquired is released and the engine stays
    /// uninitialized.
    pub fn init(&self) -> Result<(), InitError> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.refcount > 0 {
            lifecycle.refcount += 1;
            return Ok(());
        }

        let worker = self.start()?;
        lifecycle.worker = Some(worker);
        lifecycle.refcount = 1;
        self.active.store(true, Ordering::Release);
        log::info!("Dsp: Initialized");
        Ok(())
    }

    fn start(&self) -> Result<SyncThreadHandle, InitError> {
        let mut loader = self.loader();
        loader.find_and_load()?;

        let booted = loader.load_into(self.driver.as_ref()).and_then(|()| {
            SyncEngine::bootstrap(Arc::clone(&self.driver), self.config.timing.clone())
        });
        let engine = match booted {
            Ok(engine) => engine,
            Err(e) => {
                loader.unload_from(self.driver.as_ref());
                loader.release();
                log::warn!("Dsp: Init failed: {}", e);
                return Err(e);
            }
        };

        self.shared.channels.restart_all();
        self.shared.master.reset();
        self.shared.set_fault(None);

        let thread = SyncThread::new(
            engine,
            Arc::clone(&self.shared),
            self.power_rx.clone(),
            self.config.timing.clone(),
        );
        thread.spawn().inspect_err(|e| {
            loader.unload_from(self.driver.as_ref());
            loader.release();
            log::warn!("Dsp: Init failed: {}", e);
        })
    }

    /// Drop one reference; the last one shuts the coprocessor down
    ///
    /// Extra calls are no-ops.
    pub fn exit(&self) {
        let mut lifecycle = self.lifecycle();
        match lifecycle.refcount {
            0 => return,
            1 => lifecycle.refcount = 0,
            _ => {
                lifecycle.refcount -= 1;
                return;
            }
        }
        self.active.store(false, Ordering::Release);

        if let Some(engine) = lifecycle.worker.take().and_then(SyncThreadHandle::stop) {
            engine.shutdown();
        }

        let mut loader = self.loader();
        loader.unload_from(self.driver.as_ref());
        loader.release();
        self.shared.channels.reset_all();
        log::info!("Dsp: Exited");
    }

    pub fn is_initialized(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Handle for channel `id`, `None` if out of range
    pub fn channel(&self, id: usize) -> Option<ChannelHandle<'_>> {
        (id < NUM_CHANNELS).then_some(ChannelHandle { dsp: self, id })
    }

    pub fn master(&self) -> MasterHandle<'_> {
        MasterHandle { dsp: self }
    }

    /// Ring that receives every completed frame's stereo output
    pub fn set_capture(&self, producer: Option<rtrb::Producer<i16>>) {
        self.shared.set_capture(producer);
    }

    /// Hook run on the sync thread once per frame
    pub fn set_callback(&self, callback: Option<FrameCallback>) {
        self.shared.set_callback(callback);
    }

    /// Cycles where the coprocessor signalled without completing a frame
    pub fn dropped_frames(&self) -> u64 {
        self.shared.dropped_frames()
    }

    pub fn frame_count(&self) -> u64 {
        self.shared.frame_count()
    }

    /// Fatal error that stopped the sync thread, if any
    pub fn fault(&self) -> Option<String> {
        self.shared.fault()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}

impl Drop for Dsp {
    fn drop(&mut self) {
        let references = self.lifecycle().refcount;
        if references > 0 {
            log::debug!("Dsp: Dropped with {} init references, shutting down", references);
            self.lifecycle().refcount = 1;
            self.exit();
        }
    }
}

// ─────────────────────────────────────────────────────────────
// Channel handle
// ─────────────────────────────────────────────────────────────

/// Setters and queries for one channel
///
/// Setters do nothing while the engine is not initialized.
#[derive(Clone, Copy)]
pub struct ChannelHandle<'a> {
    dsp: &'a Dsp,
    id: usize,
}

impl ChannelHandle<'_> {
    pub fn id(&self) -> usize {
        self.id
    }

    fn update<R>(&self, f: impl FnOnce(&mut ChannelState) -> R) -> Option<R> {
        if !self.dsp.is_initialized() {
            return None;
        }
        self.dsp.shared.channels.lock(self.id).map(|mut ch| f(&mut ch))
    }

    fn query<R: Default>(&self, f: impl FnOnce(&ChannelState) -> R) -> R {
        self.dsp.shared.channels.lock(self.id).map(|ch| f(&ch)).unwrap_or_default()
    }

    pub fn reset(&self) {
        self.update(ChannelState::reset);
    }

    pub fn set_format(&self, format: SampleFormat) {
        self.update(|ch| ch.set_format(format));
    }

    pub fn set_interp(&self, interp: InterpMode) {
        self.update(|ch| ch.set_interp(interp));
    }

    /// Playback rate in Hz
    pub fn set_rate(&self, hz: f32) {
        self.update(|ch| ch.set_rate(hz));
    }

    pub fn set_mix(&self, mix: [f32; MIX_LEN]) {
        self.update(|ch| ch.set_mix(mix));
    }

    pub fn set_adpcm_coefs(&self, coefs: [i16; ADPCM_COEF_LEN]) {
        self.update(|ch| ch.set_adpcm_coefs(coefs));
    }

    pub fn iir_mono_enable(&self, enable: bool) {
        self.update(|ch| ch.iir_mono_enable(enable));
    }

    pub fn iir_mono_set_params(&self, coefs: [i16; 2]) {
        self.update(|ch| ch.iir_mono_set_params(coefs));
    }

    pub fn iir_biquad_enable(&self, enable: bool) {
        self.update(|ch| ch.iir_biquad_enable(enable));
    }

    pub fn iir_biquad_set_params(&self, coefs: [i16; 5]) {
        self.update(|ch| ch.iir_biquad_set_params(coefs));
    }

    pub fn set_paused(&self, paused: bool) {
        self.update(|ch| ch.set_paused(paused));
    }

    /// Queue a buffer; returns its sequence id if accepted
    pub fn wavebuf_add(&self, buf: Arc<WaveBuffer>) -> Option<u16> {
        self.update(|ch| ch.wavebuf_add(buf)).flatten()
    }

    pub fn wavebuf_clear(&self) {
        self.update(ChannelState::wavebuf_clear);
    }

    pub fn is_playing(&self) -> bool {
        self.query(ChannelState::is_playing)
    }

    pub fn is_paused(&self) -> bool {
        self.query(ChannelState::is_paused)
    }

    pub fn sample_pos(&self) -> u32 {
        self.query(ChannelState::sample_pos)
    }

    pub fn wavebuf_seq(&self) -> u16 {
        self.query(ChannelState::wavebuf_seq)
    }

    pub fn format(&self) -> SampleFormat {
        self.query(ChannelState::format)
    }

    pub fn interp(&self) -> InterpMode {
        self.query(ChannelState::interp)
    }

    /// Rate relative to the coprocessor's native rate
    pub fn rate(&self) -> f32 {
        self.query(ChannelState::rate)
    }

    pub fn mix(&self) -> [f32; MIX_LEN] {
        self.query(ChannelState::mix)
    }

    pub fn adpcm_coefs(&self) -> [i16; ADPCM_COEF_LEN] {
        self.query(ChannelState::adpcm_coefs)
    }

    pub fn iir_mono(&self) -> (bool, [i16; 2]) {
        self.query(ChannelState::iir_mono)
    }

    pub fn iir_biquad(&self) -> (bool, [i16; 5]) {
        self.query(ChannelState::iir_biquad)
    }
}

// ─────────────────────────────────────────────────────────────
// Master handle
// ─────────────────────────────────────────────────────────────

/// Setters and queries for the master mix
#[derive(Clone, Copy)]
pub struct MasterHandle<'a> {
    dsp: &'a Dsp,
}

impl MasterHandle<'_> {
    fn set(&self, field: MasterParamFlags, apply: impl FnOnce(&mut MasterState)) {
        if self.dsp.is_initialized() {
            self.dsp.shared.master.update(field, apply);
        }
    }

    fn set_aux(&self, bus: usize, field: MasterParamFlags, apply: impl FnOnce(&mut AuxBus)) {
        if self.dsp.is_initialized() {
            self.dsp.shared.master.update_aux(bus, field, apply);
        }
    }

    fn get<R>(&self, f: impl FnOnce(&MasterState) -> R) -> R {
        f(&self.dsp.shared.master.lock())
    }

    fn get_aux<R: Default>(&self, bus: usize, f: impl FnOnce(&AuxBus) -> R) -> R {
        self.get(|state| state.aux.get(bus).map(f).unwrap_or_default())
    }

    pub fn set_volume(&self, volume: f32) {
        self.set(MasterParamFlags::VOLUME, |s| s.volume = volume);
    }

    pub fn volume(&self) -> f32 {
        self.get(|s| s.volume)
    }

    pub fn set_output_mode(&self, mode: OutputMode) {
        self.set(MasterParamFlags::OUTPUT_MODE, |s| s.output_mode = mode);
    }

    pub fn output_mode(&self) -> OutputMode {
        self.get(|s| s.output_mode)
    }

    pub fn set_clipping_mode(&self, mode: ClippingMode) {
        self.set(MasterParamFlags::CLIPPING_MODE, |s| s.clipping_mode = mode);
    }

    pub fn clipping_mode(&self) -> ClippingMode {
        self.get(|s| s.clipping_mode)
    }

    pub fn set_output_count(&self, count: u16) {
        self.set(MasterParamFlags::OUTPUT_COUNT, |s| s.output_count = count);
    }

    pub fn output_count(&self) -> u16 {
        self.get(|s| s.output_count)
    }

    pub fn set_surround_depth(&self, depth: u16) {
        self.set(MasterParamFlags::SURROUND_DEPTH, |s| s.surround_depth = depth);
    }

    pub fn surround_depth(&self) -> u16 {
        self.get(|s| s.surround_depth)
    }

    pub fn set_surround_position(&self, position: SpeakerPosition) {
        self.set(MasterParamFlags::SURROUND_POSITION, |s| s.surround_position = position);
    }

    pub fn surround_position(&self) -> SpeakerPosition {
        self.get(|s| s.surround_position)
    }

    pub fn set_surround_rear_ratio(&self, ratio: u16) {
        self.set(MasterParamFlags::SURROUND_REAR_RATIO, |s| s.surround_rear_ratio = ratio);
    }

    pub fn surround_rear_ratio(&self) -> u16 {
        self.get(|s| s.surround_rear_ratio)
    }

    pub fn set_aux_enable(&self, bus: usize, enable: bool) {
        self.set_aux(bus, MasterParamFlags::AUX_ENABLE, |aux| aux.enabled = enable);
    }

    pub fn aux_enabled(&self, bus: usize) -> bool {
        self.get_aux(bus, |aux| aux.enabled)
    }

    pub fn set_aux_front_bypass(&self, bus: usize, bypass: bool) {
        self.set_aux(bus, MasterParamFlags::AUX_FRONT_BYPASS, |aux| aux.front_bypass = bypass);
    }

    pub fn aux_front_bypass(&self, bus: usize) -> bool {
        self.get_aux(bus, |aux| aux.front_bypass)
    }

    pub fn set_aux_volume(&self, bus: usize, volume: f32) {
        self.set_aux(bus, MasterParamFlags::AUX_VOLUME, |aux| aux.volume = volume);
    }

    pub fn aux_volume(&self, bus: usize) -> f32 {
        self.get_aux(bus, |aux| aux.volume)
    }

    /// Hook that may edit the bus' samples every frame
    pub fn set_aux_callback(&self, bus: usize, callback: Option<AuxCallback>) {
        if self.dsp.is_initialized() {
            self.dsp.shared.master.set_aux_callback(bus, callback);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::WaveBufStatus;
    use crate::driver::loopback::LoopbackDriver;
    use crate::error::LoaderError;
    use std::thread;
    use std::time::{Duration, Instant};

    fn dsp_with(driver: &Arc<LoopbackDriver>) -> Dsp {
        let config = SyncConfig { firmware_paths: Vec::new(), ..Default::default() };
        let dsp = DspBuilder::new(driver.clone()).config(config).build();
        dsp.use_component(vec![0xD5; 64], BankMasks::default());
        dsp
    }

    #[test]
    fn test_init_exit_refcount() {
        let driver = Arc::new(LoopbackDriver::new());
        let dsp = dsp_with(&driver);

        dsp.init().unwrap();
        dsp.init().unwrap();
        dsp.exit();
        assert!(dsp.is_initialized());
        assert!(driver.is_running());

        dsp.exit();
        assert!(!dsp.is_initialized());
        assert_eq!(driver.firmware_len(), None);
        assert!(!driver.semaphore_open());

        let sent = driver.sent_words().len();
        dsp.exit();
        assert_eq!(driver.sent_words().len(), sent);
    }

    #[test]
    fn test_init_failure_rolls_back() {
        let driver = Arc::new(LoopbackDriver::new());
        let dsp = dsp_with(&driver);
        driver.fail_next("register_completion_signal");

        assert!(matches!(dsp.init(), Err(InitError::Resource { .. })));
        assert!(!dsp.is_initialized());
        assert_eq!(driver.firmware_len(), None);
        assert!(!driver.semaphore_open());

        dsp.init().unwrap();
        assert!(dsp.is_initialized());
        dsp.exit();
    }

    #[test]
    fn test_missing_firmware() {
        let driver = Arc::new(LoopbackDriver::new());
        let config = SyncConfig {
            firmware_paths: vec!["/nonexistent/dspfirm.cdc".into()],
            ..Default::default()
        };
        let dsp = DspBuilder::new(driver.clone()).config(config).build();
        assert!(matches!(dsp.init(), Err(InitError::Firmware(LoaderError::NotFound))));
        assert!(driver.sent_words().is_empty());
    }

    #[test]
    fn test_setters_ignored_before_init() {
        let driver = Arc::new(LoopbackDriver::new());
        let dsp = dsp_with(&driver);
        let ch = dsp.channel(0).unwrap();

        ch.set_rate(8000.0);
        dsp.master().set_volume(0.1);
        assert_eq!(ch.rate(), 1.0);
        assert_eq!(dsp.master().volume(), 1.0);
        assert_eq!(ch.wavebuf_add(Arc::new(WaveBuffer::new(Arc::from(vec![0u8; 4]), 2))), None);
        assert!(dsp.channel(NUM_CHANNELS).is_none());
    }

    #[test]
    fn test_getters_reflect_setters() {
        let driver = Arc::new(LoopbackDriver::new());
        let dsp = dsp_with(&driver);
        dsp.init().unwrap();

        let ch = dsp.channel(7).unwrap();
        ch.set_interp(InterpMode::Linear);
        ch.set_paused(true);
        ch.iir_mono_set_params([3, 4]);
        assert_eq!(ch.interp(), InterpMode::Linear);
        assert!(ch.is_paused());
        assert_eq!(ch.iir_mono(), (true, [3, 4]));

        let master = dsp.master();
        master.set_aux_enable(1, true);
        master.set_aux_volume(1, 0.5);
        master.set_surround_position(SpeakerPosition::Wide);
        assert!(master.aux_enabled(1));
        assert!(!master.aux_enabled(5));
        assert_eq!(master.aux_volume(1), 0.5);
        assert_eq!(master.surround_position(), SpeakerPosition::Wide);

        dsp.exit();
    }

    #[test]
    fn test_buffer_plays_to_completion() {
        let driver = Arc::new(LoopbackDriver::new());
        let dsp = dsp_with(&driver);
        dsp.init().unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let clock = {
            let driver = Arc::clone(&driver);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    driver.run_frame().unwrap();
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };

        let buf = Arc::new(WaveBuffer::new(Arc::from(vec![0u8; 1600]), 800));
        let ch = dsp.channel(0).unwrap();
        assert_eq!(ch.wavebuf_add(Arc::clone(&buf)), Some(1));

        let deadline = Instant::now() + Duration::from_secs(5);
        while buf.status() != WaveBufStatus::Done && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        stop.store(true, Ordering::Relaxed);
        clock.join().unwrap();

        assert_eq!(buf.status(), WaveBufStatus::Done);
        assert!(dsp.frame_count() > 0);
        assert!(dsp.fault().is_none());
        dsp.exit();
    }

    #[test]
    fn test_drop_shuts_down() {
        let driver = Arc::new(LoopbackDriver::new());
        {
            let dsp = dsp_with(&driver);
            dsp.init().unwrap();
            dsp.init().unwrap();
        }
        assert!(!driver.is_running());
        assert_eq!(driver.firmware_len(), None);
    }
}
