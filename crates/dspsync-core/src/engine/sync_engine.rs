//! Handshakes and per-frame bookkeeping with the coprocessor
//!
//! The engine owns the driver resources tied to a running firmware (the
//! completion signal and the frame semaphore), the region table discovered at
//! bootstrap and the frame counter. It performs the four lifecycle
//! handshakes:
//!
//! - **bootstrap**: Reset, read the region tokens, publish the first frame
//! - **suspend**: Suspend, wait for quiescence, back up internal state; the
//!   signal stays registered until [`SyncEngine::finish_suspend`]
//! - **resume**: restore internal state, Resume
//! - **shutdown**: Stop, wait for quiescence
//!
//! Everything acquired is released again on failure or drop.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::TimingConfig;
use crate::driver::{CompletionSignal, ControlChannel, ControlWord, CoprocessorDriver, QUIESCENT_ACK};
use crate::error::{DriverError, InitError, RegionError, SyncResult};
use crate::region::{FrameCounters, RegionRole, SharedRegionTable};
use crate::types::Bank;

use super::frame::FrameCounter;

/// What the coprocessor did since the last poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameProgress {
    /// It completed this many frames
    Advanced(u16),
    /// The completed counter did not move
    Stalled,
}

/// Signal and semaphore held while the firmware runs
struct DriverLink {
    driver: Arc<dyn CoprocessorDriver>,
    signal: Option<Arc<CompletionSignal>>,
    semaphore_open: bool,
}

impl DriverLink {
    fn closed(driver: Arc<dyn CoprocessorDriver>) -> Self {
        Self { driver, signal: None, semaphore_open: false }
    }

    /// Register a fresh signal and open the semaphore
    ///
    /// On failure whatever was acquired is released again.
    fn open(&mut self) -> Result<(), InitError> {
        self.install_signal()
            .map_err(|source| InitError::Resource { resource: "completion signal", source })?;

        if let Err(source) = self.driver.open_semaphore() {
            self.release();
            return Err(InitError::Resource { resource: "frame semaphore", source });
        }
        self.semaphore_open = true;
        Ok(())
    }

    /// Replace the current signal (if any) with a newly registered one
    fn install_signal(&mut self) -> Result<(), DriverError> {
        self.drop_signal();
        let signal = Arc::new(CompletionSignal::new());
        self.driver.register_completion_signal(Arc::clone(&signal))?;
        self.signal = Some(signal);
        Ok(())
    }

    fn drop_signal(&mut self) {
        if let Some(signal) = self.signal.take() {
            if let Err(e) = self.driver.unregister_completion_signal() {
                log::warn!("SyncEngine: Failed to unregister completion signal: {}", e);
            }
            signal.close();
        }
    }

    fn release(&mut self) {
        self.drop_signal();
        if self.semaphore_open {
            self.semaphore_open = false;
            if let Err(e) = self.driver.close_semaphore() {
                log::warn!("SyncEngine: Failed to close frame semaphore: {}", e);
            }
        }
    }

    fn is_open(&self) -> bool {
        self.signal.is_some() || self.semaphore_open
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<bool, DriverError> {
        match &self.signal {
            Some(signal) => signal.wait(timeout),
            None => Err(DriverError::SignalClosed),
        }
    }
}

impl Drop for DriverLink {
    fn drop(&mut self) {
        self.release();
    }
}

/// Application side of the frame protocol
pub struct SyncEngine {
    link: DriverLink,
    regions: SharedRegionTable,
    frame: FrameCounter,
    last_completed: u16,
    ready: bool,
    backup: Option<Vec<u8>>,
    timing: TimingConfig,
}

impl SyncEngine {
    /// Cold-start the firmware and discover the shared regions
    ///
    /// Blocks until the coprocessor acknowledges the Reset.
    pub fn bootstrap(driver: Arc<dyn CoprocessorDriver>, timing: TimingConfig) -> Result<Self, InitError> {
        let mut link = DriverLink::closed(Arc::clone(&driver));
        link.open()?;

        let regions = match Self::reset_handshake(&link) {
            Ok(regions) => regions,
            Err(e) => {
                // Firmware may be running already
                if let Err(stop) = driver.send_control_word(ControlChannel::Command, ControlWord::Stop as u16) {
                    log::warn!("SyncEngine: Failed to stop firmware after bootstrap error: {}", stop);
                }
                return Err(e);
            }
        };

        let mut engine = Self {
            link,
            regions,
            frame: FrameCounter::new(),
            last_completed: 0,
            ready: true,
            backup: None,
            timing,
        };

        // The first publish stands in for a completed cycle
        engine.publish_frame().map_err(|e| InitError::Handshake(e.to_string()))?;
        engine.last_completed = engine.read_completed()?;

        log::info!("SyncEngine: Bootstrap complete, next frame {}", engine.frame.id());
        Ok(engine)
    }

    fn reset_handshake(link: &DriverLink) -> Result<SharedRegionTable, InitError> {
        let driver = link.driver.as_ref();
        driver
            .send_control_word(ControlChannel::Command, ControlWord::Reset as u16)
            .map_err(|source| InitError::Resource { resource: "reset command", source })?;

        link.wait(None)
            .map_err(|e| InitError::Handshake(format!("waiting for reset: {}", e)))?;

        let count = driver
            .read_words(ControlChannel::Command, 1)
            .map_err(|e| InitError::Handshake(format!("reading region count: {}", e)))?
            .first()
            .copied()
            .ok_or_else(|| InitError::Handshake("empty region count reply".into()))?;

        let tokens = driver
            .read_words(ControlChannel::Command, count as usize)
            .map_err(|e| InitError::Handshake(format!("reading {} region tokens: {}", count, e)))?;

        SharedRegionTable::from_tokens(&tokens, driver)
    }

    // ─────────────────────────────────────────────────────────────
    // Power transitions
    // ─────────────────────────────────────────────────────────────

    /// Suspend the firmware and back up its internal state
    ///
    /// The completion signal and semaphore stay held so a late interrupt can
    /// still be observed; [`finish_suspend`](Self::finish_suspend) releases
    /// them once the sleep is settled.
    pub fn suspend(&mut self) -> SyncResult<()> {
        if !self.ready {
            log::debug!("SyncEngine: Suspend while already suspended, ignoring");
            return Ok(());
        }

        self.ready = false;
        if self.link.is_open() {
            self.quiesce(ControlWord::Suspend);
        }
        self.backup = Some(self.regions.read_bytes(RegionRole::InternalState, Bank::Zero, 0)?);
        log::info!("SyncEngine: Suspended at frame {}", self.frame.id());
        Ok(())
    }

    /// Unregister the signal and close the semaphore of a suspended engine
    pub fn finish_suspend(&mut self) {
        if self.ready || !self.link.is_open() {
            return;
        }
        self.link.release();
        log::debug!("SyncEngine: Released driver resources for sleep");
    }

    /// Restore the backed-up state and resume the firmware
    ///
    /// A signal torn down while waiting (a racing power transition) is not
    /// an error: a fresh signal is installed and the engine carries on.
    pub fn resume(&mut self) -> SyncResult<()> {
        if self.ready {
            log::debug!("SyncEngine: Resume while running, nothing to restore");
            return Ok(());
        }

        // Still held if the sleep never settled
        self.link.release();
        self.link.open()?;
        if let Some(backup) = &self.backup {
            self.regions.write_bytes(RegionRole::InternalState, Bank::Zero, 0, backup)?;
        }

        let driver = Arc::clone(&self.link.driver);
        if let Err(e) = driver.send_control_word(ControlChannel::Command, ControlWord::Resume as u16) {
            self.link.release();
            return Err(e.into());
        }

        match self.link.wait(None) {
            Ok(_) => {}
            Err(DriverError::SignalClosed) => {
                log::debug!("SyncEngine: Signal closed during resume, reinstalling");
                self.link.install_signal()?;
            }
            Err(e) => {
                self.link.release();
                return Err(e.into());
            }
        }

        self.last_completed = self.read_completed()?;
        self.ready = true;
        log::info!("SyncEngine: Resumed at frame {}", self.frame.id());
        Ok(())
    }

    /// Stop the firmware for good
    pub fn shutdown(mut self) {
        self.teardown(ControlWord::Stop);
        log::info!("SyncEngine: Shut down");
    }

    /// Send `word`, wait for quiescence, release the driver resources
    fn teardown(&mut self, word: ControlWord) {
        self.ready = false;
        if !self.link.is_open() {
            return;
        }
        self.quiesce(word);
        self.link.release();
    }

    fn quiesce(&self, word: ControlWord) {
        let driver = Arc::clone(&self.link.driver);
        match driver.send_control_word(ControlChannel::Command, word as u16) {
            Ok(()) => self.wait_quiescent(driver.as_ref()),
            Err(e) => log::warn!("SyncEngine: Failed to send {:?}: {}", word, e),
        }
    }

    fn wait_quiescent(&self, driver: &dyn CoprocessorDriver) {
        for _ in 0..self.timing.quiesce_poll_attempts {
            match driver.poll_status(ControlChannel::Status) {
                Ok(Some(QUIESCENT_ACK)) => return,
                Ok(Some(other)) => log::debug!("SyncEngine: Ignoring status word {:#06x}", other),
                Ok(None) => {}
                Err(e) => {
                    log::warn!("SyncEngine: Status poll failed: {}", e);
                    return;
                }
            }
            thread::sleep(self.timing.quiesce_poll_interval());
        }
        log::warn!(
            "SyncEngine: No quiescence acknowledgement after {} polls, continuing teardown",
            self.timing.quiesce_poll_attempts
        );
    }

    // ─────────────────────────────────────────────────────────────
    // Per-frame operations
    // ─────────────────────────────────────────────────────────────

    /// Wait for the next completion interrupt
    ///
    /// Returns `Ok(false)` on timeout, `SignalClosed` if the signal is gone.
    pub fn wait_for_signal(&self, timeout: Option<Duration>) -> Result<bool, DriverError> {
        self.link.wait(timeout)
    }

    fn read_completed(&self) -> Result<u16, RegionError> {
        Ok(self.regions.read::<FrameCounters>(self.live_bank(), 0)?.completed)
    }

    /// Compare the coprocessor's completed counter with the last one seen
    pub fn poll_progress(&mut self) -> SyncResult<FrameProgress> {
        let completed = self.read_completed()?;
        let delta = completed.wrapping_sub(self.last_completed);
        if delta == 0 {
            return Ok(FrameProgress::Stalled);
        }
        self.last_completed = completed;
        Ok(FrameProgress::Advanced(delta))
    }

    /// Publish the frame id into the live bank and hand the bank over
    pub fn publish_frame(&mut self) -> SyncResult<()> {
        self.regions.write_u16::<FrameCounters>(
            self.live_bank(),
            0,
            FrameCounters::PUBLISHED_OFFSET,
            self.frame.id(),
        )?;
        self.link.driver.release_semaphore()?;
        self.frame.advance();
        Ok(())
    }

    /// Bank written by `sync` and read by `readback` this cycle
    pub fn live_bank(&self) -> Bank {
        self.frame.live_bank()
    }

    pub fn frame_id(&self) -> u16 {
        self.frame.id()
    }

    pub fn regions(&self) -> &SharedRegionTable {
        &self.regions
    }

    pub fn driver(&self) -> &Arc<dyn CoprocessorDriver> {
        &self.link.driver
    }

    /// Whether the firmware is running (not suspended or shut down)
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    #[cfg(test)]
    pub(crate) fn force_frame(&mut self, frame: FrameCounter) {
        self.frame = frame;
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if self.link.is_open() {
            self.teardown(ControlWord::Stop);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::loopback::LoopbackDriver;
    use crate::driver::BankMasks;

    fn loopback() -> Arc<LoopbackDriver> {
        let driver = Arc::new(LoopbackDriver::new());
        driver.load_firmware(&[0xAA; 16], BankMasks::default()).unwrap();
        driver
    }

    fn fast_timing() -> TimingConfig {
        TimingConfig { quiesce_poll_attempts: 3, ..Default::default() }
    }

    #[test]
    fn test_bootstrap_publishes_first_frame() {
        let driver = loopback();
        let engine = SyncEngine::bootstrap(driver.clone(), fast_timing()).unwrap();

        assert_eq!(engine.frame_id(), 5);
        assert_eq!(engine.live_bank(), Bank::One);
        assert_eq!(driver.semaphore_releases(), 1);
        let counters: FrameCounters = driver.regions().read(Bank::Zero, 0).unwrap();
        assert_eq!(counters.published, 4);
        assert!(engine.is_ready());
    }

    #[test]
    fn test_progress_follows_completed_counter() {
        let driver = loopback();
        let mut engine = SyncEngine::bootstrap(driver.clone(), fast_timing()).unwrap();
        assert_eq!(engine.poll_progress().unwrap(), FrameProgress::Stalled);

        driver.run_frame().unwrap();
        assert_eq!(engine.wait_for_signal(Some(Duration::from_millis(50))), Ok(true));
        assert_eq!(engine.poll_progress().unwrap(), FrameProgress::Advanced(1));
        assert_eq!(engine.poll_progress().unwrap(), FrameProgress::Stalled);

        engine.publish_frame().unwrap();
        driver.run_frame().unwrap();
        assert_eq!(engine.poll_progress().unwrap(), FrameProgress::Advanced(1));
    }

    #[test]
    fn test_published_id_skips_reserved_values() {
        let driver = loopback();
        let mut engine = SyncEngine::bootstrap(driver.clone(), fast_timing()).unwrap();
        engine.force_frame(FrameCounter::starting_at(65534));

        for _ in 0..6 {
            let bank = engine.live_bank();
            let id = engine.frame_id();
            engine.publish_frame().unwrap();
            let counters: FrameCounters = driver.regions().read(bank, 0).unwrap();
            assert_eq!(counters.published, id);
            assert!(counters.published >= 2);
        }
        assert_eq!(engine.frame_id(), 6);
    }

    #[test]
    fn test_bootstrap_failure_releases_signal() {
        let driver = loopback();
        driver.fail_next("open_semaphore");

        assert!(matches!(
            SyncEngine::bootstrap(driver.clone(), fast_timing()),
            Err(InitError::Resource { resource: "frame semaphore", .. })
        ));
        assert!(!driver.signal_registered());
        assert!(!driver.semaphore_open());
    }

    #[test]
    fn test_bad_token_fails_handshake_and_stops_firmware() {
        let driver = loopback();
        driver.fail_next("convert_shared_token");

        assert!(SyncEngine::bootstrap(driver.clone(), fast_timing()).is_err());
        assert!(!driver.signal_registered());
        assert!(!driver.is_running());
    }

    #[test]
    fn test_suspend_resume_restores_internal_state() {
        let driver = loopback();
        let mut engine = SyncEngine::bootstrap(driver.clone(), fast_timing()).unwrap();

        let state = vec![0x5A; RegionRole::InternalState.element_size()];
        driver.regions().write_bytes(RegionRole::InternalState, Bank::Zero, 0, &state).unwrap();

        engine.suspend().unwrap();
        assert!(!engine.is_ready());
        assert!(driver.signal_registered());

        engine.finish_suspend();
        assert!(!driver.signal_registered());
        assert!(!driver.semaphore_open());

        let scrubbed = vec![0; state.len()];
        driver.regions().write_bytes(RegionRole::InternalState, Bank::Zero, 0, &scrubbed).unwrap();

        engine.resume().unwrap();
        assert!(engine.is_ready());
        assert!(driver.is_running());
        let restored = driver.regions().read_bytes(RegionRole::InternalState, Bank::Zero, 0).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn test_suspended_engine_still_sees_interrupts() {
        let driver = loopback();
        let mut engine = SyncEngine::bootstrap(driver.clone(), fast_timing()).unwrap();
        engine.suspend().unwrap();

        driver.raise_signal();
        assert_eq!(engine.wait_for_signal(Some(Duration::from_millis(50))), Ok(true));
        assert_eq!(engine.wait_for_signal(Some(Duration::from_millis(1))), Ok(false));
    }

    #[test]
    fn test_resume_before_sleep_settles() {
        let driver = loopback();
        let mut engine = SyncEngine::bootstrap(driver.clone(), fast_timing()).unwrap();
        engine.suspend().unwrap();

        engine.resume().unwrap();
        assert!(engine.is_ready());
        assert!(driver.semaphore_open());
        driver.run_frame().unwrap();
        assert_eq!(engine.wait_for_signal(Some(Duration::from_millis(50))), Ok(true));
    }

    #[test]
    fn test_failed_cleanup_stop_keeps_handshake_error() {
        let driver = loopback();
        driver.fail_next("convert_shared_token");
        // Reset goes through, the Stop sent after the bad token does not
        driver.fail_after("send_control_word", 1);

        assert!(SyncEngine::bootstrap(driver.clone(), fast_timing()).is_err());
        assert!(!driver.signal_registered());
        assert!(!driver.semaphore_open());
        assert!(driver.is_running());
    }

    #[test]
    fn test_resume_race_is_benign() {
        let driver = loopback();
        let mut engine = SyncEngine::bootstrap(driver.clone(), fast_timing()).unwrap();
        engine.suspend().unwrap();

        driver.close_signal_on_resume(true);
        engine.resume().unwrap();
        assert!(engine.is_ready());

        driver.close_signal_on_resume(false);
        driver.run_frame().unwrap();
        assert_eq!(engine.wait_for_signal(Some(Duration::from_millis(50))), Ok(true));
    }

    #[test]
    fn test_missing_ack_does_not_block_teardown() {
        let driver = loopback();
        let engine = SyncEngine::bootstrap(driver.clone(), fast_timing()).unwrap();
        driver.withhold_quiescence_ack(true);

        engine.shutdown();
        assert!(!driver.signal_registered());
        assert!(!driver.semaphore_open());
    }

    #[test]
    fn test_drop_stops_firmware() {
        let driver = loopback();
        {
            let _engine = SyncEngine::bootstrap(driver.clone(), fast_timing()).unwrap();
        }
        assert!(!driver.is_running());
        assert_eq!(
            driver.sent_words().last(),
            Some(&(ControlChannel::Command, ControlWord::Stop as u16))
        );
    }
}
