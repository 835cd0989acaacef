//! The per-engine sync thread
//!
//! One iteration of the loop:
//!
//! ```text
//!   drain power events ──► Sleep / Wakeup / Cancel transitions
//!          │
//!          ▼
//!   Running:        wait ≤ 1 frame ──signal──► readback, callbacks, sync, publish
//!   EnteringSleep:  wait ≤ N frames ──signal──► same (spurious wake)
//!   Sleeping:       block on power events
//!   CancelPending:  idle
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::Receiver;

use super::shared::SharedState;
use super::sync_engine::{FrameProgress, SyncEngine};
use crate::config::TimingConfig;
use crate::error::{DriverError, InitError, SyncError, SyncResult};
use crate::region::RegionRole;
use crate::types::PowerEvent;

/// Where the sync loop is in the power cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Running,
    EnteringSleep,
    Sleeping,
    CancelPending,
    /// Terminal: a fatal fault stopped the loop
    Stopped,
}

/// State machine driving the engine from a dedicated thread
pub struct SyncThread {
    engine: SyncEngine,
    shared: Arc<SharedState>,
    power_rx: Receiver<PowerEvent>,
    shutdown: Arc<AtomicBool>,
    state: SyncState,
    timing: TimingConfig,
}

impl SyncThread {
    pub fn new(
        engine: SyncEngine,
        shared: Arc<SharedState>,
        power_rx: Receiver<PowerEvent>,
        timing: TimingConfig,
    ) -> Self {
        Self {
            engine,
            shared,
            power_rx,
            shutdown: Arc::new(AtomicBool::new(false)),
            state: SyncState::Running,
            timing,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// Run one loop iteration
    pub fn step(&mut self) {
        if self.state == SyncState::Stopped {
            return;
        }

        while let Ok(event) = self.power_rx.try_recv() {
            self.apply_power_event(event);
        }

        match self.state {
            SyncState::Running => match self.engine.wait_for_signal(Some(self.timing.frame_period())) {
                Ok(true) => self.after_signal(),
                Ok(false) => {}
                Err(e) => self.fail(SyncError::ProtocolViolation(format!(
                    "frame wait failed while running: {}",
                    e
                ))),
            },
            SyncState::EnteringSleep => {
                match self.engine.wait_for_signal(Some(self.timing.entering_sleep_wait())) {
                    Ok(true) => {
                        log::debug!("SyncThread: Spurious wake while entering sleep");
                        self.after_signal();
                    }
                    Ok(false) | Err(DriverError::SignalClosed) => {
                        self.engine.finish_suspend();
                        self.state = SyncState::Sleeping;
                    }
                    Err(e) => self.fail(e.into()),
                }
            }
            SyncState::Sleeping => {
                let received = crossbeam::select! {
                    recv(self.power_rx) -> event => Some(event),
                    default(self.timing.wake_poll()) => None,
                };
                match received {
                    Some(Ok(event)) => self.apply_power_event(event),
                    // Power source gone; keep polling for shutdown
                    Some(Err(_)) => thread::sleep(self.timing.wake_poll()),
                    None => {}
                }
            }
            SyncState::CancelPending => thread::sleep(self.timing.cancel_idle()),
            SyncState::Stopped => {}
        }
    }

    fn apply_power_event(&mut self, event: PowerEvent) {
        log::info!("SyncThread: {:?} in state {:?}", event, self.state);
        match event {
            PowerEvent::Sleep => match self.engine.suspend() {
                Ok(()) => self.state = SyncState::EnteringSleep,
                Err(e) => self.fail(e),
            },
            PowerEvent::Wakeup => match self.engine.resume() {
                Ok(()) => {
                    self.shared.channels.mark_resync_dirty();
                    self.shared.master.mark_all_dirty();
                    self.state = SyncState::Running;
                }
                Err(e) => self.fail(e),
            },
            PowerEvent::Cancel => self.state = SyncState::CancelPending,
        }
    }

    fn after_signal(&mut self) {
        if let Err(e) = self.frame_work() {
            self.fail(e);
        }
    }

    fn frame_work(&mut self) -> SyncResult<()> {
        let progress = self.engine.poll_progress()?;
        let bank = self.engine.live_bank();
        let regions = self.engine.regions();
        let shared = &self.shared;

        match progress {
            FrameProgress::Advanced(frames) => {
                shared.channels.readback_all(regions, bank)?;
                let mut samples = vec![0i16; RegionRole::Capture.element_size() / 2];
                regions
                    .view(RegionRole::Capture, bank)
                    .read(0, bytemuck::cast_slice_mut(&mut samples))?;
                let overflow = shared.push_capture(&samples);
                if overflow > 0 {
                    log::warn!("SyncThread: Capture ring full, dropped {} samples", overflow);
                }
                shared.count_frames(frames as u64);
            }
            FrameProgress::Stalled => shared.count_dropped_frame(),
        }

        shared.run_callback();
        shared.master.run_aux_callbacks(regions, bank)?;

        let publish = self.engine.is_ready()
            && !matches!(self.state, SyncState::Sleeping | SyncState::CancelPending);
        if publish {
            let driver = self.engine.driver().as_ref();
            shared.master.sync(regions, bank, driver)?;
            shared.channels.sync_all(regions, bank, driver)?;
            self.engine.publish_frame()?;
        }
        Ok(())
    }

    fn fail(&mut self, error: SyncError) {
        log::error!("SyncThread: Stopping after fatal error: {}", error);
        self.shared.set_fault(Some(error.to_string()));
        self.state = SyncState::Stopped;
    }

    /// Loop until asked to shut down or stopped by a fault
    pub fn run(mut self) -> SyncEngine {
        log::info!("SyncThread: Started");
        while !self.shutdown.load(Ordering::Acquire) && self.state != SyncState::Stopped {
            self.step();
        }
        log::info!("SyncThread: Exiting in state {:?}", self.state);
        self.engine
    }

    /// Start the loop on its own thread
    pub fn spawn(self) -> Result<SyncThreadHandle, InitError> {
        let shutdown = Arc::clone(&self.shutdown);
        let join = thread::Builder::new()
            .name("dspsync-sync".to_string())
            .spawn(move || self.run())
            .map_err(|e| InitError::Spawn(e.to_string()))?;
        Ok(SyncThreadHandle { shutdown, join })
    }
}

/// Owner's side of a spawned sync thread
pub struct SyncThreadHandle {
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<SyncEngine>,
}

impl SyncThreadHandle {
    /// Ask the loop to finish and take the engine back
    pub fn stop(self) -> Option<SyncEngine> {
        self.shutdown.store(true, Ordering::Release);
        match self.join.join() {
            Ok(engine) => Some(engine),
            Err(_) => {
                log::error!("SyncThread: Thread panicked");
                None
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelFields, WaveBufStatus, WaveBuffer};
    use crate::driver::loopback::LoopbackDriver;
    use crate::driver::{BankMasks, ControlChannel, ControlWord, CoprocessorDriver};
    use crate::region::MasterParamFlags;
    use crate::types::{FRAME_SAMPLES, NUM_CHANNELS};
    use crossbeam::channel::{unbounded, Sender};
    use std::sync::atomic::AtomicUsize;

    struct Harness {
        driver: Arc<LoopbackDriver>,
        shared: Arc<SharedState>,
        power_tx: Sender<PowerEvent>,
        thread: SyncThread,
    }

    impl Harness {
        fn new() -> Self {
            let driver = Arc::new(LoopbackDriver::new());
            driver.load_firmware(&[0x11; 32], BankMasks::default()).unwrap();
            let timing = TimingConfig {
                frame_period_us: 20_000,
                cancel_idle_ms: 1,
                wake_poll_ms: 1,
                quiesce_poll_attempts: 3,
                ..Default::default()
            };
            let engine = SyncEngine::bootstrap(driver.clone(), timing.clone()).unwrap();
            let shared = Arc::new(SharedState::new());
            shared.channels.restart_all();
            let (power_tx, power_rx) = unbounded();
            let thread = SyncThread::new(engine, Arc::clone(&shared), power_rx, timing);
            Self { driver, shared, power_tx, thread }
        }

        /// Let the coprocessor finish a frame, then run one iteration
        fn cycle(&mut self) {
            self.driver.complete_frame().unwrap();
            self.thread.step();
        }
    }

    fn buffer(samples: u32) -> Arc<WaveBuffer> {
        Arc::new(WaveBuffer::new(Arc::from(vec![0u8; samples as usize * 2]), samples))
    }

    #[test]
    fn test_buffers_retire_as_hardware_reports() {
        let mut h = Harness::new();
        let (a, b) = (buffer(5000), Arc::new(WaveBuffer::new(Arc::from(vec![0u8; 6000]), 3000).looping()));
        let (seq_a, seq_b) = {
            let mut ch = h.shared.channels.lock(3).unwrap();
            ch.set_rate(16000.0);
            (ch.wavebuf_add(Arc::clone(&a)).unwrap(), ch.wavebuf_add(Arc::clone(&b)).unwrap())
        };

        h.cycle();
        assert_eq!(a.status(), WaveBufStatus::Playing);
        assert_eq!(b.status(), WaveBufStatus::Queued);

        h.driver.report_channel(3, seq_a, true).unwrap();
        h.cycle();
        assert_eq!(a.status(), WaveBufStatus::Playing);
        assert_eq!(h.shared.channels.lock(3).unwrap().wavebuf_seq(), seq_a);

        h.driver.report_channel(3, seq_b, true).unwrap();
        h.cycle();
        assert_eq!(a.status(), WaveBufStatus::Done);
        assert_eq!(b.status(), WaveBufStatus::Playing);
        let ch = h.shared.channels.lock(3).unwrap();
        assert!(ch.is_playing());
        assert_eq!(ch.queue_len(), 1);
        assert_eq!(h.thread.state(), SyncState::Running);
    }

    #[test]
    fn test_simulated_playback_finishes_short_buffer() {
        let mut h = Harness::new();
        let short = buffer(FRAME_SAMPLES as u32);
        h.shared.channels.lock(0).unwrap().wavebuf_add(Arc::clone(&short));

        // Publish, then let the firmware play two frames
        h.cycle();
        for _ in 0..2 {
            h.driver.run_frame().unwrap();
            h.thread.step();
        }
        assert_eq!(short.status(), WaveBufStatus::Done);
        assert!(!h.shared.channels.lock(0).unwrap().is_playing());
    }

    #[test]
    fn test_counts_frames_and_stalls() {
        let mut h = Harness::new();
        h.cycle();
        h.cycle();
        assert_eq!(h.shared.frame_count(), 2);

        h.driver.raise_signal();
        h.thread.step();
        assert_eq!(h.shared.dropped_frames(), 1);
        assert_eq!(h.shared.frame_count(), 2);
    }

    #[test]
    fn test_sleep_then_wake_resyncs_everything() {
        let mut h = Harness::new();
        h.cycle();
        assert_eq!(h.shared.channels.lock(0).unwrap().dirty(), ChannelFields::empty());

        h.power_tx.send(PowerEvent::Sleep).unwrap();
        h.thread.step();
        assert_eq!(h.thread.state(), SyncState::Sleeping);
        assert!(!h.thread.engine().is_ready());

        h.power_tx.send(PowerEvent::Wakeup).unwrap();
        h.thread.step();
        assert_eq!(h.thread.state(), SyncState::Running);
        for id in 0..NUM_CHANNELS {
            assert_eq!(
                h.shared.channels.lock(id).unwrap().dirty(),
                ChannelFields::all() - ChannelFields::GENERATION
            );
        }
        assert_eq!(h.shared.master.lock().dirty(), MasterParamFlags::all());

        let words: Vec<u16> = h
            .driver
            .sent_words()
            .into_iter()
            .filter(|(channel, _)| *channel == ControlChannel::Command)
            .map(|(_, word)| word)
            .collect();
        assert_eq!(
            words,
            [ControlWord::Reset as u16, ControlWord::Suspend as u16, ControlWord::Resume as u16]
        );

        h.cycle();
        assert_eq!(h.shared.channels.lock(0).unwrap().dirty(), ChannelFields::empty());
    }

    #[test]
    fn test_buffer_queued_before_sleep_finishes_after_wake() {
        let mut h = Harness::new();
        let long = buffer(8000);
        h.shared.channels.lock(0).unwrap().wavebuf_add(Arc::clone(&long)).unwrap();

        h.cycle();
        for _ in 0..3 {
            h.driver.run_frame().unwrap();
            h.thread.step();
        }
        assert_eq!(long.status(), WaveBufStatus::Playing);
        assert!(h.shared.channels.lock(0).unwrap().sample_pos() > 0);

        h.power_tx.send(PowerEvent::Sleep).unwrap();
        h.thread.step();
        h.power_tx.send(PowerEvent::Wakeup).unwrap();
        h.thread.step();
        assert_eq!(h.thread.state(), SyncState::Running);

        // Publish the resync before the firmware plays on
        h.cycle();
        for _ in 0..60 {
            h.driver.run_frame().unwrap();
            h.thread.step();
        }
        assert_eq!(long.status(), WaveBufStatus::Done);
        let ch = h.shared.channels.lock(0).unwrap();
        assert_eq!(ch.queue_len(), 0);
        assert!(!ch.is_playing());
    }

    #[test]
    fn test_entering_sleep_waits_and_handles_spurious_wake() {
        let mut h = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        h.shared.set_callback(Some(Box::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })));

        // A late interrupt is already pending when the sleep starts
        h.driver.raise_signal();
        h.power_tx.send(PowerEvent::Sleep).unwrap();
        h.thread.step();
        assert_eq!(h.thread.state(), SyncState::EnteringSleep);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(h.driver.signal_registered());
        let releases = h.driver.semaphore_releases();

        let started = std::time::Instant::now();
        h.thread.step();
        assert!(started.elapsed() >= h.thread.timing.entering_sleep_wait());
        assert_eq!(h.thread.state(), SyncState::Sleeping);
        assert!(!h.driver.signal_registered());
        assert!(!h.driver.semaphore_open());
        assert_eq!(h.driver.semaphore_releases(), releases);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_cancel_leaves_hardware_alone() {
        let mut h = Harness::new();
        h.power_tx.send(PowerEvent::Sleep).unwrap();
        h.thread.step();
        h.power_tx.send(PowerEvent::Cancel).unwrap();
        h.thread.step();
        assert_eq!(h.thread.state(), SyncState::CancelPending);
        let sent = h.driver.sent_words().len();

        h.thread.step();
        assert_eq!(h.driver.sent_words().len(), sent);

        h.power_tx.send(PowerEvent::Wakeup).unwrap();
        h.thread.step();
        assert_eq!(h.thread.state(), SyncState::Running);
        assert!(h.driver.is_running());
    }

    #[test]
    fn test_closed_signal_while_running_is_fatal() {
        let mut h = Harness::new();
        h.driver.close_signal();
        h.thread.step();

        assert_eq!(h.thread.state(), SyncState::Stopped);
        assert!(h.shared.fault().unwrap().contains("Protocol violation"));
    }

    #[test]
    fn test_capture_and_callback_run_each_frame() {
        let mut h = Harness::new();
        let (producer, consumer) = rtrb::RingBuffer::new(FRAME_SAMPLES * 8);
        h.shared.set_capture(Some(producer));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        h.shared.set_callback(Some(Box::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })));

        h.cycle();
        h.cycle();
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert_eq!(consumer.slots(), FRAME_SAMPLES * 2 * 2);
    }

    #[test]
    fn test_spawned_thread_hands_engine_back() {
        let h = Harness::new();
        let driver = Arc::clone(&h.driver);
        let handle = h.thread.spawn().unwrap();
        driver.run_frame().unwrap();

        let engine = handle.stop().unwrap();
        engine.shutdown();
        assert!(!driver.semaphore_open());
        assert!(!driver.is_running());
    }
}
