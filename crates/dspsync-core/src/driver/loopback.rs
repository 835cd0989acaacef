//! In-process coprocessor driver
//!
//! `LoopbackDriver` plays the firmware's side of the protocol against heap
//! memory. It answers the lifecycle handshakes, hands out region tokens and,
//! when asked to run a frame, consumes the most recently published parameter
//! bank and reports channel status into the opposite bank, exactly like the
//! real component does between two completion interrupts.
//!
//! ```text
//!  engine publishes bank L ──► run_frame(): read L, advance queues
//!                                            write status into !L
//!                                            completed += 1, raise signal
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    BankMasks, CompletionSignal, ControlChannel, ControlWord, CoprocessorDriver, DriverResult,
    QUIESCENT_ACK,
};
use crate::error::{DriverError, RegionError};
use crate::region::{
    BufferSlot, ChannelParams, ChannelStatus, FrameCounters, ParamFlags, RegionRole,
    SharedMemory, SharedRegionTable, SharedView, StatusFlags,
};
use crate::types::{Bank, FRAME_SAMPLES, NUM_CHANNELS, QUEUE_SLOTS, SEQ_END_OF_LIST};

/// Region tokens are word addresses
const TOKEN_UNIT: usize = 4;

/// Heap-backed shared memory
#[derive(Debug)]
pub struct LoopbackMemory {
    bytes: Mutex<Vec<u8>>,
}

impl LoopbackMemory {
    pub fn new(size: usize) -> Self {
        Self { bytes: Mutex::new(vec![0; size]) }
    }

    fn clear(&self) {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner).fill(0);
    }
}

impl SharedMemory for LoopbackMemory {
    fn size(&self) -> usize {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn load(&self, offset: usize, dst: &mut [u8]) {
        let bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        dst.copy_from_slice(&bytes[offset..offset + dst.len()]);
    }

    fn store(&self, offset: usize, src: &[u8]) {
        let mut bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        bytes[offset..offset + src.len()].copy_from_slice(src);
    }
}

#[derive(Debug, Clone, Copy)]
struct SimBuffer {
    seq: u16,
    samples: u32,
    looping: bool,
}

impl From<&BufferSlot> for SimBuffer {
    fn from(slot: &BufferSlot) -> Self {
        Self { seq: slot.sequence_id, samples: slot.sample_count, looping: slot.looping != 0 }
    }
}

/// Firmware-side view of one channel
#[derive(Debug, Clone)]
struct SimChannel {
    generation: u16,
    rate: f32,
    paused: bool,
    queue: VecDeque<SimBuffer>,
    position: f32,
    sync_count: u16,
    current_seq: u16,
    buffers_changed: bool,
    playing_override: Option<bool>,
}

impl Default for SimChannel {
    fn default() -> Self {
        Self {
            generation: 0,
            rate: 1.0,
            paused: false,
            queue: VecDeque::new(),
            position: 0.0,
            sync_count: 0,
            current_seq: SEQ_END_OF_LIST,
            buffers_changed: false,
            playing_override: None,
        }
    }
}

impl SimChannel {
    fn consume(&mut self, params: &ChannelParams) {
        let flags = params.param_flags();

        if flags.contains(ParamFlags::GENERATION) {
            self.generation = params.generation;
            self.queue.clear();
            self.position = 0.0;
            self.current_seq = SEQ_END_OF_LIST;
        }
        if flags.contains(ParamFlags::RATE) {
            self.rate = params.rate;
        }
        if flags.contains(ParamFlags::PLAY_STATE) {
            self.paused = params.paused != 0;
        }
        if flags.contains(ParamFlags::ACTIVE_BUFFER) {
            self.queue.clear();
            self.position = 0.0;
            self.queue.push_back(SimBuffer::from(&params.active));
            self.current_seq = params.active.sequence_id;
            self.buffers_changed = true;
        }
        if flags.contains(ParamFlags::QUEUED_BUFFERS) {
            for (slot_idx, slot) in params.queued.iter().enumerate().take(QUEUE_SLOTS) {
                if params.queued_mask & (1 << slot_idx) != 0 {
                    self.queue.push_back(SimBuffer::from(slot));
                }
            }
        }
    }

    /// Play one frame worth of samples
    fn advance(&mut self) {
        if self.paused || self.queue.is_empty() {
            return;
        }

        self.position += self.rate * FRAME_SAMPLES as f32;
        while let Some(head) = self.queue.front().copied() {
            let len = head.samples.max(1) as f32;
            if self.position < len {
                break;
            }
            if head.looping {
                self.position %= len;
                break;
            }
            self.position -= len;
            self.queue.pop_front();
            self.buffers_changed = true;
        }
        if self.queue.is_empty() {
            self.position = 0.0;
        }
        self.current_seq = self.queue.front().map_or(SEQ_END_OF_LIST, |b| b.seq);
    }

    fn status(&mut self) -> ChannelStatus {
        self.sync_count = self.sync_count.wrapping_add(1);

        let playing = self
            .playing_override
            .take()
            .unwrap_or(!self.paused && !self.queue.is_empty());
        let mut flags = StatusFlags::empty();
        if playing {
            flags |= StatusFlags::PLAYING;
        }
        if std::mem::take(&mut self.buffers_changed) {
            flags |= StatusFlags::BUFFERS_CHANGED;
        }

        ChannelStatus {
            sample_pos: self.position as u32,
            sync_count: self.sync_count,
            generation: self.generation,
            current_seq: self.current_seq,
            flags: flags.bits(),
        }
    }
}

#[derive(Debug, Default)]
struct LoopbackState {
    signal: Option<Arc<CompletionSignal>>,
    semaphore_open: bool,
    semaphore_releases: u64,
    firmware_len: Option<usize>,
    command_reply: VecDeque<u16>,
    status_reply: VecDeque<u16>,
    sent: Vec<(ControlChannel, u16)>,
    running: bool,
    last_consumed: Option<u16>,
    completed: u16,
    channels: Vec<SimChannel>,
    /// Calls to let through before the named call fails once
    fail_after: HashMap<&'static str, usize>,
    close_signal_on_resume: bool,
    withhold_ack: bool,
}

/// Simulated coprocessor reachable through [`CoprocessorDriver`]
pub struct LoopbackDriver {
    banks: [Arc<LoopbackMemory>; 2],
    offsets: [usize; RegionRole::COUNT],
    table: SharedRegionTable,
    headphones: AtomicBool,
    state: Mutex<LoopbackState>,
}

impl LoopbackDriver {
    pub fn new() -> Self {
        let mut offsets = [0usize; RegionRole::COUNT];
        let mut cursor = 0;
        for (slot, role) in offsets.iter_mut().zip(RegionRole::ALL) {
            *slot = cursor;
            cursor += role.size().next_multiple_of(TOKEN_UNIT);
        }

        let banks = [Arc::new(LoopbackMemory::new(cursor)), Arc::new(LoopbackMemory::new(cursor))];
        let tokens: Vec<u16> = offsets.iter().map(|&o| (o / TOKEN_UNIT) as u16).collect();
        let table = SharedRegionTable::build(&tokens, |token, bank| Self::view(&banks, token, bank))
            .expect("loopback layout covers every region role");

        let state = LoopbackState {
            channels: vec![SimChannel::default(); NUM_CHANNELS],
            ..Default::default()
        };

        Self {
            banks,
            offsets,
            table,
            headphones: AtomicBool::new(false),
            state: Mutex::new(state),
        }
    }

    fn view(banks: &[Arc<LoopbackMemory>; 2], token: u16, bank: Bank) -> DriverResult<SharedView> {
        let memory = Arc::clone(&banks[bank.index()]);
        let offset = token as usize * TOKEN_UNIT;
        if offset >= memory.size() {
            return Err(DriverError::UnknownToken(token));
        }
        let memory: Arc<dyn SharedMemory> = memory;
        SharedView::to_end(memory, offset).map_err(|_| DriverError::UnknownToken(token))
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_fail(state: &mut LoopbackState, call: &'static str) -> DriverResult<()> {
        match state.fail_after.get_mut(call) {
            Some(0) => {
                state.fail_after.remove(call);
                Err(DriverError::call(call, "injected failure"))
            }
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Test and simulator controls
    // ─────────────────────────────────────────────────────────────

    /// The firmware's own view of shared memory
    pub fn regions(&self) -> &SharedRegionTable {
        &self.table
    }

    /// Make the next call named `call` (e.g. `"open_semaphore"`) fail once
    pub fn fail_next(&self, call: &'static str) {
        self.fail_after(call, 0);
    }

    /// Let `successes` calls named `call` through, then fail the next one
    pub fn fail_after(&self, call: &'static str, successes: usize) {
        self.lock().fail_after.insert(call, successes);
    }

    /// Close the registered signal instead of raising it when Resume arrives
    pub fn close_signal_on_resume(&self, enabled: bool) {
        self.lock().close_signal_on_resume = enabled;
    }

    /// Never acknowledge Stop/Suspend on the status pipe
    pub fn withhold_quiescence_ack(&self, enabled: bool) {
        self.lock().withhold_ack = enabled;
    }

    /// Fire the completion interrupt without finishing a frame
    pub fn raise_signal(&self) {
        if let Some(signal) = &self.lock().signal {
            signal.raise();
        }
    }

    /// Tear down the registered signal as a racing power transition would
    pub fn close_signal(&self) {
        if let Some(signal) = &self.lock().signal {
            signal.close();
        }
    }

    pub fn set_headphones(&self, connected: bool) {
        self.headphones.store(connected, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn firmware_len(&self) -> Option<usize> {
        self.lock().firmware_len
    }

    pub fn signal_registered(&self) -> bool {
        self.lock().signal.is_some()
    }

    pub fn semaphore_open(&self) -> bool {
        self.lock().semaphore_open
    }

    pub fn semaphore_releases(&self) -> u64 {
        self.lock().semaphore_releases
    }

    /// Every control word received, in order
    pub fn sent_words(&self) -> Vec<(ControlChannel, u16)> {
        self.lock().sent.clone()
    }

    /// Bank the engine published most recently
    pub fn latest_published_bank(&self) -> Result<Bank, RegionError> {
        let c0 = self.table.read::<FrameCounters>(Bank::Zero, 0)?;
        let c1 = self.table.read::<FrameCounters>(Bank::One, 0)?;
        let newer = (c1.published.wrapping_sub(c0.published) as i16) > 0;
        Ok(if newer { Bank::One } else { Bank::Zero })
    }

    /// Force what the next frame reports for `channel`
    ///
    /// Buffers queued ahead of `current_seq` are treated as finished.
    pub fn report_channel(&self, channel: usize, current_seq: u16, playing: bool) -> Result<(), RegionError> {
        let mut state = self.lock();
        self.consume_latest(&mut state)?;
        if let Some(sim) = state.channels.get_mut(channel) {
            while sim.queue.front().is_some_and(|b| b.seq != current_seq) {
                sim.queue.pop_front();
            }
            sim.current_seq = current_seq;
            sim.buffers_changed = true;
            sim.playing_override = Some(playing);
        }
        Ok(())
    }

    /// Finish a frame without playing any samples (reports stay as forced)
    pub fn complete_frame(&self) -> Result<(), RegionError> {
        self.process_frame(false)
    }

    /// Consume the latest parameters, play one frame and report
    pub fn run_frame(&self) -> Result<(), RegionError> {
        self.process_frame(true)
    }

    fn consume_latest(&self, state: &mut LoopbackState) -> Result<(), RegionError> {
        let input = self.latest_published_bank()?;
        let published = self.table.read::<FrameCounters>(input, 0)?.published;
        if state.last_consumed == Some(published) {
            return Ok(());
        }
        state.last_consumed = Some(published);

        for (idx, sim) in state.channels.iter_mut().enumerate() {
            let params = self.table.read::<ChannelParams>(input, idx)?;
            sim.consume(&params);
        }
        Ok(())
    }

    fn process_frame(&self, simulate: bool) -> Result<(), RegionError> {
        let mut state = self.lock();
        if !state.running {
            return Ok(());
        }

        self.consume_latest(&mut state)?;
        let output = self.latest_published_bank()?.opposite();

        for (idx, sim) in state.channels.iter_mut().enumerate() {
            if simulate {
                sim.advance();
            }
            self.table.write(output, idx, &sim.status())?;
        }

        let silence = vec![0u8; RegionRole::Capture.element_size()];
        self.table.write_bytes(RegionRole::Capture, output, 0, &silence)?;

        state.completed = state.completed.wrapping_add(1);
        self.table
            .write_u16::<FrameCounters>(output, 0, FrameCounters::COMPLETED_OFFSET, state.completed)?;

        if let Some(signal) = &state.signal {
            signal.raise();
        }
        Ok(())
    }

    fn handle_command(&self, state: &mut LoopbackState, word: ControlWord) {
        match word {
            ControlWord::Reset => {
                for bank in &self.banks {
                    bank.clear();
                }
                state.channels = vec![SimChannel::default(); NUM_CHANNELS];
                state.last_consumed = None;
                state.completed = 0;
                state.running = true;
                state.command_reply.push_back(RegionRole::COUNT as u16);
                state
                    .command_reply
                    .extend(self.offsets.iter().map(|&o| (o / TOKEN_UNIT) as u16));
                if let Some(signal) = &state.signal {
                    signal.raise();
                }
            }
            ControlWord::Resume => {
                state.running = true;
                if let Some(signal) = &state.signal {
                    if state.close_signal_on_resume {
                        signal.close();
                    } else {
                        signal.raise();
                    }
                }
            }
            ControlWord::Stop | ControlWord::Suspend => {
                state.running = false;
                if !state.withhold_ack {
                    state.status_reply.push_back(QUIESCENT_ACK);
                }
            }
        }
    }
}

impl Default for LoopbackDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl CoprocessorDriver for LoopbackDriver {
    fn register_completion_signal(&self, signal: Arc<CompletionSignal>) -> DriverResult<()> {
        let mut state = self.lock();
        Self::check_fail(&mut state, "register_completion_signal")?;
        state.signal = Some(signal);
        Ok(())
    }

    fn unregister_completion_signal(&self) -> DriverResult<()> {
        self.lock().signal = None;
        Ok(())
    }

    fn open_semaphore(&self) -> DriverResult<()> {
        let mut state = self.lock();
        Self::check_fail(&mut state, "open_semaphore")?;
        state.semaphore_open = true;
        Ok(())
    }

    fn release_semaphore(&self) -> DriverResult<()> {
        let mut state = self.lock();
        if !state.semaphore_open {
            return Err(DriverError::call("release_semaphore", "semaphore not open"));
        }
        state.semaphore_releases += 1;
        Ok(())
    }

    fn close_semaphore(&self) -> DriverResult<()> {
        self.lock().semaphore_open = false;
        Ok(())
    }

    fn send_control_word(&self, channel: ControlChannel, word: u16) -> DriverResult<()> {
        let mut state = self.lock();
        Self::check_fail(&mut state, "send_control_word")?;
        if state.firmware_len.is_none() {
            return Err(DriverError::call("send_control_word", "no firmware loaded"));
        }
        state.sent.push((channel, word));

        if channel == ControlChannel::Command {
            let command = ControlWord::from_word(word)
                .ok_or_else(|| DriverError::call("send_control_word", format!("unknown word {word}")))?;
            self.handle_command(&mut state, command);
        }
        Ok(())
    }

    fn poll_status(&self, channel: ControlChannel) -> DriverResult<Option<u16>> {
        let mut state = self.lock();
        Ok(match channel {
            ControlChannel::Status => state.status_reply.pop_front(),
            ControlChannel::Command => state.command_reply.pop_front(),
        })
    }

    fn read_words(&self, channel: ControlChannel, count: usize) -> DriverResult<Vec<u16>> {
        let mut state = self.lock();
        let pipe = match channel {
            ControlChannel::Status => &mut state.status_reply,
            ControlChannel::Command => &mut state.command_reply,
        };
        if pipe.len() < count {
            return Err(DriverError::call(
                "read_words",
                format!("{count} words requested, {} available", pipe.len()),
            ));
        }
        Ok(pipe.drain(..count).collect())
    }

    fn load_firmware(&self, blob: &[u8], _masks: BankMasks) -> DriverResult<()> {
        let mut state = self.lock();
        Self::check_fail(&mut state, "load_firmware")?;
        if blob.is_empty() {
            return Err(DriverError::call("load_firmware", "empty firmware image"));
        }
        state.firmware_len = Some(blob.len());
        Ok(())
    }

    fn unload_firmware(&self) -> DriverResult<()> {
        let mut state = self.lock();
        state.firmware_len = None;
        state.running = false;
        Ok(())
    }

    fn convert_shared_token(&self, token: u16, bank: Bank) -> DriverResult<SharedView> {
        let mut state = self.lock();
        Self::check_fail(&mut state, "convert_shared_token")?;
        Self::view(&self.banks, token, bank)
    }

    fn device_address(&self, data: &[u8]) -> u32 {
        data.as_ptr() as usize as u32
    }

    fn headphones_connected(&self) -> bool {
        self.headphones.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded() -> LoopbackDriver {
        let driver = LoopbackDriver::new();
        driver.load_firmware(&[1, 2, 3, 4], BankMasks::default()).unwrap();
        driver
    }

    #[test]
    fn test_reset_reports_region_tokens() {
        let driver = loaded();
        driver
            .send_control_word(ControlChannel::Command, ControlWord::Reset as u16)
            .unwrap();

        let count = driver.read_words(ControlChannel::Command, 1).unwrap()[0] as usize;
        assert_eq!(count, RegionRole::COUNT);
        let tokens = driver.read_words(ControlChannel::Command, count).unwrap();
        let table = SharedRegionTable::from_tokens(&tokens, &driver).unwrap();
        assert_eq!(
            table.view(RegionRole::ChannelParams, Bank::One).len(),
            RegionRole::ChannelParams.size()
        );
    }

    #[test]
    fn test_commands_require_firmware() {
        let driver = LoopbackDriver::new();
        assert!(driver
            .send_control_word(ControlChannel::Command, ControlWord::Reset as u16)
            .is_err());
    }

    #[test]
    fn test_suspend_is_acknowledged() {
        let driver = loaded();
        driver
            .send_control_word(ControlChannel::Command, ControlWord::Suspend as u16)
            .unwrap();
        assert_eq!(driver.poll_status(ControlChannel::Status).unwrap(), Some(QUIESCENT_ACK));
        assert_eq!(driver.poll_status(ControlChannel::Status).unwrap(), None);
    }

    #[test]
    fn test_sim_channel_finishes_buffer() {
        let mut sim = SimChannel::default();
        let mut params = ChannelParams {
            flags: (ParamFlags::ACTIVE_BUFFER | ParamFlags::QUEUED_BUFFERS).bits(),
            queued_mask: 0b1,
            ..Default::default()
        };
        params.active = BufferSlot { sequence_id: 1, sample_count: 200, ..Default::default() };
        params.queued[0] = BufferSlot { sequence_id: 2, sample_count: 1000, ..Default::default() };
        sim.consume(&params);

        sim.advance();
        assert_eq!(sim.current_seq, 1);
        sim.advance();
        assert_eq!(sim.current_seq, 2);

        let status = sim.status();
        assert!(status.status_flags().contains(StatusFlags::BUFFERS_CHANGED | StatusFlags::PLAYING));
        assert_eq!(status.sample_pos, 120);
    }

    #[test]
    fn test_looping_buffer_never_finishes() {
        let mut sim = SimChannel::default();
        let mut params = ChannelParams { flags: ParamFlags::ACTIVE_BUFFER.bits(), ..Default::default() };
        params.active = BufferSlot { sequence_id: 7, sample_count: 100, looping: 1, ..Default::default() };
        sim.consume(&params);

        for _ in 0..10 {
            sim.advance();
        }
        assert_eq!(sim.current_seq, 7);
        assert_eq!(sim.queue.len(), 1);
    }
}
