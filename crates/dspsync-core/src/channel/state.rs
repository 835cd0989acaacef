//! Application-side state of one mixer channel

use std::collections::VecDeque;
use std::sync::Arc;

use bitflags::bitflags;

use super::wavebuf::{WaveBufStatus, WaveBuffer};
use crate::driver::CoprocessorDriver;
use crate::error::RegionError;
use crate::region::{
    AdpcmCoefs, BufferSlot, ChannelParams, ChannelStatus, ParamFlags, SharedRegionTable, StatusFlags,
};
use crate::types::{
    Bank, InterpMode, SampleFormat, ADPCM_COEF_LEN, MIX_LEN, PIPELINE_DEPTH, QUEUE_SLOTS,
    SAMPLE_RATE, SEQ_END_OF_LIST,
};

bitflags! {
    /// Fields changed locally and not yet written to shared memory
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChannelFields: u16 {
        const GENERATION  = 1 << 0;
        const PLAY_STATE  = 1 << 1;
        const INTERP      = 1 << 2;
        const IIR_MONO    = 1 << 3;
        const IIR_BIQUAD  = 1 << 4;
        const RATE        = 1 << 5;
        const MIX         = 1 << 6;
        const ADPCM_COEFS = 1 << 7;
        const FORMAT      = 1 << 8;
    }
}

const IIR_MONO_BIT: u8 = 1 << 0;
const IIR_BIQUAD_BIT: u8 = 1 << 1;

/// Writes one field group into the parameter mirror
type Serializer = fn(&ChannelState, &mut ChannelParams, &mut AdpcmCoefs);

/// Pending field, the flag the coprocessor sees, and how to write it
const SERIALIZERS: [(ChannelFields, ParamFlags, Serializer); 9] = [
    (ChannelFields::GENERATION, ParamFlags::GENERATION, |ch, p, _| {
        p.generation = ch.generation
    }),
    (ChannelFields::PLAY_STATE, ParamFlags::PLAY_STATE, |ch, p, _| {
        p.paused = ch.paused as u8
    }),
    (ChannelFields::INTERP, ParamFlags::INTERP, |ch, p, _| p.interp = ch.interp as u8),
    (ChannelFields::IIR_MONO, ParamFlags::IIR_MONO, |ch, p, _| {
        p.iir_enable = (p.iir_enable & !IIR_MONO_BIT) | (ch.iir_enable & IIR_MONO_BIT);
        p.iir_mono = ch.iir_mono;
    }),
    (ChannelFields::IIR_BIQUAD, ParamFlags::IIR_BIQUAD, |ch, p, _| {
        p.iir_enable = (p.iir_enable & !IIR_BIQUAD_BIT) | (ch.iir_enable & IIR_BIQUAD_BIT);
        p.iir_biquad = ch.iir_biquad;
    }),
    (ChannelFields::RATE, ParamFlags::RATE, |ch, p, _| p.rate = ch.rate),
    (ChannelFields::MIX, ParamFlags::MIX, |ch, p, _| p.mix = ch.mix),
    (ChannelFields::ADPCM_COEFS, ParamFlags::ADPCM_COEFS, |ch, _, c| {
        c.coefs = ch.adpcm_coefs
    }),
    (ChannelFields::FORMAT, ParamFlags::FORMAT, |ch, p, _| p.format = ch.format.to_word()),
];

/// Mix matrix after reset: full volume on front left/right
pub const DEFAULT_MIX: [f32; MIX_LEN] = {
    let mut mix = [0.0; MIX_LEN];
    mix[0] = 1.0;
    mix[1] = 1.0;
    mix
};

/// One channel's parameters, wave buffer queue and last hardware report
#[derive(Debug)]
pub struct ChannelState {
    id: usize,
    dirty: ChannelFields,

    interp: InterpMode,
    /// Playback rate relative to the coprocessor's native rate
    rate: f32,
    mix: [f32; MIX_LEN],
    iir_enable: u8,
    iir_mono: [i16; 2],
    iir_biquad: [i16; 5],
    format: SampleFormat,
    adpcm_coefs: [i16; ADPCM_COEF_LEN],
    paused: bool,

    queue: VecDeque<Arc<WaveBuffer>>,
    /// Leading queue entries the coprocessor already knows about
    published: usize,
    next_seq: u16,
    generation: u16,

    last_sync_count: u16,
    hw_seq: u16,
    sample_pos: u32,
    playing: bool,
}

impl ChannelState {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            dirty: ChannelFields::all(),
            interp: InterpMode::default(),
            rate: 1.0,
            mix: DEFAULT_MIX,
            iir_enable: 0,
            iir_mono: [0; 2],
            iir_biquad: [0; 5],
            format: SampleFormat::default(),
            adpcm_coefs: [0; ADPCM_COEF_LEN],
            paused: false,
            queue: VecDeque::new(),
            published: 0,
            next_seq: 0,
            generation: 0,
            last_sync_count: 0,
            hw_seq: SEQ_END_OF_LIST,
            sample_pos: 0,
            playing: false,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn dirty(&self) -> ChannelFields {
        self.dirty
    }

    /// Republish every field after the firmware resumed from sleep
    ///
    /// The generation is left alone: the coprocessor would take it as a
    /// reset and drop the buffers it kept across the sleep.
    pub fn mark_resync_dirty(&mut self) {
        self.dirty = ChannelFields::all() - ChannelFields::GENERATION;
    }

    // ─────────────────────────────────────────────────────────────
    // Setters
    // ─────────────────────────────────────────────────────────────

    /// Restore defaults and drop the queue
    pub fn reset(&mut self) {
        let id = self.id;
        let generation = self.generation;
        let last_sync_count = self.last_sync_count;
        self.release_queue();

        *self = Self::new(id);
        self.generation = generation.wrapping_add(1);
        self.last_sync_count = last_sync_count;
    }

    /// Reset for a freshly booted coprocessor whose report counters start over
    pub fn restart(&mut self) {
        self.reset();
        self.last_sync_count = 0;
    }

    pub fn set_format(&mut self, format: SampleFormat) {
        self.format = format;
        self.dirty |= ChannelFields::FORMAT;
    }

    pub fn set_interp(&mut self, interp: InterpMode) {
        self.interp = interp;
        self.dirty |= ChannelFields::INTERP;
    }

    /// Set the playback rate in Hz
    pub fn set_rate(&mut self, hz: f32) {
        self.rate = hz / SAMPLE_RATE;
        self.dirty |= ChannelFields::RATE;
    }

    pub fn set_mix(&mut self, mix: [f32; MIX_LEN]) {
        self.mix = mix;
        self.dirty |= ChannelFields::MIX;
    }

    pub fn set_adpcm_coefs(&mut self, coefs: [i16; ADPCM_COEF_LEN]) {
        self.adpcm_coefs = coefs;
        self.dirty |= ChannelFields::ADPCM_COEFS;
    }

    pub fn iir_mono_enable(&mut self, enable: bool) {
        self.set_iir_bit(IIR_MONO_BIT, enable);
        self.dirty |= ChannelFields::IIR_MONO;
    }

    pub fn iir_mono_set_params(&mut self, coefs: [i16; 2]) {
        self.iir_mono = coefs;
        self.set_iir_bit(IIR_MONO_BIT, true);
        self.dirty |= ChannelFields::IIR_MONO;
    }

    pub fn iir_biquad_enable(&mut self, enable: bool) {
        self.set_iir_bit(IIR_BIQUAD_BIT, enable);
        self.dirty |= ChannelFields::IIR_BIQUAD;
    }

    pub fn iir_biquad_set_params(&mut self, coefs: [i16; 5]) {
        self.iir_biquad = coefs;
        self.set_iir_bit(IIR_BIQUAD_BIT, true);
        self.dirty |= ChannelFields::IIR_BIQUAD;
    }

    fn set_iir_bit(&mut self, bit: u8, enable: bool) {
        if enable {
            self.iir_enable |= bit;
        } else {
            self.iir_enable &= !bit;
        }
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
        self.dirty |= ChannelFields::PLAY_STATE;
    }

    /// Drop every queued buffer and start a new generation
    pub fn wavebuf_clear(&mut self) {
        self.release_queue();
        self.next_seq = 0;
        self.hw_seq = SEQ_END_OF_LIST;
        self.sample_pos = 0;
        self.playing = false;
        self.generation = self.generation.wrapping_add(1);
        self.dirty |= ChannelFields::GENERATION;
    }

    fn release_queue(&mut self) {
        for buf in self.queue.drain(..) {
            buf.set_status(WaveBufStatus::Free);
        }
        self.published = 0;
    }

    /// Append a buffer to the queue
    ///
    /// Returns the assigned sequence id, or `None` if the buffer is empty or
    /// already owned by the engine.
    pub fn wavebuf_add(&mut self, buf: Arc<WaveBuffer>) -> Option<u16> {
        if buf.sample_count() == 0 || buf.status().is_owned() {
            return None;
        }

        let mut seq = self.next_seq.wrapping_add(1);
        if seq == SEQ_END_OF_LIST {
            seq = 1;
        }
        self.next_seq = seq;

        buf.set_sequence_id(seq);
        buf.set_status(WaveBufStatus::Queued);
        self.queue.push_back(buf);
        Some(seq)
    }

    // ─────────────────────────────────────────────────────────────
    // Getters
    // ─────────────────────────────────────────────────────────────

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn interp(&self) -> InterpMode {
        self.interp
    }

    /// Playback rate as a ratio of the native rate (1.0 after reset)
    pub fn rate(&self) -> f32 {
        self.rate
    }

    pub fn mix(&self) -> [f32; MIX_LEN] {
        self.mix
    }

    pub fn adpcm_coefs(&self) -> [i16; ADPCM_COEF_LEN] {
        self.adpcm_coefs
    }

    pub fn iir_mono(&self) -> (bool, [i16; 2]) {
        (self.iir_enable & IIR_MONO_BIT != 0, self.iir_mono)
    }

    pub fn iir_biquad(&self) -> (bool, [i16; 5]) {
        (self.iir_enable & IIR_BIQUAD_BIT != 0, self.iir_biquad)
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn sample_pos(&self) -> u32 {
        self.sample_pos
    }

    /// Sequence id the coprocessor last reported as current
    pub fn wavebuf_seq(&self) -> u16 {
        self.hw_seq
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn generation(&self) -> u16 {
        self.generation
    }

    // ─────────────────────────────────────────────────────────────
    // Shared-memory exchange (sync thread only)
    // ─────────────────────────────────────────────────────────────

    fn slot_for(buf: &WaveBuffer, driver: &dyn CoprocessorDriver) -> BufferSlot {
        let adpcm = buf.adpcm();
        BufferSlot {
            address: driver.device_address(buf.data()),
            sample_count: buf.sample_count(),
            sequence_id: buf.sequence_id(),
            looping: buf.is_looping() as u8,
            has_adpcm: adpcm.is_some() as u8,
            adpcm_pred_scale: adpcm.map_or(0, |a| a.pred_scale),
            adpcm_history: adpcm.map_or([0; 2], |a| a.history),
            _pad: 0,
        }
    }

    /// Write dirty fields and newly queued buffers into `bank`
    pub fn sync(
        &mut self,
        regions: &SharedRegionTable,
        bank: Bank,
        driver: &dyn CoprocessorDriver,
    ) -> Result<(), RegionError> {
        let mut params: ChannelParams = regions.read(bank, self.id)?;
        let mut coefs = AdpcmCoefs::default();
        let mut flags = ParamFlags::empty();
        params.queued_mask = 0;

        for (field, flag, write) in SERIALIZERS {
            if self.dirty.contains(field) {
                write(self, &mut params, &mut coefs);
                flags |= flag;
            }
        }

        if self.published == 0 {
            if let Some(head) = self.queue.front() {
                params.active = Self::slot_for(head, driver);
                head.set_status(WaveBufStatus::Playing);
                flags |= ParamFlags::ACTIVE_BUFFER;
                self.published = 1;
                self.playing = true;
            }
        }

        let visible = self.queue.len().min(PIPELINE_DEPTH);
        let mut slot = 0;
        while self.published < visible && slot < QUEUE_SLOTS {
            params.queued[slot] = Self::slot_for(&self.queue[self.published], driver);
            params.queued_mask |= 1 << slot;
            self.published += 1;
            slot += 1;
        }
        if params.queued_mask != 0 {
            flags |= ParamFlags::QUEUED_BUFFERS;
        }

        params.flags = flags.bits();
        regions.write(bank, self.id, &params)?;
        if flags.contains(ParamFlags::ADPCM_COEFS) {
            regions.write(bank, self.id, &coefs)?;
        }

        self.dirty = ChannelFields::empty();
        Ok(())
    }

    /// Apply the coprocessor's status report
    pub fn readback(&mut self, status: &ChannelStatus) {
        if status.sync_count == self.last_sync_count {
            return;
        }
        self.last_sync_count = status.sync_count;

        if status.generation != self.generation {
            return;
        }
        self.hw_seq = status.current_seq;
        self.sample_pos = status.sample_pos;

        let flags = status.status_flags();
        if flags.contains(StatusFlags::BUFFERS_CHANGED) {
            self.retire_until(status.current_seq);
        }
        self.playing = flags.contains(StatusFlags::PLAYING);
    }

    /// Retire published head buffers until `current_seq` is at the head
    fn retire_until(&mut self, current_seq: u16) {
        while self.published > 0 {
            let Some(head) = self.queue.front() else { break };
            if current_seq != SEQ_END_OF_LIST && head.sequence_id() == current_seq {
                head.set_status(WaveBufStatus::Playing);
                break;
            }
            head.set_status(WaveBufStatus::Done);
            self.queue.pop_front();
            self.published -= 1;
        }
    }
}
