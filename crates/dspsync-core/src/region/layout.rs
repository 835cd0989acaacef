//! Records mirrored in coprocessor shared memory
//!
//! Every record is `#[repr(C)]` and `Pod` so it can be copied in and out of
//! a shared view as plain bytes. The layouts are padding-free by construction
//! (fields ordered by alignment, explicit `_pad` where needed).

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use super::RegionRole;
use crate::types::{ADPCM_COEF_LEN, MIX_LEN, QUEUE_SLOTS};

/// A fixed-size record bound to the region role that stores it
pub trait RegionRecord: Pod {
    const ROLE: RegionRole;
}

bitflags! {
    /// "What changed" word the coprocessor reads from a channel mirror
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ParamFlags: u32 {
        const GENERATION     = 1 << 0;
        const PLAY_STATE     = 1 << 1;
        const INTERP         = 1 << 2;
        const IIR_MONO       = 1 << 3;
        const IIR_BIQUAD     = 1 << 4;
        const RATE           = 1 << 5;
        const MIX            = 1 << 6;
        const ADPCM_COEFS    = 1 << 7;
        const FORMAT         = 1 << 8;
        const ACTIVE_BUFFER  = 1 << 9;
        const QUEUED_BUFFERS = 1 << 10;
    }
}

bitflags! {
    /// Flags in a channel status record
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusFlags: u16 {
        const PLAYING         = 1 << 0;
        const BUFFERS_CHANGED = 1 << 8;
    }
}

bitflags! {
    /// "What changed" word the coprocessor reads from the master mirror
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MasterParamFlags: u32 {
        const VOLUME              = 1 << 0;
        const OUTPUT_MODE         = 1 << 1;
        const CLIPPING_MODE       = 1 << 2;
        const OUTPUT_COUNT        = 1 << 3;
        const SURROUND_DEPTH      = 1 << 4;
        const SURROUND_POSITION   = 1 << 5;
        const SURROUND_REAR_RATIO = 1 << 6;
        const AUX_ENABLE          = 1 << 7;
        const AUX_FRONT_BYPASS    = 1 << 8;
        const AUX_VOLUME          = 1 << 9;
        const HEADPHONES          = 1 << 10;
    }
}

/// Frame ids exchanged each cycle
///
/// `published` is written by the application, `completed` by the coprocessor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct FrameCounters {
    pub published: u16,
    pub completed: u16,
}

impl FrameCounters {
    /// Byte offset of `published` within the record
    pub const PUBLISHED_OFFSET: usize = 0;
    /// Byte offset of `completed` within the record
    pub const COMPLETED_OFFSET: usize = 2;
}

impl RegionRecord for FrameCounters {
    const ROLE: RegionRole = RegionRole::FrameCounters;
}

/// One wave buffer as seen by the coprocessor
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct BufferSlot {
    pub address: u32,
    pub sample_count: u32,
    pub sequence_id: u16,
    pub looping: u8,
    pub has_adpcm: u8,
    pub adpcm_pred_scale: u16,
    pub adpcm_history: [i16; 2],
    pub _pad: u16,
}

/// Per-channel parameter mirror
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct ChannelParams {
    pub flags: u32,
    pub rate: f32,
    pub mix: [f32; MIX_LEN],
    pub active: BufferSlot,
    pub queued: [BufferSlot; QUEUE_SLOTS],
    pub generation: u16,
    pub format: u16,
    /// Bit n set: `queued[n]` was written this frame
    pub queued_mask: u16,
    pub iir_mono: [i16; 2],
    pub iir_biquad: [i16; 5],
    pub interp: u8,
    /// Bit 0: one-pole filter, bit 1: biquad
    pub iir_enable: u8,
    pub paused: u8,
    pub _pad: u8,
}

impl ChannelParams {
    pub fn param_flags(&self) -> ParamFlags {
        ParamFlags::from_bits_truncate(self.flags)
    }
}

impl RegionRecord for ChannelParams {
    const ROLE: RegionRole = RegionRole::ChannelParams;
}

/// Per-channel status reported by the coprocessor
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ChannelStatus {
    pub sample_pos: u32,
    /// Bumped by the coprocessor every time it rewrites this record
    pub sync_count: u16,
    /// Reset generation the coprocessor was working on
    pub generation: u16,
    pub current_seq: u16,
    pub flags: u16,
}

impl ChannelStatus {
    pub fn status_flags(&self) -> StatusFlags {
        StatusFlags::from_bits_truncate(self.flags)
    }
}

impl RegionRecord for ChannelStatus {
    const ROLE: RegionRole = RegionRole::ChannelStatus;
}

/// ADPCM predictor coefficients for one channel
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct AdpcmCoefs {
    pub coefs: [i16; ADPCM_COEF_LEN],
}

impl RegionRecord for AdpcmCoefs {
    const ROLE: RegionRole = RegionRole::AdpcmCoefs;
}

/// Master mix parameter mirror
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct MasterParams {
    pub flags: u32,
    pub master_volume: f32,
    pub aux_volume: [f32; 2],
    pub output_mode: u16,
    pub clipping_mode: u16,
    pub output_count: u16,
    pub surround_depth: u16,
    pub surround_position: u16,
    pub surround_rear_ratio: u16,
    pub aux_enable: [u8; 2],
    pub aux_front_bypass: [u8; 2],
    pub headphones: u8,
    pub _pad: [u8; 3],
}

impl MasterParams {
    pub fn param_flags(&self) -> MasterParamFlags {
        MasterParamFlags::from_bits_truncate(self.flags)
    }
}

impl RegionRecord for MasterParams {
    const ROLE: RegionRole = RegionRole::MasterParams;
}
