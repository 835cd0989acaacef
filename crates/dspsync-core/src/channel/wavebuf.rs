//! Caller-owned sample buffers queued on a channel

use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle of a wave buffer as tracked by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WaveBufStatus {
    /// Not owned by the engine; may be queued
    Free = 0,
    /// Waiting in a channel queue
    Queued = 1,
    /// The coprocessor is playing it
    Playing = 2,
    /// Played to the end; the caller may reuse it
    Done = 3,
}

impl WaveBufStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WaveBufStatus::Queued,
            2 => WaveBufStatus::Playing,
            3 => WaveBufStatus::Done,
            _ => WaveBufStatus::Free,
        }
    }

    /// Whether the engine currently owns the buffer
    pub fn is_owned(self) -> bool {
        matches!(self, WaveBufStatus::Queued | WaveBufStatus::Playing)
    }
}

/// ADPCM decoder state carried with a buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdpcmState {
    pub pred_scale: u16,
    pub history: [i16; 2],
}

/// Descriptor of a span of sample data
///
/// The bytes belong to the caller and are only ever read through the shared
/// handle. Status and sequence id are written by the engine while the buffer
/// is queued; everything else is fixed at construction.
#[derive(Debug)]
pub struct WaveBuffer {
    data: Arc<[u8]>,
    sample_count: u32,
    looping: bool,
    adpcm: Option<AdpcmState>,
    sequence_id: AtomicU16,
    status: AtomicU8,
}

impl WaveBuffer {
    pub fn new(data: Arc<[u8]>, sample_count: u32) -> Self {
        Self {
            data,
            sample_count,
            looping: false,
            adpcm: None,
            sequence_id: AtomicU16::new(0),
            status: AtomicU8::new(WaveBufStatus::Free as u8),
        }
    }

    /// Repeat the buffer until the channel is cleared
    pub fn looping(mut self) -> Self {
        self.looping = true;
        self
    }

    pub fn with_adpcm(mut self, state: AdpcmState) -> Self {
        self.adpcm = Some(state);
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    pub fn adpcm(&self) -> Option<AdpcmState> {
        self.adpcm
    }

    /// Sequence id assigned when the buffer was queued (0 if never queued)
    pub fn sequence_id(&self) -> u16 {
        self.sequence_id.load(Ordering::Acquire)
    }

    pub fn status(&self) -> WaveBufStatus {
        WaveBufStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_sequence_id(&self, id: u16) {
        self.sequence_id.store(id, Ordering::Release);
    }

    pub(crate) fn set_status(&self, status: WaveBufStatus) {
        self.status.store(status as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_is_free() {
        let buf = WaveBuffer::new(Arc::from(vec![0u8; 64]), 32).looping();
        assert_eq!(buf.status(), WaveBufStatus::Free);
        assert!(!buf.status().is_owned());
        assert!(buf.is_looping());
        assert_eq!(buf.data().len(), 64);
    }
}
