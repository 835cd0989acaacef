//! Common types and hardware constants

/// Number of mixer channels provided by the coprocessor firmware
pub const NUM_CHANNELS: usize = 24;

/// Number of auxiliary effect buses
pub const NUM_AUX_BUSES: usize = 2;

/// Samples produced per coprocessor frame
pub const FRAME_SAMPLES: usize = 160;

/// Native output rate of the coprocessor (Hz)
pub const SAMPLE_RATE: f32 = 32728.498;

/// Wave buffers the coprocessor can see at once: 1 active + 4 queued
pub const PIPELINE_DEPTH: usize = 5;

/// Queued slots in the channel parameter mirror (pipeline minus the active slot)
pub const QUEUE_SLOTS: usize = PIPELINE_DEPTH - 1;

/// Length of a channel's mix matrix
pub const MIX_LEN: usize = 12;

/// Number of ADPCM predictor coefficients per channel
pub const ADPCM_COEF_LEN: usize = 16;

/// Sequence id the coprocessor reports when a channel ran off the end of its queue
pub const SEQ_END_OF_LIST: u16 = 0;

/// One of the two halves of every double-buffered shared region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Bank {
    Zero = 0,
    One = 1,
}

impl Bank {
    /// Both banks, in index order
    pub const ALL: [Bank; 2] = [Bank::Zero, Bank::One];

    /// Bank selected by a frame id (id mod 2)
    #[inline]
    pub fn from_frame(frame_id: u16) -> Self {
        if frame_id & 1 == 0 {
            Bank::Zero
        } else {
            Bank::One
        }
    }

    /// The other bank
    #[inline]
    pub fn opposite(self) -> Self {
        match self {
            Bank::Zero => Bank::One,
            Bank::One => Bank::Zero,
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Sample encoding of a channel's wave buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    Pcm8,
    #[default]
    Pcm16,
    Adpcm,
}

/// Channel sample format: encoding plus mono/stereo layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleFormat {
    pub encoding: Encoding,
    pub stereo: bool,
}

impl SampleFormat {
    /// 16-bit mono PCM, the reset default
    pub const PCM16_MONO: SampleFormat = SampleFormat { encoding: Encoding::Pcm16, stereo: false };
    pub const PCM16_STEREO: SampleFormat = SampleFormat { encoding: Encoding::Pcm16, stereo: true };
    pub const PCM8_MONO: SampleFormat = SampleFormat { encoding: Encoding::Pcm8, stereo: false };
    pub const ADPCM_MONO: SampleFormat = SampleFormat { encoding: Encoding::Adpcm, stereo: false };

    /// Packed form written into the parameter mirror
    pub fn to_word(self) -> u16 {
        let encoding = match self.encoding {
            Encoding::Pcm8 => 0,
            Encoding::Pcm16 => 1,
            Encoding::Adpcm => 2,
        };
        encoding | if self.stereo { 0x10 } else { 0 }
    }
}

/// Resampler used by a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum InterpMode {
    #[default]
    Polyphase = 0,
    Linear = 1,
    None = 2,
}

/// Speaker layout the master mix is rendered for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum OutputMode {
    Mono = 0,
    #[default]
    Stereo = 1,
    Surround = 2,
}

/// How the final mix is limited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum ClippingMode {
    Hard = 0,
    #[default]
    Soft = 1,
}

/// Virtual speaker placement for surround output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum SpeakerPosition {
    #[default]
    Square = 0,
    Wide = 1,
    Num = 2,
}

/// Power-management notifications delivered to the sync thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    /// The system is about to sleep; the coprocessor must be suspended
    Sleep,
    /// The system woke up (or the application was restored)
    Wakeup,
    /// A pending sleep was cancelled; stop touching hardware until woken
    Cancel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bank_from_frame() {
        assert_eq!(Bank::from_frame(4), Bank::Zero);
        assert_eq!(Bank::from_frame(5), Bank::One);
        assert_eq!(Bank::from_frame(u16::MAX), Bank::One);
        assert_eq!(Bank::Zero.opposite(), Bank::One);
    }

    #[test]
    fn test_format_word() {
        assert_eq!(SampleFormat::PCM16_MONO.to_word(), 1);
        assert_eq!(SampleFormat::PCM16_STEREO.to_word(), 0x11);
        assert_eq!(SampleFormat::default(), SampleFormat::PCM16_MONO);
    }
}
