//! Frame id sequencing

use crate::types::Bank;

/// Id published first by the bootstrap handshake
pub const FIRST_FRAME_ID: u16 = 4;

/// Ids 0 and 1 are reserved by the firmware; a wrap restarts here
const WRAP_FRAME_ID: u16 = 2;

/// Monotonic 16-bit frame id; the live bank is `id % 2`
///
/// Skipping both reserved values keeps the parity alternation intact across
/// the wrap (65535 is odd, 2 is even).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCounter {
    id: u16,
}

impl FrameCounter {
    pub fn new() -> Self {
        Self { id: FIRST_FRAME_ID }
    }

    #[cfg(test)]
    pub(crate) fn starting_at(id: u16) -> Self {
        Self { id }
    }

    #[inline]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Bank the application writes into this cycle
    #[inline]
    pub fn live_bank(&self) -> Bank {
        Bank::from_frame(self.id)
    }

    pub fn advance(&mut self) {
        let next = self.id.wrapping_add(1);
        self.id = if next < WRAP_FRAME_ID { WRAP_FRAME_ID } else { next };
    }
}

impl Default for FrameCounter {
    fn default() -> Self {
        Self::new()
    }
}
