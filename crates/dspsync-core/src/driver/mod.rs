//! Coprocessor driver collaborator
//!
//! The engine never talks to hardware directly. Everything it needs from the
//! platform's DSP service goes through [`CoprocessorDriver`]: signal
//! registration, the control/status word pipes, firmware loading and the
//! conversion of shared-memory tokens into local views.
//!
//! [`loopback::LoopbackDriver`] implements the trait in-process and simulates
//! the firmware's side of the frame protocol.

pub mod loopback;
mod signal;

pub use signal::CompletionSignal;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::DriverError;
use crate::region::SharedView;
use crate::types::Bank;

/// Result type for driver calls
pub type DriverResult<T> = Result<T, DriverError>;

/// Word pipes between the CPU and the coprocessor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlChannel {
    /// Lifecycle acknowledgements from the coprocessor
    Status,
    /// Lifecycle commands to the coprocessor, and the region-token reply
    Command,
}

/// Lifecycle commands understood by the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ControlWord {
    /// Cold start: clear all state and report the region tokens
    Reset = 0,
    /// Continue from the state restored into bank 0
    Resume = 1,
    /// Stop for good
    Stop = 2,
    /// Stop, keeping state that can be backed up
    Suspend = 3,
}

impl ControlWord {
    pub fn from_word(word: u16) -> Option<Self> {
        match word {
            0 => Some(ControlWord::Reset),
            1 => Some(ControlWord::Resume),
            2 => Some(ControlWord::Stop),
            3 => Some(ControlWord::Suspend),
            _ => None,
        }
    }
}

/// Status word the coprocessor sends once it has stopped touching shared memory
pub const QUIESCENT_ACK: u16 = 1;

/// Program/data memory banks the firmware may be loaded into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankMasks {
    pub program: u16,
    pub data: u16,
}

impl Default for BankMasks {
    fn default() -> Self {
        Self { program: 0xFF, data: 0xFF }
    }
}

/// Platform DSP service as seen by the engine
pub trait CoprocessorDriver: Send + Sync {
    /// Arrange for `signal` to be raised on every frame-completion interrupt
    fn register_completion_signal(&self, signal: Arc<CompletionSignal>) -> DriverResult<()>;

    /// Stop raising the registered signal
    fn unregister_completion_signal(&self) -> DriverResult<()>;

    /// Acquire the frame semaphore resource
    fn open_semaphore(&self) -> DriverResult<()>;

    /// Tell the coprocessor a new frame of parameters is ready
    fn release_semaphore(&self) -> DriverResult<()>;

    /// Give the frame semaphore back
    fn close_semaphore(&self) -> DriverResult<()>;

    /// Write one control word into a pipe
    fn send_control_word(&self, channel: ControlChannel, word: u16) -> DriverResult<()>;

    /// Non-blocking read of a pipe: `Some(word)` if the coprocessor answered
    fn poll_status(&self, channel: ControlChannel) -> DriverResult<Option<u16>>;

    /// Read exactly `count` words that the coprocessor has already queued
    fn read_words(&self, channel: ControlChannel, count: usize) -> DriverResult<Vec<u16>>;

    /// Upload a firmware image
    fn load_firmware(&self, blob: &[u8], masks: BankMasks) -> DriverResult<()>;

    /// Remove the firmware uploaded by `load_firmware`
    fn unload_firmware(&self) -> DriverResult<()>;

    /// Local view of the shared region named by `token` in `bank`
    fn convert_shared_token(&self, token: u16, bank: Bank) -> DriverResult<SharedView>;

    /// Address the coprocessor uses to reach caller-owned sample bytes
    fn device_address(&self, data: &[u8]) -> u32;

    /// Whether headphones are plugged in right now
    fn headphones_connected(&self) -> bool;
}
