//! State shared between application threads and the sync thread

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::channel::ChannelManager;
use crate::master::MasterMixManager;

/// User hook run once per coprocessor frame on the sync thread
pub type FrameCallback = Box<dyn FnMut() + Send>;

/// Everything setters touch, plus the sync thread's diagnostics
///
/// Application threads and the sync thread hold it through an `Arc`.
pub struct SharedState {
    pub channels: ChannelManager,
    pub master: MasterMixManager,
    callback: Mutex<Option<FrameCallback>>,
    capture: Mutex<Option<rtrb::Producer<i16>>>,
    frame_count: AtomicU64,
    dropped_frames: AtomicU64,
    fault: Mutex<Option<String>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            channels: ChannelManager::new(),
            master: MasterMixManager::new(),
            callback: Mutex::new(None),
            capture: Mutex::new(None),
            frame_count: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            fault: Mutex::new(None),
        }
    }

    pub fn set_callback(&self, callback: Option<FrameCallback>) {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = callback;
    }

    /// Run the frame callback without holding its lock
    pub(crate) fn run_callback(&self) {
        let taken = self.callback.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut callback) = taken {
            callback();
            let mut slot = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(callback);
            }
        }
    }

    pub fn set_capture(&self, producer: Option<rtrb::Producer<i16>>) {
        *self.capture.lock().unwrap_or_else(PoisonError::into_inner) = producer;
    }

    /// Push one frame of output samples; returns how many did not fit
    pub(crate) fn push_capture(&self, samples: &[i16]) -> usize {
        let mut capture = self.capture.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(producer) = capture.as_mut() else {
            return 0;
        };
        for (pushed, &sample) in samples.iter().enumerate() {
            if producer.push(sample).is_err() {
                return samples.len() - pushed;
            }
        }
        0
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Relaxed)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub(crate) fn count_frames(&self, frames: u64) {
        self.frame_count.fetch_add(frames, Ordering::Relaxed);
    }

    pub(crate) fn count_dropped_frame(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Why the sync thread stopped, if it did
    pub fn fault(&self) -> Option<String> {
        self.fault.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn set_fault(&self, fault: Option<String>) {
        *self.fault.lock().unwrap_or_else(PoisonError::into_inner) = fault;
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
