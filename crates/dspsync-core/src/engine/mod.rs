//! Sync engine - frame protocol, power handshakes and the sync thread
//!
//! - FrameCounter: frame id sequencing and bank selection
//! - SyncEngine: handshakes with the coprocessor, frame publish/progress
//! - SharedState: channels, master mix and diagnostics shared with app threads
//! - SyncThread: state machine that runs one cycle per completion signal

mod frame;
mod shared;
mod sync_engine;
mod thread;

pub use frame::*;
pub use shared::*;
pub use sync_engine::*;
pub use thread::*;
