//! dspsync Core - keeps application audio state in step with a DSP coprocessor
//!
//! The coprocessor runs an opaque firmware component that mixes up to 24
//! channels in real time. Both sides talk through double-buffered shared
//! memory: every frame the application publishes parameters into one bank
//! while the coprocessor reports status into the other.
//!
//! ```text
//! App threads ──setters──► ChannelState / MasterState (per-object mutex)
//!                                   │
//!                                   ▼
//!                            SyncThread (one per engine)
//!                                   │ sync / readback
//!                                   ▼
//!                    SharedRegionTable (bank 0 | bank 1)
//!                                   │
//!                                   ▼
//!                          Coprocessor firmware
//! ```

pub mod channel;
pub mod config;
pub mod driver;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod loader;
pub mod master;
pub mod region;
pub mod types;

pub use dsp::{ChannelHandle, Dsp, DspBuilder, MasterHandle};
pub use error::{InitError, SyncError, SyncResult};
pub use types::*;
