//! Error types for the sync engine

use thiserror::Error;

use crate::region::RegionRole;

/// Errors reported by the coprocessor driver collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The completion signal was torn down while someone waited on it
    #[error("Completion signal has been closed")]
    SignalClosed,

    /// A driver call failed
    #[error("Driver call '{call}' failed: {reason}")]
    Call { call: &'static str, reason: String },

    /// The driver does not know a shared-memory token
    #[error("Unknown shared-memory token {0:#06x}")]
    UnknownToken(u16),
}

impl DriverError {
    /// Convenience constructor for failed driver calls
    pub fn call(call: &'static str, reason: impl Into<String>) -> Self {
        DriverError::Call { call, reason: reason.into() }
    }
}

/// Errors from shared-region access
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegionError {
    /// Access outside a view
    #[error("Access at {offset}+{len} exceeds view of {size} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    /// Record index beyond the role's element count
    #[error("{role:?} has {count} records, index {index} requested")]
    BadIndex { role: RegionRole, index: usize, count: usize },

    /// The driver handed back a view smaller than the role needs
    #[error("{role:?} needs {needed} bytes but the view holds {got}")]
    TooSmall { role: RegionRole, needed: usize, got: usize },
}

/// Errors while locating firmware
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoaderError {
    /// No source produced a firmware image
    #[error("DSP firmware component not found")]
    NotFound,
}

/// Errors that abort `init()`; all partially acquired resources are released
#[derive(Error, Debug)]
pub enum InitError {
    #[error(transparent)]
    Firmware(#[from] LoaderError),

    /// Creating or registering a driver resource failed
    #[error("Failed to set up {resource}: {source}")]
    Resource {
        resource: &'static str,
        #[source]
        source: DriverError,
    },

    /// The coprocessor answered the handshake with something unexpected
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The region table could not be built
    #[error("Invalid shared region layout: {0}")]
    Region(#[from] RegionError),

    /// The sync thread could not be started
    #[error("Failed to spawn sync thread: {0}")]
    Spawn(String),
}

/// Top-level error for engine operations
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Init(#[from] InitError),

    /// The shared-state contract with the coprocessor was broken
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Region(#[from] RegionError),
}

/// Result type for engine operations
pub type SyncResult<T> = Result<T, SyncError>;
