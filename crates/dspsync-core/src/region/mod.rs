//! Typed access to double-buffered coprocessor shared memory
//!
//! During the bootstrap handshake the coprocessor hands out one token per
//! region role. The driver turns each token into two views (bank 0 and
//! bank 1). [`SharedRegionTable`] keeps those views and is the only way the
//! engine touches shared memory: every access names a role, a bank and a
//! record index, and is bounds-checked against the role's layout.

mod layout;

pub use layout::{
    AdpcmCoefs, BufferSlot, ChannelParams, ChannelStatus, FrameCounters, MasterParams,
    MasterParamFlags, ParamFlags, RegionRecord, StatusFlags,
};

use std::mem::size_of;
use std::sync::Arc;

use crate::driver::CoprocessorDriver;
use crate::error::{DriverError, InitError, RegionError};
use crate::types::{Bank, FRAME_SAMPLES, NUM_AUX_BUSES, NUM_CHANNELS};

/// Bytes of one captured frame (stereo i16)
pub const CAPTURE_FRAME_BYTES: usize = FRAME_SAMPLES * 2 * size_of::<i16>();

/// Bytes of one aux bus frame (4 channels of i32)
pub const AUX_FRAME_BYTES: usize = FRAME_SAMPLES * 4 * size_of::<i32>();

/// Size of the opaque coprocessor state saved across sleep
pub const INTERNAL_STATE_BYTES: usize = 256;

/// Memory shared with the coprocessor
///
/// Implementations must tolerate the other processor touching the same
/// bytes concurrently; the frame handshake decides who owns which bank.
pub trait SharedMemory: Send + Sync {
    /// Total size in bytes
    fn size(&self) -> usize;
    /// Copy `dst.len()` bytes starting at `offset` into `dst`
    fn load(&self, offset: usize, dst: &mut [u8]);
    /// Copy `src` into memory starting at `offset`
    fn store(&self, offset: usize, src: &[u8]);
}

/// A bounds-checked window into shared memory
#[derive(Clone)]
pub struct SharedView {
    memory: Arc<dyn SharedMemory>,
    offset: usize,
    len: usize,
}

impl SharedView {
    /// Create a view of `len` bytes at `offset`
    pub fn new(memory: Arc<dyn SharedMemory>, offset: usize, len: usize) -> Result<Self, RegionError> {
        let size = memory.size();
        if offset.checked_add(len).map_or(true, |end| end > size) {
            return Err(RegionError::OutOfBounds { offset, len, size });
        }
        Ok(Self { memory, offset, len })
    }

    /// View from `offset` to the end of the memory
    pub fn to_end(memory: Arc<dyn SharedMemory>, offset: usize) -> Result<Self, RegionError> {
        let len = memory.size().saturating_sub(offset);
        Self::new(memory, offset, len)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Shrink the view to its first `len` bytes
    fn narrow(&self, len: usize) -> Result<Self, RegionError> {
        if len > self.len {
            return Err(RegionError::OutOfBounds { offset: 0, len, size: self.len });
        }
        Ok(Self { memory: Arc::clone(&self.memory), offset: self.offset, len })
    }

    fn check(&self, at: usize, len: usize) -> Result<(), RegionError> {
        match at.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(RegionError::OutOfBounds { offset: at, len, size: self.len }),
        }
    }

    pub fn read(&self, at: usize, dst: &mut [u8]) -> Result<(), RegionError> {
        self.check(at, dst.len())?;
        self.memory.load(self.offset + at, dst);
        Ok(())
    }

    pub fn write(&self, at: usize, src: &[u8]) -> Result<(), RegionError> {
        self.check(at, src.len())?;
        self.memory.store(self.offset + at, src);
        Ok(())
    }
}

impl std::fmt::Debug for SharedView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedView")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// What a shared region holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionRole {
    FrameCounters,
    ChannelParams,
    ChannelStatus,
    AdpcmCoefs,
    MasterParams,
    Capture,
    AuxBuffers,
    InternalState,
}

impl RegionRole {
    /// All roles, in the order the coprocessor reports their tokens
    pub const ALL: [RegionRole; 8] = [
        RegionRole::FrameCounters,
        RegionRole::ChannelParams,
        RegionRole::ChannelStatus,
        RegionRole::AdpcmCoefs,
        RegionRole::MasterParams,
        RegionRole::Capture,
        RegionRole::AuxBuffers,
        RegionRole::InternalState,
    ];

    pub const COUNT: usize = Self::ALL.len();

    /// Bytes per record
    pub const fn element_size(self) -> usize {
        match self {
            RegionRole::FrameCounters => size_of::<FrameCounters>(),
            RegionRole::ChannelParams => size_of::<ChannelParams>(),
            RegionRole::ChannelStatus => size_of::<ChannelStatus>(),
            RegionRole::AdpcmCoefs => size_of::<AdpcmCoefs>(),
            RegionRole::MasterParams => size_of::<MasterParams>(),
            RegionRole::Capture => CAPTURE_FRAME_BYTES,
            RegionRole::AuxBuffers => AUX_FRAME_BYTES,
            RegionRole::InternalState => INTERNAL_STATE_BYTES,
        }
    }

    /// Records per bank
    pub const fn element_count(self) -> usize {
        match self {
            RegionRole::ChannelParams | RegionRole::ChannelStatus | RegionRole::AdpcmCoefs => {
                NUM_CHANNELS
            }
            RegionRole::AuxBuffers => NUM_AUX_BUSES,
            _ => 1,
        }
    }

    /// Bytes per bank
    pub const fn size(self) -> usize {
        self.element_size() * self.element_count()
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Role-keyed, double-buffered views into coprocessor memory
///
/// Built once by the bootstrap handshake; afterwards only the bank selection
/// changes (and that lives in the frame counter, not here).
#[derive(Debug, Clone)]
pub struct SharedRegionTable {
    views: Vec<[SharedView; 2]>,
}

impl SharedRegionTable {
    /// Resolve one token per role (in [`RegionRole::ALL`] order) through the driver
    pub fn from_tokens(tokens: &[u16], driver: &dyn CoprocessorDriver) -> Result<Self, InitError> {
        Self::build(tokens, |token, bank| driver.convert_shared_token(token, bank))
    }

    /// Resolve tokens with an arbitrary converter
    pub(crate) fn build<F>(tokens: &[u16], mut convert: F) -> Result<Self, InitError>
    where
        F: FnMut(u16, Bank) -> Result<SharedView, DriverError>,
    {
        if tokens.len() < RegionRole::COUNT {
            return Err(InitError::Handshake(format!(
                "expected {} region tokens, coprocessor reported {}",
                RegionRole::COUNT,
                tokens.len()
            )));
        }

        let mut views = Vec::with_capacity(RegionRole::COUNT);
        for (&role, &token) in RegionRole::ALL.iter().zip(tokens) {
            let bank0 = Self::resolve(&mut convert, role, token, Bank::Zero)?;
            let bank1 = Self::resolve(&mut convert, role, token, Bank::One)?;
            views.push([bank0, bank1]);
        }

        Ok(Self { views })
    }

    fn resolve<F>(convert: &mut F, role: RegionRole, token: u16, bank: Bank) -> Result<SharedView, InitError>
    where
        F: FnMut(u16, Bank) -> Result<SharedView, DriverError>,
    {
        let view = convert(token, bank)
            .map_err(|source| InitError::Resource { resource: "shared region view", source })?;
        if view.len() < role.size() {
            return Err(RegionError::TooSmall { role, needed: role.size(), got: view.len() }.into());
        }
        Ok(view.narrow(role.size())?)
    }

    /// The view holding `role` in `bank`
    pub fn view(&self, role: RegionRole, bank: Bank) -> &SharedView {
        &self.views[role.index()][bank.index()]
    }

    fn record_offset(role: RegionRole, index: usize) -> Result<usize, RegionError> {
        let count = role.element_count();
        if index >= count {
            return Err(RegionError::BadIndex { role, index, count });
        }
        Ok(index * role.element_size())
    }

    /// Read record `index` of `T`'s role from `bank`
    pub fn read<T: RegionRecord>(&self, bank: Bank, index: usize) -> Result<T, RegionError> {
        let at = Self::record_offset(T::ROLE, index)?;
        let mut value = T::zeroed();
        self.view(T::ROLE, bank).read(at, bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }

    /// Write record `index` of `T`'s role into `bank`
    pub fn write<T: RegionRecord>(&self, bank: Bank, index: usize, value: &T) -> Result<(), RegionError> {
        let at = Self::record_offset(T::ROLE, index)?;
        self.view(T::ROLE, bank).write(at, bytemuck::bytes_of(value))
    }

    /// Write a single u16 field of a record without touching its neighbours
    ///
    /// Used where the two processors own different fields of the same record.
    pub fn write_u16<T: RegionRecord>(
        &self,
        bank: Bank,
        index: usize,
        field_offset: usize,
        value: u16,
    ) -> Result<(), RegionError> {
        let at = Self::record_offset(T::ROLE, index)?;
        if field_offset + size_of::<u16>() > size_of::<T>() {
            return Err(RegionError::OutOfBounds { offset: field_offset, len: 2, size: size_of::<T>() });
        }
        self.view(T::ROLE, bank).write(at + field_offset, &value.to_ne_bytes())
    }

    /// Copy of one raw record (used for capture, aux and state blobs)
    pub fn read_bytes(&self, role: RegionRole, bank: Bank, index: usize) -> Result<Vec<u8>, RegionError> {
        let at = Self::record_offset(role, index)?;
        let mut bytes = vec![0u8; role.element_size()];
        self.view(role, bank).read(at, &mut bytes)?;
        Ok(bytes)
    }

    /// Overwrite one raw record; `bytes` must be exactly one record long
    pub fn write_bytes(&self, role: RegionRole, bank: Bank, index: usize, bytes: &[u8]) -> Result<(), RegionError> {
        let at = Self::record_offset(role, index)?;
        if bytes.len() != role.element_size() {
            return Err(RegionError::OutOfBounds { offset: at, len: bytes.len(), size: role.element_size() });
        }
        self.view(role, bank).write(at, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::loopback::LoopbackMemory;

    #[test]
    fn test_view_bounds() {
        let memory: Arc<dyn SharedMemory> = Arc::new(LoopbackMemory::new(64));
        assert!(SharedView::new(Arc::clone(&memory), 60, 8).is_err());

        let view = SharedView::new(memory, 16, 16).unwrap();
        let mut buf = [0u8; 4];
        assert!(view.write(12, &[1, 2, 3, 4]).is_ok());
        assert!(view.read(12, &mut buf).is_ok());
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(
            view.read(14, &mut buf),
            Err(RegionError::OutOfBounds { offset: 14, len: 4, size: 16 })
        );
    }

    #[test]
    fn test_role_sizes() {
        assert_eq!(RegionRole::ChannelParams.size(), 180 * NUM_CHANNELS);
        assert_eq!(RegionRole::AuxBuffers.size(), AUX_FRAME_BYTES * 2);
        assert_eq!(RegionRole::FrameCounters.element_count(), 1);
    }
}
