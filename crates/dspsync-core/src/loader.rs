//! Firmware component acquisition and upload
//!
//! The firmware image either comes from the application ([`ComponentLoader::load_from`])
//! or is discovered: each configured file path is tried in order, then the
//! host-supplied [`FirmwareSource`].

use std::path::{Path, PathBuf};

use crate::driver::{BankMasks, CoprocessorDriver};
use crate::error::{InitError, LoaderError};

/// Somewhere a firmware image can be fetched from
pub trait FirmwareSource: Send {
    fn try_get_blob(&self) -> Result<Vec<u8>, LoaderError>;
}

/// Firmware read from a file
#[derive(Debug, Clone)]
pub struct FileFirmware {
    path: PathBuf,
}

impl FileFirmware {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FirmwareSource for FileFirmware {
    fn try_get_blob(&self) -> Result<Vec<u8>, LoaderError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(LoaderError::NotFound),
            Err(e) => {
                log::warn!("ComponentLoader: Cannot read firmware {:?}: {}", self.path, e);
                Err(LoaderError::NotFound)
            }
        }
    }
}

/// Owns the firmware image between `init` and the final `exit`
pub struct ComponentLoader {
    blob: Option<Vec<u8>>,
    masks: BankMasks,
    auto_discovery: bool,
    paths: Vec<PathBuf>,
    host_source: Option<Box<dyn FirmwareSource>>,
    uploaded: bool,
}

impl ComponentLoader {
    pub fn new(paths: Vec<PathBuf>, masks: BankMasks, host_source: Option<Box<dyn FirmwareSource>>) -> Self {
        Self {
            blob: None,
            masks,
            auto_discovery: true,
            paths,
            host_source,
            uploaded: false,
        }
    }

    /// Use `blob` instead of discovering one
    pub fn load_from(&mut self, blob: Vec<u8>, masks: BankMasks) {
        self.blob = Some(blob);
        self.masks = masks;
        self.auto_discovery = false;
    }

    pub fn has_blob(&self) -> bool {
        self.blob.is_some()
    }

    pub fn masks(&self) -> BankMasks {
        self.masks
    }

    /// Make sure an image is available, discovering one if allowed
    pub fn find_and_load(&mut self) -> Result<(), LoaderError> {
        if self.blob.is_some() {
            return Ok(());
        }
        if !self.auto_discovery {
            return Err(LoaderError::NotFound);
        }

        for path in &self.paths {
            if let Some(blob) = Self::non_empty(&FileFirmware::new(path.clone())) {
                log::info!("ComponentLoader: Using firmware {:?} ({} bytes)", path, blob.len());
                self.blob = Some(blob);
                return Ok(());
            }
        }

        let host = self.host_source.as_ref().and_then(|source| Self::non_empty(source.as_ref()));
        if let Some(blob) = host {
            log::info!("ComponentLoader: Using host-supplied firmware ({} bytes)", blob.len());
            self.blob = Some(blob);
            return Ok(());
        }

        log::warn!("ComponentLoader: No firmware found in {:?} or host resources", self.paths);
        Err(LoaderError::NotFound)
    }

    fn non_empty(source: &dyn FirmwareSource) -> Option<Vec<u8>> {
        source.try_get_blob().ok().filter(|blob| !blob.is_empty())
    }

    /// Upload the image to the coprocessor
    pub fn load_into(&mut self, driver: &dyn CoprocessorDriver) -> Result<(), InitError> {
        let blob = self.blob.as_deref().ok_or(LoaderError::NotFound)?;
        driver
            .load_firmware(blob, self.masks)
            .map_err(|source| InitError::Resource { resource: "firmware upload", source })?;
        self.uploaded = true;
        log::info!("ComponentLoader: Uploaded {} bytes of firmware", blob.len());
        Ok(())
    }

    pub fn unload_from(&mut self, driver: &dyn CoprocessorDriver) {
        if !std::mem::take(&mut self.uploaded) {
            return;
        }
        if let Err(e) = driver.unload_firmware() {
            log::warn!("ComponentLoader: Failed to unload firmware: {}", e);
        }
    }

    /// Forget a discovered image; an application-provided one is kept
    pub fn release(&mut self) {
        if self.auto_discovery {
            self.blob = None;
        }
    }
}
