//! Error types for the offload runtime.

use std::fmt;

use thiserror::Error;

use crate::driver::{DevicePtr, DriverError};
use crate::kernel::KernelHandle;

/// Result type alias for offload operations.
pub type Result<T> = std::result::Result<T, OffloadError>;

/// Direction of a host/device copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    /// Host to device (copy-in / submit).
    HostToDevice,
    /// Device to host (copy-out / retrieve).
    DeviceToHost,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HostToDevice => f.write_str("host to device"),
            Self::DeviceToHost => f.write_str("device to host"),
        }
    }
}

/// Errors raised by the offload runtime.
#[derive(Error, Debug)]
pub enum OffloadError {
    /// The device driver could not be loaded or initialized.
    #[error("Device driver unavailable: {0}")]
    DriverUnavailable(String),

    /// Device id outside `[0, device_count)`.
    #[error("Device {device} out of range ({count} devices)")]
    DeviceIndexOutOfRange {
        /// Requested device id.
        device: usize,
        /// Number of devices known to the runtime.
        count: usize,
    },

    /// Device has no context yet; `init_device` was not called or failed.
    #[error("Device {0} is not initialized")]
    DeviceNotInitialized(usize),

    /// Binding the device context as current failed.
    #[error("Failed to bind context for device {device}: {source}")]
    ContextBindFailure {
        /// Device id.
        device: usize,
        /// Underlying driver error.
        source: DriverError,
    },

    /// Image rejected by the image validator.
    #[error("Incompatible device image: {0}")]
    ImageIncompatible(String),

    /// The driver refused to load the image into a module.
    #[error("Failed to load module on device {device}: {source}")]
    ModuleLoad {
        /// Device id.
        device: usize,
        /// Underlying driver error.
        source: DriverError,
    },

    /// A global or function symbol was missing or size-mismatched.
    #[error("Failed to resolve symbol '{symbol}' on device {device}: {reason}")]
    SymbolResolution {
        /// Device id.
        device: usize,
        /// Symbol name.
        symbol: String,
        /// Human-readable reason, including sizes when relevant.
        reason: String,
    },

    /// `<kernel>_exec_mode` holds a value other than 0 (SPMD) or 1 (GENERIC).
    #[error("Invalid exec mode {value} in '{symbol}' on device {device} (expected 0 or 1)")]
    ExecModeOutOfRange {
        /// Device id.
        device: usize,
        /// Exec-mode symbol name.
        symbol: String,
        /// Value read from the device.
        value: i8,
    },

    /// Device allocation failed.
    #[error("Failed to allocate {size} bytes on device {device}: {source}")]
    AllocationFailure {
        /// Device id.
        device: usize,
        /// Requested size in bytes.
        size: usize,
        /// Underlying driver error.
        source: DriverError,
    },

    /// Host/device copy failed. Frees report [`OffloadError::ReleaseFailure`].
    #[error(
        "Data transfer {direction} failed on device {device} \
         (host = 0x{host_addr:016x}, device = {device_addr}, size = {size}): {source}"
    )]
    DataTransferFailure {
        /// Device id.
        device: usize,
        /// Copy direction.
        direction: TransferDirection,
        /// Host buffer address.
        host_addr: usize,
        /// Device buffer address.
        device_addr: DevicePtr,
        /// Bytes requested.
        size: usize,
        /// Underlying driver error.
        source: DriverError,
    },

    /// Releasing device memory failed.
    #[error("Failed to free {ptr} on device {device}: {source}")]
    ReleaseFailure {
        /// Device id.
        device: usize,
        /// Device pointer passed to release.
        ptr: DevicePtr,
        /// Underlying driver error.
        source: DriverError,
    },

    /// Kernel dispatch failed.
    #[error("Launch of '{kernel}' failed on device {device}: {source}")]
    LaunchFailure {
        /// Device id.
        device: usize,
        /// Kernel entry name.
        kernel: String,
        /// Underlying driver error.
        source: DriverError,
    },

    /// Kernel handle unknown to the arena or owned by another device.
    #[error("Invalid kernel handle {handle:?} for device {device}")]
    InvalidKernelHandle {
        /// Device id.
        device: usize,
        /// Offending handle.
        handle: KernelHandle,
    },

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl OffloadError {
    /// Returns true for failures that abort a whole `load_binary` call.
    pub fn is_load_failure(&self) -> bool {
        matches!(
            self,
            Self::ImageIncompatible(_)
                | Self::ModuleLoad { .. }
                | Self::SymbolResolution { .. }
                | Self::ExecModeOutOfRange { .. }
        )
    }

    /// Returns the device id the error refers to, if any.
    pub fn device(&self) -> Option<usize> {
        match self {
            Self::DeviceIndexOutOfRange { device, .. }
            | Self::ContextBindFailure { device, .. }
            | Self::ModuleLoad { device, .. }
            | Self::SymbolResolution { device, .. }
            | Self::ExecModeOutOfRange { device, .. }
            | Self::AllocationFailure { device, .. }
            | Self::DataTransferFailure { device, .. }
            | Self::ReleaseFailure { device, .. }
            | Self::LaunchFailure { device, .. }
            | Self::InvalidKernelHandle { device, .. } => Some(*device),
            Self::DeviceNotInitialized(device) => Some(*device),
            Self::DriverUnavailable(_)
            | Self::ImageIncompatible(_)
            | Self::InvalidConfig(_) => None,
        }
    }
}
