//! # tgtrt Core
//!
//! Driver-agnostic core of a single-device offload backend.
//!
//! A host orchestrator decides *what* region to offload and with which
//! arguments; this crate decides *how* that region maps onto a device:
//!
//! - [`OffloadRuntime`] - owns device contexts, loaded modules, entry tables
//!   and kernel descriptors for one driver instance
//! - [`DeviceDriver`] - the seam to the vendor driver (CUDA lives in
//!   `tgtrt-cuda`, a host simulation in `sim` behind the `sim` feature)
//! - [`planner`] - derives grid/block geometry from device limits, kernel
//!   limits, environment overrides and per-call hints
//! - [`ImageValidator`] - machine-type compatibility check for device images
//!
//! ## Example
//!
//! ```ignore
//! use tgtrt_core::prelude::*;
//!
//! let runtime = OffloadRuntime::new(driver, RuntimeConfig::from_env());
//! runtime.init_device(0)?;
//!
//! let table = runtime.load_binary(0, &image)?;
//! let kernel = table.kernel("vector_add").expect("kernel entry");
//!
//! let ptr = runtime.alloc(0, 4096)?;
//! runtime.copy_in(0, ptr, &host_data)?;
//! runtime.run_team_region(0, kernel, &[ptr.as_u64()], 0, 0, 1 << 20)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod context;
pub mod device;
pub mod driver;
pub mod entry;
pub mod error;
pub mod hooks;
pub mod kernel;
mod loader;
pub mod memory;
pub mod planner;
pub mod runtime;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod validator;

pub use config::{ContextSchedule, EnvOverrides, RuntimeConfig, RuntimeConfigBuilder};
pub use context::{BoundDevice, ContextManager};
pub use device::{DeviceCapabilities, HardwareLimits};
pub use driver::{
    ContextHandle, DeviceDriver, DevicePtr, DriverError, DriverResult, FunctionHandle,
    ModuleHandle,
};
pub use entry::{DeviceImage, EntryAddr, EntryTableSnapshot, OffloadEntry};
pub use error::{OffloadError, Result, TransferDirection};
pub use hooks::HostHooks;
pub use kernel::{ExecMode, KernelArena, KernelDescriptor, KernelHandle};
pub use memory::AllocationStats;
pub use planner::{LaunchGeometry, LaunchRequest};
pub use runtime::OffloadRuntime;
pub use validator::{ElfMachineValidator, ImageValidator, EM_CUDA};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{EnvOverrides, RuntimeConfig, RuntimeConfigBuilder};
    pub use crate::device::DeviceCapabilities;
    pub use crate::driver::{DeviceDriver, DevicePtr};
    pub use crate::entry::{DeviceImage, EntryAddr, EntryTableSnapshot, OffloadEntry};
    pub use crate::error::{OffloadError, Result};
    pub use crate::hooks::HostHooks;
    pub use crate::kernel::{ExecMode, KernelHandle};
    pub use crate::planner::{LaunchGeometry, LaunchRequest};
    pub use crate::runtime::OffloadRuntime;
    pub use crate::validator::ImageValidator;
}
