//! Device driver seam.
//!
//! [`DeviceDriver`] is the narrow set of driver calls the runtime needs:
//! discovery, context management, module/symbol resolution, memory and
//! kernel dispatch. Handles are plain integers so that drivers whose native
//! handles are raw pointers stay `Send + Sync` behind this trait.
//!
//! Device-touching calls (everything after `set_current`) are only reached
//! through [`crate::context::BoundDevice`], which binds the owning context
//! first.

use std::ffi::c_void;
use std::fmt;

use thiserror::Error;

use crate::config::ContextSchedule;
use crate::device::HardwareLimits;
use crate::planner::LaunchGeometry;

/// Result type for raw driver calls.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Error reported by a driver call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("driver error {code}: {message}")]
pub struct DriverError {
    /// Native driver result code (e.g. `CUresult`).
    pub code: i32,
    /// Driver-provided description.
    pub message: String,
}

impl DriverError {
    /// Create a driver error from a result code and message.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Opaque execution-context handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub u64);

/// Opaque loaded-module handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub u64);

/// Opaque device-function handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionHandle(pub u64);

/// Device-resident address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DevicePtr(u64);

impl DevicePtr {
    /// Null device pointer.
    pub const NULL: DevicePtr = DevicePtr(0);

    /// Wrap a raw device address.
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Raw device address.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true for the null address.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address offset by `bytes`.
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// Driver operations used by the offload runtime.
pub trait DeviceDriver: Send + Sync {
    /// Short driver name for logs ("cuda", "sim").
    fn name(&self) -> &str;

    /// Initialize the driver library.
    fn init(&self) -> DriverResult<()>;

    /// Number of devices visible to the driver.
    fn device_count(&self) -> DriverResult<usize>;

    /// Create an execution context on a device.
    fn create_context(&self, ordinal: usize, schedule: ContextSchedule)
        -> DriverResult<ContextHandle>;

    /// Destroy a context created by [`DeviceDriver::create_context`].
    fn destroy_context(&self, context: ContextHandle) -> DriverResult<()>;

    /// Bind a context to the calling thread.
    fn set_current(&self, context: ContextHandle) -> DriverResult<()>;

    /// Query hardware limits for a device.
    fn device_limits(&self, ordinal: usize) -> DriverResult<HardwareLimits>;

    /// Load a raw device image into a new module of the current context.
    fn module_load(&self, image: &[u8]) -> DriverResult<ModuleHandle>;

    /// Unload a module.
    fn module_unload(&self, module: ModuleHandle) -> DriverResult<()>;

    /// Resolve a global variable: device address and size in bytes.
    fn module_global(&self, module: ModuleHandle, name: &str) -> DriverResult<(DevicePtr, usize)>;

    /// Resolve a kernel function.
    fn module_function(&self, module: ModuleHandle, name: &str) -> DriverResult<FunctionHandle>;

    /// Max threads per block the function can be launched with.
    fn function_max_threads(&self, function: FunctionHandle) -> DriverResult<u32>;

    /// Allocate device memory in the current context.
    fn mem_alloc(&self, size: usize) -> DriverResult<DevicePtr>;

    /// Free device memory.
    fn mem_free(&self, ptr: DevicePtr) -> DriverResult<()>;

    /// Synchronous host-to-device copy.
    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> DriverResult<()>;

    /// Synchronous device-to-host copy.
    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> DriverResult<()>;

    /// Launch a kernel on the null stream.
    ///
    /// # Safety
    ///
    /// Every element of `params` must point to a live argument slot whose
    /// type matches the kernel signature.
    unsafe fn launch_kernel(
        &self,
        function: FunctionHandle,
        geometry: &LaunchGeometry,
        shared_mem_bytes: u32,
        params: &mut [*mut c_void],
    ) -> DriverResult<()>;
}
