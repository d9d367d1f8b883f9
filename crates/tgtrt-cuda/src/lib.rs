//! CUDA Backend for tgtrt
//!
//! This crate provides the NVIDIA CUDA [`DeviceDriver`] for the tgtrt
//! offload runtime, built on cudarc's raw driver bindings.
//!
//! # Features
//!
//! - `cuda`: enables the real driver. Without it, [`CudaDriver`] is a stub
//!   whose `init` fails, so the runtime degrades to zero devices.
//!
//! # Requirements
//!
//! - NVIDIA GPU and driver
//! - CUDA Toolkit 11.0+ (loaded dynamically)
//!
//! # Example
//!
//! ```ignore
//! use tgtrt_core::prelude::*;
//! use tgtrt_cuda::CudaDriver;
//!
//! let runtime = OffloadRuntime::new(CudaDriver::new(), RuntimeConfig::from_env());
//! if runtime.device_count() > 0 {
//!     runtime.init_device(0)?;
//!     let table = runtime.load_binary(0, &image)?;
//! }
//! ```
//!
//! [`DeviceDriver`]: tgtrt_core::DeviceDriver

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(feature = "cuda")]
mod driver;

#[cfg(feature = "cuda")]
pub use driver::CudaDriver;

// Placeholder implementation when CUDA is not available
#[cfg(not(feature = "cuda"))]
mod stub {
    use std::ffi::c_void;

    use tgtrt_core::config::ContextSchedule;
    use tgtrt_core::driver::{
        ContextHandle, DeviceDriver, DevicePtr, DriverError, DriverResult, FunctionHandle,
        ModuleHandle,
    };
    use tgtrt_core::{HardwareLimits, LaunchGeometry};

    /// `CUDA_ERROR_NOT_INITIALIZED`.
    const NOT_INITIALIZED: i32 = 3;

    fn unavailable<T>() -> DriverResult<T> {
        Err(DriverError::new(NOT_INITIALIZED, "CUDA feature not enabled"))
    }

    /// Stub CUDA driver when the `cuda` feature is disabled.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct CudaDriver;

    impl CudaDriver {
        /// Create the stub driver.
        pub fn new() -> Self {
            Self
        }
    }

    impl DeviceDriver for CudaDriver {
        fn name(&self) -> &str {
            "cuda"
        }

        fn init(&self) -> DriverResult<()> {
            unavailable()
        }

        fn device_count(&self) -> DriverResult<usize> {
            unavailable()
        }

        fn create_context(&self, _ordinal: usize, _schedule: ContextSchedule) -> DriverResult<ContextHandle> {
            unavailable()
        }

        fn destroy_context(&self, _context: ContextHandle) -> DriverResult<()> {
            unavailable()
        }

        fn set_current(&self, _context: ContextHandle) -> DriverResult<()> {
            unavailable()
        }

        fn device_limits(&self, _ordinal: usize) -> DriverResult<HardwareLimits> {
            unavailable()
        }

        fn module_load(&self, _image: &[u8]) -> DriverResult<ModuleHandle> {
            unavailable()
        }

        fn module_unload(&self, _module: ModuleHandle) -> DriverResult<()> {
            unavailable()
        }

        fn module_global(&self, _module: ModuleHandle, _name: &str) -> DriverResult<(DevicePtr, usize)> {
            unavailable()
        }

        fn module_function(&self, _module: ModuleHandle, _name: &str) -> DriverResult<FunctionHandle> {
            unavailable()
        }

        fn function_max_threads(&self, _function: FunctionHandle) -> DriverResult<u32> {
            unavailable()
        }

        fn mem_alloc(&self, _size: usize) -> DriverResult<DevicePtr> {
            unavailable()
        }

        fn mem_free(&self, _ptr: DevicePtr) -> DriverResult<()> {
            unavailable()
        }

        fn memcpy_htod(&self, _dst: DevicePtr, _src: &[u8]) -> DriverResult<()> {
            unavailable()
        }

        fn memcpy_dtoh(&self, _dst: &mut [u8], _src: DevicePtr) -> DriverResult<()> {
            unavailable()
        }

        unsafe fn launch_kernel(
            &self,
            _function: FunctionHandle,
            _geometry: &LaunchGeometry,
            _shared_mem_bytes: u32,
            _params: &mut [*mut c_void],
        ) -> DriverResult<()> {
            unavailable()
        }
    }
}

#[cfg(not(feature = "cuda"))]
pub use stub::CudaDriver;

/// Check if CUDA is available at runtime.
///
/// This function returns false if:
/// - CUDA feature is not enabled
/// - CUDA libraries are not installed on the system
/// - No CUDA devices are present
pub fn is_cuda_available() -> bool {
    cuda_device_count() > 0
}

/// Get CUDA device count.
///
/// Returns 0 if CUDA is not available or libraries are not installed.
pub fn cuda_device_count() -> usize {
    use tgtrt_core::DeviceDriver;

    let driver = CudaDriver::new();
    // cudarc panics if CUDA libraries are not found, so we catch that
    std::panic::catch_unwind(|| driver.init().and_then(|()| driver.device_count()).unwrap_or(0))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tgtrt_core::{OffloadRuntime, RuntimeConfig};

    #[test]
    fn test_runtime_degrades_without_cuda() {
        // Always passes: with no CUDA the runtime reports zero devices,
        // otherwise it matches the driver's count.
        let runtime = OffloadRuntime::new(CudaDriver::new(), RuntimeConfig::default());
        assert_eq!(runtime.device_count(), cuda_device_count());
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_stub_reports_unavailable() {
        use tgtrt_core::DeviceDriver;

        assert!(!is_cuda_available());
        let err = CudaDriver::new().init().unwrap_err();
        assert_eq!(err.code, 3);
    }
}
