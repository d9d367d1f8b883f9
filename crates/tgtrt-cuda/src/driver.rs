//! `DeviceDriver` over the raw CUDA driver API.

use std::ffi::{c_void, CString};
use std::ptr;

use cudarc::driver::sys as cuda_sys;

use tgtrt_core::config::ContextSchedule;
use tgtrt_core::driver::{
    ContextHandle, DeviceDriver, DevicePtr, DriverError, DriverResult, FunctionHandle,
    ModuleHandle,
};
use tgtrt_core::{HardwareLimits, LaunchGeometry};

/// Map a `CUresult` to a driver error tagged with the failing call.
fn check(result: cuda_sys::CUresult, op: &str) -> DriverResult<()> {
    if result == cuda_sys::CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(DriverError::new(result as i32, format!("{} failed: {:?}", op, result)))
    }
}

fn symbol_name(name: &str) -> DriverResult<CString> {
    CString::new(name).map_err(|e| {
        DriverError::new(
            cuda_sys::CUresult::CUDA_ERROR_INVALID_VALUE as i32,
            format!("invalid symbol name '{}': {}", name, e),
        )
    })
}

fn as_context(handle: ContextHandle) -> cuda_sys::CUcontext {
    handle.0 as usize as cuda_sys::CUcontext
}

fn as_module(handle: ModuleHandle) -> cuda_sys::CUmodule {
    handle.0 as usize as cuda_sys::CUmodule
}

fn as_function(handle: FunctionHandle) -> cuda_sys::CUfunction {
    handle.0 as usize as cuda_sys::CUfunction
}

/// CUDA implementation of [`DeviceDriver`].
///
/// Stateless: contexts, modules and functions are owned by the runtime
/// through the handles this driver hands out.
#[derive(Debug, Default, Clone, Copy)]
pub struct CudaDriver;

impl CudaDriver {
    /// Create the driver. Nothing is loaded until `init`.
    pub fn new() -> Self {
        Self
    }

    fn device(ordinal: usize) -> DriverResult<cuda_sys::CUdevice> {
        let mut device: cuda_sys::CUdevice = 0;
        // SAFETY: out-pointer to a local.
        let result = unsafe { cuda_sys::cuDeviceGet(&mut device, ordinal as i32) };
        check(result, "cuDeviceGet")?;
        Ok(device)
    }

    fn attribute(
        device: cuda_sys::CUdevice,
        attribute: cuda_sys::CUdevice_attribute,
    ) -> DriverResult<u32> {
        let mut value: i32 = 0;
        // SAFETY: out-pointer to a local; `device` came from cuDeviceGet.
        let result = unsafe { cuda_sys::cuDeviceGetAttribute(&mut value, attribute, device) };
        check(result, "cuDeviceGetAttribute")?;
        Ok(value.max(0) as u32)
    }
}

impl DeviceDriver for CudaDriver {
    fn name(&self) -> &str {
        "cuda"
    }

    fn init(&self) -> DriverResult<()> {
        // cudarc panics if the CUDA library cannot be loaded.
        let result = std::panic::catch_unwind(|| {
            // SAFETY: cuInit has no preconditions.
            unsafe { cuda_sys::cuInit(0) }
        })
        .map_err(|_| {
            tracing::warn!("CUDA driver library could not be loaded");
            DriverError::new(
                cuda_sys::CUresult::CUDA_ERROR_NOT_INITIALIZED as i32,
                "CUDA driver library not found",
            )
        })?;
        check(result, "cuInit")
    }

    fn device_count(&self) -> DriverResult<usize> {
        let mut count: i32 = 0;
        // SAFETY: out-pointer to a local.
        let result = unsafe { cuda_sys::cuDeviceGetCount(&mut count) };
        check(result, "cuDeviceGetCount")?;
        Ok(count.max(0) as usize)
    }

    fn create_context(
        &self,
        ordinal: usize,
        schedule: ContextSchedule,
    ) -> DriverResult<ContextHandle> {
        let device = Self::device(ordinal)?;
        let mut context: cuda_sys::CUcontext = ptr::null_mut();
        // SAFETY: out-pointer to a local; `device` is valid.
        let result = unsafe { cuda_sys::cuCtxCreate_v2(&mut context, schedule.flag_bits(), device) };
        check(result, "cuCtxCreate")?;
        tracing::debug!(ordinal, flags = schedule.flag_bits(), "Created CUDA context");
        Ok(ContextHandle(context as usize as u64))
    }

    fn destroy_context(&self, context: ContextHandle) -> DriverResult<()> {
        // SAFETY: the handle was produced by create_context and is destroyed once.
        let result = unsafe { cuda_sys::cuCtxDestroy_v2(as_context(context)) };
        check(result, "cuCtxDestroy")
    }

    fn set_current(&self, context: ContextHandle) -> DriverResult<()> {
        // SAFETY: the handle was produced by create_context.
        let result = unsafe { cuda_sys::cuCtxSetCurrent(as_context(context)) };
        check(result, "cuCtxSetCurrent")
    }

    fn device_limits(&self, ordinal: usize) -> DriverResult<HardwareLimits> {
        use cuda_sys::CUdevice_attribute::*;

        let device = Self::device(ordinal)?;
        Ok(HardwareLimits {
            max_grid_dim_x: Self::attribute(device, CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_X)?,
            max_block_dim_x: Self::attribute(device, CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_X)?,
            max_threads_per_block: Self::attribute(device, CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK)?,
            warp_size: Self::attribute(device, CU_DEVICE_ATTRIBUTE_WARP_SIZE)?,
        })
    }

    fn module_load(&self, image: &[u8]) -> DriverResult<ModuleHandle> {
        let mut module: cuda_sys::CUmodule = ptr::null_mut();
        // SAFETY: `image` stays alive for the call; no JIT options are passed.
        let result = unsafe {
            cuda_sys::cuModuleLoadDataEx(
                &mut module,
                image.as_ptr() as *const c_void,
                0,
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        check(result, "cuModuleLoadDataEx")?;
        tracing::debug!(bytes = image.len(), "Loaded CUDA module");
        Ok(ModuleHandle(module as usize as u64))
    }

    fn module_unload(&self, module: ModuleHandle) -> DriverResult<()> {
        // SAFETY: the handle was produced by module_load and is unloaded once.
        let result = unsafe { cuda_sys::cuModuleUnload(as_module(module)) };
        check(result, "cuModuleUnload")
    }

    fn module_global(&self, module: ModuleHandle, name: &str) -> DriverResult<(DevicePtr, usize)> {
        let name = symbol_name(name)?;
        let mut ptr: cuda_sys::CUdeviceptr = 0;
        let mut size: usize = 0;
        // SAFETY: out-pointers to locals; `name` is NUL-terminated.
        let result = unsafe {
            cuda_sys::cuModuleGetGlobal_v2(&mut ptr, &mut size, as_module(module), name.as_ptr())
        };
        check(result, "cuModuleGetGlobal")?;
        Ok((DevicePtr::new(ptr as u64), size))
    }

    fn module_function(&self, module: ModuleHandle, name: &str) -> DriverResult<FunctionHandle> {
        let name = symbol_name(name)?;
        let mut function: cuda_sys::CUfunction = ptr::null_mut();
        // SAFETY: out-pointer to a local; `name` is NUL-terminated.
        let result =
            unsafe { cuda_sys::cuModuleGetFunction(&mut function, as_module(module), name.as_ptr()) };
        check(result, "cuModuleGetFunction")?;
        Ok(FunctionHandle(function as usize as u64))
    }

    fn function_max_threads(&self, function: FunctionHandle) -> DriverResult<u32> {
        let mut value: i32 = 0;
        // SAFETY: out-pointer to a local; the function belongs to a loaded module.
        let result = unsafe {
            cuda_sys::cuFuncGetAttribute(
                &mut value,
                cuda_sys::CUfunction_attribute::CU_FUNC_ATTRIBUTE_MAX_THREADS_PER_BLOCK,
                as_function(function),
            )
        };
        check(result, "cuFuncGetAttribute")?;
        Ok(value.max(0) as u32)
    }

    fn mem_alloc(&self, size: usize) -> DriverResult<DevicePtr> {
        let mut ptr: cuda_sys::CUdeviceptr = 0;
        // SAFETY: out-pointer to a local.
        let result = unsafe { cuda_sys::cuMemAlloc_v2(&mut ptr, size) };
        check(result, "cuMemAlloc")?;
        Ok(DevicePtr::new(ptr as u64))
    }

    fn mem_free(&self, ptr: DevicePtr) -> DriverResult<()> {
        // SAFETY: the driver validates the address.
        let result = unsafe { cuda_sys::cuMemFree_v2(ptr.as_u64() as cuda_sys::CUdeviceptr) };
        check(result, "cuMemFree")
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> DriverResult<()> {
        // SAFETY: `src` is valid for `src.len()` bytes; the driver validates `dst`.
        let result = unsafe {
            cuda_sys::cuMemcpyHtoD_v2(
                dst.as_u64() as cuda_sys::CUdeviceptr,
                src.as_ptr() as *const c_void,
                src.len(),
            )
        };
        check(result, "cuMemcpyHtoD")
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> DriverResult<()> {
        // SAFETY: `dst` is valid for `dst.len()` bytes; the driver validates `src`.
        let result = unsafe {
            cuda_sys::cuMemcpyDtoH_v2(
                dst.as_mut_ptr() as *mut c_void,
                src.as_u64() as cuda_sys::CUdeviceptr,
                dst.len(),
            )
        };
        check(result, "cuMemcpyDtoH")
    }

    unsafe fn launch_kernel(
        &self,
        function: FunctionHandle,
        geometry: &LaunchGeometry,
        shared_mem_bytes: u32,
        params: &mut [*mut c_void],
    ) -> DriverResult<()> {
        // SAFETY: caller guarantees `params` matches the kernel signature.
        let result = unsafe {
            cuda_sys::cuLaunchKernel(
                as_function(function),
                geometry.blocks,
                1,
                1,
                geometry.threads,
                1,
                1,
                shared_mem_bytes,
                ptr::null_mut(), // null stream
                params.as_mut_ptr(),
                ptr::null_mut(),
            )
        };
        check(result, "cuLaunchKernel")
    }
}
