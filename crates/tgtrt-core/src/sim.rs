//! Host-simulated device driver.
//!
//! [`SimDriver`] implements [`DeviceDriver`] over host memory so the full
//! load/plan/launch pipeline can run without hardware. Images are matched by
//! their bytes against specs registered with [`SimDriver::register_image`];
//! every launch is recorded and may run a host closure standing in for the
//! kernel body.
//!
//! # Example
//!
//! ```ignore
//! use tgtrt_core::sim::{cuda_elf_stub, SimDriver, SimFunction, SimModuleSpec};
//!
//! let driver = SimDriver::with_devices(1);
//! let image = cuda_elf_stub("saxpy");
//! driver.register_image(
//!     &image,
//!     SimModuleSpec::new()
//!         .with_function(SimFunction::new("saxpy"))
//!         .with_global("saxpy_exec_mode", vec![0]),
//! );
//! ```

use std::collections::{BTreeMap, HashMap};
use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::ContextSchedule;
use crate::device::HardwareLimits;
use crate::driver::{
    ContextHandle, DeviceDriver, DevicePtr, DriverError, DriverResult, FunctionHandle,
    ModuleHandle,
};
use crate::planner::LaunchGeometry;
use crate::validator::{elf_image, EM_CUDA};

/// Invalid argument.
pub const SIM_ERROR_INVALID_VALUE: i32 = 1;
/// Out of device memory.
pub const SIM_ERROR_OUT_OF_MEMORY: i32 = 2;
/// Driver not initialized or not installed.
pub const SIM_ERROR_NOT_INITIALIZED: i32 = 3;
/// Unknown device ordinal.
pub const SIM_ERROR_INVALID_DEVICE: i32 = 101;
/// Image not registered with the simulator.
pub const SIM_ERROR_INVALID_IMAGE: i32 = 200;
/// No context is current, or the handle is unknown.
pub const SIM_ERROR_INVALID_CONTEXT: i32 = 201;
/// Unknown handle.
pub const SIM_ERROR_INVALID_HANDLE: i32 = 400;
/// Named symbol not found.
pub const SIM_ERROR_NOT_FOUND: i32 = 500;
/// Error produced by an injected fault.
pub const SIM_ERROR_INJECTED: i32 = 999;

const SIM_HEAP_BASE: u64 = 0x7000_0000_0000;
const SIM_ALIGNMENT: u64 = 256;

/// Build an image that passes the default CUDA validator.
///
/// `tag` makes images distinct so each can carry its own module spec.
#[must_use]
pub fn cuda_elf_stub(tag: &str) -> Vec<u8> {
    elf_image(EM_CUDA, tag.as_bytes())
}

/// Teardown call observed by the simulated driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimTeardown {
    /// `module_unload` succeeded.
    ModuleUnloaded(ModuleHandle),
    /// `destroy_context` succeeded.
    ContextDestroyed(ContextHandle),
}

/// One-shot fault applied to the next matching driver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimFault {
    /// `set_current` fails.
    SetCurrent,
    /// `mem_alloc` fails.
    Alloc,
    /// `memcpy_htod` fails.
    CopyIn,
    /// `memcpy_dtoh` fails.
    CopyOut,
    /// `mem_free` fails.
    Free,
    /// `launch_kernel` fails.
    Launch,
    /// `function_max_threads` fails.
    FunctionAttribute,
}

/// Configuration of one simulated device.
#[derive(Debug, Clone)]
pub struct SimDevice {
    limits: Option<HardwareLimits>,
    fail_context: bool,
    memory_limit: Option<u64>,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self {
            limits: Some(HardwareLimits::typical()),
            fail_context: false,
            memory_limit: None,
        }
    }
}

impl SimDevice {
    /// Device reporting `limits`.
    #[must_use]
    pub fn with_limits(limits: HardwareLimits) -> Self {
        Self {
            limits: Some(limits),
            ..Self::default()
        }
    }

    /// Device whose property query fails.
    #[must_use]
    pub fn without_limits() -> Self {
        Self {
            limits: None,
            ..Self::default()
        }
    }

    /// Context creation fails on this device.
    #[must_use]
    pub fn failing_context(mut self) -> Self {
        self.fail_context = true;
        self
    }

    /// Cap the bytes that may be live on this device.
    #[must_use]
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }
}

/// Host closure standing in for a kernel body.
pub type SimKernelBody = Arc<dyn Fn(&mut SimMemory, &SimLaunch) + Send + Sync>;

/// Kernel exported by a simulated module.
#[derive(Clone)]
pub struct SimFunction {
    name: String,
    max_threads: Option<u32>,
    body: Option<SimKernelBody>,
}

impl fmt::Debug for SimFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimFunction")
            .field("name", &self.name)
            .field("max_threads", &self.max_threads)
            .field("body", &self.body.is_some())
            .finish()
    }
}

impl SimFunction {
    /// Kernel with a 1024-thread limit and no body.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_threads: Some(1024),
            body: None,
        }
    }

    /// Set the hardware max threads per block.
    #[must_use]
    pub fn with_max_threads(mut self, max_threads: u32) -> Self {
        self.max_threads = Some(max_threads);
        self
    }

    /// Make the max-threads attribute query fail.
    #[must_use]
    pub fn without_max_threads(mut self) -> Self {
        self.max_threads = None;
        self
    }

    /// Run `body` on every launch.
    #[must_use]
    pub fn with_body<F>(mut self, body: F) -> Self
    where
        F: Fn(&mut SimMemory, &SimLaunch) + Send + Sync + 'static,
    {
        self.body = Some(Arc::new(body));
        self
    }
}

/// Global exported by a simulated module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimGlobal {
    /// Symbol name.
    pub name: String,
    /// Initial contents; its length is the symbol size.
    pub bytes: Vec<u8>,
}

/// Symbols a registered image exports once loaded.
#[derive(Debug, Clone, Default)]
pub struct SimModuleSpec {
    functions: Vec<SimFunction>,
    globals: Vec<SimGlobal>,
}

impl SimModuleSpec {
    /// Empty module.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a kernel.
    #[must_use]
    pub fn with_function(mut self, function: SimFunction) -> Self {
        self.functions.push(function);
        self
    }

    /// Add a global with initial contents.
    #[must_use]
    pub fn with_global(mut self, name: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.globals.push(SimGlobal {
            name: name.into(),
            bytes,
        });
        self
    }

    /// Add a kernel plus its `<name>_exec_mode` byte.
    #[must_use]
    pub fn with_kernel(self, function: SimFunction, exec_mode: i8) -> Self {
        let mode_symbol = format!("{}_exec_mode", function.name);
        self.with_function(function)
            .with_global(mode_symbol, vec![exec_mode as u8])
    }
}

/// Record of one kernel dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimLaunch {
    /// Kernel name.
    pub function: String,
    /// Device the kernel ran on.
    pub device: usize,
    /// Grid/block geometry.
    pub geometry: LaunchGeometry,
    /// Dynamic shared memory in bytes.
    pub shared_mem: u32,
    /// Argument values read through the parameter pointers.
    pub args: Vec<u64>,
}

/// Simulated device memory, shared by all devices of one driver.
#[derive(Debug)]
pub struct SimMemory {
    blocks: BTreeMap<u64, (usize, Vec<u8>)>,
    next: u64,
}

impl Default for SimMemory {
    fn default() -> Self {
        Self {
            blocks: BTreeMap::new(),
            next: SIM_HEAP_BASE,
        }
    }
}

impl SimMemory {
    fn allocate(&mut self, device: usize, bytes: Vec<u8>) -> DevicePtr {
        let base = self.next;
        let len = (bytes.len() as u64).max(1);
        self.next = (base + len).div_ceil(SIM_ALIGNMENT) * SIM_ALIGNMENT;
        self.blocks.insert(base, (device, bytes));
        DevicePtr::new(base)
    }

    fn free(&mut self, ptr: DevicePtr) -> Option<Vec<u8>> {
        self.blocks.remove(&ptr.as_u64()).map(|(_, bytes)| bytes)
    }

    fn locate(&self, addr: u64, len: usize) -> Option<(u64, usize)> {
        let (&base, (_, bytes)) = self.blocks.range(..=addr).next_back()?;
        let offset = (addr - base) as usize;
        if offset.checked_add(len)? <= bytes.len() {
            Some((base, offset))
        } else {
            None
        }
    }

    /// Read `len` bytes at `ptr`; `None` if the range is not allocated.
    pub fn read(&self, ptr: DevicePtr, len: usize) -> Option<Vec<u8>> {
        let (base, offset) = self.locate(ptr.as_u64(), len)?;
        let (_, bytes) = self.blocks.get(&base)?;
        Some(bytes[offset..offset + len].to_vec())
    }

    /// Write `data` at `ptr`; returns false if the range is not allocated.
    pub fn write(&mut self, ptr: DevicePtr, data: &[u8]) -> bool {
        let Some((base, offset)) = self.locate(ptr.as_u64(), data.len()) else {
            return false;
        };
        match self.blocks.get_mut(&base) {
            Some((_, bytes)) => {
                bytes[offset..offset + data.len()].copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    /// Bytes live on `device`.
    pub fn live_bytes(&self, device: usize) -> u64 {
        self.blocks
            .values()
            .filter(|(owner, _)| *owner == device)
            .map(|(_, bytes)| bytes.len() as u64)
            .sum()
    }
}

#[derive(Debug)]
struct SimModule {
    device: usize,
    functions: HashMap<String, FunctionHandle>,
    globals: HashMap<String, (DevicePtr, usize)>,
}

#[derive(Debug)]
struct SimFunctionState {
    device: usize,
    function: SimFunction,
}

#[derive(Debug, Default)]
struct SimState {
    available: bool,
    initialized: bool,
    devices: Vec<SimDevice>,
    images: Vec<(Vec<u8>, SimModuleSpec)>,
    next_handle: u64,
    contexts: HashMap<u64, usize>,
    context_flags: HashMap<usize, u32>,
    contexts_created: usize,
    current: Option<ContextHandle>,
    bind_count: usize,
    modules: HashMap<u64, SimModule>,
    functions: HashMap<u64, SimFunctionState>,
    memory: SimMemory,
    user_allocations: HashMap<u64, usize>,
    launches: Vec<SimLaunch>,
    faults: Vec<SimFault>,
    teardown: Vec<SimTeardown>,
}

impl SimState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn take_fault(&mut self, fault: SimFault) -> DriverResult<()> {
        match self.faults.iter().position(|f| *f == fault) {
            Some(index) => {
                self.faults.remove(index);
                Err(DriverError::new(SIM_ERROR_INJECTED, "injected fault"))
            }
            None => Ok(()),
        }
    }

    fn require_init(&self) -> DriverResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(DriverError::new(SIM_ERROR_NOT_INITIALIZED, "driver not initialized"))
        }
    }

    /// Device of the current context.
    fn current_device(&self) -> DriverResult<usize> {
        self.current
            .and_then(|ctx| self.contexts.get(&ctx.0).copied())
            .ok_or_else(|| DriverError::new(SIM_ERROR_INVALID_CONTEXT, "no current context"))
    }
}

/// Cloneable handle to a simulated driver; clones share state.
#[derive(Clone, Default)]
pub struct SimDriver {
    state: Arc<Mutex<SimState>>,
}

impl fmt::Debug for SimDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimDriver")
            .field("devices", &state.devices.len())
            .field("modules", &state.modules.len())
            .field("launches", &state.launches.len())
            .finish()
    }
}

/// Builder for [`SimDriver`].
#[derive(Debug, Default)]
pub struct SimDriverBuilder {
    devices: Vec<SimDevice>,
}

impl SimDriverBuilder {
    /// Add a device.
    #[must_use]
    pub fn device(mut self, device: SimDevice) -> Self {
        self.devices.push(device);
        self
    }

    /// Build the driver.
    pub fn build(self) -> SimDriver {
        let state = SimState {
            available: true,
            devices: self.devices,
            ..SimState::default()
        };
        SimDriver {
            state: Arc::new(Mutex::new(state)),
        }
    }
}

impl SimDriver {
    /// Start building a driver.
    pub fn builder() -> SimDriverBuilder {
        SimDriverBuilder::default()
    }

    /// Driver with `count` typical devices.
    pub fn with_devices(count: usize) -> Self {
        (0..count)
            .fold(Self::builder(), |builder, _| builder.device(SimDevice::default()))
            .build()
    }

    /// Driver whose initialization fails, as if the library were missing.
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// Make `image` loadable, exporting the symbols of `spec`.
    pub fn register_image(&self, image: &[u8], spec: SimModuleSpec) {
        let mut state = self.state.lock();
        state.images.retain(|(bytes, _)| bytes.as_slice() != image);
        state.images.push((image.to_vec(), spec));
    }

    /// Fail the next call of the given kind.
    pub fn inject_fault(&self, fault: SimFault) {
        self.state.lock().faults.push(fault);
    }

    /// Context currently bound.
    pub fn current_context(&self) -> Option<ContextHandle> {
        self.state.lock().current
    }

    /// Number of successful `set_current` calls.
    pub fn bind_count(&self) -> usize {
        self.state.lock().bind_count
    }

    /// Number of contexts ever created.
    pub fn contexts_created(&self) -> usize {
        self.state.lock().contexts_created
    }

    /// Flags the context of `ordinal` was created with.
    pub fn context_flags(&self, ordinal: usize) -> Option<u32> {
        self.state.lock().context_flags.get(&ordinal).copied()
    }

    /// Contexts destroyed so far, in order.
    pub fn destroyed_contexts(&self) -> Vec<ContextHandle> {
        self.teardown_events()
            .into_iter()
            .filter_map(|event| match event {
                SimTeardown::ContextDestroyed(context) => Some(context),
                SimTeardown::ModuleUnloaded(_) => None,
            })
            .collect()
    }

    /// Modules unloaded so far, in order.
    pub fn unloaded_modules(&self) -> Vec<ModuleHandle> {
        self.teardown_events()
            .into_iter()
            .filter_map(|event| match event {
                SimTeardown::ModuleUnloaded(module) => Some(module),
                SimTeardown::ContextDestroyed(_) => None,
            })
            .collect()
    }

    /// Module unloads and context destructions, interleaved in call order.
    pub fn teardown_events(&self) -> Vec<SimTeardown> {
        self.state.lock().teardown.clone()
    }

    /// Number of modules currently loaded.
    pub fn loaded_modules(&self) -> usize {
        self.state.lock().modules.len()
    }

    /// Launches recorded so far.
    pub fn launches(&self) -> Vec<SimLaunch> {
        self.state.lock().launches.clone()
    }

    /// Read simulated device memory.
    pub fn read_memory(&self, ptr: DevicePtr, len: usize) -> Option<Vec<u8>> {
        self.state.lock().memory.read(ptr, len)
    }

    /// Write simulated device memory.
    pub fn write_memory(&self, ptr: DevicePtr, data: &[u8]) -> bool {
        self.state.lock().memory.write(ptr, data)
    }

    /// Allocations made through `mem_alloc` and not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().user_allocations.len()
    }
}

impl DeviceDriver for SimDriver {
    fn name(&self) -> &str {
        "sim"
    }

    fn init(&self) -> DriverResult<()> {
        let mut state = self.state.lock();
        if !state.available {
            return Err(DriverError::new(SIM_ERROR_NOT_INITIALIZED, "driver library not found"));
        }
        state.initialized = true;
        Ok(())
    }

    fn device_count(&self) -> DriverResult<usize> {
        let state = self.state.lock();
        state.require_init()?;
        Ok(state.devices.len())
    }

    fn create_context(&self, ordinal: usize, schedule: ContextSchedule) -> DriverResult<ContextHandle> {
        let mut state = self.state.lock();
        state.require_init()?;
        let device = state
            .devices
            .get(ordinal)
            .ok_or_else(|| DriverError::new(SIM_ERROR_INVALID_DEVICE, "invalid device ordinal"))?;
        if device.fail_context {
            return Err(DriverError::new(SIM_ERROR_OUT_OF_MEMORY, "context creation failed"));
        }

        let handle = ContextHandle(state.handle());
        state.contexts.insert(handle.0, ordinal);
        state.context_flags.insert(ordinal, schedule.flag_bits());
        state.contexts_created += 1;
        // Creating a context also makes it current.
        state.current = Some(handle);
        Ok(handle)
    }

    fn destroy_context(&self, context: ContextHandle) -> DriverResult<()> {
        let mut state = self.state.lock();
        if state.contexts.remove(&context.0).is_none() {
            return Err(DriverError::new(SIM_ERROR_INVALID_CONTEXT, "unknown context"));
        }
        if state.current == Some(context) {
            state.current = None;
        }
        state.teardown.push(SimTeardown::ContextDestroyed(context));
        Ok(())
    }

    fn set_current(&self, context: ContextHandle) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.take_fault(SimFault::SetCurrent)?;
        if !state.contexts.contains_key(&context.0) {
            return Err(DriverError::new(SIM_ERROR_INVALID_CONTEXT, "unknown context"));
        }
        state.current = Some(context);
        state.bind_count += 1;
        Ok(())
    }

    fn device_limits(&self, ordinal: usize) -> DriverResult<HardwareLimits> {
        let state = self.state.lock();
        let device = state
            .devices
            .get(ordinal)
            .ok_or_else(|| DriverError::new(SIM_ERROR_INVALID_DEVICE, "invalid device ordinal"))?;
        device
            .limits
            .ok_or_else(|| DriverError::new(SIM_ERROR_INVALID_VALUE, "device attribute query failed"))
    }

    fn module_load(&self, image: &[u8]) -> DriverResult<ModuleHandle> {
        let mut state = self.state.lock();
        let device = state.current_device()?;
        let spec = state
            .images
            .iter()
            .find(|(bytes, _)| bytes.as_slice() == image)
            .map(|(_, spec)| spec.clone())
            .ok_or_else(|| DriverError::new(SIM_ERROR_INVALID_IMAGE, "device kernel image is invalid"))?;

        let mut functions = HashMap::new();
        for function in spec.functions {
            let handle = FunctionHandle(state.handle());
            functions.insert(function.name.clone(), handle);
            state
                .functions
                .insert(handle.0, SimFunctionState { device, function });
        }

        let mut globals = HashMap::new();
        for global in spec.globals {
            let size = global.bytes.len();
            let ptr = state.memory.allocate(device, global.bytes);
            globals.insert(global.name, (ptr, size));
        }

        let handle = ModuleHandle(state.handle());
        state.modules.insert(
            handle.0,
            SimModule {
                device,
                functions,
                globals,
            },
        );
        Ok(handle)
    }

    fn module_unload(&self, module: ModuleHandle) -> DriverResult<()> {
        let mut state = self.state.lock();
        let device = state
            .modules
            .get(&module.0)
            .map(|loaded| loaded.device)
            .ok_or_else(|| DriverError::new(SIM_ERROR_INVALID_HANDLE, "unknown module"))?;
        // A module dies with its context.
        if !state.contexts.values().any(|&owner| owner == device) {
            return Err(DriverError::new(SIM_ERROR_INVALID_CONTEXT, "module context was destroyed"));
        }
        let Some(removed) = state.modules.remove(&module.0) else {
            return Err(DriverError::new(SIM_ERROR_INVALID_HANDLE, "unknown module"));
        };
        for (ptr, _) in removed.globals.values() {
            state.memory.free(*ptr);
        }
        for function in removed.functions.values() {
            state.functions.remove(&function.0);
        }
        tracing::trace!(device = removed.device, module = module.0, "Unloaded simulated module");
        state.teardown.push(SimTeardown::ModuleUnloaded(module));
        Ok(())
    }

    fn module_global(&self, module: ModuleHandle, name: &str) -> DriverResult<(DevicePtr, usize)> {
        let state = self.state.lock();
        let module = state
            .modules
            .get(&module.0)
            .ok_or_else(|| DriverError::new(SIM_ERROR_INVALID_HANDLE, "unknown module"))?;
        module
            .globals
            .get(name)
            .copied()
            .ok_or_else(|| DriverError::new(SIM_ERROR_NOT_FOUND, "named symbol not found"))
    }

    fn module_function(&self, module: ModuleHandle, name: &str) -> DriverResult<FunctionHandle> {
        let state = self.state.lock();
        let module = state
            .modules
            .get(&module.0)
            .ok_or_else(|| DriverError::new(SIM_ERROR_INVALID_HANDLE, "unknown module"))?;
        module
            .functions
            .get(name)
            .copied()
            .ok_or_else(|| DriverError::new(SIM_ERROR_NOT_FOUND, "named symbol not found"))
    }

    fn function_max_threads(&self, function: FunctionHandle) -> DriverResult<u32> {
        let mut state = self.state.lock();
        state.take_fault(SimFault::FunctionAttribute)?;
        let entry = state
            .functions
            .get(&function.0)
            .ok_or_else(|| DriverError::new(SIM_ERROR_INVALID_HANDLE, "unknown function"))?;
        entry
            .function
            .max_threads
            .ok_or_else(|| DriverError::new(SIM_ERROR_INVALID_VALUE, "function attribute query failed"))
    }

    fn mem_alloc(&self, size: usize) -> DriverResult<DevicePtr> {
        let mut state = self.state.lock();
        state.take_fault(SimFault::Alloc)?;
        let device = state.current_device()?;
        if size == 0 {
            return Err(DriverError::new(SIM_ERROR_INVALID_VALUE, "invalid argument"));
        }
        if let Some(limit) = state.devices[device].memory_limit {
            if state.memory.live_bytes(device) + size as u64 > limit {
                return Err(DriverError::new(SIM_ERROR_OUT_OF_MEMORY, "out of memory"));
            }
        }
        let ptr = state.memory.allocate(device, vec![0; size]);
        state.user_allocations.insert(ptr.as_u64(), device);
        Ok(ptr)
    }

    fn mem_free(&self, ptr: DevicePtr) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.take_fault(SimFault::Free)?;
        state.current_device()?;
        if state.user_allocations.remove(&ptr.as_u64()).is_none() {
            return Err(DriverError::new(SIM_ERROR_INVALID_VALUE, "invalid argument"));
        }
        state.memory.free(ptr);
        Ok(())
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.take_fault(SimFault::CopyIn)?;
        state.current_device()?;
        if state.memory.write(dst, src) {
            Ok(())
        } else {
            Err(DriverError::new(SIM_ERROR_INVALID_VALUE, "invalid argument"))
        }
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.take_fault(SimFault::CopyOut)?;
        state.current_device()?;
        let bytes = state
            .memory
            .read(src, dst.len())
            .ok_or_else(|| DriverError::new(SIM_ERROR_INVALID_VALUE, "invalid argument"))?;
        dst.copy_from_slice(&bytes);
        Ok(())
    }

    unsafe fn launch_kernel(
        &self,
        function: FunctionHandle,
        geometry: &LaunchGeometry,
        shared_mem_bytes: u32,
        params: &mut [*mut c_void],
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.take_fault(SimFault::Launch)?;
        let device = state.current_device()?;
        let entry = state
            .functions
            .get(&function.0)
            .ok_or_else(|| DriverError::new(SIM_ERROR_INVALID_HANDLE, "unknown function"))?;
        if entry.device != device {
            return Err(DriverError::new(SIM_ERROR_INVALID_CONTEXT, "function belongs to another context"));
        }
        if geometry.blocks == 0 || geometry.threads == 0 {
            return Err(DriverError::new(SIM_ERROR_INVALID_VALUE, "invalid launch geometry"));
        }

        let args = params
            .iter()
            // SAFETY: the caller guarantees every parameter points to a live
            // slot; the runtime passes 64-bit slots.
            .map(|&param| unsafe { *(param as *const u64) })
            .collect();

        let launch = SimLaunch {
            function: entry.function.name.clone(),
            device,
            geometry: *geometry,
            shared_mem: shared_mem_bytes,
            args,
        };
        let body = entry.function.body.clone();

        if let Some(body) = body {
            body(&mut state.memory, &launch);
        }
        state.launches.push(launch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound_driver() -> (SimDriver, ContextHandle) {
        let driver = SimDriver::with_devices(1);
        driver.init().unwrap();
        let ctx = driver.create_context(0, ContextSchedule::default()).unwrap();
        (driver, ctx)
    }

    #[test]
    fn test_unavailable_driver() {
        let driver = SimDriver::unavailable();
        assert!(driver.init().is_err());
        assert!(driver.device_count().is_err());
    }

    #[test]
    fn test_memory_round_trip_and_alignment() {
        let (driver, _) = bound_driver();
        let a = driver.mem_alloc(10).unwrap();
        let b = driver.mem_alloc(10).unwrap();
        assert_eq!(a.as_u64() % SIM_ALIGNMENT, 0);
        assert_eq!(b.as_u64() % SIM_ALIGNMENT, 0);
        assert_ne!(a, b);

        driver.memcpy_htod(a.offset(2), &[1, 2, 3]).unwrap();
        let mut out = [0u8; 5];
        driver.memcpy_dtoh(&mut out, a).unwrap();
        assert_eq!(out, [0, 0, 1, 2, 3]);

        // Out of bounds.
        assert!(driver.memcpy_htod(a.offset(8), &[0; 4]).is_err());

        driver.mem_free(a).unwrap();
        assert!(driver.mem_free(a).is_err());
        assert_eq!(driver.live_allocations(), 1);
    }

    #[test]
    fn test_module_symbols() {
        let (driver, _) = bound_driver();
        let image = cuda_elf_stub("mod");
        driver.register_image(
            &image,
            SimModuleSpec::new().with_kernel(SimFunction::new("k").with_max_threads(256), 0),
        );

        let module = driver.module_load(&image).unwrap();
        let function = driver.module_function(module, "k").unwrap();
        assert_eq!(driver.function_max_threads(function).unwrap(), 256);

        let (ptr, size) = driver.module_global(module, "k_exec_mode").unwrap();
        assert_eq!(size, 1);
        assert_eq!(driver.read_memory(ptr, 1), Some(vec![0]));

        let err = driver.module_global(module, "missing").unwrap_err();
        assert_eq!(err.code, SIM_ERROR_NOT_FOUND);

        assert!(driver.module_load(b"unregistered").is_err());

        driver.module_unload(module).unwrap();
        assert_eq!(driver.unloaded_modules(), vec![module]);
        assert_eq!(driver.loaded_modules(), 0);
    }

    #[test]
    fn test_unload_after_context_destroyed_fails() {
        let (driver, ctx) = bound_driver();
        let image = cuda_elf_stub("orphan");
        driver.register_image(&image, SimModuleSpec::new());
        let module = driver.module_load(&image).unwrap();

        driver.destroy_context(ctx).unwrap();
        let err = driver.module_unload(module).unwrap_err();
        assert_eq!(err.code, SIM_ERROR_INVALID_CONTEXT);
        assert_eq!(driver.teardown_events(), vec![SimTeardown::ContextDestroyed(ctx)]);
    }

    #[test]
    fn test_faults_are_one_shot() {
        let (driver, ctx) = bound_driver();
        driver.inject_fault(SimFault::SetCurrent);
        assert_eq!(driver.set_current(ctx).unwrap_err().code, SIM_ERROR_INJECTED);
        driver.set_current(ctx).unwrap();
        assert_eq!(driver.bind_count(), 1);
    }

    #[test]
    fn test_memory_limit() {
        let driver = SimDriver::builder()
            .device(SimDevice::default().with_memory_limit(1024))
            .build();
        driver.init().unwrap();
        driver.create_context(0, ContextSchedule::default()).unwrap();

        driver.mem_alloc(1000).unwrap();
        assert_eq!(driver.mem_alloc(100).unwrap_err().code, SIM_ERROR_OUT_OF_MEMORY);
    }

    #[test]
    fn test_ops_require_current_context() {
        let driver = SimDriver::with_devices(1);
        driver.init().unwrap();
        assert_eq!(driver.mem_alloc(8).unwrap_err().code, SIM_ERROR_INVALID_CONTEXT);
    }
}
