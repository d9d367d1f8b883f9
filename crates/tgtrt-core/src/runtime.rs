//! The orchestrator-facing offload runtime.
//!
//! # Example
//!
//! ```ignore
//! use tgtrt_core::prelude::*;
//!
//! let runtime = OffloadRuntime::new(driver, RuntimeConfig::from_env());
//! for id in 0..runtime.device_count() {
//!     runtime.init_device(id)?;
//! }
//!
//! let table = runtime.load_binary(0, &image)?;
//! let geometry = runtime.run_team_region(0, table.kernel("axpy").unwrap(), &args, 0, 0, n)?;
//! ```

use std::ffi::c_void;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::RuntimeConfig;
use crate::context::{BoundDevice, ContextManager};
use crate::device::DeviceCapabilities;
use crate::driver::{DeviceDriver, DevicePtr, ModuleHandle};
use crate::entry::{DeviceImage, EntryAddr, EntryTable, EntryTableSnapshot};
use crate::error::{OffloadError, Result, TransferDirection};
use crate::hooks::{HostHooks, NoHooks};
use crate::kernel::{KernelArena, KernelDescriptor, KernelHandle};
use crate::loader;
use crate::memory::{AllocationLedger, AllocationStats};
use crate::planner::{self, LaunchGeometry, LaunchRequest};
use crate::validator::{ElfMachineValidator, ImageValidator};

/// Per-device loader state, guarded as one unit.
#[derive(Debug, Default)]
struct DeviceTables {
    entries: EntryTable,
    modules: Vec<ModuleHandle>,
}

struct DeviceState {
    tables: RwLock<DeviceTables>,
    ledger: AllocationLedger,
}

impl DeviceState {
    fn new(device_id: usize) -> Self {
        Self {
            tables: RwLock::new(DeviceTables::default()),
            ledger: AllocationLedger::new(device_id),
        }
    }
}

/// Offload backend for one driver instance.
///
/// Dropping the runtime unloads every module, then destroys every context.
pub struct OffloadRuntime<D: DeviceDriver> {
    config: RuntimeConfig,
    validator: Box<dyn ImageValidator>,
    hooks: Arc<dyn HostHooks>,
    kernels: KernelArena,
    devices: Vec<DeviceState>,
    contexts: ContextManager<D>,
}

impl<D: DeviceDriver> OffloadRuntime<D> {
    /// Probe `driver` and build a runtime sized to its device count.
    pub fn new(driver: D, config: RuntimeConfig) -> Self {
        let contexts = ContextManager::new(driver, config.context_schedule);
        let devices = (0..contexts.device_count()).map(DeviceState::new).collect();

        Self {
            validator: Box::new(ElfMachineValidator::new(config.machine)),
            config,
            hooks: Arc::new(NoHooks),
            kernels: KernelArena::new(),
            devices,
            contexts,
        }
    }

    /// Replace the image validator.
    #[must_use]
    pub fn with_validator(mut self, validator: Box<dyn ImageValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Register host runtime callbacks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn HostHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Number of usable devices; zero when the driver is missing.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Device count, or `DriverUnavailable` if the driver failed to load.
    pub fn probe(&self) -> Result<usize> {
        self.contexts.probe()
    }

    /// Returns true if `image` targets this backend.
    pub fn is_compatible(&self, image: &[u8]) -> bool {
        self.validator.is_compatible(image)
    }

    /// Create the device context and derive its capabilities.
    ///
    /// Idempotent: a second call returns the capabilities of the first.
    pub fn init_device(&self, device_id: usize) -> Result<DeviceCapabilities> {
        if self.contexts.is_initialized(device_id) {
            return self.contexts.capabilities(device_id);
        }
        let caps = self.contexts.init_device(device_id, &self.config.overrides)?;
        self.hooks.on_device_initialize(device_id, &caps);
        Ok(caps)
    }

    /// Capabilities derived when the device was initialized.
    pub fn capabilities(&self, device_id: usize) -> Result<DeviceCapabilities> {
        self.contexts.capabilities(device_id)
    }

    /// Bind the device context to the calling thread.
    pub fn bind_current(&self, device_id: usize) -> Result<BoundDevice<'_, D>> {
        self.contexts.bind(device_id)
    }

    /// Load `image` and resolve its entries into a fresh entry table.
    ///
    /// The previous table of the device is cleared first, even if this load
    /// then fails. Modules stay loaded until the runtime is dropped.
    pub fn load_binary(&self, device_id: usize, image: &DeviceImage) -> Result<EntryTableSnapshot> {
        let device = self.contexts.bind(device_id)?;
        let state = self.device_state(device_id)?;

        let mut tables = state.tables.write();
        let generation = tables.entries.clear();
        tracing::debug!(device = device_id, generation, "Cleared offload entry table");

        if self.config.validate_on_load && !self.validator.is_compatible(&image.bytes) {
            return Err(OffloadError::ImageIncompatible(format!(
                "image of {} bytes rejected for device {}",
                image.bytes.len(),
                device_id
            )));
        }

        let module = device.module_load(&image.bytes).map_err(|source| {
            tracing::debug!(device = device_id, error = %source, "Error when loading module");
            OffloadError::ModuleLoad {
                device: device_id,
                source,
            }
        })?;
        tables.modules.push(module);
        tracing::debug!(device = device_id, entries = image.entries.len(), "Module successfully loaded");

        let resolved = loader::resolve_entries(&device, module, &self.kernels, &image.entries)?;
        Ok(tables.entries.commit(device_id, resolved))
    }

    /// Returns true if `snapshot` is still the device's current table.
    pub fn is_snapshot_current(&self, snapshot: &EntryTableSnapshot) -> bool {
        self.devices
            .get(snapshot.device_id())
            .is_some_and(|state| state.tables.read().entries.generation() == snapshot.generation())
    }

    /// Returns true if the device's current table holds an entry at `addr`.
    pub fn find_entry(&self, device_id: usize, addr: EntryAddr) -> bool {
        self.devices
            .get(device_id)
            .is_some_and(|state| state.tables.read().entries.contains(&addr))
    }

    /// Allocate `size` bytes of device memory.
    pub fn alloc(&self, device_id: usize, size: usize) -> Result<DevicePtr> {
        let device = self.contexts.bind(device_id)?;
        let state = self.device_state(device_id)?;

        let ptr = device.mem_alloc(size).map_err(|source| {
            tracing::debug!(device = device_id, size, error = %source, "Error when allocating memory");
            OffloadError::AllocationFailure {
                device: device_id,
                size,
                source,
            }
        })?;
        state.ledger.record_alloc(ptr, size);
        Ok(ptr)
    }

    /// Copy `src` from the host to `dst` on the device.
    pub fn copy_in(&self, device_id: usize, dst: DevicePtr, src: &[u8]) -> Result<()> {
        let device = self.contexts.bind(device_id)?;

        device.memcpy_htod(dst, src).map_err(|source| {
            tracing::debug!(
                device = device_id,
                "Error when copying data from host to device. Pointers: host = 0x{:016x}, device = {}, size = {}",
                src.as_ptr() as usize,
                dst,
                src.len()
            );
            OffloadError::DataTransferFailure {
                device: device_id,
                direction: TransferDirection::HostToDevice,
                host_addr: src.as_ptr() as usize,
                device_addr: dst,
                size: src.len(),
                source,
            }
        })
    }

    /// Copy `dst.len()` bytes from `src` on the device to the host.
    pub fn copy_out(&self, device_id: usize, dst: &mut [u8], src: DevicePtr) -> Result<()> {
        let device = self.contexts.bind(device_id)?;
        let host_addr = dst.as_ptr() as usize;
        let size = dst.len();

        device.memcpy_dtoh(dst, src).map_err(|source| {
            tracing::debug!(
                device = device_id,
                "Error when copying data from device to host. Pointers: host = 0x{:016x}, device = {}, size = {}",
                host_addr,
                src,
                size
            );
            OffloadError::DataTransferFailure {
                device: device_id,
                direction: TransferDirection::DeviceToHost,
                host_addr,
                device_addr: src,
                size,
                source,
            }
        })
    }

    /// Free device memory returned by [`OffloadRuntime::alloc`].
    pub fn release(&self, device_id: usize, ptr: DevicePtr) -> Result<()> {
        let device = self.contexts.bind(device_id)?;
        let state = self.device_state(device_id)?;

        device.mem_free(ptr).map_err(|source| {
            tracing::debug!(device = device_id, %ptr, error = %source, "Error when freeing memory");
            OffloadError::ReleaseFailure {
                device: device_id,
                ptr,
                source,
            }
        })?;
        state.ledger.record_release(ptr);
        Ok(())
    }

    /// Allocation counters of a device.
    pub fn allocation_stats(&self, device_id: usize) -> Result<AllocationStats> {
        Ok(self.device_state(device_id)?.ledger.stats())
    }

    /// Compute the geometry a launch of `kernel` would use.
    ///
    /// Reads (and caches) the kernel's hardware thread limit on first use.
    pub fn plan_launch(
        &self,
        device_id: usize,
        kernel: KernelHandle,
        request: &LaunchRequest,
    ) -> Result<LaunchGeometry> {
        let device = self.contexts.bind(device_id)?;
        let descriptor = self.kernel(device_id, kernel)?;
        self.plan_bound(&device, &descriptor, request)
    }

    /// Run a teams region: plan the geometry, then dispatch.
    ///
    /// Every argument is passed by pointer to its own 64-bit slot.
    pub fn run_team_region(
        &self,
        device_id: usize,
        kernel: KernelHandle,
        args: &[u64],
        teams: i32,
        thread_limit: i32,
        trip_count: u64,
    ) -> Result<LaunchGeometry> {
        let request = LaunchRequest::new(teams, thread_limit, trip_count);
        self.launch(device_id, kernel, args, &request)
    }

    /// Run a non-teams region on a single team.
    pub fn run_region(&self, device_id: usize, kernel: KernelHandle, args: &[u64]) -> Result<LaunchGeometry> {
        self.launch(device_id, kernel, args, &LaunchRequest::single())
    }

    /// Thread limit reported by the host runtime, if any.
    pub fn host_thread_limit(&self) -> Option<u32> {
        self.hooks.thread_limit()
    }

    /// Max threads reported by the host runtime, if any.
    pub fn host_max_threads(&self) -> Option<u32> {
        self.hooks.max_threads()
    }

    fn launch(
        &self,
        device_id: usize,
        kernel: KernelHandle,
        args: &[u64],
        request: &LaunchRequest,
    ) -> Result<LaunchGeometry> {
        let device = self.contexts.bind(device_id)?;
        let descriptor = self.kernel(device_id, kernel)?;
        let geometry = self.plan_bound(&device, &descriptor, request)?;

        let mut slots = args.to_vec();
        let mut params: Vec<*mut c_void> = slots
            .iter_mut()
            .map(|slot| slot as *mut u64 as *mut c_void)
            .collect();

        tracing::debug!(
            device = device_id,
            kernel = descriptor.name(),
            mode = %descriptor.mode(),
            blocks = geometry.blocks,
            threads = geometry.threads,
            "Launch kernel with {} blocks and {} threads",
            geometry.blocks,
            geometry.threads
        );

        self.hooks.on_target_submit(device_id, descriptor.name(), &geometry);
        // SAFETY: each param points into `slots`, which outlives the call and
        // holds one 64-bit value per kernel argument.
        let result = unsafe { device.launch_kernel(descriptor.function(), &geometry, &mut params) };
        self.hooks.on_target_complete(device_id, descriptor.name(), result.is_ok());

        result.map_err(|source| {
            tracing::debug!(device = device_id, kernel = descriptor.name(), error = %source, "Device kernel launch failed");
            OffloadError::LaunchFailure {
                device: device_id,
                kernel: descriptor.name().to_string(),
                source,
            }
        })?;

        tracing::debug!(device = device_id, kernel = descriptor.name(), "Launch of entry point successful");
        Ok(geometry)
    }

    fn plan_bound(
        &self,
        device: &BoundDevice<'_, D>,
        descriptor: &KernelDescriptor,
        request: &LaunchRequest,
    ) -> Result<LaunchGeometry> {
        let caps = self.contexts.capabilities(device.device_id())?;
        let kernel_limit = match descriptor.thread_limit_or_query(|f| device.function_max_threads(f)) {
            Ok(limit) => Some(limit),
            Err(e) => {
                tracing::debug!(
                    device = device.device_id(),
                    kernel = descriptor.name(),
                    error = %e,
                    "Kernel thread limit unavailable, keeping planned threads"
                );
                None
            }
        };

        Ok(planner::plan(
            &caps,
            &self.config.overrides,
            descriptor.mode(),
            kernel_limit,
            request,
        ))
    }

    fn kernel(&self, device_id: usize, handle: KernelHandle) -> Result<Arc<KernelDescriptor>> {
        self.kernels
            .get(handle)
            .filter(|descriptor| descriptor.device_id() == device_id)
            .ok_or(OffloadError::InvalidKernelHandle {
                device: device_id,
                handle,
            })
    }

    fn device_state(&self, device_id: usize) -> Result<&DeviceState> {
        self.devices
            .get(device_id)
            .ok_or_else(|| self.contexts.out_of_range(device_id, self.devices.len()))
    }
}

impl<D: DeviceDriver> Drop for OffloadRuntime<D> {
    fn drop(&mut self) {
        for (device_id, state) in self.devices.iter_mut().enumerate() {
            let modules = std::mem::take(&mut state.tables.get_mut().modules);
            if modules.is_empty() {
                continue;
            }
            let device = match self.contexts.bind(device_id) {
                Ok(device) => device,
                Err(e) => {
                    tracing::warn!(device = device_id, error = %e, "Cannot bind device to unload modules");
                    continue;
                }
            };
            for module in modules {
                if let Err(e) = device.module_unload(module) {
                    tracing::warn!(device = device_id, error = %e, "Error when unloading module");
                }
            }
        }
        tracing::debug!(driver = self.contexts.driver_name(), "Offload runtime shut down");
    }
}
