//! Device registry and context management.
//!
//! [`ContextManager`] owns the driver, one context per initialized device
//! and the capabilities derived when that context was created. Device
//! operations go through [`BoundDevice`], a guard obtained from
//! [`ContextManager::bind`] that makes the device context current first.

use std::ffi::c_void;

use parking_lot::RwLock;

use crate::config::{ContextSchedule, EnvOverrides};
use crate::device::DeviceCapabilities;
use crate::driver::{
    ContextHandle, DeviceDriver, DevicePtr, DriverError, DriverResult, FunctionHandle,
    ModuleHandle,
};
use crate::error::{OffloadError, Result};
use crate::planner::LaunchGeometry;

#[derive(Debug, Default, Clone, Copy)]
struct DeviceSlot {
    context: Option<ContextHandle>,
    caps: Option<DeviceCapabilities>,
}

/// Owns the driver and the per-device contexts.
pub struct ContextManager<D: DeviceDriver> {
    driver: D,
    schedule: ContextSchedule,
    slots: RwLock<Vec<DeviceSlot>>,
    /// Why discovery found no devices, when the driver itself failed.
    probe_error: Option<DriverError>,
}

impl<D: DeviceDriver> ContextManager<D> {
    /// Probe the driver and size the registry to its device count.
    ///
    /// A missing driver or a failed count degrades to zero devices.
    pub fn new(driver: D, schedule: ContextSchedule) -> Self {
        let (count, probe_error) = match driver.init().and_then(|()| driver.device_count()) {
            Ok(0) => {
                tracing::info!(driver = driver.name(), "There are no devices supporting offload");
                (0, None)
            }
            Ok(count) => {
                tracing::info!(driver = driver.name(), devices = count, "Offload driver initialized");
                (count, None)
            }
            Err(e) => {
                tracing::warn!(driver = driver.name(), error = %e, "Error when initializing driver");
                (0, Some(e))
            }
        };

        Self {
            driver,
            schedule,
            slots: RwLock::new(vec![DeviceSlot::default(); count]),
            probe_error,
        }
    }

    /// Outcome of driver discovery.
    ///
    /// Returns the device count, or `DriverUnavailable` when the driver could
    /// not be initialized. A working driver with no devices is `Ok(0)`.
    pub fn probe(&self) -> Result<usize> {
        match &self.probe_error {
            Some(e) => Err(self.unavailable(e)),
            None => Ok(self.device_count()),
        }
    }

    fn unavailable(&self, source: &DriverError) -> OffloadError {
        OffloadError::DriverUnavailable(format!("{}: {}", self.driver.name(), source))
    }

    /// Error for a device id outside the registry.
    pub(crate) fn out_of_range(&self, device_id: usize, count: usize) -> OffloadError {
        match &self.probe_error {
            Some(e) => self.unavailable(e),
            None => OffloadError::DeviceIndexOutOfRange {
                device: device_id,
                count,
            },
        }
    }

    /// Number of usable devices.
    pub fn device_count(&self) -> usize {
        self.slots.read().len()
    }

    /// Driver name, for logs.
    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }

    /// Returns true once `init_device` succeeded for `device_id`.
    pub fn is_initialized(&self, device_id: usize) -> bool {
        self.slots
            .read()
            .get(device_id)
            .is_some_and(|slot| slot.context.is_some())
    }

    /// Capabilities derived at initialization.
    pub fn capabilities(&self, device_id: usize) -> Result<DeviceCapabilities> {
        self.slot(device_id)?
            .caps
            .ok_or(OffloadError::DeviceNotInitialized(device_id))
    }

    /// Create the device context and derive its capabilities.
    ///
    /// Calling it again for an initialized device returns the existing
    /// capabilities.
    pub fn init_device(&self, device_id: usize, overrides: &EnvOverrides) -> Result<DeviceCapabilities> {
        let mut slots = self.slots.write();
        let count = slots.len();
        let slot = match slots.get_mut(device_id) {
            Some(slot) => slot,
            None => return Err(self.out_of_range(device_id, count)),
        };

        if let (Some(_), Some(caps)) = (slot.context, slot.caps) {
            tracing::debug!(device = device_id, "Device already initialized");
            return Ok(caps);
        }

        let context = self
            .driver
            .create_context(device_id, self.schedule)
            .map_err(|source| {
                tracing::warn!(device = device_id, error = %source, "Error when creating a context");
                OffloadError::ContextBindFailure {
                    device: device_id,
                    source,
                }
            })?;
        slot.context = Some(context);

        let hardware = match self.driver.device_limits(device_id) {
            Ok(limits) => Some(limits),
            Err(e) => {
                tracing::warn!(device = device_id, error = %e, "Error getting device properties");
                None
            }
        };
        let caps = DeviceCapabilities::derive(hardware.as_ref(), overrides);
        slot.caps = Some(caps);

        tracing::info!(
            device = device_id,
            blocks_per_grid = caps.blocks_per_grid,
            threads_per_block = caps.threads_per_block,
            warp_size = caps.warp_size,
            "Device initialized"
        );
        Ok(caps)
    }

    /// Bind the device context to the calling thread.
    pub fn bind(&self, device_id: usize) -> Result<BoundDevice<'_, D>> {
        let context = self
            .slot(device_id)?
            .context
            .ok_or(OffloadError::DeviceNotInitialized(device_id))?;

        self.driver.set_current(context).map_err(|source| {
            tracing::debug!(device = device_id, error = %source, "Error when setting a context");
            OffloadError::ContextBindFailure {
                device: device_id,
                source,
            }
        })?;

        Ok(BoundDevice {
            driver: &self.driver,
            device_id,
            context,
        })
    }

    fn slot(&self, device_id: usize) -> Result<DeviceSlot> {
        let slots = self.slots.read();
        slots
            .get(device_id)
            .copied()
            .ok_or_else(|| self.out_of_range(device_id, slots.len()))
    }
}

impl<D: DeviceDriver> Drop for ContextManager<D> {
    fn drop(&mut self) {
        for (device_id, slot) in self.slots.get_mut().iter_mut().enumerate() {
            if let Some(context) = slot.context.take() {
                if let Err(e) = self.driver.destroy_context(context) {
                    tracing::warn!(device = device_id, error = %e, "Error when destroying context");
                }
            }
        }
    }
}

/// A device whose context is current on this thread.
///
/// All device-touching driver calls go through this guard.
pub struct BoundDevice<'a, D: DeviceDriver> {
    driver: &'a D,
    device_id: usize,
    context: ContextHandle,
}

impl<'a, D: DeviceDriver> BoundDevice<'a, D> {
    /// Device id.
    pub fn device_id(&self) -> usize {
        self.device_id
    }

    /// Context that was made current.
    pub fn context(&self) -> ContextHandle {
        self.context
    }

    /// Load a device image into a new module.
    pub fn module_load(&self, image: &[u8]) -> DriverResult<ModuleHandle> {
        self.driver.module_load(image)
    }

    /// Unload a module.
    pub fn module_unload(&self, module: ModuleHandle) -> DriverResult<()> {
        self.driver.module_unload(module)
    }

    /// Resolve a global.
    pub fn module_global(&self, module: ModuleHandle, name: &str) -> DriverResult<(DevicePtr, usize)> {
        self.driver.module_global(module, name)
    }

    /// Resolve a function.
    pub fn module_function(&self, module: ModuleHandle, name: &str) -> DriverResult<FunctionHandle> {
        self.driver.module_function(module, name)
    }

    /// Max threads per block of a function.
    pub fn function_max_threads(&self, function: FunctionHandle) -> DriverResult<u32> {
        self.driver.function_max_threads(function)
    }

    /// Allocate device memory.
    pub fn mem_alloc(&self, size: usize) -> DriverResult<DevicePtr> {
        self.driver.mem_alloc(size)
    }

    /// Free device memory.
    pub fn mem_free(&self, ptr: DevicePtr) -> DriverResult<()> {
        self.driver.mem_free(ptr)
    }

    /// Host-to-device copy.
    pub fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> DriverResult<()> {
        self.driver.memcpy_htod(dst, src)
    }

    /// Device-to-host copy.
    pub fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> DriverResult<()> {
        self.driver.memcpy_dtoh(dst, src)
    }

    /// Launch a kernel.
    ///
    /// # Safety
    ///
    /// Same contract as [`DeviceDriver::launch_kernel`].
    pub unsafe fn launch_kernel(
        &self,
        function: FunctionHandle,
        geometry: &LaunchGeometry,
        params: &mut [*mut c_void],
    ) -> DriverResult<()> {
        // SAFETY: forwarded caller contract.
        unsafe { self.driver.launch_kernel(function, geometry, 0, params) }
    }
}
