//! Entry resolution for a freshly loaded module.

use crate::context::BoundDevice;
use crate::driver::{DeviceDriver, ModuleHandle};
use crate::entry::{EntryAddr, OffloadEntry};
use crate::error::{OffloadError, Result};
use crate::kernel::{ExecMode, KernelArena, KernelDescriptor};

const EXEC_MODE_SUFFIX: &str = "_exec_mode";

/// Resolve `entries` against `module`, in order.
///
/// Returns the resolved table, or the first failure. Kernel descriptors
/// created before a failure stay in the arena.
pub(crate) fn resolve_entries<D: DeviceDriver>(
    device: &BoundDevice<'_, D>,
    module: ModuleHandle,
    arena: &KernelArena,
    entries: &[OffloadEntry],
) -> Result<Vec<OffloadEntry>> {
    let mut resolved = Vec::with_capacity(entries.len());

    for (index, entry) in entries.iter().enumerate() {
        if entry.addr.is_null() {
            // TODO: reject null entries once hosts stop emitting them.
            tracing::debug!(
                device = device.device_id(),
                size = entry.size,
                "Analyzing host entry '<null>'"
            );
            resolved.push(entry.clone());
            continue;
        }

        let addr = if entry.size > 0 {
            resolve_global(device, module, index, entry)?
        } else {
            resolve_kernel(device, module, arena, index, entry)?
        };

        resolved.push(OffloadEntry {
            addr,
            ..entry.clone()
        });
    }

    Ok(resolved)
}

fn resolve_global<D: DeviceDriver>(
    device: &BoundDevice<'_, D>,
    module: ModuleHandle,
    index: usize,
    entry: &OffloadEntry,
) -> Result<EntryAddr> {
    let device_id = device.device_id();
    let (ptr, size) = device.module_global(module, &entry.name).map_err(|e| {
        tracing::debug!(device = device_id, symbol = %entry.name, error = %e, "Loading global failed");
        OffloadError::SymbolResolution {
            device: device_id,
            symbol: entry.name.clone(),
            reason: e.to_string(),
        }
    })?;

    if size != entry.size {
        tracing::debug!(
            device = device_id,
            symbol = %entry.name,
            "Loading global - size mismatch ({} != {})",
            size,
            entry.size
        );
        return Err(OffloadError::SymbolResolution {
            device: device_id,
            symbol: entry.name.clone(),
            reason: format!("size mismatch: device {} bytes, host {} bytes", size, entry.size),
        });
    }

    tracing::debug!(
        device = device_id,
        "Entry point {} maps to global {} ({})",
        index,
        entry.name,
        ptr
    );
    Ok(EntryAddr::Device(ptr))
}

fn resolve_kernel<D: DeviceDriver>(
    device: &BoundDevice<'_, D>,
    module: ModuleHandle,
    arena: &KernelArena,
    index: usize,
    entry: &OffloadEntry,
) -> Result<EntryAddr> {
    let device_id = device.device_id();
    let function = device.module_function(module, &entry.name).map_err(|e| {
        tracing::debug!(device = device_id, symbol = %entry.name, error = %e, "Loading kernel failed");
        OffloadError::SymbolResolution {
            device: device_id,
            symbol: entry.name.clone(),
            reason: e.to_string(),
        }
    })?;

    tracing::debug!(
        device = device_id,
        "Entry point {} maps to {} ({:#x})",
        index,
        entry.name,
        function.0
    );

    let mode = read_exec_mode(device, module, &entry.name)?;
    let handle = arena.insert(KernelDescriptor::new(device_id, entry.name.clone(), function, mode));
    Ok(EntryAddr::Kernel(handle))
}

/// Read `<kernel>_exec_mode`; a missing symbol means GENERIC.
fn read_exec_mode<D: DeviceDriver>(
    device: &BoundDevice<'_, D>,
    module: ModuleHandle,
    kernel: &str,
) -> Result<ExecMode> {
    let device_id = device.device_id();
    let symbol = format!("{}{}", kernel, EXEC_MODE_SUFFIX);

    let (ptr, size) = match device.module_global(module, &symbol) {
        Ok(found) => found,
        Err(e) => {
            tracing::debug!(
                device = device_id,
                error = %e,
                "Loading global exec_mode '{}' - symbol missing, using default value GENERIC (1)",
                symbol
            );
            return Ok(ExecMode::Generic);
        }
    };

    if size != std::mem::size_of::<i8>() {
        tracing::debug!(
            device = device_id,
            "Loading global exec_mode '{}' - size mismatch ({} != 1)",
            symbol,
            size
        );
        return Err(OffloadError::SymbolResolution {
            device: device_id,
            symbol,
            reason: format!("exec mode must be 1 byte, found {} bytes", size),
        });
    }

    let mut raw = [0u8; 1];
    device.memcpy_dtoh(&mut raw, ptr).map_err(|e| {
        tracing::debug!(device = device_id, error = %e, "Error when copying data from device to host");
        OffloadError::SymbolResolution {
            device: device_id,
            symbol: symbol.clone(),
            reason: format!("failed to read exec mode from {}: {}", ptr, e),
        }
    })?;

    let value = raw[0] as i8;
    ExecMode::try_from(value).map_err(|value| {
        tracing::debug!(device = device_id, "Wrong exec_mode value {} in '{}'", value, symbol);
        OffloadError::ExecModeOutOfRange {
            device: device_id,
            symbol,
            value,
        }
    })
}
