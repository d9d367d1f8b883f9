//! Optional callbacks into the host runtime.

use crate::device::DeviceCapabilities;
use crate::planner::LaunchGeometry;

/// Callbacks the host runtime may provide.
///
/// Every method has a no-op default, so an implementation only overrides
/// what it observes. Callbacks run synchronously on the calling thread.
pub trait HostHooks: Send + Sync {
    /// Called once after a device context is created and its capabilities derived.
    fn on_device_initialize(&self, _device_id: usize, _caps: &DeviceCapabilities) {}

    /// Called before a kernel is dispatched.
    fn on_target_submit(&self, _device_id: usize, _kernel: &str, _geometry: &LaunchGeometry) {}

    /// Called after a dispatch returns, with its outcome.
    fn on_target_complete(&self, _device_id: usize, _kernel: &str, _ok: bool) {}

    /// Host-side thread limit, if the host runtime defines one.
    fn thread_limit(&self) -> Option<u32> {
        None
    }

    /// Host-side max thread count, if the host runtime defines one.
    fn max_threads(&self) -> Option<u32> {
        None
    }
}

/// Hooks used when the host registered none.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl HostHooks for NoHooks {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_hooks_defaults() {
        let hooks = NoHooks;
        assert_eq!(hooks.thread_limit(), None);
        assert_eq!(hooks.max_threads(), None);
        hooks.on_target_complete(0, "k", true);
    }
}
