//! Kernel descriptors and the per-runtime kernel arena.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::driver::FunctionHandle;

/// Execution mode of a compiled kernel, read from `<kernel>_exec_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExecMode {
    /// All threads execute the region body.
    Spmd,
    /// One master warp drives worker threads.
    Generic,
    /// Mode not read yet.
    #[default]
    Uninitialized,
}

impl ExecMode {
    /// Raw value stored in the exec-mode symbol, if any.
    #[must_use]
    pub const fn as_raw(self) -> Option<i8> {
        match self {
            Self::Spmd => Some(0),
            Self::Generic => Some(1),
            Self::Uninitialized => None,
        }
    }
}

impl TryFrom<i8> for ExecMode {
    type Error = i8;

    fn try_from(value: i8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Spmd),
            1 => Ok(Self::Generic),
            other => Err(other),
        }
    }
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spmd => f.write_str("SPMD"),
            Self::Generic => f.write_str("GENERIC"),
            Self::Uninitialized => f.write_str("NONE"),
        }
    }
}

/// Stable index of a kernel descriptor inside a [`KernelArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelHandle(usize);

impl KernelHandle {
    /// Arena index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for KernelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kernel#{}", self.0)
    }
}

/// A resolved device function plus its launch-relevant metadata.
#[derive(Debug)]
pub struct KernelDescriptor {
    device_id: usize,
    name: String,
    function: FunctionHandle,
    mode: ExecMode,
    /// Hardware max threads per block; 0 until first read.
    thread_limit: AtomicU32,
}

impl KernelDescriptor {
    /// Create a descriptor for a freshly resolved function.
    pub fn new(device_id: usize, name: impl Into<String>, function: FunctionHandle, mode: ExecMode) -> Self {
        Self {
            device_id,
            name: name.into(),
            function,
            mode,
            thread_limit: AtomicU32::new(0),
        }
    }

    /// Device that owns the function.
    pub fn device_id(&self) -> usize {
        self.device_id
    }

    /// Entry name of the kernel.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Driver function handle.
    pub fn function(&self) -> FunctionHandle {
        self.function
    }

    /// Execution mode.
    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    /// Cached hardware thread limit, if it has been read.
    pub fn cached_thread_limit(&self) -> Option<u32> {
        match self.thread_limit.load(Ordering::Acquire) {
            0 => None,
            limit => Some(limit),
        }
    }

    /// Return the cached thread limit, reading it through `query` on first use.
    ///
    /// A failed query is not cached, so the next launch asks again.
    pub fn thread_limit_or_query<E>(
        &self,
        query: impl FnOnce(FunctionHandle) -> std::result::Result<u32, E>,
    ) -> std::result::Result<u32, E> {
        if let Some(limit) = self.cached_thread_limit() {
            return Ok(limit);
        }
        let limit = query(self.function)?;
        self.thread_limit.store(limit, Ordering::Release);
        Ok(limit)
    }
}

/// Append-only storage for kernel descriptors.
///
/// Descriptors are never freed individually and the arena grows across
/// loads, so every handle stays valid for the runtime's lifetime.
#[derive(Debug, Default)]
pub struct KernelArena {
    kernels: RwLock<Vec<Arc<KernelDescriptor>>>,
}

impl KernelArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a descriptor and return its handle.
    pub fn insert(&self, descriptor: KernelDescriptor) -> KernelHandle {
        let mut kernels = self.kernels.write();
        let handle = KernelHandle(kernels.len());
        kernels.push(Arc::new(descriptor));
        handle
    }

    /// Look up a descriptor.
    pub fn get(&self, handle: KernelHandle) -> Option<Arc<KernelDescriptor>> {
        self.kernels.read().get(handle.index()).cloned()
    }

    /// Number of descriptors ever stored.
    pub fn len(&self) -> usize {
        self.kernels.read().len()
    }

    /// Returns true if no descriptor was stored yet.
    pub fn is_empty(&self) -> bool {
        self.kernels.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_mode_from_raw() {
        assert_eq!(ExecMode::try_from(0), Ok(ExecMode::Spmd));
        assert_eq!(ExecMode::try_from(1), Ok(ExecMode::Generic));
        assert_eq!(ExecMode::try_from(7), Err(7));
        assert_eq!(ExecMode::try_from(-1), Err(-1));
        assert_eq!(ExecMode::Generic.as_raw(), Some(1));
        assert_eq!(ExecMode::default(), ExecMode::Uninitialized);
        assert_eq!(ExecMode::Uninitialized.to_string(), "NONE");
    }

    #[test]
    fn test_arena_handles_are_distinct_and_stable() {
        let arena = KernelArena::new();
        assert!(arena.is_empty());

        let a = arena.insert(KernelDescriptor::new(0, "a", FunctionHandle(10), ExecMode::Spmd));
        let b = arena.insert(KernelDescriptor::new(1, "b", FunctionHandle(20), ExecMode::Generic));
        assert_ne!(a, b);
        assert_eq!(arena.len(), 2);

        let desc = arena.get(b).unwrap();
        assert_eq!(desc.name(), "b");
        assert_eq!(desc.device_id(), 1);
        assert_eq!(desc.function(), FunctionHandle(20));
        assert_eq!(desc.mode(), ExecMode::Generic);

        assert_eq!(arena.get(a).unwrap().name(), "a");
        assert!(arena.get(KernelHandle(99)).is_none());
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_handle_index_covers_full_arena_range() {
        let arena = KernelArena::new();
        let first = arena.insert(KernelDescriptor::new(0, "k", FunctionHandle(1), ExecMode::Spmd));
        assert_eq!(first.index(), 0);

        // Past u32::MAX the index must not alias an earlier slot.
        let far = KernelHandle(u32::MAX as usize + 1);
        assert_eq!(far.index(), 4_294_967_296);
        assert_ne!(far, first);
        assert!(arena.get(far).is_none());
        assert_eq!(far.to_string(), "kernel#4294967296");
    }

    #[test]
    fn test_thread_limit_cached_after_success_only() {
        let desc = KernelDescriptor::new(0, "k", FunctionHandle(1), ExecMode::Spmd);
        assert_eq!(desc.cached_thread_limit(), None);

        let failed: std::result::Result<u32, &str> = desc.thread_limit_or_query(|_| Err("boom"));
        assert!(failed.is_err());
        assert_eq!(desc.cached_thread_limit(), None);

        let limit: std::result::Result<u32, &str> = desc.thread_limit_or_query(|f| {
            assert_eq!(f, FunctionHandle(1));
            Ok(640)
        });
        assert_eq!(limit, Ok(640));

        let cached: std::result::Result<u32, &str> =
            desc.thread_limit_or_query(|_| panic!("limit should be cached"));
        assert_eq!(cached, Ok(640));
    }
}
