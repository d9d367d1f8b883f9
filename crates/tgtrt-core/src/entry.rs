//! Offload entries and per-device entry tables.

use std::fmt;
use std::sync::Arc;

use crate::driver::DevicePtr;
use crate::kernel::KernelHandle;

/// Address slot of an offload entry.
///
/// Before loading it holds the host identity of the symbol; resolution
/// replaces it with a device address (globals) or a kernel handle (kernels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryAddr {
    /// No address; the entry passes through resolution unchanged.
    Null,
    /// Host-side identity of the symbol.
    Host(u64),
    /// Resolved device address of a global.
    Device(DevicePtr),
    /// Resolved kernel.
    Kernel(KernelHandle),
}

impl EntryAddr {
    /// Returns true for [`EntryAddr::Null`] and `Host(0)`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null | Self::Host(0))
    }
}

impl fmt::Display for EntryAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Host(addr) => write!(f, "host:0x{:016x}", addr),
            Self::Device(ptr) => write!(f, "device:{}", ptr),
            Self::Kernel(handle) => write!(f, "{}", handle),
        }
    }
}

/// Named entry descriptor of a device image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffloadEntry {
    /// Symbol name, unique within one image.
    pub name: String,
    /// Host identity before resolution, device identity after.
    pub addr: EntryAddr,
    /// Size in bytes; zero for kernels.
    pub size: usize,
    /// Opaque flags, carried through unchanged.
    pub flags: i32,
}

impl OffloadEntry {
    /// Global variable entry.
    pub fn global(name: impl Into<String>, host_addr: u64, size: usize) -> Self {
        Self {
            name: name.into(),
            addr: EntryAddr::Host(host_addr),
            size,
            flags: 0,
        }
    }

    /// Kernel entry.
    pub fn kernel(name: impl Into<String>, host_addr: u64) -> Self {
        Self {
            name: name.into(),
            addr: EntryAddr::Host(host_addr),
            size: 0,
            flags: 0,
        }
    }

    /// Entry with a null address.
    pub fn null(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            addr: EntryAddr::Null,
            size,
            flags: 0,
        }
    }

    /// Builder method to set the flags.
    #[must_use]
    pub fn with_flags(mut self, flags: i32) -> Self {
        self.flags = flags;
        self
    }

    /// Returns true if the entry names a kernel (zero size).
    pub fn is_kernel(&self) -> bool {
        self.size == 0
    }
}

/// Compiled device image plus the entry descriptors it exports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceImage {
    /// Raw image bytes as handed to the driver.
    pub bytes: Vec<u8>,
    /// Entry descriptors in table order.
    pub entries: Vec<OffloadEntry>,
}

impl DeviceImage {
    /// Create an image.
    pub fn new(bytes: impl Into<Vec<u8>>, entries: Vec<OffloadEntry>) -> Self {
        Self {
            bytes: bytes.into(),
            entries,
        }
    }

    /// Builder method to append an entry.
    #[must_use]
    pub fn with_entry(mut self, entry: OffloadEntry) -> Self {
        self.entries.push(entry);
        self
    }
}

/// Read-only view of a device's entry table after a load.
///
/// The next `load_binary` on the same device starts a new generation;
/// use `OffloadRuntime::is_snapshot_current` to detect staleness.
#[derive(Debug, Clone)]
pub struct EntryTableSnapshot {
    device_id: usize,
    generation: u64,
    entries: Arc<[OffloadEntry]>,
}

impl EntryTableSnapshot {
    pub(crate) fn new(device_id: usize, generation: u64, entries: Arc<[OffloadEntry]>) -> Self {
        Self {
            device_id,
            generation,
            entries,
        }
    }

    /// Device the table belongs to.
    pub fn device_id(&self) -> usize {
        self.device_id
    }

    /// Load generation the table was produced by.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Resolved entries, in image order.
    pub fn entries(&self) -> &[OffloadEntry] {
        &self.entries
    }

    /// Iterate over resolved entries.
    pub fn iter(&self) -> std::slice::Iter<'_, OffloadEntry> {
        self.entries.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry at `index`.
    pub fn get(&self, index: usize) -> Option<&OffloadEntry> {
        self.entries.get(index)
    }

    /// First entry named `name`.
    pub fn find(&self, name: &str) -> Option<&OffloadEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// Kernel handle of the entry named `name`.
    pub fn kernel(&self, name: &str) -> Option<KernelHandle> {
        match self.find(name)?.addr {
            EntryAddr::Kernel(handle) => Some(handle),
            _ => None,
        }
    }

    /// Device address of the global named `name`.
    pub fn global(&self, name: &str) -> Option<DevicePtr> {
        match self.find(name)?.addr {
            EntryAddr::Device(ptr) => Some(ptr),
            _ => None,
        }
    }
}

impl<'a> IntoIterator for &'a EntryTableSnapshot {
    type Item = &'a OffloadEntry;
    type IntoIter = std::slice::Iter<'a, OffloadEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Mutable per-device table state, guarded by the runtime's device lock.
#[derive(Debug)]
pub(crate) struct EntryTable {
    generation: u64,
    entries: Arc<[OffloadEntry]>,
}

impl Default for EntryTable {
    fn default() -> Self {
        Self {
            generation: 0,
            entries: Arc::from(Vec::new()),
        }
    }
}

impl EntryTable {
    /// Drop the current entries and start a new generation.
    pub(crate) fn clear(&mut self) -> u64 {
        self.generation += 1;
        self.entries = Arc::from(Vec::new());
        self.generation
    }

    /// Publish the entries of the current generation.
    pub(crate) fn commit(&mut self, device_id: usize, entries: Vec<OffloadEntry>) -> EntryTableSnapshot {
        self.entries = Arc::from(entries);
        EntryTableSnapshot::new(device_id, self.generation, Arc::clone(&self.entries))
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns true if any entry currently holds `addr`.
    pub(crate) fn contains(&self, addr: &EntryAddr) -> bool {
        self.entries.iter().any(|entry| entry.addr == *addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_constructors() {
        let global = OffloadEntry::global("counter", 0x1000, 8).with_flags(3);
        assert!(!global.is_kernel());
        assert_eq!(global.flags, 3);

        let kernel = OffloadEntry::kernel("vector_add", 0x2000);
        assert!(kernel.is_kernel());
        assert_eq!(kernel.addr, EntryAddr::Host(0x2000));

        assert!(OffloadEntry::null("pad", 4).addr.is_null());
        assert!(EntryAddr::Host(0).is_null());
    }

    #[test]
    fn test_table_generations_and_lookup() {
        let mut table = EntryTable::default();
        assert_eq!(table.generation(), 0);

        let generation = table.clear();
        assert_eq!(generation, 1);

        let ptr = DevicePtr::new(0x7000_0000_0000);
        let snapshot = table.commit(
            2,
            vec![
                OffloadEntry::null("pad", 4),
                OffloadEntry {
                    name: "counter".to_string(),
                    addr: EntryAddr::Device(ptr),
                    size: 8,
                    flags: 0,
                },
            ],
        );

        assert_eq!(snapshot.device_id(), 2);
        assert_eq!(snapshot.generation(), 1);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.global("counter"), Some(ptr));
        assert_eq!(snapshot.kernel("counter"), None);
        assert!(snapshot.find("missing").is_none());
        assert!(table.contains(&EntryAddr::Device(ptr)));

        table.clear();
        assert!(!table.contains(&EntryAddr::Device(ptr)));
        // Snapshots keep their own copy of the entries.
        assert_eq!(snapshot.iter().count(), 2);
    }
}
