//! Safe memory access layer
//!
//! Every primitive here is guarded so that a bad address degrades into a
//! failed result instead of taking the host process down. The guard is a
//! pre-check: a raw copy only happens after a region query proves the whole
//! range is mapped with the required protection. A concurrent protection
//! change can still race the copy; the engine accepts torn reads as possible
//! observations.
//!
//! Reads and writes never silently span a region boundary: the range must be
//! contained in a single enumerated region or the access fails.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as platform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as platform;

use parking_lot::Mutex;
use spyglass_common::{MemoryRegion, MemoryState, Protection};
use std::collections::HashMap;
use tracing::debug;

/// Access to the local address space.
///
/// Tracks engine-owned allocations so `free` can release the entire
/// reservation on every platform.
pub struct MemoryAccess {
    allocations: Mutex<HashMap<usize, usize>>,
}

impl MemoryAccess {
    pub fn new() -> Self {
        Self {
            allocations: Mutex::new(HashMap::new()),
        }
    }

    /// All committed regions, bottom-up, with exact boundaries.
    pub fn regions(&self) -> Vec<MemoryRegion> {
        platform::enumerate_regions()
    }

    /// The region containing `address`, if any.
    pub fn region_at(&self, address: usize) -> Option<MemoryRegion> {
        platform::query_region(address)
    }

    /// True iff `[address, address+size)` is fully contained in one
    /// committed region.
    pub fn is_valid(&self, address: usize, size: usize) -> bool {
        if address == 0 || size == 0 {
            return false;
        }
        match self.region_at(address) {
            Some(region) => region.state == MemoryState::Commit && region.contains(address, size),
            None => false,
        }
    }

    pub fn is_readable(&self, address: usize, size: usize) -> bool {
        self.check(address, size, |p| p.read)
    }

    pub fn is_writable(&self, address: usize, size: usize) -> bool {
        self.check(address, size, |p| p.write)
    }

    fn check(&self, address: usize, size: usize, pred: impl Fn(&Protection) -> bool) -> bool {
        if address == 0 || size == 0 {
            return false;
        }
        match self.region_at(address) {
            Some(region) => {
                region.state == MemoryState::Commit
                    && region.contains(address, size)
                    && pred(&region.protection)
            }
            None => false,
        }
    }

    /// Read exactly `size` bytes, or nothing.
    pub fn read_bytes(&self, address: usize, size: usize) -> Option<Vec<u8>> {
        if !self.is_readable(address, size) {
            return None;
        }
        let mut buffer = vec![0u8; size];
        unsafe {
            std::ptr::copy_nonoverlapping(address as *const u8, buffer.as_mut_ptr(), size);
        }
        Some(buffer)
    }

    /// Write the full slice, elevating protection to RWX for the copy and
    /// restoring the prior protection afterwards. Returns false without
    /// modifying anything on any failure.
    pub fn write_bytes(&self, address: usize, bytes: &[u8]) -> bool {
        if bytes.is_empty() || !self.is_valid(address, bytes.len()) {
            return false;
        }
        let old = match self.change_protection(address, bytes.len(), Protection::rwx()) {
            Some(old) => old,
            None => return false,
        };
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
        }
        platform::flush_instruction_cache(address, bytes.len());
        let _ = self.change_protection(address, bytes.len(), old);
        true
    }

    /// Typed read with native endianness and natural size.
    pub fn read<T: Copy>(&self, address: usize) -> Option<T> {
        if !self.is_readable(address, std::mem::size_of::<T>()) {
            return None;
        }
        Some(unsafe { std::ptr::read_unaligned(address as *const T) })
    }

    /// Typed write; same protection dance as `write_bytes`.
    pub fn write<T: Copy>(&self, address: usize, value: T) -> bool {
        let bytes = unsafe {
            std::slice::from_raw_parts(&value as *const T as *const u8, std::mem::size_of::<T>())
        };
        self.write_bytes(address, bytes)
    }

    /// Change protection on a range. Idempotent; on failure the protection
    /// is left unchanged and `None` is returned. On success returns the
    /// protection the range had before.
    pub fn change_protection(
        &self,
        address: usize,
        size: usize,
        protection: Protection,
    ) -> Option<Protection> {
        if size == 0 {
            return None;
        }
        let old = self.region_at(address)?.protection;
        if platform::protect(address, size, protection) {
            Some(old)
        } else {
            None
        }
    }

    /// Page-granular committed + reserved allocation.
    pub fn allocate(&self, size: usize, protection: Protection) -> Option<usize> {
        if size == 0 {
            return None;
        }
        let base = platform::alloc(size, protection)?;
        self.allocations.lock().insert(base, size);
        debug!(target: "spyglass_core::memory", base = format!("{:#x}", base), size, "allocated");
        Some(base)
    }

    /// Release an entire reservation made by `allocate`.
    pub fn free(&self, address: usize) -> bool {
        let size = self.allocations.lock().remove(&address);
        let ok = platform::release(address, size.unwrap_or(0));
        if !ok {
            if let Some(size) = size {
                // Keep the bookkeeping consistent with reality
                self.allocations.lock().insert(address, size);
            }
        }
        ok
    }
}

impl Default for MemoryAccess {
    fn default() -> Self {
        Self::new()
    }
}
