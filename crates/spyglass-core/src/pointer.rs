//! Pointer chain resolution
//!
//! `follow_chain(base, [o1, .., on])` computes `a0 = base`,
//! `a_k = *(a_{k-1}) + o_k` and returns `a_n`, an address rather than its
//! dereference. Every step reads a pointer-sized slot; a failed read or an
//! unreadable intermediate address aborts the resolution.

use crate::memory::MemoryAccess;
use crate::scanner;
use spyglass_common::{ScanKind, ScanOptions, ValueType};

const PTR_SIZE: usize = std::mem::size_of::<usize>();

/// Resolve a pointer chain. Returns the final address, or `None` when any
/// dereference fails.
pub fn follow_chain(mem: &MemoryAccess, base: usize, offsets: &[usize]) -> Option<usize> {
    let mut address = base;

    for (index, offset) in offsets.iter().enumerate() {
        let pointer = mem.read::<usize>(address)?;
        address = pointer.wrapping_add(*offset);

        // Intermediate addresses get dereferenced next round; the final one
        // is returned as-is.
        if index + 1 < offsets.len() && !mem.is_readable(address, PTR_SIZE) {
            return None;
        }
    }

    Some(address)
}

/// Addresses whose pointer-sized contents equal `target`, within
/// `[start, end)`, up to `limit`.
pub fn find_pointers_to(
    mem: &MemoryAccess,
    target: usize,
    start: Option<usize>,
    end: Option<usize>,
    limit: usize,
) -> Vec<usize> {
    let needle = target.to_ne_bytes();
    let options = ScanOptions {
        start_address: start,
        end_address: end,
        alignment: PTR_SIZE,
        ..Default::default()
    };

    let value_type = if PTR_SIZE == 8 {
        ValueType::Int64
    } else {
        ValueType::Int32
    };

    scanner::first_scan(mem, ScanKind::Exact, &needle, value_type, &options)
        .into_iter()
        .map(|r| r.address)
        .take(limit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use spyglass_common::Protection;

    #[test]
    fn test_follow_chain_two_levels() {
        let mem = MemoryAccess::new();
        let base = mem.allocate(4096, Protection::rw()).unwrap();

        // base      -> points at base+0x100
        // base+0x110 -> points at base+0x200
        // chain: *(base)+0x10 = base+0x110, *(base+0x110)+0x8 = base+0x208
        mem.write::<usize>(base, base + 0x100);
        mem.write::<usize>(base + 0x110, base + 0x200);

        let result = follow_chain(&mem, base, &[0x10, 0x8]);
        assert_eq!(result, Some(base + 0x208));

        mem.free(base);
    }

    #[test]
    fn test_follow_chain_empty_offsets() {
        let mem = MemoryAccess::new();
        let base = mem.allocate(4096, Protection::rw()).unwrap();
        assert_eq!(follow_chain(&mem, base, &[]), Some(base));
        mem.free(base);
    }

    #[test]
    fn test_follow_chain_fails_on_bad_deref() {
        let mem = MemoryAccess::new();
        let base = mem.allocate(4096, Protection::rw()).unwrap();

        // First slot points into unmapped space; the second step cannot read
        mem.write::<usize>(base, 0x10);
        assert_eq!(follow_chain(&mem, base, &[0, 0]), None);

        // Base itself unreadable
        assert_eq!(follow_chain(&mem, 0x10, &[0]), None);

        mem.free(base);
    }

    #[test]
    fn test_find_pointers_to() {
        let mem = MemoryAccess::new();
        let base = mem.allocate(4096, Protection::rw()).unwrap();
        let target = base + 0x800;

        mem.write::<usize>(base + 0x10, target);
        mem.write::<usize>(base + 0x40, target);
        mem.write::<usize>(base + 0x80, target + 4);

        let found = find_pointers_to(&mem, target, Some(base), Some(base + 4096), 100);
        assert_eq!(found, vec![base + 0x10, base + 0x40]);

        let capped = find_pointers_to(&mem, target, Some(base), Some(base + 4096), 1);
        assert_eq!(capped.len(), 1);

        mem.free(base);
    }
}
