//! Value scan engine
//!
//! A first scan walks every scannable region, slides a window of the value's
//! width at the configured stride and emits exact matches. Refinement scans
//! revisit only the previous results, comparing the freshly read value
//! against the previous one (or a new target value) per scan kind.
//!
//! Results are always emitted in ascending address order, so a next scan can
//! align against its predecessor in a single pass. A region whose read fails
//! mid-scan contributes no results at all; scanning continues with the next
//! region.

use crate::memory::MemoryAccess;
use spyglass_common::{MemoryRegion, ScanKind, ScanOptions, ScanResult, ValueType};
use tracing::debug;

/// Relative tolerance for fuzzy float comparison
const FUZZY_TOLERANCE: f64 = 0.001;
/// Absolute floors so near-zero values still compare fuzzily
const FUZZY_FLOOR_F32: f32 = 1e-4;
const FUZZY_FLOOR_F64: f64 = 1e-7;

/// Initial scan over all scannable regions.
///
/// `kind` must be `Exact`, `Fuzzy` or `Unknown`; the relative kinds need a
/// previous result set and belong to [`next_scan`]. For `Unknown`, every
/// aligned slot is emitted with the value read from it.
pub fn first_scan(
    mem: &MemoryAccess,
    kind: ScanKind,
    needle: &[u8],
    value_type: ValueType,
    options: &ScanOptions,
) -> Vec<ScanResult> {
    let width = match value_type.width() {
        Some(w) => w,
        None => needle.len(),
    };
    if width == 0 {
        return Vec::new();
    }

    let stride = options.alignment.max(1);
    let mut results = Vec::new();

    for region in mem.regions() {
        if !region_scannable(&region, options) {
            continue;
        }

        let start = region.base.max(options.start_address.unwrap_or(0));
        let end = region.end().min(options.end_address.unwrap_or(usize::MAX));
        if start >= end || end - start < width {
            continue;
        }

        // One read per region; a failure drops the whole region.
        let data = match mem.read_bytes(start, end - start) {
            Some(data) => data,
            None => continue,
        };

        let mut offset = 0;
        while offset + width <= data.len() {
            let window = &data[offset..offset + width];
            let hit = match kind {
                ScanKind::Unknown => true,
                ScanKind::Fuzzy => fuzzy_equal(window, needle, value_type),
                _ => window == needle,
            };
            if hit {
                results.push(ScanResult {
                    address: start + offset,
                    value: window.to_vec(),
                    previous_value: None,
                    value_type,
                });
            }
            offset += stride;
        }
    }

    debug!(
        target: "spyglass_core::scanner",
        kind = ?kind,
        results = results.len(),
        "first scan complete"
    );
    results
}

/// Refinement scan over the previous result set.
///
/// Each surviving result carries the freshly read value and the previous one.
/// Addresses that can no longer be read are dropped.
pub fn next_scan(
    mem: &MemoryAccess,
    kind: ScanKind,
    needle: Option<&[u8]>,
    previous: &[ScanResult],
) -> Vec<ScanResult> {
    let mut results = Vec::new();

    for prev in previous {
        let width = prev.value_type.width().unwrap_or(prev.value.len());
        if width == 0 {
            continue;
        }
        let current = match mem.read_bytes(prev.address, width) {
            Some(bytes) => bytes,
            None => continue,
        };

        let keep = match kind {
            ScanKind::Exact => needle.is_some_and(|n| current == n),
            ScanKind::Changed => current != prev.value,
            ScanKind::Unchanged => current == prev.value,
            ScanKind::Increased => compare_numeric(&current, &prev.value, prev.value_type) > 0,
            ScanKind::Decreased => compare_numeric(&current, &prev.value, prev.value_type) < 0,
            ScanKind::Unknown => true,
            ScanKind::Fuzzy => {
                needle.is_some_and(|n| fuzzy_equal(&current, n, prev.value_type))
            }
        };

        if keep {
            results.push(ScanResult {
                address: prev.address,
                value: current,
                previous_value: Some(prev.value.clone()),
                value_type: prev.value_type,
            });
        }
    }

    debug!(
        target: "spyglass_core::scanner",
        kind = ?kind,
        previous = previous.len(),
        results = results.len(),
        "next scan complete"
    );
    results
}

/// A region is scannable iff it is readable and every tri-state filter holds.
pub fn region_scannable(region: &MemoryRegion, options: &ScanOptions) -> bool {
    region.readable()
        && options.filter_writable.accepts(region.writable())
        && options.filter_executable.accepts(region.executable())
        && options
            .filter_copy_on_write
            .accepts(region.protection.copy_on_write)
}

/// Three-way numeric comparison of two raw values; 0 for non-numeric types
/// or truncated buffers.
pub fn compare_numeric(a: &[u8], b: &[u8], value_type: ValueType) -> i32 {
    fn ord<T: PartialOrd>(a: T, b: T) -> i32 {
        if a > b {
            1
        } else if a < b {
            -1
        } else {
            0
        }
    }

    match value_type {
        ValueType::Int32 if a.len() >= 4 && b.len() >= 4 => {
            ord(i32::from_ne_bytes(take4(a)), i32::from_ne_bytes(take4(b)))
        }
        ValueType::Int64 if a.len() >= 8 && b.len() >= 8 => {
            ord(i64::from_ne_bytes(take8(a)), i64::from_ne_bytes(take8(b)))
        }
        ValueType::Float if a.len() >= 4 && b.len() >= 4 => {
            ord(f32::from_ne_bytes(take4(a)), f32::from_ne_bytes(take4(b)))
        }
        ValueType::Double if a.len() >= 8 && b.len() >= 8 => {
            ord(f64::from_ne_bytes(take8(a)), f64::from_ne_bytes(take8(b)))
        }
        ValueType::Byte if !a.is_empty() && !b.is_empty() => ord(a[0], b[0]),
        _ => 0,
    }
}

fn take4(bytes: &[u8]) -> [u8; 4] {
    bytes
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .unwrap_or([0; 4])
}

fn take8(bytes: &[u8]) -> [u8; 8] {
    bytes
        .get(..8)
        .and_then(|s| s.try_into().ok())
        .unwrap_or([0; 8])
}

/// Approximate equality for float/double; exact equality otherwise.
fn fuzzy_equal(a: &[u8], b: &[u8], value_type: ValueType) -> bool {
    match value_type {
        ValueType::Float if a.len() >= 4 && b.len() >= 4 => {
            let va = f32::from_ne_bytes(take4(a));
            let vb = f32::from_ne_bytes(take4(b));
            (va - vb).abs() <= (vb.abs() * FUZZY_TOLERANCE as f32).max(FUZZY_FLOOR_F32)
        }
        ValueType::Double if a.len() >= 8 && b.len() >= 8 => {
            let va = f64::from_ne_bytes(take8(a));
            let vb = f64::from_ne_bytes(take8(b));
            (va - vb).abs() <= (vb.abs() * FUZZY_TOLERANCE).max(FUZZY_FLOOR_F64)
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spyglass_common::{Protection, TriState};

    fn scratch_page(mem: &MemoryAccess) -> (usize, ScanOptions) {
        let base = mem.allocate(4096, Protection::rw()).unwrap();
        let options = ScanOptions {
            start_address: Some(base),
            end_address: Some(base + 4096),
            alignment: 4,
            ..Default::default()
        };
        (base, options)
    }

    #[test]
    fn test_first_scan_finds_planted_value() {
        let mem = MemoryAccess::new();
        let (base, options) = scratch_page(&mem);

        mem.write::<i32>(base + 0x100, 0x41424344);
        let needle = 0x41424344i32.to_ne_bytes();
        let results = first_scan(&mem, ScanKind::Exact, &needle, ValueType::Int32, &options);

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].address, base + 0x100);
        assert_eq!(results[0].value, needle.to_vec());
        assert!(results[0].previous_value.is_none());

        mem.free(base);
    }

    #[test]
    fn test_first_scan_alignment_stride() {
        let mem = MemoryAccess::new();
        let (base, mut options) = scratch_page(&mem);

        // Value planted off the 4-byte grid is invisible at alignment 4
        mem.write::<i32>(base + 0x102, 777);
        let needle = 777i32.to_ne_bytes();
        let missed = first_scan(&mem, ScanKind::Exact, &needle, ValueType::Int32, &options);
        assert!(missed.is_empty());

        options.alignment = 1;
        let found = first_scan(&mem, ScanKind::Exact, &needle, ValueType::Int32, &options);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, base + 0x102);

        mem.free(base);
    }

    #[test]
    fn test_first_scan_results_ascending() {
        let mem = MemoryAccess::new();
        let (base, options) = scratch_page(&mem);

        for offset in [0x300, 0x100, 0x200] {
            mem.write::<i32>(base + offset, 1234);
        }
        let needle = 1234i32.to_ne_bytes();
        let results = first_scan(&mem, ScanKind::Exact, &needle, ValueType::Int32, &options);

        assert_eq!(results.len(), 3);
        for pair in results.windows(2) {
            assert!(pair[0].address < pair[1].address);
        }

        mem.free(base);
    }

    #[test]
    fn test_first_scan_unknown_emits_every_slot() {
        let mem = MemoryAccess::new();
        let (base, mut options) = scratch_page(&mem);
        options.end_address = Some(base + 64);

        let results = first_scan(&mem, ScanKind::Unknown, &[], ValueType::Int32, &options);
        // 64 bytes / stride 4, each window 4 wide: offsets 0..=60
        assert_eq!(results.len(), 16);
        assert_eq!(results[0].address, base);
        assert_eq!(results[15].address, base + 60);

        mem.free(base);
    }

    #[test]
    fn test_next_scan_decreased() {
        let mem = MemoryAccess::new();
        let (base, options) = scratch_page(&mem);

        mem.write::<i32>(base + 0x40, 100);
        let needle = 100i32.to_ne_bytes();
        let first = first_scan(&mem, ScanKind::Exact, &needle, ValueType::Int32, &options);
        assert_eq!(first.len(), 1);

        // Host mutates the value between scans
        mem.write::<i32>(base + 0x40, 99);

        let refined = next_scan(&mem, ScanKind::Decreased, None, &first);
        assert_eq!(refined.len(), 1);
        assert_eq!(refined[0].address, base + 0x40);
        assert_eq!(refined[0].value, 99i32.to_ne_bytes().to_vec());
        assert_eq!(
            refined[0].previous_value.as_deref(),
            Some(100i32.to_ne_bytes().as_slice())
        );

        let none = next_scan(&mem, ScanKind::Increased, None, &first);
        assert!(none.is_empty());

        mem.free(base);
    }

    #[test]
    fn test_next_scan_changed_unchanged_partition() {
        let mem = MemoryAccess::new();
        let (base, options) = scratch_page(&mem);

        for offset in [0x10, 0x20, 0x30, 0x40] {
            mem.write::<i32>(base + offset, 5);
        }
        let needle = 5i32.to_ne_bytes();
        let first = first_scan(&mem, ScanKind::Exact, &needle, ValueType::Int32, &options);
        assert_eq!(first.len(), 4);

        mem.write::<i32>(base + 0x20, 6);
        mem.write::<i32>(base + 0x40, 7);

        let changed = next_scan(&mem, ScanKind::Changed, None, &first);
        let unchanged = next_scan(&mem, ScanKind::Unchanged, None, &first);

        // changed and unchanged partition the previous set exactly
        assert_eq!(changed.len() + unchanged.len(), first.len());
        let mut all: Vec<usize> = changed
            .iter()
            .chain(unchanged.iter())
            .map(|r| r.address)
            .collect();
        all.sort_unstable();
        let mut expected: Vec<usize> = first.iter().map(|r| r.address).collect();
        expected.sort_unstable();
        assert_eq!(all, expected);

        assert_eq!(changed.len(), 2);
        assert_eq!(unchanged.len(), 2);

        mem.free(base);
    }

    #[test]
    fn test_next_scan_unchanged_is_subset() {
        let mem = MemoryAccess::new();
        let (base, options) = scratch_page(&mem);

        mem.write::<i32>(base + 0x8, 11);
        mem.write::<i32>(base + 0x10, 11);
        let needle = 11i32.to_ne_bytes();
        let first = first_scan(&mem, ScanKind::Exact, &needle, ValueType::Int32, &options);

        let unchanged = next_scan(&mem, ScanKind::Unchanged, None, &first);
        assert_eq!(unchanged.len(), first.len());
        for (a, b) in unchanged.iter().zip(first.iter()) {
            assert_eq!(a.address, b.address);
            assert_eq!(a.value, b.value);
        }

        mem.free(base);
    }

    #[test]
    fn test_next_scan_exact_with_new_value() {
        let mem = MemoryAccess::new();
        let (base, options) = scratch_page(&mem);

        mem.write::<i32>(base + 0x50, 100);
        mem.write::<i32>(base + 0x60, 100);
        let needle = 100i32.to_ne_bytes();
        let first = first_scan(&mem, ScanKind::Exact, &needle, ValueType::Int32, &options);
        assert_eq!(first.len(), 2);

        mem.write::<i32>(base + 0x50, 55);
        let new_needle = 55i32.to_ne_bytes();
        let refined = next_scan(&mem, ScanKind::Exact, Some(&new_needle), &first);
        assert_eq!(refined.len(), 1);
        assert_eq!(refined[0].address, base + 0x50);

        mem.free(base);
    }

    #[test]
    fn test_next_scan_drops_unreadable_addresses() {
        let mem = MemoryAccess::new();
        let previous = vec![ScanResult {
            address: 0x10,
            value: vec![0, 0, 0, 0],
            previous_value: None,
            value_type: ValueType::Int32,
        }];
        let results = next_scan(&mem, ScanKind::Unchanged, None, &previous);
        assert!(results.is_empty());
    }

    #[test]
    fn test_fuzzy_scan_float() {
        let mem = MemoryAccess::new();
        let (base, options) = scratch_page(&mem);

        mem.write::<f32>(base + 0x80, 100.0001);
        let needle = 100.0f32.to_ne_bytes();
        let results = first_scan(&mem, ScanKind::Fuzzy, &needle, ValueType::Float, &options);
        assert_eq!(results.len(), 1);

        let far = 200.0f32.to_ne_bytes();
        let none = first_scan(&mem, ScanKind::Fuzzy, &far, ValueType::Float, &options);
        assert!(none.is_empty());

        mem.free(base);
    }

    #[test]
    fn test_region_filters() {
        let region = MemoryRegion {
            base: 0x1000,
            size: 0x1000,
            protection: Protection::rw(),
            state: spyglass_common::MemoryState::Commit,
            region_type: spyglass_common::MemoryType::Private,
            module_name: None,
        };

        let mut options = ScanOptions::default();
        assert!(region_scannable(&region, &options));

        options.filter_writable = TriState::Yes;
        assert!(region_scannable(&region, &options));

        options.filter_executable = TriState::Yes;
        assert!(!region_scannable(&region, &options));

        options.filter_executable = TriState::No;
        assert!(region_scannable(&region, &options));

        options.filter_copy_on_write = TriState::Yes;
        assert!(!region_scannable(&region, &options));

        let mut unreadable = region;
        unreadable.protection = Protection::new(false, false, false);
        assert!(!region_scannable(&unreadable, &ScanOptions::default()));
    }

    #[test]
    fn test_compare_numeric() {
        let a = 10i32.to_ne_bytes();
        let b = 7i32.to_ne_bytes();
        assert_eq!(compare_numeric(&a, &b, ValueType::Int32), 1);
        assert_eq!(compare_numeric(&b, &a, ValueType::Int32), -1);
        assert_eq!(compare_numeric(&a, &a, ValueType::Int32), 0);

        let neg = (-5i32).to_ne_bytes();
        assert_eq!(compare_numeric(&neg, &b, ValueType::Int32), -1);

        let fa = 1.5f64.to_ne_bytes();
        let fb = 1.25f64.to_ne_bytes();
        assert_eq!(compare_numeric(&fa, &fb, ValueType::Double), 1);

        // Truncated buffers compare as equal rather than panicking
        assert_eq!(compare_numeric(&[1], &[2], ValueType::Int32), 0);
    }
}
