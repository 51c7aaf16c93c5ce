//! Unix backend
//!
//! Region enumeration parses `/proc/self/maps`:
//! `address           perms offset  dev   inode   pathname`
//! `00400000-00452000 r-xp 00000000 08:02 173521  /usr/bin/host`
//!
//! Protection edits and allocations go through `mprotect`/`mmap`.

use spyglass_common::{MemoryRegion, MemoryState, MemoryType, Protection};
use std::fs;

pub(super) fn enumerate_regions() -> Vec<MemoryRegion> {
    match fs::read_to_string("/proc/self/maps") {
        Ok(content) => parse_maps(&content),
        Err(_) => Vec::new(),
    }
}

pub(super) fn query_region(address: usize) -> Option<MemoryRegion> {
    let regions = enumerate_regions();
    let idx = regions.partition_point(|r| r.end() <= address);
    regions
        .into_iter()
        .nth(idx)
        .filter(|r| address >= r.base && address < r.end())
}

pub(super) fn protect(address: usize, size: usize, protection: Protection) -> bool {
    let page = page_size();
    let start = address & !(page - 1);
    let end = (address + size + page - 1) & !(page - 1);
    let rc = unsafe {
        libc::mprotect(
            start as *mut libc::c_void,
            end - start,
            prot_flags(protection),
        )
    };
    rc == 0
}

pub(super) fn alloc(size: usize, protection: Protection) -> Option<usize> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            prot_flags(protection),
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        None
    } else {
        Some(ptr as usize)
    }
}

pub(super) fn release(address: usize, size: usize) -> bool {
    if size == 0 {
        return false;
    }
    unsafe { libc::munmap(address as *mut libc::c_void, size) == 0 }
}

pub(super) fn flush_instruction_cache(_address: usize, _size: usize) {
    // Coherent I/D caches on x86; nothing to do.
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn prot_flags(p: Protection) -> libc::c_int {
    let mut flags = libc::PROT_NONE;
    if p.read {
        flags |= libc::PROT_READ;
    }
    if p.write {
        flags |= libc::PROT_WRITE;
    }
    if p.execute {
        flags |= libc::PROT_EXEC;
    }
    flags
}

fn parse_maps(content: &str) -> Vec<MemoryRegion> {
    let exe = std::env::current_exe()
        .ok()
        .map(|p| p.to_string_lossy().to_string());
    content
        .lines()
        .filter_map(|line| parse_map_line(line, exe.as_deref()))
        .collect()
}

fn parse_map_line(line: &str, exe_path: Option<&str>) -> Option<MemoryRegion> {
    let mut parts = line.split_whitespace();

    let range = parts.next()?;
    let (start_str, end_str) = range.split_once('-')?;
    let base = usize::from_str_radix(start_str, 16).ok()?;
    let end = usize::from_str_radix(end_str, 16).ok()?;
    if end <= base {
        return None;
    }

    let perms = parts.next()?;
    let _offset = parts.next()?;
    let _device = parts.next()?;
    let inode: u64 = parts.next()?.parse().unwrap_or(0);
    let pathname = parts.collect::<Vec<_>>().join(" ");

    let file_backed = inode != 0;
    let protection = Protection::from_maps_perms(perms, file_backed);

    let region_type = if file_backed {
        let is_image = pathname.contains(".so")
            || exe_path.is_some_and(|exe| exe == pathname);
        if is_image {
            MemoryType::Image
        } else {
            MemoryType::Mapped
        }
    } else {
        MemoryType::Private
    };

    let module_name = if file_backed {
        pathname.rsplit('/').next().map(|s| s.to_string())
    } else {
        None
    };

    Some(MemoryRegion {
        base,
        size: end - base,
        protection,
        state: MemoryState::Commit,
        region_type,
        module_name,
    })
}
