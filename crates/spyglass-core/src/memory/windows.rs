//! Windows backend
//!
//! Region enumeration walks the address space with `VirtualQuery` until the
//! address wraps; protection edits and allocations use `VirtualProtect` /
//! `VirtualAlloc`.

use spyglass_common::{MemoryRegion, MemoryState, MemoryType, Protection};
use std::ffi::c_void;
use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
use windows::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT,
    MEM_IMAGE, MEM_MAPPED, MEM_RELEASE, MEM_RESERVE, PAGE_PROTECTION_FLAGS,
};
use windows::Win32::System::ProcessStatus::K32GetMappedFileNameA;
use windows::Win32::System::Threading::GetCurrentProcess;

pub(super) fn enumerate_regions() -> Vec<MemoryRegion> {
    let mut regions = Vec::new();
    let mut address = 0usize;

    loop {
        let Some(mbi) = virtual_query(address) else {
            break;
        };
        let base = mbi.BaseAddress as usize;
        if mbi.State == MEM_COMMIT {
            regions.push(region_from_mbi(&mbi));
        }
        let next = base.wrapping_add(mbi.RegionSize);
        if next <= address {
            // Address-space overflow terminates the walk
            break;
        }
        address = next;
    }

    regions
}

pub(super) fn query_region(address: usize) -> Option<MemoryRegion> {
    let mbi = virtual_query(address)?;
    if mbi.State != MEM_COMMIT {
        return None;
    }
    Some(region_from_mbi(&mbi))
}

pub(super) fn protect(address: usize, size: usize, protection: Protection) -> bool {
    let mut old = PAGE_PROTECTION_FLAGS(0);
    unsafe {
        VirtualProtect(
            address as *const c_void,
            size,
            PAGE_PROTECTION_FLAGS(protection.to_windows()),
            &mut old,
        )
    }
    .is_ok()
}

pub(super) fn alloc(size: usize, protection: Protection) -> Option<usize> {
    let ptr = unsafe {
        VirtualAlloc(
            None,
            size,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_PROTECTION_FLAGS(protection.to_windows()),
        )
    };
    if ptr.is_null() {
        None
    } else {
        Some(ptr as usize)
    }
}

pub(super) fn release(address: usize, _size: usize) -> bool {
    unsafe { VirtualFree(address as *mut c_void, 0, MEM_RELEASE) }.is_ok()
}

pub(super) fn flush_instruction_cache(address: usize, size: usize) {
    unsafe {
        let _ = FlushInstructionCache(GetCurrentProcess(), Some(address as *const c_void), size);
    }
}

fn virtual_query(address: usize) -> Option<MEMORY_BASIC_INFORMATION> {
    let mut mbi = MEMORY_BASIC_INFORMATION::default();
    let len = unsafe {
        VirtualQuery(
            Some(address as *const c_void),
            &mut mbi,
            std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    if len == 0 {
        None
    } else {
        Some(mbi)
    }
}

fn region_from_mbi(mbi: &MEMORY_BASIC_INFORMATION) -> MemoryRegion {
    let base = mbi.BaseAddress as usize;
    let region_type = if mbi.Type == MEM_IMAGE {
        MemoryType::Image
    } else if mbi.Type == MEM_MAPPED {
        MemoryType::Mapped
    } else {
        MemoryType::Private
    };

    let module_name = if region_type == MemoryType::Image {
        mapped_file_name(base)
    } else {
        None
    };

    MemoryRegion {
        base,
        size: mbi.RegionSize,
        protection: Protection::from_windows(mbi.Protect.0),
        state: MemoryState::Commit,
        region_type,
        module_name,
    }
}

fn mapped_file_name(base: usize) -> Option<String> {
    let mut buffer = [0u8; 260];
    let len = unsafe {
        K32GetMappedFileNameA(GetCurrentProcess(), base as *const c_void, &mut buffer)
    } as usize;
    if len == 0 {
        return None;
    }
    let path = String::from_utf8_lossy(&buffer[..len]).to_string();
    path.rsplit(['\\', '/']).next().map(|s| s.to_string())
}
