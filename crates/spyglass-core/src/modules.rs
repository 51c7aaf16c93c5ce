//! Cached module map
//!
//! Annotating scan results with `module+0xOFFSET` would otherwise enumerate
//! modules once per result; the cache holds a snapshot and rebuilds it lazily
//! once it is older than the validity window. Modules loaded or unloaded
//! between snapshots simply miss until the next rebuild.

use parking_lot::Mutex;
use spyglass_common::Module;
use std::time::{Duration, Instant};
use tracing::debug;

/// Snapshot validity window
const CACHE_VALIDITY: Duration = Duration::from_secs(5);

struct Snapshot {
    modules: Vec<Module>,
    taken_at: Option<Instant>,
}

pub struct ModuleCache {
    inner: Mutex<Snapshot>,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Snapshot {
                modules: Vec::new(),
                taken_at: None,
            }),
        }
    }

    fn with_fresh<R>(&self, f: impl FnOnce(&[Module]) -> R) -> R {
        let mut inner = self.inner.lock();
        let stale = match inner.taken_at {
            Some(at) => at.elapsed() >= CACHE_VALIDITY,
            None => true,
        };
        if stale {
            inner.modules = enumerate_modules();
            inner.modules.sort_by_key(|m| m.base);
            inner.taken_at = Some(Instant::now());
            debug!(target: "spyglass_core::modules", count = inner.modules.len(), "module snapshot rebuilt");
        }
        f(&inner.modules)
    }

    /// Force the next lookup to rebuild the snapshot.
    pub fn invalidate(&self) {
        self.inner.lock().taken_at = None;
    }

    pub fn list(&self) -> Vec<Module> {
        self.with_fresh(|m| m.to_vec())
    }

    /// Case-insensitive lookup by module file name.
    pub fn find(&self, name: &str) -> Option<Module> {
        self.with_fresh(|modules| {
            modules
                .iter()
                .find(|m| m.name.eq_ignore_ascii_case(name))
                .cloned()
        })
    }

    /// Module owning `address`, with the offset into it.
    pub fn module_for_address(&self, address: usize) -> Option<(Module, usize)> {
        self.with_fresh(|modules| {
            let idx = modules.partition_point(|m| m.end() <= address);
            modules
                .get(idx)
                .filter(|m| m.contains(address))
                .map(|m| (m.clone(), address - m.base))
        })
    }

    /// `name+0xOFFSET` annotation, or `None` when no module owns the address.
    pub fn display_for_address(&self, address: usize) -> Option<String> {
        self.module_for_address(address)
            .map(|(module, _)| module.display_for(address))
    }

    /// The host executable's module.
    pub fn main_module(&self) -> Option<Module> {
        let exe_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))?;
        self.find(&exe_name)
    }
}

impl Default for ModuleCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn enumerate_modules() -> Vec<Module> {
    // Group the file-backed mappings of /proc/self/maps by path: the module
    // spans from its lowest mapping to its highest.
    use std::collections::HashMap;

    let content = match std::fs::read_to_string("/proc/self/maps") {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };

    let mut spans: HashMap<String, (usize, usize)> = HashMap::new();
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let Some(range) = parts.next() else { continue };
        let Some((start_str, end_str)) = range.split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(end)) = (
            usize::from_str_radix(start_str, 16),
            usize::from_str_radix(end_str, 16),
        ) else {
            continue;
        };
        let _perms = parts.next();
        let _offset = parts.next();
        let _device = parts.next();
        let inode: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let path = parts.collect::<Vec<_>>().join(" ");
        if inode == 0 || !path.starts_with('/') {
            continue;
        }

        let span = spans.entry(path).or_insert((start, end));
        span.0 = span.0.min(start);
        span.1 = span.1.max(end);
    }

    spans
        .into_iter()
        .filter_map(|(path, (start, end))| {
            let name = path.rsplit('/').next()?.to_string();
            Some(Module {
                name,
                path,
                base: start,
                size: end - start,
            })
        })
        .collect()
}

#[cfg(windows)]
fn enumerate_modules() -> Vec<Module> {
    use windows::Win32::Foundation::HMODULE;
    use windows::Win32::System::ProcessStatus::{
        K32EnumProcessModules, K32GetModuleFileNameExA, K32GetModuleInformation, MODULEINFO,
    };
    use windows::Win32::System::Threading::GetCurrentProcess;

    let process = unsafe { GetCurrentProcess() };
    let mut handles = [HMODULE::default(); 1024];
    let mut needed = 0u32;

    let ok = unsafe {
        K32EnumProcessModules(
            process,
            handles.as_mut_ptr(),
            std::mem::size_of_val(&handles) as u32,
            &mut needed,
        )
    };
    if !ok.as_bool() {
        return Vec::new();
    }

    let count = (needed as usize / std::mem::size_of::<HMODULE>()).min(handles.len());
    let mut modules = Vec::with_capacity(count);

    for &handle in &handles[..count] {
        let mut info = MODULEINFO::default();
        let ok = unsafe {
            K32GetModuleInformation(
                process,
                handle,
                &mut info,
                std::mem::size_of::<MODULEINFO>() as u32,
            )
        };
        if !ok.as_bool() {
            continue;
        }

        let mut path_buf = [0u8; 260];
        let len =
            unsafe { K32GetModuleFileNameExA(Some(process), Some(handle), &mut path_buf) } as usize;
        if len == 0 {
            continue;
        }
        let path = String::from_utf8_lossy(&path_buf[..len]).to_string();
        let name = path
            .rsplit(['\\', '/'])
            .next()
            .unwrap_or(&path)
            .to_string();

        modules.push(Module {
            name,
            path,
            base: info.lpBaseOfDll as usize,
            size: info.SizeOfImage as usize,
        });
    }

    modules
}
