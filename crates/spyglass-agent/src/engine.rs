//! The engine object
//!
//! One explicit object owns every subsystem; it is constructed by the
//! lifecycle worker at load time and threaded into the server and router.
//! Nothing in the crate reaches for a global to find it.

use spyglass_common::{MainModule, MemoryMetrics, ProcessInfo};
use spyglass_core::{HookEngine, MemoryAccess, ModuleCache};
use std::sync::Arc;
use tracing::info;

pub struct Engine {
    pub memory: Arc<MemoryAccess>,
    pub modules: ModuleCache,
    pub hooks: HookEngine,
}

impl Engine {
    pub fn new() -> Arc<Self> {
        let memory = Arc::new(MemoryAccess::new());
        Arc::new(Self {
            hooks: HookEngine::new(Arc::clone(&memory)),
            modules: ModuleCache::new(),
            memory,
        })
    }

    /// Snapshot of the host process for `process.info`.
    pub fn process_info(&self) -> ProcessInfo {
        let name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_else(|| "unknown".to_string());

        let main_module = self
            .modules
            .main_module()
            .map(|m| MainModule {
                base_address: m.base,
                size: m.size,
            })
            .unwrap_or(MainModule {
                base_address: 0,
                size: 0,
            });

        let mut metrics = MemoryMetrics::default();
        for region in self.memory.regions() {
            metrics.total += region.size;
            if region.writable() {
                metrics.writable += region.size;
            }
            if region.executable() {
                metrics.executable += region.size;
            }
        }

        ProcessInfo {
            pid: std::process::id(),
            name,
            platform: if cfg!(target_pointer_width = "64") {
                "x64"
            } else {
                "x86"
            }
            .to_string(),
            address_width: if cfg!(target_pointer_width = "64") {
                64
            } else {
                32
            },
            main_module,
            memory_metrics: metrics,
        }
    }

    /// Tear down everything the engine owns that outlives a request:
    /// live hooks come out first so no detour survives the unload.
    pub fn shutdown(&self) {
        info!(target: "spyglass_agent::engine", "engine shutting down");
        self.hooks.remove_all();
    }
}
