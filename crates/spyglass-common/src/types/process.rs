//! Process-level types

use serde::{Deserialize, Serialize};

/// Main module span reported by `process.info`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MainModule {
    pub base_address: usize,
    pub size: usize,
}

/// Aggregate committed-memory sizes
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub total: usize,
    pub writable: usize,
    pub executable: usize,
}

/// Snapshot of the host process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub platform: String,
    /// 32 or 64
    pub address_width: u32,
    pub main_module: MainModule,
    pub memory_metrics: MemoryMetrics,
}
