//! Module-related types

use serde::{Deserialize, Serialize};

/// A loaded module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub path: String,
    pub base: usize,
    pub size: usize,
}

impl Module {
    pub fn end(&self) -> usize {
        self.base.saturating_add(self.size)
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address < self.end()
    }

    /// `name+0xOFFSET` display form for an address inside this module.
    pub fn display_for(&self, address: usize) -> String {
        format!("{}+0x{:x}", self.name, address - self.base)
    }
}
