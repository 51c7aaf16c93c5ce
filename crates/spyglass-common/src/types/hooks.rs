//! Hook types

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Patch variant written at the hook target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    /// `E9 <rel32>`, 5 bytes; requires the detour within ±2 GiB
    RelativeJump,
    /// 64-bit: `FF 25 00 00 00 00 <abs64>`, 14 bytes; 32-bit: indirect absolute, 6 bytes
    AbsoluteJump,
    /// `68 <imm32> C3`, 6 bytes, 32-bit hosts only
    PushRet,
    /// Pick the smallest kind that can reach the detour
    Auto,
}

impl HookKind {
    /// Byte length of the patch on this host.
    pub fn patch_len(self) -> usize {
        let wide = cfg!(target_pointer_width = "64");
        match self {
            HookKind::RelativeJump => 5,
            HookKind::AbsoluteJump => {
                if wide {
                    14
                } else {
                    6
                }
            }
            HookKind::PushRet => 6,
            HookKind::Auto => 5,
        }
    }
}

impl FromStr for HookKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relative" | "relative_jump" => Ok(HookKind::RelativeJump),
            "absolute" | "absolute_jump" => Ok(HookKind::AbsoluteJump),
            "push_ret" => Ok(HookKind::PushRet),
            "auto" | "" => Ok(HookKind::Auto),
            other => Err(format!("Unknown hook type: {}", other)),
        }
    }
}

/// Public view of an installed hook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookInfo {
    pub name: String,
    pub target: usize,
    pub detour: usize,
    /// Entry point of the relocated prologue; callable while installed
    pub trampoline: usize,
    pub kind: HookKind,
    pub active: bool,
}
