//! Inline hook engine
//!
//! Installs a detour at a target address by overwriting the prologue with a
//! jump, after relocating the overwritten instructions into an executable
//! trampoline that ends with a jump back past the patch. Calling the
//! trampoline behaves like calling the original function while the hook is
//! installed.
//!
//! Installation is all-or-nothing: any failure frees the trampoline and
//! leaves the target untouched. All registry operations are serialized under
//! one mutex, which also serializes the writes to patched code.

use crate::lde;
use crate::memory::MemoryAccess;
use parking_lot::Mutex;
use spyglass_common::{Error, HookInfo, HookKind, Protection, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

const NOP: u8 = 0x90;
/// Sanity cap on how far the prologue walk may run
const MAX_PROLOGUE: usize = 64;
const REL_JUMP_LEN: usize = 5;
const ABS_JUMP_LEN: usize = 14;

struct Hook {
    name: String,
    target: usize,
    detour: usize,
    kind: HookKind,
    trampoline: usize,
    saved_prologue: Vec<u8>,
    /// Patch plus NOP fill; same length as `saved_prologue`
    patch: Vec<u8>,
    active: bool,
}

impl Hook {
    fn info(&self) -> HookInfo {
        HookInfo {
            name: self.name.clone(),
            target: self.target,
            detour: self.detour,
            trampoline: self.trampoline,
            kind: self.kind,
            active: self.active,
        }
    }
}

pub struct HookEngine {
    mem: Arc<MemoryAccess>,
    hooks: Mutex<HashMap<String, Hook>>,
}

impl HookEngine {
    pub fn new(mem: Arc<MemoryAccess>) -> Self {
        Self {
            mem,
            hooks: Mutex::new(HashMap::new()),
        }
    }

    /// Install a hook redirecting `target` to `detour`.
    ///
    /// The detour may fire on any host thread the moment the patch lands;
    /// its body must be safe to enter concurrently and re-entrantly. The
    /// engine only serializes the patching itself.
    pub fn install(
        &self,
        name: &str,
        target: usize,
        detour: usize,
        kind: HookKind,
    ) -> Result<HookInfo> {
        let mut hooks = self.hooks.lock();

        if hooks.contains_key(name) {
            return Err(Error::Hook(format!("Hook name already in use: {}", name)));
        }
        if hooks.values().any(|h| h.target == target) {
            return Err(Error::Hook(format!("Target already hooked: {:#x}", target)));
        }

        let kind = resolve_kind(target, detour, kind)?;
        let patch_size = kind.patch_len();

        // Walk the prologue to the instruction boundary covering the patch
        let mut boundaries = Vec::new();
        let mut save_size = 0;
        while save_size < patch_size {
            let window = self
                .read_code(target + save_size)
                .ok_or(Error::InvalidAddress(target))?;
            let len = lde::instruction_length_native(&window);
            if len == 0 {
                return Err(Error::Decode {
                    address: target + save_size,
                    message: "undecodable instruction in prologue".to_string(),
                });
            }
            if is_rel8_branch(&window) {
                return Err(Error::Decode {
                    address: target + save_size,
                    message: "rel8 branch in prologue cannot be relocated".to_string(),
                });
            }
            boundaries.push((save_size, len));
            save_size += len;
            if save_size > MAX_PROLOGUE {
                return Err(Error::Hook("prologue walk ran away".to_string()));
            }
        }

        let saved_prologue = self
            .mem
            .read_bytes(target, save_size)
            .ok_or(Error::InvalidAddress(target))?;

        // Indirect 32-bit absolute patches keep their pointer slot inside
        // the trampoline allocation
        let slot_offset = save_size + ABS_JUMP_LEN;
        let needs_slot = !cfg!(target_pointer_width = "64") && kind == HookKind::AbsoluteJump;
        let alloc_size = slot_offset + if needs_slot { 8 } else { 0 };

        let trampoline = self
            .mem
            .allocate(alloc_size, Protection::rwx())
            .ok_or_else(|| Error::Hook("trampoline allocation failed".to_string()))?;

        let built = build_trampoline(&saved_prologue, &boundaries, target, trampoline);
        let mut tramp_bytes = match built {
            Ok(bytes) => bytes,
            Err(e) => {
                self.mem.free(trampoline);
                return Err(e);
            }
        };
        if needs_slot {
            tramp_bytes.resize(slot_offset, NOP);
            tramp_bytes.extend_from_slice(&(detour as u32).to_ne_bytes());
        }

        if !self.mem.write_bytes(trampoline, &tramp_bytes) {
            self.mem.free(trampoline);
            return Err(Error::Hook("trampoline write failed".to_string()));
        }

        // Build and apply the patch
        let mut patch = encode_patch(kind, target, detour, trampoline + slot_offset);
        patch.resize(save_size, NOP);

        if !self.mem.write_bytes(target, &patch) {
            self.mem.free(trampoline);
            return Err(Error::MemoryAccess {
                address: target,
                message: "patch write failed".to_string(),
            });
        }

        let hook = Hook {
            name: name.to_string(),
            target,
            detour,
            kind,
            trampoline,
            saved_prologue,
            patch,
            active: true,
        };
        let result = hook.info();

        info!(
            target: "spyglass_core::hooks",
            name,
            address = format!("{:#x}", target),
            detour = format!("{:#x}", detour),
            kind = ?kind,
            save_size,
            "hook installed"
        );

        hooks.insert(name.to_string(), hook);
        Ok(result)
    }

    /// Remove a hook: restore the saved prologue byte-for-byte and free the
    /// trampoline.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut hooks = self.hooks.lock();
        let hook = hooks
            .get(name)
            .ok_or_else(|| Error::Hook(format!("No such hook: {}", name)))?;

        if !self.mem.write_bytes(hook.target, &hook.saved_prologue) {
            return Err(Error::MemoryAccess {
                address: hook.target,
                message: "prologue restore failed".to_string(),
            });
        }

        if let Some(hook) = hooks.remove(name) {
            self.mem.free(hook.trampoline);
        }
        info!(target: "spyglass_core::hooks", name, "hook removed");
        Ok(())
    }

    /// Enable a disabled hook by rewriting the patch in place.
    pub fn enable(&self, name: &str) -> Result<bool> {
        self.swap(name, true)
    }

    /// Disable an installed hook by restoring the prologue; the record and
    /// trampoline stay alive.
    pub fn disable(&self, name: &str) -> Result<bool> {
        self.swap(name, false)
    }

    /// Flip a hook's state; returns the new state.
    pub fn toggle(&self, name: &str) -> Result<bool> {
        let active = {
            let hooks = self.hooks.lock();
            hooks
                .get(name)
                .ok_or_else(|| Error::Hook(format!("No such hook: {}", name)))?
                .active
        };
        self.swap(name, !active)
    }

    fn swap(&self, name: &str, activate: bool) -> Result<bool> {
        let mut hooks = self.hooks.lock();
        let hook = hooks
            .get_mut(name)
            .ok_or_else(|| Error::Hook(format!("No such hook: {}", name)))?;

        if hook.active == activate {
            return Ok(hook.active);
        }

        let bytes = if activate {
            &hook.patch
        } else {
            &hook.saved_prologue
        };
        if !self.mem.write_bytes(hook.target, bytes) {
            return Err(Error::MemoryAccess {
                address: hook.target,
                message: "prologue swap failed".to_string(),
            });
        }
        hook.active = activate;
        debug!(target: "spyglass_core::hooks", name, active = activate, "hook toggled");
        Ok(activate)
    }

    pub fn list(&self) -> Vec<HookInfo> {
        let mut infos: Vec<HookInfo> = self.hooks.lock().values().map(Hook::info).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn is_hooked(&self, target: usize) -> bool {
        self.hooks.lock().values().any(|h| h.target == target)
    }

    /// Uninstall everything; used at shutdown.
    pub fn remove_all(&self) {
        let names: Vec<String> = self.hooks.lock().keys().cloned().collect();
        for name in names {
            if let Err(e) = self.remove(&name) {
                tracing::warn!(target: "spyglass_core::hooks", name = %name, error = %e, "failed to remove hook");
            }
        }
    }

    /// Read a window of code bytes, shrinking near region ends.
    fn read_code(&self, address: usize) -> Option<Vec<u8>> {
        for len in [16usize, 8, 4, 2, 1] {
            if let Some(bytes) = self.mem.read_bytes(address, len) {
                return Some(bytes);
            }
        }
        None
    }
}

/// Resolve `Auto` and validate explicit kinds against the host.
fn resolve_kind(target: usize, detour: usize, kind: HookKind) -> Result<HookKind> {
    let wide = cfg!(target_pointer_width = "64");
    match kind {
        HookKind::Auto => {
            if rel32_reachable(target + REL_JUMP_LEN, detour) {
                Ok(HookKind::RelativeJump)
            } else if wide {
                Ok(HookKind::AbsoluteJump)
            } else {
                // 32-bit displacements always reach
                Ok(HookKind::RelativeJump)
            }
        }
        HookKind::RelativeJump => {
            if rel32_reachable(target + REL_JUMP_LEN, detour) {
                Ok(HookKind::RelativeJump)
            } else {
                Err(Error::Hook(
                    "detour out of rel32 range for relative jump".to_string(),
                ))
            }
        }
        HookKind::PushRet => {
            if wide {
                Err(Error::Hook(
                    "push/ret patch is not available on 64-bit hosts".to_string(),
                ))
            } else {
                Ok(HookKind::PushRet)
            }
        }
        HookKind::AbsoluteJump => Ok(HookKind::AbsoluteJump),
    }
}

fn rel32_reachable(from: usize, to: usize) -> bool {
    let disp = to as i64 - from as i64;
    disp >= i32::MIN as i64 && disp <= i32::MAX as i64
}

/// Copy the prologue and fix up PC-relative rel32 operands so every branch
/// still lands on its original destination, then append the jump back.
fn build_trampoline(
    prologue: &[u8],
    boundaries: &[(usize, usize)],
    target: usize,
    trampoline: usize,
) -> Result<Vec<u8>> {
    let mut bytes = prologue.to_vec();

    for &(offset, len) in boundaries {
        relocate_instruction(
            &mut bytes[offset..offset + len],
            target + offset,
            trampoline + offset,
        )?;
    }

    // Jump back to the first instruction past the patch
    let resume = target + prologue.len();
    let tail_at = trampoline + prologue.len();
    if rel32_reachable(tail_at + REL_JUMP_LEN, resume) {
        bytes.push(0xE9);
        let rel = (resume as i64 - (tail_at + REL_JUMP_LEN) as i64) as i32;
        bytes.extend_from_slice(&rel.to_ne_bytes());
    } else {
        bytes.extend_from_slice(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
        bytes.extend_from_slice(&(resume as u64).to_ne_bytes());
    }

    Ok(bytes)
}

/// Recompute the rel32 displacement of `CALL rel32`, `JMP rel32` and
/// `Jcc rel32` for an instruction copied from `old_ip` to `new_ip`.
fn relocate_instruction(insn: &mut [u8], old_ip: usize, new_ip: usize) -> Result<()> {
    let prefix_len = insn
        .iter()
        .take_while(|&&b| is_prefix_byte(b))
        .count();
    let op = &insn[prefix_len..];

    let rel_offset = match op {
        [0xE8, ..] | [0xE9, ..] => prefix_len + 1,
        [0x0F, second, ..] if (0x80..=0x8F).contains(second) => prefix_len + 2,
        _ => return Ok(()),
    };

    let len = insn.len();
    let old_rel = i32::from_ne_bytes(
        insn[rel_offset..rel_offset + 4]
            .try_into()
            .map_err(|_| Error::Decode {
                address: old_ip,
                message: "truncated rel32 operand".to_string(),
            })?,
    );

    let destination = (old_ip + len) as i64 + old_rel as i64;
    let new_rel = destination - (new_ip + len) as i64;
    if new_rel < i32::MIN as i64 || new_rel > i32::MAX as i64 {
        return Err(Error::Hook(
            "relocated branch target out of rel32 range".to_string(),
        ));
    }

    insn[rel_offset..rel_offset + 4].copy_from_slice(&(new_rel as i32).to_ne_bytes());
    Ok(())
}

fn is_prefix_byte(byte: u8) -> bool {
    matches!(
        byte,
        0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 | 0x66 | 0x67 | 0xF0 | 0xF2 | 0xF3
    ) || (cfg!(target_pointer_width = "64") && (0x40..=0x4F).contains(&byte))
}

/// rel8 control flow cannot be preserved by rel32 relocation.
fn is_rel8_branch(window: &[u8]) -> bool {
    let prefix_len = window.iter().take_while(|&&b| is_prefix_byte(b)).count();
    matches!(
        window.get(prefix_len),
        Some(0xEB) | Some(0x70..=0x7F) | Some(0xE0..=0xE3)
    )
}

/// Encode the bytes written at the target for the chosen kind.
fn encode_patch(kind: HookKind, target: usize, detour: usize, slot: usize) -> Vec<u8> {
    match kind {
        HookKind::RelativeJump | HookKind::Auto => {
            let rel = (detour as i64 - (target + REL_JUMP_LEN) as i64) as i32;
            let mut patch = vec![0xE9];
            patch.extend_from_slice(&rel.to_ne_bytes());
            patch
        }
        HookKind::AbsoluteJump => {
            if cfg!(target_pointer_width = "64") {
                let mut patch = vec![0xFF, 0x25, 0x00, 0x00, 0x00, 0x00];
                patch.extend_from_slice(&(detour as u64).to_ne_bytes());
                patch
            } else {
                let mut patch = vec![0xFF, 0x25];
                patch.extend_from_slice(&(slot as u32).to_ne_bytes());
                patch
            }
        }
        HookKind::PushRet => {
            let mut patch = vec![0x68];
            patch.extend_from_slice(&(detour as u32).to_ne_bytes());
            patch.push(0xC3);
            patch
        }
    }
}
