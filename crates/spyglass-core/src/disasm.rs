//! Listing disassembler
//!
//! Decodes the practical subset needed for a readable listing: stack ops,
//! MOV forms, basic arithmetic, conditional and unconditional branches and
//! indirect calls/jumps. Anything else becomes `db <byte>` with length 1, so
//! decoding never stalls. Control-flow instructions carry the absolute
//! destination computed from their own address.

use spyglass_common::Instruction;

/// Cap on instructions per request
const MAX_INSTRUCTIONS: usize = 100;

const REGS32: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];
const REGS64: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];
const REGS8: [&str; 8] = ["al", "cl", "dl", "bl", "ah", "ch", "dh", "bh"];

/// Disassemble a byte buffer into a listing.
pub fn disassemble(address: usize, bytes: &[u8], mode64: bool) -> Vec<Instruction> {
    let mut instructions = Vec::new();
    let mut offset = 0;

    while offset < bytes.len() && instructions.len() < MAX_INSTRUCTIONS {
        let insn = decode_one(address + offset, &bytes[offset..], mode64)
            .unwrap_or_else(|| Instruction::raw_byte(address + offset, bytes[offset]));
        offset += insn.length;
        instructions.push(insn);
    }

    instructions
}

/// Disassemble for the host architecture.
pub fn disassemble_native(address: usize, bytes: &[u8]) -> Vec<Instruction> {
    disassemble(address, bytes, cfg!(target_pointer_width = "64"))
}

struct Decoded {
    mnemonic: String,
    operands: String,
    length: usize,
    is_jump: bool,
    is_call: bool,
    is_ret: bool,
    target: Option<usize>,
}

fn decode_one(address: usize, code: &[u8], mode64: bool) -> Option<Instruction> {
    let mut pos = 0;
    let mut rex = 0u8;
    if mode64 {
        if let Some(&b) = code.first() {
            if (0x40..=0x4F).contains(&b) {
                rex = b;
                pos = 1;
            }
        }
    }

    let decoded = decode_opcode(address, code, pos, mode64, rex)?;
    let length = decoded.length;
    if length == 0 || length > code.len() {
        return None;
    }

    Some(Instruction {
        address,
        bytes: code[..length].to_vec(),
        mnemonic: decoded.mnemonic,
        operands: decoded.operands,
        length,
        is_jump: decoded.is_jump,
        is_call: decoded.is_call,
        is_ret: decoded.is_ret,
        target: decoded.target,
    })
}

fn decode_opcode(
    address: usize,
    code: &[u8],
    pos: usize,
    mode64: bool,
    rex: u8,
) -> Option<Decoded> {
    let op = *code.get(pos)?;
    let wide = mode64 && rex & 0x08 != 0;
    let reg_ext = if rex & 0x01 != 0 { 8 } else { 0 };

    let simple = |mnemonic: &str, operands: String| Decoded {
        mnemonic: mnemonic.to_string(),
        operands,
        length: pos + 1,
        is_jump: false,
        is_call: false,
        is_ret: false,
        target: None,
    };

    match op {
        0x90 => Some(simple("nop", String::new())),
        0xCC => Some(simple("int3", String::new())),
        0xC3 => Some(Decoded {
            is_ret: true,
            ..simple("ret", String::new())
        }),
        0xCB => Some(Decoded {
            is_ret: true,
            ..simple("retf", String::new())
        }),
        0xC2 => {
            let imm = u16::from_le_bytes([*code.get(pos + 1)?, *code.get(pos + 2)?]);
            Some(Decoded {
                mnemonic: "ret".to_string(),
                operands: format!("0x{:x}", imm),
                length: pos + 3,
                is_jump: false,
                is_call: false,
                is_ret: true,
                target: None,
            })
        }
        // PUSH/POP r
        0x50..=0x57 => {
            let reg = stack_reg((op - 0x50) as usize + reg_ext, mode64);
            Some(simple("push", reg))
        }
        0x58..=0x5F => {
            let reg = stack_reg((op - 0x58) as usize + reg_ext, mode64);
            Some(simple("pop", reg))
        }
        0x6A => {
            let imm = *code.get(pos + 1)? as i8;
            Some(Decoded {
                mnemonic: "push".to_string(),
                operands: format!("0x{:x}", imm as i32),
                length: pos + 2,
                is_jump: false,
                is_call: false,
                is_ret: false,
                target: None,
            })
        }
        0x68 => {
            let imm = i32::from_le_bytes(slice4(code, pos + 1)?);
            Some(Decoded {
                mnemonic: "push".to_string(),
                operands: format!("0x{:x}", imm),
                length: pos + 5,
                is_jump: false,
                is_call: false,
                is_ret: false,
                target: None,
            })
        }
        // MOV r8, imm8
        0xB0..=0xB7 => {
            let imm = *code.get(pos + 1)?;
            Some(Decoded {
                mnemonic: "mov".to_string(),
                operands: format!("{}, 0x{:x}", REGS8[(op - 0xB0) as usize], imm),
                length: pos + 2,
                is_jump: false,
                is_call: false,
                is_ret: false,
                target: None,
            })
        }
        // MOV r, imm
        0xB8..=0xBF => {
            let reg = gp_reg((op - 0xB8) as usize + reg_ext, wide);
            if wide {
                let mut imm = [0u8; 8];
                imm.copy_from_slice(code.get(pos + 1..pos + 9)?);
                Some(Decoded {
                    mnemonic: "mov".to_string(),
                    operands: format!("{}, 0x{:x}", reg, u64::from_le_bytes(imm)),
                    length: pos + 9,
                    is_jump: false,
                    is_call: false,
                    is_ret: false,
                    target: None,
                })
            } else {
                let imm = u32::from_le_bytes(slice4(code, pos + 1)?);
                Some(Decoded {
                    mnemonic: "mov".to_string(),
                    operands: format!("{}, 0x{:x}", reg, imm),
                    length: pos + 5,
                    is_jump: false,
                    is_call: false,
                    is_ret: false,
                    target: None,
                })
            }
        }
        // MOV and arithmetic with ModR/M
        0x89 | 0x8B => modrm_insn(code, pos, "mov", op & 2 != 0, mode64, wide),
        0x01 | 0x03 => modrm_insn(code, pos, "add", op & 2 != 0, mode64, wide),
        0x29 | 0x2B => modrm_insn(code, pos, "sub", op & 2 != 0, mode64, wide),
        0x31 | 0x33 => modrm_insn(code, pos, "xor", op & 2 != 0, mode64, wide),
        0x39 | 0x3B => modrm_insn(code, pos, "cmp", op & 2 != 0, mode64, wide),
        0x85 => modrm_insn(code, pos, "test", false, mode64, wide),
        0x8D => modrm_insn(code, pos, "lea", true, mode64, wide),
        // CALL/JMP rel32
        0xE8 | 0xE9 => {
            let rel = i32::from_le_bytes(slice4(code, pos + 1)?);
            let length = pos + 5;
            let target = (address + length).wrapping_add(rel as isize as usize);
            Some(Decoded {
                mnemonic: if op == 0xE8 { "call" } else { "jmp" }.to_string(),
                operands: format!("0x{:x}", target),
                length,
                is_jump: op == 0xE9,
                is_call: op == 0xE8,
                is_ret: false,
                target: Some(target),
            })
        }
        // JMP rel8
        0xEB => {
            let rel = *code.get(pos + 1)? as i8;
            let length = pos + 2;
            let target = (address + length).wrapping_add(rel as isize as usize);
            Some(Decoded {
                mnemonic: "jmp".to_string(),
                operands: format!("0x{:x}", target),
                length,
                is_jump: true,
                is_call: false,
                is_ret: false,
                target: Some(target),
            })
        }
        // Jcc rel8
        0x70..=0x7F => {
            let rel = *code.get(pos + 1)? as i8;
            let length = pos + 2;
            let target = (address + length).wrapping_add(rel as isize as usize);
            Some(Decoded {
                mnemonic: cc_name(op & 0x0F).to_string(),
                operands: format!("0x{:x}", target),
                length,
                is_jump: true,
                is_call: false,
                is_ret: false,
                target: Some(target),
            })
        }
        // Two-byte map: Jcc rel32
        0x0F => {
            let op2 = *code.get(pos + 1)?;
            if (0x80..=0x8F).contains(&op2) {
                let rel = i32::from_le_bytes(slice4(code, pos + 2)?);
                let length = pos + 6;
                let target = (address + length).wrapping_add(rel as isize as usize);
                Some(Decoded {
                    mnemonic: cc_name(op2 & 0x0F).to_string(),
                    operands: format!("0x{:x}", target),
                    length,
                    is_jump: true,
                    is_call: false,
                    is_ret: false,
                    target: Some(target),
                })
            } else {
                None
            }
        }
        // Indirect CALL (/2) and JMP (/4)
        0xFF => {
            let modrm = *code.get(pos + 1)?;
            let reg = (modrm >> 3) & 7;
            let (mnemonic, is_call, is_jump) = match reg {
                2 => ("call", true, false),
                4 => ("jmp", false, true),
                _ => return None,
            };
            let (consumed, operand) = memory_operand(code, pos + 2, modrm, mode64, true)?;
            Some(Decoded {
                mnemonic: mnemonic.to_string(),
                operands: operand,
                length: pos + 2 + consumed,
                is_jump,
                is_call,
                is_ret: false,
                target: None,
            })
        }
        _ => None,
    }
}

/// Generic `op reg, r/m` / `op r/m, reg` decoding.
fn modrm_insn(
    code: &[u8],
    pos: usize,
    mnemonic: &str,
    reg_first: bool,
    mode64: bool,
    wide: bool,
) -> Option<Decoded> {
    let modrm = *code.get(pos + 1)?;
    let reg = gp_reg(((modrm >> 3) & 7) as usize, wide);
    let (consumed, rm) = memory_operand(code, pos + 2, modrm, mode64, wide)?;

    let operands = if reg_first {
        format!("{}, {}", reg, rm)
    } else {
        format!("{}, {}", rm, reg)
    };

    Some(Decoded {
        mnemonic: mnemonic.to_string(),
        operands,
        length: pos + 2 + consumed,
        is_jump: false,
        is_call: false,
        is_ret: false,
        target: None,
    })
}

/// Render the r/m operand; returns (extra bytes consumed, text).
fn memory_operand(
    code: &[u8],
    pos: usize,
    modrm: u8,
    mode64: bool,
    wide: bool,
) -> Option<(usize, String)> {
    let md = modrm >> 6;
    let rm = (modrm & 7) as usize;

    if md == 3 {
        return Some((0, gp_reg(rm, wide)));
    }

    // Base register / special forms
    let mut consumed = 0;
    let base = if rm == 4 {
        let sib = *code.get(pos)?;
        consumed += 1;
        let base = (sib & 7) as usize;
        if md == 0 && base == 5 {
            None // disp32-only base
        } else {
            Some(addr_reg(base, mode64))
        }
    } else if md == 0 && rm == 5 {
        if mode64 {
            Some("rip".to_string())
        } else {
            None
        }
    } else {
        Some(addr_reg(rm, mode64))
    };

    let disp: i64 = match md {
        1 => {
            let d = *code.get(pos + consumed)? as i8;
            consumed += 1;
            d as i64
        }
        2 => {
            let d = i32::from_le_bytes(slice4(code, pos + consumed)?);
            consumed += 4;
            d as i64
        }
        0 if base.is_none() || (md == 0 && rm == 5) => {
            let d = i32::from_le_bytes(slice4(code, pos + consumed)?);
            consumed += 4;
            d as i64
        }
        _ => 0,
    };

    let text = match (base, disp) {
        (Some(base), 0) => format!("[{}]", base),
        (Some(base), d) if d < 0 => format!("[{}-0x{:x}]", base, -d),
        (Some(base), d) => format!("[{}+0x{:x}]", base, d),
        (None, d) => format!("[0x{:x}]", d as u32),
    };

    Some((consumed, text))
}

fn gp_reg(index: usize, wide: bool) -> String {
    if wide {
        REGS64.get(index).copied().unwrap_or("???").to_string()
    } else {
        REGS32.get(index & 7).copied().unwrap_or("???").to_string()
    }
}

/// PUSH/POP default to the full register width on 64-bit hosts.
fn stack_reg(index: usize, mode64: bool) -> String {
    if mode64 {
        REGS64.get(index).copied().unwrap_or("???").to_string()
    } else {
        REGS32.get(index & 7).copied().unwrap_or("???").to_string()
    }
}

fn addr_reg(index: usize, mode64: bool) -> String {
    gp_reg(index, mode64)
}

fn cc_name(cc: u8) -> &'static str {
    match cc {
        0x0 => "jo",
        0x1 => "jno",
        0x2 => "jb",
        0x3 => "jae",
        0x4 => "je",
        0x5 => "jne",
        0x6 => "jbe",
        0x7 => "ja",
        0x8 => "js",
        0x9 => "jns",
        0xA => "jp",
        0xB => "jnp",
        0xC => "jl",
        0xD => "jge",
        0xE => "jle",
        _ => "jg",
    }
}

fn slice4(code: &[u8], pos: usize) -> Option<[u8; 4]> {
    code.get(pos..pos + 4)?.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_listing() {
        // push ebp; mov ebp, esp; nop; ret  (32-bit)
        let code = [0x55, 0x8B, 0xEC, 0x90, 0xC3];
        let listing = disassemble(0x1000, &code, false);

        assert_eq!(listing.len(), 4);
        assert_eq!(listing[0].mnemonic, "push");
        assert_eq!(listing[0].operands, "ebp");
        assert_eq!(listing[1].mnemonic, "mov");
        assert_eq!(listing[1].operands, "ebp, esp");
        assert_eq!(listing[2].mnemonic, "nop");
        assert_eq!(listing[3].mnemonic, "ret");
        assert!(listing[3].is_ret);
        assert_eq!(listing[3].address, 0x1004);
    }

    #[test]
    fn test_call_target() {
        // call +0x10 from 0x1000: target = 0x1000 + 5 + 0x10
        let code = [0xE8, 0x10, 0x00, 0x00, 0x00];
        let listing = disassemble(0x1000, &code, true);
        assert_eq!(listing.len(), 1);
        assert!(listing[0].is_call);
        assert_eq!(listing[0].target, Some(0x1015));
        assert_eq!(listing[0].operands, "0x1015");
    }

    #[test]
    fn test_backward_jump_target() {
        // jmp rel8 -2 at 0x2000: target = 0x2002 - 2 = 0x2000
        let code = [0xEB, 0xFE];
        let listing = disassemble(0x2000, &code, true);
        assert!(listing[0].is_jump);
        assert_eq!(listing[0].target, Some(0x2000));
    }

    #[test]
    fn test_conditional_jumps() {
        let short = disassemble(0x1000, &[0x74, 0x05], true);
        assert_eq!(short[0].mnemonic, "je");
        assert_eq!(short[0].target, Some(0x1007));
        assert!(short[0].is_jump);

        let near = disassemble(0x1000, &[0x0F, 0x85, 0x00, 0x01, 0x00, 0x00], true);
        assert_eq!(near[0].mnemonic, "jne");
        assert_eq!(near[0].length, 6);
        assert_eq!(near[0].target, Some(0x1106));
    }

    #[test]
    fn test_indirect_branches() {
        let call = disassemble(0x1000, &[0xFF, 0xD0], true);
        assert_eq!(call[0].mnemonic, "call");
        assert!(call[0].is_call);
        assert_eq!(call[0].operands, "rax");
        assert!(call[0].target.is_none());

        let jmp = disassemble(0x1000, &[0xFF, 0x25, 0, 0, 0, 0], true);
        assert_eq!(jmp[0].mnemonic, "jmp");
        assert!(jmp[0].is_jump);
        assert_eq!(jmp[0].length, 6);
        assert_eq!(jmp[0].operands, "[rip]");
    }

    #[test]
    fn test_unknown_bytes_become_db() {
        let listing = disassemble(0x1000, &[0xF4, 0x90], true);
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].mnemonic, "db");
        assert_eq!(listing[0].length, 1);
        assert_eq!(listing[1].mnemonic, "nop");
    }

    #[test]
    fn test_rex_prologue() {
        // push rbp; mov rbp, rsp
        let listing = disassemble(0x1000, &[0x55, 0x48, 0x89, 0xE5], true);
        assert_eq!(listing[0].operands, "rbp");
        assert_eq!(listing[1].mnemonic, "mov");
        assert_eq!(listing[1].operands, "rbp, rsp");
        assert_eq!(listing[1].length, 3);
    }

    #[test]
    fn test_mov_imm() {
        let listing = disassemble(0x1000, &[0xB8, 0x2A, 0x00, 0x00, 0x00], true);
        assert_eq!(listing[0].mnemonic, "mov");
        assert_eq!(listing[0].operands, "eax, 0x2a");

        let wide = disassemble(0x1000, &[0x48, 0xB8, 1, 0, 0, 0, 0, 0, 0, 0], true);
        assert_eq!(wide[0].operands, "rax, 0x1");
        assert_eq!(wide[0].length, 10);
    }

    #[test]
    fn test_memory_operands() {
        // mov eax, [rbp-4]
        let listing = disassemble(0x1000, &[0x8B, 0x45, 0xFC], true);
        assert_eq!(listing[0].operands, "eax, [rbp-0x4]");

        // mov [rsp+8], ecx (SIB base=rsp)
        let sib = disassemble(0x1000, &[0x89, 0x4C, 0x24, 0x08], true);
        assert_eq!(sib[0].operands, "[rsp+0x8], ecx");
    }

    #[test]
    fn test_lengths_agree_with_lde() {
        let cases: [&[u8]; 8] = [
            &[0x55],
            &[0x8B, 0x45, 0xFC],
            &[0xE8, 1, 2, 3, 4],
            &[0xEB, 0x10],
            &[0x74, 0x05],
            &[0x0F, 0x84, 0, 0, 0, 0],
            &[0xFF, 0xD0],
            &[0x68, 1, 2, 3, 4],
        ];
        for code in cases {
            let listing = disassemble(0x1000, code, true);
            assert_eq!(
                listing[0].length,
                crate::lde::instruction_length(code, true),
                "{:02x?}",
                code
            );
        }
    }

    #[test]
    fn test_seed_prologue_listing() {
        // push ebp; mov ebp, esp; sub esp, 0x20: classic 32-bit prologue
        let code = [0x55, 0x8B, 0xEC, 0x83, 0xEC, 0x20];
        let listing = disassemble(0x401000, &code, false);
        assert_eq!(listing[0].mnemonic, "push");
        assert_eq!(listing[1].mnemonic, "mov");
        // 0x83 group is not in the listing subset; bytes still advance
        let total: usize = listing.iter().map(|i| i.length).sum();
        assert_eq!(total, code.len());
    }
}
