//! x86/x64 length disassembler
//!
//! Decodes only the byte length of a single instruction: legacy prefixes,
//! REX (64-bit mode), the one-byte map, the `0F` map and the `0F 38` /
//! `0F 3A` escapes, ModR/M with SIB and all displacement forms including
//! `[rip+disp32]`, and the immediate classes the hook engine meets in real
//! prologues.
//!
//! `0` means undecodable. Callers treat that as a hard failure, never as a
//! length.

/// Architectural limit; anything longer is a decode bug.
const MAX_INSTRUCTION_LEN: usize = 15;

/// Immediate operand class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Imm {
    None,
    /// imm8 / rel8
    B,
    /// imm16
    W,
    /// imm16 or imm32 by operand-size
    Z,
    /// imm64 (`MOV r64, imm64`)
    Q,
    /// ptr16:16/32 far pointer
    Far,
    /// moffs, sized by address-size
    Moffs,
    /// ENTER imm16, imm8
    Enter,
}

/// Length of one instruction at the start of `code`, or 0 if it cannot be
/// decoded. `mode64` selects 64-bit decoding (REX, `[rip+disp32]`).
pub fn instruction_length(code: &[u8], mode64: bool) -> usize {
    match decode(code, mode64) {
        Some(len) if len <= MAX_INSTRUCTION_LEN && len <= code.len() => len,
        _ => 0,
    }
}

/// Length of one instruction decoded for the host architecture.
pub fn instruction_length_native(code: &[u8]) -> usize {
    instruction_length(code, cfg!(target_pointer_width = "64"))
}

fn decode(code: &[u8], mode64: bool) -> Option<usize> {
    let mut pos = 0;
    let mut op_size_16 = false;
    let mut addr_override = false;
    let mut rex_w = false;

    // Legacy prefixes and, in 64-bit mode, REX
    loop {
        let byte = *code.get(pos)?;
        match byte {
            0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 | 0xF0 | 0xF2 | 0xF3 => {}
            0x66 => op_size_16 = true,
            0x67 => addr_override = true,
            0x40..=0x4F if mode64 => rex_w = byte & 0x08 != 0,
            _ => break,
        }
        pos += 1;
        if pos > MAX_INSTRUCTION_LEN {
            return None;
        }
    }

    let opcode = *code.get(pos)?;
    pos += 1;

    let (has_modrm, mut imm) = if opcode == 0x0F {
        let op2 = *code.get(pos)?;
        pos += 1;
        match op2 {
            0x38 => {
                let _ = *code.get(pos)?; // third opcode byte
                pos += 1;
                (true, Imm::None)
            }
            0x3A => {
                let _ = *code.get(pos)?;
                pos += 1;
                (true, Imm::B)
            }
            _ => two_byte(op2)?,
        }
    } else {
        one_byte(opcode, mode64, rex_w)?
    };

    if has_modrm {
        let modrm = *code.get(pos)?;
        pos += 1;
        pos += modrm_tail(code, pos, modrm, mode64, addr_override)?;

        // Group 3: TEST r/m, imm lives behind /0 and /1
        if opcode == 0xF6 || opcode == 0xF7 {
            let reg = (modrm >> 3) & 7;
            if reg <= 1 {
                imm = if opcode == 0xF6 { Imm::B } else { Imm::Z };
            }
        }
    }

    pos += imm_len(imm, op_size_16, addr_override, mode64);
    if pos > code.len() {
        return None;
    }
    Some(pos)
}

/// SIB + displacement bytes following a ModR/M byte.
fn modrm_tail(
    code: &[u8],
    pos: usize,
    modrm: u8,
    mode64: bool,
    addr_override: bool,
) -> Option<usize> {
    let md = modrm >> 6;
    let rm = modrm & 7;

    if md == 3 {
        return Some(0);
    }

    // 16-bit addressing only exists outside long mode
    if addr_override && !mode64 {
        return Some(match (md, rm) {
            (0, 6) => 2,
            (0, _) => 0,
            (1, _) => 1,
            _ => 2,
        });
    }

    let mut len = 0;
    let mut disp = match (md, rm) {
        // mod=00 rm=101: [disp32], or [rip+disp32] in 64-bit mode
        (0, 5) => 4,
        (0, _) => 0,
        (1, _) => 1,
        _ => 4,
    };

    if rm == 4 {
        let sib = *code.get(pos)?;
        len += 1;
        // SIB base 101 with mod=00 carries disp32
        if md == 0 && sib & 7 == 5 {
            disp = 4;
        }
    }

    Some(len + disp)
}

fn imm_len(imm: Imm, op_size_16: bool, addr_override: bool, mode64: bool) -> usize {
    let z = if op_size_16 { 2 } else { 4 };
    match imm {
        Imm::None => 0,
        Imm::B => 1,
        Imm::W => 2,
        Imm::Z => z,
        Imm::Q => 8,
        Imm::Far => z + 2,
        Imm::Moffs => match (mode64, addr_override) {
            (true, false) => 8,
            (true, true) => 4,
            (false, false) => 4,
            (false, true) => 2,
        },
        Imm::Enter => 3,
    }
}

/// One-byte opcode map: (has ModR/M, immediate class). `None` = undecodable.
fn one_byte(op: u8, mode64: bool, rex_w: bool) -> Option<(bool, Imm)> {
    Some(match op {
        // ADD/OR/ADC/SBB/AND/SUB/XOR/CMP block, plus the legacy one-byte
        // encodings sharing its low-bit layout
        0x00..=0x3F => match op & 7 {
            0..=3 => (true, Imm::None),
            4 => (false, Imm::B),
            5 => (false, Imm::Z),
            _ => (false, Imm::None),
        },
        // INC/DEC in 32-bit mode; REX lands here first in 64-bit
        0x40..=0x4F => (false, Imm::None),
        // PUSH/POP r
        0x50..=0x5F => (false, Imm::None),
        0x60 | 0x61 => (false, Imm::None),
        0x62 => {
            if mode64 {
                return None; // EVEX territory
            }
            (true, Imm::None)
        }
        0x63 => (true, Imm::None),
        0x68 => (false, Imm::Z),
        0x69 => (true, Imm::Z),
        0x6A => (false, Imm::B),
        0x6B => (true, Imm::B),
        0x6C..=0x6F => (false, Imm::None),
        // Jcc rel8
        0x70..=0x7F => (false, Imm::B),
        // Group 1
        0x80 => (true, Imm::B),
        0x81 => (true, Imm::Z),
        0x82 => {
            if mode64 {
                return None;
            }
            (true, Imm::B)
        }
        0x83 => (true, Imm::B),
        // TEST/XCHG/MOV/LEA/POP r/m
        0x84..=0x8F => (true, Imm::None),
        0x90..=0x99 => (false, Imm::None),
        0x9A => {
            if mode64 {
                return None;
            }
            (false, Imm::Far)
        }
        0x9B..=0x9F => (false, Imm::None),
        // MOV AL/eAX, moffs
        0xA0..=0xA3 => (false, Imm::Moffs),
        0xA4..=0xA7 => (false, Imm::None),
        0xA8 => (false, Imm::B),
        0xA9 => (false, Imm::Z),
        0xAA..=0xAF => (false, Imm::None),
        // MOV r8, imm8
        0xB0..=0xB7 => (false, Imm::B),
        // MOV r, imm; imm64 with REX.W
        0xB8..=0xBF => {
            if mode64 && rex_w {
                (false, Imm::Q)
            } else {
                (false, Imm::Z)
            }
        }
        // Shift group imm8
        0xC0 | 0xC1 => (true, Imm::B),
        0xC2 => (false, Imm::W),
        0xC3 => (false, Imm::None),
        0xC4 | 0xC5 => {
            if mode64 {
                return None; // VEX territory
            }
            (true, Imm::None)
        }
        0xC6 => (true, Imm::B),
        0xC7 => (true, Imm::Z),
        0xC8 => (false, Imm::Enter),
        0xC9 => (false, Imm::None),
        0xCA => (false, Imm::W),
        0xCB | 0xCC | 0xCE | 0xCF => (false, Imm::None),
        0xCD => (false, Imm::B),
        // Shift group by 1/CL
        0xD0..=0xD3 => (true, Imm::None),
        0xD4 | 0xD5 => {
            if mode64 {
                return None;
            }
            (false, Imm::B)
        }
        0xD7 => (false, Imm::None),
        // x87
        0xD8..=0xDF => (true, Imm::None),
        // LOOP/JCXZ rel8, IN/OUT imm8
        0xE0..=0xE7 => (false, Imm::B),
        // CALL/JMP rel32
        0xE8 | 0xE9 => (false, Imm::Z),
        0xEA => {
            if mode64 {
                return None;
            }
            (false, Imm::Far)
        }
        0xEB => (false, Imm::B),
        0xEC..=0xEF => (false, Imm::None),
        0xF1 => (false, Imm::None),
        0xF4 | 0xF5 => (false, Imm::None),
        // Group 3: immediate resolved after ModR/M
        0xF6 | 0xF7 => (true, Imm::None),
        0xF8..=0xFD => (false, Imm::None),
        // INC/DEC/CALL/JMP/PUSH r/m
        0xFE | 0xFF => (true, Imm::None),
        _ => return None,
    })
}

/// Two-byte (`0F xx`) opcode map.
fn two_byte(op: u8) -> Option<(bool, Imm)> {
    Some(match op {
        0x00..=0x03 => (true, Imm::None),
        0x05..=0x09 | 0x0B | 0x0E => (false, Imm::None),
        0x0D => (true, Imm::None),
        0x10..=0x17 => (true, Imm::None),
        // Hint NOPs and prefetches
        0x18..=0x1F => (true, Imm::None),
        0x20..=0x23 => (true, Imm::None),
        0x28..=0x2F => (true, Imm::None),
        0x30..=0x37 => (false, Imm::None),
        // CMOVcc
        0x40..=0x4F => (true, Imm::None),
        0x50..=0x6F => (true, Imm::None),
        // PSHUF* / shift groups carry imm8
        0x70..=0x73 => (true, Imm::B),
        0x74..=0x76 => (true, Imm::None),
        0x77 => (false, Imm::None),
        0x78 | 0x79 => (true, Imm::None),
        0x7C..=0x7F => (true, Imm::None),
        // Jcc rel32
        0x80..=0x8F => (false, Imm::Z),
        // SETcc
        0x90..=0x9F => (true, Imm::None),
        0xA0..=0xA2 => (false, Imm::None),
        0xA3 => (true, Imm::None),
        0xA4 => (true, Imm::B),
        0xA5 => (true, Imm::None),
        0xA8..=0xAA => (false, Imm::None),
        0xAB => (true, Imm::None),
        0xAC => (true, Imm::B),
        0xAD..=0xAF => (true, Imm::None),
        0xB0..=0xB9 => (true, Imm::None),
        0xBA => (true, Imm::B),
        0xBB..=0xBF => (true, Imm::None),
        0xC0 | 0xC1 => (true, Imm::None),
        0xC2 => (true, Imm::B),
        0xC3 => (true, Imm::None),
        0xC4..=0xC6 => (true, Imm::B),
        0xC7 => (true, Imm::None),
        // BSWAP
        0xC8..=0xCF => (false, Imm::None),
        0xD0..=0xFF => (true, Imm::None),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn len64(code: &[u8]) -> usize {
        instruction_length(code, true)
    }

    #[test]
    fn test_single_byte_ops() {
        assert_eq!(len64(&[0x55]), 1); // push rbp
        assert_eq!(len64(&[0x5D]), 1); // pop rbp
        assert_eq!(len64(&[0x90]), 1); // nop
        assert_eq!(len64(&[0xC3]), 1); // ret
        assert_eq!(len64(&[0xCC]), 1); // int3
    }

    #[test]
    fn test_rex_prefixed() {
        assert_eq!(len64(&[0x48, 0x89, 0xE5]), 3); // mov rbp, rsp
        assert_eq!(len64(&[0x48, 0x83, 0xEC, 0x20]), 4); // sub rsp, 0x20
        assert_eq!(len64(&[0x41, 0x57]), 2); // push r15
        assert_eq!(len64(&[0x48, 0x31, 0xC0]), 3); // xor rax, rax
    }

    #[test]
    fn test_modrm_displacement_forms() {
        assert_eq!(len64(&[0x8B, 0x45, 0xFC]), 3); // mov eax, [rbp-4]
        assert_eq!(len64(&[0x8B, 0x85, 0x00, 0x01, 0x00, 0x00]), 6); // mov eax, [rbp+0x100]
        assert_eq!(len64(&[0x8B, 0x04, 0x24]), 3); // mov eax, [rsp] (SIB)
        assert_eq!(len64(&[0x8B, 0x44, 0x24, 0x08]), 4); // mov eax, [rsp+8]
        assert_eq!(len64(&[0x8B, 0x84, 0x24, 0x00, 0x01, 0x00, 0x00]), 7); // mov eax, [rsp+0x100]
        // SIB with no base (mod=00, base=101): disp32 follows
        assert_eq!(len64(&[0x8B, 0x04, 0x25, 0x00, 0x10, 0x00, 0x00]), 7);
    }

    #[test]
    fn test_rip_relative() {
        // mov rax, [rip+disp32]
        assert_eq!(len64(&[0x48, 0x8B, 0x05, 0x12, 0x34, 0x56, 0x78]), 7);
        // lea rcx, [rip+disp32]
        assert_eq!(len64(&[0x48, 0x8D, 0x0D, 0x00, 0x00, 0x00, 0x00]), 7);
        // cmp byte [rip+disp32], imm8
        assert_eq!(len64(&[0x80, 0x3D, 0x01, 0x02, 0x03, 0x04, 0x00]), 7);
    }

    #[test]
    fn test_immediates() {
        assert_eq!(len64(&[0xB8, 0x01, 0x02, 0x03, 0x04]), 5); // mov eax, imm32
        assert_eq!(len64(&[0x66, 0xB8, 0x34, 0x12]), 4); // mov ax, imm16
        assert_eq!(
            len64(&[0x48, 0xB8, 1, 2, 3, 4, 5, 6, 7, 8]),
            10 // movabs rax, imm64
        );
        assert_eq!(len64(&[0x6A, 0x10]), 2); // push imm8
        assert_eq!(len64(&[0x68, 1, 2, 3, 4]), 5); // push imm32
        assert_eq!(len64(&[0xC2, 0x08, 0x00]), 3); // ret imm16
        assert_eq!(len64(&[0xC6, 0x00, 0x7F]), 3); // mov byte [rax], imm8
        assert_eq!(len64(&[0xC7, 0x00, 1, 2, 3, 4]), 6); // mov dword [rax], imm32
        assert_eq!(len64(&[0x66, 0x81, 0xC0, 0x34, 0x12]), 5); // add ax, imm16
    }

    #[test]
    fn test_control_flow() {
        assert_eq!(len64(&[0xE8, 1, 2, 3, 4]), 5); // call rel32
        assert_eq!(len64(&[0xE9, 1, 2, 3, 4]), 5); // jmp rel32
        assert_eq!(len64(&[0xEB, 0x10]), 2); // jmp rel8
        assert_eq!(len64(&[0x74, 0x05]), 2); // je rel8
        assert_eq!(len64(&[0x0F, 0x84, 0, 0, 0, 0]), 6); // je rel32
        assert_eq!(len64(&[0x0F, 0x8F, 0, 0, 0, 0]), 6); // jg rel32
        assert_eq!(len64(&[0xFF, 0x25, 0, 0, 0, 0]), 6); // jmp [rip+0]
        assert_eq!(len64(&[0xFF, 0xD0]), 2); // call rax
    }

    #[test]
    fn test_group3() {
        assert_eq!(len64(&[0xF7, 0xD8]), 2); // neg eax (/3, no imm)
        assert_eq!(len64(&[0xF7, 0xC0, 1, 2, 3, 4]), 6); // test eax, imm32 (/0)
        assert_eq!(len64(&[0xF6, 0xC1, 0x01]), 3); // test cl, imm8 (/0)
        assert_eq!(len64(&[0xF6, 0xD9]), 2); // neg cl
    }

    #[test]
    fn test_legacy_prefixes() {
        assert_eq!(len64(&[0xF0, 0xFF, 0x00]), 3); // lock inc dword [rax]
        assert_eq!(len64(&[0xF3, 0xAA]), 2); // rep stosb
        assert_eq!(len64(&[0x65, 0x48, 0x8B, 0x04, 0x25, 0, 0, 0, 0]), 9); // gs: mov
        assert_eq!(len64(&[0x66, 0x90]), 2); // operand-size nop
    }

    #[test]
    fn test_three_byte_escapes() {
        assert_eq!(len64(&[0x0F, 0x38, 0x00, 0xC1]), 4); // pshufb mm0, mm1
        assert_eq!(len64(&[0x0F, 0x3A, 0x0F, 0xC1, 0x08]), 5); // palignr mm0, mm1, 8
    }

    #[test]
    fn test_two_byte_misc() {
        assert_eq!(len64(&[0x0F, 0xB6, 0xC0]), 3); // movzx eax, al
        assert_eq!(len64(&[0x0F, 0xAF, 0xC1]), 3); // imul eax, ecx
        assert_eq!(len64(&[0x0F, 0x1F, 0x40, 0x00]), 4); // nop dword [rax+0]
        assert_eq!(len64(&[0x0F, 0x1F, 0x84, 0x00, 0, 0, 0, 0]), 8); // 8-byte nop
        assert_eq!(len64(&[0x0F, 0x94, 0xC0]), 3); // sete al
        assert_eq!(len64(&[0x0F, 0x05]), 2); // syscall
    }

    #[test]
    fn test_mode_differences() {
        // 0x40 is INC EAX in 32-bit mode, a REX prefix in 64-bit
        assert_eq!(instruction_length(&[0x40], false), 1);
        assert_eq!(instruction_length(&[0x40, 0x90], true), 2);
        // Far call exists only outside long mode
        assert_eq!(instruction_length(&[0x9A, 1, 2, 3, 4, 5, 6], false), 7);
        assert_eq!(instruction_length(&[0x9A, 1, 2, 3, 4, 5, 6], true), 0);
    }

    #[test]
    fn test_moffs() {
        // mov al, [moffs64] in 64-bit mode
        assert_eq!(len64(&[0xA0, 1, 2, 3, 4, 5, 6, 7, 8]), 9);
        assert_eq!(instruction_length(&[0xA1, 1, 2, 3, 4], false), 5);
    }

    #[test]
    fn test_undecodable() {
        assert_eq!(len64(&[]), 0);
        assert_eq!(len64(&[0x66]), 0); // prefix with nothing after it
        assert_eq!(len64(&[0x0F, 0x0F, 0xC0, 0x00]), 0); // 3DNow!
        assert_eq!(len64(&[0x62, 0x00]), 0); // EVEX in 64-bit mode
        assert_eq!(len64(&[0xC4, 0x00, 0x00]), 0); // VEX in 64-bit mode
        // Truncated: says 5 bytes but only 3 present
        assert_eq!(len64(&[0xE8, 1, 2]), 0);
        assert_eq!(len64(&[0x8B]), 0); // ModR/M missing
    }

    #[test]
    fn test_typical_prologues() {
        // push rbp; mov rbp, rsp; sub rsp, 0x20
        let prologue = [0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x20];
        let mut offset = 0;
        let mut lens = Vec::new();
        while offset < prologue.len() {
            let len = len64(&prologue[offset..]);
            assert_ne!(len, 0);
            lens.push(len);
            offset += len;
        }
        assert_eq!(lens, vec![1, 3, 4]);

        // 32-bit: push ebp; mov ebp, esp; sub esp, 0x20
        let prologue32 = [0x55, 0x8B, 0xEC, 0x83, 0xEC, 0x20];
        let mut offset = 0;
        let mut lens = Vec::new();
        while offset < prologue32.len() {
            let len = instruction_length(&prologue32[offset..], false);
            assert_ne!(len, 0);
            lens.push(len);
            offset += len;
        }
        assert_eq!(lens, vec![1, 2, 3]);
    }
}
