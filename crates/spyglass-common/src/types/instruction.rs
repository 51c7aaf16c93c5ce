//! Instruction/disassembly types

use serde::{Deserialize, Serialize};

/// One decoded instruction in a listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instruction {
    pub address: usize,
    pub bytes: Vec<u8>,
    pub mnemonic: String,
    pub operands: String,
    pub length: usize,
    pub is_jump: bool,
    pub is_call: bool,
    pub is_ret: bool,
    /// Absolute destination for control flow with a code displacement
    pub target: Option<usize>,
}

impl Instruction {
    /// Placeholder for an undecodable byte; decoding never stalls.
    pub fn raw_byte(address: usize, byte: u8) -> Self {
        Self {
            address,
            bytes: vec![byte],
            mnemonic: "db".to_string(),
            operands: format!("0x{:02x}", byte),
            length: 1,
            is_jump: false,
            is_call: false,
            is_ret: false,
            target: None,
        }
    }
}
