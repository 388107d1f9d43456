//! Bytecode instruction representation
//!
//! Contains the instruction structure and its source line.

use crate::opcode::Opcode;

/// A single bytecode instruction with its source line
#[derive(Debug, Clone)]
pub struct Instruction {
    /// The opcode for this instruction
    pub opcode: Opcode,
    /// Source line the instruction was compiled from (0 if unknown)
    pub line: u32,
}

impl Instruction {
    /// Create a new instruction without line information
    pub fn new(opcode: Opcode) -> Self {
        Self { opcode, line: 0 }
    }

    /// Create a new instruction at a source line
    pub fn at_line(opcode: Opcode, line: u32) -> Self {
        Self { opcode, line }
    }
}

/// A named local slot, kept for introspection and debugging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    /// Variable name
    pub name: std::sync::Arc<str>,
    /// Local slot holding the variable
    pub slot: u32,
    /// Line of the declaration
    pub line: u32,
}

impl Declaration {
    /// Create a new declaration
    pub fn new(name: impl Into<std::sync::Arc<str>>, slot: u32, line: u32) -> Self {
        Self {
            name: name.into(),
            slot,
            line,
        }
    }
}
