//! Bytecode system for the interpreter core
//!
//! This crate provides the instruction set, immutable closure templates,
//! a label-patching template builder, the load-time verifier and the binary
//! template format.
//!
//! # Features
//!
//! - Stack-machine opcodes with explicit stack effects
//! - Templates shared through `Arc`, with a lazily computed content digest
//! - Fail-closed verification of frame sizes and operand indices
//! - Compact varint serialization with nested-template de-duplication
//!
//! # Example
//!
//! ```
//! use bytecode_system::{codec, Opcode, TemplateBuilder};
//! use core_types::Value;
//!
//! let mut builder = TemplateBuilder::new("pair", "pair.src").params(1);
//! builder
//!     .line(1)
//!     .emit(Opcode::LoadLocal(0))
//!     .emit(Opcode::Const(Value::Int(2)))
//!     .emit(Opcode::BuildTuple(2))
//!     .emit(Opcode::Return);
//! let template = builder.build().unwrap();
//! assert_eq!(template.frame_size(), 3);
//!
//! let bytes = codec::encode(&template).unwrap();
//! let restored = codec::decode(&bytes).unwrap();
//! assert!(restored.same_structure(&template));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builder;
pub mod codec;
pub mod instruction;
pub mod opcode;
pub mod template;
pub mod verify;

// Re-export main types at crate root
pub use builder::{Label, TemplateBuilder};
pub use codec::{DecodeError, EncodeError};
pub use instruction::{Declaration, Instruction};
pub use opcode::{BranchTable, CallSite, Capture, Opcode, Slot, Target};
pub use template::{ClosureTemplate, TemplateParts};
pub use verify::{verify, VerifyError, MAX_FRAME_SIZE};
