//! Bytecode interpreter core
//!
//! This crate executes closure templates produced by `bytecode_system`:
//! - Fibers holding explicit frame chains, with pooled frame buffers
//! - Generators: frames suspended mid-call and exposed as iterator values
//! - Multi-argument method dispatch with layered scopes and inline caches
//! - Counter and deadline preemption through a pluggable schedule
//! - An optional per-context debugger hook
//!
//! # Example
//!
//! ```
//! use bytecode_system::{Opcode, TemplateBuilder};
//! use core_types::Value;
//! use interpreter::{RuntimeConfig, Vm};
//!
//! let vm = Vm::new(RuntimeConfig::default());
//! let mut builder = TemplateBuilder::new("double", "double.src").params(1).locals(1);
//! builder
//!     .emit(Opcode::LoadLocal(0))
//!     .emit(Opcode::LoadLocal(0))
//!     .emit(Opcode::BuildTuple(2))
//!     .emit(Opcode::Return);
//! let double = vm.instantiate(&builder.build().unwrap()).unwrap();
//!
//! let result = vm.call(&double, vec![Value::Int(3)]).unwrap();
//! assert_eq!(result, Value::tuple(vec![Value::Int(3), Value::Int(3)]));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod closure;
pub mod config;
pub mod context;
pub mod debugger;
pub mod dispatch;
pub mod frame;
pub mod generator;
pub mod iteration;
pub mod method_cache;
pub mod methods;
mod published;
pub mod vm;

// Re-export main types at crate root
pub use closure::{Closure, Forward};
pub use config::{Preemption, RuntimeConfig};
pub use context::{ContextStats, ExecutionContext};
pub use debugger::{BitSet, Debugger};
pub use dispatch::{Completion, Fiber};
pub use frame::{Frame, Handler};
pub use generator::{Generator, GeneratorState};
pub use method_cache::{CacheEntry, CacheStats, InlineCache, POLYMORPHIC_WIDTH};
pub use methods::{Definition, Method, MethodScope};
pub use vm::{Vm, VmError};
