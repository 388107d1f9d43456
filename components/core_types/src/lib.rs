//! Core value types, error values and associative tables.
//!
//! This crate provides the foundational types shared by the bytecode system,
//! the frame pool and the interpreter.
//!
//! # Overview
//!
//! - [`Value`] - Tagged dynamic value, `Send + Sync` throughout
//! - [`TypeTag`] - Closed runtime type lattice used by method dispatch
//! - [`TypeOps`] - Per-type dispatch table (hash, call, dereference, assign)
//! - [`ErrorValue`] - Error payload with a bounded (source, line) trace
//! - [`IdTable`] - Open-addressing table keyed by integers or pointers
//! - [`NameTable`] - Ordered string-keyed table for named exports
//!
//! # Examples
//!
//! ```
//! use core_types::{Value, TypeTag};
//!
//! let n = Value::Int(42);
//! assert_eq!(n.type_tag(), TypeTag::Int);
//! assert!(n.type_tag().is_a(TypeTag::Number));
//!
//! let err = Value::error("RangeError", "index 7 out of range");
//! assert!(err.is_error());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

mod cell;
mod error;
mod names;
mod native;
mod source;
mod table;
mod types;
mod value;

pub use cell::VarCell;
pub use error::{kinds, ErrorValue, DEFAULT_MAX_TRACE_DEPTH};
pub use names::NameTable;
pub use native::NativeFn;
pub use source::TraceEntry;
pub use table::IdTable;
pub use types::TypeTag;
pub use value::{mix64, AsAny, Object, TypeOps, Value};
