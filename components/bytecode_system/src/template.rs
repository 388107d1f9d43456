//! Closure templates
//!
//! A template is the immutable, shareable description of one compiled
//! function body: its code, frame layout, parameter shape and capture list.
//! Closure instances pair a template with captured values at run time.

use std::sync::{Arc, OnceLock};

use crate::instruction::{Declaration, Instruction};
use crate::opcode::{Capture, Opcode, Slot};
use crate::verify::{self, VerifyError};

/// Raw template fields, as produced by a compiler or a decoder.
///
/// Turned into a [`ClosureTemplate`] by [`ClosureTemplate::from_parts`],
/// which validates the fields before anything can execute them.
#[derive(Debug, Clone)]
pub struct TemplateParts {
    /// Function name used in diagnostics
    pub name: Arc<str>,
    /// Source name recorded in error traces
    pub source: Arc<str>,
    /// Instruction stream; entry is instruction 0, the last must be `Halt`
    pub code: Vec<Instruction>,
    /// Local slots plus maximum evaluation depth
    pub frame_size: u32,
    /// Number of local slots
    pub locals: u32,
    /// Number of fixed parameters, stored in locals `0..params`
    pub params: u32,
    /// Surplus arguments are collected into a tuple in local `params`
    pub variadic: bool,
    /// Sources of upvalues `1..`; upvalue 0 is the closure itself
    pub captures: Vec<Capture>,
    /// Named locals for introspection
    pub declarations: Vec<Declaration>,
}

/// Immutable compiled function body
///
/// # Examples
///
/// ```
/// use bytecode_system::{Opcode, TemplateBuilder};
/// use core_types::Value;
///
/// let mut builder = TemplateBuilder::new("answer", "answer.src");
/// builder.line(1).emit(Opcode::Const(Value::Int(42))).emit(Opcode::Return);
/// let template = builder.build().unwrap();
///
/// assert_eq!(template.frame_size(), 1);
/// assert!(matches!(template.code().last().map(|i| &i.opcode), Some(Opcode::Halt)));
/// assert_eq!(template.digest(), template.digest());
/// ```
#[derive(Debug)]
pub struct ClosureTemplate {
    name: Arc<str>,
    source: Arc<str>,
    code: Box<[Instruction]>,
    frame_size: u32,
    locals: u32,
    params: u32,
    variadic: bool,
    captures: Box<[Capture]>,
    declarations: Box<[Declaration]>,
    digest: OnceLock<u64>,
}

impl ClosureTemplate {
    /// Validates `parts` and wraps them in a shareable template.
    pub fn from_parts(parts: TemplateParts) -> Result<Arc<Self>, VerifyError> {
        let template = Self {
            name: parts.name,
            source: parts.source,
            code: parts.code.into_boxed_slice(),
            frame_size: parts.frame_size,
            locals: parts.locals,
            params: parts.params,
            variadic: parts.variadic,
            captures: parts.captures.into_boxed_slice(),
            declarations: parts.declarations.into_boxed_slice(),
            digest: OnceLock::new(),
        };
        verify::verify(&template)?;
        Ok(Arc::new(template))
    }

    /// Function name
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Source name
    pub fn source(&self) -> &Arc<str> {
        &self.source
    }

    /// Instruction stream
    pub fn code(&self) -> &[Instruction] {
        &self.code
    }

    /// Index of the halt sentinel
    pub fn halt(&self) -> usize {
        self.code.len().saturating_sub(1)
    }

    /// Local slots plus maximum evaluation depth
    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    /// Number of local slots
    pub fn locals(&self) -> u32 {
        self.locals
    }

    /// Maximum evaluation-stack depth
    pub fn max_stack(&self) -> u32 {
        self.frame_size - self.locals
    }

    /// Number of fixed parameters
    pub fn params(&self) -> u32 {
        self.params
    }

    /// Whether surplus arguments are accepted
    pub fn variadic(&self) -> bool {
        self.variadic
    }

    /// Capture sources of upvalues `1..`
    pub fn captures(&self) -> &[Capture] {
        &self.captures
    }

    /// Number of upvalues, including the self reference
    pub fn upvalue_count(&self) -> u32 {
        self.captures.len() as u32 + 1
    }

    /// Named locals
    pub fn declarations(&self) -> &[Declaration] {
        &self.declarations
    }

    /// Declarations visible at `line`, innermost (latest) first
    pub fn declarations_at(&self, line: u32) -> impl Iterator<Item = &Declaration> + '_ {
        self.declarations
            .iter()
            .rev()
            .filter(move |decl| decl.line <= line)
    }

    /// Name of a local slot, if declared
    pub fn local_name(&self, slot: Slot) -> Option<&str> {
        self.declarations
            .iter()
            .find(|decl| decl.slot == slot)
            .map(|decl| &*decl.name)
    }

    /// Largest source line in the code
    pub fn max_line(&self) -> u32 {
        self.code.iter().map(|inst| inst.line).max().unwrap_or(0)
    }

    /// Templates materialized by `MakeClosure` in this body
    pub fn nested(&self) -> impl Iterator<Item = &Arc<ClosureTemplate>> + '_ {
        self.code.iter().filter_map(|inst| match &inst.opcode {
            Opcode::MakeClosure(template) => Some(template),
            _ => None,
        })
    }

    /// Content digest over the canonical encoding, computed once.
    pub fn digest(&self) -> u64 {
        *self.digest.get_or_init(|| crate::codec::digest(self))
    }

    /// Structural equality by digest.
    pub fn same_structure(&self, other: &ClosureTemplate) -> bool {
        std::ptr::eq(self, other) || self.digest() == other.digest()
    }
}
