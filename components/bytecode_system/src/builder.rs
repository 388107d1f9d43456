//! Template builder
//!
//! Emits instructions with forward labels and back-patches branch targets
//! when the template is finished. The frame size is derived from the
//! verifier's depth analysis rather than trusted from the producer.

use std::sync::Arc;

use crate::instruction::{Declaration, Instruction};
use crate::opcode::{BranchTable, Capture, Opcode, Slot, Target};
use crate::template::{ClosureTemplate, TemplateParts};
use crate::verify::{self, VerifyError};

/// A branch destination that may be placed after it is referenced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u32);

#[derive(Debug)]
enum Fixup {
    Single(Label),
    Table(Vec<Label>, Label),
}

/// Incremental builder for [`ClosureTemplate`]s
#[derive(Debug)]
pub struct TemplateBuilder {
    name: Arc<str>,
    source: Arc<str>,
    code: Vec<Instruction>,
    line: u32,
    locals: u32,
    params: u32,
    variadic: bool,
    captures: Vec<Capture>,
    declarations: Vec<Declaration>,
    labels: Vec<Option<Target>>,
    fixups: Vec<(usize, Fixup)>,
}

impl TemplateBuilder {
    /// Create a builder for a function called `name` in `source`
    pub fn new(name: impl Into<Arc<str>>, source: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            code: Vec::new(),
            line: 0,
            locals: 0,
            params: 0,
            variadic: false,
            captures: Vec::new(),
            declarations: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    /// Set the number of fixed parameters
    pub fn params(mut self, params: u32) -> Self {
        self.params = params;
        self
    }

    /// Collect surplus arguments into a tuple in local `params`
    pub fn variadic(mut self, variadic: bool) -> Self {
        self.variadic = variadic;
        self
    }

    /// Reserve at least `locals` local slots
    pub fn locals(mut self, locals: u32) -> Self {
        self.locals = self.locals.max(locals);
        self
    }

    /// Allocate one more local slot
    pub fn local(&mut self) -> Slot {
        let slot = self.locals;
        self.locals += 1;
        slot
    }

    /// Add an upvalue captured from the enclosing frame and return its index
    pub fn capture(&mut self, capture: Capture) -> u32 {
        self.captures.push(capture);
        self.captures.len() as u32
    }

    /// Record a named local
    pub fn declare(&mut self, name: impl Into<Arc<str>>, slot: Slot, line: u32) -> &mut Self {
        self.declarations.push(Declaration::new(name, slot, line));
        self
    }

    /// Set the source line for subsequent instructions
    pub fn line(&mut self, line: u32) -> &mut Self {
        self.line = line;
        self
    }

    /// Index the next instruction will occupy
    pub fn position(&self) -> Target {
        self.code.len() as Target
    }

    /// Emit an instruction at the current line
    pub fn emit(&mut self, opcode: Opcode) -> &mut Self {
        self.code.push(Instruction::at_line(opcode, self.line));
        self
    }

    /// Create an unplaced label
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    /// Place `label` at the next instruction
    pub fn place(&mut self, label: Label) -> &mut Self {
        let here = self.position();
        if let Some(slot) = self.labels.get_mut(label.0 as usize) {
            *slot = Some(here);
        }
        self
    }

    /// Emit an unconditional jump
    pub fn jump(&mut self, label: Label) -> &mut Self {
        self.branch(Opcode::Jump(0), label)
    }

    /// Emit a jump taken when the popped value is nil
    pub fn jump_if_nil(&mut self, label: Label) -> &mut Self {
        self.branch(Opcode::JumpIfNil(0), label)
    }

    /// Emit a jump taken when the popped value is not nil
    pub fn jump_unless_nil(&mut self, label: Label) -> &mut Self {
        self.branch(Opcode::JumpUnlessNil(0), label)
    }

    /// Emit a `Try` whose on-error target is `label`
    pub fn try_to(&mut self, label: Label) -> &mut Self {
        self.branch(Opcode::Try(0), label)
    }

    /// Emit a branch-table switch
    pub fn switch(&mut self, cases: &[Label], default: Label) -> &mut Self {
        let at = self.code.len();
        self.fixups
            .push((at, Fixup::Table(cases.to_vec(), default)));
        self.emit(Opcode::Switch(Arc::new(BranchTable::new(Vec::new(), 0))))
    }

    fn branch(&mut self, opcode: Opcode, label: Label) -> &mut Self {
        let at = self.code.len();
        self.fixups.push((at, Fixup::Single(label)));
        self.emit(opcode)
    }

    fn resolve(&self, label: Label) -> Result<Target, VerifyError> {
        self.labels
            .get(label.0 as usize)
            .copied()
            .flatten()
            .ok_or_else(|| VerifyError::UnboundLabel {
                name: self.name.clone(),
                label: label.0,
            })
    }

    /// Finish the template: append the halt sentinel, patch branches,
    /// derive the frame size and verify.
    pub fn build(mut self) -> Result<Arc<ClosureTemplate>, VerifyError> {
        self.emit(Opcode::Halt);

        let fixups = std::mem::take(&mut self.fixups);
        for (at, fixup) in fixups {
            let patched = match (&self.code[at].opcode, fixup) {
                (Opcode::Jump(_), Fixup::Single(label)) => Opcode::Jump(self.resolve(label)?),
                (Opcode::JumpIfNil(_), Fixup::Single(label)) => {
                    Opcode::JumpIfNil(self.resolve(label)?)
                }
                (Opcode::JumpUnlessNil(_), Fixup::Single(label)) => {
                    Opcode::JumpUnlessNil(self.resolve(label)?)
                }
                (Opcode::Try(_), Fixup::Single(label)) => Opcode::Try(self.resolve(label)?),
                (Opcode::Switch(_), Fixup::Table(cases, default)) => {
                    let targets = cases
                        .into_iter()
                        .map(|label| self.resolve(label))
                        .collect::<Result<Vec<_>, _>>()?;
                    Opcode::Switch(Arc::new(BranchTable::new(targets, self.resolve(default)?)))
                }
                (other, _) => other.clone(),
            };
            self.code[at].opcode = patched;
        }

        let locals = self
            .locals
            .max(self.params.saturating_add(u32::from(self.variadic)));
        let upvalues = self.captures.len() as u32 + 1;
        let depth = verify::max_depth(&self.name, &self.code, locals, upvalues)?;

        ClosureTemplate::from_parts(TemplateParts {
            name: self.name,
            source: self.source,
            code: self.code,
            frame_size: locals.saturating_add(depth),
            locals,
            params: self.params,
            variadic: self.variadic,
            captures: self.captures,
            declarations: self.declarations,
        })
    }
}
