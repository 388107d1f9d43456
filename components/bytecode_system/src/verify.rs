//! Load-time template validation
//!
//! Templates come from an external compiler or from decoded bytes. Before
//! the interpreter trusts a template's frame size and operand indices, the
//! verifier checks them and rejects anything inconsistent:
//!
//! - the code is non-empty and ends with the `Halt` sentinel
//! - branch and handler targets stay inside the code array
//! - local and upvalue operands are in range
//! - every reachable instruction is entered at one stack depth, never
//!   underflows, and never exceeds the evaluation space of the frame
//! - the declared frame size is exactly locals plus maximum depth, and no
//!   larger than [`MAX_FRAME_SIZE`]
//! - nested templates capture only slots that exist in the enclosing frame

use std::sync::Arc;

use core_types::IdTable;

use crate::instruction::Instruction;
use crate::opcode::{Capture, Opcode};
use crate::template::ClosureTemplate;

/// Largest frame, in value slots, a template may declare
pub const MAX_FRAME_SIZE: u32 = 1 << 16;

/// Reason a template was rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// The instruction stream is empty
    #[error("template `{name}` has no code")]
    EmptyCode {
        /// Template name
        name: Arc<str>,
    },
    /// The last instruction is not `Halt`
    #[error("template `{name}` does not end with halt")]
    MissingHalt {
        /// Template name
        name: Arc<str>,
    },
    /// Parameters (plus the rest slot) do not fit in the locals
    #[error("template `{name}` takes {params} parameters but has {locals} locals")]
    ParamsExceedLocals {
        /// Template name
        name: Arc<str>,
        /// Parameter slots required
        params: u32,
        /// Local slots available
        locals: u32,
    },
    /// A branch or handler target lies outside the code
    #[error("template `{name}` pc {at}: target {target} out of range")]
    TargetOutOfRange {
        /// Template name
        name: Arc<str>,
        /// Offending instruction
        at: usize,
        /// Bad target
        target: u32,
    },
    /// A local slot operand is out of range
    #[error("template `{name}` pc {at}: local {slot} out of range (locals={locals})")]
    LocalOutOfRange {
        /// Template name
        name: Arc<str>,
        /// Offending instruction
        at: usize,
        /// Bad slot
        slot: u32,
        /// Local slots available
        locals: u32,
    },
    /// An upvalue operand is out of range
    #[error("template `{name}` pc {at}: upvalue {index} out of range (upvalues={count})")]
    UpvalueOutOfRange {
        /// Template name
        name: Arc<str>,
        /// Offending instruction
        at: usize,
        /// Bad index
        index: u32,
        /// Upvalues available
        count: u32,
    },
    /// A nested template captures something the enclosing frame lacks
    #[error("template `{name}` pc {at}: nested capture {capture:?} out of range")]
    CaptureOutOfRange {
        /// Enclosing template name
        name: Arc<str>,
        /// Offending `MakeClosure`
        at: usize,
        /// Bad capture
        capture: Capture,
    },
    /// An instruction pops more values than the stack holds
    #[error("template `{name}` pc {at}: stack underflow")]
    Underflow {
        /// Template name
        name: Arc<str>,
        /// Offending instruction
        at: usize,
    },
    /// Two paths reach an instruction at different depths
    #[error("template `{name}` pc {at}: entered at depth {found}, expected {expected}")]
    InconsistentDepth {
        /// Template name
        name: Arc<str>,
        /// Merge point
        at: usize,
        /// Depth recorded first
        expected: u32,
        /// Conflicting depth
        found: u32,
    },
    /// Control can run past the end of the code
    #[error("template `{name}` pc {at}: falls off the end of the code")]
    FallsOffEnd {
        /// Template name
        name: Arc<str>,
        /// Offending instruction
        at: usize,
    },
    /// The declared frame size differs from what the code needs
    #[error("template `{name}` needs a frame of {needed} slots but declares {frame_size}")]
    FrameSizeMismatch {
        /// Template name
        name: Arc<str>,
        /// Locals plus maximum depth
        needed: u32,
        /// Declared frame size
        frame_size: u32,
    },
    /// Locals plus evaluation depth exceed [`MAX_FRAME_SIZE`]
    #[error("template `{name}` needs a frame of {needed} slots, limit is {limit}")]
    FrameTooLarge {
        /// Template name
        name: Arc<str>,
        /// Slots required, as far as they were counted
        needed: u64,
        /// The limit in force
        limit: u32,
    },
    /// A builder label was referenced but never placed
    #[error("template `{name}`: label {label} was never placed")]
    UnboundLabel {
        /// Template name
        name: Arc<str>,
        /// Label number
        label: u32,
    },
}

/// Verifies `template` and every template nested in it.
pub fn verify(template: &ClosureTemplate) -> Result<(), VerifyError> {
    let mut seen = IdTable::new();
    verify_tree(template, &mut seen)
}

fn verify_tree(template: &ClosureTemplate, seen: &mut IdTable<()>) -> Result<(), VerifyError> {
    let key = template as *const ClosureTemplate as usize as u64;
    if seen.insert(key, ()).is_some() {
        return Ok(());
    }

    let name = template.name();
    let code = template.code();
    if code.is_empty() {
        return Err(VerifyError::EmptyCode { name: name.clone() });
    }
    if !matches!(code[code.len() - 1].opcode, Opcode::Halt) {
        return Err(VerifyError::MissingHalt { name: name.clone() });
    }
    let param_slots = template.params().saturating_add(u32::from(template.variadic()));
    if param_slots > template.locals() {
        return Err(VerifyError::ParamsExceedLocals {
            name: name.clone(),
            params: param_slots,
            locals: template.locals(),
        });
    }

    let max_depth = max_depth(name, code, template.locals(), template.upvalue_count())?;
    let needed = u64::from(template.locals()) + u64::from(max_depth);
    if needed > u64::from(MAX_FRAME_SIZE) {
        return Err(VerifyError::FrameTooLarge {
            name: name.clone(),
            needed,
            limit: MAX_FRAME_SIZE,
        });
    }
    let needed = needed as u32;
    if needed != template.frame_size() {
        return Err(VerifyError::FrameSizeMismatch {
            name: name.clone(),
            needed,
            frame_size: template.frame_size(),
        });
    }

    for (at, inst) in code.iter().enumerate() {
        if let Opcode::MakeClosure(nested) = &inst.opcode {
            for capture in nested.captures() {
                let ok = match *capture {
                    Capture::Local(slot) => slot < template.locals(),
                    Capture::Upvalue(index) => index < template.upvalue_count(),
                };
                if !ok {
                    return Err(VerifyError::CaptureOutOfRange {
                        name: name.clone(),
                        at,
                        capture: *capture,
                    });
                }
            }
            verify_tree(nested, seen)?;
        }
    }
    Ok(())
}

/// Checks operands and computes the maximum evaluation depth of `code`.
///
/// Only reachable instructions contribute to the depth; operands are checked
/// everywhere. A `Try` target is entered one deeper than the `Try` itself,
/// since the error value is pushed on the truncated stack. The walk stops
/// with [`VerifyError::FrameTooLarge`] once the depth passes
/// [`MAX_FRAME_SIZE`].
pub fn max_depth(
    name: &Arc<str>,
    code: &[Instruction],
    locals: u32,
    upvalues: u32,
) -> Result<u32, VerifyError> {
    for (at, inst) in code.iter().enumerate() {
        check_operands(name, at, &inst.opcode, code.len(), locals, upvalues)?;
    }
    if code.is_empty() {
        return Ok(0);
    }

    let mut entry: Vec<Option<u32>> = vec![None; code.len()];
    let mut worklist = vec![0usize];
    entry[0] = Some(0);
    let mut max = 0;

    while let Some(pc) = worklist.pop() {
        let depth = entry[pc].unwrap_or(0);
        let opcode = &code[pc].opcode;
        let (pops, pushes) = opcode.stack_effect();
        if depth < pops {
            return Err(VerifyError::Underflow {
                name: name.clone(),
                at: pc,
            });
        }
        let after = depth - pops + pushes;
        max = max.max(depth).max(after);
        if max > MAX_FRAME_SIZE {
            return Err(VerifyError::FrameTooLarge {
                name: name.clone(),
                needed: u64::from(max),
                limit: MAX_FRAME_SIZE,
            });
        }

        let mut successors: Vec<(usize, u32)> = Vec::with_capacity(2);
        match opcode {
            Opcode::Try(target) => {
                successors.push((*target as usize, depth + 1));
                successors.push((pc + 1, after));
            }
            Opcode::Jump(target) => successors.push((*target as usize, after)),
            Opcode::JumpIfNil(target) | Opcode::JumpUnlessNil(target) => {
                successors.push((*target as usize, after));
                successors.push((pc + 1, after));
            }
            Opcode::Switch(table) => {
                for target in table.targets.iter().chain(std::iter::once(&table.default)) {
                    successors.push((*target as usize, after));
                }
            }
            op if op.is_terminal() => {}
            _ => successors.push((pc + 1, after)),
        }

        for (next, next_depth) in successors {
            if next >= code.len() {
                return Err(VerifyError::FallsOffEnd {
                    name: name.clone(),
                    at: pc,
                });
            }
            match entry[next] {
                None => {
                    entry[next] = Some(next_depth);
                    worklist.push(next);
                }
                Some(expected) if expected != next_depth => {
                    return Err(VerifyError::InconsistentDepth {
                        name: name.clone(),
                        at: next,
                        expected,
                        found: next_depth,
                    });
                }
                Some(_) => {}
            }
        }
    }
    Ok(max)
}

fn check_operands(
    name: &Arc<str>,
    at: usize,
    opcode: &Opcode,
    len: usize,
    locals: u32,
    upvalues: u32,
) -> Result<(), VerifyError> {
    match opcode {
        Opcode::LoadLocal(slot)
        | Opcode::StoreLocal(slot)
        | Opcode::EnterScope(slot)
        | Opcode::ExitScope(slot)
        | Opcode::DeclareForward(slot)
        | Opcode::Bind(slot) => {
            if *slot >= locals {
                return Err(VerifyError::LocalOutOfRange {
                    name: name.clone(),
                    at,
                    slot: *slot,
                    locals,
                });
            }
        }
        Opcode::LoadUpvalue(index) => {
            if *index >= upvalues {
                return Err(VerifyError::UpvalueOutOfRange {
                    name: name.clone(),
                    at,
                    index: *index,
                    count: upvalues,
                });
            }
        }
        _ => {
            for target in opcode.targets() {
                if target as usize >= len {
                    return Err(VerifyError::TargetOutOfRange {
                        name: name.clone(),
                        at,
                        target,
                    });
                }
            }
        }
    }
    Ok(())
}
