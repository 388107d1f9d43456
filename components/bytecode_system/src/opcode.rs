//! Bytecode opcodes for the interpreter
//!
//! Defines the instruction categories of the stack machine. Every opcode
//! documents its stack effect as `[before] -> [after]`, top of stack last.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock};

use core_types::Value;

use crate::template::ClosureTemplate;

/// Local-variable slot index
pub type Slot = u32;

/// Instruction index inside one template's code array
pub type Target = u32;

/// Jump table for [`Opcode::Switch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchTable {
    /// Targets selected by integer scrutinee `0..targets.len()`
    pub targets: Vec<Target>,
    /// Target for any other scrutinee
    pub default: Target,
}

impl BranchTable {
    /// Create a new branch table
    pub fn new(targets: Vec<Target>, default: Target) -> Self {
        Self { targets, default }
    }

    /// Target selected by `value`
    pub fn select(&self, value: &Value) -> Target {
        value
            .as_int()
            .and_then(|n| usize::try_from(n).ok())
            .and_then(|n| self.targets.get(n).copied())
            .unwrap_or(self.default)
    }
}

/// Method call site
///
/// Carries the method name and argument count, plus a lazily attached
/// inline cache owned by whichever engine executes the site. Decoded and
/// freshly built sites start with an empty cache.
pub struct CallSite {
    /// Method name
    pub method: Arc<str>,
    /// Number of arguments taken from the stack
    pub argc: u32,
    cache: OnceLock<Arc<dyn Any + Send + Sync>>,
}

impl CallSite {
    /// Create a new call site with an empty cache
    pub fn new(method: impl Into<Arc<str>>, argc: u32) -> Self {
        Self {
            method: method.into(),
            argc,
            cache: OnceLock::new(),
        }
    }

    /// Returns the site's cache, creating it with `init` on first use.
    ///
    /// Returns `None` if a cache of a different type is already attached.
    pub fn cache_or_init<T, F>(&self, init: F) -> Option<&T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let cache = self
            .cache
            .get_or_init(|| Arc::new(init()) as Arc<dyn Any + Send + Sync>);
        (**cache).downcast_ref::<T>()
    }
}

impl fmt::Debug for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSite")
            .field("method", &self.method)
            .field("argc", &self.argc)
            .field("cached", &self.cache.get().is_some())
            .finish()
    }
}

/// Where a closure upvalue is captured from, relative to the enclosing frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    /// A local slot of the enclosing frame
    Local(Slot),
    /// An upvalue of the enclosing closure
    Upvalue(u32),
}

/// Bytecode opcodes
#[derive(Debug, Clone)]
pub enum Opcode {
    // Stack
    /// `[] -> [value]`
    Const(Value),
    /// `[] -> [nil]`
    Nil,
    /// `[a] -> []`
    Pop,
    /// `[a] -> [a, a]`
    Dup,
    /// `[a, b] -> [b, a]`
    Swap,

    // Locals and upvalues
    /// `[] -> [local]`
    LoadLocal(Slot),
    /// `[a] -> []`, stores into the slot
    StoreLocal(Slot),
    /// `[] -> [upvalue]`, reading through forward references
    LoadUpvalue(u32),
    /// `[] -> [closure]`, the running closure itself
    LoadSelf,
    /// `[] -> [global]`
    LoadGlobal(Arc<str>),

    // Scoped variables
    /// `[init] -> []`, the slot receives a fresh mutable cell holding `init`
    EnterScope(Slot),
    /// `[] -> []`, releases the slot's cell
    ExitScope(Slot),
    /// `[ref] -> [value]`
    Deref,
    /// `[ref, value] -> [value]`
    Assign,
    /// `[] -> []`, the slot receives an unbound forward reference
    DeclareForward(Slot),
    /// `[value] -> []`, binds the slot's forward reference and stores `value`
    Bind(Slot),

    // Branches
    /// Unconditional jump
    Jump(Target),
    /// `[a] -> []`, jumps if `a` is nil
    JumpIfNil(Target),
    /// `[a] -> []`, jumps unless `a` is nil
    JumpUnlessNil(Target),
    /// `[n] -> []`, jumps through the table
    Switch(Arc<BranchTable>),

    // Iteration protocol
    /// `[iterable] -> [iterator | nil]`
    Iterate,
    /// `[iterator] -> [iterator | nil]`
    IterNext,
    /// `[iterator] -> [key]`
    IterKey,
    /// `[iterator] -> [value]`
    IterValue,

    // Calls
    /// `[callee, args..] -> [result]`
    Call(u32),
    /// `[callee, args..] -> ` the result is returned from this frame
    TailCall(u32),
    /// `[args..] -> [result]`, dispatched on the argument types
    CallMethod(Arc<CallSite>),

    // Errors
    /// Pushes an on-error target at the current stack depth
    Try(Target),
    /// Pops the innermost on-error target
    EndTry,
    /// `[error] -> [exception]`, pops the on-error target
    Catch,
    /// `[value] -> `, raises `value` (wrapped unless already an error)
    Raise,
    /// `[exception] -> `, re-signals a caught error to the current target
    Retry,

    // Closures
    /// `[] -> [closure]`
    MakeClosure(Arc<ClosureTemplate>),

    // Builders
    /// `[a1..an] -> [(a1, .., an)]`
    BuildTuple(u32),
    /// `[a1..an] -> ["a1..an"]`
    BuildString(u32),

    // Control
    /// `[yielded] -> [resumed]`, suspends the frame as a generator
    Suspend,
    /// `[result] -> `
    Return,
    /// End-of-code sentinel; returns nil
    Halt,
}

impl Opcode {
    /// Branch targets encoded in this opcode.
    pub fn targets(&self) -> Vec<Target> {
        match self {
            Opcode::Jump(t) | Opcode::JumpIfNil(t) | Opcode::JumpUnlessNil(t) | Opcode::Try(t) => {
                vec![*t]
            }
            Opcode::Switch(table) => {
                let mut all = table.targets.clone();
                all.push(table.default);
                all
            }
            _ => Vec::new(),
        }
    }

    /// Returns true if control never falls through to the next instruction.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Opcode::Jump(_)
                | Opcode::Switch(_)
                | Opcode::TailCall(_)
                | Opcode::Raise
                | Opcode::Retry
                | Opcode::Return
                | Opcode::Halt
        )
    }

    /// Stack effect as `(pops, pushes)`.
    pub fn stack_effect(&self) -> (u32, u32) {
        match self {
            Opcode::Const(_)
            | Opcode::Nil
            | Opcode::LoadLocal(_)
            | Opcode::LoadUpvalue(_)
            | Opcode::LoadSelf
            | Opcode::LoadGlobal(_)
            | Opcode::MakeClosure(_) => (0, 1),
            Opcode::Pop
            | Opcode::StoreLocal(_)
            | Opcode::EnterScope(_)
            | Opcode::Bind(_)
            | Opcode::JumpIfNil(_)
            | Opcode::JumpUnlessNil(_)
            | Opcode::Switch(_)
            | Opcode::Raise
            | Opcode::Retry
            | Opcode::Return => (1, 0),
            Opcode::Dup => (1, 2),
            Opcode::Swap => (2, 2),
            Opcode::Deref
            | Opcode::Iterate
            | Opcode::IterNext
            | Opcode::IterKey
            | Opcode::IterValue
            | Opcode::Catch
            | Opcode::Suspend => (1, 1),
            Opcode::Assign => (2, 1),
            Opcode::ExitScope(_)
            | Opcode::DeclareForward(_)
            | Opcode::Jump(_)
            | Opcode::Try(_)
            | Opcode::EndTry
            | Opcode::Halt => (0, 0),
            Opcode::Call(argc) => (argc.saturating_add(1), 1),
            Opcode::TailCall(argc) => (argc.saturating_add(1), 0),
            Opcode::CallMethod(site) => (site.argc, 1),
            Opcode::BuildTuple(n) | Opcode::BuildString(n) => (*n, 1),
        }
    }

    /// Short mnemonic used in diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Const(_) => "const",
            Opcode::Nil => "nil",
            Opcode::Pop => "pop",
            Opcode::Dup => "dup",
            Opcode::Swap => "swap",
            Opcode::LoadLocal(_) => "load-local",
            Opcode::StoreLocal(_) => "store-local",
            Opcode::LoadUpvalue(_) => "load-upvalue",
            Opcode::LoadSelf => "load-self",
            Opcode::LoadGlobal(_) => "load-global",
            Opcode::EnterScope(_) => "enter-scope",
            Opcode::ExitScope(_) => "exit-scope",
            Opcode::Deref => "deref",
            Opcode::Assign => "assign",
            Opcode::DeclareForward(_) => "declare-forward",
            Opcode::Bind(_) => "bind",
            Opcode::Jump(_) => "jump",
            Opcode::JumpIfNil(_) => "jump-if-nil",
            Opcode::JumpUnlessNil(_) => "jump-unless-nil",
            Opcode::Switch(_) => "switch",
            Opcode::Iterate => "iterate",
            Opcode::IterNext => "iter-next",
            Opcode::IterKey => "iter-key",
            Opcode::IterValue => "iter-value",
            Opcode::Call(_) => "call",
            Opcode::TailCall(_) => "tail-call",
            Opcode::CallMethod(_) => "call-method",
            Opcode::Try(_) => "try",
            Opcode::EndTry => "end-try",
            Opcode::Catch => "catch",
            Opcode::Raise => "raise",
            Opcode::Retry => "retry",
            Opcode::MakeClosure(_) => "make-closure",
            Opcode::BuildTuple(_) => "build-tuple",
            Opcode::BuildString(_) => "build-string",
            Opcode::Suspend => "suspend",
            Opcode::Return => "return",
            Opcode::Halt => "halt",
        }
    }
}
