//! Runtime type lattice.
//!
//! Every value has exactly one most-derived [`TypeTag`]. Tags form a tree
//! rooted at [`TypeTag::Any`]; method definitions declare parameter tags and
//! an argument satisfies a parameter when its tag `is_a` the parameter tag.

/// Runtime type tag of a value.
///
/// # Examples
///
/// ```
/// use core_types::TypeTag;
///
/// assert!(TypeTag::Int.is_a(TypeTag::Number));
/// assert!(TypeTag::Int.is_a(TypeTag::Any));
/// assert!(!TypeTag::Real.is_a(TypeTag::Int));
/// assert_eq!(TypeTag::Any.rank(), 0);
/// assert_eq!(TypeTag::Int.rank(), 2);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum TypeTag {
    /// Root of the lattice; every value is an `Any`
    Any = 0,
    /// The nil sentinel
    Nil,
    /// Booleans
    Bool,
    /// Abstract numeric type
    Number,
    /// 64-bit integers
    Int,
    /// 64-bit floats
    Real,
    /// Immutable strings
    Str,
    /// Immutable tuples
    Tuple,
    /// Mutable variable cells
    Cell,
    /// In-flight error signal
    Error,
    /// Caught (unwrapped) error payload
    Exception,
    /// Abstract callable type
    Callable,
    /// Bytecode closures
    Closure,
    /// Host functions
    Native,
    /// Abstract iterator type
    Iterator,
    /// Suspended bytecode frames exposed as iterators
    Generator,
    /// Positional iterators over tuples and strings
    SeqIter,
    /// Host objects without a more specific tag
    Opaque,
}

impl TypeTag {
    /// Every tag, in discriminant order.
    pub const ALL: [TypeTag; 18] = [
        TypeTag::Any,
        TypeTag::Nil,
        TypeTag::Bool,
        TypeTag::Number,
        TypeTag::Int,
        TypeTag::Real,
        TypeTag::Str,
        TypeTag::Tuple,
        TypeTag::Cell,
        TypeTag::Error,
        TypeTag::Exception,
        TypeTag::Callable,
        TypeTag::Closure,
        TypeTag::Native,
        TypeTag::Iterator,
        TypeTag::Generator,
        TypeTag::SeqIter,
        TypeTag::Opaque,
    ];

    /// Returns the direct supertype, or `None` for [`TypeTag::Any`].
    pub fn parent(self) -> Option<TypeTag> {
        match self {
            TypeTag::Any => None,
            TypeTag::Int | TypeTag::Real => Some(TypeTag::Number),
            TypeTag::Closure | TypeTag::Native => Some(TypeTag::Callable),
            TypeTag::Generator | TypeTag::SeqIter => Some(TypeTag::Iterator),
            _ => Some(TypeTag::Any),
        }
    }

    /// Depth in the lattice. Higher rank means more specific.
    pub fn rank(self) -> u32 {
        let mut rank = 0;
        let mut current = self;
        while let Some(parent) = current.parent() {
            rank += 1;
            current = parent;
        }
        rank
    }

    /// Reflexive, transitive subtype test.
    pub fn is_a(self, other: TypeTag) -> bool {
        let mut current = Some(self);
        while let Some(tag) = current {
            if tag == other {
                return true;
            }
            current = tag.parent();
        }
        false
    }

    /// Lowercase display name.
    pub fn name(self) -> &'static str {
        match self {
            TypeTag::Any => "any",
            TypeTag::Nil => "nil",
            TypeTag::Bool => "bool",
            TypeTag::Number => "number",
            TypeTag::Int => "int",
            TypeTag::Real => "real",
            TypeTag::Str => "str",
            TypeTag::Tuple => "tuple",
            TypeTag::Cell => "cell",
            TypeTag::Error => "error",
            TypeTag::Exception => "exception",
            TypeTag::Callable => "callable",
            TypeTag::Closure => "closure",
            TypeTag::Native => "native",
            TypeTag::Iterator => "iterator",
            TypeTag::Generator => "generator",
            TypeTag::SeqIter => "seq-iter",
            TypeTag::Opaque => "opaque",
        }
    }

    /// Decodes a discriminant produced by `tag as u8`.
    pub fn from_u8(byte: u8) -> Option<TypeTag> {
        TypeTag::ALL.get(byte as usize).copied()
    }
}

impl std::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
