//! Binary template format
//!
//! Layout (all integers are LEB128 varints, signed ones zig-zag encoded):
//!
//! ```text
//! "TMPL" version count template*
//! ```
//!
//! Templates are written children first; a `MakeClosure` operand is the index
//! of an earlier template, and the last template is the root. Structurally
//! identical templates share one entry. Branch targets are instruction
//! offsets inside their own template. Call-site caches are not persisted.
//! Tuple constants nest at most [`MAX_CONSTANT_DEPTH`] levels.
//!
//! The same body encoding, with nested templates replaced by their digests,
//! is the canonical form hashed by [`ClosureTemplate::digest`].

use std::sync::Arc;

use core_types::{IdTable, TypeTag, Value};

use crate::instruction::{Declaration, Instruction};
use crate::opcode::{BranchTable, CallSite, Capture, Opcode};
use crate::template::{ClosureTemplate, TemplateParts};
use crate::verify::VerifyError;

/// File magic
pub const MAGIC: &[u8; 4] = b"TMPL";

/// Current format version
pub const FORMAT_VERSION: u64 = 1;

/// Deepest tuple nesting a constant may have
pub const MAX_CONSTANT_DEPTH: usize = 64;

/// Encoding failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    /// A constant has no persistent form (cells, natives, host objects, errors)
    #[error("template `{template}`: {kind} constant cannot be encoded")]
    UnencodableConstant {
        /// Template holding the constant
        template: Arc<str>,
        /// Type name of the constant
        kind: &'static str,
    },
    /// A tuple constant nests deeper than [`MAX_CONSTANT_DEPTH`]
    #[error("template `{template}`: constant nests deeper than {limit}")]
    NestingTooDeep {
        /// Template holding the constant
        template: Arc<str>,
        /// The limit in force
        limit: usize,
    },
}

/// Decoding failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The input does not start with the format magic
    #[error("bad magic")]
    BadMagic,
    /// The input was written by another format version
    #[error("unsupported format version {found} (expected {expected})")]
    VersionMismatch {
        /// Version in the input
        found: u64,
        /// Version this build reads
        expected: u64,
    },
    /// The input ended early
    #[error("unexpected end of input at offset {offset}")]
    Truncated {
        /// Read position
        offset: usize,
    },
    /// A varint does not fit in 64 bits
    #[error("varint overflow at offset {offset}")]
    VarintOverflow {
        /// Read position
        offset: usize,
    },
    /// An integer does not fit the field it encodes
    #[error("value out of range at offset {offset}")]
    OutOfRange {
        /// Read position
        offset: usize,
    },
    /// An unknown tag byte
    #[error("unknown {what} tag {tag} at offset {offset}")]
    UnknownTag {
        /// Kind of tag
        what: &'static str,
        /// Tag value
        tag: u8,
        /// Read position
        offset: usize,
    },
    /// A string is not UTF-8
    #[error("invalid utf-8 at offset {offset}")]
    InvalidUtf8 {
        /// Read position
        offset: usize,
    },
    /// A tuple constant nests deeper than [`MAX_CONSTANT_DEPTH`]
    #[error("constant nests deeper than {limit} at offset {offset}")]
    NestingTooDeep {
        /// Read position
        offset: usize,
        /// The limit in force
        limit: usize,
    },
    /// A nested template reference does not point at an earlier template
    #[error("template index {index} is not defined before offset {offset}")]
    BadTemplateIndex {
        /// Referenced index
        index: u64,
        /// Read position
        offset: usize,
    },
    /// The input holds no templates
    #[error("no templates in input")]
    Empty,
    /// Bytes remain after the root template
    #[error("trailing bytes at offset {offset}")]
    TrailingBytes {
        /// Read position
        offset: usize,
    },
    /// A decoded template failed verification
    #[error(transparent)]
    Verify(#[from] VerifyError),
}

mod tag {
    pub const NIL: u8 = 0;
    pub const FALSE: u8 = 1;
    pub const TRUE: u8 = 2;
    pub const INT: u8 = 3;
    pub const REAL: u8 = 4;
    pub const STR: u8 = 5;
    pub const TUPLE: u8 = 6;
    // Canonical form only: type tag plus identity hash
    pub const OPAQUE: u8 = 0xff;
}

/// Encodes `root` and every template nested in it.
pub fn encode(root: &ClosureTemplate) -> Result<Vec<u8>, EncodeError> {
    let mut order: Vec<&ClosureTemplate> = Vec::new();
    let mut index: IdTable<u64> = IdTable::new();
    collect(root, &mut order, &mut index);

    let mut writer = Writer::new(false);
    writer.bytes(MAGIC);
    writer.varint(FORMAT_VERSION);
    writer.varint(order.len() as u64);
    for template in order {
        writer.template(template, &|child| index.get(child.digest()).copied().unwrap_or(0))?;
    }
    Ok(writer.finish())
}

// Post-order, de-duplicated by digest.
fn collect<'a>(
    template: &'a ClosureTemplate,
    order: &mut Vec<&'a ClosureTemplate>,
    index: &mut IdTable<u64>,
) {
    if index.contains_key(template.digest()) {
        return;
    }
    for child in template.nested() {
        collect(child, order, index);
    }
    index.insert(template.digest(), order.len() as u64);
    order.push(template);
}

/// FNV-1a 64 over the canonical body encoding of `template`.
pub(crate) fn digest(template: &ClosureTemplate) -> u64 {
    let mut writer = Writer::new(true);
    // Canonical mode writes every constant, so this cannot fail.
    let _ = writer.template(template, &|child| child.digest());
    fnv1a(&writer.finish())
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

struct Writer {
    out: Vec<u8>,
    canonical: bool,
}

impl Writer {
    fn new(canonical: bool) -> Self {
        Self {
            out: Vec::new(),
            canonical,
        }
    }

    fn finish(self) -> Vec<u8> {
        self.out
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    fn u8(&mut self, byte: u8) {
        self.out.push(byte);
    }

    fn varint(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.out.push(byte);
                return;
            }
            self.out.push(byte | 0x80);
        }
    }

    fn zigzag(&mut self, value: i64) {
        self.varint(((value << 1) ^ (value >> 63)) as u64);
    }

    fn str(&mut self, s: &str) {
        self.varint(s.len() as u64);
        self.bytes(s.as_bytes());
    }

    fn template(
        &mut self,
        template: &ClosureTemplate,
        child_ref: &dyn Fn(&ClosureTemplate) -> u64,
    ) -> Result<(), EncodeError> {
        self.str(template.name());
        self.str(template.source());
        self.varint(u64::from(template.locals()));
        self.varint(u64::from(template.params()));
        self.u8(u8::from(template.variadic()));
        self.varint(u64::from(template.frame_size()));

        self.varint(template.captures().len() as u64);
        for capture in template.captures() {
            match capture {
                Capture::Local(slot) => {
                    self.u8(0);
                    self.varint(u64::from(*slot));
                }
                Capture::Upvalue(index) => {
                    self.u8(1);
                    self.varint(u64::from(*index));
                }
            }
        }

        self.varint(template.declarations().len() as u64);
        for decl in template.declarations() {
            self.str(&decl.name);
            self.varint(u64::from(decl.slot));
            self.varint(u64::from(decl.line));
        }

        self.varint(template.code().len() as u64);
        for inst in template.code() {
            self.instruction(template, inst, child_ref)?;
        }
        Ok(())
    }

    fn instruction(
        &mut self,
        template: &ClosureTemplate,
        inst: &Instruction,
        child_ref: &dyn Fn(&ClosureTemplate) -> u64,
    ) -> Result<(), EncodeError> {
        self.u8(opcode_tag(&inst.opcode));
        self.varint(u64::from(inst.line));
        match &inst.opcode {
            Opcode::Const(value) => self.value(template, value, 0)?,
            Opcode::LoadLocal(n)
            | Opcode::StoreLocal(n)
            | Opcode::LoadUpvalue(n)
            | Opcode::EnterScope(n)
            | Opcode::ExitScope(n)
            | Opcode::DeclareForward(n)
            | Opcode::Bind(n)
            | Opcode::Jump(n)
            | Opcode::JumpIfNil(n)
            | Opcode::JumpUnlessNil(n)
            | Opcode::Call(n)
            | Opcode::TailCall(n)
            | Opcode::Try(n)
            | Opcode::BuildTuple(n)
            | Opcode::BuildString(n) => self.varint(u64::from(*n)),
            Opcode::LoadGlobal(name) => self.str(name),
            Opcode::Switch(table) => {
                self.varint(table.targets.len() as u64);
                for target in &table.targets {
                    self.varint(u64::from(*target));
                }
                self.varint(u64::from(table.default));
            }
            Opcode::CallMethod(site) => {
                self.str(&site.method);
                self.varint(u64::from(site.argc));
            }
            Opcode::MakeClosure(child) => self.varint(child_ref(child)),
            _ => {}
        }
        Ok(())
    }

    fn value(
        &mut self,
        template: &ClosureTemplate,
        value: &Value,
        depth: usize,
    ) -> Result<(), EncodeError> {
        match value {
            Value::Nil => self.u8(tag::NIL),
            Value::Bool(false) => self.u8(tag::FALSE),
            Value::Bool(true) => self.u8(tag::TRUE),
            Value::Int(n) => {
                self.u8(tag::INT);
                self.zigzag(*n);
            }
            Value::Real(n) => {
                self.u8(tag::REAL);
                self.bytes(&n.to_bits().to_le_bytes());
            }
            Value::Str(s) => {
                self.u8(tag::STR);
                self.str(s);
            }
            Value::Tuple(items) if depth >= MAX_CONSTANT_DEPTH => {
                if !self.canonical {
                    return Err(EncodeError::NestingTooDeep {
                        template: template.name().clone(),
                        limit: MAX_CONSTANT_DEPTH,
                    });
                }
                // Identity stands in for the rest of the tree.
                self.u8(tag::OPAQUE);
                self.u8(TypeTag::Tuple as u8);
                self.bytes(&(Arc::as_ptr(items) as *const Value as usize as u64).to_le_bytes());
            }
            Value::Tuple(items) => {
                self.u8(tag::TUPLE);
                self.varint(items.len() as u64);
                for item in items.iter() {
                    self.value(template, item, depth + 1)?;
                }
            }
            other if self.canonical => {
                self.u8(tag::OPAQUE);
                self.u8(other.type_tag() as u8);
                self.bytes(&other.hash_code().to_le_bytes());
            }
            other => {
                return Err(EncodeError::UnencodableConstant {
                    template: template.name().clone(),
                    kind: other.type_tag().name(),
                })
            }
        }
        Ok(())
    }
}

fn opcode_tag(opcode: &Opcode) -> u8 {
    match opcode {
        Opcode::Const(_) => 0,
        Opcode::Nil => 1,
        Opcode::Pop => 2,
        Opcode::Dup => 3,
        Opcode::Swap => 4,
        Opcode::LoadLocal(_) => 5,
        Opcode::StoreLocal(_) => 6,
        Opcode::LoadUpvalue(_) => 7,
        Opcode::LoadSelf => 8,
        Opcode::LoadGlobal(_) => 9,
        Opcode::EnterScope(_) => 10,
        Opcode::ExitScope(_) => 11,
        Opcode::Deref => 12,
        Opcode::Assign => 13,
        Opcode::DeclareForward(_) => 14,
        Opcode::Bind(_) => 15,
        Opcode::Jump(_) => 16,
        Opcode::JumpIfNil(_) => 17,
        Opcode::JumpUnlessNil(_) => 18,
        Opcode::Switch(_) => 19,
        Opcode::Iterate => 20,
        Opcode::IterNext => 21,
        Opcode::IterKey => 22,
        Opcode::IterValue => 23,
        Opcode::Call(_) => 24,
        Opcode::TailCall(_) => 25,
        Opcode::CallMethod(_) => 26,
        Opcode::Try(_) => 27,
        Opcode::EndTry => 28,
        Opcode::Catch => 29,
        Opcode::Raise => 30,
        Opcode::Retry => 31,
        Opcode::MakeClosure(_) => 32,
        Opcode::BuildTuple(_) => 33,
        Opcode::BuildString(_) => 34,
        Opcode::Suspend => 35,
        Opcode::Return => 36,
        Opcode::Halt => 37,
    }
}

/// Decodes a root template (and its nested templates), verifying each one.
pub fn decode(bytes: &[u8]) -> Result<Arc<ClosureTemplate>, DecodeError> {
    let mut reader = Reader::new(bytes);
    if reader.take(MAGIC.len()).map_err(|_| DecodeError::BadMagic)? != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let version = reader.varint()?;
    if version != FORMAT_VERSION {
        return Err(DecodeError::VersionMismatch {
            found: version,
            expected: FORMAT_VERSION,
        });
    }

    let count = reader.varint()?;
    if count == 0 {
        return Err(DecodeError::Empty);
    }
    let mut templates: Vec<Arc<ClosureTemplate>> = Vec::new();
    let mut by_digest: IdTable<Arc<ClosureTemplate>> = IdTable::new();
    for _ in 0..count {
        let parts = reader.template(&templates)?;
        let template = ClosureTemplate::from_parts(parts)?;
        let shared = by_digest
            .get_or_insert_with(template.digest(), || template)
            .clone();
        templates.push(shared);
    }
    if reader.remaining() > 0 {
        return Err(DecodeError::TrailingBytes { offset: reader.pos });
    }
    templates.pop().ok_or(DecodeError::Empty)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(DecodeError::Truncated { offset: self.pos })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn varint(&mut self) -> Result<u64, DecodeError> {
        let start = self.pos;
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            if (shift == 63 && byte > 1) || shift > 63 {
                return Err(DecodeError::VarintOverflow { offset: start });
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let offset = self.pos;
        u32::try_from(self.varint()?).map_err(|_| DecodeError::OutOfRange { offset })
    }

    fn zigzag(&mut self) -> Result<i64, DecodeError> {
        let raw = self.varint()?;
        Ok((raw >> 1) as i64 ^ -((raw & 1) as i64))
    }

    fn len(&mut self) -> Result<usize, DecodeError> {
        let offset = self.pos;
        let n = usize::try_from(self.varint()?).map_err(|_| DecodeError::OutOfRange { offset })?;
        // Every element takes at least one byte.
        if n > self.remaining() {
            return Err(DecodeError::Truncated { offset });
        }
        Ok(n)
    }

    fn str(&mut self) -> Result<Arc<str>, DecodeError> {
        let n = self.len()?;
        let offset = self.pos;
        let raw = self.take(n)?;
        std::str::from_utf8(raw)
            .map(Arc::from)
            .map_err(|_| DecodeError::InvalidUtf8 { offset })
    }

    fn template(&mut self, earlier: &[Arc<ClosureTemplate>]) -> Result<TemplateParts, DecodeError> {
        let name = self.str()?;
        let source = self.str()?;
        let locals = self.u32()?;
        let params = self.u32()?;
        let offset = self.pos;
        let variadic = match self.u8()? {
            0 => false,
            1 => true,
            tag => {
                return Err(DecodeError::UnknownTag {
                    what: "variadic",
                    tag,
                    offset,
                })
            }
        };
        let frame_size = self.u32()?;

        let n = self.len()?;
        let mut captures = Vec::with_capacity(n);
        for _ in 0..n {
            let offset = self.pos;
            let capture = match self.u8()? {
                0 => Capture::Local(self.u32()?),
                1 => Capture::Upvalue(self.u32()?),
                tag => {
                    return Err(DecodeError::UnknownTag {
                        what: "capture",
                        tag,
                        offset,
                    })
                }
            };
            captures.push(capture);
        }

        let n = self.len()?;
        let mut declarations = Vec::with_capacity(n);
        for _ in 0..n {
            let name = self.str()?;
            let slot = self.u32()?;
            let line = self.u32()?;
            declarations.push(Declaration::new(name, slot, line));
        }

        let n = self.len()?;
        let mut code = Vec::with_capacity(n);
        for _ in 0..n {
            code.push(self.instruction(earlier)?);
        }

        Ok(TemplateParts {
            name,
            source,
            code,
            frame_size,
            locals,
            params,
            variadic,
            captures,
            declarations,
        })
    }

    fn instruction(&mut self, earlier: &[Arc<ClosureTemplate>]) -> Result<Instruction, DecodeError> {
        let offset = self.pos;
        let tag = self.u8()?;
        let line = self.u32()?;
        let opcode = match tag {
            0 => Opcode::Const(self.value(0)?),
            1 => Opcode::Nil,
            2 => Opcode::Pop,
            3 => Opcode::Dup,
            4 => Opcode::Swap,
            5 => Opcode::LoadLocal(self.u32()?),
            6 => Opcode::StoreLocal(self.u32()?),
            7 => Opcode::LoadUpvalue(self.u32()?),
            8 => Opcode::LoadSelf,
            9 => Opcode::LoadGlobal(self.str()?),
            10 => Opcode::EnterScope(self.u32()?),
            11 => Opcode::ExitScope(self.u32()?),
            12 => Opcode::Deref,
            13 => Opcode::Assign,
            14 => Opcode::DeclareForward(self.u32()?),
            15 => Opcode::Bind(self.u32()?),
            16 => Opcode::Jump(self.u32()?),
            17 => Opcode::JumpIfNil(self.u32()?),
            18 => Opcode::JumpUnlessNil(self.u32()?),
            19 => {
                let n = self.len()?;
                let mut targets = Vec::with_capacity(n);
                for _ in 0..n {
                    targets.push(self.u32()?);
                }
                let default = self.u32()?;
                Opcode::Switch(Arc::new(BranchTable::new(targets, default)))
            }
            20 => Opcode::Iterate,
            21 => Opcode::IterNext,
            22 => Opcode::IterKey,
            23 => Opcode::IterValue,
            24 => Opcode::Call(self.u32()?),
            25 => Opcode::TailCall(self.u32()?),
            26 => {
                let method = self.str()?;
                let argc = self.u32()?;
                Opcode::CallMethod(Arc::new(CallSite::new(method, argc)))
            }
            27 => Opcode::Try(self.u32()?),
            28 => Opcode::EndTry,
            29 => Opcode::Catch,
            30 => Opcode::Raise,
            31 => Opcode::Retry,
            32 => {
                let at = self.pos;
                let index = self.varint()?;
                let child = usize::try_from(index)
                    .ok()
                    .and_then(|i| earlier.get(i))
                    .ok_or(DecodeError::BadTemplateIndex { index, offset: at })?;
                Opcode::MakeClosure(Arc::clone(child))
            }
            33 => Opcode::BuildTuple(self.u32()?),
            34 => Opcode::BuildString(self.u32()?),
            35 => Opcode::Suspend,
            36 => Opcode::Return,
            37 => Opcode::Halt,
            tag => {
                return Err(DecodeError::UnknownTag {
                    what: "opcode",
                    tag,
                    offset,
                })
            }
        };
        Ok(Instruction::at_line(opcode, line))
    }

    fn value(&mut self, depth: usize) -> Result<Value, DecodeError> {
        let offset = self.pos;
        Ok(match self.u8()? {
            tag::NIL => Value::Nil,
            tag::FALSE => Value::Bool(false),
            tag::TRUE => Value::Bool(true),
            tag::INT => Value::Int(self.zigzag()?),
            tag::REAL => {
                let raw = self.take(8)?;
                let mut bits = [0u8; 8];
                bits.copy_from_slice(raw);
                Value::Real(f64::from_bits(u64::from_le_bytes(bits)))
            }
            tag::STR => Value::Str(self.str()?),
            tag::TUPLE if depth >= MAX_CONSTANT_DEPTH => {
                return Err(DecodeError::NestingTooDeep {
                    offset,
                    limit: MAX_CONSTANT_DEPTH,
                })
            }
            tag::TUPLE => {
                let n = self.len()?;
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(self.value(depth + 1)?);
                }
                Value::tuple(items)
            }
            tag => {
                return Err(DecodeError::UnknownTag {
                    what: "constant",
                    tag,
                    offset,
                })
            }
        })
    }
}
