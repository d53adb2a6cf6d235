//! Type descriptors and the width/alignment oracle.
//!
//! Types reaching the backend are fully checked. The only questions the
//! lowering asks of them are how wide they are, how they are aligned, whether
//! they are signed and whether they fit in a register.

use std::sync::Arc;

use itertools::Itertools;
use strum::{Display, EnumIter};

use crate::intern::InternedSymbol;

/// Width of a pointer (and of one word of an interface value)
pub const POINTER_WIDTH: i64 = 8;

/// Largest alignment the ABI ever asks for
pub const MAX_ROUND: i64 = 8;

/// Rounds `offset` up to a multiple of `alignment`. Alignments larger than
/// [`MAX_ROUND`] are clamped and a zero alignment leaves the offset alone.
pub fn align_to(offset: i64, alignment: i64) -> i64 {
    let alignment = alignment.min(MAX_ROUND);

    if alignment <= 0 {
        return offset;
    }

    (offset + alignment - 1) / alignment * alignment
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum IntKind {
    I8,
    I16,
    I32,
    I64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum UIntKind {
    U8,
    U16,
    U32,
    U64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum FloatKind {
    F32,
    F64,
}

/// Shared pointer to a type descriptor. Cloning is cheap and the descriptor
/// can be shared between functions compiled on different threads.
#[derive(Clone, PartialEq)]
pub struct Type(Arc<TypeKind>);

impl Type {
    pub fn new(kind: TypeKind) -> Self {
        Self(Arc::new(kind))
    }

    pub fn int(kind: IntKind) -> Self {
        Self::new(TypeKind::Integer(kind))
    }

    pub fn uint(kind: UIntKind) -> Self {
        Self::new(TypeKind::UnsignedInteger(kind))
    }

    pub fn float(kind: FloatKind) -> Self {
        Self::new(TypeKind::Float(kind))
    }

    pub fn bool() -> Self {
        Self::new(TypeKind::Bool)
    }

    pub fn pointer(to: Type) -> Self {
        Self::new(TypeKind::Pointer(to))
    }

    /// An untyped machine word, used for addresses computed by the backend
    pub fn word() -> Self {
        Self::pointer(Self::uint(UIntKind::U8))
    }

    pub fn function(signature: FunctionSignature) -> Self {
        Self::new(TypeKind::Function(signature))
    }
}

impl core::ops::Deref for Type {
    type Target = TypeKind;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl core::fmt::Debug for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Type").field(&self.0).finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    /// i8, i16, i32, i64
    Integer(IntKind),
    /// u8, u16, u32, u64
    UnsignedInteger(UIntKind),
    /// f32, f64
    Float(FloatKind),
    Bool,
    /// *T
    Pointer(Type),
    /// A function symbol. Values of function type held in variables are
    /// pointers to functions.
    Function(FunctionSignature),
    /// A method table pointer followed by a data pointer
    Interface(InterfaceType),
    Struct(StructType),
    Array { ty: Type, length: usize },
}

/// Size and alignment in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub size: i64,
    pub alignment: i64,
}

impl Layout {
    const fn scalar(size: i64) -> Self {
        Self {
            size,
            alignment: size,
        }
    }
}

impl TypeKind {
    pub fn layout(&self) -> Layout {
        match self {
            TypeKind::Integer(IntKind::I8) | TypeKind::UnsignedInteger(UIntKind::U8) => {
                Layout::scalar(1)
            }
            TypeKind::Integer(IntKind::I16) | TypeKind::UnsignedInteger(UIntKind::U16) => {
                Layout::scalar(2)
            }
            TypeKind::Integer(IntKind::I32)
            | TypeKind::UnsignedInteger(UIntKind::U32)
            | TypeKind::Float(FloatKind::F32) => Layout::scalar(4),
            TypeKind::Integer(IntKind::I64)
            | TypeKind::UnsignedInteger(UIntKind::U64)
            | TypeKind::Float(FloatKind::F64) => Layout::scalar(8),
            TypeKind::Bool => Layout::scalar(1),
            TypeKind::Pointer(_) | TypeKind::Function(_) => Layout::scalar(POINTER_WIDTH),
            TypeKind::Interface(_) => Layout {
                size: 2 * POINTER_WIDTH,
                alignment: POINTER_WIDTH,
            },
            TypeKind::Struct(s) => s.layout(),
            TypeKind::Array { ty, length } => {
                let element = ty.layout();
                Layout {
                    size: element.size * *length as i64,
                    alignment: element.alignment,
                }
            }
        }
    }

    pub fn size(&self) -> i64 {
        self.layout().size
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, TypeKind::Integer(_) | TypeKind::Float(_))
    }

    pub fn is_integer_like(&self) -> bool {
        matches!(self, TypeKind::Integer(_) | TypeKind::UnsignedInteger(_))
    }

    pub fn is_float(&self) -> bool {
        matches!(self, TypeKind::Float(_))
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, TypeKind::Bool)
    }

    /// Values that live in memory as several words and are never held in a
    /// single register
    pub fn is_fat(&self) -> bool {
        matches!(
            self,
            TypeKind::Interface(_) | TypeKind::Struct(_) | TypeKind::Array { .. }
        )
    }

    pub fn as_function(&self) -> Option<&FunctionSignature> {
        match self {
            TypeKind::Function(signature) => Some(signature),
            _ => None,
        }
    }

    pub fn as_interface(&self) -> Option<&InterfaceType> {
        match self {
            TypeKind::Interface(interface) => Some(interface),
            _ => None,
        }
    }

    /// Name of the runtime type descriptor emitted for this type
    pub fn signature_symbol(&self) -> InternedSymbol {
        InternedSymbol::new(&format!("sig.{self}"))
    }
}

impl core::fmt::Display for TypeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeKind::Integer(kind) => write!(f, "{kind}"),
            TypeKind::UnsignedInteger(kind) => write!(f, "{kind}"),
            TypeKind::Float(kind) => write!(f, "{kind}"),
            TypeKind::Bool => write!(f, "bool"),
            TypeKind::Pointer(ty) => write!(f, "*{}", **ty),
            TypeKind::Function(signature) => write!(f, "{signature}"),
            TypeKind::Interface(interface) => write!(f, "{}", interface.name),
            TypeKind::Struct(s) => write!(f, "{}", s.name),
            TypeKind::Array { ty, length } => write!(f, "[{length}]{}", **ty),
        }
    }
}

impl core::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", **self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: Option<InternedSymbol>,
    pub ty: Type,
}

impl Parameter {
    pub fn named(name: &str, ty: Type) -> Self {
        Self {
            name: Some(InternedSymbol::new(name)),
            ty,
        }
    }

    pub fn anonymous(ty: Type) -> Self {
        Self { name: None, ty }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRole {
    Receiver,
    Parameter,
    Result,
}

/// One entry of a function's argument area
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    pub role: SlotRole,
    pub name: Option<InternedSymbol>,
    pub ty: Type,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FunctionSignature {
    pub receiver: Option<Parameter>,
    pub parameters: Vec<Parameter>,
    pub results: Vec<Parameter>,
}

impl FunctionSignature {
    /// Receiver, parameters and results in declaration order. Each slot sits
    /// at the accumulated width of the slots before it.
    pub fn slots(&self) -> Vec<Slot> {
        let receiver = self
            .receiver
            .iter()
            .map(|parameter| (SlotRole::Receiver, parameter));
        let parameters = self
            .parameters
            .iter()
            .map(|parameter| (SlotRole::Parameter, parameter));
        let results = self
            .results
            .iter()
            .map(|parameter| (SlotRole::Result, parameter));

        let mut offset = 0;

        receiver
            .chain(parameters)
            .chain(results)
            .map(|(role, parameter)| {
                let slot = Slot {
                    role,
                    name: parameter.name,
                    ty: parameter.ty.clone(),
                    offset,
                };
                offset += parameter.ty.size();
                slot
            })
            .collect()
    }

    pub fn input_slots(&self) -> Vec<Slot> {
        self.slots()
            .into_iter()
            .filter(|slot| slot.role != SlotRole::Result)
            .collect()
    }

    pub fn result_slots(&self) -> Vec<Slot> {
        self.slots()
            .into_iter()
            .filter(|slot| slot.role == SlotRole::Result)
            .collect()
    }

    /// Total width of the argument area, rounded to the ABI alignment
    pub fn argument_width(&self) -> i64 {
        let end = self
            .slots()
            .iter()
            .map(|slot| slot.offset + slot.ty.size())
            .max()
            .unwrap_or(0);

        align_to(end, MAX_ROUND)
    }
}

impl core::fmt::Display for FunctionSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(receiver) = &self.receiver {
            write!(f, "({}) ", receiver.ty)?;
        }

        write!(
            f,
            "func({})",
            self.parameters.iter().map(|p| p.ty.to_string()).join(", ")
        )?;

        match self.results.as_slice() {
            [] => Ok(()),
            [single] => write!(f, " {}", single.ty),
            many => write!(
                f,
                " ({})",
                many.iter().map(|p| p.ty.to_string()).join(", ")
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceMethod {
    pub name: InternedSymbol,
    /// Includes a pointer-sized receiver slot for the data word
    pub signature: FunctionSignature,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceType {
    pub name: InternedSymbol,
    pub methods: Vec<InterfaceMethod>,
}

impl InterfaceType {
    /// Declared index of a method alongside its description
    pub fn method(&self, name: InternedSymbol) -> Option<(usize, &InterfaceMethod)> {
        self.methods.iter().find_position(|m| m.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructType {
    pub name: InternedSymbol,
    pub fields: Vec<(InternedSymbol, Type)>,
}

impl StructType {
    fn layout(&self) -> Layout {
        let mut size = 0;
        let mut alignment = 1;

        for (_, ty) in &self.fields {
            let field = ty.layout();
            size = align_to(size, field.alignment) + field.size;
            alignment = alignment.max(field.alignment);
        }

        Layout {
            size: align_to(size, alignment),
            alignment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_accumulate_widths_in_declaration_order() {
        let signature = FunctionSignature {
            receiver: None,
            parameters: vec![
                Parameter::named("a", Type::int(IntKind::I64)),
                Parameter::named("b", Type::int(IntKind::I32)),
                Parameter::named("c", Type::int(IntKind::I64)),
            ],
            results: vec![Parameter::anonymous(Type::bool())],
        };

        let offsets = signature
            .slots()
            .iter()
            .map(|slot| slot.offset)
            .collect::<Vec<_>>();

        assert_eq!(offsets, [0, 8, 12, 20]);
        assert_eq!(signature.argument_width(), 24);
    }

    #[test]
    fn struct_fields_are_aligned() {
        let ty = Type::new(TypeKind::Struct(StructType {
            name: InternedSymbol::new("pair"),
            fields: vec![
                (InternedSymbol::new("tag"), Type::uint(UIntKind::U8)),
                (InternedSymbol::new("value"), Type::int(IntKind::I64)),
            ],
        }));

        assert_eq!(
            ty.layout(),
            Layout {
                size: 16,
                alignment: 8
            }
        );
        assert!(ty.is_fat());
    }

    #[test]
    fn align_to_clamps_large_alignments() {
        assert_eq!(align_to(9, 4), 12);
        assert_eq!(align_to(9, 24), 16);
        assert_eq!(align_to(9, 0), 9);
    }
}
