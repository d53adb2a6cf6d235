//! Stack frame layout.
//!
//! The argument area (receiver, parameters, results) is addressed upward from
//! the frame pointer at the offsets the signature assigns. Locals grow
//! downward from the top of the frame. Below them sits the outgoing argument
//! area, sized to the largest call made by the function.

use colored::Colorize;
use hashbrown::HashMap;

use crate::{
    ast::{Declaration, FunctionDefinition, StorageClass, VariableId},
    diagnostics::{LoweringError, Result},
    intern::InternedSymbol,
    ty::{SlotRole, align_to},
};

#[derive(Debug, Clone, PartialEq)]
pub struct FrameEntry {
    pub name: InternedSymbol,
    pub class: StorageClass,
    pub offset: i64,
    pub size: i64,
}

#[derive(Debug, Clone, Default)]
pub struct Frame {
    offsets: HashMap<VariableId, i64>,
    entries: Vec<FrameEntry>,
    locals: i64,
    max_outgoing: i64,
    argument_width: i64,
}

impl Frame {
    /// Assigns offsets to every declared parameter, named result and
    /// automatic of `function`
    pub fn layout(function: &FunctionDefinition) -> Result<Self> {
        let signature = function
            .ty
            .as_function()
            .ok_or_else(|| LoweringError::NotCallable(function.ty.to_string()))?;
        let ast = &function.ast;

        let mut frame = Frame {
            argument_width: signature.argument_width(),
            ..Default::default()
        };

        let mut declarations = function.parameters.iter();

        for slot in signature.slots() {
            // every input has a declaration, results only when they are named
            if slot.role == SlotRole::Result
                && slot.name.is_none_or(|name| name.value().starts_with('_'))
            {
                continue;
            }

            let variable = loop {
                match declarations.next() {
                    Some(Declaration::Variable(variable)) => break *variable,
                    Some(Declaration::Other(_)) => continue,
                    None => {
                        return Err(LoweringError::MissingParameterDeclaration(
                            slot.name.unwrap_or_else(|| InternedSymbol::new("_")),
                        ));
                    }
                }
            };

            let declared = &ast[variable];
            if declared.class != StorageClass::Parameter {
                return Err(LoweringError::StorageClassMismatch {
                    name: declared.name,
                    expected: StorageClass::Parameter.into(),
                    actual: declared.class.into(),
                });
            }

            frame.bind(variable, declared.name, StorageClass::Parameter, slot.offset, slot.ty.size());
        }

        for declaration in &function.automatics {
            let Declaration::Variable(variable) = *declaration else {
                continue;
            };

            let declared = &ast[variable];
            if declared.class != StorageClass::Automatic {
                return Err(LoweringError::StorageClassMismatch {
                    name: declared.name,
                    expected: StorageClass::Automatic.into(),
                    actual: declared.class.into(),
                });
            }

            let size = declared.ty.size();
            let offset = frame.allocate_automatic(size);
            frame.bind(variable, declared.name, StorageClass::Automatic, offset, size);
        }

        Ok(frame)
    }

    /// Reserves `size` bytes below the locals allocated so far, aligned to
    /// the size itself, and returns the offset of the new slot
    pub fn allocate_automatic(&mut self, size: i64) -> i64 {
        self.locals += size;
        self.locals = align_to(self.locals, size);

        -self.locals
    }

    pub fn bind(
        &mut self,
        variable: VariableId,
        name: InternedSymbol,
        class: StorageClass,
        offset: i64,
        size: i64,
    ) {
        self.offsets.insert(variable, offset);
        self.entries.push(FrameEntry {
            name,
            class,
            offset,
            size,
        });
    }

    pub fn offset_of(&self, variable: VariableId) -> Option<i64> {
        self.offsets.get(&variable).copied()
    }

    /// Grows the outgoing argument area to hold at least `width` bytes
    pub fn raise_outgoing(&mut self, width: i64) {
        self.max_outgoing = self.max_outgoing.max(width);
    }

    pub fn locals_size(&self) -> i64 {
        self.locals
    }

    pub fn max_outgoing(&self) -> i64 {
        self.max_outgoing
    }

    pub fn argument_width(&self) -> i64 {
        self.argument_width
    }

    /// Bytes between the hardware stack pointer and the top of the frame,
    /// before rounding
    pub fn frame_size(&self) -> i64 {
        self.locals + self.max_outgoing
    }
}

impl core::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for entry in &self.entries {
            let location = match entry.class {
                StorageClass::Parameter => format!("{}(FP)", entry.offset),
                StorageClass::Automatic | StorageClass::External => {
                    format!("{}(SP)", entry.offset)
                }
            };

            writeln!(
                f,
                "    {:<10} {:<12} {} {}",
                entry.class.to_string().blue(),
                entry.name.to_string().bold(),
                location,
                format!("[{} bytes]", entry.size).dimmed()
            )?;
        }

        write!(
            f,
            "    {} {}, {} {}, {} {}",
            "arguments".blue(),
            self.argument_width,
            "locals".blue(),
            self.locals,
            "outgoing".blue(),
            self.max_outgoing
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ast::FunctionAst,
        ty::{FunctionSignature, IntKind, Parameter, StructType, Type, TypeKind, UIntKind},
    };

    fn definition(
        ast: FunctionAst,
        signature: FunctionSignature,
        parameters: Vec<Declaration>,
        automatics: Vec<Declaration>,
    ) -> FunctionDefinition {
        FunctionDefinition {
            name: InternedSymbol::new("f"),
            ty: Type::function(signature),
            parameters,
            automatics,
            body: None,
            ast,
            line: 1,
        }
    }

    #[test]
    fn parameters_sit_at_accumulated_widths() {
        let mut ast = FunctionAst::new();
        let a = ast.variable("a", Type::int(IntKind::I64), StorageClass::Parameter);
        let b = ast.variable("b", Type::int(IntKind::I32), StorageClass::Parameter);
        let c = ast.variable("c", Type::int(IntKind::I64), StorageClass::Parameter);

        let signature = FunctionSignature {
            receiver: None,
            parameters: vec![
                Parameter::named("a", Type::int(IntKind::I64)),
                Parameter::named("b", Type::int(IntKind::I32)),
                Parameter::named("c", Type::int(IntKind::I64)),
            ],
            results: vec![],
        };

        let frame = Frame::layout(&definition(
            ast,
            signature,
            vec![
                Declaration::Variable(a),
                Declaration::Other(InternedSymbol::new("T")),
                Declaration::Variable(b),
                Declaration::Variable(c),
            ],
            vec![],
        ))
        .unwrap();

        assert_eq!(frame.offset_of(a), Some(0));
        assert_eq!(frame.offset_of(b), Some(8));
        assert_eq!(frame.offset_of(c), Some(12));
        assert!(frame.offset_of(c).unwrap() + 8 <= frame.argument_width());
    }

    #[test]
    fn locals_grow_downward_aligned_to_their_width() {
        let mut ast = FunctionAst::new();
        let x = ast.variable("x", Type::uint(UIntKind::U8), StorageClass::Automatic);
        let y = ast.variable("y", Type::int(IntKind::I64), StorageClass::Automatic);
        let z = ast.variable("z", Type::int(IntKind::I32), StorageClass::Automatic);

        let frame = Frame::layout(&definition(
            ast,
            FunctionSignature::default(),
            vec![],
            vec![
                Declaration::Variable(x),
                Declaration::Variable(y),
                Declaration::Variable(z),
            ],
        ))
        .unwrap();

        assert_eq!(frame.offset_of(x), Some(-1));
        assert_eq!(frame.offset_of(y), Some(-16));
        assert_eq!(frame.offset_of(z), Some(-20));
        assert_eq!(frame.locals_size(), 20);
    }

    #[test]
    fn large_locals_are_aligned_to_the_maximum() {
        let mut ast = FunctionAst::new();
        let flag = ast.variable("flag", Type::bool(), StorageClass::Automatic);
        let triple = ast.variable(
            "triple",
            Type::new(TypeKind::Struct(StructType {
                name: InternedSymbol::new("triple"),
                fields: vec![
                    (InternedSymbol::new("a"), Type::int(IntKind::I32)),
                    (InternedSymbol::new("b"), Type::int(IntKind::I32)),
                    (InternedSymbol::new("c"), Type::int(IntKind::I32)),
                ],
            })),
            StorageClass::Automatic,
        );

        let frame = Frame::layout(&definition(
            ast,
            FunctionSignature::default(),
            vec![],
            vec![Declaration::Variable(flag), Declaration::Variable(triple)],
        ))
        .unwrap();

        assert_eq!(frame.offset_of(flag), Some(-1));
        assert_eq!(frame.offset_of(triple), Some(-16));
    }

    #[test]
    fn unnamed_and_blank_results_need_no_declaration() {
        let mut ast = FunctionAst::new();
        let a = ast.variable("a", Type::int(IntKind::I64), StorageClass::Parameter);
        let r = ast.variable("r", Type::int(IntKind::I64), StorageClass::Parameter);

        let signature = FunctionSignature {
            receiver: None,
            parameters: vec![Parameter::named("a", Type::int(IntKind::I64))],
            results: vec![
                Parameter::anonymous(Type::int(IntKind::I64)),
                Parameter::named("_", Type::int(IntKind::I64)),
                Parameter::named("r", Type::int(IntKind::I64)),
            ],
        };

        let frame = Frame::layout(&definition(
            ast,
            signature,
            vec![Declaration::Variable(a), Declaration::Variable(r)],
            vec![],
        ))
        .unwrap();

        assert_eq!(frame.offset_of(r), Some(24));
        assert_eq!(frame.argument_width(), 32);
    }

    #[test]
    fn missing_parameter_declaration_is_fatal() {
        let mut ast = FunctionAst::new();
        let a = ast.variable("a", Type::int(IntKind::I64), StorageClass::Parameter);

        let signature = FunctionSignature {
            receiver: None,
            parameters: vec![
                Parameter::named("a", Type::int(IntKind::I64)),
                Parameter::named("b", Type::int(IntKind::I64)),
            ],
            results: vec![],
        };

        let error = Frame::layout(&definition(
            ast,
            signature,
            vec![Declaration::Variable(a)],
            vec![],
        ))
        .unwrap_err();

        assert_eq!(
            error,
            LoweringError::MissingParameterDeclaration(InternedSymbol::new("b"))
        );
    }

    #[test]
    fn storage_class_mismatch_is_fatal() {
        let mut ast = FunctionAst::new();
        let a = ast.variable("a", Type::int(IntKind::I64), StorageClass::Automatic);

        let signature = FunctionSignature {
            receiver: None,
            parameters: vec![Parameter::named("a", Type::int(IntKind::I64))],
            results: vec![],
        };

        let error = Frame::layout(&definition(
            ast,
            signature,
            vec![Declaration::Variable(a)],
            vec![],
        ))
        .unwrap_err();

        assert!(matches!(
            error,
            LoweringError::StorageClassMismatch {
                expected: "parameter",
                actual: "automatic",
                ..
            }
        ));
    }
}
