//! Built-in functions the command line driver can lower, each exercising a
//! different part of the backend.

use strum::{Display, EnumIter, EnumString};

use crate::{
    ast::{
        BinaryOperator, ConversionKind, Declaration, FunctionAst, FunctionDefinition, NodeId,
        NodeKind, StorageClass, UnaryOperator, VariableId,
    },
    intern::InternedSymbol,
    ty::{
        FunctionSignature, IntKind, InterfaceMethod, InterfaceType, Parameter, Type, TypeKind,
        UIntKind,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum Sample {
    /// A counting loop with `continue`
    SumLoop,
    /// A switch with a multi-value case, fallthrough and default
    Classify,
    /// Labels and a backward goto
    Countdown,
    /// A method call through an interface value
    Dispatch,
    /// Starting a call on a new task
    Spawn,
    /// Division, remainder and shifts
    Arithmetic,
    /// Boxing a value into an interface and back
    Convert,
    /// Zeroing an array through a pointer
    Clear,
    /// An unconditional panic
    Panic,
}

impl Sample {
    pub fn description(self) -> &'static str {
        match self {
            Sample::SumLoop => "for loop with continue and compound assignment",
            Sample::Classify => "switch on a value with fallthrough and default",
            Sample::Countdown => "labels with forward and backward gotos",
            Sample::Dispatch => "interface method call",
            Sample::Spawn => "spawned call",
            Sample::Arithmetic => "division, remainder and variable shifts",
            Sample::Convert => "interface boxing and type assertion",
            Sample::Clear => "zero fill of a multi-word value",
            Sample::Panic => "panic",
        }
    }

    pub fn build(self) -> FunctionDefinition {
        match self {
            Sample::SumLoop => sum_loop(),
            Sample::Classify => classify(),
            Sample::Countdown => countdown(),
            Sample::Dispatch => dispatch(),
            Sample::Spawn => spawn(),
            Sample::Arithmetic => arithmetic(),
            Sample::Convert => convert(),
            Sample::Clear => clear(),
            Sample::Panic => boom(),
        }
    }
}

fn i64() -> Type {
    Type::int(IntKind::I64)
}

/// Tracks declarations alongside the tree so they end up in the definition
/// in slot order
struct Builder {
    ast: FunctionAst,
    parameters: Vec<Declaration>,
    automatics: Vec<Declaration>,
}

impl Builder {
    fn new() -> Self {
        let mut ast = FunctionAst::new();
        ast.at_line(1);

        Self {
            ast,
            parameters: Vec::new(),
            automatics: Vec::new(),
        }
    }

    fn line(&mut self, line: u32) -> &mut FunctionAst {
        self.ast.at_line(line)
    }

    fn parameter(&mut self, name: &str, ty: Type) -> VariableId {
        let variable = self.ast.variable(name, ty, StorageClass::Parameter);
        self.parameters.push(Declaration::Variable(variable));
        variable
    }

    fn automatic(&mut self, name: &str, ty: Type) -> VariableId {
        let variable = self.ast.variable(name, ty, StorageClass::Automatic);
        self.automatics.push(Declaration::Variable(variable));
        variable
    }

    fn finish(self, name: &str, signature: FunctionSignature, body: NodeId) -> FunctionDefinition {
        FunctionDefinition {
            name: InternedSymbol::new(name),
            ty: Type::function(signature),
            parameters: self.parameters,
            automatics: self.automatics,
            body: Some(body),
            ast: self.ast,
            line: 1,
        }
    }
}

fn signature(parameters: &[(&str, Type)], results: &[Type]) -> FunctionSignature {
    FunctionSignature {
        receiver: None,
        parameters: parameters
            .iter()
            .map(|(name, ty)| Parameter::named(name, ty.clone()))
            .collect(),
        results: results.iter().cloned().map(Parameter::anonymous).collect(),
    }
}

fn sum_loop() -> FunctionDefinition {
    let mut b = Builder::new();
    let n = b.parameter("n", i64());
    let i = b.automatic("i", i64());
    let s = b.automatic("s", i64());

    let ast = b.line(2);
    let target = ast.name(s);
    let clear = ast.assign_zero(target);

    let ast = b.line(3);
    let target = ast.name(i);
    let zero = ast.int(0, i64());
    let init = ast.assign(target, zero);
    let left = ast.name(i);
    let right = ast.name(n);
    let test = ast.binary(BinaryOperator::LessThan, left, right);
    let target = ast.name(i);
    let one = ast.int(1, i64());
    let increment = ast.compound_assign(BinaryOperator::Add, target, one);

    let ast = b.line(4);
    let left = ast.name(i);
    let three = ast.int(3, i64());
    let skip_test = ast.binary(BinaryOperator::Equals, left, three);
    let skip = ast.statement(NodeKind::Continue);
    let branch = ast.statement(NodeKind::If {
        init: None,
        test: skip_test,
        then: skip,
        otherwise: None,
    });

    let ast = b.line(5);
    let target = ast.name(s);
    let value = ast.name(i);
    let accumulate = ast.compound_assign(BinaryOperator::Add, target, value);

    let ast = b.line(3);
    let body = ast.list([branch, accumulate]);
    let for_loop = ast.statement(NodeKind::For {
        init: Some(init),
        test: Some(test),
        increment: Some(increment),
        body,
    });

    let ast = b.line(7);
    let result = ast.name(s);
    let ret = ast.statement(NodeKind::Return(vec![result]));
    let body = ast.list([clear, for_loop, ret]);

    b.finish("sum", signature(&[("n", i64())], &[i64()]), body)
}

fn classify() -> FunctionDefinition {
    let mut b = Builder::new();
    let x = b.parameter("x", i64());
    let r = b.automatic("r", i64());

    let ast = b.line(2);
    let target = ast.name(r);
    let clear = ast.assign_zero(target);

    let ast = b.line(4);
    let one = ast.int(1, i64());
    let two = ast.int(2, i64());
    let low = ast.statement(NodeKind::Case(vec![one, two]));
    let ast = b.line(5);
    let target = ast.name(r);
    let ten = ast.int(10, i64());
    let set_ten = ast.assign(target, ten);
    let ast = b.line(6);
    let fall = ast.statement(NodeKind::Fallthrough);

    let ast = b.line(7);
    let three = ast.int(3, i64());
    let middle = ast.statement(NodeKind::Case(vec![three]));
    let ast = b.line(8);
    let target = ast.name(r);
    let one = ast.int(1, i64());
    let bump = ast.compound_assign(BinaryOperator::Add, target, one);

    let ast = b.line(9);
    let default = ast.statement(NodeKind::Case(vec![]));
    let ast = b.line(10);
    let target = ast.name(r);
    let other = ast.int(99, i64());
    let set_other = ast.assign(target, other);

    let ast = b.line(3);
    let cases = ast.list([low, set_ten, fall, middle, bump, default, set_other]);
    let subject = ast.name(x);
    let switch = ast.statement(NodeKind::Switch {
        init: None,
        subject: Some(subject),
        body: cases,
    });

    let ast = b.line(12);
    let result = ast.name(r);
    let ret = ast.statement(NodeKind::Return(vec![result]));
    let body = ast.list([clear, switch, ret]);

    b.finish("classify", signature(&[("x", i64())], &[i64()]), body)
}

fn countdown() -> FunctionDefinition {
    let mut b = Builder::new();
    let n = b.parameter("n", i64());
    let top = InternedSymbol::new("top");
    let done = InternedSymbol::new("done");

    let ast = b.line(2);
    let label = ast.statement(NodeKind::Label(top));

    let ast = b.line(3);
    let left = ast.name(n);
    let zero = ast.int(0, i64());
    let finished = ast.binary(BinaryOperator::LessThanOrEqual, left, zero);
    let leave = ast.statement(NodeKind::Goto(done));
    let check = ast.statement(NodeKind::If {
        init: None,
        test: finished,
        then: leave,
        otherwise: None,
    });

    let ast = b.line(4);
    let target = ast.name(n);
    let one = ast.int(1, i64());
    let decrement = ast.compound_assign(BinaryOperator::Subtract, target, one);

    let ast = b.line(5);
    let again = ast.statement(NodeKind::Goto(top));

    let ast = b.line(6);
    let end = ast.statement(NodeKind::Label(done));
    let result = ast.name(n);
    let ret = ast.statement(NodeKind::Return(vec![result]));
    let body = ast.list([label, check, decrement, again, end, ret]);

    b.finish("countdown", signature(&[("n", i64())], &[i64()]), body)
}

fn shape() -> Type {
    let method = |name: &str| InterfaceMethod {
        name: InternedSymbol::new(name),
        signature: FunctionSignature {
            receiver: Some(Parameter::anonymous(Type::uint(UIntKind::U64))),
            parameters: vec![Parameter::named("scale", i64())],
            results: vec![Parameter::anonymous(i64())],
        },
    };

    Type::new(TypeKind::Interface(InterfaceType {
        name: InternedSymbol::new("Shape"),
        methods: vec![method("perimeter"), method("area")],
    }))
}

fn dispatch() -> FunctionDefinition {
    let mut b = Builder::new();
    let s = b.parameter("s", shape());
    let k = b.parameter("k", i64());

    let ast = b.line(2);
    let receiver = ast.name(s);
    let scale = ast.name(k);
    let call = ast.interface_call(receiver, "area", vec![scale]);
    let ret = ast.statement(NodeKind::Return(vec![call]));

    b.finish(
        "measure",
        signature(&[("s", shape()), ("k", i64())], &[i64()]),
        ret,
    )
}

fn spawn() -> FunctionDefinition {
    let mut b = Builder::new();
    let a = b.parameter("a", i64());
    let worker = b.ast.variable(
        "worker",
        Type::function(signature(&[("a", i64()), ("b", i64())], &[])),
        StorageClass::External,
    );

    let ast = b.line(2);
    let callee = ast.name(worker);
    let first = ast.name(a);
    let left = ast.name(a);
    let one = ast.int(1, i64());
    let second = ast.binary(BinaryOperator::Add, left, one);
    let call = ast.call(callee, vec![first, second]);
    let spawn = ast.statement(NodeKind::Spawn(call));

    b.finish("launch", signature(&[("a", i64())], &[]), spawn)
}

fn arithmetic() -> FunctionDefinition {
    let mut b = Builder::new();
    let a = b.parameter("a", i64());
    let d = b.parameter("d", i64());
    let n = b.parameter("n", Type::uint(UIntKind::U64));
    let q = b.automatic("q", i64());

    let ast = b.line(2);
    let left = ast.name(a);
    let right = ast.name(d);
    let quotient = ast.binary(BinaryOperator::Divide, left, right);
    let target = ast.name(q);
    let store = ast.assign(target, quotient);

    let ast = b.line(3);
    let left = ast.name(a);
    let right = ast.name(d);
    let remainder = ast.binary(BinaryOperator::Modulus, left, right);
    let count = ast.name(n);
    let shifted = ast.binary(BinaryOperator::ShiftLeft, remainder, count);
    let quotient = ast.name(q);
    let sum = ast.binary(BinaryOperator::Add, shifted, quotient);
    let ret = ast.statement(NodeKind::Return(vec![sum]));
    let body = ast.list([store, ret]);

    b.finish(
        "arithmetic",
        signature(
            &[("a", i64()), ("d", i64()), ("n", Type::uint(UIntKind::U64))],
            &[i64()],
        ),
        body,
    )
}

fn any() -> Type {
    Type::new(TypeKind::Interface(InterfaceType {
        name: InternedSymbol::new("Any"),
        methods: vec![],
    }))
}

fn convert() -> FunctionDefinition {
    let mut b = Builder::new();
    let v = b.parameter("v", i64());
    let boxed = b.automatic("boxed", any());

    let ast = b.line(2);
    let value = ast.name(v);
    let converted = ast.convert(ConversionKind::ConcreteToInterface, value, any());
    let target = ast.name(boxed);
    let store = ast.assign(target, converted);

    let ast = b.line(3);
    let value = ast.name(boxed);
    let unboxed = ast.convert(ConversionKind::InterfaceToConcrete, value, i64());
    let ret = ast.statement(NodeKind::Return(vec![unboxed]));
    let body = ast.list([store, ret]);

    b.finish("round_trip", signature(&[("v", i64())], &[i64()]), body)
}

fn clear() -> FunctionDefinition {
    let buffer = Type::new(TypeKind::Array {
        ty: Type::uint(UIntKind::U8),
        length: 20,
    });

    let mut b = Builder::new();
    let p = b.parameter("p", Type::pointer(buffer.clone()));

    let ast = b.line(2);
    let pointer = ast.name(p);
    let target = ast.unary(UnaryOperator::Deref, pointer);
    let clear = ast.assign_zero(target);

    b.finish("wipe", signature(&[("p", Type::pointer(buffer))], &[]), clear)
}

fn boom() -> FunctionDefinition {
    let mut b = Builder::new();

    let ast = b.line(2);
    let panic = ast.statement(NodeKind::Panic);

    b.finish("boom", signature(&[], &[]), panic)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use strum::IntoEnumIterator;

    use super::*;
    use crate::{
        backend::{Target, compile_function},
        diagnostics::Diagnostics,
    };

    #[test]
    fn every_sample_lowers_cleanly() {
        for sample in Sample::iter() {
            let function = sample.build();
            let mut diagnostics = Diagnostics::new();

            let compiled = compile_function(&function, Target::Amd64, &mut diagnostics)
                .unwrap_or_else(|e| panic!("{sample}: {e}"))
                .expect("samples have bodies");

            assert!(diagnostics.is_empty(), "{sample}: {:?}", diagnostics.kinds());
            assert!(compiled.instructions.len() > 2, "{sample}");
        }
    }

    #[test]
    fn names_round_trip_through_the_command_line_form() {
        assert_eq!(Sample::SumLoop.to_string(), "sum-loop");
        assert_eq!(Sample::from_str("dispatch"), Ok(Sample::Dispatch));
        assert!(Sample::from_str("nothing").is_err());
    }
}
