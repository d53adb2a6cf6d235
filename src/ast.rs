//! The typed tree of one function, as handed over by the type checker.
//!
//! Nodes live in an arena and refer to each other by [`NodeId`]. The builder
//! methods on [`FunctionAst`] fill in the derived facts the backend relies on
//! (result type, addressability and the Ullman complexity number) so trees
//! built by hand in tests look exactly like the ones the front end produces.

use strum::{Display, EnumIter};

use crate::{
    backend::Register,
    index::{IndexVec, simple_index},
    intern::InternedSymbol,
    ty::{FunctionSignature, Type, TypeKind},
};

simple_index! {
    pub struct NodeId;
}

simple_index! {
    pub struct VariableId;
}

/// Complexity of anything that may perform a call. Evaluating such a node
/// can clobber every register.
pub const UNBOUNDED: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum StorageClass {
    /// Receiver, parameter or named result, addressed from the argument area
    Parameter,
    /// Local to the function, addressed below the frame pointer
    Automatic,
    /// Global data or function, addressed by symbol
    External,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: InternedSymbol,
    pub ty: Type,
    pub class: StorageClass,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Bool(bool),
    Nil,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum BinaryOperator {
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Subtract,
    #[strum(serialize = "*")]
    Multiply,
    #[strum(serialize = "/")]
    Divide,
    #[strum(serialize = "%")]
    Modulus,
    #[strum(serialize = "<<")]
    ShiftLeft,
    #[strum(serialize = ">>")]
    ShiftRight,
    #[strum(serialize = "&")]
    BitwiseAnd,
    #[strum(serialize = "|")]
    BitwiseOr,
    #[strum(serialize = "^")]
    BitwiseXor,
    #[strum(serialize = "==")]
    Equals,
    #[strum(serialize = "!=")]
    NotEquals,
    #[strum(serialize = "<")]
    LessThan,
    #[strum(serialize = "<=")]
    LessThanOrEqual,
    #[strum(serialize = ">")]
    GreaterThan,
    #[strum(serialize = ">=")]
    GreaterThanOrEqual,
    #[strum(serialize = "&&")]
    LogicalAnd,
    #[strum(serialize = "||")]
    LogicalOr,
}

impl BinaryOperator {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Equals
                | Self::NotEquals
                | Self::LessThan
                | Self::LessThanOrEqual
                | Self::GreaterThan
                | Self::GreaterThanOrEqual
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, Self::LogicalAnd | Self::LogicalOr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum UnaryOperator {
    #[strum(serialize = "-")]
    Negate,
    #[strum(serialize = "!")]
    LogicalNot,
    #[strum(serialize = "^")]
    BitwiseNot,
    #[strum(serialize = "&")]
    AddressOf,
    #[strum(serialize = "*")]
    Deref,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ConversionKind {
    /// Concrete value to interface value
    ConcreteToInterface,
    /// Interface value to another interface type
    InterfaceToInterface,
    /// Interface value back to the concrete value it holds
    InterfaceToConcrete,
}

#[derive(Debug, Clone, PartialEq, strum::IntoStaticStr)]
pub enum NodeKind {
    Empty,
    List(Vec<NodeId>),
    Label(InternedSymbol),
    Goto(InternedSymbol),
    Break,
    Continue,
    Fallthrough,
    For {
        init: Option<NodeId>,
        test: Option<NodeId>,
        increment: Option<NodeId>,
        body: NodeId,
    },
    If {
        init: Option<NodeId>,
        test: NodeId,
        then: NodeId,
        otherwise: Option<NodeId>,
    },
    /// A missing subject switches on `true`, so every case is a condition
    Switch {
        init: Option<NodeId>,
        subject: Option<NodeId>,
        body: NodeId,
    },
    /// Starts a case inside a switch body. No values marks the default case.
    Case(Vec<NodeId>),
    /// A missing value assigns the zero value of the destination's type
    Assign {
        destination: NodeId,
        value: Option<NodeId>,
    },
    CompoundAssign {
        operator: BinaryOperator,
        destination: NodeId,
        value: NodeId,
    },
    Call {
        callee: NodeId,
        arguments: Vec<NodeId>,
    },
    /// `receiver.method(arguments)` on a concrete type. `function` is the
    /// method's underlying function, which takes the receiver first.
    MethodCall {
        function: VariableId,
        receiver: NodeId,
        arguments: Vec<NodeId>,
    },
    InterfaceCall {
        receiver: NodeId,
        method: InternedSymbol,
        arguments: Vec<NodeId>,
    },
    Spawn(NodeId),
    Return(Vec<NodeId>),
    Panic,
    Convert {
        kind: ConversionKind,
        value: NodeId,
    },
    Register(Register),
    /// Memory at a fixed offset from the address held in a register
    Indirect {
        register: Register,
        offset: i64,
    },
    Literal(Literal),
    Name(VariableId),
    Unary {
        operator: UnaryOperator,
        operand: NodeId,
    },
    Binary {
        operator: BinaryOperator,
        left: NodeId,
        right: NodeId,
    },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        self.into()
    }

    pub fn is_call(&self) -> bool {
        matches!(
            self,
            NodeKind::Call { .. } | NodeKind::MethodCall { .. } | NodeKind::InterfaceCall { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    /// None for statements
    pub ty: Option<Type>,
    /// The value can be used as an instruction operand without computing it
    /// into a register first
    pub addressable: bool,
    pub complexity: u32,
    pub line: u32,
}

impl Node {
    pub fn is_unbounded(&self) -> bool {
        self.complexity >= UNBOUNDED
    }
}

#[derive(Debug, Clone, Default)]
pub struct FunctionAst {
    pub nodes: IndexVec<NodeId, Node>,
    pub variables: IndexVec<VariableId, Variable>,
    line: u32,
}

impl core::ops::Index<NodeId> for FunctionAst {
    type Output = Node;

    fn index(&self, index: NodeId) -> &Self::Output {
        &self.nodes[index]
    }
}

impl core::ops::Index<VariableId> for FunctionAst {
    type Output = Variable;

    fn index(&self, index: VariableId) -> &Self::Output {
        &self.variables[index]
    }
}

fn combine(left: u32, right: u32) -> u32 {
    let combined = if left == right { left + 1 } else { left.max(right) };

    combined.min(UNBOUNDED)
}

impl FunctionAst {
    pub fn new() -> Self {
        Self::default()
    }

    /// Source line attached to nodes created from now on
    pub fn at_line(&mut self, line: u32) -> &mut Self {
        self.line = line;
        self
    }

    pub fn variable(&mut self, name: &str, ty: Type, class: StorageClass) -> VariableId {
        self.variables.push(Variable {
            name: InternedSymbol::new(name),
            ty,
            class,
        })
    }

    pub fn type_of(&self, node: NodeId) -> Option<&Type> {
        self.nodes[node].ty.as_ref()
    }

    /// Whether evaluating `node` reads the contents of `register`, either
    /// as a value or as the base of an indirect operand
    pub fn reads_register(&self, node: NodeId, register: Register) -> bool {
        let reads = |node: &NodeId| self.reads_register(*node, register);

        match &self.nodes[node].kind {
            NodeKind::Register(r) | NodeKind::Indirect { register: r, .. } => *r == register,
            NodeKind::Unary { operand, .. } => reads(operand),
            NodeKind::Binary { left, right, .. } => reads(left) || reads(right),
            NodeKind::Convert { value, .. } | NodeKind::Spawn(value) => reads(value),
            NodeKind::Call { callee, arguments } => {
                reads(callee) || arguments.iter().any(reads)
            }
            NodeKind::MethodCall {
                receiver,
                arguments,
                ..
            }
            | NodeKind::InterfaceCall {
                receiver,
                arguments,
                ..
            } => reads(receiver) || arguments.iter().any(reads),
            _ => false,
        }
    }

    fn complexity_of(&self, node: Option<NodeId>) -> u32 {
        node.map(|n| self.nodes[n].complexity).unwrap_or(1)
    }

    /// Appends a node, deriving its addressability and complexity from its
    /// kind and children
    pub fn push(&mut self, kind: NodeKind, ty: Option<Type>) -> NodeId {
        let (addressable, complexity) = match &kind {
            NodeKind::Name(_)
            | NodeKind::Literal(_)
            | NodeKind::Register(_)
            | NodeKind::Indirect { .. } => (true, 1),
            NodeKind::Call { .. }
            | NodeKind::MethodCall { .. }
            | NodeKind::InterfaceCall { .. }
            | NodeKind::Convert { .. }
            | NodeKind::Spawn(_) => (false, UNBOUNDED),
            NodeKind::Unary { operand, .. } => {
                (false, combine(self.complexity_of(Some(*operand)), 1))
            }
            NodeKind::Binary { left, right, .. } => (
                false,
                combine(
                    self.complexity_of(Some(*left)),
                    self.complexity_of(Some(*right)),
                ),
            ),
            NodeKind::Assign { destination, value } => (
                false,
                combine(self.complexity_of(Some(*destination)), self.complexity_of(*value)),
            ),
            NodeKind::CompoundAssign {
                destination, value, ..
            } => (
                false,
                combine(
                    self.complexity_of(Some(*destination)),
                    self.complexity_of(Some(*value)),
                ),
            ),
            _ => (false, 1),
        };

        self.nodes.push(Node {
            kind,
            ty,
            addressable,
            complexity,
            line: self.line,
        })
    }

    pub fn statement(&mut self, kind: NodeKind) -> NodeId {
        self.push(kind, None)
    }

    pub fn list(&mut self, statements: impl IntoIterator<Item = NodeId>) -> NodeId {
        self.statement(NodeKind::List(statements.into_iter().collect()))
    }

    pub fn name(&mut self, variable: VariableId) -> NodeId {
        let ty = self.variables[variable].ty.clone();
        self.push(NodeKind::Name(variable), Some(ty))
    }

    pub fn literal(&mut self, literal: Literal, ty: Type) -> NodeId {
        self.push(NodeKind::Literal(literal), Some(ty))
    }

    pub fn int(&mut self, value: i64, ty: Type) -> NodeId {
        self.literal(Literal::Int(value), ty)
    }

    pub fn register(&mut self, register: Register, ty: Type) -> NodeId {
        self.push(NodeKind::Register(register), Some(ty))
    }

    pub fn indirect(&mut self, register: Register, offset: i64, ty: Type) -> NodeId {
        self.push(NodeKind::Indirect { register, offset }, Some(ty))
    }

    pub fn unary(&mut self, operator: UnaryOperator, operand: NodeId) -> NodeId {
        let operand_ty = self.type_of(operand).cloned();

        let ty = match operator {
            UnaryOperator::AddressOf => operand_ty.map(Type::pointer),
            UnaryOperator::Deref => match operand_ty.as_deref() {
                Some(TypeKind::Pointer(pointee)) => Some(pointee.clone()),
                _ => None,
            },
            UnaryOperator::LogicalNot => Some(Type::bool()),
            UnaryOperator::Negate | UnaryOperator::BitwiseNot => operand_ty,
        };

        self.push(NodeKind::Unary { operator, operand }, ty)
    }

    pub fn binary(&mut self, operator: BinaryOperator, left: NodeId, right: NodeId) -> NodeId {
        let ty = if operator.is_comparison() || operator.is_logical() {
            Some(Type::bool())
        } else {
            self.type_of(left).cloned()
        };

        self.push(
            NodeKind::Binary {
                operator,
                left,
                right,
            },
            ty,
        )
    }

    pub fn assign(&mut self, destination: NodeId, value: NodeId) -> NodeId {
        self.statement(NodeKind::Assign {
            destination,
            value: Some(value),
        })
    }

    pub fn assign_zero(&mut self, destination: NodeId) -> NodeId {
        self.statement(NodeKind::Assign {
            destination,
            value: None,
        })
    }

    pub fn compound_assign(
        &mut self,
        operator: BinaryOperator,
        destination: NodeId,
        value: NodeId,
    ) -> NodeId {
        self.statement(NodeKind::CompoundAssign {
            operator,
            destination,
            value,
        })
    }

    fn first_result(signature: Option<&FunctionSignature>) -> Option<Type> {
        signature
            .and_then(|s| s.results.first())
            .map(|result| result.ty.clone())
    }

    pub fn call(&mut self, callee: NodeId, arguments: Vec<NodeId>) -> NodeId {
        let ty = match self.type_of(callee).map(|t| &**t) {
            Some(TypeKind::Function(signature)) => Self::first_result(Some(signature)),
            Some(TypeKind::Pointer(pointee)) => Self::first_result(pointee.as_function()),
            _ => None,
        };

        self.push(NodeKind::Call { callee, arguments }, ty)
    }

    pub fn method_call(
        &mut self,
        function: VariableId,
        receiver: NodeId,
        arguments: Vec<NodeId>,
    ) -> NodeId {
        let ty = Self::first_result(self.variables[function].ty.as_function());

        self.push(
            NodeKind::MethodCall {
                function,
                receiver,
                arguments,
            },
            ty,
        )
    }

    pub fn interface_call(
        &mut self,
        receiver: NodeId,
        method: &str,
        arguments: Vec<NodeId>,
    ) -> NodeId {
        let method = InternedSymbol::new(method);
        let ty = self
            .type_of(receiver)
            .and_then(|t| t.as_interface())
            .and_then(|interface| interface.method(method))
            .and_then(|(_, m)| Self::first_result(Some(&m.signature)));

        self.push(
            NodeKind::InterfaceCall {
                receiver,
                method,
                arguments,
            },
            ty,
        )
    }

    pub fn convert(&mut self, kind: ConversionKind, value: NodeId, ty: Type) -> NodeId {
        self.push(NodeKind::Convert { kind, value }, Some(ty))
    }
}

/// A declaration listed on a function definition. Declarations that are not
/// variables (constants, types) can appear among them and are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Declaration {
    Variable(VariableId),
    Other(InternedSymbol),
}

#[derive(Debug, Clone)]
pub struct FunctionDefinition {
    pub name: InternedSymbol,
    /// Always a function type
    pub ty: Type,
    /// One declaration per named receiver, parameter and result slot
    pub parameters: Vec<Declaration>,
    pub automatics: Vec<Declaration>,
    /// None for functions declared without a body
    pub body: Option<NodeId>,
    pub ast: FunctionAst,
    pub line: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ty::IntKind;

    #[test]
    fn complexity_follows_ullman_numbering() {
        let mut ast = FunctionAst::new();
        let a = ast.variable("a", Type::int(IntKind::I64), StorageClass::Automatic);
        let b = ast.variable("b", Type::int(IntKind::I64), StorageClass::Automatic);

        let left = ast.name(a);
        let right = ast.name(b);
        let sum = ast.binary(BinaryOperator::Add, left, right);
        assert_eq!(ast[sum].complexity, 2);

        let one = ast.int(1, Type::int(IntKind::I64));
        let lopsided = ast.binary(BinaryOperator::Add, sum, one);
        assert_eq!(ast[lopsided].complexity, 2);

        let balanced = ast.binary(BinaryOperator::Multiply, sum, lopsided);
        assert_eq!(ast[balanced].complexity, 3);
        assert!(!ast[balanced].addressable);
        assert!(ast[left].addressable);
    }

    #[test]
    fn register_reads_are_found_through_operators() {
        let mut ast = FunctionAst::new();
        let a = ast.variable("a", Type::int(IntKind::I64), StorageClass::Automatic);

        let name = ast.name(a);
        let held = ast.indirect(Register::Ax, 8, Type::int(IntKind::I64));
        let sum = ast.binary(BinaryOperator::Add, name, held);
        let negated = ast.unary(UnaryOperator::Negate, sum);

        assert!(ast.reads_register(negated, Register::Ax));
        assert!(!ast.reads_register(negated, Register::Dx));
        assert!(!ast.reads_register(name, Register::Ax));
    }

    #[test]
    fn calls_make_their_parents_unbounded() {
        let mut ast = FunctionAst::new();
        let f = ast.variable(
            "f",
            Type::function(FunctionSignature {
                results: vec![crate::ty::Parameter::anonymous(Type::int(IntKind::I64))],
                ..Default::default()
            }),
            StorageClass::External,
        );

        let callee = ast.name(f);
        let call = ast.call(callee, vec![]);
        let one = ast.int(1, Type::int(IntKind::I64));
        let sum = ast.binary(BinaryOperator::Add, call, one);

        assert!(ast[call].is_unbounded());
        assert!(ast[sum].is_unbounded());
        assert_eq!(ast.type_of(sum), Some(&Type::int(IntKind::I64)));
    }
}
