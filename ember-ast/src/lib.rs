#![forbid(unsafe_code)]

//! Syntax tree handed to the semantic core by the parser.
//!
//! Every node carries a [`Span`]. The tree is immutable once built; the binder
//! only ever borrows from it.

use std::fmt;

use miette::SourceSpan;

pub type Span = SourceSpan;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Spanned<T> {
    pub span: Span,
    pub node: T,
}

impl<T> Spanned<T> {
    pub fn new(span: Span, node: T) -> Self {
        Self { span, node }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Spanned<U> {
        Spanned {
            span: self.span,
            node: f(self.node),
        }
    }
}

pub fn span(start: usize, len: usize) -> Span {
    SourceSpan::new(start.into(), len)
}

pub fn span_between(start: usize, end: usize) -> Span {
    debug_assert!(end >= start);
    span(start, end - start)
}

pub type Ident = Spanned<String>;

/// Dot-separated package name, e.g. `emerge.core`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageName(pub Vec<String>);

impl PackageName {
    pub fn parse(dotted: &str) -> Self {
        Self(dotted.split('.').map(str::to_string).collect())
    }

    pub fn child(&self, simple_name: &str) -> String {
        format!("{self}.{simple_name}")
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Module {
    pub package: PackageName,
    pub files: Vec<SourceFile>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SourceFile {
    pub name: String,
    pub imports: Vec<ImportDecl>,
    pub declarations: Vec<Declaration>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImportDecl {
    pub span: Span,
    pub package: PackageName,
    pub symbol: ImportedSymbol,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ImportedSymbol {
    /// `import some.package.*`
    All,
    Named(Ident),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Declaration {
    Function(FunctionDecl),
    Class(ClassDecl),
    Interface(InterfaceDecl),
    GlobalVariable(VariableDecl),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Variance {
    Unspecified,
    In,
    Out,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeMutability {
    Mutable,
    ReadOnly,
    Immutable,
    Exclusive,
}

/// Ownership tag spelled on a parameter or variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VariableOwnership {
    Borrowed,
    Captured,
    Exclusive,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypeRef {
    pub span: Span,
    pub mutability: Option<TypeMutability>,
    pub name: Ident,
    pub arguments: Vec<TypeArgumentRef>,
    pub nullable: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypeArgumentRef {
    pub span: Span,
    pub variance: Variance,
    pub ty: TypeRef,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypeParameterDecl {
    pub span: Span,
    pub name: Ident,
    pub variance: Variance,
    pub bound: Option<TypeRef>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Modifier {
    pub span: Span,
    pub kind: ModifierKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModifierKind {
    Pure,
    ReadOnly,
    Mutable,
    Nothrow,
    /// `external(C)`
    External { ffi: String },
    Intrinsic,
    Override,
    Operator,
    Export,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FunctionDecl {
    pub span: Span,
    pub name: Ident,
    pub modifiers: Vec<Modifier>,
    pub type_parameters: Vec<TypeParameterDecl>,
    pub parameters: Vec<ParameterDecl>,
    pub return_type: Option<TypeRef>,
    pub body: Option<FunctionBody>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FunctionBody {
    Block(CodeChunk),
    /// `fun f() = expr`
    SingleExpression(Expr),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParameterDecl {
    pub span: Span,
    pub name: Ident,
    pub ownership: Option<VariableOwnership>,
    pub declared_type: Option<TypeRef>,
    pub default_value: Option<Expr>,
    pub reassignable: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClassDecl {
    pub span: Span,
    pub name: Ident,
    pub type_parameters: Vec<TypeParameterDecl>,
    pub supertypes: Vec<TypeRef>,
    pub members: Vec<ClassMember>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ClassMember {
    Variable(MemberVariableDecl),
    Constructor(ConstructorDecl),
    Destructor(DestructorDecl),
    Function(FunctionDecl),
}

#[derive(Clone, Debug, PartialEq)]
pub struct MemberVariableDecl {
    pub span: Span,
    pub name: Ident,
    pub declared_type: TypeRef,
    pub reassignable: bool,
    pub initializer: MemberInitializer,
}

#[derive(Clone, Debug, PartialEq)]
pub enum MemberInitializer {
    /// Must be assigned by the constructor body.
    None,
    /// `x: T = init`; the value becomes a constructor parameter.
    ConstructorParameter,
    Expression(Expr),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConstructorDecl {
    pub span: Span,
    pub modifiers: Vec<Modifier>,
    pub body: CodeChunk,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DestructorDecl {
    pub span: Span,
    pub body: CodeChunk,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InterfaceDecl {
    pub span: Span,
    pub name: Ident,
    pub type_parameters: Vec<TypeParameterDecl>,
    pub supertypes: Vec<TypeRef>,
    pub functions: Vec<FunctionDecl>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VariableDecl {
    pub span: Span,
    pub name: Ident,
    pub reassignable: bool,
    pub ownership: Option<VariableOwnership>,
    pub declared_type: Option<TypeRef>,
    pub initializer: Option<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CodeChunk {
    pub span: Span,
    pub stmts: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Variable(VariableDecl),
    Assignment(AssignmentStmt),
    Return(ReturnStmt),
    Throw(ThrowStmt),
    While(WhileStmt),
    Break(Span),
    Continue(Span),
    Expr(Expr),
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Variable(v) => v.span,
            Stmt::Assignment(a) => a.span,
            Stmt::Return(r) => r.span,
            Stmt::Throw(t) => t.span,
            Stmt::While(w) => w.span,
            Stmt::Break(s) | Stmt::Continue(s) => *s,
            Stmt::Expr(e) => e.span,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AssignmentStmt {
    pub span: Span,
    pub target: AssignmentTarget,
    pub value: Expr,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AssignmentTarget {
    Variable(Ident),
    Member { object: Expr, member: Ident },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReturnStmt {
    pub span: Span,
    pub value: Option<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ThrowStmt {
    pub span: Span,
    pub value: Expr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WhileStmt {
    pub span: Span,
    pub condition: Expr,
    pub body: CodeChunk,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    pub span: Span,
    pub kind: ExprKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    IntegerLiteral(IntegerLiteral),
    BooleanLiteral(bool),
    StringLiteral(String),
    NullLiteral,
    Identifier(Ident),
    MemberAccess {
        object: Box<Expr>,
        member: Ident,
        /// `a?.b`
        null_safe: bool,
    },
    Invocation(Box<InvocationExpr>),
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    /// `expr!!`
    NotNullAssertion(Box<Expr>),
    If(Box<IfExpr>),
    Try(Box<TryExpr>),
}

/// The magnitude as written; a leading minus arrives as [`UnaryOp::Negate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntegerLiteral {
    pub value: u128,
    pub base: NumberBase,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NumberBase {
    Binary,
    Octal,
    Decimal,
    Hexadecimal,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InvocationExpr {
    /// `receiver.name(...)`; absent for `name(...)`.
    pub receiver: Option<Expr>,
    pub name: Ident,
    pub type_arguments: Vec<TypeArgumentRef>,
    pub arguments: Vec<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IfExpr {
    pub condition: Expr,
    pub then_branch: CodeChunk,
    pub else_branch: Option<CodeChunk>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TryExpr {
    pub body: CodeChunk,
    pub catch_variable: Ident,
    pub catch_body: CodeChunk,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Plus,
    Minus,
    Times,
    Divide,
    Modulo,

    Equals,
    NotEquals,
    Less,
    Greater,
    LessOrEqual,
    GreaterOrEqual,

    And,
    Or,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
}
