//! AST builders for integration tests. The parser lives outside this
//! workspace, so programs are assembled by hand.

#![allow(dead_code)]

use ember_ast::*;
use ember_core::{AnalysisResult, DiagnosticKind, SemaConfig, SemanticAnalyzer, Severity};

pub fn at() -> Span {
    span(0, 0)
}

pub fn ident(name: &str) -> Ident {
    Spanned::new(at(), name.to_string())
}

pub fn ty(name: &str) -> TypeRef {
    TypeRef {
        span: at(),
        mutability: None,
        name: ident(name),
        arguments: Vec::new(),
        nullable: false,
    }
}

pub fn nullable(mut ty: TypeRef) -> TypeRef {
    ty.nullable = true;
    ty
}

pub fn with_mutability(mut ty: TypeRef, mutability: TypeMutability) -> TypeRef {
    ty.mutability = Some(mutability);
    ty
}

pub fn generic(name: &str, arguments: Vec<TypeRef>) -> TypeRef {
    let mut reference = ty(name);
    reference.arguments = arguments
        .into_iter()
        .map(|ty| TypeArgumentRef {
            span: at(),
            variance: Variance::Unspecified,
            ty,
        })
        .collect();
    reference
}

fn expr(kind: ExprKind) -> Expr {
    Expr { span: at(), kind }
}

pub fn int(value: u128) -> Expr {
    expr(ExprKind::IntegerLiteral(IntegerLiteral {
        value,
        base: NumberBase::Decimal,
    }))
}

pub fn int_in_base(value: u128, base: NumberBase) -> Expr {
    expr(ExprKind::IntegerLiteral(IntegerLiteral { value, base }))
}

pub fn boolean(value: bool) -> Expr {
    expr(ExprKind::BooleanLiteral(value))
}

pub fn string(value: &str) -> Expr {
    expr(ExprKind::StringLiteral(value.to_string()))
}

pub fn null() -> Expr {
    expr(ExprKind::NullLiteral)
}

pub fn var(name: &str) -> Expr {
    expr(ExprKind::Identifier(ident(name)))
}

pub fn member(object: Expr, name: &str) -> Expr {
    expr(ExprKind::MemberAccess {
        object: Box::new(object),
        member: ident(name),
        null_safe: false,
    })
}

pub fn safe_member(object: Expr, name: &str) -> Expr {
    expr(ExprKind::MemberAccess {
        object: Box::new(object),
        member: ident(name),
        null_safe: true,
    })
}

pub fn call(name: &str, arguments: Vec<Expr>) -> Expr {
    expr(ExprKind::Invocation(Box::new(InvocationExpr {
        receiver: None,
        name: ident(name),
        type_arguments: Vec::new(),
        arguments,
    })))
}

pub fn method(receiver: Expr, name: &str, arguments: Vec<Expr>) -> Expr {
    expr(ExprKind::Invocation(Box::new(InvocationExpr {
        receiver: Some(receiver),
        name: ident(name),
        type_arguments: Vec::new(),
        arguments,
    })))
}

pub fn binary(left: Expr, op: BinaryOp, right: Expr) -> Expr {
    expr(ExprKind::Binary {
        left: Box::new(left),
        op,
        right: Box::new(right),
    })
}

pub fn negate(operand: Expr) -> Expr {
    expr(ExprKind::Unary {
        op: UnaryOp::Negate,
        operand: Box::new(operand),
    })
}

pub fn not_null(operand: Expr) -> Expr {
    expr(ExprKind::NotNullAssertion(Box::new(operand)))
}

pub fn if_else(condition: Expr, then_branch: Vec<Stmt>, else_branch: Option<Vec<Stmt>>) -> Expr {
    expr(ExprKind::If(Box::new(IfExpr {
        condition,
        then_branch: block(then_branch),
        else_branch: else_branch.map(block),
    })))
}

pub fn try_catch(body: Vec<Stmt>, catch_variable: &str, catch_body: Vec<Stmt>) -> Expr {
    expr(ExprKind::Try(Box::new(TryExpr {
        body: block(body),
        catch_variable: ident(catch_variable),
        catch_body: block(catch_body),
    })))
}

pub fn block(stmts: Vec<Stmt>) -> CodeChunk {
    CodeChunk { span: at(), stmts }
}

fn variable(name: &str, reassignable: bool, declared_type: Option<TypeRef>, initializer: Option<Expr>) -> VariableDecl {
    VariableDecl {
        span: at(),
        name: ident(name),
        reassignable,
        ownership: None,
        declared_type,
        initializer,
    }
}

pub fn val(name: &str, declared_type: Option<TypeRef>, initializer: Option<Expr>) -> Stmt {
    Stmt::Variable(variable(name, false, declared_type, initializer))
}

pub fn var_decl(name: &str, declared_type: Option<TypeRef>, initializer: Option<Expr>) -> Stmt {
    Stmt::Variable(variable(name, true, declared_type, initializer))
}

pub fn assign(name: &str, value: Expr) -> Stmt {
    Stmt::Assignment(AssignmentStmt {
        span: at(),
        target: AssignmentTarget::Variable(ident(name)),
        value,
    })
}

pub fn assign_member(object: Expr, name: &str, value: Expr) -> Stmt {
    Stmt::Assignment(AssignmentStmt {
        span: at(),
        target: AssignmentTarget::Member {
            object,
            member: ident(name),
        },
        value,
    })
}

pub fn ret(value: Option<Expr>) -> Stmt {
    Stmt::Return(ReturnStmt { span: at(), value })
}

pub fn throw(value: Expr) -> Stmt {
    Stmt::Throw(ThrowStmt { span: at(), value })
}

pub fn while_loop(condition: Expr, body: Vec<Stmt>) -> Stmt {
    Stmt::While(WhileStmt {
        span: at(),
        condition,
        body: block(body),
    })
}

pub fn brk() -> Stmt {
    Stmt::Break(at())
}

pub fn stmt(expression: Expr) -> Stmt {
    Stmt::Expr(expression)
}

pub fn global(name: &str, reassignable: bool, declared_type: Option<TypeRef>, initializer: Option<Expr>) -> Declaration {
    Declaration::GlobalVariable(variable(name, reassignable, declared_type, initializer))
}

pub struct FunctionBuilder {
    decl: FunctionDecl,
}

pub fn fun(name: &str) -> FunctionBuilder {
    FunctionBuilder {
        decl: FunctionDecl {
            span: at(),
            name: ident(name),
            modifiers: Vec::new(),
            type_parameters: Vec::new(),
            parameters: Vec::new(),
            return_type: None,
            body: None,
        },
    }
}

impl FunctionBuilder {
    pub fn param(self, name: &str, ty: TypeRef) -> Self {
        self.param_with(name, ty, None, false)
    }

    pub fn param_with(
        mut self,
        name: &str,
        ty: TypeRef,
        ownership: Option<VariableOwnership>,
        reassignable: bool,
    ) -> Self {
        self.decl.parameters.push(ParameterDecl {
            span: at(),
            name: ident(name),
            ownership,
            declared_type: Some(ty),
            default_value: None,
            reassignable,
        });
        self
    }

    /// `self` parameter without a declared type, for member functions.
    pub fn receiver(mut self) -> Self {
        self.decl.parameters.push(ParameterDecl {
            span: at(),
            name: ident("self"),
            ownership: None,
            declared_type: None,
            default_value: None,
            reassignable: false,
        });
        self
    }

    pub fn type_parameter(mut self, name: &str, bound: Option<TypeRef>) -> Self {
        self.decl.type_parameters.push(TypeParameterDecl {
            span: at(),
            name: ident(name),
            variance: Variance::Unspecified,
            bound,
        });
        self
    }

    pub fn returns(mut self, ty: TypeRef) -> Self {
        self.decl.return_type = Some(ty);
        self
    }

    pub fn modifier(mut self, kind: ModifierKind) -> Self {
        self.decl.modifiers.push(Modifier { span: at(), kind });
        self
    }

    pub fn body(mut self, stmts: Vec<Stmt>) -> FunctionDecl {
        self.decl.body = Some(FunctionBody::Block(block(stmts)));
        self.decl
    }

    pub fn expression_body(mut self, expression: Expr) -> FunctionDecl {
        self.decl.body = Some(FunctionBody::SingleExpression(expression));
        self.decl
    }

    pub fn abstract_(self) -> FunctionDecl {
        self.decl
    }
}

pub struct ClassBuilder {
    decl: ClassDecl,
}

pub fn class(name: &str) -> ClassBuilder {
    ClassBuilder {
        decl: ClassDecl {
            span: at(),
            name: ident(name),
            type_parameters: Vec::new(),
            supertypes: Vec::new(),
            members: Vec::new(),
        },
    }
}

impl ClassBuilder {
    pub fn implements(mut self, ty: TypeRef) -> Self {
        self.decl.supertypes.push(ty);
        self
    }

    pub fn member(mut self, name: &str, ty: TypeRef, reassignable: bool, initializer: MemberInitializer) -> Self {
        self.decl.members.push(ClassMember::Variable(MemberVariableDecl {
            span: at(),
            name: ident(name),
            declared_type: ty,
            reassignable,
            initializer,
        }));
        self
    }

    pub fn constructor(mut self, stmts: Vec<Stmt>) -> Self {
        self.decl.members.push(ClassMember::Constructor(ConstructorDecl {
            span: at(),
            modifiers: Vec::new(),
            body: block(stmts),
        }));
        self
    }

    pub fn destructor(mut self, stmts: Vec<Stmt>) -> Self {
        self.decl.members.push(ClassMember::Destructor(DestructorDecl {
            span: at(),
            body: block(stmts),
        }));
        self
    }

    pub fn function(mut self, function: FunctionDecl) -> Self {
        self.decl.members.push(ClassMember::Function(function));
        self
    }

    pub fn build(self) -> Declaration {
        Declaration::Class(self.decl)
    }
}

pub fn interface(name: &str, functions: Vec<FunctionDecl>) -> Declaration {
    Declaration::Interface(InterfaceDecl {
        span: at(),
        name: ident(name),
        type_parameters: Vec::new(),
        supertypes: Vec::new(),
        functions,
    })
}

pub fn module(package: &str, declarations: Vec<Declaration>) -> Module {
    Module {
        package: PackageName::parse(package),
        files: vec![SourceFile {
            name: "main.em".to_string(),
            imports: Vec::new(),
            declarations,
        }],
    }
}

pub fn analyze(declarations: Vec<Declaration>) -> AnalysisResult {
    analyze_with(SemaConfig::default(), declarations)
}

pub fn analyze_with(config: SemaConfig, declarations: Vec<Declaration>) -> AnalysisResult {
    SemanticAnalyzer::new(config).analyze(&[module("app", declarations)])
}

pub fn kinds(result: &AnalysisResult) -> Vec<DiagnosticKind> {
    result.diagnostics().iter().map(|d| d.kind.clone()).collect()
}

pub fn errors(result: &AnalysisResult) -> Vec<DiagnosticKind> {
    result
        .diagnostics()
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.kind.clone())
        .collect()
}

#[track_caller]
pub fn assert_clean(result: &AnalysisResult) {
    let found = kinds(result);
    assert!(found.is_empty(), "unexpected diagnostics: {found:#?}");
}

#[track_caller]
pub fn assert_reports(result: &AnalysisResult, predicate: impl Fn(&DiagnosticKind) -> bool) {
    let found = kinds(result);
    assert!(found.iter().any(predicate), "expected diagnostic not reported; got {found:#?}");
}
