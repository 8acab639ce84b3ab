#![forbid(unsafe_code)]

use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TemporaryId(pub u32);

/// Per-function source of fresh temporary ids and loop/try labels.
#[derive(Clone, Debug, Default)]
pub struct IdGen {
    next_temporary: u32,
    next_label: u32,
}

impl IdGen {
    pub fn fresh_temporary(&mut self) -> TemporaryId {
        let id = TemporaryId(self.next_temporary);
        self.next_temporary += 1;
        id
    }

    pub fn fresh_loop(&mut self) -> Arc<IrLoopIdentity> {
        let label = self.fresh_label();
        Arc::new(IrLoopIdentity { label })
    }

    pub fn fresh_try(&mut self) -> Arc<IrTryIdentity> {
        let label = self.fresh_label();
        Arc::new(IrTryIdentity { label })
    }

    fn fresh_label(&mut self) -> u32 {
        let label = self.next_label;
        self.next_label += 1;
        label
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IrType {
    /// Nominal type, possibly with fully lowered type arguments.
    Simple {
        base: String,
        arguments: Vec<IrType>,
        nullable: bool,
        /// `false` for intrinsic value types (integers, `Bool`, `Unit`).
        reference_counted: bool,
    },
    Generic {
        name: String,
        effective_bound: Box<IrType>,
        nullable: bool,
    },
}

impl IrType {
    pub fn value(base: &str) -> Self {
        IrType::Simple {
            base: base.to_string(),
            arguments: Vec::new(),
            nullable: false,
            reference_counted: false,
        }
    }

    pub fn is_reference_counted(&self) -> bool {
        match self {
            IrType::Simple {
                reference_counted, ..
            } => *reference_counted,
            // Generic values are always boxed.
            IrType::Generic { .. } => true,
        }
    }

    pub fn is_nullable(&self) -> bool {
        match self {
            IrType::Simple { nullable, .. } | IrType::Generic { nullable, .. } => *nullable,
        }
    }
}

#[derive(Debug)]
pub struct IrCreateTemporaryValue {
    pub id: TemporaryId,
    pub value: IrExpression,
    pub ty: IrType,
    /// The value already carries one strong reference that belongs to this temporary.
    pub counted_at_creation: bool,
}

/// The only way to refer to a computed value after it was created.
#[derive(Clone, Debug)]
pub struct IrTemporaryValueReference(pub Arc<IrCreateTemporaryValue>);

impl IrTemporaryValueReference {
    pub fn new(declaration: IrCreateTemporaryValue) -> Self {
        Self(Arc::new(declaration))
    }

    pub fn id(&self) -> TemporaryId {
        self.0.id
    }

    pub fn ty(&self) -> &IrType {
        &self.0.ty
    }

    pub fn declaration(&self) -> &IrCreateTemporaryValue {
        &self.0
    }

    pub fn refers_to(&self, other: &IrTemporaryValueReference) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Debug)]
pub struct IrVariableDeclaration {
    pub name: String,
    pub ty: IrType,
}

/// Compared by pointer identity; nested loops get distinct identities.
#[derive(Debug)]
pub struct IrLoopIdentity {
    pub label: u32,
}

#[derive(Debug)]
pub struct IrTryIdentity {
    pub label: u32,
}

#[derive(Debug)]
pub enum IrExpression {
    IntegerLiteral(i128),
    BooleanLiteral(bool),
    StringLiteral(String),
    NullLiteral,
    TemporaryValueReference(IrTemporaryValueReference),
    VariableAccess(Arc<IrVariableDeclaration>),
    ClassMemberVariableAccess {
        base: IrTemporaryValueReference,
        member: String,
    },
    StaticDispatchInvocation {
        function: String,
        arguments: Vec<IrTemporaryValueReference>,
        landing_pad: Option<IrInvocationLandingPad>,
    },
    DynamicDispatchInvocation {
        interface: String,
        function: String,
        arguments: Vec<IrTemporaryValueReference>,
        landing_pad: Option<IrInvocationLandingPad>,
    },
    AllocateObject {
        class: String,
    },
    IsNull(IrTemporaryValueReference),
    NotNullAssertion(IrTemporaryValueReference),
    IfExpression {
        condition: IrTemporaryValueReference,
        then_branch: IrImplicitEvaluation,
        else_branch: IrImplicitEvaluation,
    },
    TryCatchExpression {
        identity: Arc<IrTryIdentity>,
        body: IrImplicitEvaluation,
        catch_variable: Arc<IrVariableDeclaration>,
        catch_branch: IrImplicitEvaluation,
    },
}

impl IrExpression {
    /// Reads a storage location without taking a reference of its own.
    pub fn is_storage_view(&self) -> bool {
        matches!(
            self,
            IrExpression::VariableAccess(_) | IrExpression::ClassMemberVariableAccess { .. }
        )
    }

    pub fn landing_pad(&self) -> Option<&IrInvocationLandingPad> {
        match self {
            IrExpression::StaticDispatchInvocation { landing_pad, .. }
            | IrExpression::DynamicDispatchInvocation { landing_pad, .. } => landing_pad.as_ref(),
            _ => None,
        }
    }
}

/// Code whose last step yields a value. `result` is `None` when the code
/// never completes normally (it returns, throws, breaks or continues) or
/// evaluates to `Unit`.
#[derive(Debug)]
pub struct IrImplicitEvaluation {
    pub code: IrCodeChunk,
    pub result: Option<IrTemporaryValueReference>,
}

#[derive(Debug)]
pub struct IrInvocationLandingPad {
    pub cleanup: IrCodeChunk,
    pub action: IrLandingPadAction,
}

#[derive(Debug)]
pub enum IrLandingPadAction {
    /// Leave the function with the in-flight exception.
    Propagate,
    /// Continue in the catch branch of the given try.
    JumpToCatch(Arc<IrTryIdentity>),
    /// Discard the exception and continue after the invocation.
    Swallow,
}

#[derive(Debug, Default)]
pub struct IrCodeChunk {
    pub statements: Vec<IrStatement>,
}

impl IrCodeChunk {
    pub fn new(statements: Vec<IrStatement>) -> Self {
        Self { statements }
    }
}

#[derive(Debug)]
pub enum IrStatement {
    CreateTemporaryValue(IrTemporaryValueReference),
    CreateStrongReference(IrTemporaryValueReference),
    DropStrongReference(IrTemporaryValueReference),
    VariableDeclaration(Arc<IrVariableDeclaration>),
    Assignment(IrAssignmentStatement),
    ConditionalBranch(IrConditionalBranch),
    Return(IrReturnStatement),
    Throw(IrThrowStatement),
    While(IrWhileLoop),
    Break(IrBreakStatement),
    Continue(IrContinueStatement),
    DeallocateObject(IrTemporaryValueReference),
    RegisterWeakReference(IrRegisterWeakReferenceStatement),
    UnregisterWeakReference(IrUnregisterWeakReferenceStatement),
}

#[derive(Debug)]
pub struct IrAssignmentStatement {
    pub target: IrAssignmentTarget,
    /// The stored value; the storage takes over one strong reference.
    pub value: IrTemporaryValueReference,
}

#[derive(Debug)]
pub enum IrAssignmentTarget {
    Variable(Arc<IrVariableDeclaration>),
    ClassMember {
        object: IrTemporaryValueReference,
        member: String,
    },
}

#[derive(Debug)]
pub struct IrConditionalBranch {
    pub condition: IrTemporaryValueReference,
    pub then_branch: IrCodeChunk,
    pub else_branch: Option<IrCodeChunk>,
}

#[derive(Debug)]
pub struct IrReturnStatement {
    pub value: Option<IrTemporaryValueReference>,
}

#[derive(Debug)]
pub struct IrThrowStatement {
    pub value: IrTemporaryValueReference,
    /// Set when the throw is caught within the same function.
    pub catch_target: Option<Arc<IrTryIdentity>>,
}

#[derive(Debug)]
pub struct IrWhileLoop {
    pub identity: Arc<IrLoopIdentity>,
    pub body: IrCodeChunk,
}

#[derive(Debug)]
pub struct IrBreakStatement {
    pub from: Arc<IrLoopIdentity>,
}

#[derive(Debug)]
pub struct IrContinueStatement {
    pub loop_: Arc<IrLoopIdentity>,
}

#[derive(Debug)]
pub struct IrRegisterWeakReferenceStatement {
    pub weak_object: IrTemporaryValueReference,
    pub referred_object: IrTemporaryValueReference,
}

#[derive(Debug)]
pub struct IrUnregisterWeakReferenceStatement {
    pub weak_object: IrTemporaryValueReference,
    pub referred_object: IrTemporaryValueReference,
}

#[derive(Debug)]
pub struct IrFunction {
    pub canonical_name: String,
    /// Unique among overloads; invocations refer to this.
    pub symbol: String,
    pub parameters: Vec<Arc<IrVariableDeclaration>>,
    pub return_type: IrType,
    pub is_external_c: bool,
    pub is_nothrow: bool,
    /// `None` for declared-only (external, intrinsic, abstract) functions.
    pub body: Option<IrCodeChunk>,
}

#[derive(Debug)]
pub struct IrClassMemberVariable {
    pub name: String,
    pub ty: IrType,
}

#[derive(Debug)]
pub struct IrClass {
    pub canonical_name: String,
    pub type_parameters: Vec<String>,
    pub supertypes: Vec<String>,
    pub member_variables: Vec<IrClassMemberVariable>,
    pub member_functions: Vec<Arc<IrFunction>>,
    pub constructor: Arc<IrFunction>,
    pub destructor: Arc<IrFunction>,
}

#[derive(Debug)]
pub struct IrInterface {
    pub canonical_name: String,
    pub type_parameters: Vec<String>,
    pub supertypes: Vec<String>,
    pub member_functions: Vec<Arc<IrFunction>>,
}

#[derive(Debug)]
pub struct IrGlobalVariable {
    pub declaration: Arc<IrVariableDeclaration>,
    pub initializer: IrImplicitEvaluation,
}

#[derive(Debug)]
pub struct IrPackage {
    pub name: String,
    pub functions: Vec<Arc<IrFunction>>,
    pub classes: Vec<Arc<IrClass>>,
    pub interfaces: Vec<Arc<IrInterface>>,
    pub variables: Vec<Arc<IrGlobalVariable>>,
}

impl IrPackage {
    /// Free functions plus every member function, constructor and destructor.
    pub fn all_functions(&self) -> Vec<&Arc<IrFunction>> {
        let mut all: Vec<&Arc<IrFunction>> = self.functions.iter().collect();
        for class in &self.classes {
            all.extend(class.member_functions.iter());
            all.push(&class.constructor);
            all.push(&class.destructor);
        }
        for interface in &self.interfaces {
            all.extend(interface.member_functions.iter());
        }
        all
    }
}

#[derive(Debug, Default)]
pub struct IrSoftwareContext {
    pub packages: Vec<Arc<IrPackage>>,
}

impl IrSoftwareContext {
    pub fn package(&self, name: &str) -> Option<&Arc<IrPackage>> {
        self.packages.iter().find(|p| p.name == name)
    }

    pub fn find_function(&self, symbol_or_name: &str) -> Option<&Arc<IrFunction>> {
        self.packages.iter().find_map(|p| {
            p.all_functions()
                .into_iter()
                .find(|f| f.symbol == symbol_or_name || f.canonical_name == symbol_or_name)
        })
    }
}
