#![forbid(unsafe_code)]

//! The `emerge.core` package: intrinsic value types, `Any`/`Nothing`,
//! `Throwable`, `Weak<T>` and the operator functions on the intrinsics.

use std::rc::Rc;

use ember_ast::{
    ClassDecl, ClassMember, Declaration, FunctionDecl, Ident, InterfaceDecl, MemberInitializer,
    MemberVariableDecl, Modifier, ModifierKind, Module, PackageName, ParameterDecl, SourceFile,
    Span, Spanned, TypeMutability, TypeParameterDecl, TypeRef, Variance,
};

use crate::binder::{BoundFunction, BoundModule};
use crate::context::Context;
use crate::types::{BaseType, BaseTypeKind, BoundType, IntegerKind, Mutability, ValueKind};

pub const CORE_PACKAGE: &str = "emerge.core";

const INTEGER_TYPES: [(&str, u32, bool); 8] = [
    ("S8", 8, true),
    ("S16", 16, true),
    ("S32", 32, true),
    ("S64", 64, true),
    ("U8", 8, false),
    ("U16", 16, false),
    ("U32", 32, false),
    ("U64", 64, false),
];

const ARITHMETIC_OPERATORS: [&str; 5] = ["plus", "minus", "times", "div", "rem"];

const COMPARISON_OPERATORS: [&str; 5] = [
    "equals",
    "lessThan",
    "greaterThan",
    "lessThanOrEqual",
    "greaterThanOrEqual",
];

/// Handles on the core package's types, resolved once after it is bound.
pub struct CoreTypes {
    pub any: Rc<BaseType>,
    pub nothing: Rc<BaseType>,
    pub unit: Rc<BaseType>,
    pub bool: Rc<BaseType>,
    pub string: Rc<BaseType>,
    pub integers: Vec<Rc<BaseType>>,
    pub throwable: Rc<BaseType>,
    pub weak: Rc<BaseType>,
    pub fill_stack_trace: Rc<BoundFunction>,
}

impl CoreTypes {
    fn from_package(package: &Rc<Context>) -> Self {
        let base = |name: &str| match package.resolve_base_type(name, true) {
            Some(b) => b,
            None => ice!("core package lacks type {name}"),
        };
        let fill_stack_trace = match package
            .functions()
            .into_iter()
            .find(|f| f.name == "fillStackTrace")
        {
            Some(f) => f,
            None => ice!("core package lacks fillStackTrace"),
        };
        Self {
            any: base("Any"),
            nothing: base("Nothing"),
            unit: base("Unit"),
            bool: base("Bool"),
            string: base("String"),
            integers: INTEGER_TYPES.iter().map(|(name, _, _)| base(name)).collect(),
            throwable: base("Throwable"),
            weak: base("Weak"),
            fill_stack_trace,
        }
    }

    /// The default type of an integer literal.
    pub fn int(&self) -> &Rc<BaseType> {
        &self.integers[2]
    }

    pub fn int_type(&self) -> BoundType {
        BoundType::simple(self.int(), Mutability::Immutable)
    }

    pub fn long_type(&self) -> BoundType {
        BoundType::simple(&self.integers[3], Mutability::Immutable)
    }

    pub fn bool_type(&self) -> BoundType {
        BoundType::simple(&self.bool, Mutability::Immutable)
    }

    pub fn unit_type(&self) -> BoundType {
        BoundType::simple(&self.unit, Mutability::Immutable)
    }

    pub fn nothing_type(&self) -> BoundType {
        BoundType::simple(&self.nothing, Mutability::Immutable)
    }

    pub fn string_type(&self) -> BoundType {
        BoundType::simple(&self.string, Mutability::Immutable)
    }

    /// `readonly Any?`: accepts every value.
    pub fn any_nullable(&self) -> BoundType {
        BoundType::simple(&self.any, Mutability::ReadOnly).nullable()
    }

    pub fn throwable_type(&self) -> BoundType {
        BoundType::simple(&self.throwable, Mutability::ReadOnly)
    }

    pub fn is_weak(&self, base: &BaseType) -> bool {
        base.same_as(&self.weak)
    }
}

fn nowhere() -> Span {
    ember_ast::span(0, 0)
}

fn ident(name: &str) -> Ident {
    Spanned::new(nowhere(), name.to_string())
}

fn type_ref(name: &str) -> TypeRef {
    TypeRef {
        span: nowhere(),
        mutability: None,
        name: ident(name),
        arguments: Vec::new(),
        nullable: false,
    }
}

fn modifiers(kinds: &[ModifierKind]) -> Vec<Modifier> {
    kinds
        .iter()
        .map(|kind| Modifier {
            span: nowhere(),
            kind: kind.clone(),
        })
        .collect()
}

fn parameter(name: &str, ty: Option<TypeRef>) -> ParameterDecl {
    ParameterDecl {
        span: nowhere(),
        name: ident(name),
        ownership: None,
        declared_type: ty,
        default_value: None,
        reassignable: false,
    }
}

fn intrinsic_function(
    name: &str,
    extra: &[ModifierKind],
    parameters: Vec<ParameterDecl>,
    return_type: TypeRef,
) -> FunctionDecl {
    let mut kinds = vec![ModifierKind::Intrinsic, ModifierKind::Nothrow];
    kinds.extend_from_slice(extra);
    FunctionDecl {
        span: nowhere(),
        name: ident(name),
        modifiers: modifiers(&kinds),
        type_parameters: Vec::new(),
        parameters,
        return_type: Some(return_type),
        body: None,
    }
}

fn operator(name: &str, operand: &str, arity: usize, result: &str) -> Declaration {
    let mut parameters = vec![parameter("self", Some(type_ref(operand)))];
    if arity == 2 {
        parameters.push(parameter("other", Some(type_ref(operand))));
    }
    Declaration::Function(intrinsic_function(
        name,
        &[ModifierKind::Operator, ModifierKind::Pure],
        parameters,
        type_ref(result),
    ))
}

/// Base types without a declaration in source form.
fn intrinsic_base_types() -> Vec<Rc<BaseType>> {
    let package = PackageName::parse(CORE_PACKAGE);
    let make = |name: &str, kind: BaseTypeKind, value: Option<ValueKind>, top: bool| {
        Rc::new(BaseType::new(
            package.child(name),
            name.to_string(),
            kind,
            nowhere(),
            Vec::new(),
            value,
            top,
        ))
    };

    let mut types = vec![
        make("Any", BaseTypeKind::Interface, None, true),
        make("Nothing", BaseTypeKind::Class, Some(ValueKind::Nothing), false),
        make("Unit", BaseTypeKind::Class, Some(ValueKind::Unit), false),
        make("Bool", BaseTypeKind::Class, Some(ValueKind::Bool), false),
        make("String", BaseTypeKind::Class, None, false),
    ];
    for (name, bits, signed) in INTEGER_TYPES {
        types.push(make(
            name,
            BaseTypeKind::Class,
            Some(ValueKind::Integer(IntegerKind { bits, signed })),
            false,
        ));
    }
    types
}

/// Source form of the declarations of the core package.
fn core_module() -> Module {
    let mut declarations = Vec::new();

    declarations.push(Declaration::Interface(InterfaceDecl {
        span: nowhere(),
        name: ident("Throwable"),
        type_parameters: Vec::new(),
        supertypes: Vec::new(),
        functions: Vec::new(),
    }));
    let mut throwable = type_ref("Throwable");
    throwable.mutability = Some(TypeMutability::Mutable);
    declarations.push(Declaration::Function(intrinsic_function(
        "fillStackTrace",
        &[],
        vec![parameter("self", Some(throwable))],
        type_ref("Unit"),
    )));

    let mut bound = type_ref("Any");
    bound.mutability = Some(TypeMutability::ReadOnly);
    let mut referred = type_ref("T");
    referred.nullable = true;
    declarations.push(Declaration::Class(ClassDecl {
        span: nowhere(),
        name: ident("Weak"),
        type_parameters: vec![TypeParameterDecl {
            span: nowhere(),
            name: ident("T"),
            variance: Variance::Unspecified,
            bound: Some(bound),
        }],
        supertypes: Vec::new(),
        members: vec![
            ClassMember::Variable(MemberVariableDecl {
                span: nowhere(),
                name: ident("referred"),
                declared_type: type_ref("T"),
                reassignable: false,
                initializer: MemberInitializer::ConstructorParameter,
            }),
            ClassMember::Function(intrinsic_function(
                "get",
                &[ModifierKind::ReadOnly],
                vec![parameter("self", None)],
                referred,
            )),
        ],
    }));

    for (name, _, signed) in INTEGER_TYPES {
        for op in ARITHMETIC_OPERATORS {
            declarations.push(operator(op, name, 2, name));
        }
        for op in COMPARISON_OPERATORS {
            declarations.push(operator(op, name, 2, "Bool"));
        }
        if signed {
            declarations.push(operator("negate", name, 1, name));
        }
    }
    declarations.push(operator("not", "Bool", 1, "Bool"));
    for op in ["equals", "and", "or"] {
        declarations.push(operator(op, "Bool", 2, "Bool"));
    }

    Module {
        package: PackageName::parse(CORE_PACKAGE),
        files: vec![SourceFile {
            name: "core.em".to_string(),
            imports: Vec::new(),
            declarations,
        }],
    }
}

/// Binds the core package into `software` and publishes its [`CoreTypes`].
pub(crate) fn bind_core_package(software: &Rc<Context>) -> Rc<BoundModule> {
    let module = BoundModule::new(software, &core_module());
    let package = module.context();
    for base in intrinsic_base_types() {
        package.add_base_type(base);
    }
    let s32 = package.resolve_base_type("S32", true);
    let s64 = package.resolve_base_type("S64", true);
    if let (Some(s32), Some(s64)) = (s32, s64) {
        package.add_type_alias("Int", s32);
        package.add_type_alias("Long", s64);
    }
    software.set_core_types(Rc::new(CoreTypes::from_package(package)));
    module
}
