#![forbid(unsafe_code)]

//! Lowering of analyzed code into the backend IR.
//!
//! Only fully analyzed nodes are lowered. Reference counting is explicit in
//! the output: every owned temporary is consumed exactly once on every path,
//! which `ember_ir::verify_reference_counts` can check.

mod body;

use std::sync::Arc;

use ember_ast::ModifierKind;
use ember_ir::{
    IrClass, IrClassMemberVariable, IrCodeChunk, IrFunction, IrGlobalVariable, IrImplicitEvaluation,
    IrInterface, IrPackage, IrType, IrVariableDeclaration,
};

use crate::binder::{BoundClass, BoundFunction, BoundGlobalVariable, BoundInterface, BoundModule};
use crate::types::BoundType;

use body::Lowerer;

pub(crate) fn ir_type(ty: &BoundType) -> IrType {
    match ty {
        BoundType::Root {
            base, arguments, ..
        } => IrType::Simple {
            base: base.canonical_name.clone(),
            arguments: arguments.iter().map(|a| ir_type(&a.ty)).collect(),
            nullable: false,
            reference_counted: base.is_reference_counted(),
        },
        BoundType::Nullable(inner) => match ir_type(inner) {
            IrType::Simple {
                base,
                arguments,
                reference_counted,
                ..
            } => IrType::Simple {
                base,
                arguments,
                nullable: true,
                reference_counted,
            },
            IrType::Generic {
                name,
                effective_bound,
                ..
            } => IrType::Generic {
                name,
                effective_bound,
                nullable: true,
            },
        },
        BoundType::Generic { parameter, .. } | BoundType::Variable { parameter, .. } => IrType::Generic {
            name: parameter.name.clone(),
            effective_bound: Box::new(ir_type(&parameter.bound().effective_upper_bound())),
            nullable: false,
        },
        BoundType::Argument { ty, .. } => ir_type(ty),
        BoundType::Unresolved { standin, .. } => ir_type(standin),
    }
}

fn parameter_declarations(function: &BoundFunction) -> Vec<Arc<IrVariableDeclaration>> {
    function
        .parameters
        .iter()
        .zip(function.parameter_types())
        .map(|(parameter, ty)| {
            Arc::new(IrVariableDeclaration {
                name: parameter.name.clone(),
                ty: ir_type(&ty),
            })
        })
        .collect()
}

pub(crate) fn lower_function(function: &BoundFunction) -> IrFunction {
    if !function.is_analyzed() {
        ice!("{} lowered before analysis completed", function.canonical_name);
    }
    let parameters = parameter_declarations(function);
    let (return_type, _) = function.return_type();
    let body = function
        .body
        .as_ref()
        .map(|_| Lowerer::new(function.context()).function_body(function, &parameters));
    tracing::debug!(function = %function.canonical_name, "lowered function");
    IrFunction {
        canonical_name: function.canonical_name.clone(),
        symbol: function.symbol(),
        parameters,
        return_type: ir_type(&return_type),
        is_external_c: function.modifiers().iter().any(|m| {
            matches!(&m.kind, ModifierKind::External { ffi } if ffi == "C")
        }),
        is_nothrow: function.is_nothrow(),
        body,
    }
}

pub(crate) fn lower_class(class: &BoundClass) -> IrClass {
    let base = &class.base_type;
    IrClass {
        canonical_name: base.canonical_name.clone(),
        type_parameters: base.type_parameters.iter().map(|p| p.name.clone()).collect(),
        supertypes: supertype_names(base.supertypes()),
        member_variables: class
            .members
            .iter()
            .map(|m| IrClassMemberVariable {
                name: m.name.clone(),
                ty: ir_type(&m.ty(class.context())),
            })
            .collect(),
        member_functions: class.member_functions.iter().map(|f| f.to_backend_ir()).collect(),
        constructor: class.constructor.to_backend_ir(),
        destructor: class.destructor.to_backend_ir(),
    }
}

pub(crate) fn lower_interface(interface: &BoundInterface) -> IrInterface {
    let base = &interface.base_type;
    IrInterface {
        canonical_name: base.canonical_name.clone(),
        type_parameters: base.type_parameters.iter().map(|p| p.name.clone()).collect(),
        supertypes: supertype_names(base.supertypes()),
        member_functions: interface.functions.iter().map(|f| f.to_backend_ir()).collect(),
    }
}

fn supertype_names(supertypes: &[BoundType]) -> Vec<String> {
    supertypes
        .iter()
        .filter_map(BoundType::base)
        .map(|b| b.canonical_name.clone())
        .collect()
}

pub(crate) fn lower_global(global: &BoundGlobalVariable) -> IrGlobalVariable {
    let variable = &global.variable;
    let ty = variable.ty().map(ir_type).unwrap_or_else(|| IrType::value("<unresolved>"));
    let declaration = Arc::new(IrVariableDeclaration {
        name: variable.canonical_name(),
        ty,
    });
    let initializer = match &global.initializer {
        Some(initializer) => Lowerer::new(initializer.context()).global_initializer(initializer),
        None => IrImplicitEvaluation {
            code: IrCodeChunk::default(),
            result: None,
        },
    };
    IrGlobalVariable {
        declaration,
        initializer,
    }
}

pub(crate) fn lower_package(module: &BoundModule) -> IrPackage {
    if !module.is_analyzed() {
        ice!("package {} lowered before analysis completed", module.package);
    }
    let package = IrPackage {
        name: module.package.to_string(),
        functions: module.functions.iter().map(|f| f.to_backend_ir()).collect(),
        classes: module.classes.iter().map(|c| c.to_backend_ir()).collect(),
        interfaces: module.interfaces.iter().map(|i| i.to_backend_ir()).collect(),
        variables: module.globals.iter().map(|g| g.to_backend_ir()).collect(),
    };
    tracing::debug!(
        package = %package.name,
        functions = package.functions.len(),
        classes = package.classes.len(),
        "lowered package"
    );
    package
}
