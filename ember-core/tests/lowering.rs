mod common;

use common::*;
use ember_ast::{BinaryOp, Declaration, MemberInitializer, VariableOwnership};
use ember_core::{BackendIrError, CORE_PACKAGE, SemaConfig};
use ember_ir::{IrExpression, IrStatement, verify_reference_counts};

fn person() -> Declaration {
    class("Person")
        .member("name", ty("String"), false, MemberInitializer::ConstructorParameter)
        .member("nickname", nullable(ty("String")), true, MemberInitializer::Expression(null()))
        .build()
}

fn boom() -> Declaration {
    class("Boom").implements(ty("Throwable")).build()
}

/// Lowers a program that must be free of errors and returns the dump of
/// package `app`.
#[track_caller]
fn lower(declarations: Vec<Declaration>) -> String {
    let result = analyze(declarations);
    assert_clean(&result);
    let ir = match result.to_backend_ir() {
        Ok(ir) => ir,
        Err(error) => panic!("{error}: {error:?}"),
    };
    ir.package("app").expect("package app is lowered").to_string()
}

#[test]
fn core_package_is_part_of_the_output() {
    let result = analyze(Vec::new());
    let ir = result.to_backend_ir().expect("clean program lowers");
    let core = ir.package(CORE_PACKAGE).expect("core package is lowered");
    let dump = core.to_string();
    assert!(dump.contains("class emerge.core.Weak"), "{dump}");
    assert!(dump.contains("register weak"), "{dump}");
    assert!(dump.contains("unregister weak"), "{dump}");
}

#[test]
fn strings_returned_from_locals() {
    let dump = lower(vec![Declaration::Function(fun("greet").returns(ty("String")).body(vec![
        val("greeting", None, Some(string("hello"))),
        ret(Some(var("greeting"))),
    ]))]);
    assert!(dump.contains("fun app.greet() -> "), "{dump}");
    assert!(dump.contains("\"hello\""), "{dump}");
}

#[test]
fn objects_are_allocated_and_torn_down() {
    let dump = lower(vec![
        person(),
        Declaration::Function(fun("nameOf").returns(ty("String")).body(vec![
            val("p", None, Some(call("Person", vec![string("ada")]))),
            ret(Some(member(var("p"), "name"))),
        ])),
    ]);
    assert!(dump.contains("allocate app.Person"), "{dump}");
    assert!(dump.contains("deallocate"), "{dump}");
    assert!(dump.contains("member name: "), "{dump}");
}

#[test]
fn member_of_a_temporary_outlives_it() {
    lower(vec![
        person(),
        Declaration::Function(
            fun("fresh")
                .returns(ty("String"))
                .expression_body(member(call("Person", vec![string("bo")]), "name")),
        ),
    ]);
}

#[test]
fn reassigned_storage_releases_the_old_value() {
    let dump = lower(vec![
        Declaration::Function(fun("rename").body(vec![
            var_decl("s", None, Some(string("a"))),
            assign("s", string("b")),
            assign("s", string("c")),
        ])),
    ]);
    assert!(dump.contains("var s: "), "{dump}");
}

#[test]
fn null_safe_access_and_assertion() {
    lower(vec![
        person(),
        Declaration::Function(
            fun("maybeName")
                .param("p", nullable(ty("Person")))
                .returns(nullable(ty("String")))
                .expression_body(safe_member(var("p"), "name")),
        ),
        Declaration::Function(
            fun("surelyName")
                .param("p", nullable(ty("Person")))
                .returns(ty("String"))
                .expression_body(member(not_null(var("p")), "name")),
        ),
    ]);
}

#[test]
fn loops_release_their_locals_on_every_exit() {
    let dump = lower(vec![Declaration::Function(
        fun("count").param("limit", ty("S32")).returns(ty("S32")).body(vec![
            var_decl("i", None, Some(int(0))),
            while_loop(
                binary(var("i"), BinaryOp::Less, var("limit")),
                vec![
                    val("label", None, Some(string("step"))),
                    stmt(if_else(binary(var("i"), BinaryOp::Equals, int(5)), vec![brk()], None)),
                    assign("i", binary(var("i"), BinaryOp::Plus, int(1))),
                ],
            ),
            ret(Some(var("i"))),
        ]),
    )]);
    assert!(dump.contains("loop#"), "{dump}");
    assert!(dump.contains("break loop#"), "{dump}");
}

#[test]
fn exceptions_are_caught_and_cleaned_up() {
    let dump = lower(vec![
        boom(),
        Declaration::Function(fun("attempt").returns(ty("S32")).body(vec![
            val("keep", None, Some(string("held"))),
            val(
                "r",
                Some(ty("S32")),
                Some(try_catch(vec![throw(call("Boom", Vec::new()))], "e", vec![stmt(int(1))])),
            ),
            ret(Some(var("r"))),
        ])),
    ]);
    assert!(dump.contains("try#"), "{dump}");
    assert!(dump.contains("-> catch#"), "{dump}");
    assert!(dump.contains("on exception (catch#"), "{dump}");
}

#[test]
fn uncaught_exceptions_propagate() {
    let dump = lower(vec![
        boom(),
        Declaration::Function(fun("fail").param("s", ty("String")).body(vec![
            val("local", None, Some(string("x"))),
            throw(call("Boom", Vec::new())),
        ])),
    ]);
    assert!(dump.contains("on exception (propagate)"), "{dump}");
    assert!(dump.contains("on exception (swallow)"), "{dump}");
}

#[test]
fn global_initializers_are_lowered() {
    let dump = lower(vec![global("motto", false, None, Some(string("onwards")))]);
    assert!(dump.contains("global app.motto"), "{dump}");
}

#[test]
fn captured_parameters_are_retained_only_when_stored() {
    let program = vec![
        global("kept", true, Some(nullable(ty("String"))), Some(null())),
        Declaration::Function(
            fun("keep")
                .param_with("s", ty("String"), Some(VariableOwnership::Captured), false)
                .body(vec![assign("kept", var("s"))]),
        ),
        Declaration::Function(fun("look").param("s", ty("String")).body(Vec::new())),
        Declaration::Function(fun("store").body(vec![
            stmt(call("keep", vec![string("x")])),
            stmt(call("look", vec![string("y")])),
        ])),
    ];
    let result = analyze(program);
    assert_clean(&result);
    let ir = result.to_backend_ir().expect("clean program lowers");
    assert!(verify_reference_counts(ir).is_empty());
    let keep = ir.find_function("app.keep").expect("keep is lowered").to_string();
    assert!(keep.contains("refcount++"), "{keep}");
    let look = ir.find_function("app.look").expect("look is lowered").to_string();
    assert!(!look.contains("refcount"), "{look}");
}

#[test]
fn errors_block_backend_lowering() {
    let result = analyze(vec![Declaration::Function(fun("f").returns(ty("S32")).body(Vec::new()))]);
    assert!(matches!(
        result.to_backend_ir(),
        Err(BackendIrError::ProgramHasErrors { count: 1 })
    ));
    let ir = result.to_backend_ir_for_tooling();
    assert!(ir.package("app").is_some());
}

#[test]
fn lowering_is_cached() {
    let result = analyze(vec![Declaration::Function(fun("f").body(Vec::new()))]);
    let first = result.to_backend_ir().expect("clean program lowers");
    let second = result.to_backend_ir().expect("clean program lowers");
    assert!(std::ptr::eq(first, second));
}

#[test]
fn single_assignment_vars_become_temporaries() {
    let program = || {
        vec![Declaration::Function(fun("f").returns(ty("String")).body(vec![
            var_decl("s", None, Some(string("once"))),
            ret(Some(var("s"))),
        ]))]
    };
    let demoted = analyze(program());
    let body = demoted.to_backend_ir().expect("clean program lowers").find_function("app.f").expect("f is lowered").to_string();
    assert!(!body.contains("var s"), "{body}");

    let config = SemaConfig {
        demote_single_assignment_variables: false,
        ..SemaConfig::default()
    };
    let kept = analyze_with(config, program());
    let ir = kept.to_backend_ir().expect("clean program lowers");
    assert!(verify_reference_counts(ir).is_empty());
    let function = ir.find_function("app.f").expect("f is lowered");
    let declares = function.body.iter().flat_map(|b| &b.statements).any(|s| {
        matches!(s, IrStatement::VariableDeclaration(d) if d.name == "s")
    });
    assert!(declares);
}

#[test]
fn constructors_allocate_and_return_the_object() {
    let result = analyze(vec![person()]);
    let ir = result.to_backend_ir().expect("clean program lowers");
    let class = &ir.package("app").expect("package app is lowered").classes[0];
    let body = class.constructor.body.as_ref().expect("constructor has a body");
    let allocated = body.statements.iter().find_map(|s| match s {
        IrStatement::CreateTemporaryValue(t) if matches!(t.declaration().value, IrExpression::AllocateObject { .. }) => {
            Some(t.clone())
        }
        _ => None,
    });
    let allocated = allocated.expect("constructor allocates");
    assert!(matches!(
        body.statements.last(),
        Some(IrStatement::Return(r)) if r.value.as_ref().is_some_and(|v| v.refers_to(&allocated))
    ));
    assert_eq!(class.member_variables.len(), 2);
}
