mod common;

use common::*;
use ember_ast::{BinaryOp, Declaration, MemberInitializer, ModifierKind, NumberBase, TypeMutability, VariableOwnership};
use ember_core::{CORE_PACKAGE, DiagnosticKind, SemaConfig};

fn boom() -> Declaration {
    class("Boom").implements(ty("Throwable")).build()
}

fn counter_class() -> Declaration {
    class("Counter")
        .member("count", ty("S32"), true, MemberInitializer::ConstructorParameter)
        .build()
}

#[test]
fn core_package_alone_is_clean() {
    let result = analyze(Vec::new());
    assert_clean(&result);
    assert_eq!(result.modules()[0].package.to_string(), CORE_PACKAGE);
    assert!(result.modules().iter().all(|m| m.is_analyzed()));
}

#[test]
fn integer_literal_out_of_range() {
    let result = analyze(vec![Declaration::Function(
        fun("f").body(vec![val("x", Some(ty("S8")), Some(int(200)))]),
    )]);
    assert_reports(&result, |k| {
        matches!(k, DiagnosticKind::IntegerLiteralOutOfRange { value, .. } if value == "200")
    });
}

#[test]
fn negative_and_bit_pattern_literals_fit() {
    let result = analyze(vec![Declaration::Function(fun("f").body(vec![
        val("a", Some(ty("S8")), Some(negate(int(128)))),
        val("b", Some(ty("S8")), Some(int_in_base(0xFF, NumberBase::Hexadecimal))),
        val("c", Some(ty("U8")), Some(int(255))),
        val("d", Some(ty("Long")), Some(int(1 << 40))),
    ]))]);
    assert_clean(&result);
}

#[test]
fn mismatched_initializer_is_not_assignable() {
    let result = analyze(vec![Declaration::Function(
        fun("f").body(vec![val("flag", Some(ty("Bool")), Some(int(1)))]),
    )]);
    assert_reports(&result, |k| matches!(k, DiagnosticKind::NotAssignable { .. }));
}

#[test]
fn unknown_function() {
    let result = analyze(vec![Declaration::Function(
        fun("f").body(vec![stmt(call("missing", vec![int(1)]))]),
    )]);
    assert_reports(&result, |k| {
        matches!(k, DiagnosticKind::UnresolvableFunction { name, arity: 1 } if name == "missing")
    });
}

#[test]
fn overloads_are_selected_by_argument_type() {
    let result = analyze(vec![
        Declaration::Function(fun("pick").param("x", ty("S32")).returns(ty("S32")).expression_body(var("x"))),
        Declaration::Function(fun("pick").param("x", ty("Bool")).returns(ty("Bool")).expression_body(var("x"))),
        Declaration::Function(fun("use").returns(ty("Bool")).body(vec![
            val("n", Some(ty("S32")), Some(call("pick", vec![int(1)]))),
            ret(Some(call("pick", vec![boolean(true)]))),
        ])),
    ]);
    assert_clean(&result);
}

#[test]
fn overload_set_needs_a_disjoint_parameter() {
    let result = analyze(vec![
        Declaration::Function(fun("show").param("x", ty("Any")).body(Vec::new())),
        Declaration::Function(fun("show").param("x", ty("String")).body(Vec::new())),
    ]);
    assert_reports(&result, |k| {
        matches!(k, DiagnosticKind::OverloadSetNotDisjoint { name, arity: 1 } if name == "show")
    });
}

#[test]
fn member_overload_sets_need_a_disjoint_parameter() {
    let foo = || fun("foo").receiver().param("a", ty("S32"));
    let not_disjoint =
        |k: &DiagnosticKind| matches!(k, DiagnosticKind::OverloadSetNotDisjoint { name, arity: 2 } if name == "foo");

    let in_class = analyze(vec![class("C").function(foo().body(Vec::new())).function(foo().body(Vec::new())).build()]);
    assert_reports(&in_class, not_disjoint);

    let in_interface = analyze(vec![interface("Shape", vec![foo().abstract_(), foo().abstract_()])]);
    assert_reports(&in_interface, not_disjoint);
}

#[test]
fn misspelled_parameter_type_does_not_cascade() {
    let result = analyze(vec![
        Declaration::Function(fun("show").param("x", ty("Strng")).body(Vec::new())),
        Declaration::Function(fun("show").param("x", ty("S32")).body(Vec::new())),
    ]);
    let found = errors(&result);
    assert_eq!(found.len(), 1, "{found:#?}");
    assert!(matches!(&found[0], DiagnosticKind::UnresolvedType { .. }));
}

#[test]
fn operators_resolve_to_core_functions() {
    let result = analyze(vec![Declaration::Function(
        fun("twice")
            .param("x", ty("S32"))
            .returns(ty("Bool"))
            .expression_body(binary(binary(var("x"), BinaryOp::Plus, var("x")), BinaryOp::NotEquals, int(0))),
    )]);
    assert_clean(&result);
}

#[test]
fn val_cannot_be_reassigned() {
    let result = analyze(vec![Declaration::Function(fun("f").body(vec![
        val("x", None, Some(int(1))),
        assign("x", int(2)),
    ]))]);
    assert_reports(&result, |k| matches!(k, DiagnosticKind::ValReassignment { name } if name == "x"));
}

#[test]
fn reading_an_unassigned_variable() {
    let result = analyze(vec![Declaration::Function(fun("f").returns(ty("S32")).body(vec![
        var_decl("x", Some(ty("S32")), None),
        ret(Some(var("x"))),
    ]))]);
    assert_reports(&result, |k| matches!(k, DiagnosticKind::VariableNotInitialized { name } if name == "x"));
}

#[test]
fn variable_assigned_on_one_branch_only() {
    let result = analyze(vec![Declaration::Function(
        fun("f").param("c", ty("Bool")).returns(ty("S32")).body(vec![
            var_decl("x", Some(ty("S32")), None),
            stmt(if_else(var("c"), vec![assign("x", int(1))], None)),
            ret(Some(var("x"))),
        ]),
    )]);
    assert_reports(&result, |k| {
        matches!(k, DiagnosticKind::VariableMaybeNotInitialized { name } if name == "x")
    });
}

#[test]
fn variable_assigned_on_both_branches() {
    let result = analyze(vec![Declaration::Function(
        fun("f").param("c", ty("Bool")).returns(ty("S32")).body(vec![
            var_decl("x", Some(ty("S32")), None),
            stmt(if_else(var("c"), vec![assign("x", int(1))], Some(vec![assign("x", int(2))]))),
            ret(Some(var("x"))),
        ]),
    )]);
    assert_clean(&result);
}

#[test]
fn variable_assigned_inside_loop() {
    let result = analyze(vec![Declaration::Function(
        fun("f").param("c", ty("Bool")).returns(ty("S32")).body(vec![
            val("x", Some(ty("S32")), None),
            while_loop(var("c"), vec![assign("x", int(1)), brk()]),
            ret(Some(var("x"))),
        ]),
    )]);
    assert_eq!(
        errors(&result),
        vec![DiagnosticKind::VariableMaybeNotInitialized { name: "x".to_string() }]
    );
}

#[test]
fn variable_assigned_before_loop_stays_initialized() {
    let result = analyze(vec![Declaration::Function(
        fun("f").param("c", ty("Bool")).returns(ty("S32")).body(vec![
            var_decl("x", Some(ty("S32")), None),
            assign("x", int(0)),
            while_loop(var("c"), vec![assign("x", int(1)), brk()]),
            ret(Some(var("x"))),
        ]),
    )]);
    assert_clean(&result);
}

#[test]
fn missing_return_value() {
    let result = analyze(vec![Declaration::Function(fun("f").returns(ty("S32")).body(Vec::new()))]);
    assert_reports(&result, |k| matches!(k, DiagnosticKind::MissingReturn { function } if function == "f"));
}

#[test]
fn code_after_return_is_a_warning() {
    let program = || {
        vec![Declaration::Function(fun("f").returns(ty("S32")).body(vec![
            ret(Some(int(1))),
            val("late", None, Some(int(2))),
        ]))]
    };
    let result = analyze(program());
    assert_eq!(kinds(&result), vec![DiagnosticKind::UnreachableCode]);
    assert!(!result.has_errors());

    let strict = SemaConfig {
        deny_warnings: true,
        ..SemaConfig::default()
    };
    assert!(analyze_with(strict, program()).has_errors());
}

#[test]
fn pure_function_cannot_touch_globals() {
    let result = analyze(vec![
        global("counter", true, Some(ty("S32")), Some(int(0))),
        Declaration::Function(fun("bump").modifier(ModifierKind::Pure).body(vec![assign("counter", int(1))])),
        Declaration::Function(
            fun("peek")
                .modifier(ModifierKind::ReadOnly)
                .returns(ty("S32"))
                .expression_body(var("counter")),
        ),
    ]);
    let found = errors(&result);
    assert_eq!(found.len(), 1, "{found:#?}");
    assert!(matches!(
        &found[0],
        DiagnosticKind::PurityViolation { function, declared, .. } if function == "bump" && declared == "pure"
    ));
}

#[test]
fn nothrow_function_cannot_throw() {
    let result = analyze(vec![
        boom(),
        Declaration::Function(
            fun("risky")
                .modifier(ModifierKind::Nothrow)
                .body(vec![throw(call("Boom", Vec::new()))]),
        ),
    ]);
    assert_reports(&result, |k| matches!(k, DiagnosticKind::NothrowViolation { function, .. } if function == "risky"));
}

#[test]
fn caught_exceptions_keep_nothrow() {
    let result = analyze(vec![
        boom(),
        Declaration::Function(fun("safe").modifier(ModifierKind::Nothrow).body(vec![stmt(try_catch(
            vec![throw(call("Boom", Vec::new()))],
            "e",
            Vec::new(),
        ))])),
    ]);
    assert_clean(&result);
}

#[test]
fn borrowed_parameter_cannot_be_stored() {
    let result = analyze(vec![
        global("kept", true, Some(nullable(ty("String"))), Some(null())),
        Declaration::Function(fun("store").param("s", ty("String")).body(vec![assign("kept", var("s"))])),
    ]);
    assert_reports(&result, |k| matches!(k, DiagnosticKind::BorrowedValueCaptured { name } if name == "s"));
}

#[test]
fn captured_parameter_can_be_stored() {
    let result = analyze(vec![
        global("kept", true, Some(nullable(ty("String"))), Some(null())),
        Declaration::Function(
            fun("store")
                .param_with("s", ty("String"), Some(VariableOwnership::Captured), false)
                .body(vec![assign("kept", var("s"))]),
        ),
    ]);
    assert_clean(&result);
}

#[test]
fn member_left_uninitialized() {
    let result = analyze(vec![
        class("Point").member("x", ty("S32"), false, MemberInitializer::None).build(),
    ]);
    assert_reports(&result, |k| matches!(k, DiagnosticKind::MemberNotInitialized { member } if member == "x"));
}

#[test]
fn member_initialized_by_constructor() {
    let result = analyze(vec![
        class("Point")
            .member("x", ty("S32"), false, MemberInitializer::None)
            .constructor(vec![assign_member(var("self"), "x", int(1))])
            .build(),
    ]);
    assert_clean(&result);
}

#[test]
fn interface_functions_must_be_implemented() {
    let result = analyze(vec![
        interface("Shape", vec![fun("area").receiver().returns(ty("S32")).abstract_()]),
        class("Square").implements(ty("Shape")).build(),
    ]);
    assert_reports(&result, |k| {
        matches!(k, DiagnosticKind::AbstractFunctionNotImplemented { class, function }
            if class == "Square" && function == "area")
    });
}

#[test]
fn override_widening_the_first_parameter_without_receiver() {
    let result = analyze(vec![
        interface("Sink", vec![fun("take").param("s", ty("String")).abstract_()]),
        class("Keeper")
            .implements(ty("Sink"))
            .function(
                fun("take")
                    .param_with("s", ty("String"), Some(VariableOwnership::Captured), false)
                    .modifier(ModifierKind::Override)
                    .body(Vec::new()),
            )
            .build(),
    ]);
    assert_reports(&result, |k| {
        matches!(k, DiagnosticKind::OverrideWidensOwnership { function, parameter, .. }
            if function == "take" && parameter == "s")
    });
}

#[test]
fn override_widening_a_parameter_after_the_receiver() {
    let result = analyze(vec![
        interface("Sink", vec![fun("take").receiver().param("s", ty("String")).abstract_()]),
        class("Keeper")
            .implements(ty("Sink"))
            .function(
                fun("take")
                    .receiver()
                    .param_with("s", ty("String"), Some(VariableOwnership::Captured), false)
                    .modifier(ModifierKind::Override)
                    .body(Vec::new()),
            )
            .build(),
    ]);
    assert_reports(&result, |k| {
        matches!(k, DiagnosticKind::OverrideWidensOwnership { parameter, .. } if parameter == "s")
    });
    assert!(!errors(&result).iter().any(|k| {
        matches!(k, DiagnosticKind::OverrideWidensOwnership { parameter, .. } if parameter == "self")
    }));
}

#[test]
fn override_without_base() {
    let result = analyze(vec![
        class("Lonely")
            .function(fun("hello").receiver().modifier(ModifierKind::Override).body(Vec::new()))
            .build(),
    ]);
    assert_reports(&result, |k| matches!(k, DiagnosticKind::OverridesNothing { function } if function == "hello"));
}

#[test]
fn readonly_reference_cannot_mutate() {
    let result = analyze(vec![
        counter_class(),
        Declaration::Function(
            fun("reset")
                .param("c", with_mutability(ty("Counter"), TypeMutability::ReadOnly))
                .body(vec![assign_member(var("c"), "count", int(0))]),
        ),
    ]);
    assert_reports(&result, |k| {
        matches!(k, DiagnosticKind::MutationThroughReadOnly { member, .. } if member == "count")
    });
}

#[test]
fn exclusive_value_is_gone_after_handoff() {
    let exclusive = || with_mutability(ty("Counter"), TypeMutability::Exclusive);
    let result = analyze(vec![
        counter_class(),
        Declaration::Function(
            fun("consume")
                .param_with("c", exclusive(), Some(VariableOwnership::Exclusive), false)
                .body(Vec::new()),
        ),
        Declaration::Function(
            fun("f")
                .param_with("c", exclusive(), Some(VariableOwnership::Exclusive), false)
                .body(vec![
                    stmt(call("consume", vec![var("c")])),
                    stmt(member(var("c"), "count")),
                ]),
        ),
    ]);
    assert_reports(&result, |k| matches!(k, DiagnosticKind::UseAfterLifetimeEnded { name } if name == "c"));
}

#[test]
fn exclusive_ownership_alone_ends_the_lifetime() {
    let result = analyze(vec![
        counter_class(),
        Declaration::Function(
            fun("consume")
                .param_with("c", ty("Counter"), Some(VariableOwnership::Exclusive), false)
                .body(Vec::new()),
        ),
        Declaration::Function(fun("f").body(vec![
            val("c", None, Some(call("Counter", vec![int(1)]))),
            stmt(call("consume", vec![var("c")])),
            stmt(member(var("c"), "count")),
        ])),
    ]);
    assert_reports(&result, |k| matches!(k, DiagnosticKind::UseAfterLifetimeEnded { name } if name == "c"));
}

#[test]
fn exclusive_type_without_exclusive_ownership_keeps_the_value() {
    let exclusive = || with_mutability(ty("Counter"), TypeMutability::Exclusive);
    let result = analyze(vec![
        counter_class(),
        Declaration::Function(
            fun("inspect")
                .param_with("c", exclusive(), Some(VariableOwnership::Captured), false)
                .body(Vec::new()),
        ),
        Declaration::Function(fun("f").body(vec![
            val("c", None, Some(call("Counter", vec![int(1)]))),
            stmt(call("inspect", vec![var("c")])),
            stmt(member(var("c"), "count")),
        ])),
    ]);
    assert_clean(&result);
}

#[test]
fn mutually_recursive_inference() {
    let result = analyze(vec![
        Declaration::Function(fun("ping").expression_body(call("pong", Vec::new()))),
        Declaration::Function(fun("pong").expression_body(call("ping", Vec::new()))),
    ]);
    assert_reports(&result, |k| matches!(k, DiagnosticKind::CyclicTypeInference { .. }));
}

#[test]
fn global_read_from_its_own_initializer() {
    let result = analyze(vec![
        global("x", false, None, Some(call("f", Vec::new()))),
        Declaration::Function(fun("f").expression_body(var("x"))),
    ]);
    assert_reports(&result, |k| matches!(k, DiagnosticKind::CyclicTypeInference { .. }));
    assert!(result.has_errors());
    assert!(result.to_backend_ir().is_err());
}

#[test]
fn global_type_is_inferred_on_first_read() {
    let result = analyze(vec![
        global("first", false, None, Some(var("second"))),
        global("second", false, None, Some(int(1))),
        Declaration::Function(fun("f").returns(ty("S32")).expression_body(var("first"))),
    ]);
    assert_clean(&result);
    assert!(result.to_backend_ir().is_ok());
}

#[test]
fn duplicate_globals() {
    let result = analyze(vec![
        global("x", false, None, Some(int(1))),
        global("x", false, None, Some(int(2))),
    ]);
    assert_reports(&result, |k| matches!(k, DiagnosticKind::DuplicateDeclaration { name } if name == "x"));
}

#[test]
fn global_sharing_a_class_name() {
    let result = analyze(vec![
        class("Point").build(),
        global("Point", false, None, Some(int(1))),
    ]);
    assert_reports(&result, |k| matches!(k, DiagnosticKind::DuplicateDeclaration { name } if name == "Point"));
}

#[test]
fn phases_are_memoized() {
    let result = analyze(vec![Declaration::Function(fun("f").returns(ty("S32")).body(Vec::new()))]);
    for module in result.modules() {
        assert_eq!(module.phase1(), module.phase1());
        assert_eq!(module.phase2(), module.phase2());
        assert_eq!(module.phase3(), module.phase3());
    }
    assert_eq!(result.diagnostics().len(), 1);
}

#[test]
fn report_is_truncated() {
    let config = SemaConfig {
        max_reported_diagnostics: Some(1),
        ..SemaConfig::default()
    };
    let result = analyze_with(
        config,
        vec![
            Declaration::Function(fun("f").returns(ty("S32")).body(Vec::new())),
            Declaration::Function(fun("g").returns(ty("S32")).body(Vec::new())),
        ],
    );
    assert_eq!(result.diagnostics().len(), 1);
}

