use std::rc::Rc;

use ember_ast::{NumberBase, Variance, span};
use ember_core::Mutability;
use ember_core::types::{BaseType, BaseTypeKind, BoundType, BoundTypeArgument, IntegerKind, TypeParameter};
use proptest::prelude::*;

fn mutability() -> impl Strategy<Value = Mutability> {
    prop::sample::select(Mutability::ALL.to_vec())
}

fn variance() -> impl Strategy<Value = Variance> {
    prop::sample::select(vec![Variance::Unspecified, Variance::In, Variance::Out])
}

struct Fixture {
    parent: Rc<BaseType>,
    child: Rc<BaseType>,
    holder: Rc<BaseType>,
}

fn base(name: &str, kind: BaseTypeKind, parameters: Vec<Rc<TypeParameter>>) -> Rc<BaseType> {
    Rc::new(BaseType::new(
        format!("test.{name}"),
        name.to_string(),
        kind,
        span(0, 0),
        parameters,
        None,
        false,
    ))
}

/// `interface Parent`, `class Child : Parent`, `class Holder<T>`.
fn fixture() -> Fixture {
    let parent = base("Parent", BaseTypeKind::Interface, Vec::new());
    parent.set_supertypes(Vec::new());
    let child = base("Child", BaseTypeKind::Class, Vec::new());
    child.set_supertypes(vec![BoundType::simple(&parent, Mutability::ReadOnly)]);
    let parameter = Rc::new(TypeParameter::with_bound(
        "T".to_string(),
        Variance::Unspecified,
        span(0, 0),
        BoundType::simple(&parent, Mutability::ReadOnly).nullable(),
    ));
    let holder = base("Holder", BaseTypeKind::Class, vec![parameter]);
    holder.set_supertypes(Vec::new());
    Fixture { parent, child, holder }
}

impl Fixture {
    fn holder_of(&self, variance: Variance, child: bool) -> BoundType {
        let argument = if child { &self.child } else { &self.parent };
        BoundType::Root {
            base: self.holder.clone(),
            arguments: vec![BoundTypeArgument {
                variance,
                ty: BoundType::simple(argument, Mutability::ReadOnly),
            }],
            mutability: Mutability::Mutable,
        }
    }
}

/// `a` is `Child` or `Parent`; only `Child <: Parent` holds between them.
fn subtype(a_is_child: bool, b_is_child: bool) -> bool {
    a_is_child == b_is_child || a_is_child
}

proptest! {
    #[test]
    fn assignability_is_reflexive_and_transitive(a in mutability(), b in mutability(), c in mutability()) {
        prop_assert!(a.is_assignable_to(a));
        if a.is_assignable_to(b) && b.is_assignable_to(c) {
            prop_assert!(a.is_assignable_to(c));
        }
    }

    #[test]
    fn everything_is_readonly_and_only_exclusive_is_exclusive(a in mutability()) {
        prop_assert!(a.is_assignable_to(Mutability::ReadOnly));
        prop_assert_eq!(a.is_assignable_to(Mutability::Exclusive), a == Mutability::Exclusive);
    }

    #[test]
    fn union_is_the_least_common_target(a in mutability(), b in mutability()) {
        let union = a.union(b);
        prop_assert!(a.is_assignable_to(union));
        prop_assert!(b.is_assignable_to(union));
        for candidate in Mutability::ALL {
            if a.is_assignable_to(candidate) && b.is_assignable_to(candidate) {
                prop_assert!(union.is_assignable_to(candidate), "{union} is not below {candidate}");
            }
        }
    }

    #[test]
    fn access_through_a_reference_never_gains_mutation(outer in mutability(), member in mutability()) {
        let combined = outer.combined_with(member);
        if combined.allows_mutation() {
            prop_assert!(outer.allows_mutation());
            prop_assert!(member.allows_mutation());
        }
        prop_assert_ne!(combined, Mutability::Exclusive);
    }

    #[test]
    fn nullable_locations_accept_non_null_values(target in mutability(), value in mutability()) {
        let f = fixture();
        let location = BoundType::simple(&f.parent, target).nullable();
        let assignee = BoundType::simple(&f.child, value);
        prop_assert_eq!(location.is_assignable_from(&assignee), value.is_assignable_to(target));
        prop_assert!(!assignee.is_assignable_from(&location));
    }

    #[test]
    fn projections_follow_their_variance(
        target_variance in variance(),
        target_child in any::<bool>(),
        value_variance in variance(),
        value_child in any::<bool>(),
    ) {
        let f = fixture();
        let target = f.holder_of(target_variance, target_child);
        let value = f.holder_of(value_variance, value_child);
        let expected = match (target_variance, value_variance) {
            (Variance::Unspecified, Variance::Unspecified) => target_child == value_child,
            (Variance::Out, Variance::Out | Variance::Unspecified) => subtype(value_child, target_child),
            (Variance::In, Variance::In | Variance::Unspecified) => subtype(target_child, value_child),
            _ => false,
        };
        prop_assert_eq!(target.is_assignable_from(&value), expected, "{} := {}", target, value);
    }

    #[test]
    fn decimal_literals_are_taken_at_face_value(value in -128i128..=127) {
        let s8 = IntegerKind { bits: 8, signed: true };
        prop_assert_eq!(s8.accept_literal(value, NumberBase::Decimal), Some(value));
    }

    #[test]
    fn hexadecimal_literals_wrap_into_signed_types(value in 128i128..=255) {
        let s8 = IntegerKind { bits: 8, signed: true };
        prop_assert_eq!(s8.accept_literal(value, NumberBase::Hexadecimal), Some(value - 256));
        prop_assert_eq!(s8.accept_literal(value, NumberBase::Decimal), None);
    }
}

#[test]
fn exact_arguments_do_not_cross_the_hierarchy() {
    let f = fixture();
    let of_parent = f.holder_of(Variance::Unspecified, false);
    let of_child = f.holder_of(Variance::Unspecified, true);
    assert!(!of_parent.is_assignable_from(&of_child));
    assert!(!of_child.is_assignable_from(&of_parent));
    assert!(f.holder_of(Variance::Out, false).is_assignable_from(&of_child));
    assert!(f.holder_of(Variance::In, true).is_assignable_from(&of_parent));
}

#[test]
fn unsigned_types_reject_negative_literals() {
    let u8 = IntegerKind { bits: 8, signed: false };
    assert_eq!(u8.accept_literal(-1, NumberBase::Hexadecimal), None);
    assert_eq!(u8.accept_literal(255, NumberBase::Decimal), Some(255));
}
