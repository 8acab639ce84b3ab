#![forbid(unsafe_code)]

//! Resolved types.
//!
//! A [`BoundType`] always refers to a [`BaseType`] through an `Rc`; base types
//! are created once per declaration and compared by identity.

mod mutability;
mod unification;

use std::cell::OnceCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU32, Ordering};

use ember_ast::{NumberBase, Span, Variance};

use crate::binder::{BoundClass, BoundInterface};

pub use mutability::Mutability;
pub use unification::TypeUnification;

static NEXT_TYPE_ID: AtomicU32 = AtomicU32::new(0);

fn next_type_id() -> u32 {
    NEXT_TYPE_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BaseTypeKind {
    Class,
    Interface,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntegerKind {
    pub bits: u32,
    pub signed: bool,
}

impl IntegerKind {
    pub fn min(&self) -> i128 {
        if self.signed { -(1i128 << (self.bits - 1)) } else { 0 }
    }

    pub fn max(&self) -> i128 {
        if self.signed {
            (1i128 << (self.bits - 1)) - 1
        } else {
            (1i128 << self.bits) - 1
        }
    }

    /// The value a literal denotes in this type, if it is representable.
    ///
    /// Binary and hexadecimal literals describe bit patterns: one that is out
    /// of the signed range but fits the width unsigned is read as two's
    /// complement, so `0xFF` is `-1` as an `S8`.
    pub fn accept_literal(&self, value: i128, base: NumberBase) -> Option<i128> {
        if (self.min()..=self.max()).contains(&value) {
            return Some(value);
        }
        let bit_pattern = matches!(base, NumberBase::Binary | NumberBase::Hexadecimal);
        let unsigned_max = (1i128 << self.bits) - 1;
        if bit_pattern && self.signed && value > self.max() && value <= unsigned_max {
            return Some(value - (1i128 << self.bits));
        }
        None
    }
}

/// Intrinsic types that live in registers and are never reference counted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Integer(IntegerKind),
    Bool,
    Unit,
    Nothing,
}

#[derive(Clone, Debug)]
pub enum TypeDeclaration {
    Class(Weak<BoundClass>),
    Interface(Weak<BoundInterface>),
}

pub struct BaseType {
    pub id: u32,
    pub canonical_name: String,
    pub simple_name: String,
    pub kind: BaseTypeKind,
    pub span: Span,
    pub type_parameters: Vec<Rc<TypeParameter>>,
    pub value_kind: Option<ValueKind>,
    /// `Any` is the top type; set for exactly one base type.
    pub is_top: bool,
    supertypes: OnceCell<Vec<BoundType>>,
    declaration: OnceCell<TypeDeclaration>,
}

impl fmt::Debug for BaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BaseType({})", self.canonical_name)
    }
}

impl BaseType {
    pub fn new(
        canonical_name: String,
        simple_name: String,
        kind: BaseTypeKind,
        span: Span,
        type_parameters: Vec<Rc<TypeParameter>>,
        value_kind: Option<ValueKind>,
        is_top: bool,
    ) -> Self {
        Self {
            id: next_type_id(),
            canonical_name,
            simple_name,
            kind,
            span,
            type_parameters,
            value_kind,
            is_top,
            supertypes: OnceCell::new(),
            declaration: OnceCell::new(),
        }
    }

    pub fn is_reference_counted(&self) -> bool {
        self.value_kind.is_none()
    }

    pub fn is_nothing(&self) -> bool {
        self.value_kind == Some(ValueKind::Nothing)
    }

    pub fn integer_kind(&self) -> Option<IntegerKind> {
        match self.value_kind {
            Some(ValueKind::Integer(kind)) => Some(kind),
            _ => None,
        }
    }

    /// Mutability of a reference to this type when none is spelled out.
    pub fn default_mutability(&self) -> Mutability {
        if self.value_kind.is_some() {
            Mutability::Immutable
        } else {
            Mutability::ReadOnly
        }
    }

    pub fn set_supertypes(&self, supertypes: Vec<BoundType>) {
        if self.supertypes.set(supertypes).is_err() {
            ice!("supertypes of {} resolved twice", self.canonical_name);
        }
    }

    pub fn supertypes(&self) -> &[BoundType] {
        self.supertypes.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn set_declaration(&self, declaration: TypeDeclaration) {
        if self.declaration.set(declaration).is_err() {
            ice!("declaration of {} attached twice", self.canonical_name);
        }
    }

    pub fn class(&self) -> Option<Rc<BoundClass>> {
        match self.declaration.get()? {
            TypeDeclaration::Class(c) => c.upgrade(),
            TypeDeclaration::Interface(_) => None,
        }
    }

    pub fn interface(&self) -> Option<Rc<BoundInterface>> {
        match self.declaration.get()? {
            TypeDeclaration::Interface(i) => i.upgrade(),
            TypeDeclaration::Class(_) => None,
        }
    }

    pub fn same_as(&self, other: &BaseType) -> bool {
        self.id == other.id
    }

    pub fn is_subtype_of(&self, other: &BaseType) -> bool {
        if self.same_as(other) || other.is_top || self.is_nothing() {
            return true;
        }
        self.supertypes()
            .iter()
            .filter_map(BoundType::base)
            .any(|s| s.is_subtype_of(other))
    }

    /// The type arguments `target` receives when a value of
    /// `self<arguments>` is viewed as a `target`.
    pub fn supertype_arguments(
        &self,
        target: &BaseType,
        arguments: &[BoundTypeArgument],
    ) -> Option<Vec<BoundTypeArgument>> {
        if self.same_as(target) {
            return Some(arguments.to_vec());
        }
        for supertype in self.supertypes() {
            let BoundType::Root {
                base,
                arguments: super_arguments,
                ..
            } = supertype
            else {
                continue;
            };
            let substituted: Vec<BoundTypeArgument> = super_arguments
                .iter()
                .map(|a| BoundTypeArgument {
                    variance: a.variance,
                    ty: a.ty.substitute_arguments(&self.type_parameters, arguments),
                })
                .collect();
            if let Some(found) = base.supertype_arguments(target, &substituted) {
                return Some(found);
            }
        }
        None
    }

    /// `self<T1, T2, ...>` with its own type parameters as arguments.
    pub fn self_type(self: &Rc<Self>, mutability: Mutability) -> BoundType {
        BoundType::Root {
            base: self.clone(),
            arguments: self
                .type_parameters
                .iter()
                .map(|p| BoundTypeArgument {
                    variance: Variance::Unspecified,
                    ty: BoundType::Generic {
                        parameter: p.clone(),
                        mutability: None,
                    },
                })
                .collect(),
            mutability,
        }
    }
}

pub struct TypeParameter {
    pub id: u32,
    pub name: String,
    pub variance: Variance,
    pub span: Span,
    bound: OnceCell<BoundType>,
}

impl fmt::Debug for TypeParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeParameter({}#{})", self.name, self.id)
    }
}

impl TypeParameter {
    pub fn new(name: String, variance: Variance, span: Span) -> Self {
        Self {
            id: next_type_id(),
            name,
            variance,
            span,
            bound: OnceCell::new(),
        }
    }

    pub fn with_bound(name: String, variance: Variance, span: Span, bound: BoundType) -> Self {
        let parameter = Self::new(name, variance, span);
        parameter.set_bound(bound);
        parameter
    }

    pub fn set_bound(&self, bound: BoundType) {
        if self.bound.set(bound).is_err() {
            ice!("bound of type parameter {} resolved twice", self.name);
        }
    }

    pub fn bound(&self) -> BoundType {
        match self.bound.get() {
            Some(b) => b.clone(),
            None => ice!("bound of type parameter {} used before resolution", self.name),
        }
    }

    pub fn resolved_bound(&self) -> Option<&BoundType> {
        self.bound.get()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BoundTypeArgument {
    pub variance: Variance,
    pub ty: BoundType,
}

impl fmt::Display for BoundTypeArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.variance {
            Variance::In => write!(f, "in {}", self.ty),
            Variance::Out => write!(f, "out {}", self.ty),
            Variance::Unspecified => write!(f, "{}", self.ty),
        }
    }
}

#[derive(Clone, Debug)]
pub enum BoundType {
    Root {
        base: Rc<BaseType>,
        arguments: Vec<BoundTypeArgument>,
        mutability: Mutability,
    },
    Generic {
        parameter: Rc<TypeParameter>,
        /// `None` inherits the mutability of the parameter's bound.
        mutability: Option<Mutability>,
    },
    /// Never wraps another `Nullable`.
    Nullable(Box<BoundType>),
    /// A use-site type argument seen through a projection. Never wraps a
    /// `Nullable` directly.
    Argument {
        parameter: Rc<TypeParameter>,
        variance: Variance,
        ty: Box<BoundType>,
    },
    /// Placeholder solved by unification.
    Variable {
        parameter: Rc<TypeParameter>,
        mutability: Option<Mutability>,
    },
    /// Stands in for a type that failed to resolve; behaves like `standin`
    /// without ever producing new diagnostics.
    Unresolved {
        name: String,
        standin: Box<BoundType>,
    },
}

impl PartialEq for BoundType {
    fn eq(&self, other: &Self) -> bool {
        use BoundType::*;
        match (self, other) {
            (
                Root {
                    base: a,
                    arguments: aa,
                    mutability: am,
                },
                Root {
                    base: b,
                    arguments: ba,
                    mutability: bm,
                },
            ) => a.same_as(b) && aa == ba && am == bm,
            (
                Generic {
                    parameter: a,
                    mutability: am,
                },
                Generic {
                    parameter: b,
                    mutability: bm,
                },
            )
            | (
                Variable {
                    parameter: a,
                    mutability: am,
                },
                Variable {
                    parameter: b,
                    mutability: bm,
                },
            ) => a.id == b.id && am == bm,
            (Nullable(a), Nullable(b)) => a == b,
            (
                Argument {
                    parameter: ap,
                    variance: av,
                    ty: at,
                },
                Argument {
                    parameter: bp,
                    variance: bv,
                    ty: bt,
                },
            ) => ap.id == bp.id && av == bv && at == bt,
            (Unresolved { name: a, .. }, Unresolved { name: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl BoundType {
    pub fn simple(base: &Rc<BaseType>, mutability: Mutability) -> Self {
        BoundType::Root {
            base: base.clone(),
            arguments: Vec::new(),
            mutability,
        }
    }

    pub fn nullable(self) -> Self {
        match self {
            BoundType::Nullable(_) => self,
            BoundType::Unresolved { name, standin } => BoundType::Unresolved {
                name,
                standin: Box::new(standin.nullable()),
            },
            other => BoundType::Nullable(Box::new(other)),
        }
    }

    pub fn non_nullable(&self) -> BoundType {
        match self {
            BoundType::Nullable(inner) => (**inner).clone(),
            BoundType::Unresolved { name, standin } => BoundType::Unresolved {
                name: name.clone(),
                standin: Box::new(standin.non_nullable()),
            },
            other => other.clone(),
        }
    }

    /// Keeps the invariant that nullability sits outside of an argument.
    pub fn argument(parameter: Rc<TypeParameter>, variance: Variance, ty: BoundType) -> Self {
        match ty {
            BoundType::Nullable(inner) => BoundType::Argument {
                parameter,
                variance,
                ty: inner,
            }
            .nullable(),
            other => BoundType::Argument {
                parameter,
                variance,
                ty: Box::new(other),
            },
        }
    }

    pub fn is_nullable(&self) -> bool {
        match self {
            BoundType::Nullable(_) => true,
            BoundType::Unresolved { standin, .. } => standin.is_nullable(),
            _ => false,
        }
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(self, BoundType::Unresolved { .. })
    }

    /// The `Nothing` type: assignable to everything.
    pub fn is_nothing(&self) -> bool {
        matches!(self, BoundType::Root { base, .. } if base.is_nothing())
    }

    pub fn is_value_type(&self) -> bool {
        matches!(self.base(), Some(b) if b.value_kind.is_some())
    }

    pub fn mutability(&self) -> Mutability {
        match self {
            BoundType::Root { mutability, .. } => *mutability,
            BoundType::Generic {
                parameter,
                mutability,
            }
            | BoundType::Variable {
                parameter,
                mutability,
            } => mutability.unwrap_or_else(|| parameter.bound().mutability()),
            BoundType::Nullable(inner) => inner.mutability(),
            BoundType::Argument { ty, .. } => ty.mutability(),
            BoundType::Unresolved { standin, .. } => standin.mutability(),
        }
    }

    pub fn with_mutability(&self, mutability: Mutability) -> BoundType {
        match self {
            BoundType::Root {
                base, arguments, ..
            } => BoundType::Root {
                base: base.clone(),
                arguments: arguments.clone(),
                mutability,
            },
            BoundType::Generic { parameter, .. } => BoundType::Generic {
                parameter: parameter.clone(),
                mutability: Some(mutability),
            },
            BoundType::Variable { parameter, .. } => BoundType::Variable {
                parameter: parameter.clone(),
                mutability: Some(mutability),
            },
            BoundType::Nullable(inner) => inner.with_mutability(mutability).nullable(),
            BoundType::Argument {
                parameter,
                variance,
                ty,
            } => BoundType::argument(parameter.clone(), *variance, ty.with_mutability(mutability)),
            BoundType::Unresolved { name, standin } => BoundType::Unresolved {
                name: name.clone(),
                standin: Box::new(standin.with_mutability(mutability)),
            },
        }
    }

    /// Base type of the value, looking through nullability, projections and
    /// error stand-ins. `None` for type parameters.
    pub fn base(&self) -> Option<&Rc<BaseType>> {
        match self {
            BoundType::Root { base, .. } => Some(base),
            BoundType::Nullable(inner) => inner.base(),
            BoundType::Argument { ty, .. } => ty.base(),
            BoundType::Unresolved { standin, .. } => standin.base(),
            BoundType::Generic { .. } | BoundType::Variable { .. } => None,
        }
    }

    pub fn arguments(&self) -> &[BoundTypeArgument] {
        match self {
            BoundType::Root { arguments, .. } => arguments,
            BoundType::Nullable(inner) => inner.arguments(),
            BoundType::Argument { ty, .. } => ty.arguments(),
            BoundType::Unresolved { standin, .. } => standin.arguments(),
            BoundType::Generic { .. } | BoundType::Variable { .. } => &[],
        }
    }

    /// The type a value of this type can be used as when read.
    pub fn effective_upper_bound(&self) -> BoundType {
        match self {
            BoundType::Generic {
                parameter,
                mutability,
            }
            | BoundType::Variable {
                parameter,
                mutability,
            } => {
                let bound = parameter.bound().effective_upper_bound();
                match mutability {
                    Some(m) => bound.with_mutability(*m),
                    None => bound,
                }
            }
            BoundType::Argument {
                parameter,
                variance,
                ty,
            } => match variance {
                Variance::In => parameter.bound().effective_upper_bound(),
                Variance::Out | Variance::Unspecified => ty.effective_upper_bound(),
            },
            BoundType::Nullable(inner) => inner.effective_upper_bound().nullable(),
            BoundType::Unresolved { standin, .. } => standin.effective_upper_bound(),
            BoundType::Root { .. } => self.clone(),
        }
    }

    /// Rebuilds the type, replacing generic references and type variables
    /// for which `replace` yields a type.
    pub fn map_parameters(
        &self,
        replace: &dyn Fn(&Rc<TypeParameter>, bool) -> Option<BoundType>,
    ) -> BoundType {
        match self {
            BoundType::Root {
                base,
                arguments,
                mutability,
            } => BoundType::Root {
                base: base.clone(),
                arguments: arguments
                    .iter()
                    .map(|a| BoundTypeArgument {
                        variance: a.variance,
                        ty: a.ty.map_parameters(replace),
                    })
                    .collect(),
                mutability: *mutability,
            },
            BoundType::Generic {
                parameter,
                mutability,
            } => match replace(parameter, false) {
                Some(t) => match mutability {
                    Some(m) => t.with_mutability(*m),
                    None => t,
                },
                None => self.clone(),
            },
            BoundType::Variable {
                parameter,
                mutability,
            } => match replace(parameter, true) {
                Some(t) => match mutability {
                    Some(m) => t.with_mutability(*m),
                    None => t,
                },
                None => self.clone(),
            },
            BoundType::Nullable(inner) => inner.map_parameters(replace).nullable(),
            BoundType::Argument {
                parameter,
                variance,
                ty,
            } => BoundType::argument(parameter.clone(), *variance, ty.map_parameters(replace)),
            BoundType::Unresolved { name, standin } => BoundType::Unresolved {
                name: name.clone(),
                standin: Box::new(standin.map_parameters(replace)),
            },
        }
    }

    /// Substitutes `parameters` by use-site `arguments`; projected arguments
    /// become [`BoundType::Argument`]s.
    pub fn substitute_arguments(
        &self,
        parameters: &[Rc<TypeParameter>],
        arguments: &[BoundTypeArgument],
    ) -> BoundType {
        if parameters.is_empty() {
            return self.clone();
        }
        self.map_parameters(&|p, _| {
            let index = parameters.iter().position(|q| q.id == p.id)?;
            let argument = arguments.get(index)?;
            Some(match argument.variance {
                Variance::Unspecified => argument.ty.clone(),
                variance => BoundType::argument(p.clone(), variance, argument.ty.clone()),
            })
        })
    }

    /// Turns references to `parameters` into type variables to be solved.
    pub fn with_type_variables(&self, parameters: &[Rc<TypeParameter>]) -> BoundType {
        if parameters.is_empty() {
            return self.clone();
        }
        self.map_parameters(&|p, is_variable| {
            if is_variable || !parameters.iter().any(|q| q.id == p.id) {
                return None;
            }
            Some(BoundType::Variable {
                parameter: p.clone(),
                mutability: None,
            })
        })
    }

    /// Replaces solved type variables; unsolved ones fall back to their bound.
    pub fn instantiate(&self, unification: &TypeUnification) -> BoundType {
        self.map_parameters(&|p, is_variable| {
            if !is_variable {
                return None;
            }
            Some(unification.binding(p.id).cloned().unwrap_or_else(|| p.bound()))
        })
    }

    /// Like [`BoundType::instantiate`], but leaves unsolved variables alone.
    pub fn instantiate_partially(&self, unification: &TypeUnification) -> BoundType {
        self.map_parameters(&|p, is_variable| {
            if !is_variable {
                return None;
            }
            unification.binding(p.id).cloned()
        })
    }

    pub fn contains_type_variables(&self) -> bool {
        match self {
            BoundType::Variable { .. } => true,
            BoundType::Root { arguments, .. } => {
                arguments.iter().any(|a| a.ty.contains_type_variables())
            }
            BoundType::Nullable(inner) => inner.contains_type_variables(),
            BoundType::Argument { ty, .. } => ty.contains_type_variables(),
            BoundType::Unresolved { standin, .. } => standin.contains_type_variables(),
            BoundType::Generic { .. } => false,
        }
    }

    /// Two types are disjoint when no value can be of both types. Drives
    /// overload disambiguation. An unresolved side counts as disjoint; its
    /// error is reported already.
    pub fn is_disjoint_with(&self, other: &BoundType) -> bool {
        if self.is_unresolved() || other.is_unresolved() {
            return true;
        }
        if self.is_nullable() && other.is_nullable() {
            return false;
        }
        let a = self.non_nullable().effective_upper_bound();
        let b = other.non_nullable().effective_upper_bound();
        let (Some(a), Some(b)) = (a.base(), b.base()) else {
            return false;
        };
        if a.is_subtype_of(b) || b.is_subtype_of(a) {
            return false;
        }
        // Only classes are final; an unrelated class may implement both interfaces.
        !(a.kind == BaseTypeKind::Interface && b.kind == BaseTypeKind::Interface)
    }
}

impl fmt::Display for BoundType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundType::Root {
                base,
                arguments,
                mutability,
            } => {
                if *mutability != base.default_mutability() {
                    write!(f, "{mutability} ")?;
                }
                f.write_str(&base.simple_name)?;
                if !arguments.is_empty() {
                    f.write_str("<")?;
                    for (i, a) in arguments.iter().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{a}")?;
                    }
                    f.write_str(">")?;
                }
                Ok(())
            }
            BoundType::Generic {
                parameter,
                mutability,
            }
            | BoundType::Variable {
                parameter,
                mutability,
            } => match mutability {
                Some(m) => write!(f, "{m} {}", parameter.name),
                None => f.write_str(&parameter.name),
            },
            BoundType::Nullable(inner) => write!(f, "{inner}?"),
            BoundType::Argument { variance, ty, .. } => match variance {
                Variance::In => write!(f, "in {ty}"),
                Variance::Out => write!(f, "out {ty}"),
                Variance::Unspecified => write!(f, "{ty}"),
            },
            BoundType::Unresolved { name, .. } => f.write_str(name),
        }
    }
}
