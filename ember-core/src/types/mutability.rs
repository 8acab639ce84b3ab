#![forbid(unsafe_code)]

use std::fmt;

use ember_ast::TypeMutability;

/// Mutability of a reference.
///
/// Not a total order: `Exclusive` carries the capabilities of `Mutable` and
/// additionally guarantees that no other reference exists, which is why it is
/// the only mutability that converts into all others.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Mutability {
    Mutable,
    ReadOnly,
    Immutable,
    Exclusive,
}

impl Mutability {
    pub const ALL: [Mutability; 4] = [
        Mutability::Mutable,
        Mutability::ReadOnly,
        Mutability::Immutable,
        Mutability::Exclusive,
    ];

    pub fn is_assignable_to(self, target: Mutability) -> bool {
        match target {
            Mutability::ReadOnly => true,
            Mutability::Mutable => matches!(self, Mutability::Mutable | Mutability::Exclusive),
            Mutability::Immutable => matches!(self, Mutability::Immutable | Mutability::Exclusive),
            Mutability::Exclusive => self == Mutability::Exclusive,
        }
    }

    /// The strongest mutability both `self` and `other` can be assigned to.
    pub fn union(self, other: Mutability) -> Mutability {
        if self == other {
            return self;
        }
        for candidate in [Mutability::Mutable, Mutability::Immutable] {
            if self.is_assignable_to(candidate) && other.is_assignable_to(candidate) {
                return candidate;
            }
        }
        Mutability::ReadOnly
    }

    /// Mutability of a value reached through a reference of mutability `self`.
    pub fn combined_with(self, member: Mutability) -> Mutability {
        match self {
            Mutability::Immutable => Mutability::Immutable,
            Mutability::ReadOnly => {
                if member == Mutability::Immutable {
                    Mutability::Immutable
                } else {
                    Mutability::ReadOnly
                }
            }
            Mutability::Mutable | Mutability::Exclusive => {
                if member == Mutability::Exclusive {
                    Mutability::Mutable
                } else {
                    member
                }
            }
        }
    }

    pub fn allows_mutation(self) -> bool {
        matches!(self, Mutability::Mutable | Mutability::Exclusive)
    }

    pub fn keyword(self) -> &'static str {
        match self {
            Mutability::Mutable => "mut",
            Mutability::ReadOnly => "readonly",
            Mutability::Immutable => "const",
            Mutability::Exclusive => "exclusive",
        }
    }
}

impl From<TypeMutability> for Mutability {
    fn from(value: TypeMutability) -> Self {
        match value {
            TypeMutability::Mutable => Mutability::Mutable,
            TypeMutability::ReadOnly => Mutability::ReadOnly,
            TypeMutability::Immutable => Mutability::Immutable,
            TypeMutability::Exclusive => Mutability::Exclusive,
        }
    }
}

impl fmt::Display for Mutability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

#[cfg(test)]
mod tests {
    use super::Mutability::*;

    #[test]
    fn assignability_table() {
        assert!(Mutable.is_assignable_to(ReadOnly));
        assert!(Exclusive.is_assignable_to(ReadOnly));
        assert!(Exclusive.is_assignable_to(Immutable));
        assert!(Exclusive.is_assignable_to(Mutable));
        assert!(!Mutable.is_assignable_to(Immutable));
        assert!(!ReadOnly.is_assignable_to(Mutable));
        assert!(!ReadOnly.is_assignable_to(Immutable));
        assert!(!Immutable.is_assignable_to(Mutable));
        assert!(!Mutable.is_assignable_to(Exclusive));
    }

    #[test]
    fn union_is_an_upper_bound() {
        for a in super::Mutability::ALL {
            for b in super::Mutability::ALL {
                let u = a.union(b);
                assert!(a.is_assignable_to(u), "{a} -> {u}");
                assert!(b.is_assignable_to(u), "{b} -> {u}");
            }
        }
        assert_eq!(Mutable.union(Immutable), ReadOnly);
        assert_eq!(Exclusive.union(Mutable), Mutable);
    }
}
