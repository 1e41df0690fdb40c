//! Names, binders, and scope tracking.
//!
//! A name carries a color identifying the namespace it lives in and a
//! globally unique id drawn from a single counter-backed supply. The
//! original design tracked scope membership in the type system; here the
//! discipline is enforced by the builder API, with debug-time checks in
//! `ir::validate`.
//!
//! Invariants maintained by the supply and the builders:
//! - no two live binders share a name within one scope
//! - free variables of any term are a subset of its scope
//! - substitution freshens binders on capture, preserving alpha-equivalence

use std::collections::HashMap;
use std::fmt;

/// Namespace tag for a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NameColor {
    /// Term-level bindings in the high IR.
    Atom,
    /// Data-type definitions.
    DataDef,
    /// Class definitions.
    Class,
    /// Class instances.
    Instance,
    /// Class methods.
    Method,
    /// Modules.
    Module,
    /// Pointers backing destinations.
    Ptr,
    /// Specialized dictionaries.
    SpecDict,
    /// Function objects.
    FunObj,
    /// Imp-level bindings (scalars, pointers, loop indices).
    Imp,
}

impl NameColor {
    fn prefix(self) -> &'static str {
        match self {
            NameColor::Atom => "v",
            NameColor::DataDef => "d",
            NameColor::Class => "c",
            NameColor::Instance => "inst",
            NameColor::Method => "m",
            NameColor::Module => "mod",
            NameColor::Ptr => "p",
            NameColor::SpecDict => "sd",
            NameColor::FunObj => "f",
            NameColor::Imp => "x",
        }
    }
}

/// A unique name: a namespace color plus a supply-issued id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Name {
    pub color: NameColor,
    pub id: u32,
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.color.prefix(), self.id)
    }
}

/// Counter-backed allocator for fresh names.
///
/// A single counter serves all colors, so two names are equal only if
/// they are the same allocation.
#[derive(Debug, Clone, Default)]
pub struct NameSupply {
    next_id: u32,
}

impl NameSupply {
    pub fn new() -> Self {
        NameSupply { next_id: 0 }
    }

    /// Allocate a fresh name in the given namespace.
    pub fn fresh(&mut self, color: NameColor) -> Name {
        let id = self.next_id;
        self.next_id += 1;
        Name { color, id }
    }

    /// Number of names issued so far.
    pub fn issued(&self) -> u32 {
        self.next_id
    }
}

/// A single scope of name bindings.
#[derive(Debug, Clone)]
pub struct Scope<T> {
    bindings: HashMap<Name, T>,
}

impl<T> Default for Scope<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Scope<T> {
    pub fn new() -> Self {
        Scope {
            bindings: HashMap::new(),
        }
    }

    pub fn insert(&mut self, name: Name, value: T) {
        self.bindings.insert(name, value);
    }

    pub fn get(&self, name: Name) -> Option<&T> {
        self.bindings.get(&name)
    }

    pub fn contains(&self, name: Name) -> bool {
        self.bindings.contains_key(&name)
    }

    pub fn names(&self) -> impl Iterator<Item = &Name> {
        self.bindings.keys()
    }
}

/// A stack of scopes searched innermost-first.
///
/// Builders push a scope per emission frame; lookups walk outward so
/// inner binders shadow nothing (the supply guarantees distinct names)
/// but frames can be popped wholesale when a block is sealed.
#[derive(Debug, Clone)]
pub struct ScopeStack<T> {
    scopes: Vec<Scope<T>>,
}

impl<T> Default for ScopeStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ScopeStack<T> {
    /// Create a stack with a single global scope.
    pub fn new() -> Self {
        ScopeStack {
            scopes: vec![Scope::new()],
        }
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(Scope::new());
    }

    /// Pop the innermost scope. Returns None when only the global scope
    /// remains.
    pub fn pop_scope(&mut self) -> Option<Scope<T>> {
        if self.scopes.len() > 1 {
            self.scopes.pop()
        } else {
            None
        }
    }

    /// Bind a name in the innermost scope.
    pub fn insert(&mut self, name: Name, value: T) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name, value);
        }
    }

    /// Look up a name, innermost scope first.
    pub fn lookup(&self, name: Name) -> Option<&T> {
        for scope in self.scopes.iter().rev() {
            if let Some(value) = scope.get(name) {
                return Some(value);
            }
        }
        None
    }

    pub fn is_bound(&self, name: Name) -> bool {
        self.lookup(name).is_some()
    }

    /// Names bound in the innermost scope only.
    pub fn current_names(&self) -> Vec<Name> {
        match self.scopes.last() {
            Some(scope) => scope.names().copied().collect(),
            None => Vec::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.scopes.len().saturating_sub(1)
    }
}
