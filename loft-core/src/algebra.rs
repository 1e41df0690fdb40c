//! Symbolic index algebra: element counts and flat-buffer offsets.
//!
//! An index structure is a telescope of index-type binders. Sizes of a
//! non-dependent prefix multiply directly; a dependent suffix is
//! handled with rational-coefficient polynomials over binder ordinals,
//! summed in closed form (Faulhaber, via Bernoulli numbers). Emission
//! multiplies through by the common denominator and divides once at
//! the end, entirely in index-representation arithmetic.

use crate::builder::Builder;
use crate::err_algebra;
use crate::error::Result;
use crate::ir::fold::{free_vars_ix, subst_ix};
use crate::ir::*;
use crate::name::Name;
use std::collections::{BTreeMap, HashMap};

// =============================================================================
// Rationals
// =============================================================================

fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.abs(), b.abs());
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// An exact rational with a positive denominator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    pub num: i64,
    pub den: i64,
}

impl Rational {
    pub fn new(num: i64, den: i64) -> Rational {
        assert!(den != 0, "rational with zero denominator");
        let sign = if den < 0 { -1 } else { 1 };
        let g = gcd(num, den).max(1);
        Rational {
            num: sign * num / g,
            den: sign * den / g,
        }
    }

    pub fn int(n: i64) -> Rational {
        Rational { num: n, den: 1 }
    }

    pub fn zero() -> Rational {
        Rational::int(0)
    }

    pub fn is_zero(self) -> bool {
        self.num == 0
    }

    pub fn add(self, other: Rational) -> Rational {
        Rational::new(
            self.num * other.den + other.num * self.den,
            self.den * other.den,
        )
    }

    pub fn mul(self, other: Rational) -> Rational {
        Rational::new(self.num * other.num, self.den * other.den)
    }

    pub fn neg(self) -> Rational {
        Rational {
            num: -self.num,
            den: self.den,
        }
    }
}

fn lcm(a: i64, b: i64) -> i64 {
    a / gcd(a, b).max(1) * b
}

fn binomial(n: u32, k: u32) -> i64 {
    let mut result: i64 = 1;
    for i in 0..k.min(n - k) {
        result = result * (n - i) as i64 / (i + 1) as i64;
    }
    result
}

/// Bernoulli numbers B_0..B_m (with B_1 = -1/2), by the standard
/// recurrence sum_{j<=m} C(m+1, j) B_j = 0.
fn bernoulli(m: u32) -> Vec<Rational> {
    let mut b = vec![Rational::int(1)];
    for i in 1..=m {
        let mut acc = Rational::zero();
        for (j, bj) in b.iter().enumerate() {
            acc = acc.add(bj.mul(Rational::int(binomial(i + 1, j as u32))));
        }
        b.push(acc.neg().mul(Rational::new(1, (i + 1) as i64)));
    }
    b
}

// =============================================================================
// Polynomials
// =============================================================================

/// A power product of variables. Variables stand for the ordinal (or
/// index-representation value) of the named binder.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Monomial(BTreeMap<Name, u32>);

impl Monomial {
    pub fn one() -> Monomial {
        Monomial(BTreeMap::new())
    }

    pub fn var(name: Name) -> Monomial {
        let mut m = BTreeMap::new();
        m.insert(name, 1);
        Monomial(m)
    }

    fn mul(&self, other: &Monomial) -> Monomial {
        let mut m = self.0.clone();
        for (v, p) in &other.0 {
            *m.entry(*v).or_insert(0) += p;
        }
        Monomial(m)
    }

    fn degree_of(&self, name: Name) -> u32 {
        self.0.get(&name).copied().unwrap_or(0)
    }

    fn without(&self, name: Name) -> Monomial {
        let mut m = self.0.clone();
        m.remove(&name);
        Monomial(m)
    }
}

/// A multivariate polynomial with rational coefficients.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Polynomial(BTreeMap<Monomial, Rational>);

impl Polynomial {
    pub fn zero() -> Polynomial {
        Polynomial(BTreeMap::new())
    }

    pub fn constant(c: Rational) -> Polynomial {
        let mut p = Polynomial::zero();
        p.add_term(Monomial::one(), c);
        p
    }

    pub fn int(n: i64) -> Polynomial {
        Polynomial::constant(Rational::int(n))
    }

    pub fn var(name: Name) -> Polynomial {
        let mut p = Polynomial::zero();
        p.add_term(Monomial::var(name), Rational::int(1));
        p
    }

    fn add_term(&mut self, m: Monomial, c: Rational) {
        if c.is_zero() {
            return;
        }
        let entry = self.0.entry(m.clone()).or_insert_with(Rational::zero);
        *entry = entry.add(c);
        if entry.is_zero() {
            self.0.remove(&m);
        }
    }

    pub fn add(&self, other: &Polynomial) -> Polynomial {
        let mut result = self.clone();
        for (m, c) in &other.0 {
            result.add_term(m.clone(), *c);
        }
        result
    }

    pub fn mul(&self, other: &Polynomial) -> Polynomial {
        let mut result = Polynomial::zero();
        for (m1, c1) in &self.0 {
            for (m2, c2) in &other.0 {
                result.add_term(m1.mul(m2), c1.mul(*c2));
            }
        }
        result
    }

    pub fn scale(&self, c: Rational) -> Polynomial {
        let mut result = Polynomial::zero();
        for (m, c0) in &self.0 {
            result.add_term(m.clone(), c0.mul(c));
        }
        result
    }

    pub fn mentions(&self, name: Name) -> bool {
        self.0.keys().any(|m| m.degree_of(name) > 0)
    }

    pub fn as_constant(&self) -> Option<Rational> {
        match self.0.len() {
            0 => Some(Rational::zero()),
            1 => self.0.get(&Monomial::one()).copied(),
            _ => None,
        }
    }

    /// Replace a variable by a polynomial.
    pub fn subst_var(&self, name: Name, value: &Polynomial) -> Polynomial {
        let mut result = Polynomial::zero();
        for (m, c) in &self.0 {
            let k = m.degree_of(name);
            let mut term = Polynomial::constant(*c);
            let mut base = Polynomial::zero();
            base.add_term(m.without(name), Rational::int(1));
            term = term.mul(&base);
            for _ in 0..k {
                term = term.mul(value);
            }
            result = result.add(&term);
        }
        result
    }

    /// Closed-form sum over one variable: the result, with `name` now
    /// standing for the exclusive upper bound `x`, equals
    /// `sum_{t=0}^{x-1} self[name := t]`.
    pub fn sum_over(&self, name: Name) -> Polynomial {
        let mut result = Polynomial::zero();
        for (m, c) in &self.0 {
            let k = m.degree_of(name);
            let rest = m.without(name);
            let mut rest_poly = Polynomial::zero();
            rest_poly.add_term(rest, *c);
            let summed = faulhaber(k, name);
            result = result.add(&rest_poly.mul(&summed));
        }
        result
    }
}

/// `sum_{t=0}^{x-1} t^k` as a polynomial in `x` (named `var`):
/// `1/(k+1) * sum_{j=0}^{k} C(k+1, j) B_j x^{k+1-j}`.
fn faulhaber(k: u32, var: Name) -> Polynomial {
    let b = bernoulli(k);
    let mut result = Polynomial::zero();
    for j in 0..=k {
        let coef = Rational::int(binomial(k + 1, j))
            .mul(b[j as usize])
            .mul(Rational::new(1, (k + 1) as i64));
        let mut m = BTreeMap::new();
        m.insert(var, k + 1 - j);
        result.add_term(Monomial(m), coef);
    }
    result
}

// =============================================================================
// Atom <-> polynomial conversion
// =============================================================================

/// Interpret a Nat-valued atom as a polynomial over variable ordinals.
pub fn nat_atom_poly(atom: &Atom) -> Result<Polynomial> {
    match atom {
        Atom::Con(Con::Newtype { inner, .. }) => rep_atom_poly(inner),
        Atom::Var(n) => Ok(Polynomial::var(*n)),
        Atom::ProjectElt(ps, n) if ps.len() == 1 && ps[0] == Projection::Unwrap => {
            Ok(Polynomial::var(*n))
        }
        other => Err(err_algebra!(
            "size atom is not polynomial: {:?}",
            other
        )),
    }
}

fn rep_atom_poly(atom: &Atom) -> Result<Polynomial> {
    match atom {
        Atom::Lit(LitVal::U32(n)) => Ok(Polynomial::int(*n as i64)),
        Atom::Var(n) => Ok(Polynomial::var(*n)),
        Atom::ProjectElt(ps, n) if ps.len() == 1 && ps[0] == Projection::Unwrap => {
            Ok(Polynomial::var(*n))
        }
        // Sizes that were already evaluated to Imp scalars.
        Atom::ImpVar(n, _) => Ok(Polynomial::var(*n)),
        other => Err(err_algebra!(
            "index expression is not polynomial: {:?}",
            other
        )),
    }
}

/// The size polynomial of an index type.
pub fn size_poly(ix: &IxType) -> Result<Polynomial> {
    match &ix.dict {
        IxDict::Fin(n) => nat_atom_poly(n),
        IxDict::Custom { size, .. } => nat_atom_poly(size),
    }
}

/// Emit a polynomial as index-representation arithmetic. `vals` binds
/// polynomial variables to their ordinal atoms; unbound variables are
/// resolved from the builder scope (Nat- and Fin-typed variables are
/// unwrapped to their representation).
pub fn emit_poly(
    b: &mut Builder,
    poly: &Polynomial,
    vals: &HashMap<Name, Atom>,
) -> Result<Atom> {
    if poly.0.is_empty() {
        return Ok(Atom::idx_lit(0));
    }
    let denom = poly.0.values().fold(1i64, |acc, c| lcm(acc, c.den));

    let mut pos: Option<Atom> = None;
    let mut neg: Option<Atom> = None;
    for (m, c) in &poly.0 {
        let scaled = c.num * (denom / c.den);
        let magnitude = scaled.unsigned_abs();
        let coef: u32 = magnitude
            .try_into()
            .map_err(|_| err_algebra!("polynomial coefficient overflows index type"))?;
        let mut term = Atom::idx_lit(coef);
        for (var, pow) in &m.0 {
            let val = resolve_poly_var(b, *var, vals)?;
            for _ in 0..*pow {
                term = b.imul(term, val.clone())?;
            }
        }
        let slot = if scaled < 0 { &mut neg } else { &mut pos };
        *slot = Some(match slot.take() {
            None => term,
            Some(acc) => b.iadd(acc, term)?,
        });
    }
    let mut total = match (pos, neg) {
        (Some(p), Some(n)) => b.isub(p, n)?,
        (Some(p), None) => p,
        (None, Some(_)) => {
            return Err(err_algebra!("polynomial is everywhere negative"))
        }
        (None, None) => Atom::idx_lit(0),
    };
    if denom != 1 {
        let d: u32 = denom
            .try_into()
            .map_err(|_| err_algebra!("polynomial denominator overflows index type"))?;
        total = b.idiv(total, Atom::idx_lit(d))?;
    }
    Ok(total)
}

fn resolve_poly_var(b: &Builder, var: Name, vals: &HashMap<Name, Atom>) -> Result<Atom> {
    if let Some(atom) = vals.get(&var) {
        return Ok(atom.clone());
    }
    if var.color == crate::name::NameColor::Imp {
        return Ok(Atom::ImpVar(var, crate::imp::IType::idx_rep()));
    }
    match b.type_of(&Atom::Var(var))? {
        SType::Nat | SType::Fin(_) => Ok(Atom::Var(var).proj(Projection::Unwrap)),
        SType::Base(BaseType::Scalar(s)) if s == IDX_REP => Ok(Atom::Var(var)),
        other => Err(err_algebra!(
            "polynomial variable {} has non-index type {:?}",
            var,
            other
        )),
    }
}

// =============================================================================
// Index structures
// =============================================================================

/// One telescope entry: the binder and its index type.
#[derive(Debug, Clone, PartialEq)]
pub struct IxBinder {
    pub binder: Binder,
    pub ix: IxType,
}

pub type IndexStructure = Vec<IxBinder>;

/// Partition a telescope into a prefix whose binders nothing later
/// depends on, and the dependent remainder.
pub fn index_structure_split(idxs: &[IxBinder]) -> (Vec<IxBinder>, Vec<IxBinder>) {
    let mut boundary = 0;
    'peel: for i in 0..idxs.len() {
        let name = idxs[i].binder.name;
        for later in &idxs[i + 1..] {
            if free_vars_ix(&later.ix).contains(&name) {
                break 'peel;
            }
        }
        boundary = i + 1;
    }
    (idxs[..boundary].to_vec(), idxs[boundary..].to_vec())
}

/// The number of elements of an index set, as an index-rep atom.
pub fn ix_size_atom(ix: &IxType) -> Result<Atom> {
    let size_atom = match &ix.dict {
        IxDict::Fin(n) => n.clone(),
        IxDict::Custom { size, .. } => (**size).clone(),
    };
    nat_to_rep(&size_atom)
}

fn nat_to_rep(atom: &Atom) -> Result<Atom> {
    match atom {
        Atom::Con(Con::Newtype { inner, .. }) => Ok((**inner).clone()),
        Atom::Var(_) | Atom::ProjectElt(_, _) => Ok(atom.proj(Projection::Unwrap)),
        other => Err(err_algebra!("size is not a Nat value: {:?}", other)),
    }
}

/// The ordinal of an index value, as an index-rep atom.
pub fn emit_ordinal(b: &mut Builder, ix: &IxType, idx: &Atom) -> Result<Atom> {
    match &ix.dict {
        IxDict::Fin(_) => nat_to_rep(idx),
        IxDict::Custom { ordinal, .. } => {
            b.emit(SExpr::App((**ordinal).clone(), vec![idx.clone()]))
        }
    }
}

/// Total number of elements addressed by the telescope.
pub fn elem_count(b: &mut Builder, idxs: &[IxBinder]) -> Result<Atom> {
    if idxs.is_empty() {
        return Ok(Atom::idx_lit(1));
    }
    let (prefix, suffix) = index_structure_split(idxs);
    let mut total = Atom::idx_lit(1);
    for ixb in &prefix {
        let size = ix_size_atom(&ixb.ix)?;
        total = b.imul(total, size)?;
    }
    if !suffix.is_empty() {
        let dep = elem_count_dep(b, &suffix)?;
        total = b.imul(total, dep)?;
    }
    Ok(total)
}

fn elem_count_dep(b: &mut Builder, suffix: &[IxBinder]) -> Result<Atom> {
    let first = &suffix[0];
    let rest_poly = elem_count_poly(&suffix[1..])?;
    let summed = rest_poly.sum_over(first.binder.name);
    let bound = ix_size_atom(&first.ix)?;
    let mut vals = HashMap::new();
    vals.insert(first.binder.name, bound);
    emit_poly(b, &summed, &vals)
}

/// The element count of a telescope as a polynomial over the ordinals
/// of its free variables.
pub fn elem_count_poly(idxs: &[IxBinder]) -> Result<Polynomial> {
    if idxs.is_empty() {
        return Ok(Polynomial::int(1));
    }
    let first = &idxs[0];
    let rest = elem_count_poly(&idxs[1..])?;
    let size = size_poly(&first.ix)?;
    if rest.mentions(first.binder.name) {
        Ok(rest
            .sum_over(first.binder.name)
            .subst_var(first.binder.name, &size))
    } else {
        Ok(size.mul(&rest))
    }
}

/// Linear offset of a multi-index into the telescope's flat layout.
///
/// Non-dependent prefix dimensions iterate outermost-first (row-major),
/// emitted in Horner form so the first dimension's size is never
/// computed. The dependent suffix accumulates closed-form partial sums
/// of the remaining telescope's element count.
pub fn compute_offset(b: &mut Builder, idxs: &[IxBinder], indices: &[Atom]) -> Result<Atom> {
    debug_assert_eq!(idxs.len(), indices.len());
    if idxs.is_empty() {
        return Ok(Atom::idx_lit(0));
    }
    let (prefix, suffix) = index_structure_split(idxs);
    let (prefix_indices, suffix_indices) = indices.split_at(prefix.len());

    let mut acc: Option<Atom> = None;
    for (ixb, idx) in prefix.iter().zip(prefix_indices) {
        let ord = emit_ordinal(b, &ixb.ix, idx)?;
        acc = Some(match acc {
            None => ord,
            Some(prev) => {
                let size = ix_size_atom(&ixb.ix)?;
                let scaled = b.imul(prev, size)?;
                b.iadd(scaled, ord)?
            }
        });
    }

    if suffix.is_empty() {
        return Ok(acc.unwrap_or_else(|| Atom::idx_lit(0)));
    }

    let mut total = match acc {
        None => Atom::idx_lit(0),
        Some(prev) => {
            let suffix_count = elem_count(b, &suffix)?;
            b.imul(prev, suffix_count)?
        }
    };

    let mut cur: Vec<IxBinder> = suffix;
    let mut cur_indices: Vec<Atom> = suffix_indices.to_vec();
    while !cur.is_empty() {
        let first = cur.remove(0);
        let idx = cur_indices.remove(0);
        let ord = emit_ordinal(b, &first.ix, &idx)?;

        let rest_poly = elem_count_poly(&cur)?;
        let summed = rest_poly.sum_over(first.binder.name);
        let mut vals = HashMap::new();
        vals.insert(first.binder.name, ord);
        let part = emit_poly(b, &summed, &vals)?;
        total = b.iadd(total, part)?;

        // Later annotations may mention this binder; pin it to the
        // concrete index before continuing.
        let mut map = HashMap::new();
        map.insert(first.binder.name, idx);
        for ixb in &mut cur {
            ixb.ix = subst_ix(&map, &ixb.ix);
        }
    }
    Ok(total)
}
