//! Type and effect queries over the IR.
//!
//! Post-simplification terms carry enough annotations that these are
//! lookups and structural recursions, not inference.

use super::fold::subst_type;
use super::*;
use crate::err_internal;
use crate::error::Result;
use crate::name::Name;
use std::collections::HashMap;

/// Maps in-scope names to their types.
#[derive(Debug, Clone, Default)]
pub struct TypeEnv {
    map: HashMap<Name, SType>,
}

impl TypeEnv {
    pub fn new() -> Self {
        TypeEnv {
            map: HashMap::new(),
        }
    }

    pub fn insert(&mut self, name: Name, ty: SType) {
        self.map.insert(name, ty);
    }

    pub fn remove(&mut self, name: Name) {
        self.map.remove(&name);
    }

    pub fn get(&self, name: Name) -> Result<&SType> {
        self.map
            .get(&name)
            .ok_or_else(|| err_internal!("unbound-name", "no type for {} in scope", name))
    }

    pub fn contains(&self, name: Name) -> bool {
        self.map.contains_key(&name)
    }

    /// A copy of this environment extended with the given binders.
    pub fn extended(&self, binders: &[Binder]) -> TypeEnv {
        let mut env = self.clone();
        for b in binders {
            env.insert(b.name, b.ty.clone());
        }
        env
    }
}

// =============================================================================
// Representation types
// =============================================================================

/// The representation type a newtype-like wrapper stores.
pub fn rep_ty(ty: &SType) -> Result<SType> {
    match ty {
        SType::Nat => Ok(SType::idx_rep()),
        SType::Fin(_) => Ok(SType::idx_rep()),
        SType::TypeCon { rep, .. } => Ok((**rep).clone()),
        SType::Record(fields) => Ok(SType::Prod(fields.iter().map(|(_, t)| t.clone()).collect())),
        SType::Variant(cases) => Ok(SType::Sum(cases.iter().map(|(_, t)| t.clone()).collect())),
        other => Err(err_internal!(
            "not-a-newtype",
            "no representation type for {:?}",
            other
        )),
    }
}

/// Is this type a newtype-like wrapper over a representation type?
pub fn is_newtype(ty: &SType) -> bool {
    matches!(
        ty,
        SType::Nat | SType::Fin(_) | SType::TypeCon { .. } | SType::Record(_) | SType::Variant(_)
    )
}

/// The scalar base type of a scalar-typed value.
pub fn scalar_base_ty(ty: &SType) -> Result<ScalarBaseType> {
    match ty {
        SType::Base(BaseType::Scalar(s)) => Ok(*s),
        other => Err(err_internal!("not-scalar", "expected scalar type, got {:?}", other)),
    }
}

// =============================================================================
// Singletons
// =============================================================================

/// If the type has exactly one inhabitant, build it. Such results carry
/// no information, so loop lowering skips allocating for them.
pub fn singleton_atom(ty: &SType) -> Option<Atom> {
    match ty {
        SType::Prod(tys) => {
            let elems: Option<Vec<Atom>> = tys.iter().map(singleton_atom).collect();
            elems.map(Atom::prod)
        }
        SType::TypeCon { .. } | SType::Record(_) => {
            let rep = rep_ty(ty).ok()?;
            singleton_atom(&rep).map(|inner| Atom::newtype(ty.clone(), inner))
        }
        SType::Tab(tab) => {
            let elem = singleton_atom(&tab.body)?;
            Some(Atom::TabLam(Box::new(TabLam {
                binder: tab.binder.clone(),
                ix: tab.ix.clone(),
                body: Block::from_atom(elem),
            })))
        }
        _ => None,
    }
}

// =============================================================================
// Type-of
// =============================================================================

/// Result type of a block, given the environment outside it.
pub fn block_ty(env: &TypeEnv, block: &Block) -> Result<SType> {
    match &block.ann {
        Some(ann) => Ok(ann.ty.clone()),
        None => type_of_atom(env, &block.result),
    }
}

pub fn type_of_atom(env: &TypeEnv, atom: &Atom) -> Result<SType> {
    match atom {
        Atom::Var(n) => env.get(*n).cloned(),
        Atom::Lit(v) => Ok(SType::scalar(v.base_ty())),
        Atom::Con(con) => type_of_con(env, con),
        Atom::Lam(lam) => {
            let inner = env.extended(&lam.binders);
            let result = block_ty(&inner, &lam.body)?;
            Ok(SType::Pi(Box::new(PiType {
                binders: lam.binders.clone(),
                effs: lam.effs.clone(),
                result,
            })))
        }
        Atom::TabLam(lam) => {
            let inner = env.extended(std::slice::from_ref(&lam.binder));
            let body = block_ty(&inner, &lam.body)?;
            Ok(SType::tab(lam.binder.clone(), lam.ix.clone(), body))
        }
        Atom::DepPair(_, _, ty) => Ok(SType::DepPair(ty.clone())),
        Atom::ProjectElt(ps, n) => {
            let mut cur_atom = Atom::Var(*n);
            let mut cur_ty = env.get(*n).cloned()?;
            for p in ps {
                cur_ty = project_ty(&cur_ty, &cur_atom, *p)?;
                cur_atom = cur_atom.proj(*p);
            }
            Ok(cur_ty)
        }
        Atom::ACase(_, _, ty) => Ok(ty.clone()),
        Atom::DestRef(d) => Ok(SType::ref_to(d.value_ty())),
        Atom::ImpVar(_, ity) => Ok(SType::Base(ity.to_base_ty())),
    }
}

fn type_of_con(env: &TypeEnv, con: &Con) -> Result<SType> {
    match con {
        Con::ProdCon(xs) => {
            let tys: Result<Vec<SType>> = xs.iter().map(|x| type_of_atom(env, x)).collect();
            Ok(SType::Prod(tys?))
        }
        Con::SumCon { tys, .. } => Ok(SType::Sum(tys.clone())),
        Con::SumAsProd { tys, .. } => Ok(SType::Sum(tys.clone())),
        Con::Newtype { ty, .. } => Ok(ty.clone()),
    }
}

/// The type of one projection step out of a value of the given type.
/// The base atom is needed to instantiate dependent-pair components.
fn project_ty(ty: &SType, base: &Atom, p: Projection) -> Result<SType> {
    match (p, ty) {
        (Projection::Prod(i), SType::Prod(tys)) => tys
            .get(i)
            .cloned()
            .ok_or_else(|| err_internal!("bad-proj", "product has no component {}", i)),
        (Projection::Prod(0), SType::DepPair(dp)) => Ok(dp.lhs.clone()),
        (Projection::Prod(1), SType::DepPair(dp)) => {
            let left = base.proj(Projection::Prod(0));
            Ok(subst_one_atom_ty(dp.binder.name, &left, &dp.rhs))
        }
        (Projection::Unwrap, wrapper) if is_newtype(wrapper) => rep_ty(wrapper),
        (p, other) => Err(err_internal!(
            "bad-proj",
            "cannot apply {:?} to a value of type {:?}",
            p,
            other
        )),
    }
}

fn subst_one_atom_ty(name: Name, value: &Atom, ty: &SType) -> SType {
    let mut map = HashMap::new();
    map.insert(name, value.clone());
    subst_type(&map, ty)
}

pub fn type_of_expr(env: &TypeEnv, expr: &SExpr) -> Result<SType> {
    match expr {
        SExpr::Atom(a) => type_of_atom(env, a),
        SExpr::App(callee, args) => {
            let callee_ty = type_of_atom(env, callee)?;
            match callee_ty {
                SType::Pi(pi) => {
                    if pi.binders.len() != args.len() {
                        return Err(err_internal!(
                            "arity",
                            "applied {} args to {}-ary function",
                            args.len(),
                            pi.binders.len()
                        ));
                    }
                    let mut map = HashMap::new();
                    for (b, a) in pi.binders.iter().zip(args) {
                        map.insert(b.name, a.clone());
                    }
                    Ok(subst_type(&map, &pi.result))
                }
                other => Err(err_internal!("not-a-function", "applied {:?}", other)),
            }
        }
        SExpr::TabApp(callee, idxs) => {
            let mut ty = type_of_atom(env, callee)?;
            for idx in idxs {
                ty = match ty {
                    SType::Tab(tab) => subst_one_atom_ty(tab.binder.name, idx, &tab.body),
                    other => {
                        return Err(err_internal!("not-a-table", "indexed into {:?}", other))
                    }
                };
            }
            Ok(ty)
        }
        SExpr::Case(case) => Ok(case.ty.clone()),
        SExpr::Op(op) => op_result_ty(env, op),
        SExpr::Hof(hof) => hof_result_ty(env, hof),
    }
}

fn ref_inner(ty: SType) -> Result<SType> {
    match ty {
        SType::Ref(inner) => Ok(*inner),
        other => Err(err_internal!("not-a-ref", "expected reference type, got {:?}", other)),
    }
}

pub fn op_result_ty(env: &TypeEnv, op: &PrimOp) -> Result<SType> {
    match op {
        PrimOp::BinOp(k, a, _) => {
            if k.is_cmp() {
                Ok(SType::scalar(ScalarBaseType::U8))
            } else {
                type_of_atom(env, a)
            }
        }
        PrimOp::UnOp(_, a) => type_of_atom(env, a),
        PrimOp::Select(_, t, _) => type_of_atom(env, t),
        PrimOp::CastOp(ty, _) => Ok(ty.clone()),
        PrimOp::IxSize(_) | PrimOp::Ordinal(_, _) => Ok(SType::idx_rep()),
        PrimOp::UnsafeFromOrdinal(ix, _) => Ok(ix.elem_ty.clone()),
        PrimOp::TabCon(ty, _) => Ok(ty.clone()),
        PrimOp::RefOp(r, op) => match op {
            RefOp::Ask | RefOp::Get => ref_inner(type_of_atom(env, r)?),
            RefOp::Put(_) | RefOp::Extend(_, _) => Ok(SType::unit()),
        },
        PrimOp::AllocDest(ty) => Ok(SType::ref_to(ty.clone())),
        PrimOp::Place(_, _) => Ok(SType::unit()),
        PrimOp::Freeze(r) => ref_inner(type_of_atom(env, r)?),
        PrimOp::IndexRef(r, i) => {
            let tab_ty = ref_inner(type_of_atom(env, r)?)?;
            match tab_ty {
                SType::Tab(tab) => Ok(SType::ref_to(subst_one_atom_ty(
                    tab.binder.name,
                    i,
                    &tab.body,
                ))),
                other => Err(err_internal!("not-a-table-ref", "indexed ref to {:?}", other)),
            }
        }
        PrimOp::ProjRef(p, r) => {
            let inner = ref_inner(type_of_atom(env, r)?)?;
            match (p, &inner) {
                (Projection::Prod(i), SType::Prod(tys)) => Ok(SType::ref_to(tys[*i].clone())),
                (Projection::Unwrap, wrapper) if is_newtype(wrapper) => {
                    Ok(SType::ref_to(rep_ty(wrapper)?))
                }
                (p, other) => Err(err_internal!(
                    "bad-proj-ref",
                    "cannot project {:?} out of a reference to {:?}",
                    p,
                    other
                )),
            }
        }
        PrimOp::PtrOffset(p, _) => type_of_atom(env, p),
        PrimOp::PtrLoad(p) => match type_of_atom(env, p)? {
            SType::Base(BaseType::Ptr(ptr)) => Ok(SType::Base(ptr.pointee.clone())),
            other => Err(err_internal!("not-a-ptr", "loaded from {:?}", other)),
        },
        PrimOp::VectorSubref(_, _, ty) => Ok(SType::ref_to(ty.clone())),
        PrimOp::VectorBroadcast(_, ty) | PrimOp::VectorIota(ty) => Ok(ty.clone()),
        PrimOp::ThrowError(ty) => Ok(ty.clone()),
        PrimOp::RecordCons(fields) => {
            let tys: Result<Vec<(String, SType)>> = fields
                .iter()
                .map(|(k, a)| Ok((k.clone(), type_of_atom(env, a)?)))
                .collect();
            Ok(SType::Record(tys?))
        }
        PrimOp::VariantCon { tys, .. } => Ok(SType::Variant(tys.clone())),
    }
}

fn hof_result_ty(env: &TypeEnv, hof: &Hof) -> Result<SType> {
    match hof {
        Hof::For(fe) => {
            let binder = fe.lam.binders[0].clone();
            let inner = env.extended(&fe.lam.binders);
            let body_ty = block_ty(&inner, &fe.lam.body)?;
            Ok(SType::tab(binder, fe.ix.clone(), body_ty))
        }
        Hof::Seq(se) => type_of_atom(env, &se.carry),
        Hof::While(_) => Ok(SType::unit()),
        Hof::RunReader(_, lam) => {
            let inner = env.extended(&lam.binders);
            block_ty(&inner, &lam.body)
        }
        Hof::RunWriter(dest, monoid, lam) => {
            let inner = env.extended(&lam.binders);
            let ans = block_ty(&inner, &lam.body)?;
            match dest {
                Some(_) => Ok(ans),
                None => {
                    let accum = type_of_atom(env, &monoid.empty)?;
                    Ok(SType::Prod(vec![ans, accum]))
                }
            }
        }
        Hof::RunState(dest, init, lam) => {
            let inner = env.extended(&lam.binders);
            let ans = block_ty(&inner, &lam.body)?;
            match dest {
                Some(_) => Ok(ans),
                None => {
                    let state = type_of_atom(env, init)?;
                    Ok(SType::Prod(vec![ans, state]))
                }
            }
        }
        Hof::RunIO(body) | Hof::RunInit(body) => block_ty(env, body),
        Hof::RememberDest(d, _) => type_of_atom(env, d),
    }
}

// =============================================================================
// Effects
// =============================================================================

/// Effects an expression may perform, judged structurally.
pub fn expr_effects(expr: &SExpr) -> EffectRow {
    match expr {
        SExpr::Atom(_) => EffectRow::pure(),
        SExpr::App(callee, _) => match callee {
            Atom::Lam(lam) => lam.effs.clone(),
            _ => EffectRow::pure(),
        },
        SExpr::TabApp(_, _) => EffectRow::pure(),
        SExpr::Case(case) => case.effs.clone(),
        SExpr::Op(op) => op_effects(op),
        SExpr::Hof(hof) => hof_effects(hof),
    }
}

fn op_effects(op: &PrimOp) -> EffectRow {
    match op {
        PrimOp::Place(_, _) | PrimOp::AllocDest(_) => EffectRow::single(Effect::Init),
        PrimOp::RefOp(r, ref_op) => {
            let region = match r {
                Atom::Var(n) => *n,
                Atom::ProjectElt(_, n) => *n,
                _ => return EffectRow::single(Effect::Init),
            };
            let kind = match ref_op {
                RefOp::Ask => RWSKind::Reader,
                RefOp::Get | RefOp::Put(_) => RWSKind::State,
                RefOp::Extend(_, _) => RWSKind::Writer,
            };
            EffectRow::single(Effect::Rws(kind, region))
        }
        _ => EffectRow::pure(),
    }
}

fn hof_effects(hof: &Hof) -> EffectRow {
    match hof {
        Hof::For(fe) => fe.lam.effs.clone(),
        Hof::Seq(se) => se.lam.effs.clone(),
        Hof::While(body) => block_effects(body),
        Hof::RunReader(_, lam) | Hof::RunWriter(_, _, lam) | Hof::RunState(_, _, lam) => {
            // The region introduced by the handler is discharged here.
            let mut effs = lam.effs.clone();
            if let Some(ref_binder) = lam.binders.get(1) {
                let region = ref_binder.name;
                effs = EffectRow(
                    effs.0
                        .into_iter()
                        .filter(|e| !matches!(e, Effect::Rws(_, n) if *n == region))
                        .collect(),
                );
            }
            effs
        }
        Hof::RunIO(body) => {
            let mut effs = block_effects(body);
            effs.remove(Effect::Io);
            effs
        }
        Hof::RunInit(body) => {
            let mut effs = block_effects(body);
            effs.remove(Effect::Init);
            effs
        }
        Hof::RememberDest(_, lam) => lam.effs.clone(),
    }
}

/// Effects of a block: the annotation when present, otherwise the union
/// over its decls.
pub fn block_effects(block: &Block) -> EffectRow {
    if let Some(ann) = &block.ann {
        return ann.effs.clone();
    }
    block
        .decls
        .iter()
        .fold(EffectRow::pure(), |acc, d| acc.union(&expr_effects(&d.expr)))
}
