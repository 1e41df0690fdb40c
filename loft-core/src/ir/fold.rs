//! Rebuild-style traversal over the IR.
//!
//! One trait with a hook per node kind and walk functions providing the
//! default recurse-then-rebuild behavior. Substitution and the
//! vectorizer build on this; read-only analyses (free variables) use
//! direct recursions below.

use super::*;
use crate::name::Name;
use std::collections::{BTreeSet, HashMap, HashSet};

// =============================================================================
// Folder
// =============================================================================

pub trait IrFolder: Sized {
    /// Rewrite a variable occurrence. Projections around it are
    /// re-applied structurally by the walker.
    fn fold_name(&mut self, name: Name) -> Atom {
        Atom::Var(name)
    }

    fn fold_atom(&mut self, atom: &Atom) -> Atom {
        walk_atom(self, atom)
    }

    fn fold_expr(&mut self, expr: &SExpr) -> SExpr {
        walk_expr(self, expr)
    }

    fn fold_block(&mut self, block: &Block) -> Block {
        walk_block(self, block)
    }

    fn fold_type(&mut self, ty: &SType) -> SType {
        walk_type(self, ty)
    }

    fn fold_dest(&mut self, dest: &Dest) -> Dest {
        walk_dest(self, dest)
    }

    fn fold_binder(&mut self, binder: &Binder) -> Binder {
        Binder {
            name: binder.name,
            ty: self.fold_type(&binder.ty),
        }
    }

    fn fold_ix(&mut self, ix: &IxType) -> IxType {
        IxType {
            elem_ty: self.fold_type(&ix.elem_ty),
            dict: match &ix.dict {
                IxDict::Fin(n) => IxDict::Fin(self.fold_atom(n)),
                IxDict::Custom {
                    size,
                    ordinal,
                    unsafe_from_ordinal,
                } => IxDict::Custom {
                    size: Box::new(self.fold_atom(size)),
                    ordinal: Box::new(self.fold_atom(ordinal)),
                    unsafe_from_ordinal: Box::new(self.fold_atom(unsafe_from_ordinal)),
                },
            },
        }
    }

    fn fold_lam(&mut self, lam: &Lam) -> Lam {
        Lam {
            binders: lam.binders.iter().map(|b| self.fold_binder(b)).collect(),
            effs: lam.effs.clone(),
            body: self.fold_block(&lam.body),
        }
    }

    fn fold_tab_lam(&mut self, lam: &TabLam) -> TabLam {
        TabLam {
            binder: self.fold_binder(&lam.binder),
            ix: self.fold_ix(&lam.ix),
            body: self.fold_block(&lam.body),
        }
    }
}

pub fn walk_atom<F: IrFolder>(f: &mut F, atom: &Atom) -> Atom {
    match atom {
        Atom::Var(n) => f.fold_name(*n),
        Atom::Lit(v) => Atom::Lit(*v),
        Atom::Con(con) => Atom::Con(walk_con(f, con)),
        Atom::Lam(lam) => Atom::Lam(Box::new(f.fold_lam(lam))),
        Atom::TabLam(lam) => Atom::TabLam(Box::new(f.fold_tab_lam(lam))),
        Atom::DepPair(l, r, ty) => Atom::DepPair(
            Box::new(f.fold_atom(l)),
            Box::new(f.fold_atom(r)),
            Box::new(walk_dep_pair_ty(f, ty)),
        ),
        Atom::ProjectElt(ps, n) => {
            let base = f.fold_name(*n);
            ps.iter().fold(base, |a, p| a.proj(*p))
        }
        Atom::ACase(scrut, alts, ty) => Atom::ACase(
            Box::new(f.fold_atom(scrut)),
            alts.iter()
                .map(|alt| AtomAlt {
                    binder: f.fold_binder(&alt.binder),
                    body: f.fold_atom(&alt.body),
                })
                .collect(),
            f.fold_type(ty),
        ),
        Atom::DestRef(d) => Atom::DestRef(Box::new(f.fold_dest(d))),
        Atom::ImpVar(n, ty) => Atom::ImpVar(*n, ty.clone()),
    }
}

pub fn walk_con<F: IrFolder>(f: &mut F, con: &Con) -> Con {
    match con {
        Con::ProdCon(xs) => Con::ProdCon(xs.iter().map(|x| f.fold_atom(x)).collect()),
        Con::SumCon { tys, tag, payload } => Con::SumCon {
            tys: tys.iter().map(|t| f.fold_type(t)).collect(),
            tag: *tag,
            payload: Box::new(f.fold_atom(payload)),
        },
        Con::SumAsProd { tys, tag, payloads } => Con::SumAsProd {
            tys: tys.iter().map(|t| f.fold_type(t)).collect(),
            tag: Box::new(f.fold_atom(tag)),
            payloads: payloads.iter().map(|p| f.fold_atom(p)).collect(),
        },
        Con::Newtype { ty, inner } => Con::Newtype {
            ty: f.fold_type(ty),
            inner: Box::new(f.fold_atom(inner)),
        },
    }
}

fn walk_dep_pair_ty<F: IrFolder>(f: &mut F, ty: &DepPairType) -> DepPairType {
    DepPairType {
        binder: f.fold_binder(&ty.binder),
        lhs: f.fold_type(&ty.lhs),
        rhs: f.fold_type(&ty.rhs),
    }
}

pub fn walk_type<F: IrFolder>(f: &mut F, ty: &SType) -> SType {
    match ty {
        SType::Base(b) => SType::Base(b.clone()),
        SType::Nat => SType::Nat,
        SType::Fin(n) => SType::Fin(Box::new(f.fold_atom(n))),
        SType::Prod(ts) => SType::Prod(ts.iter().map(|t| f.fold_type(t)).collect()),
        SType::Sum(ts) => SType::Sum(ts.iter().map(|t| f.fold_type(t)).collect()),
        SType::Tab(tab) => SType::Tab(Box::new(TabType {
            binder: f.fold_binder(&tab.binder),
            ix: f.fold_ix(&tab.ix),
            body: f.fold_type(&tab.body),
        })),
        SType::DepPair(dp) => SType::DepPair(Box::new(walk_dep_pair_ty(f, dp))),
        SType::Pi(pi) => SType::Pi(Box::new(PiType {
            binders: pi.binders.iter().map(|b| f.fold_binder(b)).collect(),
            effs: pi.effs.clone(),
            result: f.fold_type(&pi.result),
        })),
        SType::TypeCon { name, rep } => SType::TypeCon {
            name: name.clone(),
            rep: Box::new(f.fold_type(rep)),
        },
        SType::Record(fields) => SType::Record(
            fields
                .iter()
                .map(|(k, t)| (k.clone(), f.fold_type(t)))
                .collect(),
        ),
        SType::Variant(cases) => SType::Variant(
            cases
                .iter()
                .map(|(k, t)| (k.clone(), f.fold_type(t)))
                .collect(),
        ),
        SType::Ref(t) => SType::Ref(Box::new(f.fold_type(t))),
    }
}

pub fn walk_expr<F: IrFolder>(f: &mut F, expr: &SExpr) -> SExpr {
    match expr {
        SExpr::Atom(a) => SExpr::Atom(f.fold_atom(a)),
        SExpr::App(callee, args) => SExpr::App(
            f.fold_atom(callee),
            args.iter().map(|a| f.fold_atom(a)).collect(),
        ),
        SExpr::TabApp(callee, args) => SExpr::TabApp(
            f.fold_atom(callee),
            args.iter().map(|a| f.fold_atom(a)).collect(),
        ),
        SExpr::Case(case) => SExpr::Case(Box::new(CaseExpr {
            scrut: f.fold_atom(&case.scrut),
            alts: case
                .alts
                .iter()
                .map(|alt| Alt {
                    binder: f.fold_binder(&alt.binder),
                    body: f.fold_block(&alt.body),
                })
                .collect(),
            ty: f.fold_type(&case.ty),
            effs: case.effs.clone(),
        })),
        SExpr::Op(op) => SExpr::Op(walk_op(f, op)),
        SExpr::Hof(hof) => SExpr::Hof(walk_hof(f, hof)),
    }
}

pub fn walk_op<F: IrFolder>(f: &mut F, op: &PrimOp) -> PrimOp {
    match op {
        PrimOp::BinOp(k, a, b) => PrimOp::BinOp(*k, f.fold_atom(a), f.fold_atom(b)),
        PrimOp::UnOp(k, a) => PrimOp::UnOp(*k, f.fold_atom(a)),
        PrimOp::Select(c, t, e) => {
            PrimOp::Select(f.fold_atom(c), f.fold_atom(t), f.fold_atom(e))
        }
        PrimOp::CastOp(ty, a) => PrimOp::CastOp(f.fold_type(ty), f.fold_atom(a)),
        PrimOp::IxSize(ix) => PrimOp::IxSize(f.fold_ix(ix)),
        PrimOp::Ordinal(ix, a) => PrimOp::Ordinal(f.fold_ix(ix), f.fold_atom(a)),
        PrimOp::UnsafeFromOrdinal(ix, a) => {
            PrimOp::UnsafeFromOrdinal(f.fold_ix(ix), f.fold_atom(a))
        }
        PrimOp::TabCon(ty, elems) => PrimOp::TabCon(
            f.fold_type(ty),
            elems.iter().map(|e| f.fold_atom(e)).collect(),
        ),
        PrimOp::RefOp(r, op) => PrimOp::RefOp(
            f.fold_atom(r),
            match op {
                RefOp::Ask => RefOp::Ask,
                RefOp::Get => RefOp::Get,
                RefOp::Put(v) => RefOp::Put(f.fold_atom(v)),
                RefOp::Extend(combine, v) => {
                    RefOp::Extend(Box::new(f.fold_lam(combine)), f.fold_atom(v))
                }
            },
        ),
        PrimOp::AllocDest(ty) => PrimOp::AllocDest(f.fold_type(ty)),
        PrimOp::Place(r, v) => PrimOp::Place(f.fold_atom(r), f.fold_atom(v)),
        PrimOp::Freeze(r) => PrimOp::Freeze(f.fold_atom(r)),
        PrimOp::IndexRef(r, i) => PrimOp::IndexRef(f.fold_atom(r), f.fold_atom(i)),
        PrimOp::ProjRef(p, r) => PrimOp::ProjRef(*p, f.fold_atom(r)),
        PrimOp::PtrOffset(p, o) => PrimOp::PtrOffset(f.fold_atom(p), f.fold_atom(o)),
        PrimOp::PtrLoad(p) => PrimOp::PtrLoad(f.fold_atom(p)),
        PrimOp::VectorSubref(r, i, ty) => {
            PrimOp::VectorSubref(f.fold_atom(r), f.fold_atom(i), f.fold_type(ty))
        }
        PrimOp::VectorBroadcast(a, ty) => {
            PrimOp::VectorBroadcast(f.fold_atom(a), f.fold_type(ty))
        }
        PrimOp::VectorIota(ty) => PrimOp::VectorIota(f.fold_type(ty)),
        PrimOp::ThrowError(ty) => PrimOp::ThrowError(f.fold_type(ty)),
        PrimOp::RecordCons(fields) => PrimOp::RecordCons(
            fields
                .iter()
                .map(|(k, a)| (k.clone(), f.fold_atom(a)))
                .collect(),
        ),
        PrimOp::VariantCon { tys, label, payload } => PrimOp::VariantCon {
            tys: tys
                .iter()
                .map(|(k, t)| (k.clone(), f.fold_type(t)))
                .collect(),
            label: label.clone(),
            payload: Box::new(f.fold_atom(payload)),
        },
    }
}

pub fn walk_hof<F: IrFolder>(f: &mut F, hof: &Hof) -> Hof {
    match hof {
        Hof::For(fe) => Hof::For(Box::new(ForExpr {
            dir: fe.dir,
            ix: f.fold_ix(&fe.ix),
            lam: f.fold_lam(&fe.lam),
        })),
        Hof::Seq(se) => Hof::Seq(Box::new(SeqExpr {
            dir: se.dir,
            ix: f.fold_ix(&se.ix),
            carry: f.fold_atom(&se.carry),
            lam: f.fold_lam(&se.lam),
        })),
        Hof::While(body) => Hof::While(Box::new(f.fold_block(body))),
        Hof::RunReader(init, lam) => {
            Hof::RunReader(f.fold_atom(init), Box::new(f.fold_lam(lam)))
        }
        Hof::RunWriter(dest, monoid, lam) => Hof::RunWriter(
            dest.as_ref().map(|d| f.fold_atom(d)),
            BaseMonoid {
                empty: f.fold_atom(&monoid.empty),
                combine: f.fold_lam(&monoid.combine),
            },
            Box::new(f.fold_lam(lam)),
        ),
        Hof::RunState(dest, init, lam) => Hof::RunState(
            dest.as_ref().map(|d| f.fold_atom(d)),
            f.fold_atom(init),
            Box::new(f.fold_lam(lam)),
        ),
        Hof::RunIO(body) => Hof::RunIO(Box::new(f.fold_block(body))),
        Hof::RunInit(body) => Hof::RunInit(Box::new(f.fold_block(body))),
        Hof::RememberDest(d, lam) => {
            Hof::RememberDest(f.fold_atom(d), Box::new(f.fold_lam(lam)))
        }
    }
}

pub fn walk_block<F: IrFolder>(f: &mut F, block: &Block) -> Block {
    Block {
        ann: block.ann.as_ref().map(|ann| BlockAnn {
            ty: f.fold_type(&ann.ty),
            effs: ann.effs.clone(),
        }),
        decls: block
            .decls
            .iter()
            .map(|d| Decl {
                binder: f.fold_binder(&d.binder),
                ann: d.ann,
                expr: f.fold_expr(&d.expr),
            })
            .collect(),
        result: f.fold_atom(&block.result),
    }
}

pub fn walk_dest<F: IrFolder>(f: &mut F, dest: &Dest) -> Dest {
    match dest {
        Dest::BaseRef { ptr, ty } => Dest::BaseRef {
            ptr: f.fold_atom(ptr),
            ty: ty.clone(),
        },
        Dest::TabRef(tab) => Dest::TabRef(Box::new(TabDest {
            binder: f.fold_binder(&tab.binder),
            ix: f.fold_ix(&tab.ix),
            body: f.fold_block(&tab.body),
        })),
        Dest::ProdRef(ds) => Dest::ProdRef(ds.iter().map(|d| f.fold_dest(d)).collect()),
        Dest::SumAsProdRef { tys, tag, payloads } => Dest::SumAsProdRef {
            tys: tys.iter().map(|t| f.fold_type(t)).collect(),
            tag: Box::new(f.fold_dest(tag)),
            payloads: payloads.iter().map(|d| f.fold_dest(d)).collect(),
        },
        Dest::NewtypeRef { ty, inner } => Dest::NewtypeRef {
            ty: f.fold_type(ty),
            inner: Box::new(f.fold_dest(inner)),
        },
        Dest::DepPairRef { lhs, rhs, ty } => Dest::DepPairRef {
            lhs: Box::new(f.fold_dest(lhs)),
            rhs: Box::new(DestAbs {
                binder: f.fold_binder(&rhs.binder),
                dest: f.fold_dest(&rhs.dest),
            }),
            ty: Box::new(walk_dep_pair_ty(f, ty)),
        },
        Dest::BoxedRef {
            boxes,
            ptr_binders,
            inner,
        } => Dest::BoxedRef {
            boxes: boxes
                .iter()
                .map(|b| BoxPtr {
                    cell: f.fold_dest(&b.cell),
                    ptr_ty: b.ptr_ty.clone(),
                    size: f.fold_block(&b.size),
                })
                .collect(),
            ptr_binders: ptr_binders.iter().map(|b| f.fold_binder(b)).collect(),
            inner: Box::new(f.fold_dest(inner)),
        },
    }
}

// =============================================================================
// Substitution
// =============================================================================

/// Applies a name -> atom map everywhere. Names are globally unique, so
/// no freshening is needed to stay capture-free; binders simply never
/// collide with the keys.
pub struct Subst<'a> {
    map: &'a HashMap<Name, Atom>,
}

impl<'a> Subst<'a> {
    pub fn new(map: &'a HashMap<Name, Atom>) -> Self {
        Subst { map }
    }
}

impl<'a> IrFolder for Subst<'a> {
    fn fold_name(&mut self, name: Name) -> Atom {
        match self.map.get(&name) {
            Some(atom) => atom.clone(),
            None => Atom::Var(name),
        }
    }
}

pub fn subst_atom(map: &HashMap<Name, Atom>, atom: &Atom) -> Atom {
    Subst::new(map).fold_atom(atom)
}

pub fn subst_expr(map: &HashMap<Name, Atom>, expr: &SExpr) -> SExpr {
    Subst::new(map).fold_expr(expr)
}

pub fn subst_block(map: &HashMap<Name, Atom>, block: &Block) -> Block {
    Subst::new(map).fold_block(block)
}

pub fn subst_type(map: &HashMap<Name, Atom>, ty: &SType) -> SType {
    Subst::new(map).fold_type(ty)
}

pub fn subst_ix(map: &HashMap<Name, Atom>, ix: &IxType) -> IxType {
    Subst::new(map).fold_ix(ix)
}

pub fn subst_dest(map: &HashMap<Name, Atom>, dest: &Dest) -> Dest {
    Subst::new(map).fold_dest(dest)
}

/// Substitute a single name.
pub fn subst_one_atom(name: Name, value: &Atom, atom: &Atom) -> Atom {
    let mut map = HashMap::new();
    map.insert(name, value.clone());
    subst_atom(&map, atom)
}

// =============================================================================
// Free variables
// =============================================================================

struct FreeVars {
    bound: HashSet<Name>,
    free: BTreeSet<Name>,
}

impl FreeVars {
    fn new() -> Self {
        FreeVars {
            bound: HashSet::new(),
            free: BTreeSet::new(),
        }
    }

    fn use_name(&mut self, n: Name) {
        if !self.bound.contains(&n) {
            self.free.insert(n);
        }
    }

    fn with_binder<R>(&mut self, b: &Binder, f: impl FnOnce(&mut Self) -> R) -> R {
        self.ty(&b.ty);
        let fresh = self.bound.insert(b.name);
        let r = f(self);
        if fresh {
            self.bound.remove(&b.name);
        }
        r
    }

    fn atom(&mut self, atom: &Atom) {
        match atom {
            Atom::Var(n) => self.use_name(*n),
            Atom::Lit(_) => {}
            Atom::Con(con) => self.con(con),
            Atom::Lam(lam) => self.lam(lam),
            Atom::TabLam(lam) => {
                self.ix(&lam.ix);
                self.with_binder(&lam.binder.clone(), |s| s.block(&lam.body));
            }
            Atom::DepPair(l, r, ty) => {
                self.atom(l);
                self.atom(r);
                self.dep_pair_ty(ty);
            }
            Atom::ProjectElt(_, n) => self.use_name(*n),
            Atom::ACase(scrut, alts, ty) => {
                self.atom(scrut);
                for alt in alts {
                    self.with_binder(&alt.binder.clone(), |s| s.atom(&alt.body));
                }
                self.ty(ty);
            }
            Atom::DestRef(d) => self.dest(d),
            Atom::ImpVar(n, _) => self.use_name(*n),
        }
    }

    fn con(&mut self, con: &Con) {
        match con {
            Con::ProdCon(xs) => xs.iter().for_each(|x| self.atom(x)),
            Con::SumCon { tys, payload, .. } => {
                tys.iter().for_each(|t| self.ty(t));
                self.atom(payload);
            }
            Con::SumAsProd { tys, tag, payloads } => {
                tys.iter().for_each(|t| self.ty(t));
                self.atom(tag);
                payloads.iter().for_each(|p| self.atom(p));
            }
            Con::Newtype { ty, inner } => {
                self.ty(ty);
                self.atom(inner);
            }
        }
    }

    fn dep_pair_ty(&mut self, ty: &DepPairType) {
        self.ty(&ty.lhs);
        self.with_binder(&ty.binder.clone(), |s| s.ty(&ty.rhs));
    }

    fn ty(&mut self, ty: &SType) {
        match ty {
            SType::Base(_) | SType::Nat => {}
            SType::Fin(n) => self.atom(n),
            SType::Prod(ts) | SType::Sum(ts) => ts.iter().for_each(|t| self.ty(t)),
            SType::Tab(tab) => {
                self.ix(&tab.ix);
                self.with_binder(&tab.binder.clone(), |s| s.ty(&tab.body));
            }
            SType::DepPair(dp) => self.dep_pair_ty(dp),
            SType::Pi(pi) => {
                let binders = pi.binders.clone();
                self.nest(&binders, |s| s.ty(&pi.result));
            }
            SType::TypeCon { rep, .. } => self.ty(rep),
            SType::Record(fields) | SType::Variant(fields) => {
                fields.iter().for_each(|(_, t)| self.ty(t))
            }
            SType::Ref(t) => self.ty(t),
        }
    }

    fn nest(&mut self, binders: &[Binder], f: impl FnOnce(&mut Self)) {
        let mut fresh = Vec::with_capacity(binders.len());
        for b in binders {
            self.ty(&b.ty);
            fresh.push(self.bound.insert(b.name));
        }
        f(self);
        for (b, was_fresh) in binders.iter().zip(fresh) {
            if was_fresh {
                self.bound.remove(&b.name);
            }
        }
    }

    fn ix(&mut self, ix: &IxType) {
        self.ty(&ix.elem_ty);
        match &ix.dict {
            IxDict::Fin(n) => self.atom(n),
            IxDict::Custom {
                size,
                ordinal,
                unsafe_from_ordinal,
            } => {
                self.atom(size);
                self.atom(ordinal);
                self.atom(unsafe_from_ordinal);
            }
        }
    }

    fn lam(&mut self, lam: &Lam) {
        let binders = lam.binders.clone();
        self.nest(&binders, |s| s.block(&lam.body));
    }

    fn block(&mut self, block: &Block) {
        if let Some(ann) = &block.ann {
            self.ty(&ann.ty);
        }
        self.block_decls(block, 0);
    }

    fn block_decls(&mut self, block: &Block, i: usize) {
        if i == block.decls.len() {
            self.atom(&block.result);
        } else {
            let decl = block.decls[i].clone();
            self.expr(&decl.expr);
            self.with_binder(&decl.binder, |s| s.block_decls(block, i + 1));
        }
    }

    fn expr(&mut self, expr: &SExpr) {
        match expr {
            SExpr::Atom(a) => self.atom(a),
            SExpr::App(callee, args) | SExpr::TabApp(callee, args) => {
                self.atom(callee);
                args.iter().for_each(|a| self.atom(a));
            }
            SExpr::Case(case) => {
                self.atom(&case.scrut);
                for alt in &case.alts {
                    self.with_binder(&alt.binder.clone(), |s| s.block(&alt.body));
                }
                self.ty(&case.ty);
            }
            SExpr::Op(op) => self.op(op),
            SExpr::Hof(hof) => self.hof(hof),
        }
    }

    fn op(&mut self, op: &PrimOp) {
        match op {
            PrimOp::BinOp(_, a, b) => {
                self.atom(a);
                self.atom(b);
            }
            PrimOp::UnOp(_, a) | PrimOp::Freeze(a) | PrimOp::PtrLoad(a) => self.atom(a),
            PrimOp::Select(c, t, e) => {
                self.atom(c);
                self.atom(t);
                self.atom(e);
            }
            PrimOp::CastOp(ty, a) => {
                self.ty(ty);
                self.atom(a);
            }
            PrimOp::IxSize(ix) => self.ix(ix),
            PrimOp::Ordinal(ix, a) | PrimOp::UnsafeFromOrdinal(ix, a) => {
                self.ix(ix);
                self.atom(a);
            }
            PrimOp::TabCon(ty, elems) => {
                self.ty(ty);
                elems.iter().for_each(|e| self.atom(e));
            }
            PrimOp::RefOp(r, op) => {
                self.atom(r);
                match op {
                    RefOp::Ask | RefOp::Get => {}
                    RefOp::Put(v) => self.atom(v),
                    RefOp::Extend(combine, v) => {
                        self.lam(combine);
                        self.atom(v);
                    }
                }
            }
            PrimOp::AllocDest(ty) | PrimOp::ThrowError(ty) | PrimOp::VectorIota(ty) => {
                self.ty(ty)
            }
            PrimOp::Place(r, v) | PrimOp::IndexRef(r, v) | PrimOp::PtrOffset(r, v) => {
                self.atom(r);
                self.atom(v);
            }
            PrimOp::ProjRef(_, r) => self.atom(r),
            PrimOp::VectorSubref(r, i, ty) => {
                self.atom(r);
                self.atom(i);
                self.ty(ty);
            }
            PrimOp::VectorBroadcast(a, ty) => {
                self.atom(a);
                self.ty(ty);
            }
            PrimOp::RecordCons(fields) => fields.iter().for_each(|(_, a)| self.atom(a)),
            PrimOp::VariantCon { tys, payload, .. } => {
                tys.iter().for_each(|(_, t)| self.ty(t));
                self.atom(payload);
            }
        }
    }

    fn hof(&mut self, hof: &Hof) {
        match hof {
            Hof::For(fe) => {
                self.ix(&fe.ix);
                self.lam(&fe.lam);
            }
            Hof::Seq(se) => {
                self.ix(&se.ix);
                self.atom(&se.carry);
                self.lam(&se.lam);
            }
            Hof::While(body) | Hof::RunIO(body) | Hof::RunInit(body) => self.block(body),
            Hof::RunReader(init, lam) => {
                self.atom(init);
                self.lam(lam);
            }
            Hof::RunWriter(dest, monoid, lam) => {
                if let Some(d) = dest {
                    self.atom(d);
                }
                self.atom(&monoid.empty);
                self.lam(&monoid.combine);
                self.lam(lam);
            }
            Hof::RunState(dest, init, lam) => {
                if let Some(d) = dest {
                    self.atom(d);
                }
                self.atom(init);
                self.lam(lam);
            }
            Hof::RememberDest(d, lam) => {
                self.atom(d);
                self.lam(lam);
            }
        }
    }

    fn dest(&mut self, dest: &Dest) {
        match dest {
            Dest::BaseRef { ptr, .. } => self.atom(ptr),
            Dest::TabRef(tab) => {
                self.ix(&tab.ix);
                self.with_binder(&tab.binder.clone(), |s| s.block(&tab.body));
            }
            Dest::ProdRef(ds) => ds.iter().for_each(|d| self.dest(d)),
            Dest::SumAsProdRef { tys, tag, payloads } => {
                tys.iter().for_each(|t| self.ty(t));
                self.dest(tag);
                payloads.iter().for_each(|d| self.dest(d));
            }
            Dest::NewtypeRef { ty, inner } => {
                self.ty(ty);
                self.dest(inner);
            }
            Dest::DepPairRef { lhs, rhs, ty } => {
                self.dest(lhs);
                self.with_binder(&rhs.binder.clone(), |s| s.dest(&rhs.dest));
                self.dep_pair_ty(ty);
            }
            Dest::BoxedRef {
                boxes,
                ptr_binders,
                inner,
            } => {
                for b in boxes {
                    self.dest(&b.cell);
                    self.block(&b.size);
                }
                let binders = ptr_binders.clone();
                self.nest(&binders, |s| s.dest(inner));
            }
        }
    }
}

pub fn free_vars_atom(atom: &Atom) -> BTreeSet<Name> {
    let mut fv = FreeVars::new();
    fv.atom(atom);
    fv.free
}

pub fn free_vars_type(ty: &SType) -> BTreeSet<Name> {
    let mut fv = FreeVars::new();
    fv.ty(ty);
    fv.free
}

pub fn free_vars_expr(expr: &SExpr) -> BTreeSet<Name> {
    let mut fv = FreeVars::new();
    fv.expr(expr);
    fv.free
}

pub fn free_vars_block(block: &Block) -> BTreeSet<Name> {
    let mut fv = FreeVars::new();
    fv.block(block);
    fv.free
}

pub fn free_vars_ix(ix: &IxType) -> BTreeSet<Name> {
    let mut fv = FreeVars::new();
    fv.ix(ix);
    fv.free
}

/// Does the type mention the name free?
pub fn type_mentions(ty: &SType, name: Name) -> bool {
    free_vars_type(ty).contains(&name)
}

/// Does the index type mention the name free?
pub fn ix_mentions(ix: &IxType, name: Name) -> bool {
    free_vars_ix(ix).contains(&name)
}
