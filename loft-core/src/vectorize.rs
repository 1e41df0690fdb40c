//! Vectorization of inner sequential loops.
//!
//! A `Seq` over `Fin n` with `n` divisible by the lane width, whose
//! body performs only whitelisted operations and no effects beyond
//! destination initialization, is rewritten into a loop of `n / W`
//! iterations of width-`W` vector operations. Each value is classified
//! by its stability across lanes: `Uniform` (identical), `Contiguous`
//! (lane `k` holds `base + k`), or `Varying` (arbitrary, held in a
//! vector register).
//!
//! Refusal is not an error: any unsupported shape keeps the original
//! loop verbatim. The one hard error is a write conflict, where all
//! lanes would store through the same reference.

use crate::builder::Builder;
use crate::error::{CompilerError, Result};
use crate::ir::queries::{block_effects, scalar_base_ty, TypeEnv};
use crate::ir::*;
use crate::name::{Name, NameSupply};
use crate::{err_internal, err_vectorize};
use log::debug;
use std::collections::HashMap;

/// Lane-uniformity classification of a value in the loop body.
#[derive(Debug, Clone)]
enum VVal {
    Uniform(Atom),
    /// The scalar base; lane `k` holds `base + k`. For references, the
    /// atom is the width-`W` subreference itself.
    Contiguous(Atom),
    /// A vector-typed atom with arbitrary per-lane values.
    Varying(Atom),
    Prod(Vec<VVal>),
}

enum VecErr {
    /// Keep the original loop.
    Refuse(String),
    /// A genuine invariant violation; aborts the pass.
    Fatal(CompilerError),
}

impl From<CompilerError> for VecErr {
    fn from(e: CompilerError) -> Self {
        // Unexpected shapes during analysis mean the loop is not ours
        // to touch; only explicitly raised conflicts are fatal.
        VecErr::Refuse(e.to_string())
    }
}

type VResult<T> = std::result::Result<T, VecErr>;

struct VecCtx {
    supply: NameSupply,
    width: u32,
    env: TypeEnv,
}

/// Rewrite vectorizable `Seq` loops in a dest block. Loops that cannot
/// be vectorized are kept unchanged; reapplication with the same width
/// is the identity on already-vectorized loops.
pub fn vectorize_loops(
    supply: NameSupply,
    dest_block: &DestBlock,
    width: u32,
) -> Result<(DestBlock, NameSupply)> {
    if width < 2 {
        return Err(err_vectorize!("vector width must be at least 2, got {}", width));
    }
    let mut cx = VecCtx {
        supply,
        width,
        env: TypeEnv::new(),
    };
    cx.env.insert(
        dest_block.dest_binder.name,
        dest_block.dest_binder.ty.clone(),
    );
    let block = vec_block(&mut cx, &dest_block.block)?;
    Ok((
        DestBlock {
            dest_binder: dest_block.dest_binder.clone(),
            block,
        },
        cx.supply,
    ))
}

fn vec_block(cx: &mut VecCtx, block: &Block) -> Result<Block> {
    let mut decls = Vec::with_capacity(block.decls.len());
    for decl in &block.decls {
        let expr = vec_expr(cx, &decl.expr)?;
        cx.env.insert(decl.binder.name, decl.binder.ty.clone());
        decls.push(Decl {
            binder: decl.binder.clone(),
            ann: decl.ann,
            expr,
        });
    }
    Ok(Block {
        ann: block.ann.clone(),
        decls,
        result: block.result.clone(),
    })
}

fn vec_expr(cx: &mut VecCtx, expr: &SExpr) -> Result<SExpr> {
    match expr {
        SExpr::Hof(Hof::Seq(se)) => match try_vectorize(cx, se) {
            Ok(vectorized) => Ok(SExpr::Hof(Hof::Seq(Box::new(vectorized)))),
            Err(VecErr::Fatal(e)) => Err(e),
            Err(VecErr::Refuse(reason)) => {
                debug!("vectorization refused: {}", reason);
                // Inner loops may still be vectorizable.
                let lam = vec_lam(cx, &se.lam)?;
                Ok(SExpr::Hof(Hof::Seq(Box::new(SeqExpr {
                    dir: se.dir,
                    ix: se.ix.clone(),
                    carry: se.carry.clone(),
                    lam,
                }))))
            }
        },
        SExpr::Hof(Hof::While(body)) => Ok(SExpr::Hof(Hof::While(Box::new(
            vec_block(cx, body)?,
        )))),
        SExpr::Hof(Hof::RunIO(body)) => Ok(SExpr::Hof(Hof::RunIO(Box::new(
            vec_block(cx, body)?,
        )))),
        SExpr::Hof(Hof::RunInit(body)) => Ok(SExpr::Hof(Hof::RunInit(Box::new(
            vec_block(cx, body)?,
        )))),
        SExpr::Hof(Hof::RunReader(init, lam)) => Ok(SExpr::Hof(Hof::RunReader(
            init.clone(),
            Box::new(vec_lam(cx, lam)?),
        ))),
        SExpr::Hof(Hof::RunWriter(dest, monoid, lam)) => Ok(SExpr::Hof(Hof::RunWriter(
            dest.clone(),
            monoid.clone(),
            Box::new(vec_lam(cx, lam)?),
        ))),
        SExpr::Hof(Hof::RunState(dest, init, lam)) => Ok(SExpr::Hof(Hof::RunState(
            dest.clone(),
            init.clone(),
            Box::new(vec_lam(cx, lam)?),
        ))),
        SExpr::Hof(Hof::RememberDest(d, lam)) => Ok(SExpr::Hof(Hof::RememberDest(
            d.clone(),
            Box::new(vec_lam(cx, lam)?),
        ))),
        SExpr::Case(case) => {
            let mut alts = Vec::with_capacity(case.alts.len());
            for alt in &case.alts {
                cx.env.insert(alt.binder.name, alt.binder.ty.clone());
                alts.push(Alt {
                    binder: alt.binder.clone(),
                    body: vec_block(cx, &alt.body)?,
                });
            }
            Ok(SExpr::Case(Box::new(CaseExpr {
                scrut: case.scrut.clone(),
                alts,
                ty: case.ty.clone(),
                effs: case.effs.clone(),
            })))
        }
        other => Ok(other.clone()),
    }
}

fn vec_lam(cx: &mut VecCtx, lam: &Lam) -> Result<Lam> {
    for b in &lam.binders {
        cx.env.insert(b.name, b.ty.clone());
    }
    let body = vec_block(cx, &lam.body)?;
    Ok(Lam {
        binders: lam.binders.clone(),
        effs: lam.effs.clone(),
        body,
    })
}

// =============================================================================
// The rewrite
// =============================================================================

fn try_vectorize(cx: &mut VecCtx, se: &SeqExpr) -> VResult<SeqExpr> {
    let w = cx.width;
    let n = match &se.ix.dict {
        IxDict::Fin(n) => match n {
            Atom::Con(Con::Newtype { inner, .. }) => match **inner {
                Atom::Lit(LitVal::U32(n)) => n,
                _ => return Err(VecErr::Refuse("loop bound is not a literal".into())),
            },
            _ => return Err(VecErr::Refuse("loop bound is not a literal".into())),
        },
        IxDict::Custom { .. } => {
            return Err(VecErr::Refuse("custom index dictionary".into()))
        }
    };
    if n % w != 0 {
        return Err(VecErr::Refuse(format!(
            "trip count {} not divisible by width {}",
            n, w
        )));
    }
    let effs = block_effects(&se.lam.body);
    if !effs.init_only() {
        return Err(VecErr::Refuse(format!(
            "body has effects beyond initialization: {:?}",
            effs
        )));
    }
    if se.lam.binders.len() != 2 {
        return Err(VecErr::Refuse("loop lambda is not binary".into()));
    }
    if !se.lam.body.result.is_unit() {
        return Err(VecErr::Refuse("loop body result is not unit".into()));
    }

    let mut b = Builder::with_env(std::mem::take(&mut cx.supply), cx.env.clone());
    let result = build_vector_loop(&mut b, se, w, n);
    cx.supply = b.into_supply();
    result
}

fn build_vector_loop(b: &mut Builder, se: &SeqExpr, w: u32, n: u32) -> VResult<SeqExpr> {
    let ix = IxType::fin_const(n / w);
    let old_i = se.lam.binders[0].name;
    let old_carry = se.lam.binders[1].name;
    let carry_ty = se.lam.binders[1].ty.clone();

    let vi_binder = b.with_fresh_binder(ix.elem_ty.clone());
    let carry_binder = b.with_fresh_binder(carry_ty);

    let mut refusal: Option<VecErr> = None;
    let lam = {
        let refusal = &mut refusal;
        b.build_lam(vec![vi_binder, carry_binder], |b, binders| {
            let ord = Atom::Var(binders[0].name).proj(Projection::Unwrap);
            let i0 = match b.imul(ord, Atom::idx_lit(w)) {
                Ok(a) => a,
                Err(e) => {
                    *refusal = Some(VecErr::Fatal(e));
                    return Ok(Atom::unit());
                }
            };
            let mut vals: HashMap<Name, VVal> = HashMap::new();
            vals.insert(old_i, VVal::Contiguous(i0));
            vals.insert(old_carry, VVal::Uniform(Atom::Var(binders[1].name)));

            let mut vb = VecBody { b, w, vals };
            for decl in &se.lam.body.decls {
                match vb.vectorize_decl(decl) {
                    Ok(v) => {
                        vb.vals.insert(decl.binder.name, v);
                    }
                    Err(e) => {
                        *refusal = Some(e);
                        return Ok(Atom::unit());
                    }
                }
            }
            Ok(Atom::unit())
        })
        .map_err(|e| VecErr::Fatal(e))?
    };
    if let Some(e) = refusal {
        return Err(e);
    }
    Ok(SeqExpr {
        dir: se.dir,
        ix,
        carry: se.carry.clone(),
        lam,
    })
}

struct VecBody<'a> {
    b: &'a mut Builder,
    w: u32,
    vals: HashMap<Name, VVal>,
}

impl<'a> VecBody<'a> {
    fn vectorize_decl(&mut self, decl: &Decl) -> VResult<VVal> {
        match &decl.expr {
            SExpr::Atom(a) => self.vval_of(a),
            SExpr::Op(op) => self.vectorize_op(op),
            other => Err(VecErr::Refuse(format!(
                "expression not supported in vector loops: {:?}",
                other
            ))),
        }
    }

    fn vectorize_op(&mut self, op: &PrimOp) -> VResult<VVal> {
        match op {
            PrimOp::IndexRef(r, i) => {
                let rv = self.vval_of(r)?;
                let iv = self.vval_of(i)?;
                match (rv, iv) {
                    (VVal::Uniform(r), VVal::Uniform(i)) => {
                        Ok(VVal::Uniform(self.b.emit_op(PrimOp::IndexRef(r, i))?))
                    }
                    (VVal::Uniform(r), VVal::Contiguous(base)) => {
                        let elem = self.table_elem_scalar(&r)?;
                        let vty = SType::Base(BaseType::Vector(self.w, elem));
                        let subref =
                            self.b.emit_op(PrimOp::VectorSubref(r, base, vty))?;
                        Ok(VVal::Contiguous(subref))
                    }
                    _ => Err(VecErr::Refuse(
                        "gather through a non-contiguous index".into(),
                    )),
                }
            }
            PrimOp::Place(r, v) => {
                let rv = self.vval_of(r)?;
                let vv = self.vval_of(v)?;
                match (rv, vv) {
                    (VVal::Uniform(r), VVal::Uniform(v)) => {
                        self.b.emit_op(PrimOp::Place(r, v))?;
                        Ok(VVal::Uniform(Atom::unit()))
                    }
                    (VVal::Contiguous(r), v @ (VVal::Varying(_) | VVal::Contiguous(_))) => {
                        let vec_val = self.ensure_varying(v)?;
                        self.b.emit_op(PrimOp::Place(r, vec_val))?;
                        Ok(VVal::Uniform(Atom::unit()))
                    }
                    (VVal::Uniform(r), _) => Err(VecErr::Fatal(err_internal!(
                        "write-conflict",
                        "all lanes store through the same reference {:?}",
                        r
                    ))),
                    _ => Err(VecErr::Refuse("scatter store".into())),
                }
            }
            PrimOp::BinOp(k, x, y) => {
                if k.is_cmp() {
                    return Err(VecErr::Refuse("comparison in vector loop".into()));
                }
                let xv = self.vval_of(x)?;
                let yv = self.vval_of(y)?;
                match (xv, yv) {
                    (VVal::Uniform(x), VVal::Uniform(y)) => {
                        Ok(VVal::Uniform(self.b.emit_op(PrimOp::BinOp(*k, x, y))?))
                    }
                    (xv, yv) => {
                        let vx = self.ensure_varying(xv)?;
                        let vy = self.ensure_varying(yv)?;
                        Ok(VVal::Varying(self.b.emit_op(PrimOp::BinOp(*k, vx, vy))?))
                    }
                }
            }
            PrimOp::UnOp(k, x) => {
                let xv = self.vval_of(x)?;
                match xv {
                    VVal::Uniform(x) => {
                        Ok(VVal::Uniform(self.b.emit_op(PrimOp::UnOp(*k, x))?))
                    }
                    xv => {
                        let vx = self.ensure_varying(xv)?;
                        Ok(VVal::Varying(self.b.emit_op(PrimOp::UnOp(*k, vx))?))
                    }
                }
            }
            PrimOp::CastOp(ty, x) => {
                let target = scalar_base_ty(ty).map_err(VecErr::from)?;
                match self.vval_of(x)? {
                    VVal::Uniform(x) => Ok(VVal::Uniform(
                        self.b.emit_op(PrimOp::CastOp(ty.clone(), x))?,
                    )),
                    VVal::Contiguous(base) => Ok(VVal::Contiguous(
                        self.b.emit_op(PrimOp::CastOp(ty.clone(), base))?,
                    )),
                    VVal::Varying(v) => {
                        let vty = SType::Base(BaseType::Vector(self.w, target));
                        Ok(VVal::Varying(self.b.emit_op(PrimOp::CastOp(vty, v))?))
                    }
                    VVal::Prod(_) => Err(VecErr::Refuse("cast of a product".into())),
                }
            }
            PrimOp::PtrOffset(p, o) => {
                let pv = self.vval_of(p)?;
                let ov = self.vval_of(o)?;
                match (pv, ov) {
                    (VVal::Uniform(p), VVal::Uniform(o)) => {
                        Ok(VVal::Uniform(self.b.emit_op(PrimOp::PtrOffset(p, o))?))
                    }
                    (VVal::Uniform(p), VVal::Contiguous(base)) => Ok(VVal::Contiguous(
                        self.b.emit_op(PrimOp::PtrOffset(p, base))?,
                    )),
                    _ => Err(VecErr::Refuse("pointer arithmetic is not affine".into())),
                }
            }
            PrimOp::PtrLoad(p) => match self.vval_of(p)? {
                VVal::Uniform(p) => {
                    Ok(VVal::Uniform(self.b.emit_op(PrimOp::PtrLoad(p))?))
                }
                VVal::Contiguous(p) => {
                    let vec_ptr_ty = self.vector_ptr_ty(&p)?;
                    let cast = self.b.emit_op(PrimOp::CastOp(vec_ptr_ty, p))?;
                    Ok(VVal::Varying(self.b.emit_op(PrimOp::PtrLoad(cast))?))
                }
                _ => Err(VecErr::Refuse("load through a varying pointer".into())),
            },
            PrimOp::Ordinal(_, i) => match self.vval_of(i)? {
                VVal::Uniform(i) => Ok(VVal::Uniform(i.proj(Projection::Unwrap))),
                VVal::Contiguous(base) => Ok(VVal::Contiguous(base)),
                VVal::Varying(v) => Ok(VVal::Varying(v)),
                VVal::Prod(_) => Err(VecErr::Refuse("ordinal of a product".into())),
            },
            PrimOp::UnsafeFromOrdinal(ix, o) => match self.vval_of(o)? {
                VVal::Uniform(o) => Ok(VVal::Uniform(Atom::newtype(ix.elem_ty.clone(), o))),
                VVal::Contiguous(base) => Ok(VVal::Contiguous(base)),
                VVal::Varying(v) => Ok(VVal::Varying(v)),
                VVal::Prod(_) => Err(VecErr::Refuse("index from a product".into())),
            },
            other => Err(VecErr::Refuse(format!(
                "op not supported in vector loops: {:?}",
                other
            ))),
        }
    }

    /// Classify an atom. Names bound outside the loop are uniform by
    /// construction.
    fn vval_of(&mut self, atom: &Atom) -> VResult<VVal> {
        match atom {
            Atom::Var(n) => match self.vals.get(n) {
                Some(v) => Ok(v.clone()),
                None => Ok(VVal::Uniform(atom.clone())),
            },
            Atom::Lit(_) => Ok(VVal::Uniform(atom.clone())),
            Atom::ProjectElt(ps, n) => {
                let mut v = match self.vals.get(n) {
                    Some(v) => v.clone(),
                    None => return Ok(VVal::Uniform(atom.clone())),
                };
                for p in ps {
                    v = self.project_vval(v, *p)?;
                }
                Ok(v)
            }
            Atom::Con(Con::ProdCon(xs)) => {
                let vs: VResult<Vec<VVal>> = xs.iter().map(|x| self.vval_of(x)).collect();
                Ok(VVal::Prod(vs?))
            }
            Atom::Con(Con::Newtype { ty, inner }) => match self.vval_of(inner)? {
                VVal::Uniform(a) => Ok(VVal::Uniform(Atom::newtype(ty.clone(), a))),
                other => Ok(other),
            },
            other => {
                let fvs = crate::ir::fold::free_vars_atom(other);
                if fvs.iter().any(|n| self.vals.contains_key(n)) {
                    Err(VecErr::Refuse(format!(
                        "atom mixes loop-varying values: {:?}",
                        other
                    )))
                } else {
                    Ok(VVal::Uniform(other.clone()))
                }
            }
        }
    }

    fn project_vval(&mut self, v: VVal, p: Projection) -> VResult<VVal> {
        match (p, v) {
            (Projection::Prod(i), VVal::Prod(vs)) => vs
                .get(i)
                .cloned()
                .ok_or_else(|| VecErr::Refuse("projection out of range".into())),
            (Projection::Unwrap, v @ (VVal::Contiguous(_) | VVal::Varying(_))) => Ok(v),
            (p, VVal::Uniform(a)) => Ok(VVal::Uniform(a.proj(p))),
            (p, v) => Err(VecErr::Refuse(format!(
                "cannot project {:?} out of {:?}",
                p, v
            ))),
        }
    }

    /// Convert a value to a vector register: broadcast a uniform,
    /// broadcast-plus-iota a contiguous.
    fn ensure_varying(&mut self, v: VVal) -> VResult<Atom> {
        match v {
            VVal::Varying(a) => Ok(a),
            VVal::Uniform(a) => {
                let s = self.scalar_of(&a)?;
                let vty = SType::Base(BaseType::Vector(self.w, s));
                Ok(self.b.emit_op(PrimOp::VectorBroadcast(a, vty))?)
            }
            VVal::Contiguous(base) => {
                let s = self.scalar_of(&base)?;
                let add = if s.is_float() {
                    BinOpKind::FAdd
                } else {
                    BinOpKind::IAdd
                };
                let vty = SType::Base(BaseType::Vector(self.w, s));
                let broadcast = self
                    .b
                    .emit_op(PrimOp::VectorBroadcast(base, vty.clone()))?;
                let iota = self.b.emit_op(PrimOp::VectorIota(vty))?;
                Ok(self.b.emit_op(PrimOp::BinOp(add, broadcast, iota))?)
            }
            VVal::Prod(_) => Err(VecErr::Refuse("product in vector position".into())),
        }
    }

    fn scalar_of(&self, a: &Atom) -> VResult<ScalarBaseType> {
        let ty = self.b.type_of(a).map_err(VecErr::from)?;
        scalar_base_ty(&ty).map_err(VecErr::from)
    }

    /// The scalar element type of a table reference.
    fn table_elem_scalar(&self, r: &Atom) -> VResult<ScalarBaseType> {
        let ty = self.b.type_of(r).map_err(VecErr::from)?;
        match ty {
            SType::Ref(inner) => match *inner {
                SType::Tab(tab) => scalar_base_ty(&tab.body).map_err(VecErr::from),
                other => Err(VecErr::Refuse(format!(
                    "vector subref of non-table {:?}",
                    other
                ))),
            },
            other => Err(VecErr::Refuse(format!(
                "vector subref of non-reference {:?}",
                other
            ))),
        }
    }

    /// Pointer-to-vector type for a contiguous scalar pointer.
    fn vector_ptr_ty(&self, p: &Atom) -> VResult<SType> {
        let ty = self.b.type_of(p).map_err(VecErr::from)?;
        match ty {
            SType::Base(BaseType::Ptr(ptr)) => match ptr.pointee {
                BaseType::Scalar(s) => Ok(SType::Base(BaseType::ptr_to(
                    ptr.addr_space,
                    BaseType::Vector(self.w, s),
                ))),
                other => Err(VecErr::Refuse(format!(
                    "vector load through pointer to {:?}",
                    other
                ))),
            },
            other => Err(VecErr::Refuse(format!("not a pointer: {:?}", other))),
        }
    }
}
