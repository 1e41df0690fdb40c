//! Loop lowering: `for` comprehensions to destination-passing `Seq`
//! loops.
//!
//! Every traversal carries an optional destination. A `for` or table
//! literal with a destination writes its elements directly through it;
//! anything else evaluates normally and is finished with a single
//! `Place`. Destinations are routed through nested blocks by mapping
//! the block's result variable to the incoming destination, which is
//! what elides intermediate buffers for nested comprehensions.

use crate::builder::Builder;
use crate::err_lower;
use crate::error::Result;
use crate::ir::fold::{subst_atom, subst_expr, subst_ix, subst_type};
use crate::ir::queries::{block_effects, block_ty, singleton_atom, TypeEnv};
use crate::ir::validate;
use crate::ir::*;
use crate::name::NameSupply;
use log::{debug, trace};
use std::collections::{HashMap, HashSet};

/// A destination for a declaration: either the whole value, or the
/// given projection of the value (writing the value means writing that
/// slot).
#[derive(Debug, Clone, PartialEq)]
enum ProjDest {
    Full(Atom),
    Proj(Vec<Projection>, Atom),
}

#[derive(Default)]
struct LowerCtx {
    subst: HashMap<crate::name::Name, Atom>,
}

/// Lower a simplified block into a block abstracted over its result
/// destination. The body writes the answer through the binder (of type
/// `Ref ansTy`) and produces unit.
pub fn lower_fully_sequential(
    supply: NameSupply,
    block: &Block,
) -> Result<(DestBlock, NameSupply)> {
    if cfg!(debug_assertions) {
        validate::check_simp_block(block)?;
    }
    let ans_ty = block_ty(&TypeEnv::new(), block)?;
    debug!("lowering block of type {}", crate::diags::format_type(&ans_ty));

    let mut b = Builder::new(supply);
    let dest_binder = Binder::new(
        b.fresh_name(crate::name::NameColor::Atom),
        SType::ref_to(ans_ty),
    );
    let mut cx = LowerCtx::default();
    let dest_var = Atom::Var(dest_binder.name);
    let body = b.build_abs(std::slice::from_ref(&dest_binder), |b| {
        lower_block(b, &mut cx, Some(ProjDest::Full(dest_var)), block)?;
        Ok(Atom::unit())
    })?;
    Ok((
        DestBlock {
            dest_binder,
            block: body,
        },
        b.into_supply(),
    ))
}

// =============================================================================
// Blocks
// =============================================================================

fn lower_block(
    b: &mut Builder,
    cx: &mut LowerCtx,
    dest: Option<ProjDest>,
    block: &Block,
) -> Result<Atom> {
    // Route the destination to the decl that produces the block result,
    // when the result is a variable or a projection chain off one.
    let mut dest_map: HashMap<crate::name::Name, ProjDest> = HashMap::new();
    if let Some(d) = &dest {
        match decompose_dest(d, &block.result) {
            Some((name, pd)) => {
                trace!("dest routed to {}", name);
                dest_map.insert(name, pd);
            }
            None => {}
        }
    }

    let bound: HashSet<crate::name::Name> =
        block.decls.iter().map(|d| d.binder.name).collect();

    for decl in &block.decls {
        let routed = dest_map.get(&decl.binder.name).cloned();
        let atom = lower_expr(b, cx, routed, &decl.expr)?;
        cx.subst.insert(decl.binder.name, atom);
    }

    let result = subst_atom(&cx.subst, &block.result);
    if let Some(d) = dest {
        let routed_through_decl = match &block.result {
            Atom::Var(v) | Atom::ProjectElt(_, v) => {
                bound.contains(v) && dest_map.contains_key(v)
            }
            _ => false,
        };
        if !routed_through_decl {
            place_into(b, &d, result.clone())?;
        }
    }
    Ok(result)
}

/// Best-effort decomposition: follow the block result only through a
/// variable or a projection chain applied to one.
fn decompose_dest(dest: &ProjDest, result: &Atom) -> Option<(crate::name::Name, ProjDest)> {
    match result {
        Atom::Var(v) => Some((*v, dest.clone())),
        Atom::ProjectElt(ps, v) => {
            let pd = match dest {
                ProjDest::Full(d) => ProjDest::Proj(ps.clone(), d.clone()),
                ProjDest::Proj(ps0, d) => {
                    let mut all = ps.clone();
                    all.extend(ps0.iter().copied());
                    ProjDest::Proj(all, d.clone())
                }
            };
            Some((*v, pd))
        }
        _ => None,
    }
}

fn place_into(b: &mut Builder, dest: &ProjDest, value: Atom) -> Result<()> {
    let (target, value) = match dest {
        ProjDest::Full(d) => (d.clone(), value),
        ProjDest::Proj(ps, d) => {
            let projected = ps.iter().fold(value, |v, p| v.proj(*p));
            (d.clone(), projected)
        }
    };
    b.emit_op(PrimOp::Place(target, value))?;
    Ok(())
}

// =============================================================================
// Expressions
// =============================================================================

fn lower_expr(
    b: &mut Builder,
    cx: &mut LowerCtx,
    dest: Option<ProjDest>,
    expr: &SExpr,
) -> Result<Atom> {
    match expr {
        SExpr::Hof(Hof::For(fe)) => match dest {
            Some(ProjDest::Full(d)) => lower_for(b, cx, d, fe),
            Some(pd @ ProjDest::Proj(_, _)) => {
                let atom = lower_expr(b, cx, None, expr)?;
                place_into(b, &pd, atom.clone())?;
                Ok(atom)
            }
            None => {
                let substituted = subst_expr(&cx.subst, expr);
                let ty = b.expr_ty(&substituted)?;
                if let Some(single) = singleton_atom(&ty) {
                    lower_for_effects_only(b, cx, fe)?;
                    return Ok(single);
                }
                let d = b.emit_op(PrimOp::AllocDest(ty))?;
                lower_for(b, cx, d, fe)
            }
        },
        SExpr::Op(PrimOp::TabCon(ty, elems)) => match dest {
            Some(ProjDest::Full(d)) => lower_tab_con(b, cx, d, ty, elems),
            Some(pd @ ProjDest::Proj(_, _)) => {
                let atom = lower_expr(b, cx, None, expr)?;
                place_into(b, &pd, atom.clone())?;
                Ok(atom)
            }
            None => {
                let tab_ty = subst_type(&cx.subst, ty);
                let d = b.emit_op(PrimOp::AllocDest(tab_ty))?;
                lower_tab_con(b, cx, d, ty, elems)
            }
        },
        SExpr::Hof(Hof::RunWriter(None, monoid, lam)) => {
            lower_rws(b, cx, dest, RwsRequest::Writer(monoid), lam)
        }
        SExpr::Hof(Hof::RunState(None, init, lam)) => {
            lower_rws(b, cx, dest, RwsRequest::State(init), lam)
        }
        _ => {
            let rebuilt = lower_rebuild(b, cx, expr)?;
            let atom = b.emit(rebuilt)?;
            if let Some(d) = dest {
                place_into(b, &d, atom.clone())?;
            }
            Ok(atom)
        }
    }
}

/// Default traversal: substitute atoms, lower nested blocks with no
/// destination.
fn lower_rebuild(b: &mut Builder, cx: &mut LowerCtx, expr: &SExpr) -> Result<SExpr> {
    match expr {
        SExpr::Atom(_) | SExpr::App(_, _) | SExpr::TabApp(_, _) | SExpr::Op(_) => {
            Ok(subst_expr(&cx.subst, expr))
        }
        SExpr::Case(case) => {
            let scrut = subst_atom(&cx.subst, &case.scrut);
            let mut alts = Vec::with_capacity(case.alts.len());
            for alt in &case.alts {
                let binder = Binder::new(
                    alt.binder.name,
                    subst_type(&cx.subst, &alt.binder.ty),
                );
                let body = b.build_abs(std::slice::from_ref(&binder), |b| {
                    lower_block(b, cx, None, &alt.body)
                })?;
                alts.push(Alt { binder, body });
            }
            Ok(SExpr::Case(Box::new(CaseExpr {
                scrut,
                alts,
                ty: subst_type(&cx.subst, &case.ty),
                effs: case.effs.clone(),
            })))
        }
        SExpr::Hof(hof) => {
            let lowered = match hof {
                Hof::While(body) => {
                    Hof::While(Box::new(lower_nested_block(b, cx, body)?))
                }
                Hof::RunIO(body) => Hof::RunIO(Box::new(lower_nested_block(b, cx, body)?)),
                Hof::RunInit(body) => {
                    Hof::RunInit(Box::new(lower_nested_block(b, cx, body)?))
                }
                Hof::RunReader(init, lam) => Hof::RunReader(
                    subst_atom(&cx.subst, init),
                    Box::new(lower_lam(b, cx, lam)?),
                ),
                Hof::For(_) | Hof::RunWriter(_, _, _) | Hof::RunState(_, _, _) => {
                    return Err(err_lower!(
                        "loop-shaped hof reached the default traversal: {:?}",
                        hof
                    ))
                }
                Hof::Seq(_) | Hof::RememberDest(_, _) => {
                    return Err(err_lower!(
                        "lowered-only hof in Simp-phase input: {:?}",
                        hof
                    ))
                }
            };
            Ok(SExpr::Hof(lowered))
        }
    }
}

fn lower_nested_block(b: &mut Builder, cx: &mut LowerCtx, block: &Block) -> Result<Block> {
    b.build_block(|b| lower_block(b, cx, None, block))
}

fn lower_lam(b: &mut Builder, cx: &mut LowerCtx, lam: &Lam) -> Result<Lam> {
    let binders: Vec<Binder> = lam
        .binders
        .iter()
        .map(|bind| Binder::new(bind.name, subst_type(&cx.subst, &bind.ty)))
        .collect();
    let body = b.build_abs(&binders, |b| lower_block(b, cx, None, &lam.body))?;
    let effs = block_effects(&body);
    Ok(Lam {
        binders,
        effs,
        body,
    })
}

// =============================================================================
// for
// =============================================================================

/// `for (i : ixTy). body` with a destination: a `Seq` whose carry is
/// the destination wrapped in a singleton product, whose body indexes
/// the carried destination and threads the element destination into the
/// loop body, and whose frozen first carry component is the result.
fn lower_for(b: &mut Builder, cx: &mut LowerCtx, d: Atom, fe: &ForExpr) -> Result<Atom> {
    let ix = subst_ix(&cx.subst, &fe.ix);
    let tab_ref_ty = b.type_of(&d)?;
    let carry_ty = SType::Prod(vec![tab_ref_ty]);

    let i_binder = b.with_fresh_binder(ix.elem_ty.clone());
    let carry_binder = b.with_fresh_binder(carry_ty);
    let loop_binder = fe.lam.binders[0].name;

    let lam = b.build_lam(vec![i_binder, carry_binder], |b, binders| {
        let i = Atom::Var(binders[0].name);
        let carry = Atom::Var(binders[1].name);
        let local_dest = carry.proj(Projection::Prod(0));
        let elem_dest = b.emit_op(PrimOp::IndexRef(local_dest, i.clone()))?;
        cx.subst.insert(loop_binder, i);
        lower_block(b, cx, Some(ProjDest::Full(elem_dest)), &fe.lam.body)?;
        Ok(Atom::unit())
    })?;

    let seq = b.emit_hof(Hof::Seq(Box::new(SeqExpr {
        dir: fe.dir,
        ix,
        carry: Atom::prod(vec![d]),
        lam,
    })))?;
    b.emit_op(PrimOp::Freeze(seq.proj(Projection::Prod(0))))
}

/// A `for` whose result is a singleton: no allocation, the loop runs
/// purely for its effects and the result is rebuilt from the type.
fn lower_for_effects_only(b: &mut Builder, cx: &mut LowerCtx, fe: &ForExpr) -> Result<()> {
    let ix = subst_ix(&cx.subst, &fe.ix);
    let i_binder = b.with_fresh_binder(ix.elem_ty.clone());
    let carry_binder = b.with_fresh_binder(SType::unit());
    let loop_binder = fe.lam.binders[0].name;

    let lam = b.build_lam(vec![i_binder, carry_binder], |b, binders| {
        cx.subst.insert(loop_binder, Atom::Var(binders[0].name));
        lower_block(b, cx, None, &fe.lam.body)?;
        Ok(Atom::unit())
    })?;
    b.emit_hof(Hof::Seq(Box::new(SeqExpr {
        dir: fe.dir,
        ix,
        carry: Atom::unit(),
        lam,
    })))?;
    Ok(())
}

// =============================================================================
// Table literals
// =============================================================================

fn lower_tab_con(
    b: &mut Builder,
    cx: &mut LowerCtx,
    d: Atom,
    ty: &SType,
    elems: &[Atom],
) -> Result<Atom> {
    let tab_ty = subst_type(&cx.subst, ty);
    let ix = match &tab_ty {
        SType::Tab(tab) => tab.ix.clone(),
        other => {
            return Err(err_lower!("table literal at non-table type {:?}", other))
        }
    };
    for (k, elem) in elems.iter().enumerate() {
        let idx = b.emit_op(PrimOp::UnsafeFromOrdinal(ix.clone(), Atom::idx_lit(k as u32)))?;
        let elem_dest = b.emit_op(PrimOp::IndexRef(d.clone(), idx))?;
        let value = subst_atom(&cx.subst, elem);
        b.emit_op(PrimOp::Place(elem_dest, value))?;
    }
    b.emit_op(PrimOp::Freeze(d))
}

// =============================================================================
// Writer/State
// =============================================================================

enum RwsRequest<'a> {
    Writer(&'a BaseMonoid),
    State(&'a Atom),
}

/// Lower a writer or state handler, splitting the caller's destination
/// between the answer and the accumulator/state when the split is
/// evident.
///
/// - A full destination of pair type splits into both components.
/// - A first-projection destination covers the answer only.
/// - A second-projection destination covers the reference only.
/// - Anything else falls back to the undecomposed path.
fn lower_rws(
    b: &mut Builder,
    cx: &mut LowerCtx,
    dest: Option<ProjDest>,
    req: RwsRequest<'_>,
    lam: &Lam,
) -> Result<Atom> {
    let (ans_dest, ref_dest) = match &dest {
        None => (None, None),
        Some(ProjDest::Full(d)) => {
            let a = b.emit_op(PrimOp::ProjRef(Projection::Prod(0), d.clone()))?;
            let w = b.emit_op(PrimOp::ProjRef(Projection::Prod(1), d.clone()))?;
            (Some(a), Some(w))
        }
        Some(ProjDest::Proj(ps, d)) if ps.len() == 1 && ps[0] == Projection::Prod(0) => {
            (Some(d.clone()), None)
        }
        Some(ProjDest::Proj(ps, d)) if ps.len() == 1 && ps[0] == Projection::Prod(1) => {
            (None, Some(d.clone()))
        }
        Some(other) => {
            debug!("rws dest not decomposable: {:?}", other);
            let pd = other.clone();
            let atom = lower_rws(b, cx, None, req, lam)?;
            place_into(b, &pd, atom.clone())?;
            return Ok(atom);
        }
    };

    let accum_ty = match &req {
        RwsRequest::Writer(monoid) => {
            let empty = subst_atom(&cx.subst, &monoid.empty);
            b.type_of(&empty)?
        }
        RwsRequest::State(init) => {
            let init = subst_atom(&cx.subst, init);
            b.type_of(&init)?
        }
    };
    let ref_dest = match ref_dest {
        Some(r) => r,
        None => b.emit_op(PrimOp::AllocDest(accum_ty))?,
    };

    let lowered_lam = lower_lam(b, cx, lam)?;
    let hof = match req {
        RwsRequest::Writer(monoid) => {
            let monoid = BaseMonoid {
                empty: subst_atom(&cx.subst, &monoid.empty),
                combine: lower_lam(b, cx, &monoid.combine)?,
            };
            Hof::RunWriter(Some(ref_dest.clone()), monoid, Box::new(lowered_lam))
        }
        RwsRequest::State(init) => Hof::RunState(
            Some(ref_dest.clone()),
            subst_atom(&cx.subst, init),
            Box::new(lowered_lam),
        ),
    };
    let ans = b.emit_hof(hof)?;
    let accum = b.emit_op(PrimOp::Freeze(ref_dest))?;
    if let Some(ad) = ans_dest {
        b.emit_op(PrimOp::Place(ad, ans.clone()))?;
    }
    Ok(Atom::prod(vec![ans, accum]))
}
