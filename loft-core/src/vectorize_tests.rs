#![cfg(test)]

use crate::builder::Builder;
use crate::error::{CompilerError, Result};
use crate::ir::*;
use crate::name::{NameColor, NameSupply};
use crate::vectorize::vectorize_loops;
use crate::Simplified;

fn f32_ty() -> SType {
    SType::scalar(ScalarBaseType::F32)
}

fn mk_for(
    b: &mut Builder,
    ix: IxType,
    f: impl FnOnce(&mut Builder, Atom) -> Result<Atom>,
) -> Result<SExpr> {
    let binder = b.with_fresh_binder(ix.elem_ty.clone());
    let lam = b.build_lam(vec![binder], |b, bs| f(b, Atom::Var(bs[0].name)))?;
    Ok(SExpr::Hof(Hof::For(Box::new(ForExpr {
        dir: Direction::Fwd,
        ix,
        lam,
    }))))
}

/// `for i:(Fin n). cast f32 (ordinal i) + 1.5`, lowered.
fn lowered_affine_loop(n: u32) -> crate::Lowered {
    let mut b = Builder::new(NameSupply::new());
    let block = b
        .build_block(|b| {
            let ix = IxType::fin_const(n);
            let fe = mk_for(b, ix.clone(), move |b, i| {
                let o = b.emit_op(PrimOp::Ordinal(ix, i))?;
                let c = b.emit_op(PrimOp::CastOp(f32_ty(), o))?;
                b.emit_op(PrimOp::BinOp(BinOpKind::FAdd, c, Atom::Lit(LitVal::F32(1.5))))
            })?;
            b.emit(fe)
        })
        .unwrap();
    Simplified::new(block, b.into_supply()).lower().unwrap()
}

fn for_each_expr(block: &Block, f: &mut dyn FnMut(&SExpr)) {
    for decl in &block.decls {
        f(&decl.expr);
        if let SExpr::Hof(Hof::Seq(se)) = &decl.expr {
            for_each_expr(&se.lam.body, f);
        }
    }
}

fn count_matching(block: &Block, pred: impl Fn(&SExpr) -> bool) -> usize {
    let mut n = 0;
    for_each_expr(block, &mut |e| {
        if pred(e) {
            n += 1;
        }
    });
    n
}

fn top_seq(block: &Block) -> SeqExpr {
    for decl in &block.decls {
        if let SExpr::Hof(Hof::Seq(se)) = &decl.expr {
            return (**se).clone();
        }
    }
    panic!("no seq in block");
}

fn trip_count(se: &SeqExpr) -> u32 {
    match &se.ix.dict {
        IxDict::Fin(Atom::Con(Con::Newtype { inner, .. })) => match **inner {
            Atom::Lit(LitVal::U32(n)) => n,
            _ => panic!("trip count is not a literal"),
        },
        other => panic!("unexpected dict {:?}", other),
    }
}

#[test]
fn test_vectorize_affine_store() {
    let lowered = lowered_affine_loop(16);
    let (db, _) = vectorize_loops(lowered.supply, &lowered.dest_block, 4).unwrap();

    let se = top_seq(&db.block);
    assert_eq!(trip_count(&se), 4, "16 iterations at width 4");

    let body = &se.lam.body;
    assert_eq!(
        count_matching(body, |e| matches!(e, SExpr::Op(PrimOp::VectorSubref(_, _, _)))),
        1
    );
    assert!(
        count_matching(body, |e| matches!(
            e,
            SExpr::Op(PrimOp::VectorBroadcast(_, _))
        )) >= 1
    );
    assert_eq!(
        count_matching(body, |e| matches!(e, SExpr::Op(PrimOp::VectorIota(_)))),
        1
    );
    assert_eq!(
        count_matching(body, |e| matches!(e, SExpr::Op(PrimOp::Place(_, _)))),
        1
    );
    // The lane base: i = vi * 4.
    assert_eq!(
        count_matching(body, |e| matches!(
            e,
            SExpr::Op(PrimOp::BinOp(BinOpKind::IMul, _, Atom::Lit(LitVal::U32(4))))
        )),
        1
    );
}

#[test]
fn test_vectorization_is_idempotent() {
    let lowered = lowered_affine_loop(16);
    let (once, supply) = vectorize_loops(lowered.supply, &lowered.dest_block, 4).unwrap();
    let (twice, _) = vectorize_loops(supply, &once, 4).unwrap();
    assert_eq!(once, twice);
}

#[test]
fn test_refuses_indivisible_trip_count() {
    let lowered = lowered_affine_loop(10);
    let original = lowered.dest_block.clone();
    let (db, _) = vectorize_loops(lowered.supply, &original, 4).unwrap();
    assert_eq!(db, original, "loop must be kept verbatim");
}

#[test]
fn test_refuses_unsupported_expression() {
    // A nested while loop is outside the whitelist.
    let mut b = Builder::new(NameSupply::new());
    let block = b
        .build_block(|b| {
            let ix = IxType::fin_const(8);
            let fe = mk_for(b, ix.clone(), move |b, i| {
                let cond = b.build_block(|_| Ok(Atom::Lit(LitVal::U8(0))))?;
                b.emit_hof(Hof::While(Box::new(cond)))?;
                b.emit_op(PrimOp::Ordinal(ix, i))
            })?;
            b.emit(fe)
        })
        .unwrap();
    let lowered = Simplified::new(block, b.into_supply()).lower().unwrap();
    let original = lowered.dest_block.clone();
    let (db, _) = vectorize_loops(lowered.supply, &original, 4).unwrap();
    assert_eq!(db, original);
}

#[test]
fn test_uniform_store_of_varying_value_is_conflict() {
    // All lanes storing through one scalar reference is a write
    // conflict, reported as a hard error rather than a refusal.
    let mut supply = NameSupply::new();
    let dest_binder = Binder::new(supply.fresh(NameColor::Atom), SType::ref_to(f32_ty()));
    let mut b = Builder::new(supply);
    let ix = IxType::fin_const(8);
    let block = b
        .build_abs(&[dest_binder.clone()], |b| {
            let i_binder = b.with_fresh_binder(ix.elem_ty.clone());
            let c_binder =
                b.with_fresh_binder(SType::Prod(vec![SType::ref_to(f32_ty())]));
            let ix2 = ix.clone();
            let lam = b.build_lam(vec![i_binder, c_binder], |b, bs| {
                let o = b.emit_op(PrimOp::Ordinal(ix2, Atom::Var(bs[0].name)))?;
                let f = b.emit_op(PrimOp::CastOp(f32_ty(), o))?;
                let slot = Atom::Var(bs[1].name).proj(Projection::Prod(0));
                b.emit_op(PrimOp::Place(slot, f))?;
                Ok(Atom::unit())
            })?;
            b.emit_hof(Hof::Seq(Box::new(SeqExpr {
                dir: Direction::Fwd,
                ix,
                carry: Atom::prod(vec![Atom::Var(dest_binder.name)]),
                lam,
            })))?;
            Ok(Atom::unit())
        })
        .unwrap();
    let db = DestBlock {
        dest_binder,
        block,
    };
    let result = vectorize_loops(b.into_supply(), &db, 4);
    match result {
        Err(CompilerError::InternalError { tag, .. }) => assert_eq!(tag, "write-conflict"),
        other => panic!("expected a write conflict, got {:?}", other),
    }
}

#[test]
fn test_refuses_effectful_body() {
    // A loop body with a state effect is not vectorized.
    let mut b = Builder::new(NameSupply::new());
    let block = b
        .build_block(|b| {
            let h = b.with_fresh_binder(SType::unit());
            let r = b.with_fresh_binder(SType::ref_to(f32_ty()));
            let handler = b.build_lam(vec![h, r], |b, bs| {
                let ref_atom = Atom::Var(bs[1].name);
                let ix = IxType::fin_const(8);
                let fe = mk_for(b, ix.clone(), move |b, i| {
                    let o = b.emit_op(PrimOp::Ordinal(ix, i))?;
                    let f = b.emit_op(PrimOp::CastOp(f32_ty(), o))?;
                    b.emit_op(PrimOp::RefOp(ref_atom, RefOp::Put(f)))?;
                    Ok(Atom::unit())
                })?;
                let _ = b.emit(fe)?;
                b.emit_op(PrimOp::RefOp(Atom::Var(bs[1].name), RefOp::Get))
            })?;
            let pair = b.emit_hof(Hof::RunState(
                None,
                Atom::Lit(LitVal::F32(0.0)),
                Box::new(handler),
            ))?;
            Ok(pair.proj(Projection::Prod(0)))
        })
        .unwrap();
    let lowered = Simplified::new(block, b.into_supply()).lower().unwrap();
    let original = lowered.dest_block.clone();
    let (db, _) = vectorize_loops(lowered.supply, &original, 4).unwrap();
    assert_eq!(db, original, "effectful loop must be kept verbatim");
}
