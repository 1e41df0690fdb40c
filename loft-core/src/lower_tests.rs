#![cfg(test)]

use crate::builder::Builder;
use crate::error::{CompilerError, Result};
use crate::ir::*;
use crate::lower::lower_fully_sequential;
use crate::name::NameSupply;

// =============================================================================
// Construction helpers
// =============================================================================

fn f32_ty() -> SType {
    SType::scalar(ScalarBaseType::F32)
}

fn f32_lit(x: f32) -> Atom {
    Atom::Lit(LitVal::F32(x))
}

fn tab_ty(b: &mut Builder, n: u32, elem: SType) -> SType {
    let ix = IxType::fin_const(n);
    let binder = b.with_fresh_binder(ix.elem_ty.clone());
    SType::tab(binder, ix, elem)
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

// =============================================================================
// Inspection helpers
// =============================================================================

fn for_each_expr(block: &Block, f: &mut dyn FnMut(&SExpr)) {
    for decl in &block.decls {
        f(&decl.expr);
        match &decl.expr {
            SExpr::Hof(Hof::For(fe)) => for_each_expr(&fe.lam.body, f),
            SExpr::Hof(Hof::Seq(se)) => for_each_expr(&se.lam.body, f),
            SExpr::Hof(Hof::While(b))
            | SExpr::Hof(Hof::RunIO(b))
            | SExpr::Hof(Hof::RunInit(b)) => for_each_expr(b, f),
            SExpr::Hof(Hof::RunReader(_, lam))
            | SExpr::Hof(Hof::RunWriter(_, _, lam))
            | SExpr::Hof(Hof::RunState(_, _, lam))
            | SExpr::Hof(Hof::RememberDest(_, lam)) => for_each_expr(&lam.body, f),
            SExpr::Case(case) => {
                for alt in &case.alts {
                    for_each_expr(&alt.body, f);
                }
            }
            _ => {}
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

fn count_alloc_dests(block: &Block) -> usize {
    count_matching(block, |e| matches!(e, SExpr::Op(PrimOp::AllocDest(_))))
}

fn count_places(block: &Block) -> usize {
    count_matching(block, |e| matches!(e, SExpr::Op(PrimOp::Place(_, _))))
}

fn count_seqs(block: &Block) -> usize {
    count_matching(block, |e| matches!(e, SExpr::Hof(Hof::Seq(_))))
}

fn collect_seqs(block: &Block) -> Vec<SeqExpr> {
    let mut seqs = Vec::new();
    for_each_expr(block, &mut |e| {
        if let SExpr::Hof(Hof::Seq(se)) = e {
            seqs.push((**se).clone());
        }
    });
    seqs
}

fn no_fors_remain(block: &Block) -> bool {
    count_matching(block, |e| matches!(e, SExpr::Hof(Hof::For(_)))) == 0
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn test_simple_tensor_double() {
    // t = [1, 2, 3, 4]; for i:(Fin 4). t[i] + t[i]
    let mut b = Builder::new(NameSupply::new());
    let block = b
        .build_block(|b| {
            let ty = tab_ty(b, 4, f32_ty());
            let t = b.emit_op(PrimOp::TabCon(
                ty,
                vec![f32_lit(1.0), f32_lit(2.0), f32_lit(3.0), f32_lit(4.0)],
            ))?;
            let fe = mk_for(b, IxType::fin_const(4), |b, i| {
                let x = b.emit(SExpr::TabApp(t.clone(), vec![i]))?;
                b.emit_op(PrimOp::BinOp(BinOpKind::FAdd, x.clone(), x))
            })?;
            b.emit(fe)
        })
        .unwrap();
    let (db, _) = lower_fully_sequential(b.into_supply(), &block).unwrap();

    // The comprehension writes straight into the caller's destination;
    // only the table literal needs its own buffer.
    assert!(no_fors_remain(&db.block));
    assert_eq!(count_alloc_dests(&db.block), 1);
    assert_eq!(count_seqs(&db.block), 1);

    let seqs = collect_seqs(&db.block);
    assert_eq!(seqs[0].dir, Direction::Fwd);
    assert_eq!(count_places(&seqs[0].lam.body), 1);
    assert_eq!(count_alloc_dests(&seqs[0].lam.body), 0);
}

#[test]
fn test_nested_for_threads_dest() {
    // for i:(Fin 10). for j:(Fin 20). ord i + ord j
    let mut b = Builder::new(NameSupply::new());
    let block = b
        .build_block(|b| {
            let outer_ix = IxType::fin_const(10);
            let inner_ix = IxType::fin_const(20);
            let fe = mk_for(b, outer_ix.clone(), |b, i| {
                let inner_ix2 = inner_ix.clone();
                let outer_ix2 = outer_ix.clone();
                let inner = mk_for(b, inner_ix.clone(), move |b, j| {
                    let oi = b.emit_op(PrimOp::Ordinal(outer_ix2, i))?;
                    let oj = b.emit_op(PrimOp::Ordinal(inner_ix2, j))?;
                    b.emit_op(PrimOp::BinOp(BinOpKind::IAdd, oi, oj))
                })?;
                b.emit(inner)
            })?;
            b.emit(fe)
        })
        .unwrap();
    let (db, _) = lower_fully_sequential(b.into_supply(), &block).unwrap();

    // No scratch buffer for the inner rows: the element destination of
    // the outer loop is threaded down.
    assert!(no_fors_remain(&db.block));
    assert_eq!(count_alloc_dests(&db.block), 0);
    assert_eq!(count_seqs(&db.block), 2);
    assert_eq!(count_places(&db.block), 1);

    let seqs = collect_seqs(&db.block);
    let outer = &seqs[0];
    assert_eq!(
        count_matching(&outer.lam.body, |e| matches!(
            e,
            SExpr::Op(PrimOp::IndexRef(_, _))
        )),
        2
    );
}

#[test]
fn test_type_preservation() {
    // A block of type T lowers to a dest block whose binder has type
    // Ref T.
    let mut b = Builder::new(NameSupply::new());
    let block = b
        .build_block(|b| {
            let x = b.emit_op(PrimOp::BinOp(BinOpKind::FAdd, f32_lit(1.0), f32_lit(2.0)))?;
            let y = b.emit_op(PrimOp::BinOp(BinOpKind::FMul, x.clone(), x))?;
            b.emit_typed(
                SType::Prod(vec![f32_ty(), f32_ty()]),
                SExpr::Atom(Atom::prod(vec![y.clone(), y])),
            )
        })
        .unwrap();
    let expected = block.ann.as_ref().unwrap().ty.clone();
    let (db, _) = lower_fully_sequential(b.into_supply(), &block).unwrap();
    assert_eq!(db.dest_binder.ty, SType::ref_to(expected));
}

#[test]
fn test_projection_dest_routing() {
    // The block result is a projection of a local pair; the projected
    // slot is written with a single Place.
    let mut b = Builder::new(NameSupply::new());
    let block = b
        .build_block(|b| {
            let x = b.emit_op(PrimOp::BinOp(BinOpKind::FAdd, f32_lit(1.0), f32_lit(2.0)))?;
            let y = b.emit_op(PrimOp::BinOp(BinOpKind::FMul, f32_lit(3.0), f32_lit(4.0)))?;
            let pair = b.emit_typed(
                SType::Prod(vec![f32_ty(), f32_ty()]),
                SExpr::Atom(Atom::prod(vec![x, y])),
            )?;
            Ok(pair.proj(Projection::Prod(0)))
        })
        .unwrap();
    let (db, _) = lower_fully_sequential(b.into_supply(), &block).unwrap();
    assert_eq!(count_places(&db.block), 1);
    assert_eq!(count_alloc_dests(&db.block), 0);
}

#[test]
fn test_singleton_for_skips_allocation() {
    // A unit-valued comprehension runs for effects only: no
    // destination, unit carry.
    let mut b = Builder::new(NameSupply::new());
    let block = b
        .build_block(|b| {
            let s = mk_for(b, IxType::fin_const(8), |_, _| Ok(Atom::unit()))?;
            let _ = b.emit(s)?;
            let r = mk_for(b, IxType::fin_const(3), |b, i| {
                b.emit_op(PrimOp::Ordinal(IxType::fin_const(3), i))
            })?;
            b.emit(r)
        })
        .unwrap();
    let (db, _) = lower_fully_sequential(b.into_supply(), &block).unwrap();
    assert_eq!(count_seqs(&db.block), 2);
    assert_eq!(count_alloc_dests(&db.block), 0);
    let seqs = collect_seqs(&db.block);
    assert!(seqs.iter().any(|se| se.carry.is_unit()));
}

#[test]
fn test_tab_con_lowering() {
    // Each element gets its own indexed destination and one Place.
    let mut b = Builder::new(NameSupply::new());
    let block = b
        .build_block(|b| {
            let ty = tab_ty(b, 3, f32_ty());
            b.emit_op(PrimOp::TabCon(
                ty,
                vec![f32_lit(1.0), f32_lit(2.0), f32_lit(3.0)],
            ))
        })
        .unwrap();
    let (db, _) = lower_fully_sequential(b.into_supply(), &block).unwrap();
    // Routed into the answer destination directly.
    assert_eq!(count_alloc_dests(&db.block), 0);
    assert_eq!(count_places(&db.block), 3);
    assert_eq!(
        count_matching(&db.block, |e| matches!(
            e,
            SExpr::Op(PrimOp::UnsafeFromOrdinal(_, _))
        )),
        3
    );
}

#[test]
fn test_rws_split_answer_only() {
    // runWriter whose answer flows to the caller's destination: the
    // accumulator buffer is allocated fresh, the answer placed
    // directly.
    let mut b = Builder::new(NameSupply::new());
    let block = b
        .build_block(|b| {
            let combine_binders = vec![
                b.with_fresh_binder(f32_ty()),
                b.with_fresh_binder(f32_ty()),
            ];
            let combine = b.build_lam(combine_binders, |b, bs| {
                b.emit_op(PrimOp::BinOp(
                    BinOpKind::FAdd,
                    Atom::Var(bs[0].name),
                    Atom::Var(bs[1].name),
                ))
            })?;
            let monoid = BaseMonoid {
                empty: f32_lit(0.0),
                combine,
            };

            let h = b.with_fresh_binder(SType::unit());
            let r = b.with_fresh_binder(SType::ref_to(f32_ty()));
            let extend_binders = vec![
                b.with_fresh_binder(f32_ty()),
                b.with_fresh_binder(f32_ty()),
            ];
            let extend_combine = b.build_lam(extend_binders, |b, bs| {
                b.emit_op(PrimOp::BinOp(
                    BinOpKind::FAdd,
                    Atom::Var(bs[0].name),
                    Atom::Var(bs[1].name),
                ))
            })?;
            let handler = b.build_lam(vec![h, r], |b, bs| {
                b.emit_op(PrimOp::RefOp(
                    Atom::Var(bs[1].name),
                    RefOp::Extend(Box::new(extend_combine), f32_lit(1.0)),
                ))?;
                Ok(f32_lit(2.5))
            })?;

            let pair = b.emit_hof(Hof::RunWriter(None, monoid, Box::new(handler)))?;
            Ok(pair.proj(Projection::Prod(0)))
        })
        .unwrap();
    let (db, _) = lower_fully_sequential(b.into_supply(), &block).unwrap();

    // One fresh allocation: the writer accumulator.
    assert_eq!(count_alloc_dests(&db.block), 1);
    // The handler now carries its destination.
    assert_eq!(
        count_matching(&db.block, |e| matches!(
            e,
            SExpr::Hof(Hof::RunWriter(Some(_), _, _))
        )),
        1
    );
    // The answer is placed into the caller's slot.
    assert_eq!(count_places(&db.block), 1);
}

#[test]
fn test_result_type_escape_is_hoist_failure() {
    // A block whose result type mentions its own binder cannot be
    // sealed.
    let mut b = Builder::new(NameSupply::new());
    let result = b.build_block(|b| {
        let n = b.emit_op(PrimOp::CastOp(SType::Nat, Atom::idx_lit(5)))?;
        let fe = mk_for(b, IxType::fin(n), |b, i| {
            b.emit_op(PrimOp::Ordinal(
                IxType::fin(Atom::nat_lit(5)),
                i,
            ))
        })?;
        b.emit(fe)
    });
    match result {
        Err(CompilerError::InternalError { tag, .. }) => assert_eq!(tag, "hoist-failure"),
        other => panic!("expected a hoist failure, got {:?}", other),
    }
}

#[test]
fn test_lowered_input_rejected() {
    // Lowered-only constructors are invalid Simp-phase input.
    let mut b = Builder::new(NameSupply::new());
    let block = b
        .build_block(|b| {
            let d = b.emit_op(PrimOp::AllocDest(f32_ty()))?;
            b.emit_op(PrimOp::Freeze(d))
        })
        .unwrap();
    let result = lower_fully_sequential(b.into_supply(), &block);
    assert!(result.is_err());
}

#[test]
fn test_diagnostics_format() {
    let pair = SType::Prod(vec![f32_ty(), SType::ref_to(f32_ty())]);
    assert_eq!(crate::diags::format_type(&pair), "(f32, Ref f32)");
    assert_eq!(
        crate::diags::format_atom(&Atom::prod(vec![Atom::idx_lit(3)])),
        "(U32(3))"
    );
}

#[test]
fn test_lowering_is_dest_complete() {
    // Every Place writes through either the answer destination or a
    // destination derived from one; spot-check that the output block
    // produces unit.
    let mut b = Builder::new(NameSupply::new());
    let block = b
        .build_block(|b| {
            let fe = mk_for(b, IxType::fin_const(6), |b, i| {
                b.emit_op(PrimOp::Ordinal(IxType::fin_const(6), i))
            })?;
            b.emit(fe)
        })
        .unwrap();
    let (db, _) = lower_fully_sequential(b.into_supply(), &block).unwrap();
    assert!(db.block.result.is_unit());
}
