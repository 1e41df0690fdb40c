#![cfg(test)]

use crate::builder::Builder;
use crate::error::Result;
use crate::imp::*;
use crate::imp_lowering::ImpLowering;
use crate::ir::*;
use crate::name::{NameColor, NameSupply};
use crate::Simplified;

fn f32_ty() -> SType {
    SType::scalar(ScalarBaseType::F32)
}

fn u32_ty() -> SType {
    SType::scalar(ScalarBaseType::U32)
}

fn f32_lit(x: f32) -> Atom {
    Atom::Lit(LitVal::F32(x))
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

fn pipeline(block: Block, supply: NameSupply) -> ImpFunctionWithRecon {
    Simplified::new(block, supply)
        .lower()
        .unwrap()
        .to_imp(&ImpOptions::default())
        .unwrap()
        .function
}

// =============================================================================
// Imp inspection helpers
// =============================================================================

fn for_each_instr(block: &ImpBlock, f: &mut dyn FnMut(&ImpInstr)) {
    for d in &block.decls {
        f(&d.instr);
        match &d.instr {
            ImpInstr::IFor(_, _, _, body) | ImpInstr::IWhile(body) => for_each_instr(body, f),
            ImpInstr::ICond(_, t, e) => {
                for_each_instr(t, f);
                for_each_instr(e, f);
            }
            _ => {}
        }
    }
}

fn count_instrs(block: &ImpBlock, pred: impl Fn(&ImpInstr) -> bool) -> usize {
    let mut n = 0;
    for_each_instr(block, &mut |i| {
        if pred(i) {
            n += 1;
        }
    });
    n
}

fn top_for(block: &ImpBlock) -> &ImpBlock {
    for d in &block.decls {
        if let ImpInstr::IFor(_, _, _, body) = &d.instr {
            return body;
        }
    }
    panic!("no loop in block");
}

// =============================================================================
// End-to-end scenarios
// =============================================================================

#[test]
fn test_simple_tensor_double_to_imp() {
    // t = [1, 2, 3, 4]; for i:(Fin 4). t[i] + t[i]
    let mut b = Builder::new(NameSupply::new());
    let block = b
        .build_block(|b| {
            let ix = IxType::fin_const(4);
            let binder = b.with_fresh_binder(ix.elem_ty.clone());
            let ty = SType::tab(binder, ix, f32_ty());
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
    let f = pipeline(block, b.into_supply());
    let body = &f.function.body;

    // One buffer for the literal table, one for the answer.
    assert_eq!(count_instrs(body, |i| matches!(i, ImpInstr::Alloc(_, _, _))), 2);
    assert_eq!(
        count_instrs(
            body,
            |i| matches!(i, ImpInstr::Alloc(AddressSpace::Heap(_), _, _))
        ),
        1,
        "only the caller-owned answer lives on the heap"
    );
    // The literal table is small and managed: stack, so nothing to free.
    assert_eq!(count_instrs(body, |i| matches!(i, ImpInstr::Free(_))), 0);
    assert_eq!(count_instrs(body, |i| matches!(i, ImpInstr::IFor(_, _, _, _))), 1);

    // Loop body: load, add, store.
    let loop_body = top_for(body);
    assert_eq!(
        count_instrs(loop_body, |i| matches!(i, ImpInstr::IPtrLoad(_))),
        1
    );
    assert_eq!(
        count_instrs(loop_body, |i| matches!(
            i,
            ImpInstr::IBinOp(BinOpKind::FAdd, _, _)
        )),
        1
    );
    assert_eq!(count_instrs(loop_body, |i| matches!(i, ImpInstr::Store(_, _))), 1);

    // The answer is a buffer: returned as its pointer, reconstructed as
    // a table view.
    assert_eq!(f.function.body.results.len(), 1);
    assert_eq!(f.recon.binders.len(), 1);
    assert!(matches!(f.recon.atom, Atom::DestRef(_)));
}

#[test]
fn test_scalar_result_returned_by_value() {
    let mut b = Builder::new(NameSupply::new());
    let block = b
        .build_block(|b| {
            b.emit_op(PrimOp::BinOp(BinOpKind::FAdd, f32_lit(1.0), f32_lit(2.0)))
        })
        .unwrap();
    let f = pipeline(block, b.into_supply());
    assert_eq!(f.function.body.results.len(), 1);
    assert_eq!(f.function.ty.ret_tys, vec![IType::Scalar(ScalarBaseType::F32)]);
    match &f.recon.atom {
        Atom::Var(v) => assert_eq!(*v, f.recon.binders[0].name),
        other => panic!("expected a bare variable reconstruction, got {:?}", other),
    }
}

#[test]
fn test_managed_frees_in_reverse_order_and_memcopy() {
    // Two large intermediate tables copied into the answer: both are
    // heap-managed and freed in reverse allocation order; the copies
    // are single memcopies.
    let mut b = Builder::new(NameSupply::new());
    let block = b
        .build_block(|b| {
            let t = {
                let fe = mk_for(b, IxType::fin_const(300), |b, i| {
                    b.emit_op(PrimOp::Ordinal(IxType::fin_const(300), i))
                })?;
                b.emit(fe)?
            };
            let u = {
                let fe = mk_for(b, IxType::fin_const(400), |b, i| {
                    b.emit_op(PrimOp::Ordinal(IxType::fin_const(400), i))
                })?;
                b.emit(fe)?
            };
            let ix300 = IxType::fin_const(300);
            let ix400 = IxType::fin_const(400);
            let b300 = b.with_fresh_binder(ix300.elem_ty.clone());
            let b400 = b.with_fresh_binder(ix400.elem_ty.clone());
            let pair_ty = SType::Prod(vec![
                SType::tab(b300, ix300, u32_ty()),
                SType::tab(b400, ix400, u32_ty()),
            ]);
            b.emit_typed(pair_ty, SExpr::Atom(Atom::prod(vec![t, u])))
        })
        .unwrap();
    let f = pipeline(block, b.into_supply());
    let body = &f.function.body;

    assert_eq!(
        count_instrs(body, |i| matches!(i, ImpInstr::MemCopy { .. })),
        2
    );

    let heap_allocs: Vec<IExpr> = body
        .decls
        .iter()
        .filter(|d| {
            matches!(d.instr, ImpInstr::Alloc(AddressSpace::Heap(_), _, _))
                && !d.binders.is_empty()
        })
        .map(|d| d.binders[0].to_expr())
        .collect();
    // Answer (two buffers, unmanaged) plus two managed intermediates.
    assert_eq!(heap_allocs.len(), 4);

    let frees: Vec<IExpr> = body
        .decls
        .iter()
        .filter_map(|d| match &d.instr {
            ImpInstr::Free(p) => Some(p.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(frees.len(), 2);
    // Reverse order: the last-allocated managed buffer is freed first.
    assert_eq!(frees[0], heap_allocs[3]);
    assert_eq!(frees[1], heap_allocs[2]);
    // Frees close the block.
    assert!(matches!(
        body.decls[body.decls.len() - 1].instr,
        ImpInstr::Free(_)
    ));
}

#[test]
fn test_case_lowering_is_cond_chain() {
    let mut supply = NameSupply::new();
    let dest_binder = Binder::new(supply.fresh(NameColor::Atom), SType::ref_to(f32_ty()));
    let mut b = Builder::new(supply);
    let block = b
        .build_abs(&[dest_binder.clone()], |b| {
            let scrut = Atom::Con(Con::SumAsProd {
                tys: vec![f32_ty(), f32_ty()],
                tag: Box::new(Atom::Lit(LitVal::U8(1))),
                payloads: vec![f32_lit(1.0), f32_lit(2.0)],
            });
            let mut alts = Vec::new();
            for _ in 0..2 {
                let binder = b.with_fresh_binder(f32_ty());
                let body =
                    b.build_abs(std::slice::from_ref(&binder), |_| Ok(Atom::Var(binder.name)))?;
                alts.push(Alt { binder, body });
            }
            let x = b.emit(SExpr::Case(Box::new(CaseExpr {
                scrut,
                alts,
                ty: f32_ty(),
                effs: EffectRow::pure(),
            })))?;
            b.emit_op(PrimOp::Place(Atom::Var(dest_binder.name), x))?;
            Ok(Atom::unit())
        })
        .unwrap();
    let db = DestBlock {
        dest_binder,
        block,
    };
    let (f, _) =
        crate::imp_lowering::to_imp_function(b.into_supply(), &ImpOptions::default(), &db)
            .unwrap();
    let body = &f.function.body;

    // Two branches, one conditional; each branch writes the scratch
    // cell, then the result is loaded and stored into the answer.
    assert_eq!(count_instrs(body, |i| matches!(i, ImpInstr::ICond(_, _, _))), 1);
    assert_eq!(count_instrs(body, |i| matches!(i, ImpInstr::Store(_, _))), 3);
    assert_eq!(
        count_instrs(body, |i| matches!(
            i,
            ImpInstr::IBinOp(BinOpKind::ICmpEq, _, _)
        )),
        1
    );
}

#[test]
fn test_remember_dest() {
    let mut supply = NameSupply::new();
    let dest_binder = Binder::new(supply.fresh(NameColor::Atom), SType::ref_to(f32_ty()));
    let mut b = Builder::new(supply);
    let block = b
        .build_abs(&[dest_binder.clone()], |b| {
            let ref_binder = b.with_fresh_binder(SType::ref_to(f32_ty()));
            let lam = b.build_lam(vec![ref_binder], |b, bs| {
                b.emit_op(PrimOp::Place(Atom::Var(bs[0].name), f32_lit(2.5)))?;
                Ok(Atom::unit())
            })?;
            b.emit_hof(Hof::RememberDest(Atom::Var(dest_binder.name), Box::new(lam)))?;
            Ok(Atom::unit())
        })
        .unwrap();
    let db = DestBlock {
        dest_binder,
        block,
    };
    let (f, _) =
        crate::imp_lowering::to_imp_function(b.into_supply(), &ImpOptions::default(), &db)
            .unwrap();
    let body = &f.function.body;
    assert_eq!(
        count_instrs(body, |i| matches!(
            i,
            ImpInstr::Store(_, IExpr::Lit(LitVal::F32(x))) if *x == 2.5
        )),
        1
    );
    assert_eq!(body.results.len(), 1);
}

#[test]
fn test_copy_then_load_recovers_structure() {
    // loadDest . makeDest over buffers written by copyAtom: every leaf
    // is stored exactly once and read back as a scalar.
    let mut il = ImpLowering::standalone(NameSupply::new(), ImpOptions::default());
    let ty = SType::Prod(vec![f32_ty(), u32_ty()]);
    let value = Atom::prod(vec![f32_lit(1.5), Atom::Lit(LitVal::U32(7))]);
    let block = il
        .scoped_block(|me| {
            let mat = me.materialize_dest(&ty, AllocType::Managed)?;
            me.copy_atom(&mat.dest, &value)?;
            let loaded = me.load_dest(&mat.dest)?;
            match loaded {
                Atom::Con(Con::ProdCon(xs)) => {
                    assert_eq!(xs.len(), 2);
                    assert!(matches!(xs[0], Atom::ImpVar(_, _)));
                    assert!(matches!(xs[1], Atom::ImpVar(_, _)));
                }
                other => panic!("expected a product of loads, got {:?}", other),
            }
            Ok(Vec::new())
        })
        .unwrap();
    assert_eq!(count_instrs(&block, |i| matches!(i, ImpInstr::Store(_, _))), 2);
    assert_eq!(count_instrs(&block, |i| matches!(i, ImpInstr::IPtrLoad(_))), 2);
}

#[test]
fn test_dep_pair_copy_writes_left_first() {
    // (v : Nat) ,> (Fin v => f32): the left value is stored before the
    // deferred buffer is even allocated, and the runtime pointer is
    // parked in its cell.
    let mut supply = NameSupply::new();
    let dep_binder = Binder::new(supply.fresh(NameColor::Atom), SType::Nat);
    let ix_dep = IxType::fin(Atom::Var(dep_binder.name));
    let tab_binder = Binder::new(supply.fresh(NameColor::Atom), ix_dep.elem_ty.clone());
    let ty = SType::DepPair(Box::new(DepPairType {
        binder: dep_binder,
        lhs: SType::Nat,
        rhs: SType::tab(tab_binder, ix_dep, f32_ty()),
    }));

    let ix2 = IxType::fin(Atom::nat_lit(2));
    let lam_binder = Binder::new(supply.fresh(NameColor::Atom), ix2.elem_ty.clone());
    let table = Atom::TabLam(Box::new(TabLam {
        binder: lam_binder,
        ix: ix2,
        body: Block::from_atom(f32_lit(1.5)),
    }));
    let dp_ty = match &ty {
        SType::DepPair(dp) => dp.clone(),
        _ => unreachable!(),
    };
    let value = Atom::DepPair(Box::new(Atom::nat_lit(2)), Box::new(table), dp_ty);

    let mut il = ImpLowering::standalone(supply, ImpOptions::default());
    let block = il
        .scoped_block(|me| {
            let mat = me.materialize_dest(&ty, AllocType::Managed)?;
            me.copy_atom(&mat.dest, &value)?;
            Ok(Vec::new())
        })
        .unwrap();

    let left_store = block
        .decls
        .iter()
        .position(|d| {
            matches!(d.instr, ImpInstr::Store(_, IExpr::Lit(LitVal::U32(2))))
        })
        .expect("left component store");
    let box_alloc = block
        .decls
        .iter()
        .position(|d| matches!(d.instr, ImpInstr::Alloc(AddressSpace::Heap(_), _, _)))
        .expect("deferred buffer allocation");
    assert!(
        left_store < box_alloc,
        "left component must be written before the right is materialized"
    );
    // Cell parking plus loop of element stores.
    assert_eq!(count_instrs(&block, |i| matches!(i, ImpInstr::IFor(_, _, _, _))), 1);
    assert_eq!(
        count_instrs(&block, |i| matches!(
            i,
            ImpInstr::IFor(_, _, IExpr::Lit(LitVal::U32(2)), _)
        )),
        1
    );
    // The deferred heap buffer is freed with the scope.
    assert_eq!(count_instrs(&block, |i| matches!(i, ImpInstr::Free(_))), 1);
}

#[test]
fn test_vectorized_loop_to_imp() {
    let mut b = Builder::new(NameSupply::new());
    let block = b
        .build_block(|b| {
            let ix = IxType::fin_const(16);
            let fe = mk_for(b, ix.clone(), move |b, i| {
                let o = b.emit_op(PrimOp::Ordinal(ix, i))?;
                let c = b.emit_op(PrimOp::CastOp(f32_ty(), o))?;
                b.emit_op(PrimOp::BinOp(BinOpKind::FAdd, c, f32_lit(1.5)))
            })?;
            b.emit(fe)
        })
        .unwrap();
    let f = Simplified::new(block, b.into_supply())
        .lower()
        .unwrap()
        .vectorize(4)
        .unwrap()
        .to_imp(&ImpOptions::default())
        .unwrap()
        .function;
    let body = &f.function.body;

    let mut for_bound = None;
    for_each_instr(body, &mut |i| {
        if let ImpInstr::IFor(_, _, bound, _) = i {
            for_bound = Some(bound.clone());
        }
    });
    assert_eq!(for_bound, Some(IExpr::idx_lit(4)));
    assert!(count_instrs(body, |i| matches!(i, ImpInstr::IVectorBroadcast(_, _))) >= 1);
    assert_eq!(
        count_instrs(body, |i| matches!(i, ImpInstr::IVectorIota(_))),
        1
    );
    assert_eq!(
        count_instrs(body, |i| matches!(i, ImpInstr::IBitcastOp(_, _))),
        1
    );
}

// =============================================================================
// Export wrappers
// =============================================================================

fn scalar_function() -> crate::ImpLowered {
    let mut b = Builder::new(NameSupply::new());
    let block = b
        .build_block(|b| {
            b.emit_op(PrimOp::BinOp(BinOpKind::FAdd, f32_lit(1.0), f32_lit(2.0)))
        })
        .unwrap();
    Simplified::new(block, b.into_supply())
        .lower()
        .unwrap()
        .to_imp(&ImpOptions::default())
        .unwrap()
}

#[test]
fn test_flat_export_stores_through_dest_registers() {
    let mut lowered = scalar_function();
    let wrapper = lowered.export(ExportCC::Flat).unwrap();
    assert_eq!(wrapper.params.len(), 1);
    assert_eq!(wrapper.ty.cc, CallingConvention::FFIFun);
    assert!(wrapper.ty.ret_tys.is_empty());
    assert_eq!(
        count_instrs(&wrapper.body, |i| matches!(i, ImpInstr::ICall(_, _, _))),
        1
    );
    assert_eq!(
        count_instrs(&wrapper.body, |i| matches!(i, ImpInstr::Store(_, _))),
        1
    );
}

#[test]
fn test_xla_export_single_output_is_direct_buffer() {
    let mut lowered = scalar_function();
    let wrapper = lowered.export(ExportCC::Xla).unwrap();
    // (inputs, outputs); with one output there is no pointer-array
    // indirection, so no loads at all.
    assert_eq!(wrapper.params.len(), 2);
    assert_eq!(
        count_instrs(&wrapper.body, |i| matches!(i, ImpInstr::IPtrLoad(_))),
        0
    );
    assert_eq!(
        count_instrs(&wrapper.body, |i| matches!(i, ImpInstr::IBitcastOp(_, _))),
        1
    );
    assert_eq!(
        count_instrs(&wrapper.body, |i| matches!(i, ImpInstr::Store(_, _))),
        1
    );
}

#[test]
fn test_xla_export_multi_output_unpacks_pointer_array() {
    let mut b = Builder::new(NameSupply::new());
    let block = b
        .build_block(|b| {
            let x = b.emit_op(PrimOp::BinOp(BinOpKind::FAdd, f32_lit(1.0), f32_lit(2.0)))?;
            let y = b.emit_op(PrimOp::BinOp(BinOpKind::FMul, f32_lit(3.0), f32_lit(4.0)))?;
            b.emit_typed(
                SType::Prod(vec![f32_ty(), f32_ty()]),
                SExpr::Atom(Atom::prod(vec![x, y])),
            )
        })
        .unwrap();
    let mut lowered = Simplified::new(block, b.into_supply())
        .lower()
        .unwrap()
        .to_imp(&ImpOptions::default())
        .unwrap();
    let wrapper = lowered.export(ExportCC::Xla).unwrap();
    // Each output pointer is loaded out of the array before the store.
    assert_eq!(
        count_instrs(&wrapper.body, |i| matches!(i, ImpInstr::IPtrLoad(_))),
        2
    );
    assert_eq!(
        count_instrs(&wrapper.body, |i| matches!(i, ImpInstr::Store(_, _))),
        2
    );
}
