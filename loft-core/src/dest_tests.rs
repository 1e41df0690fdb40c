#![cfg(test)]

use crate::builder::Builder;
use crate::dest::make_dest;
use crate::imp::ImpOptions;
use crate::ir::fold::free_vars_block;
use crate::ir::*;
use crate::name::{NameColor, NameSupply};

fn f32_ty() -> SType {
    SType::scalar(ScalarBaseType::F32)
}

fn mk(ty: &SType) -> AbsPtrs {
    let mut b = Builder::new(NameSupply::new());
    let (decls, abs) = b
        .build_scoped(|b| make_dest(b, &ImpOptions::default(), AllocType::Managed, ty))
        .unwrap();
    assert!(
        decls.is_empty(),
        "destination synthesis must not leak decls into the ambient scope"
    );
    abs
}

fn fin_tab(supply: &mut NameSupply, n: u32, elem: SType) -> SType {
    let ix = IxType::fin_const(n);
    let binder = Binder::new(supply.fresh(NameColor::Atom), ix.elem_ty.clone());
    SType::tab(binder, ix, elem)
}

#[test]
fn test_scalar_dest_is_one_stack_cell() {
    let abs = mk(&f32_ty());
    assert_eq!(abs.ptrs.len(), 1);
    let info = &abs.ptrs[0];
    assert!(info.scalar_cell);
    assert_eq!(info.ptr_ty.addr_space, AddressSpace::Stack);
    assert_eq!(info.size.result, Atom::idx_lit(1));
    assert!(matches!(abs.dest, Dest::BaseRef { .. }));
}

#[test]
fn test_small_table_on_stack_large_on_heap() {
    let mut supply = NameSupply::new();
    let small = fin_tab(&mut supply, 4, f32_ty());
    let abs = mk(&small);
    assert_eq!(abs.ptrs.len(), 1);
    assert!(!abs.ptrs[0].scalar_cell);
    assert_eq!(abs.ptrs[0].ptr_ty.addr_space, AddressSpace::Stack);
    assert_eq!(abs.ptrs[0].size.result, Atom::idx_lit(4));

    let large = fin_tab(&mut supply, 300, f32_ty());
    let abs = mk(&large);
    assert_eq!(
        abs.ptrs[0].ptr_ty.addr_space,
        AddressSpace::Heap(Device::Cpu)
    );
    assert_eq!(abs.ptrs[0].size.result, Atom::idx_lit(300));
}

#[test]
fn test_table_dest_offsets_by_ordinal() {
    let mut supply = NameSupply::new();
    let ty = fin_tab(&mut supply, 8, f32_ty());
    let abs = mk(&ty);
    let td = match &abs.dest {
        Dest::TabRef(td) => td,
        other => panic!("expected a table destination, got {:?}", other),
    };
    // One pointer-offset decl, offset by exactly the index ordinal.
    assert_eq!(td.body.decls.len(), 1);
    match &td.body.decls[0].expr {
        SExpr::Op(PrimOp::PtrOffset(base, off)) => {
            assert_eq!(*base, Atom::Var(abs.ptrs[0].binder.name));
            assert_eq!(
                *off,
                Atom::ProjectElt(vec![Projection::Unwrap], td.binder.name)
            );
        }
        other => panic!("expected a pointer offset, got {:?}", other),
    }
    assert!(matches!(&td.body.result, Atom::DestRef(_)));
}

#[test]
fn test_nested_table_single_buffer() {
    // Fin 3 => Fin 5 => f32 is one 15-element buffer.
    let mut supply = NameSupply::new();
    let inner = fin_tab(&mut supply, 5, f32_ty());
    let ty = fin_tab(&mut supply, 3, inner);
    let abs = mk(&ty);
    assert_eq!(abs.ptrs.len(), 1);
    assert_eq!(abs.ptrs[0].size.result, Atom::idx_lit(15));
    let outer = match &abs.dest {
        Dest::TabRef(td) => td,
        other => panic!("expected a table destination, got {:?}", other),
    };
    match &outer.body.result {
        Atom::DestRef(inner) => assert!(matches!(&**inner, Dest::TabRef(_))),
        other => panic!("expected a nested table destination, got {:?}", other),
    }
}

#[test]
fn test_product_dest_one_pointer_per_leaf() {
    let mut supply = NameSupply::new();
    let ty = SType::Prod(vec![f32_ty(), fin_tab(&mut supply, 2, f32_ty())]);
    let abs = mk(&ty);
    assert_eq!(abs.ptrs.len(), 2);
    match &abs.dest {
        Dest::ProdRef(ds) => {
            assert_eq!(ds.len(), 2);
            assert!(matches!(ds[0], Dest::BaseRef { .. }));
            assert!(matches!(ds[1], Dest::TabRef(_)));
        }
        other => panic!("expected a product destination, got {:?}", other),
    }
}

#[test]
fn test_sum_dest_preallocates_all_payloads() {
    let ty = SType::Sum(vec![f32_ty(), SType::scalar(ScalarBaseType::U32)]);
    let abs = mk(&ty);
    // Tag plus both payloads, no branching in address computation.
    assert_eq!(abs.ptrs.len(), 3);
    match &abs.dest {
        Dest::SumAsProdRef { tag, payloads, .. } => {
            assert!(matches!(
                &**tag,
                Dest::BaseRef {
                    ty: BaseType::Scalar(ScalarBaseType::U8),
                    ..
                }
            ));
            assert_eq!(payloads.len(), 2);
        }
        other => panic!("expected a sum destination, got {:?}", other),
    }
}

#[test]
fn test_unit_dest_needs_no_memory() {
    let abs = mk(&SType::unit());
    assert!(abs.ptrs.is_empty());
    assert!(matches!(&abs.dest, Dest::ProdRef(ds) if ds.is_empty()));
}

#[test]
fn test_record_dest_wraps_representation() {
    let ty = SType::Record(vec![
        ("x".to_string(), f32_ty()),
        ("y".to_string(), f32_ty()),
    ]);
    let abs = mk(&ty);
    assert_eq!(abs.ptrs.len(), 2);
    match &abs.dest {
        Dest::NewtypeRef { inner, .. } => {
            assert!(matches!(&**inner, Dest::ProdRef(ds) if ds.len() == 2))
        }
        other => panic!("expected a newtype destination, got {:?}", other),
    }
}

#[test]
fn test_dependent_table_falls_back_to_boxed() {
    // (v : Nat) ,> (Fin v => f32): the right component's size is only
    // known once the left value is written.
    let mut supply = NameSupply::new();
    let dep_binder = Binder::new(supply.fresh(NameColor::Atom), SType::Nat);
    let ix = IxType::fin(Atom::Var(dep_binder.name));
    let tab_binder = Binder::new(supply.fresh(NameColor::Atom), ix.elem_ty.clone());
    let rhs = SType::tab(tab_binder, ix, f32_ty());
    let ty = SType::DepPair(Box::new(DepPairType {
        binder: dep_binder,
        lhs: SType::Nat,
        rhs,
    }));

    let abs = mk(&ty);
    // The left leaf plus one pointer cell for the deferred buffer.
    assert_eq!(abs.ptrs.len(), 2);
    let (lhs, rhs_abs) = match &abs.dest {
        Dest::DepPairRef { lhs, rhs, .. } => (lhs, rhs),
        other => panic!("expected a dependent-pair destination, got {:?}", other),
    };
    assert!(matches!(&**lhs, Dest::NewtypeRef { .. }));
    match &rhs_abs.dest {
        Dest::BoxedRef { boxes, inner, .. } => {
            assert_eq!(boxes.len(), 1);
            // The deferred size depends on the left value.
            let fvs = free_vars_block(&boxes[0].size);
            assert!(fvs.contains(&rhs_abs.binder.name));
            // The cell itself is a pointer-sized leaf in the outer
            // layout.
            assert!(matches!(&boxes[0].cell, Dest::BaseRef { .. }));
            assert!(matches!(&**inner, Dest::TabRef(_)));
        }
        other => panic!("expected a boxed destination, got {:?}", other),
    }
}

#[test]
fn test_fin_dest_wraps_index_rep() {
    let ty = SType::fin(Atom::nat_lit(10));
    let abs = mk(&ty);
    assert_eq!(abs.ptrs.len(), 1);
    match &abs.dest {
        Dest::NewtypeRef { ty, inner } => {
            assert!(matches!(ty, SType::Fin(_)));
            assert!(matches!(
                &**inner,
                Dest::BaseRef {
                    ty: BaseType::Scalar(ScalarBaseType::U32),
                    ..
                }
            ));
        }
        other => panic!("expected a newtype destination, got {:?}", other),
    }
}

#[test]
fn test_dest_value_ty_roundtrip() {
    let mut supply = NameSupply::new();
    let ty = SType::Prod(vec![f32_ty(), fin_tab(&mut supply, 7, f32_ty())]);
    let abs = mk(&ty);
    // The synthesized destination accepts exactly the requested type,
    // modulo binder naming in table types.
    match (&abs.dest.value_ty(), &ty) {
        (SType::Prod(got), SType::Prod(want)) => {
            assert_eq!(got.len(), want.len());
            assert_eq!(got[0], want[0]);
            match (&got[1], &want[1]) {
                (SType::Tab(g), SType::Tab(w)) => {
                    assert_eq!(g.body, w.body);
                    assert_eq!(g.ix.dict, w.ix.dict);
                }
                other => panic!("expected table types, got {:?}", other),
            }
        }
        other => panic!("expected product types, got {:?}", other),
    }
}
