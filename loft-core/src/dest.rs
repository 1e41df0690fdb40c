//! Destination synthesis.
//!
//! `make_dest` turns a type into a tree of typed write handles over
//! flat buffers, together with the pointer allocations that realize
//! it. The recursion tracks the telescope of table index types crossed
//! so far; every base-type leaf becomes one pointer request whose size
//! is the telescope's element count and whose per-element offset is
//! computed by the index algebra.
//!
//! Sum payloads are all pre-allocated: destination addresses stay
//! statically determined and address computation needs no control
//! flow, at the cost of unused memory for the untaken cases.

use crate::algebra::{compute_offset, elem_count, IxBinder};
use crate::builder::Builder;
use crate::err_internal;
use crate::error::Result;
use crate::imp::ImpOptions;
use crate::imp_lowering::choose_addr_space;
use crate::ir::fold::{free_vars_ix, subst_type};
use crate::ir::queries::rep_ty;
use crate::ir::*;
use crate::name::{Name, NameColor};
use log::trace;
use std::collections::HashMap;

/// The table telescope crossed on the way to the current leaf, with
/// the index atom in scope for each entry.
#[derive(Debug, Clone, Default)]
struct DestIdxs {
    telescope: Vec<IxBinder>,
    atoms: Vec<Atom>,
}

impl DestIdxs {
    fn extended(&self, binder: Binder, ix: IxType, atom: Atom) -> DestIdxs {
        let mut result = self.clone();
        result.telescope.push(IxBinder { binder, ix });
        result.atoms.push(atom);
        result
    }
}

struct DestCtx {
    opts: ImpOptions,
    alloc: AllocType,
    ptrs: Vec<DestPtrInfo>,
}

/// Construct a destination for a value of type `ty`, together with the
/// pointer binders whose allocations realize it.
pub fn make_dest(
    b: &mut Builder,
    opts: &ImpOptions,
    alloc: AllocType,
    ty: &SType,
) -> Result<AbsPtrs> {
    let mut ctx = DestCtx {
        opts: *opts,
        alloc,
        ptrs: Vec::new(),
    };
    let dest = make_dest_rec(b, &mut ctx, &DestIdxs::default(), &[], ty)?;
    trace!(
        "make_dest: {} pointer(s) for a value of type {:?}",
        ctx.ptrs.len(),
        ty
    );
    Ok(AbsPtrs {
        ptrs: ctx.ptrs,
        dest,
    })
}

fn make_dest_rec(
    b: &mut Builder,
    ctx: &mut DestCtx,
    idxs: &DestIdxs,
    dep_vars: &[Name],
    ty: &SType,
) -> Result<Dest> {
    match ty {
        SType::Tab(tab) => {
            let depends = {
                let fvs = free_vars_ix(&tab.ix);
                dep_vars.iter().any(|v| fvs.contains(v))
            };
            if depends {
                return make_boxed_dest(b, ctx, idxs, ty);
            }
            let binder = b.with_fresh_binder(tab.ix.elem_ty.clone());
            let body_ty = {
                let mut map = HashMap::new();
                map.insert(tab.binder.name, Atom::Var(binder.name));
                subst_type(&map, &tab.body)
            };
            let extended = idxs.extended(binder.clone(), tab.ix.clone(), Atom::Var(binder.name));
            let binder_for_abs = binder.clone();
            let body = b.build_abs(std::slice::from_ref(&binder_for_abs), |b| {
                let inner = make_dest_rec(b, ctx, &extended, dep_vars, &body_ty)?;
                Ok(Atom::DestRef(Box::new(inner)))
            })?;
            Ok(Dest::TabRef(Box::new(TabDest {
                binder,
                ix: tab.ix.clone(),
                body,
            })))
        }
        SType::Base(base) => make_base_leaf(b, ctx, idxs, base.clone()),
        SType::Prod(tys) => {
            let mut ds = Vec::with_capacity(tys.len());
            for t in tys {
                ds.push(make_dest_rec(b, ctx, idxs, dep_vars, t)?);
            }
            Ok(Dest::ProdRef(ds))
        }
        SType::Sum(tys) => {
            let tag = make_base_leaf(b, ctx, idxs, BaseType::Scalar(TAG_REP))?;
            let mut payloads = Vec::with_capacity(tys.len());
            for t in tys {
                payloads.push(make_dest_rec(b, ctx, idxs, dep_vars, t)?);
            }
            Ok(Dest::SumAsProdRef {
                tys: tys.clone(),
                tag: Box::new(tag),
                payloads,
            })
        }
        SType::Nat | SType::Fin(_) | SType::TypeCon { .. } | SType::Record(_)
        | SType::Variant(_) => {
            let rep = rep_ty(ty)?;
            let inner = make_dest_rec(b, ctx, idxs, dep_vars, &rep)?;
            Ok(Dest::NewtypeRef {
                ty: ty.clone(),
                inner: Box::new(inner),
            })
        }
        SType::DepPair(dp) => {
            let lhs = make_dest_rec(b, ctx, idxs, dep_vars, &dp.lhs)?;
            let dep_binder = b.with_fresh_binder(dp.lhs.clone());
            b.bind_param(&dep_binder);
            let rhs_ty = {
                let mut map = HashMap::new();
                map.insert(dp.binder.name, Atom::Var(dep_binder.name));
                subst_type(&map, &dp.rhs)
            };
            let mut rhs_deps: Vec<Name> = dep_vars.to_vec();
            rhs_deps.push(dep_binder.name);
            let rhs = make_dest_rec(b, ctx, idxs, &rhs_deps, &rhs_ty)?;
            Ok(Dest::DepPairRef {
                lhs: Box::new(lhs),
                rhs: Box::new(DestAbs {
                    binder: dep_binder,
                    dest: rhs,
                }),
                ty: dp.clone(),
            })
        }
        SType::Pi(_) | SType::Ref(_) => Err(err_internal!(
            "make-dest",
            "cannot make a destination for a value of type {:?}",
            ty
        )),
    }
}

/// One pointer request: size over the telescope, offset at the current
/// index atoms.
fn make_base_leaf(
    b: &mut Builder,
    ctx: &mut DestCtx,
    idxs: &DestIdxs,
    base: BaseType,
) -> Result<Dest> {
    let size = b.build_block(|b| elem_count(b, &idxs.telescope))?;
    let addr_space = choose_addr_space(&ctx.opts, ctx.alloc, &size);
    let ptr_ty = PtrType {
        addr_space,
        pointee: base.clone(),
    };
    let ptr_binder = Binder::new(
        b.fresh_name(NameColor::Ptr),
        SType::Base(BaseType::Ptr(Box::new(ptr_ty.clone()))),
    );
    b.bind_param(&ptr_binder);
    ctx.ptrs.push(DestPtrInfo {
        binder: ptr_binder.clone(),
        ptr_ty,
        size,
        scalar_cell: idxs.telescope.is_empty(),
    });

    let offset = compute_offset(b, &idxs.telescope, &idxs.atoms)?;
    let ptr_atom = if offset == Atom::idx_lit(0) {
        Atom::Var(ptr_binder.name)
    } else {
        b.emit_op(PrimOp::PtrOffset(Atom::Var(ptr_binder.name), offset))?
    };
    Ok(Dest::BaseRef {
        ptr: ptr_atom,
        ty: base,
    })
}

/// Fallback for index types that depend on runtime values (the right
/// side of a dependent pair): build the dest in its own pointer scope
/// and defer the allocations to write time, when the values are known.
/// The outer telescope instead allocates one pointer-sized cell per
/// deferred pointer, through which the runtime pointer is stored and
/// reloaded.
fn make_boxed_dest(
    b: &mut Builder,
    ctx: &mut DestCtx,
    idxs: &DestIdxs,
    ty: &SType,
) -> Result<Dest> {
    let mut inner_ctx = DestCtx {
        opts: ctx.opts,
        // Deferred buffers are always cleaned up by the enclosing scope.
        alloc: AllocType::Managed,
        ptrs: Vec::new(),
    };
    // Dependent values are in scope by the time the box is written, so
    // the inner telescope may mention them freely.
    let inner = make_dest_rec(b, &mut inner_ctx, &DestIdxs::default(), &[], ty)?;

    let mut boxes = Vec::with_capacity(inner_ctx.ptrs.len());
    let mut ptr_binders = Vec::with_capacity(inner_ctx.ptrs.len());
    for info in inner_ctx.ptrs {
        let cell_base = BaseType::Ptr(Box::new(info.ptr_ty.clone()));
        let cell = make_base_leaf(b, ctx, idxs, cell_base)?;
        boxes.push(BoxPtr {
            cell,
            ptr_ty: info.ptr_ty,
            size: info.size,
        });
        ptr_binders.push(info.binder);
    }
    Ok(Dest::BoxedRef {
        boxes,
        ptr_binders,
        inner: Box::new(inner),
    })
}
