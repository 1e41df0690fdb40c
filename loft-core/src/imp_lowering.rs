//! Translation of dest-passing blocks to Imp.
//!
//! Every expression either writes through a pre-allocated destination
//! (and produces nothing) or evaluates to an atom whose leaves are Imp
//! scalars. Allocation is explicit: `AllocDest` synthesizes a
//! destination, allocates its pointers, and registers heap-managed ones
//! for a deferred `Free` at the end of the enclosing scoped block, in
//! reverse allocation order.
//!
//! Reader/writer/state handlers degenerate here: the handler binder is
//! bound to unit and the reference binder to the backing destination;
//! reads load the destination and writes copy into it.

use crate::builder::Builder;
use crate::dest::make_dest;
use crate::err_imp;
use crate::err_internal;
use crate::error::Result;
use crate::imp::*;
use crate::ir::fold::{subst_atom, subst_dest};
use crate::ir::*;
use crate::name::{Name, NameColor, NameSupply};
use log::{debug, trace};
use std::collections::HashMap;

/// Pick the address space for one allocation.
///
/// Unmanaged allocations always go to the main device heap: their
/// lifetime is the caller's business. Managed allocations whose size is
/// a syntactic literal of at most 256 elements go on the stack when the
/// current device is the main device. The literal check is syntactic
/// only; callers must not rely on stack placement for dynamically
/// computed small sizes.
pub fn choose_addr_space(opts: &ImpOptions, alloc: AllocType, size: &Block) -> AddressSpace {
    let main = opts.backend.main_device();
    match alloc {
        AllocType::Unmanaged => AddressSpace::Heap(main),
        AllocType::Managed => {
            let small = size.decls.is_empty()
                && matches!(size.result, Atom::Lit(LitVal::U32(n)) if n <= 256);
            if small && opts.cur_device == main {
                AddressSpace::Stack
            } else {
                AddressSpace::Heap(main)
            }
        }
    }
}

// =============================================================================
// Translator state
// =============================================================================

struct ImpFrame {
    decls: Vec<ImpDecl>,
    /// Managed heap pointers to free when this frame closes, freed in
    /// reverse allocation order.
    to_free: Vec<IExpr>,
}

struct AllocatedPtr {
    raw: IExpr,
    info: DestPtrInfo,
}

pub(crate) struct MaterializedDest {
    /// Pointer binders replaced by the allocated Imp pointers.
    pub(crate) dest: Dest,
    allocated: Vec<AllocatedPtr>,
    /// The synthesized destination still abstracted over its pointers.
    template: Dest,
}

pub struct ImpLowering {
    supply: NameSupply,
    opts: ImpOptions,
    frames: Vec<ImpFrame>,
    subst: HashMap<Name, Atom>,
    pending_recon: Option<AtomRecon>,
}

/// Translate a dest block into an Imp function plus the reconstruction
/// of its high-level result from the function's scalar returns.
pub fn to_imp_function(
    supply: NameSupply,
    opts: &ImpOptions,
    dest_block: &DestBlock,
) -> Result<(ImpFunctionWithRecon, NameSupply)> {
    let ans_ty = match &dest_block.dest_binder.ty {
        SType::Ref(inner) => (**inner).clone(),
        other => {
            return Err(err_internal!(
                "dest-block",
                "dest binder has non-reference type {:?}",
                other
            ))
        }
    };
    debug!(
        "imp translation of a block producing {}",
        crate::diags::format_type(&ans_ty)
    );

    let mut me = ImpLowering {
        supply,
        opts: *opts,
        frames: Vec::new(),
        subst: HashMap::new(),
        pending_recon: None,
    };
    let dest_name = dest_block.dest_binder.name;
    let block = &dest_block.block;
    let body = me.scoped_block(|me| {
        let mat = me.materialize_dest(&ans_ty, AllocType::Unmanaged)?;
        me.subst
            .insert(dest_name, Atom::DestRef(Box::new(mat.dest.clone())));
        me.translate_block(block)?;
        me.function_results(mat)
    })?;

    let recon = me
        .pending_recon
        .take()
        .ok_or_else(|| err_internal!("imp", "missing result reconstruction"))?;
    let ret_tys: Vec<IType> = body.results.iter().map(|r| r.ty()).collect();
    let function = ImpFunction {
        name: me.supply.fresh(NameColor::Imp),
        ty: IFunType {
            cc: opts.calling_convention,
            arg_tys: Vec::new(),
            ret_tys,
        },
        params: Vec::new(),
        body,
    };
    Ok((
        ImpFunctionWithRecon { function, recon },
        me.supply,
    ))
}

impl ImpLowering {
    /// A bare translator over an empty scope, for driving individual
    /// destination operations directly.
    pub(crate) fn standalone(supply: NameSupply, opts: ImpOptions) -> Self {
        ImpLowering {
            supply,
            opts,
            frames: Vec::new(),
            subst: HashMap::new(),
            pending_recon: None,
        }
    }

    // =========================================================================
    // Emission
    // =========================================================================

    fn fresh_ibinder(&mut self, ty: IType) -> IBinder {
        IBinder {
            name: self.supply.fresh(NameColor::Imp),
            ty,
        }
    }

    fn emit_instr(&mut self, instr: ImpInstr) -> Result<Vec<IExpr>> {
        let tys = instr.result_tys();
        let binders: Vec<IBinder> = tys.into_iter().map(|t| self.fresh_ibinder(t)).collect();
        let exprs: Vec<IExpr> = binders.iter().map(|b| b.to_expr()).collect();
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| err_internal!("imp", "emission outside any block"))?;
        frame.decls.push(ImpDecl { binders, instr });
        Ok(exprs)
    }

    fn emit_instr1(&mut self, instr: ImpInstr) -> Result<IExpr> {
        let mut exprs = self.emit_instr(instr)?;
        match exprs.len() {
            1 => Ok(exprs.remove(0)),
            n => Err(err_internal!("imp", "expected one result, got {}", n)),
        }
    }

    pub(crate) fn scoped_block(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<Vec<IExpr>>,
    ) -> Result<ImpBlock> {
        self.frames.push(ImpFrame {
            decls: Vec::new(),
            to_free: Vec::new(),
        });
        let results = f(self);
        let mut frame = self.frames.pop().expect("unbalanced imp frames");
        let results = match results {
            Ok(r) => r,
            Err(e) => return Err(e),
        };
        for ptr in frame.to_free.iter().rev().cloned().collect::<Vec<_>>() {
            frame.decls.push(ImpDecl {
                binders: Vec::new(),
                instr: ImpInstr::Free(ptr),
            });
        }
        Ok(ImpBlock {
            decls: frame.decls,
            results,
        })
    }

    // =========================================================================
    // Atom utilities
    // =========================================================================

    fn s(&self, atom: &Atom) -> Atom {
        subst_atom(&self.subst, atom)
    }

    fn s_ty(&self, ty: &SType) -> SType {
        crate::ir::fold::subst_type(&self.subst, ty)
    }

    fn s_ix(&self, ix: &IxType) -> IxType {
        crate::ir::fold::subst_ix(&self.subst, ix)
    }

    fn atom_to_iexpr(&self, atom: &Atom) -> Result<IExpr> {
        match atom {
            Atom::Lit(v) => Ok(IExpr::Lit(*v)),
            Atom::ImpVar(n, ty) => Ok(IExpr::Var(*n, ty.clone())),
            Atom::Con(Con::Newtype { inner, .. }) => self.atom_to_iexpr(inner),
            other => Err(err_imp!("expected a scalar value, got {:?}", other)),
        }
    }

    fn iexpr_to_atom(&self, e: &IExpr) -> Atom {
        match e {
            IExpr::Lit(v) => Atom::Lit(*v),
            IExpr::Var(n, ty) => Atom::ImpVar(*n, ty.clone()),
        }
    }

    /// Structural type of a fully substituted atom.
    fn imp_type_of(&self, atom: &Atom) -> Result<SType> {
        match atom {
            Atom::Lit(v) => Ok(SType::scalar(v.base_ty())),
            Atom::ImpVar(_, ty) => Ok(SType::Base(ty.to_base_ty())),
            Atom::Con(Con::ProdCon(xs)) => {
                let tys: Result<Vec<SType>> = xs.iter().map(|x| self.imp_type_of(x)).collect();
                Ok(SType::Prod(tys?))
            }
            Atom::Con(Con::SumCon { tys, .. }) | Atom::Con(Con::SumAsProd { tys, .. }) => {
                Ok(SType::Sum(tys.clone()))
            }
            Atom::Con(Con::Newtype { ty, .. }) => Ok(ty.clone()),
            Atom::DepPair(_, _, ty) => Ok(SType::DepPair(ty.clone())),
            Atom::DestRef(d) => Ok(SType::ref_to(d.value_ty())),
            Atom::ACase(_, _, ty) => Ok(ty.clone()),
            Atom::TabLam(lam) => match &lam.body.ann {
                Some(ann) => Ok(SType::tab(lam.binder.clone(), lam.ix.clone(), ann.ty.clone())),
                None => Err(err_imp!("unannotated table lambda in atom position")),
            },
            other => Err(err_imp!("cannot type atom at Imp stage: {:?}", other)),
        }
    }

    fn expect_dest(&self, atom: &Atom) -> Result<Dest> {
        match atom {
            Atom::DestRef(d) => Ok((**d).clone()),
            other => Err(err_imp!("expected a destination, got {:?}", other)),
        }
    }

    fn unwrap_rep(&self, atom: &Atom) -> Result<Atom> {
        match atom {
            Atom::Con(Con::Newtype { inner, .. }) => Ok((**inner).clone()),
            other => Err(err_imp!("expected a wrapped index value, got {:?}", other)),
        }
    }

    fn ix_size_iexpr(&mut self, ix: &IxType) -> Result<IExpr> {
        let size = crate::algebra::ix_size_atom(ix)?;
        self.atom_to_iexpr(&size)
    }

    fn from_ordinal_atom(&mut self, ix: &IxType, ord: IExpr) -> Result<Atom> {
        match &ix.dict {
            IxDict::Fin(_) => Ok(Atom::newtype(ix.elem_ty.clone(), self.iexpr_to_atom(&ord))),
            IxDict::Custom {
                unsafe_from_ordinal,
                ..
            } => {
                let arg = self.iexpr_to_atom(&ord);
                let f = (**unsafe_from_ordinal).clone();
                self.inline_apply(&f, vec![arg])
            }
        }
    }

    fn inline_apply(&mut self, f: &Atom, args: Vec<Atom>) -> Result<Atom> {
        match f {
            Atom::Lam(lam) => self.inline_apply_lam(lam, args),
            other => Err(err_imp!("applied non-lambda atom {:?}", other)),
        }
    }

    fn inline_apply_lam(&mut self, lam: &Lam, args: Vec<Atom>) -> Result<Atom> {
        if lam.binders.len() != args.len() {
            return Err(err_imp!(
                "applied {} arguments to a {}-ary lambda",
                args.len(),
                lam.binders.len()
            ));
        }
        for (b, a) in lam.binders.iter().zip(args) {
            self.subst.insert(b.name, a);
        }
        self.translate_block(&lam.body)
    }

    /// Index into a table value: an unevaluated table lambda or a
    /// frozen table destination.
    fn tab_index_value(&mut self, table: &Atom, idx: &Atom) -> Result<Atom> {
        match table {
            Atom::TabLam(lam) => {
                self.subst.insert(lam.binder.name, idx.clone());
                self.translate_block(&lam.body)
            }
            Atom::DestRef(d) => match &**d {
                Dest::TabRef(td) => {
                    let elem = self.index_dest(td, idx)?;
                    self.load_dest(&elem)
                }
                other => Err(err_imp!("indexed a non-table destination {:?}", other)),
            },
            other => Err(err_imp!("indexed a non-table atom {:?}", other)),
        }
    }

    // =========================================================================
    // Blocks and expressions
    // =========================================================================

    pub(crate) fn translate_block(&mut self, block: &Block) -> Result<Atom> {
        for decl in &block.decls {
            let atom = self.translate_expr(&decl.expr)?;
            self.subst.insert(decl.binder.name, atom);
        }
        Ok(self.s(&block.result))
    }

    fn translate_expr(&mut self, expr: &SExpr) -> Result<Atom> {
        match expr {
            SExpr::Atom(a) => Ok(self.s(a)),
            SExpr::App(f, args) => {
                let f = self.s(f);
                let args: Vec<Atom> = args.iter().map(|a| self.s(a)).collect();
                self.inline_apply(&f, args)
            }
            SExpr::TabApp(t, idxs) => {
                let mut value = self.s(t);
                for idx in idxs {
                    let idx = self.s(idx);
                    value = self.tab_index_value(&value, &idx)?;
                }
                Ok(value)
            }
            SExpr::Case(case) => self.translate_case(case),
            SExpr::Op(op) => self.translate_op(op),
            SExpr::Hof(hof) => self.translate_hof(hof),
        }
    }

    fn translate_case(&mut self, case: &CaseExpr) -> Result<Atom> {
        let scrut = self.s(&case.scrut);
        match self.sum_scrut(&scrut)? {
            SumScrut::Known(k, payload) => {
                let alt = case
                    .alts
                    .get(k)
                    .ok_or_else(|| err_imp!("case has no alternative {}", k))?;
                self.subst.insert(alt.binder.name, payload);
                self.translate_block(&alt.body)
            }
            SumScrut::Tagged(tag, payloads) => {
                let ty = self.s_ty(&case.ty);
                let mat = self.materialize_dest(&ty, AllocType::Managed)?;
                self.switch_rec(&tag, 0, &case.alts, &payloads, &mat.dest)?;
                self.load_dest(&mat.dest)
            }
        }
    }

    fn translate_hof(&mut self, hof: &Hof) -> Result<Atom> {
        match hof {
            Hof::Seq(se) => {
                let ix = self.s_ix(&se.ix);
                let n = self.ix_size_iexpr(&ix)?;
                let carry = self.s(&se.carry);
                if se.lam.binders.len() != 2 {
                    return Err(err_internal!("seq", "seq lambda is not binary"));
                }
                let loop_b = self.fresh_ibinder(IType::idx_rep());
                let i_name = se.lam.binders[0].name;
                let c_name = se.lam.binders[1].name;
                let carry_for_body = carry.clone();
                let body = self.scoped_block(|me| {
                    let idx = me.from_ordinal_atom(&ix, loop_b.to_expr())?;
                    me.subst.insert(i_name, idx);
                    me.subst.insert(c_name, carry_for_body);
                    me.translate_block(&se.lam.body)?;
                    Ok(Vec::new())
                })?;
                self.emit_instr(ImpInstr::IFor(se.dir, loop_b, n, body))?;
                Ok(carry)
            }
            Hof::While(cond_body) => {
                let body = self.scoped_block(|me| {
                    let cond = me.translate_block(cond_body)?;
                    Ok(vec![me.atom_to_iexpr(&cond)?])
                })?;
                self.emit_instr(ImpInstr::IWhile(body))?;
                Ok(Atom::unit())
            }
            Hof::RunReader(init, lam) => {
                let init = self.s(init);
                let ty = self.imp_type_of(&init)?;
                let mat = self.materialize_dest(&ty, AllocType::Managed)?;
                self.copy_atom(&mat.dest, &init)?;
                self.run_handler(lam, Atom::DestRef(Box::new(mat.dest)))
            }
            Hof::RunWriter(dest, monoid, lam) => {
                let d = match dest {
                    Some(d) => self.expect_dest(&self.s(d))?,
                    None => {
                        return Err(err_internal!(
                            "rws",
                            "writer reached Imp without a destination"
                        ))
                    }
                };
                let empty = self.s(&monoid.empty);
                self.copy_atom(&d, &empty)?;
                self.run_handler(lam, Atom::DestRef(Box::new(d)))
            }
            Hof::RunState(dest, init, lam) => {
                let d = match dest {
                    Some(d) => self.expect_dest(&self.s(d))?,
                    None => {
                        return Err(err_internal!(
                            "rws",
                            "state reached Imp without a destination"
                        ))
                    }
                };
                let init = self.s(init);
                self.copy_atom(&d, &init)?;
                self.run_handler(lam, Atom::DestRef(Box::new(d)))
            }
            Hof::RunIO(body) | Hof::RunInit(body) => self.translate_block(body),
            Hof::RememberDest(d, lam) => {
                let d = self.s(d);
                if lam.binders.len() != 1 {
                    return Err(err_internal!("remember-dest", "lambda is not unary"));
                }
                self.subst.insert(lam.binders[0].name, d.clone());
                self.translate_block(&lam.body)?;
                Ok(d)
            }
            Hof::For(_) => Err(err_imp!("for survived lowering; run Lower first")),
        }
    }

    /// Run an RWS handler body: handler token bound to unit, reference
    /// bound to the destination.
    fn run_handler(&mut self, lam: &Lam, dest_ref: Atom) -> Result<Atom> {
        if lam.binders.len() != 2 {
            return Err(err_internal!("rws", "handler lambda is not binary"));
        }
        self.subst.insert(lam.binders[0].name, Atom::unit());
        self.subst.insert(lam.binders[1].name, dest_ref);
        self.translate_block(&lam.body)
    }

    // =========================================================================
    // Primitive operations
    // =========================================================================

    fn translate_op(&mut self, op: &PrimOp) -> Result<Atom> {
        match op {
            PrimOp::BinOp(k, x, y) => {
                let x = self.atom_to_iexpr(&self.s(x))?;
                let y = self.atom_to_iexpr(&self.s(y))?;
                if let Some(folded) = fold_ibinop(*k, &x, &y) {
                    return Ok(self.iexpr_to_atom(&folded));
                }
                let r = self.emit_instr1(ImpInstr::IBinOp(*k, x, y))?;
                Ok(self.iexpr_to_atom(&r))
            }
            PrimOp::UnOp(k, x) => {
                let x = self.atom_to_iexpr(&self.s(x))?;
                let r = self.emit_instr1(ImpInstr::IUnOp(*k, x))?;
                Ok(self.iexpr_to_atom(&r))
            }
            PrimOp::Select(c, t, e) => {
                let c = self.atom_to_iexpr(&self.s(c))?;
                let t = self.atom_to_iexpr(&self.s(t))?;
                let e = self.atom_to_iexpr(&self.s(e))?;
                let r = self.emit_instr1(ImpInstr::ISelect(c, t, e))?;
                Ok(self.iexpr_to_atom(&r))
            }
            PrimOp::CastOp(ty, x) => {
                let target = match self.s_ty(ty) {
                    SType::Base(b) => IType::from_base_ty(&b),
                    other => {
                        return Err(err_imp!("cast to non-base type {:?}", other))
                    }
                };
                let x = self.atom_to_iexpr(&self.s(x))?;
                let r = self.emit_instr1(ImpInstr::ICastOp(target, x))?;
                Ok(self.iexpr_to_atom(&r))
            }
            PrimOp::IxSize(ix) => {
                let ix = self.s_ix(ix);
                let n = self.ix_size_iexpr(&ix)?;
                Ok(self.iexpr_to_atom(&n))
            }
            PrimOp::Ordinal(ix, a) => {
                let ix = self.s_ix(ix);
                let a = self.s(a);
                match &ix.dict {
                    IxDict::Fin(_) => self.unwrap_rep(&a),
                    IxDict::Custom { ordinal, .. } => {
                        let f = (**ordinal).clone();
                        self.inline_apply(&f, vec![a])
                    }
                }
            }
            PrimOp::UnsafeFromOrdinal(ix, a) => {
                let ix = self.s_ix(ix);
                let ord = self.atom_to_iexpr(&self.s(a))?;
                self.from_ordinal_atom(&ix, ord)
            }
            PrimOp::RefOp(r, ref_op) => {
                let d = self.expect_dest(&self.s(r))?;
                match ref_op {
                    RefOp::Ask | RefOp::Get => self.load_dest(&d),
                    RefOp::Put(v) => {
                        let v = self.s(v);
                        self.copy_atom(&d, &v)?;
                        Ok(Atom::unit())
                    }
                    RefOp::Extend(combine, v) => {
                        let cur = self.load_dest(&d)?;
                        let v = self.s(v);
                        let new = self.inline_apply_lam(combine, vec![cur, v])?;
                        self.copy_atom(&d, &new)?;
                        Ok(Atom::unit())
                    }
                }
            }
            PrimOp::AllocDest(ty) => {
                let ty = self.s_ty(ty);
                let mat = self.materialize_dest(&ty, AllocType::Managed)?;
                Ok(Atom::DestRef(Box::new(mat.dest)))
            }
            PrimOp::Place(r, v) => {
                let d = self.expect_dest(&self.s(r))?;
                let v = self.s(v);
                self.copy_atom(&d, &v)?;
                Ok(Atom::unit())
            }
            PrimOp::Freeze(r) => {
                let d = self.expect_dest(&self.s(r))?;
                self.load_dest(&d)
            }
            PrimOp::IndexRef(r, i) => {
                let d = self.expect_dest(&self.s(r))?;
                let i = self.s(i);
                match &d {
                    Dest::TabRef(td) => {
                        let elem = self.index_dest(td, &i)?;
                        Ok(Atom::DestRef(Box::new(elem)))
                    }
                    other => Err(err_imp!("indexed a non-table destination {:?}", other)),
                }
            }
            PrimOp::ProjRef(p, r) => {
                let d = self.expect_dest(&self.s(r))?;
                let projected = self.project_dest(*p, &d)?;
                Ok(Atom::DestRef(Box::new(projected)))
            }
            PrimOp::PtrOffset(p, o) => {
                let p = self.atom_to_iexpr(&self.s(p))?;
                let o = self.atom_to_iexpr(&self.s(o))?;
                let r = self.emit_instr1(ImpInstr::IPtrOffset(p, o))?;
                Ok(self.iexpr_to_atom(&r))
            }
            PrimOp::PtrLoad(p) => {
                let p = self.atom_to_iexpr(&self.s(p))?;
                let r = self.emit_instr1(ImpInstr::IPtrLoad(p))?;
                Ok(self.iexpr_to_atom(&r))
            }
            PrimOp::VectorSubref(r, i, vty) => self.translate_vector_subref(r, i, vty),
            PrimOp::VectorBroadcast(a, vty) => {
                let a = self.atom_to_iexpr(&self.s(a))?;
                let ty = self.base_itype(vty)?;
                let r = self.emit_instr1(ImpInstr::IVectorBroadcast(a, ty))?;
                Ok(self.iexpr_to_atom(&r))
            }
            PrimOp::VectorIota(vty) => {
                let ty = self.base_itype(vty)?;
                let r = self.emit_instr1(ImpInstr::IVectorIota(ty))?;
                Ok(self.iexpr_to_atom(&r))
            }
            PrimOp::ThrowError(ty) => {
                self.emit_instr(ImpInstr::IThrowError)?;
                match self.s_ty(ty) {
                    SType::Base(BaseType::Scalar(s)) => Ok(Atom::Lit(LitVal::zero(s))),
                    other => Err(err_imp!("throw at non-scalar type {:?}", other)),
                }
            }
            PrimOp::TabCon(_, _) => {
                Err(err_imp!("table literal not implemented in Imp; run Lower first"))
            }
            PrimOp::RecordCons(_) => Err(err_imp!("RecordCons not implemented in Imp")),
            PrimOp::VariantCon { .. } => Err(err_imp!("VariantCon not implemented in Imp")),
        }
    }

    fn base_itype(&self, ty: &SType) -> Result<IType> {
        match self.s_ty(ty) {
            SType::Base(b) => Ok(IType::from_base_ty(&b)),
            other => Err(err_imp!("expected a base type, got {:?}", other)),
        }
    }

    fn translate_vector_subref(&mut self, r: &Atom, i: &Atom, vty: &SType) -> Result<Atom> {
        let d = self.expect_dest(&self.s(r))?;
        let td = match &d {
            Dest::TabRef(td) => (**td).clone(),
            other => return Err(err_imp!("vector subref of non-table {:?}", other)),
        };
        let (width, scalar) = match self.s_ty(vty) {
            SType::Base(BaseType::Vector(w, s)) => (w, s),
            other => return Err(err_imp!("vector subref at non-vector type {:?}", other)),
        };
        let base = self.atom_to_iexpr(&self.s(i))?;
        let idx = self.from_ordinal_atom(&td.ix, base)?;
        let elem = self.index_dest(&td, &idx)?;
        match elem {
            Dest::BaseRef { ptr, ty: BaseType::Scalar(s) } if s == scalar => {
                let p = self.atom_to_iexpr(&ptr)?;
                let addr = match p.ty() {
                    IType::Ptr(addr, _) => addr,
                    other => return Err(err_imp!("not a pointer: {:?}", other)),
                };
                let vec_ptr = self.emit_instr1(ImpInstr::IBitcastOp(
                    IType::ptr_to(addr, IType::Vector(width, scalar)),
                    p,
                ))?;
                Ok(Atom::DestRef(Box::new(Dest::BaseRef {
                    ptr: self.iexpr_to_atom(&vec_ptr),
                    ty: BaseType::Vector(width, scalar),
                })))
            }
            other => Err(err_imp!(
                "vector subref over a non-scalar element destination {:?}",
                other
            )),
        }
    }

    // =========================================================================
    // Sums and switches
    // =========================================================================

    fn sum_scrut(&mut self, scrut: &Atom) -> Result<SumScrut> {
        match scrut {
            Atom::Con(Con::SumCon { tag, payload, .. }) => {
                Ok(SumScrut::Known(*tag, (**payload).clone()))
            }
            Atom::Con(Con::SumAsProd { tag, payloads, .. }) => {
                let tag = self.atom_to_iexpr(tag)?;
                Ok(SumScrut::Tagged(tag, payloads.clone()))
            }
            Atom::Con(Con::Newtype { inner, .. }) => self.sum_scrut(inner),
            other => Err(err_imp!("case scrutinee is not a sum value: {:?}", other)),
        }
    }

    /// Lower an n-way branch as a chain of conditionals, linear in the
    /// number of branches.
    fn switch_rec(
        &mut self,
        tag: &IExpr,
        k: usize,
        alts: &[Alt],
        payloads: &[Atom],
        dest: &Dest,
    ) -> Result<()> {
        if alts.is_empty() {
            return Err(err_imp!("case with no alternatives"));
        }
        if k == alts.len() - 1 {
            return self.case_branch(&alts[k], &payloads[k], dest);
        }
        let cond = self.emit_instr1(ImpInstr::IBinOp(
            BinOpKind::ICmpEq,
            tag.clone(),
            IExpr::Lit(LitVal::U8(k as u8)),
        ))?;
        let then_b = self.scoped_block(|me| {
            me.case_branch(&alts[k], &payloads[k], dest)?;
            Ok(Vec::new())
        })?;
        let else_b = self.scoped_block(|me| {
            me.switch_rec(tag, k + 1, alts, payloads, dest)?;
            Ok(Vec::new())
        })?;
        self.emit_instr(ImpInstr::ICond(cond, then_b, else_b))?;
        Ok(())
    }

    fn case_branch(&mut self, alt: &Alt, payload: &Atom, dest: &Dest) -> Result<()> {
        self.subst.insert(alt.binder.name, payload.clone());
        let result = self.translate_block(&alt.body)?;
        self.copy_atom(dest, &result)
    }

    /// Switch over an atom-level case, copying each branch into `dest`.
    fn acase_switch(
        &mut self,
        tag: &IExpr,
        k: usize,
        alts: &[AtomAlt],
        payloads: &[Atom],
        dest: &Dest,
    ) -> Result<()> {
        if k == alts.len() - 1 {
            self.subst.insert(alts[k].binder.name, payloads[k].clone());
            let value = self.s(&alts[k].body);
            return self.copy_atom(dest, &value);
        }
        let cond = self.emit_instr1(ImpInstr::IBinOp(
            BinOpKind::ICmpEq,
            tag.clone(),
            IExpr::Lit(LitVal::U8(k as u8)),
        ))?;
        let then_b = self.scoped_block(|me| {
            me.subst.insert(alts[k].binder.name, payloads[k].clone());
            let value = me.s(&alts[k].body);
            me.copy_atom(dest, &value)?;
            Ok(Vec::new())
        })?;
        let else_b = self.scoped_block(|me| {
            me.acase_switch(tag, k + 1, alts, payloads, dest)?;
            Ok(Vec::new())
        })?;
        self.emit_instr(ImpInstr::ICond(cond, then_b, else_b))?;
        Ok(())
    }

    // =========================================================================
    // Destinations: allocation, indexing, loads, stores
    // =========================================================================

    pub(crate) fn materialize_dest(&mut self, ty: &SType, alloc: AllocType) -> Result<MaterializedDest> {
        let supply = std::mem::take(&mut self.supply);
        let mut b = Builder::new(supply);
        let opts = self.opts;
        let built = b.build_scoped(|b| make_dest(b, &opts, alloc, ty));
        self.supply = b.into_supply();
        let (decls, absptrs) = built?;

        let mut allocated = Vec::new();
        for info in &absptrs.ptrs {
            let size_atom = self.translate_block(&info.size)?;
            let size = self.atom_to_iexpr(&size_atom)?;
            let pointee = IType::from_base_ty(&info.ptr_ty.pointee);
            let raw = self.emit_instr1(ImpInstr::Alloc(
                info.ptr_ty.addr_space,
                pointee,
                size,
            ))?;
            if alloc == AllocType::Managed
                && matches!(info.ptr_ty.addr_space, AddressSpace::Heap(_))
            {
                if let Some(frame) = self.frames.last_mut() {
                    frame.to_free.push(raw.clone());
                }
            }
            self.subst.insert(info.binder.name, self.iexpr_to_atom(&raw));
            allocated.push(AllocatedPtr {
                raw,
                info: info.clone(),
            });
        }
        for decl in &decls {
            let atom = self.translate_expr(&decl.expr)?;
            self.subst.insert(decl.binder.name, atom);
        }
        let dest = subst_dest(&self.subst, &absptrs.dest);
        trace!("materialized {} pointer(s)", allocated.len());
        Ok(MaterializedDest {
            dest,
            allocated,
            template: absptrs.dest,
        })
    }

    pub(crate) fn index_dest(&mut self, td: &TabDest, idx: &Atom) -> Result<Dest> {
        self.subst.insert(td.binder.name, idx.clone());
        let result = self.translate_block(&td.body)?;
        match result {
            Atom::DestRef(d) => Ok(*d),
            other => Err(err_internal!(
                "index-dest",
                "table dest body produced {:?}",
                other
            )),
        }
    }

    fn project_dest(&mut self, p: Projection, d: &Dest) -> Result<Dest> {
        match (p, d) {
            (Projection::Prod(i), Dest::ProdRef(ds)) => ds
                .get(i)
                .cloned()
                .ok_or_else(|| err_imp!("destination has no component {}", i)),
            (Projection::Unwrap, Dest::NewtypeRef { inner, .. }) => Ok((**inner).clone()),
            (Projection::Prod(0), Dest::DepPairRef { lhs, .. }) => Ok((**lhs).clone()),
            (Projection::Prod(1), Dest::DepPairRef { lhs, rhs, .. }) => {
                // The left component must be written before the right
                // destination exists; read it back to instantiate.
                let left = self.load_dest(lhs)?;
                let mut map = HashMap::new();
                map.insert(rhs.binder.name, left);
                Ok(subst_dest(&map, &rhs.dest))
            }
            (p, other) => Err(err_imp!(
                "cannot project {:?} out of destination {:?}",
                p,
                other
            )),
        }
    }

    pub(crate) fn load_dest(&mut self, dest: &Dest) -> Result<Atom> {
        match dest {
            Dest::BaseRef { ptr, .. } => {
                let p = self.atom_to_iexpr(ptr)?;
                let r = self.emit_instr1(ImpInstr::IPtrLoad(p))?;
                Ok(self.iexpr_to_atom(&r))
            }
            // Table loads are lazy: the frozen destination is the value.
            Dest::TabRef(_) => Ok(Atom::DestRef(Box::new(dest.clone()))),
            Dest::ProdRef(ds) => {
                let mut elems = Vec::with_capacity(ds.len());
                for d in ds {
                    elems.push(self.load_dest(d)?);
                }
                Ok(Atom::prod(elems))
            }
            Dest::NewtypeRef { ty, inner } => {
                let inner = self.load_dest(inner)?;
                Ok(Atom::newtype(ty.clone(), inner))
            }
            Dest::SumAsProdRef { tys, tag, payloads } => {
                let tag = self.load_dest(tag)?;
                let mut loaded = Vec::with_capacity(payloads.len());
                for p in payloads {
                    loaded.push(self.load_dest(p)?);
                }
                Ok(Atom::Con(Con::SumAsProd {
                    tys: tys.clone(),
                    tag: Box::new(tag),
                    payloads: loaded,
                }))
            }
            Dest::DepPairRef { lhs, rhs, ty } => {
                let left = self.load_dest(lhs)?;
                let mut map = HashMap::new();
                map.insert(rhs.binder.name, left.clone());
                let rhs_dest = subst_dest(&map, &rhs.dest);
                let right = self.load_dest(&rhs_dest)?;
                Ok(Atom::DepPair(Box::new(left), Box::new(right), ty.clone()))
            }
            Dest::BoxedRef { .. } => {
                let resolved = self.resolve_boxed(dest)?;
                self.load_dest(&resolved)
            }
        }
    }

    /// Reload the deferred pointers of a boxed destination from their
    /// cells and substitute them into the inner destination.
    fn resolve_boxed(&mut self, dest: &Dest) -> Result<Dest> {
        let (boxes, ptr_binders, inner) = match dest {
            Dest::BoxedRef {
                boxes,
                ptr_binders,
                inner,
            } => (boxes, ptr_binders, inner),
            other => return Err(err_internal!("boxed", "not a boxed dest: {:?}", other)),
        };
        let mut map = HashMap::new();
        for (bx, binder) in boxes.iter().zip(ptr_binders) {
            let cell_ptr = match &bx.cell {
                Dest::BaseRef { ptr, .. } => self.atom_to_iexpr(ptr)?,
                other => {
                    return Err(err_internal!("boxed", "box cell is not a leaf: {:?}", other))
                }
            };
            let raw = self.emit_instr1(ImpInstr::IPtrLoad(cell_ptr))?;
            map.insert(binder.name, self.iexpr_to_atom(&raw));
        }
        Ok(subst_dest(&map, inner))
    }

    pub(crate) fn copy_atom(&mut self, dest: &Dest, src: &Atom) -> Result<()> {
        // A frozen aggregate view copies element-wise unless the
        // destination is itself a table (handled with a loop below).
        let src = match src {
            Atom::DestRef(view) if !matches!(dest, Dest::TabRef(_)) => {
                self.load_dest(view)?
            }
            _ => src.clone(),
        };
        if let Atom::ACase(scrut, alts, _) = &src {
            let scrut = self.s(scrut);
            return match self.sum_scrut(&scrut)? {
                SumScrut::Known(k, payload) => {
                    self.subst.insert(alts[k].binder.name, payload);
                    let value = self.s(&alts[k].body);
                    self.copy_atom(dest, &value)
                }
                SumScrut::Tagged(tag, payloads) => {
                    self.acase_switch(&tag, 0, alts, &payloads, dest)
                }
            };
        }
        match dest {
            Dest::BaseRef { ptr, .. } => {
                let p = self.atom_to_iexpr(ptr)?;
                let v = self.atom_to_iexpr(&src)?;
                self.emit_instr(ImpInstr::Store(p, v))?;
                Ok(())
            }
            Dest::TabRef(td) => self.copy_table(td, &src),
            Dest::ProdRef(ds) => {
                for (i, d) in ds.iter().enumerate() {
                    let elem = src.proj(Projection::Prod(i));
                    self.copy_atom(d, &elem)?;
                }
                Ok(())
            }
            Dest::NewtypeRef { inner, .. } => {
                let unwrapped = src.proj(Projection::Unwrap);
                self.copy_atom(inner, &unwrapped)
            }
            Dest::SumAsProdRef { tag, payloads, .. } => match &src {
                Atom::Con(Con::SumCon {
                    tag: k, payload, ..
                }) => {
                    self.copy_atom(tag, &Atom::Lit(LitVal::U8(*k as u8)))?;
                    self.copy_atom(&payloads[*k], payload)
                }
                Atom::Con(Con::SumAsProd {
                    tag: t,
                    payloads: ps,
                    ..
                }) => {
                    self.copy_atom(tag, t)?;
                    for (d, p) in payloads.iter().zip(ps) {
                        self.copy_atom(d, p)?;
                    }
                    Ok(())
                }
                other => Err(err_imp!("cannot store {:?} into a sum destination", other)),
            },
            Dest::DepPairRef { lhs, rhs, .. } => match &src {
                Atom::DepPair(l, r, _) => {
                    // Left first: the right destination is a function of
                    // the left value.
                    self.copy_atom(lhs, l)?;
                    let mut map = HashMap::new();
                    map.insert(rhs.binder.name, (**l).clone());
                    let rhs_dest = subst_dest(&map, &rhs.dest);
                    self.copy_atom(&rhs_dest, r)
                }
                other => Err(err_imp!(
                    "cannot store {:?} into a dependent-pair destination",
                    other
                )),
            },
            Dest::BoxedRef {
                boxes,
                ptr_binders,
                inner,
            } => {
                let mut map = HashMap::new();
                for (bx, binder) in boxes.iter().zip(ptr_binders) {
                    let size_atom = self.translate_block(&bx.size)?;
                    let size = self.atom_to_iexpr(&size_atom)?;
                    let pointee = IType::from_base_ty(&bx.ptr_ty.pointee);
                    let raw = self.emit_instr1(ImpInstr::Alloc(
                        bx.ptr_ty.addr_space,
                        pointee,
                        size,
                    ))?;
                    if matches!(bx.ptr_ty.addr_space, AddressSpace::Heap(_)) {
                        if let Some(frame) = self.frames.last_mut() {
                            frame.to_free.push(raw.clone());
                        }
                    }
                    let cell_ptr = match &bx.cell {
                        Dest::BaseRef { ptr, .. } => self.atom_to_iexpr(ptr)?,
                        other => {
                            return Err(err_internal!(
                                "boxed",
                                "box cell is not a leaf: {:?}",
                                other
                            ))
                        }
                    };
                    self.emit_instr(ImpInstr::Store(cell_ptr, raw.clone()))?;
                    map.insert(binder.name, self.iexpr_to_atom(&raw));
                }
                let inner = subst_dest(&map, inner);
                self.copy_atom(&inner, &src)
            }
        }
    }

    fn copy_table(&mut self, td: &TabDest, src: &Atom) -> Result<()> {
        // Dense scalar table into dense scalar table: one memcopy.
        if let Atom::DestRef(view) = src {
            if let Dest::TabRef(src_td) = &**view {
                if let (Some((dst_base, dst_s)), Some((src_base, src_s))) =
                    (dense_base(td), dense_base(src_td))
                {
                    if dst_s == src_s {
                        let n = self.ix_size_iexpr(&td.ix)?;
                        let dest = self.atom_to_iexpr(&dst_base)?;
                        let from = self.atom_to_iexpr(&src_base)?;
                        self.emit_instr(ImpInstr::MemCopy {
                            dest,
                            src: from,
                            num_elems: n,
                        })?;
                        return Ok(());
                    }
                }
            }
        }

        let n = self.ix_size_iexpr(&td.ix)?;
        let loop_b = self.fresh_ibinder(IType::idx_rep());
        let td = td.clone();
        let src = src.clone();
        let body = self.scoped_block(|me| {
            let idx = me.from_ordinal_atom(&td.ix, loop_b.to_expr())?;
            let elem_dest = me.index_dest(&td, &idx)?;
            let elem_val = me.tab_index_value(&src, &idx)?;
            me.copy_atom(&elem_dest, &elem_val)?;
            Ok(Vec::new())
        })?;
        self.emit_instr(ImpInstr::IFor(Direction::Fwd, loop_b, n, body))?;
        Ok(())
    }

    // =========================================================================
    // Results and reconstruction
    // =========================================================================

    /// Scalar cells are returned by value; buffers are returned as
    /// their base pointers. The reconstruction mirrors the destination
    /// structure over the returned scalars.
    fn function_results(&mut self, mat: MaterializedDest) -> Result<Vec<IExpr>> {
        let mut results = Vec::new();
        let mut binders = Vec::new();
        let mut value_map: HashMap<Name, Atom> = HashMap::new();
        let mut ptr_map: HashMap<Name, Atom> = HashMap::new();
        for ap in &mat.allocated {
            if ap.info.scalar_cell {
                let loaded = self.emit_instr1(ImpInstr::IPtrLoad(ap.raw.clone()))?;
                results.push(loaded.clone());
                let binder = Binder::new(
                    self.supply.fresh(NameColor::Atom),
                    SType::Base(ap.info.ptr_ty.pointee.clone()),
                );
                value_map.insert(ap.info.binder.name, Atom::Var(binder.name));
                binders.push(binder);
            } else {
                results.push(ap.raw.clone());
                let binder = Binder::new(
                    self.supply.fresh(NameColor::Atom),
                    ap.info.binder.ty.clone(),
                );
                ptr_map.insert(ap.info.binder.name, Atom::Var(binder.name));
                binders.push(binder);
            }
        }
        let atom = recon_atom(&mat.template, &value_map, &ptr_map)?;
        self.pending_recon = Some(AtomRecon { binders, atom });
        Ok(results)
    }
}

enum SumScrut {
    /// The tag is statically known.
    Known(usize, Atom),
    /// Tag expression plus one payload atom per case.
    Tagged(IExpr, Vec<Atom>),
}

fn fold_ibinop(k: BinOpKind, x: &IExpr, y: &IExpr) -> Option<IExpr> {
    let (a, b) = match (x.as_lit(), y.as_lit()) {
        (Some(LitVal::U32(a)), Some(LitVal::U32(b))) => (a, b),
        _ => return None,
    };
    let v = match k {
        BinOpKind::IAdd => a.wrapping_add(b),
        BinOpKind::ISub => a.wrapping_sub(b),
        BinOpKind::IMul => a.wrapping_mul(b),
        BinOpKind::IDiv if b != 0 => a / b,
        _ => return None,
    };
    Some(IExpr::Lit(LitVal::U32(v)))
}

/// Recognize the one-dimensional dense layout: a body that offsets the
/// base pointer by exactly the index ordinal.
fn dense_base(td: &TabDest) -> Option<(Atom, ScalarBaseType)> {
    if td.body.decls.len() != 1 {
        return None;
    }
    let decl = &td.body.decls[0];
    let (base, off) = match &decl.expr {
        SExpr::Op(PrimOp::PtrOffset(base, off)) => (base, off),
        _ => return None,
    };
    let expected_off = Atom::ProjectElt(vec![Projection::Unwrap], td.binder.name);
    if *off != expected_off {
        return None;
    }
    match &td.body.result {
        Atom::DestRef(d) => match &**d {
            Dest::BaseRef {
                ptr: Atom::Var(v),
                ty: BaseType::Scalar(s),
            } if *v == decl.binder.name => Some((base.clone(), *s)),
            _ => None,
        },
        _ => None,
    }
}

fn recon_atom(
    template: &Dest,
    value_map: &HashMap<Name, Atom>,
    ptr_map: &HashMap<Name, Atom>,
) -> Result<Atom> {
    match template {
        Dest::BaseRef { ptr, .. } => match ptr {
            Atom::Var(p) => value_map
                .get(p)
                .cloned()
                .ok_or_else(|| err_internal!("recon", "no returned value for pointer {}", p)),
            other => Err(err_internal!(
                "recon",
                "top-level leaf with a computed pointer: {:?}",
                other
            )),
        },
        Dest::TabRef(_) | Dest::BoxedRef { .. } => {
            Ok(Atom::DestRef(Box::new(subst_dest(ptr_map, template))))
        }
        Dest::ProdRef(ds) => {
            let elems: Result<Vec<Atom>> = ds
                .iter()
                .map(|d| recon_atom(d, value_map, ptr_map))
                .collect();
            Ok(Atom::prod(elems?))
        }
        Dest::NewtypeRef { ty, inner } => Ok(Atom::newtype(
            ty.clone(),
            recon_atom(inner, value_map, ptr_map)?,
        )),
        Dest::SumAsProdRef { tys, tag, payloads } => {
            let tag = recon_atom(tag, value_map, ptr_map)?;
            let payloads: Result<Vec<Atom>> = payloads
                .iter()
                .map(|d| recon_atom(d, value_map, ptr_map))
                .collect();
            Ok(Atom::Con(Con::SumAsProd {
                tys: tys.clone(),
                tag: Box::new(tag),
                payloads: payloads?,
            }))
        }
        Dest::DepPairRef { lhs, rhs, ty } => {
            let left = recon_atom(lhs, value_map, ptr_map)?;
            let mut map = HashMap::new();
            map.insert(rhs.binder.name, left.clone());
            let rhs_dest = subst_dest(&map, &rhs.dest);
            let right = recon_atom(&rhs_dest, value_map, ptr_map)?;
            Ok(Atom::DepPair(
                Box::new(left),
                Box::new(right),
                ty.clone(),
            ))
        }
    }
}

// =============================================================================
// Export wrappers
// =============================================================================

/// Wrap an entry function for an external caller.
///
/// `Flat`: destination registers arrive as one flat pointer list; the
/// wrapper calls the function and stores each scalar return through the
/// matching pointer.
///
/// `Xla`: the wrapper receives `(inputs, outputs)` as arrays of byte
/// pointers; each output pointer is loaded, cast to the result type,
/// and stored through. A single-output function receives `outputs`
/// pointing directly at the buffer rather than at a pointer array.
pub fn export_function(
    supply: NameSupply,
    f: &ImpFunctionWithRecon,
    cc: ExportCC,
) -> Result<(ImpFunction, NameSupply)> {
    let mut me = ImpLowering {
        supply,
        opts: ImpOptions::default(),
        frames: Vec::new(),
        subst: HashMap::new(),
        pending_recon: None,
    };
    let ret_tys = f.function.ty.ret_tys.clone();
    let callee = f.function.name;

    match cc {
        ExportCC::Flat => {
            let params: Vec<IBinder> = ret_tys
                .iter()
                .map(|t| {
                    me.fresh_ibinder(IType::ptr_to(
                        AddressSpace::Heap(Device::Cpu),
                        t.clone(),
                    ))
                })
                .collect();
            let body = {
                let params = params.clone();
                let ret_tys = ret_tys.clone();
                me.scoped_block(move |me| {
                    let rets =
                        me.emit_instr(ImpInstr::ICall(callee, Vec::new(), ret_tys))?;
                    for (param, ret) in params.iter().zip(rets) {
                        me.emit_instr(ImpInstr::Store(param.to_expr(), ret))?;
                    }
                    Ok(Vec::new())
                })?
            };
            let function = ImpFunction {
                name: me.supply.fresh(NameColor::Imp),
                ty: IFunType {
                    cc: CallingConvention::FFIFun,
                    arg_tys: params.iter().map(|p| p.ty.clone()).collect(),
                    ret_tys: Vec::new(),
                },
                params,
                body,
            };
            Ok((function, me.supply))
        }
        ExportCC::Xla => {
            let byte_ptr = IType::ptr_to(
                AddressSpace::Heap(Device::Cpu),
                IType::Scalar(ScalarBaseType::U8),
            );
            let inputs = me.fresh_ibinder(IType::ptr_to(
                AddressSpace::Heap(Device::Cpu),
                byte_ptr.clone(),
            ));
            let single_output = ret_tys.len() == 1;
            let outputs = if single_output {
                me.fresh_ibinder(byte_ptr.clone())
            } else {
                me.fresh_ibinder(IType::ptr_to(
                    AddressSpace::Heap(Device::Cpu),
                    byte_ptr.clone(),
                ))
            };
            let params = vec![inputs.clone(), outputs.clone()];
            let body = {
                let ret_tys = ret_tys.clone();
                me.scoped_block(move |me| {
                    let rets =
                        me.emit_instr(ImpInstr::ICall(callee, Vec::new(), ret_tys.clone()))?;
                    for (k, (ret, ty)) in rets.into_iter().zip(&ret_tys).enumerate() {
                        let byte_buf = if single_output {
                            outputs.to_expr()
                        } else {
                            let slot = me.emit_instr1(ImpInstr::IPtrOffset(
                                outputs.to_expr(),
                                IExpr::idx_lit(k as u32),
                            ))?;
                            me.emit_instr1(ImpInstr::IPtrLoad(slot))?
                        };
                        let typed = me.emit_instr1(ImpInstr::IBitcastOp(
                            IType::ptr_to(AddressSpace::Heap(Device::Cpu), ty.clone()),
                            byte_buf,
                        ))?;
                        me.emit_instr(ImpInstr::Store(typed, ret))?;
                    }
                    Ok(Vec::new())
                })?
            };
            let function = ImpFunction {
                name: me.supply.fresh(NameColor::Imp),
                ty: IFunType {
                    cc: CallingConvention::FFIFun,
                    arg_tys: params.iter().map(|p| p.ty.clone()).collect(),
                    ret_tys: Vec::new(),
                },
                params,
                body,
            };
            Ok((function, me.supply))
        }
    }
}
