//! Scoped emission of declarations.
//!
//! A builder scope is an explicit stack of emission frames. `emit`
//! appends a decl to the innermost frame and returns the fresh name;
//! `build_block` runs a computation in a fresh frame and seals the
//! emitted decls into a block, recomputing its type and effects. A
//! sealed block whose result type mentions one of its own binders is a
//! hoisting failure and halts compilation with an internal-error tag.

use crate::err_internal;
use crate::error::Result;
use crate::ir::fold::{free_vars_expr, free_vars_type};
use crate::ir::queries::{block_effects, expr_effects, type_of_atom, type_of_expr, TypeEnv};
use crate::ir::*;
use crate::name::{Name, NameColor, NameSupply};

struct Frame {
    decls: Vec<Decl>,
    /// Names introduced in this frame: decl binders plus parameters
    /// registered with `bind_param`.
    names: Vec<Name>,
}

impl Frame {
    fn new() -> Self {
        Frame {
            decls: Vec::new(),
            names: Vec::new(),
        }
    }
}

pub struct Builder {
    supply: NameSupply,
    frames: Vec<Frame>,
    env: TypeEnv,
}

impl Builder {
    pub fn new(supply: NameSupply) -> Self {
        Builder::with_env(supply, TypeEnv::new())
    }

    /// Start a builder whose root scope already binds the given names.
    pub fn with_env(supply: NameSupply, env: TypeEnv) -> Self {
        Builder {
            supply,
            frames: vec![Frame::new()],
            env,
        }
    }

    pub fn into_supply(self) -> NameSupply {
        self.supply
    }

    pub fn env(&self) -> &TypeEnv {
        &self.env
    }

    pub fn fresh_name(&mut self, color: NameColor) -> Name {
        self.supply.fresh(color)
    }

    /// Allocate a binder of the given type without emitting anything.
    /// The binder is not in scope until `bind_param` is called.
    pub fn with_fresh_binder(&mut self, ty: SType) -> Binder {
        Binder::new(self.supply.fresh(NameColor::Atom), ty)
    }

    /// Bring a parameter binder into scope in the current frame.
    pub fn bind_param(&mut self, binder: &Binder) {
        self.env.insert(binder.name, binder.ty.clone());
        if let Some(frame) = self.frames.last_mut() {
            frame.names.push(binder.name);
        }
    }

    pub fn type_of(&self, atom: &Atom) -> Result<SType> {
        type_of_atom(&self.env, atom)
    }

    pub fn expr_ty(&self, expr: &SExpr) -> Result<SType> {
        type_of_expr(&self.env, expr)
    }

    // =========================================================================
    // Emission
    // =========================================================================

    /// Emit a decl binding the expression; returns the fresh variable.
    /// Bare atoms are passed through without a binding.
    pub fn emit(&mut self, expr: SExpr) -> Result<Atom> {
        if let SExpr::Atom(a) = expr {
            return Ok(a);
        }
        let ty = type_of_expr(&self.env, &expr)?;
        self.emit_typed(ty, expr)
    }

    pub fn emit_op(&mut self, op: PrimOp) -> Result<Atom> {
        self.emit(SExpr::Op(op))
    }

    pub fn emit_hof(&mut self, hof: Hof) -> Result<Atom> {
        self.emit(SExpr::Hof(hof))
    }

    /// Emit with an explicitly provided result type.
    pub fn emit_typed(&mut self, ty: SType, expr: SExpr) -> Result<Atom> {
        let name = self.supply.fresh(NameColor::Atom);
        self.env.insert(name, ty.clone());
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| err_internal!("builder", "emit outside any frame"))?;
        frame.names.push(name);
        frame.decls.push(Decl {
            binder: Binder::new(name, ty),
            ann: LetAnn::Plain,
            expr,
        });
        Ok(Atom::Var(name))
    }

    // =========================================================================
    // Scopes
    // =========================================================================

    fn push_frame(&mut self) {
        self.frames.push(Frame::new());
    }

    fn pop_frame(&mut self) -> Frame {
        let frame = self.frames.pop().expect("unbalanced builder frames");
        for name in &frame.names {
            self.env.remove(*name);
        }
        frame
    }

    /// Run `f` in a fresh frame and return its emissions unsealed.
    pub fn build_scoped<R>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<(Vec<Decl>, R)> {
        self.push_frame();
        let result = f(self);
        let frame = self.pop_frame();
        Ok((frame.decls, result?))
    }

    /// Run `f` in a fresh frame and seal its emissions into a block.
    pub fn build_block(&mut self, f: impl FnOnce(&mut Self) -> Result<Atom>) -> Result<Block> {
        self.push_frame();
        let result = f(self);
        match result {
            Ok(result) => self.seal_frame(result),
            Err(e) => {
                self.pop_frame();
                Err(e)
            }
        }
    }

    /// Seal the current frame into a block ending in `result`. The
    /// result type is recomputed; a type that mentions one of the
    /// frame's own decl binders cannot be hoisted out and is an
    /// internal error.
    fn seal_frame(&mut self, result: Atom) -> Result<Block> {
        let ty = match type_of_atom(&self.env, &result) {
            Ok(ty) => ty,
            Err(e) => {
                self.pop_frame();
                return Err(e);
            }
        };
        let frame = self.pop_frame();
        let decl_names: Vec<Name> = frame.decls.iter().map(|d| d.binder.name).collect();
        let ty_fvs = free_vars_type(&ty);
        if let Some(escapee) = decl_names.iter().find(|n| ty_fvs.contains(*n)) {
            return Err(err_internal!(
                "hoist-failure",
                "result type {:?} mentions block-local binder {}",
                ty,
                escapee
            ));
        }
        let effs = frame
            .decls
            .iter()
            .fold(EffectRow::pure(), |acc, d| acc.union(&expr_effects(&d.expr)));
        let ann = if frame.decls.is_empty() {
            None
        } else {
            Some(BlockAnn { ty, effs })
        };
        Ok(Block {
            ann,
            decls: frame.decls,
            result,
        })
    }

    /// Build a lambda: binders come into scope, the body is sealed into
    /// a block, and the lambda's effect row is the body's.
    pub fn build_lam(
        &mut self,
        binders: Vec<Binder>,
        f: impl FnOnce(&mut Self, &[Binder]) -> Result<Atom>,
    ) -> Result<Lam> {
        self.push_frame();
        for b in &binders {
            self.env.insert(b.name, b.ty.clone());
            // Parameters are not decls; track them for env cleanup only.
            if let Some(frame) = self.frames.last_mut() {
                frame.names.push(b.name);
            }
        }
        let result = f(self, &binders);
        let body = match result {
            Ok(result) => self.seal_frame(result)?,
            Err(e) => {
                self.pop_frame();
                return Err(e);
            }
        };
        let effs = block_effects(&body);
        Ok(Lam {
            binders,
            effs,
            body,
        })
    }

    /// Build a block under parameter binders that are bound outside it
    /// (an abstraction body).
    pub fn build_abs(
        &mut self,
        binders: &[Binder],
        f: impl FnOnce(&mut Self) -> Result<Atom>,
    ) -> Result<Block> {
        self.push_frame();
        for b in binders {
            self.env.insert(b.name, b.ty.clone());
            if let Some(frame) = self.frames.last_mut() {
                frame.names.push(b.name);
            }
        }
        let result = f(self);
        match result {
            Ok(result) => self.seal_frame(result),
            Err(e) => {
                self.pop_frame();
                Err(e)
            }
        }
    }

    /// Build a table lambda over the given index set.
    pub fn build_tab_lam(
        &mut self,
        ix: IxType,
        f: impl FnOnce(&mut Self, &Binder) -> Result<Atom>,
    ) -> Result<TabLam> {
        let binder = self.with_fresh_binder(ix.elem_ty.clone());
        self.push_frame();
        self.env.insert(binder.name, binder.ty.clone());
        if let Some(frame) = self.frames.last_mut() {
            frame.names.push(binder.name);
        }
        let result = f(self, &binder);
        let body = match result {
            Ok(result) => self.seal_frame(result)?,
            Err(e) => {
                self.pop_frame();
                return Err(e);
            }
        };
        Ok(TabLam { binder, ix, body })
    }

    // =========================================================================
    // Index-representation arithmetic with light folding
    // =========================================================================

    fn fold_idx_binop(k: BinOpKind, a: &Atom, b: &Atom) -> Option<Atom> {
        let (x, y) = match (a, b) {
            (Atom::Lit(LitVal::U32(x)), Atom::Lit(LitVal::U32(y))) => (Some(*x), Some(*y)),
            (Atom::Lit(LitVal::U32(x)), _) => (Some(*x), None),
            (_, Atom::Lit(LitVal::U32(y))) => (None, Some(*y)),
            _ => (None, None),
        };
        match (k, x, y) {
            (BinOpKind::IAdd, Some(x), Some(y)) => Some(Atom::idx_lit(x.wrapping_add(y))),
            (BinOpKind::IAdd, Some(0), None) => Some(b.clone()),
            (BinOpKind::IAdd, None, Some(0)) => Some(a.clone()),
            (BinOpKind::ISub, Some(x), Some(y)) => Some(Atom::idx_lit(x.wrapping_sub(y))),
            (BinOpKind::ISub, None, Some(0)) => Some(a.clone()),
            (BinOpKind::IMul, Some(x), Some(y)) => Some(Atom::idx_lit(x.wrapping_mul(y))),
            (BinOpKind::IMul, Some(1), None) => Some(b.clone()),
            (BinOpKind::IMul, None, Some(1)) => Some(a.clone()),
            (BinOpKind::IMul, Some(0), None) | (BinOpKind::IMul, None, Some(0)) => {
                Some(Atom::idx_lit(0))
            }
            (BinOpKind::IDiv, Some(x), Some(y)) if y != 0 => Some(Atom::idx_lit(x / y)),
            (BinOpKind::IDiv, None, Some(1)) => Some(a.clone()),
            _ => None,
        }
    }

    fn idx_binop(&mut self, k: BinOpKind, a: Atom, b: Atom) -> Result<Atom> {
        if let Some(folded) = Self::fold_idx_binop(k, &a, &b) {
            return Ok(folded);
        }
        self.emit_op(PrimOp::BinOp(k, a, b))
    }

    pub fn iadd(&mut self, a: Atom, b: Atom) -> Result<Atom> {
        self.idx_binop(BinOpKind::IAdd, a, b)
    }

    pub fn isub(&mut self, a: Atom, b: Atom) -> Result<Atom> {
        self.idx_binop(BinOpKind::ISub, a, b)
    }

    pub fn imul(&mut self, a: Atom, b: Atom) -> Result<Atom> {
        self.idx_binop(BinOpKind::IMul, a, b)
    }

    pub fn idiv(&mut self, a: Atom, b: Atom) -> Result<Atom> {
        self.idx_binop(BinOpKind::IDiv, a, b)
    }
}

/// A decl may move out of a binder's scope only when it is pure and
/// does not reference that binder.
pub fn can_hoist_decl(decl: &Decl, past: Name) -> bool {
    expr_effects(&decl.expr).is_pure() && !free_vars_expr(&decl.expr).contains(&past)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i32_ty() -> SType {
        SType::scalar(ScalarBaseType::I32)
    }

    #[test]
    fn test_emit_returns_fresh_vars() {
        let mut b = Builder::new(NameSupply::new());
        let x = b.iadd(Atom::idx_lit(1), Atom::idx_lit(2)).unwrap();
        // Folded to a literal, no decl emitted.
        assert_eq!(x, Atom::idx_lit(3));

        let y = b
            .emit_op(PrimOp::BinOp(
                BinOpKind::FAdd,
                Atom::Lit(LitVal::F32(1.0)),
                Atom::Lit(LitVal::F32(2.0)),
            ))
            .unwrap();
        assert!(matches!(y, Atom::Var(_)));
    }

    #[test]
    fn test_build_block_seals_decls() {
        let mut b = Builder::new(NameSupply::new());
        let block = b
            .build_block(|b| {
                let x = b.emit_op(PrimOp::BinOp(
                    BinOpKind::FMul,
                    Atom::Lit(LitVal::F32(2.0)),
                    Atom::Lit(LitVal::F32(3.0)),
                ))?;
                b.emit_op(PrimOp::BinOp(BinOpKind::FAdd, x.clone(), x))
            })
            .unwrap();
        assert_eq!(block.decls.len(), 2);
        let ann = block.ann.as_ref().unwrap();
        assert_eq!(ann.ty, SType::scalar(ScalarBaseType::F32));
        assert!(ann.effs.is_pure());
    }

    #[test]
    fn test_empty_block_has_no_ann() {
        let mut b = Builder::new(NameSupply::new());
        let block = b.build_block(|_| Ok(Atom::idx_lit(7))).unwrap();
        assert!(block.ann.is_none());
        assert!(block.decls.is_empty());
    }

    #[test]
    fn test_scope_cleanup_on_pop() {
        let mut b = Builder::new(NameSupply::new());
        let mut leaked = None;
        let _ = b
            .build_block(|b| {
                let x = b.emit_op(PrimOp::BinOp(
                    BinOpKind::FAdd,
                    Atom::Lit(LitVal::F32(0.0)),
                    Atom::Lit(LitVal::F32(1.0)),
                ))?;
                leaked = Some(x.clone());
                Ok(x)
            })
            .unwrap();
        if let Some(Atom::Var(n)) = leaked {
            assert!(!b.env().contains(n));
        } else {
            panic!("expected a var");
        }
    }

    #[test]
    fn test_idx_arithmetic_folds() {
        let mut b = Builder::new(NameSupply::new());
        let binder = b.with_fresh_binder(SType::idx_rep());
        let v = b
            .build_lam(vec![binder], |b, binders| {
                let x = Atom::Var(binders[0].name);
                let one = b.imul(x.clone(), Atom::idx_lit(1))?;
                assert_eq!(one, x);
                let zero = b.imul(Atom::idx_lit(0), x.clone())?;
                assert_eq!(zero, Atom::idx_lit(0));
                b.iadd(x, Atom::idx_lit(0))
            })
            .unwrap();
        assert!(v.body.decls.is_empty());
    }

    #[test]
    fn test_can_hoist_decl() {
        let mut supply = NameSupply::new();
        let n = supply.fresh(NameColor::Atom);
        let other = supply.fresh(NameColor::Atom);
        let decl = Decl {
            binder: Binder::new(supply.fresh(NameColor::Atom), i32_ty()),
            ann: LetAnn::Plain,
            expr: SExpr::Op(PrimOp::BinOp(
                BinOpKind::IAdd,
                Atom::Var(other),
                Atom::Lit(LitVal::I32(1)),
            )),
        };
        assert!(can_hoist_decl(&decl, n));
        assert!(!can_hoist_decl(&decl, other));

        let impure = Decl {
            binder: Binder::new(supply.fresh(NameColor::Atom), SType::unit()),
            ann: LetAnn::Plain,
            expr: SExpr::Op(PrimOp::Place(Atom::Var(other), Atom::Lit(LitVal::I32(0)))),
        };
        assert!(!can_hoist_decl(&impure, n));
    }
}
