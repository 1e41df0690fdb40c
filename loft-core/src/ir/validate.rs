//! Debug-time IR validation.
//!
//! The runtime stand-in for the compile-time scope and phase indices of
//! the original design: binders must be unique, variable references
//! bound, and Simp-phase input must not contain lowered-only
//! constructors. Passes call these at entry under `debug_assertions`.

use super::fold::{free_vars_block, IrFolder};
use super::*;
use crate::err_internal;
use crate::error::Result;
use crate::name::Name;
use std::collections::HashSet;

struct Checker {
    simp_phase: bool,
    seen_binders: HashSet<Name>,
    violations: Vec<String>,
}

impl Checker {
    fn violation(&mut self, msg: String) {
        self.violations.push(msg);
    }
}

impl IrFolder for Checker {
    fn fold_binder(&mut self, binder: &Binder) -> Binder {
        if !self.seen_binders.insert(binder.name) {
            self.violation(format!("binder {} bound twice", binder.name));
        }
        let ty = self.fold_type(&binder.ty);
        Binder {
            name: binder.name,
            ty,
        }
    }

    fn fold_atom(&mut self, atom: &Atom) -> Atom {
        if self.simp_phase {
            match atom {
                Atom::DestRef(_) => {
                    self.violation("destination reference in Simp-phase atom".to_string())
                }
                Atom::ImpVar(n, _) => {
                    self.violation(format!("Imp variable {} in Simp-phase atom", n))
                }
                _ => {}
            }
        }
        super::fold::walk_atom(self, atom)
    }

    fn fold_expr(&mut self, expr: &SExpr) -> SExpr {
        if self.simp_phase {
            match expr {
                SExpr::Op(op) => match op {
                    PrimOp::AllocDest(_)
                    | PrimOp::Place(_, _)
                    | PrimOp::Freeze(_)
                    | PrimOp::IndexRef(_, _)
                    | PrimOp::ProjRef(_, _)
                    | PrimOp::VectorSubref(_, _, _)
                    | PrimOp::VectorBroadcast(_, _)
                    | PrimOp::VectorIota(_) => {
                        self.violation(format!("lowered-only op in Simp phase: {:?}", op))
                    }
                    _ => {}
                },
                SExpr::Hof(hof) => match hof {
                    Hof::Seq(_) | Hof::RememberDest(_, _) => {
                        self.violation("lowered-only hof in Simp phase".to_string())
                    }
                    Hof::RunWriter(Some(_), _, _) | Hof::RunState(Some(_), _, _) => self
                        .violation(
                            "RWS destination filled in before lowering".to_string(),
                        ),
                    _ => {}
                },
                _ => {}
            }
        }
        super::fold::walk_expr(self, expr)
    }
}

fn run_checker(block: &Block, simp_phase: bool) -> Result<()> {
    let mut checker = Checker {
        simp_phase,
        seen_binders: HashSet::new(),
        violations: Vec::new(),
    };
    let _ = checker.fold_block(block);
    if checker.violations.is_empty() {
        Ok(())
    } else {
        Err(err_internal!(
            "validate",
            "{}",
            checker.violations.join("; ")
        ))
    }
}

/// Check that a block is valid Simp-phase input: unique binders, no
/// lowered-only constructors.
pub fn check_simp_block(block: &Block) -> Result<()> {
    run_checker(block, true)
}

/// Check binder uniqueness only (any phase).
pub fn check_unique_binders(block: &Block) -> Result<()> {
    run_checker(block, false)
}

/// Check that every free variable of the block is bound in the given
/// scope.
pub fn check_closed(block: &Block, scope: &HashSet<Name>) -> Result<()> {
    let free = free_vars_block(block);
    let unbound: Vec<String> = free
        .iter()
        .filter(|n| !scope.contains(n))
        .map(|n| n.to_string())
        .collect();
    if unbound.is_empty() {
        Ok(())
    } else {
        Err(err_internal!(
            "validate",
            "unbound variables: {}",
            unbound.join(", ")
        ))
    }
}
