//! Array-language lowering and vectorization core.
//!
//! The input is a typed, simplified block whose distinguishing feature
//! is the `for` comprehension over statically sized index sets; the
//! output is a flat imperative IR in which every table allocation,
//! write, and piece of index arithmetic is explicit. In between sit
//! three passes: loop lowering with destination passing, an optional
//! vectorization rewrite, and the Imp translation.

pub mod algebra;
pub mod builder;
pub mod dest;
pub mod diags;
pub mod error;
pub mod imp;
pub mod imp_lowering;
pub mod ir;
pub mod lower;
pub mod name;
pub mod vectorize;

#[cfg(test)]
mod dest_tests;
#[cfg(test)]
mod imp_tests;
#[cfg(test)]
mod lower_tests;
#[cfg(test)]
mod vectorize_tests;

pub use error::{CompilerError, Result};

use imp::{ExportCC, ImpFunction, ImpFunctionWithRecon, ImpOptions};
use ir::{Block, DestBlock};
use name::NameSupply;

// =============================================================================
// Typestate pipeline
// =============================================================================
//
// Each struct is a stage; methods consume `self` and return the next
// stage, enforcing valid pass ordering:
//
//   let simplified = Simplified::new(block, supply);
//   let lowered = simplified.lower()?;             // for -> seq
//   let lowered = lowered.vectorize(4)?;           // optional rewrite
//   let imp = lowered.to_imp(&ImpOptions::default())?;

/// A typed, simplified input block together with the name supply that
/// produced it.
pub struct Simplified {
    pub block: Block,
    pub supply: NameSupply,
}

impl Simplified {
    pub fn new(block: Block, supply: NameSupply) -> Self {
        Simplified { block, supply }
    }

    /// Replace every `for` with a destination-writing `Seq`.
    pub fn lower(self) -> Result<Lowered> {
        let (dest_block, supply) = lower::lower_fully_sequential(self.supply, &self.block)?;
        Ok(Lowered { dest_block, supply })
    }
}

/// The destination-passing form: a block abstracted over its result
/// destination.
pub struct Lowered {
    pub dest_block: DestBlock,
    pub supply: NameSupply,
}

impl Lowered {
    /// Rewrite vectorizable inner loops at the given lane width. Loops
    /// that cannot be vectorized are kept unchanged.
    pub fn vectorize(self, width: u32) -> Result<Lowered> {
        let (dest_block, supply) =
            vectorize::vectorize_loops(self.supply, &self.dest_block, width)?;
        Ok(Lowered { dest_block, supply })
    }

    /// Translate to an Imp function with explicit allocation.
    pub fn to_imp(self, opts: &ImpOptions) -> Result<ImpLowered> {
        let (function, supply) =
            imp_lowering::to_imp_function(self.supply, opts, &self.dest_block)?;
        Ok(ImpLowered { function, supply })
    }
}

/// The final stage: an Imp function plus the reconstruction of its
/// high-level result from the scalar returns.
pub struct ImpLowered {
    pub function: ImpFunctionWithRecon,
    pub supply: NameSupply,
}

impl ImpLowered {
    /// Wrap the entry point for an external caller.
    pub fn export(&mut self, cc: ExportCC) -> Result<ImpFunction> {
        let supply = std::mem::take(&mut self.supply);
        let (wrapper, supply) = imp_lowering::export_function(supply, &self.function, cc)?;
        self.supply = supply;
        Ok(wrapper)
    }
}
