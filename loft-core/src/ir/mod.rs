//! High-level IR for the lowering core.
//!
//! Two phases share one syntactic family, distinguished by a runtime
//! phase tag rather than a type index:
//! - `Simp`: post-inference, post-simplification input. Tables are built
//!   with `for`; no destinations exist yet.
//! - `Lowered`: after loop lowering. `for` is gone, replaced by `Seq`
//!   loops writing through explicit destinations (`AllocDest`, `Place`,
//!   `Freeze`), and destination references may appear in atom position.
//!
//! The constructors legal only after lowering are documented as such and
//! rejected by `validate::check_simp_block` on Simp-phase input.

pub mod fold;
pub mod queries;
pub mod validate;

use crate::name::{Name, NameColor, NameSupply};
use std::collections::BTreeSet;

// =============================================================================
// Base types and literals
// =============================================================================

/// Scalar machine types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarBaseType {
    U8,
    U32,
    U64,
    I32,
    I64,
    F32,
    F64,
}

impl ScalarBaseType {
    /// Width in bytes.
    pub fn byte_width(self) -> u32 {
        match self {
            ScalarBaseType::U8 => 1,
            ScalarBaseType::U32 | ScalarBaseType::I32 | ScalarBaseType::F32 => 4,
            ScalarBaseType::U64 | ScalarBaseType::I64 | ScalarBaseType::F64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ScalarBaseType::F32 | ScalarBaseType::F64)
    }
}

/// Representation type of index ordinals and buffer offsets.
pub const IDX_REP: ScalarBaseType = ScalarBaseType::U32;

/// Representation type of sum tags.
pub const TAG_REP: ScalarBaseType = ScalarBaseType::U8;

/// Compute device a pointer lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Gpu,
}

/// Address space of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSpace {
    Stack,
    Heap(Device),
}

/// Pointer type: address space plus pointee.
#[derive(Debug, Clone, PartialEq)]
pub struct PtrType {
    pub addr_space: AddressSpace,
    pub pointee: BaseType,
}

/// Unboxed value types.
#[derive(Debug, Clone, PartialEq)]
pub enum BaseType {
    Scalar(ScalarBaseType),
    Vector(u32, ScalarBaseType),
    Ptr(Box<PtrType>),
}

impl BaseType {
    pub fn ptr_to(addr_space: AddressSpace, pointee: BaseType) -> BaseType {
        BaseType::Ptr(Box::new(PtrType {
            addr_space,
            pointee,
        }))
    }
}

/// Scalar literals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LitVal {
    U8(u8),
    U32(u32),
    U64(u64),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl LitVal {
    pub fn base_ty(self) -> ScalarBaseType {
        match self {
            LitVal::U8(_) => ScalarBaseType::U8,
            LitVal::U32(_) => ScalarBaseType::U32,
            LitVal::U64(_) => ScalarBaseType::U64,
            LitVal::I32(_) => ScalarBaseType::I32,
            LitVal::I64(_) => ScalarBaseType::I64,
            LitVal::F32(_) => ScalarBaseType::F32,
            LitVal::F64(_) => ScalarBaseType::F64,
        }
    }

    /// The all-zeros literal of a scalar type.
    pub fn zero(ty: ScalarBaseType) -> LitVal {
        match ty {
            ScalarBaseType::U8 => LitVal::U8(0),
            ScalarBaseType::U32 => LitVal::U32(0),
            ScalarBaseType::U64 => LitVal::U64(0),
            ScalarBaseType::I32 => LitVal::I32(0),
            ScalarBaseType::I64 => LitVal::I64(0),
            ScalarBaseType::F32 => LitVal::F32(0.0),
            ScalarBaseType::F64 => LitVal::F64(0.0),
        }
    }

    /// Interpret as an index ordinal, if it is one.
    pub fn as_u32(self) -> Option<u32> {
        match self {
            LitVal::U32(n) => Some(n),
            _ => None,
        }
    }
}

// =============================================================================
// Types
// =============================================================================

/// A binder: a fresh name annotated with its type.
#[derive(Debug, Clone, PartialEq)]
pub struct Binder {
    pub name: Name,
    pub ty: SType,
}

impl Binder {
    pub fn new(name: Name, ty: SType) -> Self {
        Binder { name, ty }
    }
}

/// Table type: an index-set binder over a (possibly dependent) body.
#[derive(Debug, Clone, PartialEq)]
pub struct TabType {
    pub binder: Binder,
    pub ix: IxType,
    pub body: SType,
}

/// Dependent-pair type. The right component may reference the binder,
/// which stands for the left value.
#[derive(Debug, Clone, PartialEq)]
pub struct DepPairType {
    pub binder: Binder,
    pub lhs: SType,
    pub rhs: SType,
}

/// Function type.
#[derive(Debug, Clone, PartialEq)]
pub struct PiType {
    pub binders: Vec<Binder>,
    pub effs: EffectRow,
    pub result: SType,
}

/// High-IR types.
#[derive(Debug, Clone, PartialEq)]
pub enum SType {
    Base(BaseType),
    /// Natural numbers; a wrapper over the index representation type.
    Nat,
    /// `Fin n`: ordinals below `n`. The size is a Nat-valued atom.
    Fin(Box<Atom>),
    Prod(Vec<SType>),
    Sum(Vec<SType>),
    Tab(Box<TabType>),
    DepPair(Box<DepPairType>),
    Pi(Box<PiType>),
    /// A user data type applied to its arguments, carried with its
    /// representation type (instantiation happened upstream).
    TypeCon { name: String, rep: Box<SType> },
    Record(Vec<(String, SType)>),
    Variant(Vec<(String, SType)>),
    /// A write-mode reference to a value of the inner type.
    Ref(Box<SType>),
}

impl SType {
    pub fn unit() -> SType {
        SType::Prod(Vec::new())
    }

    pub fn idx_rep() -> SType {
        SType::Base(BaseType::Scalar(IDX_REP))
    }

    pub fn tag_rep() -> SType {
        SType::Base(BaseType::Scalar(TAG_REP))
    }

    pub fn scalar(ty: ScalarBaseType) -> SType {
        SType::Base(BaseType::Scalar(ty))
    }

    pub fn ref_to(ty: SType) -> SType {
        SType::Ref(Box::new(ty))
    }

    pub fn tab(binder: Binder, ix: IxType, body: SType) -> SType {
        SType::Tab(Box::new(TabType { binder, ix, body }))
    }

    pub fn fin(size: Atom) -> SType {
        SType::Fin(Box::new(size))
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, SType::Prod(tys) if tys.is_empty())
    }
}

// =============================================================================
// Index sets
// =============================================================================

/// Evidence that a type is iterable.
///
/// `Fin` carries its size directly; any other index set arrives as an
/// elaborated dictionary exposing `size`, `ordinal`, and
/// `unsafe_from_ordinal`.
#[derive(Debug, Clone, PartialEq)]
pub enum IxDict {
    /// `Fin n` with `n` a Nat-valued atom.
    Fin(Atom),
    /// A user-supplied instance. `size` is a Nat-valued atom; the other
    /// two are unary lambdas (element -> ordinal, ordinal -> element).
    Custom {
        size: Box<Atom>,
        ordinal: Box<Atom>,
        unsafe_from_ordinal: Box<Atom>,
    },
}

/// An index type: the element type together with its iteration evidence.
#[derive(Debug, Clone, PartialEq)]
pub struct IxType {
    pub elem_ty: SType,
    pub dict: IxDict,
}

impl IxType {
    /// The common case: `Fin n` indexed by its own ordinals.
    pub fn fin(size: Atom) -> IxType {
        IxType {
            elem_ty: SType::fin(size.clone()),
            dict: IxDict::Fin(size),
        }
    }

    /// `Fin n` with a compile-time size.
    pub fn fin_const(n: u32) -> IxType {
        IxType::fin(Atom::nat_lit(n))
    }
}

// =============================================================================
// Effects
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RWSKind {
    Reader,
    Writer,
    State,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Effect {
    /// A reader/writer/state effect on the named reference region.
    Rws(RWSKind, Name),
    Io,
    /// Writes to a not-yet-frozen destination.
    Init,
}

/// A set of effects. Post-simplification rows are closed (no tail).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EffectRow(pub BTreeSet<Effect>);

impl EffectRow {
    pub fn pure() -> EffectRow {
        EffectRow(BTreeSet::new())
    }

    pub fn single(eff: Effect) -> EffectRow {
        let mut set = BTreeSet::new();
        set.insert(eff);
        EffectRow(set)
    }

    pub fn is_pure(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, eff: Effect) -> bool {
        self.0.contains(&eff)
    }

    pub fn union(&self, other: &EffectRow) -> EffectRow {
        EffectRow(self.0.union(&other.0).copied().collect())
    }

    pub fn insert(&mut self, eff: Effect) {
        self.0.insert(eff);
    }

    pub fn remove(&mut self, eff: Effect) {
        self.0.remove(&eff);
    }

    /// True when every effect is `Init` (or the row is pure): the body
    /// only writes fresh destinations.
    pub fn init_only(&self) -> bool {
        self.0.iter().all(|e| matches!(e, Effect::Init))
    }
}

// =============================================================================
// Atoms
// =============================================================================

/// A single projection step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    /// Select component `i` of a product or dependent pair.
    Prod(usize),
    /// Strip a newtype-like wrapper (TypeCon, Nat, Fin, Record, Variant).
    Unwrap,
}

/// Constructor applications.
#[derive(Debug, Clone, PartialEq)]
pub enum Con {
    ProdCon(Vec<Atom>),
    /// An ordinary sum value with a known tag.
    SumCon {
        tys: Vec<SType>,
        tag: usize,
        payload: Box<Atom>,
    },
    /// A sum stored as tag-plus-all-payloads; appears once cases have
    /// been memory-normalized.
    SumAsProd {
        tys: Vec<SType>,
        tag: Box<Atom>,
        payloads: Vec<Atom>,
    },
    /// Wrap a representation value as a nominal type (TypeCon, Nat,
    /// Fin, Record, Variant).
    Newtype { ty: SType, inner: Box<Atom> },
}

/// A case alternative whose body is an atom (case pushed into atom
/// position during simplification).
#[derive(Debug, Clone, PartialEq)]
pub struct AtomAlt {
    pub binder: Binder,
    pub body: Atom,
}

/// Values in weak-head normal form.
#[derive(Debug, Clone, PartialEq)]
pub enum Atom {
    Var(Name),
    Lit(LitVal),
    Con(Con),
    Lam(Box<Lam>),
    TabLam(Box<TabLam>),
    DepPair(Box<Atom>, Box<Atom>, Box<DepPairType>),
    /// A chain of projections applied (in order) to a variable.
    ProjectElt(Vec<Projection>, Name),
    ACase(Box<Atom>, Vec<AtomAlt>, SType),
    /// Lowered only: a destination in atom position.
    DestRef(Box<Dest>),
    /// Lowered only: a raw Imp-level scalar or pointer embedded in an
    /// atom.
    ImpVar(Name, crate::imp::IType),
}

impl Atom {
    pub fn unit() -> Atom {
        Atom::Con(Con::ProdCon(Vec::new()))
    }

    pub fn prod(elems: Vec<Atom>) -> Atom {
        Atom::Con(Con::ProdCon(elems))
    }

    /// An index-representation literal.
    pub fn idx_lit(n: u32) -> Atom {
        Atom::Lit(LitVal::U32(n))
    }

    /// A Nat value (newtype over the index representation).
    pub fn nat_lit(n: u32) -> Atom {
        Atom::Con(Con::Newtype {
            ty: SType::Nat,
            inner: Box::new(Atom::idx_lit(n)),
        })
    }

    /// A value of `Fin n` with the given ordinal.
    pub fn fin_lit(ord: u32, size: Atom) -> Atom {
        Atom::Con(Con::Newtype {
            ty: SType::fin(size),
            inner: Box::new(Atom::idx_lit(ord)),
        })
    }

    pub fn newtype(ty: SType, inner: Atom) -> Atom {
        Atom::Con(Con::Newtype {
            ty,
            inner: Box::new(inner),
        })
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, Atom::Con(Con::ProdCon(xs)) if xs.is_empty())
    }

    /// Apply one projection, reducing structurally where possible.
    pub fn proj(&self, p: Projection) -> Atom {
        match (p, self) {
            (Projection::Prod(i), Atom::Con(Con::ProdCon(xs))) => xs[i].clone(),
            (Projection::Prod(0), Atom::DepPair(l, _, _)) => (**l).clone(),
            (Projection::Prod(1), Atom::DepPair(_, r, _)) => (**r).clone(),
            (Projection::Unwrap, Atom::Con(Con::Newtype { inner, .. })) => (**inner).clone(),
            (_, Atom::Var(n)) => Atom::ProjectElt(vec![p], *n),
            (_, Atom::ProjectElt(ps, n)) => {
                let mut ps = ps.clone();
                ps.push(p);
                Atom::ProjectElt(ps, *n)
            }
            (_, other) => panic!("cannot project {:?} out of atom {:?}", p, other),
        }
    }
}

// =============================================================================
// Lambdas
// =============================================================================

/// A term-level lambda.
#[derive(Debug, Clone, PartialEq)]
pub struct Lam {
    pub binders: Vec<Binder>,
    pub effs: EffectRow,
    pub body: Block,
}

/// A table lambda: one element per index.
#[derive(Debug, Clone, PartialEq)]
pub struct TabLam {
    pub binder: Binder,
    pub ix: IxType,
    pub body: Block,
}

// =============================================================================
// Expressions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Fwd,
    Rev,
}

/// A case alternative with a block body.
#[derive(Debug, Clone, PartialEq)]
pub struct Alt {
    pub binder: Binder,
    pub body: Block,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseExpr {
    pub scrut: Atom,
    pub alts: Vec<Alt>,
    pub ty: SType,
    pub effs: EffectRow,
}

/// `for` comprehension: one iteration per index, collecting a table.
#[derive(Debug, Clone, PartialEq)]
pub struct ForExpr {
    pub dir: Direction,
    pub ix: IxType,
    /// Unary: the index.
    pub lam: Lam,
}

/// Lowered only: a sequential loop threading a carry and writing into
/// destinations.
#[derive(Debug, Clone, PartialEq)]
pub struct SeqExpr {
    pub dir: Direction,
    pub ix: IxType,
    pub carry: Atom,
    /// Binary: the index and the carry.
    pub lam: Lam,
}

/// The monoid a writer accumulates with.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseMonoid {
    pub empty: Atom,
    /// Binary: old accumulator, new contribution.
    pub combine: Lam,
}

/// Higher-order operations.
#[derive(Debug, Clone, PartialEq)]
pub enum Hof {
    For(Box<ForExpr>),
    /// Lowered only.
    Seq(Box<SeqExpr>),
    While(Box<Block>),
    /// Run a computation with a read-only reference to the value.
    /// The lambda is binary: handler token, reference.
    RunReader(Atom, Box<Lam>),
    /// Run with an accumulator reference. The dest slot is filled in by
    /// loop lowering; it is `None` in Simp-phase input.
    RunWriter(Option<Atom>, BaseMonoid, Box<Lam>),
    /// Run with a mutable state reference, seeded with the atom.
    RunState(Option<Atom>, Atom, Box<Lam>),
    RunIO(Box<Block>),
    RunInit(Box<Block>),
    /// Lowered only: run the unary lambda with its binder bound to the
    /// given destination and return the destination itself.
    RememberDest(Atom, Box<Lam>),
}

/// Reference operations inside RWS regions.
#[derive(Debug, Clone, PartialEq)]
pub enum RefOp {
    Ask,
    Get,
    Put(Atom),
    /// Combine the accumulator with a contribution using the writer's
    /// monoid.
    Extend(Box<Lam>, Atom),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOpKind {
    IAdd,
    ISub,
    IMul,
    IDiv,
    IRem,
    ICmpEq,
    ICmpNe,
    ICmpLt,
    ICmpGe,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FCmpEq,
    FCmpLt,
    BAnd,
    BOr,
    BXor,
    BShl,
    BShr,
}

impl BinOpKind {
    /// Comparison ops produce a byte; everything else preserves the
    /// operand type.
    pub fn is_cmp(self) -> bool {
        matches!(
            self,
            BinOpKind::ICmpEq
                | BinOpKind::ICmpNe
                | BinOpKind::ICmpLt
                | BinOpKind::ICmpGe
                | BinOpKind::FCmpEq
                | BinOpKind::FCmpLt
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOpKind {
    FNeg,
    BNot,
}

/// Primitive operations.
#[derive(Debug, Clone, PartialEq)]
pub enum PrimOp {
    BinOp(BinOpKind, Atom, Atom),
    UnOp(UnOpKind, Atom),
    Select(Atom, Atom, Atom),
    CastOp(SType, Atom),
    /// Number of elements of an index set, as an index-rep value.
    IxSize(IxType),
    /// Ordinal of an index, as an index-rep value.
    Ordinal(IxType, Atom),
    /// Index with the given ordinal; no bounds check.
    UnsafeFromOrdinal(IxType, Atom),
    /// Table literal from per-element atoms.
    TabCon(SType, Vec<Atom>),
    RefOp(Atom, RefOp),
    /// Lowered only: allocate a fresh destination for a value of the
    /// type.
    AllocDest(SType),
    /// Lowered only: write the value through the reference.
    Place(Atom, Atom),
    /// Lowered only: converts a write-mode reference to its stored
    /// value at the end of a `Seq`.
    Freeze(Atom),
    /// Lowered only: the per-element destination of a table destination.
    IndexRef(Atom, Atom),
    /// Lowered only: the destination of one component of an aggregate
    /// destination.
    ProjRef(Projection, Atom),
    PtrOffset(Atom, Atom),
    PtrLoad(Atom),
    /// Vectorized only: a width-`W` slice of a table destination,
    /// reinterpreted at vector type.
    VectorSubref(Atom, Atom, SType),
    VectorBroadcast(Atom, SType),
    VectorIota(SType),
    /// Abort execution with a runtime error.
    ThrowError(SType),
    /// Eliminated before lowering; kept so the translator can fail
    /// loudly on upstream bugs.
    RecordCons(Vec<(String, Atom)>),
    VariantCon {
        tys: Vec<(String, SType)>,
        label: String,
        payload: Box<Atom>,
    },
}

/// Expressions: the right-hand sides of declarations.
#[derive(Debug, Clone, PartialEq)]
pub enum SExpr {
    Atom(Atom),
    App(Atom, Vec<Atom>),
    TabApp(Atom, Vec<Atom>),
    Case(Box<CaseExpr>),
    Op(PrimOp),
    Hof(Hof),
}

// =============================================================================
// Blocks and declarations
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LetAnn {
    Plain,
    /// Hint that the binding must not be duplicated downstream.
    NoInline,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decl {
    pub binder: Binder,
    pub ann: LetAnn,
    pub expr: SExpr,
}

/// Result type and effects of a non-empty block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockAnn {
    pub ty: SType,
    pub effs: EffectRow,
}

/// A sequence of let-bindings culminating in a result atom.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// `None` exactly when `decls` is empty.
    pub ann: Option<BlockAnn>,
    pub decls: Vec<Decl>,
    pub result: Atom,
}

impl Block {
    /// A declaration-free block.
    pub fn from_atom(result: Atom) -> Block {
        Block {
            ann: None,
            decls: Vec::new(),
            result,
        }
    }
}

/// A block abstracted over its result destination. The body writes the
/// answer through the binder and produces unit.
#[derive(Debug, Clone, PartialEq)]
pub struct DestBlock {
    pub dest_binder: Binder,
    pub block: Block,
}

// =============================================================================
// Destinations
// =============================================================================

/// The body of a table destination: given the index bound to `binder`,
/// the decls compute the element destination delivered as the block's
/// `DestRef` result.
#[derive(Debug, Clone, PartialEq)]
pub struct TabDest {
    pub binder: Binder,
    pub ix: IxType,
    pub body: Block,
}

/// The right component of a dependent-pair destination, abstracted over
/// the eventual left value.
#[derive(Debug, Clone, PartialEq)]
pub struct DestAbs {
    pub binder: Binder,
    pub dest: Dest,
}

/// One deferred allocation of a boxed destination: a cell holding the
/// runtime pointer, the pointer's type, and the block computing the
/// element count.
#[derive(Debug, Clone, PartialEq)]
pub struct BoxPtr {
    pub cell: Dest,
    pub ptr_ty: PtrType,
    pub size: Block,
}

/// A typed write-handle tree mapping a logical type onto flat buffers.
#[derive(Debug, Clone, PartialEq)]
pub enum Dest {
    /// A pointer into a flat buffer.
    BaseRef { ptr: Atom, ty: BaseType },
    /// An indexed collection of destinations.
    TabRef(Box<TabDest>),
    ProdRef(Vec<Dest>),
    /// A sum stored as a tag plus all payload destinations; every
    /// payload is allocated so addresses stay statically determined.
    SumAsProdRef {
        tys: Vec<SType>,
        tag: Box<Dest>,
        payloads: Vec<Dest>,
    },
    NewtypeRef { ty: SType, inner: Box<Dest> },
    /// The right destination is only materializable once the left value
    /// has been written.
    DepPairRef {
        lhs: Box<Dest>,
        rhs: Box<DestAbs>,
        ty: Box<DepPairType>,
    },
    /// A destination parameterized over runtime-allocated pointers,
    /// bound lazily once the values they depend on are known.
    BoxedRef {
        boxes: Vec<BoxPtr>,
        ptr_binders: Vec<Binder>,
        inner: Box<Dest>,
    },
}

impl Dest {
    /// The type of values this destination accepts.
    pub fn value_ty(&self) -> SType {
        match self {
            Dest::BaseRef { ty, .. } => SType::Base(ty.clone()),
            Dest::TabRef(tab) => {
                let body_ty = match &tab.body.result {
                    Atom::DestRef(d) => d.value_ty(),
                    other => panic!("table dest body must end in a DestRef, got {:?}", other),
                };
                SType::tab(tab.binder.clone(), tab.ix.clone(), body_ty)
            }
            Dest::ProdRef(ds) => SType::Prod(ds.iter().map(|d| d.value_ty()).collect()),
            Dest::SumAsProdRef { tys, .. } => SType::Sum(tys.clone()),
            Dest::NewtypeRef { ty, .. } => ty.clone(),
            Dest::DepPairRef { ty, .. } => SType::DepPair(ty.clone()),
            Dest::BoxedRef { inner, .. } => inner.value_ty(),
        }
    }
}

/// Allocation mode for destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocType {
    /// Freed by the surrounding scoped block.
    Managed,
    /// Ownership handed to the caller.
    Unmanaged,
}

/// One pointer request produced by destination synthesis.
#[derive(Debug, Clone, PartialEq)]
pub struct DestPtrInfo {
    pub binder: Binder,
    pub ptr_ty: PtrType,
    /// Element count of the allocation, as a block over the enclosing
    /// scope.
    pub size: Block,
    /// True when the pointer backs a single scalar cell (empty index
    /// telescope); such results are returned by value.
    pub scalar_cell: bool,
}

/// A destination abstracted over the pointers that realize it, paired
/// with the allocation requests for those pointers.
#[derive(Debug, Clone, PartialEq)]
pub struct AbsPtrs {
    pub ptrs: Vec<DestPtrInfo>,
    pub dest: Dest,
}

// =============================================================================
// Convenience constructors
// =============================================================================

/// Allocate a fresh atom-colored binder.
pub fn fresh_binder(supply: &mut NameSupply, ty: SType) -> Binder {
    Binder::new(supply.fresh(NameColor::Atom), ty)
}
