//! Imp IR: the flat imperative output of the pipeline.
//!
//! An Imp function is a nest of binders over a block of instructions.
//! Memory is explicit: allocations, stores, frees, and pointer
//! arithmetic all appear as instructions; scalar and vector base types
//! are the only values. Consumers lower this to LLVM-style targets.

use crate::ir::{
    AddressSpace, Atom, BaseType, Binder, BinOpKind, Device, Direction, LitVal, PtrType,
    ScalarBaseType, UnOpKind,
};
use crate::name::Name;
use std::fmt;

// =============================================================================
// Types
// =============================================================================

/// Imp-level value types.
#[derive(Debug, Clone, PartialEq)]
pub enum IType {
    Scalar(ScalarBaseType),
    Vector(u32, ScalarBaseType),
    Ptr(AddressSpace, Box<IType>),
}

impl IType {
    pub fn idx_rep() -> IType {
        IType::Scalar(crate::ir::IDX_REP)
    }

    pub fn ptr_to(addr: AddressSpace, pointee: IType) -> IType {
        IType::Ptr(addr, Box::new(pointee))
    }

    /// View as a high-IR base type.
    pub fn to_base_ty(&self) -> BaseType {
        match self {
            IType::Scalar(s) => BaseType::Scalar(*s),
            IType::Vector(n, s) => BaseType::Vector(*n, *s),
            IType::Ptr(addr, inner) => BaseType::ptr_to(*addr, inner.to_base_ty()),
        }
    }

    pub fn from_base_ty(ty: &BaseType) -> IType {
        match ty {
            BaseType::Scalar(s) => IType::Scalar(*s),
            BaseType::Vector(n, s) => IType::Vector(*n, *s),
            BaseType::Ptr(ptr) => {
                IType::ptr_to(ptr.addr_space, IType::from_base_ty(&ptr.pointee))
            }
        }
    }

    pub fn from_ptr_ty(ptr: &PtrType) -> IType {
        IType::ptr_to(ptr.addr_space, IType::from_base_ty(&ptr.pointee))
    }
}

impl fmt::Display for IType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IType::Scalar(s) => write!(f, "{:?}", s),
            IType::Vector(n, s) => write!(f, "<{} x {:?}>", n, s),
            IType::Ptr(addr, inner) => write!(f, "*{:?} {}", addr, inner),
        }
    }
}

// =============================================================================
// Expressions and binders
// =============================================================================

/// Operands: literals and variables only. All computation happens in
/// instructions.
#[derive(Debug, Clone, PartialEq)]
pub enum IExpr {
    Lit(LitVal),
    Var(Name, IType),
}

impl IExpr {
    pub fn ty(&self) -> IType {
        match self {
            IExpr::Lit(v) => IType::Scalar(v.base_ty()),
            IExpr::Var(_, ty) => ty.clone(),
        }
    }

    pub fn idx_lit(n: u32) -> IExpr {
        IExpr::Lit(LitVal::U32(n))
    }

    pub fn as_lit(&self) -> Option<LitVal> {
        match self {
            IExpr::Lit(v) => Some(*v),
            IExpr::Var(_, _) => None,
        }
    }
}

impl fmt::Display for IExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IExpr::Lit(v) => write!(f, "{:?}", v),
            IExpr::Var(n, _) => write!(f, "{}", n),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IBinder {
    pub name: Name,
    pub ty: IType,
}

impl IBinder {
    pub fn to_expr(&self) -> IExpr {
        IExpr::Var(self.name, self.ty.clone())
    }
}

// =============================================================================
// Instructions
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ImpInstr {
    IBinOp(BinOpKind, IExpr, IExpr),
    IUnOp(UnOpKind, IExpr),
    ISelect(IExpr, IExpr, IExpr),
    ICastOp(IType, IExpr),
    IBitcastOp(IType, IExpr),
    IPtrOffset(IExpr, IExpr),
    IPtrLoad(IExpr),
    Store(IExpr, IExpr),
    /// Allocate `count` elements of the given type in the address space.
    Alloc(AddressSpace, IType, IExpr),
    Free(IExpr),
    MemCopy {
        dest: IExpr,
        src: IExpr,
        num_elems: IExpr,
    },
    IFor(Direction, IBinder, IExpr, ImpBlock),
    /// Body yields a byte; loop continues while it is nonzero.
    IWhile(ImpBlock),
    ICond(IExpr, ImpBlock, ImpBlock),
    ICall(Name, Vec<IExpr>, Vec<IType>),
    IThrowError,
    IVectorBroadcast(IExpr, IType),
    IVectorIota(IType),
}

impl ImpInstr {
    /// Types of the values this instruction binds.
    pub fn result_tys(&self) -> Vec<IType> {
        match self {
            ImpInstr::IBinOp(k, a, _) => {
                if k.is_cmp() {
                    vec![IType::Scalar(ScalarBaseType::U8)]
                } else {
                    vec![a.ty()]
                }
            }
            ImpInstr::IUnOp(_, a) => vec![a.ty()],
            ImpInstr::ISelect(_, t, _) => vec![t.ty()],
            ImpInstr::ICastOp(ty, _) | ImpInstr::IBitcastOp(ty, _) => vec![ty.clone()],
            ImpInstr::IPtrOffset(p, _) => vec![p.ty()],
            ImpInstr::IPtrLoad(p) => match p.ty() {
                IType::Ptr(_, inner) => vec![*inner],
                other => panic!("loaded through non-pointer {:?}", other),
            },
            ImpInstr::Store(_, _)
            | ImpInstr::Free(_)
            | ImpInstr::MemCopy { .. }
            | ImpInstr::IFor(_, _, _, _)
            | ImpInstr::IWhile(_)
            | ImpInstr::ICond(_, _, _)
            | ImpInstr::IThrowError => Vec::new(),
            ImpInstr::Alloc(addr, ty, _) => vec![IType::ptr_to(*addr, ty.clone())],
            ImpInstr::ICall(_, _, ret_tys) => ret_tys.clone(),
            ImpInstr::IVectorBroadcast(_, ty) | ImpInstr::IVectorIota(ty) => vec![ty.clone()],
        }
    }
}

/// One binding of zero or more results to an instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct ImpDecl {
    pub binders: Vec<IBinder>,
    pub instr: ImpInstr,
}

/// A list of decls plus the scalar expressions the block yields.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImpBlock {
    pub decls: Vec<ImpDecl>,
    pub results: Vec<IExpr>,
}

// =============================================================================
// Functions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    CInternalFun,
    CEntryFun,
    FFIFun,
    CUDAKernelLaunch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IFunType {
    pub cc: CallingConvention,
    pub arg_tys: Vec<IType>,
    pub ret_tys: Vec<IType>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImpFunction {
    pub name: Name,
    pub ty: IFunType,
    pub params: Vec<IBinder>,
    pub body: ImpBlock,
}

/// How to reassemble a high-level atom from a function's scalar
/// returns: a nest of binders (one per return value, in order) and an
/// atom template over them.
#[derive(Debug, Clone, PartialEq)]
pub struct AtomRecon {
    pub binders: Vec<Binder>,
    pub atom: Atom,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImpFunctionWithRecon {
    pub function: ImpFunction,
    pub recon: AtomRecon,
}

// =============================================================================
// Configuration
// =============================================================================

/// Code generation target family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Llvm,
    LlvmCuda,
}

impl Backend {
    /// The device whose heap backs ordinary allocations.
    pub fn main_device(self) -> Device {
        match self {
            Backend::Llvm => Device::Cpu,
            Backend::LlvmCuda => Device::Gpu,
        }
    }
}

/// Options for the Imp translation stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImpOptions {
    pub backend: Backend,
    pub cur_device: Device,
    pub calling_convention: CallingConvention,
}

impl Default for ImpOptions {
    fn default() -> Self {
        ImpOptions {
            backend: Backend::Llvm,
            cur_device: Device::Cpu,
            calling_convention: CallingConvention::CEntryFun,
        }
    }
}

/// Export calling conventions for the generated entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportCC {
    /// Argument and destination registers as one flat parameter list.
    Flat,
    /// Two pointer arrays (inputs, outputs) of byte pointers. A single
    /// output arrives as the buffer itself rather than an array.
    Xla,
}

// =============================================================================
// Display
// =============================================================================

fn write_block(f: &mut fmt::Formatter<'_>, block: &ImpBlock, indent: usize) -> fmt::Result {
    let pad = "  ".repeat(indent);
    for decl in &block.decls {
        write!(f, "{}", pad)?;
        if !decl.binders.is_empty() {
            let names: Vec<String> = decl.binders.iter().map(|b| b.name.to_string()).collect();
            write!(f, "{} = ", names.join(", "))?;
        }
        write_instr(f, &decl.instr, indent)?;
        writeln!(f)?;
    }
    if !block.results.is_empty() {
        let results: Vec<String> = block.results.iter().map(|r| r.to_string()).collect();
        writeln!(f, "{}yield {}", pad, results.join(", "))?;
    }
    Ok(())
}

fn write_instr(f: &mut fmt::Formatter<'_>, instr: &ImpInstr, indent: usize) -> fmt::Result {
    let pad = "  ".repeat(indent);
    match instr {
        ImpInstr::IBinOp(k, a, b) => write!(f, "{:?} {} {}", k, a, b),
        ImpInstr::IUnOp(k, a) => write!(f, "{:?} {}", k, a),
        ImpInstr::ISelect(c, t, e) => write!(f, "select {} {} {}", c, t, e),
        ImpInstr::ICastOp(ty, a) => write!(f, "cast {} to {}", a, ty),
        ImpInstr::IBitcastOp(ty, a) => write!(f, "bitcast {} to {}", a, ty),
        ImpInstr::IPtrOffset(p, o) => write!(f, "ptrOffset {} {}", p, o),
        ImpInstr::IPtrLoad(p) => write!(f, "load {}", p),
        ImpInstr::Store(d, v) => write!(f, "store {} {}", d, v),
        ImpInstr::Alloc(addr, ty, n) => write!(f, "alloc {:?} {} x {}", addr, n, ty),
        ImpInstr::Free(p) => write!(f, "free {}", p),
        ImpInstr::MemCopy {
            dest,
            src,
            num_elems,
        } => write!(f, "memcopy {} <- {} x {}", dest, src, num_elems),
        ImpInstr::IFor(dir, b, n, body) => {
            writeln!(f, "for {:?} {} < {} {{", dir, b.name, n)?;
            write_block(f, body, indent + 1)?;
            write!(f, "{}}}", pad)
        }
        ImpInstr::IWhile(body) => {
            writeln!(f, "while {{")?;
            write_block(f, body, indent + 1)?;
            write!(f, "{}}}", pad)
        }
        ImpInstr::ICond(c, t, e) => {
            writeln!(f, "if {} {{", c)?;
            write_block(f, t, indent + 1)?;
            writeln!(f, "{}}} else {{", pad)?;
            write_block(f, e, indent + 1)?;
            write!(f, "{}}}", pad)
        }
        ImpInstr::ICall(name, args, _) => {
            let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
            write!(f, "call {}({})", name, args.join(", "))
        }
        ImpInstr::IThrowError => write!(f, "throwError"),
        ImpInstr::IVectorBroadcast(a, ty) => write!(f, "broadcast {} : {}", a, ty),
        ImpInstr::IVectorIota(ty) => write!(f, "iota : {}", ty),
    }
}

impl fmt::Display for ImpBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_block(f, self, 0)
    }
}

impl fmt::Display for ImpFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|b| format!("{}: {}", b.name, b.ty))
            .collect();
        writeln!(f, "impfun {}({}) {{", self.name, params.join(", "))?;
        write_block(f, &self.body, 1)?;
        write!(f, "}}")
    }
}
