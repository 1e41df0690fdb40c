//! Compact formatters for IR terms.
//!
//! These exist for internal-error messages and test assertions; they
//! print something close to the surface notation without being a full
//! pretty-printer.

use crate::ir::*;
use std::fmt::Write;

pub fn format_type(ty: &SType) -> String {
    match ty {
        SType::Base(b) => format_base(b),
        SType::Nat => "Nat".to_string(),
        SType::Fin(n) => format!("(Fin {})", format_atom(n)),
        SType::Prod(ts) => {
            let items: Vec<_> = ts.iter().map(format_type).collect();
            format!("({})", items.join(", "))
        }
        SType::Sum(ts) => {
            let items: Vec<_> = ts.iter().map(format_type).collect();
            format!("({})", items.join(" | "))
        }
        SType::Tab(tab) => format!(
            "({}:{} => {})",
            tab.binder.name,
            format_ix(&tab.ix),
            format_type(&tab.body)
        ),
        SType::DepPair(dp) => format!(
            "({}:{} ,> {})",
            dp.binder.name,
            format_type(&dp.lhs),
            format_type(&dp.rhs)
        ),
        SType::Pi(pi) => {
            let params: Vec<_> = pi
                .binders
                .iter()
                .map(|b| format!("{}:{}", b.name, format_type(&b.ty)))
                .collect();
            format!("({}) -> {}", params.join(", "), format_type(&pi.result))
        }
        SType::TypeCon { name, .. } => name.clone(),
        SType::Record(fields) => {
            let items: Vec<_> = fields
                .iter()
                .map(|(k, t)| format!("{}: {}", k, format_type(t)))
                .collect();
            format!("{{{}}}", items.join(", "))
        }
        SType::Variant(cases) => {
            let items: Vec<_> = cases
                .iter()
                .map(|(k, t)| format!("{} {}", k, format_type(t)))
                .collect();
            format!("{{|{}|}}", items.join(" | "))
        }
        SType::Ref(t) => format!("Ref {}", format_type(t)),
    }
}

fn format_base(b: &BaseType) -> String {
    match b {
        BaseType::Scalar(s) => format!("{:?}", s).to_lowercase(),
        BaseType::Vector(n, s) => format!("<{} x {:?}>", n, s).to_lowercase(),
        BaseType::Ptr(p) => format!("*{}", format_base(&p.pointee)),
    }
}

fn format_ix(ix: &IxType) -> String {
    match &ix.dict {
        IxDict::Fin(n) => format!("Fin {}", format_atom(n)),
        IxDict::Custom { .. } => format!("Ix {}", format_type(&ix.elem_ty)),
    }
}

pub fn format_atom(atom: &Atom) -> String {
    match atom {
        Atom::Var(n) => n.to_string(),
        Atom::Lit(v) => format!("{:?}", v),
        Atom::Con(con) => format_con(con),
        Atom::Lam(lam) => {
            let params: Vec<_> = lam.binders.iter().map(|b| b.name.to_string()).collect();
            format!("\\{}. <{} decls>", params.join(" "), lam.body.decls.len())
        }
        Atom::TabLam(lam) => format!("tab \\{}. <{} decls>", lam.binder.name, lam.body.decls.len()),
        Atom::DepPair(l, r, _) => {
            format!("({} ,> {})", format_atom(l), format_atom(r))
        }
        Atom::ProjectElt(ps, n) => {
            let mut out = n.to_string();
            for p in ps {
                match p {
                    Projection::Prod(i) => write!(out, ".{}", i).unwrap(),
                    Projection::Unwrap => out.push_str(".unwrap"),
                }
            }
            out
        }
        Atom::ACase(scrut, alts, _) => {
            format!("acase {} of <{} alts>", format_atom(scrut), alts.len())
        }
        Atom::DestRef(d) => format!("dest {}", format_dest(d)),
        Atom::ImpVar(n, ty) => format!("{}:{}", n, ty),
    }
}

fn format_con(con: &Con) -> String {
    match con {
        Con::ProdCon(xs) => {
            let items: Vec<_> = xs.iter().map(format_atom).collect();
            format!("({})", items.join(", "))
        }
        Con::SumCon { tag, payload, .. } => format!("(#{} {})", tag, format_atom(payload)),
        Con::SumAsProd { tag, payloads, .. } => {
            let items: Vec<_> = payloads.iter().map(format_atom).collect();
            format!("(sum-as-prod tag={} [{}])", format_atom(tag), items.join(", "))
        }
        Con::Newtype { ty, inner } => {
            format!("({} @ {})", format_atom(inner), format_type(ty))
        }
    }
}

pub fn format_dest(dest: &Dest) -> String {
    match dest {
        Dest::BaseRef { ptr, ty } => format!("&{}[{}]", format_base(ty), format_atom(ptr)),
        Dest::TabRef(td) => format!("tabref \\{}. <{} decls>", td.binder.name, td.body.decls.len()),
        Dest::ProdRef(ds) => {
            let items: Vec<_> = ds.iter().map(format_dest).collect();
            format!("({})", items.join(", "))
        }
        Dest::SumAsProdRef { tag, payloads, .. } => {
            let items: Vec<_> = payloads.iter().map(format_dest).collect();
            format!("(sumref tag={} [{}])", format_dest(tag), items.join(", "))
        }
        Dest::NewtypeRef { ty, inner } => {
            format!("({} @ {})", format_dest(inner), format_type(ty))
        }
        Dest::DepPairRef { lhs, rhs, .. } => format!(
            "({} ,> \\{}. {})",
            format_dest(lhs),
            rhs.binder.name,
            format_dest(&rhs.dest)
        ),
        Dest::BoxedRef { boxes, inner, .. } => {
            format!("boxed[{}] {}", boxes.len(), format_dest(inner))
        }
    }
}

pub fn format_expr(expr: &SExpr) -> String {
    match expr {
        SExpr::Atom(a) => format_atom(a),
        SExpr::App(f, args) => {
            let args: Vec<_> = args.iter().map(format_atom).collect();
            format!("{} {}", format_atom(f), args.join(" "))
        }
        SExpr::TabApp(t, idxs) => {
            let mut out = format_atom(t);
            for idx in idxs {
                write!(out, "[{}]", format_atom(idx)).unwrap();
            }
            out
        }
        SExpr::Case(case) => format!(
            "case {} of <{} alts>",
            format_atom(&case.scrut),
            case.alts.len()
        ),
        SExpr::Op(op) => format!("{:?}", OpHead(op)),
        SExpr::Hof(hof) => match hof {
            Hof::For(fe) => format!("for {:?} {}", fe.dir, format_ix(&fe.ix)),
            Hof::Seq(se) => format!("seq {:?} {}", se.dir, format_ix(&se.ix)),
            Hof::While(_) => "while".to_string(),
            Hof::RunReader(_, _) => "runReader".to_string(),
            Hof::RunWriter(_, _, _) => "runWriter".to_string(),
            Hof::RunState(_, _, _) => "runState".to_string(),
            Hof::RunIO(_) => "runIO".to_string(),
            Hof::RunInit(_) => "runInit".to_string(),
            Hof::RememberDest(_, _) => "rememberDest".to_string(),
        },
    }
}

/// Op constructor name without its payload, for one-line summaries.
struct OpHead<'a>(&'a PrimOp);

impl std::fmt::Debug for OpHead<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self.0 {
            PrimOp::BinOp(k, _, _) => return write!(f, "{:?}", k),
            PrimOp::UnOp(k, _) => return write!(f, "{:?}", k),
            PrimOp::Select(_, _, _) => "select",
            PrimOp::CastOp(_, _) => "cast",
            PrimOp::IxSize(_) => "ixSize",
            PrimOp::Ordinal(_, _) => "ordinal",
            PrimOp::UnsafeFromOrdinal(_, _) => "unsafeFromOrdinal",
            PrimOp::TabCon(_, _) => "tabCon",
            PrimOp::RefOp(_, _) => "refOp",
            PrimOp::AllocDest(_) => "allocDest",
            PrimOp::Place(_, _) => "place",
            PrimOp::Freeze(_) => "freeze",
            PrimOp::IndexRef(_, _) => "indexRef",
            PrimOp::ProjRef(_, _) => "projRef",
            PrimOp::PtrOffset(_, _) => "ptrOffset",
            PrimOp::PtrLoad(_) => "ptrLoad",
            PrimOp::VectorSubref(_, _, _) => "vectorSubref",
            PrimOp::VectorBroadcast(_, _) => "vectorBroadcast",
            PrimOp::VectorIota(_) => "vectorIota",
            PrimOp::ThrowError(_) => "throwError",
            PrimOp::RecordCons(_) => "recordCons",
            PrimOp::VariantCon { .. } => "variantCon",
        };
        write!(f, "{}", name)
    }
}

pub fn format_block(block: &Block) -> String {
    let mut out = String::new();
    write_block(&mut out, block, 0);
    out
}

fn write_block(out: &mut String, block: &Block, indent: usize) {
    let pad = "  ".repeat(indent);
    for decl in &block.decls {
        writeln!(
            out,
            "{}{} : {} = {}",
            pad,
            decl.binder.name,
            format_type(&decl.binder.ty),
            format_expr(&decl.expr)
        )
        .unwrap();
        if let Some(inner) = nested_block(&decl.expr) {
            write_block(out, inner, indent + 1);
        }
    }
    writeln!(out, "{}=> {}", pad, format_atom(&block.result)).unwrap();
}

fn nested_block(expr: &SExpr) -> Option<&Block> {
    match expr {
        SExpr::Hof(Hof::For(fe)) => Some(&fe.lam.body),
        SExpr::Hof(Hof::Seq(se)) => Some(&se.lam.body),
        SExpr::Hof(Hof::While(b)) | SExpr::Hof(Hof::RunIO(b)) | SExpr::Hof(Hof::RunInit(b)) => {
            Some(b)
        }
        SExpr::Hof(Hof::RunReader(_, lam))
        | SExpr::Hof(Hof::RunWriter(_, _, lam))
        | SExpr::Hof(Hof::RunState(_, _, lam))
        | SExpr::Hof(Hof::RememberDest(_, lam)) => Some(&lam.body),
        _ => None,
    }
}

pub fn format_dest_block(db: &DestBlock) -> String {
    let mut out = format!(
        "\\{} : {}.\n",
        db.dest_binder.name,
        format_type(&db.dest_binder.ty)
    );
    write_block(&mut out, &db.block, 1);
    out
}
