//! Source AST for the kernel language.
//!
//! The DSL surface in `dsl` constructs these nodes; the frontend in
//! `til::translate` consumes them. Expressions are `Rc`-shared at
//! construction but treated as trees by every consumer — sharing is only
//! ever semantically pure.

use std::fmt;
use std::rc::Rc;

// ─── Types and operators ──────────────────────────────────────────

pub type VarId = u32;

/// Base type carried by every operator and comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseType {
    UInt8,
    Int16,
    Int32,
    Float,
}

impl BaseType {
    pub fn is_float(self) -> bool {
        self == BaseType::Float
    }
}

/// Operator vocabulary of the source language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpId {
    // Int and float
    Add,
    Sub,
    Mul,
    Min,
    Max,
    // Int only
    Shl,
    Shr,
    Ushr,
    Ror,
    Bor,
    Band,
    Bxor,
    Bnot,
    // Conversions
    ItoF,
    FtoI,
    // SFU functions
    Recip,
    RecipSqrt,
    Exp,
    Log,
    Sin,
}

/// Operator with its inferred base type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Op {
    pub id: OpId,
    pub ty: BaseType,
}

impl Op {
    pub fn new(id: OpId, ty: BaseType) -> Self {
        Self { id, ty }
    }

    pub fn is_unary(self) -> bool {
        matches!(
            self.id,
            OpId::Bnot
                | OpId::ItoF
                | OpId::FtoI
                | OpId::Recip
                | OpId::RecipSqrt
                | OpId::Exp
                | OpId::Log
                | OpId::Sin
        )
    }

    /// SFU-routed operators (operand goes to an SFU register, result
    /// arrives in accumulator 4 two slots later).
    pub fn is_sfu(self) -> bool {
        matches!(
            self.id,
            OpId::Recip | OpId::RecipSqrt | OpId::Exp | OpId::Log | OpId::Sin
        )
    }

    pub fn name(self) -> &'static str {
        match self.id {
            OpId::Add => "+",
            OpId::Sub => "-",
            OpId::Mul => "*",
            OpId::Min => "min",
            OpId::Max => "max",
            OpId::Shl => "<<",
            OpId::Shr => ">>",
            OpId::Ushr => "ushr",
            OpId::Ror => "ror",
            OpId::Bor => "|",
            OpId::Band => "&",
            OpId::Bxor => "^",
            OpId::Bnot => "~",
            OpId::ItoF => "itof",
            OpId::FtoI => "ftoi",
            OpId::Recip => "recip",
            OpId::RecipSqrt => "recipsqrt",
            OpId::Exp => "exp2",
            OpId::Log => "log2",
            OpId::Sin => "sin",
        }
    }
}

/// Comparison operator vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpId {
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmpOp {
    pub id: CmpId,
    pub ty: BaseType,
}

impl CmpOp {
    pub fn new(id: CmpId, ty: BaseType) -> Self {
        Self { id, ty }
    }

    pub fn name(self) -> &'static str {
        match self.id {
            CmpId::Eq => "==",
            CmpId::Neq => "!=",
            CmpId::Lt => "<",
            CmpId::Le => "<=",
            CmpId::Gt => ">",
            CmpId::Ge => ">=",
        }
    }
}

// ─── Variables ────────────────────────────────────────────────────

/// A source-level variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Var {
    /// An ordinary kernel variable, backed by one virtual register.
    Standard(VarId),
    /// The per-QPU identifier (0 on a single-QPU dispatch).
    QpuNum,
    /// The vector lane index, 0..15.
    ElemNum,
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Var::Standard(id) => write!(f, "v{}", id),
            Var::QpuNum => write!(f, "qpu_num"),
            Var::ElemNum => write!(f, "elem_num"),
        }
    }
}

// ─── Expressions ──────────────────────────────────────────────────

/// A typed source expression.
#[derive(Debug, Clone)]
pub enum Expr {
    Var(Var),
    IntLit(i32),
    FloatLit(f32),
    /// Binary operator application.
    Apply {
        lhs: Rc<Expr>,
        op: Op,
        rhs: Rc<Expr>,
    },
    /// Unary operator application (complement, conversions, SFU calls).
    Unary { op: Op, expr: Rc<Expr> },
    /// Pointer dereference; the operand evaluates to a per-lane address.
    Deref(Rc<Expr>),
}

impl Expr {
    pub fn as_var(&self) -> Option<Var> {
        match self {
            Expr::Var(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Var(v) => write!(f, "{}", v),
            Expr::IntLit(i) => write!(f, "{}", i),
            Expr::FloatLit(x) => write!(f, "{}", x),
            Expr::Apply { lhs, op, rhs } => write!(f, "({} {} {})", lhs, op.name(), rhs),
            Expr::Unary { op, expr } => write!(f, "{}({})", op.name(), expr),
            Expr::Deref(p) => write!(f, "*{}", p),
        }
    }
}

// ─── Boolean and comparison expressions ───────────────────────────

/// A single comparison.
#[derive(Debug, Clone)]
pub struct CExpr {
    pub lhs: Rc<Expr>,
    pub op: CmpOp,
    pub rhs: Rc<Expr>,
}

/// Boolean expression over comparisons. Used only as the condition of
/// branch statements and masked assignments.
#[derive(Debug, Clone)]
pub enum BExpr {
    Cmp(CExpr),
    Not(Rc<BExpr>),
    And(Rc<BExpr>, Rc<BExpr>),
    Or(Rc<BExpr>, Rc<BExpr>),
}

impl fmt::Display for BExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BExpr::Cmp(c) => write!(f, "{} {} {}", c.lhs, c.op.name(), c.rhs),
            BExpr::Not(b) => write!(f, "!({})", b),
            BExpr::And(a, b) => write!(f, "({}) && ({})", a, b),
            BExpr::Or(a, b) => write!(f, "({}) || ({})", a, b),
        }
    }
}

/// Branch condition: reduce a per-lane boolean across the 16 lanes.
#[derive(Debug, Clone)]
pub enum Cond {
    Any(BExpr),
    All(BExpr),
}

impl Cond {
    pub fn bexpr(&self) -> &BExpr {
        match self {
            Cond::Any(b) | Cond::All(b) => b,
        }
    }
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cond::Any(b) => write!(f, "any({})", b),
            Cond::All(b) => write!(f, "all({})", b),
        }
    }
}

// ─── Statements ───────────────────────────────────────────────────

/// A kernel statement. Statement sequences are plain vectors; the DSL
/// scope builders collect them.
#[derive(Debug, Clone)]
pub enum Stmt {
    /// `v = e`. When `rhs` is a `Deref`, this is a pointer load and is
    /// routed through the platform back-end.
    Assign { lhs: Var, rhs: Rc<Expr> },
    /// Explicit pointer load: `dest = *addr`.
    LoadRequest { dest: Var, addr: Rc<Expr> },
    /// Pointer store: `*addr = data`.
    StoreRequest { data: Rc<Expr>, addr: Rc<Expr> },
    /// Masked conditional assignment block; nesting ANDs the masks.
    Where {
        cond: BExpr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    If {
        cond: Cond,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    While { cond: Cond, body: Vec<Stmt> },
    /// vc4-only semaphore intrinsics, id 0..15.
    SemaInc(u8),
    SemaDec(u8),
}

impl Stmt {
    /// One-line description used in diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Stmt::Assign { lhs, rhs } => format!("{} = {}", lhs, rhs),
            Stmt::LoadRequest { dest, addr } => format!("{} = *{}", dest, addr),
            Stmt::StoreRequest { data, addr } => format!("*{} = {}", addr, data),
            Stmt::Where { cond, .. } => format!("Where ({})", cond),
            Stmt::If { cond, .. } => format!("If ({})", cond),
            Stmt::While { cond, .. } => format!("While ({})", cond),
            Stmt::SemaInc(id) => format!("sema_inc({})", id),
            Stmt::SemaDec(id) => format!("sema_dec({})", id),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────
