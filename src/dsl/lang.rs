//! The value-typed kernel language surface.
//!
//! `Int`, `Float` and the pointer types are thin handles over source
//! variables; their overloaded operators build AST nodes without touching
//! the builder, while assignments, loads, stores and the control-flow
//! functions register statements with the current [`KernelBuilder`].
//!
//! ```no_run
//! use reef::dsl::lang::*;
//!
//! // Euclidean GCD over 16 lanes.
//! let p = uniform_int_ptr("p");
//! let q = uniform_int_ptr("q");
//! let r = uniform_int_ptr("r");
//! let a = Int::new(p.load());
//! let b = Int::new(q.load());
//! while_(any(a.ne(&b)), || {
//!     where_(a.gt(&b), || a.assign(&a - &b));
//!     where_(a.lt(&b), || b.assign(&b - &a));
//! });
//! r.store(&a);
//! ```

use std::rc::Rc;

use crate::ast::{BExpr, BaseType, CExpr, CmpId, CmpOp, Cond, Expr, Op, OpId, Stmt, Var};
use crate::til::translate::ParamKind;

use super::with_builder;

// ─── Expression values ────────────────────────────────────────────

/// An integer-typed expression.
#[derive(Clone)]
pub struct IntExpr {
    pub(crate) expr: Rc<Expr>,
}

/// A float-typed expression.
#[derive(Clone)]
pub struct FloatExpr {
    pub(crate) expr: Rc<Expr>,
}

impl From<i32> for IntExpr {
    fn from(v: i32) -> Self {
        IntExpr {
            expr: Rc::new(Expr::IntLit(v)),
        }
    }
}

impl From<f32> for FloatExpr {
    fn from(v: f32) -> Self {
        FloatExpr {
            expr: Rc::new(Expr::FloatLit(v)),
        }
    }
}

// ─── Variables ────────────────────────────────────────────────────

/// An integer kernel variable (one virtual register, 16 lanes).
#[derive(Clone, Copy)]
pub struct Int {
    var: Var,
}

/// A float kernel variable.
#[derive(Clone, Copy)]
pub struct Float {
    var: Var,
}

/// A pointer to integer elements in shared memory.
#[derive(Clone, Copy)]
pub struct IntPtr {
    var: Var,
}

/// A pointer to float elements in shared memory.
#[derive(Clone, Copy)]
pub struct FloatPtr {
    var: Var,
}

fn assign_stmt(lhs: Var, rhs: Rc<Expr>) {
    let stmt = match &*rhs {
        Expr::Deref(addr) => Stmt::LoadRequest {
            dest: lhs,
            addr: addr.clone(),
        },
        _ => Stmt::Assign { lhs, rhs },
    };
    with_builder(|b| b.push_stmt(stmt));
}

impl Int {
    /// Declare a fresh variable initialized to `e`.
    pub fn new(e: impl Into<IntExpr>) -> Int {
        let var = Var::Standard(with_builder(|b| b.fresh_var()));
        assign_stmt(var, e.into().expr);
        Int { var }
    }

    /// Reassign; inside `where_` this is a per-lane masked write.
    pub fn assign(&self, e: impl Into<IntExpr>) {
        assign_stmt(self.var, e.into().expr);
    }

    pub fn expr(&self) -> IntExpr {
        IntExpr {
            expr: Rc::new(Expr::Var(self.var)),
        }
    }

    pub fn to_float(&self) -> FloatExpr {
        to_float(self.expr())
    }
}

impl Float {
    pub fn new(e: impl Into<FloatExpr>) -> Float {
        let var = Var::Standard(with_builder(|b| b.fresh_var()));
        assign_stmt(var, e.into().expr);
        Float { var }
    }

    pub fn assign(&self, e: impl Into<FloatExpr>) {
        assign_stmt(self.var, e.into().expr);
    }

    pub fn expr(&self) -> FloatExpr {
        FloatExpr {
            expr: Rc::new(Expr::Var(self.var)),
        }
    }

    pub fn to_int(&self) -> IntExpr {
        to_int(self.expr())
    }
}

impl From<&Int> for IntExpr {
    fn from(v: &Int) -> Self {
        v.expr()
    }
}

impl From<Int> for IntExpr {
    fn from(v: Int) -> Self {
        v.expr()
    }
}

impl From<&Float> for FloatExpr {
    fn from(v: &Float) -> Self {
        v.expr()
    }
}

impl From<Float> for FloatExpr {
    fn from(v: Float) -> Self {
        v.expr()
    }
}

// ─── Pointers ─────────────────────────────────────────────────────

fn ptr_expr(var: Var) -> Rc<Expr> {
    Rc::new(Expr::Var(var))
}

/// Per-lane element address: base + 4 * n.
fn ptr_offset(var: Var, n: IntExpr) -> Rc<Expr> {
    Rc::new(Expr::Apply {
        lhs: ptr_expr(var),
        op: Op::new(OpId::Add, BaseType::Int32),
        rhs: Rc::new(Expr::Apply {
            lhs: n.expr,
            op: Op::new(OpId::Shl, BaseType::Int32),
            rhs: Rc::new(Expr::IntLit(2)),
        }),
    })
}

impl IntPtr {
    /// Gather the 16 elements the lanes point at.
    pub fn load(&self) -> IntExpr {
        IntExpr {
            expr: Rc::new(Expr::Deref(ptr_expr(self.var))),
        }
    }

    /// Scatter `data` to the 16 lane addresses; masked inside `where_`.
    pub fn store(&self, data: impl Into<IntExpr>) {
        with_builder(|b| {
            b.push_stmt(Stmt::StoreRequest {
                data: data.into().expr,
                addr: ptr_expr(self.var),
            })
        });
    }

    /// Advance the pointer by `n` elements.
    pub fn advance(&self, n: impl Into<IntExpr>) {
        let var = self.var;
        with_builder(|b| {
            b.push_stmt(Stmt::Assign {
                lhs: var,
                rhs: ptr_offset(var, n.into()),
            })
        });
    }
}

impl FloatPtr {
    pub fn load(&self) -> FloatExpr {
        FloatExpr {
            expr: Rc::new(Expr::Deref(ptr_expr(self.var))),
        }
    }

    pub fn store(&self, data: impl Into<FloatExpr>) {
        with_builder(|b| {
            b.push_stmt(Stmt::StoreRequest {
                data: data.into().expr,
                addr: ptr_expr(self.var),
            })
        });
    }

    pub fn advance(&self, n: impl Into<IntExpr>) {
        let var = self.var;
        with_builder(|b| {
            b.push_stmt(Stmt::Assign {
                lhs: var,
                rhs: ptr_offset(var, n.into()),
            })
        });
    }
}

// ─── Kernel parameters ────────────────────────────────────────────

pub fn uniform_int_ptr(name: &str) -> IntPtr {
    IntPtr {
        var: Var::Standard(with_builder(|b| b.declare_param(name, ParamKind::IntPtr))),
    }
}

pub fn uniform_float_ptr(name: &str) -> FloatPtr {
    FloatPtr {
        var: Var::Standard(with_builder(|b| b.declare_param(name, ParamKind::FloatPtr))),
    }
}

pub fn uniform_int(name: &str) -> Int {
    Int {
        var: Var::Standard(with_builder(|b| b.declare_param(name, ParamKind::Int))),
    }
}

pub fn uniform_float(name: &str) -> Float {
    Float {
        var: Var::Standard(with_builder(|b| b.declare_param(name, ParamKind::Float))),
    }
}

// ─── Built-in vectors ─────────────────────────────────────────────

/// The lane index, 0..15.
pub fn index() -> IntExpr {
    IntExpr {
        expr: Rc::new(Expr::Var(Var::ElemNum)),
    }
}

/// The QPU id of the executing processor.
pub fn me() -> IntExpr {
    IntExpr {
        expr: Rc::new(Expr::Var(Var::QpuNum)),
    }
}

// ─── Operators ────────────────────────────────────────────────────

fn int_apply(lhs: IntExpr, op: OpId, rhs: IntExpr) -> IntExpr {
    IntExpr {
        expr: Rc::new(Expr::Apply {
            lhs: lhs.expr,
            op: Op::new(op, BaseType::Int32),
            rhs: rhs.expr,
        }),
    }
}

fn float_apply(lhs: FloatExpr, op: OpId, rhs: FloatExpr) -> FloatExpr {
    FloatExpr {
        expr: Rc::new(Expr::Apply {
            lhs: lhs.expr,
            op: Op::new(op, BaseType::Float),
            rhs: rhs.expr,
        }),
    }
}

macro_rules! int_binop {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<T: Into<IntExpr>> std::ops::$trait<T> for IntExpr {
            type Output = IntExpr;
            fn $method(self, rhs: T) -> IntExpr {
                int_apply(self, $op, rhs.into())
            }
        }
        impl<T: Into<IntExpr>> std::ops::$trait<T> for &Int {
            type Output = IntExpr;
            fn $method(self, rhs: T) -> IntExpr {
                int_apply(self.expr(), $op, rhs.into())
            }
        }
        impl<T: Into<IntExpr>> std::ops::$trait<T> for Int {
            type Output = IntExpr;
            fn $method(self, rhs: T) -> IntExpr {
                int_apply(self.expr(), $op, rhs.into())
            }
        }
    };
}

int_binop!(Add, add, OpId::Add);
int_binop!(Sub, sub, OpId::Sub);
int_binop!(Mul, mul, OpId::Mul);
int_binop!(BitOr, bitor, OpId::Bor);
int_binop!(BitAnd, bitand, OpId::Band);
int_binop!(BitXor, bitxor, OpId::Bxor);
int_binop!(Shl, shl, OpId::Shl);
int_binop!(Shr, shr, OpId::Shr);

macro_rules! float_binop {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<T: Into<FloatExpr>> std::ops::$trait<T> for FloatExpr {
            type Output = FloatExpr;
            fn $method(self, rhs: T) -> FloatExpr {
                float_apply(self, $op, rhs.into())
            }
        }
        impl<T: Into<FloatExpr>> std::ops::$trait<T> for &Float {
            type Output = FloatExpr;
            fn $method(self, rhs: T) -> FloatExpr {
                float_apply(self.expr(), $op, rhs.into())
            }
        }
        impl<T: Into<FloatExpr>> std::ops::$trait<T> for Float {
            type Output = FloatExpr;
            fn $method(self, rhs: T) -> FloatExpr {
                float_apply(self.expr(), $op, rhs.into())
            }
        }
    };
}

float_binop!(Add, add, OpId::Add);
float_binop!(Sub, sub, OpId::Sub);
float_binop!(Mul, mul, OpId::Mul);

impl IntExpr {
    /// Zero-filling shift right.
    pub fn ushr(self, n: impl Into<IntExpr>) -> IntExpr {
        int_apply(self, OpId::Ushr, n.into())
    }

    /// Per-lane bitwise rotate right.
    pub fn ror(self, n: impl Into<IntExpr>) -> IntExpr {
        int_apply(self, OpId::Ror, n.into())
    }
}

impl std::ops::Not for IntExpr {
    type Output = IntExpr;
    fn not(self) -> IntExpr {
        IntExpr {
            expr: Rc::new(Expr::Unary {
                op: Op::new(OpId::Bnot, BaseType::Int32),
                expr: self.expr,
            }),
        }
    }
}

pub fn min(a: impl Into<IntExpr>, b: impl Into<IntExpr>) -> IntExpr {
    int_apply(a.into(), OpId::Min, b.into())
}

pub fn max(a: impl Into<IntExpr>, b: impl Into<IntExpr>) -> IntExpr {
    int_apply(a.into(), OpId::Max, b.into())
}

pub fn fmin(a: impl Into<FloatExpr>, b: impl Into<FloatExpr>) -> FloatExpr {
    float_apply(a.into(), OpId::Min, b.into())
}

pub fn fmax(a: impl Into<FloatExpr>, b: impl Into<FloatExpr>) -> FloatExpr {
    float_apply(a.into(), OpId::Max, b.into())
}

// ─── Conversions and SFU functions ────────────────────────────────

pub fn to_float(e: impl Into<IntExpr>) -> FloatExpr {
    FloatExpr {
        expr: Rc::new(Expr::Unary {
            op: Op::new(OpId::ItoF, BaseType::Float),
            expr: e.into().expr,
        }),
    }
}

pub fn to_int(e: impl Into<FloatExpr>) -> IntExpr {
    IntExpr {
        expr: Rc::new(Expr::Unary {
            op: Op::new(OpId::FtoI, BaseType::Int32),
            expr: e.into().expr,
        }),
    }
}

fn sfu(op: OpId, e: FloatExpr) -> FloatExpr {
    FloatExpr {
        expr: Rc::new(Expr::Unary {
            op: Op::new(op, BaseType::Float),
            expr: e.expr,
        }),
    }
}

pub fn recip(e: impl Into<FloatExpr>) -> FloatExpr {
    sfu(OpId::Recip, e.into())
}

pub fn recipsqrt(e: impl Into<FloatExpr>) -> FloatExpr {
    sfu(OpId::RecipSqrt, e.into())
}

pub fn exp2(e: impl Into<FloatExpr>) -> FloatExpr {
    sfu(OpId::Exp, e.into())
}

pub fn log2(e: impl Into<FloatExpr>) -> FloatExpr {
    sfu(OpId::Log, e.into())
}

pub fn sin(e: impl Into<FloatExpr>) -> FloatExpr {
    sfu(OpId::Sin, e.into())
}

// ─── Comparisons ──────────────────────────────────────────────────

/// A per-lane boolean expression.
pub struct BoolExpr(pub(crate) BExpr);

fn int_cmp(lhs: IntExpr, id: CmpId, rhs: IntExpr) -> BoolExpr {
    BoolExpr(BExpr::Cmp(CExpr {
        lhs: lhs.expr,
        op: CmpOp::new(id, BaseType::Int32),
        rhs: rhs.expr,
    }))
}

fn float_cmp(lhs: FloatExpr, id: CmpId, rhs: FloatExpr) -> BoolExpr {
    BoolExpr(BExpr::Cmp(CExpr {
        lhs: lhs.expr,
        op: CmpOp::new(id, BaseType::Float),
        rhs: rhs.expr,
    }))
}

macro_rules! cmp_methods {
    ($ty:ident, $expr_ty:ident, $cmp:ident) => {
        impl $ty {
            pub fn eq(&self, rhs: impl Into<$expr_ty>) -> BoolExpr {
                $cmp(self.expr(), CmpId::Eq, rhs.into())
            }
            pub fn ne(&self, rhs: impl Into<$expr_ty>) -> BoolExpr {
                $cmp(self.expr(), CmpId::Neq, rhs.into())
            }
            pub fn lt(&self, rhs: impl Into<$expr_ty>) -> BoolExpr {
                $cmp(self.expr(), CmpId::Lt, rhs.into())
            }
            pub fn le(&self, rhs: impl Into<$expr_ty>) -> BoolExpr {
                $cmp(self.expr(), CmpId::Le, rhs.into())
            }
            pub fn gt(&self, rhs: impl Into<$expr_ty>) -> BoolExpr {
                $cmp(self.expr(), CmpId::Gt, rhs.into())
            }
            pub fn ge(&self, rhs: impl Into<$expr_ty>) -> BoolExpr {
                $cmp(self.expr(), CmpId::Ge, rhs.into())
            }
        }
    };
}

cmp_methods!(Int, IntExpr, int_cmp);
cmp_methods!(Float, FloatExpr, float_cmp);

impl IntExpr {
    pub fn eq(self, rhs: impl Into<IntExpr>) -> BoolExpr {
        int_cmp(self, CmpId::Eq, rhs.into())
    }
    pub fn ne(self, rhs: impl Into<IntExpr>) -> BoolExpr {
        int_cmp(self, CmpId::Neq, rhs.into())
    }
    pub fn lt(self, rhs: impl Into<IntExpr>) -> BoolExpr {
        int_cmp(self, CmpId::Lt, rhs.into())
    }
    pub fn le(self, rhs: impl Into<IntExpr>) -> BoolExpr {
        int_cmp(self, CmpId::Le, rhs.into())
    }
    pub fn gt(self, rhs: impl Into<IntExpr>) -> BoolExpr {
        int_cmp(self, CmpId::Gt, rhs.into())
    }
    pub fn ge(self, rhs: impl Into<IntExpr>) -> BoolExpr {
        int_cmp(self, CmpId::Ge, rhs.into())
    }
}

impl std::ops::BitAnd for BoolExpr {
    type Output = BoolExpr;
    fn bitand(self, rhs: BoolExpr) -> BoolExpr {
        BoolExpr(BExpr::And(Rc::new(self.0), Rc::new(rhs.0)))
    }
}

impl std::ops::BitOr for BoolExpr {
    type Output = BoolExpr;
    fn bitor(self, rhs: BoolExpr) -> BoolExpr {
        BoolExpr(BExpr::Or(Rc::new(self.0), Rc::new(rhs.0)))
    }
}

impl std::ops::Not for BoolExpr {
    type Output = BoolExpr;
    fn not(self) -> BoolExpr {
        BoolExpr(BExpr::Not(Rc::new(self.0)))
    }
}

/// True when the condition holds on at least one lane.
pub fn any(b: BoolExpr) -> Cond {
    Cond::Any(b.0)
}

/// True when the condition holds on every lane.
pub fn all(b: BoolExpr) -> Cond {
    Cond::All(b.0)
}

// ─── Control flow ─────────────────────────────────────────────────

fn collect(body: impl FnOnce()) -> Vec<Stmt> {
    with_builder(|b| b.open_scope());
    body();
    with_builder(|b| b.close_scope())
}

/// Masked conditional assignment over the lanes; nests by ANDing masks.
pub fn where_(cond: BoolExpr, body: impl FnOnce()) {
    let then_body = collect(body);
    with_builder(|b| {
        b.push_stmt(Stmt::Where {
            cond: cond.0,
            then_body,
            else_body: vec![],
        })
    });
}

pub fn where_else(cond: BoolExpr, then: impl FnOnce(), els: impl FnOnce()) {
    let then_body = collect(then);
    let else_body = collect(els);
    with_builder(|b| {
        b.push_stmt(Stmt::Where {
            cond: cond.0,
            then_body,
            else_body,
        })
    });
}

pub fn if_(cond: Cond, then: impl FnOnce()) {
    let then_body = collect(then);
    with_builder(|b| {
        b.push_stmt(Stmt::If {
            cond,
            then_body,
            else_body: vec![],
        })
    });
}

pub fn if_else(cond: Cond, then: impl FnOnce(), els: impl FnOnce()) {
    let then_body = collect(then);
    let else_body = collect(els);
    with_builder(|b| {
        b.push_stmt(Stmt::If {
            cond,
            then_body,
            else_body,
        })
    });
}

pub fn while_(cond: Cond, body: impl FnOnce()) {
    let body = collect(body);
    with_builder(|b| b.push_stmt(Stmt::While { cond, body }));
}

/// `for_(cond, step, body)` desugars into `while_(cond, { body; step })`.
pub fn for_(cond: Cond, step: impl FnOnce(), body: impl FnOnce()) {
    let mut stmts = collect(body);
    stmts.extend(collect(step));
    with_builder(|b| b.push_stmt(Stmt::While { cond, body: stmts }));
}

/// vc4-only semaphore intrinsics.
pub fn sema_inc(id: u8) {
    with_builder(|b| b.push_stmt(Stmt::SemaInc(id)));
}

pub fn sema_dec(id: u8) {
    with_builder(|b| b.push_stmt(Stmt::SemaDec(id)));
}

// ─── Tests ────────────────────────────────────────────────────────
