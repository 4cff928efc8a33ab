//! The per-compilation kernel builder.
//!
//! Expression values in `lang` are pure constructors; statements and
//! fresh-variable allocation go through the builder. The current builder
//! is an implicit thread-local context with a `begin`/`end` lifecycle —
//! concurrent compilations need separate threads.

pub mod lang;

use std::cell::RefCell;

use crate::ast::{Stmt, VarId};
use crate::error::CompileError;
use crate::til::translate::{KernelSrc, Param, ParamKind};

thread_local! {
    static CURRENT: RefCell<Option<KernelBuilder>> = const { RefCell::new(None) };
}

/// Collects the kernel body, parameters, and the fresh-variable counter
/// for one compilation.
pub struct KernelBuilder {
    params: Vec<Param>,
    /// Open lexical scopes; the innermost collects statements.
    scopes: Vec<Vec<Stmt>>,
    next_var: VarId,
    errors: Vec<CompileError>,
}

impl KernelBuilder {
    /// Install a fresh builder as the current context.
    pub fn begin() {
        CURRENT.with(|c| {
            *c.borrow_mut() = Some(KernelBuilder {
                params: Vec::new(),
                scopes: vec![Vec::new()],
                next_var: 0,
                errors: Vec::new(),
            });
        });
    }

    /// Take down the current context and return the collected kernel.
    pub fn end() -> Result<KernelSrc, CompileError> {
        let builder = CURRENT
            .with(|c| c.borrow_mut().take())
            .ok_or_else(|| CompileError::Internal("no kernel under construction".to_string()))?;
        if let Some(err) = builder.errors.into_iter().next() {
            return Err(err);
        }
        debug_assert_eq!(builder.scopes.len(), 1, "unclosed DSL scope");
        let mut scopes = builder.scopes;
        Ok(KernelSrc {
            params: builder.params,
            body: scopes.pop().unwrap_or_default(),
            num_vars: builder.next_var,
        })
    }

    pub fn fresh_var(&mut self) -> VarId {
        let v = self.next_var;
        self.next_var += 1;
        v
    }

    pub fn push_stmt(&mut self, s: Stmt) {
        self.scopes
            .last_mut()
            .expect("kernel builder has no open scope")
            .push(s);
    }

    pub fn open_scope(&mut self) {
        self.scopes.push(Vec::new());
    }

    pub fn close_scope(&mut self) -> Vec<Stmt> {
        debug_assert!(self.scopes.len() > 1, "closing the kernel body scope");
        self.scopes.pop().unwrap_or_default()
    }

    pub fn record_error(&mut self, err: CompileError) {
        self.errors.push(err);
    }

    pub fn declare_param(&mut self, name: &str, kind: ParamKind) -> VarId {
        let var = self.fresh_var();
        self.params.push(Param {
            name: name.to_string(),
            kind,
            var,
        });
        var
    }
}

/// Run `f` against the current builder. Panics outside `compile()` —
/// DSL values are only meaningful while a kernel is under construction.
pub fn with_builder<R>(f: impl FnOnce(&mut KernelBuilder) -> R) -> R {
    CURRENT.with(|c| {
        let mut borrow = c.borrow_mut();
        let builder = borrow
            .as_mut()
            .expect("kernel DSL used outside compile()");
        f(builder)
    })
}

// ─── Tests ────────────────────────────────────────────────────────
