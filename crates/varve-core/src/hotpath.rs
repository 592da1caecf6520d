//! Adaptive hot-path compilation for named functions.
//!
//! The interpreter counts invocations per named function. Past the threshold
//! the body is specialized: constants folded, locals resolved to frame slots,
//! and the AST lowered to a direct form executed without environment lookups.
//! Specialization is restricted to self-contained bodies (parameters, locals,
//! builtins, and self-recursion only), which is what keeps it observationally
//! equivalent to the evaluator: both sides dispatch through `lang::ops`.
//!
//! A benchmark harness periodically re-races the two forms over recorded
//! arguments. Warm-up samples are discarded; an entry that stays slower than
//! the interpreter by more than the configured margin is retired, and the
//! promotion threshold adapts within its bounds based on observed speedups.

use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use varve_store::Hash256;

use crate::error::{EngineError, Result};
use crate::lang::ast::{BinOp, BlockItem, Expr, MatchArm, Pattern, UnOp};
use crate::lang::env::Environment;
use crate::lang::ops::{self, CastTy};
use crate::lang::value::{FunctionValue, Value};
use crate::obs;

const RECORDED_ARGS: usize = 8;
const BENCH_EVERY: u64 = 32;

/// Argument type signature used as part of the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    Null,
    Number,
    Str,
    Bool,
    List,
    Struct,
    Function,
    Error,
}

pub fn type_signature(args: &[Value]) -> Vec<TypeTag> {
    args.iter()
        .map(|v| match v {
            Value::Null => TypeTag::Null,
            Value::Number(_) => TypeTag::Number,
            Value::Str(_) => TypeTag::Str,
            Value::Bool(_) => TypeTag::Bool,
            Value::List(_) => TypeTag::List,
            Value::Struct(_) => TypeTag::Struct,
            Value::Function(_) => TypeTag::Function,
            Value::Error { .. } => TypeTag::Error,
        })
        .collect()
}

/// Stable per-process hash of a function body.
pub fn ast_hash(body: &Expr) -> Hash256 {
    Hash256::compute(format!("{body:?}").as_bytes())
}

// ---------------------------------------------------------------------------
// Compiled form
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Compiled {
    Const(Value),
    Local(usize),
    Assign(usize, Box<Compiled>),
    Unary(UnOp, Box<Compiled>),
    Binary(BinOp, Box<Compiled>, Box<Compiled>),
    And(Box<Compiled>, Box<Compiled>),
    Or(Box<Compiled>, Box<Compiled>),
    Coalesce(Box<Compiled>, Box<Compiled>),
    Cast(CastTy, Box<Compiled>),
    Builtin(&'static str, Vec<Compiled>),
    SelfCall(Vec<Compiled>),
    List(Vec<Compiled>),
    StructLit(Vec<(String, Compiled)>),
    Field(Box<Compiled>, String),
    IndexAt(Box<Compiled>, Box<Compiled>),
    Block(Vec<Compiled>),
    Match { scrutinee: Box<Compiled>, arms: Vec<(CompiledPattern, Compiled)> },
}

#[derive(Debug, Clone)]
enum CompiledPattern {
    Literal(Value),
    Binding(usize),
    Wildcard,
}

/// A specialized function body.
pub struct CompiledFn {
    param_count: usize,
    slot_count: usize,
    body: Compiled,
    /// Names the compiler assumed were absent from the enclosing scope. If
    /// one is later bound globally, the entry must be evicted.
    assumed_absent: Vec<String>,
}

enum Ctl {
    Val(Value),
    Tail(Vec<Value>),
}

impl CompiledFn {
    pub fn run(&self, args: &[Value], recursion_limit: usize) -> Result<Value> {
        let mut depth = 0usize;
        self.run_inner(args, recursion_limit, &mut depth)
    }

    fn run_inner(&self, args: &[Value], limit: usize, depth: &mut usize) -> Result<Value> {
        if args.len() != self.param_count {
            return Err(EngineError::Execution(format!(
                "expected {} argument(s), got {}",
                self.param_count,
                args.len()
            )));
        }
        let mut frame = vec![Value::Null; self.slot_count];
        frame[..args.len()].clone_from_slice(args);
        loop {
            match self.exec_tail(&self.body, &mut frame, depth, limit)? {
                Ctl::Val(v) => return Ok(v),
                Ctl::Tail(new_args) => {
                    // Tail self-call: reuse the loop instead of the stack.
                    for slot in frame.iter_mut() {
                        *slot = Value::Null;
                    }
                    frame[..new_args.len()].clone_from_slice(&new_args);
                }
            }
        }
    }

    fn exec_tail(
        &self,
        c: &Compiled,
        frame: &mut Vec<Value>,
        depth: &mut usize,
        limit: usize,
    ) -> Result<Ctl> {
        match c {
            Compiled::Block(items) => {
                let Some((last, init)) = items.split_last() else {
                    return Ok(Ctl::Val(Value::Null));
                };
                for item in init {
                    self.exec(item, frame, depth, limit)?;
                }
                self.exec_tail(last, frame, depth, limit)
            }
            Compiled::Match { scrutinee, arms } => {
                let value = self.exec(scrutinee, frame, depth, limit)?;
                for (pattern, body) in arms {
                    if self.pattern_matches(pattern, &value, frame) {
                        return self.exec_tail(body, frame, depth, limit);
                    }
                }
                Ok(Ctl::Val(Value::error("no match arm matched", "match")))
            }
            Compiled::SelfCall(args) => {
                let values: Result<Vec<Value>> =
                    args.iter().map(|a| self.exec(a, frame, depth, limit)).collect();
                Ok(Ctl::Tail(values?))
            }
            other => Ok(Ctl::Val(self.exec(other, frame, depth, limit)?)),
        }
    }

    fn pattern_matches(&self, pattern: &CompiledPattern, value: &Value, frame: &mut [Value]) -> bool {
        match pattern {
            CompiledPattern::Wildcard => true,
            CompiledPattern::Literal(lit) => lit.loose_eq(value),
            CompiledPattern::Binding(slot) => {
                frame[*slot] = value.clone();
                true
            }
        }
    }

    fn exec(
        &self,
        c: &Compiled,
        frame: &mut Vec<Value>,
        depth: &mut usize,
        limit: usize,
    ) -> Result<Value> {
        match c {
            Compiled::Const(v) => Ok(v.clone()),
            Compiled::Local(slot) => Ok(frame[*slot].clone()),
            Compiled::Assign(slot, expr) => {
                let value = self.exec(expr, frame, depth, limit)?;
                frame[*slot] = value.clone();
                Ok(value)
            }
            Compiled::Unary(op, expr) => {
                let value = self.exec(expr, frame, depth, limit)?;
                ops::unary_op(*op, value)
            }
            Compiled::Binary(op, lhs, rhs) => {
                let l = self.exec(lhs, frame, depth, limit)?;
                let r = self.exec(rhs, frame, depth, limit)?;
                ops::binary_op(*op, l, r)
            }
            Compiled::And(lhs, rhs) => {
                let l = self.exec(lhs, frame, depth, limit)?;
                if !l.is_truthy() {
                    return Ok(l);
                }
                self.exec(rhs, frame, depth, limit)
            }
            Compiled::Or(lhs, rhs) => {
                let l = self.exec(lhs, frame, depth, limit)?;
                if l.is_truthy() {
                    return Ok(l);
                }
                self.exec(rhs, frame, depth, limit)
            }
            Compiled::Coalesce(lhs, rhs) => {
                let l = self.exec(lhs, frame, depth, limit)?;
                if matches!(l, Value::Null) {
                    self.exec(rhs, frame, depth, limit)
                } else {
                    Ok(l)
                }
            }
            Compiled::Cast(ty, expr) => {
                let value = self.exec(expr, frame, depth, limit)?;
                Ok(ops::cast_value(value, *ty))
            }
            Compiled::Builtin(name, args) => {
                let values: Result<Vec<Value>> =
                    args.iter().map(|a| self.exec(a, frame, depth, limit)).collect();
                ops::call_builtin(name, &values?)
            }
            Compiled::SelfCall(args) => {
                let values: Result<Vec<Value>> =
                    args.iter().map(|a| self.exec(a, frame, depth, limit)).collect();
                *depth += 1;
                if *depth > limit {
                    return Err(EngineError::Execution(format!(
                        "recursion limit {limit} exceeded"
                    )));
                }
                let result = self.run_inner(&values?, limit, depth);
                *depth -= 1;
                result
            }
            Compiled::List(items) => {
                let values: Result<Vec<Value>> =
                    items.iter().map(|i| self.exec(i, frame, depth, limit)).collect();
                Ok(Value::List(values?))
            }
            Compiled::StructLit(fields) => {
                let mut out = Vec::with_capacity(fields.len());
                for (name, expr) in fields {
                    out.push((name.clone(), self.exec(expr, frame, depth, limit)?));
                }
                Ok(ops::make_struct(out))
            }
            Compiled::Field(expr, name) => {
                let value = self.exec(expr, frame, depth, limit)?;
                Ok(ops::field_value(value, name))
            }
            Compiled::IndexAt(expr, index) => {
                let value = self.exec(expr, frame, depth, limit)?;
                let idx = self.exec(index, frame, depth, limit)?;
                ops::index_value(value, idx)
            }
            Compiled::Block { .. } | Compiled::Match { .. } => {
                match self.exec_tail(c, frame, depth, limit)? {
                    Ctl::Val(v) => Ok(v),
                    Ctl::Tail(args) => {
                        *depth += 1;
                        if *depth > limit {
                            return Err(EngineError::Execution(format!(
                                "recursion limit {limit} exceeded"
                            )));
                        }
                        let result = self.run_inner(&args, limit, depth);
                        *depth -= 1;
                        result
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

struct Scope {
    names: Vec<String>,
    max_slots: usize,
}

impl Scope {
    fn resolve(&self, name: &str) -> Option<usize> {
        self.names.iter().rposition(|n| n == name)
    }

    fn declare(&mut self, name: &str) -> usize {
        self.names.push(name.to_string());
        self.max_slots = self.max_slots.max(self.names.len());
        self.names.len() - 1
    }
}

/// Try to specialize a function. Returns `None` when the body steps outside
/// the self-contained subset (free variables, calls to other functions,
/// loops over the environment, nested function definitions).
pub fn compile_function(func: &FunctionValue) -> Option<CompiledFn> {
    let self_name = func.name.as_deref()?;
    let mut scope = Scope { names: func.params.clone(), max_slots: func.params.len() };
    let mut assumed_absent = Vec::new();
    let captured = func.captured.upgrade();

    let body = compile_expr(&func.body, &mut scope, self_name, &captured, &mut assumed_absent)?;
    Some(CompiledFn {
        param_count: func.params.len(),
        slot_count: scope.max_slots.max(1),
        body: fold(body),
        assumed_absent,
    })
}

fn compile_expr(
    expr: &Expr,
    scope: &mut Scope,
    self_name: &str,
    captured: &Option<crate::lang::env::EnvRef>,
    assumed_absent: &mut Vec<String>,
) -> Option<Compiled> {
    let sub = |e: &Expr, scope: &mut Scope, absent: &mut Vec<String>| {
        compile_expr(e, scope, self_name, captured, absent)
    };
    match expr {
        Expr::Literal(d) => Some(Compiled::Const(Value::from_datum(d))),
        Expr::Ident(name) => scope.resolve(name).map(Compiled::Local),
        Expr::Unary { op, expr } => {
            Some(Compiled::Unary(*op, Box::new(sub(expr, scope, assumed_absent)?)))
        }
        Expr::Binary { op, lhs, rhs } => {
            let l = Box::new(sub(lhs, scope, assumed_absent)?);
            let r = Box::new(sub(rhs, scope, assumed_absent)?);
            Some(match op {
                BinOp::And => Compiled::And(l, r),
                BinOp::Or => Compiled::Or(l, r),
                BinOp::Coalesce => Compiled::Coalesce(l, r),
                other => Compiled::Binary(*other, l, r),
            })
        }
        Expr::Cast { expr, ty } => {
            let ty = CastTy::parse(ty)?;
            Some(Compiled::Cast(ty, Box::new(sub(expr, scope, assumed_absent)?)))
        }
        Expr::Call { name, args } => {
            let compiled: Option<Vec<Compiled>> =
                args.iter().map(|a| sub(a, scope, assumed_absent)).collect();
            let compiled = compiled?;
            if name == self_name {
                return Some(Compiled::SelfCall(compiled));
            }
            if let Some(static_name) =
                ops::BUILTIN_NAMES.iter().copied().find(|b| *b == name.as_str())
            {
                return Some(Compiled::Builtin(static_name, compiled));
            }
            None
        }
        Expr::List(items) => {
            let compiled: Option<Vec<Compiled>> =
                items.iter().map(|i| sub(i, scope, assumed_absent)).collect();
            Some(Compiled::List(compiled?))
        }
        Expr::StructLit(fields) => {
            let mut out = Vec::with_capacity(fields.len());
            for (name, e) in fields {
                out.push((name.clone(), sub(e, scope, assumed_absent)?));
            }
            Some(Compiled::StructLit(out))
        }
        Expr::Field(expr, name) => {
            Some(Compiled::Field(Box::new(sub(expr, scope, assumed_absent)?), name.clone()))
        }
        Expr::IndexAt(expr, index) => Some(Compiled::IndexAt(
            Box::new(sub(expr, scope, assumed_absent)?),
            Box::new(sub(index, scope, assumed_absent)?),
        )),
        Expr::Block(items) => {
            let base = scope.names.len();
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    BlockItem::Let { name, value } => {
                        let value = sub(value, scope, assumed_absent)?;
                        let slot = match scope.resolve(name) {
                            Some(slot) => slot,
                            None => {
                                // Sound only if the name is not bound in the
                                // enclosing scope (LET would rebind there).
                                if captured
                                    .as_ref()
                                    .is_some_and(|env| Environment::get(env, name).is_some())
                                {
                                    return None;
                                }
                                assumed_absent.push(name.clone());
                                scope.declare(name)
                            }
                        };
                        out.push(Compiled::Assign(slot, Box::new(value)));
                    }
                    BlockItem::Expr(e) => out.push(sub(e, scope, assumed_absent)?),
                }
            }
            scope.names.truncate(base);
            Some(Compiled::Block(out))
        }
        Expr::Match { scrutinee, arms } => {
            let scrutinee = Box::new(sub(scrutinee, scope, assumed_absent)?);
            let mut compiled_arms = Vec::with_capacity(arms.len());
            for MatchArm { pattern, body } in arms {
                let base = scope.names.len();
                let pattern = match pattern {
                    Pattern::Wildcard => CompiledPattern::Wildcard,
                    Pattern::Literal(d) => CompiledPattern::Literal(Value::from_datum(d)),
                    Pattern::Binding(name) => CompiledPattern::Binding(scope.declare(name)),
                };
                let body = sub(body, scope, assumed_absent)?;
                scope.names.truncate(base);
                compiled_arms.push((pattern, body));
            }
            Some(Compiled::Match { scrutinee, arms: compiled_arms })
        }
        // Environment-dependent constructs stay interpreted.
        Expr::Aggregate { .. }
        | Expr::Function { .. }
        | Expr::For { .. }
        | Expr::While { .. }
        | Expr::Try { .. } => None,
    }
}

/// Constant folding over the compiled tree.
fn fold(c: Compiled) -> Compiled {
    match c {
        Compiled::Binary(op, lhs, rhs) => {
            let lhs = fold(*lhs);
            let rhs = fold(*rhs);
            if let (Compiled::Const(a), Compiled::Const(b)) = (&lhs, &rhs) {
                if let Ok(v) = ops::binary_op(op, a.clone(), b.clone()) {
                    return Compiled::Const(v);
                }
            }
            Compiled::Binary(op, Box::new(lhs), Box::new(rhs))
        }
        Compiled::Unary(op, expr) => {
            let expr = fold(*expr);
            if let Compiled::Const(v) = &expr {
                if let Ok(folded) = ops::unary_op(op, v.clone()) {
                    return Compiled::Const(folded);
                }
            }
            Compiled::Unary(op, Box::new(expr))
        }
        Compiled::And(lhs, rhs) => {
            let lhs = fold(*lhs);
            let rhs = fold(*rhs);
            if let Compiled::Const(v) = &lhs {
                return if v.is_truthy() { rhs } else { lhs };
            }
            Compiled::And(Box::new(lhs), Box::new(rhs))
        }
        Compiled::Or(lhs, rhs) => {
            let lhs = fold(*lhs);
            let rhs = fold(*rhs);
            if let Compiled::Const(v) = &lhs {
                return if v.is_truthy() { lhs } else { rhs };
            }
            Compiled::Or(Box::new(lhs), Box::new(rhs))
        }
        Compiled::Coalesce(lhs, rhs) => {
            let lhs = fold(*lhs);
            let rhs = fold(*rhs);
            if let Compiled::Const(v) = &lhs {
                return if matches!(v, Value::Null) { rhs } else { lhs };
            }
            Compiled::Coalesce(Box::new(lhs), Box::new(rhs))
        }
        Compiled::Cast(ty, expr) => {
            let expr = fold(*expr);
            if let Compiled::Const(v) = &expr {
                return Compiled::Const(ops::cast_value(v.clone(), ty));
            }
            Compiled::Cast(ty, Box::new(expr))
        }
        Compiled::Assign(slot, expr) => Compiled::Assign(slot, Box::new(fold(*expr))),
        Compiled::Builtin(name, args) => {
            Compiled::Builtin(name, args.into_iter().map(fold).collect())
        }
        Compiled::SelfCall(args) => Compiled::SelfCall(args.into_iter().map(fold).collect()),
        Compiled::List(items) => Compiled::List(items.into_iter().map(fold).collect()),
        Compiled::StructLit(fields) => {
            Compiled::StructLit(fields.into_iter().map(|(n, e)| (n, fold(e))).collect())
        }
        Compiled::Field(expr, name) => Compiled::Field(Box::new(fold(*expr)), name),
        Compiled::IndexAt(expr, index) => {
            Compiled::IndexAt(Box::new(fold(*expr)), Box::new(fold(*index)))
        }
        Compiled::Block(items) => Compiled::Block(items.into_iter().map(fold).collect()),
        Compiled::Match { scrutinee, arms } => Compiled::Match {
            scrutinee: Box::new(fold(*scrutinee)),
            arms: arms.into_iter().map(|(p, b)| (p, fold(b))).collect(),
        },
        leaf @ (Compiled::Const(_) | Compiled::Local(_)) => leaf,
    }
}

// ---------------------------------------------------------------------------
// Profiling table and dispatch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HotPathConfig {
    pub threshold: u32,
    pub min_threshold: u32,
    pub max_threshold: u32,
    pub bench_samples: usize,
    pub bench_warmup: usize,
    pub retire_margin: f64,
}

impl Default for HotPathConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            min_threshold: 1,
            max_threshold: 1000,
            bench_samples: 16,
            bench_warmup: 4,
            retire_margin: 0.25,
        }
    }
}

struct FnEntry {
    calls: u64,
    ast_hash: Hash256,
    sig: Option<Vec<TypeTag>>,
    compiled: Option<Rc<CompiledFn>>,
    /// Lost its benchmark race, or proved unspecializable.
    retired: bool,
    recorded_args: VecDeque<Vec<Value>>,
    compiled_calls: u64,
    bench_ratios: Vec<f64>,
    bench_seen: usize,
}

impl FnEntry {
    fn fresh(ast_hash: Hash256) -> Self {
        Self {
            calls: 0,
            ast_hash,
            sig: None,
            compiled: None,
            retired: false,
            recorded_args: VecDeque::new(),
            compiled_calls: 0,
            bench_ratios: Vec::new(),
            bench_seen: 0,
        }
    }
}

/// What the caller should do for this invocation.
pub enum Dispatch {
    /// Run the specialized form; `bench_due` asks the caller to race both
    /// forms over recorded arguments afterwards.
    Compiled { func: Rc<CompiledFn>, bench_due: bool },
    /// Crossed the threshold: attempt compilation.
    Promote,
    Interpret,
}

pub struct HotPath {
    cfg: HotPathConfig,
    table: HashMap<String, FnEntry>,
}

impl HotPath {
    pub fn new(cfg: HotPathConfig) -> Self {
        Self { cfg, table: HashMap::new() }
    }

    pub fn threshold(&self) -> u32 {
        self.cfg.threshold
    }

    /// Record an invocation and decide how to dispatch it.
    pub fn note_call(&mut self, name: &str, hash: Hash256, args: &[Value]) -> Dispatch {
        let entry = self.table.entry(name.to_string()).or_insert_with(|| FnEntry::fresh(hash));
        if entry.ast_hash != hash {
            // Redefinition: evict and start over.
            *entry = FnEntry::fresh(hash);
        }
        entry.calls += 1;
        if entry.recorded_args.len() >= RECORDED_ARGS {
            entry.recorded_args.pop_front();
        }
        entry.recorded_args.push_back(args.to_vec());

        if let Some(compiled) = &entry.compiled {
            let sig = type_signature(args);
            if entry.sig.as_deref() == Some(&sig[..]) {
                entry.compiled_calls += 1;
                let bench_due = entry.compiled_calls % BENCH_EVERY == 1;
                return Dispatch::Compiled { func: Rc::clone(compiled), bench_due };
            }
            // Parameter type widened: evict; the next call may recompile.
            entry.compiled = None;
            entry.sig = None;
            return Dispatch::Promote;
        }
        if !entry.retired && entry.calls >= u64::from(self.cfg.threshold) {
            return Dispatch::Promote;
        }
        Dispatch::Interpret
    }

    pub fn install(&mut self, name: &str, args: &[Value], func: CompiledFn) -> Rc<CompiledFn> {
        let compiled = Rc::new(func);
        if let Some(entry) = self.table.get_mut(name) {
            entry.sig = Some(type_signature(args));
            entry.compiled = Some(Rc::clone(&compiled));
            entry.compiled_calls = 1;
            entry.bench_ratios.clear();
            entry.bench_seen = 0;
            obs::emit_hotpath_promoted(name, entry.calls);
        }
        compiled
    }

    /// The body stepped outside the specializable subset; stop trying.
    pub fn mark_unspecializable(&mut self, name: &str) {
        if let Some(entry) = self.table.get_mut(name) {
            entry.retired = true;
        }
    }

    /// Feed one benchmark sample: `ratio = specialized_time / interpreted_time`.
    /// Warm-up samples are discarded before any verdict.
    pub fn record_bench(&mut self, name: &str, ratio: f64) {
        let (retire, speedup) = {
            let Some(entry) = self.table.get_mut(name) else { return };
            entry.bench_seen += 1;
            if entry.bench_seen <= self.cfg.bench_warmup {
                return;
            }
            entry.bench_ratios.push(ratio);
            if entry.bench_ratios.len() < self.cfg.bench_samples {
                return;
            }
            let avg: f64 =
                entry.bench_ratios.iter().sum::<f64>() / entry.bench_ratios.len() as f64;
            entry.bench_ratios.clear();
            entry.bench_seen = 0;
            (avg > 1.0 + self.cfg.retire_margin, avg)
        };
        if retire {
            if let Some(entry) = self.table.get_mut(name) {
                entry.compiled = None;
                entry.sig = None;
                entry.retired = true;
            }
            obs::emit_hotpath_retired(name, "slower than interpreter");
            self.cfg.threshold =
                (self.cfg.threshold.saturating_mul(2)).clamp(self.cfg.min_threshold, self.cfg.max_threshold);
        } else if speedup < 0.5 {
            // Strong win: promote future functions earlier.
            self.cfg.threshold =
                (self.cfg.threshold / 2).clamp(self.cfg.min_threshold, self.cfg.max_threshold);
        }
    }

    /// A global binding changed: evict compiled entries whose soundness
    /// assumed that name was absent from the enclosing scope.
    pub fn on_global_rebound(&mut self, name: &str) {
        for entry in self.table.values_mut() {
            if let Some(compiled) = &entry.compiled {
                if compiled.assumed_absent.iter().any(|n| n == name) {
                    entry.compiled = None;
                    entry.sig = None;
                }
            }
        }
    }

    pub fn recorded_args(&self, name: &str) -> Vec<Vec<Value>> {
        self.table
            .get(name)
            .map(|e| e.recorded_args.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn call_count(&self, name: &str) -> u64 {
        self.table.get(name).map_or(0, |e| e.calls)
    }

    pub fn is_specialized(&self, name: &str) -> bool {
        self.table.get(name).is_some_and(|e| e.compiled.is_some())
    }
}
