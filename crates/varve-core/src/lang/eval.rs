//! The AST evaluator.
//!
//! Single-threaded, strict left-to-right, short-circuit `and`/`or`/`??`.
//! Function calls go through the hot-path dispatcher: past the call-count
//! threshold a specialized form takes over, and a periodic benchmark race
//! keeps it honest. Tail calls are trampolined so tail recursion does not
//! grow the Rust stack; non-tail recursion is capped.

use std::rc::Rc;
use std::time::Instant;

use crate::error::{EngineError, Result};
use crate::hotpath::{self, CompiledFn, Dispatch, HotPath, HotPathConfig};

use super::ast::{BinOp, BlockItem, Expr, MatchArm, Pattern, Statement};
use super::env::{Capture, EnvRef, Environment};
use super::ops::{self, CastTy};
use super::value::{FunctionValue, Value};

enum Flow {
    Val(Value),
    Tail(Rc<FunctionValue>, Vec<Value>),
}

pub struct Interpreter {
    pub globals: EnvRef,
    hotpath: HotPath,
    recursion_limit: usize,
    depth: usize,
    /// Set during benchmark races so the interpreted side stays interpreted.
    bench_mode: bool,
}

impl Interpreter {
    pub fn new(recursion_limit: usize, hotpath_cfg: HotPathConfig) -> Self {
        Self {
            globals: Environment::root(),
            hotpath: HotPath::new(hotpath_cfg),
            recursion_limit,
            depth: 0,
            bench_mode: false,
        }
    }

    pub fn hotpath(&self) -> &HotPath {
        &self.hotpath
    }

    /// Evaluate a procedural statement at global scope.
    pub fn eval_statement(&mut self, stmt: &Statement) -> Result<Value> {
        match stmt {
            Statement::FunctionDef { name, params, body } => {
                let func = Rc::new(FunctionValue {
                    name: Some(name.clone()),
                    params: params.clone(),
                    body: Rc::new(body.clone()),
                    captured: Capture::Weak(Rc::downgrade(&self.globals)),
                });
                Environment::define(&self.globals, name.clone(), Value::Function(Rc::clone(&func)));
                self.hotpath.on_global_rebound(name);
                Ok(Value::Function(func))
            }
            Statement::Let { name, value } => {
                let env = Rc::clone(&self.globals);
                let v = self.eval_expr(value, &env)?;
                Environment::bind(&self.globals, name, v.clone());
                self.hotpath.on_global_rebound(name);
                Ok(v)
            }
            Statement::Expr(expr) => {
                let env = Rc::clone(&self.globals);
                self.eval_expr(expr, &env)
            }
            other => Err(EngineError::Internal(format!(
                "data-plane statement {other:?} routed to the evaluator"
            ))),
        }
    }

    pub fn eval_expr(&mut self, expr: &Expr, env: &EnvRef) -> Result<Value> {
        match self.eval_tail(expr, env)? {
            Flow::Val(v) => Ok(v),
            Flow::Tail(func, args) => self.run_call_loop(func, args),
        }
    }

    /// Evaluate with tail-call detection: a call in tail position returns a
    /// `Flow::Tail` for the caller's trampoline instead of recursing.
    fn eval_tail(&mut self, expr: &Expr, env: &EnvRef) -> Result<Flow> {
        match expr {
            Expr::Block(items) => {
                let block_env = Environment::child(env);
                let Some((last, init)) = items.split_last() else {
                    return Ok(Flow::Val(Value::Null));
                };
                for item in init {
                    self.eval_block_item(item, &block_env)?;
                }
                match last {
                    BlockItem::Expr(e) => self.eval_tail(e, &block_env),
                    BlockItem::Let { .. } => {
                        Ok(Flow::Val(self.eval_block_item(last, &block_env)?))
                    }
                }
            }
            Expr::Match { scrutinee, arms } => {
                let value = self.eval_expr(scrutinee, env)?;
                for MatchArm { pattern, body } in arms {
                    match pattern {
                        Pattern::Wildcard => return self.eval_tail(body, env),
                        Pattern::Literal(lit) => {
                            if Value::from_datum(lit).loose_eq(&value) {
                                return self.eval_tail(body, env);
                            }
                        }
                        Pattern::Binding(name) => {
                            let arm_env = Environment::child(env);
                            Environment::define(&arm_env, name.clone(), value.clone());
                            return self.eval_tail(body, &arm_env);
                        }
                    }
                }
                Ok(Flow::Val(Value::error("no match arm matched", "match")))
            }
            Expr::Call { name, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval_expr(arg, env)?);
                }
                match Environment::get(env, name) {
                    Some(Value::Function(func)) => Ok(Flow::Tail(func, values)),
                    Some(other) => Err(EngineError::Execution(format!(
                        "{name} is a {}, not a function",
                        other.type_name()
                    ))),
                    None => Ok(Flow::Val(ops::call_builtin(name, &values)?)),
                }
            }
            other => Ok(Flow::Val(self.eval_simple(other, env)?)),
        }
    }

    fn eval_block_item(&mut self, item: &BlockItem, env: &EnvRef) -> Result<Value> {
        match item {
            BlockItem::Let { name, value } => {
                let v = self.eval_expr(value, env)?;
                Environment::bind(env, name, v.clone());
                Ok(v)
            }
            BlockItem::Expr(e) => self.eval_expr(e, env),
        }
    }

    fn eval_simple(&mut self, expr: &Expr, env: &EnvRef) -> Result<Value> {
        match expr {
            Expr::Literal(d) => Ok(Value::from_datum(d)),
            Expr::Ident(name) => Environment::get(env, name)
                .ok_or_else(|| EngineError::Execution(format!("undefined variable {name}"))),
            Expr::Field(inner, name) => {
                let value = self.eval_expr(inner, env)?;
                Ok(ops::field_value(value, name))
            }
            Expr::IndexAt(inner, index) => {
                let value = self.eval_expr(inner, env)?;
                let idx = self.eval_expr(index, env)?;
                ops::index_value(value, idx)
            }
            Expr::Unary { op, expr } => {
                let value = self.eval_expr(expr, env)?;
                ops::unary_op(*op, value)
            }
            Expr::Binary { op: BinOp::And, lhs, rhs } => {
                let l = self.eval_expr(lhs, env)?;
                if !l.is_truthy() {
                    return Ok(l);
                }
                self.eval_expr(rhs, env)
            }
            Expr::Binary { op: BinOp::Or, lhs, rhs } => {
                let l = self.eval_expr(lhs, env)?;
                if l.is_truthy() {
                    return Ok(l);
                }
                self.eval_expr(rhs, env)
            }
            Expr::Binary { op: BinOp::Coalesce, lhs, rhs } => {
                let l = self.eval_expr(lhs, env)?;
                if matches!(l, Value::Null) {
                    self.eval_expr(rhs, env)
                } else {
                    Ok(l)
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let l = self.eval_expr(lhs, env)?;
                let r = self.eval_expr(rhs, env)?;
                ops::binary_op(*op, l, r)
            }
            Expr::Cast { expr, ty } => {
                let parsed = CastTy::parse(ty).ok_or_else(|| {
                    EngineError::Execution(format!("unknown cast target {ty}"))
                })?;
                let value = self.eval_expr(expr, env)?;
                Ok(ops::cast_value(value, parsed))
            }
            Expr::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval_expr(item, env)?);
                }
                Ok(Value::List(out))
            }
            Expr::StructLit(fields) => {
                let mut out = Vec::with_capacity(fields.len());
                for (name, e) in fields {
                    out.push((name.clone(), self.eval_expr(e, env)?));
                }
                Ok(ops::make_struct(out))
            }
            Expr::Function { name, params, body } => {
                let captured = match name {
                    // Registered in its own environment: weak capture breaks
                    // the env -> function -> env cycle.
                    Some(_) => Capture::Weak(Rc::downgrade(env)),
                    None => Capture::Strong(Rc::clone(env)),
                };
                let func = Rc::new(FunctionValue {
                    name: name.clone(),
                    params: params.clone(),
                    body: Rc::new((**body).clone()),
                    captured,
                });
                if let Some(n) = name {
                    Environment::define(env, n.clone(), Value::Function(Rc::clone(&func)));
                }
                Ok(Value::Function(func))
            }
            Expr::For { var, iter, body } => {
                let iterable = self.eval_expr(iter, env)?;
                let Value::List(items) = iterable else {
                    return Err(EngineError::Execution(format!(
                        "cannot iterate over {}",
                        iterable.type_name()
                    )));
                };
                for item in items {
                    let loop_env = Environment::child(env);
                    Environment::define(&loop_env, var.clone(), item);
                    self.eval_expr(body, &loop_env)?;
                }
                Ok(Value::Null)
            }
            Expr::While { cond, body } => {
                while self.eval_expr(cond, env)?.is_truthy() {
                    self.eval_expr(body, env)?;
                }
                Ok(Value::Null)
            }
            Expr::Try { body, catch } => {
                let outcome = self.eval_expr(body, env);
                let error_value = match outcome {
                    Ok(v) if v.is_error() => v,
                    Ok(v) => return Ok(v),
                    Err(EngineError::Execution(message)) => Value::error(message, "execution"),
                    Err(other) => return Err(other),
                };
                let catch_env = Environment::child(env);
                Environment::define(&catch_env, "error", error_value);
                self.eval_expr(catch, &catch_env)
            }
            Expr::Aggregate { func, .. } => Err(EngineError::Execution(format!(
                "{} is only valid inside SELECT",
                func.name()
            ))),
            Expr::Block(_) | Expr::Match { .. } | Expr::Call { .. } => {
                unreachable!("handled by eval_tail")
            }
        }
    }

    /// Call a function value with already-evaluated arguments.
    pub fn call_function(&mut self, func: Rc<FunctionValue>, args: Vec<Value>) -> Result<Value> {
        self.run_call_loop(func, args)
    }

    /// The trampoline: dispatches through the hot-path table, runs tail
    /// calls iteratively, and falls back to AST walking.
    fn run_call_loop(&mut self, func: Rc<FunctionValue>, args: Vec<Value>) -> Result<Value> {
        let mut current = func;
        let mut current_args = args;
        loop {
            if !self.bench_mode {
                if let Some(outcome) = self.dispatch_hotpath(&current, &current_args)? {
                    return Ok(outcome);
                }
            }
            match self.call_frame(&current, &current_args)? {
                Flow::Val(v) => return Ok(v),
                Flow::Tail(next, next_args) => {
                    current = next;
                    current_args = next_args;
                }
            }
        }
    }

    /// One interpreted activation of `func`.
    fn call_frame(&mut self, func: &Rc<FunctionValue>, args: &[Value]) -> Result<Flow> {
        if args.len() != func.params.len() {
            return Err(EngineError::Execution(format!(
                "{} expects {} argument(s), got {}",
                func.name.as_deref().unwrap_or("<anonymous>"),
                func.params.len(),
                args.len()
            )));
        }
        let captured = func.captured.upgrade().ok_or_else(|| {
            EngineError::Execution(format!(
                "captured scope of {} is no longer alive",
                func.name.as_deref().unwrap_or("<anonymous>")
            ))
        })?;
        let env = Environment::child(&captured);
        if let Some(name) = &func.name {
            Environment::define(&env, name.clone(), Value::Function(Rc::clone(func)));
        }
        for (param, value) in func.params.iter().zip(args) {
            Environment::define(&env, param.clone(), value.clone());
        }

        self.depth += 1;
        if self.depth > self.recursion_limit {
            self.depth -= 1;
            return Err(EngineError::Execution(format!(
                "recursion limit {} exceeded",
                self.recursion_limit
            )));
        }
        let flow = self.eval_tail(&func.body, &env);
        self.depth -= 1;
        flow
    }

    /// Hot-path dispatch: count the call, run the specialized form on a
    /// cache hit, compile on threshold crossing. `None` means "interpret".
    fn dispatch_hotpath(
        &mut self,
        func: &Rc<FunctionValue>,
        args: &[Value],
    ) -> Result<Option<Value>> {
        let Some(name) = func.name.clone() else {
            return Ok(None);
        };
        let hash = hotpath::ast_hash(&func.body);
        match self.hotpath.note_call(&name, hash, args) {
            Dispatch::Compiled { func: compiled, bench_due } => {
                let result = compiled.run(args, self.recursion_limit)?;
                if bench_due {
                    self.run_benchmark(&name, func, &compiled);
                }
                Ok(Some(result))
            }
            Dispatch::Promote => match hotpath::compile_function(func) {
                Some(cf) => {
                    let compiled = self.hotpath.install(&name, args, cf);
                    Ok(Some(compiled.run(args, self.recursion_limit)?))
                }
                None => {
                    self.hotpath.mark_unspecializable(&name);
                    Ok(None)
                }
            },
            Dispatch::Interpret => Ok(None),
        }
    }

    /// Race the specialized form against the interpreter over recorded
    /// arguments and feed the ratio to the profiler (which discards warm-up
    /// samples before reaching a verdict).
    fn run_benchmark(&mut self, name: &str, func: &Rc<FunctionValue>, compiled: &Rc<CompiledFn>) {
        let samples = self.hotpath.recorded_args(name);
        if samples.is_empty() {
            return;
        }
        let started = Instant::now();
        for args in &samples {
            let _ = compiled.run(args, self.recursion_limit);
        }
        let specialized = started.elapsed();

        self.bench_mode = true;
        let started = Instant::now();
        for args in &samples {
            let _ = self.run_call_loop(Rc::clone(func), args.clone());
        }
        let interpreted = started.elapsed();
        self.bench_mode = false;

        let ratio = specialized.as_secs_f64() / interpreted.as_secs_f64().max(1e-9);
        self.hotpath.record_bench(name, ratio);
    }
}

#[cfg(test)]
mod tests {
    use super::super::parser::{parse_program, parse_statement};
    use super::*;

    fn interp() -> Interpreter {
        Interpreter::new(1000, HotPathConfig::default())
    }

    fn eval_all(interp: &mut Interpreter, src: &str) -> Result<Value> {
        let mut last = Value::Null;
        for stmt in parse_program(src).unwrap() {
            last = interp.eval_statement(&stmt)?;
        }
        Ok(last)
    }

    fn eval_one(src: &str) -> Result<Value> {
        eval_all(&mut interp(), src)
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert!(eval_one("1 + 2 * 3").unwrap().loose_eq(&Value::Number(7.0)));
        assert!(eval_one("(1 + 2) * 3").unwrap().loose_eq(&Value::Number(9.0)));
    }

    #[test]
    fn let_binds_and_rebinds() {
        let v = eval_one("LET x = 1; LET x = x + 1; x").unwrap();
        assert!(v.loose_eq(&Value::Number(2.0)));
    }

    #[test]
    fn short_circuit_and_coalesce() {
        // The right side would blow up if evaluated.
        assert!(eval_one("false and (1 / 0)").unwrap().loose_eq(&Value::Bool(false)));
        assert!(eval_one("true or (1 / 0)").unwrap().loose_eq(&Value::Bool(true)));
        assert!(eval_one("null ?? 5").unwrap().loose_eq(&Value::Number(5.0)));
        assert!(eval_one("3 ?? 5").unwrap().loose_eq(&Value::Number(3.0)));
    }

    #[test]
    fn closures_capture_lexical_scope() {
        let src = "
            FUNCTION make_adder(n) { FUNCTION (x) { x + n } }
            LET add2 = make_adder(2);
            add2(5)
        ";
        assert!(eval_one(src).unwrap().loose_eq(&Value::Number(7.0)));
    }

    #[test]
    fn fib_interpreted() {
        let mut i = interp();
        eval_all(
            &mut i,
            "FUNCTION fib(n) { MATCH n { case 0 => 0, case 1 => 1, case _ => fib(n - 1) + fib(n - 2) } }",
        )
        .unwrap();
        let v = eval_all(&mut i, "fib(10)").unwrap();
        assert!(v.loose_eq(&Value::Number(55.0)));
    }

    #[test]
    fn hotpath_promotes_after_threshold_and_agrees() {
        let mut i = interp();
        eval_all(
            &mut i,
            "FUNCTION fib(n) { MATCH n { case 0 => 0, case 1 => 1, case _ => fib(n - 1) + fib(n - 2) } }",
        )
        .unwrap();
        // Drive past the default threshold of 10 top-level calls.
        for _ in 0..10 {
            eval_all(&mut i, "fib(8)").unwrap();
        }
        assert!(i.hotpath().is_specialized("fib"));

        // Specialized and interpreted outputs agree on fib(0)..fib(15).
        let expected =
            [0.0, 1.0, 1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 21.0, 34.0, 55.0, 89.0, 144.0, 233.0, 377.0, 610.0];
        for (n, want) in expected.iter().enumerate() {
            let got = eval_all(&mut i, &format!("fib({n})")).unwrap();
            assert!(got.loose_eq(&Value::Number(*want)), "fib({n})");
        }
    }

    #[test]
    fn tail_recursion_is_trampolined() {
        let mut i = Interpreter::new(100, HotPathConfig { threshold: 1_000_000, ..HotPathConfig::default() });
        eval_all(
            &mut i,
            "FUNCTION countdown(n) { MATCH n { case 0 => 'done', case _ => countdown(n - 1) } }",
        )
        .unwrap();
        // 50_000 tail frames with a recursion cap of 100.
        let v = eval_all(&mut i, "countdown(50000)").unwrap();
        assert!(v.loose_eq(&Value::Str("done".into())));
    }

    #[test]
    fn non_tail_recursion_hits_the_cap() {
        let mut i = Interpreter::new(100, HotPathConfig { threshold: 1_000_000, ..HotPathConfig::default() });
        eval_all(&mut i, "FUNCTION deep(n) { MATCH n { case 0 => 0, case _ => deep(n - 1) + 1 } }")
            .unwrap();
        let err = eval_all(&mut i, "deep(500)").unwrap_err();
        assert!(err.to_string().contains("recursion limit"));
    }

    #[test]
    fn try_catch_handles_error_values_and_faults() {
        assert!(eval_one("TRY 1 / 0 CATCH 42").unwrap().loose_eq(&Value::Number(42.0)));
        assert!(eval_one("TRY undefined_var CATCH 'fell back'")
            .unwrap()
            .loose_eq(&Value::Str("fell back".into())));
        let v = eval_one("TRY 1 / 0 CATCH error").unwrap();
        assert!(v.is_error());
    }

    #[test]
    fn while_loop_terminates() {
        let v = eval_one("LET n = 5; LET acc = 0; WHILE n > 0 { LET acc = acc + n; LET n = n - 1 }; acc")
            .unwrap();
        assert!(v.loose_eq(&Value::Number(15.0)));
    }

    #[test]
    fn for_loop_iterates_lists() {
        let v = eval_one("LET acc = 0; FOR x IN [1, 2, 3] { LET acc = acc + x }; acc").unwrap();
        assert!(v.loose_eq(&Value::Number(6.0)));
    }

    #[test]
    fn match_binding_and_wildcard() {
        let v = eval_one("MATCH 41 { case 0 => 'zero', case n => n + 1 }").unwrap();
        assert!(v.loose_eq(&Value::Number(42.0)));
    }

    #[test]
    fn pipe_is_function_application() {
        let src = "FUNCTION double(x) { x * 2 } 5 |> double";
        assert!(eval_one(src).unwrap().loose_eq(&Value::Number(10.0)));
    }

    #[test]
    fn structs_and_lists() {
        assert!(eval_one("{a: 1, b: 2}.b").unwrap().loose_eq(&Value::Number(2.0)));
        assert!(eval_one("[10, 20, 30][1]").unwrap().loose_eq(&Value::Number(20.0)));
        assert!(eval_one("{a: 1}.missing").unwrap().loose_eq(&Value::Null));
    }

    #[test]
    fn cast_postfix() {
        assert!(eval_one("'12' :: int").unwrap().loose_eq(&Value::Number(12.0)));
        assert!(eval_one("3.9 :: int").unwrap().loose_eq(&Value::Number(3.0)));
    }

    #[test]
    fn redefining_function_evicts_specialization() {
        let mut i = interp();
        eval_all(&mut i, "FUNCTION f(n) { n + 1 }").unwrap();
        for _ in 0..12 {
            eval_all(&mut i, "f(1)").unwrap();
        }
        assert!(i.hotpath().is_specialized("f"));
        eval_all(&mut i, "FUNCTION f(n) { n + 2 }").unwrap();
        let v = eval_all(&mut i, "f(1)").unwrap();
        assert!(v.loose_eq(&Value::Number(3.0)));
    }

    #[test]
    fn aggregates_rejected_outside_select() {
        let stmt = parse_statement("SUM(1)").unwrap();
        let err = interp().eval_statement(&stmt).unwrap_err();
        assert!(err.to_string().contains("SELECT"));
    }
}
