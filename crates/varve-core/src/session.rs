//! `Database` and `Session`: the embedding API.
//!
//! A statement enters as text, is parsed, and routes either to the language
//! evaluator (LET, FUNCTION, expressions) or through the planner and
//! executor (everything data-plane). Reads bind a snapshot root at plan
//! start and hold it for the plan's lifetime; writes go through the
//! copy-on-write commit path and then refresh dependent materialized views.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use varve_store::{
    ColumnDef, DataType, Datum, Hash256, IndexDef, IndexKind, Row, StripeSet, ViewDef,
};

use crate::cache::{estimate_result_bytes, CacheEntry};
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::exec::agg::{group_aggregate, AggSpec, AggState};
use crate::exec::join::{join, qualify_columns};
use crate::exec::ops::{DistinctStream, FilterStream, LimitStream, OrderStream, ProjectStream};
use crate::exec::parallel::ParallelScan;
use crate::exec::scan::{group_locators, IndexScan, TableScan};
use crate::exec::{collect_rows, eval_row_expr, ExecContext, RowStream, VecStream};
use crate::hotpath::HotPathConfig;
use crate::lang::ast::{DropKind, Expr, SelectItem, SelectStmt, Statement, TableSource};
use crate::lang::parser::parse_program;
use crate::lang::value::Value;
use crate::lang::Interpreter;
use crate::obs::{self, QuerySpan};
use crate::plan::planner::build_side_is_left;
use crate::plan::{
    extract_conditions, normalize_expr, normalize_select, plan_table_access, prune_predicates,
    AccessOp, CmpOp, PlannerInputs, QueryPlan,
};
use crate::timeline::{diff, TableChange, VerifyReport};

/// An opened database root.
pub struct Database {
    engine: Arc<Engine>,
}

impl Database {
    pub fn open(root: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::open_with_config(root, EngineConfig::default())
    }

    pub fn open_with_config(
        root: impl AsRef<std::path::Path>,
        config: EngineConfig,
    ) -> Result<Self> {
        Ok(Self { engine: Arc::new(Engine::open(root, config)?) })
    }

    /// In-memory database; state dies with the process.
    pub fn ephemeral() -> Result<Self> {
        Self::ephemeral_with_config(EngineConfig::default())
    }

    pub fn ephemeral_with_config(config: EngineConfig) -> Result<Self> {
        Ok(Self { engine: Arc::new(Engine::ephemeral(config)?) })
    }

    pub fn session(&self) -> Session {
        let cfg = &self.engine.config;
        let hotpath = HotPathConfig {
            threshold: cfg.hotpath_threshold,
            min_threshold: cfg.hotpath_min_threshold,
            max_threshold: cfg.hotpath_max_threshold,
            bench_samples: cfg.bench_samples,
            bench_warmup: cfg.bench_warmup,
            retire_margin: cfg.bench_retire_margin,
        };
        Session {
            engine: Arc::clone(&self.engine),
            interp: Interpreter::new(cfg.recursion_limit, hotpath),
            strict: cfg.strict_mode,
            timeout: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn verify(&self) -> Result<VerifyReport> {
        self.engine.verify()
    }

    pub fn gc(&self) -> Result<crate::timeline::GcReport> {
        self.engine.gc()
    }

    /// Symmetric stripe diff between two references.
    pub fn diff(&self, a: &str, b: &str) -> Result<Vec<TableChange>> {
        let a = self.engine.timeline.resolve(a)?;
        let b = self.engine.timeline.resolve(b)?;
        diff::diff(&self.engine.timeline, a, b)
    }

    /// `diff` with the ancestry requirement: incremental reads since `a`.
    pub fn changes_since(&self, ancestor: &str) -> Result<Vec<TableChange>> {
        let a = self.engine.timeline.resolve(ancestor)?;
        let head = self.engine.timeline.resolve("HEAD")?;
        diff::changes_since(&self.engine.timeline, a, head)
    }

    /// Move HEAD back to an ancestor commit or snapshot.
    pub fn reset(&self, reference: &str) -> Result<()> {
        let commit = self.engine.timeline.resolve(reference)?;
        self.engine.timeline.reset(commit)?;
        self.engine.cache.clear();
        Ok(())
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }
}

/// Result of one statement.
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// Present when the statement ran in the language evaluator.
    pub value: Option<Value>,
    /// Present for planned queries.
    pub plan: Option<QueryPlan>,
    pub rows_affected: u64,
    pub commit: Option<Hash256>,
    pub cache_hit: bool,
}

impl Outcome {
    fn rows_only(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self { columns, rows, ..Self::default() }
    }
}

pub struct Session {
    engine: Arc<Engine>,
    interp: Interpreter,
    strict: bool,
    timeout: Option<Duration>,
    cancel: Arc<AtomicBool>,
}

impl Session {
    /// Promote row-local evaluation errors to plan failures.
    pub fn set_strict(&mut self, strict: bool) {
        self.strict = strict;
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Cooperative cancellation handle for the current and future plans.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Hot-path profiler state (call counts, specialization).
    pub fn hotpath(&self) -> &crate::hotpath::HotPath {
        self.interp.hotpath()
    }

    fn plan_context(&self) -> Arc<ExecContext> {
        ExecContext::new(
            self.timeout.map(|t| Instant::now() + t),
            Arc::clone(&self.cancel),
            self.strict,
            self.engine.config.memory_budget_bytes,
            self.engine.config.poll_rows,
        )
    }

    /// Execute a source string; statements run in order and the last
    /// outcome is returned.
    pub fn execute(&mut self, src: &str) -> Result<Outcome> {
        let query_id = Uuid::new_v4().to_string();
        let _span = QuerySpan::enter(&query_id);
        let statements = parse_program(src)?;
        if statements.is_empty() {
            return Err(EngineError::syntax("empty input", 1, 1));
        }
        let mut last = Outcome::default();
        for stmt in &statements {
            last = self.execute_statement(stmt)?;
        }
        Ok(last)
    }

    fn execute_statement(&mut self, stmt: &Statement) -> Result<Outcome> {
        match stmt {
            Statement::Select(select) => self.execute_select(select),
            Statement::Insert { table, columns, rows } => {
                self.execute_insert(table, columns.as_deref(), rows)
            }
            Statement::Update { table, assignments, where_clause } => {
                let outcome = self.engine.update_rows(
                    table,
                    assignments,
                    where_clause.as_ref(),
                    self.strict,
                )?;
                if outcome.commit.is_some() {
                    self.refresh_dependents(table)?;
                }
                Ok(Outcome {
                    rows_affected: outcome.rows_affected,
                    commit: outcome.commit,
                    ..Outcome::default()
                })
            }
            Statement::Delete { table, where_clause } => {
                let outcome =
                    self.engine.delete_rows(table, where_clause.as_ref(), self.strict)?;
                if outcome.commit.is_some() {
                    self.refresh_dependents(table)?;
                }
                Ok(Outcome {
                    rows_affected: outcome.rows_affected,
                    commit: outcome.commit,
                    ..Outcome::default()
                })
            }
            Statement::CreateTable { name, columns } => {
                let columns = columns
                    .iter()
                    .map(|c| {
                        let data_type = DataType::parse(&c.type_name).ok_or_else(|| {
                            EngineError::Catalog(format!("unknown type {}", c.type_name))
                        })?;
                        Ok(ColumnDef::new(c.name.clone(), data_type, c.nullable))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let commit = self.engine.create_table(name, columns)?;
                Ok(Outcome { commit: Some(commit), ..Outcome::default() })
            }
            Statement::CreateIndex { name, table, columns, using, unique } => {
                let kind = match using {
                    Some(kind_name) => IndexKind::parse(kind_name).ok_or_else(|| {
                        EngineError::Catalog(format!("unknown index kind {kind_name}"))
                    })?,
                    None => IndexKind::BTree,
                };
                let def = IndexDef {
                    name: name.clone(),
                    columns: columns.clone(),
                    kind,
                    unique: *unique,
                };
                self.engine.catalog.add_index(table, def)?;
                self.engine.rebuild_index(table, name)?;
                let commit =
                    self.engine.commit_ddl(&format!("create index {name} on {table}"), vec![])?;
                Ok(Outcome { commit: Some(commit), ..Outcome::default() })
            }
            Statement::CreateView { name, query } => self.execute_create_view(name, query),
            Statement::RefreshView { name } => self.execute_refresh_view(name),
            Statement::CreateSnapshot { name } => {
                let head = self.engine.timeline.resolve("HEAD")?;
                self.engine.timeline.snapshot(name, head)?;
                Ok(Outcome { commit: Some(head), ..Outcome::default() })
            }
            Statement::Drop { kind, name } => self.execute_drop(*kind, name),
            Statement::ShowTables => self.execute_show_tables(),
            Statement::Describe { table } => self.execute_describe(table),
            Statement::Analyze { table } => self.execute_analyze(table),
            Statement::FunctionDef { .. } | Statement::Let { .. } | Statement::Expr(_) => {
                let value = self.interp.eval_statement(stmt)?;
                Ok(Outcome { value: Some(value), ..Outcome::default() })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    fn execute_insert(
        &mut self,
        table: &str,
        columns: Option<&[String]>,
        rows: &[Vec<Expr>],
    ) -> Result<Outcome> {
        let mut evaluated = Vec::with_capacity(rows.len());
        for row in rows {
            let mut out = Vec::with_capacity(row.len());
            for expr in row {
                // VALUES expressions evaluate in the session's global scope,
                // so LET bindings and functions are usable here.
                let globals = self.interp.globals.clone();
                let value = self.interp.eval_expr(expr, &globals)?;
                let datum = value.to_datum().ok_or_else(|| {
                    EngineError::Execution(format!(
                        "{} cannot be stored in a table",
                        value.type_name()
                    ))
                })?;
                out.push(datum);
            }
            evaluated.push(out);
        }
        let outcome = self.engine.insert_rows(table, columns, evaluated)?;
        self.refresh_dependents(table)?;
        Ok(Outcome {
            rows_affected: outcome.rows_affected,
            commit: outcome.commit,
            ..Outcome::default()
        })
    }

    /// Refresh every materialized view depending on `table`.
    fn refresh_dependents(&mut self, table: &str) -> Result<()> {
        for view in self.engine.catalog.views_depending_on(table) {
            self.materialize_view(&view)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Materialized views
    // -----------------------------------------------------------------------

    fn execute_create_view(&mut self, name: &str, query: &SelectStmt) -> Result<Outcome> {
        if self.engine.catalog.get_view(name).is_some() {
            return Err(EngineError::Catalog(format!("view {name} already exists")));
        }
        if query.from.snapshot.is_some() {
            return Err(EngineError::Planner(
                "materialized views cannot bind a snapshot".to_string(),
            ));
        }
        let normalized = normalize_select(query);
        let result = self.execute_select(query)?;
        let backing_table = format!("__view__{name}");
        let columns = infer_view_columns(&result.columns, &result.rows);
        self.engine.create_table(&backing_table, columns)?;
        if !result.rows.is_empty() {
            self.engine.insert_rows(&backing_table, None, result.rows)?;
        }
        let mut dependency_tables = vec![query.from.table.clone()];
        if let Some(join_clause) = &query.join {
            dependency_tables.push(join_clause.source.table.clone());
        }
        self.engine.catalog.register_view(ViewDef {
            name: name.to_string(),
            source_query: normalized,
            backing_table,
            dependency_tables,
        })?;
        Ok(Outcome::default())
    }

    fn execute_refresh_view(&mut self, name: &str) -> Result<Outcome> {
        let view = self
            .engine
            .catalog
            .get_view(name)
            .ok_or_else(|| EngineError::Catalog(format!("unknown view {name}")))?;
        let changed = self.materialize_view(&view)?;
        Ok(Outcome { rows_affected: u64::from(changed), ..Outcome::default() })
    }

    /// Re-execute a view's source query and replace the backing table when
    /// the result set changed. Idempotent when no dependency advanced.
    fn materialize_view(&mut self, view: &ViewDef) -> Result<bool> {
        let Statement::Select(source) = crate::lang::parser::parse_statement(&view.source_query)?
        else {
            return Err(EngineError::Internal(format!(
                "view {} source is not a SELECT",
                view.name
            )));
        };
        let result = self.execute_select_inner(&source, false)?;
        self.engine.replace_table_rows(&view.backing_table, result.rows)
    }

    // -----------------------------------------------------------------------
    // DDL helpers
    // -----------------------------------------------------------------------

    fn execute_drop(&mut self, kind: DropKind, name: &str) -> Result<Outcome> {
        match kind {
            DropKind::Table => {
                let schema = self.engine.catalog.schema();
                let table = schema.get_table(name)?;
                for index in &table.indexes {
                    self.engine.index_store.delete(name, &index.name)?;
                }
                self.engine.catalog.drop_table(name)?;
                self.engine.cache.invalidate(name);
                let commit = self.engine.commit_ddl(&format!("drop table {name}"), vec![])?;
                Ok(Outcome { commit: Some(commit), ..Outcome::default() })
            }
            DropKind::Index => {
                let table = self.engine.catalog.table_of_index(name)?;
                self.engine.catalog.drop_index(&table, name)?;
                self.engine.index_store.delete(&table, name)?;
                let commit = self.engine.commit_ddl(&format!("drop index {name}"), vec![])?;
                Ok(Outcome { commit: Some(commit), ..Outcome::default() })
            }
            DropKind::View => {
                let view = self
                    .engine
                    .catalog
                    .get_view(name)
                    .ok_or_else(|| EngineError::Catalog(format!("unknown view {name}")))?;
                self.engine.catalog.drop_view(name)?;
                self.engine.cache.invalidate(&view.backing_table);
                self.engine.catalog.drop_table(&view.backing_table)?;
                let commit = self.engine.commit_ddl(&format!("drop view {name}"), vec![])?;
                Ok(Outcome { commit: Some(commit), ..Outcome::default() })
            }
            DropKind::Snapshot => {
                self.engine.timeline.drop_snapshot(name)?;
                Ok(Outcome::default())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Introspection (structured rows; rendering is the caller's concern)
    // -----------------------------------------------------------------------

    fn execute_show_tables(&self) -> Result<Outcome> {
        let schema = self.engine.catalog.schema();
        let mut rows: Vec<Row> = Vec::new();
        for table in &schema.tables {
            if table.name.starts_with("__view__") {
                continue;
            }
            rows.push(vec![
                Datum::Str(table.name.clone()),
                Datum::Str("table".to_string()),
                Datum::Int(table.columns.len() as i64),
            ]);
        }
        for view in &schema.views {
            rows.push(vec![
                Datum::Str(view.name.clone()),
                Datum::Str("materialized view".to_string()),
                Datum::Null,
            ]);
        }
        Ok(Outcome::rows_only(
            vec!["name".into(), "kind".into(), "columns".into()],
            rows,
        ))
    }

    fn execute_describe(&self, table: &str) -> Result<Outcome> {
        let schema = self.engine.catalog.schema();
        let table = schema.get_table(table)?;
        let rows = table
            .columns
            .iter()
            .map(|c| {
                vec![
                    Datum::Str(c.name.clone()),
                    Datum::Str(c.data_type.name().to_string()),
                    Datum::Bool(c.nullable),
                ]
            })
            .collect();
        Ok(Outcome::rows_only(
            vec!["column".into(), "type".into(), "nullable".into()],
            rows,
        ))
    }

    fn execute_analyze(&self, table_name: &str) -> Result<Outcome> {
        let schema = self.engine.catalog.schema();
        let table = schema.get_table(table_name)?;
        let set = self.engine.table_set(table_name, None)?;

        let mut row_count = 0u64;
        let mut nulls = vec![0u64; table.columns.len()];
        let mut mins: Vec<Option<Datum>> = vec![None; table.columns.len()];
        let mut maxs: Vec<Option<Datum>> = vec![None; table.columns.len()];
        for stripe in &set.stripes {
            let key = varve_store::stripe_key(table_name, stripe);
            let footer =
                varve_store::read_stripe_footer(&self.engine.store.get(&key)?, Some(stripe))?;
            row_count += footer.row_count();
            for (i, stats) in footer.columns.iter().enumerate() {
                nulls[i] += stats.null_count;
                if let Some(min) = &stats.min {
                    if mins[i].as_ref().is_none_or(|m| min.total_cmp(m).is_lt()) {
                        mins[i] = Some(min.clone());
                    }
                }
                if let Some(max) = &stats.max {
                    if maxs[i].as_ref().is_none_or(|m| max.total_cmp(m).is_gt()) {
                        maxs[i] = Some(max.clone());
                    }
                }
            }
        }
        let rows = table
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| {
                vec![
                    Datum::Str(c.name.clone()),
                    Datum::Int(row_count as i64),
                    Datum::Int(nulls[i] as i64),
                    mins[i].clone().unwrap_or(Datum::Null),
                    maxs[i].clone().unwrap_or(Datum::Null),
                ]
            })
            .collect();
        Ok(Outcome::rows_only(
            vec!["column".into(), "rows".into(), "nulls".into(), "min".into(), "max".into()],
            rows,
        ))
    }

    // -----------------------------------------------------------------------
    // SELECT pipeline
    // -----------------------------------------------------------------------

    fn execute_select(&mut self, stmt: &SelectStmt) -> Result<Outcome> {
        self.execute_select_inner(stmt, true)
    }

    fn execute_select_inner(
        &mut self,
        stmt: &SelectStmt,
        allow_view_substitution: bool,
    ) -> Result<Outcome> {
        let normalized = normalize_select(stmt);

        // Materialized-view substitution: an exact normalized match rewrites
        // to a scan of the view's backing table. A view refreshing itself
        // must bypass this, or it would read its own stale rows.
        if allow_view_substitution && stmt.from.snapshot.is_none() {
            if let Some(view) = self.engine.catalog.find_view_by_query(&normalized) {
                return self.scan_view_backing(&view);
            }
        }

        let snapshot = match &stmt.from.snapshot {
            Some(reference) => Some(self.engine.timeline.resolve(reference)?),
            None => None,
        };
        let (table_def, physical) = self.resolve_from(&stmt.from)?;

        let conditions = stmt
            .where_clause
            .as_ref()
            .map(|w| extract_conditions(w))
            .unwrap_or_default();
        let predicates = prune_predicates(&conditions, &table_def);

        let set = self.engine.table_set(&physical, snapshot)?;
        let set_root = set.merkle_root();
        let stats = self.engine.table_stats(&physical, &set, &predicates)?;
        let index_metas = self.engine.index_metas(&table_def, set_root);

        let window_exprs = collect_window_aggregates(stmt);
        let agg_exprs = collect_plain_aggregates(stmt);
        let is_aggregate = !stmt.group_by.is_empty() || !agg_exprs.is_empty();
        if is_aggregate && !window_exprs.is_empty() {
            return Err(EngineError::Planner(
                "window aggregates cannot mix with grouped aggregates".to_string(),
            ));
        }

        let plan = plan_table_access(
            &conditions,
            &PlannerInputs {
                table: &physical,
                stats,
                indexes: &index_metas,
                chunk_independent: window_exprs.is_empty() && stmt.join.is_none(),
                config: &self.engine.config,
            },
        );
        let fingerprint = plan.fingerprint(&normalized);
        obs::emit_plan_selected(&fingerprint.short(), plan.op.tag(), plan.cost, plan.degree);

        // The cache only serves HEAD-bound plans: entries validate their
        // dependency roots against the current HEAD resolution.
        if snapshot.is_none() {
            let engine = Arc::clone(&self.engine);
            if let Some(entry) =
                self.engine.cache.get(fingerprint, |t| engine.current_root(t))?
            {
                return Ok(Outcome {
                    columns: entry.columns.clone(),
                    rows: entry.rows.clone(),
                    plan: Some(plan),
                    cache_hit: true,
                    ..Outcome::default()
                });
            }
        }

        let ctx = self.plan_context();
        let mut stream = self.build_access_stream(&plan, &table_def, &set, &predicates, &ctx)?;

        // Join (inner, single).
        let mut dep_tables = vec![physical.clone()];
        if let Some(join_clause) = &stmt.join {
            let right_snapshot = match &join_clause.source.snapshot {
                Some(reference) => Some(self.engine.timeline.resolve(reference)?),
                None => None,
            };
            let (right_def, right_physical) = self.resolve_from(&join_clause.source)?;
            let right_set = self.engine.table_set(&right_physical, right_snapshot)?;
            dep_tables.push(right_physical.clone());

            let left_rows = collect_rows(stream.as_mut())?;
            let left_cols = qualify_columns(&stmt.from.table, stream.columns());

            let mut right_scan = TableScan::new(
                Arc::clone(&self.engine.store),
                &right_def,
                &right_set,
                vec![],
                self.engine.quarantine.clone(),
                Arc::clone(&ctx),
            );
            let right_rows = collect_rows(&mut right_scan)?;
            let right_cols = qualify_columns(
                &join_clause.source.table,
                &right_def.columns.iter().map(|c| c.name.clone()).collect::<Vec<_>>(),
            );

            let build_left = build_side_is_left(left_rows.len() as u64, right_rows.len() as u64);
            let mut left_stream = VecStream::new(left_cols, left_rows);
            let mut right_stream = VecStream::new(right_cols, right_rows);
            stream = Box::new(join(
                &mut left_stream,
                &mut right_stream,
                &join_clause.on,
                build_left,
                &ctx,
            )?);
        }

        if let Some(where_clause) = &stmt.where_clause {
            stream = Box::new(FilterStream::new(stream, where_clause.clone(), Arc::clone(&ctx)));
        }

        // Aggregation or window augmentation rewrite item/having/order
        // expressions against a synthetic schema.
        let items: Vec<(Expr, String)>;
        let mut order_keys: Vec<(Expr, bool)> =
            stmt.order_by.iter().map(|k| (k.expr.clone(), k.ascending)).collect();

        if is_aggregate {
            let specs: Vec<AggSpec> = agg_exprs
                .iter()
                .map(|e| match e {
                    Expr::Aggregate { func, arg, .. } => AggSpec {
                        func: *func,
                        arg: arg.as_ref().map(|a| (**a).clone()),
                    },
                    _ => unreachable!("collector only yields aggregates"),
                })
                .collect();
            let mut groups =
                group_aggregate(stream.as_mut(), &stmt.group_by, &specs, &ctx)?;
            if groups.is_empty() && stmt.group_by.is_empty() {
                // Global aggregate over zero rows: one row of identities.
                groups.push((
                    Vec::new(),
                    specs.iter().map(|s| AggState::identity(s.func).finalize()).collect(),
                ));
            }

            let mut syn_cols: Vec<String> = Vec::new();
            let mut rewrites: Vec<(Expr, String)> = Vec::new();
            for group_expr in &stmt.group_by {
                let label = normalize_expr(group_expr);
                syn_cols.push(label.clone());
                rewrites.push((group_expr.clone(), label));
            }
            for agg_expr in &agg_exprs {
                let label = normalize_expr(agg_expr);
                syn_cols.push(label.clone());
                rewrites.push((agg_expr.clone(), label));
            }
            let syn_rows: Vec<Row> = groups
                .into_iter()
                .map(|(mut key, aggs)| {
                    key.extend(aggs);
                    key
                })
                .collect();
            stream = Box::new(VecStream::new(syn_cols, syn_rows));

            if let Some(having) = &stmt.having {
                let rewritten = rewrite_expr(having, &rewrites);
                stream = Box::new(FilterStream::new(stream, rewritten, Arc::clone(&ctx)));
            }
            items = self.resolve_items(stmt, stream.columns(), Some(&rewrites))?;
            order_keys = order_keys
                .into_iter()
                .map(|(e, asc)| (rewrite_expr(&e, &rewrites), asc))
                .collect();
        } else if !window_exprs.is_empty() {
            // Running aggregates over the stream order, frame UNBOUNDED
            // PRECEDING AND CURRENT ROW; partition = the whole input.
            let input_cols = stream.columns().to_vec();
            let mut rewrites: Vec<(Expr, String)> = Vec::new();
            let mut states: Vec<(AggSpec, AggState)> = Vec::new();
            for expr in &window_exprs {
                let Expr::Aggregate { func, arg, .. } = expr else { unreachable!() };
                let spec =
                    AggSpec { func: *func, arg: arg.as_ref().map(|a| (**a).clone()) };
                let state = AggState::identity(spec.func);
                rewrites.push((expr.clone(), normalize_expr(expr)));
                states.push((spec, state));
            }
            let mut augmented_cols = input_cols.clone();
            augmented_cols.extend(rewrites.iter().map(|(_, label)| label.clone()));
            let mut augmented_rows: Vec<Row> = Vec::new();
            while let Some(row) = stream.next_row()? {
                ctx.tick()?;
                let mut out = row.clone();
                for (spec, state) in &mut states {
                    match &spec.arg {
                        Some(arg) => {
                            let v = eval_row_expr(arg, &input_cols, &row, ctx.strict)?;
                            state.update(Some(&v))?;
                        }
                        None => state.update(None)?,
                    }
                    out.push(state.finalize());
                }
                augmented_rows.push(out);
            }
            stream = Box::new(VecStream::new(augmented_cols, augmented_rows));
            items = self.resolve_items(stmt, stream.columns(), Some(&rewrites))?;
            order_keys = order_keys
                .into_iter()
                .map(|(e, asc)| (rewrite_expr(&e, &rewrites), asc))
                .collect();
        } else {
            items = self.resolve_items(stmt, stream.columns(), None)?;
        }

        // ORDER BY runs before projection so keys may reference columns the
        // projection drops; the final merge of spilled runs is external.
        if !order_keys.is_empty() {
            stream = Box::new(OrderStream::new(stream, order_keys, Arc::clone(&ctx)));
        }
        stream = Box::new(ProjectStream::new(stream, items, Arc::clone(&ctx)));
        if stmt.distinct {
            stream = Box::new(DistinctStream::new(stream, Arc::clone(&ctx)));
        }
        if let Some(limit) = stmt.limit {
            stream = Box::new(LimitStream::new(stream, limit));
        }

        let columns = stream.columns().to_vec();
        let rows = collect_rows(stream.as_mut())?;

        if snapshot.is_none() {
            let mut snapshot_roots = BTreeMap::new();
            for table in &dep_tables {
                snapshot_roots.insert(table.clone(), self.engine.current_root(table)?);
            }
            let bytes = estimate_result_bytes(&rows);
            self.engine.cache.put(
                fingerprint,
                CacheEntry {
                    columns: columns.clone(),
                    rows: rows.clone(),
                    dep_tables,
                    snapshot_roots,
                    bytes,
                },
            );
        }

        Ok(Outcome { columns, rows, plan: Some(plan), ..Outcome::default() })
    }

    /// Resolve FROM: a base table, or a view referenced by name (reads go
    /// to its backing table).
    fn resolve_from(&self, source: &TableSource) -> Result<(varve_store::TableDef, String)> {
        let schema = self.engine.catalog.schema();
        match schema.get_table(&source.table) {
            Ok(table) => Ok((table.clone(), source.table.clone())),
            Err(e) => match self.engine.catalog.get_view(&source.table) {
                Some(view) => {
                    let table = schema.get_table(&view.backing_table)?;
                    Ok((table.clone(), view.backing_table))
                }
                None => Err(e.into()),
            },
        }
    }

    fn scan_view_backing(&mut self, view: &ViewDef) -> Result<Outcome> {
        let schema = self.engine.catalog.schema();
        let table = schema.get_table(&view.backing_table)?.clone();
        let set = self.engine.table_set(&view.backing_table, None)?;
        let stats = self.engine.table_stats(&view.backing_table, &set, &[])?;
        let ctx = self.plan_context();
        let mut scan = TableScan::new(
            Arc::clone(&self.engine.store),
            &table,
            &set,
            vec![],
            self.engine.quarantine.clone(),
            ctx,
        );
        let rows = collect_rows(&mut scan)?;
        let plan = QueryPlan {
            op: AccessOp::ViewScan { view: view.name.clone() },
            table: view.backing_table.clone(),
            conditions: vec![],
            degree: 1,
            cost: stats.row_count as f64
                * (self.engine.config.io_cost_per_row + self.engine.config.cpu_cost_per_row),
            estimated_rows: stats.row_count,
        };
        obs::emit_plan_selected("-", plan.op.tag(), plan.cost, 1);
        Ok(Outcome {
            columns: table.columns.iter().map(|c| c.name.clone()).collect(),
            rows,
            plan: Some(plan),
            ..Outcome::default()
        })
    }

    fn build_access_stream(
        &self,
        plan: &QueryPlan,
        table: &varve_store::TableDef,
        set: &StripeSet,
        predicates: &[varve_store::PrunePredicate],
        ctx: &Arc<ExecContext>,
    ) -> Result<Box<dyn RowStream>> {
        match &plan.op {
            AccessOp::SeqScan | AccessOp::ViewScan { .. } => Ok(Box::new(TableScan::new(
                Arc::clone(&self.engine.store),
                table,
                set,
                predicates.to_vec(),
                self.engine.quarantine.clone(),
                Arc::clone(ctx),
            ))),
            AccessOp::ParallelScan => Ok(Box::new(ParallelScan::run(
                Arc::clone(&self.engine.store),
                table,
                set,
                predicates.to_vec(),
                plan.degree,
                self.engine.quarantine.clone(),
                Arc::clone(ctx),
            )?)),
            AccessOp::IndexScan { index } => {
                let loaded = self.engine.index_store.load(&table.name, index)?;
                let def = &loaded.def;
                let leading = &def.columns[0];
                // Equality keys on the leading column drive the lookup; a
                // range on a btree walks the ordered entries.
                let eq_value = plan
                    .conditions
                    .iter()
                    .find(|c| &c.column == leading && c.op == CmpOp::Eq)
                    .map(|c| c.value.clone());
                let locators = match (&eq_value, def.kind) {
                    (Some(value), IndexKind::Bitmap) => {
                        loaded.bitmap_intersect(&[(0, value.clone())])
                    }
                    (Some(value), IndexKind::Bloom) => {
                        // Membership pre-filter only: a negative proves
                        // absence, a positive falls back to scanning.
                        if !loaded.may_contain(std::slice::from_ref(value)) {
                            return Ok(Box::new(VecStream::new(
                                table.columns.iter().map(|c| c.name.clone()).collect(),
                                vec![],
                            )));
                        }
                        return Ok(Box::new(TableScan::new(
                            Arc::clone(&self.engine.store),
                            table,
                            set,
                            predicates.to_vec(),
                            self.engine.quarantine.clone(),
                            Arc::clone(ctx),
                        )));
                    }
                    (Some(value), IndexKind::Hash) => loaded.lookup_eq(std::slice::from_ref(value)),
                    (Some(value), IndexKind::BTree) => {
                        if def.columns.len() == 1 {
                            loaded.lookup_eq(std::slice::from_ref(value))
                        } else {
                            loaded.lookup_prefix(std::slice::from_ref(value))
                        }
                    }
                    (None, IndexKind::BTree) => {
                        let mut lo: Option<Vec<Datum>> = None;
                        let mut hi: Option<Vec<Datum>> = None;
                        let mut lo_inclusive = true;
                        let mut hi_inclusive = true;
                        for cond in
                            plan.conditions.iter().filter(|c| &c.column == leading)
                        {
                            match cond.op {
                                CmpOp::Gt => {
                                    lo = Some(vec![cond.value.clone()]);
                                    lo_inclusive = false;
                                }
                                CmpOp::Ge => lo = Some(vec![cond.value.clone()]),
                                CmpOp::Lt => {
                                    hi = Some(vec![cond.value.clone()]);
                                    hi_inclusive = false;
                                }
                                CmpOp::Le => hi = Some(vec![cond.value.clone()]),
                                CmpOp::Eq => {}
                            }
                        }
                        loaded.lookup_range(
                            lo.as_deref(),
                            hi.as_deref(),
                            lo_inclusive,
                            hi_inclusive,
                        )
                    }
                    _ => {
                        return Err(EngineError::Planner(format!(
                            "index {index} cannot serve this predicate"
                        )))
                    }
                };
                Ok(Box::new(IndexScan::new(
                    Arc::clone(&self.engine.store),
                    table,
                    group_locators(&locators, set),
                    self.engine.quarantine.clone(),
                    Arc::clone(ctx),
                )))
            }
        }
    }

    /// Resolve SELECT items into projection expressions and output names.
    fn resolve_items(
        &self,
        stmt: &SelectStmt,
        stream_columns: &[String],
        rewrites: Option<&[(Expr, String)]>,
    ) -> Result<Vec<(Expr, String)>> {
        let mut out = Vec::new();
        for item in &stmt.items {
            match item {
                SelectItem::Star => {
                    if rewrites.is_some() {
                        return Err(EngineError::Planner(
                            "SELECT * is not valid in an aggregate query".to_string(),
                        ));
                    }
                    for column in stream_columns {
                        let name = column.rsplit('.').next().unwrap_or(column).to_string();
                        out.push((Expr::Ident(column.clone()), name));
                    }
                }
                SelectItem::Expr { expr, alias } => {
                    let resolved = match rewrites {
                        Some(map) => rewrite_expr(expr, map),
                        None => expr.clone(),
                    };
                    let name = alias.clone().unwrap_or_else(|| normalize_expr(expr));
                    out.push((resolved, name));
                }
            }
        }
        Ok(out)
    }
}

/// Column definitions for a view's backing table, inferred from the
/// materialized result.
fn infer_view_columns(columns: &[String], rows: &[Row]) -> Vec<ColumnDef> {
    columns
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let data_type = rows
                .iter()
                .filter_map(|r| r.get(i).and_then(Datum::data_type))
                .next()
                .unwrap_or(DataType::Str);
            ColumnDef::new(name.clone(), data_type, true)
        })
        .collect()
}

/// Collect `@`-window aggregates appearing in the select items.
fn collect_window_aggregates(stmt: &SelectStmt) -> Vec<Expr> {
    let mut out = Vec::new();
    for item in &stmt.items {
        if let SelectItem::Expr { expr, .. } = item {
            collect_aggregates_into(expr, true, &mut out);
        }
    }
    out
}

/// Collect plain aggregates from items and HAVING.
fn collect_plain_aggregates(stmt: &SelectStmt) -> Vec<Expr> {
    let mut out = Vec::new();
    for item in &stmt.items {
        if let SelectItem::Expr { expr, .. } = item {
            collect_aggregates_into(expr, false, &mut out);
        }
    }
    if let Some(having) = &stmt.having {
        collect_aggregates_into(having, false, &mut out);
    }
    out
}

fn collect_aggregates_into(expr: &Expr, window: bool, out: &mut Vec<Expr>) {
    match expr {
        Expr::Aggregate { window: w, .. } => {
            if *w == window && !out.contains(expr) {
                out.push(expr.clone());
            }
        }
        Expr::Unary { expr: inner, .. } | Expr::Cast { expr: inner, .. } => {
            collect_aggregates_into(inner, window, out)
        }
        Expr::Binary { lhs, rhs, .. } => {
            collect_aggregates_into(lhs, window, out);
            collect_aggregates_into(rhs, window, out);
        }
        Expr::Call { args, .. } | Expr::List(args) => {
            for arg in args {
                collect_aggregates_into(arg, window, out);
            }
        }
        Expr::Field(inner, _) | Expr::IndexAt(inner, _) => {
            collect_aggregates_into(inner, window, out)
        }
        _ => {}
    }
}

/// Replace any subexpression equal to a rewrite key with a column
/// reference to its label.
fn rewrite_expr(expr: &Expr, rewrites: &[(Expr, String)]) -> Expr {
    if let Some((_, label)) = rewrites.iter().find(|(key, _)| key == expr) {
        return Expr::Ident(label.clone());
    }
    match expr {
        Expr::Unary { op, expr: inner } => Expr::Unary {
            op: *op,
            expr: Box::new(rewrite_expr(inner, rewrites)),
        },
        Expr::Binary { op, lhs, rhs } => Expr::Binary {
            op: *op,
            lhs: Box::new(rewrite_expr(lhs, rewrites)),
            rhs: Box::new(rewrite_expr(rhs, rewrites)),
        },
        Expr::Cast { expr: inner, ty } => Expr::Cast {
            expr: Box::new(rewrite_expr(inner, rewrites)),
            ty: ty.clone(),
        },
        Expr::Call { name, args } => Expr::Call {
            name: name.clone(),
            args: args.iter().map(|a| rewrite_expr(a, rewrites)).collect(),
        },
        Expr::List(items) => {
            Expr::List(items.iter().map(|i| rewrite_expr(i, rewrites)).collect())
        }
        Expr::Field(inner, name) => {
            Expr::Field(Box::new(rewrite_expr(inner, rewrites)), name.clone())
        }
        Expr::IndexAt(inner, index) => Expr::IndexAt(
            Box::new(rewrite_expr(inner, rewrites)),
            Box::new(rewrite_expr(index, rewrites)),
        ),
        other => other.clone(),
    }
}
