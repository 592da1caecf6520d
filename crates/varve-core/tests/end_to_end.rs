//! End-to-end scenarios over a full database: DDL, writes, time travel,
//! materialized views, hot-path compilation, and integrity failures.

use varve_core::{AccessOp, Database, Datum, EngineError, Value};

fn db() -> Database {
    Database::ephemeral().unwrap()
}

fn setup_t(db: &Database) -> varve_core::Session {
    let mut session = db.session();
    session.execute("CREATE TABLE t (id int NOT NULL, v int)").unwrap();
    session
        .execute("INSERT INTO t (id, v) VALUES (1, 10), (2, 20), (3, 30)")
        .unwrap();
    session
}

#[test]
fn sum_with_predicate() {
    let db = db();
    let mut session = setup_t(&db);
    let outcome = session.execute("SELECT SUM(v) FROM t WHERE id > 1").unwrap();
    assert_eq!(outcome.columns, vec!["SUM(v)".to_string()]);
    assert_eq!(outcome.rows, vec![vec![Datum::Int(50)]]);
}

#[test]
fn index_changes_access_path_and_lowers_cost() {
    let db = db();
    let mut session = setup_t(&db);

    let before = session.execute("SELECT v FROM t WHERE id = 2").unwrap();
    let before_plan = before.plan.clone().unwrap();
    assert_eq!(before_plan.op, AccessOp::SeqScan);
    assert_eq!(before.rows, vec![vec![Datum::Int(20)]]);

    session.execute("CREATE INDEX t_id ON t (id) USING btree").unwrap();

    let after = session.execute("SELECT v FROM t WHERE id = 2").unwrap();
    let after_plan = after.plan.clone().unwrap();
    assert_eq!(after_plan.op, AccessOp::IndexScan { index: "t_id".into() });
    assert_eq!(after.rows, vec![vec![Datum::Int(20)]]);
    assert!(
        after_plan.cost < before_plan.cost,
        "index scan {} should beat full scan {}",
        after_plan.cost,
        before_plan.cost
    );
}

#[test]
fn snapshot_time_travel_reads_history() {
    let db = db();
    let mut session = setup_t(&db);
    session.execute("CREATE SNAPSHOT s1").unwrap();
    session.execute("UPDATE t SET v = 99 WHERE id = 1").unwrap();

    let old = session.execute("SELECT v FROM t@s1 WHERE id = 1").unwrap();
    assert_eq!(old.rows, vec![vec![Datum::Int(10)]]);

    let new = session.execute("SELECT v FROM t WHERE id = 1").unwrap();
    assert_eq!(new.rows, vec![vec![Datum::Int(99)]]);

    // The snapshot stays stable across further writes (I4).
    session.execute("DELETE FROM t WHERE id = 2").unwrap();
    let still_old = session.execute("SELECT v FROM t@s1 WHERE id = 2").unwrap();
    assert_eq!(still_old.rows, vec![vec![Datum::Int(20)]]);
}

#[test]
fn materialized_view_substitution_and_refresh() {
    let db = db();
    let mut session = setup_t(&db);
    session
        .execute("CREATE MATERIALIZED VIEW mv AS SELECT id, v FROM t WHERE v >= 20")
        .unwrap();

    // The identical query rewrites to a view scan.
    let substituted = session.execute("SELECT id, v FROM t WHERE v >= 20").unwrap();
    assert_eq!(substituted.plan.unwrap().op, AccessOp::ViewScan { view: "mv".into() });
    assert_eq!(substituted.rows.len(), 2);

    // Querying the view by name works too.
    let direct = session.execute("SELECT * FROM mv").unwrap();
    assert_eq!(direct.rows.len(), 2);

    session.execute("DELETE FROM t WHERE id = 3").unwrap();
    session.execute("REFRESH MATERIALIZED VIEW mv").unwrap();
    let refreshed = session.execute("SELECT * FROM mv").unwrap();
    assert_eq!(refreshed.rows, vec![vec![Datum::Int(2), Datum::Int(20)]]);

    // Refresh with no dependency change is a no-op (R3).
    let outcome = session.execute("REFRESH MATERIALIZED VIEW mv").unwrap();
    assert_eq!(outcome.rows_affected, 0);
}

#[test]
fn hot_path_compiler_agrees_with_interpreter() {
    let db = db();
    let mut session = db.session();
    session
        .execute(
            "FUNCTION fib(n) { MATCH n { case 0 => 0, case 1 => 1, \
             case _ => fib(n - 1) + fib(n - 2) } }",
        )
        .unwrap();

    for _ in 0..10 {
        session.execute("fib(8)").unwrap();
    }
    assert!(session.hotpath().is_specialized("fib"));

    let expected = [0, 1, 1, 2, 3, 5, 8, 13, 21, 34, 55, 89, 144, 233, 377, 610];
    for (n, want) in expected.iter().enumerate() {
        let outcome = session.execute(&format!("fib({n})")).unwrap();
        let Some(Value::Number(got)) = outcome.value else { panic!("fib({n}) not a number") };
        assert_eq!(got as i64, *want, "fib({n})");
    }
}

#[test]
fn corruption_is_detected_isolated_and_reported() {
    let db = db();
    let mut session = setup_t(&db);
    session.execute("CREATE TABLE u (id int NOT NULL)").unwrap();
    session.execute("INSERT INTO u (id) VALUES (7)").unwrap();

    // Flip one byte in t's only stripe.
    let engine = db.engine();
    let set = engine.table_set("t", None).unwrap();
    let key = varve_store::stripe_key("t", &set.stripes[0]);
    let mut bytes = engine.store.get(&key).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;
    engine.store.put(&key, &bytes).unwrap();

    let report = db.verify().unwrap();
    assert!(!report.ok());
    let issue = report.first_divergence.unwrap();
    assert!(issue.field.contains("stripe"));

    // Reads of the damaged table fail with Integrity...
    let err = session.execute("SELECT * FROM t").unwrap_err();
    assert!(matches!(err, EngineError::Integrity(_)));
    // ...while other tables stay queryable.
    let ok = session.execute("SELECT * FROM u").unwrap();
    assert_eq!(ok.rows, vec![vec![Datum::Int(7)]]);
}

#[test]
fn cache_hits_are_observationally_equivalent() {
    let db = db();
    let mut session = setup_t(&db);

    let first = session.execute("SELECT v FROM t WHERE id > 1").unwrap();
    assert!(!first.cache_hit);
    let second = session.execute("SELECT v FROM t WHERE id > 1").unwrap();
    assert!(second.cache_hit);
    assert_eq!(first.rows, second.rows);
    assert_eq!(first.columns, second.columns);

    // A write to the dependency table invalidates the entry.
    session.execute("INSERT INTO t (id, v) VALUES (4, 40)").unwrap();
    let third = session.execute("SELECT v FROM t WHERE id > 1").unwrap();
    assert!(!third.cache_hit);
    assert_eq!(third.rows.len(), 3);
}

#[test]
fn joins_group_by_having_order_limit() {
    let db = db();
    let mut session = db.session();
    session.execute("CREATE TABLE users (id int NOT NULL, name string)").unwrap();
    session.execute("CREATE TABLE orders (uid int NOT NULL, total int)").unwrap();
    session
        .execute("INSERT INTO users (id, name) VALUES (1, 'ada'), (2, 'grace'), (3, 'edsger')")
        .unwrap();
    session
        .execute(
            "INSERT INTO orders (uid, total) VALUES (1, 100), (2, 50), (1, 25), (3, 5), (3, 1)",
        )
        .unwrap();

    let joined = session
        .execute("SELECT name, total FROM users JOIN orders ON id = uid WHERE total > 10")
        .unwrap();
    assert_eq!(joined.rows.len(), 3);

    let grouped = session
        .execute(
            "SELECT uid, SUM(total) FROM orders GROUP BY uid \
             HAVING SUM(total) > 10 ORDER BY SUM(total) DESC LIMIT 2",
        )
        .unwrap();
    assert_eq!(
        grouped.rows,
        vec![
            vec![Datum::Int(1), Datum::Int(125)],
            vec![Datum::Int(2), Datum::Int(50)],
        ]
    );
}

#[test]
fn distinct_and_order() {
    let db = db();
    let mut session = db.session();
    session.execute("CREATE TABLE d (v int)").unwrap();
    session
        .execute("INSERT INTO d (v) VALUES (3), (1), (3), (2), (1)")
        .unwrap();
    let outcome = session.execute("SELECT DISTINCT v FROM d ORDER BY v").unwrap();
    assert_eq!(
        outcome.rows,
        vec![vec![Datum::Int(1)], vec![Datum::Int(2)], vec![Datum::Int(3)]]
    );
}

#[test]
fn window_aggregates_run_over_the_frame() {
    let db = db();
    let mut session = setup_t(&db);
    let outcome = session.execute("SELECT id, @SUM(v) FROM t ORDER BY id").unwrap();
    assert_eq!(
        outcome.rows,
        vec![
            vec![Datum::Int(1), Datum::Int(10)],
            vec![Datum::Int(2), Datum::Int(30)],
            vec![Datum::Int(3), Datum::Int(60)],
        ]
    );
}

#[test]
fn introspection_returns_structured_rows() {
    let db = db();
    let mut session = setup_t(&db);

    let tables = session.execute("SHOW TABLES").unwrap();
    assert_eq!(tables.columns, vec!["name", "kind", "columns"]);
    assert_eq!(tables.rows.len(), 1);
    assert_eq!(tables.rows[0][0], Datum::Str("t".into()));

    let described = session.execute("DESCRIBE t").unwrap();
    assert_eq!(described.rows.len(), 2);
    assert_eq!(described.rows[0][0], Datum::Str("id".into()));
    assert_eq!(described.rows[0][2], Datum::Bool(false));

    let analyzed = session.execute("ANALYZE t").unwrap();
    assert_eq!(analyzed.columns, vec!["column", "rows", "nulls", "min", "max"]);
    assert_eq!(analyzed.rows[0][1], Datum::Int(3));
    assert_eq!(analyzed.rows[1][3], Datum::Int(10));
    assert_eq!(analyzed.rows[1][4], Datum::Int(30));
}

#[test]
fn language_values_flow_into_inserts() -> anyhow::Result<()> {
    let db = db();
    let mut session = db.session();
    session.execute("CREATE TABLE t (id int NOT NULL, v int)")?;
    session.execute("LET base = 40")?;
    session.execute("INSERT INTO t (id, v) VALUES (1, base + 2)")?;
    let outcome = session.execute("SELECT v FROM t")?;
    assert_eq!(outcome.rows, vec![vec![Datum::Int(42)]]);
    Ok(())
}

#[test]
fn unknown_entities_are_catalog_errors() {
    let db = db();
    let mut session = db.session();
    let err = session.execute("SELECT * FROM ghost").unwrap_err();
    assert_eq!(err.code(), 11);
    let err = session.execute("DROP TABLE ghost").unwrap_err();
    assert_eq!(err.code(), 11);
}

#[test]
fn syntax_errors_carry_positions() {
    let db = db();
    let mut session = db.session();
    let err = session.execute("SELECT FROM t").unwrap_err();
    assert_eq!(err.code(), 10);
    let err = session.execute("MODULE m").unwrap_err();
    assert_eq!(err.code(), 10);
}

#[test]
fn unique_index_enforced_through_sql() {
    let db = db();
    let mut session = setup_t(&db);
    session.execute("CREATE UNIQUE INDEX t_pk ON t (id)").unwrap();
    let err = session
        .execute("INSERT INTO t (id, v) VALUES (2, 99)")
        .unwrap_err();
    assert_eq!(err.code(), 12);
    // The failed write changed nothing.
    let outcome = session.execute("SELECT v FROM t WHERE id = 2").unwrap();
    assert_eq!(outcome.rows, vec![vec![Datum::Int(20)]]);
}
