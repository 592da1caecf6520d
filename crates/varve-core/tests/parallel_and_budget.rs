//! Parallel scans, memory-budget spills, strict mode, and deadlines driven
//! through the public session API.

use std::time::Duration;

use varve_core::{AccessOp, Database, Datum, EngineConfig, EngineError};

fn bulk_db(parallel_threshold: u64) -> Database {
    let config = EngineConfig {
        stripe_rows: 100,
        chunk_rows: 100,
        parallel_row_threshold: parallel_threshold,
        max_parallel_degree: 4,
        ..EngineConfig::default()
    };
    let db = Database::ephemeral_with_config(config).unwrap();
    let mut session = db.session();
    session.execute("CREATE TABLE big (id int NOT NULL, grp int)").unwrap();
    // 1000 rows across 10 stripes.
    for chunk in 0..10 {
        let values: Vec<String> = (0..100)
            .map(|i| {
                let id = chunk * 100 + i;
                format!("({id}, {})", id % 7)
            })
            .collect();
        session
            .execute(&format!("INSERT INTO big (id, grp) VALUES {}", values.join(", ")))
            .unwrap();
    }
    db
}

#[test]
fn parallel_scan_selected_and_complete() {
    let db = bulk_db(500);
    let mut session = db.session();
    let outcome = session.execute("SELECT id FROM big ORDER BY id").unwrap();
    let plan = outcome.plan.unwrap();
    assert_eq!(plan.op, AccessOp::ParallelScan);
    assert_eq!(plan.degree, 4);
    assert_eq!(outcome.rows.len(), 1000);
    assert_eq!(outcome.rows[0], vec![Datum::Int(0)]);
    assert_eq!(outcome.rows[999], vec![Datum::Int(999)]);
}

#[test]
fn parallel_and_serial_agree() {
    let parallel = {
        let db = bulk_db(500);
        db.session().execute("SELECT id FROM big ORDER BY id").unwrap().rows
    };
    let serial = {
        let db = bulk_db(u64::MAX);
        db.session().execute("SELECT id FROM big ORDER BY id").unwrap().rows
    };
    assert_eq!(parallel, serial);
}

#[test]
fn group_by_spills_under_tiny_budget() {
    let config = EngineConfig {
        stripe_rows: 100,
        memory_budget_bytes: 512,
        ..EngineConfig::default()
    };
    let db = Database::ephemeral_with_config(config).unwrap();
    let mut session = db.session();
    session.execute("CREATE TABLE g (k int NOT NULL, v int)").unwrap();
    let values: Vec<String> = (0..500).map(|i| format!("({}, {i})", i % 50)).collect();
    session
        .execute(&format!("INSERT INTO g (k, v) VALUES {}", values.join(", ")))
        .unwrap();

    let outcome = session
        .execute("SELECT k, COUNT(*) FROM g GROUP BY k ORDER BY k")
        .unwrap();
    assert_eq!(outcome.rows.len(), 50);
    for row in &outcome.rows {
        assert_eq!(row[1], Datum::Int(10));
    }
}

#[test]
fn order_by_spills_and_stays_sorted() {
    let config = EngineConfig {
        stripe_rows: 100,
        memory_budget_bytes: 512,
        ..EngineConfig::default()
    };
    let db = Database::ephemeral_with_config(config).unwrap();
    let mut session = db.session();
    session.execute("CREATE TABLE s (v int)").unwrap();
    // Deterministic shuffle via an LCG.
    let mut state: u64 = 0xBEEF;
    let values: Vec<String> = (0..400)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            format!("({})", (state >> 33) % 1000)
        })
        .collect();
    session
        .execute(&format!("INSERT INTO s (v) VALUES {}", values.join(", ")))
        .unwrap();

    let outcome = session.execute("SELECT v FROM s ORDER BY v").unwrap();
    assert_eq!(outcome.rows.len(), 400);
    for pair in outcome.rows.windows(2) {
        assert!(pair[0][0] <= pair[1][0]);
    }
}

#[test]
fn strict_mode_promotes_row_errors() {
    let db = Database::ephemeral().unwrap();
    let mut session = db.session();
    session.execute("CREATE TABLE t (a int, b int)").unwrap();
    session.execute("INSERT INTO t (a, b) VALUES (1, 0)").unwrap();

    // Lenient: the bad division becomes NULL.
    let outcome = session.execute("SELECT a / b FROM t").unwrap();
    assert_eq!(outcome.rows, vec![vec![Datum::Null]]);

    session.set_strict(true);
    let err = session.execute("SELECT a / b FROM t").unwrap_err();
    assert!(matches!(err, EngineError::Execution(_)));
}

#[test]
fn expired_deadline_reports_timeout() {
    let db = bulk_db(u64::MAX);
    let mut session = db.session();
    session.set_timeout(Some(Duration::ZERO));
    let err = session.execute("SELECT id FROM big").unwrap_err();
    assert!(matches!(err, EngineError::Timeout));
}

#[test]
fn cancellation_unwinds_the_plan() {
    let db = bulk_db(u64::MAX);
    let mut session = db.session();
    session.cancel_handle().store(true, std::sync::atomic::Ordering::Relaxed);
    let err = session.execute("SELECT id FROM big").unwrap_err();
    assert!(matches!(err, EngineError::Canceled));
}
