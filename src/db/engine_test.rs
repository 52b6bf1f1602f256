use std::collections::BTreeMap;

use crate::{
    catalog::{ColumnDef, TagFilter},
    config::{DuplicatePolicy, EngineConfig},
    error::Error,
    fs::{DbDir, MockDir, OsDir},
    sma::{SmaConfig, SmaSum},
    types::{ColumnType, Order, Row, TimeRange, Value},
};

use super::{CmpOp, Engine, Predicate, ScanRequest};

const TS0: i64 = 1_500_000_000_000;
const BUCKET: i64 = 10_000;

fn config() -> EngineConfig {
    EngineConfig::default().with_max_rows_per_block(3300)
}

fn setup<D: DbDir>(dir: &D, config: EngineConfig) -> Engine<D> {
    let db = Engine::open(dir.clone(), config).unwrap();
    db.create_super_table(
        "meters",
        "ts",
        vec![
            ColumnDef::new("i1", ColumnType::Int),
            ColumnDef::new("d1", ColumnType::Double),
        ],
        vec![ColumnDef::new("loc", ColumnType::Text)],
        Some(SmaConfig::new(["i1"], BUCKET)),
    )
    .unwrap();
    db.create_child_table("t1", "meters", vec![Value::from("sf")])
        .unwrap();
    db
}

fn row(ts: i64, i: i64) -> Row {
    Row::new(ts, [Value::Int(i), Value::Double(i as f64 / 2.0)])
}

fn insert_seq<D: DbDir>(db: &Engine<D>, count: i64) {
    let all: Vec<i64> = (0..count).collect();
    for chunk in all.chunks(1000) {
        db.insert("t1", chunk.iter().map(|i| row(TS0 + i * 1000, *i)).collect())
            .unwrap();
    }
}

fn ints<D: DbDir>(db: &Engine<D>, req: ScanRequest) -> Vec<i64> {
    db.scan_collect("t1", &req)
        .unwrap()
        .iter()
        .map(|r| match r.values[0] {
            Value::Int(v) => v,
            ref v => panic!("unexpected value {}", v),
        })
        .collect()
}

// Recomputes every i1 bucket from the visible rows and compares with the
// index.
fn check_sma<D: DbDir>(db: &Engine<D>) {
    let mut expected: BTreeMap<i64, (u64, u64, i64, Option<i64>, Option<i64>)> = BTreeMap::new();
    for r in db.scan_collect("t1", &ScanRequest::new()).unwrap() {
        let b = expected
            .entry(r.ts - r.ts.rem_euclid(BUCKET))
            .or_insert((0, 0, 0, None, None));
        b.0 += 1;
        if let Value::Int(v) = r.values[0] {
            b.1 += 1;
            b.2 += v;
            b.3 = Some(b.3.map_or(v, |m| m.min(v)));
            b.4 = Some(b.4.map_or(v, |m| m.max(v)));
        }
    }
    let actual: BTreeMap<_, _> = db
        .query_sma("t1", &TimeRange::all(), "i1")
        .unwrap()
        .unwrap()
        .into_iter()
        .map(|b| {
            let c = &b.columns[0];
            let int = |v: &Value| match v {
                Value::Int(v) => Some(*v),
                _ => None,
            };
            let sum = match c.sum {
                SmaSum::Int(s) => s,
                SmaSum::Double(_) => panic!("int column with double sum"),
            };
            (b.start, (b.rows, c.count, sum, int(&c.min), int(&c.max)))
        })
        .collect();
    assert_eq!(actual, expected);
}

#[test]
fn test_limit_offset_and_filters() {
    let dir = MockDir::new();
    let db = setup(&dir, config());
    insert_seq(&db, 10000);
    assert_eq!(db.flush("t1").unwrap(), 10000);

    let stats = db.table_stats("t1").unwrap();
    assert_eq!((stats.blocks, stats.runs, stats.buffered_rows), (4, 1, 0));

    assert_eq!(
        ints(&db, ScanRequest::new().limit(10).offset(5)),
        (5..15).collect::<Vec<_>>()
    );
    assert_eq!(
        ints(
            &db,
            ScanRequest::new()
                .range(TimeRange::new(TS0 + 1000, TS0 + 6000))
                .limit(10)
        ),
        vec![1, 2, 3, 4, 5]
    );
    assert_eq!(
        ints(
            &db,
            ScanRequest::new()
                .filter(Predicate::compare("i1", CmpOp::Ge, 1))
                .filter(Predicate::compare("i1", CmpOp::Lt, 11))
                .limit(10)
                .offset(5)
        ),
        vec![6, 7, 8, 9, 10]
    );
    // The same window through predicates on the timestamp column.
    assert_eq!(
        ints(
            &db,
            ScanRequest::new()
                .filter(Predicate::compare("ts", CmpOp::Ge, TS0 + 1000))
                .filter(Predicate::compare("ts", CmpOp::Lt, TS0 + 6000))
        ),
        vec![1, 2, 3, 4, 5]
    );
    assert_eq!(
        ints(&db, ScanRequest::new().order(Order::Desc).limit(3).offset(2)),
        vec![9997, 9996, 9995]
    );
    check_sma(&db);
}

#[test]
fn test_limit_stops_reading() {
    let dir = MockDir::new();
    let db = setup(&dir, config());
    insert_seq(&db, 10000);
    db.flush("t1").unwrap();
    dir.fs.lock().take_events();

    let mut scan = db.scan("t1", &ScanRequest::new().limit(10)).unwrap();
    assert_eq!(scan.by_ref().count(), 10);
    let reads = dir
        .fs
        .lock()
        .take_events()
        .into_iter()
        .filter(|e| matches!(e, crate::fs::Event::Read(_)))
        .count();
    assert_eq!(reads, 1);
}

#[test]
fn test_empty_and_short_results() {
    let dir = MockDir::new();
    let db = setup(&dir, config());
    assert!(ints(&db, ScanRequest::new()).is_empty());

    insert_seq(&db, 20);
    assert!(ints(&db, ScanRequest::new().offset(20)).is_empty());
    assert!(ints(&db, ScanRequest::new().offset(1000).limit(5)).is_empty());
    assert_eq!(ints(&db, ScanRequest::new().offset(17).limit(10)), vec![17, 18, 19]);
    assert!(ints(&db, ScanRequest::new().limit(0)).is_empty());
    assert!(ints(&db, ScanRequest::new().range(TimeRange::new(5, 5))).is_empty());
}

#[test]
fn test_invalid_requests() {
    let dir = MockDir::new();
    let db = setup(&dir, config());
    insert_seq(&db, 10);

    for req in [
        ScanRequest::new().offset(-1),
        ScanRequest::new().limit(-1),
        ScanRequest::new().range(TimeRange::new(TS0 + 1, TS0)),
        ScanRequest::new().filter(Predicate::compare("i9", CmpOp::Eq, 1)),
    ] {
        assert!(matches!(
            db.scan("t1", &req),
            Err(Error::InvalidArgument { .. })
        ));
    }
    assert!(matches!(
        db.scan("nope", &ScanRequest::new()),
        Err(Error::TableNotFound { .. })
    ));
    assert!(matches!(
        db.insert("nope", vec![row(1, 1)]),
        Err(Error::TableNotFound { .. })
    ));

    // A bad row rejects the whole batch.
    let batch = vec![
        row(1, 1),
        Row::new(2, [Value::Int(2)]),
    ];
    assert!(matches!(db.insert("t1", batch), Err(Error::InvalidArgument { .. })));
    let batch = vec![row(1, 1), Row::new(2, [Value::from("x"), Value::Null])];
    assert!(matches!(db.insert("t1", batch), Err(Error::InvalidArgument { .. })));
    assert!(matches!(
        db.insert("t1", vec![row(i64::MAX, 1)]),
        Err(Error::InvalidArgument { .. })
    ));
    assert!(matches!(
        db.insert("t1", vec![Row::new(3, [Value::Int(1), Value::Double(f64::NAN)])]),
        Err(Error::InvalidArgument { .. })
    ));
    assert_eq!(ints(&db, ScanRequest::new()).len(), 10);
}

#[test]
fn test_retroactive_insert_shifts_offsets() {
    let dir = MockDir::new();
    let db = setup(&dir, config());
    insert_seq(&db, 100);
    db.flush("t1").unwrap();

    db.insert("t1", vec![row(TS0 + 2500, -1), row(TS0 + 2600, -2)])
        .unwrap();
    assert_eq!(
        ints(&db, ScanRequest::new().offset(1).limit(6)),
        vec![1, 2, -1, -2, 3, 4]
    );
    // Still the same after the retroactive rows are flushed into a new run.
    db.flush("t1").unwrap();
    assert_eq!(db.table_stats("t1").unwrap().runs, 2);
    assert_eq!(
        ints(&db, ScanRequest::new().offset(1).limit(6)),
        vec![1, 2, -1, -2, 3, 4]
    );
    check_sma(&db);
}

fn workload() -> Vec<Vec<Row>> {
    // Timestamps jump around and repeat.
    (0..12)
        .map(|b| {
            (0..40)
                .map(|i| {
                    let n = b * 40 + i;
                    let ts = TS0 + (n * 7919 % 300) * 100;
                    if n % 11 == 0 {
                        Row::new(ts, [Value::Null, Value::Null])
                    } else {
                        row(ts, n)
                    }
                })
                .collect()
        })
        .collect()
}

fn check_tier_placement(policy: DuplicatePolicy) {
    let config = EngineConfig::default()
        .with_max_rows_per_block(64)
        .with_duplicate_policy(policy);

    let flushed_dir = MockDir::new();
    let flushed = setup(&flushed_dir, config.clone());
    let mixed_dir = MockDir::new();
    let mixed = setup(&mixed_dir, config);

    for (b, batch) in workload().into_iter().enumerate() {
        flushed.insert("t1", batch.clone()).unwrap();
        mixed.insert("t1", batch).unwrap();
        if b == 3 || b == 7 {
            mixed.flush("t1").unwrap();
        }
    }
    flushed.flush("t1").unwrap();
    assert!(mixed.table_stats("t1").unwrap().buffered_rows > 0);
    assert!(mixed.table_stats("t1").unwrap().runs > 1);

    let total = flushed.scan_collect("t1", &ScanRequest::new()).unwrap().len() as i64;
    match policy {
        DuplicatePolicy::Overwrite => assert_eq!(total, 300),
        DuplicatePolicy::KeepAll => assert_eq!(total, 480),
    }
    for order in [Order::Asc, Order::Desc] {
        for offset in [0, 5, 37, 150, total - 3, total + 1] {
            let req = ScanRequest::new().order(order).offset(offset).limit(10);
            assert_eq!(
                mixed.scan_collect("t1", &req).unwrap(),
                flushed.scan_collect("t1", &req).unwrap(),
                "{:?} offset {}",
                order,
                offset
            );
        }
    }
    let all = ScanRequest::new().filter(Predicate::IsNotNull("i1".into()));
    assert_eq!(
        mixed.scan_collect("t1", &all).unwrap(),
        flushed.scan_collect("t1", &all).unwrap()
    );
    assert_eq!(
        mixed.query_sma("t1", &TimeRange::all(), "i1").unwrap(),
        flushed.query_sma("t1", &TimeRange::all(), "i1").unwrap()
    );
    check_sma(&mixed);
}

#[test]
fn test_tier_placement_is_invisible_overwrite() {
    check_tier_placement(DuplicatePolicy::Overwrite);
}

#[test]
fn test_tier_placement_is_invisible_keep_all() {
    check_tier_placement(DuplicatePolicy::KeepAll);
}

#[test]
fn test_duplicate_timestamps() {
    for policy in [DuplicatePolicy::Overwrite, DuplicatePolicy::KeepAll] {
        let dir = MockDir::new();
        let db = setup(&dir, config().with_duplicate_policy(policy));
        db.insert("t1", vec![row(10, 1), row(20, 9)]).unwrap();
        db.flush("t1").unwrap();
        db.insert("t1", vec![row(10, 2)]).unwrap();
        db.insert("t1", vec![row(10, 3), row(10, 4)]).unwrap();

        let got = ints(&db, ScanRequest::new());
        let sma = db.query_sma("t1", &TimeRange::all(), "i1").unwrap().unwrap();
        let agg = &sma[0].columns[0];
        match policy {
            DuplicatePolicy::Overwrite => {
                assert_eq!(got, vec![4, 9]);
                assert_eq!((agg.count, agg.sum), (2, SmaSum::Int(13)));
                assert_eq!((agg.min.clone(), agg.max.clone()), (Value::Int(4), Value::Int(9)));
            }
            DuplicatePolicy::KeepAll => {
                assert_eq!(got, vec![1, 2, 3, 4, 9]);
                assert_eq!((agg.count, agg.sum), (5, SmaSum::Int(19)));
                assert_eq!(agg.min, Value::Int(1));
            }
        }
        assert_eq!(
            ints(&db, ScanRequest::new().order(Order::Desc)),
            got.iter().rev().copied().collect::<Vec<_>>()
        );
        check_sma(&db);
    }
}

#[test]
fn test_overwrite_of_bucket_extreme() {
    let dir = MockDir::new();
    let db = setup(&dir, config());
    db.insert("t1", vec![row(0, 5), row(1, 100), row(2, -7)]).unwrap();
    db.flush("t1").unwrap();
    // Replaces both the max and the min.
    db.insert("t1", vec![row(1, 6), row(2, 3)]).unwrap();
    let sma = db.query_sma("t1", &TimeRange::all(), "i1").unwrap().unwrap();
    assert_eq!(sma.len(), 1);
    assert_eq!(sma[0].columns[0].min, Value::Int(3));
    assert_eq!(sma[0].columns[0].max, Value::Int(6));
    assert_eq!(sma[0].columns[0].sum, SmaSum::Int(14));
    check_sma(&db);
}

#[test]
fn test_sma_queries() {
    let dir = MockDir::new();
    let db = setup(&dir, config());
    insert_seq(&db, 100);
    db.flush("t1").unwrap();
    db.insert("t1", vec![row(TS0 + 100_000, 100)]).unwrap();

    let buckets = db
        .query_sma("t1", &TimeRange::new(TS0 + 15_000, TS0 + 30_000), "i1")
        .unwrap()
        .unwrap();
    assert_eq!(
        buckets.iter().map(|b| b.start - TS0).collect::<Vec<_>>(),
        vec![10_000, 20_000]
    );
    let total = buckets
        .iter()
        .skip(1)
        .try_fold(buckets[0].columns[0].clone(), |acc, b| acc.merge(&b.columns[0]))
        .unwrap();
    assert_eq!(total.count, 20);
    assert_eq!(total.sum, SmaSum::Int((10..30).sum()));

    let all = db.query_sma("t1", &TimeRange::all(), "i1").unwrap().unwrap();
    assert_eq!(all.len(), 11);
    assert_eq!(all[10].rows, 1);

    assert_eq!(db.query_sma("t1", &TimeRange::all(), "d1").unwrap(), None);
    assert!(matches!(
        db.query_sma("t1", &TimeRange::new(2, 1), "i1"),
        Err(Error::InvalidArgument { .. })
    ));
    check_sma(&db);
}

#[test]
fn test_sma_overflow_fails_insert() {
    let dir = MockDir::new();
    let db = setup(&dir, config());
    db.insert("t1", vec![row(0, i64::MAX)]).unwrap();
    assert!(matches!(
        db.insert("t1", vec![row(5, 7), row(6, 1)]),
        Err(Error::SmaOverflow { ts: 5, .. })
    ));
    assert_eq!(ints(&db, ScanRequest::new()), vec![i64::MAX]);
    assert!(matches!(
        db.insert("t1", vec![row(i64::MIN, 1)]),
        Err(Error::SmaOverflow { .. })
    ));
    check_sma(&db);
}

#[test]
fn test_disk_errors() {
    let dir = MockDir::new();
    let db = setup(&dir, config());
    insert_seq(&db, 50);
    db.flush("t1").unwrap();

    // Nothing is written when the WAL append fails.
    dir.fs.lock().schedule_crash(0);
    assert!(matches!(
        db.insert("t1", vec![row(TS0 + 100_000, 1)]),
        Err(Error::DiskIo { op: "insert", .. })
    ));

    // A block that can't be read fails the scan, which then ends.
    let mut scan = db.scan("t1", &ScanRequest::new()).unwrap();
    assert!(matches!(scan.next(), Some(Err(Error::ScanFailed { .. }))));
    assert!(scan.next().is_none());

    dir.fs.lock().reboot();
    assert_eq!(ints(&db, ScanRequest::new()).len(), 50);
    assert_eq!(db.table_stats("t1").unwrap().buffered_rows, 0);
    check_sma(&db);
}

#[test]
fn test_failed_wal_append_moves_to_new_wal() {
    // 0: the append itself fails. 1: the append lands, its sync fails and the
    // reboot loses it.
    for crash_after in [0, 1] {
        let dir = MockDir::new();
        let db = setup(&dir, config());
        insert_seq(&db, 50);

        dir.fs.lock().schedule_crash(crash_after);
        assert!(matches!(
            db.insert("t1", vec![row(TS0 + 100_000, 1)]),
            Err(Error::DiskIo { op: "insert", .. })
        ));
        dir.fs.lock().reboot();

        db.insert("t1", vec![row(TS0 + 200_000, 2)]).unwrap();
        let rows = db.scan_collect("t1", &ScanRequest::new()).unwrap();
        assert_eq!(rows.len(), 51);
        check_sma(&db);
        let wals = dir
            .ls()
            .unwrap()
            .into_iter()
            .filter(|f| f.starts_with("wal-"))
            .count();
        assert_eq!(wals, 2);
        drop(db);

        for _ in 0..2 {
            let db = Engine::open(dir.clone(), config()).unwrap();
            assert_eq!(db.scan_collect("t1", &ScanRequest::new()).unwrap(), rows);
            check_sma(&db);
        }

        let db = Engine::open(dir.clone(), config()).unwrap();
        db.flush("t1").unwrap();
        drop(db);
        let db = Engine::open(dir.clone(), config()).unwrap();
        assert_eq!(db.scan_collect("t1", &ScanRequest::new()).unwrap(), rows);
    }
}

#[test]
fn test_recovery() {
    let dir = MockDir::new();
    let db = setup(&dir, config().with_max_rows_per_block(100));
    insert_seq(&db, 250);
    db.flush("t1").unwrap();
    db.insert("t1", vec![row(TS0 + 500, -1), row(TS0 + 1000, -2)])
        .unwrap();
    let rows = db.scan_collect("t1", &ScanRequest::new()).unwrap();
    let sma = db.query_sma("t1", &TimeRange::all(), "i1").unwrap();
    drop(db);

    for _ in 0..2 {
        let db = Engine::open(dir.clone(), config().with_max_rows_per_block(100)).unwrap();
        assert_eq!(db.scan_collect("t1", &ScanRequest::new()).unwrap(), rows);
        assert_eq!(db.query_sma("t1", &TimeRange::all(), "i1").unwrap(), sma);
        let stats = db.table_stats("t1").unwrap();
        assert_eq!((stats.blocks, stats.runs, stats.buffered_rows), (3, 1, 2));
    }

    let db = Engine::open(dir.clone(), config()).unwrap();
    db.flush("t1").unwrap();
    db.insert("t1", vec![row(TS0 + 1500, -3)]).unwrap();
    drop(db);
    let db = Engine::open(dir.clone(), config()).unwrap();
    assert_eq!(ints(&db, ScanRequest::new().limit(4)), vec![0, -1, -2, -3]);
    check_sma(&db);
}

#[test]
fn test_crash_during_flush() {
    for crash_after in 0..20 {
        let dir = MockDir::new();
        let db = setup(&dir, config().with_max_rows_per_block(40));
        insert_seq(&db, 30);
        db.flush("t1").unwrap();
        db.insert("t1", (30..100).map(|i| row(TS0 + i * 1000, i)).collect())
            .unwrap();
        db.insert("t1", vec![row(TS0 + 5000, -5)]).unwrap();
        let expected = db.scan_collect("t1", &ScanRequest::new()).unwrap();
        let expected_sma = db.query_sma("t1", &TimeRange::all(), "i1").unwrap();

        dir.fs.lock().schedule_crash(crash_after);
        let _ = db.flush("t1");
        drop(db);
        dir.fs.lock().reboot();

        let db = Engine::open(dir.clone(), config().with_max_rows_per_block(40)).unwrap();
        assert_eq!(
            db.scan_collect("t1", &ScanRequest::new()).unwrap(),
            expected,
            "crash after {} ops",
            crash_after
        );
        assert_eq!(
            db.query_sma("t1", &TimeRange::all(), "i1").unwrap(),
            expected_sma
        );
        let block_files = dir
            .ls()
            .unwrap()
            .iter()
            .filter(|f| f.starts_with("blk-"))
            .count();
        assert_eq!(block_files, db.table_stats("t1").unwrap().blocks);
        assert!(!dir.ls().unwrap().contains(&"ROOT_TMP".to_owned()));
    }
}

#[test]
fn test_automatic_flush() {
    let dir = MockDir::new();
    let db = setup(
        &dir,
        config()
            .with_max_rows_per_block(10)
            .with_flush_threshold_rows(Some(25)),
    );
    for b in 0..4 {
        db.insert("t1", (0..10).map(|i| row(b * 10 + i, b * 10 + i)).collect())
            .unwrap();
    }
    let stats = db.table_stats("t1").unwrap();
    assert_eq!((stats.block_rows, stats.buffered_rows), (30, 10));
    assert_eq!(ints(&db, ScanRequest::new()).len(), 40);
}

#[test]
fn test_concurrent_scans_see_whole_batches() {
    let dir = MockDir::new();
    let db = setup(&dir, config().with_sync_wal(false).with_max_rows_per_block(64));
    std::thread::scope(|s| {
        s.spawn(|| {
            for b in 0..20 {
                db.insert(
                    "t1",
                    (0..50).map(|i| row(TS0 + (b * 50 + i) * 1000, b * 50 + i)).collect(),
                )
                .unwrap();
                if b % 5 == 4 {
                    db.flush("t1").unwrap();
                }
            }
        });
        for _ in 0..2 {
            s.spawn(|| {
                for _ in 0..50 {
                    let rows = db.scan_collect("t1", &ScanRequest::new()).unwrap();
                    assert_eq!(rows.len() % 50, 0);
                    for (i, r) in rows.iter().enumerate() {
                        assert_eq!(r.values[0], Value::Int(i as i64));
                    }
                }
            });
        }
    });
    assert_eq!(ints(&db, ScanRequest::new()).len(), 1000);
    check_sma(&db);
}

#[test]
fn test_scan_is_a_snapshot() {
    let dir = MockDir::new();
    let db = setup(&dir, config());
    insert_seq(&db, 10);
    let scan = db.scan("t1", &ScanRequest::new()).unwrap();
    db.insert("t1", vec![row(0, -1)]).unwrap();
    db.flush("t1").unwrap();
    assert_eq!(scan.count(), 10);
    assert_eq!(ints(&db, ScanRequest::new()).len(), 11);
}

#[test]
fn test_projection() {
    let dir = MockDir::new();
    let db = setup(&dir, config());
    db.insert("t1", vec![row(1, 4), row(2, 6)]).unwrap();
    let rows = db
        .scan_collect("t1", &ScanRequest::new().project(["d1", "i1"]))
        .unwrap();
    assert_eq!(
        rows,
        vec![
            Row::new(1, [Value::Double(2.0), Value::Int(4)]),
            Row::new(2, [Value::Double(3.0), Value::Int(6)]),
        ]
    );
}

#[test]
fn test_schema_versions() {
    let dir = MockDir::new();
    let db = setup(&dir, config());
    assert_eq!(
        db.add_column("meters", ColumnDef::new("b1", ColumnType::Bool))
            .unwrap(),
        2
    );
    db.create_child_table("t2", "meters", vec![Value::from("la")])
        .unwrap();

    // t1 keeps the layout it was created with.
    db.insert("t1", vec![row(1, 1)]).unwrap();
    assert!(db.insert("t2", vec![row(1, 1)]).is_err());
    db.insert(
        "t2",
        vec![Row::new(1, [Value::Int(1), Value::Null, Value::Bool(true)])],
    )
    .unwrap();

    drop(db);
    let db = Engine::open(dir.clone(), config()).unwrap();
    let catalog = db.catalog();
    assert_eq!(catalog.table("t1").unwrap().schema.version, 1);
    assert_eq!(catalog.table("t2").unwrap().schema.columns.len(), 3);
    assert_eq!(catalog.children("meters").unwrap().count(), 2);
    assert!(matches!(
        db.create_child_table("t2", "meters", vec![Value::Null]),
        Err(Error::TableExists { .. })
    ));
}

#[test]
fn test_drop_table() {
    let dir = MockDir::new();
    let db = setup(&dir, config());
    insert_seq(&db, 10);
    db.flush("t1").unwrap();
    db.insert("t1", vec![row(1, 1)]).unwrap();
    assert!(db.drop_super_table("meters").is_err());

    db.drop_table("t1").unwrap();
    assert!(matches!(
        db.scan("t1", &ScanRequest::new()),
        Err(Error::TableNotFound { .. })
    ));
    assert_eq!(dir.ls().unwrap(), vec!["ROOT".to_owned()]);
    db.drop_super_table("meters").unwrap();

    drop(db);
    let db = Engine::open(dir.clone(), config()).unwrap();
    assert_eq!(db.catalog().tables().count(), 0);
}

#[test]
fn test_drop_through_held_table_handle() {
    let dir = MockDir::new();
    let db = setup(&dir, config());
    insert_seq(&db, 10);
    let tablet = db.tablet("t1").unwrap();
    db.drop_table("t1").unwrap();

    assert!(matches!(
        tablet.flush(&db.root),
        Err(Error::TableNotFound { .. })
    ));
    assert!(matches!(
        tablet.insert(vec![row(TS0, 1)], &db.root),
        Err(Error::TableNotFound { .. })
    ));
    assert_eq!(dir.ls().unwrap(), vec!["ROOT".to_owned()]);

    drop(db);
    let db = Engine::open(dir.clone(), config()).unwrap();
    assert!(db.root.lock().data().tablets.is_empty());
    assert_eq!(dir.ls().unwrap(), vec!["ROOT".to_owned()]);
}

#[test]
fn test_drop_races_with_flush() {
    for _ in 0..20 {
        let dir = MockDir::new();
        let db = setup(&dir, config().with_max_rows_per_block(4));
        insert_seq(&db, 10);
        let tablet = db.tablet("t1").unwrap();
        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..5 {
                    let _ = tablet.insert(vec![row(TS0 + i * 10, i)], &db.root);
                    let _ = tablet.flush(&db.root);
                }
            });
            s.spawn(|| db.drop_table("t1").unwrap());
        });
        assert_eq!(dir.ls().unwrap(), vec!["ROOT".to_owned()]);
        assert!(db.root.lock().data().tablets.is_empty());
    }
}

#[test]
fn test_super_table_scan() {
    let dir = MockDir::new();
    let db = setup(&dir, config().with_max_rows_per_block(4));
    db.create_child_table("t2", "meters", vec![Value::from("la")])
        .unwrap();
    db.add_column("meters", ColumnDef::new("b1", ColumnType::Bool))
        .unwrap();
    db.create_child_table("t3", "meters", vec![Value::from("sf")])
        .unwrap();

    db.insert("t1", (0..10).map(|i| row(i * 2, i * 2)).collect())
        .unwrap();
    db.flush("t1").unwrap();
    db.insert("t2", (0..7).map(|i| row(i * 3, 100 + i * 3)).collect())
        .unwrap();
    db.insert(
        "t3",
        vec![Row::new(6, [Value::Int(-6), Value::Null, Value::Bool(true)])],
    )
    .unwrap();

    let scan = |tags: TagFilter, req: ScanRequest| -> Vec<(String, i64, i64)> {
        db.scan_super_table("meters", &tags, &req)
            .unwrap()
            .map(|r| {
                let r = r.unwrap();
                assert_eq!(r.row.values.len(), 3);
                match r.row.values[0] {
                    Value::Int(v) => (r.table, r.row.ts, v),
                    ref v => panic!("unexpected value {}", v),
                }
            })
            .collect()
    };
    let expect = |rows: &[(&str, i64, i64)]| -> Vec<(String, i64, i64)> {
        rows.iter().map(|&(t, ts, v)| (t.to_owned(), ts, v)).collect()
    };
    let early = || ScanRequest::new().range(TimeRange::new(0, 7));
    let sf = || TagFilter::All(vec![Predicate::compare("loc", CmpOp::Eq, "sf")]);

    assert_eq!(
        scan(TagFilter::default(), early()),
        expect(&[
            ("t1", 0, 0),
            ("t2", 0, 100),
            ("t1", 2, 2),
            ("t2", 3, 103),
            ("t1", 4, 4),
            ("t1", 6, 6),
            ("t2", 6, 106),
            ("t3", 6, -6),
        ])
    );
    // Offset and limit count rows of the merged stream.
    assert_eq!(
        scan(TagFilter::default(), early().offset(2).limit(3)),
        expect(&[("t1", 2, 2), ("t2", 3, 103), ("t1", 4, 4)])
    );
    assert_eq!(
        scan(TagFilter::default(), early().order(Order::Desc).limit(4)),
        expect(&[("t3", 6, -6), ("t2", 6, 106), ("t1", 6, 6), ("t1", 4, 4)])
    );
    assert_eq!(
        scan(sf(), early()),
        expect(&[("t1", 0, 0), ("t1", 2, 2), ("t1", 4, 4), ("t1", 6, 6), ("t3", 6, -6)])
    );
    assert_eq!(
        scan(
            TagFilter::default(),
            ScanRequest::new().filter(Predicate::compare("i1", CmpOp::Ge, 112))
        ),
        expect(&[("t2", 12, 112), ("t2", 15, 115), ("t2", 18, 118)])
    );

    // Children created before b1 was added read it as NULL.
    let rows: Vec<_> = db
        .scan_super_table("meters", &sf(), &early().offset(3).project(["b1"]))
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(
        rows.iter().map(|r| (r.table.as_str(), r.row.values.clone())).collect::<Vec<_>>(),
        vec![("t1", vec![Value::Null]), ("t3", vec![Value::Bool(true)])]
    );
    assert_eq!(
        scan(
            TagFilter::default(),
            ScanRequest::new().filter(Predicate::IsNotNull("b1".into()))
        ),
        expect(&[("t3", 6, -6)])
    );

    db.insert("t2", vec![row(3, 999)]).unwrap();
    db.drop_table("t1").unwrap();
    assert_eq!(
        scan(TagFilter::default(), early()),
        expect(&[("t2", 0, 100), ("t2", 3, 999), ("t2", 6, 106), ("t3", 6, -6)])
    );
    assert_eq!(
        db.scan_super_table("meters", &sf(), &ScanRequest::new())
            .unwrap()
            .tables(),
        ["t3".to_owned()]
    );
    assert!(scan(TagFilter::Any(Vec::new()), ScanRequest::new()).is_empty());

    assert!(matches!(
        db.scan_super_table("nope", &TagFilter::default(), &ScanRequest::new()),
        Err(Error::TableNotFound { .. })
    ));
    assert!(matches!(
        db.scan_super_table(
            "meters",
            &TagFilter::All(vec![Predicate::IsNull("i1".into())]),
            &ScanRequest::new()
        ),
        Err(Error::InvalidArgument { .. })
    ));
    assert!(matches!(
        db.scan_super_table("meters", &TagFilter::default(), &ScanRequest::new().offset(-1)),
        Err(Error::InvalidArgument { .. })
    ));
}

#[test]
fn test_normal_table() {
    let dir = MockDir::new();
    let db = Engine::open(dir.clone(), config()).unwrap();
    db.create_normal_table(
        "n1",
        "ts",
        vec![
            ColumnDef::new("s", ColumnType::Text),
            ColumnDef::new("v", ColumnType::Double),
        ],
        Some(SmaConfig::new(["v"], 100)),
    )
    .unwrap();
    db.insert(
        "n1",
        vec![
            Row::new(5, [Value::from("a"), Value::Double(1.5)]),
            Row::new(150, [Value::from("b"), Value::Double(2.0)]),
            Row::new(-20, [Value::Null, Value::Double(-1.0)]),
        ],
    )
    .unwrap();

    let rows = db
        .scan_collect(
            "n1",
            &ScanRequest::new().filter(Predicate::compare("s", CmpOp::Ne, "a")),
        )
        .unwrap();
    assert_eq!(rows.iter().map(|r| r.ts).collect::<Vec<_>>(), vec![150]);

    let sma = db.query_sma("n1", &TimeRange::all(), "v").unwrap().unwrap();
    assert_eq!(
        sma.iter().map(|b| b.start).collect::<Vec<_>>(),
        vec![-100, 0, 100]
    );
    assert_eq!(sma[0].columns[0].sum, SmaSum::Double(-1.0));
}

#[test]
fn test_on_disk() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let dir = OsDir::new(tmp.path())?;
    let rows = {
        let db = setup(&dir, config().with_max_rows_per_block(500));
        insert_seq(&db, 2000);
        db.flush("t1")?;
        db.insert("t1", vec![row(TS0 + 1500, -1)])?;
        db.scan_collect("t1", &ScanRequest::new())?
    };
    assert_eq!(rows.len(), 2001);

    let db = Engine::open(dir, config())?;
    assert_eq!(db.scan_collect("t1", &ScanRequest::new())?, rows);
    assert_eq!(db.table_stats("t1")?.blocks, 4);
    check_sma(&db);
    Ok(())
}
