use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tempfile::tempdir;
use textdb::{Database, DbError, Document, EventKind, Modify, Op, QueryBuilder};

fn doc(value: serde_json::Value) -> Document {
    value.as_object().cloned().expect("object literal")
}

#[test]
fn insert_and_find() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "basic")?;

    db.insert(doc(json!({"id": "A", "n": 1}))).wait()?;
    db.insert(doc(json!({"id": "B", "n": 2}))).wait()?;

    let hits = db
        .find(QueryBuilder::new().where_("n", Op::Gt, 1))
        .wait()?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["id"], json!("B"));

    assert_eq!(db.count(QueryBuilder::new()).wait()?, 2);

    let sum = db
        .scalar(QueryBuilder::new().scalar(textdb::ScalarKind::Sum, Some("n")))
        .wait()?;
    assert_eq!(sum, json!(3));

    Ok(())
}

#[test]
fn boolean_toggle_updates_in_place() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "inplace")?;

    db.insert(doc(json!({"id": "X", "active": true}))).wait()?;
    let before = fs_err::metadata(db.path())?.len();

    let touched = db
        .update(
            QueryBuilder::new().where_("id", Op::Eq, "X"),
            Modify::Merge(doc(json!({"active": false}))),
        )
        .wait()?;
    assert_eq!(touched, 1);

    // equal re-encoded length, so the file did not grow
    let after = fs_err::metadata(db.path())?.len();
    assert_eq!(before, after);

    let row = db
        .one(QueryBuilder::new().where_("id", Op::Eq, "X"))
        .wait()?
        .expect("row must exist");
    assert_eq!(row["active"], json!(false));

    Ok(())
}

#[test]
fn growing_update_tombstones_and_appends() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "grow")?;

    db.insert(doc(json!({"id": "X", "active": true}))).wait()?;
    db.update(
        QueryBuilder::new().where_("id", Op::Eq, "X"),
        Modify::Merge(doc(json!({"active": false}))),
    )
    .wait()?;
    db.update(
        QueryBuilder::new().where_("id", Op::Eq, "X"),
        Modify::Merge(doc(json!({"n": 5}))),
    )
    .wait()?;

    let raw = fs_err::read_to_string(db.path())?;
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with('-'), "original line must be tombstoned");

    let tail: Document = serde_json::from_str(lines[1])?;
    assert_eq!(tail["id"], json!("X"));
    assert_eq!(tail["active"], json!(false));
    assert_eq!(tail["n"], json!(5));

    // tombstoned lines never reach predicates
    assert_eq!(db.count(QueryBuilder::new()).wait()?, 1);

    Ok(())
}

#[test]
fn concurrent_appends_share_one_batch() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "batch")?;

    // the lock section halts the scheduler, so all ten inserts are
    // pending when the append queue drains
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = collected.clone();
    db.lock(move |held| {
        let mut pendings = sink.lock();
        for i in 0..10 {
            pendings.push(held.insert(doc(json!({"i": i}))));
        }
    })
    .wait()?;

    let pendings = std::mem::take(&mut *collected.lock());
    for pending in pendings {
        assert_eq!(pending.wait()?, 1);
    }

    assert_eq!(db.stats().append_batches, 1);

    let all = db.find(QueryBuilder::new()).wait()?;
    assert_eq!(all.len(), 10);
    for (i, row) in all.iter().enumerate() {
        assert_eq!(row["i"], json!(i));
    }

    Ok(())
}

#[test]
fn remove_then_clean_compacts() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "compact")?;

    for i in 0..6 {
        db.insert(doc(json!({"i": i, "del": i % 2 == 0}))).wait()?;
    }

    let removed = db
        .remove(QueryBuilder::new().where_("del", Op::Eq, true))
        .wait()?;
    assert_eq!(removed, 3);

    // tombstones still occupy bytes until clean
    let raw = fs_err::read_to_string(db.path())?;
    assert_eq!(raw.lines().filter(|l| l.starts_with('-')).count(), 3);

    db.clean().wait()?;

    let raw = fs_err::read_to_string(db.path())?;
    assert_eq!(raw.lines().count(), 3);
    assert!(raw.lines().all(|l| !l.starts_with('-')));

    let survivors = db.find(QueryBuilder::new()).wait()?;
    assert!(survivors.iter().all(|d| d["del"] == json!(false)));

    Ok(())
}

#[test]
fn update_or_insert_falls_back() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "upsert")?;

    let touched = db
        .update_or_insert(
            QueryBuilder::new().where_("id", Op::Eq, "missing"),
            Modify::Merge(doc(json!({"seen": 1}))),
            doc(json!({"id": "missing", "seen": 1})),
        )
        .wait()?;
    assert_eq!(touched, 1);

    let row = db
        .one(QueryBuilder::new().where_("id", Op::Eq, "missing"))
        .wait()?;
    assert!(row.is_some());

    Ok(())
}

#[test]
fn merge_prefixes_apply_arithmetic() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "arith")?;

    db.insert(doc(json!({"id": "a", "n": 10}))).wait()?;

    db.modify(
        QueryBuilder::new().where_("id", Op::Eq, "a"),
        doc(json!({"+n": 5})),
    )
    .wait()?;
    db.modify(
        QueryBuilder::new().where_("id", Op::Eq, "a"),
        doc(json!({"*n": 2})),
    )
    .wait()?;
    db.modify(
        QueryBuilder::new().where_("id", Op::Eq, "a"),
        doc(json!({"-n": 6})),
    )
    .wait()?;

    let row = db
        .one(QueryBuilder::new().where_("id", Op::Eq, "a"))
        .wait()?
        .expect("row");
    assert_eq!(row["n"], json!(24));

    Ok(())
}

#[test]
fn readonly_rejects_writes() -> Result<(), DbError> {
    let dir = tempdir()?;
    {
        let db = Database::open(dir.path(), "ro")?;
        db.insert(doc(json!({"id": 1}))).wait()?;
        db.release()?;
    }

    let options = textdb::DatabaseOptions {
        readonly: true,
        ..Default::default()
    };
    let db = Database::open_with(dir.path(), "ro", options)?;

    let err = db.insert(doc(json!({"id": 2}))).wait();
    assert!(matches!(err, Err(DbError::ReadOnly)));

    // reads still work
    assert_eq!(db.count(QueryBuilder::new()).wait()?, 1);

    Ok(())
}

#[test]
fn insert_events_fire() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "events")?;

    let inserts = Arc::new(AtomicUsize::new(0));
    let changes = Arc::new(AtomicUsize::new(0));
    {
        let inserts = inserts.clone();
        db.on(EventKind::Insert, move |_| {
            inserts.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let changes = changes.clone();
        db.on(EventKind::Change, move |_| {
            changes.fetch_add(1, Ordering::SeqCst);
        });
    }

    db.insert(doc(json!({"a": 1}))).wait()?;
    db.insert(doc(json!({"a": 2}))).wait()?;

    assert_eq!(inserts.load(Ordering::SeqCst), 2);
    assert_eq!(changes.load(Ordering::SeqCst), 2);

    Ok(())
}

#[test]
fn destroy_removes_files_and_shuts_down() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "doomed")?;

    db.insert(doc(json!({"a": 1}))).wait()?;
    db.counter().hit("a", 1);
    db.counter().flush()?;
    assert!(db.path().exists());

    db.destroy().wait()?;
    assert!(!db.path().exists());

    let err = db.insert(doc(json!({"a": 2}))).wait();
    assert!(matches!(err, Err(DbError::Released)));

    Ok(())
}

#[test]
fn stream_visits_live_documents() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "streamed")?;

    for i in 0..5 {
        db.insert(doc(json!({"i": i}))).wait()?;
    }
    db.remove(QueryBuilder::new().where_("i", Op::Eq, 2))
        .wait()?;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let visited = db
        .stream(move |d| {
            sink.lock().push(d["i"].clone());
            true
        })
        .wait()?;

    assert_eq!(visited, 4);
    assert_eq!(&*seen.lock(), &[json!(0), json!(1), json!(3), json!(4)]);

    // early stop after the first document
    let visited = db.stream(|_| false).wait()?;
    assert_eq!(visited, 1);

    Ok(())
}
