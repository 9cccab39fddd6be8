use serde_json::json;
use tempfile::tempdir;
use textdb::{DbError, Document, Modify, Op, QueryBuilder, Table};

fn doc(value: serde_json::Value) -> Document {
    value.as_object().cloned().expect("object literal")
}

const PEOPLE: &str = "id:string|name:string|age:number|active:boolean";

#[test]
fn header_is_written_and_survives_reopen() -> Result<(), DbError> {
    let dir = tempdir()?;
    {
        let table = Table::open(dir.path(), "people", Some(PEOPLE))?;
        table.insert(doc(json!({"id": "1", "name": "ada", "age": 36, "active": true})))
            .wait()?;
        table.release()?;
    }

    let raw = fs_err::read_to_string(dir.path().join("people.table"))?;
    let mut lines = raw.lines();
    assert_eq!(lines.next(), Some(PEOPLE));
    assert!(lines.next().expect("data row").starts_with('+'));

    // reopen without a declaration; the persisted header wins
    let table = Table::open(dir.path(), "people", None)?;
    let rows = table.find(QueryBuilder::new()).wait()?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], json!("ada"));
    assert_eq!(rows[0]["age"], json!(36));
    assert_eq!(rows[0]["active"], json!(true));

    Ok(())
}

#[test]
fn unsafe_cells_escape_and_round_trip() -> Result<(), DbError> {
    let dir = tempdir()?;
    let table = Table::open(
        dir.path(),
        "escaped",
        Some("id:string|name:string|dt:date|meta:object"),
    )?;

    table
        .insert(doc(json!({
            "id": "r1",
            "name": "a|b\nc",
            "meta": {"x": "y|z"}
        })))
        .wait()?;

    // one offending byte anywhere switches the whole row to `*`
    let raw = fs_err::read_to_string(dir.path().join("escaped.table"))?;
    assert_eq!(raw.lines().count(), 2, "row must stay on a single line");
    let row = raw.lines().nth(1).expect("data row");
    assert!(row.starts_with('*'), "escaped rows carry the * marker");
    assert!(row.contains("%7C"));
    assert!(row.contains("%0A"));

    let decoded = table
        .one(QueryBuilder::new().where_("id", Op::Eq, "r1"))
        .wait()?
        .expect("row");
    assert_eq!(decoded["name"], json!("a|b\nc"));
    assert_eq!(decoded["meta"], json!({"x": "y|z"}));

    Ok(())
}

#[test]
fn update_and_remove_tombstone_rows() -> Result<(), DbError> {
    let dir = tempdir()?;
    let table = Table::open(dir.path(), "worklist", Some(PEOPLE))?;

    table
        .insert(doc(json!({"id": "1", "name": "ada", "age": 36, "active": true})))
        .wait()?;
    table
        .insert(doc(json!({"id": "2", "name": "alan", "age": 41, "active": true})))
        .wait()?;

    // boolean toggle keeps the cell width, so the row rewrites in place
    let before = fs_err::metadata(table.path())?.len();
    table
        .update(
            QueryBuilder::new().where_("id", Op::Eq, "1"),
            Modify::Merge(doc(json!({"active": false}))),
        )
        .wait()?;
    assert_eq!(before, fs_err::metadata(table.path())?.len());

    table
        .remove(QueryBuilder::new().where_("id", Op::Eq, "2"))
        .wait()?;

    let raw = fs_err::read_to_string(table.path())?;
    assert_eq!(raw.lines().filter(|l| l.starts_with('-')).count(), 1);
    assert_eq!(table.count(QueryBuilder::new()).wait()?, 1);

    Ok(())
}

#[test]
fn clear_re_emits_header() -> Result<(), DbError> {
    let dir = tempdir()?;
    let table = Table::open(dir.path(), "cleared", Some(PEOPLE))?;

    table
        .insert(doc(json!({"id": "1", "name": "x", "age": 1, "active": false})))
        .wait()?;
    table.clear().wait()?;

    let raw = fs_err::read_to_string(table.path())?;
    assert_eq!(raw.trim_end(), PEOPLE);
    assert_eq!(table.count(QueryBuilder::new()).wait()?, 0);

    Ok(())
}

#[test]
fn extend_rewrites_rows_through_new_schema() -> Result<(), DbError> {
    let dir = tempdir()?;
    let table = Table::open(dir.path(), "extended", Some("id:string|name:string"))?;

    table.insert(doc(json!({"id": "1", "name": "ada"}))).wait()?;
    table.insert(doc(json!({"id": "2", "name": "alan"}))).wait()?;
    table
        .remove(QueryBuilder::new().where_("id", Op::Eq, "2"))
        .wait()?;

    table.extend("id:string|name:string|score:number").wait()?;

    let raw = fs_err::read_to_string(table.path())?;
    let mut lines = raw.lines();
    assert_eq!(lines.next(), Some("id:string|name:string|score:number"));
    // tombstones are dropped by the rewrite
    assert_eq!(raw.lines().count(), 2);

    let row = table
        .one(QueryBuilder::new().where_("id", Op::Eq, "1"))
        .wait()?
        .expect("row");
    // rows written before the extension carry an empty cell
    assert_eq!(row["score"], serde_json::Value::Null);

    // tightening: dropping a column discards its cells
    table.extend("id:string|score:number").wait()?;
    let row = table
        .one(QueryBuilder::new().where_("id", Op::Eq, "1"))
        .wait()?
        .expect("row");
    assert!(!row.contains_key("name"));

    Ok(())
}

#[test]
fn missing_schema_fails_writes_only() -> Result<(), DbError> {
    let dir = tempdir()?;
    let table = Table::open(dir.path(), "bare", None)?;

    let err = table.insert(doc(json!({"id": "1"}))).wait();
    assert!(matches!(err, Err(DbError::SchemaMissing)));

    assert_eq!(table.count(QueryBuilder::new()).wait()?, 0);

    Ok(())
}

#[test]
fn date_columns_encode_as_millis() -> Result<(), DbError> {
    let dir = tempdir()?;
    let table = Table::open(dir.path(), "dated", Some("id:string|dt:date"))?;

    table
        .insert(doc(json!({"id": "1", "dt": "2024-05-15T00:00:00.000Z"})))
        .wait()?;

    let raw = fs_err::read_to_string(table.path())?;
    let row = raw.lines().nth(1).expect("data row");
    let millis: i64 = row.split('|').nth(2).expect("dt cell").parse().expect("millis");
    assert_eq!(millis, 1_715_731_200_000);

    let decoded = table.one(QueryBuilder::new()).wait()?.expect("row");
    assert_eq!(decoded["dt"], json!("2024-05-15T00:00:00.000Z"));

    Ok(())
}
