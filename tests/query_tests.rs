use serde_json::json;
use tempfile::tempdir;
use textdb::{
    Database, DbError, Document, Join, LikeMode, Op, QueryBuilder, ScalarKind,
};

fn doc(value: serde_json::Value) -> Document {
    value.as_object().cloned().expect("object literal")
}

fn seed_people(db: &Database) -> Result<(), DbError> {
    let rows = [
        json!({"id": 1, "name": "Ada Lovelace", "age": 36, "city": "london", "dt": "1815-12-10"}),
        json!({"id": 2, "name": "Alan Turing", "age": 41, "city": "london", "dt": "1912-06-23"}),
        json!({"id": 3, "name": "Grace Hopper", "age": 85, "city": "new york", "dt": "1906-12-09"}),
        json!({"id": 4, "name": "Edsger Dijkstra", "age": 72, "city": "rotterdam", "dt": "1930-05-11"}),
        json!({"id": 5, "name": "Barbara Liskov", "age": 83, "city": "los angeles", "dt": "1939-11-07"}),
    ];
    for row in rows {
        db.insert(doc(row)).wait()?;
    }
    Ok(())
}

#[test]
fn where_operators() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "ops")?;
    seed_people(&db)?;

    assert_eq!(
        db.count(QueryBuilder::new().where_("age", Op::Gt, 80)).wait()?,
        2
    );
    assert_eq!(
        db.count(QueryBuilder::new().where_("age", Op::Lte, 41)).wait()?,
        2
    );
    assert_eq!(
        db.count(QueryBuilder::new().where_("city", Op::Eq, "london"))
            .wait()?,
        2
    );
    assert_eq!(
        db.count(QueryBuilder::new().where_("city", Op::Ne, "london"))
            .wait()?,
        3
    );

    Ok(())
}

#[test]
fn or_group_folds_disjunctively() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "orgroup")?;
    seed_people(&db)?;

    let hits = db
        .find(
            QueryBuilder::new()
                .where_("age", Op::Lt, 90)
                .or()
                .where_("city", Op::Eq, "rotterdam")
                .where_("city", Op::Eq, "new york")
                .end(),
        )
        .wait()?;
    assert_eq!(hits.len(), 2);

    Ok(())
}

#[test]
fn in_between_and_like() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "inlike")?;
    seed_people(&db)?;

    assert_eq!(
        db.count(QueryBuilder::new().in_("id", vec![json!(1), json!(3), json!(9)]))
            .wait()?,
        2
    );
    assert_eq!(
        db.count(QueryBuilder::new().not_in("id", vec![json!(1), json!(3)]))
            .wait()?,
        3
    );
    assert_eq!(
        db.count(QueryBuilder::new().between("age", 40, 80)).wait()?,
        2
    );
    assert_eq!(
        db.count(QueryBuilder::new().like("name", "ada", LikeMode::Begins))
            .wait()?,
        1
    );
    assert_eq!(
        db.count(QueryBuilder::new().like("name", "turing", LikeMode::Ends))
            .wait()?,
        1
    );
    // list values join with a space before matching
    assert_eq!(
        db.count(QueryBuilder::new().like_list(
            "name",
            ["grace", "hopper"],
            LikeMode::Anywhere
        ))
        .wait()?,
        1
    );
    assert_eq!(
        db.count(QueryBuilder::new().like_list("name", ["ada", "love"], LikeMode::Begins))
            .wait()?,
        1
    );
    assert_eq!(
        db.count(QueryBuilder::new().search("name", "BARBARA")).wait()?,
        1
    );
    assert_eq!(
        db.count(QueryBuilder::new().regex("name", "^[AG]")).wait()?,
        3
    );

    Ok(())
}

#[test]
fn fulltext_token_threshold() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "fulltext")?;

    db.insert(doc(json!({"id": 1, "text": "the quick brown fox"})))
        .wait()?;
    db.insert(doc(json!({"id": 2, "text": "lazy dogs sleep"})))
        .wait()?;

    // all tokens must hit at weight 100
    assert_eq!(
        db.count(QueryBuilder::new().fulltext("text", "quick fox", None))
            .wait()?,
        1
    );
    // half the tokens suffice at weight 50
    assert_eq!(
        db.count(QueryBuilder::new().fulltext("text", "quick elephant", Some(50)))
            .wait()?,
        1
    );
    assert_eq!(
        db.count(QueryBuilder::new().fulltext("text", "quick elephant", None))
            .wait()?,
        0
    );
    // weight 0 requires no hits: every document with the field matches
    assert_eq!(
        db.count(QueryBuilder::new().fulltext("text", "zebra unicorn", Some(0)))
            .wait()?,
        2
    );
    // an all-whitespace value tokenizes to nothing and matches vacuously
    assert_eq!(
        db.count(QueryBuilder::new().fulltext("text", "   ", None))
            .wait()?,
        2
    );

    Ok(())
}

#[test]
fn date_parts() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "dates")?;
    seed_people(&db)?;

    assert_eq!(
        db.count(QueryBuilder::new().month("dt", Op::Eq, 12)).wait()?,
        2
    );
    assert_eq!(
        db.count(QueryBuilder::new().year("dt", Op::Gte, 1912)).wait()?,
        3
    );
    assert_eq!(
        db.count(QueryBuilder::new().day("dt", Op::Eq, 11)).wait()?,
        1
    );

    Ok(())
}

#[test]
fn contains_and_empty() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "contains")?;

    db.insert(doc(json!({"id": 1, "tags": ["a"]}))).wait()?;
    db.insert(doc(json!({"id": 2, "tags": []}))).wait()?;
    db.insert(doc(json!({"id": 3}))).wait()?;

    assert_eq!(db.count(QueryBuilder::new().contains("tags")).wait()?, 1);
    assert_eq!(db.count(QueryBuilder::new().empty("tags")).wait()?, 2);

    Ok(())
}

#[test]
fn sort_take_skip() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "sorted")?;
    seed_people(&db)?;

    // bounded in-order buffer path: sort + take
    let youngest = db
        .find(QueryBuilder::new().sort("age", true).take(2))
        .wait()?;
    assert_eq!(youngest.len(), 2);
    assert_eq!(youngest[0]["age"], json!(36));
    assert_eq!(youngest[1]["age"], json!(41));

    // post-pass sort path: no take
    let all = db.find(QueryBuilder::new().sort("age", false)).wait()?;
    assert_eq!(all[0]["age"], json!(85));

    let second_page = db
        .find(QueryBuilder::new().sort("age", true).skip(2).take(2))
        .wait()?;
    assert_eq!(second_page[0]["age"], json!(72));
    assert_eq!(second_page[1]["age"], json!(83));

    Ok(())
}

#[test]
fn projection_keeps_sort_key() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "fields")?;
    seed_people(&db)?;

    let rows = db
        .find(QueryBuilder::new().fields(&["id"]).sort("age", true))
        .wait()?;
    assert!(rows[0].contains_key("id"));
    assert!(rows[0].contains_key("age"));
    assert!(!rows[0].contains_key("name"));

    let rows = db
        .find(QueryBuilder::new().fields_exclude(&["name", "dt"]))
        .wait()?;
    assert!(rows[0].contains_key("id"));
    assert!(!rows[0].contains_key("name"));
    assert!(!rows[0].contains_key("dt"));

    Ok(())
}

#[test]
fn first_returns_at_most_one() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "firsts")?;
    seed_people(&db)?;

    let hit = db
        .one(QueryBuilder::new().where_("city", Op::Eq, "london"))
        .wait()?;
    assert_eq!(hit.expect("match")["id"], json!(1));

    let miss = db
        .one(QueryBuilder::new().where_("city", Op::Eq, "mars"))
        .wait()?;
    assert!(miss.is_none());

    Ok(())
}

#[test]
fn reverse_is_forward_reversed() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "reversed")?;
    seed_people(&db)?;

    let forward = db.find(QueryBuilder::new()).wait()?;
    let mut backward = db.find_reverse(QueryBuilder::new()).wait()?;
    backward.reverse();
    assert_eq!(forward, backward);

    // a reverse first() is the last written match
    let last = db
        .one_reverse(QueryBuilder::new().where_("city", Op::Eq, "london"))
        .wait()?;
    assert_eq!(last.expect("match")["id"], json!(2));

    Ok(())
}

#[test]
fn scalar_laws() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "scalars")?;
    seed_people(&db)?;

    let q = || QueryBuilder::new().where_("city", Op::Eq, "london");

    assert_eq!(
        db.scalar(q().scalar(ScalarKind::Count, None)).wait()?,
        json!(2)
    );
    assert_eq!(
        db.scalar(q().scalar(ScalarKind::Sum, Some("age"))).wait()?,
        json!(77)
    );
    assert_eq!(
        db.scalar(q().scalar(ScalarKind::Min, Some("age"))).wait()?,
        json!(36)
    );
    assert_eq!(
        db.scalar(q().scalar(ScalarKind::Max, Some("age"))).wait()?,
        json!(41)
    );
    assert_eq!(
        db.scalar(q().scalar(ScalarKind::Avg, Some("age"))).wait()?,
        json!(38.5)
    );

    let groups = db
        .scalar(QueryBuilder::new().scalar(ScalarKind::Group, Some("city")))
        .wait()?;
    assert_eq!(groups["london"], json!(2));
    assert_eq!(groups["rotterdam"], json!(1));

    Ok(())
}

#[test]
fn listing_pages() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "pages")?;

    for i in 0..25 {
        db.insert(doc(json!({"i": i}))).wait()?;
    }

    let page = db
        .listing(QueryBuilder::new().take(10).skip(10).sort("i", true))
        .wait()?;
    assert_eq!(page.page, 2);
    assert_eq!(page.pages, 3);
    assert_eq!(page.limit, 10);
    assert_eq!(page.count, 25);
    assert_eq!(page.items.len(), 10);
    assert_eq!(page.items[0]["i"], json!(10));

    Ok(())
}

#[test]
fn prepare_closure_is_anded() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "prepared")?;
    seed_people(&db)?;

    let hits = db
        .find(
            QueryBuilder::new()
                .where_("age", Op::Gt, 40)
                .prepare(|d, _| d["city"] == json!("london")),
        )
        .wait()?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["id"], json!(2));

    Ok(())
}

#[test]
fn require_result_surfaces_empty() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "empties")?;
    seed_people(&db)?;

    let err = db
        .find(
            QueryBuilder::new()
                .where_("city", Op::Eq, "mars")
                .require_result("nobody lives on mars"),
        )
        .wait();
    assert!(matches!(err, Err(DbError::EmptyResult(_))));

    Ok(())
}

#[test]
fn join_attaches_foreign_documents() -> Result<(), DbError> {
    let dir = tempdir()?;
    let users = Database::open(dir.path(), "users")?;
    let orders = Database::open(dir.path(), "orders")?;

    users.insert(doc(json!({"id": 1, "name": "ada"}))).wait()?;
    users.insert(doc(json!({"id": 2, "name": "alan"}))).wait()?;
    orders
        .insert(doc(json!({"user": 1, "total": 10})))
        .wait()?;
    orders
        .insert(doc(json!({"user": 1, "total": 15})))
        .wait()?;
    orders.insert(doc(json!({"user": 2, "total": 7}))).wait()?;

    let rows = users
        .find(QueryBuilder::new().join(Join::new("orders", &orders).on("id", "user")))
        .wait()?;
    assert_eq!(rows[0]["orders"].as_array().expect("array").len(), 2);
    assert_eq!(rows[1]["orders"].as_array().expect("array").len(), 1);

    let rows = users
        .find(
            QueryBuilder::new().join(
                Join::new("spent", &orders)
                    .on("id", "user")
                    .scalar(ScalarKind::Sum, "total"),
            ),
        )
        .wait()?;
    assert_eq!(rows[0]["spent"], json!(25));
    assert_eq!(rows[1]["spent"], json!(7));

    // self-joins would deadlock the worker, so they are rejected
    let err = users
        .find(QueryBuilder::new().join(Join::new("x", &users).on("id", "id")))
        .wait();
    assert!(matches!(err, Err(DbError::Unsupported(_))));

    Ok(())
}

#[test]
fn compiled_queries_are_cached() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "cached")?;
    seed_people(&db)?;

    // same id, same compiled predicate; both runs agree
    let q = || {
        QueryBuilder::new()
            .id("by-city")
            .where_("city", Op::Eq, "london")
    };
    assert_eq!(db.count(q()).wait()?, 2);
    assert_eq!(db.count(q()).wait()?, 2);

    Ok(())
}
