use chrono::{Datelike, Utc};
use tempfile::tempdir;
use textdb::{CounterMode, Database, DbError};

fn today_bucket() -> String {
    let now = Utc::now();
    format!("{:02}{:02}", now.month(), now.day())
}

#[test]
fn hits_accumulate_and_flush() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "hits")?;
    let counter = db.counter();

    counter.hit("p", 3);
    counter.hit("p", 2);
    counter.hit("q", 1);
    counter.flush()?;

    assert_eq!(counter.read("p", CounterMode::Sum)?, Some(5.0));
    assert_eq!(counter.read("q", CounterMode::Sum)?, Some(1.0));
    assert_eq!(counter.read_all(CounterMode::Sum)?, 6.0);

    let daily = counter.daily(Some(&["p"]), Utc::now().year(), None, CounterMode::Sum)?;
    assert_eq!(daily.len(), 1);
    assert_eq!(daily[0].value, 5.0);
    assert_eq!(daily[0].day, Some(Utc::now().day()));

    Ok(())
}

#[test]
fn flush_merges_into_existing_lines() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "merged")?;
    let counter = db.counter();
    let year = Utc::now().year();

    // pre-seeded file: an old bucket plus an untouched series; pick a
    // seed day that cannot collide with today's bucket
    let seed_day = if today_bucket() == "0101" { "0102" } else { "0101" };
    let seeded = format!("sum{year}p=10;{seed_day}=10\nsum{year}z=7;0215=7\n");
    fs_err::write(dir.path().join("merged.nosql-counter2"), &seeded)?;

    counter.hit("p", 5);
    counter.flush()?;

    let raw = fs_err::read_to_string(dir.path().join("merged.nosql-counter2"))?;
    let p_line = raw
        .lines()
        .find(|l| l.starts_with(&format!("sum{year}p=")))
        .expect("p line");
    assert!(p_line.starts_with(&format!("sum{year}p=15;{seed_day}=10;")));
    assert!(p_line.ends_with(&format!("{}=5", today_bucket())));

    // the untouched series streamed through byte for byte
    assert!(raw.lines().any(|l| l == format!("sum{year}z=7;0215=7")));

    assert_eq!(counter.read("p", CounterMode::Sum)?, Some(15.0));

    Ok(())
}

#[test]
fn min_max_share_one_mma_pair() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "mma")?;
    let counter = db.counter();
    let year = Utc::now().year();

    counter.min("load", 5);
    counter.max("load", 9);
    counter.min("load", 2);
    counter.flush()?;

    let raw = fs_err::read_to_string(dir.path().join("mma.nosql-counter2"))?;
    assert!(raw.starts_with(&format!("mma{year}load=2X9;")));

    assert_eq!(counter.read("load", CounterMode::Min)?, Some(2.0));
    assert_eq!(counter.read("load", CounterMode::Max)?, Some(9.0));
    assert_eq!(counter.read("load", CounterMode::Avg)?, Some(5.5));

    Ok(())
}

#[test]
fn yearly_and_monthly_slices() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "slices")?;
    let counter = db.counter();

    // two years of history for one id, written directly
    let seeded = "sum2025visits=12;0301=4;0302=8\nsum2026visits=3;0115=3\n";
    fs_err::write(dir.path().join("slices.nosql-counter2"), seeded)?;

    let yearly = counter.yearly(Some(&["visits"]), CounterMode::Sum)?;
    assert_eq!(yearly.len(), 2);
    assert!(yearly.iter().any(|s| s.year == 2025 && s.value == 12.0));
    assert!(yearly.iter().any(|s| s.year == 2026 && s.value == 3.0));

    let monthly = counter.monthly(Some(&["visits"]), 2025, CounterMode::Sum)?;
    assert_eq!(monthly.len(), 1);
    assert_eq!(monthly[0].month, Some(3));
    assert_eq!(monthly[0].value, 12.0);

    let daily = counter.daily(Some(&["visits"]), 2025, Some(3), CounterMode::Sum)?;
    assert_eq!(daily.len(), 2);
    assert_eq!(daily[0].day, Some(1));
    assert_eq!(daily[0].value, 4.0);

    Ok(())
}

#[test]
fn stats_rank_top_ids() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "ranked")?;
    let counter = db.counter();

    // seeded directly so the line order is fixed
    let seeded = "sum2026a=10;0110=10\nsum2026b=30;0110=30\n\
                  sum2026c=20;0110=20\nsum2026d=30;0110=30\n";
    fs_err::write(dir.path().join("ranked.nosql-counter2"), seeded)?;

    let top = counter.stats(3, None, None, None, CounterMode::Sum)?;
    assert_eq!(top.len(), 3);
    assert_eq!(top[0].1, 30.0);
    assert_eq!(top[1].1, 30.0);
    // ties: the later arrival never displaces the earlier equal
    assert_eq!(top[0].0, "b");
    assert_eq!(top[1].0, "d");
    assert_eq!(top[2], ("c".to_string(), 20.0));

    Ok(())
}

#[test]
fn remove_drops_every_series_for_an_id() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "forgotten")?;
    let counter = db.counter();

    counter.hit("keep", 1);
    counter.hit("gone", 2);
    counter.flush()?;

    counter.remove("gone");
    counter.flush()?;

    assert_eq!(counter.read("gone", CounterMode::Sum)?, None);
    assert_eq!(counter.read("keep", CounterMode::Sum)?, Some(1.0));

    Ok(())
}

#[test]
fn unflushed_mutations_are_dirty() -> Result<(), DbError> {
    let dir = tempdir()?;
    let db = Database::open(dir.path(), "dirty")?;
    let counter = db.counter();

    assert!(!counter.dirty());
    counter.hit("x", 1);
    assert!(counter.dirty());
    counter.flush()?;
    assert!(!counter.dirty());

    Ok(())
}
