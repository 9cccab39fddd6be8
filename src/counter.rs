//! Counter engine: a compact per-key time series next to the data file.
//!
//! Each line of the counter file holds one `<kind><YYYY><id>` key, its
//! head aggregate and a list of daily buckets:
//!
//! ```text
//! sum2026visits=15;0801=9;0802=6
//! mma2026load=2X9;0801=2X7;0802=4X9
//! ```
//!
//! `sum` lines carry running integer sums, `mma` lines carry `minXmax`
//! pairs. The head aggregate always equals the reduction of the bucket
//! list. Mutations land in a RAM cache and are merged into the file by a
//! debounced flush that streams the old file once: untouched lines pass
//! through verbatim, touched lines get their head and today's bucket
//! merged, unseen keys are appended, then the file is swapped by rename.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Datelike, Utc};
use parking_lot::Mutex;
use tracing::warn;

use crate::errors::DbError;
use crate::events::{EventKind, Events};
use crate::stream::{DocReader, SwapWriter};

/// Reduction requested from a counter read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterMode {
    /// Running sums (`sum` lines).
    Sum,
    /// Minimum side of `mma` lines.
    Min,
    /// Maximum side of `mma` lines.
    Max,
    /// Midpoint `(min + max) / 2` of `mma` lines.
    Avg,
}

impl CounterMode {
    fn prefix(self) -> &'static str {
        match self {
            CounterMode::Sum => "sum",
            _ => "mma",
        }
    }
}

/// One slice of a yearly/monthly/daily read.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterSlice {
    pub id: String,
    pub year: i32,
    pub month: Option<u32>,
    pub day: Option<u32>,
    pub value: f64,
}

#[derive(Debug, Clone, Copy)]
enum Cell {
    Sum(i64),
    Mma(i64, i64),
}

impl Cell {
    fn parse(kind: &str, raw: &str) -> Option<Cell> {
        if kind == "mma" {
            let (min, max) = raw.split_once('X')?;
            Some(Cell::Mma(min.parse().ok()?, max.parse().ok()?))
        } else {
            Some(Cell::Sum(raw.parse().ok()?))
        }
    }

    fn render(self) -> String {
        match self {
            Cell::Sum(v) => v.to_string(),
            Cell::Mma(min, max) => format!("{min}X{max}"),
        }
    }

    fn merge(self, delta: &Delta) -> Cell {
        match (self, delta) {
            (Cell::Sum(v), Delta::Sum(d)) => Cell::Sum(v + d),
            (Cell::Mma(min, max), Delta::Mma { min: dmin, max: dmax }) => Cell::Mma(
                dmin.map_or(min, |d| min.min(d)),
                dmax.map_or(max, |d| max.max(d)),
            ),
            (cell, _) => cell,
        }
    }

    fn reduce(self, mode: CounterMode) -> f64 {
        match (self, mode) {
            (Cell::Sum(v), _) => v as f64,
            (Cell::Mma(min, _), CounterMode::Min) => min as f64,
            (Cell::Mma(_, max), CounterMode::Max) => max as f64,
            (Cell::Mma(min, max), _) => (min + max) as f64 / 2.0,
        }
    }
}

#[derive(Debug, Clone)]
enum Delta {
    Sum(i64),
    Mma { min: Option<i64>, max: Option<i64> },
}

impl Delta {
    fn initial(&self) -> Cell {
        match self {
            Delta::Sum(d) => Cell::Sum(*d),
            Delta::Mma { min, max } => {
                let a = min.or(*max).unwrap_or(0);
                let b = max.or(*min).unwrap_or(0);
                Cell::Mma(a.min(b), a.max(b))
            }
        }
    }
}

struct ParsedLine {
    kind: String,
    year: i32,
    id: String,
    head: Cell,
    buckets: Vec<(String, Cell)>,
}

fn parse_line(line: &str) -> Option<ParsedLine> {
    let mut parts = line.split(';');
    let first = parts.next()?;
    let (key, head_raw) = first.split_once('=')?;
    if key.len() < 8 {
        return None;
    }
    let kind = &key[..3];
    if kind != "sum" && kind != "mma" {
        return None;
    }
    let year: i32 = key[3..7].parse().ok()?;
    let id = key[7..].to_string();
    let head = Cell::parse(kind, head_raw)?;

    let mut buckets = Vec::new();
    for segment in parts {
        let (day, raw) = segment.split_once('=')?;
        buckets.push((day.to_string(), Cell::parse(kind, raw)?));
    }
    Some(ParsedLine {
        kind: kind.to_string(),
        year,
        id,
        head,
        buckets,
    })
}

fn render_line(parsed: &ParsedLine) -> String {
    let mut out = format!(
        "{}{:04}{}={}",
        parsed.kind,
        parsed.year,
        parsed.id,
        parsed.head.render()
    );
    for (day, cell) in &parsed.buckets {
        out.push(';');
        out.push_str(day);
        out.push('=');
        out.push_str(&cell.render());
    }
    out
}

struct CounterState {
    pending: HashMap<String, Delta>,
    removals: HashSet<String>,
    deadline: Option<Instant>,
}

/// Per-database hit/min/max accumulator with a debounced file flush.
#[derive(Clone)]
pub struct Counter {
    inner: Arc<CounterInner>,
}

struct CounterInner {
    path: PathBuf,
    tmp: PathBuf,
    events: Arc<Events>,
    interval: Duration,
    state: Mutex<CounterState>,
}

impl Counter {
    pub(crate) fn new(path: PathBuf, events: Arc<Events>, interval: Duration) -> Self {
        let tmp = {
            let mut os = path.clone().into_os_string();
            os.push("-tmp");
            PathBuf::from(os)
        };
        Counter {
            inner: Arc::new(CounterInner {
                path,
                tmp,
                events,
                interval,
                state: Mutex::new(CounterState {
                    pending: HashMap::new(),
                    removals: HashSet::new(),
                    deadline: None,
                }),
            }),
        }
    }

    /// Adds `n` to the running sum for `id` (current year, today's bucket).
    pub fn hit(&self, id: &str, n: i64) {
        self.mutate(
            format!("sum{}{}", current_year(), id),
            |delta| {
                if let Delta::Sum(v) = delta {
                    *v += n;
                }
            },
            Delta::Sum(0),
        );
        self.inner.events.emit(EventKind::Hit, n.max(0) as usize, None);
    }

    /// Merges an observed value into the minimum side of the `mma` pair.
    pub fn min(&self, id: &str, n: i64) {
        self.mutate(
            format!("mma{}{}", current_year(), id),
            |delta| {
                if let Delta::Mma { min, .. } = delta {
                    *min = Some(min.map_or(n, |m| m.min(n)));
                }
            },
            Delta::Mma {
                min: None,
                max: None,
            },
        );
        self.inner.events.emit(EventKind::Min, 1, None);
    }

    /// Merges an observed value into the maximum side of the `mma` pair.
    pub fn max(&self, id: &str, n: i64) {
        self.mutate(
            format!("mma{}{}", current_year(), id),
            |delta| {
                if let Delta::Mma { max, .. } = delta {
                    *max = Some(max.map_or(n, |m| m.max(n)));
                }
            },
            Delta::Mma {
                min: None,
                max: None,
            },
        );
        self.inner.events.emit(EventKind::Max, 1, None);
    }

    /// Forgets every series recorded for `id` at the next flush.
    pub fn remove(&self, id: &str) {
        let mut state = self.inner.state.lock();
        state
            .pending
            .retain(|key, _| !(key.len() == 7 + id.len() && key.ends_with(id)));
        state.removals.insert(id.to_string());
        self.arm(&mut state);
    }

    fn mutate(&self, key: String, apply: impl FnOnce(&mut Delta), fresh: Delta) {
        let mut flush_now = false;
        {
            let mut state = self.inner.state.lock();
            apply(state.pending.entry(key).or_insert(fresh));
            self.arm(&mut state);
            if let Some(deadline) = state.deadline {
                flush_now = Instant::now() >= deadline;
            }
        }
        if flush_now {
            if let Err(err) = self.flush() {
                warn!(error = %err, "counter flush failed");
            }
        }
    }

    fn arm(&self, state: &mut CounterState) {
        if state.deadline.is_none() {
            state.deadline = Some(Instant::now() + self.inner.interval);
        }
    }

    /// True when mutations are waiting for a flush.
    pub fn dirty(&self) -> bool {
        let state = self.inner.state.lock();
        !state.pending.is_empty() || !state.removals.is_empty()
    }

    /// Merges the RAM cache into the counter file and swaps it by rename.
    pub fn flush(&self) -> Result<(), DbError> {
        let mut state = self.inner.state.lock();
        if state.pending.is_empty() && state.removals.is_empty() {
            state.deadline = None;
            return Ok(());
        }
        let pending = std::mem::take(&mut state.pending);
        let removals = std::mem::take(&mut state.removals);
        state.deadline = None;

        match self.write_merged(&pending, &removals) {
            Ok(merged) => {
                drop(state);
                self.inner.events.emit(EventKind::Sum, merged, None);
                Ok(())
            }
            Err(err) => {
                // keep the deltas so a later flush can retry
                state.pending = pending;
                state.removals = removals;
                self.arm(&mut state);
                Err(err)
            }
        }
    }

    fn write_merged(
        &self,
        pending: &HashMap<String, Delta>,
        removals: &HashSet<String>,
    ) -> Result<usize, DbError> {
        let mut pending: HashMap<&String, &Delta> = pending.iter().collect();
        let today = today_bucket();
        let mut reader = DocReader::open(&self.inner.path)?;
        let mut writer = SwapWriter::create(&self.inner.path, &self.inner.tmp)?;
        let mut merged = 0usize;

        while let Some(record) = reader.next_line()? {
            if record.text.is_empty() {
                continue;
            }
            let Some(mut parsed) = parse_line(&record.text) else {
                warn!(line = %record.text, "skipping malformed counter line");
                continue;
            };
            if removals.contains(&parsed.id) {
                continue;
            }
            let key = format!("{}{:04}{}", parsed.kind, parsed.year, parsed.id);
            match pending.remove(&key) {
                // untouched series stream through unmodified
                None => writer.write_line(&record.text)?,
                Some(delta) => {
                    parsed.head = parsed.head.merge(delta);
                    match parsed.buckets.iter().position(|(day, _)| day == &today) {
                        Some(at) => parsed.buckets[at].1 = parsed.buckets[at].1.merge(delta),
                        None => parsed.buckets.push((today.clone(), delta.initial())),
                    }
                    writer.write_line(&render_line(&parsed))?;
                    merged += 1;
                }
            }
        }

        // series that never appeared in the file
        for (key, delta) in pending {
            let head = delta.initial();
            let parsed = ParsedLine {
                kind: key[..3].to_string(),
                year: key[3..7].parse().unwrap_or_else(|_| current_year_num()),
                id: key[7..].to_string(),
                head,
                buckets: vec![(today.clone(), head)],
            };
            writer.write_line(&render_line(&parsed))?;
            merged += 1;
        }

        writer.commit()?;
        Ok(merged)
    }

    fn load(&self) -> Result<Vec<ParsedLine>, DbError> {
        let mut reader = DocReader::open(&self.inner.path)?;
        let mut lines = Vec::new();
        while let Some(record) = reader.next_line()? {
            if record.text.is_empty() {
                continue;
            }
            match parse_line(&record.text) {
                Some(parsed) => lines.push(parsed),
                None => warn!(line = %record.text, "skipping malformed counter line"),
            }
        }
        Ok(lines)
    }

    /// Head aggregate for one id in the current year.
    pub fn read(&self, id: &str, mode: CounterMode) -> Result<Option<f64>, DbError> {
        let year = current_year_num();
        Ok(self
            .load()?
            .into_iter()
            .find(|line| line.kind == mode.prefix() && line.id == id && line.year == year)
            .map(|line| line.head.reduce(mode)))
    }

    /// Reduction across every id's head aggregate in the current year.
    pub fn read_all(&self, mode: CounterMode) -> Result<f64, DbError> {
        let year = current_year_num();
        let values: Vec<f64> = self
            .load()?
            .into_iter()
            .filter(|line| line.kind == mode.prefix() && line.year == year)
            .map(|line| line.head.reduce(mode))
            .collect();
        Ok(reduce_values(&values, mode))
    }

    /// One slice per id and year.
    pub fn yearly(
        &self,
        ids: Option<&[&str]>,
        mode: CounterMode,
    ) -> Result<Vec<CounterSlice>, DbError> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|line| line.kind == mode.prefix() && id_selected(ids, &line.id))
            .map(|line| CounterSlice {
                value: line.head.reduce(mode),
                id: line.id,
                year: line.year,
                month: None,
                day: None,
            })
            .collect())
    }

    /// One slice per id and month of `year`.
    pub fn monthly(
        &self,
        ids: Option<&[&str]>,
        year: i32,
        mode: CounterMode,
    ) -> Result<Vec<CounterSlice>, DbError> {
        let mut out = Vec::new();
        for line in self.load()? {
            if line.kind != mode.prefix() || line.year != year || !id_selected(ids, &line.id) {
                continue;
            }
            let mut months: Vec<(u32, Vec<f64>)> = Vec::new();
            for (day_key, cell) in &line.buckets {
                let Some(month) = bucket_month(day_key) else {
                    continue;
                };
                let value = cell.reduce(mode);
                match months.iter().position(|(m, _)| *m == month) {
                    Some(at) => months[at].1.push(value),
                    None => months.push((month, vec![value])),
                }
            }
            for (month, values) in months {
                out.push(CounterSlice {
                    id: line.id.clone(),
                    year,
                    month: Some(month),
                    day: None,
                    value: reduce_values(&values, mode),
                });
            }
        }
        Ok(out)
    }

    /// One slice per id and daily bucket, optionally restricted to a month.
    pub fn daily(
        &self,
        ids: Option<&[&str]>,
        year: i32,
        month: Option<u32>,
        mode: CounterMode,
    ) -> Result<Vec<CounterSlice>, DbError> {
        let mut out = Vec::new();
        for line in self.load()? {
            if line.kind != mode.prefix() || line.year != year || !id_selected(ids, &line.id) {
                continue;
            }
            for (day_key, cell) in &line.buckets {
                let (Some(m), Some(d)) = (bucket_month(day_key), bucket_day(day_key)) else {
                    continue;
                };
                if month.is_some_and(|want| want != m) {
                    continue;
                }
                out.push(CounterSlice {
                    id: line.id.clone(),
                    year,
                    month: Some(m),
                    day: Some(d),
                    value: cell.reduce(mode),
                });
            }
        }
        Ok(out)
    }

    /// Top-N ids by aggregate over the requested window, bounded
    /// insertion sort; later arrivals never displace earlier equals.
    pub fn stats(
        &self,
        top: usize,
        year: Option<i32>,
        month: Option<u32>,
        day: Option<u32>,
        mode: CounterMode,
    ) -> Result<Vec<(String, f64)>, DbError> {
        let mut totals: Vec<(String, Vec<f64>)> = Vec::new();
        for line in self.load()? {
            if line.kind != mode.prefix() {
                continue;
            }
            if year.is_some_and(|want| want != line.year) {
                continue;
            }
            let mut values = Vec::new();
            if month.is_none() && day.is_none() {
                values.push(line.head.reduce(mode));
            } else {
                for (day_key, cell) in &line.buckets {
                    let (Some(m), Some(d)) = (bucket_month(day_key), bucket_day(day_key)) else {
                        continue;
                    };
                    if month.is_some_and(|want| want != m) || day.is_some_and(|want| want != d) {
                        continue;
                    }
                    values.push(cell.reduce(mode));
                }
            }
            if values.is_empty() {
                continue;
            }
            match totals.iter().position(|(id, _)| id == &line.id) {
                Some(at) => totals[at].1.extend(values),
                None => totals.push((line.id, values)),
            }
        }

        let mut ranked: Vec<(String, f64)> = Vec::with_capacity(top + 1);
        for (id, values) in totals {
            let value = reduce_values(&values, mode);
            let at = ranked
                .iter()
                .position(|(_, held)| value > *held)
                .unwrap_or(ranked.len());
            if at < top {
                ranked.insert(at, (id, value));
                ranked.truncate(top);
            }
        }

        self.inner.events.emit(EventKind::Stats, ranked.len(), None);
        Ok(ranked)
    }

    /// Removes the counter file; used by the drop operation.
    pub(crate) fn destroy(&self) -> Result<(), DbError> {
        let mut state = self.inner.state.lock();
        state.pending.clear();
        state.removals.clear();
        state.deadline = None;
        match fs_err::remove_file(&self.inner.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn id_selected(ids: Option<&[&str]>, id: &str) -> bool {
    ids.is_none_or(|list| list.contains(&id))
}

fn reduce_values(values: &[f64], mode: CounterMode) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    match mode {
        CounterMode::Sum => values.iter().sum(),
        CounterMode::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        CounterMode::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        CounterMode::Avg => values.iter().sum::<f64>() / values.len() as f64,
    }
}

fn current_year() -> String {
    format!("{:04}", Utc::now().year())
}

fn current_year_num() -> i32 {
    Utc::now().year()
}

fn today_bucket() -> String {
    let now = Utc::now();
    format!("{:02}{:02}", now.month(), now.day())
}

fn bucket_month(key: &str) -> Option<u32> {
    key.get(..2)?.parse().ok()
}

fn bucket_day(key: &str) -> Option<u32> {
    key.get(2..4)?.parse().ok()
}
