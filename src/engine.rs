//! Database engine: the facade that owns the data file and dispatches
//! queued operations through the streaming engine.
//!
//! Every public call enqueues a job and returns a [`Pending`] completion
//! handle; a dedicated worker thread per database drains the queues in the
//! scheduler's priority order, so at most one phase touches the file at a
//! time. Writes pending together share one streaming pass.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Condvar, Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, warn};

use crate::codec;
use crate::counter::Counter;
use crate::document::{self, Document};
use crate::errors::DbError;
use crate::events::{EventKind, Events};
use crate::filter::{self, CompiledPredicate, QueryCache, ScalarAcc};
use crate::query::{Join, Listing, Modify, QueryBuilder, Sort};
use crate::scheduler::{
    completion, resolved, AppendJob, Completer, Exclusive, Pending, ReaderJob, ReaderSink,
    RemoveJob, SchedState, StreamJob, Tick, UpdateJob,
};
use crate::schema::Schema;
use crate::stream::{append_file, DocReader, ReverseLineReader, SwapWriter, UpdateSession};

/// Construction options; all paths resolve against the root directory
/// given at `open`.
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// Reject every write operation with [`DbError::ReadOnly`].
    pub readonly: bool,
    /// Records per `append_file` batch.
    pub buffer_size: usize,
    /// Debounce window for counter flushes.
    pub counter_flush: Duration,
    /// Enables the backup sidecar: pre-change lines are stamped with this
    /// user label before tombstoning.
    pub backup_user: Option<String>,
    /// Enables the human-readable operation log sidecar.
    pub log_writes: bool,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        DatabaseOptions {
            readonly: false,
            buffer_size: 20,
            counter_flush: Duration::from_secs(30),
            backup_user: None,
            log_writes: false,
        }
    }
}

/// Which codec the data file speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StorageKind {
    Document,
    Table,
}

/// Sidecar layout around the data file.
#[derive(Debug, Clone)]
pub(crate) struct DbPaths {
    pub data: PathBuf,
    pub tmp: PathBuf,
    pub meta: PathBuf,
    pub counter: PathBuf,
    pub log: PathBuf,
    pub backup: PathBuf,
}

impl DbPaths {
    fn new(directory: &Path, name: &str, kind: StorageKind) -> DbPaths {
        let ext = match kind {
            StorageKind::Document => "nosql",
            StorageKind::Table => "table",
        };
        let file = |suffix: &str| directory.join(format!("{name}.{ext}{suffix}"));
        DbPaths {
            data: file(""),
            tmp: file("-tmp"),
            meta: match kind {
                StorageKind::Document => directory.join(format!("{name}.meta")),
                StorageKind::Table => file("-meta"),
            },
            counter: file("-counter2"),
            log: file("-log"),
            backup: file("-backup"),
        }
    }
}

#[derive(Default)]
struct StatCells {
    inserted: AtomicU64,
    append_batches: AtomicU64,
    skipped_lines: AtomicU64,
}

/// Telemetry snapshot; `skipped_lines` makes corrupt lines observable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub inserted: u64,
    pub append_batches: u64,
    pub skipped_lines: u64,
}

struct MetaState {
    data: Document,
    dirty: bool,
}

pub(crate) struct DbInner {
    name: String,
    pub(crate) paths: DbPaths,
    options: DatabaseOptions,
    kind: StorageKind,
    pub(crate) schema: RwLock<Option<Schema>>,
    sched: Mutex<SchedState>,
    signal: Condvar,
    events: Arc<Events>,
    counter: Counter,
    cache: QueryCache,
    meta: Mutex<MetaState>,
    released: AtomicBool,
    stats: StatCells,
}

/// A handle to one embedded database instance.
///
/// Handles are cheap clones of the same instance. The worker thread stops
/// once every handle is gone, so keep one alive until pending operations
/// have been waited on; `release` shuts the instance down gracefully.
#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Arc<DbInner>,
}

impl Database {
    /// Opens (or creates) a JSON document database `<name>.nosql` under
    /// the root directory.
    pub fn open(directory: impl AsRef<Path>, name: &str) -> Result<Database, DbError> {
        Database::open_with(directory, name, DatabaseOptions::default())
    }

    /// `open` with explicit options.
    pub fn open_with(
        directory: impl AsRef<Path>,
        name: &str,
        options: DatabaseOptions,
    ) -> Result<Database, DbError> {
        Database::build(
            directory.as_ref(),
            name,
            options,
            StorageKind::Document,
            None,
        )
    }

    pub(crate) fn build(
        directory: &Path,
        name: &str,
        options: DatabaseOptions,
        kind: StorageKind,
        schema: Option<Schema>,
    ) -> Result<Database, DbError> {
        fs_err::create_dir_all(directory)?;
        let paths = DbPaths::new(directory, name, kind);
        let meta = load_meta(&paths.meta)?;
        let events = Arc::new(Events::default());
        let counter = Counter::new(paths.counter.clone(), events.clone(), options.counter_flush);

        let inner = Arc::new(DbInner {
            name: name.to_string(),
            paths,
            options,
            kind,
            schema: RwLock::new(schema),
            sched: Mutex::new(SchedState::new()),
            signal: Condvar::new(),
            events,
            counter,
            cache: QueryCache::default(),
            meta: Mutex::new(MetaState {
                data: meta,
                dirty: false,
            }),
            released: AtomicBool::new(false),
            stats: StatCells::default(),
        });

        let weak = Arc::downgrade(&inner);
        std::thread::Builder::new()
            .name(format!("textdb-{name}"))
            .spawn(move || worker(weak))?;

        Ok(Database { inner })
    }

    /// The database name supplied at `open`.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Path of the data file.
    pub fn path(&self) -> &Path {
        &self.inner.paths.data
    }

    fn check_write(&self) -> Result<(), DbError> {
        if self.inner.released.load(AtomicOrdering::SeqCst) {
            return Err(DbError::Released);
        }
        if self.inner.options.readonly {
            return Err(DbError::ReadOnly);
        }
        if self.inner.kind == StorageKind::Table && self.inner.schema.read().is_none() {
            return Err(DbError::SchemaMissing);
        }
        Ok(())
    }

    fn check_read(&self) -> Result<(), DbError> {
        if self.inner.released.load(AtomicOrdering::SeqCst) {
            return Err(DbError::Released);
        }
        Ok(())
    }

    fn wake(&self) {
        self.inner.signal.notify_all();
    }

    /// Queues one document for append. Appends submitted together share a
    /// single batched write.
    pub fn insert(&self, doc: Document) -> Pending<usize> {
        if let Err(err) = self.check_write() {
            return resolved(Err(err));
        }
        let (done, pending) = completion();
        self.inner.sched.lock().append.push(AppendJob { doc, done });
        self.wake();
        pending
    }

    fn submit_reader(&self, query: QueryBuilder, reverse: bool, sink: ReaderSink) {
        let job = ReaderJob {
            query: query.seal(),
            sink,
        };
        let mut sched = self.inner.sched.lock();
        if reverse {
            sched.reader_reverse.push(job);
        } else {
            sched.reader.push(job);
        }
        drop(sched);
        self.wake();
    }

    /// Runs a forward query and collects the matching documents.
    pub fn find(&self, query: QueryBuilder) -> Pending<Vec<Document>> {
        if let Err(err) = self.check_read() {
            return resolved(Err(err));
        }
        let (done, pending) = completion();
        self.submit_reader(query, false, ReaderSink::Docs(done));
        pending
    }

    /// `find` scanning from the end of the file; latest matches first.
    pub fn find_reverse(&self, query: QueryBuilder) -> Pending<Vec<Document>> {
        if let Err(err) = self.check_read() {
            return resolved(Err(err));
        }
        let (done, pending) = completion();
        self.submit_reader(query, true, ReaderSink::Docs(done));
        pending
    }

    /// First matching document, forward order.
    pub fn one(&self, query: QueryBuilder) -> Pending<Option<Document>> {
        if let Err(err) = self.check_read() {
            return resolved(Err(err));
        }
        let (done, pending) = completion();
        self.submit_reader(query.first(), false, ReaderSink::One(done));
        pending
    }

    /// First matching document scanning backwards: the last written match.
    pub fn one_reverse(&self, query: QueryBuilder) -> Pending<Option<Document>> {
        if let Err(err) = self.check_read() {
            return resolved(Err(err));
        }
        let (done, pending) = completion();
        self.submit_reader(query.first(), true, ReaderSink::One(done));
        pending
    }

    /// Number of matching documents.
    pub fn count(&self, query: QueryBuilder) -> Pending<usize> {
        if let Err(err) = self.check_read() {
            return resolved(Err(err));
        }
        let (done, pending) = completion();
        self.submit_reader(query, false, ReaderSink::Count(done));
        pending
    }

    /// Scalar reduction; the builder must carry a `scalar` option.
    pub fn scalar(&self, query: QueryBuilder) -> Pending<Value> {
        if let Err(err) = self.check_read() {
            return resolved(Err(err));
        }
        if query.scalar.is_none() {
            return resolved(Err(DbError::Unsupported(
                "scalar query without a scalar option",
            )));
        }
        let (done, pending) = completion();
        self.submit_reader(query, false, ReaderSink::Scalar(done));
        pending
    }

    /// Paginated result page computed from `take`, `skip` and the total
    /// match count.
    pub fn listing(&self, query: QueryBuilder) -> Pending<Listing> {
        if let Err(err) = self.check_read() {
            return resolved(Err(err));
        }
        let (done, pending) = completion();
        self.submit_reader(query.listing(), false, ReaderSink::Listing(done));
        pending
    }

    /// Applies a change set to every document matching the query; resolves
    /// to the number of touched documents.
    pub fn update(&self, query: QueryBuilder, modify: Modify) -> Pending<usize> {
        self.submit_update(query, modify, None)
    }

    /// Field-merge shorthand (`Modify::Merge`).
    pub fn modify(&self, query: QueryBuilder, changes: Document) -> Pending<usize> {
        self.submit_update(query, Modify::Merge(changes), None)
    }

    /// `update` that inserts `fallback` when nothing matched.
    pub fn update_or_insert(
        &self,
        query: QueryBuilder,
        modify: Modify,
        fallback: Document,
    ) -> Pending<usize> {
        self.submit_update(query, modify, Some(fallback))
    }

    fn submit_update(
        &self,
        query: QueryBuilder,
        modify: Modify,
        insert: Option<Document>,
    ) -> Pending<usize> {
        if let Err(err) = self.check_write() {
            return resolved(Err(err));
        }
        let (done, pending) = completion();
        self.inner.sched.lock().update.push(UpdateJob {
            query: query.seal(),
            modify,
            insert,
            done,
        });
        self.wake();
        pending
    }

    /// Tombstones every document matching the query.
    pub fn remove(&self, query: QueryBuilder) -> Pending<usize> {
        if let Err(err) = self.check_write() {
            return resolved(Err(err));
        }
        let (done, pending) = completion();
        self.inner.sched.lock().remove.push(RemoveJob {
            query: query.seal(),
            done,
        });
        self.wake();
        pending
    }

    /// Visits every live document in file order; return `false` from the
    /// callback to stop early. Resolves to the number of visited documents.
    pub fn stream(&self, visit: impl FnMut(&Document) -> bool + Send + 'static) -> Pending<usize> {
        if let Err(err) = self.check_read() {
            return resolved(Err(err));
        }
        let (done, pending) = completion();
        self.inner.sched.lock().stream.push(StreamJob {
            visit: Box::new(visit),
            done,
        });
        self.wake();
        pending
    }

    fn submit_exclusive(&self, job: Exclusive) {
        self.inner.sched.lock().exclusive.push_back(job);
        self.wake();
    }

    /// Deletes the data file (tables re-emit their schema header).
    pub fn clear(&self) -> Pending<()> {
        if let Err(err) = self.check_write() {
            return resolved(Err(err));
        }
        let (done, pending) = completion();
        self.submit_exclusive(Exclusive::Clear(done));
        pending
    }

    /// Rewrites the file without tombstoned lines; the only compaction.
    pub fn clean(&self) -> Pending<()> {
        if let Err(err) = self.check_write() {
            return resolved(Err(err));
        }
        let (done, pending) = completion();
        self.submit_exclusive(Exclusive::Clean(done));
        pending
    }

    /// Deletes the data file and every sidecar, detaches listeners and
    /// shuts the instance down.
    pub fn destroy(&self) -> Pending<()> {
        if let Err(err) = self.check_write() {
            return resolved(Err(err));
        }
        let (done, pending) = completion();
        self.submit_exclusive(Exclusive::Drop(done));
        pending
    }

    /// Copies the data file to `target` while no other phase runs.
    pub fn backup_to(&self, target: impl Into<PathBuf>) -> Pending<()> {
        if let Err(err) = self.check_read() {
            return resolved(Err(err));
        }
        let (done, pending) = completion();
        self.submit_exclusive(Exclusive::Backup(target.into(), done));
        pending
    }

    /// Replaces the data file from `source` while no other phase runs.
    pub fn restore_from(&self, source: impl Into<PathBuf>) -> Pending<()> {
        if let Err(err) = self.check_write() {
            return resolved(Err(err));
        }
        let (done, pending) = completion();
        self.submit_exclusive(Exclusive::Restore(source.into(), done));
        pending
    }

    /// Runs `f` with the scheduler halted: no other phase overlaps it.
    /// Operations enqueued inside `f` drain after it returns.
    pub fn lock(&self, f: impl FnOnce(&Database) + Send + 'static) -> Pending<()> {
        if let Err(err) = self.check_read() {
            return resolved(Err(err));
        }
        let (done, pending) = completion();
        self.submit_exclusive(Exclusive::Lock(Box::new(f), done));
        pending
    }

    pub(crate) fn submit_extend(&self, schema: Schema) -> Pending<()> {
        if let Err(err) = self.check_write() {
            return resolved(Err(err));
        }
        let (done, pending) = completion();
        self.submit_exclusive(Exclusive::Extend(schema, done));
        pending
    }

    /// Registers a listener for one event kind.
    pub fn on(
        &self,
        kind: EventKind,
        listener: impl Fn(&crate::events::Event<'_>) + Send + Sync + 'static,
    ) {
        self.inner.events.on(kind, listener);
    }

    /// The per-database counter engine.
    pub fn counter(&self) -> Counter {
        self.inner.counter.clone()
    }

    /// One metadata value from the JSON sidecar.
    pub fn meta(&self, key: &str) -> Option<Value> {
        self.inner.meta.lock().data.get(key).cloned()
    }

    /// Sets a metadata value; persisted by `meta_save` or at release.
    pub fn meta_set(&self, key: impl Into<String>, value: Value) {
        let mut meta = self.inner.meta.lock();
        meta.data.insert(key.into(), value);
        meta.dirty = true;
    }

    /// Writes the metadata sidecar if it changed.
    pub fn meta_save(&self) -> Result<(), DbError> {
        let mut meta = self.inner.meta.lock();
        if !meta.dirty {
            return Ok(());
        }
        let text = serde_json::to_string(&meta.data)?;
        fs_err::write(&self.inner.paths.meta, text)?;
        meta.dirty = false;
        Ok(())
    }

    /// Telemetry counters.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            inserted: self.inner.stats.inserted.load(AtomicOrdering::Relaxed),
            append_batches: self
                .inner
                .stats
                .append_batches
                .load(AtomicOrdering::Relaxed),
            skipped_lines: self
                .inner
                .stats
                .skipped_lines
                .load(AtomicOrdering::Relaxed),
        }
    }

    /// Graceful shutdown: flushes meta and counter, detaches listeners,
    /// lets already-queued operations drain, rejects new ones.
    pub fn release(&self) -> Result<(), DbError> {
        self.inner.released.store(true, AtomicOrdering::SeqCst);
        let meta_result = self.meta_save();
        let counter_result = self.inner.counter.flush();
        self.inner.events.detach();
        self.inner.sched.lock().shutdown = true;
        self.wake();
        meta_result.and(counter_result)
    }
}

fn load_meta(path: &Path) -> Result<Document, DbError> {
    match fs_err::read_to_string(path) {
        Ok(text) => match serde_json::from_str(&text) {
            Ok(doc) => Ok(doc),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "discarding malformed meta sidecar");
                Ok(Document::new())
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Document::new()),
        Err(err) => Err(err.into()),
    }
}

// ---------------------------------------------------------------------------
// worker
// ---------------------------------------------------------------------------

fn worker(weak: Weak<DbInner>) {
    loop {
        let Some(inner) = weak.upgrade() else { return };
        let tick = {
            let mut sched = inner.sched.lock();
            match sched.select() {
                Some(tick) => Some(tick),
                None => {
                    if sched.shutdown {
                        sched.reject_all(DbError::Released);
                        return;
                    }
                    // bounded park so dropped handles are noticed
                    inner
                        .signal
                        .wait_for(&mut sched, Duration::from_millis(100));
                    sched.select()
                }
            }
        };
        let Some(tick) = tick else {
            continue;
        };
        let step = tick.step();
        debug!(db = %inner.name, step = ?step, "phase start");
        run_tick(&inner, tick);
        inner.sched.lock().finish(step);
    }
}

fn run_tick(inner: &Arc<DbInner>, tick: Tick) {
    match tick {
        Tick::Append(jobs) => exec_append(inner, jobs),
        Tick::Update(jobs) => exec_update(inner, jobs),
        Tick::Remove(jobs) => exec_remove(inner, jobs),
        Tick::Reader(jobs) => exec_readers(inner, jobs, false),
        Tick::ReaderReverse(jobs) => exec_readers(inner, jobs, true),
        Tick::Stream(jobs) => exec_stream(inner, jobs),
        Tick::Exclusive(job) => exec_exclusive(inner, job),
    }
}

fn encode_line(inner: &DbInner, doc: &Document) -> Result<String, DbError> {
    match inner.kind {
        StorageKind::Document => codec::encode_document(doc),
        StorageKind::Table => {
            let schema = inner.schema.read();
            let schema = schema.as_ref().ok_or(DbError::SchemaMissing)?;
            codec::encode_row(doc, schema)
        }
    }
}

fn decode_line(inner: &DbInner, record_position: u64, text: &str) -> Option<Document> {
    if inner.kind == StorageKind::Table {
        // the schema header always occupies the first line
        if record_position == 0 {
            return None;
        }
        let schema = inner.schema.read();
        return codec::decode_row(text, schema.as_ref()?, None);
    }
    match codec::decode_document(text) {
        Ok(doc) => doc,
        Err(err) => {
            inner
                .stats
                .skipped_lines
                .fetch_add(1, AtomicOrdering::Relaxed);
            warn!(db = %inner.name, error = %err, "skipping malformed line");
            None
        }
    }
}

fn log_write(inner: &DbInner, op: &str, count: usize) {
    if !inner.options.log_writes {
        return;
    }
    let stamp = Utc::now().format("%Y-%m-%d %H:%M");
    let line = format!("{stamp} | {op:<10} | {count}\n");
    if let Err(err) = append_file(&inner.paths.log, line.as_bytes()) {
        warn!(db = %inner.name, error = %err, "operation log write failed");
    }
}

// ---------------------------------------------------------------------------
// append phase
// ---------------------------------------------------------------------------

fn exec_append(inner: &Arc<DbInner>, jobs: Vec<AppendJob>) {
    let mut encoded = Vec::with_capacity(jobs.len());
    let mut completions = Vec::with_capacity(jobs.len());
    let mut failed: Option<DbError> = None;

    for job in jobs {
        if failed.is_none() {
            match encode_line(inner, &job.doc) {
                Ok(line) => encoded.push(line),
                Err(err) => failed = Some(err),
            }
        }
        completions.push((job.doc, job.done));
    }

    if failed.is_none() {
        for chunk in encoded.chunks(inner.options.buffer_size.max(1)) {
            let mut batch = String::with_capacity(chunk.iter().map(|l| l.len() + 1).sum());
            for line in chunk {
                batch.push_str(line);
                batch.push('\n');
            }
            if let Err(err) = append_file(&inner.paths.data, batch.as_bytes()) {
                failed = Some(err);
                break;
            }
            inner
                .stats
                .append_batches
                .fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    match failed {
        // a batch failure surfaces once to every job that shared it
        Some(err) => {
            for (_, done) in completions {
                done.complete(Err(err.clone()));
            }
        }
        None => {
            let count = completions.len();
            inner
                .stats
                .inserted
                .fetch_add(count as u64, AtomicOrdering::Relaxed);
            for (doc, done) in completions {
                inner.events.emit_change(EventKind::Insert, 1, Some(&doc));
                done.complete(Ok(1));
            }
            log_write(inner, "insert", count);
        }
    }
}

// ---------------------------------------------------------------------------
// update & remove phases
// ---------------------------------------------------------------------------

struct ActiveWrite {
    predicate: Arc<CompiledPredicate>,
    query: QueryBuilder,
    modify: Option<Modify>,
    insert: Option<Document>,
    matched: usize,
    done: Completer<usize>,
}

type WriteParts = (
    QueryBuilder,
    Option<Modify>,
    Option<Document>,
    Completer<usize>,
);

fn compile_writes(inner: &DbInner, jobs: Vec<WriteParts>) -> Vec<ActiveWrite> {
    let mut active = Vec::with_capacity(jobs.len());
    for (query, modify, insert, done) in jobs {
        match inner.cache.compiled(query.cache_id.as_deref(), &query.nodes) {
            Ok(predicate) => active.push(ActiveWrite {
                predicate,
                query,
                modify,
                insert,
                matched: 0,
                done,
            }),
            Err(err) => done.complete(Err(err)),
        }
    }
    active
}

fn write_matches(job: &ActiveWrite, doc: &Document, index: usize) -> bool {
    if job.query.first && job.matched > 0 {
        return false;
    }
    job.predicate.matches(doc) && job.query.prepare.iter().all(|f| f(doc, index))
}

fn apply_modify(doc: &mut Document, modify: &Modify) {
    match modify {
        Modify::Set(replacement) => {
            *doc = replacement.clone();
        }
        Modify::With(f) => f(doc),
        Modify::Merge(changes) => {
            for (key, value) in changes {
                let op = match key.as_bytes().first().copied() {
                    Some(b @ (b'+' | b'-' | b'*' | b'/')) if key.len() > 1 => b,
                    _ => {
                        doc.insert(key.clone(), value.clone());
                        continue;
                    }
                };
                let name = &key[1..];
                let delta = match value.as_f64() {
                    Some(n) => n,
                    None => {
                        doc.insert(name.to_string(), value.clone());
                        continue;
                    }
                };
                let current = document::field(doc, name).as_f64().unwrap_or(0.0);
                let next = match op {
                    b'+' => current + delta,
                    b'-' => current - delta,
                    b'*' => current * delta,
                    _ => {
                        if delta == 0.0 {
                            current
                        } else {
                            current / delta
                        }
                    }
                };
                let encoded = if next.fract() == 0.0 {
                    Value::from(next as i64)
                } else {
                    Value::from(next)
                };
                doc.insert(name.to_string(), encoded);
            }
        }
    }
}

fn exec_update(inner: &Arc<DbInner>, jobs: Vec<UpdateJob>) {
    let jobs = jobs
        .into_iter()
        .map(|j| (j.query, Some(j.modify), j.insert, j.done))
        .collect();
    let mut active = compile_writes(inner, jobs);
    if active.is_empty() {
        return;
    }

    if let Err(err) = run_update_pass(inner, &mut active) {
        for job in active {
            job.done.complete(Err(err.clone()));
        }
        return;
    }

    // zero-match jobs with an insert fallback become appends
    let mut fallback_lines = Vec::new();
    let mut touched = 0usize;
    for job in &mut active {
        if job.matched == 0 {
            if let Some(doc) = job.insert.take() {
                match encode_line(inner, &doc) {
                    Ok(line) => {
                        fallback_lines.push((line, doc));
                        job.matched = 1;
                    }
                    Err(err) => warn!(db = %inner.name, error = %err, "upsert encode failed"),
                }
            }
        }
        touched += job.matched;
    }
    if !fallback_lines.is_empty() {
        let mut batch = String::new();
        for (line, _) in &fallback_lines {
            batch.push_str(line);
            batch.push('\n');
        }
        if let Err(err) = append_file(&inner.paths.data, batch.as_bytes()) {
            for job in active {
                job.done.complete(Err(err.clone()));
            }
            return;
        }
        for (_, doc) in &fallback_lines {
            inner.events.emit_change(EventKind::Insert, 1, Some(doc));
        }
    }

    log_write(inner, "update", touched);
    for job in active {
        let count = job.matched;
        job.done.complete(Ok(count));
    }
}

fn run_update_pass(inner: &Arc<DbInner>, active: &mut [ActiveWrite]) -> Result<(), DbError> {
    let Some(mut session) = UpdateSession::open(&inner.paths.data)? else {
        return Ok(());
    };
    let mut index = 0usize;

    while let Some(record) = session.next_line()? {
        let Some(mut doc) = decode_line(inner, record.position, &record.text) else {
            continue;
        };
        let ordinal = index;
        index += 1;

        let mut changed = false;
        for job in active.iter_mut() {
            if !write_matches(job, &doc, ordinal) {
                continue;
            }
            job.matched += 1;
            if let Some(modify) = &job.modify {
                apply_modify(&mut doc, modify);
                changed = true;
                let kind = match modify {
                    Modify::Merge(_) => EventKind::Modify,
                    _ => EventKind::Update,
                };
                inner.events.emit_change(kind, 1, Some(&doc));
            }
        }
        if !changed {
            continue;
        }

        let encoded = encode_line(inner, &doc)?;
        if encoded.len() == record.length {
            session.write_at(encoded.as_bytes(), record.position)?;
        } else {
            session.write_at(b"-", record.position)?;
            session.append(&encoded)?;
        }
    }

    session.finish()?;
    Ok(())
}

fn exec_remove(inner: &Arc<DbInner>, jobs: Vec<RemoveJob>) {
    let jobs = jobs
        .into_iter()
        .map(|j| (j.query, None, None, j.done))
        .collect();
    let mut active = compile_writes(inner, jobs);
    if active.is_empty() {
        return;
    }

    if let Err(err) = run_remove_pass(inner, &mut active) {
        for job in active {
            job.done.complete(Err(err.clone()));
        }
        return;
    }

    let total: usize = active.iter().map(|j| j.matched).sum();
    log_write(inner, "remove", total);
    for job in active {
        let count = job.matched;
        job.done.complete(Ok(count));
    }
}

fn run_remove_pass(inner: &Arc<DbInner>, active: &mut [ActiveWrite]) -> Result<(), DbError> {
    let Some(mut session) = UpdateSession::open(&inner.paths.data)? else {
        return Ok(());
    };
    let mut index = 0usize;

    while let Some(record) = session.next_line()? {
        let Some(doc) = decode_line(inner, record.position, &record.text) else {
            continue;
        };
        let ordinal = index;
        index += 1;

        let mut hit = false;
        for job in active.iter_mut() {
            if write_matches(job, &doc, ordinal) {
                job.matched += 1;
                hit = true;
            }
        }
        if !hit {
            continue;
        }

        if let Some(user) = &inner.options.backup_user {
            backup_line(inner, user, &record.text);
        }
        session.write_at(b"-", record.position)?;
        inner.events.emit_change(EventKind::Remove, 1, Some(&doc));
    }

    session.finish()?;
    Ok(())
}

/// Appends the pre-change line to the backup sidecar:
/// `YYYY-MM-DD HH:MM | <user padded to 20> | <original line>`.
fn backup_line(inner: &DbInner, user: &str, original: &str) {
    let stamp = Utc::now().format("%Y-%m-%d %H:%M");
    let line = format!("{stamp} | {user:<20} | {original}\n");
    if let Err(err) = append_file(&inner.paths.backup, line.as_bytes()) {
        warn!(db = %inner.name, error = %err, "backup sidecar write failed");
    }
}

// ---------------------------------------------------------------------------
// reader phases
// ---------------------------------------------------------------------------

struct ActiveReader {
    predicate: Arc<CompiledPredicate>,
    query: QueryBuilder,
    sink: ReaderSink,
    buffer: Vec<Document>,
    acc: Option<ScalarAcc>,
    matched: usize,
    done: bool,
}

impl ActiveReader {
    /// Early-stop is only sound when no global pass is needed: unsorted,
    /// no scalar, no listing count, bounded take.
    fn can_finish_early(&self) -> bool {
        self.query.sort.is_none()
            && self.acc.is_none()
            && !self.query.listing
            && matches!(self.sink, ReaderSink::Docs(_) | ReaderSink::One(_))
            && self.query.take > 0
    }

    fn observe(&mut self, doc: &Document) {
        self.matched += 1;
        if let Some(acc) = &mut self.acc {
            acc.push(doc);
            return;
        }
        if matches!(self.sink, ReaderSink::Count(_)) {
            return;
        }

        let inline_sort = match &self.query.sort {
            Some(Sort::Field { name, ascending }) if self.query.take > 0 => {
                Some((name.clone(), *ascending))
            }
            _ => None,
        };
        if let Some((name, ascending)) = inline_sort {
            // bounded in-order buffer of take + skip
            let cap = self.query.take + self.query.skip;
            let at = self.buffer.partition_point(|held| {
                let ord =
                    document::compare(document::field(held, &name), document::field(doc, &name))
                        .unwrap_or(std::cmp::Ordering::Equal);
                if ascending {
                    ord != std::cmp::Ordering::Greater
                } else {
                    ord != std::cmp::Ordering::Less
                }
            });
            if at < cap {
                self.buffer.insert(at, doc.clone());
                self.buffer.truncate(cap);
            }
            return;
        }

        self.buffer.push(doc.clone());
        if self.can_finish_early() && self.buffer.len() >= self.query.take + self.query.skip {
            self.done = true;
        }
    }
}

fn exec_readers(inner: &Arc<DbInner>, jobs: Vec<ReaderJob>, reverse: bool) {
    let mut active: Vec<ActiveReader> = Vec::with_capacity(jobs.len());
    for job in jobs {
        match inner
            .cache
            .compiled(job.query.cache_id.as_deref(), &job.query.nodes)
        {
            Ok(predicate) => {
                let acc = job
                    .query
                    .scalar
                    .clone()
                    .filter(|_| matches!(job.sink, ReaderSink::Scalar(_)))
                    .map(|(kind, field)| ScalarAcc::new(kind, field));
                active.push(ActiveReader {
                    predicate,
                    query: job.query,
                    sink: job.sink,
                    buffer: Vec::new(),
                    acc,
                    matched: 0,
                    done: false,
                });
            }
            Err(err) => fail_sink(job.sink, err),
        }
    }
    if active.is_empty() {
        return;
    }

    let result = if reverse {
        scan_reverse(inner, &mut active)
    } else {
        scan_forward(inner, &mut active)
    };

    // a read error completes every reader of the pass
    if let Err(err) = result {
        for reader in active {
            fail_sink(reader.sink, err.clone());
        }
        return;
    }

    for reader in active {
        finalize_reader(inner, reader);
    }
}

fn scan_forward(inner: &Arc<DbInner>, active: &mut [ActiveReader]) -> Result<(), DbError> {
    let mut reader = DocReader::open(&inner.paths.data)?;
    let mut index = 0usize;
    loop {
        let batch = reader.next_batch(64)?;
        if batch.is_empty() {
            return Ok(());
        }
        for record in batch {
            if visit_record(inner, active, &record.text, record.position, &mut index) {
                return Ok(());
            }
        }
    }
}

fn scan_reverse(inner: &Arc<DbInner>, active: &mut [ActiveReader]) -> Result<(), DbError> {
    let mut reader = ReverseLineReader::open(&inner.paths.data)?;
    let mut index = 0usize;
    loop {
        let batch = reader.next_batch(64)?;
        if batch.is_empty() {
            return Ok(());
        }
        for record in batch {
            if visit_record(inner, active, &record.text, record.position, &mut index) {
                return Ok(());
            }
        }
    }
}

// returns true once every reader is satisfied (early termination)
fn visit_record(
    inner: &Arc<DbInner>,
    active: &mut [ActiveReader],
    text: &str,
    position: u64,
    index: &mut usize,
) -> bool {
    let Some(doc) = decode_line(inner, position, text) else {
        return false;
    };
    let ordinal = *index;
    *index += 1;

    let mut all_done = true;
    for reader in active.iter_mut() {
        if reader.done {
            continue;
        }
        let hit = reader.predicate.matches(&doc)
            && reader.query.prepare.iter().all(|f| f(&doc, ordinal));
        if hit {
            reader.observe(&doc);
        }
        if !reader.done {
            all_done = false;
        }
    }
    all_done
}

fn finalize_reader(inner: &Arc<DbInner>, reader: ActiveReader) {
    let ActiveReader {
        query,
        sink,
        mut buffer,
        acc,
        matched,
        ..
    } = reader;

    if matched == 0 {
        if let Some(message) = query.empty_error {
            fail_sink(sink, DbError::EmptyResult(message));
            return;
        }
    }

    if let Some(acc) = acc {
        if let ReaderSink::Scalar(done) = sink {
            done.complete(Ok(acc.finish()));
        }
        return;
    }
    if let ReaderSink::Count(done) = sink {
        done.complete(Ok(matched));
        return;
    }

    // ordering: bounded take+skip buffers arrive already in field order
    match &query.sort {
        Some(Sort::Field { name, ascending }) if query.take == 0 => {
            buffer.sort_by(|a, b| {
                let ord = document::compare(document::field(a, name), document::field(b, name))
                    .unwrap_or(std::cmp::Ordering::Equal);
                if *ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }
        Some(Sort::Comparator(cmp)) => {
            buffer.sort_by(|a, b| cmp(a, b));
        }
        Some(Sort::Random) => {
            use rand::seq::SliceRandom;
            buffer.shuffle(&mut rand::thread_rng());
        }
        _ => {}
    }

    // skip / take window
    let skip = query.skip.min(buffer.len());
    let mut items: Vec<Document> = buffer.split_off(skip);
    if query.take > 0 {
        items.truncate(query.take);
    }

    // projection, sort key retained
    let sort_key = match &query.sort {
        Some(Sort::Field { name, .. }) => Some(name.as_str()),
        _ => None,
    };
    if query.fields.is_some() || query.fields_exclude.is_some() {
        items = items
            .into_iter()
            .map(|doc| filter::project(doc, &query.fields, &query.fields_exclude, sort_key))
            .collect();
    }

    if !query.joins.is_empty() {
        if let Err(err) = resolve_joins(inner, &mut items, &query.joins) {
            fail_sink(sink, err);
            return;
        }
    }

    match sink {
        ReaderSink::Docs(done) => done.complete(Ok(items)),
        ReaderSink::One(done) => done.complete(Ok(items.into_iter().next())),
        ReaderSink::Listing(done) => {
            let limit = query.take;
            let (page, pages) = if limit == 0 {
                (1, 1)
            } else {
                (query.skip / limit + 1, matched.div_ceil(limit))
            };
            done.complete(Ok(Listing {
                page,
                pages,
                limit,
                count: matched,
                items,
            }));
        }
        ReaderSink::Count(_) | ReaderSink::Scalar(_) => unreachable!("handled above"),
    }
}

fn fail_sink(sink: ReaderSink, err: DbError) {
    match sink {
        ReaderSink::Docs(done) => done.complete(Err(err)),
        ReaderSink::One(done) => done.complete(Err(err)),
        ReaderSink::Count(done) => done.complete(Err(err)),
        ReaderSink::Scalar(done) => done.complete(Err(err)),
        ReaderSink::Listing(done) => done.complete(Err(err)),
    }
}

/// Resolves joins against sibling databases after the scan: one nested
/// query per join collects the foreign documents, then every result doc
/// gets its group (or first element, or scalar) attached under the join
/// field.
fn resolve_joins(
    inner: &Arc<DbInner>,
    items: &mut [Document],
    joins: &[Join],
) -> Result<(), DbError> {
    for join in joins {
        // a nested query against our own worker would wait on itself
        if Arc::ptr_eq(&join.db.inner, inner) {
            return Err(DbError::Unsupported("join against the same database"));
        }

        let mut keys: Vec<Value> = Vec::new();
        for doc in items.iter() {
            let key = document::field(doc, &join.local);
            if !key.is_null() && !keys.contains(key) {
                keys.push(key.clone());
            }
        }

        let foreign = join
            .db
            .find(QueryBuilder::new().in_(&*join.foreign, keys))
            .wait()?;

        for doc in items.iter_mut() {
            let local = document::field(doc, &join.local).clone();
            let group: Vec<&Document> = foreign
                .iter()
                .filter(|candidate| {
                    document::compare(document::field(candidate, &join.foreign), &local)
                        == Some(std::cmp::Ordering::Equal)
                })
                .collect();

            let value = if let Some((kind, field)) = &join.scalar {
                let mut acc = ScalarAcc::new(*kind, Some(field.clone()));
                for candidate in &group {
                    acc.push(candidate);
                }
                acc.finish()
            } else if join.first {
                group
                    .first()
                    .map(|d| Value::Object((*d).clone()))
                    .unwrap_or(Value::Null)
            } else {
                Value::Array(group.into_iter().map(|d| Value::Object(d.clone())).collect())
            };
            doc.insert(join.field.clone(), value);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// stream phase
// ---------------------------------------------------------------------------

fn exec_stream(inner: &Arc<DbInner>, jobs: Vec<StreamJob>) {
    struct ActiveStream {
        visit: Box<dyn FnMut(&Document) -> bool + Send>,
        visited: usize,
        done: Completer<usize>,
        stopped: bool,
    }

    let mut active: Vec<ActiveStream> = jobs
        .into_iter()
        .map(|job| ActiveStream {
            visit: job.visit,
            visited: 0,
            done: job.done,
            stopped: false,
        })
        .collect();

    let run = (|| -> Result<(), DbError> {
        let mut reader = DocReader::open(&inner.paths.data)?;
        while let Some(record) = reader.next_line()? {
            let Some(doc) = decode_line(inner, record.position, &record.text) else {
                continue;
            };
            let mut all_stopped = true;
            for job in active.iter_mut() {
                if job.stopped {
                    continue;
                }
                job.visited += 1;
                if !(job.visit)(&doc) {
                    job.stopped = true;
                } else {
                    all_stopped = false;
                }
            }
            if all_stopped {
                break;
            }
        }
        Ok(())
    })();

    match run {
        Ok(()) => {
            for job in active {
                let count = job.visited;
                job.done.complete(Ok(count));
            }
        }
        Err(err) => {
            for job in active {
                job.done.complete(Err(err.clone()));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// exclusive phase
// ---------------------------------------------------------------------------

fn exec_exclusive(inner: &Arc<DbInner>, job: Exclusive) {
    match job {
        Exclusive::Clear(done) => done.complete(run_clear(inner)),
        Exclusive::Clean(done) => done.complete(run_clean(inner)),
        Exclusive::Drop(done) => done.complete(run_drop(inner)),
        Exclusive::Backup(target, done) => done.complete(run_backup(inner, &target)),
        Exclusive::Restore(source, done) => done.complete(run_restore(inner, &source)),
        Exclusive::Lock(f, done) => {
            f(&Database {
                inner: inner.clone(),
            });
            done.complete(Ok(()));
        }
        Exclusive::Extend(schema, done) => done.complete(run_extend(inner, schema)),
    }
}

fn remove_if_exists(path: &Path) -> Result<(), DbError> {
    match fs_err::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn run_clear(inner: &Arc<DbInner>) -> Result<(), DbError> {
    remove_if_exists(&inner.paths.data)?;
    if inner.kind == StorageKind::Table {
        if let Some(schema) = inner.schema.read().as_ref() {
            let header = format!("{}\n", schema.header());
            append_file(&inner.paths.data, header.as_bytes())?;
        }
    }
    inner.events.emit_change(EventKind::Clear, 0, None);
    log_write(inner, "clear", 0);
    Ok(())
}

fn run_clean(inner: &Arc<DbInner>) -> Result<(), DbError> {
    let mut reader = DocReader::open(&inner.paths.data)?;
    let mut writer = SwapWriter::create(&inner.paths.data, &inner.paths.tmp)?;
    let mut kept = 0usize;

    if inner.kind == StorageKind::Table {
        if let Some(schema) = inner.schema.read().as_ref() {
            writer.write_line(&schema.header())?;
        }
    }

    while let Some(record) = reader.next_line()? {
        if inner.kind == StorageKind::Table && record.position == 0 {
            continue; // fresh header already written
        }
        if record.text.is_empty()
            || record.text.as_bytes().first() == Some(&codec::MARKER_TOMBSTONE)
        {
            continue;
        }
        writer.write_line(&record.text)?;
        kept += 1;
    }

    writer.commit()?;
    debug!(db = %inner.name, kept, "compaction finished");
    inner.events.emit_change(EventKind::Clean, kept, None);
    log_write(inner, "clean", kept);
    Ok(())
}

fn run_drop(inner: &Arc<DbInner>) -> Result<(), DbError> {
    remove_if_exists(&inner.paths.data)?;
    remove_if_exists(&inner.paths.tmp)?;
    remove_if_exists(&inner.paths.meta)?;
    remove_if_exists(&inner.paths.log)?;
    remove_if_exists(&inner.paths.backup)?;
    inner.counter.destroy()?;
    inner.events.detach();
    inner.released.store(true, AtomicOrdering::SeqCst);
    let mut sched = inner.sched.lock();
    sched.shutdown = true;
    sched.reject_all(DbError::Released);
    Ok(())
}

fn run_backup(inner: &Arc<DbInner>, target: &Path) -> Result<(), DbError> {
    match fs_err::copy(&inner.paths.data, target) {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            fs_err::write(target, b"")?;
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn run_restore(inner: &Arc<DbInner>, source: &Path) -> Result<(), DbError> {
    fs_err::copy(source, &inner.paths.data)?;
    Ok(())
}

/// Live schema extension: every row streams through the old codec into the
/// new one, the header is rewritten, the file is swapped by rename.
/// Dropping columns is allowed.
fn run_extend(inner: &Arc<DbInner>, next: Schema) -> Result<(), DbError> {
    if inner.kind != StorageKind::Table {
        return Err(DbError::Unsupported("extend on a document database"));
    }
    let previous = inner.schema.read().clone();

    let mut reader = DocReader::open(&inner.paths.data)?;
    let mut writer = SwapWriter::create(&inner.paths.data, &inner.paths.tmp)?;
    writer.write_line(&next.header())?;

    if let Some(previous) = &previous {
        while let Some(record) = reader.next_line()? {
            if record.position == 0 || record.text.is_empty() {
                continue;
            }
            let Some(doc) = codec::decode_row(&record.text, previous, None) else {
                continue; // tombstones are dropped by the rewrite
            };
            writer.write_line(&codec::encode_row(&doc, &next)?)?;
        }
    }

    writer.commit()?;
    *inner.schema.write() = Some(next);
    inner.cache.clear();
    debug!(db = %inner.name, "schema extended");
    Ok(())
}
