//! Per-database operation scheduling: pending queues, phase bookkeeping
//! and single-shot completion handles.
//!
//! Every user call appends a job descriptor to one of the pending queues
//! and wakes the database worker. The worker drains one queue per tick in
//! a fixed priority: exclusive jobs (drop, backup, restore, clear, clean,
//! lock, extend) run alone; then the writing queues append → update →
//! remove; then the reading queues reader → reader-reverse → stream. A
//! drained queue is spliced out as a whole batch, so N writes pending at
//! drain time share one streaming pass over the file.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde_json::Value;

use crate::document::Document;
use crate::engine::Database;
use crate::errors::DbError;
use crate::query::{Listing, Modify, QueryBuilder};
use crate::schema::Schema;

enum SlotState<T> {
    Waiting,
    Done(Result<T, DbError>),
    Taken,
}

struct Slot<T> {
    state: Mutex<SlotState<T>>,
    cond: Condvar,
}

/// Handle to an operation's eventual completion.
///
/// Enqueueing is non-blocking; `wait` blocks the caller until the worker
/// finishes the phase that carried the job.
pub struct Pending<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Pending<T> {
    /// Blocks until the operation completes.
    pub fn wait(self) -> Result<T, DbError> {
        let mut state = self.slot.state.lock();
        loop {
            match std::mem::replace(&mut *state, SlotState::Taken) {
                SlotState::Done(result) => return result,
                other => {
                    *state = other;
                    self.slot.cond.wait(&mut state);
                }
            }
        }
    }

    /// Blocks with a deadline; elapses as [`DbError::Timeout`].
    pub fn wait_timeout(self, timeout: Duration) -> Result<T, DbError> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.slot.state.lock();
        loop {
            match std::mem::replace(&mut *state, SlotState::Taken) {
                SlotState::Done(result) => return result,
                other => {
                    *state = other;
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return Err(DbError::Timeout);
                    }
                    self.slot.cond.wait_for(&mut state, deadline - now);
                }
            }
        }
    }

    /// True when the result is already available.
    pub fn ready(&self) -> bool {
        matches!(*self.slot.state.lock(), SlotState::Done(_))
    }
}

/// Producer side of a [`Pending`]; completes exactly once.
pub(crate) struct Completer<T> {
    slot: Arc<Slot<T>>,
    fired: bool,
}

impl<T> Completer<T> {
    pub fn complete(mut self, result: Result<T, DbError>) {
        self.fire(result);
    }

    fn fire(&mut self, result: Result<T, DbError>) {
        if self.fired {
            return;
        }
        self.fired = true;
        let mut state = self.slot.state.lock();
        *state = SlotState::Done(result);
        self.slot.cond.notify_all();
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        // an abandoned job (shutdown mid-queue) must not hang its waiter
        self.fire(Err(DbError::Released));
    }
}

/// Creates a linked completion pair.
pub(crate) fn completion<T>() -> (Completer<T>, Pending<T>) {
    let slot = Arc::new(Slot {
        state: Mutex::new(SlotState::Waiting),
        cond: Condvar::new(),
    });
    (
        Completer {
            slot: slot.clone(),
            fired: false,
        },
        Pending { slot },
    )
}

/// Creates a pending handle that is already resolved; used when a job is
/// rejected at submit time (read-only flag, released instance).
pub(crate) fn resolved<T>(result: Result<T, DbError>) -> Pending<T> {
    let (done, pending) = completion();
    done.complete(result);
    pending
}

pub(crate) struct AppendJob {
    pub doc: Document,
    pub done: Completer<usize>,
}

pub(crate) struct UpdateJob {
    pub query: QueryBuilder,
    pub modify: Modify,
    pub insert: Option<Document>,
    pub done: Completer<usize>,
}

pub(crate) struct RemoveJob {
    pub query: QueryBuilder,
    pub done: Completer<usize>,
}

/// Where a reader delivers its result; one variant per terminal method.
pub(crate) enum ReaderSink {
    Docs(Completer<Vec<Document>>),
    One(Completer<Option<Document>>),
    Count(Completer<usize>),
    Scalar(Completer<Value>),
    Listing(Completer<Listing>),
}

pub(crate) struct ReaderJob {
    pub query: QueryBuilder,
    pub sink: ReaderSink,
}

pub(crate) struct StreamJob {
    pub visit: Box<dyn FnMut(&Document) -> bool + Send>,
    pub done: Completer<usize>,
}

/// Exclusive jobs: run with every other queue held back until done.
pub(crate) enum Exclusive {
    Clear(Completer<()>),
    Clean(Completer<()>),
    Drop(Completer<()>),
    Backup(PathBuf, Completer<()>),
    Restore(PathBuf, Completer<()>),
    Lock(Box<dyn FnOnce(&Database) + Send>, Completer<()>),
    Extend(Schema, Completer<()>),
}

/// The queue most recently drained; recorded for reentrancy checks and
/// debug logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Idle,
    Exclusive,
    Append,
    Update,
    Remove,
    Reader,
    ReaderReverse,
    Stream,
}

/// Scheduler state guarded by the database mutex.
pub(crate) struct SchedState {
    pub step: Step,
    pub writing: bool,
    pub reading: bool,
    pub shutdown: bool,
    pub append: Vec<AppendJob>,
    pub update: Vec<UpdateJob>,
    pub remove: Vec<RemoveJob>,
    pub reader: Vec<ReaderJob>,
    pub reader_reverse: Vec<ReaderJob>,
    pub stream: Vec<StreamJob>,
    pub exclusive: VecDeque<Exclusive>,
}

impl SchedState {
    pub fn new() -> Self {
        SchedState {
            step: Step::Idle,
            writing: false,
            reading: false,
            shutdown: false,
            append: Vec::new(),
            update: Vec::new(),
            remove: Vec::new(),
            reader: Vec::new(),
            reader_reverse: Vec::new(),
            stream: Vec::new(),
            exclusive: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.append.is_empty()
            && self.update.is_empty()
            && self.remove.is_empty()
            && self.reader.is_empty()
            && self.reader_reverse.is_empty()
            && self.stream.is_empty()
            && self.exclusive.is_empty()
    }

    /// Picks the next phase according to the drain priority. Returns
    /// `None` when every runnable queue is empty.
    pub fn select(&mut self) -> Option<Tick> {
        if !self.writing && !self.reading {
            if let Some(job) = self.exclusive.pop_front() {
                self.step = Step::Exclusive;
                return Some(Tick::Exclusive(job));
            }
        }
        if !self.writing {
            if !self.append.is_empty() {
                self.step = Step::Append;
                self.writing = true;
                return Some(Tick::Append(std::mem::take(&mut self.append)));
            }
            if !self.update.is_empty() {
                self.step = Step::Update;
                self.writing = true;
                return Some(Tick::Update(std::mem::take(&mut self.update)));
            }
            if !self.remove.is_empty() {
                self.step = Step::Remove;
                self.writing = true;
                return Some(Tick::Remove(std::mem::take(&mut self.remove)));
            }
        }
        if !self.reading {
            if !self.reader.is_empty() {
                self.step = Step::Reader;
                self.reading = true;
                return Some(Tick::Reader(std::mem::take(&mut self.reader)));
            }
            if !self.reader_reverse.is_empty() {
                self.step = Step::ReaderReverse;
                self.reading = true;
                return Some(Tick::ReaderReverse(std::mem::take(&mut self.reader_reverse)));
            }
            if !self.stream.is_empty() {
                self.step = Step::Stream;
                self.reading = true;
                return Some(Tick::Stream(std::mem::take(&mut self.stream)));
            }
        }
        None
    }

    /// Marks the drained phase finished.
    pub fn finish(&mut self, tick_kind: Step) {
        match tick_kind {
            Step::Append | Step::Update | Step::Remove => self.writing = false,
            Step::Reader | Step::ReaderReverse | Step::Stream => self.reading = false,
            _ => {}
        }
        self.step = Step::Idle;
    }

    /// Fails every queued job; used at shutdown and after `drop`.
    pub fn reject_all(&mut self, err: DbError) {
        for job in self.append.drain(..) {
            job.done.complete(Err(err.clone()));
        }
        for job in self.update.drain(..) {
            job.done.complete(Err(err.clone()));
        }
        for job in self.remove.drain(..) {
            job.done.complete(Err(err.clone()));
        }
        for job in self.reader.drain(..).chain(self.reader_reverse.drain(..)) {
            match job.sink {
                ReaderSink::Docs(done) => done.complete(Err(err.clone())),
                ReaderSink::One(done) => done.complete(Err(err.clone())),
                ReaderSink::Count(done) => done.complete(Err(err.clone())),
                ReaderSink::Scalar(done) => done.complete(Err(err.clone())),
                ReaderSink::Listing(done) => done.complete(Err(err.clone())),
            }
        }
        for job in self.stream.drain(..) {
            job.done.complete(Err(err.clone()));
        }
        for job in self.exclusive.drain(..) {
            match job {
                Exclusive::Clear(done)
                | Exclusive::Clean(done)
                | Exclusive::Drop(done)
                | Exclusive::Backup(_, done)
                | Exclusive::Restore(_, done)
                | Exclusive::Lock(_, done)
                | Exclusive::Extend(_, done) => done.complete(Err(err.clone())),
            }
        }
    }
}

/// One drained phase, handed to the worker for execution.
pub(crate) enum Tick {
    Exclusive(Exclusive),
    Append(Vec<AppendJob>),
    Update(Vec<UpdateJob>),
    Remove(Vec<RemoveJob>),
    Reader(Vec<ReaderJob>),
    ReaderReverse(Vec<ReaderJob>),
    Stream(Vec<StreamJob>),
}

impl Tick {
    pub fn step(&self) -> Step {
        match self {
            Tick::Exclusive(_) => Step::Exclusive,
            Tick::Append(_) => Step::Append,
            Tick::Update(_) => Step::Update,
            Tick::Remove(_) => Step::Remove,
            Tick::Reader(_) => Step::Reader,
            Tick::ReaderReverse(_) => Step::ReaderReverse,
            Tick::Stream(_) => Step::Stream,
        }
    }
}
