//! Typed change notifications.
//!
//! Each event kind carries its own listener list; the engine never
//! requires listeners and emission is best-effort.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::document::Document;

/// Kind of change emitted by the engine or the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Insert,
    Update,
    Modify,
    Remove,
    Change,
    Clean,
    Clear,
    Stats,
    Hit,
    Sum,
    Min,
    Max,
}

/// Payload delivered to listeners.
#[derive(Debug)]
pub struct Event<'a> {
    pub kind: EventKind,
    pub count: usize,
    pub document: Option<&'a Document>,
}

type Listener = Box<dyn Fn(&Event<'_>) + Send + Sync>;

/// Multi-listener registry, one list per event kind.
#[derive(Default)]
pub struct Events {
    listeners: Mutex<HashMap<EventKind, Vec<Listener>>>,
}

impl Events {
    /// Registers a listener for one event kind.
    pub fn on(&self, kind: EventKind, listener: impl Fn(&Event<'_>) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .entry(kind)
            .or_default()
            .push(Box::new(listener));
    }

    /// Delivers an event to every listener of its kind.
    pub fn emit(&self, kind: EventKind, count: usize, document: Option<&Document>) {
        let listeners = self.listeners.lock();
        if let Some(list) = listeners.get(&kind) {
            let event = Event {
                kind,
                count,
                document,
            };
            for listener in list {
                listener(&event);
            }
        }
    }

    /// Emits a write event together with the generic `Change` kind.
    pub fn emit_change(&self, kind: EventKind, count: usize, document: Option<&Document>) {
        self.emit(kind, count, document);
        self.emit(EventKind::Change, count, document);
    }

    /// Drops every listener; used by release and drop.
    pub fn detach(&self) {
        self.listeners.lock().clear();
    }
}
