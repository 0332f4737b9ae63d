use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use tokio::sync::broadcast;
use tracing::trace;

use crate::tx::{Key, Staged, Tables};
use crate::{Event, EventKind, StoreError, Tx, View, Watch};

/// Default ring-buffer size shared by all watches.
pub const DEFAULT_WATCH_CAPACITY: usize = 1024;

/// In-memory store of services and tasks.
///
/// Cheap to share behind an `Arc`; every operation takes the store lock for its duration.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

struct Inner {
    tables: Tables,
    /// Index of the last committed transaction.
    index: u64,
    /// `None` once the store is closed.
    bus: Option<broadcast::Sender<Event>>,
}

impl MemoryStore {
    /// Creates an empty store whose watches buffer up to `capacity` events (min 1).
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            inner: Mutex::new(Inner {
                tables: Tables::default(),
                index: 0,
                bus: Some(tx),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` in a read-write transaction and commits its changes atomically.
    ///
    /// If `f` returns `Err`, nothing is applied and the error is returned unchanged.
    pub fn update<T, E>(&self, f: impl FnOnce(&mut Tx<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut inner = self.lock();
        if inner.bus.is_none() {
            return Err(StoreError::Closed.into());
        }

        let (out, staged) = {
            let mut tx = Tx::new(&inner.tables);
            let out = f(&mut tx)?;
            (out, tx.into_staged())
        };

        if !staged.is_empty() {
            inner.commit(staged);
        }
        Ok(out)
    }

    /// Runs `f` against a consistent read-only snapshot.
    pub fn view<T>(&self, f: impl FnOnce(&View<'_>) -> T) -> T {
        let inner = self.lock();
        f(&View::new(&inner.tables))
    }

    /// Subscribes to events of the given kinds committed from now on.
    ///
    /// An empty `kinds` slice subscribes to everything.
    pub fn watch(&self, kinds: &[EventKind]) -> Result<Watch, StoreError> {
        let inner = self.lock();
        let bus = inner.bus.as_ref().ok_or(StoreError::Closed)?;
        Ok(Watch::new(bus.subscribe(), kinds))
    }

    /// Index of the last committed transaction.
    pub fn index(&self) -> u64 {
        self.lock().index
    }

    /// Closes the store: further transactions fail and watches end with [`StoreError::Closed`].
    pub fn close(&self) {
        self.lock().bus = None;
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_WATCH_CAPACITY)
    }
}

impl Inner {
    fn commit(&mut self, mut staged: Staged) {
        let index = self.index + 1;
        let now = SystemTime::now();
        let mut events = Vec::with_capacity(staged.order.len() + 1);

        for key in std::mem::take(&mut staged.order) {
            match key {
                Key::Service(id) => {
                    let after = staged.services.remove(&id).flatten();
                    let existed = self.tables.services.contains_key(&id);
                    match after {
                        Some(mut service) => {
                            service.meta.version = index;
                            service.meta.updated_at = now;
                            if !existed {
                                service.meta.created_at = now;
                            }
                            self.tables.services.insert(id, service.clone());
                            events.push(if existed {
                                Event::ServiceUpdate(service)
                            } else {
                                Event::ServiceCreate(service)
                            });
                        }
                        None => {
                            if let Some(old) = self.tables.services.remove(&id) {
                                events.push(Event::ServiceDelete(old));
                            }
                        }
                    }
                }
                Key::Task(id) => {
                    let after = staged.tasks.remove(&id).flatten();
                    let existed = self.tables.tasks.contains_key(&id);
                    match after {
                        Some(mut task) => {
                            task.meta.version = index;
                            task.meta.updated_at = now;
                            if !existed {
                                task.meta.created_at = now;
                            }
                            self.tables.tasks.insert(id, task.clone());
                            events.push(if existed {
                                Event::TaskUpdate(task)
                            } else {
                                Event::TaskCreate(task)
                            });
                        }
                        None => {
                            if let Some(old) = self.tables.tasks.remove(&id) {
                                events.push(Event::TaskDelete(old));
                            }
                        }
                    }
                }
            }
        }

        if events.is_empty() {
            return;
        }
        self.index = index;
        events.push(Event::Commit { index });
        trace!(index, events = events.len(), "transaction committed");

        if let Some(bus) = &self.bus {
            for ev in events {
                let _ = bus.send(ev);
            }
        }
    }
}
