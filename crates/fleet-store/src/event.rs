use fleet_model::{Service, Task};

/// Change notification published after a commit.
///
/// Record events carry the record as committed (deletes carry the last committed copy).
/// A [`Event::Commit`] follows the record events of every transaction.
#[derive(Debug, Clone)]
pub enum Event {
    ServiceCreate(Service),
    ServiceUpdate(Service),
    ServiceDelete(Service),
    TaskCreate(Task),
    TaskUpdate(Task),
    TaskDelete(Task),
    Commit { index: u64 },
}

/// Discriminant of [`Event`], used to filter watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ServiceCreate,
    ServiceUpdate,
    ServiceDelete,
    TaskCreate,
    TaskUpdate,
    TaskDelete,
    Commit,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ServiceCreate(_) => EventKind::ServiceCreate,
            Event::ServiceUpdate(_) => EventKind::ServiceUpdate,
            Event::ServiceDelete(_) => EventKind::ServiceDelete,
            Event::TaskCreate(_) => EventKind::TaskCreate,
            Event::TaskUpdate(_) => EventKind::TaskUpdate,
            Event::TaskDelete(_) => EventKind::TaskDelete,
            Event::Commit { .. } => EventKind::Commit,
        }
    }

    /// The task carried by a task event.
    pub fn task(&self) -> Option<&Task> {
        match self {
            Event::TaskCreate(t) | Event::TaskUpdate(t) | Event::TaskDelete(t) => Some(t),
            _ => None,
        }
    }

    /// The service carried by a service event.
    pub fn service(&self) -> Option<&Service> {
        match self {
            Event::ServiceCreate(s) | Event::ServiceUpdate(s) | Event::ServiceDelete(s) => Some(s),
            _ => None,
        }
    }
}
