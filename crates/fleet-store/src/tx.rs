use std::collections::BTreeMap;

use fleet_model::{Service, ServiceId, Task, TaskId};

use crate::StoreError;

/// Committed records.
#[derive(Debug, Default)]
pub(crate) struct Tables {
    pub(crate) services: BTreeMap<ServiceId, Service>,
    pub(crate) tasks: BTreeMap<TaskId, Task>,
}

/// Read accessors shared by [`View`] and [`Tx`].
///
/// Records are returned by value; callers modify the copy and write it back through [`Tx`].
pub trait ReadTx {
    fn get_service(&self, id: &ServiceId) -> Option<Service>;
    fn get_task(&self, id: &TaskId) -> Option<Task>;
    /// All services, ordered by id.
    fn services(&self) -> Vec<Service>;
    /// All tasks, ordered by id.
    fn tasks(&self) -> Vec<Task>;

    /// Tasks owned by `service_id`, ordered by id.
    fn tasks_by_service(&self, service_id: &ServiceId) -> Vec<Task> {
        self.tasks()
            .into_iter()
            .filter(|t| &t.service_id == service_id)
            .collect()
    }
}

/// Read-only snapshot of the store.
pub struct View<'a> {
    tables: &'a Tables,
}

impl<'a> View<'a> {
    pub(crate) fn new(tables: &'a Tables) -> Self {
        Self { tables }
    }
}

impl ReadTx for View<'_> {
    fn get_service(&self, id: &ServiceId) -> Option<Service> {
        self.tables.services.get(id).cloned()
    }

    fn get_task(&self, id: &TaskId) -> Option<Task> {
        self.tables.tasks.get(id).cloned()
    }

    fn services(&self) -> Vec<Service> {
        self.tables.services.values().cloned().collect()
    }

    fn tasks(&self) -> Vec<Task> {
        self.tables.tasks.values().cloned().collect()
    }
}

/// Record touched by a transaction, in first-touch order.
#[derive(Debug, Clone)]
pub(crate) enum Key {
    Service(ServiceId),
    Task(TaskId),
}

/// Changes staged by a transaction; `None` marks a deletion.
#[derive(Debug, Default)]
pub(crate) struct Staged {
    pub(crate) order: Vec<Key>,
    pub(crate) services: BTreeMap<ServiceId, Option<Service>>,
    pub(crate) tasks: BTreeMap<TaskId, Option<Task>>,
}

impl Staged {
    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Read-write transaction.
///
/// Writes are staged over the committed tables and become visible to reads in the same
/// transaction immediately; other transactions see them only after commit.
pub struct Tx<'a> {
    base: &'a Tables,
    staged: Staged,
}

impl<'a> Tx<'a> {
    pub(crate) fn new(base: &'a Tables) -> Self {
        Self {
            base,
            staged: Staged::default(),
        }
    }

    pub(crate) fn into_staged(self) -> Staged {
        self.staged
    }

    pub fn create_service(&mut self, service: Service) -> Result<(), StoreError> {
        service.spec.validate()?;
        if self.get_service(&service.id).is_some() {
            return Err(StoreError::AlreadyExists(service.id.to_string()));
        }
        self.stage_service(service.id.clone(), Some(service));
        Ok(())
    }

    /// Writes `service` back; fails if it was read at a stale version.
    pub fn update_service(&mut self, service: Service) -> Result<(), StoreError> {
        service.spec.validate()?;
        let current = self
            .get_service(&service.id)
            .ok_or_else(|| StoreError::NotFound(service.id.to_string()))?;
        check_version(service.id.as_str(), current.meta.version, service.meta.version)?;
        self.stage_service(service.id.clone(), Some(service));
        Ok(())
    }

    pub fn delete_service(&mut self, id: &ServiceId) -> Result<(), StoreError> {
        if self.get_service(id).is_none() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.stage_service(id.clone(), None);
        Ok(())
    }

    pub fn create_task(&mut self, task: Task) -> Result<(), StoreError> {
        if self.get_task(&task.id).is_some() {
            return Err(StoreError::AlreadyExists(task.id.to_string()));
        }
        self.stage_task(task.id.clone(), Some(task));
        Ok(())
    }

    /// Writes `task` back; fails if it was read at a stale version.
    pub fn update_task(&mut self, task: Task) -> Result<(), StoreError> {
        let current = self
            .get_task(&task.id)
            .ok_or_else(|| StoreError::NotFound(task.id.to_string()))?;
        check_version(task.id.as_str(), current.meta.version, task.meta.version)?;
        self.stage_task(task.id.clone(), Some(task));
        Ok(())
    }

    pub fn delete_task(&mut self, id: &TaskId) -> Result<(), StoreError> {
        if self.get_task(id).is_none() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.stage_task(id.clone(), None);
        Ok(())
    }

    fn stage_service(&mut self, id: ServiceId, record: Option<Service>) {
        if !self.staged.services.contains_key(&id) {
            self.staged.order.push(Key::Service(id.clone()));
        }
        self.staged.services.insert(id, record);
    }

    fn stage_task(&mut self, id: TaskId, record: Option<Task>) {
        if !self.staged.tasks.contains_key(&id) {
            self.staged.order.push(Key::Task(id.clone()));
        }
        self.staged.tasks.insert(id, record);
    }
}

fn check_version(id: &str, stored: u64, given: u64) -> Result<(), StoreError> {
    if stored != given {
        return Err(StoreError::SequenceConflict {
            id: id.to_string(),
            expected: stored,
            found: given,
        });
    }
    Ok(())
}

impl ReadTx for Tx<'_> {
    fn get_service(&self, id: &ServiceId) -> Option<Service> {
        match self.staged.services.get(id) {
            Some(staged) => staged.clone(),
            None => self.base.services.get(id).cloned(),
        }
    }

    fn get_task(&self, id: &TaskId) -> Option<Task> {
        match self.staged.tasks.get(id) {
            Some(staged) => staged.clone(),
            None => self.base.tasks.get(id).cloned(),
        }
    }

    fn services(&self) -> Vec<Service> {
        let mut merged: BTreeMap<&ServiceId, &Service> = self.base.services.iter().collect();
        for (id, staged) in &self.staged.services {
            match staged {
                Some(s) => merged.insert(id, s),
                None => merged.remove(id),
            };
        }
        merged.into_values().cloned().collect()
    }

    fn tasks(&self) -> Vec<Task> {
        let mut merged: BTreeMap<&TaskId, &Task> = self.base.tasks.iter().collect();
        for (id, staged) in &self.staged.tasks {
            match staged {
                Some(t) => merged.insert(id, t),
                None => merged.remove(id),
            };
        }
        merged.into_values().cloned().collect()
    }
}
