//! # Replicated-service orchestrator.
//!
//! One serial loop over the store's event stream. Events only record what needs attention;
//! the work happens on every `Commit` marker, one store transaction per step.
//!
//! ```text
//! run(ctx)
//!   ├─ stopped already → return
//!   ├─ watch(all)                       (before reading, so nothing is missed)
//!   ├─ full_pass → batch → tick
//!   └─ loop select! {
//!        stop / ctx cancelled → break
//!        Commit               → tick(batch)
//!        WatchLagged          → full_pass → tick   (events were lost, rescan the store)
//!        other event          → handle_event(batch)
//!      }
//!
//! tick: deleted services → restarts → reconciles → reaps
//! ```
//!
//! ## Rules
//! - Timers never block the loop; delayed starts live in the [`DelayedScheduler`].
//! - A step that keeps conflicting is dropped after `max_conflict_retries`; the next event
//!   for the same object retries it.
//! - Falling behind the event stream is recovered by rescanning the store; the loop's own
//!   writes can outrun it when a tick touches many records.
//! - Any other store error ends the loop and is returned from [`Orchestrator::run`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use fleet_model::{ServiceId, Task, TaskId, TaskState};
use fleet_store::{Event, MemoryStore, ReadTx, StoreError, Tx};

use crate::reconciler::{Applied, Reconciler};
use crate::restart::{Jitter, RestartSupervisor};
use crate::scheduler::DelayedScheduler;
use crate::{CoreError, OrchestratorConfig};

/// Work collected between two commit markers.
#[derive(Debug, Default)]
struct Batch {
    deleted: BTreeSet<ServiceId>,
    restart: BTreeSet<TaskId>,
    reconcile: BTreeSet<ServiceId>,
    reap: BTreeSet<TaskId>,
}

impl Batch {
    fn is_empty(&self) -> bool {
        self.deleted.is_empty()
            && self.restart.is_empty()
            && self.reconcile.is_empty()
            && self.reap.is_empty()
    }
}

/// Keeps replicated services at their replica count and restarts their terminated tasks.
pub struct Orchestrator {
    store: Arc<MemoryStore>,
    config: OrchestratorConfig,
    supervisor: Arc<RestartSupervisor>,
    reconciler: Reconciler,
    scheduler: Arc<DelayedScheduler>,
    token: CancellationToken,
    started: AtomicBool,
    done: watch::Sender<bool>,
}

impl Orchestrator {
    pub fn new(store: Arc<MemoryStore>, config: OrchestratorConfig) -> Self {
        let supervisor = RestartSupervisor::new(Jitter::from_seed(config.jitter_seed));
        let (done, _) = watch::channel(false);
        Self {
            scheduler: Arc::new(DelayedScheduler::new(Arc::clone(&store))),
            supervisor: Arc::new(supervisor),
            reconciler: Reconciler::new(config.task_history_limit),
            store,
            config,
            token: CancellationToken::new(),
            started: AtomicBool::new(false),
            done,
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn supervisor(&self) -> &Arc<RestartSupervisor> {
        &self.supervisor
    }

    pub fn scheduler(&self) -> &Arc<DelayedScheduler> {
        &self.scheduler
    }

    /// Runs until `ctx` is cancelled, [`stop`](Self::stop) is called, or a fatal store error.
    ///
    /// Outstanding delayed starts are cancelled before it returns. Can only be called once.
    pub async fn run(&self, ctx: CancellationToken) -> Result<(), CoreError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CoreError::AlreadyRunning);
        }

        let res = self.run_loop(&ctx).await;
        self.scheduler.shutdown().await;
        self.done.send_replace(true);

        match &res {
            Ok(()) => info!("orchestrator stopped"),
            Err(e) => error!(error = %e, label = e.as_label(), "orchestrator failed"),
        }
        res
    }

    /// Signals the loop to stop and waits until it and all delayed starts have quiesced.
    ///
    /// Idempotent; safe to call before or without [`run`](Self::run).
    pub async fn stop(&self) {
        self.token.cancel();
        if self.started.load(Ordering::SeqCst) {
            let mut done = self.done.subscribe();
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.scheduler.shutdown().await;
    }

    async fn run_loop(&self, ctx: &CancellationToken) -> Result<(), CoreError> {
        if self.token.is_cancelled() || ctx.is_cancelled() {
            debug!("stopped before start");
            return Ok(());
        }
        let mut events = self.store.watch(&[])?;

        let mut batch = Batch::default();
        self.full_pass(&mut batch);
        self.tick(&mut batch)?;
        info!("orchestrator started");

        loop {
            let ev = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Ok(()),
                _ = ctx.cancelled() => return Ok(()),
                ev = events.recv() => ev,
            };

            match ev {
                Ok(Event::Commit { .. }) => self.tick(&mut batch)?,
                Ok(ev) => self.handle_event(ev, &mut batch),
                Err(StoreError::WatchLagged(skipped)) => {
                    warn!(skipped, "event watch fell behind, rescanning store");
                    self.full_pass(&mut batch);
                    self.tick(&mut batch)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Queues everything the store currently needs and re-arms delayed starts that have no timer.
    ///
    /// Runs at startup and whenever events were lost; every step it queues is idempotent.
    #[instrument(level = "debug", skip_all)]
    fn full_pass(&self, batch: &mut Batch) {
        let (services, tasks) = self.store.view(|v| (v.services(), v.tasks()));
        let known: BTreeSet<&ServiceId> = services.iter().map(|s| &s.id).collect();

        batch
            .reconcile
            .extend(services.iter().map(|s| s.id.clone()));

        for task in &tasks {
            if !known.contains(&task.service_id) {
                batch.deleted.insert(task.service_id.clone());
                continue;
            }
            if task.desired_state == TaskState::Remove && task.status.state.is_terminal() {
                batch.reap.insert(task.id.clone());
            } else if task.desired_state <= TaskState::Running && task.status.state.is_terminal() {
                batch.restart.insert(task.id.clone());
            } else if task.desired_state <= TaskState::Ready && !self.scheduler.is_pending(&task.id)
            {
                self.resume_start(task, &tasks);
            } else if task.desired_state == TaskState::Running
                && task.status.state == TaskState::Running
            {
                self.supervisor.record_success(task);
            }
        }

        debug!(
            services = services.len(),
            tasks = tasks.len(),
            restarts = batch.restart.len(),
            "full pass"
        );
    }

    /// Re-arms the start of a task still waiting at `Ready` with what is left of its delay.
    ///
    /// The first task of a slot was never delayed and starts right away.
    fn resume_start(&self, task: &Task, tasks: &[Task]) {
        let siblings: Vec<&Task> = tasks
            .iter()
            .filter(|t| t.id != task.id && t.service_id == task.service_id && t.slot == task.slot)
            .collect();

        let wait = if siblings.is_empty() {
            Duration::ZERO
        } else {
            let elapsed = SystemTime::now()
                .duration_since(task.meta.created_at)
                .unwrap_or(Duration::ZERO);
            self.supervisor
                .realize(self.supervisor.task_restart_delay(task))
                .saturating_sub(elapsed)
        };

        let wait_stop = siblings
            .iter()
            .find(|t| !t.status.state.is_terminal() && t.status.state >= TaskState::Assigned)
            .map(|t| t.id.clone());

        debug!(task = %task.id, wait = ?wait, "resuming delayed start");
        self.scheduler.start_after(task.id.clone(), wait_stop, wait);
    }

    fn handle_event(&self, ev: Event, batch: &mut Batch) {
        match ev {
            Event::ServiceCreate(s) | Event::ServiceUpdate(s) => {
                batch.reconcile.insert(s.id);
            }
            Event::ServiceDelete(s) => {
                batch.deleted.insert(s.id);
            }
            Event::TaskCreate(t) | Event::TaskUpdate(t) => self.handle_task_change(&t, batch),
            Event::TaskDelete(t) => {
                self.scheduler.cancel(&t.id);
                // Deleting the last task of a slot frees it, even one that ran out of restarts.
                batch.reconcile.insert(t.service_id);
            }
            Event::Commit { .. } => {}
        }
    }

    fn handle_task_change(&self, task: &Task, batch: &mut Batch) {
        if task.desired_state == TaskState::Remove {
            if task.status.state.is_terminal() {
                batch.reap.insert(task.id.clone());
            }
            return;
        }
        if task.desired_state > TaskState::Running {
            return;
        }

        if task.status.state == TaskState::Running {
            self.supervisor.record_success(task);
        } else if task.status.state.is_terminal() {
            batch.restart.insert(task.id.clone());
        }
    }

    /// Applies the batch, one transaction per step.
    fn tick(&self, batch: &mut Batch) -> Result<(), CoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(batch);
        let mut reconcile = batch.reconcile;

        for id in &batch.deleted {
            reconcile.remove(id);
            if let Some(applied) =
                self.update_with_retry(|tx| self.reconciler.remove_service_tasks(tx, id))?
            {
                self.finish(applied);
            }
        }

        for id in &batch.restart {
            let now = Instant::now();
            let planned =
                self.update_with_retry(|tx| self.supervisor.handle_terminal_task(tx, id, now))?;
            if let Some(Some(p)) = planned {
                self.supervisor.confirm(&p, now);
                let wait = self.supervisor.realize(p.delay);
                self.scheduler
                    .start_after(p.replacement.id.clone(), p.wait_stop, wait);
                reconcile.insert(p.replacement.service_id);
            }
        }

        for id in &reconcile {
            if let Some(applied) =
                self.update_with_retry(|tx| self.reconciler.reconcile_service(tx, id))?
            {
                self.finish(applied);
            }
        }

        for id in &batch.reap {
            self.update_with_retry(|tx| self.reconciler.reap_task(tx, id))?;
        }
        Ok(())
    }

    /// Runs post-commit side effects of a reconciliation step.
    fn finish(&self, applied: Applied) {
        for key in &applied.resets {
            self.supervisor.reset_slot(key);
        }
        for id in &applied.forget {
            self.supervisor.forget_service(id);
        }
        for id in &applied.cancels {
            self.scheduler.cancel(id);
        }
        for (id, wait_stop) in applied.starts {
            self.scheduler.start_after(id, wait_stop, Duration::ZERO);
        }
    }

    /// Runs `f` in a transaction, re-running it on optimistic-concurrency conflicts.
    ///
    /// Returns `Ok(None)` if it still conflicts after `max_conflict_retries` re-runs.
    fn update_with_retry<T>(
        &self,
        mut f: impl FnMut(&mut Tx<'_>) -> Result<T, CoreError>,
    ) -> Result<Option<T>, CoreError> {
        let mut attempt = 0;
        loop {
            match self.store.update(|tx| f(tx)) {
                Ok(out) => return Ok(Some(out)),
                Err(e) if e.is_conflict() && attempt < self.config.max_conflict_retries => {
                    attempt += 1;
                    debug!(attempt, error = %e, "transaction conflict, retrying");
                }
                Err(e) if e.is_conflict() => {
                    warn!(error = %e, attempts = attempt + 1, "transaction kept conflicting, dropped");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_model::{RuntimeSpec, Service, ServiceSpec, TaskSpec};

    fn orchestrator(retries: u32) -> Orchestrator {
        let config = OrchestratorConfig::default()
            .with_max_conflict_retries(retries)
            .with_jitter_seed(1);
        Orchestrator::new(Arc::new(MemoryStore::default()), config)
    }

    fn conflict() -> CoreError {
        CoreError::Store(StoreError::SequenceConflict {
            id: "t1".into(),
            expected: 1,
            found: 2,
        })
    }

    #[test]
    fn conflicts_are_retried_until_success() {
        let o = orchestrator(3);
        let mut calls = 0;
        let out = o.update_with_retry(|_tx| {
            calls += 1;
            if calls <= 3 { Err(conflict()) } else { Ok(calls) }
        });
        assert_eq!(out, Ok(Some(4)));
        assert_eq!(calls, 4);
    }

    #[test]
    fn persistent_conflicts_are_dropped() {
        let o = orchestrator(2);
        let mut calls = 0;
        let out = o.update_with_retry(|_tx| {
            calls += 1;
            Err::<(), _>(conflict())
        });
        assert_eq!(out, Ok(None));
        assert_eq!(calls, 3);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let o = orchestrator(5);
        let mut calls = 0;
        let out = o.update_with_retry(|_tx| {
            calls += 1;
            Err::<(), _>(CoreError::Invariant("broken".into()))
        });
        assert_eq!(out, Err(CoreError::Invariant("broken".into())));
        assert_eq!(calls, 1);
    }

    #[test]
    fn stale_write_is_rerun_against_fresh_state() {
        let o = orchestrator(1);
        let svc = Service::new(
            "id1",
            ServiceSpec {
                name: "name1".into(),
                replicas: 1,
                task: TaskSpec::new(RuntimeSpec::container("img"), Default::default()),
            },
        );
        o.store().update(|tx| tx.create_service(svc)).unwrap();
        let stale = o.store().view(|v| v.get_service(&"id1".into())).unwrap();
        o.store()
            .update(|tx| {
                let mut fresh = tx.get_service(&"id1".into()).unwrap();
                fresh.spec.replicas = 2;
                tx.update_service(fresh)
            })
            .unwrap();

        let mut stale = Some(stale);
        let out = o.update_with_retry(|tx| {
            let mut svc = match stale.take() {
                Some(svc) => svc,
                None => tx.get_service(&"id1".into()).unwrap(),
            };
            svc.spec.name = "name2".into();
            tx.update_service(svc)?;
            Ok(())
        });
        assert_eq!(out, Ok(Some(())));

        let svc = o.store().view(|v| v.get_service(&"id1".into())).unwrap();
        assert_eq!(svc.spec.name, "name2");
        assert_eq!(svc.spec.replicas, 2);
    }

    #[tokio::test]
    async fn stop_before_run_writes_nothing() {
        let o = orchestrator(5);
        o.store()
            .update(|tx| {
                tx.create_service(Service::new(
                    "id1",
                    ServiceSpec {
                        name: "name1".into(),
                        replicas: 2,
                        task: TaskSpec::new(RuntimeSpec::container("img"), Default::default()),
                    },
                ))
            })
            .unwrap();
        let index = o.store().index();

        o.stop().await;
        assert_eq!(o.run(CancellationToken::new()).await, Ok(()));
        assert_eq!(o.store().index(), index);
        assert!(o.store().view(|v| v.tasks()).is_empty());
    }
}
