#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use fleet_core::{CoreError, Orchestrator, OrchestratorConfig};
use fleet_model::{
    RestartPolicy, RuntimeSpec, Service, ServiceId, ServiceSpec, Task, TaskId, TaskSpec,
    TaskState, TaskStatus, Version,
};
use fleet_observe::{LoggerConfig, LoggerFormat, logger_init};
use fleet_store::{Event, EventKind, MemoryStore, ReadTx, Watch};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_logging() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = logger_init(&LoggerConfig {
            format: LoggerFormat::Text,
            level: "warn".into(),
            with_targets: true,
            use_color: false,
        });
    });
}

pub fn service(id: &str, replicas: u64, restart: RestartPolicy) -> Service {
    Service::new(
        id,
        ServiceSpec {
            name: "name1".into(),
            replicas,
            task: TaskSpec::new(RuntimeSpec::container("img"), restart),
        },
    )
    .with_spec_version(Version(1))
}

pub fn create_service(store: &MemoryStore, svc: Service) {
    store.update(|tx| tx.create_service(svc)).unwrap();
}

/// Re-saves a service after `f` modified it.
pub fn update_service(store: &MemoryStore, id: &str, f: impl FnOnce(&mut Service)) {
    store
        .update(|tx| {
            let mut svc = tx.get_service(&ServiceId::from(id)).unwrap();
            f(&mut svc);
            tx.update_service(svc)
        })
        .unwrap();
}

/// Sets the runtime status of a task, the way an agent would report it.
pub fn set_status(store: &MemoryStore, id: &TaskId, state: TaskState) -> Task {
    store
        .update(|tx| {
            let mut task = tx.get_task(id).unwrap();
            task.status = TaskStatus::new(state);
            tx.update_task(task.clone())?;
            Ok::<_, fleet_store::StoreError>(task)
        })
        .unwrap()
}

pub fn get_task(store: &MemoryStore, id: &TaskId) -> Task {
    store.view(|v| v.get_task(id)).unwrap()
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub token: CancellationToken,
    pub handle: JoinHandle<Result<(), CoreError>>,
}

impl Harness {
    pub fn start(store: Arc<MemoryStore>) -> Self {
        Self::start_with(store, OrchestratorConfig::default().with_jitter_seed(7))
    }

    pub fn start_with(store: Arc<MemoryStore>, config: OrchestratorConfig) -> Self {
        init_logging();
        let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&store), config));
        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let orchestrator = Arc::clone(&orchestrator);
            let token = token.clone();
            async move { orchestrator.run(token).await }
        });
        Self {
            store,
            orchestrator,
            token,
            handle,
        }
    }

    pub async fn shutdown(self) {
        self.orchestrator.stop().await;
        let res = tokio::time::timeout(WAIT, self.handle)
            .await
            .expect("orchestrator should stop")
            .expect("orchestrator task should not panic");
        assert_eq!(res, Ok(()));
    }
}

/// Watch over task events only.
pub fn task_watch(store: &MemoryStore) -> Watch {
    store
        .watch(&[EventKind::TaskCreate, EventKind::TaskUpdate, EventKind::TaskDelete])
        .unwrap()
}

pub async fn next_event(watch: &mut Watch) -> Event {
    tokio::time::timeout(WAIT, watch.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("watch failed")
}

/// Skips events until one matches `pred`.
pub async fn wait_event(watch: &mut Watch, mut pred: impl FnMut(&Event) -> bool) -> Event {
    loop {
        let ev = next_event(watch).await;
        if pred(&ev) {
            return ev;
        }
    }
}

pub async fn watch_task_create(watch: &mut Watch) -> Task {
    match wait_event(watch, |ev| matches!(ev, Event::TaskCreate(_))).await {
        Event::TaskCreate(t) => t,
        _ => unreachable!(),
    }
}

/// Next update of `id` that moved its desired state to `desired`.
pub async fn watch_desired(watch: &mut Watch, id: &TaskId, desired: TaskState) -> Task {
    let ev = wait_event(watch, |ev| {
        matches!(ev, Event::TaskUpdate(t) if &t.id == id && t.desired_state == desired)
    })
    .await;
    match ev {
        Event::TaskUpdate(t) => t,
        _ => unreachable!(),
    }
}

/// Next update of `id` carrying status `state`.
pub async fn watch_status(watch: &mut Watch, id: &TaskId, state: TaskState) -> Task {
    let ev = wait_event(watch, |ev| {
        matches!(ev, Event::TaskUpdate(t) if &t.id == id && t.status.state == state)
    })
    .await;
    match ev {
        Event::TaskUpdate(t) => t,
        _ => unreachable!(),
    }
}

pub async fn expect_no_event(watch: &mut Watch, quiet: Duration) {
    if let Ok(ev) = tokio::time::timeout(quiet, watch.recv()).await {
        panic!("got unexpected event: {ev:?}");
    }
}

/// Waits for `n` tasks to be created and started; returns them ordered by slot.
pub async fn settle(watch: &mut Watch, n: usize) -> Vec<Task> {
    let mut created = Vec::new();
    let mut started = Vec::new();
    while created.len() < n || started.len() < n {
        match next_event(watch).await {
            Event::TaskCreate(t) => {
                assert_eq!(t.status.state, TaskState::New);
                assert_eq!(t.desired_state, TaskState::Ready);
                created.push(t);
            }
            Event::TaskUpdate(t) if t.desired_state == TaskState::Running => started.push(t),
            _ => {}
        }
    }
    for t in &started {
        assert!(created.iter().any(|c| c.id == t.id), "started a task that was not created");
    }
    started.sort_by_key(|t| t.slot);
    started
}
