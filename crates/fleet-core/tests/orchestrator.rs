mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use fleet_core::{CoreError, Orchestrator, OrchestratorConfig};
use fleet_model::{RestartPolicy, ServiceId, Task, TaskState, TaskStatus};
use fleet_store::{Event, MemoryStore, ReadTx};

use common::*;

const MS: Duration = Duration::from_millis(1);

fn quick() -> RestartPolicy {
    RestartPolicy::default().with_delay(Duration::ZERO)
}

#[tokio::test]
async fn initial_pass_creates_replicas() {
    let store = Arc::new(MemoryStore::default());
    let mut watch = task_watch(&store);
    create_service(&store, service("id1", 2, quick()));
    let h = Harness::start(Arc::clone(&store));

    let tasks = settle(&mut watch, 2).await;
    assert_eq!(tasks.iter().map(|t| t.slot).collect::<Vec<_>>(), vec![1, 2]);
    assert!(tasks.iter().all(|t| t.service_id == ServiceId::from("id1")));
    expect_no_event(&mut watch, 100 * MS).await;

    h.shutdown().await;
}

#[tokio::test]
async fn scaling_up_and_down() {
    let store = Arc::new(MemoryStore::default());
    let mut watch = task_watch(&store);
    create_service(&store, service("id1", 2, quick()));
    let h = Harness::start(Arc::clone(&store));

    let tasks = settle(&mut watch, 2).await;
    set_status(&store, &tasks[1].id, TaskState::Running);
    watch_status(&mut watch, &tasks[1].id, TaskState::Running).await;

    update_service(&store, "id1", |svc| svc.spec.replicas = 3);
    let added = settle(&mut watch, 1).await.remove(0);
    assert_eq!(added.slot, 3);

    // Slot 3 never ran and is deleted; slot 2 runs and is marked for removal.
    update_service(&store, "id1", |svc| svc.spec.replicas = 1);
    watch_desired(&mut watch, &tasks[1].id, TaskState::Remove).await;
    wait_event(&mut watch, |ev| matches!(ev, Event::TaskDelete(t) if t.id == added.id)).await;

    // Once the agent reports it stopped, it is reaped.
    set_status(&store, &tasks[1].id, TaskState::Shutdown);
    wait_event(&mut watch, |ev| matches!(ev, Event::TaskDelete(t) if t.id == tasks[1].id)).await;

    let left = store.view(|v| v.tasks());
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, tasks[0].id);
    expect_no_event(&mut watch, 100 * MS).await;

    h.shutdown().await;
}

#[tokio::test]
async fn deleting_a_task_refills_its_slot() {
    let store = Arc::new(MemoryStore::default());
    let mut watch = task_watch(&store);
    create_service(&store, service("id1", 1, quick()));
    let h = Harness::start(Arc::clone(&store));

    let task = settle(&mut watch, 1).await.remove(0);
    store.update(|tx| tx.delete_task(&task.id)).unwrap();

    let refill = settle(&mut watch, 1).await.remove(0);
    assert_eq!(refill.slot, task.slot);
    assert_ne!(refill.id, task.id);

    h.shutdown().await;
}

#[tokio::test]
async fn exhausted_slot_is_refilled_after_manual_removal() {
    let store = Arc::new(MemoryStore::default());
    let mut watch = task_watch(&store);
    create_service(&store, service("id1", 1, quick().with_max_attempts(1)));
    let h = Harness::start(Arc::clone(&store));

    let first = settle(&mut watch, 1).await.remove(0);
    set_status(&store, &first.id, TaskState::Failed);
    let second = watch_task_create(&mut watch).await;
    watch_desired(&mut watch, &second.id, TaskState::Running).await;

    // Attempts are used up: the slot stays down.
    set_status(&store, &second.id, TaskState::Failed);
    watch_desired(&mut watch, &second.id, TaskState::Shutdown).await;
    expect_no_event(&mut watch, 100 * MS).await;

    store
        .update(|tx| {
            tx.delete_task(&first.id)?;
            tx.delete_task(&second.id)
        })
        .unwrap();
    let refill = settle(&mut watch, 1).await.remove(0);
    assert_eq!(refill.slot, first.slot);

    // The refilled slot starts with a clean restart history.
    set_status(&store, &refill.id, TaskState::Failed);
    watch_desired(&mut watch, &refill.id, TaskState::Shutdown).await;
    let restarted = watch_task_create(&mut watch).await;
    assert_eq!(restarted.slot, first.slot);

    h.shutdown().await;
}

#[tokio::test]
async fn template_changes_during_restart_delay_leave_no_stray_tasks() {
    let store = Arc::new(MemoryStore::default());
    let mut watch = task_watch(&store);
    create_service(
        &store,
        service("id1", 1, RestartPolicy::default().with_delay(Duration::from_secs(60))),
    );
    let h = Harness::start(Arc::clone(&store));

    let first = settle(&mut watch, 1).await.remove(0);
    set_status(&store, &first.id, TaskState::Failed);
    let mut waiting = watch_task_create(&mut watch).await;

    for _ in 0..3 {
        update_service(&store, "id1", |svc| svc.spec.task.force_update += 1);
        wait_event(&mut watch, |ev| matches!(ev, Event::TaskDelete(t) if t.id == waiting.id))
            .await;
        waiting = watch_task_create(&mut watch).await;
    }
    watch_desired(&mut watch, &waiting.id, TaskState::Running).await;

    let tasks = store.view(|v| v.tasks());
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().any(|t| t.id == first.id));
    assert!(tasks.iter().any(|t| t.id == waiting.id));

    h.shutdown().await;
}

#[tokio::test]
async fn large_startup_state_converges() {
    const SERVICES: usize = 400;

    let store = Arc::new(MemoryStore::default());
    for i in 0..SERVICES {
        create_service(&store, service(&format!("svc-{i}"), 2, quick()));
    }
    let h = Harness::start(Arc::clone(&store));

    tokio::time::timeout(WAIT, async {
        loop {
            let started = store.view(|v| {
                v.tasks()
                    .iter()
                    .filter(|t| t.desired_state == TaskState::Running)
                    .count()
            });
            if started == SERVICES * 2 {
                break;
            }
            assert!(!h.handle.is_finished(), "orchestrator exited early");
            tokio::time::sleep(10 * MS).await;
        }
    })
    .await
    .expect("every task should be created and started");
    assert_eq!(store.view(|v| v.tasks().len()), SERVICES * 2);

    h.shutdown().await;
}

#[tokio::test]
async fn deleting_a_service_takes_its_tasks_down() {
    let store = Arc::new(MemoryStore::default());
    let mut watch = task_watch(&store);
    create_service(&store, service("id1", 2, quick()));
    let h = Harness::start(Arc::clone(&store));

    let tasks = settle(&mut watch, 2).await;
    set_status(&store, &tasks[0].id, TaskState::Running);
    watch_status(&mut watch, &tasks[0].id, TaskState::Running).await;

    store
        .update(|tx| tx.delete_service(&ServiceId::from("id1")))
        .unwrap();

    let (mut marked, mut deleted) = (false, false);
    while !marked || !deleted {
        match next_event(&mut watch).await {
            Event::TaskUpdate(t) if t.id == tasks[0].id => {
                marked = t.desired_state == TaskState::Remove;
            }
            Event::TaskDelete(t) if t.id == tasks[1].id => deleted = true,
            ev => panic!("unexpected event: {ev:?}"),
        }
    }

    // A failure report of a task being removed is not restarted.
    set_status(&store, &tasks[0].id, TaskState::Failed);
    wait_event(&mut watch, |ev| matches!(ev, Event::TaskDelete(t) if t.id == tasks[0].id)).await;

    assert!(store.view(|v| v.tasks()).is_empty());
    expect_no_event(&mut watch, 100 * MS).await;

    h.shutdown().await;
}

#[tokio::test]
async fn forced_recreation_waits_for_running_task() {
    let store = Arc::new(MemoryStore::default());
    let mut watch = task_watch(&store);
    create_service(&store, service("id1", 1, quick()));
    let h = Harness::start(Arc::clone(&store));

    let old = settle(&mut watch, 1).await.remove(0);
    set_status(&store, &old.id, TaskState::Running);
    watch_status(&mut watch, &old.id, TaskState::Running).await;

    update_service(&store, "id1", |svc| svc.spec.task.force_update += 1);
    watch_desired(&mut watch, &old.id, TaskState::Shutdown).await;
    let new = watch_task_create(&mut watch).await;
    assert_eq!(new.slot, old.slot);

    // Still waiting on the old task.
    expect_no_event(&mut watch, 100 * MS).await;
    assert_eq!(get_task(&store, &new.id).desired_state, TaskState::Ready);

    set_status(&store, &old.id, TaskState::Shutdown);
    watch_desired(&mut watch, &new.id, TaskState::Running).await;

    h.shutdown().await;
}

#[tokio::test]
async fn startup_handles_existing_state() {
    let store = Arc::new(MemoryStore::default());
    let svc = service("id1", 2, quick());
    create_service(&store, svc.clone());

    // A failure that happened while no orchestrator was running.
    let mut failed = Task::new_for_slot(&svc, 1);
    failed.desired_state = TaskState::Running;
    failed.status = TaskStatus::new(TaskState::Failed);
    // A replacement whose delayed start was interrupted.
    let waiting = Task::new_for_slot(&svc, 2);
    // A task of a service that no longer exists.
    let orphan = Task::new_for_slot(&service("gone", 1, quick()), 1);
    store
        .update(|tx| {
            tx.create_task(failed.clone())?;
            tx.create_task(waiting.clone())?;
            tx.create_task(orphan.clone())
        })
        .unwrap();

    let mut watch = task_watch(&store);
    let h = Harness::start(Arc::clone(&store));

    let mut restarted = None;
    let mut started = false;
    let mut orphan_gone = false;
    while restarted.is_none() || !started || !orphan_gone {
        match next_event(&mut watch).await {
            Event::TaskCreate(t) => {
                assert_eq!(t.slot, 1);
                restarted = Some(t);
            }
            Event::TaskUpdate(t) if t.id == waiting.id && t.desired_state == TaskState::Running => {
                started = true;
            }
            Event::TaskDelete(t) if t.id == orphan.id => orphan_gone = true,
            _ => {}
        }
    }
    assert_eq!(get_task(&store, &failed.id).desired_state, TaskState::Shutdown);

    h.shutdown().await;
}

#[tokio::test]
async fn stop_cancels_pending_starts() {
    let store = Arc::new(MemoryStore::default());
    let mut watch = task_watch(&store);
    create_service(
        &store,
        service("id1", 1, RestartPolicy::default().with_delay(Duration::from_secs(30))),
    );
    let h = Harness::start(Arc::clone(&store));

    let task = settle(&mut watch, 1).await.remove(0);
    set_status(&store, &task.id, TaskState::Failed);
    let replacement = watch_task_create(&mut watch).await;
    assert!(h.orchestrator.scheduler().is_pending(&replacement.id));

    let orchestrator = Arc::clone(&h.orchestrator);
    h.shutdown().await;
    assert!(orchestrator.scheduler().is_empty());
    assert_eq!(get_task(&store, &replacement.id).desired_state, TaskState::Ready);

    // Idempotent.
    orchestrator.stop().await;
}

#[tokio::test]
async fn run_twice_is_rejected() {
    let store = Arc::new(MemoryStore::default());
    let h = Harness::start(Arc::clone(&store));
    tokio::task::yield_now().await;

    let err = h.orchestrator.run(CancellationToken::new()).await;
    assert_eq!(err, Err(CoreError::AlreadyRunning));

    h.shutdown().await;
}

#[tokio::test]
async fn context_cancellation_ends_run() {
    let store = Arc::new(MemoryStore::default());
    let h = Harness::start(Arc::clone(&store));

    h.token.cancel();
    let res = tokio::time::timeout(WAIT, h.handle)
        .await
        .expect("run should return after cancellation")
        .expect("orchestrator task should not panic");
    assert_eq!(res, Ok(()));
}

#[tokio::test]
async fn closed_store_is_fatal() {
    let store = Arc::new(MemoryStore::default());
    let orchestrator = Orchestrator::new(Arc::clone(&store), OrchestratorConfig::default());
    store.close();

    let err = orchestrator.run(CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.as_label(), "store_closed");
}
