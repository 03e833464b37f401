// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task group capacity, both on the limiter and through running workflows.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Cluster, attempt_of};
use flowmaster_core::model::{
    AcquireOutcome, ClaimState, Lookup, TaskDefinition, WorkflowDefinition, WorkflowState,
};
use flowmaster_core::persistence::Persistence;
use flowmaster_master::task_group::TaskGroupLimiter;
use futures::future::join_all;

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_capacity_is_never_exceeded_and_queue_is_fifo() {
    let cluster = Cluster::new().await;
    let group = cluster
        .persistence
        .create_task_group("warehouse-db", 2)
        .await
        .unwrap();
    let limiter = Arc::new(TaskGroupLimiter::new(cluster.persistence.clone()));

    let outcomes = join_all((1..=3).map(|task_instance_id| {
        let limiter = limiter.clone();
        async move { limiter.acquire(group, 1, task_instance_id).await.unwrap() }
    }))
    .await;
    let acquired = outcomes
        .iter()
        .filter(|o| matches!(o, Lookup::Found(AcquireOutcome::Acquired)))
        .count();
    let queued = outcomes
        .iter()
        .filter(|o| matches!(o, Lookup::Found(AcquireOutcome::Queued)))
        .count();
    assert_eq!((acquired, queued), (2, 1));

    // A later claimant queues behind the first waiter.
    assert!(matches!(
        limiter.acquire(group, 2, 4).await.unwrap(),
        Lookup::Found(AcquireOutcome::Queued)
    ));

    let claims = cluster
        .persistence
        .list_task_group_claims(group)
        .await
        .unwrap();
    let holder = claims
        .iter()
        .find(|c| c.state == ClaimState::Acquired)
        .unwrap()
        .task_instance_id;
    let oldest_waiter = claims
        .iter()
        .find(|c| c.state == ClaimState::Queued)
        .unwrap()
        .task_instance_id;

    let promoted = limiter.release(holder).await.unwrap().unwrap();
    assert_eq!(promoted.task_instance_id, oldest_waiter);
    assert_eq!(promoted.state, ClaimState::Acquired);

    let group_row = cluster
        .persistence
        .find_task_group(group)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(group_row.use_size, 2);
}

#[tokio::test]
async fn test_group_gates_dispatch_within_one_workflow() {
    let cluster = Cluster::new().await;
    cluster.add_worker("w1").await;
    let m1 = cluster.master("m1").await;
    let group = cluster.persistence.create_task_group("single", 1).await.unwrap();
    let definition = WorkflowDefinition::new(1, 1, "gated")
        .task(TaskDefinition::normal(1, "A", "shell").with_task_group(group))
        .task(TaskDefinition::normal(2, "B", "shell").with_task_group(group));
    cluster.save(&definition).await;
    let instance = cluster.new_instance(&definition, "m1").await;

    m1.engine.submit(instance.clone()).await;
    let first = cluster.remoting.wait_for_dispatches(1, WAIT).await.unwrap();
    assert!(
        cluster
            .remoting
            .wait_for_dispatches(2, Duration::from_millis(200))
            .await
            .is_none(),
        "second task dispatched while the group was full"
    );

    cluster
        .remoting
        .complete(first[0].request.task.id, true)
        .unwrap();
    let both = cluster.remoting.wait_for_dispatches(2, WAIT).await.unwrap();
    assert_ne!(both[0].request.task.name, both[1].request.task.name);
    cluster
        .remoting
        .complete(both[1].request.task.id, true)
        .unwrap();

    let finished = cluster.wait_finished(instance.id).await;
    assert_eq!(finished.state, WorkflowState::Success);
}

#[tokio::test]
async fn test_wakeup_reaches_workflow_on_another_master() {
    let cluster = Cluster::new().await;
    cluster.add_worker("w1").await;
    let m1 = cluster.master("m1").await;
    let m2 = cluster.master("m2").await;
    let group = cluster.persistence.create_task_group("shared", 1).await.unwrap();

    let first_def = WorkflowDefinition::new(1, 1, "first")
        .task(TaskDefinition::normal(1, "first_task", "shell").with_task_group(group));
    let second_def = WorkflowDefinition::new(2, 1, "second")
        .task(TaskDefinition::normal(1, "second_task", "shell").with_task_group(group));
    cluster.save(&first_def).await;
    cluster.save(&second_def).await;
    let first = cluster.new_instance(&first_def, "m1").await;
    let second = cluster.new_instance(&second_def, "m2").await;

    m1.engine.submit(first.clone()).await;
    cluster.remoting.wait_for_dispatches(1, WAIT).await.unwrap();
    m2.engine.submit(second.clone()).await;
    assert!(
        cluster
            .remoting
            .wait_for_dispatches(2, Duration::from_millis(200))
            .await
            .is_none()
    );

    cluster
        .remoting
        .complete(attempt_of(&cluster.remoting, "first_task"), true)
        .unwrap();
    cluster.remoting.wait_for_dispatches(2, WAIT).await.unwrap();
    let dispatched = cluster.remoting.dispatched();
    assert_eq!(dispatched[1].request.task.name, "second_task");
    assert_eq!(dispatched[1].request.master_host, "m2");

    cluster
        .remoting
        .complete(attempt_of(&cluster.remoting, "second_task"), true)
        .unwrap();
    assert_eq!(
        cluster.wait_finished(first.id).await.state,
        WorkflowState::Success
    );
    assert_eq!(
        cluster.wait_finished(second.id).await.state,
        WorkflowState::Success
    );
}
