// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dead master and dead worker recovery.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{Cluster, FlakyPersistence, TestMaster, attempt_of, wait_until};
use flowmaster_core::model::{
    AcquireOutcome, ClaimState, CommandType, Lookup, TaskDefinition, TaskGroupClaim, TaskInstance,
    TaskState, WorkflowDefinition, WorkflowInstance, WorkflowState,
};
use flowmaster_core::persistence::Persistence;
use flowmaster_master::alert::AlertEvent;
use flowmaster_master::remoting::{MasterEvent, TaskReport, TaskReportKind};

const WAIT: Duration = Duration::from_secs(2);

fn two_step() -> WorkflowDefinition {
    WorkflowDefinition::new(1, 1, "two-step")
        .task(TaskDefinition::normal(1, "A", "shell"))
        .task(TaskDefinition::normal(2, "B", "shell"))
        .relation("A", "B")
}

/// An instance left behind by `host` with `A` running on `worker`.
async fn orphaned_instance(
    cluster: &Cluster,
    definition: &WorkflowDefinition,
    host: &str,
    worker: &str,
) -> (WorkflowInstance, i64) {
    let mut instance = cluster.new_instance(definition, host).await;
    instance.state = WorkflowState::Running;
    cluster
        .persistence
        .update_workflow_instance(&instance)
        .await
        .unwrap();

    let mut task = TaskInstance::new(instance.id, &definition.tasks[0], 0, Utc::now());
    task.state = TaskState::Running;
    task.host = Some(worker.to_string());
    task.start_time = Some(Utc::now());
    task.id = cluster.persistence.insert_task_instance(&task).await.unwrap();
    (instance, task.id)
}

fn claim_states(claims: &[TaskGroupClaim]) -> Vec<(i64, ClaimState)> {
    claims
        .iter()
        .map(|c| (c.task_instance_id, c.state))
        .collect()
}

#[tokio::test]
async fn test_dead_master_is_taken_over_exactly_once() {
    let cluster = Cluster::new().await;
    cluster.add_worker("w1").await;
    let definition = two_step();
    cluster.save(&definition).await;
    let (instance, running_task) = orphaned_instance(&cluster, &definition, "m0", "w1").await;

    let m1 = cluster.master("m1").await;
    let m2 = cluster.master("m2").await;
    let (r1, r2) = tokio::join!(m1.failover.failover_once(), m2.failover.failover_once());
    let (r1, r2) = (r1.unwrap(), r2.unwrap());
    assert_eq!(r1.instances_resubmitted + r2.instances_resubmitted, 1);

    let stored = cluster.instance(instance.id).await;
    let owner: &TestMaster = match stored.host.as_deref() {
        Some("m1") => &m1,
        Some("m2") => &m2,
        other => panic!("unexpected owner {:?}", other),
    };
    assert_eq!(stored.command_type, CommandType::RecoverFaultTolerance);
    assert!(stored.restart_time.is_some());
    assert!(owner.engine.is_running(instance.id));

    // The worker still running A now reports to the new owner.
    assert!(
        cluster
            .remoting
            .host_changes()
            .contains(&("w1".to_string(), running_task, owner.host.clone()))
    );

    // Nothing left to take over.
    let (again1, again2) = tokio::join!(m1.failover.failover_once(), m2.failover.failover_once());
    assert_eq!(
        again1.unwrap().instances_resubmitted + again2.unwrap().instances_resubmitted,
        0
    );

    // A finishes on its original attempt; only B is dispatched.
    owner.engine.report_task_event(TaskReport::new(
        instance.id,
        running_task,
        TaskReportKind::Success,
    ));
    cluster.remoting.wait_for_dispatches(1, WAIT).await.unwrap();
    cluster
        .remoting
        .complete(attempt_of(&cluster.remoting, "B"), true)
        .unwrap();

    let finished = cluster.wait_finished(instance.id).await;
    assert_eq!(finished.state, WorkflowState::Success);
    assert_eq!(cluster.remoting.dispatched().len(), 1);

    let alerts = owner.alerts.clone();
    assert!(
        wait_until(|| {
            alerts
                .events()
                .iter()
                .any(|e| matches!(e, AlertEvent::WorkflowFaultTolerance { from_host, .. } if from_host == "m0"))
        })
        .await
    );
}

#[tokio::test]
async fn test_task_on_dead_worker_is_rerun() {
    let cluster = Cluster::new().await;
    cluster.add_worker("w1").await;
    let m1 = cluster.master("m1").await;
    let definition = WorkflowDefinition::new(2, 1, "single")
        .task(TaskDefinition::normal(1, "A", "shell"));
    cluster.save(&definition).await;
    let instance = cluster.new_instance(&definition, "m1").await;

    m1.engine.submit(instance.clone()).await;
    let first = cluster.remoting.wait_for_dispatches(1, WAIT).await.unwrap();
    let orphan = first[0].request.task.id;
    assert_eq!(first[0].worker_host, "w1");

    cluster.remove_worker("w1").await;
    cluster.add_worker("w2").await;
    let report = m1.failover.failover_once().await.unwrap();
    assert_eq!(report.tasks_failed_over, 1);
    assert_eq!(report.workers, vec!["w1".to_string()]);
    assert_eq!(report.instances_resubmitted, 0);

    let both = cluster.remoting.wait_for_dispatches(2, WAIT).await.unwrap();
    assert_eq!(both[1].worker_host, "w2");
    assert_eq!(both[1].request.task.name, "A");
    assert_ne!(both[1].request.task.id, orphan);

    let retired = cluster
        .persistence
        .find_task_instance(orphan)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(retired.state, TaskState::NeedFaultTolerance);
    assert!(!retired.active);

    cluster
        .remoting
        .complete(both[1].request.task.id, true)
        .unwrap();
    let finished = cluster.wait_finished(instance.id).await;
    assert_eq!(finished.state, WorkflowState::Success);

    let remoting = cluster.remoting.clone();
    assert!(wait_until(|| remoting.kills().contains(&("w1".to_string(), orphan))).await);
}

#[tokio::test]
async fn test_restarted_master_recovers_its_previous_instances() {
    let cluster = Cluster::new().await;
    cluster.add_worker("w1").await;
    let definition = two_step();
    cluster.save(&definition).await;

    // Left behind by the previous incarnation of m1.
    let mut stale = WorkflowInstance::new(&definition, "m1", Utc::now() - chrono::Duration::minutes(5));
    stale.state = WorkflowState::Running;
    stale.id = cluster
        .persistence
        .insert_workflow_instance(&stale)
        .await
        .unwrap();

    let m1 = cluster.master("m1").await;
    // Started by the current incarnation; must be left alone.
    let current = cluster.new_instance(&definition, "m1").await;
    m1.engine.submit(current.clone()).await;
    cluster.remoting.wait_for_dispatches(1, WAIT).await.unwrap();

    let report = m1.failover.failover_once().await.unwrap();
    assert_eq!(report.instances_resubmitted, 1);
    assert!(m1.engine.is_running(stale.id));

    let dispatched = cluster.remoting.wait_for_dispatches(2, WAIT).await.unwrap();
    assert_eq!(dispatched[1].request.task.workflow_instance_id, stale.id);
    assert_eq!(dispatched[1].request.task.name, "A");

    let report = m1.failover.failover_once().await.unwrap();
    assert_eq!(report.instances_resubmitted, 0);
}

#[tokio::test]
async fn test_master_takeover_frees_task_group_slot() {
    let cluster = Cluster::new().await;
    cluster.add_worker("w1").await;
    let group = cluster.persistence.create_task_group("exclusive", 1).await.unwrap();
    let definition = WorkflowDefinition::new(3, 1, "grouped")
        .task(TaskDefinition::normal(1, "A", "shell").with_task_group(group));
    cluster.save(&definition).await;
    // Both the master and the worker running A are gone.
    let (instance, orphan) = orphaned_instance(&cluster, &definition, "m0", "w0").await;
    assert_eq!(
        cluster
            .persistence
            .acquire_task_group_slot(group, instance.id, orphan)
            .await
            .unwrap(),
        Lookup::Found(AcquireOutcome::Acquired)
    );

    let m1 = cluster.master("m1").await;
    let report = m1.failover.failover_once().await.unwrap();
    assert_eq!(report.instances_resubmitted, 1);

    let dispatched = cluster.remoting.wait_for_dispatches(1, WAIT).await.unwrap();
    let rerun = dispatched[0].request.task.id;
    assert_ne!(rerun, orphan);
    assert_eq!(dispatched[0].worker_host, "w1");

    let claims = cluster.persistence.list_task_group_claims(group).await.unwrap();
    assert_eq!(
        claim_states(&claims),
        vec![(orphan, ClaimState::Released), (rerun, ClaimState::Acquired)]
    );

    cluster.remoting.complete(rerun, true).unwrap();
    let finished = cluster.wait_finished(instance.id).await;
    assert_eq!(finished.state, WorkflowState::Success);
    let group_row = cluster.persistence.find_task_group(group).await.unwrap().unwrap();
    assert_eq!(group_row.use_size, 0);
}

#[tokio::test]
async fn test_resumed_instance_drops_stale_queued_claim() {
    let cluster = Cluster::new().await;
    cluster.add_worker("w1").await;
    let group = cluster.persistence.create_task_group("exclusive", 1).await.unwrap();
    let definition = WorkflowDefinition::new(4, 1, "waiting")
        .task(TaskDefinition::normal(1, "A", "shell").with_task_group(group));
    cluster.save(&definition).await;

    // Someone outside this workflow holds the only unit.
    let holder = 9_999;
    assert_eq!(
        cluster
            .persistence
            .acquire_task_group_slot(group, holder, holder)
            .await
            .unwrap(),
        Lookup::Found(AcquireOutcome::Acquired)
    );

    // The dead master left A queued on the group, never dispatched.
    let mut instance = cluster.new_instance(&definition, "m0").await;
    instance.state = WorkflowState::Running;
    cluster
        .persistence
        .update_workflow_instance(&instance)
        .await
        .unwrap();
    let mut stale = TaskInstance::new(instance.id, &definition.tasks[0], 0, Utc::now());
    stale.id = cluster.persistence.insert_task_instance(&stale).await.unwrap();
    assert_eq!(
        cluster
            .persistence
            .acquire_task_group_slot(group, instance.id, stale.id)
            .await
            .unwrap(),
        Lookup::Found(AcquireOutcome::Queued)
    );

    let m1 = cluster.master("m1").await;
    assert_eq!(m1.failover.failover_once().await.unwrap().instances_resubmitted, 1);

    let mut claims = Vec::new();
    for _ in 0..200 {
        claims = cluster.persistence.list_task_group_claims(group).await.unwrap();
        if claims.len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(claims.len(), 3, "new attempt never queued: {:?}", claims);
    let rerun = claims[2].task_instance_id;
    assert_ne!(rerun, stale.id);
    assert_eq!(
        claim_states(&claims),
        vec![
            (holder, ClaimState::Acquired),
            (stale.id, ClaimState::Released),
            (rerun, ClaimState::Queued),
        ]
    );

    // The freed unit goes to the live attempt, not the retired one.
    let promoted = cluster
        .persistence
        .release_task_group_slot(holder)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(promoted.task_instance_id, rerun);
    m1.engine.handle_master_event(MasterEvent::TaskGroupWakeup {
        workflow_instance_id: instance.id,
        task_instance_id: rerun,
    });

    let dispatched = cluster.remoting.wait_for_dispatches(1, WAIT).await.unwrap();
    assert_eq!(dispatched[0].request.task.id, rerun);
}

#[tokio::test]
async fn test_failed_takeover_is_retried_next_sweep() {
    let cluster = Cluster::new().await;
    cluster.add_worker("w1").await;
    let definition = two_step();
    cluster.save(&definition).await;
    let (instance, _) = orphaned_instance(&cluster, &definition, "m0", "w1").await;

    let flaky = Arc::new(FlakyPersistence::new(cluster.persistence.clone()));
    let m1 = cluster.master_over("m1", flaky.clone()).await;

    flaky.fail_task_listing(true);
    let report = m1.failover.failover_once().await.unwrap();
    assert_eq!(report.instances_resubmitted, 0);
    let stored = cluster.instance(instance.id).await;
    assert_eq!(stored.host.as_deref(), Some("m0"));
    assert!(stored.restart_time.is_none_or(|t| t <= stored.start_time));
    assert!(!m1.engine.is_running(instance.id));

    flaky.fail_task_listing(false);
    let report = m1.failover.failover_once().await.unwrap();
    assert_eq!(report.instances_resubmitted, 1);
    assert_eq!(cluster.instance(instance.id).await.host.as_deref(), Some("m1"));
    assert!(m1.engine.is_running(instance.id));
}

#[tokio::test]
async fn test_dead_worker_hands_group_slot_to_rerun() {
    let cluster = Cluster::new().await;
    cluster.add_worker("w1").await;
    let m1 = cluster.master("m1").await;
    let group = cluster.persistence.create_task_group("exclusive", 1).await.unwrap();
    let definition = WorkflowDefinition::new(5, 1, "grouped-single")
        .task(TaskDefinition::normal(1, "A", "shell").with_task_group(group));
    cluster.save(&definition).await;
    let instance = cluster.new_instance(&definition, "m1").await;

    m1.engine.submit(instance.clone()).await;
    let first = cluster.remoting.wait_for_dispatches(1, WAIT).await.unwrap();
    let orphan = first[0].request.task.id;

    cluster.remove_worker("w1").await;
    cluster.add_worker("w2").await;
    assert_eq!(m1.failover.failover_once().await.unwrap().tasks_failed_over, 1);

    let both = cluster.remoting.wait_for_dispatches(2, WAIT).await.unwrap();
    let rerun = both[1].request.task.id;
    assert_eq!(both[1].worker_host, "w2");
    let claims = cluster.persistence.list_task_group_claims(group).await.unwrap();
    assert_eq!(
        claim_states(&claims),
        vec![(orphan, ClaimState::Released), (rerun, ClaimState::Acquired)]
    );

    cluster.remoting.complete(rerun, true).unwrap();
    let finished = cluster.wait_finished(instance.id).await;
    assert_eq!(finished.state, WorkflowState::Success);
}
