// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! File-backed SQLite persistence: state survives reopening the database.

use chrono::Utc;
use flowmaster_core::Lookup;
use flowmaster_core::model::{
    NewCommand, TaskDefinition, WorkflowDefinition, WorkflowInstance, WorkflowState,
};
use flowmaster_core::persistence::{Persistence, SqlitePersistence};

#[tokio::test]
async fn test_from_path_creates_directories_and_persists() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("nested").join("flowmaster.db");

    let definition = WorkflowDefinition::new(7, 1, "nightly")
        .task(TaskDefinition::normal(1, "extract", "shell"))
        .task(TaskDefinition::normal(2, "load", "sql"))
        .relation("extract", "load");

    let instance_id = {
        let persistence = SqlitePersistence::from_path(&db_path)
            .await
            .expect("open database");
        persistence
            .save_workflow_definition(&definition)
            .await
            .unwrap();

        let command_id = persistence
            .insert_command(&NewCommand::start(7, 1))
            .await
            .unwrap();
        let instance = WorkflowInstance::new(&definition, "10.0.0.1:5678", Utc::now());
        match persistence
            .consume_command(command_id, &instance)
            .await
            .unwrap()
        {
            Lookup::Found(id) => id,
            other => panic!("unexpected consume result: {:?}", other),
        }
    };

    assert!(db_path.exists());

    // Reopening runs migrations again; they must be idempotent.
    let persistence = SqlitePersistence::from_path(&db_path)
        .await
        .expect("reopen database");
    let loaded = persistence
        .find_workflow_definition(7, 1)
        .await
        .unwrap()
        .expect("definition persisted");
    assert_eq!(loaded, definition);

    let instance = persistence
        .find_workflow_instance(instance_id)
        .await
        .unwrap()
        .expect("instance persisted");
    assert_eq!(instance.state, WorkflowState::Submitted);
    assert_eq!(instance.host.as_deref(), Some("10.0.0.1:5678"));
    assert_eq!(
        persistence.list_unfinished_instance_hosts().await.unwrap(),
        vec!["10.0.0.1:5678".to_string()]
    );
}
